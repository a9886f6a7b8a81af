//! Round-robin assignment
//!
//! Every (topic, partition) of the subscribed topics, sorted, is dealt to
//! the members in id order. One cursor runs across all topics; members not
//! subscribed to a partition's topic are skipped.
//!
//! Topics a (3) and b (2), two members: m-1 gets a-0, a-2, b-1; m-2 gets
//! a-1, b-0

use super::{AssignmentInput, AssignmentOutput, AssignmentStrategy};

#[derive(Debug, Clone, Default)]
pub struct RoundRobinStrategy;

impl RoundRobinStrategy {
    pub fn new() -> Self {
        Self
    }
}

impl AssignmentStrategy for RoundRobinStrategy {
    fn name(&self) -> &'static str {
        "roundrobin"
    }

    fn assign(&self, input: &AssignmentInput) -> AssignmentOutput {
        let mut output = input.empty_output();
        let members: Vec<&String> = input.subscriptions.keys().collect();
        if members.is_empty() {
            return output;
        }

        let mut cursor = 0usize;
        for topic in input.subscribed_topics() {
            let count = input.topic_partitions.get(&topic).copied().unwrap_or(0);
            for partition in 0..count.max(0) {
                // next member (from the cursor) subscribed to this topic
                let pick = (0..members.len())
                    .map(|step| (cursor + step) % members.len())
                    .find(|&i| {
                        input.subscriptions[members[i]]
                            .topics
                            .iter()
                            .any(|t| *t == topic)
                    });
                let Some(i) = pick else { break };
                if let Some(assignment) = output.get_mut(members[i]) {
                    assignment.add(&topic, partition);
                }
                cursor = i + 1;
            }
        }
        output
    }
}
