//! Range assignment
//!
//! Per topic: members sorted by id, partitions 0..P split into contiguous
//! ranges of P / M, the first P % M members taking one extra.
//!
//! 7 partitions, 3 members: [0, 1, 2], [3, 4], [5, 6]

use super::{AssignmentInput, AssignmentOutput, AssignmentStrategy};

#[derive(Debug, Clone, Default)]
pub struct RangeStrategy;

impl RangeStrategy {
    pub fn new() -> Self {
        Self
    }
}

impl AssignmentStrategy for RangeStrategy {
    fn name(&self) -> &'static str {
        "range"
    }

    fn assign(&self, input: &AssignmentInput) -> AssignmentOutput {
        let mut output = input.empty_output();

        for (topic, &count) in &input.topic_partitions {
            let members = input.members_for_topic(topic);
            if members.is_empty() || count <= 0 {
                continue;
            }
            let per_member = count / members.len() as i32;
            let extra = count % members.len() as i32;

            let mut next = 0;
            for (i, member) in members.iter().enumerate() {
                let len = per_member + i32::from((i as i32) < extra);
                if let Some(assignment) = output.get_mut(*member) {
                    for partition in next..next + len {
                        assignment.add(topic, partition);
                    }
                }
                next += len;
            }
        }
        output
    }
}
