//! Assignment strategies
//!
//! The group leader runs one of these over every member's subscription and
//! the partition counts of the subscribed topics. Inputs are ordered maps so
//! the output depends only on the set of members and partitions, never on
//! the order the coordinator listed them in.
//!
//! - `range` (default): per topic, contiguous partition ranges
//! - `roundrobin`: all partitions dealt out across members in turn

pub mod range;
pub mod roundrobin;

use std::collections::{BTreeMap, HashMap};

use super::consumer_protocol::{MemberAssignment, MemberSubscription};

pub use range::RangeStrategy;
pub use roundrobin::RoundRobinStrategy;

/// Everything a strategy sees
#[derive(Debug, Clone, Default)]
pub struct AssignmentInput {
    /// member id -> subscription
    pub subscriptions: BTreeMap<String, MemberSubscription>,
    /// topic -> partition count
    pub topic_partitions: BTreeMap<String, i32>,
}

impl AssignmentInput {
    pub fn new(
        subscriptions: BTreeMap<String, MemberSubscription>,
        topic_partitions: BTreeMap<String, i32>,
    ) -> Self {
        Self {
            subscriptions,
            topic_partitions,
        }
    }

    /// Sorted, deduplicated union of subscribed topics
    pub fn subscribed_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .subscriptions
            .values()
            .flat_map(|s| s.topics.iter().cloned())
            .collect();
        topics.sort();
        topics.dedup();
        topics
    }

    /// Members subscribed to `topic`, in member id order
    pub fn members_for_topic(&self, topic: &str) -> Vec<&str> {
        self.subscriptions
            .iter()
            .filter(|(_, s)| s.topics.iter().any(|t| t == topic))
            .map(|(id, _)| id.as_str())
            .collect()
    }

    fn empty_output(&self) -> AssignmentOutput {
        self.subscriptions
            .keys()
            .map(|id| (id.clone(), MemberAssignment::new()))
            .collect()
    }
}

/// member id -> assignment; every member of the input has an entry
pub type AssignmentOutput = BTreeMap<String, MemberAssignment>;

pub trait AssignmentStrategy: Send + Sync {
    /// Protocol name advertised in JoinGroup
    fn name(&self) -> &'static str;

    fn assign(&self, input: &AssignmentInput) -> AssignmentOutput;
}

/// Strategy by protocol name (case-insensitive)
pub fn create_strategy(name: &str) -> Option<Box<dyn AssignmentStrategy>> {
    match name.to_lowercase().as_str() {
        "range" => Some(Box::new(RangeStrategy::new())),
        "roundrobin" => Some(Box::new(RoundRobinStrategy::new())),
        _ => None,
    }
}

/// Protocol every member supports, the way a coordinator picks it: each
/// member votes for its most preferred candidate, most votes wins, ties go
/// to the earlier preference of the first member.
///
/// `member_protocols` holds each member's protocol names in preference order.
pub fn select_common_strategy(member_protocols: &[Vec<String>]) -> Option<String> {
    let first = member_protocols.first()?;
    let candidates: Vec<&String> = first
        .iter()
        .filter(|name| member_protocols.iter().all(|m| m.contains(name)))
        .collect();
    if candidates.is_empty() {
        return None;
    }

    let mut votes: HashMap<&String, usize> = HashMap::new();
    for protocols in member_protocols {
        if let Some(choice) = protocols.iter().find(|p| candidates.contains(p)) {
            *votes.entry(choice).or_default() += 1;
        }
    }
    let best = candidates
        .iter()
        .map(|c| votes.get(c).copied().unwrap_or(0))
        .max()
        .unwrap_or(0);
    candidates
        .into_iter()
        .find(|c| votes.get(c).copied().unwrap_or(0) == best)
        .cloned()
}

#[cfg(test)]
pub(crate) fn make_input(members: &[(&str, &[&str])], topics: &[(&str, i32)]) -> AssignmentInput {
    AssignmentInput::new(
        members
            .iter()
            .map(|(id, subscribed)| {
                (
                    id.to_string(),
                    MemberSubscription::new(subscribed.iter().map(|t| t.to_string()).collect()),
                )
            })
            .collect(),
        topics.iter().map(|(t, n)| (t.to_string(), *n)).collect(),
    )
}
