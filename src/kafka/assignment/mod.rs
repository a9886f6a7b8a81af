//! Consumer group partition assignment
//!
//! - [`consumer_protocol`]: subscription / assignment payloads carried inside
//!   JoinGroup and SyncGroup
//! - [`strategies`]: the leader-side algorithms (range, roundrobin)
//! - [`assigner`]: group membership (join, sync, heartbeat, leave) and the
//!   assignment snapshot / rebalance event outputs

pub mod assigner;
pub mod consumer_protocol;
pub mod strategies;


pub use assigner::{AssignmentSnapshot, GroupSettings, PartitionAssigner, RebalanceEvent};
pub use consumer_protocol::{MemberAssignment, MemberSubscription};
pub use strategies::{
    create_strategy, select_common_strategy, AssignmentInput, AssignmentOutput, AssignmentStrategy,
};
