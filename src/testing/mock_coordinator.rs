//! In-memory group coordinator for the MockBroker
//!
//! Implements the classic rebalance protocol closely enough to exercise the
//! client:
//! - a member joining without an id gets MEMBER_ID_REQUIRED and a fresh id
//! - a join (or a leave, or a session expiry) moves the group to
//!   PreparingRebalance; JoinGroup requests park until every known member has
//!   rejoined or the rebalance timeout passes, then all are answered at once
//! - followers' SyncGroup requests park until the leader syncs
//! - a member rejoining a formed generation with unchanged protocols gets
//!   that generation back
//! - heartbeats during a rebalance answer REBALANCE_IN_PROGRESS
//! - offsets are stored per (group, topic, partition)

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};

use bytes::Bytes;
use kafka_protocol::messages::join_group_response::JoinGroupResponseMember;
use kafka_protocol::messages::offset_commit_response::{
    OffsetCommitResponsePartition, OffsetCommitResponseTopic,
};
use kafka_protocol::messages::offset_fetch_response::{
    OffsetFetchResponsePartition, OffsetFetchResponseTopic,
};
use kafka_protocol::messages::{
    HeartbeatRequest, HeartbeatResponse, JoinGroupRequest, JoinGroupResponse, LeaveGroupRequest,
    LeaveGroupResponse, OffsetCommitRequest, OffsetCommitResponse, OffsetFetchRequest,
    OffsetFetchResponse, SyncGroupRequest, SyncGroupResponse,
};
use kafka_protocol::protocol::StrBytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

use crate::kafka::assignment::select_common_strategy;
use crate::kafka::constants::*;

/// An answer now, or one that arrives when the group moves on
pub enum Reply<T> {
    Now(T),
    Later(oneshot::Receiver<T>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Empty,
    PreparingRebalance { deadline: Instant },
    CompletingRebalance,
    Stable,
}

struct Member {
    protocols: Vec<(String, Bytes)>,
    session_timeout: Duration,
    rebalance_timeout: Duration,
    last_seen: Instant,
    join_waiter: Option<oneshot::Sender<JoinGroupResponse>>,
    sync_waiter: Option<oneshot::Sender<SyncGroupResponse>>,
    assignment: Bytes,
}

struct Group {
    phase: Phase,
    generation: i32,
    members: BTreeMap<String, Member>,
    leader: Option<String>,
    protocol: Option<String>,
    /// Ids handed out with MEMBER_ID_REQUIRED, not yet joined
    pending_ids: HashSet<String>,
}

impl Default for Group {
    fn default() -> Self {
        Self {
            phase: Phase::Empty,
            generation: 0,
            members: BTreeMap::new(),
            leader: None,
            protocol: None,
            pending_ids: HashSet::new(),
        }
    }
}

impl Group {
    fn start_rebalance(&mut self, now: Instant) {
        if matches!(self.phase, Phase::PreparingRebalance { .. }) {
            return;
        }
        let timeout = self
            .members
            .values()
            .map(|m| m.rebalance_timeout)
            .max()
            .unwrap_or(Duration::ZERO);
        self.phase = Phase::PreparingRebalance {
            deadline: now + timeout,
        };
        for member in self.members.values_mut() {
            if let Some(waiter) = member.sync_waiter.take() {
                let _ = waiter.send(sync_error(ERROR_REBALANCE_IN_PROGRESS));
            }
        }
        debug!("Group rebalancing (generation {})", self.generation);
    }

    /// Finish the join phase once everyone rejoined or the deadline passed
    fn try_complete_join(&mut self, now: Instant) {
        let Phase::PreparingRebalance { deadline } = self.phase else {
            return;
        };
        let all_joined = self.members.values().all(|m| m.join_waiter.is_some());
        if !all_joined && now < deadline {
            return;
        }
        self.members.retain(|_, m| m.join_waiter.is_some());
        if self.members.is_empty() {
            self.phase = Phase::Empty;
            self.leader = None;
            return;
        }

        let votes: Vec<Vec<String>> = self
            .members
            .values()
            .map(|m| m.protocols.iter().map(|(name, _)| name.clone()).collect())
            .collect();
        let Some(protocol) = select_common_strategy(&votes) else {
            for (_, mut member) in std::mem::take(&mut self.members) {
                if let Some(waiter) = member.join_waiter.take() {
                    let _ = waiter.send(join_error(ERROR_INCONSISTENT_GROUP_PROTOCOL, ""));
                }
            }
            self.phase = Phase::Empty;
            return;
        };

        self.generation += 1;
        if !self.leader.as_ref().is_some_and(|l| self.members.contains_key(l)) {
            self.leader = self.members.keys().next().cloned();
        }
        self.protocol = Some(protocol);

        let ids: Vec<String> = self.members.keys().cloned().collect();
        for id in ids {
            let response = self.join_response(&id);
            let Some(member) = self.members.get_mut(&id) else {
                continue;
            };
            member.last_seen = now;
            member.assignment = Bytes::new();
            if let Some(waiter) = member.join_waiter.take() {
                let _ = waiter.send(response);
            }
        }
        self.phase = Phase::CompletingRebalance;
        debug!(
            "Group generation {} formed with {} member(s), leader {:?}",
            self.generation,
            self.members.len(),
            self.leader
        );
    }

    /// The current generation as a JoinGroup answer; the leader also gets
    /// the member roster
    fn join_response(&self, member_id: &str) -> JoinGroupResponse {
        let protocol = self.protocol.clone().unwrap_or_default();
        let leader = self.leader.clone().unwrap_or_default();
        let mut response = JoinGroupResponse::default();
        response.generation_id = self.generation;
        response.protocol_name = Some(StrBytes::from_string(protocol.clone()));
        response.leader = StrBytes::from_string(leader.clone());
        response.member_id = StrBytes::from_string(member_id.to_string());
        if member_id == leader {
            response.members = self
                .members
                .iter()
                .map(|(id, m)| {
                    let mut entry = JoinGroupResponseMember::default();
                    entry.member_id = StrBytes::from_string(id.clone());
                    entry.metadata = m
                        .protocols
                        .iter()
                        .find(|(name, _)| *name == protocol)
                        .map(|(_, meta)| meta.clone())
                        .unwrap_or_default();
                    entry
                })
                .collect();
        }
        response
    }

    /// Drop members whose session lapsed; members parked in a join are live
    fn expire_sessions(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .members
            .iter()
            .filter(|(_, m)| m.join_waiter.is_none() && now.duration_since(m.last_seen) > m.session_timeout)
            .map(|(id, _)| id.clone())
            .collect();
        if expired.is_empty() {
            return;
        }
        for id in &expired {
            debug!("Member {} session expired", id);
            self.members.remove(id);
        }
        if self.members.is_empty() {
            self.phase = Phase::Empty;
            self.leader = None;
        } else {
            self.start_rebalance(now);
        }
    }
}

/// Coordinator state for every group on one broker
#[derive(Default)]
pub struct GroupCoordinator {
    groups: Mutex<HashMap<String, Group>>,
    offsets: Mutex<HashMap<(String, String, i32), i64>>,
}

impl GroupCoordinator {
    pub fn join(&self, request: &JoinGroupRequest) -> Reply<JoinGroupResponse> {
        let now = Instant::now();
        let mut groups = self.groups.lock();
        let group = groups.entry(request.group_id.0.to_string()).or_default();

        let member_id = request.member_id.to_string();
        if member_id.is_empty() {
            let id = format!("consumer-{}", Uuid::new_v4());
            group.pending_ids.insert(id.clone());
            return Reply::Now(join_error(ERROR_MEMBER_ID_REQUIRED, &id));
        }
        if !group.members.contains_key(&member_id) && !group.pending_ids.remove(&member_id) {
            return Reply::Now(join_error(ERROR_UNKNOWN_MEMBER_ID, ""));
        }

        let protocols: Vec<(String, Bytes)> = request
            .protocols
            .iter()
            .map(|p| (p.name.to_string(), p.metadata.clone()))
            .collect();
        let settled = matches!(group.phase, Phase::CompletingRebalance | Phase::Stable);
        if let Some(member) = group.members.get_mut(&member_id) {
            // a member that missed its JoinGroup answer gets the current
            // generation back instead of forcing another rebalance
            if settled && member.join_waiter.is_none() && member.protocols == protocols {
                member.last_seen = now;
                return Reply::Now(group.join_response(&member_id));
            }
        }

        let (tx, rx) = oneshot::channel();
        let member = group.members.entry(member_id).or_insert_with(|| Member {
            protocols: Vec::new(),
            session_timeout: Duration::ZERO,
            rebalance_timeout: Duration::ZERO,
            last_seen: now,
            join_waiter: None,
            sync_waiter: None,
            assignment: Bytes::new(),
        });
        member.protocols = protocols;
        member.session_timeout = millis(request.session_timeout_ms);
        member.rebalance_timeout = millis(request.rebalance_timeout_ms);
        member.last_seen = now;
        member.join_waiter = Some(tx);

        group.start_rebalance(now);
        group.try_complete_join(now);
        Reply::Later(rx)
    }

    pub fn sync(&self, request: &SyncGroupRequest) -> Reply<SyncGroupResponse> {
        let now = Instant::now();
        let mut groups = self.groups.lock();
        let Some(group) = groups.get_mut(request.group_id.0.as_str()) else {
            return Reply::Now(sync_error(ERROR_UNKNOWN_MEMBER_ID));
        };
        let member_id = request.member_id.to_string();
        if !group.members.contains_key(&member_id) {
            return Reply::Now(sync_error(ERROR_UNKNOWN_MEMBER_ID));
        }
        if request.generation_id != group.generation {
            return Reply::Now(sync_error(ERROR_ILLEGAL_GENERATION));
        }

        match group.phase {
            Phase::PreparingRebalance { .. } | Phase::Empty => {
                Reply::Now(sync_error(ERROR_REBALANCE_IN_PROGRESS))
            }
            Phase::Stable => {
                let member = &group.members[&member_id];
                Reply::Now(sync_ok(member.assignment.clone()))
            }
            Phase::CompletingRebalance => {
                if group.leader.as_deref() == Some(member_id.as_str()) {
                    for entry in &request.assignments {
                        if let Some(member) = group.members.get_mut(entry.member_id.as_str()) {
                            member.assignment = entry.assignment.clone();
                        }
                    }
                    group.phase = Phase::Stable;
                    for (id, member) in group.members.iter_mut() {
                        member.last_seen = now;
                        if *id == member_id {
                            continue;
                        }
                        if let Some(waiter) = member.sync_waiter.take() {
                            let _ = waiter.send(sync_ok(member.assignment.clone()));
                        }
                    }
                    Reply::Now(sync_ok(group.members[&member_id].assignment.clone()))
                } else {
                    let (tx, rx) = oneshot::channel();
                    if let Some(member) = group.members.get_mut(&member_id) {
                        member.last_seen = now;
                        member.sync_waiter = Some(tx);
                    }
                    Reply::Later(rx)
                }
            }
        }
    }

    pub fn heartbeat(&self, request: &HeartbeatRequest) -> HeartbeatResponse {
        let now = Instant::now();
        let mut groups = self.groups.lock();
        let code = match groups.get_mut(request.group_id.0.as_str()) {
            None => ERROR_UNKNOWN_MEMBER_ID,
            Some(group) => match group.members.get_mut(request.member_id.as_str()) {
                None => ERROR_UNKNOWN_MEMBER_ID,
                Some(member) => {
                    member.last_seen = now;
                    if request.generation_id != group.generation {
                        ERROR_ILLEGAL_GENERATION
                    } else if matches!(group.phase, Phase::PreparingRebalance { .. }) {
                        ERROR_REBALANCE_IN_PROGRESS
                    } else {
                        ERROR_NONE
                    }
                }
            },
        };
        let mut response = HeartbeatResponse::default();
        response.error_code = code;
        response
    }

    pub fn leave(&self, request: &LeaveGroupRequest) -> LeaveGroupResponse {
        let now = Instant::now();
        let mut groups = self.groups.lock();
        let mut response = LeaveGroupResponse::default();
        let Some(group) = groups.get_mut(request.group_id.0.as_str()) else {
            response.error_code = ERROR_UNKNOWN_MEMBER_ID;
            return response;
        };
        let mut removed = false;
        for member in &request.members {
            removed |= group.members.remove(member.member_id.as_str()).is_some();
        }
        if !removed {
            response.error_code = ERROR_UNKNOWN_MEMBER_ID;
            return response;
        }
        if group.members.is_empty() {
            group.phase = Phase::Empty;
            group.leader = None;
        } else {
            group.start_rebalance(now);
            group.try_complete_join(now);
        }
        response
    }

    pub fn commit(&self, request: &OffsetCommitRequest) -> OffsetCommitResponse {
        let group_id = request.group_id.0.to_string();
        let code = {
            let groups = self.groups.lock();
            let simple = request.generation_id_or_member_epoch < 0 && request.member_id.is_empty();
            match groups.get(&group_id) {
                _ if simple => ERROR_NONE,
                None => ERROR_UNKNOWN_MEMBER_ID,
                Some(group) if !group.members.contains_key(request.member_id.as_str()) => {
                    ERROR_UNKNOWN_MEMBER_ID
                }
                Some(group) if group.generation != request.generation_id_or_member_epoch => {
                    ERROR_ILLEGAL_GENERATION
                }
                Some(group) if group.phase == Phase::CompletingRebalance => {
                    ERROR_REBALANCE_IN_PROGRESS
                }
                Some(_) => ERROR_NONE,
            }
        };

        let mut response = OffsetCommitResponse::default();
        let mut offsets = self.offsets.lock();
        for topic in &request.topics {
            let mut t = OffsetCommitResponseTopic::default();
            t.name = topic.name.clone();
            for p in &topic.partitions {
                if code == ERROR_NONE {
                    offsets.insert(
                        (group_id.clone(), topic.name.0.to_string(), p.partition_index),
                        p.committed_offset,
                    );
                }
                let mut entry = OffsetCommitResponsePartition::default();
                entry.partition_index = p.partition_index;
                entry.error_code = code;
                t.partitions.push(entry);
            }
            response.topics.push(t);
        }
        response
    }

    pub fn fetch_offsets(&self, request: &OffsetFetchRequest) -> OffsetFetchResponse {
        let group_id = request.group_id.0.to_string();
        let offsets = self.offsets.lock();
        let mut response = OffsetFetchResponse::default();
        for topic in request.topics.iter().flatten() {
            let mut t = OffsetFetchResponseTopic::default();
            t.name = topic.name.clone();
            for partition in &topic.partition_indexes {
                let mut p = OffsetFetchResponsePartition::default();
                p.partition_index = *partition;
                p.committed_offset = offsets
                    .get(&(group_id.clone(), topic.name.0.to_string(), *partition))
                    .copied()
                    .unwrap_or(-1);
                p.committed_leader_epoch = -1;
                t.partitions.push(p);
            }
            response.topics.push(t);
        }
        response
    }

    /// Expire sessions and close overdue join phases
    pub fn tick(&self) {
        let now = Instant::now();
        let mut groups = self.groups.lock();
        for group in groups.values_mut() {
            group.expire_sessions(now);
            group.try_complete_join(now);
        }
    }

    /// Committed offset, for assertions
    pub fn committed(&self, group_id: &str, topic: &str, partition: i32) -> Option<i64> {
        self.offsets
            .lock()
            .get(&(group_id.to_string(), topic.to_string(), partition))
            .copied()
    }

    /// Current member ids of a group
    pub fn members(&self, group_id: &str) -> Vec<String> {
        self.groups
            .lock()
            .get(group_id)
            .map(|g| g.members.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn generation(&self, group_id: &str) -> i32 {
        self.groups.lock().get(group_id).map_or(0, |g| g.generation)
    }
}

fn millis(ms: i32) -> Duration {
    Duration::from_millis(ms.max(0) as u64)
}

pub fn join_error(code: i16, member_id: &str) -> JoinGroupResponse {
    let mut response = JoinGroupResponse::default();
    response.error_code = code;
    response.generation_id = -1;
    response.member_id = StrBytes::from_string(member_id.to_string());
    response
}

pub fn sync_error(code: i16) -> SyncGroupResponse {
    let mut response = SyncGroupResponse::default();
    response.error_code = code;
    response
}

fn sync_ok(assignment: Bytes) -> SyncGroupResponse {
    let mut response = SyncGroupResponse::default();
    response.assignment = assignment;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kafka::assignment::{MemberAssignment, MemberSubscription};
    use kafka_protocol::messages::join_group_request::JoinGroupRequestProtocol;
    use kafka_protocol::messages::sync_group_request::SyncGroupRequestAssignment;
    use kafka_protocol::messages::GroupId;

    fn join_request(member_id: &str) -> JoinGroupRequest {
        let mut request = JoinGroupRequest::default();
        request.group_id = GroupId(StrBytes::from_static_str("g"));
        request.member_id = StrBytes::from_string(member_id.to_string());
        request.session_timeout_ms = 10_000;
        request.rebalance_timeout_ms = 10_000;
        let mut protocol = JoinGroupRequestProtocol::default();
        protocol.name = StrBytes::from_static_str("range");
        protocol.metadata = MemberSubscription::new(vec!["t".to_string()]).encode();
        request.protocols.push(protocol);
        request
    }

    fn member_id_for(coordinator: &GroupCoordinator) -> String {
        match coordinator.join(&join_request("")) {
            Reply::Now(r) => {
                assert_eq!(r.error_code, ERROR_MEMBER_ID_REQUIRED);
                r.member_id.to_string()
            }
            Reply::Later(_) => panic!("first join should answer at once"),
        }
    }

    #[tokio::test]
    async fn test_single_member_join_and_sync() {
        let coordinator = GroupCoordinator::default();
        let id = member_id_for(&coordinator);
        let Reply::Later(rx) = coordinator.join(&join_request(&id)) else {
            panic!("join should park");
        };
        let joined = rx.await.unwrap();
        assert_eq!(joined.generation_id, 1);
        assert_eq!(joined.leader.as_str(), id);
        assert_eq!(joined.members.len(), 1);

        let mut sync = SyncGroupRequest::default();
        sync.group_id = GroupId(StrBytes::from_static_str("g"));
        sync.generation_id = 1;
        sync.member_id = StrBytes::from_string(id.clone());
        let mut entry = SyncGroupRequestAssignment::default();
        entry.member_id = StrBytes::from_string(id.clone());
        let mut assignment = MemberAssignment::new();
        assignment.add("t", 0);
        entry.assignment = assignment.encode();
        sync.assignments.push(entry);
        let Reply::Now(synced) = coordinator.sync(&sync) else {
            panic!("leader sync answers at once");
        };
        assert_eq!(MemberAssignment::parse(&synced.assignment).unwrap(), assignment);

        let mut heartbeat = HeartbeatRequest::default();
        heartbeat.group_id = GroupId(StrBytes::from_static_str("g"));
        heartbeat.generation_id = 1;
        heartbeat.member_id = StrBytes::from_string(id);
        assert_eq!(coordinator.heartbeat(&heartbeat).error_code, ERROR_NONE);
    }

    #[tokio::test]
    async fn test_unknown_member_rejected() {
        let coordinator = GroupCoordinator::default();
        let Reply::Now(r) = coordinator.join(&join_request("stranger")) else {
            panic!("unknown member answers at once");
        };
        assert_eq!(r.error_code, ERROR_UNKNOWN_MEMBER_ID);
    }

    #[tokio::test]
    async fn test_second_member_triggers_rebalance() {
        let coordinator = GroupCoordinator::default();
        let a = member_id_for(&coordinator);
        let Reply::Later(rx) = coordinator.join(&join_request(&a)) else {
            panic!()
        };
        rx.await.unwrap();

        let b = member_id_for(&coordinator);
        let Reply::Later(b_rx) = coordinator.join(&join_request(&b)) else {
            panic!()
        };
        // a is still on generation 1 and must rejoin
        let mut heartbeat = HeartbeatRequest::default();
        heartbeat.group_id = GroupId(StrBytes::from_static_str("g"));
        heartbeat.generation_id = 1;
        heartbeat.member_id = StrBytes::from_string(a.clone());
        assert_eq!(
            coordinator.heartbeat(&heartbeat).error_code,
            ERROR_REBALANCE_IN_PROGRESS
        );

        let Reply::Later(a_rx) = coordinator.join(&join_request(&a)) else {
            panic!()
        };
        let (a_joined, b_joined) = (a_rx.await.unwrap(), b_rx.await.unwrap());
        assert_eq!(a_joined.generation_id, 2);
        assert_eq!(b_joined.generation_id, 2);
        // leadership sticks with the first member
        assert_eq!(a_joined.leader.as_str(), a);
        assert_eq!(a_joined.members.len(), 2);
        assert!(b_joined.members.is_empty());
    }

    #[test]
    fn test_simple_commit_and_fetch() {
        let coordinator = GroupCoordinator::default();
        let mut request = OffsetCommitRequest::default();
        request.group_id = GroupId(StrBytes::from_static_str("g"));
        request.generation_id_or_member_epoch = -1;
        let mut topic = kafka_protocol::messages::offset_commit_request::OffsetCommitRequestTopic::default();
        topic.name = crate::testing::helpers::topic_name("t");
        let mut p = kafka_protocol::messages::offset_commit_request::OffsetCommitRequestPartition::default();
        p.partition_index = 2;
        p.committed_offset = 17;
        topic.partitions.push(p);
        request.topics.push(topic);

        let response = coordinator.commit(&request);
        assert_eq!(response.topics[0].partitions[0].error_code, ERROR_NONE);
        assert_eq!(coordinator.committed("g", "t", 2), Some(17));
        assert_eq!(coordinator.committed("g", "t", 0), None);
    }
}
