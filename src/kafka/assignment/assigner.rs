// Group membership and partition assignment
//
// A PartitionAssigner is one member of one consumer group. It runs the
// classic (eager) rebalance protocol against the group coordinator:
//
//   FindCoordinator -> JoinGroup -> [leader computes assignment] -> SyncGroup
//
// then keeps the membership alive with a heartbeat task. When the heartbeat
// learns that the group is rebalancing (or that our membership is gone) it
// raises the rejoin signal and stops; the consumer notices on its next poll,
// commits and revokes what it owns, and calls join again.
//
// Outputs:
// - the current assignment, swapped atomically through a watch channel
// - Revoked / Assigned events on an mpsc channel for a single listener

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kafka_protocol::messages::join_group_request::JoinGroupRequestProtocol;
use kafka_protocol::messages::leave_group_request::MemberIdentity;
use kafka_protocol::messages::sync_group_request::SyncGroupRequestAssignment;
use kafka_protocol::messages::{
    FindCoordinatorRequest, GroupId, HeartbeatRequest, JoinGroupRequest, JoinGroupResponse,
    LeaveGroupRequest, SyncGroupRequest,
};
use kafka_protocol::protocol::StrBytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::consumer_protocol::{MemberAssignment, MemberSubscription};
use super::strategies::{create_strategy, AssignmentInput};
use crate::config::ConsumerConfig;
use crate::kafka::backoff::BackoffPolicy;
use crate::kafka::connection::BrokerTransport;
use crate::kafka::constants::*;
use crate::kafka::error::{KafkaError, Result};
use crate::kafka::messages::{KafkaRequest, KafkaResponse, NodeId, TopicPartition};

/// Group-level settings of one member
#[derive(Debug, Clone)]
pub struct GroupSettings {
    pub group_id: String,
    pub session_timeout: Duration,
    pub rebalance_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// Strategy names in preference order
    pub strategies: Vec<String>,
}

impl GroupSettings {
    pub fn from_consumer_config(config: &ConsumerConfig, group_id: &str) -> Self {
        Self {
            group_id: group_id.to_string(),
            session_timeout: config.session_timeout,
            rebalance_timeout: config.rebalance_timeout,
            heartbeat_interval: config.heartbeat_interval,
            strategies: config.assignment_strategies.clone(),
        }
    }
}

/// Ownership changes, in the order they happen
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebalanceEvent {
    Revoked(Vec<TopicPartition>),
    Assigned(Vec<TopicPartition>),
}

/// What this member owns right now
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignmentSnapshot {
    pub generation: i32,
    pub member_id: String,
    pub partitions: Vec<TopicPartition>,
}

impl Default for AssignmentSnapshot {
    fn default() -> Self {
        Self {
            generation: -1,
            member_id: String::new(),
            partitions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
struct MemberState {
    member_id: String,
    generation: i32,
    coordinator: Option<NodeId>,
}

impl MemberState {
    fn forget_membership(&mut self) {
        self.member_id.clear();
        self.generation = -1;
    }
}

/// Raised by the heartbeat task, cleared by join
#[derive(Default)]
struct RejoinSignal {
    needed: AtomicBool,
    notify: Notify,
}

impl RejoinSignal {
    fn raise(&self) {
        self.needed.store(true, Ordering::Release);
        self.notify.notify_one();
    }
}

/// Raises the rejoin signal when a join ends without an assignment,
/// including when the join future is dropped
struct PendingJoin<'a> {
    rejoin: &'a RejoinSignal,
    done: bool,
}

impl Drop for PendingJoin<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.rejoin.raise();
        }
    }
}

/// How one JoinGroup + SyncGroup round ended
enum JoinRound {
    Assigned(MemberAssignment),
    /// The coordinator handed us a member id; join again with it
    MemberIdAssigned,
    /// The group moved on underneath us (error code says how)
    Restart(i16),
}

struct HeartbeatHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

/// One member of a consumer group
pub struct PartitionAssigner {
    transport: Arc<dyn BrokerTransport>,
    settings: GroupSettings,
    backoff: BackoffPolicy,
    state: Arc<Mutex<MemberState>>,
    topics: Mutex<Vec<String>>,
    snapshot: watch::Sender<Arc<AssignmentSnapshot>>,
    events_tx: mpsc::UnboundedSender<RebalanceEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<RebalanceEvent>>>,
    rejoin: Arc<RejoinSignal>,
    heartbeat: Mutex<Option<HeartbeatHandle>>,
}

impl PartitionAssigner {
    pub fn new(transport: Arc<dyn BrokerTransport>, settings: GroupSettings, backoff: BackoffPolicy) -> Self {
        let (snapshot, _) = watch::channel(Arc::new(AssignmentSnapshot::default()));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            transport,
            settings,
            backoff,
            state: Arc::new(Mutex::new(MemberState {
                member_id: String::new(),
                generation: -1,
                coordinator: None,
            })),
            topics: Mutex::new(Vec::new()),
            snapshot,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            rejoin: Arc::new(RejoinSignal::default()),
            heartbeat: Mutex::new(None),
        }
    }

    pub fn group_id(&self) -> &str {
        &self.settings.group_id
    }

    pub fn member_id(&self) -> String {
        self.state.lock().member_id.clone()
    }

    pub fn generation(&self) -> i32 {
        self.state.lock().generation
    }

    /// The rebalance event stream. There is one; later calls get None.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<RebalanceEvent>> {
        self.events_rx.lock().take()
    }

    pub fn watch_assignment(&self) -> watch::Receiver<Arc<AssignmentSnapshot>> {
        self.snapshot.subscribe()
    }

    pub fn assignment(&self) -> Arc<AssignmentSnapshot> {
        self.snapshot.borrow().clone()
    }

    pub fn needs_rejoin(&self) -> bool {
        self.rejoin.needed.load(Ordering::Acquire)
    }

    /// Resolves once a rejoin is requested (possibly already)
    pub async fn rejoin_requested(&self) {
        if self.needs_rejoin() {
            return;
        }
        self.rejoin.notify.notified().await;
    }

    pub fn request_rejoin(&self) {
        self.rejoin.raise();
    }

    // ===== Coordinator =====

    /// The group coordinator's node key, discovering it if unknown
    pub async fn coordinator(&self) -> Result<NodeId> {
        if let Some(node) = self.state.lock().coordinator {
            return Ok(node);
        }
        let node = self
            .backoff
            .retry("find coordinator", |_| self.find_coordinator())
            .await?;
        self.state.lock().coordinator = Some(node);
        Ok(node)
    }

    /// Forget the coordinator (it moved or is unreachable)
    pub fn coordinator_lost(&self) {
        self.state.lock().coordinator = None;
    }

    async fn find_coordinator(&self) -> Result<NodeId> {
        let node = self.transport.any_node().await?;
        let mut request = FindCoordinatorRequest::default();
        request.key = StrBytes::from_string(self.settings.group_id.clone());
        request.key_type = COORDINATOR_KEY_TYPE_GROUP;

        let response = self
            .transport
            .send(node, KafkaRequest::FindCoordinator(request))
            .await?
            .into_find_coordinator()?;
        if response.error_code != ERROR_NONE {
            return Err(KafkaError::from_code(
                response.error_code,
                format!("FindCoordinator for group {}", self.settings.group_id),
            ));
        }
        let key = self
            .transport
            .register_coordinator(response.node_id.0, &response.host, response.port);
        info!(
            "Coordinator for group {} is node {} ({}:{})",
            self.settings.group_id, response.node_id.0, response.host, response.port
        );
        Ok(key)
    }

    /// Map a coordinator error code, forgetting the coordinator when it
    /// says it is not (or no longer) the one
    fn coordinator_error(&self, code: i16, what: &str) -> KafkaError {
        if matches!(code, ERROR_NOT_COORDINATOR | ERROR_COORDINATOR_NOT_AVAILABLE) {
            self.coordinator_lost();
        }
        KafkaError::from_code(code, format!("{} for group {}", what, self.settings.group_id))
    }

    // ===== Join / Sync =====

    /// Join the group subscribed to `topics` and wait for this member's
    /// share of their partitions. A failed or abandoned join leaves the
    /// rejoin signal raised.
    pub async fn join(&self, topics: &[String]) -> Result<MemberAssignment> {
        *self.topics.lock() = topics.to_vec();
        self.stop_heartbeat();
        self.rejoin.needed.store(false, Ordering::Release);
        let mut pending = PendingJoin {
            rejoin: &self.rejoin,
            done: false,
        };

        let mut retries = 0;
        let mut restarts = 0;
        loop {
            match self.join_once(topics).await {
                Ok(JoinRound::Assigned(assignment)) => {
                    pending.done = true;
                    return Ok(self.install(assignment));
                }
                Ok(JoinRound::MemberIdAssigned) if self.backoff.should_retry(restarts) => restarts += 1,
                Ok(JoinRound::Restart(code)) if self.backoff.should_retry(restarts) => {
                    let delay = self.backoff.delay(restarts);
                    debug!(
                        "Group {} join restarted (code {}), next round in {:?}",
                        self.settings.group_id, code, delay
                    );
                    tokio::time::sleep(delay).await;
                    restarts += 1;
                }
                Ok(JoinRound::MemberIdAssigned) => {
                    return Err(self.coordinator_error(ERROR_MEMBER_ID_REQUIRED, "JoinGroup"));
                }
                Ok(JoinRound::Restart(code)) => {
                    warn!(
                        "Group {} did not settle after {} join round(s)",
                        self.settings.group_id,
                        restarts + 1
                    );
                    return Err(self.coordinator_error(code, "JoinGroup"));
                }
                Err(e) if e.is_retriable() && self.backoff.should_retry(retries) => {
                    let delay = self.backoff.delay(retries);
                    warn!(
                        "Joining group {} failed ({}), retrying in {:?}",
                        self.settings.group_id, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    retries += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One JoinGroup + SyncGroup round
    async fn join_once(&self, topics: &[String]) -> Result<JoinRound> {
        let coordinator = self.coordinator().await?;
        let member_id = self.member_id();

        let request = self.join_request(&member_id, topics);
        debug!(
            "JoinGroup {} as '{}' (topics {:?})",
            self.settings.group_id, member_id, topics
        );
        let response = self
            .send_to_coordinator(coordinator, KafkaRequest::JoinGroup(request))
            .await?
            .into_join_group()?;

        match response.error_code {
            ERROR_NONE => {}
            ERROR_MEMBER_ID_REQUIRED => {
                debug!("Group {} assigned member id {}", self.settings.group_id, response.member_id);
                self.state.lock().member_id = response.member_id.to_string();
                return Ok(JoinRound::MemberIdAssigned);
            }
            ERROR_UNKNOWN_MEMBER_ID => {
                self.state.lock().forget_membership();
                return Ok(JoinRound::Restart(ERROR_UNKNOWN_MEMBER_ID));
            }
            ERROR_REBALANCE_IN_PROGRESS => return Ok(JoinRound::Restart(ERROR_REBALANCE_IN_PROGRESS)),
            code => return Err(self.coordinator_error(code, "JoinGroup")),
        }

        let generation = response.generation_id;
        let member_id = response.member_id.to_string();
        {
            let mut state = self.state.lock();
            state.member_id = member_id.clone();
            state.generation = generation;
        }
        let is_leader = response.leader.as_str() == member_id;
        info!(
            "Joined group {} generation {} as {}{} ({} member(s))",
            self.settings.group_id,
            generation,
            member_id,
            if is_leader { ", leader" } else { "" },
            response.members.len()
        );

        let assignments = if is_leader {
            self.assign_as_leader(&response).await?
        } else {
            Vec::new()
        };

        let mut sync = SyncGroupRequest::default();
        sync.group_id = GroupId(StrBytes::from_string(self.settings.group_id.clone()));
        sync.generation_id = generation;
        sync.member_id = StrBytes::from_string(member_id);
        sync.assignments = assignments;
        let response = self
            .send_to_coordinator(coordinator, KafkaRequest::SyncGroup(sync))
            .await?
            .into_sync_group()?;

        match response.error_code {
            ERROR_NONE => {}
            code @ (ERROR_REBALANCE_IN_PROGRESS | ERROR_ILLEGAL_GENERATION) => {
                debug!("Group {} rebalanced during sync, rejoining", self.settings.group_id);
                return Ok(JoinRound::Restart(code));
            }
            ERROR_UNKNOWN_MEMBER_ID => {
                self.state.lock().forget_membership();
                return Ok(JoinRound::Restart(ERROR_UNKNOWN_MEMBER_ID));
            }
            code => return Err(self.coordinator_error(code, "SyncGroup")),
        }
        Ok(JoinRound::Assigned(MemberAssignment::parse(&response.assignment)?))
    }

    fn join_request(&self, member_id: &str, topics: &[String]) -> JoinGroupRequest {
        let metadata = MemberSubscription::new(topics.to_vec()).encode();
        let mut request = JoinGroupRequest::default();
        request.group_id = GroupId(StrBytes::from_string(self.settings.group_id.clone()));
        request.session_timeout_ms = duration_ms(self.settings.session_timeout);
        request.rebalance_timeout_ms = duration_ms(self.settings.rebalance_timeout);
        request.member_id = StrBytes::from_string(member_id.to_string());
        request.protocol_type = StrBytes::from_static_str(CONSUMER_PROTOCOL_TYPE);
        for name in &self.settings.strategies {
            let mut protocol = JoinGroupRequestProtocol::default();
            protocol.name = StrBytes::from_string(name.clone());
            protocol.metadata = metadata.clone();
            request.protocols.push(protocol);
        }
        request
    }

    async fn send_to_coordinator(
        &self,
        coordinator: NodeId,
        request: KafkaRequest,
    ) -> Result<KafkaResponse> {
        match self.transport.send(coordinator, request).await {
            Ok(response) => Ok(response),
            Err(e) => {
                if matches!(e, KafkaError::Connect(_) | KafkaError::Transport(_) | KafkaError::Io(_)) {
                    self.coordinator_lost();
                }
                Err(e)
            }
        }
    }

    /// Run the chosen strategy over every member's subscription
    async fn assign_as_leader(&self, response: &JoinGroupResponse) -> Result<Vec<SyncGroupRequestAssignment>> {
        let protocol = response
            .protocol_name
            .as_ref()
            .map(|p| p.to_string())
            .unwrap_or_default();
        let strategy = create_strategy(&protocol).ok_or_else(|| KafkaError::Protocol {
            code: ERROR_INCONSISTENT_GROUP_PROTOCOL,
            message: format!("coordinator selected unsupported strategy '{}'", protocol),
        })?;

        let mut input = AssignmentInput::default();
        for member in &response.members {
            input.subscriptions.insert(
                member.member_id.to_string(),
                MemberSubscription::parse(&member.metadata)?,
            );
        }
        for topic in input.subscribed_topics() {
            match self.transport.refresh_metadata(&topic).await {
                Ok(map) => {
                    input
                        .topic_partitions
                        .insert(topic, map.partition_count() as i32);
                }
                Err(e) => warn!("Topic {} left unassigned: {}", topic, e),
            }
        }

        let output = strategy.assign(&input);
        for (member, assignment) in &output {
            debug!(
                "Group {} {}: {} gets {:?}",
                self.settings.group_id,
                strategy.name(),
                member,
                assignment.topic_partitions
            );
        }
        Ok(output
            .into_iter()
            .map(|(member_id, assignment)| {
                let mut entry = SyncGroupRequestAssignment::default();
                entry.member_id = StrBytes::from_string(member_id);
                entry.assignment = assignment.encode();
                entry
            })
            .collect())
    }

    /// Publish a freshly synced assignment and start heartbeating
    fn install(&self, assignment: MemberAssignment) -> MemberAssignment {
        let topics = self.topics.lock().clone();
        let mut owned = MemberAssignment::new();
        for tp in assignment.to_topic_partitions() {
            if topics.contains(&tp.topic) {
                owned.add(&tp.topic, tp.partition);
            } else {
                warn!("Ignoring assigned partition {} outside our subscription", tp);
            }
        }
        let partitions = owned.to_topic_partitions();
        let (generation, member_id) = {
            let state = self.state.lock();
            (state.generation, state.member_id.clone())
        };
        self.snapshot.send_replace(Arc::new(AssignmentSnapshot {
            generation,
            member_id,
            partitions: partitions.clone(),
        }));
        let _ = self.events_tx.send(RebalanceEvent::Assigned(partitions));
        self.start_heartbeat();
        owned
    }

    /// Give up everything we own (before rejoining or leaving). Returns
    /// what was owned.
    pub fn revoke(&self) -> Vec<TopicPartition> {
        let current = self.assignment();
        if current.partitions.is_empty() {
            return Vec::new();
        }
        self.snapshot.send_replace(Arc::new(AssignmentSnapshot {
            generation: current.generation,
            member_id: current.member_id.clone(),
            partitions: Vec::new(),
        }));
        let _ = self
            .events_tx
            .send(RebalanceEvent::Revoked(current.partitions.clone()));
        current.partitions.clone()
    }

    /// Leave the group so the remaining members rebalance right away
    pub async fn leave(&self) {
        self.stop_heartbeat();
        self.revoke();
        let (member_id, coordinator) = {
            let state = self.state.lock();
            (state.member_id.clone(), state.coordinator)
        };
        let Some(coordinator) = coordinator.filter(|_| !member_id.is_empty()) else {
            return;
        };

        let mut member = MemberIdentity::default();
        member.member_id = StrBytes::from_string(member_id.clone());
        let mut request = LeaveGroupRequest::default();
        request.group_id = GroupId(StrBytes::from_string(self.settings.group_id.clone()));
        request.members.push(member);

        match self.transport.send(coordinator, KafkaRequest::LeaveGroup(request)).await {
            Ok(response) => match response.into_leave_group() {
                Ok(r) if r.error_code == ERROR_NONE => {
                    info!("Member {} left group {}", member_id, self.settings.group_id)
                }
                Ok(r) => warn!(
                    "LeaveGroup for {} returned error code {}",
                    self.settings.group_id, r.error_code
                ),
                Err(e) => warn!("LeaveGroup for {} failed: {}", self.settings.group_id, e),
            },
            Err(e) => warn!("LeaveGroup for {} failed: {}", self.settings.group_id, e),
        }
        self.state.lock().forget_membership();
    }

    // ===== Heartbeat =====

    fn start_heartbeat(&self) {
        self.stop_heartbeat();
        let token = CancellationToken::new();
        let task = tokio::spawn(heartbeat_loop(
            self.transport.clone(),
            self.settings.group_id.clone(),
            self.settings.heartbeat_interval,
            self.state.clone(),
            self.rejoin.clone(),
            token.clone(),
        ));
        *self.heartbeat.lock() = Some(HeartbeatHandle { token, task });
    }

    /// Stop heartbeating without leaving; the coordinator expires the
    /// member after the session timeout
    pub fn stop_heartbeat(&self) {
        if let Some(handle) = self.heartbeat.lock().take() {
            handle.token.cancel();
            handle.task.abort();
        }
    }
}

impl Drop for PartitionAssigner {
    fn drop(&mut self) {
        self.stop_heartbeat();
    }
}

fn duration_ms(d: Duration) -> i32 {
    d.as_millis().min(i32::MAX as u128) as i32
}

async fn heartbeat_loop(
    transport: Arc<dyn BrokerTransport>,
    group_id: String,
    interval: Duration,
    state: Arc<Mutex<MemberState>>,
    rejoin: Arc<RejoinSignal>,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // first tick is immediate; the join itself counts as a heartbeat
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let (coordinator, generation, member_id) = {
            let state = state.lock();
            (state.coordinator, state.generation, state.member_id.clone())
        };
        let Some(coordinator) = coordinator else {
            rejoin.raise();
            return;
        };

        let mut request = HeartbeatRequest::default();
        request.group_id = GroupId(StrBytes::from_string(group_id.clone()));
        request.generation_id = generation;
        request.member_id = StrBytes::from_string(member_id);

        let result = tokio::select! {
            _ = token.cancelled() => return,
            result = transport.send(coordinator, KafkaRequest::Heartbeat(request)) => result,
        };
        let code = match result.and_then(|r| r.into_heartbeat()) {
            Ok(response) => response.error_code,
            Err(e) => {
                warn!("Heartbeat for group {} failed: {}", group_id, e);
                state.lock().coordinator = None;
                rejoin.raise();
                return;
            }
        };
        match code {
            ERROR_NONE => trace!("Heartbeat ok for group {} generation {}", group_id, generation),
            ERROR_REBALANCE_IN_PROGRESS | ERROR_ILLEGAL_GENERATION => {
                info!("Group {} is rebalancing (code {}), rejoin needed", group_id, code);
                rejoin.raise();
                return;
            }
            ERROR_UNKNOWN_MEMBER_ID => {
                info!("Group {} no longer knows this member, rejoin needed", group_id);
                state.lock().forget_membership();
                rejoin.raise();
                return;
            }
            ERROR_NOT_COORDINATOR | ERROR_COORDINATOR_NOT_AVAILABLE => {
                info!("Coordinator for group {} moved, rejoin needed", group_id);
                state.lock().coordinator = None;
                rejoin.raise();
                return;
            }
            other => warn!("Heartbeat for group {} returned error code {}", group_id, other),
        }
    }
}
