// Connection manager
//
// Owns every network session the client has. Producer and consumer talk to
// brokers only through it:
//
// - One logical connection per broker node, opened lazily on first use and
//   closed when idle longer than connections.max.idle.ms
// - Bootstrap: the configured host:port list is tried in order until one
//   answers a Metadata request; bootstrap entries get synthetic negative node
//   ids since their real ids are unknown until that answer arrives
// - Transport failures are retried with exponential backoff, dropping the
//   broken session and invalidating metadata before each retry
// - Metadata is refreshed on "not leader"/"unknown topic" answers, after any
//   failed send, and every metadata.max.age.ms
//
// Group coordinators are registered under their own node key so coordinator
// traffic (a JoinGroup can block for the whole rebalance) never shares a
// socket with produce/fetch traffic to the same broker.

pub mod broker;
pub mod metadata;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use kafka_protocol::messages::metadata_request::MetadataRequestTopic;
use kafka_protocol::messages::{MetadataRequest, TopicName};
use kafka_protocol::protocol::StrBytes;
use parking_lot::RwLock;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::kafka::backoff::{self, BackoffPolicy};
use crate::kafka::constants::{
    COORDINATOR_NODE_ID_BASE, ERROR_UNKNOWN_TOPIC_OR_PARTITION, JOIN_GROUP_TIMEOUT_SLACK_MS,
};
use crate::kafka::error::{KafkaError, Result};
use crate::kafka::messages::{KafkaRequest, KafkaResponse, NodeId};

pub use broker::BrokerConnection;
pub use metadata::{BrokerAddress, ClusterMetadata, PartitionInfo, PartitionMap};

/// Transport seam used by the group membership logic.
///
/// ConnectionManager is the production implementation; tests substitute a
/// mockall mock to script coordinator answers.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Send with transparent reconnect/retry
    async fn send(&self, node_id: NodeId, request: KafkaRequest) -> Result<KafkaResponse>;

    /// Some node able to answer cluster-wide requests (FindCoordinator)
    async fn any_node(&self) -> Result<NodeId>;

    /// Current partition layout of a topic, fetched from the cluster
    async fn refresh_metadata(&self, topic: &str) -> Result<PartitionMap>;

    /// Register a group coordinator address; returns the node key to send to
    fn register_coordinator(&self, node_id: NodeId, host: &str, port: i32) -> NodeId;

    fn client_id(&self) -> String;
}

/// A request dispatched without waiting; see [`ConnectionManager::dispatch`]
pub struct PendingResponse {
    conn: Arc<BrokerConnection>,
    rx: oneshot::Receiver<Result<KafkaResponse>>,
}

impl PendingResponse {
    pub fn node_id(&self) -> NodeId {
        self.conn.node_id()
    }

    pub async fn wait(self, timeout: Duration) -> Result<KafkaResponse> {
        self.conn.wait(self.rx, timeout).await
    }
}

type ConnectionSlot = Arc<AsyncMutex<Option<Arc<BrokerConnection>>>>;

/// Network sessions and cluster metadata for one client
pub struct ConnectionManager {
    config: ClientConfig,
    backoff: BackoffPolicy,
    /// Bootstrap entries keyed by synthetic negative ids
    bootstrap: Vec<(NodeId, BrokerAddress)>,
    /// Coordinator addresses keyed by their dedicated node key
    coordinators: RwLock<HashMap<NodeId, BrokerAddress>>,
    metadata: RwLock<Arc<ClusterMetadata>>,
    metadata_stale: AtomicBool,
    /// Single-flight guard for metadata refreshes
    refresh_lock: AsyncMutex<()>,
    connections: parking_lot::Mutex<HashMap<NodeId, ConnectionSlot>>,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl ConnectionManager {
    /// Bootstrap against the configured servers and start the background
    /// metadata refresh and idle reaper tasks.
    pub async fn connect(config: ClientConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let mut bootstrap = Vec::with_capacity(config.bootstrap_servers.len());
        for (i, server) in config.bootstrap_servers.iter().enumerate() {
            let addr = BrokerAddress::parse(server).ok_or_else(|| {
                KafkaError::InvalidConfig(format!("bootstrap server '{}' is not host:port", server))
            })?;
            bootstrap.push((-(i as NodeId) - 1, addr));
        }

        let manager = Arc::new(Self {
            backoff: config.backoff(),
            config,
            bootstrap,
            coordinators: RwLock::new(HashMap::new()),
            metadata: RwLock::new(Arc::new(ClusterMetadata::default())),
            metadata_stale: AtomicBool::new(true),
            refresh_lock: AsyncMutex::new(()),
            connections: parking_lot::Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
        });

        let response = match manager
            .backoff
            .retry("bootstrap", |_| manager.request_metadata(Vec::new()))
            .await
        {
            Ok(response) => response,
            Err(e) => {
                return Err(backoff::exhausted(
                    &format!("bootstrap servers {:?}", manager.config.bootstrap_servers),
                    manager.backoff.max_attempts(),
                    e,
                ))
            }
        };
        manager.apply_metadata(&response);
        info!(
            "Bootstrapped against {:?}: {} broker(s)",
            manager.config.bootstrap_servers,
            manager.metadata.read().brokers.len()
        );

        Self::spawn_background(&manager);
        Ok(manager)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn backoff(&self) -> BackoffPolicy {
        self.backoff
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(KafkaError::ClientClosed);
        }
        Ok(())
    }

    fn spawn_background(manager: &Arc<Self>) {
        let max_age = manager.config.metadata_max_age;
        let weak = Arc::downgrade(manager);
        let shutdown = manager.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(max_age);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(manager) = weak.upgrade() else { break };
                manager.refresh_known_topics().await;
            }
            debug!("Metadata refresh task exiting");
        });

        let max_idle = manager.config.connections_max_idle;
        let weak: Weak<Self> = Arc::downgrade(manager);
        let shutdown = manager.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval((max_idle / 4).max(Duration::from_millis(50)));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(manager) = weak.upgrade() else { break };
                manager.reap_idle(max_idle);
            }
            debug!("Idle reaper task exiting");
        });
    }

    // ===== Node addressing =====

    fn address_of(&self, node_id: NodeId) -> Option<BrokerAddress> {
        if let Some(addr) = self.metadata.read().broker(node_id) {
            return Some(addr.clone());
        }
        if let Some(addr) = self.coordinators.read().get(&node_id) {
            return Some(addr.clone());
        }
        self.bootstrap
            .iter()
            .find(|(id, _)| *id == node_id)
            .map(|(_, addr)| addr.clone())
    }

    /// Nodes to try for cluster-wide requests: known brokers, then bootstrap
    fn candidate_nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.metadata.read().brokers.keys().copied().collect();
        nodes.sort_unstable();
        nodes.extend(self.bootstrap.iter().map(|(id, _)| *id));
        nodes
    }

    /// Key under which a coordinator's dedicated connection is kept
    pub fn coordinator_key(node_id: NodeId) -> NodeId {
        COORDINATOR_NODE_ID_BASE - node_id
    }

    // ===== Connections =====

    fn slot(&self, node_id: NodeId) -> ConnectionSlot {
        self.connections
            .lock()
            .entry(node_id)
            .or_insert_with(|| Arc::new(AsyncMutex::new(None)))
            .clone()
    }

    /// Reuse or open the connection to a node. One attempt, no retry.
    pub async fn connect_node(&self, node_id: NodeId) -> Result<Arc<BrokerConnection>> {
        self.ensure_open()?;
        let slot = self.slot(node_id);
        let mut guard = slot.lock().await;
        if let Some(conn) = guard.as_ref() {
            if !conn.is_closed() {
                return Ok(conn.clone());
            }
            debug!("Connection to node {} is closed, reconnecting", node_id);
        }
        let addr = self.address_of(node_id).ok_or_else(|| KafkaError::Metadata {
            topic: String::new(),
            message: format!("no address known for node {}", node_id),
        })?;
        let conn = BrokerConnection::connect(
            node_id,
            &addr.to_socket_string(),
            &self.config.client_id,
            self.config.request_timeout,
        )
        .await?;
        *guard = Some(conn.clone());
        Ok(conn)
    }

    /// Connection to a node, reconnecting with backoff. Exhaustion is a
    /// fatal Connect error.
    pub async fn connection(&self, node_id: NodeId) -> Result<Arc<BrokerConnection>> {
        self.backoff
            .retry(&format!("connect to node {}", node_id), |_| self.connect_node(node_id))
            .await
            .map_err(|e| {
                backoff::exhausted(&format!("node {}", node_id), self.backoff.max_attempts(), e)
            })
    }

    /// Close and forget the connection to a node
    pub fn drop_connection(&self, node_id: NodeId) {
        let slot = self.connections.lock().remove(&node_id);
        if let Some(slot) = slot {
            if let Ok(mut guard) = slot.try_lock() {
                if let Some(conn) = guard.take() {
                    conn.close();
                }
            }
        }
    }

    fn reap_idle(&self, max_idle: Duration) {
        let slots: Vec<(NodeId, ConnectionSlot)> = self
            .connections
            .lock()
            .iter()
            .map(|(id, slot)| (*id, slot.clone()))
            .collect();
        for (node_id, slot) in slots {
            let Ok(mut guard) = slot.try_lock() else {
                continue;
            };
            let idle = match guard.as_ref() {
                Some(conn) => conn.in_flight() == 0 && conn.idle_for() >= max_idle,
                None => false,
            };
            if idle {
                if let Some(conn) = guard.take() {
                    info!(
                        "Closing idle connection to node {} ({})",
                        node_id,
                        conn.addr()
                    );
                    conn.close();
                }
            }
        }
    }

    /// A failed exchange with a node: drop its session and treat metadata
    /// as stale.
    pub fn note_failure(&self, node_id: NodeId) {
        self.drop_connection(node_id);
        self.invalidate_metadata();
    }

    // ===== Requests =====

    /// Send a request without waiting for the answer and without retries.
    ///
    /// For callers that run their own retry policy (the producer), so a
    /// request is never retried at two layers.
    pub async fn dispatch(&self, node_id: NodeId, request: KafkaRequest) -> Result<PendingResponse> {
        let conn = match self.connect_node(node_id).await {
            Ok(conn) => conn,
            Err(e) => {
                if e.invalidates_metadata() {
                    self.invalidate_metadata();
                }
                return Err(e);
            }
        };
        match conn.dispatch(request) {
            Ok(rx) => Ok(PendingResponse { conn, rx }),
            Err(e) => {
                self.note_failure(node_id);
                Err(e)
            }
        }
    }

    /// Send a request and wait for the answer, reconnecting transparently on
    /// transport failure.
    pub async fn send(&self, node_id: NodeId, request: KafkaRequest) -> Result<KafkaResponse> {
        let timeout = request_timeout_for(&request, self.config.request_timeout);
        let mut retries = 0;
        loop {
            self.ensure_open()?;
            let result = match self.connect_node(node_id).await {
                Ok(conn) => conn.send(request.clone(), timeout).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(response) => {
                    for topic in response.stale_metadata_topics() {
                        debug!("Response from node {} reports stale metadata for {}", node_id, topic);
                        self.invalidate_topic(&topic);
                    }
                    return Ok(response);
                }
                Err(e) if e.is_retriable() => {
                    self.note_failure(node_id);
                    if !self.backoff.should_retry(retries) {
                        return Err(backoff::exhausted(
                            &format!("node {}", node_id),
                            retries + 1,
                            e,
                        ));
                    }
                    let delay = self.backoff.delay(retries);
                    warn!(
                        "Request to node {} failed ({}), retry {}/{} in {:?}",
                        node_id,
                        e,
                        retries + 1,
                        self.backoff.max_retries(),
                        delay
                    );
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return Err(KafkaError::ClientClosed),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    retries += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Any broker, preferring one with a live session
    pub async fn any_node(&self) -> Result<NodeId> {
        self.ensure_open()?;
        let candidates = self.candidate_nodes();
        {
            let connections = self.connections.lock();
            for node in &candidates {
                if let Some(slot) = connections.get(node) {
                    if let Ok(guard) = slot.try_lock() {
                        if guard.as_ref().is_some_and(|c| !c.is_closed()) {
                            return Ok(*node);
                        }
                    }
                }
            }
        }
        candidates.first().copied().ok_or_else(|| {
            KafkaError::Connect("no brokers known and no bootstrap servers".to_string())
        })
    }

    // ===== Metadata =====

    /// One Metadata request, trying each candidate node once.
    async fn request_metadata(
        &self,
        topics: Vec<String>,
    ) -> Result<kafka_protocol::messages::MetadataResponse> {
        let mut request = MetadataRequest::default();
        request.topics = Some(
            topics
                .iter()
                .map(|t| {
                    let mut topic = MetadataRequestTopic::default();
                    topic.name = Some(TopicName(StrBytes::from_string(t.clone())));
                    topic
                })
                .collect(),
        );
        request.allow_auto_topic_creation = true;

        let mut last_error = KafkaError::Connect("no candidate nodes".to_string());
        for node_id in self.candidate_nodes() {
            self.ensure_open()?;
            let attempt = match self.connect_node(node_id).await {
                Ok(conn) => {
                    conn.send(
                        KafkaRequest::Metadata(request.clone()),
                        self.config.request_timeout,
                    )
                    .await
                }
                Err(e) => Err(e),
            };
            match attempt.and_then(|r| r.into_metadata()) {
                Ok(response) => return Ok(response),
                Err(e) => {
                    debug!("Metadata request to node {} failed: {}", node_id, e);
                    self.drop_connection(node_id);
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    fn apply_metadata(&self, response: &kafka_protocol::messages::MetadataResponse) {
        let mut snapshot = self.metadata.write();
        let next = snapshot.merged_with(response);
        *snapshot = Arc::new(next);
        self.metadata_stale.store(false, Ordering::Release);
    }

    /// Current snapshot; never blocks on the network
    pub fn metadata(&self) -> Arc<ClusterMetadata> {
        self.metadata.read().clone()
    }

    pub fn invalidate_metadata(&self) {
        self.metadata_stale.store(true, Ordering::Release);
    }

    pub fn invalidate_topic(&self, topic: &str) {
        let mut snapshot = self.metadata.write();
        let next = snapshot.without_topic(topic);
        *snapshot = Arc::new(next);
    }

    fn cached_topic(&self, topic: &str) -> Option<PartitionMap> {
        if self.metadata_stale.load(Ordering::Acquire) {
            return None;
        }
        self.metadata.read().topic(topic).cloned()
    }

    /// Fetch the partition layout of a topic from the cluster.
    ///
    /// Retries while the topic is unknown or a partition has no leader, up
    /// to the retry budget.
    pub async fn refresh_metadata(&self, topic: &str) -> Result<PartitionMap> {
        let requested_at = Instant::now();
        let _guard = self.refresh_lock.lock().await;
        // another caller may have refreshed while we waited
        if let Some(map) = self.cached_topic(topic) {
            if self.metadata.read().fetched_at >= requested_at && map.is_complete() {
                return Ok(map);
            }
        }

        let result = self
            .backoff
            .retry(&format!("metadata for {}", topic), |_| async {
                let response = self.request_metadata(vec![topic.to_string()]).await?;
                self.apply_metadata(&response);
                let snapshot = self.metadata();
                if let Some(code) = snapshot.topic_errors.get(topic) {
                    return Err(KafkaError::from_code(*code, topic));
                }
                match snapshot.topic(topic) {
                    Some(map) if map.is_complete() => Ok(map.clone()),
                    Some(_) => Err(KafkaError::Metadata {
                        topic: topic.to_string(),
                        message: "partition without leader".to_string(),
                    }),
                    None => Err(KafkaError::from_code(ERROR_UNKNOWN_TOPIC_OR_PARTITION, topic)),
                }
            })
            .await;

        match result {
            Ok(map) => {
                debug!(
                    "Metadata for {}: {} partition(s)",
                    topic,
                    map.partition_count()
                );
                Ok(map)
            }
            Err(KafkaError::TopicNotFound(t)) => Err(KafkaError::Metadata {
                topic: t,
                message: "topic does not exist".to_string(),
            }),
            Err(e @ (KafkaError::Transport(_) | KafkaError::Io(_))) => Err(backoff::exhausted(
                "cluster",
                self.backoff.max_attempts(),
                e,
            )),
            Err(e) => Err(e),
        }
    }

    /// Cached layout, refreshed when missing or stale
    pub async fn partition_map(&self, topic: &str) -> Result<PartitionMap> {
        match self.cached_topic(topic) {
            Some(map) => Ok(map),
            None => self.refresh_metadata(topic).await,
        }
    }

    pub async fn partition_count(&self, topic: &str) -> Result<usize> {
        Ok(self.partition_map(topic).await?.partition_count())
    }

    /// Leader of a partition, refreshing metadata if it is not known
    pub async fn leader_for(&self, topic: &str, partition: i32) -> Result<NodeId> {
        if let Some(leader) = self.cached_topic(topic).and_then(|m| m.leader(partition)) {
            return Ok(leader);
        }
        let map = self.refresh_metadata(topic).await?;
        map.leader(partition).ok_or_else(|| KafkaError::Metadata {
            topic: topic.to_string(),
            message: format!("no leader for partition {}", partition),
        })
    }

    async fn refresh_known_topics(&self) {
        let topics: Vec<String> = self.metadata().topics.keys().cloned().collect();
        match self.request_metadata(topics).await {
            Ok(response) => {
                self.apply_metadata(&response);
                debug!("Periodic metadata refresh complete");
            }
            Err(e) => {
                warn!("Periodic metadata refresh failed: {}", e);
                self.invalidate_metadata();
            }
        }
    }

    // ===== Coordinators =====

    pub fn register_coordinator(&self, node_id: NodeId, host: &str, port: i32) -> NodeId {
        let key = Self::coordinator_key(node_id);
        let addr = BrokerAddress::new(host.to_string(), port);
        let previous = self.coordinators.write().insert(key, addr.clone());
        if previous.is_some_and(|p| p != addr) {
            debug!("Coordinator {} moved to {}:{}", node_id, host, port);
            self.drop_connection(key);
        }
        key
    }

    /// Close every session and stop background tasks. Later sends fail with
    /// ClientClosed.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.cancel();
        let slots: Vec<ConnectionSlot> = self.connections.lock().drain().map(|(_, s)| s).collect();
        for slot in slots {
            if let Ok(mut guard) = slot.try_lock() {
                if let Some(conn) = guard.take() {
                    conn.close();
                }
            }
        }
        info!("Connection manager closed");
    }
}

/// The coordinator parks a JoinGroup until the rebalance completes; a fetch
/// is parked for up to its max wait
fn request_timeout_for(request: &KafkaRequest, default: Duration) -> Duration {
    match request {
        KafkaRequest::JoinGroup(join) => {
            let rebalance = Duration::from_millis(join.rebalance_timeout_ms.max(0) as u64);
            default.max(rebalance + Duration::from_millis(JOIN_GROUP_TIMEOUT_SLACK_MS))
        }
        KafkaRequest::Fetch(fetch) => default + Duration::from_millis(fetch.max_wait_ms.max(0) as u64),
        _ => default,
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl BrokerTransport for ConnectionManager {
    async fn send(&self, node_id: NodeId, request: KafkaRequest) -> Result<KafkaResponse> {
        ConnectionManager::send(self, node_id, request).await
    }

    async fn any_node(&self) -> Result<NodeId> {
        ConnectionManager::any_node(self).await
    }

    async fn refresh_metadata(&self, topic: &str) -> Result<PartitionMap> {
        ConnectionManager::partition_map(self, topic).await
    }

    fn register_coordinator(&self, node_id: NodeId, host: &str, port: i32) -> NodeId {
        ConnectionManager::register_coordinator(self, node_id, host, port)
    }

    fn client_id(&self) -> String {
        self.config.client_id.clone()
    }
}
