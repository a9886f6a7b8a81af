//! Cluster metadata snapshot
//!
//! Brokers and per-topic partition leaders as last reported by a Metadata
//! response. A snapshot is immutable; the connection manager swaps in a new
//! `Arc<ClusterMetadata>` on every refresh so readers never see a half-applied
//! update.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use kafka_protocol::messages::MetadataResponse;

use crate::kafka::constants::ERROR_NONE;
use crate::kafka::messages::NodeId;

/// Host/port a broker advertises
///
/// The host is behind an Arc so copies handed to connection attempts do not
/// allocate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerAddress {
    host: Arc<String>,
    port: i32,
}

impl BrokerAddress {
    pub fn new(host: String, port: i32) -> Self {
        Self {
            host: Arc::new(host),
            port,
        }
    }

    /// Parse a "host:port" bootstrap entry
    pub fn parse(addr: &str) -> Option<Self> {
        let (host, port) = addr.rsplit_once(':')?;
        let port: i32 = port.parse().ok()?;
        if host.is_empty() || !(1..=65535).contains(&port) {
            return None;
        }
        Some(Self::new(host.to_string(), port))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> i32 {
        self.port
    }

    /// "host:port" form accepted by TcpStream::connect
    pub fn to_socket_string(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Leader of one partition; None while the cluster elects one
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionInfo {
    pub partition: i32,
    pub leader: Option<NodeId>,
}

/// Partition layout of one topic
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionMap {
    pub topic: String,
    /// Sorted by partition index
    pub partitions: Vec<PartitionInfo>,
}

impl PartitionMap {
    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    pub fn leader(&self, partition: i32) -> Option<NodeId> {
        self.partitions
            .iter()
            .find(|p| p.partition == partition)
            .and_then(|p| p.leader)
    }

    /// True when every partition currently has a leader
    pub fn is_complete(&self) -> bool {
        !self.partitions.is_empty() && self.partitions.iter().all(|p| p.leader.is_some())
    }
}

/// One Metadata response, digested
#[derive(Clone, Debug)]
pub struct ClusterMetadata {
    pub brokers: HashMap<NodeId, BrokerAddress>,
    pub topics: HashMap<String, PartitionMap>,
    /// Per-topic error codes reported by the broker
    pub topic_errors: HashMap<String, i16>,
    pub fetched_at: Instant,
}

impl Default for ClusterMetadata {
    fn default() -> Self {
        Self {
            brokers: HashMap::new(),
            topics: HashMap::new(),
            topic_errors: HashMap::new(),
            fetched_at: Instant::now(),
        }
    }
}

impl ClusterMetadata {
    /// Merge a response into a copy of this snapshot.
    ///
    /// Topics named in the response replace their old entries; topics the
    /// response does not mention are kept. The broker list is replaced when
    /// the response carries one.
    pub fn merged_with(&self, response: &MetadataResponse) -> Self {
        let mut next = self.clone();
        if !response.brokers.is_empty() {
            next.brokers = response
                .brokers
                .iter()
                .map(|b| (b.node_id.0, BrokerAddress::new(b.host.to_string(), b.port)))
                .collect();
        }

        for topic in &response.topics {
            let Some(name) = topic.name.as_ref().map(|n| n.to_string()) else {
                continue;
            };
            if topic.error_code != ERROR_NONE {
                next.topics.remove(&name);
                next.topic_errors.insert(name, topic.error_code);
                continue;
            }
            let mut partitions: Vec<PartitionInfo> = topic
                .partitions
                .iter()
                .map(|p| PartitionInfo {
                    partition: p.partition_index,
                    leader: (p.error_code == ERROR_NONE && p.leader_id.0 >= 0)
                        .then_some(p.leader_id.0),
                })
                .collect();
            partitions.sort_by_key(|p| p.partition);
            next.topic_errors.remove(&name);
            next.topics.insert(
                name.clone(),
                PartitionMap {
                    topic: name,
                    partitions,
                },
            );
        }
        next.fetched_at = Instant::now();
        next
    }

    /// Snapshot with one topic forgotten, forcing a refresh on next use
    pub fn without_topic(&self, topic: &str) -> Self {
        let mut next = self.clone();
        next.topics.remove(topic);
        next
    }

    pub fn topic(&self, topic: &str) -> Option<&PartitionMap> {
        self.topics.get(topic)
    }

    pub fn broker(&self, node_id: NodeId) -> Option<&BrokerAddress> {
        self.brokers.get(&node_id)
    }
}
