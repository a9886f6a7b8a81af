// Message types shared by the client components
//
// Two groups of types live here:
// - Records as the caller sees them (ProducerRecord in, RecordMetadata and
//   ConsumerRecord out) plus TopicPartition addressing.
// - KafkaRequest / KafkaResponse: one variant per API the client speaks,
//   wrapping the kafka-protocol structs so the connection layer can route and
//   version them without knowing what is inside.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use kafka_protocol::messages::{
    FetchRequest, FetchResponse, FindCoordinatorRequest, FindCoordinatorResponse,
    HeartbeatRequest, HeartbeatResponse, JoinGroupRequest, JoinGroupResponse, LeaveGroupRequest,
    LeaveGroupResponse, ListOffsetsRequest, ListOffsetsResponse, MetadataRequest,
    MetadataResponse, OffsetCommitRequest, OffsetCommitResponse, OffsetFetchRequest,
    OffsetFetchResponse, ProduceRequest, ProduceResponse, SyncGroupRequest, SyncGroupResponse,
};

use super::constants::*;
use super::error::{KafkaError, Result};

/// Broker node identifier. Bootstrap entries use negative ids until the real
/// ids are learned from metadata.
pub type NodeId = i32;

/// Partition address
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// Kafka record header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHeader {
    pub key: String,
    pub value: Vec<u8>,
}

/// A record handed to the producer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerRecord {
    pub topic: String,
    /// Explicit partition; None lets the partitioner decide
    pub partition: Option<i32>,
    pub key: Option<Vec<u8>>,
    pub value: Vec<u8>,
    pub headers: Vec<RecordHeader>,
    /// Produce timestamp (milliseconds since epoch)
    pub timestamp: i64,
}

impl ProducerRecord {
    pub fn new(topic: impl Into<String>, key: Option<Vec<u8>>, value: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            partition: None,
            key,
            value,
            headers: Vec::new(),
            timestamp: now_millis(),
        }
    }

    pub fn with_partition(mut self, partition: i32) -> Self {
        self.partition = Some(partition);
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.headers.push(RecordHeader {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    /// Approximate size of this record inside a v2 RecordBatch
    pub fn encoded_size(&self) -> usize {
        let headers: usize = self
            .headers
            .iter()
            .map(|h| h.key.len() + h.value.len() + 2)
            .sum();
        RECORD_OVERHEAD_BYTES + self.key.as_ref().map_or(0, Vec::len) + self.value.len() + headers
    }
}

/// Acknowledgement of a produced record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMetadata {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub timestamp: i64,
}

/// A record returned by the consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
    pub headers: Vec<RecordHeader>,
    pub timestamp: i64,
}

impl ConsumerRecord {
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }
}

pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Generates the request/response enums, their API key/version tables and
/// typed accessors from a single list so the three can never drift.
macro_rules! kafka_messages {
    ($($variant:ident($req:ty, $resp:ty) = $key:ident @ $version:ident, $into:ident;)*) => {
        /// A request the client sends, tagged with the API it belongs to
        #[derive(Debug, Clone)]
        pub enum KafkaRequest {
            $($variant($req),)*
        }

        /// A decoded broker response
        #[derive(Debug, Clone)]
        pub enum KafkaResponse {
            $($variant($resp),)*
        }

        impl KafkaRequest {
            pub fn api_key(&self) -> i16 {
                match self {
                    $(KafkaRequest::$variant(_) => $key,)*
                }
            }

            /// The version this client encodes the request at
            pub fn api_version(&self) -> i16 {
                match self {
                    $(KafkaRequest::$variant(_) => $version,)*
                }
            }
        }

        impl KafkaResponse {
            pub fn api_key(&self) -> i16 {
                match self {
                    $(KafkaResponse::$variant(_) => $key,)*
                }
            }

            $(
                pub fn $into(self) -> Result<$resp> {
                    match self {
                        KafkaResponse::$variant(response) => Ok(response),
                        other => Err(KafkaError::Internal(format!(
                            "expected {} response, got {}",
                            api_name($key),
                            api_name(other.api_key())
                        ))),
                    }
                }
            )*
        }
    };
}

kafka_messages! {
    Produce(ProduceRequest, ProduceResponse) = API_KEY_PRODUCE @ PRODUCE_VERSION, into_produce;
    Fetch(FetchRequest, FetchResponse) = API_KEY_FETCH @ FETCH_VERSION, into_fetch;
    ListOffsets(ListOffsetsRequest, ListOffsetsResponse) = API_KEY_LIST_OFFSETS @ LIST_OFFSETS_VERSION, into_list_offsets;
    Metadata(MetadataRequest, MetadataResponse) = API_KEY_METADATA @ METADATA_VERSION, into_metadata;
    OffsetCommit(OffsetCommitRequest, OffsetCommitResponse) = API_KEY_OFFSET_COMMIT @ OFFSET_COMMIT_VERSION, into_offset_commit;
    OffsetFetch(OffsetFetchRequest, OffsetFetchResponse) = API_KEY_OFFSET_FETCH @ OFFSET_FETCH_VERSION, into_offset_fetch;
    FindCoordinator(FindCoordinatorRequest, FindCoordinatorResponse) = API_KEY_FIND_COORDINATOR @ FIND_COORDINATOR_VERSION, into_find_coordinator;
    JoinGroup(JoinGroupRequest, JoinGroupResponse) = API_KEY_JOIN_GROUP @ JOIN_GROUP_VERSION, into_join_group;
    SyncGroup(SyncGroupRequest, SyncGroupResponse) = API_KEY_SYNC_GROUP @ SYNC_GROUP_VERSION, into_sync_group;
    Heartbeat(HeartbeatRequest, HeartbeatResponse) = API_KEY_HEARTBEAT @ HEARTBEAT_VERSION, into_heartbeat;
    LeaveGroup(LeaveGroupRequest, LeaveGroupResponse) = API_KEY_LEAVE_GROUP @ LEAVE_GROUP_VERSION, into_leave_group;
}

impl KafkaResponse {
    /// Topics whose partitions came back with "not leader" / "unknown topic"
    /// style errors. The connection manager invalidates metadata for these.
    pub fn stale_metadata_topics(&self) -> Vec<String> {
        let mut topics = Vec::new();
        match self {
            KafkaResponse::Produce(r) => {
                for t in &r.responses {
                    if t.partition_responses
                        .iter()
                        .any(|p| is_metadata_error_code(p.error_code))
                    {
                        topics.push(t.name.to_string());
                    }
                }
            }
            KafkaResponse::Fetch(r) => {
                for t in &r.responses {
                    if t.partitions.iter().any(|p| is_metadata_error_code(p.error_code)) {
                        topics.push(t.topic.to_string());
                    }
                }
            }
            KafkaResponse::ListOffsets(r) => {
                for t in &r.topics {
                    if t.partitions.iter().any(|p| is_metadata_error_code(p.error_code)) {
                        topics.push(t.name.to_string());
                    }
                }
            }
            _ => {}
        }
        topics
    }
}
