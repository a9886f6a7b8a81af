// Kafka client implementation
//
// Architecture Overview:
// =====================
//
//   Producer ──┐                       ┌── BrokerConnection (node 1)
//              ├── ConnectionManager ──┼── BrokerConnection (node 2)
//   Consumer ──┘        │              └── coordinator connection
//      │                │
//      └── PartitionAssigner (group membership, heartbeats)
//
// - connection: one multiplexed session per broker, metadata cache, retries
// - producer: per-partition batching, ordered in-flight sends, delivery futures
// - assignment: JoinGroup/SyncGroup/Heartbeat/LeaveGroup and the leader-side
//   strategies
// - consumer: positions, fetch rounds, offset commits
// - protocol: kafka-protocol framing plus the v2 RecordBatch codec
//
// Everything runs on the caller's tokio runtime; background work (send loop,
// heartbeats, connection readers) lives in spawned tasks that stop on close.

pub mod assignment;
pub mod backoff;
pub mod connection;
pub mod constants;
pub mod consumer;
pub mod error;
pub mod messages;
pub mod partitioner;
pub mod producer;
pub mod protocol;

// Re-export commonly used types for convenience
pub use connection::ConnectionManager;
pub use consumer::{Consumer, ConsumerRecords};
pub use error::{DeliveryError, KafkaError, Result};
pub use messages::{ConsumerRecord, ProducerRecord, RecordHeader, RecordMetadata, TopicPartition};
pub use producer::{DeliveryFuture, Producer};
