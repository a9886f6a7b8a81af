//! Async Kafka client
//!
//! - [`Producer`]: batches records per partition and reports each record's
//!   offset through a [`DeliveryFuture`]
//! - [`Consumer`]: joins a consumer group, fetches the partitions it is
//!   assigned and commits its progress
//! - [`ConnectionManager`]: broker sessions and cluster metadata shared by
//!   both
//!
//! Logging goes through `tracing`; install a subscriber to see it.

pub mod config; // Client, producer and consumer settings
pub mod kafka; // Protocol, connections, producer, consumer


pub use config::{Acks, ClientConfig, ConsumerConfig, OffsetReset, ProducerConfig};
pub use kafka::{
    ConnectionManager, Consumer, ConsumerRecord, ConsumerRecords, DeliveryError, DeliveryFuture,
    KafkaError, Producer, ProducerRecord, RecordHeader, RecordMetadata, Result, TopicPartition,
};
