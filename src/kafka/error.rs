//! Kafka client error types
//!
//! One error enum for the whole client. The first six variants are the
//! client-facing taxonomy (connect, transport, metadata, delivery, commit,
//! cancelled); the rest cover codec, configuration and broker-reported failures.

use std::sync::Arc;

use thiserror::Error;

use crate::kafka::constants::{
    is_metadata_error_code, is_retriable_error_code, ERROR_COORDINATOR_LOAD_IN_PROGRESS,
    ERROR_COORDINATOR_NOT_AVAILABLE, ERROR_CORRUPT_MESSAGE, ERROR_ILLEGAL_GENERATION,
    ERROR_NOT_COORDINATOR, ERROR_REBALANCE_IN_PROGRESS, ERROR_UNKNOWN_MEMBER_ID,
    ERROR_UNKNOWN_SERVER_ERROR, ERROR_UNKNOWN_TOPIC_OR_PARTITION,
};
use crate::kafka::messages::ProducerRecord;

/// Errors that can occur during Kafka client operations
#[derive(Error, Debug)]
pub enum KafkaError {
    /// Bootstrap or broker unreachable after the retry budget was spent
    #[error("Connect error: {0}")]
    Connect(String),

    /// Transient network failure (reset, timeout, closed connection)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Cluster metadata is missing or stale for a topic/partition
    #[error("Metadata error for {topic}: {message}")]
    Metadata { topic: String, message: String },

    /// A produce batch exhausted its retries or failed terminally
    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    /// Offset commit (or commit-related lookup) failed
    #[error("Commit error: {0}")]
    Commit(String),

    /// Caller cancelled the operation
    #[error("Operation cancelled")]
    Cancelled,

    /// Producer or consumer already closed
    #[error("Client closed")]
    ClientClosed,

    /// IO error occurred during network operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Error encoding or decoding protocol messages
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Malformed consumer-protocol or record payload
    #[error("Corrupt message: {message}")]
    CorruptMessage { message: String },

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Kafka protocol error code returned by a broker
    #[error("Kafka error code {code}: {message}")]
    Protocol { code: i16, message: String },

    /// Error from kafka-protocol crate (anyhow::Error)
    #[error("Protocol encoding/decoding error: {0}")]
    ProtocolCodec(#[from] anyhow::Error),

    /// Consumer group coordinator error
    #[error("Coordinator error (code {0}): {1}")]
    CoordinatorError(i16, String),

    /// Topic does not exist
    #[error("Topic not found: {0}")]
    TopicNotFound(String),

    /// Broken internal invariant (closed channel, wrong response variant)
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Terminal failure of one produce batch.
///
/// Carries every record of the batch so the caller can requeue or log them.
#[derive(Error, Debug, Clone)]
#[error("Delivery to {topic}-{partition} failed after {attempts} attempt(s): {reason}")]
pub struct DeliveryError {
    pub topic: String,
    pub partition: i32,
    pub attempts: u32,
    pub reason: String,
    pub records: Arc<Vec<ProducerRecord>>,
}

impl KafkaError {
    /// Map a broker error code into the client taxonomy
    pub fn from_code(code: i16, context: impl Into<String>) -> Self {
        let context = context.into();
        match code {
            ERROR_UNKNOWN_TOPIC_OR_PARTITION => KafkaError::TopicNotFound(context),
            c if is_metadata_error_code(c) => KafkaError::Metadata {
                topic: context,
                message: format!("broker returned error code {}", c),
            },
            ERROR_COORDINATOR_NOT_AVAILABLE
            | ERROR_COORDINATOR_LOAD_IN_PROGRESS
            | ERROR_NOT_COORDINATOR
            | ERROR_ILLEGAL_GENERATION
            | ERROR_UNKNOWN_MEMBER_ID
            | ERROR_REBALANCE_IN_PROGRESS => KafkaError::CoordinatorError(code, context),
            _ => KafkaError::Protocol {
                code,
                message: context,
            },
        }
    }

    /// Whether retrying the same operation may succeed
    pub fn is_retriable(&self) -> bool {
        match self {
            KafkaError::Transport(_)
            | KafkaError::Metadata { .. }
            | KafkaError::TopicNotFound(_)
            | KafkaError::Io(_) => true,
            KafkaError::Protocol { code, .. } | KafkaError::CoordinatorError(code, _) => {
                is_retriable_error_code(*code)
            }
            KafkaError::Connect(_)
            | KafkaError::Delivery(_)
            | KafkaError::Commit(_)
            | KafkaError::Cancelled
            | KafkaError::ClientClosed
            | KafkaError::Encoding(_)
            | KafkaError::CorruptMessage { .. }
            | KafkaError::InvalidConfig(_)
            | KafkaError::ProtocolCodec(_)
            | KafkaError::Internal(_) => false,
        }
    }

    /// Whether the failure should invalidate cached cluster metadata
    pub fn invalidates_metadata(&self) -> bool {
        match self {
            KafkaError::Transport(_)
            | KafkaError::Io(_)
            | KafkaError::Metadata { .. }
            | KafkaError::TopicNotFound(_) => true,
            KafkaError::Protocol { code, .. } => is_metadata_error_code(*code),
            _ => false,
        }
    }

    /// Convert this error to a Kafka protocol error code
    ///
    /// Used by the test broker to answer with the code a failure stands for.
    pub fn to_kafka_error_code(&self) -> i16 {
        match self {
            KafkaError::TopicNotFound(_) => ERROR_UNKNOWN_TOPIC_OR_PARTITION,
            KafkaError::CoordinatorError(code, _) => *code,
            KafkaError::Protocol { code, .. } => *code,
            KafkaError::CorruptMessage { .. } => ERROR_CORRUPT_MESSAGE,
            _ => ERROR_UNKNOWN_SERVER_ERROR,
        }
    }
}

/// Result type alias for Kafka operations
pub type Result<T> = std::result::Result<T, KafkaError>;
