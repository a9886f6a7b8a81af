//! Kafka protocol constants
//!
//! This module centralizes all magic numbers used by the client: API keys, the
//! API versions we speak, broker error codes and configuration defaults/ranges.
//!
//! # Terminology
//! - **API Key**: Identifies which operation/request type (e.g., 0 = Produce, 3 = Metadata)
//! - **API Version**: Identifies which version of that operation (e.g., Produce v7)

// ===== API Keys =====
// These identify the type of request being made
// See: https://kafka.apache.org/protocol.html#protocol_api_key

/// API key for Produce requests
pub const API_KEY_PRODUCE: i16 = 0;

/// API key for Fetch requests
pub const API_KEY_FETCH: i16 = 1;

/// API key for ListOffsets requests
///
/// Used to resolve earliest/latest offsets when nothing is committed
pub const API_KEY_LIST_OFFSETS: i16 = 2;

/// API key for Metadata requests
pub const API_KEY_METADATA: i16 = 3;

/// API key for OffsetCommit requests
pub const API_KEY_OFFSET_COMMIT: i16 = 8;

/// API key for OffsetFetch requests
pub const API_KEY_OFFSET_FETCH: i16 = 9;

/// API key for FindCoordinator requests
pub const API_KEY_FIND_COORDINATOR: i16 = 10;

/// API key for JoinGroup requests
pub const API_KEY_JOIN_GROUP: i16 = 11;

/// API key for Heartbeat requests
pub const API_KEY_HEARTBEAT: i16 = 12;

/// API key for LeaveGroup requests
pub const API_KEY_LEAVE_GROUP: i16 = 13;

/// API key for SyncGroup requests
pub const API_KEY_SYNC_GROUP: i16 = 14;

// ===== API Versions Spoken By The Client =====
// Every version below is the highest non-flexible one, so all requests share
// RequestHeader v1 and all responses ResponseHeader v0.

pub const PRODUCE_VERSION: i16 = 7;
pub const FETCH_VERSION: i16 = 11;
pub const LIST_OFFSETS_VERSION: i16 = 5;
pub const METADATA_VERSION: i16 = 8;
pub const OFFSET_COMMIT_VERSION: i16 = 7;
pub const OFFSET_FETCH_VERSION: i16 = 5;
pub const FIND_COORDINATOR_VERSION: i16 = 2;
pub const JOIN_GROUP_VERSION: i16 = 5;
pub const SYNC_GROUP_VERSION: i16 = 3;
pub const HEARTBEAT_VERSION: i16 = 3;
pub const LEAVE_GROUP_VERSION: i16 = 3;

// ===== Protocol Limits =====

/// Maximum frame size accepted from a broker (100MB)
pub const MAX_RESPONSE_SIZE: i32 = 100_000_000;

/// ListOffsets timestamp meaning "earliest retained offset"
pub const EARLIEST_TIMESTAMP: i64 = -2;

/// ListOffsets timestamp meaning "next offset to be written"
pub const LATEST_TIMESTAMP: i64 = -1;

/// FindCoordinator key type for consumer groups
pub const COORDINATOR_KEY_TYPE_GROUP: i8 = 0;

/// Added to the rebalance timeout when waiting for a JoinGroup answer
pub const JOIN_GROUP_TIMEOUT_SLACK_MS: u64 = 5_000;

/// Protocol type advertised in JoinGroup
pub const CONSUMER_PROTOCOL_TYPE: &str = "consumer";

/// Coordinator connections are keyed as `COORDINATOR_NODE_ID_BASE - node_id`,
/// apart from the broker's data connection.
pub const COORDINATOR_NODE_ID_BASE: i32 = i32::MAX;

// ===== Protocol Version Constants =====

/// Lookup table for header version thresholds.
///
/// Returns the minimum API version where the flexible format (tagged fields,
/// RequestHeader v2 / ResponseHeader v1) is used.
///
/// Returns None for unknown API keys (which should use the non-flexible headers).
pub fn get_flexible_format_threshold(api_key: i16) -> Option<i16> {
    match api_key {
        API_KEY_PRODUCE => Some(9),
        API_KEY_FETCH => Some(12),
        API_KEY_LIST_OFFSETS => Some(6),
        API_KEY_METADATA => Some(9),
        API_KEY_OFFSET_COMMIT => Some(8),
        API_KEY_OFFSET_FETCH => Some(6),
        API_KEY_FIND_COORDINATOR => Some(3),
        API_KEY_JOIN_GROUP => Some(6),
        API_KEY_HEARTBEAT => Some(4),
        API_KEY_LEAVE_GROUP => Some(4),
        API_KEY_SYNC_GROUP => Some(4),
        _ => None,
    }
}

/// Request header version for a given API key and version (2 = flexible, 1 otherwise).
pub fn get_request_header_version(api_key: i16, api_version: i16) -> i16 {
    match get_flexible_format_threshold(api_key) {
        Some(threshold) if api_version >= threshold => 2,
        _ => 1,
    }
}

/// Response header version for a given API key and version.
///
/// Returns 1 for flexible format (tagged fields), 0 for non-flexible format.
pub fn get_response_header_version(api_key: i16, api_version: i16) -> i16 {
    match get_flexible_format_threshold(api_key) {
        Some(threshold) if api_version >= threshold => 1,
        _ => 0,
    }
}

/// Human readable API name for logs
pub fn api_name(api_key: i16) -> &'static str {
    match api_key {
        API_KEY_PRODUCE => "Produce",
        API_KEY_FETCH => "Fetch",
        API_KEY_LIST_OFFSETS => "ListOffsets",
        API_KEY_METADATA => "Metadata",
        API_KEY_OFFSET_COMMIT => "OffsetCommit",
        API_KEY_OFFSET_FETCH => "OffsetFetch",
        API_KEY_FIND_COORDINATOR => "FindCoordinator",
        API_KEY_JOIN_GROUP => "JoinGroup",
        API_KEY_HEARTBEAT => "Heartbeat",
        API_KEY_LEAVE_GROUP => "LeaveGroup",
        API_KEY_SYNC_GROUP => "SyncGroup",
        _ => "Unknown",
    }
}

// ===== Kafka Error Codes =====
// See: https://kafka.apache.org/protocol.html#protocol_error_codes

/// No error
pub const ERROR_NONE: i16 = 0;

/// Unknown server error
pub const ERROR_UNKNOWN_SERVER_ERROR: i16 = -1;

/// Requested offset is outside the retained range
pub const ERROR_OFFSET_OUT_OF_RANGE: i16 = 1;

/// Corrupt message (invalid RecordBatch format)
pub const ERROR_CORRUPT_MESSAGE: i16 = 2;

/// Unknown topic or partition
pub const ERROR_UNKNOWN_TOPIC_OR_PARTITION: i16 = 3;

/// Leader election in progress
pub const ERROR_LEADER_NOT_AVAILABLE: i16 = 5;

/// Broker is not the leader for the partition
pub const ERROR_NOT_LEADER_OR_FOLLOWER: i16 = 6;

/// Broker-side request timeout
pub const ERROR_REQUEST_TIMED_OUT: i16 = 7;

/// Batch larger than the broker accepts
pub const ERROR_MESSAGE_TOO_LARGE: i16 = 10;

/// Broker-side network failure
pub const ERROR_NETWORK_EXCEPTION: i16 = 13;

/// Coordinator still loading group state
pub const ERROR_COORDINATOR_LOAD_IN_PROGRESS: i16 = 14;

/// Coordinator not available
pub const ERROR_COORDINATOR_NOT_AVAILABLE: i16 = 15;

/// Not coordinator for group
pub const ERROR_NOT_COORDINATOR: i16 = 16;

/// In-sync replica set too small
pub const ERROR_NOT_ENOUGH_REPLICAS: i16 = 19;

/// Written to the leader but the in-sync set shrank before replication
pub const ERROR_NOT_ENOUGH_REPLICAS_AFTER_APPEND: i16 = 20;

/// Illegal generation (consumer group generation mismatch)
pub const ERROR_ILLEGAL_GENERATION: i16 = 22;

/// Member protocols share no common assignment strategy
pub const ERROR_INCONSISTENT_GROUP_PROTOCOL: i16 = 23;

/// Unknown member ID
pub const ERROR_UNKNOWN_MEMBER_ID: i16 = 25;

/// Rebalance in progress
pub const ERROR_REBALANCE_IN_PROGRESS: i16 = 27;

/// First JoinGroup must be retried with the member id the broker returned
pub const ERROR_MEMBER_ID_REQUIRED: i16 = 79;

/// Whether a broker error code is transient and worth retrying
pub fn is_retriable_error_code(code: i16) -> bool {
    matches!(
        code,
        ERROR_CORRUPT_MESSAGE
            | ERROR_UNKNOWN_TOPIC_OR_PARTITION
            | ERROR_LEADER_NOT_AVAILABLE
            | ERROR_NOT_LEADER_OR_FOLLOWER
            | ERROR_REQUEST_TIMED_OUT
            | ERROR_NETWORK_EXCEPTION
            | ERROR_COORDINATOR_LOAD_IN_PROGRESS
            | ERROR_COORDINATOR_NOT_AVAILABLE
            | ERROR_NOT_COORDINATOR
            | ERROR_NOT_ENOUGH_REPLICAS
            | ERROR_NOT_ENOUGH_REPLICAS_AFTER_APPEND
    )
}

/// Whether a broker error code means our view of the cluster is stale
pub fn is_metadata_error_code(code: i16) -> bool {
    matches!(
        code,
        ERROR_UNKNOWN_TOPIC_OR_PARTITION | ERROR_LEADER_NOT_AVAILABLE | ERROR_NOT_LEADER_OR_FOLLOWER
    )
}

// ===== Connection Defaults =====

/// Default bootstrap address
pub const DEFAULT_BOOTSTRAP_SERVERS: &str = "localhost:9092";

/// Default client id sent in every request header
pub const DEFAULT_CLIENT_ID: &str = "pg-kafka-client";

/// Default request timeout (milliseconds)
pub const DEFAULT_REQUEST_TIMEOUT_MS: i32 = 30_000;
pub const MIN_REQUEST_TIMEOUT_MS: i32 = 10;
pub const MAX_REQUEST_TIMEOUT_MS: i32 = 600_000;

/// Default idle teardown for broker connections (milliseconds)
pub const DEFAULT_CONNECTIONS_MAX_IDLE_MS: i32 = 540_000;
pub const MIN_CONNECTIONS_MAX_IDLE_MS: i32 = 100;
pub const MAX_CONNECTIONS_MAX_IDLE_MS: i32 = 3_600_000;

/// Default periodic metadata refresh (milliseconds)
pub const DEFAULT_METADATA_MAX_AGE_MS: i32 = 300_000;
pub const MIN_METADATA_MAX_AGE_MS: i32 = 100;
pub const MAX_METADATA_MAX_AGE_MS: i32 = 3_600_000;

// ===== Retry Defaults =====

/// Default retry attempts (connection and produce)
pub const DEFAULT_RETRIES: i32 = 5;
pub const MIN_RETRIES: i32 = 0;
pub const MAX_RETRIES: i32 = 100;

/// Default base retry backoff (milliseconds)
pub const DEFAULT_RETRY_BACKOFF_MS: i32 = 100;
pub const MIN_RETRY_BACKOFF_MS: i32 = 1;
pub const MAX_RETRY_BACKOFF_MS: i32 = 60_000;

/// Default retry backoff cap (milliseconds)
pub const DEFAULT_RETRY_BACKOFF_MAX_MS: i32 = 1_000;

/// Exponential backoff multiplier
pub const DEFAULT_RETRY_BACKOFF_MULTIPLIER: u32 = 2;

// ===== Producer Defaults =====

/// Default max batch size (bytes)
pub const DEFAULT_BATCH_SIZE: i32 = 16_384;
pub const MIN_BATCH_SIZE: i32 = 1;
pub const MAX_BATCH_SIZE: i32 = 16_777_216;

/// Default max records per batch
pub const DEFAULT_BATCH_NUM_MESSAGES: i32 = 500;
pub const MIN_BATCH_NUM_MESSAGES: i32 = 1;
pub const MAX_BATCH_NUM_MESSAGES: i32 = 1_000_000;

/// Default linger time (milliseconds)
pub const DEFAULT_LINGER_MS: i32 = 10;
pub const MIN_LINGER_MS: i32 = 0;
pub const MAX_LINGER_MS: i32 = 60_000;

/// Default max unacknowledged batches per partition
pub const DEFAULT_MAX_IN_FLIGHT: i32 = 5;
pub const MIN_MAX_IN_FLIGHT: i32 = 1;
pub const MAX_MAX_IN_FLIGHT: i32 = 100;

/// Per-record framing overhead used when estimating batch size
///
/// Covers the varint length, attributes, deltas and header count of a v2 record.
pub const RECORD_OVERHEAD_BYTES: usize = 21;

// ===== Consumer Defaults =====

/// Default group session timeout (milliseconds)
pub const DEFAULT_SESSION_TIMEOUT_MS: i32 = 10_000;
pub const MIN_SESSION_TIMEOUT_MS: i32 = 10;
pub const MAX_SESSION_TIMEOUT_MS: i32 = 300_000;

/// Default heartbeat interval (milliseconds)
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: i32 = 3_000;

/// Default rebalance timeout (milliseconds)
pub const DEFAULT_REBALANCE_TIMEOUT_MS: i32 = 30_000;

/// Default auto-commit interval (milliseconds)
pub const DEFAULT_AUTO_COMMIT_INTERVAL_MS: i32 = 5_000;
pub const MIN_AUTO_COMMIT_INTERVAL_MS: i32 = 0;
pub const MAX_AUTO_COMMIT_INTERVAL_MS: i32 = 3_600_000;

/// Default broker long-poll wait for fetches (milliseconds)
pub const DEFAULT_FETCH_MAX_WAIT_MS: i32 = 500;
pub const MIN_FETCH_MAX_WAIT_MS: i32 = 0;
pub const MAX_FETCH_MAX_WAIT_MS: i32 = 60_000;

/// Default max bytes per fetch response
pub const DEFAULT_FETCH_MAX_BYTES: i32 = 52_428_800;

/// Default max bytes per partition in a fetch response
pub const DEFAULT_MAX_PARTITION_FETCH_BYTES: i32 = 1_048_576;

/// Default partition assignment strategy
pub const DEFAULT_ASSIGNMENT_STRATEGY: &str = "range";

// ===== Compression =====

use kafka_protocol::records::Compression;

/// Parse a compression type string into a Compression enum.
///
/// Supports: none, gzip, snappy, lz4, zstd (case-insensitive).
/// Returns None for anything else so config validation can reject it.
pub fn parse_compression_type(s: &str) -> Option<Compression> {
    match s.to_lowercase().as_str() {
        "gzip" => Some(Compression::Gzip),
        "snappy" => Some(Compression::Snappy),
        "lz4" => Some(Compression::Lz4),
        "zstd" => Some(Compression::Zstd),
        "none" | "" => Some(Compression::None),
        _ => None,
    }
}
