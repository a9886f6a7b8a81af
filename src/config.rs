// Configuration module for pg_kafka_client
//
// Client settings are plain structs with defaults taken from the constants
// module. `from_properties` accepts the familiar Kafka-style keys
// ("bootstrap.servers", "linger.ms", ...) so applications can pass through
// whatever they already have in a properties file or environment.
//
// Three layers:
// - ClientConfig: shared by producer and consumer (bootstrap, timeouts, retries)
// - ProducerConfig: batching, in-flight limit, acks, compression
// - ConsumerConfig: group membership, offsets, fetch sizing

use std::time::Duration;

use kafka_protocol::records::Compression;
use tracing::warn;

use crate::kafka::backoff::BackoffPolicy;
use crate::kafka::constants::*;
use crate::kafka::error::{KafkaError, Result};

/// Producer acknowledgement level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acks {
    /// Leader wrote the batch (acks=1)
    Leader,
    /// All in-sync replicas wrote the batch (acks=-1)
    All,
}

impl Acks {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "1" | "leader" => Some(Acks::Leader),
            "all" | "-1" => Some(Acks::All),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Acks::Leader => "1",
            Acks::All => "all",
        }
    }

    /// Wire value for ProduceRequest.acks
    pub fn as_i16(&self) -> i16 {
        match self {
            Acks::Leader => 1,
            Acks::All => -1,
        }
    }
}

/// Where a consumer starts when the group has no committed offset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetReset {
    Earliest,
    Latest,
}

impl OffsetReset {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "earliest" | "smallest" | "beginning" => Some(OffsetReset::Earliest),
            "latest" | "largest" | "end" => Some(OffsetReset::Latest),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OffsetReset::Earliest => "earliest",
            OffsetReset::Latest => "latest",
        }
    }

    /// ListOffsets timestamp that resolves this policy
    pub fn timestamp(&self) -> i64 {
        match self {
            OffsetReset::Earliest => EARLIEST_TIMESTAMP,
            OffsetReset::Latest => LATEST_TIMESTAMP,
        }
    }
}

/// Settings shared by every client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// host:port entries used to discover the cluster
    pub bootstrap_servers: Vec<String>,
    pub client_id: String,
    pub request_timeout: Duration,
    /// Connections unused for this long are closed
    pub connections_max_idle: Duration,
    /// Metadata is refreshed at least this often
    pub metadata_max_age: Duration,
    pub retries: u32,
    pub retry_backoff: Duration,
    pub retry_backoff_max: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: split_servers(DEFAULT_BOOTSTRAP_SERVERS),
            client_id: DEFAULT_CLIENT_ID.to_string(),
            request_timeout: millis(DEFAULT_REQUEST_TIMEOUT_MS),
            connections_max_idle: millis(DEFAULT_CONNECTIONS_MAX_IDLE_MS),
            metadata_max_age: millis(DEFAULT_METADATA_MAX_AGE_MS),
            retries: DEFAULT_RETRIES as u32,
            retry_backoff: millis(DEFAULT_RETRY_BACKOFF_MS),
            retry_backoff_max: millis(DEFAULT_RETRY_BACKOFF_MAX_MS),
        }
    }
}

impl ClientConfig {
    pub fn new(bootstrap_servers: &str) -> Self {
        Self {
            bootstrap_servers: split_servers(bootstrap_servers),
            ..Self::default()
        }
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    /// Backoff shared by reconnects and produce retries
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            self.retries,
            self.retry_backoff,
            DEFAULT_RETRY_BACKOFF_MULTIPLIER,
            self.retry_backoff_max,
        )
    }

    pub fn validate(&self) -> Result<()> {
        if self.bootstrap_servers.is_empty() {
            return Err(KafkaError::InvalidConfig(
                "bootstrap.servers must name at least one broker".to_string(),
            ));
        }
        for server in &self.bootstrap_servers {
            if !server.contains(':') {
                return Err(KafkaError::InvalidConfig(format!(
                    "bootstrap server '{}' is not host:port",
                    server
                )));
            }
        }
        Ok(())
    }

    /// Apply one key. Returns false when the key is not a client key.
    fn apply(&mut self, key: &str, value: &str) -> Result<bool> {
        match key {
            "bootstrap.servers" => self.bootstrap_servers = split_servers(value),
            "client.id" => self.client_id = value.to_string(),
            "request.timeout.ms" => {
                self.request_timeout = parse_millis(
                    key,
                    value,
                    MIN_REQUEST_TIMEOUT_MS,
                    MAX_REQUEST_TIMEOUT_MS,
                )?
            }
            "connections.max.idle.ms" => {
                self.connections_max_idle = parse_millis(
                    key,
                    value,
                    MIN_CONNECTIONS_MAX_IDLE_MS,
                    MAX_CONNECTIONS_MAX_IDLE_MS,
                )?
            }
            "metadata.max.age.ms" => {
                self.metadata_max_age =
                    parse_millis(key, value, MIN_METADATA_MAX_AGE_MS, MAX_METADATA_MAX_AGE_MS)?
            }
            "retries" => self.retries = parse_ranged(key, value, MIN_RETRIES, MAX_RETRIES)? as u32,
            "retry.backoff.ms" => {
                self.retry_backoff =
                    parse_millis(key, value, MIN_RETRY_BACKOFF_MS, MAX_RETRY_BACKOFF_MS)?
            }
            "retry.backoff.max.ms" => {
                self.retry_backoff_max =
                    parse_millis(key, value, MIN_RETRY_BACKOFF_MS, MAX_RETRY_BACKOFF_MS)?
            }
            _ => return Ok(false),
        }
        Ok(true)
    }
}

/// Producer settings
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    pub client: ClientConfig,
    /// A batch seals once its estimated size reaches this many bytes
    pub batch_size: usize,
    /// A batch seals once it holds this many records
    pub batch_num_messages: usize,
    /// A batch seals this long after its first record
    pub linger: Duration,
    /// Unacknowledged batches allowed per partition
    pub max_in_flight: usize,
    pub acks: Acks,
    pub compression: Compression,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            client: ClientConfig::default(),
            batch_size: DEFAULT_BATCH_SIZE as usize,
            batch_num_messages: DEFAULT_BATCH_NUM_MESSAGES as usize,
            linger: millis(DEFAULT_LINGER_MS),
            max_in_flight: DEFAULT_MAX_IN_FLIGHT as usize,
            acks: Acks::All,
            compression: Compression::None,
        }
    }
}

impl ProducerConfig {
    pub fn new(client: ClientConfig) -> Self {
        Self {
            client,
            ..Self::default()
        }
    }

    pub fn from_properties<I, K, V>(props: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        for (key, value) in props {
            let (key, value) = (key.as_ref(), value.as_ref().trim());
            if config.client.apply(key, value)? {
                continue;
            }
            match key {
                "batch.size" => {
                    config.batch_size =
                        parse_ranged(key, value, MIN_BATCH_SIZE, MAX_BATCH_SIZE)? as usize
                }
                "batch.num.messages" => {
                    config.batch_num_messages = parse_ranged(
                        key,
                        value,
                        MIN_BATCH_NUM_MESSAGES,
                        MAX_BATCH_NUM_MESSAGES,
                    )? as usize
                }
                "linger.ms" => {
                    config.linger = parse_millis(key, value, MIN_LINGER_MS, MAX_LINGER_MS)?
                }
                "max.in.flight.requests.per.partition" | "max.in.flight" => {
                    config.max_in_flight =
                        parse_ranged(key, value, MIN_MAX_IN_FLIGHT, MAX_MAX_IN_FLIGHT)? as usize
                }
                "acks" => {
                    config.acks = Acks::parse(value).ok_or_else(|| invalid(key, value))?
                }
                "compression.type" | "compression.codec" => {
                    config.compression =
                        parse_compression_type(value).ok_or_else(|| invalid(key, value))?
                }
                _ => warn!("Ignoring unknown producer property '{}'", key),
            }
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.client.validate()?;
        if self.batch_num_messages == 0 || self.batch_size == 0 {
            return Err(KafkaError::InvalidConfig(
                "batch limits must be positive".to_string(),
            ));
        }
        if self.max_in_flight == 0 {
            return Err(KafkaError::InvalidConfig(
                "max.in.flight.requests.per.partition must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Consumer settings
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub client: ClientConfig,
    /// Default group for `subscribe` calls that do not name one
    pub group_id: Option<String>,
    pub session_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub rebalance_timeout: Duration,
    pub auto_offset_reset: OffsetReset,
    pub enable_auto_commit: bool,
    pub auto_commit_interval: Duration,
    /// Broker-side long-poll wait per fetch
    pub fetch_max_wait: Duration,
    pub fetch_min_bytes: i32,
    pub fetch_max_bytes: i32,
    pub max_partition_fetch_bytes: i32,
    /// Strategy names offered to the group, in preference order
    pub assignment_strategies: Vec<String>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            client: ClientConfig::default(),
            group_id: None,
            session_timeout: millis(DEFAULT_SESSION_TIMEOUT_MS),
            heartbeat_interval: millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
            rebalance_timeout: millis(DEFAULT_REBALANCE_TIMEOUT_MS),
            auto_offset_reset: OffsetReset::Latest,
            enable_auto_commit: true,
            auto_commit_interval: millis(DEFAULT_AUTO_COMMIT_INTERVAL_MS),
            fetch_max_wait: millis(DEFAULT_FETCH_MAX_WAIT_MS),
            fetch_min_bytes: 1,
            fetch_max_bytes: DEFAULT_FETCH_MAX_BYTES,
            max_partition_fetch_bytes: DEFAULT_MAX_PARTITION_FETCH_BYTES,
            assignment_strategies: vec![DEFAULT_ASSIGNMENT_STRATEGY.to_string()],
        }
    }
}

impl ConsumerConfig {
    pub fn new(client: ClientConfig) -> Self {
        Self {
            client,
            ..Self::default()
        }
    }

    pub fn from_properties<I, K, V>(props: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        for (key, value) in props {
            let (key, value) = (key.as_ref(), value.as_ref().trim());
            if config.client.apply(key, value)? {
                continue;
            }
            match key {
                "group.id" => config.group_id = Some(value.to_string()),
                "session.timeout.ms" => {
                    config.session_timeout =
                        parse_millis(key, value, MIN_SESSION_TIMEOUT_MS, MAX_SESSION_TIMEOUT_MS)?
                }
                "heartbeat.interval.ms" => {
                    config.heartbeat_interval =
                        parse_millis(key, value, 1, MAX_SESSION_TIMEOUT_MS)?
                }
                "rebalance.timeout.ms" | "max.poll.interval.ms" => {
                    config.rebalance_timeout =
                        parse_millis(key, value, MIN_SESSION_TIMEOUT_MS, i32::MAX)?
                }
                "auto.offset.reset" => {
                    config.auto_offset_reset =
                        OffsetReset::parse(value).ok_or_else(|| invalid(key, value))?
                }
                "enable.auto.commit" => {
                    config.enable_auto_commit = match value.to_lowercase().as_str() {
                        "true" => true,
                        "false" => false,
                        _ => return Err(invalid(key, value)),
                    }
                }
                "auto.commit.interval.ms" => {
                    config.auto_commit_interval = parse_millis(
                        key,
                        value,
                        MIN_AUTO_COMMIT_INTERVAL_MS,
                        MAX_AUTO_COMMIT_INTERVAL_MS,
                    )?
                }
                "fetch.max.wait.ms" => {
                    config.fetch_max_wait =
                        parse_millis(key, value, MIN_FETCH_MAX_WAIT_MS, MAX_FETCH_MAX_WAIT_MS)?
                }
                "fetch.min.bytes" => config.fetch_min_bytes = parse_ranged(key, value, 0, i32::MAX)?,
                "fetch.max.bytes" => config.fetch_max_bytes = parse_ranged(key, value, 1, i32::MAX)?,
                "max.partition.fetch.bytes" => {
                    config.max_partition_fetch_bytes = parse_ranged(key, value, 1, i32::MAX)?
                }
                "partition.assignment.strategy" => {
                    config.assignment_strategies = value
                        .split(',')
                        .map(|s| s.trim().to_lowercase())
                        .filter(|s| !s.is_empty())
                        .collect()
                }
                _ => warn!("Ignoring unknown consumer property '{}'", key),
            }
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.client.validate()?;
        if self.heartbeat_interval >= self.session_timeout {
            return Err(KafkaError::InvalidConfig(format!(
                "heartbeat.interval.ms ({:?}) must be lower than session.timeout.ms ({:?})",
                self.heartbeat_interval, self.session_timeout
            )));
        }
        if self.assignment_strategies.is_empty() {
            return Err(KafkaError::InvalidConfig(
                "partition.assignment.strategy must name at least one strategy".to_string(),
            ));
        }
        for name in &self.assignment_strategies {
            if crate::kafka::assignment::create_strategy(name).is_none() {
                return Err(KafkaError::InvalidConfig(format!(
                    "unknown partition.assignment.strategy '{}'",
                    name
                )));
            }
        }
        Ok(())
    }
}

fn split_servers(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn millis(ms: i32) -> Duration {
    Duration::from_millis(ms.max(0) as u64)
}

fn invalid(key: &str, value: &str) -> KafkaError {
    KafkaError::InvalidConfig(format!("invalid value '{}' for {}", value, key))
}

fn parse_ranged(key: &str, value: &str, min: i32, max: i32) -> Result<i32> {
    let parsed: i32 = value.parse().map_err(|_| invalid(key, value))?;
    if parsed < min || parsed > max {
        return Err(KafkaError::InvalidConfig(format!(
            "{} = {} is outside [{}, {}]",
            key, parsed, min, max
        )));
    }
    Ok(parsed)
}

fn parse_millis(key: &str, value: &str, min: i32, max: i32) -> Result<Duration> {
    parse_ranged(key, value, min, max).map(millis)
}
