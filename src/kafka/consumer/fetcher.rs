// Fetch rounds
//
// One round sends a single Fetch per leader covering every fetchable
// partition it leads, all leaders in parallel, and waits for all of them.
// The broker long-polls each request for up to `max_wait` when it has less
// than `min_bytes` to return, so an idle round costs one wait, not a spin.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use kafka_protocol::messages::fetch_request::{FetchPartition, FetchTopic};
use kafka_protocol::messages::{BrokerId, FetchRequest, TopicName};
use kafka_protocol::protocol::StrBytes;
use tracing::{debug, trace, warn};

use crate::config::ConsumerConfig;
use crate::kafka::connection::ConnectionManager;
use crate::kafka::constants::*;
use crate::kafka::error::KafkaError;
use crate::kafka::messages::{ConsumerRecord, KafkaRequest, NodeId, TopicPartition};
use crate::kafka::protocol::{decode_fetched, FetchedRecords};

/// Fetch sizing taken from the consumer config
#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub min_bytes: i32,
    pub max_bytes: i32,
    pub partition_max_bytes: i32,
}

impl FetchSettings {
    pub fn from_consumer_config(config: &ConsumerConfig) -> Self {
        Self {
            min_bytes: config.fetch_min_bytes,
            max_bytes: config.fetch_max_bytes,
            partition_max_bytes: config.max_partition_fetch_bytes,
        }
    }
}

/// Result of fetching one partition
#[derive(Debug)]
pub enum PartitionFetch {
    /// Records at or after the requested position, in offset order
    Records {
        records: Vec<ConsumerRecord>,
        /// Offset after the last complete batch, control batches included
        next_offset: Option<i64>,
        high_watermark: i64,
    },
    /// The position is outside the log; reset it
    OutOfRange,
    Failed(KafkaError),
}

pub struct Fetcher {
    manager: Arc<ConnectionManager>,
    settings: FetchSettings,
}

impl Fetcher {
    pub fn new(manager: Arc<ConnectionManager>, settings: FetchSettings) -> Self {
        Self { manager, settings }
    }

    /// Fetch every partition in `positions` from its position
    pub async fn fetch(
        &self,
        positions: &BTreeMap<TopicPartition, i64>,
        max_wait: Duration,
    ) -> BTreeMap<TopicPartition, PartitionFetch> {
        let mut results = BTreeMap::new();
        let mut by_leader: BTreeMap<NodeId, Vec<(TopicPartition, i64)>> = BTreeMap::new();
        for (tp, position) in positions {
            match self.manager.leader_for(&tp.topic, tp.partition).await {
                Ok(leader) => by_leader.entry(leader).or_default().push((tp.clone(), *position)),
                Err(e) => {
                    debug!("No leader for {}: {}", tp, e);
                    results.insert(tp.clone(), PartitionFetch::Failed(e));
                }
            }
        }

        let rounds = by_leader
            .into_iter()
            .map(|(leader, partitions)| self.fetch_from(leader, partitions, max_wait));
        for outcome in join_all(rounds).await {
            results.extend(outcome);
        }
        results
    }

    async fn fetch_from(
        &self,
        leader: NodeId,
        partitions: Vec<(TopicPartition, i64)>,
        max_wait: Duration,
    ) -> Vec<(TopicPartition, PartitionFetch)> {
        let request = build_request(&self.settings, &partitions, max_wait);
        trace!("Fetch from node {} for {} partition(s)", leader, partitions.len());

        let response = match self
            .manager
            .send(leader, KafkaRequest::Fetch(request))
            .await
            .and_then(|r| r.into_fetch())
        {
            Ok(response) => response,
            Err(e) => {
                warn!("Fetch from node {} failed: {}", leader, e);
                return partitions
                    .into_iter()
                    .map(|(tp, _)| (tp, PartitionFetch::Failed(KafkaError::Transport(e.to_string()))))
                    .collect();
            }
        };
        if response.error_code != ERROR_NONE {
            let code = response.error_code;
            return partitions
                .into_iter()
                .map(|(tp, _)| {
                    let err = KafkaError::from_code(code, format!("Fetch {}", tp));
                    (tp, PartitionFetch::Failed(err))
                })
                .collect();
        }

        let requested: BTreeMap<TopicPartition, i64> = partitions.into_iter().collect();
        let mut outcomes = Vec::with_capacity(requested.len());
        for topic in response.responses {
            let name = topic.topic.0.to_string();
            for p in topic.partitions {
                let tp = TopicPartition::new(name.clone(), p.partition_index);
                let Some(position) = requested.get(&tp) else {
                    continue;
                };
                outcomes.push((tp.clone(), self.partition_outcome(&tp, *position, p)));
            }
        }
        outcomes
    }

    fn partition_outcome(
        &self,
        tp: &TopicPartition,
        position: i64,
        data: kafka_protocol::messages::fetch_response::PartitionData,
    ) -> PartitionFetch {
        match data.error_code {
            ERROR_NONE => {}
            ERROR_OFFSET_OUT_OF_RANGE => return PartitionFetch::OutOfRange,
            code => {
                return PartitionFetch::Failed(KafkaError::from_code(code, format!("Fetch {}", tp)))
            }
        }
        let fetched = match data.records {
            Some(bytes) if !bytes.is_empty() => {
                match decode_fetched(&tp.topic, tp.partition, &bytes, position) {
                    Ok(fetched) => fetched,
                    Err(e) => return PartitionFetch::Failed(e),
                }
            }
            _ => FetchedRecords::default(),
        };
        PartitionFetch::Records {
            records: fetched.records,
            next_offset: fetched.next_offset,
            high_watermark: data.high_watermark,
        }
    }
}

fn build_request(
    settings: &FetchSettings,
    partitions: &[(TopicPartition, i64)],
    max_wait: Duration,
) -> FetchRequest {
    let mut request = FetchRequest::default();
    request.replica_id = BrokerId(-1);
    request.max_wait_ms = max_wait.as_millis().min(i32::MAX as u128) as i32;
    request.min_bytes = settings.min_bytes;
    request.max_bytes = settings.max_bytes;
    request.isolation_level = 0;
    request.session_id = 0;
    request.session_epoch = -1;

    let mut topics: BTreeMap<&str, FetchTopic> = BTreeMap::new();
    for (tp, position) in partitions {
        let topic = topics.entry(tp.topic.as_str()).or_insert_with(|| {
            let mut t = FetchTopic::default();
            t.topic = TopicName(StrBytes::from_string(tp.topic.clone()));
            t
        });
        let mut p = FetchPartition::default();
        p.partition = tp.partition;
        p.current_leader_epoch = -1;
        p.fetch_offset = *position;
        p.last_fetched_epoch = -1;
        p.log_start_offset = -1;
        p.partition_max_bytes = settings.partition_max_bytes;
        topic.partitions.push(p);
    }
    request.topics = topics.into_values().collect();
    request
}
