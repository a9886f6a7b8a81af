//! Offset lookups and commits
//!
//! - committed offsets live on the group coordinator (OffsetFetch / OffsetCommit)
//! - reset positions come from the partition leaders (ListOffsets with the
//!   earliest/latest sentinel timestamps)

use std::collections::{BTreeMap, HashMap};

use kafka_protocol::messages::list_offsets_request::{ListOffsetsPartition, ListOffsetsTopic};
use kafka_protocol::messages::offset_commit_request::{
    OffsetCommitRequestPartition, OffsetCommitRequestTopic,
};
use kafka_protocol::messages::offset_fetch_request::OffsetFetchRequestTopic;
use kafka_protocol::messages::{
    BrokerId, GroupId, ListOffsetsRequest, OffsetCommitRequest, OffsetCommitResponse,
    OffsetFetchRequest, TopicName,
};
use kafka_protocol::protocol::StrBytes;
use tracing::{debug, warn};

use crate::kafka::assignment::PartitionAssigner;
use crate::kafka::connection::ConnectionManager;
use crate::kafka::constants::*;
use crate::kafka::error::{KafkaError, Result};
use crate::kafka::messages::{KafkaRequest, KafkaResponse, NodeId, TopicPartition};

fn topic_name(topic: &str) -> TopicName {
    TopicName(StrBytes::from_string(topic.to_string()))
}

/// Group partitions per topic, keeping partition order
fn by_topic<'a>(partitions: impl IntoIterator<Item = &'a TopicPartition>) -> BTreeMap<&'a str, Vec<i32>> {
    let mut topics: BTreeMap<&str, Vec<i32>> = BTreeMap::new();
    for tp in partitions {
        topics.entry(tp.topic.as_str()).or_default().push(tp.partition);
    }
    topics
}

// ===== Committed offsets =====

/// Committed offsets for `partitions`. Partitions without a commit are
/// absent from the result.
pub async fn fetch_committed(
    manager: &ConnectionManager,
    group: &PartitionAssigner,
    partitions: &[TopicPartition],
) -> Result<HashMap<TopicPartition, i64>> {
    if partitions.is_empty() {
        return Ok(HashMap::new());
    }
    let mut request = OffsetFetchRequest::default();
    request.group_id = GroupId(StrBytes::from_string(group.group_id().to_string()));
    request.topics = Some(
        by_topic(partitions)
            .into_iter()
            .map(|(topic, indexes)| {
                let mut t = OffsetFetchRequestTopic::default();
                t.name = topic_name(topic);
                t.partition_indexes = indexes;
                t
            })
            .collect(),
    );

    let coordinator = group.coordinator().await?;
    let response = manager
        .send(coordinator, KafkaRequest::OffsetFetch(request))
        .await?
        .into_offset_fetch()?;
    if response.error_code != ERROR_NONE {
        return Err(coordinator_failure(group, response.error_code, "OffsetFetch"));
    }

    let mut committed = HashMap::new();
    for topic in response.topics {
        for p in topic.partitions {
            let tp = TopicPartition::new(topic.name.0.to_string(), p.partition_index);
            if p.error_code != ERROR_NONE {
                return Err(KafkaError::from_code(p.error_code, format!("OffsetFetch {}", tp)));
            }
            if p.committed_offset >= 0 {
                committed.insert(tp, p.committed_offset);
            }
        }
    }
    debug!(
        "Group {} has commits for {}/{} partition(s)",
        group.group_id(),
        committed.len(),
        partitions.len()
    );
    Ok(committed)
}

/// Commit `offsets` (next offset to read per partition) for the current
/// generation. Any partition-level failure fails the whole call.
pub async fn commit(
    manager: &ConnectionManager,
    group: &PartitionAssigner,
    offsets: &BTreeMap<TopicPartition, i64>,
) -> Result<()> {
    if offsets.is_empty() {
        return Ok(());
    }
    let snapshot = group.assignment();
    let mut request = OffsetCommitRequest::default();
    request.group_id = GroupId(StrBytes::from_string(group.group_id().to_string()));
    request.generation_id_or_member_epoch = snapshot.generation;
    request.member_id = StrBytes::from_string(snapshot.member_id.clone());
    for (topic, partitions) in by_topic(offsets.keys()) {
        let mut t = OffsetCommitRequestTopic::default();
        t.name = topic_name(topic);
        for partition in partitions {
            let offset = offsets[&TopicPartition::new(topic, partition)];
            let mut p = OffsetCommitRequestPartition::default();
            p.partition_index = partition;
            p.committed_offset = offset;
            p.committed_leader_epoch = -1;
            t.partitions.push(p);
        }
        request.topics.push(t);
    }

    let coordinator = group
        .coordinator()
        .await
        .map_err(|e| KafkaError::Commit(format!("no coordinator for group {}: {}", group.group_id(), e)))?;
    let response = commit_response(
        manager.send(coordinator, KafkaRequest::OffsetCommit(request)).await,
        group.group_id(),
    )?;

    for topic in &response.topics {
        for p in &topic.partitions {
            if p.error_code != ERROR_NONE {
                let tp = TopicPartition::new(topic.name.0.to_string(), p.partition_index);
                return Err(commit_failure(group, p.error_code, &tp));
            }
        }
    }
    debug!("Committed {} offset(s) for group {}", offsets.len(), group.group_id());
    Ok(())
}

/// Transport and decode failures of an OffsetCommit both surface as `Commit`
fn commit_response(response: Result<KafkaResponse>, group_id: &str) -> Result<OffsetCommitResponse> {
    response
        .and_then(KafkaResponse::into_offset_commit)
        .map_err(|e| KafkaError::Commit(format!("OffsetCommit for group {} failed: {}", group_id, e)))
}

fn commit_failure(group: &PartitionAssigner, code: i16, tp: &TopicPartition) -> KafkaError {
    match code {
        ERROR_NOT_COORDINATOR | ERROR_COORDINATOR_NOT_AVAILABLE => group.coordinator_lost(),
        ERROR_ILLEGAL_GENERATION | ERROR_UNKNOWN_MEMBER_ID | ERROR_REBALANCE_IN_PROGRESS => {
            group.request_rejoin()
        }
        _ => {}
    }
    KafkaError::Commit(format!(
        "commit of {} for group {} rejected with error code {}",
        tp,
        group.group_id(),
        code
    ))
}

fn coordinator_failure(group: &PartitionAssigner, code: i16, what: &str) -> KafkaError {
    if matches!(code, ERROR_NOT_COORDINATOR | ERROR_COORDINATOR_NOT_AVAILABLE) {
        group.coordinator_lost();
    }
    KafkaError::from_code(code, format!("{} for group {}", what, group.group_id()))
}

// ===== Log offsets =====

/// Resolve `timestamp` (EARLIEST_TIMESTAMP / LATEST_TIMESTAMP) to an offset
/// for each partition, asking each partition's leader
pub async fn list_offsets(
    manager: &ConnectionManager,
    partitions: &[TopicPartition],
    timestamp: i64,
) -> Result<HashMap<TopicPartition, i64>> {
    let mut by_leader: BTreeMap<NodeId, Vec<TopicPartition>> = BTreeMap::new();
    for tp in partitions {
        let leader = manager.leader_for(&tp.topic, tp.partition).await?;
        by_leader.entry(leader).or_default().push(tp.clone());
    }

    let mut offsets = HashMap::with_capacity(partitions.len());
    for (leader, tps) in by_leader {
        let mut request = ListOffsetsRequest::default();
        request.replica_id = BrokerId(-1);
        for (topic, indexes) in by_topic(&tps) {
            let mut t = ListOffsetsTopic::default();
            t.name = topic_name(topic);
            for partition in indexes {
                let mut p = ListOffsetsPartition::default();
                p.partition_index = partition;
                p.current_leader_epoch = -1;
                p.timestamp = timestamp;
                t.partitions.push(p);
            }
            request.topics.push(t);
        }

        let response = manager
            .send(leader, KafkaRequest::ListOffsets(request))
            .await?
            .into_list_offsets()?;
        for topic in response.topics {
            for p in topic.partitions {
                let tp = TopicPartition::new(topic.name.0.to_string(), p.partition_index);
                if p.error_code != ERROR_NONE {
                    warn!("ListOffsets for {} failed with error code {}", tp, p.error_code);
                    return Err(KafkaError::from_code(p.error_code, tp.to_string()));
                }
                offsets.insert(tp, p.offset);
            }
        }
    }
    Ok(offsets)
}
