//! Per-partition send task
//!
//! One task per (topic, partition). It owns the linger timer of the
//! partition's open batch and every sealed batch until it resolves:
//!
//! - sealed batches are sent in seal order, one produce request on the
//!   wire at a time; the in-flight semaphore bounds how many sealed
//!   batches wait behind it
//! - a retryable failure holds the batch at the head; nothing behind it
//!   is sent or acknowledged until it resolves
//! - success acknowledges each record with its offset; exhausted or
//!   terminal failures fail each record with a DeliveryError carrying the
//!   whole batch

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::future::OptionFuture;
use kafka_protocol::messages::produce_request::{PartitionProduceData, TopicProduceData};
use kafka_protocol::messages::{ProduceRequest, TopicName};
use kafka_protocol::protocol::StrBytes;
use kafka_protocol::records::Compression;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::accumulator::{PartitionEvent, PartitionHandle, SealedBatch};
use crate::config::Acks;
use crate::kafka::backoff::BackoffPolicy;
use crate::kafka::connection::ConnectionManager;
use crate::kafka::constants::ERROR_UNKNOWN_SERVER_ERROR;
use crate::kafka::error::{DeliveryError, KafkaError, Result};
use crate::kafka::messages::{KafkaRequest, KafkaResponse, NodeId, RecordMetadata, TopicPartition};
use crate::kafka::partitioner::Partitioner;
use crate::kafka::protocol;

/// How soon to look again at a linger deadline we could not act on
const LINGER_RECHECK: Duration = Duration::from_millis(5);

/// Settings and collaborators every send task shares
pub(crate) struct SenderContext {
    pub manager: Arc<ConnectionManager>,
    pub partitioner: Arc<Partitioner>,
    pub acks: Acks,
    pub compression: Compression,
    pub linger: Duration,
    pub request_timeout: Duration,
    pub backoff: BackoffPolicy,
}

type Attempt = (SealedBatch, Option<NodeId>, Result<i64>);

enum LingerOutcome {
    /// Sealed, or the batch had already sealed on size/count
    Done,
    /// Lock or permit unavailable right now
    Retry,
}

/// Run until the batching side hangs up and every batch resolved
pub(crate) async fn run_partition_sender(
    ctx: Arc<SenderContext>,
    handle: Weak<PartitionHandle>,
    tp: TopicPartition,
    mut events: mpsc::UnboundedReceiver<PartitionEvent>,
) {
    let mut pending: VecDeque<SealedBatch> = VecDeque::new();
    let mut retrying: Option<SealedBatch> = None;
    let mut retry_at: Option<Instant> = None;
    let mut linger: Option<(u64, Instant)> = None;
    let mut in_flight: Option<BoxFuture<'static, Attempt>> = None;
    let mut events_open = true;

    debug!("Send task for {} started", tp);
    loop {
        while in_flight.is_none() && retrying.is_none() {
            let Some(batch) = pending.pop_front() else {
                break;
            };
            match dispatch(&ctx, batch).await {
                Ok(attempt) => in_flight = Some(attempt),
                Err((batch, node, e)) => park_or_fail(&ctx, batch, node, e, &mut retrying, &mut retry_at),
            }
        }

        if !events_open && pending.is_empty() && in_flight.is_none() && retrying.is_none() {
            break;
        }

        let retry_deadline = retry_at.unwrap_or_else(far_future);
        let linger_deadline = linger.map(|(_, at)| at).unwrap_or_else(far_future);

        tokio::select! {
            event = events.recv(), if events_open => match event {
                Some(PartitionEvent::Opened { batch_id, at }) => {
                    linger = Some((batch_id, Instant::from_std(at) + ctx.linger));
                }
                Some(PartitionEvent::Sealed(batch)) => {
                    if linger.is_some_and(|(id, _)| id == batch.id) {
                        linger = None;
                    }
                    trace!("Batch {} for {} sealed with {} record(s)", batch.id, tp, batch.records.len());
                    pending.push_back(batch);
                }
                None => {
                    events_open = false;
                    linger = None;
                }
            },
            Some((batch, node, result)) = OptionFuture::from(in_flight.as_mut()), if in_flight.is_some() => {
                in_flight = None;
                match result {
                    Ok(base_offset) => complete(batch, base_offset),
                    Err(e) => park_or_fail(&ctx, batch, node, e, &mut retrying, &mut retry_at),
                }
            }
            _ = tokio::time::sleep_until(retry_deadline), if retry_at.is_some() => {
                retry_at = None;
                if let Some(batch) = retrying.take() {
                    debug!("Re-sending batch {} for {}", batch.id, tp);
                    pending.push_front(batch);
                }
            }
            _ = tokio::time::sleep_until(linger_deadline), if linger.is_some() => {
                if let Some((batch_id, _)) = linger {
                    linger = match seal_on_linger(&ctx, &handle, &tp, batch_id) {
                        LingerOutcome::Done => None,
                        LingerOutcome::Retry => Some((batch_id, Instant::now() + LINGER_RECHECK)),
                    };
                }
            }
        }
    }
    debug!("Send task for {} exiting", tp);
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86_400)
}

/// Seal the open batch if it is still the one whose linger expired
fn seal_on_linger(
    ctx: &SenderContext,
    handle: &Weak<PartitionHandle>,
    tp: &TopicPartition,
    batch_id: u64,
) -> LingerOutcome {
    let Some(handle) = handle.upgrade() else {
        return LingerOutcome::Done;
    };
    // a sender may hold the lock while waiting for a permit we release
    let Ok(mut queue) = handle.queue.try_lock() else {
        return LingerOutcome::Retry;
    };
    if !handle.is_open_batch(&queue, batch_id) {
        return LingerOutcome::Done;
    }
    let Ok(permit) = handle.in_flight.clone().try_acquire_owned() else {
        return LingerOutcome::Retry;
    };
    trace!("Linger expired for batch {} of {}", batch_id, tp);
    if handle.seal(&mut queue, Some(permit)) {
        ctx.partitioner
            .on_batch_sealed(&tp.topic, tp.partition, handle.partition_count);
    }
    LingerOutcome::Done
}

fn build_request(ctx: &SenderContext, batch: &SealedBatch) -> Result<KafkaRequest> {
    let records = protocol::encode_record_batch(&batch.records, ctx.compression)?;

    let mut partition_data = PartitionProduceData::default();
    partition_data.index = batch.tp.partition;
    partition_data.records = Some(records);

    let mut topic_data = TopicProduceData::default();
    topic_data.name = TopicName(StrBytes::from_string(batch.tp.topic.clone()));
    topic_data.partition_data.push(partition_data);

    let mut request = ProduceRequest::default();
    request.acks = ctx.acks.as_i16();
    request.timeout_ms = ctx.request_timeout.as_millis().min(i32::MAX as u128) as i32;
    request.topic_data.push(topic_data);
    Ok(KafkaRequest::Produce(request))
}

/// Resolve the leader and put the batch on the wire. The returned future
/// waits for the answer.
async fn dispatch(
    ctx: &Arc<SenderContext>,
    mut batch: SealedBatch,
) -> std::result::Result<BoxFuture<'static, Attempt>, (SealedBatch, Option<NodeId>, KafkaError)> {
    batch.attempts += 1;
    let leader = match ctx.manager.leader_for(&batch.tp.topic, batch.tp.partition).await {
        Ok(leader) => leader,
        Err(e) => return Err((batch, None, e)),
    };
    let request = match build_request(ctx, &batch) {
        Ok(request) => request,
        Err(e) => return Err((batch, Some(leader), e)),
    };
    debug!(
        "Dispatching batch {} ({} record(s), attempt {}) for {} to node {}",
        batch.id,
        batch.records.len(),
        batch.attempts,
        batch.tp,
        leader
    );
    let pending = match ctx.manager.dispatch(leader, request).await {
        Ok(pending) => pending,
        Err(e) => return Err((batch, Some(leader), e)),
    };
    let timeout = ctx.request_timeout;
    Ok(Box::pin(async move {
        let result = pending
            .wait(timeout)
            .await
            .and_then(|response| base_offset(response, &batch.tp));
        (batch, Some(leader), result)
    }))
}

/// Base offset assigned to our partition, or the partition's error
fn base_offset(response: KafkaResponse, tp: &TopicPartition) -> Result<i64> {
    let response = response.into_produce()?;
    let partition = response
        .responses
        .iter()
        .filter(|t| t.name.0.as_str() == tp.topic)
        .flat_map(|t| t.partition_responses.iter())
        .find(|p| p.index == tp.partition)
        .ok_or_else(|| KafkaError::Protocol {
            code: ERROR_UNKNOWN_SERVER_ERROR,
            message: format!("produce response has no entry for {}", tp),
        })?;
    if partition.error_code != 0 {
        return Err(KafkaError::from_code(partition.error_code, tp.to_string()));
    }
    Ok(partition.base_offset)
}

fn complete(batch: SealedBatch, base_offset: i64) {
    debug!(
        "Batch {} for {} acknowledged at offset {} after {} attempt(s)",
        batch.id, batch.tp, base_offset, batch.attempts
    );
    for (i, ack) in batch.acks.into_iter().enumerate() {
        let timestamp = batch.records.get(i).map_or(0, |r| r.timestamp);
        let _ = ack.send(Ok(RecordMetadata {
            topic: batch.tp.topic.clone(),
            partition: batch.tp.partition,
            offset: base_offset + i as i64,
            timestamp,
        }));
    }
    // permit released on drop
}

fn park_or_fail(
    ctx: &SenderContext,
    batch: SealedBatch,
    node: Option<NodeId>,
    error: KafkaError,
    retrying: &mut Option<SealedBatch>,
    retry_at: &mut Option<Instant>,
) {
    match (&error, node) {
        (KafkaError::Transport(_) | KafkaError::Io(_), Some(node)) => ctx.manager.note_failure(node),
        _ if error.invalidates_metadata() => ctx.manager.invalidate_topic(&batch.tp.topic),
        _ => {}
    }

    let retries_done = batch.attempts.saturating_sub(1);
    if error.is_retriable() && ctx.backoff.should_retry(retries_done) {
        let delay = ctx.backoff.delay(retries_done);
        warn!(
            "Batch {} for {} failed (attempt {}/{}): {}; retrying in {:?}",
            batch.id,
            batch.tp,
            batch.attempts,
            ctx.backoff.max_attempts(),
            error,
            delay
        );
        *retry_at = Some(Instant::now() + delay);
        *retrying = Some(batch);
        return;
    }

    let delivery = DeliveryError {
        topic: batch.tp.topic.clone(),
        partition: batch.tp.partition,
        attempts: batch.attempts,
        reason: error.to_string(),
        records: batch.records.clone(),
    };
    warn!("{}", delivery);
    for ack in batch.acks {
        let _ = ack.send(Err(KafkaError::Delivery(delivery.clone())));
    }
}
