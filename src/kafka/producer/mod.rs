// Producer
//
// Records are routed to a partition, appended to that partition's open batch
// and acknowledged through a DeliveryFuture once the send task hears back
// from the leader. See accumulator.rs for batching and backpressure and
// sender.rs for dispatch, retries and ordering.

mod accumulator;
mod sender;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::{oneshot, OwnedSemaphorePermit};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ProducerConfig;
use crate::kafka::connection::ConnectionManager;
use crate::kafka::error::{KafkaError, Result};
use crate::kafka::messages::{ProducerRecord, RecordMetadata, TopicPartition};
use crate::kafka::partitioner::Partitioner;

use accumulator::{BatchLimits, PartitionHandle};
use sender::SenderContext;

/// Resolves once the record is acknowledged or its batch failed for good
#[must_use = "the record may still fail; await the future to learn its fate"]
pub struct DeliveryFuture {
    rx: oneshot::Receiver<Result<RecordMetadata>>,
}

impl DeliveryFuture {
    /// Wait for the acknowledgement unless the token fires first. The record
    /// itself stays queued; only the wait is abandoned.
    pub async fn with_cancellation(self, token: &CancellationToken) -> Result<RecordMetadata> {
        tokio::select! {
            result = self => result,
            _ = token.cancelled() => Err(KafkaError::Cancelled),
        }
    }
}

impl Future for DeliveryFuture {
    type Output = Result<RecordMetadata>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(KafkaError::ClientClosed)))
    }
}

struct ProducerInner {
    config: ProducerConfig,
    manager: Arc<ConnectionManager>,
    /// Whether close() also closes the connection manager
    owns_manager: bool,
    partitioner: Arc<Partitioner>,
    ctx: Arc<SenderContext>,
    partitions: parking_lot::Mutex<HashMap<TopicPartition, Arc<PartitionHandle>>>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

/// Batching, at-least-once producer. Cheap to clone; clones share batches
/// and send tasks.
#[derive(Clone)]
pub struct Producer {
    inner: Arc<ProducerInner>,
}

impl Producer {
    /// Bootstrap a dedicated connection manager and build a producer on it
    pub async fn connect(config: ProducerConfig) -> Result<Self> {
        config.validate()?;
        let manager = ConnectionManager::connect(config.client.clone()).await?;
        Ok(Self::build(config, manager, true))
    }

    /// Producer sharing an existing connection manager. close() leaves the
    /// manager open.
    pub fn with_manager(config: ProducerConfig, manager: Arc<ConnectionManager>) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config, manager, false))
    }

    fn build(config: ProducerConfig, manager: Arc<ConnectionManager>, owns_manager: bool) -> Self {
        let partitioner = Arc::new(Partitioner::new());
        let ctx = Arc::new(SenderContext {
            manager: manager.clone(),
            partitioner: partitioner.clone(),
            acks: config.acks,
            compression: config.compression,
            linger: config.linger,
            request_timeout: config.client.request_timeout,
            backoff: config.client.backoff(),
        });
        info!(
            "Producer {} ready (acks={}, batch.size={}, linger={:?})",
            config.client.client_id,
            config.acks.as_str(),
            config.batch_size,
            config.linger
        );
        Self {
            inner: Arc::new(ProducerInner {
                config,
                manager,
                owns_manager,
                partitioner,
                ctx,
                partitions: parking_lot::Mutex::new(HashMap::new()),
                tasks: parking_lot::Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &ProducerConfig {
        &self.inner.config
    }

    /// Queue a record. Returns once the record is in a batch; the returned
    /// future resolves with its offset.
    ///
    /// Blocks while the partition already has max-in-flight batches sealed.
    pub async fn send(&self, record: ProducerRecord) -> Result<DeliveryFuture> {
        self.send_with_cancellation(record, &CancellationToken::new()).await
    }

    /// Queue a record and wait for its acknowledgement
    pub async fn send_and_wait(&self, record: ProducerRecord) -> Result<RecordMetadata> {
        self.send(record).await?.await
    }

    /// Queue a record on an explicit partition
    pub async fn send_to_partition(
        &self,
        topic: &str,
        partition: i32,
        key: Option<Vec<u8>>,
        value: Vec<u8>,
    ) -> Result<DeliveryFuture> {
        self.send(ProducerRecord::new(topic, key, value).with_partition(partition))
            .await
    }

    /// `send` that gives up with `Cancelled` if the token fires while waiting
    /// for room. A cancelled record was never queued.
    pub async fn send_with_cancellation(
        &self,
        record: ProducerRecord,
        token: &CancellationToken,
    ) -> Result<DeliveryFuture> {
        self.ensure_open()?;
        let count = tokio::select! {
            count = self.inner.manager.partition_count(&record.topic) => count?,
            _ = token.cancelled() => return Err(KafkaError::Cancelled),
        };
        let count = i32::try_from(count).map_err(|_| KafkaError::Metadata {
            topic: record.topic.clone(),
            message: format!("unsupported partition count {}", count),
        })?;
        if count == 0 {
            return Err(KafkaError::Metadata {
                topic: record.topic.clone(),
                message: "topic has no partitions".to_string(),
            });
        }
        if let Some(p) = record.partition {
            if !(0..count).contains(&p) {
                return Err(KafkaError::Metadata {
                    topic: record.topic.clone(),
                    message: format!("partition {} out of range (topic has {})", p, count),
                });
            }
        }

        let partition =
            self.inner
                .partitioner
                .partition(&record.topic, record.key.as_deref(), count, record.partition);
        let tp = TopicPartition::new(record.topic.clone(), partition);
        let handle = self.partition_handle(&tp, count);
        let size = record.encoded_size();
        let (ack_tx, ack_rx) = oneshot::channel();

        let mut queue = tokio::select! {
            queue = handle.queue.lock() => queue,
            _ = token.cancelled() => return Err(KafkaError::Cancelled),
        };
        if queue.events.is_none() {
            return Err(KafkaError::ClientClosed);
        }

        if handle.needs_seal_before(&queue, size) {
            let permit = acquire_permit(&handle, token).await?;
            self.seal(&handle, &mut queue, permit);
        }
        let permit = if handle.needs_seal_after(&queue, size) {
            Some(acquire_permit(&handle, token).await?)
        } else {
            None
        };
        handle.append(&mut queue, record, ack_tx);
        if let Some(permit) = permit {
            self.seal(&handle, &mut queue, permit);
        }
        Ok(DeliveryFuture { rx: ack_rx })
    }

    fn seal(
        &self,
        handle: &PartitionHandle,
        queue: &mut accumulator::PartitionQueue,
        permit: OwnedSemaphorePermit,
    ) {
        if handle.seal(queue, Some(permit)) {
            self.inner
                .partitioner
                .on_batch_sealed(&handle.tp.topic, handle.tp.partition, handle.partition_count);
        }
    }

    /// Seal every open batch and wait until all sealed batches resolved.
    /// Returns at once when nothing is pending.
    pub async fn flush(&self) -> Result<()> {
        let handles: Vec<Arc<PartitionHandle>> =
            self.inner.partitions.lock().values().cloned().collect();

        for handle in &handles {
            let mut queue = handle.queue.lock().await;
            if queue.open.as_ref().is_some_and(|b| !b.is_empty()) {
                let permit = handle
                    .in_flight
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| KafkaError::ClientClosed)?;
                self.seal(handle, &mut queue, permit);
            }
        }
        for handle in &handles {
            // every permit back means every sealed batch resolved
            let all = handle
                .in_flight
                .acquire_many(handle.max_in_flight)
                .await
                .map_err(|_| KafkaError::ClientClosed)?;
            drop(all);
        }
        debug!("Flushed {} partition(s)", handles.len());
        Ok(())
    }

    /// `flush` that gives up with `Cancelled` when the token fires. Sealed
    /// batches keep going in the background.
    pub async fn flush_with_cancellation(&self, token: &CancellationToken) -> Result<()> {
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(KafkaError::Cancelled),
            result = self.flush() => result,
        }
    }

    /// Flush, stop the send tasks and (if owned) the connection manager.
    /// Later sends fail with `ClientClosed`. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Err(e) = self.flush().await {
            warn!("Flush during close failed: {}", e);
        }

        let handles: Vec<Arc<PartitionHandle>> =
            self.inner.partitions.lock().drain().map(|(_, h)| h).collect();
        for handle in &handles {
            let mut queue = handle.queue.lock().await;
            // a send that raced the closed flag may have left a partial batch
            handle.seal(&mut queue, None);
            queue.events = None;
        }
        let tasks: Vec<JoinHandle<()>> = self.inner.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Send task ended abnormally: {}", e);
            }
        }
        if self.inner.owns_manager {
            self.inner.manager.close();
        }
        info!("Producer {} closed", self.inner.config.client.client_id);
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() || self.inner.manager.is_closed() {
            return Err(KafkaError::ClientClosed);
        }
        Ok(())
    }

    /// Handle for a partition, starting its send task on first use
    fn partition_handle(&self, tp: &TopicPartition, partition_count: i32) -> Arc<PartitionHandle> {
        let mut partitions = self.inner.partitions.lock();
        if let Some(handle) = partitions.get(tp) {
            return handle.clone();
        }
        let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();
        let limits = BatchLimits {
            max_bytes: self.inner.config.batch_size,
            max_records: self.inner.config.batch_num_messages,
        };
        let handle = Arc::new(PartitionHandle::new(
            tp.clone(),
            partition_count,
            limits,
            self.inner.config.max_in_flight,
            events_tx,
        ));
        let task = tokio::spawn(sender::run_partition_sender(
            self.inner.ctx.clone(),
            Arc::downgrade(&handle),
            tp.clone(),
            events_rx,
        ));
        self.inner.tasks.lock().push(task);
        partitions.insert(tp.clone(), handle.clone());
        handle
    }
}

async fn acquire_permit(handle: &PartitionHandle, token: &CancellationToken) -> Result<OwnedSemaphorePermit> {
    tokio::select! {
        permit = handle.in_flight.clone().acquire_owned() => permit.map_err(|_| KafkaError::ClientClosed),
        _ = token.cancelled() => Err(KafkaError::Cancelled),
    }
}
