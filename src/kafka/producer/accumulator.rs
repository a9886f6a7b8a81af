//! Per-partition record accumulation
//!
//! Each (topic, partition) the producer writes to has a [`PartitionQueue`]:
//! the open batch records are appended to, plus the sending half of the
//! channel that hands sealed batches to the partition's send task.
//!
//! Backpressure: a batch holds a permit from the partition's in-flight
//! semaphore from the moment it seals until it is acknowledged or fails.
//! Sealing waits for a permit, so with N permits at most N batches per
//! partition are sealed but unresolved and `send` blocks beyond that.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex, OwnedSemaphorePermit, Semaphore};

use crate::kafka::error::Result;
use crate::kafka::messages::{ProducerRecord, RecordMetadata, TopicPartition};

pub(crate) type AckSender = oneshot::Sender<Result<RecordMetadata>>;

/// Batch still accepting records
#[derive(Debug)]
pub(crate) struct OpenBatch {
    pub id: u64,
    pub records: Vec<ProducerRecord>,
    pub acks: Vec<AckSender>,
    pub size_bytes: usize,
    pub opened_at: Instant,
    /// Holds at least one keyless record (sealing advances the sticky partition)
    pub keyless: bool,
}

impl OpenBatch {
    fn new(id: u64) -> Self {
        Self {
            id,
            records: Vec::new(),
            acks: Vec::new(),
            size_bytes: 0,
            opened_at: Instant::now(),
            keyless: false,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Batch handed to the send task
#[derive(Debug)]
pub(crate) struct SealedBatch {
    pub id: u64,
    pub tp: TopicPartition,
    pub records: Arc<Vec<ProducerRecord>>,
    pub acks: Vec<AckSender>,
    /// Dispatch attempts so far
    pub attempts: u32,
    pub sealed_at: Instant,
    /// Released when the batch resolves
    pub permit: Option<OwnedSemaphorePermit>,
}

/// Messages from the batching logic to the send task
#[derive(Debug)]
pub(crate) enum PartitionEvent {
    /// A new open batch received its first record; the linger timer starts now
    Opened { batch_id: u64, at: Instant },
    Sealed(SealedBatch),
}

/// Limits that decide when a batch seals
#[derive(Debug, Clone, Copy)]
pub(crate) struct BatchLimits {
    pub max_bytes: usize,
    pub max_records: usize,
}

impl BatchLimits {
    fn is_full(&self, batch: &OpenBatch) -> bool {
        batch.len() >= self.max_records || batch.size_bytes >= self.max_bytes
    }

    /// Whether `record_size` more bytes would overflow a non-empty batch
    fn overflows(&self, batch: &OpenBatch, record_size: usize) -> bool {
        !batch.is_empty() && batch.size_bytes + record_size > self.max_bytes
    }
}

/// Mutable state of one partition, behind the partition lock
pub(crate) struct PartitionQueue {
    pub open: Option<OpenBatch>,
    /// None once the producer is closing
    pub events: Option<mpsc::UnboundedSender<PartitionEvent>>,
}

/// Everything the producer keeps per partition
pub(crate) struct PartitionHandle {
    pub tp: TopicPartition,
    pub partition_count: i32,
    pub queue: AsyncMutex<PartitionQueue>,
    pub in_flight: Arc<Semaphore>,
    pub max_in_flight: u32,
    pub limits: BatchLimits,
    next_batch_id: AtomicU64,
}

impl PartitionHandle {
    pub fn new(
        tp: TopicPartition,
        partition_count: i32,
        limits: BatchLimits,
        max_in_flight: usize,
        events: mpsc::UnboundedSender<PartitionEvent>,
    ) -> Self {
        Self {
            tp,
            partition_count,
            queue: AsyncMutex::new(PartitionQueue {
                open: None,
                events: Some(events),
            }),
            in_flight: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight: max_in_flight as u32,
            limits,
            next_batch_id: AtomicU64::new(0),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_batch_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Whether appending `record_size` bytes requires sealing the current
    /// batch first
    pub fn needs_seal_before(&self, queue: &PartitionQueue, record_size: usize) -> bool {
        queue
            .open
            .as_ref()
            .is_some_and(|b| self.limits.overflows(b, record_size))
    }

    /// Whether the batch will be full once this record is in it
    pub fn needs_seal_after(&self, queue: &PartitionQueue, record_size: usize) -> bool {
        match queue.open.as_ref() {
            Some(b) if !self.limits.overflows(b, record_size) => {
                b.len() + 1 >= self.limits.max_records
                    || b.size_bytes + record_size >= self.limits.max_bytes
            }
            _ => 1 >= self.limits.max_records || record_size >= self.limits.max_bytes,
        }
    }

    /// Append to the open batch, opening one if needed. Never blocks.
    pub fn append(&self, queue: &mut PartitionQueue, record: ProducerRecord, ack: AckSender) {
        if queue.open.is_none() {
            let batch = OpenBatch::new(self.next_id());
            if let Some(events) = &queue.events {
                let _ = events.send(PartitionEvent::Opened {
                    batch_id: batch.id,
                    at: batch.opened_at,
                });
            }
            queue.open = Some(batch);
        }
        if let Some(batch) = queue.open.as_mut() {
            batch.size_bytes += record.encoded_size();
            batch.keyless |= record.key.is_none();
            batch.records.push(record);
            batch.acks.push(ack);
        }
    }

    /// Seal the open batch with the given permit and hand it to the send
    /// task. Returns true if the sealed batch held keyless records.
    pub fn seal(&self, queue: &mut PartitionQueue, permit: Option<OwnedSemaphorePermit>) -> bool {
        let Some(batch) = queue.open.take() else {
            return false;
        };
        if batch.is_empty() {
            return false;
        }
        let keyless = batch.keyless;
        let sealed = SealedBatch {
            id: batch.id,
            tp: self.tp.clone(),
            records: Arc::new(batch.records),
            acks: batch.acks,
            attempts: 0,
            sealed_at: Instant::now(),
            permit,
        };
        match &queue.events {
            Some(events) => {
                let _ = events.send(PartitionEvent::Sealed(sealed));
            }
            None => fail_closed(sealed),
        }
        keyless
    }

    /// Whether the open batch is the one with this id
    pub fn is_open_batch(&self, queue: &PartitionQueue, batch_id: u64) -> bool {
        queue.open.as_ref().is_some_and(|b| b.id == batch_id)
    }

    pub fn is_full(&self, queue: &PartitionQueue) -> bool {
        queue.open.as_ref().is_some_and(|b| self.limits.is_full(b))
    }
}

fn fail_closed(batch: SealedBatch) {
    for ack in batch.acks {
        let _ = ack.send(Err(crate::kafka::error::KafkaError::ClientClosed));
    }
}
