//! Kafka-compatible partitioner
//!
//! Picks the partition for a record the caller did not pin to one.
//!
//! - Keyed records use the `murmur2` crate with `KAFKA_SEED`, matching Apache
//!   Kafka's default partitioner, so the same key lands on the same partition
//!   as with any other Kafka client.
//! - Keyless records stick to one partition per topic until a batch for that
//!   partition seals, then move to the next partition. Over many batches this
//!   is round-robin, but each batch fills up before the partition changes.

use std::collections::HashMap;

use murmur2::{murmur2, KAFKA_SEED};
use parking_lot::Mutex;
use rand::Rng;

/// Partition for a keyed record.
///
/// Masks the sign bit then takes the modulo, matching Kafka's
/// `Utils.toPositive(Utils.murmur2(key)) % numPartitions`.
pub fn hash_partition(key: &[u8], partition_count: i32) -> i32 {
    debug_assert!(partition_count > 0, "partition_count must be positive");
    let hash = murmur2(key, KAFKA_SEED);
    ((hash & 0x7fffffff) as i32) % partition_count
}

/// Per-producer partitioner state (the sticky keyless partition per topic)
#[derive(Debug, Default)]
pub struct Partitioner {
    sticky: Mutex<HashMap<String, i32>>,
}

impl Partitioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compute the target partition for a record.
    ///
    /// An explicit partition passes through unchanged; otherwise keyed
    /// records hash and keyless records use the sticky partition.
    pub fn partition(
        &self,
        topic: &str,
        key: Option<&[u8]>,
        partition_count: i32,
        explicit_partition: Option<i32>,
    ) -> i32 {
        if let Some(p) = explicit_partition {
            return p;
        }
        match key {
            Some(k) => hash_partition(k, partition_count),
            None => self.sticky_partition(topic, partition_count),
        }
    }

    fn sticky_partition(&self, topic: &str, partition_count: i32) -> i32 {
        let mut sticky = self.sticky.lock();
        let current = sticky
            .entry(topic.to_string())
            .or_insert_with(|| rand::thread_rng().gen_range(0..partition_count));
        if *current >= partition_count {
            *current %= partition_count;
        }
        *current
    }

    /// A batch for (topic, partition) sealed. If that was the sticky
    /// partition, keyless records move on to the next one.
    pub fn on_batch_sealed(&self, topic: &str, partition: i32, partition_count: i32) {
        let mut sticky = self.sticky.lock();
        if let Some(current) = sticky.get_mut(topic) {
            if *current == partition {
                *current = (partition + 1) % partition_count.max(1);
            }
        }
    }
}
