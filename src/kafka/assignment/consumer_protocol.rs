//! Consumer protocol payloads
//!
//! JoinGroup carries each member's subscription as opaque protocol metadata
//! and SyncGroup carries each member's assignment as opaque bytes. Both use
//! Kafka's ConsumerProtocol encoding (big-endian, i16-prefixed strings,
//! i32-prefixed arrays):
//!
//! ```text
//! Subscription: version i16, topics [string], user_data bytes
//! Assignment:   version i16, [topic string, partitions [i32]], user_data bytes
//! ```
//!
//! Version 1+ subscriptions append owned partitions; we write v0 and ignore
//! any trailing fields when reading.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::kafka::error::{KafkaError, Result};
use crate::kafka::messages::TopicPartition;

pub const CONSUMER_PROTOCOL_VERSION: i16 = 0;

/// What a member asks for when joining
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MemberSubscription {
    pub version: i16,
    pub topics: Vec<String>,
    pub user_data: Option<Vec<u8>>,
}

impl MemberSubscription {
    pub fn new(topics: Vec<String>) -> Self {
        Self {
            version: CONSUMER_PROTOCOL_VERSION,
            topics,
            user_data: None,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_i16(self.version);
        buf.put_i32(self.topics.len() as i32);
        for topic in &self.topics {
            put_string(&mut buf, topic);
        }
        put_bytes(&mut buf, self.user_data.as_deref());
        buf.freeze()
    }

    /// An empty payload decodes as an empty subscription
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Ok(Self::default());
        }
        let mut reader = Reader::new(bytes, "subscription");
        let version = reader.i16()?;
        let count = reader.array_len()?;
        let mut topics = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            if let Some(topic) = reader.string()? {
                topics.push(topic);
            }
        }
        let user_data = reader.optional_bytes()?;
        Ok(Self {
            version,
            topics,
            user_data,
        })
    }
}

/// Partitions the leader gave one member
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MemberAssignment {
    pub version: i16,
    /// topic -> sorted partition indexes
    pub topic_partitions: BTreeMap<String, Vec<i32>>,
    pub user_data: Option<Vec<u8>>,
}

impl MemberAssignment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a flat list; partitions are sorted and deduplicated
    pub fn from_topic_partitions<'a>(tps: impl IntoIterator<Item = &'a TopicPartition>) -> Self {
        let mut assignment = Self::new();
        for tp in tps {
            assignment.add(&tp.topic, tp.partition);
        }
        assignment
    }

    pub fn add(&mut self, topic: &str, partition: i32) {
        let partitions = self.topic_partitions.entry(topic.to_string()).or_default();
        if let Err(pos) = partitions.binary_search(&partition) {
            partitions.insert(pos, partition);
        }
    }

    pub fn partitions(&self, topic: &str) -> Vec<i32> {
        self.topic_partitions.get(topic).cloned().unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.topic_partitions.values().all(Vec::is_empty)
    }

    pub fn partition_count(&self) -> usize {
        self.topic_partitions.values().map(Vec::len).sum()
    }

    /// Flat, ordered list of assigned partitions
    pub fn to_topic_partitions(&self) -> Vec<TopicPartition> {
        self.topic_partitions
            .iter()
            .flat_map(|(topic, partitions)| {
                partitions.iter().map(move |p| TopicPartition::new(topic.clone(), *p))
            })
            .collect()
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_i16(self.version);
        let topics: Vec<_> = self
            .topic_partitions
            .iter()
            .filter(|(_, p)| !p.is_empty())
            .collect();
        buf.put_i32(topics.len() as i32);
        for (topic, partitions) in topics {
            put_string(&mut buf, topic);
            buf.put_i32(partitions.len() as i32);
            for p in partitions {
                buf.put_i32(*p);
            }
        }
        put_bytes(&mut buf, self.user_data.as_deref());
        buf.freeze()
    }

    /// An empty payload (a member that got nothing) decodes as empty
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Ok(Self::default());
        }
        let mut reader = Reader::new(bytes, "assignment");
        let version = reader.i16()?;
        let count = reader.array_len()?;
        let mut assignment = Self {
            version,
            ..Self::default()
        };
        for _ in 0..count {
            let topic = reader.string()?;
            let partitions = reader.array_len()?;
            for _ in 0..partitions {
                let partition = reader.i32()?;
                if let Some(topic) = &topic {
                    assignment.add(topic, partition);
                }
            }
        }
        assignment.user_data = reader.optional_bytes()?;
        Ok(assignment)
    }
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_i16(s.len() as i16);
    buf.put_slice(s.as_bytes());
}

fn put_bytes(buf: &mut BytesMut, data: Option<&[u8]>) {
    match data {
        Some(data) => {
            buf.put_i32(data.len() as i32);
            buf.put_slice(data);
        }
        None => buf.put_i32(-1),
    }
}

/// Bounds-checked reader; every short read is a CorruptMessage
struct Reader<'a> {
    buf: &'a [u8],
    what: &'static str,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8], what: &'static str) -> Self {
        Self { buf, what }
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(KafkaError::CorruptMessage {
                message: format!(
                    "{} truncated: need {} byte(s), {} left",
                    self.what,
                    n,
                    self.buf.remaining()
                ),
            });
        }
        Ok(())
    }

    fn i16(&mut self) -> Result<i16> {
        self.need(2)?;
        Ok(self.buf.get_i16())
    }

    fn i32(&mut self) -> Result<i32> {
        self.need(4)?;
        Ok(self.buf.get_i32())
    }

    fn array_len(&mut self) -> Result<usize> {
        let len = self.i32()?;
        usize::try_from(len).map_err(|_| KafkaError::CorruptMessage {
            message: format!("{} has negative array length {}", self.what, len),
        })
    }

    /// Nullable string; null yields None
    fn string(&mut self) -> Result<Option<String>> {
        let len = self.i16()?;
        if len < 0 {
            return Ok(None);
        }
        let len = len as usize;
        self.need(len)?;
        let raw = self.buf[..len].to_vec();
        self.buf.advance(len);
        String::from_utf8(raw)
            .map(Some)
            .map_err(|e| KafkaError::CorruptMessage {
                message: format!("{} has invalid UTF-8 topic name: {}", self.what, e),
            })
    }

    /// Trailing nullable bytes; a payload that ends early has none
    fn optional_bytes(&mut self) -> Result<Option<Vec<u8>>> {
        if self.buf.remaining() < 4 {
            return Ok(None);
        }
        let len = self.buf.get_i32();
        if len < 0 {
            return Ok(None);
        }
        let len = len as usize;
        self.need(len)?;
        let data = self.buf[..len].to_vec();
        self.buf.advance(len);
        Ok(Some(data))
    }
}
