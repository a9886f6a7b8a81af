// RecordBatch encoding and decoding
//
// The producer turns a sealed batch of ProducerRecords into a single v2
// RecordBatch; the consumer splits a fetched records blob into batches and
// expands them into ConsumerRecords.
//
// Fetch responses may end with a partial batch when the broker hit a byte
// limit. Batches are framed here by hand so that tail can be dropped instead
// of failing the whole decode.

use bytes::{Buf, Bytes, BytesMut};
use kafka_protocol::protocol::StrBytes;
use kafka_protocol::records::{
    Compression, Record, RecordBatchDecoder, RecordBatchEncoder, RecordEncodeOptions,
    TimestampType,
};
use tracing::{debug, trace};

use super::super::error::{KafkaError, Result};
use super::super::messages::{ConsumerRecord, ProducerRecord, RecordHeader};

/// baseOffset (8) + batchLength (4)
const BATCH_LOG_OVERHEAD: usize = 12;

/// Magic byte offset inside a batch (after baseOffset, batchLength, leaderEpoch)
const MAGIC_OFFSET: usize = 16;

/// lastOffsetDelta follows magic (1), crc (4) and attributes (2)
const LAST_OFFSET_DELTA_OFFSET: usize = 23;

/// Records of a fetched blob and the offset just past its last complete batch
#[derive(Debug, Default)]
pub struct FetchedRecords {
    pub records: Vec<ConsumerRecord>,
    /// None when the blob held no complete batch
    pub next_offset: Option<i64>,
}

/// Encode records as one RecordBatch v2 with offset deltas 0..n.
pub fn encode_record_batch(records: &[ProducerRecord], compression: Compression) -> Result<Bytes> {
    let kafka_records: Vec<Record> = records
        .iter()
        .enumerate()
        .map(|(i, r)| {
            let mut record = Record {
                transactional: false,
                control: false,
                partition_leader_epoch: -1,
                producer_id: -1,
                producer_epoch: -1,
                timestamp_type: TimestampType::Creation,
                offset: i as i64,
                sequence: -1,
                timestamp: r.timestamp,
                key: r.key.as_ref().map(|k| Bytes::copy_from_slice(k)),
                value: Some(Bytes::copy_from_slice(&r.value)),
                headers: Default::default(),
            };
            for h in &r.headers {
                record.headers.insert(
                    StrBytes::from_string(h.key.clone()),
                    Some(Bytes::copy_from_slice(&h.value)),
                );
            }
            record
        })
        .collect();

    let mut encoded = BytesMut::new();
    RecordBatchEncoder::encode(
        &mut encoded,
        kafka_records.iter(),
        &RecordEncodeOptions {
            version: 2,
            compression,
        },
    )
    .map_err(|e| KafkaError::Encoding(format!("RecordBatch encode failed: {}", e)))?;

    trace!(
        "Encoded {} record(s) into {} byte batch",
        records.len(),
        encoded.len()
    );
    Ok(encoded.freeze())
}

/// Decode every complete batch in a fetched records blob.
///
/// Control records (transaction markers) are skipped. Records below
/// `min_offset` are dropped, since a fetch from the middle of a batch returns
/// the whole batch.
pub fn decode_record_batches(
    topic: &str,
    partition: i32,
    data: &Bytes,
    min_offset: i64,
) -> Result<Vec<ConsumerRecord>> {
    decode_fetched(topic, partition, data, min_offset).map(|fetched| fetched.records)
}

/// Like [`decode_record_batches`], also reporting where the next fetch
/// starts. A batch of only control records yields no records but still
/// moves that offset.
pub fn decode_fetched(topic: &str, partition: i32, data: &Bytes, min_offset: i64) -> Result<FetchedRecords> {
    let mut records = Vec::new();
    let mut next_offset = None;
    let mut remaining = data.clone();

    while remaining.len() >= BATCH_LOG_OVERHEAD {
        let mut peek = remaining.clone();
        let base_offset = peek.get_i64();
        let batch_length = peek.get_i32();
        if batch_length < 0 {
            return Err(KafkaError::CorruptMessage {
                message: format!("negative batch length {} in {}-{}", batch_length, topic, partition),
            });
        }
        let total = BATCH_LOG_OVERHEAD + batch_length as usize;
        if remaining.len() < total {
            debug!(
                "Dropping partial trailing batch for {}-{} ({} of {} bytes)",
                topic,
                partition,
                remaining.len(),
                total
            );
            break;
        }

        let mut batch = remaining.split_to(total);
        if batch.len() > MAGIC_OFFSET && batch[MAGIC_OFFSET] != 2 {
            return Err(KafkaError::CorruptMessage {
                message: format!(
                    "unsupported record batch magic {} in {}-{}",
                    batch[MAGIC_OFFSET], topic, partition
                ),
            });
        }

        if batch.len() >= LAST_OFFSET_DELTA_OFFSET + 4 {
            let last_offset_delta = (&batch[LAST_OFFSET_DELTA_OFFSET..]).get_i32();
            next_offset = Some(base_offset + last_offset_delta as i64 + 1);
        }

        let record_set = RecordBatchDecoder::decode(&mut batch).map_err(|e| {
            KafkaError::CorruptMessage {
                message: format!("RecordBatch decode failed for {}-{}: {}", topic, partition, e),
            }
        })?;

        for record in record_set.records {
            if record.control || record.offset < min_offset {
                continue;
            }
            let headers = record
                .headers
                .into_iter()
                .map(|(k, v)| RecordHeader {
                    key: k.to_string(),
                    value: v.map(|b: Bytes| b.to_vec()).unwrap_or_default(),
                })
                .collect();
            records.push(ConsumerRecord {
                topic: topic.to_string(),
                partition,
                offset: record.offset,
                key: record.key.map(|k: Bytes| k.to_vec()),
                value: record.value.map(|v: Bytes| v.to_vec()),
                headers,
                timestamp: record.timestamp,
            });
        }
    }

    Ok(FetchedRecords { records, next_offset })
}

/// Decode a produced blob into raw records (offsets are batch-relative).
/// The test broker re-stamps them with log offsets.
#[cfg(test)]
pub(crate) fn decode_produced_records(data: &Bytes) -> Result<Vec<Record>> {
    let mut buf = data.clone();
    let set = RecordBatchDecoder::decode(&mut buf).map_err(|e| KafkaError::CorruptMessage {
        message: format!("RecordBatch decode failed: {}", e),
    })?;
    Ok(set.records)
}
