// Kafka protocol encoding and decoding module
//
// This module handles the client side of the binary Kafka wire protocol:
// [4 bytes: Size (big-endian i32)] [RequestHeader] [RequestBody]
//
// The kafka-protocol crate provides auto-generated structs for all Kafka messages,
// but we need to handle the framing (size prefix, done by LengthDelimitedCodec)
// and routing (api_key matching, correlation ids) ourselves.
//
// Module organization:
// - encoding: Request encoding (encode_request)
// - decoding: Response decoding (decode_response)
// - recordbatch: RecordBatch v2 encoding for produce, decoding for fetch

mod decoding;
mod encoding;
mod recordbatch;

pub use decoding::{decode_response, peek_correlation_id};
pub use encoding::encode_request;
pub use recordbatch::{decode_fetched, decode_record_batches, encode_record_batch, FetchedRecords};

#[cfg(test)]
pub(crate) use decoding::decode_request;
#[cfg(test)]
pub(crate) use encoding::encode_response;
#[cfg(test)]
pub(crate) use recordbatch::decode_produced_records;
