// Response decoding module
//
// Handles parsing of Kafka responses from binary wire protocol format.
// Responses carry no api key, so the caller passes the key/version of the
// request the correlation id belongs to.

use bytes::{Buf, BytesMut};
use kafka_protocol::messages::{
    FetchResponse, FindCoordinatorResponse, HeartbeatResponse, JoinGroupResponse,
    LeaveGroupResponse, ListOffsetsResponse, MetadataResponse, OffsetCommitResponse,
    OffsetFetchResponse, ProduceResponse, ResponseHeader, SyncGroupResponse,
};
use kafka_protocol::protocol::Decodable;
use tracing::trace;

use super::super::constants::*;
use super::super::error::{KafkaError, Result};
use super::super::messages::KafkaResponse;

/// Read the correlation id at the start of a response frame without
/// consuming it. Every response header version starts with it.
pub fn peek_correlation_id(frame: &[u8]) -> Option<i32> {
    if frame.len() < 4 {
        return None;
    }
    Some((&frame[..4]).get_i32())
}

/// Decode a response frame into (correlation_id, response)
pub fn decode_response(
    mut frame: BytesMut,
    api_key: i16,
    api_version: i16,
) -> Result<(i32, KafkaResponse)> {
    let header_version = get_response_header_version(api_key, api_version);
    let header = ResponseHeader::decode(&mut frame, header_version)?;
    trace!(
        "Decoding {} v{} response, correlation_id={}, {} body bytes",
        api_name(api_key),
        api_version,
        header.correlation_id,
        frame.len()
    );

    let buf = &mut frame;
    let response = match api_key {
        API_KEY_PRODUCE => KafkaResponse::Produce(ProduceResponse::decode(buf, api_version)?),
        API_KEY_FETCH => KafkaResponse::Fetch(FetchResponse::decode(buf, api_version)?),
        API_KEY_LIST_OFFSETS => {
            KafkaResponse::ListOffsets(ListOffsetsResponse::decode(buf, api_version)?)
        }
        API_KEY_METADATA => KafkaResponse::Metadata(MetadataResponse::decode(buf, api_version)?),
        API_KEY_OFFSET_COMMIT => {
            KafkaResponse::OffsetCommit(OffsetCommitResponse::decode(buf, api_version)?)
        }
        API_KEY_OFFSET_FETCH => {
            KafkaResponse::OffsetFetch(OffsetFetchResponse::decode(buf, api_version)?)
        }
        API_KEY_FIND_COORDINATOR => {
            KafkaResponse::FindCoordinator(FindCoordinatorResponse::decode(buf, api_version)?)
        }
        API_KEY_JOIN_GROUP => KafkaResponse::JoinGroup(JoinGroupResponse::decode(buf, api_version)?),
        API_KEY_SYNC_GROUP => KafkaResponse::SyncGroup(SyncGroupResponse::decode(buf, api_version)?),
        API_KEY_HEARTBEAT => KafkaResponse::Heartbeat(HeartbeatResponse::decode(buf, api_version)?),
        API_KEY_LEAVE_GROUP => {
            KafkaResponse::LeaveGroup(LeaveGroupResponse::decode(buf, api_version)?)
        }
        other => {
            return Err(KafkaError::Encoding(format!(
                "no decoder for api_key {} ({})",
                other,
                api_name(other)
            )))
        }
    };

    Ok((header.correlation_id, response))
}

/// Decode a request frame the way a broker would. Only the test broker
/// needs this.
#[cfg(test)]
pub(crate) fn decode_request(
    mut frame: BytesMut,
) -> Result<(kafka_protocol::messages::RequestHeader, super::super::messages::KafkaRequest)> {
    use super::super::messages::KafkaRequest;
    use kafka_protocol::messages::{
        FetchRequest, FindCoordinatorRequest, HeartbeatRequest, JoinGroupRequest,
        LeaveGroupRequest, ListOffsetsRequest, MetadataRequest, OffsetCommitRequest,
        OffsetFetchRequest, ProduceRequest, SyncGroupRequest,
    };
    use kafka_protocol::protocol::decode_request_header_from_buffer;

    let header = decode_request_header_from_buffer(&mut frame)?;
    let v = header.request_api_version;
    let buf = &mut frame;
    let request = match header.request_api_key {
        API_KEY_PRODUCE => KafkaRequest::Produce(ProduceRequest::decode(buf, v)?),
        API_KEY_FETCH => KafkaRequest::Fetch(FetchRequest::decode(buf, v)?),
        API_KEY_LIST_OFFSETS => KafkaRequest::ListOffsets(ListOffsetsRequest::decode(buf, v)?),
        API_KEY_METADATA => KafkaRequest::Metadata(MetadataRequest::decode(buf, v)?),
        API_KEY_OFFSET_COMMIT => KafkaRequest::OffsetCommit(OffsetCommitRequest::decode(buf, v)?),
        API_KEY_OFFSET_FETCH => KafkaRequest::OffsetFetch(OffsetFetchRequest::decode(buf, v)?),
        API_KEY_FIND_COORDINATOR => {
            KafkaRequest::FindCoordinator(FindCoordinatorRequest::decode(buf, v)?)
        }
        API_KEY_JOIN_GROUP => KafkaRequest::JoinGroup(JoinGroupRequest::decode(buf, v)?),
        API_KEY_SYNC_GROUP => KafkaRequest::SyncGroup(SyncGroupRequest::decode(buf, v)?),
        API_KEY_HEARTBEAT => KafkaRequest::Heartbeat(HeartbeatRequest::decode(buf, v)?),
        API_KEY_LEAVE_GROUP => KafkaRequest::LeaveGroup(LeaveGroupRequest::decode(buf, v)?),
        other => {
            return Err(KafkaError::Encoding(format!(
                "unsupported api_key {} ({})",
                other,
                api_name(other)
            )))
        }
    };
    Ok((header, request))
}
