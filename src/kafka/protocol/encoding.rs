// Request encoding module
//
// Handles encoding of Kafka requests into binary wire protocol format.
// The size prefix is added by LengthDelimitedCodec, so the output here is
// [RequestHeader][RequestBody].

use bytes::BytesMut;
use kafka_protocol::messages::RequestHeader;
use kafka_protocol::protocol::{Encodable, StrBytes};

use super::super::constants;
use super::super::error::Result;
use super::super::messages::KafkaRequest;

/// Helper macro for encoding standard Kafka requests.
///
/// All requests follow the same pattern:
/// 1. Create RequestHeader with api key/version, correlation id and client id
/// 2. Look up header version based on API key and version
/// 3. Encode header, then encode body
macro_rules! encode_standard_request {
    ($buf:expr, $corr_id:expr, $client_id:expr, $api_key:expr, $api_ver:expr, $body:expr) => {{
        let header = RequestHeader::default()
            .with_request_api_key($api_key)
            .with_request_api_version($api_ver)
            .with_correlation_id($corr_id)
            .with_client_id(Some(StrBytes::from_string($client_id.to_string())));
        let header_version = constants::get_request_header_version($api_key, $api_ver);
        header.encode($buf, header_version)?;
        $body.encode($buf, $api_ver)?;
    }};
}

/// Encode a Kafka request into bytes
///
/// Returns the request payload (without size prefix).
pub fn encode_request(
    request: &KafkaRequest,
    correlation_id: i32,
    client_id: &str,
) -> Result<BytesMut> {
    let mut buf = BytesMut::new();
    let api_key = request.api_key();
    let api_version = request.api_version();

    match request {
        KafkaRequest::Produce(body) => {
            encode_standard_request!(&mut buf, correlation_id, client_id, api_key, api_version, body)
        }
        KafkaRequest::Fetch(body) => {
            encode_standard_request!(&mut buf, correlation_id, client_id, api_key, api_version, body)
        }
        KafkaRequest::ListOffsets(body) => {
            encode_standard_request!(&mut buf, correlation_id, client_id, api_key, api_version, body)
        }
        KafkaRequest::Metadata(body) => {
            encode_standard_request!(&mut buf, correlation_id, client_id, api_key, api_version, body)
        }
        KafkaRequest::OffsetCommit(body) => {
            encode_standard_request!(&mut buf, correlation_id, client_id, api_key, api_version, body)
        }
        KafkaRequest::OffsetFetch(body) => {
            encode_standard_request!(&mut buf, correlation_id, client_id, api_key, api_version, body)
        }
        KafkaRequest::FindCoordinator(body) => {
            encode_standard_request!(&mut buf, correlation_id, client_id, api_key, api_version, body)
        }
        KafkaRequest::JoinGroup(body) => {
            encode_standard_request!(&mut buf, correlation_id, client_id, api_key, api_version, body)
        }
        KafkaRequest::SyncGroup(body) => {
            encode_standard_request!(&mut buf, correlation_id, client_id, api_key, api_version, body)
        }
        KafkaRequest::Heartbeat(body) => {
            encode_standard_request!(&mut buf, correlation_id, client_id, api_key, api_version, body)
        }
        KafkaRequest::LeaveGroup(body) => {
            encode_standard_request!(&mut buf, correlation_id, client_id, api_key, api_version, body)
        }
    }

    Ok(buf)
}

/// Encode a response the way a broker would. Only the test broker needs this.
#[cfg(test)]
pub(crate) fn encode_response(
    response: &super::super::messages::KafkaResponse,
    correlation_id: i32,
    api_version: i16,
) -> Result<BytesMut> {
    use super::super::messages::KafkaResponse;
    use kafka_protocol::messages::ResponseHeader;

    macro_rules! encode_standard_response {
        ($buf:expr, $body:expr) => {{
            let header = ResponseHeader::default().with_correlation_id(correlation_id);
            let header_version =
                constants::get_response_header_version(response.api_key(), api_version);
            header.encode($buf, header_version)?;
            $body.encode($buf, api_version)?;
        }};
    }

    let mut buf = BytesMut::new();
    match response {
        KafkaResponse::Produce(body) => encode_standard_response!(&mut buf, body),
        KafkaResponse::Fetch(body) => encode_standard_response!(&mut buf, body),
        KafkaResponse::ListOffsets(body) => encode_standard_response!(&mut buf, body),
        KafkaResponse::Metadata(body) => encode_standard_response!(&mut buf, body),
        KafkaResponse::OffsetCommit(body) => encode_standard_response!(&mut buf, body),
        KafkaResponse::OffsetFetch(body) => encode_standard_response!(&mut buf, body),
        KafkaResponse::FindCoordinator(body) => encode_standard_response!(&mut buf, body),
        KafkaResponse::JoinGroup(body) => encode_standard_response!(&mut buf, body),
        KafkaResponse::SyncGroup(body) => encode_standard_response!(&mut buf, body),
        KafkaResponse::Heartbeat(body) => encode_standard_response!(&mut buf, body),
        KafkaResponse::LeaveGroup(body) => encode_standard_response!(&mut buf, body),
    }
    Ok(buf)
}
