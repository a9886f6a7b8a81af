//! Test helper functions
//!
//! Builders for protocol fixtures and client configs pointed at a MockBroker.

use std::time::Duration;

use bytes::Bytes;
use kafka_protocol::messages::metadata_response::{
    MetadataResponseBroker, MetadataResponsePartition, MetadataResponseTopic,
};
use kafka_protocol::messages::produce_request::{PartitionProduceData, TopicProduceData};
use kafka_protocol::messages::produce_response::{PartitionProduceResponse, TopicProduceResponse};
use kafka_protocol::messages::{
    BrokerId, MetadataResponse, ProduceRequest, ProduceResponse, TopicName,
};
use kafka_protocol::protocol::StrBytes;
use kafka_protocol::records::Compression;

use super::mock_broker::MockBroker;
use crate::config::{ClientConfig, ConsumerConfig, OffsetReset};
use crate::kafka::messages::{KafkaRequest, KafkaResponse, ProducerRecord};
use crate::kafka::protocol::encode_record_batch;

pub fn topic_name(topic: &str) -> TopicName {
    TopicName(StrBytes::from_string(topic.to_string()))
}

/// Client config with short timeouts and backoff, bootstrapping from `broker`
pub fn fast_client_config(broker: &MockBroker) -> ClientConfig {
    let mut config = ClientConfig::new(&broker.addr()).with_client_id("test-client");
    config.request_timeout = Duration::from_secs(5);
    config.retries = 5;
    config.retry_backoff = Duration::from_millis(10);
    config.retry_backoff_max = Duration::from_millis(100);
    config
}

/// Consumer config with group timings scaled down for tests
pub fn fast_consumer_config(broker: &MockBroker, reset: OffsetReset) -> ConsumerConfig {
    let mut config = ConsumerConfig::new(fast_client_config(broker));
    config.session_timeout = Duration::from_millis(600);
    config.heartbeat_interval = Duration::from_millis(50);
    config.rebalance_timeout = Duration::from_secs(2);
    config.auto_offset_reset = reset;
    config.auto_commit_interval = Duration::from_millis(100);
    config.fetch_max_wait = Duration::from_millis(50);
    config
}

/// Metadata response listing `brokers` as (node_id, host, port) and one
/// topic with (partition, leader) entries
pub fn metadata_response(
    brokers: &[(i32, &str, i32)],
    topic: &str,
    partitions: &[(i32, i32)],
) -> MetadataResponse {
    let mut response = MetadataResponse::default();
    for (node_id, host, port) in brokers {
        let mut broker = MetadataResponseBroker::default();
        broker.node_id = BrokerId(*node_id);
        broker.host = StrBytes::from_string(host.to_string());
        broker.port = *port;
        response.brokers.push(broker);
    }

    let mut t = MetadataResponseTopic::default();
    t.name = Some(topic_name(topic));
    for (partition, leader) in partitions {
        let mut p = MetadataResponsePartition::default();
        p.partition_index = *partition;
        p.leader_id = BrokerId(*leader);
        p.replica_nodes = vec![BrokerId(*leader)];
        p.isr_nodes = vec![BrokerId(*leader)];
        t.partitions.push(p);
    }
    response.topics.push(t);
    response
}

/// Produce request carrying one batch of keyless `values`
pub fn produce_request(topic: &str, partition: i32, values: &[&str]) -> KafkaRequest {
    let records: Vec<ProducerRecord> = values
        .iter()
        .map(|v| ProducerRecord::new(topic, None, v.as_bytes().to_vec()))
        .collect();
    let batch: Bytes = encode_record_batch(&records, Compression::None).unwrap();

    let mut p = PartitionProduceData::default();
    p.index = partition;
    p.records = Some(batch);
    let mut t = TopicProduceData::default();
    t.name = topic_name(topic);
    t.partition_data.push(p);

    let mut request = ProduceRequest::default();
    request.acks = 1;
    request.timeout_ms = 1_000;
    request.topic_data.push(t);
    KafkaRequest::Produce(request)
}

/// Produce response for one topic with (partition, error_code, base_offset)
/// entries
pub fn produce_response(topic: &str, partitions: &[(i32, i16, i64)]) -> KafkaResponse {
    let mut t = TopicProduceResponse::default();
    t.name = topic_name(topic);
    for (partition, code, base_offset) in partitions {
        let mut p = PartitionProduceResponse::default();
        p.index = *partition;
        p.error_code = *code;
        p.base_offset = *base_offset;
        p.log_append_time_ms = -1;
        t.partition_responses.push(p);
    }
    let mut response = ProduceResponse::default();
    response.responses.push(t);
    KafkaResponse::Produce(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_produce_request_fixture() {
        let KafkaRequest::Produce(request) = produce_request("orders", 2, &["a", "b"]) else {
            panic!("not a produce request");
        };
        let data = &request.topic_data[0];
        assert_eq!(data.name.0.as_str(), "orders");
        assert_eq!(data.partition_data[0].index, 2);
        let records = crate::kafka::protocol::decode_produced_records(
            data.partition_data[0].records.as_ref().unwrap(),
        )
        .unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_metadata_fixture() {
        let response = metadata_response(&[(3, "h", 1)], "t", &[(0, 3)]);
        assert_eq!(response.brokers[0].node_id.0, 3);
        assert_eq!(response.topics[0].partitions[0].leader_id.0, 3);
    }
}
