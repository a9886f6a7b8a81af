//! In-process TCP broker for tests
//!
//! Speaks the same framing and codecs as a real broker (LengthDelimitedCodec
//! plus kafka-protocol) for every API the client uses. Topics live in memory
//! as per-partition logs; group traffic goes to a [`GroupCoordinator`].
//! Requests on one connection are answered in order, one at a time, like a
//! real broker.
//!
//! Faults are injected per API key: drop the connection instead of
//! answering, or answer with an error code without applying the request.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use kafka_protocol::messages::fetch_response::{FetchableTopicResponse, PartitionData};
use kafka_protocol::messages::list_offsets_response::{
    ListOffsetsPartitionResponse, ListOffsetsTopicResponse,
};
use kafka_protocol::messages::metadata_response::{
    MetadataResponseBroker, MetadataResponsePartition, MetadataResponseTopic,
};
use kafka_protocol::messages::produce_response::{PartitionProduceResponse, TopicProduceResponse};
use kafka_protocol::messages::{
    BrokerId, FetchRequest, FetchResponse, FindCoordinatorRequest, FindCoordinatorResponse,
    ListOffsetsRequest, ListOffsetsResponse, MetadataRequest, MetadataResponse, ProduceRequest,
    ProduceResponse, TopicName,
};
use kafka_protocol::protocol::StrBytes;
use kafka_protocol::records::{
    Compression, Record, RecordBatchEncoder, RecordEncodeOptions, TimestampType,
};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::mock_coordinator::{join_error, sync_error, GroupCoordinator, Reply};
use crate::kafka::constants::*;
use crate::kafka::messages::{now_millis, ConsumerRecord, KafkaRequest, KafkaResponse, RecordHeader};
use crate::kafka::protocol::{decode_produced_records, decode_request, encode_response};

const COORDINATOR_TICK: Duration = Duration::from_millis(10);

/// A scripted misbehaviour for the next `times` requests of one API
#[derive(Debug, Clone)]
pub enum Fault {
    /// Close the socket instead of answering
    DropConnection { api_key: i16, times: u32 },
    /// Answer with `code` without applying the request
    ErrorCode { api_key: i16, code: i16, times: u32 },
}

impl Fault {
    fn api_key(&self) -> i16 {
        match self {
            Fault::DropConnection { api_key, .. } | Fault::ErrorCode { api_key, .. } => *api_key,
        }
    }

    /// Use up one occurrence; true when none are left
    fn consume(&mut self) -> bool {
        let times = match self {
            Fault::DropConnection { times, .. } | Fault::ErrorCode { times, .. } => times,
        };
        *times = times.saturating_sub(1);
        *times == 0
    }
}

#[derive(Default)]
struct PartitionLog {
    log_start: i64,
    records: Vec<ConsumerRecord>,
}

impl PartitionLog {
    fn end(&self) -> i64 {
        self.log_start + self.records.len() as i64
    }
}

struct BrokerState {
    node_id: i32,
    addr: SocketAddr,
    topics: Mutex<BTreeMap<String, Vec<PartitionLog>>>,
    appended: Notify,
    faults: Mutex<Vec<Fault>>,
    connections: AtomicUsize,
    produce_delay: Mutex<Duration>,
    batch_sizes: Mutex<HashMap<String, Vec<usize>>>,
    coordinator: GroupCoordinator,
}

pub struct MockBroker {
    state: Arc<BrokerState>,
    shutdown: CancellationToken,
}

impl MockBroker {
    /// Listen on an ephemeral localhost port as broker `node_id`
    pub async fn start(node_id: i32) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock broker");
        let addr = listener.local_addr().expect("mock broker address");
        let state = Arc::new(BrokerState {
            node_id,
            addr,
            topics: Mutex::new(BTreeMap::new()),
            appended: Notify::new(),
            faults: Mutex::new(Vec::new()),
            connections: AtomicUsize::new(0),
            produce_delay: Mutex::new(Duration::ZERO),
            batch_sizes: Mutex::new(HashMap::new()),
            coordinator: GroupCoordinator::default(),
        });
        let shutdown = CancellationToken::new();

        tokio::spawn(accept_loop(listener, state.clone(), shutdown.clone()));

        let ticker_state = state.clone();
        let ticker_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(COORDINATOR_TICK);
            loop {
                tokio::select! {
                    _ = ticker_shutdown.cancelled() => return,
                    _ = ticker.tick() => ticker_state.coordinator.tick(),
                }
            }
        });

        debug!("Mock broker {} listening on {}", node_id, addr);
        Self { state, shutdown }
    }

    pub fn addr(&self) -> String {
        self.state.addr.to_string()
    }

    pub fn node_id(&self) -> i32 {
        self.state.node_id
    }

    pub fn create_topic(&self, topic: &str, partitions: i32) {
        let logs = (0..partitions).map(|_| PartitionLog::default()).collect();
        self.state.topics.lock().insert(topic.to_string(), logs);
    }

    /// Append keyless records with the given values
    pub fn append(&self, topic: &str, partition: i32, values: &[&str]) {
        {
            let mut topics = self.state.topics.lock();
            let log = topics
                .get_mut(topic)
                .and_then(|logs| logs.get_mut(partition as usize))
                .expect("append to unknown partition");
            for value in values {
                let offset = log.end();
                log.records.push(ConsumerRecord {
                    topic: topic.to_string(),
                    partition,
                    offset,
                    key: None,
                    value: Some(value.as_bytes().to_vec()),
                    headers: Vec::new(),
                    timestamp: now_millis(),
                });
            }
        }
        self.state.appended.notify_waiters();
    }

    /// Drop records below `offset`, moving the log start forward
    pub fn delete_records(&self, topic: &str, partition: i32, offset: i64) {
        let mut topics = self.state.topics.lock();
        let log = topics
            .get_mut(topic)
            .and_then(|logs| logs.get_mut(partition as usize))
            .expect("delete from unknown partition");
        let drop = (offset - log.log_start).clamp(0, log.records.len() as i64) as usize;
        log.records.drain(..drop);
        log.log_start += drop as i64;
    }

    /// Everything stored in a partition, in offset order
    pub fn records(&self, topic: &str, partition: i32) -> Vec<ConsumerRecord> {
        self.state
            .topics
            .lock()
            .get(topic)
            .and_then(|logs| logs.get(partition as usize))
            .map(|log| log.records.clone())
            .unwrap_or_default()
    }

    /// Record count of every produce batch accepted for `topic`
    pub fn produced_batch_sizes(&self, topic: &str) -> Vec<usize> {
        self.state
            .batch_sizes
            .lock()
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    pub fn inject(&self, fault: Fault) {
        self.state.faults.lock().push(fault);
    }

    /// Connections accepted so far
    pub fn connection_count(&self) -> usize {
        self.state.connections.load(Ordering::Acquire)
    }

    /// Hold every produce request this long before applying it
    pub fn set_produce_delay(&self, delay: Duration) {
        *self.state.produce_delay.lock() = delay;
    }

    pub fn coordinator(&self) -> &GroupCoordinator {
        &self.state.coordinator
    }
}

impl Drop for MockBroker {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn accept_loop(listener: TcpListener, state: Arc<BrokerState>, shutdown: CancellationToken) {
    loop {
        let stream = tokio::select! {
            _ = shutdown.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(_) => continue,
            },
        };
        state.connections.fetch_add(1, Ordering::AcqRel);
        tokio::spawn(serve_connection(stream, state.clone(), shutdown.child_token()));
    }
}

async fn serve_connection(stream: TcpStream, state: Arc<BrokerState>, shutdown: CancellationToken) {
    let codec = LengthDelimitedCodec::builder()
        .max_frame_length(MAX_RESPONSE_SIZE as usize)
        .new_codec();
    let mut framed = Framed::new(stream, codec);

    loop {
        let frame: BytesMut = tokio::select! {
            _ = shutdown.cancelled() => return,
            frame = framed.next() => match frame {
                Some(Ok(frame)) => frame,
                _ => return,
            },
        };
        let (header, request) = match decode_request(frame) {
            Ok(decoded) => decoded,
            Err(e) => {
                debug!("Mock broker dropping undecodable request: {}", e);
                return;
            }
        };
        trace!(
            "Mock broker {} <- {} (correlation {})",
            state.node_id,
            api_name(header.request_api_key),
            header.correlation_id
        );

        let response = match state.take_fault(request.api_key()) {
            Some(Fault::DropConnection { .. }) => {
                debug!("Mock broker dropping connection on {}", api_name(request.api_key()));
                return;
            }
            Some(Fault::ErrorCode { code, .. }) => error_response(&request, code),
            None => {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    response = state.handle(request) => response,
                }
            }
        };

        let encoded = match encode_response(&response, header.correlation_id, header.request_api_version) {
            Ok(encoded) => encoded,
            Err(e) => {
                debug!("Mock broker failed to encode response: {}", e);
                return;
            }
        };
        if framed.send(encoded.freeze()).await.is_err() {
            return;
        }
    }
}

impl BrokerState {
    fn take_fault(&self, api_key: i16) -> Option<Fault> {
        let mut faults = self.faults.lock();
        let index = faults.iter().position(|f| f.api_key() == api_key)?;
        let fault = faults[index].clone();
        if faults[index].consume() {
            faults.remove(index);
        }
        Some(fault)
    }

    async fn handle(&self, request: KafkaRequest) -> KafkaResponse {
        match request {
            KafkaRequest::Metadata(r) => KafkaResponse::Metadata(self.metadata(&r)),
            KafkaRequest::Produce(r) => KafkaResponse::Produce(self.produce(&r).await),
            KafkaRequest::Fetch(r) => KafkaResponse::Fetch(self.fetch(&r).await),
            KafkaRequest::ListOffsets(r) => KafkaResponse::ListOffsets(self.list_offsets(&r)),
            KafkaRequest::FindCoordinator(r) => KafkaResponse::FindCoordinator(self.find_coordinator(&r)),
            KafkaRequest::JoinGroup(r) => KafkaResponse::JoinGroup(match self.coordinator.join(&r) {
                Reply::Now(response) => response,
                Reply::Later(rx) => rx
                    .await
                    .unwrap_or_else(|_| join_error(ERROR_REBALANCE_IN_PROGRESS, "")),
            }),
            KafkaRequest::SyncGroup(r) => KafkaResponse::SyncGroup(match self.coordinator.sync(&r) {
                Reply::Now(response) => response,
                Reply::Later(rx) => rx
                    .await
                    .unwrap_or_else(|_| sync_error(ERROR_REBALANCE_IN_PROGRESS)),
            }),
            KafkaRequest::Heartbeat(r) => KafkaResponse::Heartbeat(self.coordinator.heartbeat(&r)),
            KafkaRequest::LeaveGroup(r) => KafkaResponse::LeaveGroup(self.coordinator.leave(&r)),
            KafkaRequest::OffsetCommit(r) => KafkaResponse::OffsetCommit(self.coordinator.commit(&r)),
            KafkaRequest::OffsetFetch(r) => {
                KafkaResponse::OffsetFetch(self.coordinator.fetch_offsets(&r))
            }
        }
    }

    fn broker_entry(&self) -> MetadataResponseBroker {
        let mut broker = MetadataResponseBroker::default();
        broker.node_id = BrokerId(self.node_id);
        broker.host = StrBytes::from_string(self.addr.ip().to_string());
        broker.port = self.addr.port() as i32;
        broker
    }

    fn metadata(&self, request: &MetadataRequest) -> MetadataResponse {
        let topics = self.topics.lock();
        let requested: Vec<String> = match &request.topics {
            Some(list) if !list.is_empty() => list
                .iter()
                .filter_map(|t| t.name.as_ref().map(|n| n.0.to_string()))
                .collect(),
            _ => topics.keys().cloned().collect(),
        };

        let mut response = MetadataResponse::default();
        response.brokers.push(self.broker_entry());
        response.controller_id = BrokerId(self.node_id);
        response.cluster_id = Some(StrBytes::from_static_str("mock-cluster"));
        for name in requested {
            let mut topic = MetadataResponseTopic::default();
            topic.name = Some(TopicName(StrBytes::from_string(name.clone())));
            match topics.get(&name) {
                None => topic.error_code = ERROR_UNKNOWN_TOPIC_OR_PARTITION,
                Some(logs) => {
                    for index in 0..logs.len() as i32 {
                        let mut p = MetadataResponsePartition::default();
                        p.partition_index = index;
                        p.leader_id = BrokerId(self.node_id);
                        p.leader_epoch = 0;
                        p.replica_nodes = vec![BrokerId(self.node_id)];
                        p.isr_nodes = vec![BrokerId(self.node_id)];
                        topic.partitions.push(p);
                    }
                }
            }
            response.topics.push(topic);
        }
        response
    }

    async fn produce(&self, request: &ProduceRequest) -> ProduceResponse {
        let delay = *self.produce_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut response = ProduceResponse::default();
        {
            let mut topics = self.topics.lock();
            for data in &request.topic_data {
                let name = data.name.0.to_string();
                let mut t = TopicProduceResponse::default();
                t.name = data.name.clone();
                for p in &data.partition_data {
                    let mut entry = PartitionProduceResponse::default();
                    entry.index = p.index;
                    entry.log_append_time_ms = -1;
                    match topics.get_mut(&name).and_then(|logs| logs.get_mut(p.index as usize)) {
                        None => {
                            entry.error_code = ERROR_UNKNOWN_TOPIC_OR_PARTITION;
                            entry.base_offset = -1;
                        }
                        Some(log) => {
                            let base = log.end();
                            let records = p
                                .records
                                .as_ref()
                                .map(|bytes| decode_produced_records(bytes))
                                .transpose();
                            match records {
                                Ok(records) => {
                                    let records = records.unwrap_or_default();
                                    self.batch_sizes
                                        .lock()
                                        .entry(name.clone())
                                        .or_default()
                                        .push(records.len());
                                    for (i, record) in records.into_iter().enumerate() {
                                        log.records.push(stored_record(&name, p.index, base + i as i64, record));
                                    }
                                    entry.base_offset = base;
                                    entry.log_start_offset = log.log_start;
                                }
                                Err(_) => {
                                    entry.error_code = ERROR_CORRUPT_MESSAGE;
                                    entry.base_offset = -1;
                                }
                            }
                        }
                    }
                    t.partition_responses.push(entry);
                }
                response.responses.push(t);
            }
        }
        self.appended.notify_waiters();
        response
    }

    /// Answer once `min_bytes` are available or `max_wait_ms` has passed
    async fn fetch(&self, request: &FetchRequest) -> FetchResponse {
        let deadline = Instant::now() + Duration::from_millis(request.max_wait_ms.max(0) as u64);
        loop {
            let appended = self.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            let (response, bytes, errors) = self.read_fetch(request);
            if errors || bytes >= request.min_bytes.max(0) as usize || Instant::now() >= deadline {
                return response;
            }
            tokio::select! {
                _ = appended => {}
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
    }

    fn read_fetch(&self, request: &FetchRequest) -> (FetchResponse, usize, bool) {
        let topics = self.topics.lock();
        let mut response = FetchResponse::default();
        let mut total = 0;
        let mut errors = false;
        for topic in &request.topics {
            let name = topic.topic.0.to_string();
            let mut t = FetchableTopicResponse::default();
            t.topic = topic.topic.clone();
            for p in &topic.partitions {
                let mut data = PartitionData::default();
                data.partition_index = p.partition;
                data.preferred_read_replica = BrokerId(-1);
                match topics.get(&name).and_then(|logs| logs.get(p.partition as usize)) {
                    None => {
                        data.error_code = ERROR_UNKNOWN_TOPIC_OR_PARTITION;
                        errors = true;
                    }
                    Some(log) if p.fetch_offset < log.log_start || p.fetch_offset > log.end() => {
                        data.error_code = ERROR_OFFSET_OUT_OF_RANGE;
                        data.high_watermark = log.end();
                        data.log_start_offset = log.log_start;
                        errors = true;
                    }
                    Some(log) => {
                        data.high_watermark = log.end();
                        data.last_stable_offset = log.end();
                        data.log_start_offset = log.log_start;
                        let from = (p.fetch_offset - log.log_start) as usize;
                        let mut selected = Vec::new();
                        let mut size = 0usize;
                        for record in &log.records[from..] {
                            let record_size = record.value.as_ref().map_or(0, Vec::len)
                                + record.key.as_ref().map_or(0, Vec::len)
                                + RECORD_OVERHEAD_BYTES;
                            if !selected.is_empty() && size + record_size > p.partition_max_bytes.max(0) as usize {
                                break;
                            }
                            size += record_size;
                            selected.push(record);
                        }
                        if !selected.is_empty() {
                            let batch = encode_stored(&selected);
                            total += batch.len();
                            data.records = Some(batch);
                        }
                    }
                }
                t.partitions.push(data);
            }
            response.responses.push(t);
        }
        (response, total, errors)
    }

    fn list_offsets(&self, request: &ListOffsetsRequest) -> ListOffsetsResponse {
        let topics = self.topics.lock();
        let mut response = ListOffsetsResponse::default();
        for topic in &request.topics {
            let name = topic.name.0.to_string();
            let mut t = ListOffsetsTopicResponse::default();
            t.name = topic.name.clone();
            for p in &topic.partitions {
                let mut entry = ListOffsetsPartitionResponse::default();
                entry.partition_index = p.partition_index;
                entry.timestamp = -1;
                match topics.get(&name).and_then(|logs| logs.get(p.partition_index as usize)) {
                    None => {
                        entry.error_code = ERROR_UNKNOWN_TOPIC_OR_PARTITION;
                        entry.offset = -1;
                    }
                    Some(log) => {
                        entry.offset = match p.timestamp {
                            EARLIEST_TIMESTAMP => log.log_start,
                            LATEST_TIMESTAMP => log.end(),
                            ts => log
                                .records
                                .iter()
                                .find(|r| r.timestamp >= ts)
                                .map_or(log.end(), |r| r.offset),
                        };
                    }
                }
                t.partitions.push(entry);
            }
            response.topics.push(t);
        }
        response
    }

    fn find_coordinator(&self, _request: &FindCoordinatorRequest) -> FindCoordinatorResponse {
        let mut response = FindCoordinatorResponse::default();
        response.node_id = BrokerId(self.node_id);
        response.host = StrBytes::from_string(self.addr.ip().to_string());
        response.port = self.addr.port() as i32;
        response
    }
}

fn stored_record(topic: &str, partition: i32, offset: i64, record: Record) -> ConsumerRecord {
    ConsumerRecord {
        topic: topic.to_string(),
        partition,
        offset,
        key: record.key.map(|k| k.to_vec()),
        value: record.value.map(|v| v.to_vec()),
        headers: record
            .headers
            .into_iter()
            .map(|(k, v)| RecordHeader {
                key: k.to_string(),
                value: v.map(|b| b.to_vec()).unwrap_or_default(),
            })
            .collect(),
        timestamp: record.timestamp,
    }
}

/// One v2 batch carrying the records' real log offsets
fn encode_stored(records: &[&ConsumerRecord]) -> Bytes {
    let encoded: Vec<Record> = records
        .iter()
        .map(|r| {
            let mut record = Record {
                transactional: false,
                control: false,
                partition_leader_epoch: 0,
                producer_id: -1,
                producer_epoch: -1,
                timestamp_type: TimestampType::Creation,
                offset: r.offset,
                sequence: -1,
                timestamp: r.timestamp,
                key: r.key.as_ref().map(|k| Bytes::copy_from_slice(k)),
                value: r.value.as_ref().map(|v| Bytes::copy_from_slice(v)),
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
    let mut buf = BytesMut::new();
    RecordBatchEncoder::encode(
        &mut buf,
        encoded.iter(),
        &RecordEncodeOptions {
            version: 2,
            compression: Compression::None,
        },
    )
    .expect("encode mock fetch batch");
    buf.freeze()
}

/// Answer `request` with `code` everywhere an error code fits
fn error_response(request: &KafkaRequest, code: i16) -> KafkaResponse {
    use kafka_protocol::messages::*;

    match request {
        KafkaRequest::Produce(r) => {
            let mut response = ProduceResponse::default();
            for data in &r.topic_data {
                let mut t = TopicProduceResponse::default();
                t.name = data.name.clone();
                for p in &data.partition_data {
                    let mut entry = PartitionProduceResponse::default();
                    entry.index = p.index;
                    entry.error_code = code;
                    entry.base_offset = -1;
                    entry.log_append_time_ms = -1;
                    t.partition_responses.push(entry);
                }
                response.responses.push(t);
            }
            KafkaResponse::Produce(response)
        }
        KafkaRequest::Fetch(r) => {
            let mut response = FetchResponse::default();
            for topic in &r.topics {
                let mut t = FetchableTopicResponse::default();
                t.topic = topic.topic.clone();
                for p in &topic.partitions {
                    let mut data = PartitionData::default();
                    data.partition_index = p.partition;
                    data.error_code = code;
                    data.high_watermark = -1;
                    data.preferred_read_replica = BrokerId(-1);
                    t.partitions.push(data);
                }
                response.responses.push(t);
            }
            KafkaResponse::Fetch(response)
        }
        KafkaRequest::ListOffsets(r) => {
            let mut response = ListOffsetsResponse::default();
            for topic in &r.topics {
                let mut t = ListOffsetsTopicResponse::default();
                t.name = topic.name.clone();
                for p in &topic.partitions {
                    let mut entry = ListOffsetsPartitionResponse::default();
                    entry.partition_index = p.partition_index;
                    entry.error_code = code;
                    entry.offset = -1;
                    t.partitions.push(entry);
                }
                response.topics.push(t);
            }
            KafkaResponse::ListOffsets(response)
        }
        KafkaRequest::Metadata(r) => {
            let mut response = MetadataResponse::default();
            for topic in r.topics.iter().flatten() {
                let mut t = MetadataResponseTopic::default();
                t.name = topic.name.clone();
                t.error_code = code;
                response.topics.push(t);
            }
            KafkaResponse::Metadata(response)
        }
        KafkaRequest::OffsetCommit(r) => {
            let mut response = OffsetCommitResponse::default();
            for topic in &r.topics {
                let mut t = offset_commit_response::OffsetCommitResponseTopic::default();
                t.name = topic.name.clone();
                for p in &topic.partitions {
                    let mut entry = offset_commit_response::OffsetCommitResponsePartition::default();
                    entry.partition_index = p.partition_index;
                    entry.error_code = code;
                    t.partitions.push(entry);
                }
                response.topics.push(t);
            }
            KafkaResponse::OffsetCommit(response)
        }
        KafkaRequest::OffsetFetch(_) => {
            let mut response = OffsetFetchResponse::default();
            response.error_code = code;
            KafkaResponse::OffsetFetch(response)
        }
        KafkaRequest::FindCoordinator(_) => {
            let mut response = FindCoordinatorResponse::default();
            response.error_code = code;
            response.node_id = BrokerId(-1);
            KafkaResponse::FindCoordinator(response)
        }
        KafkaRequest::JoinGroup(_) => KafkaResponse::JoinGroup(join_error(code, "")),
        KafkaRequest::SyncGroup(_) => KafkaResponse::SyncGroup(sync_error(code)),
        KafkaRequest::Heartbeat(_) => {
            let mut response = HeartbeatResponse::default();
            response.error_code = code;
            KafkaResponse::Heartbeat(response)
        }
        KafkaRequest::LeaveGroup(_) => {
            let mut response = LeaveGroupResponse::default();
            response.error_code = code;
            KafkaResponse::LeaveGroup(response)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kafka::protocol::decode_record_batches;

    #[tokio::test]
    async fn test_fetch_batch_carries_log_offsets() {
        let broker = MockBroker::start(1).await;
        broker.create_topic("t", 1);
        broker.append("t", 0, &["a", "b", "c", "d"]);
        broker.delete_records("t", 0, 2);

        let records = broker.records("t", 0);
        assert_eq!(records.len(), 2);
        let refs: Vec<&ConsumerRecord> = records.iter().collect();
        let decoded = decode_record_batches("t", 0, &encode_stored(&refs), 0).unwrap();
        let offsets: Vec<i64> = decoded.iter().map(|r| r.offset).collect();
        assert_eq!(offsets, vec![2, 3]);
    }

    #[tokio::test]
    async fn test_faults_are_consumed() {
        let broker = MockBroker::start(1).await;
        broker.inject(Fault::ErrorCode {
            api_key: API_KEY_PRODUCE,
            code: ERROR_NOT_LEADER_OR_FOLLOWER,
            times: 2,
        });
        assert!(broker.state.take_fault(API_KEY_PRODUCE).is_some());
        assert!(broker.state.take_fault(API_KEY_FETCH).is_none());
        assert!(broker.state.take_fault(API_KEY_PRODUCE).is_some());
        assert!(broker.state.take_fault(API_KEY_PRODUCE).is_none());
    }
}
