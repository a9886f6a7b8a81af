// Single broker connection with request pipelining
//
// The socket is wrapped in LengthDelimitedCodec (Kafka's 4-byte big-endian
// size prefix) and split into independent halves:
// - Writer task: drains an unbounded channel of encoded requests onto the wire
// - Reader task: reads response frames, matches them to the waiting caller by
//   correlation id and decodes them with the key/version of the request
//
// Any number of requests may be outstanding. Kafka answers requests on one
// connection in order, but matching by correlation id does not depend on it.
//
// When the socket fails every outstanding request is completed with a
// Transport error and the connection is marked closed; the connection
// manager drops it and reconnects on next use.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::kafka::constants::{api_name, MAX_RESPONSE_SIZE};
use crate::kafka::error::{KafkaError, Result};
use crate::kafka::messages::{KafkaRequest, KafkaResponse, NodeId};
use crate::kafka::protocol;

type ResponseSender = oneshot::Sender<Result<KafkaResponse>>;

struct PendingRequest {
    api_key: i16,
    api_version: i16,
    reply: ResponseSender,
}

/// State shared between the handle and the reader/writer tasks
struct Inflight {
    pending: Mutex<HashMap<i32, PendingRequest>>,
    closed: AtomicBool,
}

impl Inflight {
    /// Register a request unless the connection is already closed. The
    /// closed check happens under the map lock so `fail_all` cannot miss it.
    fn register(&self, correlation_id: i32, request: PendingRequest) -> Result<()> {
        let mut pending = self.pending.lock();
        if self.closed.load(Ordering::Acquire) {
            return Err(KafkaError::Transport("connection closed".to_string()));
        }
        pending.insert(correlation_id, request);
        Ok(())
    }

    fn take(&self, correlation_id: i32) -> Option<PendingRequest> {
        self.pending.lock().remove(&correlation_id)
    }

    fn fail_all(&self, reason: &str) {
        let drained: Vec<PendingRequest> = {
            let mut pending = self.pending.lock();
            self.closed.store(true, Ordering::Release);
            pending.drain().map(|(_, p)| p).collect()
        };
        if !drained.is_empty() {
            debug!("Failing {} in-flight request(s): {}", drained.len(), reason);
        }
        for p in drained {
            let _ = p.reply.send(Err(KafkaError::Transport(reason.to_string())));
        }
    }

    fn len(&self) -> usize {
        self.pending.lock().len()
    }
}

/// A live session with one broker node
pub struct BrokerConnection {
    node_id: NodeId,
    addr: String,
    client_id: String,
    next_correlation_id: AtomicI32,
    inflight: Arc<Inflight>,
    request_tx: mpsc::UnboundedSender<Bytes>,
    last_used: Mutex<Instant>,
    shutdown: CancellationToken,
}

impl BrokerConnection {
    /// Open a TCP session and start the reader/writer tasks
    pub async fn connect(
        node_id: NodeId,
        addr: &str,
        client_id: &str,
        connect_timeout: Duration,
    ) -> Result<Arc<Self>> {
        let socket = match tokio::time::timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(socket)) => socket,
            Ok(Err(e)) => {
                return Err(KafkaError::Transport(format!(
                    "connect to {} failed: {}",
                    addr, e
                )))
            }
            Err(_) => {
                return Err(KafkaError::Transport(format!(
                    "connect to {} timed out after {:?}",
                    addr, connect_timeout
                )))
            }
        };
        if let Err(e) = socket.set_nodelay(true) {
            debug!("Could not set TCP_NODELAY on {}: {}", addr, e);
        }
        info!("Connected to broker node {} at {}", node_id, addr);

        let framed = Framed::new(
            socket,
            LengthDelimitedCodec::builder()
                .big_endian()
                .length_field_length(4)
                .max_frame_length(MAX_RESPONSE_SIZE as usize)
                .new_codec(),
        );
        let (mut writer, mut reader) = framed.split();
        let (request_tx, mut request_rx) = mpsc::unbounded_channel::<Bytes>();
        let inflight = Arc::new(Inflight {
            pending: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });
        let shutdown = CancellationToken::new();

        // Writer task
        {
            let inflight = inflight.clone();
            let shutdown = shutdown.clone();
            let addr = addr.to_string();
            tokio::spawn(async move {
                loop {
                    let frame = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        frame = request_rx.recv() => match frame {
                            Some(frame) => frame,
                            None => break,
                        },
                    };
                    if let Err(e) = writer.send(frame).await {
                        warn!("Write to {} failed: {}", addr, e);
                        inflight.fail_all(&format!("write to {} failed: {}", addr, e));
                        shutdown.cancel();
                        break;
                    }
                }
                let _ = writer.close().await;
                trace!("Writer for {} exiting", addr);
            });
        }

        // Reader task
        {
            let inflight = inflight.clone();
            let shutdown = shutdown.clone();
            let addr = addr.to_string();
            tokio::spawn(async move {
                let reason = loop {
                    let frame = tokio::select! {
                        _ = shutdown.cancelled() => break format!("connection to {} closed", addr),
                        frame = reader.next() => frame,
                    };
                    let frame = match frame {
                        Some(Ok(frame)) => frame,
                        Some(Err(e)) => {
                            warn!("Read from {} failed: {}", addr, e);
                            break format!("read from {} failed: {}", addr, e);
                        }
                        None => {
                            debug!("Broker {} closed the connection", addr);
                            break format!("connection to {} reset by broker", addr);
                        }
                    };

                    let Some(correlation_id) = protocol::peek_correlation_id(&frame) else {
                        warn!("Short response frame ({} bytes) from {}", frame.len(), addr);
                        continue;
                    };
                    let Some(request) = inflight.take(correlation_id) else {
                        debug!(
                            "Dropping response for unknown correlation_id {} from {}",
                            correlation_id, addr
                        );
                        continue;
                    };
                    let decoded =
                        protocol::decode_response(frame, request.api_key, request.api_version)
                            .map(|(_, response)| response);
                    if let Err(ref e) = decoded {
                        warn!(
                            "Failed to decode {} response from {}: {}",
                            api_name(request.api_key),
                            addr,
                            e
                        );
                    }
                    let _ = request.reply.send(decoded);
                };
                inflight.fail_all(&reason);
                shutdown.cancel();
                trace!("Reader for {} exiting", addr);
            });
        }

        Ok(Arc::new(Self {
            node_id,
            addr: addr.to_string(),
            client_id: client_id.to_string(),
            next_correlation_id: AtomicI32::new(1),
            inflight,
            request_tx,
            last_used: Mutex::new(Instant::now()),
            shutdown,
        }))
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_closed(&self) -> bool {
        self.inflight.closed.load(Ordering::Acquire)
    }

    pub fn in_flight(&self) -> usize {
        self.inflight.len()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.lock().elapsed()
    }

    /// Queue a request and return the receiver its response will arrive on.
    ///
    /// Does not wait; callers pipeline by dispatching several requests before
    /// awaiting any of them.
    pub fn dispatch(&self, request: KafkaRequest) -> Result<oneshot::Receiver<Result<KafkaResponse>>> {
        let correlation_id = self.next_correlation_id.fetch_add(1, Ordering::Relaxed);
        let api_key = request.api_key();
        let api_version = request.api_version();
        let frame = protocol::encode_request(&request, correlation_id, &self.client_id)?;

        let (reply, rx) = oneshot::channel();
        self.inflight
            .register(
                correlation_id,
                PendingRequest {
                    api_key,
                    api_version,
                    reply,
                },
            )
            .map_err(|_| {
                KafkaError::Transport(format!("connection to node {} closed", self.node_id))
            })?;
        *self.last_used.lock() = Instant::now();

        debug!(
            "Sending {} v{} (correlation_id={}) to node {}",
            api_name(api_key),
            api_version,
            correlation_id,
            self.node_id
        );
        if self.request_tx.send(frame.freeze()).is_err() {
            self.inflight.take(correlation_id);
            self.inflight.fail_all("writer stopped");
            return Err(KafkaError::Transport(format!(
                "connection to node {} closed",
                self.node_id
            )));
        }
        Ok(rx)
    }

    /// Wait for a dispatched request. A timeout closes the connection, since
    /// a late response would otherwise arrive for a request nobody awaits.
    pub async fn wait(
        &self,
        rx: oneshot::Receiver<Result<KafkaResponse>>,
        timeout: Duration,
    ) -> Result<KafkaResponse> {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(KafkaError::Transport(format!(
                "connection to node {} dropped the request",
                self.node_id
            ))),
            Err(_) => {
                warn!(
                    "Request to node {} timed out after {:?}, closing connection",
                    self.node_id, timeout
                );
                self.close();
                Err(KafkaError::Transport(format!(
                    "request to node {} timed out after {:?}",
                    self.node_id, timeout
                )))
            }
        }
    }

    /// Dispatch and wait
    pub async fn send(&self, request: KafkaRequest, timeout: Duration) -> Result<KafkaResponse> {
        let rx = self.dispatch(request)?;
        self.wait(rx, timeout).await
    }

    /// Stop both tasks and fail whatever is still outstanding
    pub fn close(&self) {
        if !self.is_closed() {
            debug!("Closing connection to node {} ({})", self.node_id, self.addr);
        }
        self.inflight.fail_all(&format!("connection to node {} closed", self.node_id));
        self.shutdown.cancel();
    }
}

impl Drop for BrokerConnection {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
