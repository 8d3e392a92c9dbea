//! Request/response RPC over one worker's byte streams.
//!
//! Requests get a fresh numeric id and a oneshot slot in the pending map. A
//! writer task owns the worker's stdin and writes queued frames whole, one
//! after another. A reader task parses frames from the worker and completes
//! the slot with the matching id, so any number of calls can be outstanding
//! and complete in any order. Notifications are logged and otherwise ignored.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    futures::StreamExt,
    plughub_protocol::{
        CapabilityList, Frame, HandshakeResult, HostInfo, MAX_FRAME_BYTES, PROTOCOL_VERSION,
        ProtocolError, decode, encode,
    },
    serde_json::Value,
    tokio::{
        io::AsyncWriteExt,
        sync::{Mutex, mpsc, oneshot},
        task::JoinHandle,
    },
    tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError},
    tracing::{debug, trace, warn},
};

use crate::{
    error::{Error, FailureCode, InvocationFailure},
    launcher::{BoxedReader, BoxedWriter},
    types::qualify,
};

/// Name the host announces in its handshake.
pub const HOST_NAME: &str = "plughub";

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Frame>>>>;

/// Transport-level failure of a single request.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("channel closed")]
    Closed,
    #[error("worker error {code}: {message}")]
    Worker {
        code: i64,
        message: String,
        data: Option<Value>,
    },
    #[error("unexpected {0} frame in response")]
    Unexpected(&'static str),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

pub struct WorkerChannel {
    plugin: String,
    /// Queue feeding the writer task. `None` once the channel is closed.
    outbound: std::sync::Mutex<Option<mpsc::UnboundedSender<String>>>,
    pending: Pending,
    next_id: AtomicU64,
    closed: Arc<AtomicBool>,
    reader_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl WorkerChannel {
    /// Bind a channel to a worker's stdout (`reader`) and stdin (`writer`)
    /// and start the reader and writer tasks.
    pub fn new(plugin: &str, reader: BoxedReader, writer: BoxedWriter) -> Arc<Self> {
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let (outbound, queue) = mpsc::unbounded_channel();

        let handle = tokio::spawn(read_loop(
            plugin.to_string(),
            reader,
            Arc::clone(&pending),
            Arc::clone(&closed),
        ));
        tokio::spawn(write_loop(
            plugin.to_string(),
            writer,
            queue,
            Arc::clone(&pending),
            Arc::clone(&closed),
        ));

        Arc::new(Self {
            plugin: plugin.to_string(),
            outbound: std::sync::Mutex::new(Some(outbound)),
            pending,
            next_id: AtomicU64::new(1),
            closed,
            reader_handle: std::sync::Mutex::new(Some(handle)),
        })
    }

    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of requests still waiting for a response.
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Send one request and wait for its response payload.
    ///
    /// The frame is queued for the writer task and always written whole, so
    /// the timeout only bounds the wait for the reply. A timed-out request is
    /// forgotten; the channel stays usable.
    pub async fn call(
        &self,
        build: impl FnOnce(u64) -> Frame,
        timeout: Duration,
    ) -> Result<Value, ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let frame = build(id);
        let kind = frame.kind();
        let line = encode(&frame)?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);
        if self.is_closed() || !self.enqueue(line) {
            self.pending.lock().await.remove(&id);
            return Err(ChannelError::Closed);
        }

        trace!(plugin = %self.plugin, id, kind, "host -> worker");

        let response = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(frame)) => frame,
            Ok(Err(_)) => return Err(ChannelError::Closed),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                debug!(plugin = %self.plugin, id, kind, ?timeout, "request timed out");
                return Err(ChannelError::Timeout(timeout));
            },
        };

        match response {
            Frame::Reply { result, .. } => Ok(result),
            Frame::Error {
                code,
                message,
                data,
                ..
            } => Err(ChannelError::Worker {
                code,
                message,
                data,
            }),
            other => Err(ChannelError::Unexpected(other.kind())),
        }
    }

    fn enqueue(&self, line: String) -> bool {
        self.outbound
            .lock()
            .ok()
            .and_then(|outbound| outbound.as_ref().map(|tx| tx.send(line).is_ok()))
            .unwrap_or(false)
    }

    /// Exchange identities and check the protocol version. Any failure,
    /// including a malformed reply, is a handshake failure.
    pub async fn handshake(&self, timeout: Duration) -> Result<HandshakeResult, Error> {
        let fail = |reason: String| Error::Handshake {
            plugin: self.plugin.clone(),
            reason,
        };

        let value = self
            .call(
                |id| Frame::Handshake {
                    id,
                    protocol_version: PROTOCOL_VERSION,
                    host: HostInfo {
                        name: HOST_NAME.to_string(),
                        version: env!("CARGO_PKG_VERSION").to_string(),
                    },
                },
                timeout,
            )
            .await
            .map_err(|e| fail(e.to_string()))?;

        let result: HandshakeResult = serde_json::from_value(value)
            .map_err(|e| fail(format!("malformed handshake response: {e}")))?;

        if result.protocol_version != PROTOCOL_VERSION {
            return Err(fail(format!(
                "protocol version mismatch: worker speaks {}, host speaks {PROTOCOL_VERSION}",
                result.protocol_version
            )));
        }

        debug!(
            plugin = %self.plugin,
            worker = %result.name,
            version = ?result.version,
            "handshake complete"
        );
        Ok(result)
    }

    /// Ask the worker for its tools, resources and prompts. No retry.
    pub async fn query_capabilities(&self, timeout: Duration) -> Result<CapabilityList, Error> {
        let fail = |reason: String| Error::CapabilityQuery {
            plugin: self.plugin.clone(),
            reason,
        };

        let value = self
            .call(|id| Frame::ListCapabilities { id }, timeout)
            .await
            .map_err(|e| fail(e.to_string()))?;

        serde_json::from_value(value).map_err(|e| fail(format!("malformed capability list: {e}")))
    }

    /// Invoke a capability by its local name. The worker's payload is
    /// returned verbatim.
    pub async fn invoke(
        &self,
        local_name: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<Value, InvocationFailure> {
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        let result = self
            .call(
                |id| Frame::Invoke {
                    id,
                    name: local_name.to_string(),
                    arguments,
                    timeout_ms: Some(timeout_ms),
                },
                timeout,
            )
            .await;

        result.map_err(|e| {
            let qualified = qualify(&self.plugin, local_name);
            match e {
                ChannelError::Timeout(_) => InvocationFailure::new(
                    FailureCode::InvocationTimeout,
                    &self.plugin,
                    qualified,
                    format!("no response within {timeout_ms}ms"),
                ),
                ChannelError::Worker {
                    code,
                    message,
                    data,
                } => InvocationFailure {
                    worker_code: Some(code),
                    data,
                    ..InvocationFailure::new(
                        FailureCode::WorkerError,
                        &self.plugin,
                        qualified,
                        message,
                    )
                },
                ChannelError::Closed => InvocationFailure::new(
                    FailureCode::ChannelClosed,
                    &self.plugin,
                    qualified,
                    e.to_string(),
                ),
                ChannelError::Protocol(_) | ChannelError::Unexpected(_) => {
                    InvocationFailure::new(
                        FailureCode::WorkerError,
                        &self.plugin,
                        qualified,
                        e.to_string(),
                    )
                },
            }
        })
    }

    /// Ask the worker to exit. The worker may exit without answering.
    pub async fn request_shutdown(&self, timeout: Duration) -> Result<(), ChannelError> {
        self.call(|id| Frame::Shutdown { id }, timeout).await.map(|_| ())
    }

    /// Fail every outstanding request with `ChannelClosed`.
    pub async fn cancel_pending(&self) -> usize {
        let mut pending = self.pending.lock().await;
        let count = pending.len();
        pending.clear();
        if count > 0 {
            debug!(plugin = %self.plugin, count, "cancelled pending requests");
        }
        count
    }

    /// Stop reading, fail pending requests and let the writer task close
    /// the worker's stdin once queued frames are written. Idempotent.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Ok(mut handle) = self.reader_handle.lock()
            && let Some(handle) = handle.take()
        {
            handle.abort();
        }
        if let Ok(mut outbound) = self.outbound.lock() {
            outbound.take();
        }
        self.pending.lock().await.clear();
    }
}

impl Drop for WorkerChannel {
    fn drop(&mut self) {
        if let Ok(mut handle) = self.reader_handle.lock()
            && let Some(handle) = handle.take()
        {
            handle.abort();
        }
    }
}

async fn write_loop(
    plugin: String,
    mut writer: BoxedWriter,
    mut queue: mpsc::UnboundedReceiver<String>,
    pending: Pending,
    closed: Arc<AtomicBool>,
) {
    while let Some(line) = queue.recv().await {
        let written = async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = written {
            warn!(plugin = %plugin, error = %e, "error writing to worker stdin");
            closed.store(true, Ordering::SeqCst);
            pending.lock().await.clear();
            return;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop(plugin: String, reader: BoxedReader, pending: Pending, closed: Arc<AtomicBool>) {
    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_FRAME_BYTES));
    loop {
        let line = match lines.next().await {
            Some(Ok(line)) => line,
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                warn!(plugin = %plugin, max = MAX_FRAME_BYTES, "worker frame too large, closing channel");
                break;
            },
            Some(Err(LinesCodecError::Io(e))) => {
                warn!(plugin = %plugin, error = %e, "error reading from worker stdout");
                break;
            },
            None => {
                debug!(plugin = %plugin, "worker stdout closed");
                break;
            },
        };
        if line.trim().is_empty() {
            continue;
        }
        match decode(&line) {
            Ok(Frame::Notification { method, params }) => {
                debug!(plugin = %plugin, method = %method, params = ?params, "worker notification");
            },
            Ok(frame) if frame.is_response() => {
                let Some(id) = frame.id() else { continue };
                trace!(plugin = %plugin, id, kind = frame.kind(), "worker -> host");
                match pending.lock().await.remove(&id) {
                    Some(tx) => {
                        let _ = tx.send(frame);
                    },
                    None => {
                        debug!(plugin = %plugin, id, "response for unknown or expired request id");
                    },
                }
            },
            Ok(frame) => {
                warn!(plugin = %plugin, kind = frame.kind(), "worker sent a request frame, ignoring");
            },
            Err(e) => {
                warn!(plugin = %plugin, error = %e, "malformed frame from worker");
            },
        }
    }

    closed.store(true, Ordering::SeqCst);
    pending.lock().await.clear();
}
