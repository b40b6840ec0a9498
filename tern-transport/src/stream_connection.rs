//! A client connection over any byte stream.
//!
//! The stream is framed with [`FrameCodec`] and split between a writer task,
//! fed through an unbounded channel so that sends never block the caller,
//! and a reader task that demultiplexes replies by request id.

use bytes::{Bytes, BytesMut};
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tern_core::protocol::{
    header_only, peek_message_type, read_header, CompressionStatus, MessageType,
    REQUEST_ID_OFFSET,
};
use tern_core::{lock, Endpoint, InputStream, RpcError, TraceLevels};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_util::codec::Framed;
use tracing::{debug, info};

use crate::codec::{CodecError, FrameCodec};
use crate::connection::{
    same_request, AsyncRequest, AsyncStatus, CancellationHandler, CloseMode, Connection,
};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

enum Outgoing {
    Request { key: i32, frame: Bytes },
    Control(Bytes),
    Shutdown,
}

struct Pending {
    request: Arc<dyn AsyncRequest>,
    written: bool,
}

struct State {
    next_request_id: i32,
    next_oneway_key: i32,
    /// Twoway requests are keyed by their request id, everything else by a
    /// negative key that never goes on the wire.
    pending: HashMap<i32, Pending>,
    closed: Option<RpcError>,
    closing: bool,
}

impl State {
    fn allocate_request_id(&mut self) -> i32 {
        let id = self.next_request_id;
        self.next_request_id = if id == i32::MAX { 1 } else { id + 1 };
        id
    }

    fn allocate_oneway_key(&mut self) -> i32 {
        let key = self.next_oneway_key;
        self.next_oneway_key = if key == i32::MIN { -1 } else { key - 1 };
        key
    }

    fn has_outstanding(&self) -> bool {
        !self.pending.is_empty()
    }
}

pub struct StreamConnection {
    id: u64,
    endpoint: Endpoint,
    this: Weak<StreamConnection>,
    state: Mutex<State>,
    tx: mpsc::UnboundedSender<Outgoing>,
    reader: Mutex<Option<AbortHandle>>,
    traces: TraceLevels,
}

impl StreamConnection {
    /// Wait for the peer to validate the connection, then start the reader
    /// and writer tasks.
    pub async fn connect<T>(
        io: T,
        endpoint: Endpoint,
        traces: TraceLevels,
    ) -> Result<Arc<Self>, RpcError>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut framed = Framed::new(io, FrameCodec::new());
        match framed.next().await {
            Some(Ok(frame)) => {
                let header = read_header(&mut InputStream::new(frame))?;
                if header.message_type != MessageType::ValidateConnection {
                    return Err(RpcError::protocol(format!(
                        "expected validate connection message, got {:?}",
                        header.message_type
                    )));
                }
            }
            Some(Err(e)) => return Err(e.into()),
            None => {
                return Err(RpcError::ConnectionLost(
                    "connection closed during validation".into(),
                ))
            }
        }

        let (sink, stream) = framed.split();
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = Arc::new_cyclic(|this| StreamConnection {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            endpoint,
            this: this.clone(),
            state: Mutex::new(State {
                next_request_id: 1,
                next_oneway_key: -1,
                pending: HashMap::new(),
                closed: None,
                closing: false,
            }),
            tx,
            reader: Mutex::new(None),
            traces,
        });

        tokio::spawn(run_writer(Arc::downgrade(&connection), sink, rx));
        let reader = tokio::spawn(run_reader(Arc::downgrade(&connection), stream));
        *lock(&connection.reader) = Some(reader.abort_handle());

        if traces.network >= 1 {
            info!(
                target: "tern::network",
                connection = connection.id,
                endpoint = %connection.endpoint,
                "established connection"
            );
        }
        Ok(connection)
    }

    fn is_pending(&self, key: i32) -> bool {
        lock(&self.state).pending.contains_key(&key)
    }

    /// Called by the writer once a frame has been flushed.
    fn written(&self, key: i32) {
        let request = {
            let mut state = lock(&self.state);
            if key < 0 {
                state.pending.remove(&key).map(|p| p.request)
            } else {
                match state.pending.get_mut(&key) {
                    Some(p) if !p.written => {
                        p.written = true;
                        Some(p.request.clone())
                    }
                    _ => None,
                }
            }
        };
        if let Some(request) = request {
            request.sent();
        }
        self.close_if_drained();
    }

    fn message(&self, frame: Bytes) -> Result<(), RpcError> {
        let mut input = InputStream::new(frame);
        let header = read_header(&mut input)?;
        if header.compression == CompressionStatus::Compressed as u8 {
            return Err(RpcError::FeatureNotSupported("compressed messages".into()));
        }
        match header.message_type {
            MessageType::Reply => {
                let request_id = input.read_int()?;
                if self.traces.protocol >= 1 {
                    debug!(
                        target: "tern::protocol",
                        connection = self.id,
                        request_id,
                        size = header.size,
                        "received reply"
                    );
                }
                let entry = lock(&self.state).pending.remove(&request_id);
                if let Some(entry) = entry {
                    if !entry.written {
                        entry.request.sent();
                    }
                    entry.request.completed(input);
                }
                self.close_if_drained();
                Ok(())
            }
            MessageType::ValidateConnection => Ok(()),
            MessageType::CloseConnection => Err(RpcError::CloseConnection),
            MessageType::Request | MessageType::RequestBatch => Err(RpcError::FeatureNotSupported(
                "requests on a client connection".into(),
            )),
        }
    }

    fn close_if_drained(&self) {
        let drained = {
            let state = lock(&self.state);
            state.closing && state.closed.is_none() && !state.has_outstanding()
        };
        if drained {
            self.close(CloseMode::Gracefully);
        }
    }

    /// Close the connection and fail every outstanding request with `err`.
    fn finish(&self, err: RpcError) {
        let pending = {
            let mut state = lock(&self.state);
            if state.closed.is_some() {
                return;
            }
            state.closed = Some(err.clone());
            std::mem::take(&mut state.pending)
        };

        let _ = self.tx.send(Outgoing::Shutdown);
        if let Some(reader) = lock(&self.reader).take() {
            reader.abort();
        }

        if self.traces.network >= 1 {
            info!(
                target: "tern::network",
                connection = self.id,
                endpoint = %self.endpoint,
                reason = %err,
                "closed connection"
            );
        }

        for (_, p) in pending {
            p.request.completed_with_error(err.clone());
        }
    }
}

impl Connection for StreamConnection {
    fn id(&self) -> u64 {
        self.id
    }

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn send_async_request(&self, request: Arc<dyn AsyncRequest>) -> Result<AsyncStatus, RpcError> {
        let handler: Arc<dyn CancellationHandler> = self
            .this
            .upgrade()
            .ok_or_else(|| RpcError::ConnectionLost("connection dropped".into()))?;
        let frame = request.message();
        let twoway =
            request.is_twoway() && peek_message_type(&frame) == Some(MessageType::Request);

        let (key, frame) = {
            let mut state = lock(&self.state);
            if let Some(err) = &state.closed {
                return Err(err.clone());
            }
            if state.closing {
                return Err(CloseMode::GracefullyWithWait.error());
            }
            // Registered under the connection lock so a concurrent cancel
            // either fails here or finds the pending entry.
            request.cancelable(handler)?;

            if twoway {
                let id = state.allocate_request_id();
                let mut buf = BytesMut::from(&frame[..]);
                buf[REQUEST_ID_OFFSET..REQUEST_ID_OFFSET + 4].copy_from_slice(&id.to_le_bytes());
                state.pending.insert(
                    id,
                    Pending {
                        request,
                        written: false,
                    },
                );
                (id, buf.freeze())
            } else {
                let key = state.allocate_oneway_key();
                state.pending.insert(
                    key,
                    Pending {
                        request,
                        written: false,
                    },
                );
                (key, frame)
            }
        };

        if self.traces.protocol >= 1 {
            debug!(
                target: "tern::protocol",
                connection = self.id,
                request_id = key.max(0),
                size = frame.len(),
                "sending request"
            );
        }

        if self.tx.send(Outgoing::Request { key, frame }).is_err() {
            lock(&self.state).pending.remove(&key);
            return Err(RpcError::ConnectionLost("writer task stopped".into()));
        }
        Ok(AsyncStatus::Queued)
    }

    fn close(&self, mode: CloseMode) {
        match mode {
            CloseMode::Forcefully => self.finish(mode.error()),
            CloseMode::Gracefully => {
                let _ = self
                    .tx
                    .send(Outgoing::Control(header_only(MessageType::CloseConnection)));
                self.finish(mode.error());
            }
            CloseMode::GracefullyWithWait => {
                let wait = {
                    let mut state = lock(&self.state);
                    state.closing = true;
                    state.has_outstanding()
                };
                if !wait {
                    self.close(CloseMode::Gracefully);
                }
            }
        }
    }

    fn is_closed(&self) -> bool {
        let state = lock(&self.state);
        state.closed.is_some() || state.closing
    }
}

impl CancellationHandler for StreamConnection {
    fn request_canceled(&self, request: &Arc<dyn AsyncRequest>, err: RpcError) {
        let removed = {
            let mut state = lock(&self.state);
            let key = state
                .pending
                .iter()
                .find(|(_, p)| same_request(&p.request, request))
                .map(|(k, _)| *k);
            key.and_then(|k| state.pending.remove(&k))
        };
        if let Some(p) = removed {
            p.request.completed_with_error(err);
            self.close_if_drained();
        }
    }
}

impl Drop for StreamConnection {
    fn drop(&mut self) {
        if let Some(reader) = lock(&self.reader).take() {
            reader.abort();
        }
    }
}

async fn run_writer<S>(
    connection: Weak<StreamConnection>,
    mut sink: S,
    mut rx: mpsc::UnboundedReceiver<Outgoing>,
) where
    S: Sink<Bytes, Error = CodecError> + Unpin,
{
    while let Some(outgoing) = rx.recv().await {
        match outgoing {
            Outgoing::Request { key, frame } => {
                let Some(conn) = connection.upgrade() else {
                    break;
                };
                // Canceled before it reached the wire.
                if !conn.is_pending(key) {
                    continue;
                }
                if let Err(e) = sink.send(frame).await {
                    conn.finish(e.into());
                    break;
                }
                conn.written(key);
            }
            Outgoing::Control(frame) => {
                if sink.send(frame).await.is_err() {
                    break;
                }
            }
            Outgoing::Shutdown => {
                let _ = sink.close().await;
                break;
            }
        }
    }
}

async fn run_reader<S>(connection: Weak<StreamConnection>, mut stream: S)
where
    S: Stream<Item = Result<Bytes, CodecError>> + Unpin,
{
    loop {
        let next = stream.next().await;
        let Some(conn) = connection.upgrade() else {
            return;
        };
        let result = match next {
            Some(Ok(frame)) => conn.message(frame),
            Some(Err(e)) => Err(e.into()),
            None => Err(RpcError::ConnectionLost("peer closed the connection".into())),
        };
        if let Err(err) = result {
            conn.finish(err);
            return;
        }
    }
}
