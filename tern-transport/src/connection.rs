//! The contract between the invocation core and a transport connection.
//!
//! A connection multiplexes many outstanding requests. The invocation side
//! hands it an [`AsyncRequest`]; the connection assigns a request id, writes
//! the frame and calls back `sent`, then `completed` when the matching reply
//! arrives. While the request is outstanding the connection registers itself
//! as the request's [`CancellationHandler`] so a cancellation or an
//! invocation timeout can abort it.

use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use tern_core::{Endpoint, InputStream, RpcError};

/// Result of handing a request to a connection or request handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncStatus {
    /// The request is queued; `sent` is called once it leaves the process.
    Queued,
    /// The request was sent (and `sent` already called) before returning.
    Sent,
}

impl AsyncStatus {
    pub fn is_sent(&self) -> bool {
        matches!(self, AsyncStatus::Sent)
    }
}

/// How a connection should be closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseMode {
    /// Abort immediately; outstanding requests fail with a non-graceful
    /// `ConnectionManuallyClosed`.
    Forcefully,
    /// Fail outstanding requests with a graceful `ConnectionManuallyClosed`
    /// and tell the peer the connection is going away.
    Gracefully,
    /// Refuse new requests and close gracefully once outstanding replies
    /// have arrived.
    GracefullyWithWait,
}

impl CloseMode {
    pub fn error(&self) -> RpcError {
        RpcError::ConnectionManuallyClosed {
            graceful: !matches!(self, CloseMode::Forcefully),
        }
    }
}

/// A request as seen by a connection or request handler.
pub trait AsyncRequest: Send + Sync {
    /// The complete frame. Request frames carry a request id placeholder at
    /// `REQUEST_ID_OFFSET` which the connection patches for twoway calls.
    fn message(&self) -> Bytes;

    fn is_twoway(&self) -> bool;

    /// Register the handler able to abort the request. Fails with the stored
    /// error when the request was canceled before any handler was registered.
    fn cancelable(&self, handler: Arc<dyn CancellationHandler>) -> Result<(), RpcError>;

    /// The frame was handed to the transport.
    fn sent(&self);

    /// A reply arrived. The stream is positioned on the reply status byte.
    fn completed(&self, reply: InputStream);

    fn completed_with_error(&self, err: RpcError);
}

/// Something holding an outstanding request that can abort it.
pub trait CancellationHandler: Send + Sync {
    fn request_canceled(&self, request: &Arc<dyn AsyncRequest>, err: RpcError);
}

/// Identity comparison of two requests.
pub fn same_request(a: &Arc<dyn AsyncRequest>, b: &Arc<dyn AsyncRequest>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// A connection to a peer, shared by every proxy using one of its endpoints.
/// Requests it holds are canceled through its [`CancellationHandler`] side.
pub trait Connection: CancellationHandler {
    fn id(&self) -> u64;

    fn endpoint(&self) -> &Endpoint;

    /// Queue a request. Errors are returned synchronously when the
    /// connection is closed or the request was already canceled.
    fn send_async_request(&self, request: Arc<dyn AsyncRequest>) -> Result<AsyncStatus, RpcError>;

    fn close(&self, mode: CloseMode);

    /// Closed, or closing and refusing new requests.
    fn is_closed(&self) -> bool;
}

impl fmt::Debug for dyn Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id())
            .field("endpoint", &self.endpoint().to_string())
            .finish()
    }
}
