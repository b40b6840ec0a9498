//! Request handlers decide how a proxy's requests reach their target: over a
//! connection that may still be establishing, over an established one, or
//! straight into a collocated object adapter.

use async_trait::async_trait;
use std::sync::Arc;
use tern_core::RpcError;
use tern_transport::{AsyncRequest, AsyncStatus, Connection};

use crate::reference::Reference;

#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Hand a request over. A synchronous error means the request was not
    /// accepted and may be retried by the caller.
    fn send_async_request(&self, request: Arc<dyn AsyncRequest>) -> Result<AsyncStatus, RpcError>;

    /// The connection requests travel on, once known. Collocated handlers
    /// have none.
    async fn get_connection(&self) -> Result<Option<Arc<dyn Connection>>, RpcError>;

    fn is_collocated(&self) -> bool {
        false
    }
}

/// Identity comparison of two handlers.
pub fn same_handler(a: &Arc<dyn RequestHandler>, b: &Arc<dyn RequestHandler>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// Sends over an established connection.
pub struct ConnectionRequestHandler {
    connection: Arc<dyn Connection>,
}

impl ConnectionRequestHandler {
    pub fn new(connection: Arc<dyn Connection>) -> Self {
        Self { connection }
    }

    /// Handler for a reference bound to `connection`. Fails when the
    /// connection cannot carry the reference's invocation mode or security
    /// requirement.
    pub fn fixed(reference: &Reference, connection: Arc<dyn Connection>) -> Result<Self, RpcError> {
        let endpoint = connection.endpoint();
        if reference.mode().is_datagram() != endpoint.datagram()
            || (reference.secure() && !endpoint.secure())
        {
            return Err(RpcError::NoEndpoint(reference.to_string()));
        }
        Ok(Self::new(connection))
    }
}

#[async_trait]
impl RequestHandler for ConnectionRequestHandler {
    fn send_async_request(&self, request: Arc<dyn AsyncRequest>) -> Result<AsyncStatus, RpcError> {
        self.connection.send_async_request(request)
    }

    async fn get_connection(&self) -> Result<Option<Arc<dyn Connection>>, RpcError> {
        Ok(Some(self.connection.clone()))
    }
}
