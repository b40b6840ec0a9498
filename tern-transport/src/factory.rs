//! Connection establishment and caching.
//!
//! Connections are shared by every proxy that resolves to the same endpoint.
//! Concurrent attempts to reach one endpoint share a single connect.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tern_core::{Endpoint, RpcError, TraceLevels, Transport};
use tracing::info;

use crate::connection::{CloseMode, Connection};

/// Establishes connections for the transports it handles.
#[async_trait]
pub trait Connector: Send + Sync {
    fn handles(&self, transport: Transport) -> bool;

    async fn connect(
        &self,
        endpoint: &Endpoint,
        traces: TraceLevels,
    ) -> Result<Arc<dyn Connection>, RpcError>;
}

type ConnectFuture = Shared<BoxFuture<'static, Result<Arc<dyn Connection>, RpcError>>>;

pub struct ConnectionFactory {
    connectors: Vec<Arc<dyn Connector>>,
    connections: DashMap<Endpoint, Arc<dyn Connection>>,
    pending: DashMap<Endpoint, ConnectFuture>,
    traces: TraceLevels,
    destroyed: AtomicBool,
}

impl ConnectionFactory {
    pub fn new(traces: TraceLevels) -> Self {
        Self {
            connectors: Vec::new(),
            connections: DashMap::new(),
            pending: DashMap::new(),
            traces,
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connectors.push(connector);
        self
    }

    pub fn add_connector(&mut self, connector: Arc<dyn Connector>) {
        self.connectors.push(connector);
    }

    /// Connect to the first reachable endpoint, in the given order. Cached
    /// connections are reused when `cached` is set. Fails with the error of
    /// the last endpoint tried.
    pub async fn create(
        &self,
        endpoints: &[Endpoint],
        cached: bool,
    ) -> Result<Arc<dyn Connection>, RpcError> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(RpcError::CommunicatorDestroyed);
        }

        if cached {
            for endpoint in endpoints {
                if let Some(connection) = self.find(endpoint) {
                    return Ok(connection);
                }
            }
        }

        let mut last_error = RpcError::NoEndpoint(
            endpoints
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(":"),
        );
        for endpoint in endpoints {
            let attempt = if cached {
                self.shared_connect(endpoint).await
            } else {
                self.connect(endpoint).await
            };
            match attempt {
                Ok(connection) => {
                    if self.destroyed.load(Ordering::Acquire) {
                        connection.close(CloseMode::Forcefully);
                        return Err(RpcError::CommunicatorDestroyed);
                    }
                    return Ok(connection);
                }
                Err(err) => {
                    if self.traces.network >= 2 {
                        info!(
                            target: "tern::network",
                            endpoint = %endpoint,
                            error = %err,
                            "failed to establish connection"
                        );
                    }
                    last_error = err;
                }
            }
        }
        Err(last_error)
    }

    fn find(&self, endpoint: &Endpoint) -> Option<Arc<dyn Connection>> {
        let connection = self.connections.get(endpoint).map(|c| c.value().clone())?;
        if connection.is_closed() {
            self.connections.remove(endpoint);
            return None;
        }
        Some(connection)
    }

    async fn shared_connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn Connection>, RpcError> {
        let future = self
            .pending
            .entry(endpoint.clone())
            .or_insert_with(|| {
                let connector = self.connector(endpoint);
                let endpoint = endpoint.clone();
                let traces = self.traces;
                async move { connect_with_timeout(connector?, &endpoint, traces).await }
                    .boxed()
                    .shared()
            })
            .clone();

        let result = future.await;
        self.pending.remove(endpoint);
        if let Ok(connection) = &result {
            self.connections.insert(endpoint.clone(), connection.clone());
        }
        result
    }

    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn Connection>, RpcError> {
        connect_with_timeout(self.connector(endpoint)?, endpoint, self.traces).await
    }

    fn connector(&self, endpoint: &Endpoint) -> Result<Arc<dyn Connector>, RpcError> {
        let transport = endpoint.transport().ok_or_else(|| {
            RpcError::FeatureNotSupported(format!("opaque endpoint `{}'", endpoint))
        })?;
        self.connectors
            .iter()
            .find(|c| c.handles(transport))
            .cloned()
            .ok_or_else(|| {
                RpcError::FeatureNotSupported(format!("no connector for transport `{}'", transport.name()))
            })
    }

    /// Close every cached connection and refuse new ones.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        let connections: Vec<_> = self.connections.iter().map(|c| c.value().clone()).collect();
        self.connections.clear();
        for connection in connections {
            connection.close(CloseMode::Gracefully);
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

async fn connect_with_timeout(
    connector: Arc<dyn Connector>,
    endpoint: &Endpoint,
    traces: TraceLevels,
) -> Result<Arc<dyn Connection>, RpcError> {
    if traces.network >= 2 {
        info!(target: "tern::network", endpoint = %endpoint, "trying to establish connection");
    }
    match endpoint.timeout() {
        Some(ms) if ms > 0 => {
            tokio::time::timeout(
                Duration::from_millis(ms as u64),
                connector.connect(endpoint, traces),
            )
            .await
            .map_err(|_| RpcError::ConnectTimeout)?
        }
        _ => connector.connect(endpoint, traces).await,
    }
}
