//! In-process transport.
//!
//! `mem -h <name> -p <port>` endpoints are served by listeners registered on
//! a [`MemoryNetwork`]. Connecting hands the listener one half of a
//! `tokio::io::duplex` pipe; no sockets are involved.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tern_core::{Endpoint, RpcError, TraceLevels, Transport};
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

use crate::connection::Connection;
use crate::factory::Connector;
use crate::stream_connection::StreamConnection;

const PIPE_CAPACITY: usize = 64 * 1024;

type Address = (String, u16);

fn address(endpoint: &Endpoint) -> Result<Address, RpcError> {
    match (endpoint.transport(), endpoint.host(), endpoint.port()) {
        (Some(Transport::Mem), Some(host), Some(port)) => Ok((host.to_string(), port)),
        _ => Err(RpcError::FeatureNotSupported(format!(
            "`{}' is not a memory endpoint",
            endpoint
        ))),
    }
}

/// Registry of in-process listeners.
#[derive(Debug, Default)]
pub struct MemoryNetwork {
    listeners: DashMap<Address, mpsc::UnboundedSender<DuplexStream>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn listen(self: &Arc<Self>, endpoint: &Endpoint) -> Result<MemoryListener, RpcError> {
        let address = address(endpoint)?;
        let (tx, rx) = mpsc::unbounded_channel();
        match self.listeners.entry(address.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(RpcError::Initialization(format!(
                    "address already in use: {}",
                    endpoint
                )))
            }
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(tx);
            }
        }
        Ok(MemoryListener {
            network: self.clone(),
            address,
            endpoint: endpoint.clone(),
            rx,
        })
    }

    /// Open a pipe to the listener bound to `endpoint`.
    pub fn connect(&self, endpoint: &Endpoint) -> Result<DuplexStream, RpcError> {
        let address = address(endpoint)?;
        let refused = || RpcError::ConnectionRefused(endpoint.to_string());
        let listener = self.listeners.get(&address).ok_or_else(refused)?;
        let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
        listener.send(server).map_err(|_| refused())?;
        Ok(client)
    }

    pub fn is_listening(&self, endpoint: &Endpoint) -> bool {
        address(endpoint)
            .map(|a| self.listeners.contains_key(&a))
            .unwrap_or(false)
    }
}

/// Accepts pipes for one address. Dropping it unbinds the address.
#[derive(Debug)]
pub struct MemoryListener {
    network: Arc<MemoryNetwork>,
    address: Address,
    endpoint: Endpoint,
    rx: mpsc::UnboundedReceiver<DuplexStream>,
}

impl MemoryListener {
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub async fn accept(&mut self) -> Option<DuplexStream> {
        self.rx.recv().await
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        self.network.listeners.remove(&self.address);
    }
}

pub struct MemoryConnector {
    network: Arc<MemoryNetwork>,
}

impl MemoryConnector {
    pub fn new(network: Arc<MemoryNetwork>) -> Self {
        Self { network }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    fn handles(&self, transport: Transport) -> bool {
        transport == Transport::Mem
    }

    async fn connect(
        &self,
        endpoint: &Endpoint,
        traces: TraceLevels,
    ) -> Result<Arc<dyn Connection>, RpcError> {
        let pipe = self.network.connect(endpoint)?;
        let connection = StreamConnection::connect(pipe, endpoint.clone(), traces).await?;
        Ok(connection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_without_listener_is_refused() {
        let network = MemoryNetwork::new();
        let err = network.connect(&Endpoint::mem("nobody", 1)).unwrap_err();
        assert!(matches!(err, RpcError::ConnectionRefused(_)));
    }

    #[tokio::test]
    async fn test_listener_unbinds_on_drop() {
        let network = MemoryNetwork::new();
        let endpoint = Endpoint::mem("svc", 1);
        let listener = network.listen(&endpoint).unwrap();
        assert!(network.listen(&endpoint).is_err());
        assert!(network.is_listening(&endpoint));
        drop(listener);
        assert!(!network.is_listening(&endpoint));
        assert!(network.listen(&endpoint).is_ok());
    }

    #[tokio::test]
    async fn test_accept_receives_pipe() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let network = MemoryNetwork::new();
        let endpoint = Endpoint::mem("svc", 2);
        let mut listener = network.listen(&endpoint).unwrap();
        let mut client = network.connect(&endpoint).unwrap();
        let mut server = listener.accept().await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn test_tcp_endpoint_rejected() {
        let network = MemoryNetwork::new();
        assert!(matches!(
            network.connect(&Endpoint::tcp("localhost", 1)),
            Err(RpcError::FeatureNotSupported(_))
        ));
    }
}
