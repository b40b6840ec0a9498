use async_trait::async_trait;
use std::sync::Arc;
use tern_core::{Endpoint, RpcError, TraceLevels, Transport};
use tokio::net::TcpStream;

use crate::connection::Connection;
use crate::factory::Connector;
use crate::stream_connection::StreamConnection;

/// Plain TCP connector.
#[derive(Debug, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    fn handles(&self, transport: Transport) -> bool {
        transport == Transport::Tcp
    }

    async fn connect(
        &self,
        endpoint: &Endpoint,
        traces: TraceLevels,
    ) -> Result<Arc<dyn Connection>, RpcError> {
        let (host, port) = match (endpoint.host(), endpoint.port()) {
            (Some(host), Some(port)) => (host, port),
            _ => return Err(RpcError::ConnectFailed(format!("`{}' has no address", endpoint))),
        };
        let stream = TcpStream::connect((host, port)).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::ConnectionRefused => RpcError::ConnectionRefused(endpoint.to_string()),
            _ => RpcError::ConnectFailed(format!("{}: {}", endpoint, e)),
        })?;
        stream.set_nodelay(true)?;
        let connection = StreamConnection::connect(stream, endpoint.clone(), traces).await?;
        Ok(connection)
    }
}
