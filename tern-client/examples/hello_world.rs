//! Server and client in one process, talking over the in-memory transport.
//!
//! Run with `cargo run --example hello_world -- --Tern.Trace.Protocol=1`.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tern_client::{Communicator, CommunicatorOptions, InvokeOptions};
use tern_core::{
    Identity, InputStream, MetricsObserver, OperationMode, OutputStream, Properties, RpcError,
};
use tern_server::{init_logging, IncomingRequest, LogOptions, Object};
use tern_transport::MemoryNetwork;
use tracing::info;

struct Hello;

#[async_trait]
impl Object for Hello {
    fn type_ids(&self) -> Vec<String> {
        vec!["::Demo::Hello".to_string()]
    }

    async fn dispatch(&self, request: &IncomingRequest) -> Result<Bytes, RpcError> {
        match request.current.operation.as_str() {
            "sayHello" => {
                let name = request.params().read_string()?;
                let mut out = OutputStream::new();
                out.write_string(&format!("Hello, {}!", name));
                Ok(out.freeze())
            }
            _ => Err(tern_server::operation_not_exist(&request.current)),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut properties = Properties::new();
    properties.set("Tern.Default.CollocationOptimized", "0");
    let rest = properties.parse_args(std::env::args().skip(1));
    if !rest.is_empty() {
        anyhow::bail!("unexpected arguments: {:?}", rest);
    }
    let _guard = init_logging(&LogOptions::from_properties(&properties))?;

    let network = MemoryNetwork::new();
    let metrics = Arc::new(MetricsObserver::default());
    let communicator = Communicator::with_options(CommunicatorOptions {
        properties,
        observer: Some(metrics.clone()),
        network: Some(network),
        ..Default::default()
    })?;

    let adapter = communicator.create_object_adapter_with_endpoints("Hello", "mem -h hello -p 10000")?;
    adapter.add(Arc::new(Hello), Identity::named("hello"))?;
    adapter.activate(communicator.network())?;
    info!("hello adapter is active");

    let proxy = communicator
        .string_to_proxy("hello:mem -h hello -p 10000")?
        .ok_or_else(|| anyhow::anyhow!("null proxy"))?;
    println!("remote type: {}", proxy.ice_id().await?);

    for name in ["world", "tern"] {
        let mut params = OutputStream::new();
        params.write_string(name);
        let reply = proxy
            .invoke("sayHello", OperationMode::Normal, params.as_slice(), InvokeOptions::default())
            .await?;
        println!("{}", InputStream::new(reply).read_string()?);
    }

    println!("{}", serde_json::to_string_pretty(&metrics.to_json())?);
    communicator.destroy().await;
    Ok(())
}
