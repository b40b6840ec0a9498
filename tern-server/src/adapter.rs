//! Object adapters: a servant manager plus the endpoints it is reachable on.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex};
use tern_core::observer::{CallAttributes, CommunicatorObserver, ObserverHandle};
use tern_core::protocol::{header_only, read_header, MessageType};
use tern_core::{lock, Endpoint, Identity, InputStream, RpcError, TraceLevels, Transport};
use tern_transport::{FrameCodec, MemoryListener, MemoryNetwork};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::current::{Current, IncomingRequest, OutgoingResponse};
use crate::servant::{Object, ServantLocator};
use crate::servant_manager::ServantManager;

#[derive(Clone, Default)]
pub struct AdapterConfig {
    /// Id under which a locator knows this adapter; empty when none.
    pub adapter_id: String,
    pub endpoints: Vec<Endpoint>,
    /// 0 silences dispatch warnings, 1 reports unexpected failures, higher
    /// levels also report missing objects and operations.
    pub warn_dispatch: i32,
    pub traces: TraceLevels,
    pub observer: Option<Arc<dyn CommunicatorObserver>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    Holding,
    Active,
    Deactivated,
    Destroyed,
}

struct Inner {
    state: AdapterState,
    direct_count: usize,
    listeners: Vec<JoinHandle<()>>,
    connections: Vec<JoinHandle<()>>,
}

pub struct ObjectAdapter {
    name: String,
    config: AdapterConfig,
    servants: ServantManager,
    inner: Mutex<Inner>,
    drained: Notify,
    shutdown: watch::Sender<bool>,
}

impl ObjectAdapter {
    pub fn new(name: impl Into<String>, config: AdapterConfig) -> Arc<Self> {
        let name = name.into();
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            servants: ServantManager::new(name.clone()),
            name,
            config,
            inner: Mutex::new(Inner {
                state: AdapterState::Holding,
                direct_count: 0,
                listeners: Vec::new(),
                connections: Vec::new(),
            }),
            drained: Notify::new(),
            shutdown,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn adapter_id(&self) -> &str {
        &self.config.adapter_id
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.config.endpoints
    }

    pub fn state(&self) -> AdapterState {
        lock(&self.inner).state
    }

    pub fn is_deactivated(&self) -> bool {
        matches!(
            self.state(),
            AdapterState::Deactivated | AdapterState::Destroyed
        )
    }

    pub fn servant_manager(&self) -> &ServantManager {
        &self.servants
    }

    pub fn add(&self, servant: Arc<dyn Object>, identity: Identity) -> Result<(), RpcError> {
        self.add_facet(servant, identity, "")
    }

    pub fn add_facet(
        &self,
        servant: Arc<dyn Object>,
        identity: Identity,
        facet: &str,
    ) -> Result<(), RpcError> {
        self.check_not_deactivated()?;
        self.servants.add_servant(servant, identity, facet)
    }

    pub fn remove(&self, identity: &Identity) -> Result<Arc<dyn Object>, RpcError> {
        self.servants.remove_servant(identity, "")
    }

    pub fn add_default_servant(&self, servant: Arc<dyn Object>, category: &str) -> Result<(), RpcError> {
        self.check_not_deactivated()?;
        self.servants.add_default_servant(servant, category)
    }

    pub fn add_servant_locator(
        &self,
        locator: Arc<dyn ServantLocator>,
        category: &str,
    ) -> Result<(), RpcError> {
        self.check_not_deactivated()?;
        self.servants.add_servant_locator(locator, category)
    }

    fn check_not_deactivated(&self) -> Result<(), RpcError> {
        match self.state() {
            AdapterState::Deactivated => Err(RpcError::ObjectAdapterDeactivated(self.name.clone())),
            AdapterState::Destroyed => Err(RpcError::ObjectAdapterDestroyed(self.name.clone())),
            _ => Ok(()),
        }
    }

    /// Whether a reference with these addressing fields designates an object
    /// of this adapter.
    pub fn is_local(&self, identity: &Identity, adapter_id: &str, endpoints: &[Endpoint]) -> bool {
        if self.is_deactivated() {
            return false;
        }
        if !endpoints.is_empty() {
            return endpoints.iter().any(|e| {
                self.config
                    .endpoints
                    .iter()
                    .any(|own| own.with_timeout(None) == e.with_timeout(None))
            });
        }
        if !adapter_id.is_empty() {
            return adapter_id == self.config.adapter_id;
        }
        self.servants.has_servant(identity)
    }

    /// Count a collocated dispatch. Every successful call must be matched by
    /// exactly one `dec_direct_count`.
    pub fn inc_direct_count(&self) -> Result<(), RpcError> {
        let mut inner = lock(&self.inner);
        match inner.state {
            AdapterState::Deactivated => Err(RpcError::ObjectAdapterDeactivated(self.name.clone())),
            AdapterState::Destroyed => Err(RpcError::ObjectAdapterDestroyed(self.name.clone())),
            AdapterState::Holding | AdapterState::Active => {
                inner.direct_count += 1;
                Ok(())
            }
        }
    }

    pub fn dec_direct_count(&self) {
        let mut inner = lock(&self.inner);
        debug_assert!(inner.direct_count > 0, "unbalanced dec_direct_count");
        inner.direct_count = inner.direct_count.saturating_sub(1);
        if inner.direct_count == 0 {
            self.drained.notify_waiters();
        }
    }

    pub fn direct_count(&self) -> usize {
        lock(&self.inner).direct_count
    }

    /// Start accepting connections on the adapter's `mem` endpoints.
    pub fn activate(self: &Arc<Self>, network: &Arc<MemoryNetwork>) -> Result<(), RpcError> {
        let mut listeners = Vec::new();
        for endpoint in &self.config.endpoints {
            if endpoint.transport() == Some(Transport::Mem) {
                listeners.push(network.listen(endpoint)?);
            } else {
                debug!(
                    target: "tern::network",
                    adapter = %self.name,
                    endpoint = %endpoint,
                    "endpoint is published only"
                );
            }
        }

        let mut inner = lock(&self.inner);
        match inner.state {
            AdapterState::Holding => inner.state = AdapterState::Active,
            AdapterState::Active => return Ok(()),
            _ => return Err(RpcError::ObjectAdapterDeactivated(self.name.clone())),
        }
        for listener in listeners {
            if self.config.traces.network >= 1 {
                info!(
                    target: "tern::network",
                    adapter = %self.name,
                    endpoint = %listener.endpoint(),
                    "accepting connections"
                );
            }
            inner
                .listeners
                .push(tokio::spawn(accept_loop(Arc::downgrade(self), listener)));
        }
        Ok(())
    }

    /// Stop accepting requests and wait for in-flight dispatches, collocated
    /// ones included, to finish.
    pub async fn deactivate(&self) {
        let (listeners, connections) = {
            let mut inner = lock(&self.inner);
            if inner.state != AdapterState::Destroyed {
                inner.state = AdapterState::Deactivated;
            }
            (
                std::mem::take(&mut inner.listeners),
                std::mem::take(&mut inner.connections),
            )
        };
        for listener in listeners {
            listener.abort();
            let _ = listener.await;
        }
        let _ = self.shutdown.send(true);
        for connection in connections {
            let _ = connection.await;
        }
        self.wait_for_direct_count().await;
    }

    async fn wait_for_direct_count(&self) {
        loop {
            let drained = self.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();
            if lock(&self.inner).direct_count == 0 {
                return;
            }
            drained.await;
        }
    }

    /// Deactivate, then drop every servant and deactivate servant locators.
    pub async fn destroy(&self) {
        self.deactivate().await;
        self.servants.destroy();
        lock(&self.inner).state = AdapterState::Destroyed;
    }

    /// Dispatch a decoded request through the servant manager.
    pub async fn dispatch(&self, request: IncomingRequest) -> OutgoingResponse {
        let current = &request.current;
        let observer = ObserverHandle::attach(self.config.observer.as_ref().and_then(|o| {
            o.dispatch_observer(&CallAttributes {
                target: self.name.clone(),
                identity: current.id.to_string(),
                facet: current.facet.clone(),
                operation: current.operation.clone(),
                mode: format!("{:?}", current.mode),
                context: current.context.clone(),
            })
        }));

        let response = self.servants.dispatch(&request).await;

        if let Some(err) = &response.error {
            if err.is_user() {
                if let Some(o) = observer.get() {
                    o.user_exception();
                }
            } else {
                observer.failed(err.kind());
            }
            self.warn_dispatch(current, err);
        }
        if !current.is_oneway() {
            if let Some(o) = observer.get() {
                o.reply(response.size());
            }
        }
        observer.detach();
        response
    }

    fn warn_dispatch(&self, current: &Current, err: &RpcError) {
        let level = self.config.warn_dispatch;
        let report = if err.is_user() {
            false
        } else if err.is_request_failed() {
            level > 1
        } else {
            level > 0
        };
        if report {
            warn!(
                target: "tern::dispatch",
                adapter = %self.name,
                identity = %current.id,
                facet = %current.facet,
                operation = %current.operation,
                error = %err,
                "dispatch failed"
            );
        }
    }

    fn track_connection(&self, handle: JoinHandle<()>) {
        let mut inner = lock(&self.inner);
        inner.connections.retain(|h| !h.is_finished());
        inner.connections.push(handle);
    }
}

async fn accept_loop(adapter: std::sync::Weak<ObjectAdapter>, mut listener: MemoryListener) {
    while let Some(pipe) = listener.accept().await {
        let Some(adapter) = adapter.upgrade() else {
            return;
        };
        let shutdown = adapter.shutdown.subscribe();
        let handle = tokio::spawn(serve_connection(adapter.clone(), pipe, shutdown));
        adapter.track_connection(handle);
    }
}

/// Serve one incoming connection until the peer closes it or the adapter is
/// deactivated. On deactivation, in-flight dispatches finish and the peer is
/// told the connection is closing.
async fn serve_connection<T>(adapter: Arc<ObjectAdapter>, io: T, mut shutdown: watch::Receiver<bool>)
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut sink, mut stream) = Framed::new(io, FrameCodec::new()).split();
    if sink
        .send(header_only(MessageType::ValidateConnection))
        .await
        .is_err()
    {
        return;
    }

    let (replies, mut outgoing) = mpsc::unbounded_channel::<Bytes>();
    let writer = tokio::spawn(async move {
        while let Some(frame) = outgoing.recv().await {
            if sink.send(frame).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut dispatches = JoinSet::new();
    let mut graceful = *shutdown.borrow();
    while !graceful {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(frame)) => match handle_message(&adapter, frame, &replies, &mut dispatches) {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(err) => {
                        warn!(target: "tern::network", adapter = %adapter.name, error = %err, "closing connection");
                        break;
                    }
                },
                _ => break,
            },
            _ = shutdown.changed() => graceful = true,
            Some(_) = dispatches.join_next(), if !dispatches.is_empty() => {}
        }
    }

    while dispatches.join_next().await.is_some() {}
    if graceful {
        let _ = replies.send(header_only(MessageType::CloseConnection));
    }
    drop(replies);
    let _ = writer.await;
}

/// Returns `false` once the peer has closed the connection.
fn handle_message(
    adapter: &Arc<ObjectAdapter>,
    frame: Bytes,
    replies: &mpsc::UnboundedSender<Bytes>,
    dispatches: &mut JoinSet<()>,
) -> Result<bool, RpcError> {
    let mut input = InputStream::new(frame);
    let header = read_header(&mut input)?;
    match header.message_type {
        MessageType::Request => {
            let request_id = input.read_int()?;
            let request = IncomingRequest::read(&mut input, request_id, &adapter.name)?;
            if adapter.config.traces.protocol >= 1 {
                debug!(
                    target: "tern::protocol",
                    adapter = %adapter.name,
                    request_id,
                    operation = %request.current.operation,
                    "received request"
                );
            }
            let adapter = adapter.clone();
            let replies = replies.clone();
            dispatches.spawn(async move {
                let response = adapter.dispatch(request).await;
                if request_id != 0 {
                    let _ = replies.send(response.to_message(request_id));
                }
            });
        }
        MessageType::RequestBatch => {
            let count = input.read_int()?;
            if count < 0 {
                return Err(RpcError::marshal(format!("invalid batch count {}", count)));
            }
            // Every batched request takes at least one byte.
            if count as usize > input.remaining() {
                return Err(RpcError::marshal(format!(
                    "batch count {} exceeds the {} bytes left in the message",
                    count,
                    input.remaining()
                )));
            }
            let mut requests = Vec::with_capacity(count as usize);
            for _ in 0..count {
                requests.push(IncomingRequest::read(&mut input, 0, &adapter.name)?);
            }
            if adapter.config.traces.protocol >= 1 {
                debug!(
                    target: "tern::protocol",
                    adapter = %adapter.name,
                    count,
                    "received batch request"
                );
            }
            let adapter = adapter.clone();
            dispatches.spawn(async move {
                for request in requests {
                    adapter.dispatch(request).await;
                }
            });
        }
        MessageType::ValidateConnection => {}
        MessageType::CloseConnection => return Ok(false),
        MessageType::Reply => {
            return Err(RpcError::protocol("unexpected reply on a server connection"))
        }
    }
    Ok(true)
}
