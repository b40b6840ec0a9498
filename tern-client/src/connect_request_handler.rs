//! The handler a proxy uses while its connection is being established.
//!
//! Resolution (router, direct endpoints or locator) and the connect attempt
//! run in a background task. Requests sent meanwhile are queued and flushed
//! in order once the connection is up; on failure they all complete with the
//! connect error and the handler removes itself from the proxy so the next
//! invocation starts over.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};
use tern_core::{lock, Endpoint, RpcError};
use tern_transport::{same_request, AsyncRequest, AsyncStatus, CancellationHandler, Connection};
use tokio::sync::watch;
use tracing::info;

use crate::communicator::Instance;
use crate::proxy::ProxyShared;
use crate::reference::Reference;
use crate::request_handler::{ConnectionRequestHandler, RequestHandler};

enum State {
    Connecting,
    Connected(Arc<dyn Connection>),
    Failed(RpcError),
}

struct Inner {
    state: State,
    queue: VecDeque<Arc<dyn AsyncRequest>>,
    /// Set while queued requests are handed to the new connection; requests
    /// arriving meanwhile queue behind them.
    flushing: bool,
}

pub struct ConnectRequestHandler {
    reference: Arc<Reference>,
    inner: Mutex<Inner>,
    resolved: watch::Sender<bool>,
    proxy: Weak<ProxyShared>,
    this: Weak<ConnectRequestHandler>,
}

impl ConnectRequestHandler {
    /// Create the handler and start connecting in the background.
    pub(crate) fn start(
        instance: Arc<Instance>,
        reference: Arc<Reference>,
        proxy: Weak<ProxyShared>,
    ) -> Arc<Self> {
        let (resolved, _) = watch::channel(false);
        let handler = Arc::new_cyclic(|this| Self {
            reference,
            inner: Mutex::new(Inner {
                state: State::Connecting,
                queue: VecDeque::new(),
                flushing: false,
            }),
            resolved,
            proxy,
            this: this.clone(),
        });

        let task = handler.clone();
        tokio::spawn(async move {
            match task.connect(&instance).await {
                Ok(connection) => task.connected(connection),
                Err(err) => task.failed(err),
            }
        });
        handler
    }

    async fn connect(&self, instance: &Instance) -> Result<Arc<dyn Connection>, RpcError> {
        let reference = &self.reference;
        let routable = reference
            .routable()
            .ok_or_else(|| RpcError::NoEndpoint(reference.to_string()))?;

        if let Some(router) = &routable.router_info {
            let endpoints = router.client_endpoints().await?;
            if !endpoints.is_empty() {
                router.add_proxy(reference).await?;
                return self.create_connection(instance, &endpoints).await;
            }
        }

        if !routable.endpoints.is_empty() {
            return self.create_connection(instance, &routable.endpoints).await;
        }

        let Some(locator) = &routable.locator_info else {
            return Err(RpcError::NoEndpoint(reference.to_string()));
        };
        let ttl = routable.locator_cache_timeout;
        let (endpoints, cached) = locator.get_endpoints(reference, ttl).await?;
        match self.create_connection(instance, &endpoints).await {
            Err(err) if cached => {
                // Cached endpoints may be stale; ask the locator again once.
                if instance.traces().retry >= 2 {
                    info!(
                        target: "tern::retry",
                        proxy = %reference,
                        error = %err,
                        "connection to cached endpoints failed, removing endpoints from cache and trying again"
                    );
                }
                locator.clear_cache(reference);
                let (endpoints, _) = locator.get_endpoints(reference, ttl).await?;
                self.create_connection(instance, &endpoints).await
            }
            result => result,
        }
    }

    async fn create_connection(
        &self,
        instance: &Instance,
        endpoints: &[Endpoint],
    ) -> Result<Arc<dyn Connection>, RpcError> {
        let filtered = self.reference.filter_endpoints(endpoints);
        if filtered.is_empty() {
            return Err(RpcError::NoEndpoint(self.reference.to_string()));
        }
        let cached = self
            .reference
            .routable()
            .map(|r| r.cache_connection)
            .unwrap_or(true);
        instance.connection_factory().create(&filtered, cached).await
    }

    fn connected(&self, connection: Arc<dyn Connection>) {
        {
            let mut inner = lock(&self.inner);
            inner.state = State::Connected(connection.clone());
            inner.flushing = true;
        }

        loop {
            let request = {
                let mut inner = lock(&self.inner);
                match inner.queue.pop_front() {
                    Some(request) => request,
                    None => {
                        inner.flushing = false;
                        break;
                    }
                }
            };
            if let Err(err) = connection.send_async_request(request.clone()) {
                request.completed_with_error(err);
            }
        }
        self.resolved.send_replace(true);

        if let (Some(proxy), Some(this)) = (self.proxy.upgrade(), self.this.upgrade()) {
            let this: Arc<dyn RequestHandler> = this;
            proxy.update_request_handler(
                &this,
                Some(Arc::new(ConnectionRequestHandler::new(connection))),
            );
        }
    }

    fn failed(&self, err: RpcError) {
        let queue = {
            let mut inner = lock(&self.inner);
            inner.state = State::Failed(err.clone());
            std::mem::take(&mut inner.queue)
        };
        self.resolved.send_replace(true);

        if let (Some(proxy), Some(this)) = (self.proxy.upgrade(), self.this.upgrade()) {
            let this: Arc<dyn RequestHandler> = this;
            proxy.update_request_handler(&this, None);
        }
        for request in queue {
            request.completed_with_error(err.clone());
        }
    }
}

#[async_trait]
impl RequestHandler for ConnectRequestHandler {
    fn send_async_request(&self, request: Arc<dyn AsyncRequest>) -> Result<AsyncStatus, RpcError> {
        let mut inner = lock(&self.inner);
        if !inner.flushing {
            match &inner.state {
                State::Connected(connection) => {
                    let connection = connection.clone();
                    drop(inner);
                    return connection.send_async_request(request);
                }
                State::Failed(err) => return Err(err.clone()),
                State::Connecting => {}
            }
        }

        let handler: Arc<dyn CancellationHandler> = self
            .this
            .upgrade()
            .ok_or(RpcError::CommunicatorDestroyed)?;
        request.cancelable(handler)?;
        inner.queue.push_back(request);
        Ok(AsyncStatus::Queued)
    }

    async fn get_connection(&self) -> Result<Option<Arc<dyn Connection>>, RpcError> {
        let mut resolved = self.resolved.subscribe();
        let _ = resolved.wait_for(|done| *done).await;
        match &lock(&self.inner).state {
            State::Connected(connection) => Ok(Some(connection.clone())),
            State::Failed(err) => Err(err.clone()),
            State::Connecting => Err(RpcError::NoEndpoint(self.reference.to_string())),
        }
    }
}

impl CancellationHandler for ConnectRequestHandler {
    fn request_canceled(&self, request: &Arc<dyn AsyncRequest>, err: RpcError) {
        let mut inner = lock(&self.inner);
        if let Some(pos) = inner.queue.iter().position(|r| same_request(r, request)) {
            let removed = inner.queue.remove(pos);
            drop(inner);
            if let Some(removed) = removed {
                removed.completed_with_error(err);
            }
            return;
        }
        if let State::Connected(connection) = &inner.state {
            let connection = connection.clone();
            drop(inner);
            connection.request_canceled(request, err);
        }
    }
}
