//! Routers forward requests on behalf of clients that cannot reach servers
//! directly. A routed proxy connects to the router's client endpoints and must
//! be added to the router's routing table before its first request.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tern_core::{
    lock, Endpoint, Identity, InputStream, OperationMode, OutputStream, ProxyData, RpcError,
    TraceLevels,
};
use tokio::sync::Mutex as AsyncMutex;
use tracing::info;

use crate::proxy::{InvokeOptions, ObjectPrx};
use crate::reference::Reference;

pub const GET_CLIENT_PROXY: &str = "getClientProxy";
pub const ADD_PROXIES: &str = "addProxies";

#[async_trait]
pub trait Router: Send + Sync {
    /// Endpoints clients connect to; empty when the router accepts routed
    /// requests on any of its endpoints.
    async fn get_client_endpoints(&self) -> Result<Vec<Endpoint>, RpcError>;

    /// Add proxies to the routing table. Returns the proxies the router
    /// evicted to make room.
    async fn add_proxies(&self, proxies: Vec<ProxyData>) -> Result<Vec<ProxyData>, RpcError>;
}

pub struct RouterInfo {
    router: Arc<dyn Router>,
    client_endpoints: AsyncMutex<Option<Vec<Endpoint>>>,
    identities: Mutex<HashSet<Identity>>,
    traces: TraceLevels,
}

impl RouterInfo {
    pub fn new(router: Arc<dyn Router>, traces: TraceLevels) -> Arc<Self> {
        Arc::new(Self {
            router,
            client_endpoints: AsyncMutex::new(None),
            identities: Mutex::new(HashSet::new()),
            traces,
        })
    }

    pub fn router(&self) -> &Arc<dyn Router> {
        &self.router
    }

    /// The router's client endpoints, fetched once.
    pub async fn client_endpoints(&self) -> Result<Vec<Endpoint>, RpcError> {
        let mut cached = self.client_endpoints.lock().await;
        if let Some(endpoints) = cached.as_ref() {
            return Ok(endpoints.clone());
        }
        let endpoints = self.router.get_client_endpoints().await?;
        *cached = Some(endpoints.clone());
        Ok(endpoints)
    }

    /// Make sure the router knows `reference` before it is used.
    pub async fn add_proxy(&self, reference: &Reference) -> Result<(), RpcError> {
        if lock(&self.identities).contains(reference.identity()) {
            return Ok(());
        }
        let evicted = self.router.add_proxies(vec![reference.to_proxy_data()]).await?;

        let mut identities = lock(&self.identities);
        identities.insert(reference.identity().clone());
        for proxy in &evicted {
            identities.remove(&proxy.identity);
        }
        if self.traces.network >= 2 {
            info!(
                target: "tern::network",
                identity = %reference.identity(),
                evicted = evicted.len(),
                "added proxy to router"
            );
        }
        Ok(())
    }

    /// Forget that `reference` was added, so the next request adds it again.
    pub fn clear_cache(&self, reference: &Reference) {
        lock(&self.identities).remove(reference.identity());
    }

    pub fn is_added(&self, identity: &Identity) -> bool {
        lock(&self.identities).contains(identity)
    }
}

/// One [`RouterInfo`] per router proxy.
pub struct RouterManager {
    traces: TraceLevels,
    table: Mutex<HashMap<Reference, Arc<RouterInfo>>>,
}

impl RouterManager {
    pub fn new(traces: TraceLevels) -> Self {
        Self {
            traces,
            table: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, router: &RouterPrx) -> Arc<RouterInfo> {
        // A router is never routed through a router.
        let router = router
            .proxy()
            .ice_router(None)
            .map(RouterPrx::new)
            .unwrap_or_else(|_| router.clone());
        let key = (**router.proxy().reference()).clone();
        lock(&self.table)
            .entry(key)
            .or_insert_with(|| RouterInfo::new(Arc::new(router), self.traces))
            .clone()
    }

    pub fn destroy(&self) {
        lock(&self.table).clear();
    }
}

/// Client proxy for a remote router.
#[derive(Clone, Debug)]
pub struct RouterPrx(ObjectPrx);

impl RouterPrx {
    pub fn new(proxy: ObjectPrx) -> Self {
        Self(proxy)
    }

    pub fn proxy(&self) -> &ObjectPrx {
        &self.0
    }
}

#[async_trait]
impl Router for RouterPrx {
    async fn get_client_endpoints(&self) -> Result<Vec<Endpoint>, RpcError> {
        let reply = self
            .0
            .invoke(GET_CLIENT_PROXY, OperationMode::Idempotent, &[], InvokeOptions::default())
            .await?;
        // A null client proxy means the router's own endpoints.
        match ProxyData::read(&mut InputStream::new(reply))? {
            Some(proxy) => Ok(proxy.endpoints),
            None => Ok(self.0.ice_get_endpoints().to_vec()),
        }
    }

    async fn add_proxies(&self, proxies: Vec<ProxyData>) -> Result<Vec<ProxyData>, RpcError> {
        let mut params = OutputStream::new();
        params.write_size(proxies.len());
        for proxy in &proxies {
            ProxyData::write(&mut params, Some(proxy));
        }
        let reply = self
            .0
            .invoke(ADD_PROXIES, OperationMode::Idempotent, params.as_slice(), InvokeOptions::default())
            .await?;

        let mut input = InputStream::new(reply);
        let count = input.read_size()?;
        let mut evicted = Vec::with_capacity(count);
        for _ in 0..count {
            if let Some(proxy) = ProxyData::read(&mut input)? {
                evicted.push(proxy);
            }
        }
        Ok(evicted)
    }
}
