//! Resolution of indirect references through a locator.
//!
//! Results are cached per adapter id and per well-known identity. Concurrent
//! resolutions of one key share a single remote lookup: the first caller
//! starts it and later callers await the same shared future.

use async_trait::async_trait;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tern_core::{lock, Endpoint, Identity, ProxyData, RpcError, TraceLevels};
use tern_server::locator::{ADAPTER_NOT_FOUND, OBJECT_NOT_FOUND};
use tokio::time::Instant;
use tracing::info;

use crate::locator_proxy::LocatorPrx;
use crate::reference::Reference;

/// The remote locator service.
#[async_trait]
pub trait Locator: Send + Sync {
    /// Proxy of a well-known object; `None` when the locator returned a
    /// null proxy.
    async fn find_object_by_id(&self, identity: &Identity) -> Result<Option<ProxyData>, RpcError>;

    /// Proxy carrying the endpoints of an object adapter.
    async fn find_adapter_by_id(&self, adapter_id: &str) -> Result<Option<ProxyData>, RpcError>;
}

type Lookup<T> = Shared<BoxFuture<'static, Result<T, RpcError>>>;

struct CacheEntry<T> {
    value: T,
    inserted: Instant,
}

impl<T: Clone> CacheEntry<T> {
    fn new(value: T) -> Self {
        Self {
            value,
            inserted: Instant::now(),
        }
    }

    /// A negative ttl caches forever, zero disables the cache.
    fn fresh(&self, ttl: i32) -> Option<T> {
        let fresh = match ttl {
            t if t < 0 => true,
            0 => false,
            t => self.inserted.elapsed() <= Duration::from_secs(t as u64),
        };
        fresh.then(|| self.value.clone())
    }
}

#[derive(Default)]
struct LocatorTable {
    adapters: HashMap<String, CacheEntry<Vec<Endpoint>>>,
    objects: HashMap<Identity, CacheEntry<ProxyData>>,
}

pub struct LocatorInfo {
    locator: Arc<dyn Locator>,
    table: Mutex<LocatorTable>,
    adapter_requests: Mutex<HashMap<String, Lookup<Vec<Endpoint>>>>,
    object_requests: Mutex<HashMap<Identity, Lookup<ProxyData>>>,
    traces: TraceLevels,
    this: Weak<LocatorInfo>,
}

fn endpoint_list(endpoints: &[Endpoint]) -> String {
    endpoints
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(":")
}

fn adapter_result(
    adapter_id: &str,
    result: Result<Option<ProxyData>, RpcError>,
) -> Result<Vec<Endpoint>, RpcError> {
    match result {
        Ok(Some(proxy)) if !proxy.endpoints.is_empty() => Ok(proxy.endpoints),
        Ok(_) => Err(RpcError::not_registered("object adapter", adapter_id)),
        Err(RpcError::User(ex)) if ex.type_id == ADAPTER_NOT_FOUND => {
            Err(RpcError::not_registered("object adapter", adapter_id))
        }
        Err(err) => Err(err),
    }
}

fn object_result(
    identity: &Identity,
    result: Result<Option<ProxyData>, RpcError>,
) -> Result<ProxyData, RpcError> {
    match result {
        Ok(Some(proxy)) => Ok(proxy),
        Ok(None) => Err(RpcError::not_registered("object", identity.to_string())),
        Err(RpcError::User(ex)) if ex.type_id == OBJECT_NOT_FOUND => {
            Err(RpcError::not_registered("object", identity.to_string()))
        }
        Err(err) => Err(err),
    }
}

impl LocatorInfo {
    pub fn new(locator: Arc<dyn Locator>, traces: TraceLevels) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            locator,
            table: Mutex::new(LocatorTable::default()),
            adapter_requests: Mutex::new(HashMap::new()),
            object_requests: Mutex::new(HashMap::new()),
            traces,
            this: this.clone(),
        })
    }

    pub fn locator(&self) -> &Arc<dyn Locator> {
        &self.locator
    }

    /// Resolve the endpoints of `reference`. The flag tells whether they
    /// came from the cache, in which case a connection failure should clear
    /// the cache and resolve again.
    pub async fn get_endpoints(
        &self,
        reference: &Reference,
        ttl: i32,
    ) -> Result<(Vec<Endpoint>, bool), RpcError> {
        if !reference.is_indirect() {
            return Ok((reference.endpoints().to_vec(), false));
        }
        if !reference.is_well_known() {
            return self.adapter_endpoints(reference.adapter_id(), ttl).await;
        }

        let identity = reference.identity();
        let (object, cached) = self.object_proxy(identity, ttl).await?;
        if !object.endpoints.is_empty() {
            if self.traces.locator >= 1 {
                info!(
                    target: "tern::locator",
                    object = %identity,
                    endpoints = %endpoint_list(&object.endpoints),
                    cached,
                    "resolved endpoints of well-known object"
                );
            }
            return Ok((object.endpoints, cached));
        }
        if object.adapter_id.is_empty() {
            self.remove_object(identity);
            return Err(RpcError::not_registered("object", identity.to_string()));
        }

        match self.adapter_endpoints(&object.adapter_id, ttl).await {
            Ok((endpoints, adapter_cached)) => Ok((endpoints, cached && adapter_cached)),
            Err(err) => {
                // The object entry is useless without its adapter.
                if err != RpcError::CommunicatorDestroyed {
                    self.remove_object(identity);
                }
                Err(err)
            }
        }
    }

    async fn adapter_endpoints(
        &self,
        adapter_id: &str,
        ttl: i32,
    ) -> Result<(Vec<Endpoint>, bool), RpcError> {
        let lookup = {
            let mut requests = lock(&self.adapter_requests);
            let cached = lock(&self.table)
                .adapters
                .get(adapter_id)
                .and_then(|e| e.fresh(ttl));
            if let Some(endpoints) = cached {
                if self.traces.locator >= 1 {
                    info!(
                        target: "tern::locator",
                        adapter = adapter_id,
                        endpoints = %endpoint_list(&endpoints),
                        "found endpoints in locator table"
                    );
                }
                return Ok((endpoints, true));
            }
            match requests.get(adapter_id) {
                Some(pending) => pending.clone(),
                None => {
                    if self.traces.locator >= 2 {
                        info!(target: "tern::locator", adapter = adapter_id, "searching for adapter by id");
                    }
                    let lookup = self.start_adapter_lookup(adapter_id.to_string());
                    requests.insert(adapter_id.to_string(), lookup.clone());
                    lookup
                }
            }
        };
        lookup.await.map(|endpoints| (endpoints, false))
    }

    fn start_adapter_lookup(&self, adapter_id: String) -> Lookup<Vec<Endpoint>> {
        let locator = self.locator.clone();
        let this = self.this.clone();
        async move {
            let result = adapter_result(&adapter_id, locator.find_adapter_by_id(&adapter_id).await);
            if let Some(info) = this.upgrade() {
                info.adapter_lookup_done(&adapter_id, &result);
            }
            result
        }
        .boxed()
        .shared()
    }

    fn adapter_lookup_done(&self, adapter_id: &str, result: &Result<Vec<Endpoint>, RpcError>) {
        match result {
            Ok(endpoints) => {
                lock(&self.table)
                    .adapters
                    .insert(adapter_id.to_string(), CacheEntry::new(endpoints.clone()));
                if self.traces.locator >= 1 {
                    info!(
                        target: "tern::locator",
                        adapter = adapter_id,
                        endpoints = %endpoint_list(endpoints),
                        "retrieved endpoints from locator, adding to locator table"
                    );
                }
            }
            Err(err @ RpcError::NotRegistered { .. }) => {
                lock(&self.table).adapters.remove(adapter_id);
                if self.traces.locator >= 1 {
                    info!(target: "tern::locator", adapter = adapter_id, error = %err, "adapter not found");
                }
            }
            Err(err) => {
                if self.traces.locator >= 1 {
                    info!(
                        target: "tern::locator",
                        adapter = adapter_id,
                        error = %err,
                        "couldn't contact the locator to retrieve endpoints"
                    );
                }
            }
        }
        lock(&self.adapter_requests).remove(adapter_id);
    }

    async fn object_proxy(&self, identity: &Identity, ttl: i32) -> Result<(ProxyData, bool), RpcError> {
        let lookup = {
            let mut requests = lock(&self.object_requests);
            let cached = lock(&self.table)
                .objects
                .get(identity)
                .and_then(|e| e.fresh(ttl));
            if let Some(proxy) = cached {
                if self.traces.locator >= 2 {
                    info!(target: "tern::locator", object = %identity, "found object in locator table");
                }
                return Ok((proxy, true));
            }
            match requests.get(identity) {
                Some(pending) => pending.clone(),
                None => {
                    if self.traces.locator >= 2 {
                        info!(target: "tern::locator", object = %identity, "searching for well-known object");
                    }
                    let lookup = self.start_object_lookup(identity.clone());
                    requests.insert(identity.clone(), lookup.clone());
                    lookup
                }
            }
        };
        lookup.await.map(|proxy| (proxy, false))
    }

    fn start_object_lookup(&self, identity: Identity) -> Lookup<ProxyData> {
        let locator = self.locator.clone();
        let this = self.this.clone();
        async move {
            let result = object_result(&identity, locator.find_object_by_id(&identity).await);
            if let Some(info) = this.upgrade() {
                info.object_lookup_done(&identity, &result);
            }
            result
        }
        .boxed()
        .shared()
    }

    fn object_lookup_done(&self, identity: &Identity, result: &Result<ProxyData, RpcError>) {
        match result {
            Ok(proxy) => {
                lock(&self.table)
                    .objects
                    .insert(identity.clone(), CacheEntry::new(proxy.clone()));
            }
            Err(err @ RpcError::NotRegistered { .. }) => {
                lock(&self.table).objects.remove(identity);
                if self.traces.locator >= 1 {
                    info!(target: "tern::locator", object = %identity, error = %err, "object not found");
                }
            }
            Err(err) => {
                if self.traces.locator >= 1 {
                    info!(
                        target: "tern::locator",
                        object = %identity,
                        error = %err,
                        "couldn't contact the locator to retrieve the object"
                    );
                }
            }
        }
        lock(&self.object_requests).remove(identity);
    }

    fn remove_object(&self, identity: &Identity) -> Option<ProxyData> {
        let removed = lock(&self.table).objects.remove(identity).map(|e| e.value);
        if removed.is_some() && self.traces.locator >= 2 {
            info!(target: "tern::locator", object = %identity, "removed well-known object from locator table");
        }
        removed
    }

    fn remove_adapter(&self, adapter_id: &str) {
        let removed = lock(&self.table).adapters.remove(adapter_id);
        if let Some(entry) = removed {
            if self.traces.locator >= 2 {
                info!(
                    target: "tern::locator",
                    adapter = adapter_id,
                    endpoints = %endpoint_list(&entry.value),
                    "removed endpoints for adapter from locator table"
                );
            }
        }
    }

    /// Forget what the cache knows about `reference`. For a well-known
    /// object this also drops the entry of the adapter it resolved to.
    pub fn clear_cache(&self, reference: &Reference) {
        if !reference.adapter_id().is_empty() {
            self.remove_adapter(reference.adapter_id());
        } else if reference.is_well_known() {
            if let Some(object) = self.remove_object(reference.identity()) {
                if !object.adapter_id.is_empty() {
                    self.remove_adapter(&object.adapter_id);
                }
            }
        }
    }

    /// Number of cached adapters and well-known objects.
    pub fn cache_size(&self) -> (usize, usize) {
        let table = lock(&self.table);
        (table.adapters.len(), table.objects.len())
    }
}

/// One [`LocatorInfo`] per locator proxy, so proxies using the same locator
/// share its cache.
pub struct LocatorManager {
    traces: TraceLevels,
    table: Mutex<HashMap<Reference, Arc<LocatorInfo>>>,
}

impl LocatorManager {
    pub fn new(traces: TraceLevels) -> Self {
        Self {
            traces,
            table: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, locator: &LocatorPrx) -> Arc<LocatorInfo> {
        // The locator itself is not resolved through a locator.
        let locator = locator
            .proxy()
            .ice_locator(None)
            .map(LocatorPrx::new)
            .unwrap_or_else(|_| locator.clone());
        let key = (**locator.proxy().reference()).clone();
        lock(&self.table)
            .entry(key)
            .or_insert_with(|| LocatorInfo::new(Arc::new(locator), self.traces))
            .clone()
    }

    pub fn destroy(&self) {
        lock(&self.table).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tern_core::version::ENCODING_1_1;
    use tern_core::{InvocationMode, UserException};

    use crate::reference::{Routable, Target};

    #[derive(Default)]
    struct TableLocator {
        adapters: Mutex<HashMap<String, Vec<Endpoint>>>,
        objects: Mutex<HashMap<Identity, ProxyData>>,
        adapter_calls: AtomicUsize,
        object_calls: AtomicUsize,
    }

    #[async_trait]
    impl Locator for TableLocator {
        async fn find_object_by_id(&self, identity: &Identity) -> Result<Option<ProxyData>, RpcError> {
            self.object_calls.fetch_add(1, Ordering::SeqCst);
            lock(&self.objects)
                .get(identity)
                .cloned()
                .map(Some)
                .ok_or_else(|| RpcError::User(UserException::new(OBJECT_NOT_FOUND, bytes::Bytes::new())))
        }

        async fn find_adapter_by_id(&self, adapter_id: &str) -> Result<Option<ProxyData>, RpcError> {
            self.adapter_calls.fetch_add(1, Ordering::SeqCst);
            Ok(lock(&self.adapters).get(adapter_id).map(|endpoints| ProxyData {
                identity: Identity::named("dummy"),
                endpoints: endpoints.clone(),
                ..Default::default()
            }))
        }
    }

    fn reference(identity: &str, adapter_id: &str) -> Reference {
        Reference::new(
            Identity::named(identity),
            InvocationMode::Twoway,
            ENCODING_1_1,
            Target::Routable(Routable::new(Vec::new(), adapter_id.to_string())),
        )
    }

    #[tokio::test]
    async fn test_adapter_cached_after_lookup() {
        let locator = Arc::new(TableLocator::default());
        lock(&locator.adapters).insert("Svc".into(), vec![Endpoint::tcp("h", 1)]);
        let info = LocatorInfo::new(locator.clone(), TraceLevels::default());
        let r = reference("obj", "Svc");

        let (endpoints, cached) = info.get_endpoints(&r, -1).await.unwrap();
        assert_eq!(endpoints, vec![Endpoint::tcp("h", 1)]);
        assert!(!cached);

        let (_, cached) = info.get_endpoints(&r, -1).await.unwrap();
        assert!(cached);
        assert_eq!(locator.adapter_calls.load(Ordering::SeqCst), 1);

        info.clear_cache(&r);
        let (_, cached) = info.get_endpoints(&r, -1).await.unwrap();
        assert!(!cached);
        assert_eq!(locator.adapter_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_zero_ttl_bypasses_cache() {
        let locator = Arc::new(TableLocator::default());
        lock(&locator.adapters).insert("Svc".into(), vec![Endpoint::tcp("h", 1)]);
        let info = LocatorInfo::new(locator.clone(), TraceLevels::default());
        let r = reference("obj", "Svc");
        info.get_endpoints(&r, 0).await.unwrap();
        info.get_endpoints(&r, 0).await.unwrap();
        assert_eq!(locator.adapter_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let locator = Arc::new(TableLocator::default());
        lock(&locator.adapters).insert("Svc".into(), vec![Endpoint::tcp("h", 1)]);
        let info = LocatorInfo::new(locator.clone(), TraceLevels::default());
        let r = reference("obj", "Svc");

        info.get_endpoints(&r, 10).await.unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(info.get_endpoints(&r, 10).await.unwrap().1);
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(!info.get_endpoints(&r, 10).await.unwrap().1);
        assert_eq!(locator.adapter_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unknown_adapter_is_not_registered() {
        let locator = Arc::new(TableLocator::default());
        let info = LocatorInfo::new(locator, TraceLevels::default());
        let err = info.get_endpoints(&reference("obj", "Nope"), -1).await.unwrap_err();
        assert_eq!(err, RpcError::not_registered("object adapter", "Nope"));
    }

    #[tokio::test]
    async fn test_well_known_resolves_through_adapter() {
        let locator = Arc::new(TableLocator::default());
        lock(&locator.objects).insert(
            Identity::named("wk"),
            ProxyData {
                identity: Identity::named("wk"),
                adapter_id: "Svc".into(),
                ..Default::default()
            },
        );
        lock(&locator.adapters).insert("Svc".into(), vec![Endpoint::tcp("h", 1)]);
        let info = LocatorInfo::new(locator.clone(), TraceLevels::default());
        let r = reference("wk", "");

        let (endpoints, cached) = info.get_endpoints(&r, -1).await.unwrap();
        assert_eq!(endpoints, vec![Endpoint::tcp("h", 1)]);
        assert!(!cached);
        assert!(info.get_endpoints(&r, -1).await.unwrap().1);
        assert_eq!(info.cache_size(), (1, 1));

        // Clearing a well-known object also clears its adapter.
        info.clear_cache(&r);
        assert_eq!(info.cache_size(), (0, 0));
    }

    #[tokio::test]
    async fn test_well_known_entry_dropped_when_adapter_missing() {
        let locator = Arc::new(TableLocator::default());
        lock(&locator.objects).insert(
            Identity::named("wk"),
            ProxyData {
                identity: Identity::named("wk"),
                adapter_id: "Gone".into(),
                ..Default::default()
            },
        );
        let info = LocatorInfo::new(locator.clone(), TraceLevels::default());
        let err = info.get_endpoints(&reference("wk", ""), -1).await.unwrap_err();
        assert_eq!(err, RpcError::not_registered("object adapter", "Gone"));
        assert_eq!(info.cache_size(), (0, 0));
    }

    #[tokio::test]
    async fn test_unknown_object_is_not_registered() {
        let locator = Arc::new(TableLocator::default());
        let info = LocatorInfo::new(locator, TraceLevels::default());
        let err = info.get_endpoints(&reference("ghost", ""), -1).await.unwrap_err();
        assert_eq!(err, RpcError::not_registered("object", "ghost"));
    }

    #[tokio::test]
    async fn test_direct_reference_skips_locator() {
        let locator = Arc::new(TableLocator::default());
        let info = LocatorInfo::new(locator.clone(), TraceLevels::default());
        let r = Reference::new(
            Identity::named("obj"),
            InvocationMode::Twoway,
            ENCODING_1_1,
            Target::Routable(Routable::new(vec![Endpoint::tcp("h", 2)], String::new())),
        );
        assert_eq!(info.get_endpoints(&r, -1).await.unwrap(), (vec![Endpoint::tcp("h", 2)], false));
        assert_eq!(locator.adapter_calls.load(Ordering::SeqCst), 0);
    }
}
