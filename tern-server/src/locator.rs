//! An in-process locator service.
//!
//! Answers `findObjectById` and `findAdapterById` from tables filled by the
//! application. Lookups that miss raise the `ObjectNotFound` and
//! `AdapterNotFound` user exceptions.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tern_core::{Endpoint, Identity, OutputStream, ProxyData, RpcError, UserException};
use tracing::debug;

use crate::current::IncomingRequest;
use crate::servant::{operation_not_exist, Object, OBJECT_TYPE_ID};

pub const LOCATOR_TYPE_ID: &str = "::Tern::Locator";
pub const ADAPTER_NOT_FOUND: &str = "::Tern::AdapterNotFoundException";
pub const OBJECT_NOT_FOUND: &str = "::Tern::ObjectNotFoundException";

pub const FIND_OBJECT_BY_ID: &str = "findObjectById";
pub const FIND_ADAPTER_BY_ID: &str = "findAdapterById";

#[derive(Default)]
pub struct LocatorRegistry {
    objects: DashMap<Identity, ProxyData>,
    adapters: DashMap<String, ProxyData>,
    object_lookups: AtomicUsize,
    adapter_lookups: AtomicUsize,
    delay: Option<Duration>,
}

impl LocatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every lookup after `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn register_adapter(&self, adapter_id: &str, endpoints: Vec<Endpoint>) {
        self.adapters.insert(
            adapter_id.to_string(),
            ProxyData {
                identity: Identity::named("dummy"),
                endpoints,
                ..Default::default()
            },
        );
    }

    pub fn unregister_adapter(&self, adapter_id: &str) -> bool {
        self.adapters.remove(adapter_id).is_some()
    }

    pub fn register_object(&self, proxy: ProxyData) {
        self.objects.insert(proxy.identity.clone(), proxy);
    }

    pub fn unregister_object(&self, identity: &Identity) -> bool {
        self.objects.remove(identity).is_some()
    }

    pub fn object_lookups(&self) -> usize {
        self.object_lookups.load(Ordering::SeqCst)
    }

    pub fn adapter_lookups(&self) -> usize {
        self.adapter_lookups.load(Ordering::SeqCst)
    }

    async fn pause(&self) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl Object for LocatorRegistry {
    fn type_ids(&self) -> Vec<String> {
        vec![LOCATOR_TYPE_ID.to_string(), OBJECT_TYPE_ID.to_string()]
    }

    async fn dispatch(&self, request: &IncomingRequest) -> Result<Bytes, RpcError> {
        let mut out = OutputStream::new();
        match request.current.operation.as_str() {
            FIND_OBJECT_BY_ID => {
                let identity = request.params().read_identity()?;
                self.object_lookups.fetch_add(1, Ordering::SeqCst);
                self.pause().await;
                let proxy = self.objects.get(&identity).map(|p| p.value().clone());
                debug!(target: "tern::locator", identity = %identity, found = proxy.is_some(), "findObjectById");
                let proxy = proxy.ok_or_else(|| {
                    RpcError::User(UserException::new(OBJECT_NOT_FOUND, Bytes::new()))
                })?;
                ProxyData::write(&mut out, Some(&proxy));
            }
            FIND_ADAPTER_BY_ID => {
                let adapter_id = request.params().read_string()?;
                self.adapter_lookups.fetch_add(1, Ordering::SeqCst);
                self.pause().await;
                let proxy = self.adapters.get(&adapter_id).map(|p| p.value().clone());
                debug!(target: "tern::locator", adapter_id = %adapter_id, found = proxy.is_some(), "findAdapterById");
                let proxy = proxy.ok_or_else(|| {
                    RpcError::User(UserException::new(ADAPTER_NOT_FOUND, Bytes::new()))
                })?;
                ProxyData::write(&mut out, Some(&proxy));
            }
            "getRegistry" => ProxyData::write(&mut out, None),
            _ => return Err(operation_not_exist(&request.current)),
        }
        Ok(out.freeze())
    }
}
