//! The communicator: entry point of the runtime and owner of everything
//! proxies share.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tern_core::observer::CommunicatorObserver;
use tern_core::version::CURRENT_PROTOCOL;
use tern_core::{
    Identity, InputStream, OutputStream, Properties, ProxyData, RpcError, Settings, TraceLevels,
};
use tern_server::{AdapterConfig, AdapterRegistry, ObjectAdapter};
use tern_transport::{
    Connection, ConnectionFactory, Connector, MemoryConnector, MemoryNetwork, TcpConnector,
};
use tracing::{debug, info};

use crate::locator_info::{LocatorInfo, LocatorManager};
use crate::locator_proxy::LocatorPrx;
use crate::proxy::ObjectPrx;
use crate::reference::Reference;
use crate::reference_factory::ReferenceFactory;
use crate::retry::{RetryPolicy, RetryQueue};
use crate::router_info::{RouterInfo, RouterManager, RouterPrx};

#[derive(Default)]
pub struct CommunicatorOptions {
    pub properties: Properties,
    pub observer: Option<Arc<dyn CommunicatorObserver>>,
    /// Tried before the built-in memory and TCP connectors.
    pub connectors: Vec<Arc<dyn Connector>>,
    /// In-process network for `mem` endpoints; a private one when `None`.
    pub network: Option<Arc<MemoryNetwork>>,
}

/// State shared by a communicator and every proxy it created.
pub struct Instance {
    properties: Properties,
    settings: Settings,
    reference_factory: ReferenceFactory,
    connection_factory: ConnectionFactory,
    retry_policy: RetryPolicy,
    retry_queue: RetryQueue,
    locator_manager: LocatorManager,
    router_manager: RouterManager,
    adapters: AdapterRegistry,
    observer: Option<Arc<dyn CommunicatorObserver>>,
    network: Arc<MemoryNetwork>,
    destroyed: AtomicBool,
}

impl Instance {
    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn traces(&self) -> TraceLevels {
        self.settings.trace
    }

    pub fn reference_factory(&self) -> &ReferenceFactory {
        &self.reference_factory
    }

    pub fn connection_factory(&self) -> &ConnectionFactory {
        &self.connection_factory
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    pub fn retry_queue(&self) -> &RetryQueue {
        &self.retry_queue
    }

    pub fn locator_manager(&self) -> &LocatorManager {
        &self.locator_manager
    }

    pub fn router_manager(&self) -> &RouterManager {
        &self.router_manager
    }

    pub fn adapters(&self) -> &AdapterRegistry {
        &self.adapters
    }

    pub fn observer(&self) -> Option<&Arc<dyn CommunicatorObserver>> {
        self.observer.as_ref()
    }

    pub fn network(&self) -> &Arc<MemoryNetwork> {
        &self.network
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub fn check_destroyed(&self) -> Result<(), RpcError> {
        if self.is_destroyed() {
            Err(RpcError::CommunicatorDestroyed)
        } else {
            Ok(())
        }
    }
}

#[derive(Clone)]
pub struct Communicator {
    instance: Arc<Instance>,
}

impl Communicator {
    pub fn new(properties: Properties) -> Result<Self, RpcError> {
        Self::with_options(CommunicatorOptions {
            properties,
            ..Default::default()
        })
    }

    pub fn with_options(options: CommunicatorOptions) -> Result<Self, RpcError> {
        let settings = Settings::from_properties(&options.properties)?;
        let traces = settings.trace;
        let network = options.network.unwrap_or_else(MemoryNetwork::new);

        let mut connection_factory = ConnectionFactory::new(traces);
        for connector in options.connectors {
            connection_factory.add_connector(connector);
        }
        connection_factory.add_connector(Arc::new(MemoryConnector::new(network.clone())));
        connection_factory.add_connector(Arc::new(TcpConnector));

        let instance = Arc::new(Instance {
            reference_factory: ReferenceFactory::new(&settings),
            retry_policy: RetryPolicy::new(settings.retry_intervals.clone(), traces),
            retry_queue: RetryQueue::new(),
            locator_manager: LocatorManager::new(traces),
            router_manager: RouterManager::new(traces),
            adapters: AdapterRegistry::new(),
            observer: options.observer,
            properties: options.properties,
            settings,
            connection_factory,
            network,
            destroyed: AtomicBool::new(false),
        });
        let communicator = Self { instance };

        if let Some(router) = communicator.property_to_proxy("Tern.Default.Router")? {
            communicator.set_default_router(Some(&RouterPrx::new(router)));
        }
        if let Some(locator) = communicator.property_to_proxy("Tern.Default.Locator")? {
            communicator.set_default_locator(Some(&LocatorPrx::new(locator)));
        }
        debug!(
            retry_intervals = ?communicator.instance.settings.retry_intervals,
            "communicator initialized"
        );
        Ok(communicator)
    }

    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }

    pub fn properties(&self) -> &Properties {
        self.instance.properties()
    }

    pub fn settings(&self) -> &Settings {
        self.instance.settings()
    }

    pub fn network(&self) -> &Arc<MemoryNetwork> {
        self.instance.network()
    }

    pub fn observer(&self) -> Option<&Arc<dyn CommunicatorObserver>> {
        self.instance.observer()
    }

    fn proxy(&self, reference: Arc<Reference>) -> ObjectPrx {
        ObjectPrx::new(self.instance.clone(), reference)
    }

    /// Parse a stringified proxy; `None` for the null proxy.
    pub fn string_to_proxy(&self, s: &str) -> Result<Option<ObjectPrx>, RpcError> {
        self.instance.check_destroyed()?;
        Ok(self
            .instance
            .reference_factory
            .parse(s)?
            .map(|reference| self.proxy(reference)))
    }

    /// The stringified form of a proxy; empty for the null proxy.
    pub fn proxy_to_string(&self, proxy: Option<&ObjectPrx>) -> String {
        proxy.map(ObjectPrx::to_string).unwrap_or_default()
    }

    /// The proxy configured by property `prefix`, with its `prefix.*`
    /// overrides applied. `prefix.Locator` and `prefix.Router` name the
    /// proxy's locator and router.
    pub fn property_to_proxy(&self, prefix: &str) -> Result<Option<ObjectPrx>, RpcError> {
        self.instance.check_destroyed()?;
        let factory = &self.instance.reference_factory;
        let Some(value) = self.instance.properties.get(prefix) else {
            return Ok(None);
        };
        let Some(reference) = factory.parse(value)? else {
            return Ok(None);
        };
        let mut reference = factory.apply_properties(reference, prefix, &self.instance.properties)?;

        if let Some(locator) = self.property_to_proxy(&format!("{}.Locator", prefix))? {
            let info = self.instance.locator_manager.get(&LocatorPrx::new(locator));
            reference = reference.change_locator(Some(info))?;
        }
        if let Some(router) = self.property_to_proxy(&format!("{}.Router", prefix))? {
            let info = self.instance.router_manager.get(&RouterPrx::new(router));
            reference = reference.change_router(Some(info))?;
        }
        Ok(Some(self.proxy(reference)))
    }

    /// Read a proxy from its wire form.
    pub fn read_proxy(&self, input: &mut InputStream) -> Result<Option<ObjectPrx>, RpcError> {
        let Some(data) = ProxyData::read(input)? else {
            return Ok(None);
        };
        Ok(self
            .instance
            .reference_factory
            .from_proxy_data(data)?
            .map(|reference| self.proxy(reference)))
    }

    pub fn write_proxy(out: &mut OutputStream, proxy: Option<&ObjectPrx>) {
        let data = proxy.map(|p| p.reference().to_proxy_data());
        ProxyData::write(out, data.as_ref());
    }

    pub fn default_locator(&self) -> Option<Arc<LocatorInfo>> {
        self.instance.reference_factory.default_locator()
    }

    /// Locator given to proxies created from now on.
    pub fn set_default_locator(&self, locator: Option<&LocatorPrx>) {
        let info = locator.map(|l| self.instance.locator_manager.get(l));
        self.instance.reference_factory.set_default_locator(info);
    }

    pub fn default_router(&self) -> Option<Arc<RouterInfo>> {
        self.instance.reference_factory.default_router()
    }

    /// Router given to proxies created from now on.
    pub fn set_default_router(&self, router: Option<&RouterPrx>) {
        let info = router.map(|r| self.instance.router_manager.get(r));
        self.instance.reference_factory.set_default_router(info);
    }

    /// Create an adapter configured by `<name>.AdapterId` and
    /// `<name>.Endpoints`.
    pub fn create_object_adapter(&self, name: &str) -> Result<Arc<ObjectAdapter>, RpcError> {
        let endpoints = self
            .instance
            .properties
            .get(&format!("{}.Endpoints", name))
            .unwrap_or_default()
            .to_string();
        self.create_object_adapter_with_endpoints(name, &endpoints)
    }

    /// Create an adapter listening on a `:`-separated endpoint list.
    pub fn create_object_adapter_with_endpoints(
        &self,
        name: &str,
        endpoints: &str,
    ) -> Result<Arc<ObjectAdapter>, RpcError> {
        self.instance.check_destroyed()?;
        let endpoints = if endpoints.trim().is_empty() {
            Vec::new()
        } else {
            self.instance
                .reference_factory
                .parse_endpoints(endpoints, name)?
        };
        let config = AdapterConfig {
            adapter_id: self
                .instance
                .properties
                .get_or(&format!("{}.AdapterId", name), "")
                .to_string(),
            endpoints,
            warn_dispatch: self.instance.settings.warn_dispatch,
            traces: self.instance.traces(),
            observer: self.instance.observer.clone(),
        };
        let adapter = self.instance.adapters.create(name, config)?;
        if self.instance.traces().network >= 1 {
            info!(
                target: "tern::network",
                adapter = %name,
                adapter_id = %adapter.adapter_id(),
                endpoints = adapter.endpoints().len(),
                "created object adapter"
            );
        }
        Ok(adapter)
    }

    /// A proxy for `identity` hosted by `adapter`: indirect when the adapter
    /// has an adapter id, direct otherwise.
    pub fn create_proxy(&self, adapter: &ObjectAdapter, identity: Identity) -> Result<ObjectPrx, RpcError> {
        self.instance.check_destroyed()?;
        let indirect = !adapter.adapter_id().is_empty();
        let data = ProxyData {
            identity,
            protocol: CURRENT_PROTOCOL,
            encoding: self.instance.settings.default_encoding,
            endpoints: if indirect { Vec::new() } else { adapter.endpoints().to_vec() },
            adapter_id: adapter.adapter_id().to_string(),
            ..Default::default()
        };
        self.instance
            .reference_factory
            .from_proxy_data(data)?
            .map(|reference| self.proxy(reference))
            .ok_or_else(|| RpcError::IdentityParse("cannot create a proxy for the null identity".into()))
    }

    /// A proxy bound to an existing connection.
    pub fn fixed_proxy(&self, identity: Identity, connection: Arc<dyn Connection>) -> ObjectPrx {
        self.proxy(self.instance.reference_factory.create_fixed(identity, connection))
    }

    pub fn is_destroyed(&self) -> bool {
        self.instance.is_destroyed()
    }

    /// Fail queued retries, shut down adapters, close connections and drop
    /// the locator and router caches. Idempotent.
    pub async fn destroy(&self) {
        if self.instance.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        let instance = &self.instance;
        instance.retry_queue.destroy();
        instance.adapters.deactivate_all().await;
        instance.adapters.destroy_all().await;
        instance.connection_factory.destroy();

        instance.reference_factory.set_default_locator(None);
        instance.reference_factory.set_default_router(None);
        instance.locator_manager.destroy();
        instance.router_manager.destroy();
        if instance.traces().network >= 1 {
            info!(target: "tern::network", "communicator destroyed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tern_core::Endpoint;

    fn communicator(entries: &[(&str, &str)]) -> Communicator {
        let mut props = Properties::new();
        for (k, v) in entries {
            props.set(*k, *v);
        }
        Communicator::new(props).unwrap()
    }

    #[tokio::test]
    async fn test_string_to_proxy_and_back() {
        let c = communicator(&[]);
        let proxy = c.string_to_proxy("obj -f f:tcp -h h -p 1").unwrap().unwrap();
        let again = c.string_to_proxy(&c.proxy_to_string(Some(&proxy))).unwrap().unwrap();
        assert_eq!(proxy, again);
        assert!(c.string_to_proxy("").unwrap().is_none());
        assert_eq!(c.proxy_to_string(None), "");
    }

    #[tokio::test]
    async fn test_property_to_proxy_with_locator() {
        let c = communicator(&[
            ("Hello.Proxy", "hello @ HelloAdapter"),
            ("Hello.Proxy.LocatorCacheTimeout", "5"),
            ("Hello.Proxy.Locator", "Tern/Locator:mem -h registry -p 1"),
        ]);
        let proxy = c.property_to_proxy("Hello.Proxy").unwrap().unwrap();
        assert_eq!(proxy.ice_get_locator_cache_timeout(), Some(5));
        assert!(proxy.reference().locator_info().is_some());
        assert!(c.property_to_proxy("Missing").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_default_locator_applies_to_new_proxies() {
        let c = communicator(&[("Tern.Default.Locator", "Tern/Locator:mem -h registry -p 1")]);
        let info = c.default_locator().unwrap();
        let proxy = c.string_to_proxy("hello @ A").unwrap().unwrap();
        assert!(Arc::ptr_eq(proxy.reference().locator_info().unwrap(), &info));

        c.set_default_locator(None);
        let proxy = c.string_to_proxy("hello @ A").unwrap().unwrap();
        assert!(proxy.reference().locator_info().is_none());
    }

    #[tokio::test]
    async fn test_create_proxy_direct_and_indirect() {
        let c = communicator(&[
            ("Direct.Endpoints", "mem -h direct -p 1"),
            ("Indirect.AdapterId", "IndirectId"),
        ]);
        let direct = c.create_object_adapter("Direct").unwrap();
        let proxy = c.create_proxy(&direct, Identity::named("a")).unwrap();
        assert_eq!(proxy.ice_get_endpoints(), &[Endpoint::mem("direct", 1)]);

        let indirect = c.create_object_adapter("Indirect").unwrap();
        let proxy = c.create_proxy(&indirect, Identity::named("b")).unwrap();
        assert_eq!(proxy.ice_get_adapter_id(), "IndirectId");
        assert!(proxy.ice_get_endpoints().is_empty());

        assert!(matches!(
            c.create_object_adapter("Direct"),
            Err(RpcError::AlreadyRegistered { .. })
        ));
    }

    #[tokio::test]
    async fn test_read_write_proxy() {
        let c = communicator(&[]);
        let proxy = c.string_to_proxy("obj @ A").unwrap().unwrap();
        let mut out = OutputStream::new();
        Communicator::write_proxy(&mut out, Some(&proxy));
        Communicator::write_proxy(&mut out, None);
        let mut input = InputStream::new(out.freeze());
        assert_eq!(c.read_proxy(&mut input).unwrap(), Some(proxy));
        assert_eq!(c.read_proxy(&mut input).unwrap(), None);
    }

    #[tokio::test]
    async fn test_destroy_rejects_new_work() {
        let c = communicator(&[]);
        c.destroy().await;
        c.destroy().await;
        assert!(c.is_destroyed());
        assert!(matches!(
            c.string_to_proxy("obj"),
            Err(RpcError::CommunicatorDestroyed)
        ));
        assert!(matches!(
            c.create_object_adapter("A"),
            Err(RpcError::CommunicatorDestroyed)
        ));
    }

    #[test]
    fn test_invalid_configuration_is_rejected() {
        let mut props = Properties::new();
        props.set("Tern.Default.EndpointSelection", "Sometimes");
        assert!(matches!(
            Communicator::new(props),
            Err(RpcError::Initialization(_))
        ));
    }
}
