//! Untyped proxies.
//!
//! An [`ObjectPrx`] is an immutable reference plus the per-proxy state its
//! clones share: the cached request handler, the batch queue and a small
//! pool of message buffers. `ice_*` builders return a proxy with its own
//! shared state, or the same proxy when nothing changes.

use bytes::{Bytes, BytesMut};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use tern_core::observer::{CallAttributes, ObserverHandle};
use tern_core::protocol::{finish_message, start_request};
use tern_core::{
    lock, Context, EncodingVersion, Endpoint, EndpointSelection, Identity, InputStream,
    InvocationMode, OperationMode, OutputStream, RequestHeader, RpcError,
};
use tern_transport::Connection;
use tracing::warn;

use crate::batch::BatchRequestQueue;
use crate::collocated::CollocatedRequestHandler;
use crate::communicator::Instance;
use crate::connect_request_handler::ConnectRequestHandler;
use crate::locator_proxy::LocatorPrx;
use crate::outgoing_async::{InvocationKind, OutgoingAsync};
use crate::reference::{Reference, Target};
use crate::request_handler::{same_handler, ConnectionRequestHandler, RequestHandler};
use crate::router_info::RouterPrx;

const MAX_CACHED_BUFFERS: usize = 4;

/// State shared by clones of one proxy.
pub(crate) struct ProxyShared {
    handler: Mutex<Option<Arc<dyn RequestHandler>>>,
    batch: BatchRequestQueue,
    buffers: Mutex<Vec<BytesMut>>,
    cache_buffers: bool,
}

impl ProxyShared {
    fn new(instance: &Instance) -> Arc<Self> {
        let settings = instance.settings();
        Arc::new(Self {
            handler: Mutex::new(None),
            batch: BatchRequestQueue::new(settings.batch_auto_flush_size),
            buffers: Mutex::new(Vec::new()),
            cache_buffers: settings.cache_message_buffers > 0,
        })
    }

    /// Replace `previous` by `next` if it is still the cached handler.
    pub(crate) fn update_request_handler(
        &self,
        previous: &Arc<dyn RequestHandler>,
        next: Option<Arc<dyn RequestHandler>>,
    ) {
        let mut slot = lock(&self.handler);
        if slot.as_ref().is_some_and(|h| same_handler(h, previous)) {
            *slot = next;
        }
    }

    pub(crate) fn caches_buffers(&self) -> bool {
        self.cache_buffers
    }

    pub(crate) fn recycle(&self, mut buffer: BytesMut) {
        buffer.clear();
        let mut buffers = lock(&self.buffers);
        if buffers.len() < MAX_CACHED_BUFFERS {
            buffers.push(buffer);
        }
    }

    fn take_buffer(&self) -> OutputStream {
        match lock(&self.buffers).pop() {
            Some(buffer) => OutputStream::from_buffer(buffer),
            None => OutputStream::new(),
        }
    }

    pub(crate) fn cached_buffers(&self) -> usize {
        lock(&self.buffers).len()
    }
}

/// Per-invocation options.
#[derive(Debug, Clone, Default)]
pub struct InvokeOptions {
    /// Replaces the proxy's context for this invocation.
    pub context: Option<Context>,
    /// Type ids of the user exceptions the operation declares. Others are
    /// reported as `UnknownUser`.
    pub user_exceptions: Vec<String>,
}

impl InvokeOptions {
    pub fn with_context(context: Context) -> Self {
        Self {
            context: Some(context),
            ..Default::default()
        }
    }

    pub fn declaring(type_ids: &[&str]) -> Self {
        Self {
            context: None,
            user_exceptions: type_ids.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Clone)]
pub struct ObjectPrx {
    instance: Arc<Instance>,
    reference: Arc<Reference>,
    shared: Arc<ProxyShared>,
}

impl ObjectPrx {
    pub(crate) fn new(instance: Arc<Instance>, reference: Arc<Reference>) -> Self {
        let shared = ProxyShared::new(&instance);
        Self {
            instance,
            reference,
            shared,
        }
    }

    pub fn reference(&self) -> &Arc<Reference> {
        &self.reference
    }

    pub(crate) fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }

    pub(crate) fn shared(&self) -> &ProxyShared {
        &self.shared
    }

    fn with_reference(&self, reference: Arc<Reference>) -> Self {
        if Arc::ptr_eq(&reference, &self.reference) {
            self.clone()
        } else {
            Self::new(self.instance.clone(), reference)
        }
    }

    // Accessors

    pub fn ice_get_identity(&self) -> &Identity {
        self.reference.identity()
    }

    pub fn ice_get_facet(&self) -> &str {
        self.reference.facet()
    }

    pub fn ice_get_context(&self) -> &Context {
        self.reference.context()
    }

    pub fn ice_get_encoding_version(&self) -> EncodingVersion {
        self.reference.encoding()
    }

    pub fn ice_get_adapter_id(&self) -> &str {
        self.reference.adapter_id()
    }

    pub fn ice_get_endpoints(&self) -> &[Endpoint] {
        self.reference.endpoints()
    }

    pub fn ice_get_invocation_timeout(&self) -> i32 {
        self.reference.invocation_timeout()
    }

    pub fn ice_get_locator_cache_timeout(&self) -> Option<i32> {
        self.reference.routable().map(|r| r.locator_cache_timeout)
    }

    pub fn ice_get_connection_id(&self) -> Option<&str> {
        self.reference.routable().map(|r| r.connection_id.as_str())
    }

    pub fn ice_get_endpoint_selection(&self) -> Option<EndpointSelection> {
        self.reference.routable().map(|r| r.endpoint_selection)
    }

    pub fn ice_is_twoway(&self) -> bool {
        self.reference.mode().is_twoway()
    }

    pub fn ice_is_oneway(&self) -> bool {
        self.reference.mode() == InvocationMode::Oneway
    }

    pub fn ice_is_batch_oneway(&self) -> bool {
        self.reference.mode() == InvocationMode::BatchOneway
    }

    pub fn ice_is_datagram(&self) -> bool {
        self.reference.mode() == InvocationMode::Datagram
    }

    pub fn ice_is_batch_datagram(&self) -> bool {
        self.reference.mode() == InvocationMode::BatchDatagram
    }

    pub fn ice_is_secure(&self) -> bool {
        self.reference.secure()
    }

    pub fn ice_is_prefer_secure(&self) -> bool {
        self.reference.routable().is_some_and(|r| r.prefer_secure)
    }

    pub fn ice_is_collocation_optimized(&self) -> bool {
        self.reference.routable().is_some_and(|r| r.collocation_optimized)
    }

    pub fn ice_is_connection_cached(&self) -> bool {
        self.reference.routable().map_or(true, |r| r.cache_connection)
    }

    pub fn ice_is_fixed(&self) -> bool {
        self.reference.is_fixed()
    }

    // Builders

    pub fn ice_identity(&self, identity: Identity) -> Result<Self, RpcError> {
        if identity.is_null() {
            return Err(RpcError::IdentityParse("null identity".into()));
        }
        Ok(self.with_reference(self.reference.change_identity(identity)))
    }

    pub fn ice_facet(&self, facet: &str) -> Self {
        self.with_reference(self.reference.change_facet(facet))
    }

    pub fn ice_context(&self, context: Context) -> Self {
        self.with_reference(self.reference.change_context(context))
    }

    pub fn ice_encoding_version(&self, encoding: EncodingVersion) -> Self {
        self.with_reference(self.reference.change_encoding(encoding))
    }

    fn ice_mode(&self, mode: InvocationMode) -> Self {
        self.with_reference(self.reference.change_mode(mode))
    }

    pub fn ice_twoway(&self) -> Self {
        self.ice_mode(InvocationMode::Twoway)
    }

    pub fn ice_oneway(&self) -> Self {
        self.ice_mode(InvocationMode::Oneway)
    }

    pub fn ice_batch_oneway(&self) -> Self {
        self.ice_mode(InvocationMode::BatchOneway)
    }

    pub fn ice_datagram(&self) -> Self {
        self.ice_mode(InvocationMode::Datagram)
    }

    pub fn ice_batch_datagram(&self) -> Self {
        self.ice_mode(InvocationMode::BatchDatagram)
    }

    pub fn ice_secure(&self, secure: bool) -> Self {
        self.with_reference(self.reference.change_secure(secure))
    }

    pub fn ice_compress(&self, compress: bool) -> Self {
        self.with_reference(self.reference.change_compress(Some(compress)))
    }

    /// Milliseconds; -1 disables the timeout.
    pub fn ice_invocation_timeout(&self, timeout: i32) -> Self {
        self.with_reference(self.reference.change_invocation_timeout(timeout))
    }

    pub fn ice_endpoints(&self, endpoints: Vec<Endpoint>) -> Result<Self, RpcError> {
        Ok(self.with_reference(self.reference.change_endpoints(endpoints)?))
    }

    pub fn ice_adapter_id(&self, adapter_id: &str) -> Result<Self, RpcError> {
        Ok(self.with_reference(self.reference.change_adapter_id(adapter_id)?))
    }

    pub fn ice_locator(&self, locator: Option<&LocatorPrx>) -> Result<Self, RpcError> {
        let info = locator.map(|l| self.instance.locator_manager().get(l));
        Ok(self.with_reference(self.reference.change_locator(info)?))
    }

    pub fn ice_router(&self, router: Option<&RouterPrx>) -> Result<Self, RpcError> {
        let info = router.map(|r| self.instance.router_manager().get(r));
        Ok(self.with_reference(self.reference.change_router(info)?))
    }

    pub fn ice_collocation_optimized(&self, value: bool) -> Result<Self, RpcError> {
        Ok(self.with_reference(self.reference.change_collocation_optimized(value)?))
    }

    pub fn ice_connection_cached(&self, value: bool) -> Result<Self, RpcError> {
        Ok(self.with_reference(self.reference.change_cache_connection(value)?))
    }

    pub fn ice_prefer_secure(&self, value: bool) -> Result<Self, RpcError> {
        Ok(self.with_reference(self.reference.change_prefer_secure(value)?))
    }

    pub fn ice_endpoint_selection(&self, value: EndpointSelection) -> Result<Self, RpcError> {
        Ok(self.with_reference(self.reference.change_endpoint_selection(value)?))
    }

    /// Seconds; -1 caches forever, 0 disables the cache.
    pub fn ice_locator_cache_timeout(&self, value: i32) -> Result<Self, RpcError> {
        Ok(self.with_reference(self.reference.change_locator_cache_timeout(value)?))
    }

    pub fn ice_connection_id(&self, value: &str) -> Result<Self, RpcError> {
        Ok(self.with_reference(self.reference.change_connection_id(value)?))
    }

    /// A proxy bound to `connection`; it is never retried nor re-resolved.
    pub fn ice_fixed(&self, connection: Arc<dyn Connection>) -> Self {
        let reference = Reference::new(
            self.reference.identity().clone(),
            self.reference.mode(),
            self.reference.encoding(),
            Target::Fixed(connection),
        );
        let reference = Arc::new(reference)
            .change_facet(self.reference.facet())
            .change_secure(self.reference.secure())
            .change_context(self.reference.context().clone())
            .change_invocation_timeout(self.reference.invocation_timeout());
        Self::new(self.instance.clone(), reference)
    }

    // Request handlers

    pub(crate) fn request_handler(&self) -> Result<Arc<dyn RequestHandler>, RpcError> {
        self.instance.check_destroyed()?;
        let mut slot = lock(&self.shared.handler);
        if let Some(handler) = slot.as_ref() {
            return Ok(handler.clone());
        }
        let handler = self.create_request_handler()?;
        if self.ice_is_connection_cached() {
            *slot = Some(handler.clone());
        }
        Ok(handler)
    }

    fn create_request_handler(&self) -> Result<Arc<dyn RequestHandler>, RpcError> {
        let reference = &self.reference;
        match reference.target() {
            Target::Fixed(connection) => Ok(Arc::new(ConnectionRequestHandler::fixed(
                reference,
                connection.clone(),
            )?)),
            Target::Routable(routable) => {
                if routable.collocation_optimized {
                    let adapter = self.instance.adapters().find_collocated(
                        reference.identity(),
                        &routable.adapter_id,
                        &routable.endpoints,
                    );
                    if let Some(adapter) = adapter {
                        return Ok(CollocatedRequestHandler::new(adapter, self.instance.traces()));
                    }
                }
                Ok(ConnectRequestHandler::start(
                    self.instance.clone(),
                    reference.clone(),
                    Arc::downgrade(&self.shared),
                ))
            }
        }
    }

    pub(crate) fn clear_request_handler(&self, handler: &Arc<dyn RequestHandler>) {
        self.shared.update_request_handler(handler, None);
    }

    // Invocation

    /// Marshal and start an invocation. Batch proxies queue the request and
    /// return an invocation that already completed.
    pub fn begin_invoke(
        &self,
        operation: &str,
        mode: OperationMode,
        params: &[u8],
        options: InvokeOptions,
    ) -> Result<Arc<OutgoingAsync>, RpcError> {
        self.instance.check_destroyed()?;
        let reference = &self.reference;
        let encoding = reference.encoding();
        encoding.check_supported()?;

        let header = RequestHeader {
            identity: reference.identity().clone(),
            facet: reference.facet().to_string(),
            operation: operation.to_string(),
            mode,
            context: options.context.unwrap_or_else(|| reference.context().clone()),
        };
        let kind = InvocationKind::Request {
            operation: operation.to_string(),
            mode,
            user_exceptions: options.user_exceptions,
        };

        if reference.mode().is_batch() {
            let mut body = OutputStream::new();
            header.write(&mut body);
            body.write_encapsulation_payload(encoding, params);
            if let Some((frame, count)) = self.shared.batch.enqueue(body.as_slice()) {
                let proxy = self.to_string();
                self.flush_batch(frame, count).on_completed(move |result| {
                    if let Err(err) = result {
                        warn!(%proxy, count, error = %err, "automatic batch flush failed");
                    }
                });
            }
            return Ok(OutgoingAsync::completed_locally(self.clone(), kind));
        }

        let mut out = self.shared.take_buffer();
        start_request(&mut out);
        header.write(&mut out);
        out.write_encapsulation_payload(encoding, params);
        finish_message(&mut out);

        let observer = ObserverHandle::attach(self.instance.observer().and_then(|o| {
            o.invocation_observer(&CallAttributes {
                target: reference.to_string(),
                identity: header.identity.to_string(),
                facet: header.facet.clone(),
                operation: header.operation.clone(),
                mode: format!("{:?}", mode),
                context: header.context.clone(),
            })
        }));

        let outgoing = OutgoingAsync::new(self.clone(), kind, out.freeze(), observer);
        outgoing.invoke();
        Ok(outgoing)
    }

    /// Invoke and wait for the encoded return values.
    pub async fn invoke(
        &self,
        operation: &str,
        mode: OperationMode,
        params: &[u8],
        options: InvokeOptions,
    ) -> Result<Bytes, RpcError> {
        self.begin_invoke(operation, mode, params, options)?
            .response()
            .await
    }

    fn flush_batch(&self, frame: Bytes, count: usize) -> Arc<OutgoingAsync> {
        let outgoing = OutgoingAsync::new(
            self.clone(),
            InvocationKind::FlushBatch { count },
            frame,
            ObserverHandle::none(),
        );
        outgoing.invoke();
        outgoing
    }

    /// Number of batched requests waiting for a flush.
    pub fn ice_batch_request_count(&self) -> usize {
        self.shared.batch.len()
    }

    /// Send the requests queued on this batch proxy.
    pub async fn ice_flush_batch_requests(&self) -> Result<(), RpcError> {
        match self.shared.batch.swap() {
            Some((frame, count)) => self.flush_batch(frame, count).response().await.map(|_| ()),
            None => Ok(()),
        }
    }

    fn check_twoway_only(&self, operation: &str) -> Result<(), RpcError> {
        if self.ice_is_twoway() {
            Ok(())
        } else {
            Err(RpcError::FeatureNotSupported(format!(
                "operation `{}' can only be invoked on a twoway proxy",
                operation
            )))
        }
    }

    // Built-in operations

    pub async fn ice_ping(&self) -> Result<(), RpcError> {
        self.invoke("ice_ping", OperationMode::Nonmutating, &[], InvokeOptions::default())
            .await
            .map(|_| ())
    }

    pub async fn ice_is_a(&self, type_id: &str) -> Result<bool, RpcError> {
        self.check_twoway_only("ice_isA")?;
        let mut params = OutputStream::new();
        params.write_string(type_id);
        let reply = self
            .invoke("ice_isA", OperationMode::Nonmutating, params.as_slice(), InvokeOptions::default())
            .await?;
        InputStream::new(reply).read_bool()
    }

    pub async fn ice_id(&self) -> Result<String, RpcError> {
        self.check_twoway_only("ice_id")?;
        let reply = self
            .invoke("ice_id", OperationMode::Nonmutating, &[], InvokeOptions::default())
            .await?;
        InputStream::new(reply).read_string()
    }

    pub async fn ice_ids(&self) -> Result<Vec<String>, RpcError> {
        self.check_twoway_only("ice_ids")?;
        let reply = self
            .invoke("ice_ids", OperationMode::Nonmutating, &[], InvokeOptions::default())
            .await?;
        InputStream::new(reply).read_string_seq()
    }

    /// The connection this proxy's requests travel on, establishing it if
    /// needed. `None` for collocated proxies.
    pub async fn ice_get_connection(&self) -> Result<Option<Arc<dyn Connection>>, RpcError> {
        self.request_handler()?.get_connection().await
    }
}

/// Unwrap a proxy parameter that must not be null.
pub fn require_proxy<T>(proxy: Option<T>, operation: &str, target: &Identity) -> Result<T, RpcError> {
    proxy.ok_or_else(|| {
        RpcError::marshal(format!(
            "null proxy passed to operation `{}' on `{}'",
            operation, target
        ))
    })
}

impl fmt::Display for ObjectPrx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.reference, f)
    }
}

impl fmt::Debug for ObjectPrx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectPrx({})", self.reference)
    }
}

impl PartialEq for ObjectPrx {
    fn eq(&self, other: &Self) -> bool {
        self.reference == other.reference
    }
}

impl Eq for ObjectPrx {}

impl Hash for ObjectPrx {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.reference.hash(state);
    }
}
