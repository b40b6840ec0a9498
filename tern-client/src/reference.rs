//! References: what a proxy calls and how.
//!
//! A [`Reference`] is immutable and shared behind an `Arc`. The `change_*`
//! methods return a new reference, or the very same `Arc` when the value is
//! unchanged, so proxies derived without changes keep comparing cheaply.

use rand::seq::SliceRandom;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tern_core::version::CURRENT_PROTOCOL;
use tern_core::{
    Context, EncodingVersion, Endpoint, EndpointSelection, Identity, InvocationMode,
    ProtocolVersion, ProxyData, RpcError,
};
use tern_transport::Connection;

use crate::locator_info::LocatorInfo;
use crate::router_info::RouterInfo;

/// How a reference reaches its target.
#[derive(Clone)]
pub enum Target {
    /// Bound to one connection; never re-resolved and never retried.
    Fixed(Arc<dyn Connection>),
    Routable(Routable),
}

/// Addressing and connection policy of a routable reference.
///
/// At most one of `endpoints` and `adapter_id` is non-empty. With neither,
/// the reference designates a well-known object resolved by its identity.
#[derive(Clone)]
pub struct Routable {
    pub endpoints: Vec<Endpoint>,
    pub adapter_id: String,
    pub locator_info: Option<Arc<LocatorInfo>>,
    pub router_info: Option<Arc<RouterInfo>>,
    pub collocation_optimized: bool,
    pub cache_connection: bool,
    pub prefer_secure: bool,
    pub endpoint_selection: EndpointSelection,
    /// Seconds; -1 caches forever.
    pub locator_cache_timeout: i32,
    pub connection_id: String,
}

impl Routable {
    pub fn new(endpoints: Vec<Endpoint>, adapter_id: String) -> Self {
        Self {
            endpoints,
            adapter_id,
            locator_info: None,
            router_info: None,
            collocation_optimized: true,
            cache_connection: true,
            prefer_secure: false,
            endpoint_selection: EndpointSelection::Random,
            locator_cache_timeout: -1,
            connection_id: String::new(),
        }
    }
}

#[derive(Clone)]
pub struct Reference {
    identity: Identity,
    facet: String,
    mode: InvocationMode,
    secure: bool,
    protocol: ProtocolVersion,
    encoding: EncodingVersion,
    compress: Option<bool>,
    /// Milliseconds; -1 disables the invocation timeout.
    invocation_timeout: i32,
    context: Context,
    target: Target,
}

fn fixed_error(field: &str) -> RpcError {
    RpcError::FeatureNotSupported(format!("cannot change the {} of a fixed proxy", field))
}

fn same_option_arc<T: ?Sized>(a: &Option<Arc<T>>, b: &Option<Arc<T>>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        _ => false,
    }
}

impl Reference {
    pub fn new(identity: Identity, mode: InvocationMode, encoding: EncodingVersion, target: Target) -> Self {
        Self {
            identity,
            facet: String::new(),
            mode,
            secure: false,
            protocol: CURRENT_PROTOCOL,
            encoding,
            compress: None,
            invocation_timeout: -1,
            context: Context::new(),
            target,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn facet(&self) -> &str {
        &self.facet
    }

    pub fn mode(&self) -> InvocationMode {
        self.mode
    }

    pub fn secure(&self) -> bool {
        self.secure
    }

    pub fn protocol(&self) -> ProtocolVersion {
        self.protocol
    }

    pub fn encoding(&self) -> EncodingVersion {
        self.encoding
    }

    pub fn compress(&self) -> Option<bool> {
        self.compress
    }

    pub fn invocation_timeout(&self) -> i32 {
        self.invocation_timeout
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn routable(&self) -> Option<&Routable> {
        match &self.target {
            Target::Routable(r) => Some(r),
            Target::Fixed(_) => None,
        }
    }

    pub fn is_fixed(&self) -> bool {
        matches!(self.target, Target::Fixed(_))
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        self.routable().map(|r| r.endpoints.as_slice()).unwrap_or(&[])
    }

    pub fn adapter_id(&self) -> &str {
        self.routable().map(|r| r.adapter_id.as_str()).unwrap_or("")
    }

    pub fn locator_info(&self) -> Option<&Arc<LocatorInfo>> {
        self.routable().and_then(|r| r.locator_info.as_ref())
    }

    pub fn router_info(&self) -> Option<&Arc<RouterInfo>> {
        self.routable().and_then(|r| r.router_info.as_ref())
    }

    /// Resolved through a locator: by adapter id or as a well-known object.
    pub fn is_indirect(&self) -> bool {
        self.routable().is_some_and(|r| r.endpoints.is_empty())
    }

    pub fn is_well_known(&self) -> bool {
        self.routable()
            .is_some_and(|r| r.endpoints.is_empty() && r.adapter_id.is_empty())
    }

    fn with(self: &Arc<Self>, unchanged: bool, f: impl FnOnce(&mut Reference)) -> Arc<Self> {
        if unchanged {
            return self.clone();
        }
        let mut copy = (**self).clone();
        f(&mut copy);
        Arc::new(copy)
    }

    fn with_routable<T>(
        self: &Arc<Self>,
        field: &str,
        value: T,
        unchanged: impl FnOnce(&Routable, &T) -> bool,
        set: impl FnOnce(&mut Routable, T),
    ) -> Result<Arc<Self>, RpcError> {
        let Target::Routable(r) = &self.target else {
            return Err(fixed_error(field));
        };
        let unchanged = unchanged(r, &value);
        Ok(self.with(unchanged, |copy| {
            if let Target::Routable(r) = &mut copy.target {
                set(r, value);
            }
        }))
    }

    pub fn change_identity(self: &Arc<Self>, identity: Identity) -> Arc<Self> {
        self.with(self.identity == identity, |r| r.identity = identity)
    }

    pub fn change_facet(self: &Arc<Self>, facet: &str) -> Arc<Self> {
        self.with(self.facet == facet, |r| r.facet = facet.to_string())
    }

    pub fn change_mode(self: &Arc<Self>, mode: InvocationMode) -> Arc<Self> {
        self.with(self.mode == mode, |r| r.mode = mode)
    }

    pub fn change_secure(self: &Arc<Self>, secure: bool) -> Arc<Self> {
        self.with(self.secure == secure, |r| r.secure = secure)
    }

    pub fn change_encoding(self: &Arc<Self>, encoding: EncodingVersion) -> Arc<Self> {
        self.with(self.encoding == encoding, |r| r.encoding = encoding)
    }

    pub fn change_protocol(self: &Arc<Self>, protocol: ProtocolVersion) -> Arc<Self> {
        self.with(self.protocol == protocol, |r| r.protocol = protocol)
    }

    pub fn change_compress(self: &Arc<Self>, compress: Option<bool>) -> Arc<Self> {
        self.with(self.compress == compress, |r| r.compress = compress)
    }

    pub fn change_invocation_timeout(self: &Arc<Self>, timeout: i32) -> Arc<Self> {
        self.with(self.invocation_timeout == timeout, |r| {
            r.invocation_timeout = timeout
        })
    }

    pub fn change_context(self: &Arc<Self>, context: Context) -> Arc<Self> {
        self.with(self.context == context, |r| r.context = context)
    }

    /// Replace the endpoints. Non-empty endpoints clear the adapter id.
    pub fn change_endpoints(self: &Arc<Self>, endpoints: Vec<Endpoint>) -> Result<Arc<Self>, RpcError> {
        self.with_routable(
            "endpoints",
            endpoints,
            |r, endpoints| r.endpoints == *endpoints,
            |r, endpoints| {
                if !endpoints.is_empty() {
                    r.adapter_id.clear();
                }
                r.endpoints = endpoints;
            },
        )
    }

    /// Replace the adapter id. A non-empty adapter id clears the endpoints.
    pub fn change_adapter_id(self: &Arc<Self>, adapter_id: &str) -> Result<Arc<Self>, RpcError> {
        self.with_routable(
            "adapter id",
            adapter_id,
            |r, id| r.adapter_id == *id,
            |r, id| {
                if !id.is_empty() {
                    r.endpoints.clear();
                }
                r.adapter_id = id.to_string();
            },
        )
    }

    pub fn change_locator(self: &Arc<Self>, locator: Option<Arc<LocatorInfo>>) -> Result<Arc<Self>, RpcError> {
        self.with_routable(
            "locator",
            locator,
            |r, locator| same_option_arc(&r.locator_info, locator),
            |r, locator| r.locator_info = locator,
        )
    }

    pub fn change_router(self: &Arc<Self>, router: Option<Arc<RouterInfo>>) -> Result<Arc<Self>, RpcError> {
        self.with_routable(
            "router",
            router,
            |r, router| same_option_arc(&r.router_info, router),
            |r, router| r.router_info = router,
        )
    }

    pub fn change_collocation_optimized(self: &Arc<Self>, value: bool) -> Result<Arc<Self>, RpcError> {
        self.with_routable(
            "collocation optimization",
            value,
            |r, v| r.collocation_optimized == *v,
            |r, v| r.collocation_optimized = v,
        )
    }

    pub fn change_cache_connection(self: &Arc<Self>, value: bool) -> Result<Arc<Self>, RpcError> {
        self.with_routable(
            "connection caching",
            value,
            |r, v| r.cache_connection == *v,
            |r, v| r.cache_connection = v,
        )
    }

    pub fn change_prefer_secure(self: &Arc<Self>, value: bool) -> Result<Arc<Self>, RpcError> {
        self.with_routable(
            "secure preference",
            value,
            |r, v| r.prefer_secure == *v,
            |r, v| r.prefer_secure = v,
        )
    }

    pub fn change_endpoint_selection(
        self: &Arc<Self>,
        value: EndpointSelection,
    ) -> Result<Arc<Self>, RpcError> {
        self.with_routable(
            "endpoint selection",
            value,
            |r, v| r.endpoint_selection == *v,
            |r, v| r.endpoint_selection = v,
        )
    }

    pub fn change_locator_cache_timeout(self: &Arc<Self>, value: i32) -> Result<Arc<Self>, RpcError> {
        self.with_routable(
            "locator cache timeout",
            value,
            |r, v| r.locator_cache_timeout == *v,
            |r, v| r.locator_cache_timeout = v,
        )
    }

    pub fn change_connection_id(self: &Arc<Self>, value: &str) -> Result<Arc<Self>, RpcError> {
        self.with_routable(
            "connection id",
            value,
            |r, v| r.connection_id == *v,
            |r, v| r.connection_id = v.to_string(),
        )
    }

    /// Endpoints usable for this reference, in the order to try them.
    ///
    /// Opaque endpoints and endpoints not matching the invocation mode are
    /// dropped, the rest are ordered by the selection policy and then by the
    /// secure preference.
    pub fn filter_endpoints(&self, endpoints: &[Endpoint]) -> Vec<Endpoint> {
        let datagram = self.mode.is_datagram();
        let mut filtered: Vec<Endpoint> = endpoints
            .iter()
            .filter(|e| !e.is_opaque() && e.datagram() == datagram)
            .cloned()
            .collect();

        let (selection, prefer_secure) = match &self.target {
            Target::Routable(r) => (r.endpoint_selection, r.prefer_secure),
            Target::Fixed(_) => (EndpointSelection::Ordered, false),
        };
        if selection == EndpointSelection::Random {
            filtered.shuffle(&mut rand::rng());
        }

        if self.secure {
            filtered.retain(Endpoint::secure);
        } else if prefer_secure {
            filtered.sort_by_key(|e| !e.secure());
        } else {
            filtered.sort_by_key(Endpoint::secure);
        }
        filtered
    }

    /// The wire form of this reference.
    pub fn to_proxy_data(&self) -> ProxyData {
        ProxyData {
            identity: self.identity.clone(),
            facet: self.facet.clone(),
            mode: self.mode,
            secure: self.secure,
            protocol: self.protocol,
            encoding: self.encoding,
            endpoints: self.endpoints().to_vec(),
            adapter_id: self.adapter_id().to_string(),
        }
    }
}

/// Quote a proxy string token when it contains separators.
pub(crate) fn quote_if_needed(s: &str) -> String {
    if s.is_empty() || s.chars().any(|c| c.is_whitespace() || c == ':' || c == '@') {
        format!("\"{}\"", s)
    } else {
        s.to_string()
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", quote_if_needed(&self.identity.to_string()))?;
        if !self.facet.is_empty() {
            write!(f, " -f {}", quote_if_needed(&self.facet))?;
        }
        write!(f, " {}", self.mode.flag())?;
        if self.secure {
            write!(f, " -s")?;
        }
        if self.protocol != CURRENT_PROTOCOL {
            write!(f, " -p {}", self.protocol)?;
        }
        write!(f, " -e {}", self.encoding)?;
        match &self.target {
            Target::Fixed(_) => Ok(()),
            Target::Routable(r) => {
                for endpoint in &r.endpoints {
                    write!(f, ":{}", endpoint)?;
                }
                if !r.adapter_id.is_empty() {
                    write!(f, " @ {}", quote_if_needed(&r.adapter_id))?;
                }
                Ok(())
            }
        }
    }
}

impl fmt::Debug for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Reference({})", self)
    }
}

/// Protocol and encoding are not compared: they are fixed per deployment.
impl PartialEq for Reference {
    fn eq(&self, other: &Self) -> bool {
        if self.identity != other.identity
            || self.facet != other.facet
            || self.mode != other.mode
            || self.secure != other.secure
            || self.compress != other.compress
            || self.invocation_timeout != other.invocation_timeout
            || self.context != other.context
        {
            return false;
        }
        match (&self.target, &other.target) {
            (Target::Fixed(a), Target::Fixed(b)) => Arc::ptr_eq(a, b),
            (Target::Routable(a), Target::Routable(b)) => {
                a.endpoints == b.endpoints
                    && a.adapter_id == b.adapter_id
                    && same_option_arc(&a.locator_info, &b.locator_info)
                    && same_option_arc(&a.router_info, &b.router_info)
                    && a.collocation_optimized == b.collocation_optimized
                    && a.cache_connection == b.cache_connection
                    && a.prefer_secure == b.prefer_secure
                    && a.endpoint_selection == b.endpoint_selection
                    && a.locator_cache_timeout == b.locator_cache_timeout
                    && a.connection_id == b.connection_id
            }
            _ => false,
        }
    }
}

impl Eq for Reference {}

impl Hash for Reference {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity.hash(state);
        self.facet.hash(state);
        self.mode.hash(state);
        self.secure.hash(state);
        self.context.hash(state);
        match &self.target {
            Target::Fixed(connection) => connection.id().hash(state),
            Target::Routable(r) => {
                r.endpoints.hash(state);
                r.adapter_id.hash(state);
            }
        }
    }
}
