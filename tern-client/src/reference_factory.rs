//! Creation of references from proxy strings, wire data and properties.
//!
//! Proxy strings follow
//! `identity [-f facet] [-t|-o|-O|-d|-D] [-s] [-e encoding] [-p protocol]`
//! followed by `:endpoint` entries, `@ adapterId`, or nothing for a
//! well-known object. Tokens containing whitespace, `:` or `@` are quoted.

use std::sync::{Arc, Mutex};
use tern_core::endpoint::Endpoint;
use tern_core::version::CURRENT_PROTOCOL;
use tern_core::{
    lock, EncodingVersion, EndpointSelection, Identity, InvocationMode, Properties,
    ProtocolVersion, ProxyData, RpcError, Settings,
};
use tern_transport::Connection;
use tracing::warn;

use crate::locator_info::LocatorInfo;
use crate::reference::{Reference, Routable, Target};
use crate::router_info::RouterInfo;

/// Per-proxy property suffixes understood by [`ReferenceFactory::apply_properties`].
const PROXY_PROPERTIES: &[&str] = &[
    "EndpointSelection",
    "LocatorCacheTimeout",
    "InvocationTimeout",
    "PreferSecure",
    "CollocationOptimized",
    "ConnectionCached",
];

pub struct ReferenceFactory {
    settings: Settings,
    default_locator: Mutex<Option<Arc<LocatorInfo>>>,
    default_router: Mutex<Option<Arc<RouterInfo>>>,
}

impl ReferenceFactory {
    pub fn new(settings: &Settings) -> Self {
        Self {
            settings: settings.clone(),
            default_locator: Mutex::new(None),
            default_router: Mutex::new(None),
        }
    }

    pub fn default_locator(&self) -> Option<Arc<LocatorInfo>> {
        lock(&self.default_locator).clone()
    }

    pub fn set_default_locator(&self, locator: Option<Arc<LocatorInfo>>) {
        *lock(&self.default_locator) = locator;
    }

    pub fn default_router(&self) -> Option<Arc<RouterInfo>> {
        lock(&self.default_router).clone()
    }

    pub fn set_default_router(&self, router: Option<Arc<RouterInfo>>) {
        *lock(&self.default_router) = router;
    }

    /// Parse a stringified proxy. An empty string or an empty identity is
    /// the null proxy.
    pub fn parse(&self, s: &str) -> Result<Option<Arc<Reference>>, RpcError> {
        let text = s.trim();
        if text.is_empty() {
            return Ok(None);
        }

        let mut cursor = Cursor::new(text);
        let identity = cursor
            .token(false)
            .ok_or_else(|| proxy_error(format!("mismatched quotes around identity in `{}'", s)))?;
        let identity = Identity::parse(&identity)?;
        if identity.is_null() {
            cursor.skip_whitespace();
            if cursor.at_end() {
                return Ok(None);
            }
            return Err(proxy_error(format!("invalid characters after identity in `{}'", s)));
        }

        let mut data = ProxyData {
            identity,
            protocol: CURRENT_PROTOCOL,
            encoding: self.settings.default_encoding,
            ..Default::default()
        };

        loop {
            cursor.skip_whitespace();
            if matches!(cursor.peek(), None | Some(':') | Some('@')) {
                break;
            }
            let option = cursor
                .token(false)
                .ok_or_else(|| proxy_error(format!("mismatched quotes in `{}'", s)))?;
            if option.len() != 2 || !option.starts_with('-') {
                return Err(proxy_error(format!(
                    "expected a proxy option but found `{}' in `{}'",
                    option, s
                )));
            }

            cursor.skip_whitespace();
            let argument = match cursor.peek() {
                None | Some(':') | Some('@') | Some('-') => None,
                Some(_) => Some(cursor.token(false).ok_or_else(|| {
                    proxy_error(format!(
                        "mismatched quotes around value for {} option in `{}'",
                        option, s
                    ))
                })?),
            };

            match option.as_str() {
                "-f" => data.facet = required(argument, &option, s)?,
                "-e" => {
                    let value = required(argument, &option, s)?;
                    data.encoding = EncodingVersion::parse(&value).map_err(|_| {
                        proxy_error(format!("invalid encoding version `{}' in `{}'", value, s))
                    })?;
                }
                "-p" => {
                    let value = required(argument, &option, s)?;
                    data.protocol = ProtocolVersion::parse(&value).map_err(|_| {
                        proxy_error(format!("invalid protocol version `{}' in `{}'", value, s))
                    })?;
                }
                "-s" => {
                    unexpected(argument, &option, s)?;
                    data.secure = true;
                }
                flag => match InvocationMode::from_flag(flag) {
                    Some(mode) => {
                        unexpected(argument, &option, s)?;
                        data.mode = mode;
                    }
                    None => {
                        return Err(proxy_error(format!("unknown option `{}' in `{}'", flag, s)))
                    }
                },
            }
        }

        match cursor.peek() {
            Some(':') => data.endpoints = self.parse_endpoints(&cursor.rest()[1..], s)?,
            Some('@') => {
                cursor.advance(1);
                data.adapter_id = parse_adapter_id(&mut cursor, s)?;
            }
            _ => {}
        }
        self.from_proxy_data(data)
    }

    /// Parse a `:`-separated endpoint list; `s` names the source in errors.
    pub(crate) fn parse_endpoints(&self, list: &str, s: &str) -> Result<Vec<Endpoint>, RpcError> {
        let mut endpoints = Vec::new();
        for part in split_endpoints(list) {
            let part = part.trim();
            if part.is_empty() {
                return Err(RpcError::EndpointParse(format!("empty endpoint in `{}'", s)));
            }
            // Endpoints without a transport use the default protocol.
            let endpoint = if part.starts_with('-') {
                Endpoint::parse(&format!("{} {}", self.settings.default_protocol, part))
            } else {
                Endpoint::parse(part)
            };
            endpoints.push(endpoint.map_err(|err| match err {
                RpcError::EndpointParse(message) => {
                    RpcError::EndpointParse(format!("{} in `{}'", message, s))
                }
                other => other,
            })?);
        }
        Ok(endpoints)
    }

    /// Build a reference from its wire form, applying the configured defaults.
    pub fn from_proxy_data(&self, data: ProxyData) -> Result<Option<Arc<Reference>>, RpcError> {
        if data.identity.is_null() {
            return Ok(None);
        }
        let adapter_id = if data.endpoints.is_empty() {
            data.adapter_id
        } else {
            String::new()
        };
        let mut routable = Routable::new(data.endpoints, adapter_id);
        routable.locator_info = self.default_locator();
        routable.router_info = self.default_router();
        routable.collocation_optimized = self.settings.collocation_optimized;
        routable.prefer_secure = self.settings.prefer_secure;
        routable.endpoint_selection = self.settings.endpoint_selection;
        routable.locator_cache_timeout = self.settings.locator_cache_timeout;

        let reference = Arc::new(Reference::new(
            data.identity,
            data.mode,
            data.encoding,
            Target::Routable(routable),
        ));
        Ok(Some(
            reference
                .change_facet(&data.facet)
                .change_secure(data.secure)
                .change_protocol(data.protocol)
                .change_invocation_timeout(self.settings.invocation_timeout),
        ))
    }

    /// A twoway reference bound to `connection`.
    pub fn create_fixed(&self, identity: Identity, connection: Arc<dyn Connection>) -> Arc<Reference> {
        Arc::new(Reference::new(
            identity,
            InvocationMode::Twoway,
            self.settings.default_encoding,
            Target::Fixed(connection),
        ))
        .change_invocation_timeout(self.settings.invocation_timeout)
    }

    /// Apply the `<prefix>.*` overrides of a proxy property. The `Locator`
    /// and `Router` sub-properties name proxies and are resolved by the
    /// communicator.
    pub fn apply_properties(
        &self,
        mut reference: Arc<Reference>,
        prefix: &str,
        properties: &Properties,
    ) -> Result<Arc<Reference>, RpcError> {
        let key = |suffix: &str| format!("{}.{}", prefix, suffix);

        for (name, _) in properties.get_with_prefix(&format!("{}.", prefix)) {
            let suffix = &name[prefix.len() + 1..];
            let known = PROXY_PROPERTIES.contains(&suffix)
                || suffix.starts_with("Context.")
                || suffix == "Locator"
                || suffix.starts_with("Locator.")
                || suffix == "Router"
                || suffix.starts_with("Router.");
            if !known {
                warn!(property = %name, "unknown proxy property");
            }
        }

        if let Some(value) = properties.get(&key("EndpointSelection")) {
            reference = reference.change_endpoint_selection(EndpointSelection::parse(value)?)?;
        }
        if let Some(value) = properties.get_int(&key("LocatorCacheTimeout"))? {
            reference = reference.change_locator_cache_timeout(value)?;
        }
        if let Some(value) = properties.get_int(&key("InvocationTimeout"))? {
            if value < 1 && value != -1 {
                return Err(RpcError::Initialization(format!(
                    "invalid value for {}: {}",
                    key("InvocationTimeout"),
                    value
                )));
            }
            reference = reference.change_invocation_timeout(value);
        }
        if let Some(value) = properties.get_int(&key("PreferSecure"))? {
            reference = reference.change_prefer_secure(value > 0)?;
        }
        if let Some(value) = properties.get_int(&key("CollocationOptimized"))? {
            reference = reference.change_collocation_optimized(value > 0)?;
        }
        if let Some(value) = properties.get_int(&key("ConnectionCached"))? {
            reference = reference.change_cache_connection(value > 0)?;
        }

        let context_prefix = key("Context.");
        let entries = properties.get_with_prefix(&context_prefix);
        if !entries.is_empty() {
            let mut context = reference.context().clone();
            for (name, value) in entries {
                context.insert(name[context_prefix.len()..].to_string(), value);
            }
            reference = reference.change_context(context);
        }
        Ok(reference)
    }
}

fn proxy_error(message: String) -> RpcError {
    RpcError::ProxyParse(message)
}

fn required(argument: Option<String>, option: &str, s: &str) -> Result<String, RpcError> {
    argument.ok_or_else(|| proxy_error(format!("no argument provided for {} option in `{}'", option, s)))
}

fn unexpected(argument: Option<String>, option: &str, s: &str) -> Result<(), RpcError> {
    match argument {
        None => Ok(()),
        Some(value) => Err(proxy_error(format!(
            "unexpected argument `{}' provided for {} option in `{}'",
            value, option, s
        ))),
    }
}

fn parse_adapter_id(cursor: &mut Cursor<'_>, s: &str) -> Result<String, RpcError> {
    cursor.skip_whitespace();
    if cursor.at_end() {
        return Err(proxy_error(format!("missing adapter id in `{}'", s)));
    }
    let adapter_id = cursor
        .token(true)
        .ok_or_else(|| proxy_error(format!("mismatched quotes around adapter id in `{}'", s)))?;
    cursor.skip_whitespace();
    if !cursor.at_end() {
        return Err(proxy_error(format!(
            "invalid trailing characters after `{}' in `{}'",
            adapter_id, s
        )));
    }
    if adapter_id.is_empty() {
        return Err(proxy_error(format!("empty adapter id in `{}'", s)));
    }
    Ok(adapter_id)
}

/// Split an endpoint list on `:` outside double quotes.
fn split_endpoints(list: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut quoted = false;
    for (i, c) in list.char_indices() {
        match c {
            '"' => quoted = !quoted,
            ':' if !quoted => {
                parts.push(&list[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&list[start..]);
    parts
}

struct Cursor<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(text: &'a str) -> Self {
        Self { text, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.text[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn at_end(&self) -> bool {
        self.pos >= self.text.len()
    }

    fn advance(&mut self, n: usize) {
        self.pos = (self.pos + n).min(self.text.len());
    }

    fn skip_whitespace(&mut self) {
        let rest = self.rest();
        self.pos += rest.len() - rest.trim_start().len();
    }

    /// A quoted token without its quotes, or an unquoted token ending at
    /// whitespace (and at `:` or `@` unless `whitespace_only`). Backslash
    /// escapes are kept. `None` on an unterminated quote.
    fn token(&mut self, whitespace_only: bool) -> Option<String> {
        let rest = self.rest();
        match rest.chars().next() {
            Some(quote @ ('"' | '\'')) => {
                let mut escaped = false;
                for (i, c) in rest.char_indices().skip(1) {
                    if escaped {
                        escaped = false;
                    } else if c == '\\' {
                        escaped = true;
                    } else if c == quote {
                        self.pos += i + 1;
                        return Some(rest[1..i].to_string());
                    }
                }
                None
            }
            _ => {
                let end = rest
                    .find(|c: char| c.is_whitespace() || (!whitespace_only && (c == ':' || c == '@')))
                    .unwrap_or(rest.len());
                self.pos += end;
                Some(rest[..end].to_string())
            }
        }
    }
}
