use indexmap::IndexMap;
use serde::Deserialize;
use std::path::Path;
use tracing::debug;

use crate::error::RpcError;
use crate::version::{EncodingVersion, CURRENT_ENCODING};

/// Ordered key/value configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    entries: IndexMap<String, String>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `key=value` lines. Blank lines and `#` comments are ignored.
    pub fn parse(text: &str) -> Result<Self, RpcError> {
        let mut props = Self::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| {
                RpcError::Initialization(format!(
                    "line {}: expected `key=value', got `{}'",
                    lineno + 1,
                    line
                ))
            })?;
            props.set(key.trim(), value.trim());
        }
        Ok(props)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, RpcError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            RpcError::Initialization(format!("cannot read {}: {}", path.display(), e))
        })?;
        let props = Self::parse(&text)?;
        debug!(path = %path.display(), entries = props.len(), "loaded properties");
        Ok(props)
    }

    /// Apply `--Key=Value` arguments and return the arguments that were not
    /// property settings.
    pub fn parse_args(&mut self, args: impl IntoIterator<Item = String>) -> Vec<String> {
        let mut rest = Vec::new();
        for arg in args {
            match arg.strip_prefix("--").and_then(|a| a.split_once('=')) {
                Some((key, value)) if key.contains('.') => self.set(key, value),
                _ => rest.push(arg),
            }
        }
        rest
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let value = value.into();
        let key = key.into();
        if value.is_empty() {
            self.entries.shift_remove(&key);
        } else {
            self.entries.insert(key, value);
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    pub fn get_int(&self, key: &str) -> Result<Option<i32>, RpcError> {
        self.get(key)
            .map(|v| {
                v.parse::<i32>().map_err(|_| {
                    RpcError::Initialization(format!("property {} is not an integer: `{}'", key, v))
                })
            })
            .transpose()
    }

    pub fn get_int_with_default(&self, key: &str, default: i32) -> Result<i32, RpcError> {
        Ok(self.get_int(key)?.unwrap_or(default))
    }

    /// Whitespace or comma separated list.
    pub fn get_list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|v| {
                v.split(|c: char| c.is_whitespace() || c == ',')
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn get_with_prefix(&self, prefix: &str) -> IndexMap<String, String> {
        self.entries
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
pub enum EndpointSelection {
    #[default]
    Random,
    Ordered,
}

impl EndpointSelection {
    pub fn parse(s: &str) -> Result<Self, RpcError> {
        match s {
            "Random" => Ok(EndpointSelection::Random),
            "Ordered" => Ok(EndpointSelection::Ordered),
            other => Err(RpcError::Initialization(format!(
                "unknown endpoint selection type `{}'",
                other
            ))),
        }
    }
}

/// Per-category trace levels. Zero disables a category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TraceLevels {
    pub protocol: i32,
    pub retry: i32,
    pub locator: i32,
    pub network: i32,
}

/// Typed view of the configuration knobs consumed by the runtime.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Delays in milliseconds between successive retries; empty disables retries.
    pub retry_intervals: Vec<i32>,
    /// Seconds; -1 caches forever, 0 disables the cache.
    pub locator_cache_timeout: i32,
    /// Milliseconds; -1 disables invocation timeouts.
    pub invocation_timeout: i32,
    pub endpoint_selection: EndpointSelection,
    pub prefer_secure: bool,
    pub collocation_optimized: bool,
    pub default_encoding: EncodingVersion,
    pub default_protocol: String,
    pub cache_message_buffers: i32,
    /// Bytes.
    pub batch_auto_flush_size: usize,
    pub warn_ami_callback: bool,
    pub warn_dispatch: i32,
    pub trace: TraceLevels,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            retry_intervals: vec![0],
            locator_cache_timeout: -1,
            invocation_timeout: -1,
            endpoint_selection: EndpointSelection::Random,
            prefer_secure: false,
            collocation_optimized: true,
            default_encoding: CURRENT_ENCODING,
            default_protocol: "tcp".to_string(),
            cache_message_buffers: 2,
            batch_auto_flush_size: 1024 * 1024,
            warn_ami_callback: true,
            warn_dispatch: 1,
            trace: TraceLevels::default(),
        }
    }
}

impl Settings {
    pub fn from_properties(props: &Properties) -> Result<Self, RpcError> {
        let defaults = Settings::default();

        let retry_intervals = match props.get("Tern.RetryIntervals") {
            None => defaults.retry_intervals,
            Some(_) => {
                let mut intervals = Vec::new();
                for v in props.get_list("Tern.RetryIntervals") {
                    let ms = v.parse::<i32>().map_err(|_| {
                        RpcError::Initialization(format!("invalid retry interval `{}'", v))
                    })?;
                    intervals.push(ms.max(0));
                }
                // A lone negative value disables retries.
                if intervals.len() == 1
                    && props.get_list("Tern.RetryIntervals")[0].starts_with('-')
                {
                    intervals.clear();
                }
                intervals
            }
        };

        let endpoint_selection = props
            .get("Tern.Default.EndpointSelection")
            .map(EndpointSelection::parse)
            .transpose()?
            .unwrap_or(defaults.endpoint_selection);

        let default_encoding = props
            .get("Tern.Default.Encoding")
            .map(EncodingVersion::parse)
            .transpose()?
            .unwrap_or(defaults.default_encoding);

        let invocation_timeout = props.get_int_with_default("Tern.Default.InvocationTimeout", -1)?;
        if invocation_timeout < 1 && invocation_timeout != -1 {
            return Err(RpcError::Initialization(format!(
                "invalid value for Tern.Default.InvocationTimeout: {}",
                invocation_timeout
            )));
        }

        let batch_kib = props.get_int_with_default("Tern.BatchAutoFlushSize", 1024)?;

        Ok(Settings {
            retry_intervals,
            locator_cache_timeout: props.get_int_with_default("Tern.Default.LocatorCacheTimeout", -1)?,
            invocation_timeout,
            endpoint_selection,
            prefer_secure: props.get_int_with_default("Tern.Default.PreferSecure", 0)? > 0,
            collocation_optimized: props
                .get_int_with_default("Tern.Default.CollocationOptimized", 1)?
                > 0,
            default_encoding,
            default_protocol: props
                .get_or("Tern.Default.Protocol", &defaults.default_protocol)
                .to_string(),
            cache_message_buffers: props.get_int_with_default("Tern.CacheMessageBuffers", 2)?,
            batch_auto_flush_size: batch_kib.max(0) as usize * 1024,
            warn_ami_callback: props.get_int_with_default("Tern.Warn.AMICallback", 1)? > 0,
            warn_dispatch: props.get_int_with_default("Tern.Warn.Dispatch", 1)?,
            trace: TraceLevels {
                protocol: props.get_int_with_default("Tern.Trace.Protocol", 0)?,
                retry: props.get_int_with_default("Tern.Trace.Retry", 0)?,
                locator: props.get_int_with_default("Tern.Trace.Locator", 0)?,
                network: props.get_int_with_default("Tern.Trace.Network", 0)?,
            },
        })
    }
}
