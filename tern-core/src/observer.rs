//! Instrumentation hooks attached to invocations and dispatches.
//!
//! The runtime asks the configured [`CommunicatorObserver`] for an observer
//! when an invocation or dispatch starts and wraps it in an
//! [`ObserverHandle`], which guarantees `detach` runs at most once however the
//! call ends. [`MetricsObserver`] is the bundled implementation.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::stream::Context;

pub trait Observer: Send + Sync {
    fn attach(&self);
    fn detach(&self);
    fn failed(&self, kind: &str);
}

pub trait InvocationObserver: Observer {
    fn retried(&self);
    fn user_exception(&self);
}

pub trait DispatchObserver: Observer {
    fn user_exception(&self);
    fn reply(&self, size: usize);
}

/// Description of an observed call, used to group metrics.
#[derive(Debug, Clone, Default)]
pub struct CallAttributes {
    /// Stringified proxy for invocations, adapter name for dispatches.
    pub target: String,
    pub identity: String,
    pub facet: String,
    pub operation: String,
    pub mode: String,
    pub context: Context,
}

pub trait CommunicatorObserver: Send + Sync {
    fn invocation_observer(&self, call: &CallAttributes) -> Option<Arc<dyn InvocationObserver>>;
    fn dispatch_observer(&self, call: &CallAttributes) -> Option<Arc<dyn DispatchObserver>>;
}

/// Owns an optional observer and runs `detach` exactly once.
pub struct ObserverHandle<O: ?Sized + Observer> {
    observer: Option<Arc<O>>,
    detached: AtomicBool,
}

impl<O: ?Sized + Observer> ObserverHandle<O> {
    /// Wrap and attach the observer.
    pub fn attach(observer: Option<Arc<O>>) -> Self {
        if let Some(o) = &observer {
            o.attach();
        }
        Self {
            observer,
            detached: AtomicBool::new(false),
        }
    }

    pub fn none() -> Self {
        Self {
            observer: None,
            detached: AtomicBool::new(true),
        }
    }

    pub fn get(&self) -> Option<&Arc<O>> {
        self.observer.as_ref()
    }

    pub fn failed(&self, kind: &str) {
        if let Some(o) = &self.observer {
            o.failed(kind);
        }
    }

    pub fn detach(&self) {
        if self
            .detached
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            if let Some(o) = &self.observer {
                o.detach();
            }
        }
    }
}

impl<O: ?Sized + Observer> Drop for ObserverHandle<O> {
    fn drop(&mut self) {
        self.detach();
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct Metrics {
    pub current: i64,
    pub total: u64,
    pub failures: u64,
    pub retries: u64,
    pub user_exceptions: u64,
    pub reply_bytes: u64,
    pub failures_by_kind: BTreeMap<String, u64>,
}

type Accessor = fn(&CallAttributes) -> String;

/// Attributes a metrics map can be grouped by.
const ATTRIBUTES: &[(&str, Accessor)] = &[
    ("target", |c| c.target.clone()),
    ("identity", |c| c.identity.clone()),
    ("facet", |c| c.facet.clone()),
    ("operation", |c| c.operation.clone()),
    ("mode", |c| c.mode.clone()),
];

/// Resolve an attribute by name; `context.<key>` reads the request context.
pub fn resolve_attribute(call: &CallAttributes, name: &str) -> Option<String> {
    if let Some(key) = name.strip_prefix("context.") {
        return Some(call.context.get(key).cloned().unwrap_or_default());
    }
    ATTRIBUTES
        .iter()
        .find(|(attr, _)| *attr == name)
        .map(|(_, accessor)| accessor(call))
}

/// Metrics entries grouped by an attribute.
#[derive(Debug)]
pub struct MetricsMap {
    group_by: String,
    entries: DashMap<String, Metrics>,
}

impl MetricsMap {
    pub fn new(group_by: impl Into<String>) -> Self {
        Self {
            group_by: group_by.into(),
            entries: DashMap::new(),
        }
    }

    fn key(&self, call: &CallAttributes) -> String {
        resolve_attribute(call, &self.group_by).unwrap_or_default()
    }

    fn update(&self, key: &str, f: impl FnOnce(&mut Metrics)) {
        let mut entry = self.entries.entry(key.to_string()).or_default();
        f(&mut entry);
    }

    pub fn get(&self, key: &str) -> Option<Metrics> {
        self.entries.get(key).map(|e| e.clone())
    }

    pub fn snapshot(&self) -> BTreeMap<String, Metrics> {
        self.entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }
}

struct MetricsEntryObserver {
    map: Arc<MetricsMap>,
    key: String,
}

impl Observer for MetricsEntryObserver {
    fn attach(&self) {
        self.map.update(&self.key, |m| {
            m.current += 1;
            m.total += 1;
        });
    }

    fn detach(&self) {
        self.map.update(&self.key, |m| m.current -= 1);
    }

    fn failed(&self, kind: &str) {
        self.map.update(&self.key, |m| {
            m.failures += 1;
            *m.failures_by_kind.entry(kind.to_string()).or_default() += 1;
        });
    }
}

impl InvocationObserver for MetricsEntryObserver {
    fn retried(&self) {
        self.map.update(&self.key, |m| m.retries += 1);
    }

    fn user_exception(&self) {
        self.map.update(&self.key, |m| m.user_exceptions += 1);
    }
}

impl DispatchObserver for MetricsEntryObserver {
    fn user_exception(&self) {
        self.map.update(&self.key, |m| m.user_exceptions += 1);
    }

    fn reply(&self, size: usize) {
        self.map.update(&self.key, |m| m.reply_bytes += size as u64);
    }
}

/// Communicator observer that keeps invocation and dispatch metrics.
#[derive(Debug)]
pub struct MetricsObserver {
    invocations: Arc<MetricsMap>,
    dispatches: Arc<MetricsMap>,
}

impl MetricsObserver {
    pub fn new(group_by: &str) -> Self {
        Self {
            invocations: Arc::new(MetricsMap::new(group_by)),
            dispatches: Arc::new(MetricsMap::new(group_by)),
        }
    }

    pub fn invocations(&self) -> &MetricsMap {
        &self.invocations
    }

    pub fn dispatches(&self) -> &MetricsMap {
        &self.dispatches
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "invocations": self.invocations.snapshot(),
            "dispatches": self.dispatches.snapshot(),
        })
    }
}

impl Default for MetricsObserver {
    fn default() -> Self {
        Self::new("operation")
    }
}

impl CommunicatorObserver for MetricsObserver {
    fn invocation_observer(&self, call: &CallAttributes) -> Option<Arc<dyn InvocationObserver>> {
        Some(Arc::new(MetricsEntryObserver {
            key: self.invocations.key(call),
            map: self.invocations.clone(),
        }))
    }

    fn dispatch_observer(&self, call: &CallAttributes) -> Option<Arc<dyn DispatchObserver>> {
        Some(Arc::new(MetricsEntryObserver {
            key: self.dispatches.key(call),
            map: self.dispatches.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(op: &str) -> CallAttributes {
        CallAttributes {
            target: "obj -t:tcp -p 1".into(),
            identity: "obj".into(),
            operation: op.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_detach_runs_once() {
        let metrics = MetricsObserver::default();
        let handle = ObserverHandle::attach(metrics.invocation_observer(&call("op")));
        assert_eq!(metrics.invocations().get("op").unwrap().current, 1);
        handle.detach();
        handle.detach();
        drop(handle);
        let m = metrics.invocations().get("op").unwrap();
        assert_eq!(m.current, 0);
        assert_eq!(m.total, 1);
    }

    #[test]
    fn test_failures_by_kind() {
        let metrics = MetricsObserver::default();
        let handle = ObserverHandle::attach(metrics.invocation_observer(&call("op")));
        handle.failed("ConnectionLost");
        handle.get().unwrap().retried();
        drop(handle);
        let m = metrics.invocations().get("op").unwrap();
        assert_eq!(m.failures, 1);
        assert_eq!(m.retries, 1);
        assert_eq!(m.failures_by_kind.get("ConnectionLost"), Some(&1));
    }

    #[test]
    fn test_group_by_context_attribute() {
        let metrics = MetricsObserver::new("context.tenant");
        let mut c = call("op");
        c.context.insert("tenant".into(), "acme".into());
        let _h = ObserverHandle::attach(metrics.invocation_observer(&c));
        assert!(metrics.invocations().get("acme").is_some());
    }

    #[test]
    fn test_unknown_attribute() {
        assert_eq!(resolve_attribute(&call("op"), "nope"), None);
        assert_eq!(resolve_attribute(&call("op"), "operation").as_deref(), Some("op"));
    }

    #[test]
    fn test_json_export() {
        let metrics = MetricsObserver::default();
        drop(ObserverHandle::attach(metrics.invocation_observer(&call("op"))));
        let json = metrics.to_json();
        assert_eq!(json["invocations"]["op"]["total"], 1);
    }
}
