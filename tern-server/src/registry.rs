use dashmap::DashMap;
use std::sync::Arc;
use tern_core::{Endpoint, Identity, RpcError};

use crate::adapter::{AdapterConfig, ObjectAdapter};

/// The object adapters hosted by one process.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: DashMap<String, Arc<ObjectAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, name: &str, config: AdapterConfig) -> Result<Arc<ObjectAdapter>, RpcError> {
        match self.adapters.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(RpcError::already_registered("object adapter", name))
            }
            dashmap::mapref::entry::Entry::Vacant(v) => {
                let adapter = ObjectAdapter::new(name, config);
                v.insert(adapter.clone());
                Ok(adapter)
            }
        }
    }

    pub fn find(&self, name: &str) -> Option<Arc<ObjectAdapter>> {
        self.adapters.get(name).map(|a| a.value().clone())
    }

    pub fn remove(&self, name: &str) -> Option<Arc<ObjectAdapter>> {
        self.adapters.remove(name).map(|(_, a)| a)
    }

    /// The adapter hosting the target of a reference, if it lives in this
    /// process and still accepts requests.
    pub fn find_collocated(
        &self,
        identity: &Identity,
        adapter_id: &str,
        endpoints: &[Endpoint],
    ) -> Option<Arc<ObjectAdapter>> {
        self.adapters
            .iter()
            .map(|a| a.value().clone())
            .find(|a| a.is_local(identity, adapter_id, endpoints))
    }

    pub fn adapters(&self) -> Vec<Arc<ObjectAdapter>> {
        self.adapters.iter().map(|a| a.value().clone()).collect()
    }

    pub async fn deactivate_all(&self) {
        for adapter in self.adapters() {
            adapter.deactivate().await;
        }
    }

    pub async fn destroy_all(&self) {
        for adapter in self.adapters() {
            adapter.destroy().await;
        }
        self.adapters.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::servant::Object;

    struct Nop;
    impl Object for Nop {}

    #[test]
    fn test_duplicate_adapter_name() {
        let registry = AdapterRegistry::new();
        registry.create("A", AdapterConfig::default()).unwrap();
        assert!(matches!(
            registry.create("A", AdapterConfig::default()),
            Err(RpcError::AlreadyRegistered { .. })
        ));
    }

    #[tokio::test]
    async fn test_find_collocated() {
        let registry = AdapterRegistry::new();
        let by_endpoint = registry
            .create(
                "ByEndpoint",
                AdapterConfig {
                    endpoints: vec![Endpoint::tcp("localhost", 10000)],
                    ..Default::default()
                },
            )
            .unwrap();
        let by_id = registry
            .create(
                "ById",
                AdapterConfig {
                    adapter_id: "Svc".into(),
                    ..Default::default()
                },
            )
            .unwrap();
        by_id.add(Arc::new(Nop), Identity::named("wk")).unwrap();

        let none = Identity::named("x");
        let found = registry
            .find_collocated(&none, "", &[Endpoint::tcp("localhost", 10000).with_timeout(Some(50))])
            .unwrap();
        assert_eq!(found.name(), by_endpoint.name());
        assert_eq!(registry.find_collocated(&none, "Svc", &[]).unwrap().name(), "ById");
        assert_eq!(
            registry.find_collocated(&Identity::named("wk"), "", &[]).unwrap().name(),
            "ById"
        );
        assert!(registry.find_collocated(&none, "Other", &[]).is_none());

        by_id.deactivate().await;
        assert!(registry.find_collocated(&none, "Svc", &[]).is_none());
    }
}
