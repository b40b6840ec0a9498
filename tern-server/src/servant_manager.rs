//! Identity and facet to servant lookup.
//!
//! Lookup order for a request: the active servant registered for the exact
//! identity and facet, then the default servant of the identity's category,
//! then the default servant of the `""` category. When none matches, the
//! servant locator of the category (or of `""`) is asked.

use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use tern_core::{lock, Identity, RequestFailed, RpcError};
use tracing::debug;

use crate::current::{Current, IncomingRequest, OutgoingResponse};
use crate::servant::{dispatch_to_servant, panic_message, Object, ServantLocator};

type FacetMap = HashMap<String, Arc<dyn Object>>;

#[derive(Default)]
struct Tables {
    servants: HashMap<Identity, FacetMap>,
    default_servants: HashMap<String, FacetMap>,
    locators: HashMap<String, Arc<dyn ServantLocator>>,
}

pub struct ServantManager {
    adapter: String,
    tables: Mutex<Tables>,
}

fn facet_label(facet: &str) -> String {
    if facet.is_empty() {
        String::new()
    } else {
        format!(" -f {}", facet)
    }
}

impl ServantManager {
    pub fn new(adapter: impl Into<String>) -> Self {
        Self {
            adapter: adapter.into(),
            tables: Mutex::new(Tables::default()),
        }
    }

    pub fn add_servant(
        &self,
        servant: Arc<dyn Object>,
        identity: Identity,
        facet: &str,
    ) -> Result<(), RpcError> {
        if identity.name.is_empty() {
            return Err(RpcError::IdentityParse("servant identity has an empty name".into()));
        }
        let mut tables = lock(&self.tables);
        let facets = tables.servants.entry(identity.clone()).or_default();
        if facets.contains_key(facet) {
            return Err(RpcError::already_registered(
                "servant",
                format!("{}{}", identity, facet_label(facet)),
            ));
        }
        facets.insert(facet.to_string(), servant);
        Ok(())
    }

    pub fn remove_servant(&self, identity: &Identity, facet: &str) -> Result<Arc<dyn Object>, RpcError> {
        let mut tables = lock(&self.tables);
        let not_registered = || {
            RpcError::not_registered("servant", format!("{}{}", identity, facet_label(facet)))
        };
        let facets = tables.servants.get_mut(identity).ok_or_else(not_registered)?;
        let servant = facets.remove(facet).ok_or_else(not_registered)?;
        if facets.is_empty() {
            tables.servants.remove(identity);
        }
        Ok(servant)
    }

    pub fn remove_all_facets(
        &self,
        identity: &Identity,
    ) -> Result<HashMap<String, Arc<dyn Object>>, RpcError> {
        lock(&self.tables)
            .servants
            .remove(identity)
            .ok_or_else(|| RpcError::not_registered("servant", identity.to_string()))
    }

    pub fn add_default_servant(
        &self,
        servant: Arc<dyn Object>,
        category: &str,
    ) -> Result<(), RpcError> {
        let mut tables = lock(&self.tables);
        let facets = tables.default_servants.entry(category.to_string()).or_default();
        if facets.contains_key("") {
            return Err(RpcError::already_registered("default servant", category));
        }
        facets.insert(String::new(), servant);
        Ok(())
    }

    pub fn remove_default_servant(&self, category: &str) -> Result<Arc<dyn Object>, RpcError> {
        let mut tables = lock(&self.tables);
        let servant = tables
            .default_servants
            .get_mut(category)
            .and_then(|facets| facets.remove(""))
            .ok_or_else(|| RpcError::not_registered("default servant", category))?;
        if tables
            .default_servants
            .get(category)
            .is_some_and(HashMap::is_empty)
        {
            tables.default_servants.remove(category);
        }
        Ok(servant)
    }

    pub fn find_default_servant(&self, category: &str) -> Option<Arc<dyn Object>> {
        lock(&self.tables)
            .default_servants
            .get(category)
            .and_then(|facets| facets.get(""))
            .cloned()
    }

    pub fn find_servant(&self, identity: &Identity, facet: &str) -> Option<Arc<dyn Object>> {
        let tables = lock(&self.tables);
        if let Some(servant) = tables.servants.get(identity).and_then(|f| f.get(facet)) {
            return Some(servant.clone());
        }
        tables
            .default_servants
            .get(&identity.category)
            .or_else(|| tables.default_servants.get(""))
            .and_then(|f| f.get(facet))
            .cloned()
    }

    pub fn find_all_facets(&self, identity: &Identity) -> HashMap<String, Arc<dyn Object>> {
        lock(&self.tables)
            .servants
            .get(identity)
            .cloned()
            .unwrap_or_default()
    }

    /// Whether any facet is registered for `identity`, or a default servant
    /// covers its category.
    pub fn has_servant(&self, identity: &Identity) -> bool {
        let tables = lock(&self.tables);
        tables.servants.contains_key(identity)
            || tables.default_servants.contains_key(&identity.category)
            || tables.default_servants.contains_key("")
    }

    pub fn add_servant_locator(
        &self,
        locator: Arc<dyn ServantLocator>,
        category: &str,
    ) -> Result<(), RpcError> {
        let mut tables = lock(&self.tables);
        if tables.locators.contains_key(category) {
            return Err(RpcError::already_registered("servant locator", category));
        }
        tables.locators.insert(category.to_string(), locator);
        Ok(())
    }

    pub fn remove_servant_locator(&self, category: &str) -> Result<Arc<dyn ServantLocator>, RpcError> {
        lock(&self.tables)
            .locators
            .remove(category)
            .ok_or_else(|| RpcError::not_registered("servant locator", category))
    }

    pub fn find_servant_locator(&self, category: &str) -> Option<Arc<dyn ServantLocator>> {
        lock(&self.tables).locators.get(category).cloned()
    }

    /// Drop every servant and deactivate the servant locators.
    pub fn destroy(&self) {
        let locators = {
            let mut tables = lock(&self.tables);
            tables.servants.clear();
            tables.default_servants.clear();
            std::mem::take(&mut tables.locators)
        };
        for (category, locator) in locators {
            locator.deactivate(&category);
        }
    }

    /// Find the target servant and dispatch the request to it.
    pub async fn dispatch(&self, request: &IncomingRequest) -> OutgoingResponse {
        let current = &request.current;
        let result = self.dispatch_result(request).await;
        current.create_outgoing_response(result)
    }

    async fn dispatch_result(
        &self,
        request: &IncomingRequest,
    ) -> Result<bytes::Bytes, RpcError> {
        let current = &request.current;
        if let Some(servant) = self.find_servant(&current.id, &current.facet) {
            return dispatch_to_servant(&servant, request).await;
        }

        let locator = self
            .find_servant_locator(&current.id.category)
            .or_else(|| self.find_servant_locator(""));
        if let Some(locator) = locator {
            if let Some(result) = self.dispatch_with_locator(&locator, request).await {
                return result;
            }
        }

        Err(self.not_found(current))
    }

    /// `None` when the locator has no servant for the request.
    async fn dispatch_with_locator(
        &self,
        locator: &Arc<dyn ServantLocator>,
        request: &IncomingRequest,
    ) -> Option<Result<bytes::Bytes, RpcError>> {
        let current = &request.current;
        let located = match AssertUnwindSafe(locator.locate(current)).catch_unwind().await {
            Ok(located) => located,
            Err(panic) => Err(RpcError::Unknown(panic_message(&*panic))),
        };
        let (servant, cookie) = match located {
            Ok(Some(found)) => found,
            Ok(None) => return None,
            Err(err) => return Some(Err(err)),
        };

        let result = dispatch_to_servant(&servant, request).await;

        let finished = AssertUnwindSafe(locator.finished(current, &servant, cookie))
            .catch_unwind()
            .await;
        let result = match finished {
            Ok(Ok(())) => result,
            Ok(Err(err)) => Err(err),
            Err(panic) => Err(RpcError::Unknown(panic_message(&*panic))),
        };
        debug!(
            target: "tern::dispatch",
            adapter = %self.adapter,
            identity = %current.id,
            operation = %current.operation,
            "servant locator finished"
        );
        Some(result)
    }

    fn not_found(&self, current: &Current) -> RpcError {
        let rf = RequestFailed::new(current.id.clone(), current.facet.clone(), current.operation.clone());
        let identity_known = !lock(&self.tables)
            .servants
            .get(&current.id)
            .map(HashMap::is_empty)
            .unwrap_or(true);
        if identity_known {
            RpcError::FacetNotExist(rf)
        } else {
            RpcError::ObjectNotExist(rf)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tern_core::protocol::ReplyStatus;

    use crate::servant::Cookie;

    struct Echo(&'static str);

    #[async_trait]
    impl Object for Echo {
        async fn dispatch(&self, request: &IncomingRequest) -> Result<Bytes, RpcError> {
            match request.current.operation.as_str() {
                "fail" => Err(RpcError::UnknownLocal("failed".into())),
                "panic" => panic!("servant bug"),
                _ => Ok(Bytes::from_static(self.0.as_bytes())),
            }
        }
    }

    #[derive(Default)]
    struct CountingLocator {
        located: AtomicUsize,
        finished: AtomicUsize,
        deactivated: AtomicUsize,
    }

    #[async_trait]
    impl ServantLocator for CountingLocator {
        async fn locate(
            &self,
            current: &Current,
        ) -> Result<Option<(Arc<dyn Object>, Cookie)>, RpcError> {
            if current.id.name == "missing" {
                return Ok(None);
            }
            self.located.fetch_add(1, Ordering::SeqCst);
            Ok(Some((Arc::new(Echo("located")), Some(Arc::new(42u32)))))
        }

        async fn finished(
            &self,
            _current: &Current,
            _servant: &Arc<dyn Object>,
            cookie: Cookie,
        ) -> Result<(), RpcError> {
            assert_eq!(cookie.unwrap().downcast_ref::<u32>(), Some(&42));
            self.finished.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn deactivate(&self, _category: &str) {
            self.deactivated.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn request(identity: Identity, facet: &str, operation: &str) -> IncomingRequest {
        IncomingRequest::new(
            Current {
                adapter: "A".into(),
                id: identity,
                facet: facet.into(),
                operation: operation.into(),
                request_id: 1,
                ..Default::default()
            },
            Bytes::new(),
        )
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let manager = ServantManager::new("A");
        let id = Identity::named("obj");
        manager.add_servant(Arc::new(Echo("a")), id.clone(), "").unwrap();
        assert!(matches!(
            manager.add_servant(Arc::new(Echo("b")), id.clone(), ""),
            Err(RpcError::AlreadyRegistered { .. })
        ));
        manager.add_servant(Arc::new(Echo("b")), id, "facet").unwrap();
    }

    #[test]
    fn test_removing_last_facet_removes_identity() {
        let manager = ServantManager::new("A");
        let id = Identity::named("obj");
        manager.add_servant(Arc::new(Echo("a")), id.clone(), "").unwrap();
        manager.add_servant(Arc::new(Echo("b")), id.clone(), "f").unwrap();
        manager.remove_servant(&id, "").unwrap();
        assert!(manager.has_servant(&id));
        manager.remove_servant(&id, "f").unwrap();
        assert!(!manager.has_servant(&id));
        assert!(manager.find_all_facets(&id).is_empty());
        assert!(matches!(
            manager.remove_servant(&id, "f"),
            Err(RpcError::NotRegistered { .. })
        ));
    }

    #[test]
    fn test_default_servant_fallback() {
        let manager = ServantManager::new("A");
        manager.add_default_servant(Arc::new(Echo("cat")), "cat").unwrap();
        assert!(manager.find_servant(&Identity::new("x", "cat"), "").is_some());
        assert!(manager.find_servant(&Identity::new("x", "other"), "").is_none());

        manager.add_default_servant(Arc::new(Echo("any")), "").unwrap();
        assert!(manager.find_servant(&Identity::new("x", "other"), "").is_some());
        manager.remove_default_servant("").unwrap();
        assert!(manager.find_default_servant("").is_none());
    }

    #[tokio::test]
    async fn test_missing_facet_vs_missing_object() {
        let manager = ServantManager::new("A");
        manager
            .add_servant(Arc::new(Echo("a")), Identity::named("obj"), "")
            .unwrap();

        let response = manager.dispatch(&request(Identity::named("obj"), "nope", "op")).await;
        assert_eq!(response.status, ReplyStatus::FacetNotExist);

        let response = manager.dispatch(&request(Identity::named("ghost"), "", "op")).await;
        assert_eq!(response.status, ReplyStatus::ObjectNotExist);
    }

    #[tokio::test]
    async fn test_locator_finished_called_once_on_every_outcome() {
        let manager = ServantManager::new("A");
        let locator = Arc::new(CountingLocator::default());
        manager.add_servant_locator(locator.clone(), "").unwrap();

        let ok = manager.dispatch(&request(Identity::new("a", "cat"), "", "op")).await;
        assert!(ok.is_ok());

        let failed = manager.dispatch(&request(Identity::named("b"), "", "fail")).await;
        assert_eq!(failed.status, ReplyStatus::UnknownLocalException);

        let panicked = manager.dispatch(&request(Identity::named("c"), "", "panic")).await;
        assert_eq!(panicked.status, ReplyStatus::UnknownException);

        assert_eq!(locator.located.load(Ordering::SeqCst), 3);
        assert_eq!(locator.finished.load(Ordering::SeqCst), 3);

        let missing = manager.dispatch(&request(Identity::named("missing"), "", "op")).await;
        assert_eq!(missing.status, ReplyStatus::ObjectNotExist);
        assert_eq!(locator.finished.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_destroy_deactivates_locators() {
        let manager = ServantManager::new("A");
        let locator = Arc::new(CountingLocator::default());
        manager.add_servant_locator(locator.clone(), "cat").unwrap();
        manager.add_servant_locator(locator.clone(), "dog").unwrap();
        manager.destroy();
        assert_eq!(locator.deactivated.load(Ordering::SeqCst), 2);
        assert!(manager.find_servant_locator("cat").is_none());
    }
}
