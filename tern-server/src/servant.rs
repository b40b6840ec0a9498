//! Servants and servant locators.

use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tern_core::{OutputStream, RequestFailed, RpcError};

use crate::current::{Current, IncomingRequest};

/// Type id every servant implements.
pub const OBJECT_TYPE_ID: &str = "::Tern::Object";

/// An object implementation.
#[async_trait]
pub trait Object: Send + Sync {
    /// Type ids implemented by this servant, most derived first.
    fn type_ids(&self) -> Vec<String> {
        vec![OBJECT_TYPE_ID.to_string()]
    }

    /// Dispatch an application operation. `Ok` carries the encoded results.
    async fn dispatch(&self, request: &IncomingRequest) -> Result<Bytes, RpcError> {
        Err(operation_not_exist(&request.current))
    }
}

pub fn operation_not_exist(current: &Current) -> RpcError {
    RpcError::OperationNotExist(RequestFailed::new(
        current.id.clone(),
        current.facet.clone(),
        current.operation.clone(),
    ))
}

/// Dispatch `request` to `servant`, answering the built-in operations and
/// turning a panicking servant into an unknown exception.
pub async fn dispatch_to_servant(
    servant: &Arc<dyn Object>,
    request: &IncomingRequest,
) -> Result<Bytes, RpcError> {
    let mut out = OutputStream::new();
    match request.current.operation.as_str() {
        "ice_ping" => return Ok(Bytes::new()),
        "ice_isA" => {
            let type_id = request.params().read_string()?;
            out.write_bool(servant.type_ids().iter().any(|t| *t == type_id));
            return Ok(out.freeze());
        }
        "ice_id" => {
            let ids = servant.type_ids();
            out.write_string(ids.first().map(String::as_str).unwrap_or(OBJECT_TYPE_ID));
            return Ok(out.freeze());
        }
        "ice_ids" => {
            let mut ids = servant.type_ids();
            if !ids.iter().any(|t| t == OBJECT_TYPE_ID) {
                ids.push(OBJECT_TYPE_ID.to_string());
            }
            ids.sort();
            out.write_string_seq(&ids);
            return Ok(out.freeze());
        }
        _ => {}
    }

    match AssertUnwindSafe(servant.dispatch(request)).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(RpcError::Unknown(panic_message(&*panic))),
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("servant panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("servant panicked: {}", s)
    } else {
        "servant panicked".to_string()
    }
}

/// Opaque value handed from `locate` to `finished`.
pub type Cookie = Option<Arc<dyn Any + Send + Sync>>;

/// Supplies servants on demand for one category of identities.
#[async_trait]
pub trait ServantLocator: Send + Sync {
    /// Find a servant for the request, or `None` when the target does not
    /// exist.
    async fn locate(&self, current: &Current) -> Result<Option<(Arc<dyn Object>, Cookie)>, RpcError>;

    /// Called exactly once after every successful `locate`, however the
    /// dispatch ended. An error replaces the dispatch result.
    async fn finished(
        &self,
        current: &Current,
        servant: &Arc<dyn Object>,
        cookie: Cookie,
    ) -> Result<(), RpcError>;

    /// The adapter owning this locator is being destroyed.
    fn deactivate(&self, category: &str);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tern_core::{Identity, InputStream};

    struct Hello;

    #[async_trait]
    impl Object for Hello {
        fn type_ids(&self) -> Vec<String> {
            vec!["::Demo::Hello".to_string(), OBJECT_TYPE_ID.to_string()]
        }

        async fn dispatch(&self, request: &IncomingRequest) -> Result<Bytes, RpcError> {
            match request.current.operation.as_str() {
                "sayHello" => Ok(Bytes::from_static(b"hi")),
                "explode" => panic!("kaboom"),
                _ => Err(operation_not_exist(&request.current)),
            }
        }
    }

    fn request(operation: &str, params: Bytes) -> IncomingRequest {
        IncomingRequest::new(
            Current {
                id: Identity::named("hello"),
                operation: operation.into(),
                ..Default::default()
            },
            params,
        )
    }

    #[tokio::test]
    async fn test_builtin_operations() {
        let servant: Arc<dyn Object> = Arc::new(Hello);

        assert!(dispatch_to_servant(&servant, &request("ice_ping", Bytes::new()))
            .await
            .unwrap()
            .is_empty());

        let mut params = OutputStream::new();
        params.write_string("::Demo::Hello");
        let result = dispatch_to_servant(&servant, &request("ice_isA", params.freeze()))
            .await
            .unwrap();
        assert!(InputStream::new(result).read_bool().unwrap());

        let result = dispatch_to_servant(&servant, &request("ice_id", Bytes::new()))
            .await
            .unwrap();
        assert_eq!(InputStream::new(result).read_string().unwrap(), "::Demo::Hello");

        let result = dispatch_to_servant(&servant, &request("ice_ids", Bytes::new()))
            .await
            .unwrap();
        assert_eq!(
            InputStream::new(result).read_string_seq().unwrap(),
            vec!["::Demo::Hello".to_string(), OBJECT_TYPE_ID.to_string()]
        );
    }

    #[tokio::test]
    async fn test_unknown_operation() {
        let servant: Arc<dyn Object> = Arc::new(Hello);
        let err = dispatch_to_servant(&servant, &request("nope", Bytes::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::OperationNotExist(rf) if rf.operation == "nope"));
    }

    #[tokio::test]
    async fn test_panic_becomes_unknown() {
        let servant: Arc<dyn Object> = Arc::new(Hello);
        let err = dispatch_to_servant(&servant, &request("explode", Bytes::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Unknown(msg) if msg.contains("kaboom")));
    }
}
