//! Client proxy for the locator service.

use async_trait::async_trait;
use tern_core::{Identity, InputStream, OperationMode, OutputStream, ProxyData, RpcError};
use tern_server::locator::{
    ADAPTER_NOT_FOUND, FIND_ADAPTER_BY_ID, FIND_OBJECT_BY_ID, LOCATOR_TYPE_ID, OBJECT_NOT_FOUND,
};

use crate::locator_info::Locator;
use crate::proxy::{InvokeOptions, ObjectPrx};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LocatorPrx(ObjectPrx);

impl LocatorPrx {
    pub const TYPE_ID: &'static str = LOCATOR_TYPE_ID;

    pub fn new(proxy: ObjectPrx) -> Self {
        Self(proxy)
    }

    /// Narrow `proxy` after asking the target whether it is a locator.
    pub async fn checked_cast(proxy: &ObjectPrx) -> Result<Option<Self>, RpcError> {
        Ok(proxy
            .ice_is_a(LOCATOR_TYPE_ID)
            .await?
            .then(|| Self(proxy.clone())))
    }

    pub fn proxy(&self) -> &ObjectPrx {
        &self.0
    }

    async fn find(
        &self,
        operation: &str,
        params: OutputStream,
        not_found: &str,
    ) -> Result<Option<ProxyData>, RpcError> {
        let reply = self
            .0
            .invoke(
                operation,
                OperationMode::Idempotent,
                params.as_slice(),
                InvokeOptions::declaring(&[not_found]),
            )
            .await?;
        ProxyData::read(&mut InputStream::new(reply))
    }
}

#[async_trait]
impl Locator for LocatorPrx {
    async fn find_object_by_id(&self, identity: &Identity) -> Result<Option<ProxyData>, RpcError> {
        let mut params = OutputStream::new();
        params.write_identity(identity);
        self.find(FIND_OBJECT_BY_ID, params, OBJECT_NOT_FOUND).await
    }

    async fn find_adapter_by_id(&self, adapter_id: &str) -> Result<Option<ProxyData>, RpcError> {
        let mut params = OutputStream::new();
        params.write_string(adapter_id);
        self.find(FIND_ADAPTER_BY_ID, params, ADAPTER_NOT_FOUND).await
    }
}
