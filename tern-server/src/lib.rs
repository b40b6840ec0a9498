pub mod adapter;
pub mod current;
pub mod locator;
pub mod logging;
pub mod registry;
pub mod servant;
pub mod servant_manager;

pub use adapter::{AdapterConfig, AdapterState, ObjectAdapter};
pub use current::{Current, IncomingRequest, OutgoingResponse};
pub use locator::LocatorRegistry;
pub use logging::{init_logging, init_test_logging, LogOptions};
pub use registry::AdapterRegistry;
pub use servant::{dispatch_to_servant, operation_not_exist, Cookie, Object, ServantLocator};
pub use servant_manager::ServantManager;
