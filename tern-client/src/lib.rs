// Tern client: proxies and the invocation core.
// - references and their factory (proxy strings, wire form, properties)
// - locator and router caches
// - request handlers: connect, connection and collocated
// - the outgoing invocation state machine with retries and batching
// - the communicator that owns it all

pub mod batch;
pub mod collocated;
pub mod communicator;
pub mod connect_request_handler;
pub mod locator_info;
pub mod locator_proxy;
pub mod outgoing_async;
pub mod proxy;
pub mod reference;
pub mod reference_factory;
pub mod request_handler;
pub mod retry;
pub mod router_info;

pub use batch::BatchRequestQueue;
pub use collocated::CollocatedRequestHandler;
pub use communicator::{Communicator, CommunicatorOptions, Instance};
pub use connect_request_handler::ConnectRequestHandler;
pub use locator_info::{Locator, LocatorInfo, LocatorManager};
pub use locator_proxy::LocatorPrx;
pub use outgoing_async::OutgoingAsync;
pub use proxy::{require_proxy, InvokeOptions, ObjectPrx};
pub use reference::{Reference, Routable, Target};
pub use reference_factory::ReferenceFactory;
pub use request_handler::{ConnectionRequestHandler, RequestHandler};
pub use retry::{RetryContext, RetryPolicy, RetryQueue, Retryable};
pub use router_info::{Router, RouterInfo, RouterManager, RouterPrx};
