// Tern core: the types every other crate agrees on.
// - identities, versions and endpoints
// - the error taxonomy shared by client, server and transports
// - the byte-stream codec and message framing
// - configuration and instrumentation hooks

pub mod endpoint;
pub mod error;
pub mod identity;
pub mod observer;
pub mod properties;
pub mod protocol;
pub mod proxy_data;
pub mod stream;
pub mod sync;
pub mod version;

pub use endpoint::{Endpoint, Transport};
pub use error::{RequestFailed, RpcError, UserException};
pub use identity::Identity;
pub use observer::{
    CallAttributes, CommunicatorObserver, DispatchObserver, InvocationObserver, MetricsObserver,
    ObserverHandle,
};
pub use properties::{EndpointSelection, Properties, Settings, TraceLevels};
pub use protocol::{InvocationMode, MessageType, OperationMode, ReplyStatus, RequestHeader};
pub use proxy_data::ProxyData;
pub use stream::{Context, FormatType, InputStream, OutputStream};
pub use sync::lock;
pub use version::{EncodingVersion, ProtocolVersion};
