pub mod codec;
pub mod connection;
pub mod factory;
pub mod memory;
pub mod stream_connection;
pub mod tcp;

pub use codec::{CodecError, FrameCodec};
pub use connection::{
    same_request, AsyncRequest, AsyncStatus, CancellationHandler, CloseMode, Connection,
};
pub use factory::{ConnectionFactory, Connector};
pub use memory::{MemoryConnector, MemoryListener, MemoryNetwork};
pub use stream_connection::StreamConnection;
pub use tcp::TcpConnector;
