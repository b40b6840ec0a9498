use bytes::Bytes;
use std::fmt;
use thiserror::Error;

use crate::identity::Identity;
use crate::version::EncodingVersion;

/// Target of a request that failed on the server: carried on the wire by
/// the `ObjectNotExist`, `FacetNotExist` and `OperationNotExist` reply statuses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestFailed {
    pub identity: Identity,
    pub facet: String,
    pub operation: String,
}

impl RequestFailed {
    pub fn new(identity: Identity, facet: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            identity,
            facet: facet.into(),
            operation: operation.into(),
        }
    }
}

impl fmt::Display for RequestFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "identity: `{}'", self.identity)?;
        if !self.facet.is_empty() {
            write!(f, " facet: `{}'", self.facet)?;
        }
        write!(f, " operation: `{}'", self.operation)
    }
}

/// An application-defined exception, marshaled as its type id followed by an
/// opaque payload inside the reply encapsulation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserException {
    pub type_id: String,
    pub payload: Bytes,
}

impl UserException {
    pub fn new(type_id: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            type_id: type_id.into(),
            payload: payload.into(),
        }
    }
}

impl fmt::Display for UserException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.type_id)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RpcError {
    // Transport failures
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    #[error("connection refused: {0}")]
    ConnectionRefused(String),
    #[error("connect timed out")]
    ConnectTimeout,
    #[error("connection timed out")]
    Timeout,
    #[error("connection closed by peer")]
    CloseConnection,
    #[error("connection manually closed (graceful: {graceful})")]
    ConnectionManuallyClosed { graceful: bool },
    #[error("protocol error: {0}")]
    Protocol(String),

    // Runtime lifecycle
    #[error("object adapter `{0}' deactivated")]
    ObjectAdapterDeactivated(String),
    #[error("object adapter `{0}' destroyed")]
    ObjectAdapterDestroyed(String),
    #[error("communicator destroyed")]
    CommunicatorDestroyed,

    // Invocation control
    #[error("no suitable endpoint available for proxy `{0}'")]
    NoEndpoint(String),
    #[error("invocation timed out")]
    InvocationTimeout,
    #[error("invocation canceled")]
    InvocationCanceled,
    #[error("no {kind} is registered with id `{id}'")]
    NotRegistered { kind: String, id: String },
    #[error("{kind} `{id}' is already registered")]
    AlreadyRegistered { kind: String, id: String },
    #[error("feature not supported: {0}")]
    FeatureNotSupported(String),
    #[error("initialization failed: {0}")]
    Initialization(String),

    // Encoding and parsing
    #[error("marshal error: {0}")]
    Marshal(String),
    #[error("unsupported encoding {bad} (supported: {supported})")]
    UnsupportedEncoding {
        bad: EncodingVersion,
        supported: EncodingVersion,
    },
    #[error("proxy parse error: {0}")]
    ProxyParse(String),
    #[error("identity parse error: {0}")]
    IdentityParse(String),
    #[error("endpoint parse error: {0}")]
    EndpointParse(String),
    #[error("version parse error: `{0}'")]
    VersionParse(String),

    // Request failures reported by the server
    #[error("object does not exist: {0}")]
    ObjectNotExist(RequestFailed),
    #[error("facet does not exist: {0}")]
    FacetNotExist(RequestFailed),
    #[error("operation does not exist: {0}")]
    OperationNotExist(RequestFailed),

    // Exceptions the receiver could not reconstruct precisely
    #[error("unknown exception: {0}")]
    Unknown(String),
    #[error("unknown local exception: {0}")]
    UnknownLocal(String),
    #[error("unknown user exception: {0}")]
    UnknownUser(String),
    #[error("dispatch failed with unknown reply status {0}")]
    UnknownReplyStatus(u8),

    #[error("user exception {0}")]
    User(UserException),
}

impl RpcError {
    pub fn marshal(message: impl Into<String>) -> Self {
        RpcError::Marshal(message.into())
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        RpcError::Protocol(message.into())
    }

    pub fn not_registered(kind: impl Into<String>, id: impl Into<String>) -> Self {
        RpcError::NotRegistered {
            kind: kind.into(),
            id: id.into(),
        }
    }

    pub fn already_registered(kind: impl Into<String>, id: impl Into<String>) -> Self {
        RpcError::AlreadyRegistered {
            kind: kind.into(),
            id: id.into(),
        }
    }

    pub fn is_request_failed(&self) -> bool {
        self.request_failed().is_some()
    }

    pub fn request_failed(&self) -> Option<&RequestFailed> {
        match self {
            RpcError::ObjectNotExist(rf)
            | RpcError::FacetNotExist(rf)
            | RpcError::OperationNotExist(rf) => Some(rf),
            _ => None,
        }
    }

    pub fn is_object_not_exist(&self) -> bool {
        matches!(self, RpcError::ObjectNotExist(_))
    }

    pub fn is_user(&self) -> bool {
        matches!(self, RpcError::User(_))
    }

    /// Unknown-* exceptions cross the wire as a plain message.
    pub fn is_unknown(&self) -> bool {
        matches!(
            self,
            RpcError::Unknown(_) | RpcError::UnknownLocal(_) | RpcError::UnknownUser(_)
        )
    }

    /// Errors detected by the local runtime rather than reported by a server.
    pub fn is_local(&self) -> bool {
        !(self.is_request_failed()
            || self.is_user()
            || self.is_unknown()
            || matches!(self, RpcError::UnknownReplyStatus(_)))
    }

    pub fn is_marshal(&self) -> bool {
        matches!(
            self,
            RpcError::Marshal(_) | RpcError::UnsupportedEncoding { .. }
        )
    }

    /// Short type name used in traces and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            RpcError::ConnectionLost(_) => "ConnectionLost",
            RpcError::ConnectFailed(_) => "ConnectFailed",
            RpcError::ConnectionRefused(_) => "ConnectionRefused",
            RpcError::ConnectTimeout => "ConnectTimeout",
            RpcError::Timeout => "Timeout",
            RpcError::CloseConnection => "CloseConnection",
            RpcError::ConnectionManuallyClosed { .. } => "ConnectionManuallyClosed",
            RpcError::Protocol(_) => "Protocol",
            RpcError::ObjectAdapterDeactivated(_) => "ObjectAdapterDeactivated",
            RpcError::ObjectAdapterDestroyed(_) => "ObjectAdapterDestroyed",
            RpcError::CommunicatorDestroyed => "CommunicatorDestroyed",
            RpcError::NoEndpoint(_) => "NoEndpoint",
            RpcError::InvocationTimeout => "InvocationTimeout",
            RpcError::InvocationCanceled => "InvocationCanceled",
            RpcError::NotRegistered { .. } => "NotRegistered",
            RpcError::AlreadyRegistered { .. } => "AlreadyRegistered",
            RpcError::FeatureNotSupported(_) => "FeatureNotSupported",
            RpcError::Initialization(_) => "Initialization",
            RpcError::Marshal(_) => "Marshal",
            RpcError::UnsupportedEncoding { .. } => "UnsupportedEncoding",
            RpcError::ProxyParse(_) => "ProxyParse",
            RpcError::IdentityParse(_) => "IdentityParse",
            RpcError::EndpointParse(_) => "EndpointParse",
            RpcError::VersionParse(_) => "VersionParse",
            RpcError::ObjectNotExist(_) => "ObjectNotExist",
            RpcError::FacetNotExist(_) => "FacetNotExist",
            RpcError::OperationNotExist(_) => "OperationNotExist",
            RpcError::Unknown(_) => "Unknown",
            RpcError::UnknownLocal(_) => "UnknownLocal",
            RpcError::UnknownUser(_) => "UnknownUser",
            RpcError::UnknownReplyStatus(_) => "UnknownReplyStatus",
            RpcError::User(_) => "User",
        }
    }
}

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::ConnectionRefused => RpcError::ConnectionRefused(err.to_string()),
            std::io::ErrorKind::TimedOut => RpcError::Timeout,
            _ => RpcError::ConnectionLost(err.to_string()),
        }
    }
}
