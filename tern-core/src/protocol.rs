//! Message framing shared by every transport.
//!
//! Every message starts with a 14-byte header: magic, protocol version,
//! encoding version, message type, compression status and the total message
//! size (header included). Requests follow the header with a request id, the
//! request header fields and the parameter encapsulation. Batch requests carry
//! a count followed by request headers without request ids. Replies carry the
//! request id and a one-byte reply status.

use bytes::Bytes;

use crate::error::RpcError;
use crate::identity::Identity;
use crate::stream::{Context, InputStream, OutputStream};
use crate::version::{CURRENT_PROTOCOL, CURRENT_PROTOCOL_ENCODING};

pub const MAGIC: [u8; 4] = *b"Tern";
pub const HEADER_SIZE: usize = 14;
/// Offset of the message type byte inside the header.
pub const MESSAGE_TYPE_OFFSET: usize = 8;
/// Offset of the `i32` message size inside the header.
pub const SIZE_OFFSET: usize = 10;
/// Offset of the request id (or batch count) right after the header.
pub const REQUEST_ID_OFFSET: usize = HEADER_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Request = 0,
    RequestBatch = 1,
    Reply = 2,
    ValidateConnection = 3,
    CloseConnection = 4,
}

impl TryFrom<u8> for MessageType {
    type Error = RpcError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageType::Request),
            1 => Ok(MessageType::RequestBatch),
            2 => Ok(MessageType::Reply),
            3 => Ok(MessageType::ValidateConnection),
            4 => Ok(MessageType::CloseConnection),
            other => Err(RpcError::protocol(format!("unknown message type {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum OperationMode {
    #[default]
    Normal = 0,
    Nonmutating = 1,
    Idempotent = 2,
}

impl OperationMode {
    /// Operations that may safely be executed more than once.
    pub fn is_idempotent(&self) -> bool {
        !matches!(self, OperationMode::Normal)
    }
}

impl TryFrom<u8> for OperationMode {
    type Error = RpcError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(OperationMode::Normal),
            1 => Ok(OperationMode::Nonmutating),
            2 => Ok(OperationMode::Idempotent),
            other => Err(RpcError::marshal(format!("invalid operation mode {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplyStatus {
    Ok = 0,
    UserException = 1,
    ObjectNotExist = 2,
    FacetNotExist = 3,
    OperationNotExist = 4,
    UnknownLocalException = 5,
    UnknownUserException = 6,
    UnknownException = 7,
}

impl ReplyStatus {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => ReplyStatus::Ok,
            1 => ReplyStatus::UserException,
            2 => ReplyStatus::ObjectNotExist,
            3 => ReplyStatus::FacetNotExist,
            4 => ReplyStatus::OperationNotExist,
            5 => ReplyStatus::UnknownLocalException,
            6 => ReplyStatus::UnknownUserException,
            7 => ReplyStatus::UnknownException,
            _ => return None,
        })
    }
}

/// How a proxy delivers its requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum InvocationMode {
    #[default]
    Twoway = 0,
    Oneway = 1,
    BatchOneway = 2,
    Datagram = 3,
    BatchDatagram = 4,
}

impl InvocationMode {
    pub fn is_twoway(&self) -> bool {
        matches!(self, InvocationMode::Twoway)
    }

    pub fn is_batch(&self) -> bool {
        matches!(self, InvocationMode::BatchOneway | InvocationMode::BatchDatagram)
    }

    pub fn is_datagram(&self) -> bool {
        matches!(self, InvocationMode::Datagram | InvocationMode::BatchDatagram)
    }

    /// Option letter used in stringified proxies.
    pub fn flag(&self) -> &'static str {
        match self {
            InvocationMode::Twoway => "-t",
            InvocationMode::Oneway => "-o",
            InvocationMode::BatchOneway => "-O",
            InvocationMode::Datagram => "-d",
            InvocationMode::BatchDatagram => "-D",
        }
    }

    pub fn from_flag(flag: &str) -> Option<Self> {
        match flag {
            "-t" => Some(InvocationMode::Twoway),
            "-o" => Some(InvocationMode::Oneway),
            "-O" => Some(InvocationMode::BatchOneway),
            "-d" => Some(InvocationMode::Datagram),
            "-D" => Some(InvocationMode::BatchDatagram),
            _ => None,
        }
    }
}

impl TryFrom<u8> for InvocationMode {
    type Error = RpcError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(InvocationMode::Twoway),
            1 => Ok(InvocationMode::Oneway),
            2 => Ok(InvocationMode::BatchOneway),
            3 => Ok(InvocationMode::Datagram),
            4 => Ok(InvocationMode::BatchDatagram),
            other => Err(RpcError::marshal(format!("invalid invocation mode {}", other))),
        }
    }
}

/// Compression status byte. Compression itself is not implemented; peers that
/// send compressed messages are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompressionStatus {
    NotCompressed = 0,
    Supported = 1,
    Compressed = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub message_type: MessageType,
    pub compression: u8,
    pub size: usize,
}

pub fn write_header(out: &mut OutputStream, message_type: MessageType) {
    out.write_raw(&MAGIC);
    out.write_byte(CURRENT_PROTOCOL.major);
    out.write_byte(CURRENT_PROTOCOL.minor);
    out.write_byte(CURRENT_PROTOCOL_ENCODING.major);
    out.write_byte(CURRENT_PROTOCOL_ENCODING.minor);
    out.write_byte(message_type as u8);
    out.write_byte(CompressionStatus::NotCompressed as u8);
    out.write_int(0);
}

/// Start a request message; the request id is written as 0 and patched by
/// the connection once one is assigned.
pub fn start_request(out: &mut OutputStream) {
    write_header(out, MessageType::Request);
    out.write_int(0);
}

/// Start a batch message; the count is patched when the batch is flushed.
pub fn start_batch(out: &mut OutputStream) {
    write_header(out, MessageType::RequestBatch);
    out.write_int(0);
}

/// Patch the message size once the message is complete.
pub fn finish_message(out: &mut OutputStream) {
    let size = out.len() as i32;
    out.rewrite_int(SIZE_OFFSET, size);
}

/// A message made of the header alone (validate and close connection).
pub fn header_only(message_type: MessageType) -> Bytes {
    let mut out = OutputStream::with_capacity(HEADER_SIZE);
    write_header(&mut out, message_type);
    finish_message(&mut out);
    out.freeze()
}

/// Message type of a complete frame, without decoding the rest.
pub fn peek_message_type(frame: &[u8]) -> Option<MessageType> {
    frame
        .get(MESSAGE_TYPE_OFFSET)
        .and_then(|b| MessageType::try_from(*b).ok())
}

pub fn read_header(input: &mut InputStream) -> Result<MessageHeader, RpcError> {
    let mut magic = [0u8; 4];
    for b in magic.iter_mut() {
        *b = input.read_byte()?;
    }
    if magic != MAGIC {
        return Err(RpcError::protocol(format!("bad magic {:?}", magic)));
    }
    let proto_major = input.read_byte()?;
    let proto_minor = input.read_byte()?;
    if proto_major != CURRENT_PROTOCOL.major {
        return Err(RpcError::protocol(format!(
            "unsupported protocol {}.{}",
            proto_major, proto_minor
        )));
    }
    let enc_major = input.read_byte()?;
    let enc_minor = input.read_byte()?;
    if enc_major != CURRENT_PROTOCOL_ENCODING.major {
        return Err(RpcError::protocol(format!(
            "unsupported protocol encoding {}.{}",
            enc_major, enc_minor
        )));
    }
    let message_type = MessageType::try_from(input.read_byte()?)?;
    let compression = input.read_byte()?;
    let size = input.read_int()?;
    if size < HEADER_SIZE as i32 {
        return Err(RpcError::protocol(format!("illegal message size {}", size)));
    }
    Ok(MessageHeader {
        message_type,
        compression,
        size: size as usize,
    })
}

/// Fields identifying the target and operation of a request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RequestHeader {
    pub identity: Identity,
    pub facet: String,
    pub operation: String,
    pub mode: OperationMode,
    pub context: Context,
}

impl RequestHeader {
    pub fn write(&self, out: &mut OutputStream) {
        out.write_identity(&self.identity);
        out.write_facet(&self.facet);
        out.write_string(&self.operation);
        out.write_byte(self.mode as u8);
        out.write_context(&self.context);
    }

    pub fn read(input: &mut InputStream) -> Result<Self, RpcError> {
        let identity = input.read_identity()?;
        let facet = input.read_facet()?;
        let operation = input.read_string()?;
        let mode = OperationMode::try_from(input.read_byte()?)?;
        let context = input.read_context()?;
        Ok(Self {
            identity,
            facet,
            operation,
            mode,
            context,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::ENCODING_1_1;

    #[test]
    fn test_request_round_trip() {
        let mut context = Context::new();
        context.insert("k".into(), "v".into());
        let header = RequestHeader {
            identity: Identity::new("obj", "cat"),
            facet: "f".into(),
            operation: "op".into(),
            mode: OperationMode::Idempotent,
            context: context.clone(),
        };

        let mut out = OutputStream::new();
        start_request(&mut out);
        header.write(&mut out);
        out.write_encapsulation_payload(ENCODING_1_1, &[]);
        finish_message(&mut out);
        let bytes = out.freeze();

        let mut input = InputStream::new(bytes.clone());
        let msg = read_header(&mut input).unwrap();
        assert_eq!(msg.message_type, MessageType::Request);
        assert_eq!(msg.size, bytes.len());
        assert_eq!(input.read_int().unwrap(), 0);

        let mode_pos = HEADER_SIZE + 4 + 4 + 4 + 3 + 3;
        assert_eq!(bytes[mode_pos], OperationMode::Idempotent as u8);

        let decoded = RequestHeader::read(&mut input).unwrap();
        assert_eq!(decoded.identity, Identity::new("obj", "cat"));
        assert_eq!(decoded.facet, "f");
        assert_eq!(decoded.operation, "op");
        assert_eq!(decoded.mode, OperationMode::Idempotent);
        assert_eq!(decoded.context, context);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut input = InputStream::new(Bytes::from_static(b"XXXX\x01\x00\x01\x00\x00\x00\x0e\x00\x00\x00"));
        assert!(matches!(read_header(&mut input), Err(RpcError::Protocol(_))));
    }

    #[test]
    fn test_header_only_messages() {
        let close = header_only(MessageType::CloseConnection);
        assert_eq!(close.len(), HEADER_SIZE);
        assert_eq!(peek_message_type(&close), Some(MessageType::CloseConnection));
        let header = read_header(&mut InputStream::new(close)).unwrap();
        assert_eq!(header.size, HEADER_SIZE);
    }

    #[test]
    fn test_idempotent_modes() {
        assert!(!OperationMode::Normal.is_idempotent());
        assert!(OperationMode::Nonmutating.is_idempotent());
        assert!(OperationMode::Idempotent.is_idempotent());
    }

    #[test]
    fn test_reply_status_bytes() {
        assert_eq!(ReplyStatus::from_u8(3), Some(ReplyStatus::FacetNotExist));
        assert_eq!(ReplyStatus::from_u8(42), None);
    }
}
