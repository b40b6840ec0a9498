use bytes::{Bytes, BytesMut};
use std::io;
use tern_core::protocol::{HEADER_SIZE, MAGIC, SIZE_OFFSET};
use tern_core::RpcError;
use tokio_util::codec::{Decoder, Encoder};

/// Codec splitting a byte stream into whole protocol messages.
/// Each item is a complete message, header included.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    /// Maximum message size to prevent memory exhaustion by a peer
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            max_frame_size: 10 * 1024 * 1024, // 10MB default
        }
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        if src[..4] != MAGIC {
            return Err(CodecError::BadMagic([src[0], src[1], src[2], src[3]]));
        }

        let mut size_bytes = [0u8; 4];
        size_bytes.copy_from_slice(&src[SIZE_OFFSET..SIZE_OFFSET + 4]);
        let size = i32::from_le_bytes(size_bytes);
        if size < HEADER_SIZE as i32 {
            return Err(CodecError::IllegalSize(size));
        }
        let size = size as usize;
        if size > self.max_frame_size {
            return Err(CodecError::FrameTooLarge(size));
        }

        if src.len() < size {
            src.reserve(size - src.len());
            return Ok(None);
        }

        Ok(Some(src.split_to(size).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() > self.max_frame_size {
            return Err(CodecError::FrameTooLarge(item.len()));
        }
        dst.extend_from_slice(&item);
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Illegal message size: {0}")]
    IllegalSize(i32),

    #[error("Bad magic: {0:?}")]
    BadMagic([u8; 4]),

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
}

impl From<CodecError> for RpcError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::IoError(e) => e.into(),
            other => RpcError::protocol(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tern_core::protocol::{finish_message, write_header, MessageType};
    use tern_core::OutputStream;

    fn message(body: &[u8]) -> Bytes {
        let mut out = OutputStream::new();
        write_header(&mut out, MessageType::Request);
        out.write_raw(body);
        finish_message(&mut out);
        out.freeze()
    }

    #[test]
    fn test_decode_whole_message() {
        let mut codec = FrameCodec::new();
        let msg = message(b"payload");
        let mut buffer = BytesMut::from(&msg[..]);
        let decoded = codec.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(decoded, msg);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_partial_frame() {
        let mut codec = FrameCodec::new();
        let msg = message(b"payload");
        let mut buffer = BytesMut::from(&msg[..5]);
        assert!(codec.decode(&mut buffer).unwrap().is_none());

        buffer.extend_from_slice(&msg[5..msg.len() - 1]);
        assert!(codec.decode(&mut buffer).unwrap().is_none());

        buffer.extend_from_slice(&msg[msg.len() - 1..]);
        assert_eq!(codec.decode(&mut buffer).unwrap().unwrap(), msg);
    }

    #[test]
    fn test_two_messages_in_buffer() {
        let mut codec = FrameCodec::new();
        let first = message(b"a");
        let second = message(b"bc");
        let mut buffer = BytesMut::new();
        codec.encode(first.clone(), &mut buffer).unwrap();
        codec.encode(second.clone(), &mut buffer).unwrap();
        assert_eq!(codec.decode(&mut buffer).unwrap().unwrap(), first);
        assert_eq!(codec.decode(&mut buffer).unwrap().unwrap(), second);
    }

    #[test]
    fn test_frame_too_large() {
        let mut codec = FrameCodec::with_max_frame_size(20);
        let mut buffer = BytesMut::new();
        assert!(codec.encode(message(&[0u8; 64]), &mut buffer).is_err());

        let mut buffer = BytesMut::from(&message(&[0u8; 64])[..]);
        assert!(matches!(
            codec.decode(&mut buffer),
            Err(CodecError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn test_bad_magic() {
        let mut codec = FrameCodec::new();
        let mut buffer = BytesMut::from(&b"HTTP/1.1 200 OK\r\n"[..]);
        assert!(matches!(codec.decode(&mut buffer), Err(CodecError::BadMagic(_))));
    }
}
