//! Byte-buffer codec for the primitive wire types.
//!
//! Integers are little-endian. Sizes use one byte below 255 and otherwise a
//! `0xFF` marker followed by an `i32`. Strings are a size followed by UTF-8
//! bytes. An encapsulation is a 4-byte size (covering its own header), the
//! encoding version, a format-type byte, and the payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;

use crate::error::RpcError;
use crate::identity::Identity;
use crate::version::EncodingVersion;

/// Per-request context: string key/value pairs sent with every invocation.
pub type Context = BTreeMap<String, String>;

/// Size of an encapsulation header: size, major, minor, format.
pub const ENCAPSULATION_HEADER_SIZE: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum FormatType {
    #[default]
    Default = 0,
    Compact = 1,
    Sliced = 2,
}

impl FormatType {
    fn from_u8(value: u8) -> Result<Self, RpcError> {
        match value {
            0 => Ok(FormatType::Default),
            1 => Ok(FormatType::Compact),
            2 => Ok(FormatType::Sliced),
            other => Err(RpcError::marshal(format!("invalid format type {}", other))),
        }
    }
}

#[derive(Debug, Default)]
pub struct OutputStream {
    buf: BytesMut,
    encaps_starts: Vec<usize>,
}

impl OutputStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            encaps_starts: Vec::new(),
        }
    }

    /// Reuse an existing (cleared) buffer, typically taken from a buffer pool.
    pub fn from_buffer(mut buf: BytesMut) -> Self {
        buf.clear();
        Self {
            buf,
            encaps_starts: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.encaps_starts.clear();
    }

    pub fn into_buffer(self) -> BytesMut {
        self.buf
    }

    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }

    pub fn write_byte(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.buf.put_u8(v as u8);
    }

    pub fn write_short(&mut self, v: i16) {
        self.buf.put_i16_le(v);
    }

    pub fn write_int(&mut self, v: i32) {
        self.buf.put_i32_le(v);
    }

    pub fn write_long(&mut self, v: i64) {
        self.buf.put_i64_le(v);
    }

    /// Overwrite an `i32` previously written at `pos`.
    pub fn rewrite_int(&mut self, pos: usize, v: i32) {
        self.buf[pos..pos + 4].copy_from_slice(&v.to_le_bytes());
    }

    pub fn write_size(&mut self, size: usize) {
        if size < 255 {
            self.buf.put_u8(size as u8);
        } else {
            self.buf.put_u8(255);
            self.buf.put_i32_le(size as i32);
        }
    }

    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    pub fn write_byte_seq(&mut self, bytes: &[u8]) {
        self.write_size(bytes.len());
        self.buf.put_slice(bytes);
    }

    pub fn write_string(&mut self, s: &str) {
        self.write_byte_seq(s.as_bytes());
    }

    pub fn write_string_seq(&mut self, v: &[String]) {
        self.write_size(v.len());
        for s in v {
            self.write_string(s);
        }
    }

    pub fn write_context(&mut self, ctx: &Context) {
        self.write_size(ctx.len());
        for (k, v) in ctx {
            self.write_string(k);
            self.write_string(v);
        }
    }

    pub fn write_identity(&mut self, id: &Identity) {
        self.write_string(&id.name);
        self.write_string(&id.category);
    }

    /// Facets travel as a sequence holding zero or one string.
    pub fn write_facet(&mut self, facet: &str) {
        if facet.is_empty() {
            self.write_size(0);
        } else {
            self.write_size(1);
            self.write_string(facet);
        }
    }

    pub fn start_encapsulation(&mut self, encoding: EncodingVersion, format: FormatType) {
        self.encaps_starts.push(self.buf.len());
        self.buf.put_i32_le(0);
        self.buf.put_u8(encoding.major);
        self.buf.put_u8(encoding.minor);
        self.buf.put_u8(format as u8);
    }

    pub fn end_encapsulation(&mut self) -> Result<(), RpcError> {
        let start = self
            .encaps_starts
            .pop()
            .ok_or_else(|| RpcError::marshal("end_encapsulation without start"))?;
        let size = self.buf.len() - start;
        self.rewrite_int(start, size as i32);
        Ok(())
    }

    pub fn write_empty_encapsulation(&mut self, encoding: EncodingVersion) {
        self.start_encapsulation(encoding, FormatType::Default);
        // Cannot fail: the start was pushed just above.
        let _ = self.end_encapsulation();
    }

    /// Wrap an already-encoded payload in an encapsulation.
    pub fn write_encapsulation_payload(&mut self, encoding: EncodingVersion, payload: &[u8]) {
        self.buf.put_i32_le((ENCAPSULATION_HEADER_SIZE + payload.len()) as i32);
        self.buf.put_u8(encoding.major);
        self.buf.put_u8(encoding.minor);
        self.buf.put_u8(FormatType::Default as u8);
        self.buf.put_slice(payload);
    }
}

#[derive(Debug, Clone)]
pub struct InputStream {
    buf: Bytes,
    pos: usize,
    encaps_ends: Vec<usize>,
}

impl InputStream {
    pub fn new(buf: Bytes) -> Self {
        Self {
            buf,
            pos: 0,
            encaps_ends: Vec::new(),
        }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }

    /// Bytes from the current position to the end of the buffer.
    pub fn rest(&self) -> Bytes {
        self.buf.slice(self.pos..)
    }

    pub fn into_bytes(self) -> Bytes {
        self.buf
    }

    fn need(&self, n: usize) -> Result<(), RpcError> {
        if self.remaining() < n {
            Err(RpcError::marshal(format!(
                "unmarshal out of bounds: need {} bytes at offset {}, have {}",
                n,
                self.pos,
                self.remaining()
            )))
        } else {
            Ok(())
        }
    }

    fn chunk(&mut self, n: usize) -> Result<&[u8], RpcError> {
        self.need(n)?;
        let start = self.pos;
        self.pos += n;
        Ok(&self.buf[start..start + n])
    }

    pub fn skip(&mut self, n: usize) -> Result<(), RpcError> {
        self.need(n)?;
        self.pos += n;
        Ok(())
    }

    pub fn read_byte(&mut self) -> Result<u8, RpcError> {
        Ok(self.chunk(1)?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool, RpcError> {
        Ok(self.read_byte()? != 0)
    }

    pub fn read_short(&mut self) -> Result<i16, RpcError> {
        let mut c = self.chunk(2)?;
        Ok(c.get_i16_le())
    }

    pub fn read_int(&mut self) -> Result<i32, RpcError> {
        let mut c = self.chunk(4)?;
        Ok(c.get_i32_le())
    }

    pub fn read_long(&mut self) -> Result<i64, RpcError> {
        let mut c = self.chunk(8)?;
        Ok(c.get_i64_le())
    }

    pub fn read_size(&mut self) -> Result<usize, RpcError> {
        let b = self.read_byte()?;
        if b < 255 {
            return Ok(b as usize);
        }
        let v = self.read_int()?;
        if v < 0 {
            return Err(RpcError::marshal(format!("negative size {}", v)));
        }
        Ok(v as usize)
    }

    pub fn read_byte_seq(&mut self) -> Result<Bytes, RpcError> {
        let n = self.read_size()?;
        self.need(n)?;
        let out = self.buf.slice(self.pos..self.pos + n);
        self.pos += n;
        Ok(out)
    }

    pub fn read_string(&mut self) -> Result<String, RpcError> {
        let n = self.read_size()?;
        let raw = self.chunk(n)?;
        String::from_utf8(raw.to_vec()).map_err(|e| RpcError::marshal(format!("invalid UTF-8: {}", e)))
    }

    pub fn read_string_seq(&mut self) -> Result<Vec<String>, RpcError> {
        let n = self.read_size()?;
        // Each string takes at least one byte; reject absurd sizes early.
        self.need(n)?;
        (0..n).map(|_| self.read_string()).collect()
    }

    pub fn read_context(&mut self) -> Result<Context, RpcError> {
        let n = self.read_size()?;
        self.need(n * 2)?;
        let mut ctx = Context::new();
        for _ in 0..n {
            let k = self.read_string()?;
            let v = self.read_string()?;
            ctx.insert(k, v);
        }
        Ok(ctx)
    }

    pub fn read_identity(&mut self) -> Result<Identity, RpcError> {
        let name = self.read_string()?;
        let category = self.read_string()?;
        Ok(Identity { name, category })
    }

    pub fn read_facet(&mut self) -> Result<String, RpcError> {
        let facets = self.read_string_seq()?;
        match facets.len() {
            0 => Ok(String::new()),
            1 => Ok(facets.into_iter().next().unwrap_or_default()),
            n => Err(RpcError::marshal(format!(
                "facet path with {} elements is not supported",
                n
            ))),
        }
    }

    pub fn start_encapsulation(&mut self) -> Result<(EncodingVersion, FormatType), RpcError> {
        let start = self.pos;
        let size = self.read_int()?;
        if size < ENCAPSULATION_HEADER_SIZE as i32 {
            return Err(RpcError::marshal(format!("invalid encapsulation size {}", size)));
        }
        let end = start + size as usize;
        if end > self.buf.len() {
            return Err(RpcError::marshal(format!(
                "encapsulation of {} bytes exceeds buffer",
                size
            )));
        }
        let major = self.read_byte()?;
        let minor = self.read_byte()?;
        let format = FormatType::from_u8(self.read_byte()?)?;
        self.encaps_ends.push(end);
        Ok((EncodingVersion { major, minor }, format))
    }

    pub fn end_encapsulation(&mut self) -> Result<(), RpcError> {
        let end = self
            .encaps_ends
            .pop()
            .ok_or_else(|| RpcError::marshal("end_encapsulation without start"))?;
        if self.pos != end {
            return Err(RpcError::marshal(format!(
                "encapsulation has {} unread bytes",
                end as isize - self.pos as isize
            )));
        }
        Ok(())
    }

    /// Read the payload of an encapsulation as a slice, leaving the stream
    /// positioned after it.
    pub fn read_encapsulation_payload(&mut self) -> Result<(EncodingVersion, Bytes), RpcError> {
        let (encoding, _) = self.start_encapsulation()?;
        let end = self.encaps_ends.pop().unwrap_or(self.pos);
        let payload = self.buf.slice(self.pos..end);
        self.pos = end;
        Ok((encoding, payload))
    }

    /// Read a whole encapsulation, header included.
    pub fn read_encapsulation(&mut self) -> Result<Bytes, RpcError> {
        let start = self.pos;
        let size = self.read_int()?;
        if size < ENCAPSULATION_HEADER_SIZE as i32 {
            return Err(RpcError::marshal(format!("invalid encapsulation size {}", size)));
        }
        self.pos = start;
        let raw = self.chunk(size as usize)?.to_vec();
        Ok(Bytes::from(raw))
    }
}
