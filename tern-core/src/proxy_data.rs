use crate::endpoint::Endpoint;
use crate::error::RpcError;
use crate::identity::Identity;
use crate::protocol::InvocationMode;
use crate::stream::{InputStream, OutputStream};
use crate::version::{EncodingVersion, ProtocolVersion};

/// The wire form of a proxy.
///
/// A null proxy is encoded as an empty identity and nothing else. Otherwise the
/// identity is followed by the facet path, mode, secure flag, protocol and
/// encoding versions and either a non-empty endpoint list or an adapter id.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProxyData {
    pub identity: Identity,
    pub facet: String,
    pub mode: InvocationMode,
    pub secure: bool,
    pub protocol: ProtocolVersion,
    pub encoding: EncodingVersion,
    pub endpoints: Vec<Endpoint>,
    pub adapter_id: String,
}

impl ProxyData {
    pub fn write(out: &mut OutputStream, proxy: Option<&ProxyData>) {
        let Some(p) = proxy else {
            out.write_identity(&Identity::default());
            return;
        };
        out.write_identity(&p.identity);
        out.write_facet(&p.facet);
        out.write_byte(p.mode as u8);
        out.write_bool(p.secure);
        out.write_byte(p.protocol.major);
        out.write_byte(p.protocol.minor);
        out.write_byte(p.encoding.major);
        out.write_byte(p.encoding.minor);
        out.write_size(p.endpoints.len());
        for e in &p.endpoints {
            e.write(out);
        }
        if p.endpoints.is_empty() {
            out.write_string(&p.adapter_id);
        }
    }

    pub fn read(input: &mut InputStream) -> Result<Option<ProxyData>, RpcError> {
        let identity = input.read_identity()?;
        if identity.is_null() {
            return Ok(None);
        }
        let facet = input.read_facet()?;
        let mode = InvocationMode::try_from(input.read_byte()?)?;
        let secure = input.read_bool()?;
        let protocol = ProtocolVersion {
            major: input.read_byte()?,
            minor: input.read_byte()?,
        };
        let encoding = EncodingVersion {
            major: input.read_byte()?,
            minor: input.read_byte()?,
        };
        let count = input.read_size()?;
        let mut endpoints = Vec::with_capacity(count.min(16));
        for _ in 0..count {
            endpoints.push(Endpoint::read(input)?);
        }
        let adapter_id = if endpoints.is_empty() {
            input.read_string()?
        } else {
            String::new()
        };
        Ok(Some(ProxyData {
            identity,
            facet,
            mode,
            secure,
            protocol,
            encoding,
            endpoints,
            adapter_id,
        }))
    }
}
