use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use std::fmt;

use crate::error::RpcError;
use crate::stream::{InputStream, OutputStream};
use crate::version::{EncodingVersion, CURRENT_ENCODING};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Transport {
    Tcp,
    Ssl,
    Udp,
    Ws,
    Wss,
    /// In-process transport, see `tern_transport::memory`.
    Mem,
}

impl Transport {
    pub fn type_id(&self) -> i16 {
        match self {
            Transport::Tcp => 1,
            Transport::Ssl => 2,
            Transport::Udp => 3,
            Transport::Ws => 4,
            Transport::Wss => 5,
            Transport::Mem => 100,
        }
    }

    pub fn from_type_id(id: i16) -> Option<Self> {
        Some(match id {
            1 => Transport::Tcp,
            2 => Transport::Ssl,
            3 => Transport::Udp,
            4 => Transport::Ws,
            5 => Transport::Wss,
            100 => Transport::Mem,
            _ => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Ssl => "ssl",
            Transport::Udp => "udp",
            Transport::Ws => "ws",
            Transport::Wss => "wss",
            Transport::Mem => "mem",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "tcp" | "default" => Transport::Tcp,
            "ssl" => Transport::Ssl,
            "udp" => Transport::Udp,
            "ws" => Transport::Ws,
            "wss" => Transport::Wss,
            "mem" => Transport::Mem,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Ip {
        transport: Transport,
        host: String,
        port: u16,
        /// Connection timeout in milliseconds, `None` for the default.
        timeout: Option<i32>,
        compress: bool,
    },
    /// Endpoint of a transport this process does not know. It is preserved
    /// verbatim so proxies can be forwarded, but never used to connect.
    Opaque {
        type_id: i16,
        encoding: EncodingVersion,
        bytes: Bytes,
    },
}

impl Endpoint {
    pub fn new(transport: Transport, host: impl Into<String>, port: u16) -> Self {
        Endpoint::Ip {
            transport,
            host: host.into(),
            port,
            timeout: None,
            compress: false,
        }
    }

    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::new(Transport::Tcp, host, port)
    }

    pub fn mem(host: impl Into<String>, port: u16) -> Self {
        Self::new(Transport::Mem, host, port)
    }

    pub fn transport(&self) -> Option<Transport> {
        match self {
            Endpoint::Ip { transport, .. } => Some(*transport),
            Endpoint::Opaque { .. } => None,
        }
    }

    pub fn type_id(&self) -> i16 {
        match self {
            Endpoint::Ip { transport, .. } => transport.type_id(),
            Endpoint::Opaque { type_id, .. } => *type_id,
        }
    }

    pub fn is_opaque(&self) -> bool {
        matches!(self, Endpoint::Opaque { .. })
    }

    pub fn datagram(&self) -> bool {
        matches!(self.transport(), Some(Transport::Udp))
    }

    pub fn secure(&self) -> bool {
        matches!(self.transport(), Some(Transport::Ssl | Transport::Wss))
    }

    pub fn host(&self) -> Option<&str> {
        match self {
            Endpoint::Ip { host, .. } => Some(host),
            Endpoint::Opaque { .. } => None,
        }
    }

    pub fn port(&self) -> Option<u16> {
        match self {
            Endpoint::Ip { port, .. } => Some(*port),
            Endpoint::Opaque { .. } => None,
        }
    }

    pub fn timeout(&self) -> Option<i32> {
        match self {
            Endpoint::Ip { timeout, .. } => *timeout,
            Endpoint::Opaque { .. } => None,
        }
    }

    pub fn with_timeout(&self, value: Option<i32>) -> Self {
        match self {
            Endpoint::Ip { timeout, .. } if *timeout == value => self.clone(),
            Endpoint::Ip {
                transport,
                host,
                port,
                compress,
                ..
            } => Endpoint::Ip {
                transport: *transport,
                host: host.clone(),
                port: *port,
                timeout: value,
                compress: *compress,
            },
            Endpoint::Opaque { .. } => self.clone(),
        }
    }

    /// Parse the stringified form of an endpoint, e.g. `tcp -h localhost -p 10000`.
    pub fn parse(s: &str) -> Result<Self, RpcError> {
        let tokens = split_tokens(s)?;
        let Some((name, args)) = tokens.split_first() else {
            return Err(RpcError::EndpointParse(format!("empty endpoint in `{}`", s)));
        };
        if name == "opaque" {
            return parse_opaque(args, s);
        }
        let transport = Transport::from_name(name).ok_or_else(|| {
            RpcError::EndpointParse(format!("unknown transport `{}' in endpoint `{}'", name, s))
        })?;

        let mut host = None;
        let mut port = 0u16;
        let mut timeout = None;
        let mut compress = false;
        let mut i = 0;
        while i < args.len() {
            let opt = args[i].as_str();
            let value = args.get(i + 1).filter(|v| !v.starts_with('-'));
            match opt {
                "-h" => {
                    host = Some(require(value, opt, s)?.clone());
                    i += 2;
                }
                "-p" => {
                    let v = require(value, opt, s)?;
                    port = v.parse::<u16>().map_err(|_| {
                        RpcError::EndpointParse(format!(
                            "invalid port value `{}' in endpoint `{}'",
                            v, s
                        ))
                    })?;
                    i += 2;
                }
                "-t" if transport != Transport::Udp => {
                    let v = require(value, opt, s)?;
                    let parsed = if v == "infinite" {
                        -1
                    } else {
                        v.parse::<i32>().ok().filter(|t| *t >= 1).ok_or_else(|| {
                            RpcError::EndpointParse(format!(
                                "invalid timeout value `{}' in endpoint `{}'",
                                v, s
                            ))
                        })?
                    };
                    timeout = Some(parsed);
                    i += 2;
                }
                "-z" => {
                    compress = true;
                    i += 1;
                }
                other => {
                    return Err(RpcError::EndpointParse(format!(
                        "unknown option `{}' in endpoint `{}'",
                        other, s
                    )))
                }
            }
        }

        Ok(Endpoint::Ip {
            transport,
            host: host.unwrap_or_default(),
            port,
            timeout,
            compress,
        })
    }

    pub fn write(&self, out: &mut OutputStream) {
        out.write_short(self.type_id());
        match self {
            Endpoint::Ip {
                transport,
                host,
                port,
                timeout,
                compress,
            } => {
                let mut body = OutputStream::new();
                body.write_string(host);
                body.write_int(i32::from(*port));
                if *transport != Transport::Udp {
                    body.write_int(timeout.unwrap_or(-1));
                }
                body.write_bool(*compress);
                out.write_encapsulation_payload(CURRENT_ENCODING, body.as_slice());
            }
            Endpoint::Opaque {
                encoding, bytes, ..
            } => out.write_encapsulation_payload(*encoding, bytes),
        }
    }

    pub fn read(input: &mut InputStream) -> Result<Self, RpcError> {
        let type_id = input.read_short()?;
        let (encoding, payload) = input.read_encapsulation_payload()?;
        let Some(transport) = Transport::from_type_id(type_id) else {
            return Ok(Endpoint::Opaque {
                type_id,
                encoding,
                bytes: payload,
            });
        };
        let mut body = InputStream::new(payload);
        let host = body.read_string()?;
        let port = body.read_int()?;
        let port = u16::try_from(port)
            .map_err(|_| RpcError::marshal(format!("invalid port {} in endpoint", port)))?;
        let timeout = if transport != Transport::Udp {
            Some(body.read_int()?).filter(|t| *t != -1)
        } else {
            None
        };
        let compress = body.read_bool()?;
        Ok(Endpoint::Ip {
            transport,
            host,
            port,
            timeout,
            compress,
        })
    }
}

fn require<'a>(value: Option<&'a String>, opt: &str, s: &str) -> Result<&'a String, RpcError> {
    value.ok_or_else(|| {
        RpcError::EndpointParse(format!("no argument provided for {} option in endpoint `{}'", opt, s))
    })
}

fn parse_opaque(args: &[String], s: &str) -> Result<Endpoint, RpcError> {
    let mut type_id = None;
    let mut encoding = CURRENT_ENCODING;
    let mut bytes = None;
    let mut i = 0;
    while i < args.len() {
        let opt = args[i].as_str();
        let value = args.get(i + 1);
        match opt {
            "-t" => {
                let v = require(value, opt, s)?;
                let t = v.parse::<i16>().ok().filter(|t| *t >= 0).ok_or_else(|| {
                    RpcError::EndpointParse(format!("invalid type value `{}' in endpoint `{}'", v, s))
                })?;
                type_id = Some(t);
            }
            "-e" => {
                encoding = EncodingVersion::parse(require(value, opt, s)?)
                    .map_err(|_| RpcError::EndpointParse(format!("invalid encoding in endpoint `{}'", s)))?;
            }
            "-v" => {
                let v = require(value, opt, s)?;
                let decoded = BASE64.decode(v).map_err(|_| {
                    RpcError::EndpointParse(format!("invalid base64 value `{}' in endpoint `{}'", v, s))
                })?;
                bytes = Some(Bytes::from(decoded));
            }
            other => {
                return Err(RpcError::EndpointParse(format!(
                    "unknown option `{}' in endpoint `{}'",
                    other, s
                )))
            }
        }
        i += 2;
    }
    let type_id = type_id
        .ok_or_else(|| RpcError::EndpointParse(format!("no -t option in endpoint `{}'", s)))?;
    let bytes =
        bytes.ok_or_else(|| RpcError::EndpointParse(format!("no -v option in endpoint `{}'", s)))?;
    Ok(Endpoint::Opaque {
        type_id,
        encoding,
        bytes,
    })
}

/// Split on whitespace, honouring single and double quotes.
pub fn split_tokens(s: &str) -> Result<Vec<String>, RpcError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut in_token = false;
    for c in s.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                in_token = true;
            }
            None if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            None => {
                current.push(c);
                in_token = true;
            }
        }
    }
    if quote.is_some() {
        return Err(RpcError::EndpointParse(format!("mismatched quotes in `{}'", s)));
    }
    if in_token {
        tokens.push(current);
    }
    Ok(tokens)
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Ip {
                transport,
                host,
                port,
                timeout,
                compress,
            } => {
                write!(f, "{}", transport.name())?;
                if !host.is_empty() {
                    if host.contains(':') || host.contains(' ') {
                        write!(f, " -h \"{}\"", host)?;
                    } else {
                        write!(f, " -h {}", host)?;
                    }
                }
                write!(f, " -p {}", port)?;
                match timeout {
                    Some(-1) => write!(f, " -t infinite")?,
                    Some(t) => write!(f, " -t {}", t)?,
                    None => {}
                }
                if *compress {
                    write!(f, " -z")?;
                }
                Ok(())
            }
            Endpoint::Opaque {
                type_id,
                encoding,
                bytes,
            } => write!(
                f,
                "opaque -t {} -e {} -v {}",
                type_id,
                encoding,
                BASE64.encode(bytes)
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tcp() {
        let e = Endpoint::parse("tcp -h localhost -p 10000 -t 5000").unwrap();
        assert_eq!(e.host(), Some("localhost"));
        assert_eq!(e.port(), Some(10000));
        assert_eq!(e.timeout(), Some(5000));
        assert_eq!(e.to_string(), "tcp -h localhost -p 10000 -t 5000");
    }

    #[test]
    fn test_port_out_of_range() {
        let err = Endpoint::parse("tcp -h h -p 70000").unwrap_err();
        let text = err.to_string();
        assert!(text.contains("70000"));
        assert!(text.contains("tcp -h h -p 70000"));
    }

    #[test]
    fn test_unknown_option_names_token() {
        let err = Endpoint::parse("tcp -h h -x 1").unwrap_err();
        assert!(err.to_string().contains("-x"));
    }

    #[test]
    fn test_udp_is_datagram_ssl_is_secure() {
        assert!(Endpoint::parse("udp -h h -p 1").unwrap().datagram());
        assert!(Endpoint::parse("ssl -h h -p 1").unwrap().secure());
        assert!(!Endpoint::parse("tcp -h h -p 1").unwrap().secure());
    }

    #[test]
    fn test_opaque_round_trip_through_wire() {
        let e = Endpoint::parse("opaque -t 99 -e 1.0 -v CTEyNy4wLjAuMeouAAAQJwAAAA==").unwrap();
        assert!(e.is_opaque());
        assert_eq!(e.type_id(), 99);

        let mut out = OutputStream::new();
        e.write(&mut out);
        let mut input = InputStream::new(out.freeze());
        assert_eq!(Endpoint::read(&mut input).unwrap(), e);
    }

    #[test]
    fn test_opaque_type_out_of_range() {
        assert!(Endpoint::parse("opaque -t -1 -v AA==").is_err());
        assert!(Endpoint::parse("opaque -t 40000 -v AA==").is_err());
    }

    #[test]
    fn test_mismatched_quotes() {
        assert!(matches!(
            Endpoint::parse("tcp -h \"oops -p 1"),
            Err(RpcError::EndpointParse(_))
        ));
    }

    #[test]
    fn test_ip_endpoint_wire_round_trip() {
        let e = Endpoint::parse("mem -h server -p 7 -t 100 -z").unwrap();
        let mut out = OutputStream::new();
        e.write(&mut out);
        let mut input = InputStream::new(out.freeze());
        assert_eq!(Endpoint::read(&mut input).unwrap(), e);
    }
}
