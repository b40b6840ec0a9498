use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::RpcError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u8,
    pub minor: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EncodingVersion {
    pub major: u8,
    pub minor: u8,
}

pub const PROTOCOL_1_0: ProtocolVersion = ProtocolVersion { major: 1, minor: 0 };
pub const ENCODING_1_0: EncodingVersion = EncodingVersion { major: 1, minor: 0 };
pub const ENCODING_1_1: EncodingVersion = EncodingVersion { major: 1, minor: 1 };

/// Encoding used for message headers, which never change with the payload encoding.
pub const CURRENT_PROTOCOL_ENCODING: EncodingVersion = ENCODING_1_0;
pub const CURRENT_PROTOCOL: ProtocolVersion = PROTOCOL_1_0;
pub const CURRENT_ENCODING: EncodingVersion = ENCODING_1_1;

fn parse_pair(s: &str) -> Option<(u8, u8)> {
    let (major, minor) = s.trim().split_once('.')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}

impl ProtocolVersion {
    pub fn parse(s: &str) -> Result<Self, RpcError> {
        parse_pair(s)
            .map(|(major, minor)| ProtocolVersion { major, minor })
            .ok_or_else(|| RpcError::VersionParse(s.to_string()))
    }

    pub fn is_supported(&self) -> bool {
        self.major == CURRENT_PROTOCOL.major && self.minor <= CURRENT_PROTOCOL.minor
    }
}

impl EncodingVersion {
    pub fn parse(s: &str) -> Result<Self, RpcError> {
        parse_pair(s)
            .map(|(major, minor)| EncodingVersion { major, minor })
            .ok_or_else(|| RpcError::VersionParse(s.to_string()))
    }

    pub fn is_supported(&self) -> bool {
        self.major == CURRENT_ENCODING.major && self.minor <= CURRENT_ENCODING.minor
    }

    pub fn check_supported(&self) -> Result<(), RpcError> {
        if self.is_supported() {
            Ok(())
        } else {
            Err(RpcError::UnsupportedEncoding {
                bad: *self,
                supported: CURRENT_ENCODING,
            })
        }
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        CURRENT_PROTOCOL
    }
}

impl Default for EncodingVersion {
    fn default() -> Self {
        CURRENT_ENCODING
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl fmt::Display for EncodingVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_versions() {
        assert_eq!(EncodingVersion::parse("1.1").unwrap(), ENCODING_1_1);
        assert_eq!(ProtocolVersion::parse(" 1.0 ").unwrap(), PROTOCOL_1_0);
        assert!(EncodingVersion::parse("1").is_err());
        assert!(EncodingVersion::parse("x.1").is_err());
    }

    #[test]
    fn test_supported() {
        assert!(ENCODING_1_0.is_supported());
        assert!(!EncodingVersion { major: 2, minor: 0 }.is_supported());
        assert!(matches!(
            EncodingVersion { major: 1, minor: 5 }.check_supported(),
            Err(RpcError::UnsupportedEncoding { .. })
        ));
    }
}
