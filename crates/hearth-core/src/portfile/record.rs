//! The fixed 16-byte port record.
//!
//! ```text
//! [i32 BE: magic 0x1174][i32 BE: port][i64 BE: cookie]
//! ```

use crate::config::PortFileConfig;
use std::net::{Ipv4Addr, SocketAddr};

/// Address and authenticity cookie advertised by a live build server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortRecord {
    pub port: u16,
    pub cookie: i64,
}

impl PortRecord {
    pub fn new(port: u16, cookie: i64) -> Self {
        Self { port, cookie }
    }

    /// Serialize to the on-disk layout.
    pub fn encode(&self) -> [u8; PortFileConfig::RECORD_LEN] {
        let mut buf = [0u8; PortFileConfig::RECORD_LEN];
        buf[0..4].copy_from_slice(&PortFileConfig::MAGIC.to_be_bytes());
        buf[4..8].copy_from_slice(&i32::from(self.port).to_be_bytes());
        buf[8..16].copy_from_slice(&self.cookie.to_be_bytes());
        buf
    }

    /// Parse the on-disk layout.
    ///
    /// Returns `None` for short input, a wrong magic number, or a port
    /// outside the TCP range. Trailing bytes past the record are ignored.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < PortFileConfig::RECORD_LEN {
            return None;
        }

        let magic = i32::from_be_bytes(bytes[0..4].try_into().ok()?);
        if magic != PortFileConfig::MAGIC {
            return None;
        }

        let port = i32::from_be_bytes(bytes[4..8].try_into().ok()?);
        let port = u16::try_from(port).ok()?;
        let cookie = i64::from_be_bytes(bytes[8..16].try_into().ok()?);

        Some(Self { port, cookie })
    }

    /// Loopback address the server listens on.
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, self.port))
    }
}

/// Mint a fresh cookie for a newly bound server.
pub fn random_cookie() -> i64 {
    rand::random::<i64>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout_is_big_endian() {
        let bytes = PortRecord::new(7000, 42).encode();
        assert_eq!(
            bytes,
            [
                0x00, 0x00, 0x11, 0x74, // magic
                0x00, 0x00, 0x1b, 0x58, // 7000
                0, 0, 0, 0, 0, 0, 0, 42,
            ]
        );
    }

    #[test]
    fn test_decode_extreme_values() {
        for record in [
            PortRecord::new(0, i64::MIN),
            PortRecord::new(u16::MAX, i64::MAX),
            PortRecord::new(1, -1),
        ] {
            assert_eq!(PortRecord::decode(&record.encode()), Some(record));
        }
    }

    #[test]
    fn test_decode_short_input_is_invalid() {
        let bytes = PortRecord::new(7000, 42).encode();
        assert_eq!(PortRecord::decode(&bytes[..15]), None);
        assert_eq!(PortRecord::decode(&[]), None);
    }

    #[test]
    fn test_decode_wrong_magic_is_invalid() {
        let mut bytes = PortRecord::new(7000, 42).encode();
        bytes[3] ^= 0xff;
        assert_eq!(PortRecord::decode(&bytes), None);
    }

    #[test]
    fn test_decode_out_of_range_port_is_invalid() {
        let mut bytes = PortRecord::new(7000, 42).encode();
        bytes[4..8].copy_from_slice(&70_000i32.to_be_bytes());
        assert_eq!(PortRecord::decode(&bytes), None);

        bytes[4..8].copy_from_slice(&(-1i32).to_be_bytes());
        assert_eq!(PortRecord::decode(&bytes), None);
    }

    #[test]
    fn test_addr_is_loopback() {
        let addr = PortRecord::new(7000, 1).addr();
        assert!(addr.ip().is_loopback());
        assert_eq!(addr.port(), 7000);
    }
}
