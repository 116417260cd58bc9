use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{ensure_len, WireError, ETH_LEN, ROCE_ETHERTYPE};
use crate::rdma::gid::Gid;

/// A 48-bit Ethernet hardware address.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const BROADCAST: Self = Self([0xFF; 6]);

    #[inline]
    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// The link-local GID a RoCE v1 port derives from this MAC (modified
    /// EUI-64 interface identifier under `fe80::/64`).
    pub fn link_local_gid(&self) -> Gid {
        let [a, b, c, d, e, f] = self.0;
        Gid::from([
            0xfe, 0x80, 0, 0, 0, 0, 0, 0,
            a ^ 0x02, b, c, 0xff, 0xfe, d, e, f,
        ])
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MacAddr({self})")
    }
}

/// Error parsing a colon-separated MAC address.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid MAC address {0:?}")]
pub struct MacParseError(String);

impl FromStr for MacAddr {
    type Err = MacParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || MacParseError(s.to_owned());
        let mut out = [0u8; 6];
        let mut parts = s.split(':');
        for byte in out.iter_mut() {
            let part = parts.next().ok_or_else(err)?;
            if part.is_empty() || part.len() > 2 {
                return Err(err());
            }
            *byte = u8::from_str_radix(part, 16).map_err(|_| err())?;
        }
        if parts.next().is_some() {
            return Err(err());
        }
        Ok(Self(out))
    }
}

/// Ethernet II header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EthHeader {
    pub dst: MacAddr,
    pub src: MacAddr,
    pub ethertype: u16,
}

impl EthHeader {
    /// A RoCE v1 Ethernet header.
    pub fn roce(dst: MacAddr, src: MacAddr) -> Self {
        Self {
            dst,
            src,
            ethertype: ROCE_ETHERTYPE,
        }
    }

    pub fn to_bytes(&self) -> [u8; ETH_LEN] {
        let mut b = [0u8; ETH_LEN];
        b[0..6].copy_from_slice(&self.dst.0);
        b[6..12].copy_from_slice(&self.src.0);
        b[12..14].copy_from_slice(&self.ethertype.to_be_bytes());
        b
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        ensure_len(buf, ETH_LEN)?;
        let mut dst = [0u8; 6];
        let mut src = [0u8; 6];
        dst.copy_from_slice(&buf[0..6]);
        src.copy_from_slice(&buf[6..12]);
        Ok(Self {
            dst: MacAddr(dst),
            src: MacAddr(src),
            ethertype: u16::from_be_bytes([buf[12], buf[13]]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_text() {
        let mac: MacAddr = "0c:42:A1:00:ff:3".parse().unwrap();
        assert_eq!(mac.octets(), [0x0c, 0x42, 0xa1, 0x00, 0xff, 0x03]);
        assert_eq!(mac.to_string(), "0c:42:a1:00:ff:03");
        assert!("0c:42:a1:00:ff".parse::<MacAddr>().is_err());
        assert!("0c:42:a1:00:ff:03:01".parse::<MacAddr>().is_err());
        assert!("0c:42:a1:00:ff:zz".parse::<MacAddr>().is_err());
    }

    #[test]
    fn test_link_local_gid() {
        let mac: MacAddr = "24:8a:07:9c:e4:a2".parse().unwrap();
        let gid: Gid = "fe80::268a:7ff:fe9c:e4a2".parse().unwrap();
        assert_eq!(mac.link_local_gid(), gid);
    }

    #[test]
    fn test_eth_layout() {
        let hdr = EthHeader::roce(MacAddr([1, 2, 3, 4, 5, 6]), MacAddr([7, 8, 9, 10, 11, 12]));
        let b = hdr.to_bytes();
        assert_eq!(b, [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 0x89, 0x15]);
        assert_eq!(EthHeader::decode(&b).unwrap(), hdr);
        assert!(matches!(
            EthHeader::decode(&b[..13]),
            Err(WireError::Truncated { need: 14, got: 13 })
        ));
    }
}
