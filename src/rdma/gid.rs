//! Global identifiers.

use std::fmt;
use std::net::{AddrParseError, Ipv6Addr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// An 128-bit identifier used to identify a port on a network adapter, a port
/// on a router, or a multicast group.
///
/// Stored in network byte order, exactly as it appears in a GRH.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Gid([u8; 16]);

impl Gid {
    /// Size of a GID on the wire.
    pub const SIZE: usize = 16;

    /// The raw bytes in network order.
    #[inline]
    pub const fn octets(&self) -> [u8; 16] {
        self.0
    }

    /// Whether this GID is all zeroes.
    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0 == [0; 16]
    }
}

impl fmt::Debug for Gid {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Gid").field(&self.to_string()).finish()
    }
}

/// Formats the GID the way `inet_ntop(AF_INET6, ..)` would.
impl fmt::Display for Gid {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Ipv6Addr::from(self.0).fmt(f)
    }
}

impl FromStr for Gid {
    type Err = AddrParseError;

    #[inline]
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<Ipv6Addr>().map(Self::from)
    }
}

impl From<Ipv6Addr> for Gid {
    #[inline]
    fn from(addr: Ipv6Addr) -> Self {
        Self(addr.octets())
    }
}

impl From<Gid> for Ipv6Addr {
    #[inline]
    fn from(gid: Gid) -> Self {
        Ipv6Addr::from(gid.0)
    }
}

impl From<[u8; 16]> for Gid {
    #[inline]
    fn from(raw: [u8; 16]) -> Self {
        Self(raw)
    }
}

impl From<Gid> for [u8; 16] {
    #[inline]
    fn from(gid: Gid) -> Self {
        gid.0
    }
}

impl Serialize for Gid {
    #[inline]
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        <[u8; 16] as Serialize>::serialize(&self.0, serializer)
    }
}

impl<'de> Deserialize<'de> for Gid {
    #[inline]
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        <[u8; 16] as Deserialize<'de>>::deserialize(deserializer).map(Self)
    }
}

#[cfg(feature = "ibverbs")]
mod ibv_conv {
    use super::Gid;
    use crate::bindings::ibv_gid;

    impl From<ibv_gid> for Gid {
        #[inline]
        fn from(gid: ibv_gid) -> Self {
            // SAFETY: byte-level reinterpretation of POD union.
            Self(unsafe { gid.raw })
        }
    }

    impl From<Gid> for ibv_gid {
        #[inline]
        fn from(gid: Gid) -> Self {
            ibv_gid { raw: gid.0 }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_roundtrip() {
        let gid: Gid = "fe80::248a:703:9c:e4a2".parse().unwrap();
        assert_eq!(gid.octets()[0], 0xfe);
        assert_eq!(gid.octets()[1], 0x80);
        assert_eq!(gid.octets()[15], 0xa2);
        assert_eq!(gid.to_string(), "fe80::248a:703:9c:e4a2");
    }

    #[test]
    fn test_rejects_garbage() {
        assert!("not-a-gid".parse::<Gid>().is_err());
        assert!(Gid::default().is_zero());
    }

    #[test]
    fn test_serde_as_bytes() {
        let gid = Gid::from([7u8; 16]);
        let json = serde_json::to_string(&gid).unwrap();
        assert_eq!(json, "[7,7,7,7,7,7,7,7,7,7,7,7,7,7,7,7]");
        assert_eq!(serde_json::from_str::<Gid>(&json).unwrap(), gid);
    }
}
