//! Out-of-band queue pair addressing.

use std::fmt;
use std::net::AddrParseError;
use std::num::ParseIntError;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::gid::Gid;
use super::type_alias::*;

/// Largest queue pair number representable in the 24-bit BTH/DETH fields.
pub const MAX_QPN: Qpn = 0x00FF_FFFF;

/// Error parsing an endpoint from its textual parts.
#[derive(Debug, Error)]
pub enum EndpointParseError {
    #[error("invalid LID {0:?}")]
    Lid(String, #[source] ParseIntError),

    #[error("invalid GID {0:?}")]
    Gid(String, #[source] AddrParseError),

    #[error("invalid QPN {0:?}")]
    Qpn(String, #[source] ParseIntError),

    #[error("QPN {0} does not fit in 24 bits")]
    QpnOverflow(u32),
}

/// Everything a sender needs to address a remote unreliable datagram queue pair.
///
/// This is what the receiver prints after setup and what the sender is
/// started with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QpEndpoint {
    pub lid: Lid,
    pub gid: Gid,
    pub qpn: Qpn,
}

impl QpEndpoint {
    /// Parse the three out-of-band strings: decimal LID, textual GID, and
    /// decimal QPN.
    pub fn parse(lid: &str, gid: &str, qpn: &str) -> Result<Self, EndpointParseError> {
        let lid = lid
            .trim()
            .parse::<Lid>()
            .map_err(|e| EndpointParseError::Lid(lid.to_owned(), e))?;
        let gid = gid
            .trim()
            .parse::<Gid>()
            .map_err(|e| EndpointParseError::Gid(gid.to_owned(), e))?;
        let qpn = qpn
            .trim()
            .parse::<Qpn>()
            .map_err(|e| EndpointParseError::Qpn(qpn.to_owned(), e))?;
        if qpn > MAX_QPN {
            return Err(EndpointParseError::QpnOverflow(qpn));
        }
        Ok(Self { lid, gid, qpn })
    }
}

impl fmt::Display for QpEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LID {} QPN {} GID {}", self.lid, self.qpn, self.gid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ok() {
        let ep = QpEndpoint::parse("3", "fe80::1", "4660").unwrap();
        assert_eq!(ep.lid, 3);
        assert_eq!(ep.qpn, 0x1234);
        assert_eq!(ep.gid, "fe80::1".parse().unwrap());
        assert_eq!(ep.to_string(), "LID 3 QPN 4660 GID fe80::1");
    }

    #[test]
    fn test_parse_boundaries() {
        assert!(QpEndpoint::parse("0", "::", "16777215").is_ok());
        assert!(matches!(
            QpEndpoint::parse("0", "::", "16777216"),
            Err(EndpointParseError::QpnOverflow(0x0100_0000))
        ));
        assert!(matches!(
            QpEndpoint::parse("65536", "::", "1"),
            Err(EndpointParseError::Lid(..))
        ));
        assert!(matches!(
            QpEndpoint::parse("1", "fe80:::1:", "1"),
            Err(EndpointParseError::Gid(..))
        ));
        assert!(matches!(
            QpEndpoint::parse("1", "::", "0x12"),
            Err(EndpointParseError::Qpn(..))
        ));
    }

    #[test]
    fn test_json_roundtrip() {
        let ep = QpEndpoint::parse("7", "fe80::248a:703:9c:e4a2", "99").unwrap();
        let s = serde_json::to_string(&ep).unwrap();
        assert_eq!(serde_json::from_str::<QpEndpoint>(&s).unwrap(), ep);
    }
}
