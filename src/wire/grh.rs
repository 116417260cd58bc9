use std::fmt;

use super::{ensure_len, WireError, GRH_LEN};
use crate::rdma::gid::Gid;

/// GRH `next_header` value announcing an IBA transport header.
pub const NEXT_HEADER_IBA: u8 = 27;

/// GRH IP version field.
pub const GRH_IP_VERSION: u8 = 6;

/// Global Routing Header.
///
/// Byte layout, all multi-byte fields big-endian:
///
/// ```text
/// 0      | ip_version:4 | traffic_class[7:4]:4 |
/// 1      | traffic_class[3:0]:4 | flow_label[19:16]:4 |
/// 2..4   | flow_label[15:0] |
/// 4..6   | payload_length |
/// 6      | next_header |
/// 7      | hop_limit |
/// 8..24  | source GID |
/// 24..40 | destination GID |
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grh {
    pub ip_version: u8,
    pub traffic_class: u8,
    /// 20 bits.
    pub flow_label: u32,
    pub payload_length: u16,
    pub next_header: u8,
    pub hop_limit: u8,
    pub sgid: Gid,
    pub dgid: Gid,
}

impl Grh {
    /// A RoCE v1 GRH with hop limit 1 and zero traffic class and flow label.
    pub fn new(sgid: Gid, dgid: Gid, payload_length: u16) -> Self {
        Self {
            ip_version: GRH_IP_VERSION,
            traffic_class: 0,
            flow_label: 0,
            payload_length,
            next_header: NEXT_HEADER_IBA,
            hop_limit: 1,
            sgid,
            dgid,
        }
    }

    pub fn to_bytes(&self) -> [u8; GRH_LEN] {
        let mut b = [0u8; GRH_LEN];
        b[0] = (self.ip_version << 4) | (self.traffic_class >> 4);
        b[1] = ((self.traffic_class & 0x0F) << 4) | ((self.flow_label >> 16) & 0x0F) as u8;
        b[2..4].copy_from_slice(&(self.flow_label as u16).to_be_bytes());
        b[4..6].copy_from_slice(&self.payload_length.to_be_bytes());
        b[6] = self.next_header;
        b[7] = self.hop_limit;
        b[8..24].copy_from_slice(&self.sgid.octets());
        b[24..40].copy_from_slice(&self.dgid.octets());
        b
    }

    /// Decode without validating the version or next header.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        ensure_len(buf, GRH_LEN)?;
        let mut sgid = [0u8; 16];
        let mut dgid = [0u8; 16];
        sgid.copy_from_slice(&buf[8..24]);
        dgid.copy_from_slice(&buf[24..40]);
        Ok(Self {
            ip_version: buf[0] >> 4,
            traffic_class: (buf[0] << 4) | (buf[1] >> 4),
            flow_label: (((buf[1] & 0x0F) as u32) << 16) | u16::from_be_bytes([buf[2], buf[3]]) as u32,
            payload_length: u16::from_be_bytes([buf[4], buf[5]]),
            next_header: buf[6],
            hop_limit: buf[7],
            sgid: sgid.into(),
            dgid: dgid.into(),
        })
    }
}

/// Force traffic class, flow label and hop limit of an encoded GRH to all-ones.
#[inline]
pub fn mask_grh(b: &mut [u8; GRH_LEN]) {
    b[0] |= 0x0F;
    b[1] = 0xFF;
    b[2] = 0xFF;
    b[3] = 0xFF;
    b[7] = 0xFF;
}

impl fmt::Display for Grh {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "IP Version: {}", self.ip_version)?;
        writeln!(f, "Traffic Class: {:#x}", self.traffic_class)?;
        writeln!(f, "Flow Label: {:#x}", self.flow_label)?;
        writeln!(f, "Length: {}", self.payload_length)?;
        writeln!(f, "Next Header: {}", self.next_header)?;
        writeln!(f, "Hop Limit: {}", self.hop_limit)?;
        writeln!(f, "Source: {}", self.sgid)?;
        write!(f, "Dest: {}", self.dgid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_bytes() {
        let mut grh = Grh::new(
            "fe80::1".parse().unwrap(),
            "fe80::2".parse().unwrap(),
            0x0418,
        );
        grh.traffic_class = 0xAB;
        grh.flow_label = 0xC_DEF0;

        let b = grh.to_bytes();
        assert_eq!(&b[..8], &[0x6A, 0xBC, 0xDE, 0xF0, 0x04, 0x18, 27, 1]);
        assert_eq!(b[8], 0xfe);
        assert_eq!(b[9], 0x80);
        assert_eq!(b[23], 0x01);
        assert_eq!(b[39], 0x02);
        assert_eq!(Grh::decode(&b).unwrap(), grh);
    }

    #[test]
    fn test_mask() {
        let grh = Grh::new(Gid::default(), Gid::default(), 100);
        let mut b = grh.to_bytes();
        mask_grh(&mut b);
        let masked = Grh::decode(&b).unwrap();
        assert_eq!(masked.ip_version, 6);
        assert_eq!(masked.traffic_class, 0xFF);
        assert_eq!(masked.flow_label, 0xF_FFFF);
        assert_eq!(masked.hop_limit, 0xFF);
        assert_eq!(masked.payload_length, 100);
        assert_eq!(masked.next_header, 27);
    }
}
