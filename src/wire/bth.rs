use std::fmt;

use super::{ensure_len, get_u24, put_u24, WireError, BTH_LEN, MAX_24BIT};

/// BTH opcode for an unreliable datagram SEND Only.
pub const OPCODE_UD_SEND_ONLY: u8 = 0x64;

/// Default partition key.
pub const DEFAULT_PKEY: u16 = 0xFFFF;

/// Base Transport Header.
///
/// ```text
/// 0      | opcode |
/// 1      | se:1 | m:1 | pad:2 | tver:4 |
/// 2..4   | partition key |
/// 4      | reserved |
/// 5..8   | destination QP |
/// 8      | a:1 | reserved:7 |
/// 9..12  | PSN |
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bth {
    pub opcode: u8,
    pub solicited: bool,
    pub mig_req: bool,
    /// 2 bits.
    pub pad_count: u8,
    /// 4 bits.
    pub tver: u8,
    pub pkey: u16,
    /// 24 bits.
    pub dest_qp: u32,
    pub ack_req: bool,
    /// 24 bits.
    pub psn: u32,
}

impl Bth {
    /// A UD SEND Only header toward `dest_qp` on the default partition.
    pub fn ud_send(dest_qp: u32) -> Self {
        Self {
            opcode: OPCODE_UD_SEND_ONLY,
            solicited: false,
            mig_req: false,
            pad_count: 0,
            tver: 0,
            pkey: DEFAULT_PKEY,
            dest_qp,
            ack_req: false,
            psn: 0,
        }
    }

    /// Check that every narrow field fits its width.
    pub fn validate(&self) -> Result<(), WireError> {
        if self.dest_qp > MAX_24BIT {
            return Err(WireError::FieldOverflow {
                field: "BTH destination QP",
                value: self.dest_qp,
            });
        }
        if self.psn > MAX_24BIT {
            return Err(WireError::FieldOverflow {
                field: "BTH PSN",
                value: self.psn,
            });
        }
        if self.pad_count > 0b11 {
            return Err(WireError::FieldOverflow {
                field: "BTH pad count",
                value: self.pad_count as u32,
            });
        }
        if self.tver > 0x0F {
            return Err(WireError::FieldOverflow {
                field: "BTH transport header version",
                value: self.tver as u32,
            });
        }
        Ok(())
    }

    /// Encode. Fields wider than their slot are truncated; call
    /// [`Bth::validate`] first when the input is untrusted.
    pub fn to_bytes(&self) -> [u8; BTH_LEN] {
        let mut b = [0u8; BTH_LEN];
        b[0] = self.opcode;
        b[1] = ((self.solicited as u8) << 7)
            | ((self.mig_req as u8) << 6)
            | ((self.pad_count & 0b11) << 4)
            | (self.tver & 0x0F);
        b[2..4].copy_from_slice(&self.pkey.to_be_bytes());
        put_u24(&mut b[4..8], self.dest_qp & MAX_24BIT);
        b[8] = (self.ack_req as u8) << 7;
        put_u24(&mut b[8..12], self.psn & MAX_24BIT);
        b
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        ensure_len(buf, BTH_LEN)?;
        Ok(Self {
            opcode: buf[0],
            solicited: buf[1] & 0x80 != 0,
            mig_req: buf[1] & 0x40 != 0,
            pad_count: (buf[1] >> 4) & 0b11,
            tver: buf[1] & 0x0F,
            pkey: u16::from_be_bytes([buf[2], buf[3]]),
            dest_qp: get_u24(&buf[4..8]),
            ack_req: buf[8] & 0x80 != 0,
            psn: get_u24(&buf[8..12]),
        })
    }
}

/// Force the reserved byte preceding the destination QP to all-ones.
#[inline]
pub fn mask_bth(b: &mut [u8; BTH_LEN]) {
    b[4] = 0xFF;
}

impl fmt::Display for Bth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Opcode: {:#x}", self.opcode)?;
        writeln!(f, "Solicited Event: {}", self.solicited as u8)?;
        writeln!(f, "Migration Request: {}", self.mig_req as u8)?;
        writeln!(f, "Pad Count: {}", self.pad_count)?;
        writeln!(f, "Header Version: {}", self.tver)?;
        writeln!(f, "Partition Key: {:#x}", self.pkey)?;
        writeln!(f, "Destination QP: {:#x}", self.dest_qp)?;
        writeln!(f, "Ack Request: {}", self.ack_req as u8)?;
        write!(f, "Packet Sequence: {:#x}", self.psn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_bytes() {
        let mut bth = Bth::ud_send(0x12_3456);
        bth.solicited = true;
        bth.pad_count = 2;
        bth.tver = 1;
        bth.ack_req = true;
        bth.psn = 0xAB_CDEF;

        let b = bth.to_bytes();
        assert_eq!(
            b,
            [0x64, 0xA1, 0xFF, 0xFF, 0x00, 0x12, 0x34, 0x56, 0x80, 0xAB, 0xCD, 0xEF]
        );
        assert_eq!(Bth::decode(&b).unwrap(), bth);
    }

    #[test]
    fn test_validate() {
        assert!(Bth::ud_send(0xFF_FFFF).validate().is_ok());
        assert_eq!(
            Bth::ud_send(0x100_0000).validate(),
            Err(WireError::FieldOverflow {
                field: "BTH destination QP",
                value: 0x100_0000
            })
        );
    }

    #[test]
    fn test_mask_keeps_qpn() {
        let mut b = Bth::ud_send(0x42).to_bytes();
        mask_bth(&mut b);
        assert_eq!(b[4], 0xFF);
        assert_eq!(Bth::decode(&b).unwrap().dest_qp, 0x42);
    }
}
