use std::fmt;

use super::{ensure_len, get_u24, put_u24, WireError, DETH_LEN, MAX_24BIT};

/// The well-known Q_Key every queue pair in this crate is configured with.
pub const DEFAULT_QKEY: u32 = 0x1111_1111;

/// Datagram Extended Transport Header.
///
/// ```text
/// 0..4 | Q_Key |
/// 4    | reserved |
/// 5..8 | source QP |
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deth {
    pub qkey: u32,
    /// 24 bits.
    pub src_qp: u32,
}

impl Deth {
    pub fn new(src_qp: u32) -> Self {
        Self {
            qkey: DEFAULT_QKEY,
            src_qp,
        }
    }

    pub fn validate(&self) -> Result<(), WireError> {
        if self.src_qp > MAX_24BIT {
            return Err(WireError::FieldOverflow {
                field: "DETH source QP",
                value: self.src_qp,
            });
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> [u8; DETH_LEN] {
        let mut b = [0u8; DETH_LEN];
        b[0..4].copy_from_slice(&self.qkey.to_be_bytes());
        put_u24(&mut b[4..8], self.src_qp & MAX_24BIT);
        b
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        ensure_len(buf, DETH_LEN)?;
        Ok(Self {
            qkey: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            src_qp: get_u24(&buf[4..8]),
        })
    }
}

impl fmt::Display for Deth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Queue Key: {:#x}", self.qkey)?;
        write!(f, "Source QP: {:#x}", self.src_qp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_bytes() {
        let deth = Deth::new(0x00_0ABC);
        let b = deth.to_bytes();
        assert_eq!(b, [0x11, 0x11, 0x11, 0x11, 0x00, 0x00, 0x0A, 0xBC]);
        assert_eq!(Deth::decode(&b).unwrap(), deth);
        assert!(Deth::new(0x100_0000).validate().is_err());
    }
}
