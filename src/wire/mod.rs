//! RoCE v1 wire format.
//!
//! Every header is packed and unpacked byte by byte over fixed-size arrays.
//! Nothing here relies on in-memory struct layout.
//!
//! A frame looks like:
//!
//! ```text
//! | Ethernet (14) | GRH (40) | BTH (12) | DETH (8) | payload | ICRC (4) |
//! ```

mod bth;
mod deth;
mod eth;
mod grh;
pub mod icrc;
mod packet;

use thiserror::Error;

pub use self::bth::*;
pub use self::deth::*;
pub use self::eth::*;
pub use self::grh::*;
pub use self::packet::*;

/// EtherType assigned to RoCE v1.
pub const ROCE_ETHERTYPE: u16 = 0x8915;

/// Size of the Ethernet header.
pub const ETH_LEN: usize = 14;

/// Size of the Global Routing Header.
pub const GRH_LEN: usize = 40;

/// Size of the Base Transport Header.
pub const BTH_LEN: usize = 12;

/// Size of the Datagram Extended Transport Header.
pub const DETH_LEN: usize = 8;

/// Size of the invariant CRC trailer.
pub const ICRC_LEN: usize = 4;

/// Bytes covered by the GRH `payload_length` field besides the payload itself.
pub const TRANSPORT_OVERHEAD: usize = BTH_LEN + DETH_LEN + ICRC_LEN;

/// Size of every header before the payload.
pub const HEADER_LEN: usize = ETH_LEN + GRH_LEN + BTH_LEN + DETH_LEN;

/// Largest payload whose `payload_length` still fits in 16 bits.
pub const MAX_PAYLOAD: usize = u16::MAX as usize - TRANSPORT_OVERHEAD;

/// Largest value of a 24-bit queue pair number or PSN.
pub const MAX_24BIT: u32 = 0x00FF_FFFF;

/// Whether the host byte order is one the codec is validated on.
///
/// Packing is explicit, but the ICRC trailer is stored in little-endian
/// order like the hardware it interoperates with expects from its host.
/// Big-endian hosts are refused rather than risk a silently different frame.
#[inline]
pub const fn host_byte_order_supported() -> bool {
    cfg!(target_endian = "little")
}

/// Wire format errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    /// Buffer shorter than the structure being decoded or encoded.
    #[error("buffer too short: need {need} bytes, got {got}")]
    Truncated { need: usize, got: usize },

    /// Ethernet frame does not carry RoCE v1.
    #[error("unexpected EtherType {0:#06x}")]
    EtherType(u16),

    /// GRH IP version is not 6.
    #[error("unexpected GRH IP version {0}")]
    IpVersion(u8),

    /// GRH next header is not 27 (IBA transport).
    #[error("unexpected GRH next header {0}")]
    NextHeader(u8),

    /// BTH opcode is not UD Send Only.
    #[error("unsupported BTH opcode {0:#04x}")]
    Opcode(u8),

    /// A field value does not fit in its bit width.
    #[error("{field} value {value:#x} out of range")]
    FieldOverflow { field: &'static str, value: u32 },

    /// GRH `payload_length` cannot cover the transport headers.
    #[error("GRH payload length {0} too small")]
    PayloadLength(u16),

    /// Payload supplied does not match the size the header declares.
    #[error("payload is {got} bytes but the header declares {expected}")]
    PayloadSize { expected: usize, got: usize },

    /// ICRC trailer does not match the recomputed value.
    #[error("ICRC mismatch: frame carries {carried:#010x}, computed {computed:#010x}")]
    Icrc { carried: u32, computed: u32 },

    /// Host byte order is not supported.
    #[error("big-endian hosts are not supported")]
    UnsupportedByteOrder,
}

/// Check that `buf` has at least `need` bytes.
#[inline]
pub(crate) fn ensure_len(buf: &[u8], need: usize) -> Result<(), WireError> {
    if buf.len() < need {
        Err(WireError::Truncated {
            need,
            got: buf.len(),
        })
    } else {
        Ok(())
    }
}

/// Read a big-endian 24-bit value from the last three bytes of a 4-byte word.
#[inline]
pub(crate) fn get_u24(b: &[u8]) -> u32 {
    u32::from_be_bytes([0, b[1], b[2], b[3]])
}

/// Write a big-endian 24-bit value into the last three bytes of a 4-byte word,
/// leaving the first byte untouched.
#[inline]
pub(crate) fn put_u24(b: &mut [u8], v: u32) {
    let be = v.to_be_bytes();
    b[1..4].copy_from_slice(&be[1..4]);
}
