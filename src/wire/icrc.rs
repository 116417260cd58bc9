//! Invariant CRC.
//!
//! CRC32 with the reflected IEEE 802.3 polynomial, pre- and post-inverted,
//! chainable the way zlib's `crc32(crc, buf, len)` is. The invariant CRC of
//! a RoCE v1 packet hashes, in order:
//!
//! 1. eight bytes of `0xFF` standing in for the InfiniBand LRH;
//! 2. the GRH with traffic class, flow label and hop limit set to all-ones;
//! 3. the BTH with its reserved byte set to all-ones;
//! 4. the DETH and the payload, verbatim.
//!
//! Steps 1 to 3 and the DETH only depend on per-session fields, so they are
//! hashed once into a header CRC that seeds the per-packet payload hash.

use crc32fast::Hasher;

use super::{mask_bth, mask_grh, BTH_LEN, DETH_LEN, GRH_LEN};

/// Stand-in for the local routing header, which RoCE does not carry.
const LRH_PADDING: [u8; 8] = [0xFF; 8];

/// Continue a CRC32 over `data`. `crc32(0, ..)` starts a fresh one.
#[inline]
pub fn crc32(crc: u32, data: &[u8]) -> u32 {
    let mut hasher = Hasher::new_with_initial(crc);
    hasher.update(data);
    hasher.finalize()
}

/// CRC over the masked headers and the DETH.
pub fn header_crc(grh: &[u8; GRH_LEN], bth: &[u8; BTH_LEN], deth: &[u8; DETH_LEN]) -> u32 {
    let mut grh = *grh;
    let mut bth = *bth;
    mask_grh(&mut grh);
    mask_bth(&mut bth);

    let mut hasher = Hasher::new_with_initial(0);
    hasher.update(&LRH_PADDING);
    hasher.update(&grh);
    hasher.update(&bth);
    hasher.update(deth);
    hasher.finalize()
}

/// Extend a header CRC over the payload, giving the value of the trailer.
#[inline]
pub fn payload_crc(header_crc: u32, payload: &[u8]) -> u32 {
    crc32(header_crc, payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{Bth, Deth, Grh};

    #[test]
    fn test_reference_vectors() {
        assert_eq!(crc32(0, b""), 0x0000_0000);
        assert_eq!(crc32(0, b"123456789"), 0xCBF4_3926);
        assert_eq!(crc32(crc32(0, b"1234"), b"56789"), 0xCBF4_3926);
    }

    fn headers() -> ([u8; GRH_LEN], [u8; BTH_LEN], [u8; DETH_LEN]) {
        let grh = Grh::new(
            "fe80::248a:703:9c:e4a2".parse().unwrap(),
            "fe80::248a:703:9c:e4a3".parse().unwrap(),
            1024 + 24,
        );
        (
            grh.to_bytes(),
            Bth::ud_send(0x1234).to_bytes(),
            Deth::new(0x99).to_bytes(),
        )
    }

    #[test]
    fn test_deterministic() {
        let (g, b, d) = headers();
        let payload = vec![0x5Au8; 1024];
        let first = payload_crc(header_crc(&g, &b, &d), &payload);
        let second = payload_crc(header_crc(&g, &b, &d), &payload);
        assert_eq!(first, second);
    }

    #[test]
    fn test_masked_bits_ignored() {
        let (g, b, d) = headers();
        let base = header_crc(&g, &b, &d);

        // Traffic class high nibble, traffic class low nibble with flow
        // label high nibble, flow label low bytes, hop limit.
        for (byte, mask) in [(0usize, 0x0Fu8), (1, 0xFF), (2, 0xFF), (3, 0xFF), (7, 0xFF)] {
            for bit in 0..8 {
                if mask & (1 << bit) == 0 {
                    continue;
                }
                let mut g2 = g;
                g2[byte] ^= 1 << bit;
                assert_eq!(header_crc(&g2, &b, &d), base, "GRH byte {byte} bit {bit}");
            }
        }
        for bit in 0..8 {
            let mut b2 = b;
            b2[4] ^= 1 << bit;
            assert_eq!(header_crc(&g, &b2, &d), base, "BTH reserved bit {bit}");
        }
    }

    #[test]
    fn test_unmasked_bits_detected() {
        let (g, b, d) = headers();
        let payload = [0xC3u8; 64];
        let base = payload_crc(header_crc(&g, &b, &d), &payload);

        for byte in 0..GRH_LEN {
            for bit in 0..8 {
                let masked = matches!(byte, 1..=3 | 7) || (byte == 0 && bit < 4);
                if masked {
                    continue;
                }
                let mut g2 = g;
                g2[byte] ^= 1 << bit;
                assert_ne!(payload_crc(header_crc(&g2, &b, &d), &payload), base);
            }
        }
        for byte in (0..BTH_LEN).filter(|&i| i != 4) {
            for bit in 0..8 {
                let mut b2 = b;
                b2[byte] ^= 1 << bit;
                assert_ne!(payload_crc(header_crc(&g, &b2, &d), &payload), base);
            }
        }
        for byte in 0..DETH_LEN {
            for bit in 0..8 {
                let mut d2 = d;
                d2[byte] ^= 1 << bit;
                assert_ne!(payload_crc(header_crc(&g, &b, &d2), &payload), base);
            }
        }
        for byte in 0..payload.len() {
            let mut p2 = payload;
            p2[byte] ^= 0x10;
            assert_ne!(payload_crc(header_crc(&g, &b, &d), &p2), base);
        }
    }
}
