use std::fmt;

use super::icrc::{header_crc, payload_crc};
use super::*;
use crate::rdma::gid::Gid;

const GRH_AT: usize = ETH_LEN;
const BTH_AT: usize = GRH_AT + GRH_LEN;
const DETH_AT: usize = BTH_AT + BTH_LEN;

/// Collects the per-session fields of a RoCE v1 UD SEND Only packet.
#[derive(Debug, Clone)]
pub struct HeaderBuilder {
    dst_mac: MacAddr,
    src_mac: MacAddr,
    sgid: Gid,
    dgid: Gid,
    dest_qp: u32,
    src_qp: u32,
    qkey: u32,
    psn: u32,
    message_size: usize,
}

impl HeaderBuilder {
    pub fn new(message_size: usize) -> Self {
        Self {
            dst_mac: MacAddr::BROADCAST,
            src_mac: MacAddr::default(),
            sgid: Gid::default(),
            dgid: Gid::default(),
            dest_qp: 0,
            src_qp: 0,
            qkey: DEFAULT_QKEY,
            psn: 0,
            message_size,
        }
    }

    pub fn macs(mut self, dst: MacAddr, src: MacAddr) -> Self {
        self.dst_mac = dst;
        self.src_mac = src;
        self
    }

    pub fn gids(mut self, sgid: Gid, dgid: Gid) -> Self {
        self.sgid = sgid;
        self.dgid = dgid;
        self
    }

    pub fn dest_qp(mut self, qpn: u32) -> Self {
        self.dest_qp = qpn;
        self
    }

    pub fn src_qp(mut self, qpn: u32) -> Self {
        self.src_qp = qpn;
        self
    }

    pub fn qkey(mut self, qkey: u32) -> Self {
        self.qkey = qkey;
        self
    }

    pub fn psn(mut self, psn: u32) -> Self {
        self.psn = psn;
        self
    }

    /// Pack every header and precompute the header CRC.
    pub fn build(&self) -> Result<PacketTemplate, WireError> {
        if !host_byte_order_supported() {
            return Err(WireError::UnsupportedByteOrder);
        }
        let payload_length = payload_length_for(self.message_size)?;

        let mut bth = Bth::ud_send(self.dest_qp);
        bth.psn = self.psn;
        bth.validate()?;
        let deth = Deth {
            qkey: self.qkey,
            src_qp: self.src_qp,
        };
        deth.validate()?;

        let mut header = [0u8; HEADER_LEN];
        header[..GRH_AT].copy_from_slice(&EthHeader::roce(self.dst_mac, self.src_mac).to_bytes());
        header[GRH_AT..BTH_AT]
            .copy_from_slice(&Grh::new(self.sgid, self.dgid, payload_length).to_bytes());
        header[BTH_AT..DETH_AT].copy_from_slice(&bth.to_bytes());
        header[DETH_AT..].copy_from_slice(&deth.to_bytes());

        let mut tpl = PacketTemplate {
            header,
            header_crc: 0,
        };
        tpl.refresh_crc();
        Ok(tpl)
    }
}

fn payload_length_for(message_size: usize) -> Result<u16, WireError> {
    if message_size > MAX_PAYLOAD {
        return Err(WireError::FieldOverflow {
            field: "GRH payload length",
            value: (message_size + TRANSPORT_OVERHEAD) as u32,
        });
    }
    Ok((message_size + TRANSPORT_OVERHEAD) as u16)
}

/// Prebuilt headers of a RoCE v1 frame plus their CRC.
///
/// Only the payload length and destination QP change after build; both
/// recompute the header CRC.
#[derive(Clone, PartialEq, Eq)]
pub struct PacketTemplate {
    header: [u8; HEADER_LEN],
    header_crc: u32,
}

impl PacketTemplate {
    /// The packed Ethernet, GRH, BTH and DETH.
    #[inline]
    pub fn header(&self) -> &[u8; HEADER_LEN] {
        &self.header
    }

    #[inline]
    pub fn header_crc(&self) -> u32 {
        self.header_crc
    }

    /// Payload size the GRH currently declares.
    #[inline]
    pub fn message_size(&self) -> usize {
        declared_payload(&self.header[GRH_AT..BTH_AT])
    }

    /// Size of a complete frame, trailer included.
    #[inline]
    pub fn frame_len(&self) -> usize {
        HEADER_LEN + self.message_size() + ICRC_LEN
    }

    /// Retarget the template at another queue pair.
    pub fn set_dest_qp(&mut self, qpn: u32) -> Result<(), WireError> {
        if qpn > MAX_24BIT {
            return Err(WireError::FieldOverflow {
                field: "BTH destination QP",
                value: qpn,
            });
        }
        put_u24(&mut self.header[BTH_AT + 4..BTH_AT + 8], qpn);
        self.refresh_crc();
        Ok(())
    }

    /// Change the payload size carried by subsequent frames.
    pub fn set_message_size(&mut self, message_size: usize) -> Result<(), WireError> {
        let len = payload_length_for(message_size)?;
        self.header[GRH_AT + 4..GRH_AT + 6].copy_from_slice(&len.to_be_bytes());
        self.refresh_crc();
        Ok(())
    }

    fn refresh_crc(&mut self) {
        let (grh, bth, deth) = split_headers(&self.header);
        self.header_crc = header_crc(&grh, &bth, &deth);
    }

    /// Write a whole frame for `payload` into `out`, returning its length.
    pub fn write_frame(&self, payload: &[u8], out: &mut [u8]) -> Result<usize, WireError> {
        let size = self.message_size();
        if payload.len() != size {
            return Err(WireError::PayloadSize {
                expected: size,
                got: payload.len(),
            });
        }
        let total = self.frame_len();
        ensure_len(out, total)?;

        out[..HEADER_LEN].copy_from_slice(&self.header);
        out[HEADER_LEN..HEADER_LEN + size].copy_from_slice(payload);
        let crc = payload_crc(self.header_crc, &out[HEADER_LEN..HEADER_LEN + size]);
        out[HEADER_LEN + size..total].copy_from_slice(&crc.to_le_bytes());
        Ok(total)
    }

    /// Allocate and return a whole frame for `payload`.
    pub fn encode(&self, payload: &[u8]) -> Result<Vec<u8>, WireError> {
        let mut frame = vec![0u8; self.frame_len()];
        self.write_frame(payload, &mut frame)?;
        Ok(frame)
    }
}

impl fmt::Debug for PacketTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketTemplate")
            .field("message_size", &self.message_size())
            .field("header_crc", &format_args!("{:#010x}", self.header_crc))
            .finish()
    }
}

fn split_headers(header: &[u8; HEADER_LEN]) -> ([u8; GRH_LEN], [u8; BTH_LEN], [u8; DETH_LEN]) {
    let mut grh = [0u8; GRH_LEN];
    let mut bth = [0u8; BTH_LEN];
    let mut deth = [0u8; DETH_LEN];
    grh.copy_from_slice(&header[GRH_AT..BTH_AT]);
    bth.copy_from_slice(&header[BTH_AT..DETH_AT]);
    deth.copy_from_slice(&header[DETH_AT..HEADER_LEN]);
    (grh, bth, deth)
}

/// Payload size implied by the `payload_length` of an encoded GRH.
#[inline]
fn declared_payload(grh: &[u8]) -> usize {
    (u16::from_be_bytes([grh[4], grh[5]]) as usize).saturating_sub(TRANSPORT_OVERHEAD)
}

/// A decoded RoCE v1 UD SEND Only frame.
#[derive(Debug, Clone, Copy)]
pub struct RocePacket<'a> {
    pub eth: EthHeader,
    pub grh: Grh,
    pub bth: Bth,
    pub deth: Deth,
    pub payload: &'a [u8],
    /// Trailer as carried by the frame.
    pub icrc: u32,
    raw: &'a [u8; HEADER_LEN],
}

impl<'a> RocePacket<'a> {
    /// Decode and sanity-check a frame. Trailing bytes after the ICRC, such
    /// as Ethernet minimum-size padding, are ignored.
    pub fn parse(frame: &'a [u8]) -> Result<Self, WireError> {
        ensure_len(frame, HEADER_LEN + ICRC_LEN)?;
        let eth = EthHeader::decode(frame)?;
        if eth.ethertype != ROCE_ETHERTYPE {
            return Err(WireError::EtherType(eth.ethertype));
        }
        let grh = Grh::decode(&frame[GRH_AT..])?;
        if grh.ip_version != GRH_IP_VERSION {
            return Err(WireError::IpVersion(grh.ip_version));
        }
        if grh.next_header != NEXT_HEADER_IBA {
            return Err(WireError::NextHeader(grh.next_header));
        }
        if (grh.payload_length as usize) < TRANSPORT_OVERHEAD {
            return Err(WireError::PayloadLength(grh.payload_length));
        }
        let bth = Bth::decode(&frame[BTH_AT..])?;
        if bth.opcode != OPCODE_UD_SEND_ONLY {
            return Err(WireError::Opcode(bth.opcode));
        }
        let deth = Deth::decode(&frame[DETH_AT..])?;

        let size = grh.payload_length as usize - TRANSPORT_OVERHEAD;
        ensure_len(frame, HEADER_LEN + size + ICRC_LEN)?;
        let payload = &frame[HEADER_LEN..HEADER_LEN + size];
        let t = &frame[HEADER_LEN + size..HEADER_LEN + size + ICRC_LEN];
        let icrc = u32::from_le_bytes([t[0], t[1], t[2], t[3]]);

        let raw = frame[..HEADER_LEN]
            .try_into()
            .map_err(|_| WireError::Truncated {
                need: HEADER_LEN,
                got: frame.len(),
            })?;
        Ok(Self {
            eth,
            grh,
            bth,
            deth,
            payload,
            icrc,
            raw,
        })
    }

    /// Recompute the invariant CRC over the frame as received.
    pub fn computed_icrc(&self) -> u32 {
        let (grh, bth, deth) = split_headers(self.raw);
        payload_crc(header_crc(&grh, &bth, &deth), self.payload)
    }

    /// Check the trailer against the recomputed CRC.
    pub fn verify(&self) -> Result<(), WireError> {
        let computed = self.computed_icrc();
        if computed != self.icrc {
            return Err(WireError::Icrc {
                carried: self.icrc,
                computed,
            });
        }
        Ok(())
    }

    /// Total bytes this packet occupies in its frame.
    #[inline]
    pub fn frame_len(&self) -> usize {
        HEADER_LEN + self.payload.len() + ICRC_LEN
    }
}

impl fmt::Display for RocePacket<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}\n", self.grh)?;
        writeln!(f, "{}\n", self.bth)?;
        writeln!(f, "{}", self.deth)?;
        write!(f, "Payload: {} bytes, ICRC {:#010x}", self.payload.len(), self.icrc)
    }
}
