//! Plain-Ethernet path: RoCE v1 frames over an `AF_PACKET` socket.
//!
//! Used on hosts without an RDMA-capable NIC. Frames are built with
//! [`PacketTemplate`](crate::wire::PacketTemplate) and go out as-is; the
//! receiving NIC (or another raw socket) does the transport work.

use std::ffi::CString;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use thiserror::Error;

use crate::wire::{EthHeader, MacAddr, PacketTemplate, RocePacket, WireError, ROCE_ETHERTYPE};

/// Error type of the raw Ethernet path.
#[derive(Debug, Error)]
pub enum RawError {
    /// No network interface by that name.
    #[error("interface not found: {0}")]
    InterfaceNotFound(String),

    /// Socket creation, binding or I/O failed.
    #[error("raw socket I/O error")]
    Io(#[from] io::Error),

    /// The frame is not a well-formed RoCE v1 datagram.
    #[error("malformed frame")]
    Wire(#[from] WireError),
}

/// An `AF_PACKET` socket bound to one interface, receiving only RoCE v1
/// (EtherType 0x8915) frames.
#[derive(Debug)]
pub struct RawSocket {
    fd: OwnedFd,
    ifindex: i32,
    ifname: String,
}

fn interface_index(ifname: &str) -> Result<i32, RawError> {
    let c_ifname =
        CString::new(ifname).map_err(|_| RawError::InterfaceNotFound(ifname.to_owned()))?;
    // SAFETY: FFI.
    let ifindex = unsafe { libc::if_nametoindex(c_ifname.as_ptr()) };
    if ifindex == 0 {
        return Err(RawError::InterfaceNotFound(ifname.to_owned()));
    }
    Ok(ifindex as i32)
}

fn link_addr(ifindex: i32, dst: Option<MacAddr>) -> libc::sockaddr_ll {
    // SAFETY: all-zero is a valid `sockaddr_ll`.
    let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
    addr.sll_family = libc::AF_PACKET as u16;
    addr.sll_protocol = ROCE_ETHERTYPE.to_be();
    addr.sll_ifindex = ifindex;
    if let Some(mac) = dst {
        addr.sll_halen = 6;
        addr.sll_addr[..6].copy_from_slice(&mac.0);
    }
    addr
}

impl RawSocket {
    /// Open a raw socket on `ifname`. Needs `CAP_NET_RAW`.
    pub fn open(ifname: &str) -> Result<Self, RawError> {
        let ifindex = interface_index(ifname)?;

        // SAFETY: FFI.
        let fd = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                ROCE_ETHERTYPE.to_be() as i32,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        // SAFETY: `fd` is a freshly created descriptor nobody else owns.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let addr = link_addr(ifindex, None);
        // SAFETY: FFI; `addr` is a valid `sockaddr_ll` of the given size.
        let ret = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            return Err(io::Error::last_os_error().into());
        }

        log::debug!("raw socket bound to {} (ifindex {})", ifname, ifindex);
        Ok(Self {
            fd,
            ifindex,
            ifname: ifname.to_owned(),
        })
    }

    #[inline]
    pub fn interface(&self) -> &str {
        &self.ifname
    }

    /// Send one complete Ethernet frame. The link-layer destination is taken
    /// from the frame's own header.
    pub fn send(&self, frame: &[u8]) -> Result<usize, RawError> {
        let eth = EthHeader::decode(frame)?;
        let addr = link_addr(self.ifindex, Some(eth.dst));
        // SAFETY: FFI; `frame` and `addr` are valid for the given sizes.
        let ret = unsafe {
            libc::sendto(
                self.fd.as_raw_fd(),
                frame.as_ptr().cast(),
                frame.len(),
                0,
                &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(ret as usize)
    }

    /// Encode `payload` behind `template` into `scratch` and send it.
    ///
    /// `scratch` must hold at least `template.frame_len()` bytes.
    pub fn send_with(
        &self,
        template: &PacketTemplate,
        payload: &[u8],
        scratch: &mut [u8],
    ) -> Result<usize, RawError> {
        let len = template.write_frame(payload, scratch)?;
        self.send(&scratch[..len])
    }

    /// Receive one frame into `buf`, blocking unless `nonblocking` is set.
    ///
    /// Returns `Ok(None)` if nothing is pending in non-blocking mode.
    pub fn recv(&self, buf: &mut [u8], nonblocking: bool) -> Result<Option<usize>, RawError> {
        let flags = if nonblocking { libc::MSG_DONTWAIT } else { 0 };
        // SAFETY: FFI; `buf` is valid for writes of its length.
        let ret = unsafe { libc::recv(self.fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len(), flags) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(err.into());
        }
        Ok(Some(ret as usize))
    }

    /// Receive one frame and check it is a RoCE v1 UD datagram with a valid
    /// invariant CRC.
    pub fn recv_packet<'a>(
        &self,
        buf: &'a mut [u8],
        nonblocking: bool,
    ) -> Result<Option<RocePacket<'a>>, RawError> {
        let Some(len) = self.recv(buf, nonblocking)? else {
            return Ok(None);
        };
        let packet = RocePacket::parse(&buf[..len])?;
        packet.verify()?;
        Ok(Some(packet))
    }
}

impl AsRawFd for RawSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_interface() {
        let err = RawSocket::open("udverbs-nonexistent0").unwrap_err();
        assert!(matches!(err, RawError::InterfaceNotFound(name) if name == "udverbs-nonexistent0"));

        let err = RawSocket::open("bad\0name").unwrap_err();
        assert!(matches!(err, RawError::InterfaceNotFound(_)));
    }

    #[test]
    fn test_link_addr() {
        let mac: MacAddr = "02:00:00:00:00:01".parse().unwrap();
        let addr = link_addr(7, Some(mac));
        assert_eq!(addr.sll_family, libc::AF_PACKET as u16);
        assert_eq!(u16::from_be(addr.sll_protocol), ROCE_ETHERTYPE);
        assert_eq!(addr.sll_ifindex, 7);
        assert_eq!(addr.sll_halen, 6);
        assert_eq!(&addr.sll_addr[..6], &mac.0);
    }
}
