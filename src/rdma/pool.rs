//! Registered slot buffers.

use std::alloc::{self, Layout};
use std::io;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::slice;

use super::context::{resource, ConfigError, TransportContext, TransportError};
use super::owned::Owned;
use super::perm::Permission;
use super::provider::Provider;
use super::wr::Sge;
use crate::wire::GRH_LEN;

/// Size of the per-slot region receiving the GRH.
pub const HEADER_REGION: usize = GRH_LEN;

fn page_size() -> usize {
    // SAFETY: FFI.
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz > 0 {
        sz as usize
    } else {
        4096
    }
}

/// Zeroed, page-aligned heap memory.
struct AlignedBuf {
    ptr: NonNull<u8>,
    layout: Option<Layout>,
}

impl AlignedBuf {
    fn new(len: usize) -> io::Result<Self> {
        if len == 0 {
            return Ok(Self {
                ptr: NonNull::dangling(),
                layout: None,
            });
        }
        let layout = Layout::from_size_align(len, page_size())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        // SAFETY: `layout` has a non-zero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or_else(|| io::Error::from_raw_os_error(libc::ENOMEM))?;
        Ok(Self {
            ptr,
            layout: Some(layout),
        })
    }

    #[inline]
    fn len(&self) -> usize {
        self.layout.map_or(0, |l| l.size())
    }

    #[inline]
    fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        if let Some(layout) = self.layout {
            // SAFETY: allocated in `new` with this very layout.
            unsafe { alloc::dealloc(self.ptr.as_ptr(), layout) };
        }
    }
}

/// A buffer and its registration. Deregistered before it is freed.
struct Region<P: Provider> {
    // Field order is drop order.
    mr: Option<Owned<P, P::Mr>>,
    buf: AlignedBuf,
    lkey: u32,
}

impl<P: Provider> Region<P> {
    fn new(
        ctx: &TransportContext<P>,
        len: usize,
        what: &'static str,
    ) -> Result<Self, TransportError> {
        let buf = AlignedBuf::new(len).map_err(resource("allocate slot buffer"))?;
        let provider = ctx.provider();
        // SAFETY: `buf` is owned by the region and outlives `mr`, which is
        // dropped first.
        let mr = unsafe {
            provider.reg_mr(ctx.pd(), buf.as_ptr(), buf.len(), Permission::LOCAL_WRITE)
        }
        .map_err(resource("register memory region"))?;
        let lkey = provider.lkey(&mr);
        log::debug!("registered {} bytes of {} at {:p}", len, what, buf.as_ptr());
        Ok(Self {
            mr: Some(Owned::new(provider, mr, P::dereg_mr, what)),
            buf,
            lkey,
        })
    }

    #[inline]
    fn base(&self) -> u64 {
        self.buf.as_ptr() as usize as u64
    }
}

/// Payload buffers for every slot and, on the receive side, a GRH region
/// for every slot. Each is registered once with local write access.
///
/// The pool borrows its context so that it cannot outlive the protection
/// domain its regions are registered with.
pub struct BufferPool<'c, P: Provider> {
    header: Option<Region<P>>,
    payload: Region<P>,
    depth: usize,
    message_size: usize,
    _ctx: PhantomData<&'c TransportContext<P>>,
}

impl<'c, P: Provider> BufferPool<'c, P> {
    /// Buffers for a receive ring: payload plus GRH regions.
    pub fn for_receiver(
        ctx: &'c TransportContext<P>,
        message_size: usize,
    ) -> Result<Self, TransportError> {
        Self::new(ctx, message_size, true)
    }

    /// Buffers for a send ring: payload only.
    pub fn for_sender(
        ctx: &'c TransportContext<P>,
        message_size: usize,
    ) -> Result<Self, TransportError> {
        Self::new(ctx, message_size, false)
    }

    fn new(
        ctx: &'c TransportContext<P>,
        message_size: usize,
        headers: bool,
    ) -> Result<Self, TransportError> {
        let max = ctx.max_msg_size();
        if message_size == 0 || message_size > max {
            return Err(ConfigError::InvalidMessageSize {
                size: message_size,
                max,
            }
            .into());
        }
        let depth = ctx.queue_depth();
        let payload = Region::new(ctx, depth * message_size, "payload buffer")?;
        let header = if headers {
            Some(Region::new(ctx, depth * HEADER_REGION, "header buffer")?)
        } else {
            None
        };
        Ok(Self {
            header,
            payload,
            depth,
            message_size,
            _ctx: PhantomData,
        })
    }

    #[inline]
    pub fn depth(&self) -> usize {
        self.depth
    }

    #[inline]
    pub fn message_size(&self) -> usize {
        self.message_size
    }

    #[inline]
    pub fn has_headers(&self) -> bool {
        self.header.is_some()
    }

    /// Scatter/gather element of slot `i`'s payload.
    #[inline]
    pub fn payload_sge(&self, i: usize) -> Sge {
        debug_assert!(i < self.depth);
        Sge {
            addr: self.payload.base() + (i * self.message_size) as u64,
            length: self.message_size as u32,
            lkey: self.payload.lkey,
        }
    }

    /// Scatter/gather element of slot `i`'s GRH region, if there is one.
    #[inline]
    pub fn header_sge(&self, i: usize) -> Option<Sge> {
        debug_assert!(i < self.depth);
        self.header.as_ref().map(|h| Sge {
            addr: h.base() + (i * HEADER_REGION) as u64,
            length: HEADER_REGION as u32,
            lkey: h.lkey,
        })
    }

    /// Slot `i`'s payload bytes.
    ///
    /// Callers must make sure the slot is not owned by the hardware.
    pub(crate) fn payload(&self, i: usize) -> &[u8] {
        assert!(i < self.depth);
        // SAFETY: in bounds of the payload buffer, which lives as long as `self`.
        unsafe {
            slice::from_raw_parts(
                self.payload.buf.as_ptr().add(i * self.message_size),
                self.message_size,
            )
        }
    }

    /// Mutable view of slot `i`'s payload bytes.
    pub(crate) fn payload_mut(&mut self, i: usize) -> &mut [u8] {
        assert!(i < self.depth);
        // SAFETY: as above, and `&mut self` excludes other views.
        unsafe {
            slice::from_raw_parts_mut(
                self.payload.buf.as_ptr().add(i * self.message_size),
                self.message_size,
            )
        }
    }

    /// Slot `i`'s GRH region.
    pub(crate) fn header(&self, i: usize) -> Option<&[u8]> {
        assert!(i < self.depth);
        self.header.as_ref().map(|h| {
            // SAFETY: in bounds of the header buffer.
            unsafe { slice::from_raw_parts(h.buf.as_ptr().add(i * HEADER_REGION), HEADER_REGION) }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdma::provider::{SoftDevice, SoftFabric, Verb};

    fn fabric() -> SoftFabric {
        SoftFabric::new().with_device(SoftDevice::new("soft0", 1, "fe80::1".parse().unwrap()))
    }

    #[test]
    fn test_layout() {
        let f = fabric();
        let ctx = TransportContext::open(&f, "soft0", 4).unwrap();
        {
            let pool = BufferPool::for_receiver(&ctx, 256).unwrap();
            assert_eq!(f.live().mrs, 2);
            let s0 = pool.payload_sge(0);
            let s3 = pool.payload_sge(3);
            assert_eq!(s3.addr - s0.addr, 3 * 256);
            assert_eq!(s0.addr as usize % page_size(), 0);
            assert_eq!(s0.length, 256);
            let h1 = pool.header_sge(1).unwrap();
            assert_eq!(h1.length, 40);
            assert_eq!(h1.addr - pool.header_sge(0).unwrap().addr, 40);
            assert!(pool.payload(2).iter().all(|&b| b == 0));

            let tx = BufferPool::for_sender(&ctx, 256).unwrap();
            assert!(tx.header_sge(0).is_none());
            assert_eq!(f.live().mrs, 3);
        }
        assert_eq!(f.live().mrs, 0);
        ctx.close().unwrap();
    }

    #[test]
    fn test_message_size_bounds() {
        let f = fabric();
        let ctx = TransportContext::open(&f, "soft0", 4).unwrap();
        assert!(matches!(
            BufferPool::for_sender(&ctx, 2048),
            Err(TransportError::Config(ConfigError::InvalidMessageSize { size: 2048, max: 1024 }))
        ));
        assert!(BufferPool::for_sender(&ctx, 0).is_err());
        assert_eq!(f.live().mrs, 0);
    }

    #[test]
    fn test_registration_failure_frees_payload() {
        let f = fabric();
        let ctx = TransportContext::open(&f, "soft0", 4).unwrap();
        // Payload registers, the header region does not.
        f.fail_nth(Verb::RegMr, 1, libc::ENOMEM);
        assert!(matches!(
            BufferPool::for_receiver(&ctx, 64),
            Err(TransportError::Resource { .. })
        ));
        assert_eq!(f.live().mrs, 0);
        ctx.close().unwrap();
    }
}
