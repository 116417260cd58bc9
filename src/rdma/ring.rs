//! Circular work request ring.

use std::io;

use thiserror::Error;

use super::context::{ConfigError, TransportContext, TransportError};
use super::pool::BufferPool;
use super::provider::Provider;
use super::wr::*;
use crate::wire::DEFAULT_QKEY;

/// Who currently owns a ring slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotOwner {
    /// Between completion and repost; buffers may be touched.
    Application,
    /// Posted and not yet completed.
    Hardware,
    /// Completed with an error; never reposted.
    Faulted,
}

/// Posting failure.
#[derive(Debug, Error)]
pub enum PostError {
    /// Slot is already posted.
    #[error("slot {0} is owned by the hardware")]
    SlotBusy(usize),

    /// Slot completed with an error earlier.
    #[error("slot {0} has faulted")]
    SlotFaulted(usize),

    #[error("slot {slot} out of range for a ring of {depth}")]
    OutOfRange { slot: usize, depth: usize },

    #[error("cannot post {count} requests on a ring of {depth}")]
    TooMany { count: usize, depth: usize },

    /// The driver took only the first `posted` requests of the chain.
    #[error("driver accepted {posted} of {requested} work requests")]
    Rejected {
        posted: usize,
        requested: usize,
        #[source]
        source: io::Error,
    },
}

enum Descs<A> {
    Send(Vec<SendWr<A>>),
    Recv(Vec<RecvWr>),
}

/// A fixed ring of `queue_depth` send or receive descriptors over a
/// [`BufferPool`].
///
/// Slot `i` always carries work request id `i` and is logically followed by
/// slot `(i + 1) % N`. Submitting a run builds a transient chain over the
/// slots; the descriptors themselves are never relinked.
pub struct RequestRing<'c, P: Provider> {
    ctx: &'c TransportContext<P>,
    pool: BufferPool<'c, P>,
    descs: Descs<P::Ah>,
    owner: Vec<SlotOwner>,
    outstanding: usize,
    faulted: usize,
}

impl<'c, P: Provider> RequestRing<'c, P> {
    /// Receive ring. Slot `i` scatters the GRH into its header region and
    /// the payload into its payload buffer.
    ///
    /// A context serves one ring at a time: both directions complete on the
    /// same completion queue.
    pub fn receiver(ctx: &'c TransportContext<P>, message_size: usize) -> Result<Self, TransportError> {
        ctx.attach_ring()?;
        let pool = BufferPool::for_receiver(ctx, message_size).inspect_err(|_| ctx.detach_ring())?;
        let descs = (0..pool.depth())
            .map(|i| RecvWr {
                wr_id: i as u64,
                sgl: [pool.header_sge(i).unwrap_or_default(), pool.payload_sge(i)],
            })
            .collect();
        Ok(Self::with_descs(ctx, pool, Descs::Recv(descs)))
    }

    /// Send ring toward the context's peer.
    pub fn sender(ctx: &'c TransportContext<P>, message_size: usize) -> Result<Self, TransportError> {
        let (Some(ah), Some(peer)) = (ctx.ah(), ctx.remote()) else {
            return Err(ConfigError::NotASender.into());
        };
        ctx.attach_ring()?;
        let pool = BufferPool::for_sender(ctx, message_size).inspect_err(|_| ctx.detach_ring())?;
        let dest = UdDest {
            ah,
            remote_qpn: peer.qpn,
            remote_qkey: DEFAULT_QKEY,
        };
        let inline = ctx.inline_ok(message_size);
        if inline {
            log::debug!("posting {}-byte messages inline", message_size);
        }
        let descs = (0..pool.depth())
            .map(|i| SendWr {
                wr_id: i as u64,
                sge: pool.payload_sge(i),
                dest,
                inline,
            })
            .collect();
        Ok(Self::with_descs(ctx, pool, Descs::Send(descs)))
    }

    fn with_descs(ctx: &'c TransportContext<P>, pool: BufferPool<'c, P>, descs: Descs<P::Ah>) -> Self {
        let depth = pool.depth();
        Self {
            ctx,
            pool,
            descs,
            owner: vec![SlotOwner::Application; depth],
            outstanding: 0,
            faulted: 0,
        }
    }

    /// Number of slots.
    #[inline]
    pub fn depth(&self) -> usize {
        self.owner.len()
    }

    #[inline]
    pub fn message_size(&self) -> usize {
        self.pool.message_size()
    }

    #[inline]
    pub fn is_sender(&self) -> bool {
        matches!(self.descs, Descs::Send(_))
    }

    /// Slot that follows `slot` in a chain.
    #[inline]
    pub fn next_slot(&self, slot: usize) -> usize {
        (slot + 1) % self.depth()
    }

    /// Requests currently owned by the hardware.
    #[inline]
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Slots owned by the application and ready to be (re)posted.
    #[inline]
    pub fn available(&self) -> usize {
        self.depth() - self.outstanding - self.faulted
    }

    #[inline]
    pub fn owner(&self, slot: usize) -> SlotOwner {
        self.owner[slot]
    }

    /// Scatter/gather list of `slot`: one element for sends, header then
    /// payload for receives.
    pub fn sgl(&self, slot: usize) -> &[Sge] {
        match &self.descs {
            Descs::Send(d) => std::slice::from_ref(&d[slot].sge),
            Descs::Recv(d) => &d[slot].sgl,
        }
    }

    /// Payload of an application-owned slot.
    pub fn payload(&self, slot: usize) -> Option<&[u8]> {
        self.app_owned(slot).then(|| self.pool.payload(slot))
    }

    /// Writable payload of an application-owned slot.
    pub fn payload_mut(&mut self, slot: usize) -> Option<&mut [u8]> {
        if self.app_owned(slot) {
            Some(self.pool.payload_mut(slot))
        } else {
            None
        }
    }

    /// GRH delivered into an application-owned receive slot.
    pub fn header(&self, slot: usize) -> Option<&[u8]> {
        if self.app_owned(slot) {
            self.pool.header(slot)
        } else {
            None
        }
    }

    #[inline]
    fn app_owned(&self, slot: usize) -> bool {
        self.owner.get(slot) == Some(&SlotOwner::Application)
    }

    /// Post every slot, starting from 0.
    pub fn post_all(&mut self) -> Result<(), PostError> {
        self.post(0, self.depth())
    }

    /// Submit `count` consecutive slots beginning at `start` as one chain,
    /// wrapping around the end of the ring.
    ///
    /// All slots must be application-owned. If the driver refuses part of the
    /// chain, the accepted prefix stays posted and the error says how long it
    /// is; nothing is retried.
    pub fn post(&mut self, start: usize, count: usize) -> Result<(), PostError> {
        let depth = self.depth();
        if start >= depth {
            return Err(PostError::OutOfRange { slot: start, depth });
        }
        if count > depth {
            return Err(PostError::TooMany { count, depth });
        }
        for k in 0..count {
            let slot = (start + k) % depth;
            match self.owner[slot] {
                SlotOwner::Application => {}
                SlotOwner::Hardware => return Err(PostError::SlotBusy(slot)),
                SlotOwner::Faulted => return Err(PostError::SlotFaulted(slot)),
            }
        }
        if count == 0 {
            return Ok(());
        }

        let provider = self.ctx.provider();
        let qp = self.ctx.qp();
        let ret = match &self.descs {
            Descs::Send(d) => provider.post_send(qp, WrChain::new(d, start, count)),
            Descs::Recv(d) => provider.post_recv(qp, WrChain::new(d, start, count)),
        };
        let posted = match &ret {
            Ok(()) => count,
            Err(e) => e.posted.min(count),
        };
        for k in 0..posted {
            self.owner[(start + k) % depth] = SlotOwner::Hardware;
        }
        self.outstanding += posted;

        ret.map_err(|Rejected { source, .. }| {
            log::warn!("short post: {} of {} from slot {}: {}", posted, count, start, source);
            PostError::Rejected {
                posted,
                requested: count,
                source,
            }
        })
    }

    /// Repost exactly the given slots, coalescing runs of consecutive slots
    /// into single chains. Returns how many were posted.
    pub fn repost<I>(&mut self, slots: I) -> Result<usize, PostError>
    where
        I: IntoIterator<Item = usize>,
    {
        let mut total = 0;
        let mut run: Option<(usize, usize)> = None;
        for slot in slots {
            run = match run {
                Some((start, len)) if (start + len) % self.depth() == slot && len < self.depth() => {
                    Some((start, len + 1))
                }
                Some((start, len)) => {
                    self.post(start, len)?;
                    total += len;
                    Some((slot, 1))
                }
                None => Some((slot, 1)),
            };
        }
        if let Some((start, len)) = run {
            self.post(start, len)?;
            total += len;
        }
        Ok(total)
    }

    /// Hand a completed slot back to the application.
    pub(crate) fn complete(&mut self, slot: usize) -> bool {
        if self.owner.get(slot) != Some(&SlotOwner::Hardware) {
            return false;
        }
        self.owner[slot] = SlotOwner::Application;
        self.outstanding -= 1;
        true
    }

    /// Retire a slot whose request completed with an error.
    pub(crate) fn fault(&mut self, slot: usize) -> bool {
        if self.owner.get(slot) != Some(&SlotOwner::Hardware) {
            return false;
        }
        self.owner[slot] = SlotOwner::Faulted;
        self.outstanding -= 1;
        self.faulted += 1;
        true
    }

    #[inline]
    pub(crate) fn context(&self) -> &'c TransportContext<P> {
        self.ctx
    }
}

impl<P: Provider> Drop for RequestRing<'_, P> {
    fn drop(&mut self) {
        self.ctx.detach_ring();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdma::provider::{SoftDevice, SoftFabric, Verb};

    fn fabric() -> SoftFabric {
        SoftFabric::new().with_device(SoftDevice::new("soft0", 1, "fe80::1".parse().unwrap()))
    }

    fn snapshot<P: Provider>(ring: &RequestRing<'_, P>) -> Vec<(usize, Vec<Sge>)> {
        (0..ring.depth())
            .map(|i| (ring.next_slot(i), ring.sgl(i).to_vec()))
            .collect()
    }

    #[test]
    fn test_post_any_run() {
        let f = fabric();
        for n in 1..=6 {
            for start in 0..n {
                for count in 0..=n {
                    // Fresh context and ring so that every slot starts idle.
                    let ctx = TransportContext::open(&f, "soft0", n).unwrap();
                    {
                        let mut ring = RequestRing::receiver(&ctx, 64).unwrap();
                        let before = snapshot(&ring);
                        ring.post(start, count).unwrap();

                        assert_eq!(ring.outstanding(), count);
                        assert_eq!(ring.outstanding() + ring.available(), n);
                        for k in 0..n {
                            let posted = (k + n - start) % n < count;
                            let want = if posted {
                                SlotOwner::Hardware
                            } else {
                                SlotOwner::Application
                            };
                            assert_eq!(ring.owner(k), want, "n={n} start={start} count={count} slot={k}");
                        }
                        assert_eq!(snapshot(&ring), before);
                    }
                    ctx.close().unwrap();
                }
            }
        }
        assert!(f.live().is_empty());
    }

    #[test]
    fn test_descriptor_layout() {
        let f = fabric();
        let rx = TransportContext::open(&f, "soft0", 3).unwrap();
        let ring = RequestRing::receiver(&rx, 100).unwrap();
        let sgl = ring.sgl(2);
        assert_eq!(sgl.len(), 2);
        assert_eq!(sgl[0].length, 40);
        assert_eq!(sgl[1].length, 100);
        assert!(!ring.is_sender());
        assert!(matches!(
            RequestRing::sender(&rx, 100),
            Err(TransportError::Config(ConfigError::NotASender))
        ));

        let tx = TransportContext::open_sender(&f, "soft0", 3, &rx.endpoint()).unwrap();
        let ring = RequestRing::sender(&tx, 100).unwrap();
        assert_eq!(ring.sgl(1).len(), 1);
        assert!(ring.is_sender());
    }

    #[test]
    fn test_one_ring_per_context() {
        let f = fabric();
        let rx = TransportContext::open(&f, "soft0", 4).unwrap();
        let tx = TransportContext::open_sender(&f, "soft0", 4, &rx.endpoint()).unwrap();

        let sends = RequestRing::sender(&tx, 64).unwrap();
        assert!(matches!(
            RequestRing::receiver(&tx, 64),
            Err(TransportError::Config(ConfigError::RingAttached))
        ));
        assert!(matches!(
            RequestRing::sender(&tx, 64),
            Err(TransportError::Config(ConfigError::RingAttached))
        ));
        // The refused rings registered nothing.
        assert_eq!(f.live().mrs, 1);

        drop(sends);
        let recvs = RequestRing::receiver(&tx, 64).unwrap();
        assert!(!recvs.is_sender());
    }

    #[test]
    fn test_failed_pool_releases_context() {
        let f = fabric();
        let ctx = TransportContext::open(&f, "soft0", 4).unwrap();
        f.fail_next(Verb::RegMr, libc::ENOMEM);
        assert!(matches!(
            RequestRing::receiver(&ctx, 64),
            Err(TransportError::Resource { .. })
        ));
        RequestRing::receiver(&ctx, 64).unwrap();
    }

    #[test]
    fn test_refuses_owned_slots() {
        let f = fabric();
        let ctx = TransportContext::open(&f, "soft0", 4).unwrap();
        let mut ring = RequestRing::receiver(&ctx, 64).unwrap();
        ring.post(1, 2).unwrap();
        assert!(matches!(ring.post(0, 2), Err(PostError::SlotBusy(1))));
        assert!(matches!(ring.post(4, 1), Err(PostError::OutOfRange { slot: 4, depth: 4 })));
        assert!(matches!(ring.post(0, 5), Err(PostError::TooMany { count: 5, depth: 4 })));
        assert!(ring.payload(1).is_none());
        assert!(ring.payload(0).is_some());
        assert_eq!(ring.outstanding(), 2);
    }

    #[test]
    fn test_short_post() {
        let f = fabric();
        let ctx = TransportContext::open(&f, "soft0", 6).unwrap();
        let mut ring = RequestRing::receiver(&ctx, 64).unwrap();
        f.fail_nth(Verb::PostRecv, 3, libc::ENOMEM);

        let err = ring.post(4, 5).unwrap_err();
        match err {
            PostError::Rejected {
                posted, requested, ..
            } => assert_eq!((posted, requested), (3, 5)),
            other => panic!("unexpected {other}"),
        }
        // Slots 4, 5, 0 went through; 1 and 2 are still ours to retry.
        assert_eq!(ring.outstanding(), 3);
        assert_eq!(ring.owner(0), SlotOwner::Hardware);
        assert_eq!(ring.owner(1), SlotOwner::Application);
        ring.post(1, 2).unwrap();
        assert_eq!(ring.outstanding(), 5);
    }

    #[test]
    fn test_repost_coalesces_runs() {
        let f = fabric();
        let ctx = TransportContext::open(&f, "soft0", 5).unwrap();
        let mut ring = RequestRing::receiver(&ctx, 64).unwrap();
        assert_eq!(ring.repost([3, 4, 0, 2]).unwrap(), 4);
        assert_eq!(ring.owner(1), SlotOwner::Application);
        assert_eq!(ring.outstanding(), 4);
        assert!(matches!(ring.repost([1, 2]), Err(PostError::SlotBusy(2))));
    }
}
