//! Completion polling.

use std::io;

use thiserror::Error;

use super::context::TransportContext;
use super::provider::{Provider, Wc, WcOpcode, WcStatus};
use super::ring::RequestRing;
use super::type_alias::*;
use crate::wire::GRH_LEN;

/// Completion failure. Every variant ends the session.
#[derive(Debug, Error)]
pub enum CompletionError {
    /// A request completed with a non-success status.
    #[error("slot {slot} completed with status: {status}")]
    Status { slot: usize, status: WcStatus },

    /// A completion names a slot that is not posted.
    #[error("completion for unknown work request {0}")]
    UnknownSlot(WrId),

    /// A successful completion of the other direction.
    #[error("{opcode:?} completion for work request {wr_id} on a {ring} ring")]
    WrongDirection {
        wr_id: WrId,
        opcode: WcOpcode,
        ring: &'static str,
    },

    /// Polling itself failed.
    #[error("cannot poll CQ")]
    Poll(#[source] io::Error),
}

/// A successful completion, mapped back to its ring slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub slot: usize,
    /// Bytes transferred. For receives this includes the GRH.
    pub byte_len: u32,
    pub opcode: WcOpcode,
    /// Sender QPN, for receives.
    pub src_qp: Qpn,
}

impl Completion {
    /// Payload bytes carried by a receive completion.
    #[inline]
    pub fn payload_len(&self) -> usize {
        match self.opcode {
            WcOpcode::Recv => (self.byte_len as usize).saturating_sub(GRH_LEN),
            _ => self.byte_len as usize,
        }
    }
}

/// Drains the completion queue of a context into ring slots.
///
/// Buffers are sized once, so polling never allocates.
pub struct CompletionReaper<'c, P: Provider> {
    ctx: &'c TransportContext<P>,
    wc: Vec<Wc>,
    done: Vec<Completion>,
}

impl<'c, P: Provider> CompletionReaper<'c, P> {
    /// A reaper taking at most `batch` completions per poll.
    pub fn new(ctx: &'c TransportContext<P>, batch: usize) -> Self {
        let batch = batch.max(1);
        Self {
            ctx,
            wc: vec![Wc::default(); batch],
            done: Vec::with_capacity(batch),
        }
    }

    #[inline]
    pub fn batch(&self) -> usize {
        self.wc.len()
    }

    /// Poll up to `max` completions without blocking and hand their slots
    /// back to the application.
    ///
    /// Returns an empty slice when nothing is ready. A completion with an
    /// error status retires its slot for good and fails the whole poll;
    /// successful completions earlier in the same batch are still handed
    /// back to the application.
    pub fn poll(
        &mut self,
        ring: &mut RequestRing<'_, P>,
        max: usize,
    ) -> Result<&[Completion], CompletionError> {
        debug_assert!(std::ptr::eq(ring.context(), self.ctx));
        self.done.clear();
        let max = max.min(self.wc.len());
        let n = self
            .ctx
            .provider()
            .poll_cq(self.ctx.cq(), &mut self.wc[..max])
            .map_err(CompletionError::Poll)?;

        let (expected, kind) = if ring.is_sender() {
            (WcOpcode::Send, "send")
        } else {
            (WcOpcode::Recv, "receive")
        };
        for wc in &self.wc[..n] {
            let slot = wc.wr_id as usize;
            if !wc.status.is_success() {
                if !ring.fault(slot) {
                    return Err(CompletionError::UnknownSlot(wc.wr_id));
                }
                log::error!("slot {} failed: {} ({:?})", slot, wc.status, wc);
                return Err(CompletionError::Status {
                    slot,
                    status: wc.status,
                });
            }
            // Only successful completions carry a meaningful opcode.
            if wc.opcode != expected {
                return Err(CompletionError::WrongDirection {
                    wr_id: wc.wr_id,
                    opcode: wc.opcode,
                    ring: kind,
                });
            }
            if !ring.complete(slot) {
                return Err(CompletionError::UnknownSlot(wc.wr_id));
            }
            self.done.push(Completion {
                slot,
                byte_len: wc.byte_len,
                opcode: wc.opcode,
                src_qp: wc.src_qp,
            });
        }
        Ok(&self.done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdma::provider::{SoftDevice, SoftFabric, Verb};
    use crate::rdma::ring::{PostError, SlotOwner};

    fn fabric() -> SoftFabric {
        SoftFabric::new().with_device(SoftDevice::new("soft0", 1, "fe80::1".parse().unwrap()))
    }

    #[test]
    fn test_empty_poll() {
        let f = fabric();
        let ctx = TransportContext::open(&f, "soft0", 4).unwrap();
        let mut ring = RequestRing::receiver(&ctx, 64).unwrap();
        let mut reaper = CompletionReaper::new(&ctx, 4);
        ring.post_all().unwrap();
        assert!(reaper.poll(&mut ring, 4).unwrap().is_empty());
        assert_eq!(ring.outstanding(), 4);
    }

    #[test]
    fn test_send_completions() {
        let f = fabric();
        let rx = TransportContext::open(&f, "soft0", 4).unwrap();
        let tx = TransportContext::open_sender(&f, "soft0", 4, &rx.endpoint()).unwrap();
        let mut ring = RequestRing::sender(&tx, 32).unwrap();
        let mut reaper = CompletionReaper::new(&tx, 8);

        ring.post(2, 3).unwrap();
        let done = reaper.poll(&mut ring, 8).unwrap();
        let slots: Vec<_> = done.iter().map(|c| c.slot).collect();
        assert_eq!(slots, vec![2, 3, 0]);
        assert!(done.iter().all(|c| c.opcode == WcOpcode::Send && c.byte_len == 32));
        assert_eq!(ring.outstanding(), 0);
    }

    #[test]
    fn test_error_completion_retires_slot() {
        let f = fabric();
        let rx = TransportContext::open(&f, "soft0", 4).unwrap();
        let tx = TransportContext::open_sender(&f, "soft0", 4, &rx.endpoint()).unwrap();
        let mut ring = RequestRing::sender(&tx, 32).unwrap();
        let mut reaper = CompletionReaper::new(&tx, 4);

        f.fail_next_completion(WcStatus::LocProtErr);
        ring.post(0, 1).unwrap();
        let err = reaper.poll(&mut ring, 4).unwrap_err();
        assert!(matches!(
            err,
            CompletionError::Status {
                slot: 0,
                status: WcStatus::LocProtErr
            }
        ));
        assert_eq!(ring.owner(0), SlotOwner::Faulted);
        assert!(matches!(ring.repost([0]), Err(PostError::SlotFaulted(0))));
        assert_eq!(ring.outstanding() + ring.available(), 3);
    }

    #[test]
    fn test_foreign_completion_keeps_slot() {
        let f = fabric();
        let rx = TransportContext::open(&f, "soft0", 4).unwrap();
        let tx = TransportContext::open_sender(&f, "soft0", 4, &rx.endpoint()).unwrap();
        let mut sends = RequestRing::sender(&tx, 64).unwrap();
        sends.post(0, 1).unwrap();
        drop(sends);

        // A receive ring on the same context sees the send completion left
        // on the queue and must not hand out its own slot 0.
        let mut recvs = RequestRing::receiver(&tx, 64).unwrap();
        recvs.post_all().unwrap();
        let mut reaper = CompletionReaper::new(&tx, 4);
        let err = reaper.poll(&mut recvs, 4).unwrap_err();
        assert!(matches!(
            err,
            CompletionError::WrongDirection {
                wr_id: 0,
                opcode: WcOpcode::Send,
                ..
            }
        ));
        assert_eq!(recvs.owner(0), SlotOwner::Hardware);
        assert_eq!(recvs.outstanding(), 4);
    }

    #[test]
    fn test_poll_failure() {
        let f = fabric();
        let ctx = TransportContext::open(&f, "soft0", 2).unwrap();
        let mut ring = RequestRing::receiver(&ctx, 64).unwrap();
        let mut reaper = CompletionReaper::new(&ctx, 2);
        f.fail_next(Verb::PollCq, libc::EIO);
        assert!(matches!(
            reaper.poll(&mut ring, 2),
            Err(CompletionError::Poll(_))
        ));
    }
}
