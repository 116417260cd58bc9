//! Work request descriptors.

use std::fmt;
use std::io;
use std::iter::FusedIterator;

use thiserror::Error;

use super::type_alias::*;

/// Number of scatter entries in a receive descriptor: GRH region, then payload.
pub const RECV_SGES: usize = 2;

/// A scatter/gather element.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Sge {
    pub addr: u64,
    pub length: u32,
    pub lkey: LKey,
}

/// Canned unreliable datagram addressing of a send descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdDest<A> {
    pub ah: A,
    pub remote_qpn: Qpn,
    pub remote_qkey: QKey,
}

/// Send descriptor of a UD queue pair.
#[derive(Debug, Clone, Copy)]
pub struct SendWr<A> {
    pub wr_id: WrId,
    pub sge: Sge,
    pub dest: UdDest<A>,
    /// Copy the payload into the work request at post time.
    pub inline: bool,
}

/// Receive descriptor.
#[derive(Debug, Clone, Copy)]
pub struct RecvWr {
    pub wr_id: WrId,
    pub sgl: [Sge; RECV_SGES],
}

/// A run of descriptors in a ring, visited in submission order.
///
/// This is the transient linked chain handed to a provider: it walks
/// `start, start + 1, ...` modulo the ring length and stops after `count`
/// descriptors, without touching any persistent linkage.
#[derive(Clone)]
pub struct WrChain<'a, T> {
    ring: &'a [T],
    cursor: usize,
    remaining: usize,
}

impl<'a, T> WrChain<'a, T> {
    /// A chain of `count` descriptors beginning at `start`.
    ///
    /// # Panics
    ///
    /// Panics if `start` is out of bounds or `count` exceeds the ring length.
    pub fn new(ring: &'a [T], start: usize, count: usize) -> Self {
        assert!(start < ring.len() || (ring.is_empty() && count == 0));
        assert!(count <= ring.len());
        Self {
            ring,
            cursor: start,
            remaining: count,
        }
    }

    /// Whether the chain has no descriptors left.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.remaining == 0
    }
}

impl<'a, T> Iterator for WrChain<'a, T> {
    type Item = &'a T;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let item = &self.ring[self.cursor];
        self.cursor += 1;
        if self.cursor == self.ring.len() {
            self.cursor = 0;
        }
        self.remaining -= 1;
        Some(item)
    }

    #[inline]
    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<T> ExactSizeIterator for WrChain<'_, T> {}
impl<T> FusedIterator for WrChain<'_, T> {}

impl<T> fmt::Debug for WrChain<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WrChain")
            .field("cursor", &self.cursor)
            .field("remaining", &self.remaining)
            .finish()
    }
}

/// The driver refused part of a chain.
///
/// Descriptors before the refused one were accepted and are now owned by the
/// hardware; none after it were.
#[derive(Debug, Error)]
#[error("driver accepted {posted} work requests before failing")]
pub struct Rejected {
    pub posted: usize,
    #[source]
    pub source: io::Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_wraps() {
        let ring = [0, 1, 2, 3, 4];
        let got: Vec<_> = WrChain::new(&ring, 3, 4).copied().collect();
        assert_eq!(got, vec![3, 4, 0, 1]);
        assert_eq!(WrChain::new(&ring, 0, 5).len(), 5);
        assert!(WrChain::new(&ring, 2, 0).is_empty());
        assert_eq!(WrChain::new(&ring, 4, 5).copied().collect::<Vec<_>>(), vec![4, 0, 1, 2, 3]);
    }

    #[test]
    #[should_panic]
    fn test_chain_too_long() {
        let ring = [0, 1];
        let _ = WrChain::new(&ring, 0, 3);
    }
}
