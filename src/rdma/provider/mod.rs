//! The verbs a UD transport needs, behind one trait.
//!
//! [`Verbs`] drives real hardware through libibverbs (feature `ibverbs`).
//! [`SoftFabric`] is an in-process RoCE v1 fabric that speaks the same wire
//! format, used when no RDMA device is around.

mod soft;
mod wc;

#[cfg(feature = "ibverbs")]
mod ibv;

use std::io;

#[cfg(feature = "ibverbs")]
pub use self::ibv::*;
pub use self::soft::*;
pub use self::wc::*;
use super::gid::Gid;
use super::perm::Permission;
use super::type_alias::*;
use super::wr::{RecvWr, Rejected, SendWr, WrChain};

/// Path MTU, numbered like `enum ibv_mtu`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Mtu {
    Mtu256 = 1,
    Mtu512 = 2,
    Mtu1024 = 3,
    Mtu2048 = 4,
    Mtu4096 = 5,
}

impl Mtu {
    /// Decode an `enum ibv_mtu` value.
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Mtu::Mtu256),
            2 => Some(Mtu::Mtu512),
            3 => Some(Mtu::Mtu1024),
            4 => Some(Mtu::Mtu2048),
            5 => Some(Mtu::Mtu4096),
            _ => None,
        }
    }

    /// Largest message a UD send may carry on this MTU.
    #[inline]
    pub fn bytes(self) -> usize {
        1 << (self as u8 as usize + 7)
    }
}

/// The port attributes the transport cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortAttr {
    pub active: bool,
    pub active_mtu: Mtu,
    pub lid: Lid,
}

/// Queue pair capabilities, requested at creation and reported back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpCaps {
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub max_send_sge: u32,
    pub max_recv_sge: u32,
    pub max_inline_data: u32,
}

/// Attributes of an address handle toward a remote UD queue pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AhAttr {
    pub dlid: Lid,
    pub dgid: Gid,
    pub sgid_index: GidIndex,
    pub hop_limit: u8,
    pub port_num: PortNum,
}

/// One step of the UD queue pair state machine with its attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QpModify {
    /// RESET to INIT.
    Init {
        pkey_index: PkeyIndex,
        port_num: PortNum,
        qkey: QKey,
    },
    /// INIT to RTR.
    Rtr,
    /// RTR to RTS.
    Rts { sq_psn: Psn },
}

impl QpModify {
    /// State the queue pair is in after this step.
    pub fn target(&self) -> super::state::QpState {
        use super::state::QpState;
        match self {
            QpModify::Init { .. } => QpState::Init,
            QpModify::Rtr => QpState::Rtr,
            QpModify::Rts { .. } => QpState::Rts,
        }
    }
}

/// Verbs needed to run an unreliable datagram session.
///
/// Handles are plain values; their lifetime is managed by the caller, who
/// must release each exactly once through the matching `destroy_*`,
/// `dealloc_pd`, `dereg_mr` or `close_device` call, dependents first.
pub trait Provider: Clone {
    type Context;
    type Pd;
    type Cq;
    type Qp;
    type Mr;
    type Ah: Copy;

    /// Names of every device this provider can open.
    fn device_names(&self) -> io::Result<Vec<String>>;

    fn open_device(&self, name: &str) -> io::Result<Self::Context>;
    fn close_device(&self, ctx: Self::Context) -> io::Result<()>;

    fn query_port(&self, ctx: &Self::Context, port: PortNum) -> io::Result<PortAttr>;
    fn query_gid(&self, ctx: &Self::Context, port: PortNum, index: GidIndex) -> io::Result<Gid>;

    fn alloc_pd(&self, ctx: &Self::Context) -> io::Result<Self::Pd>;
    fn dealloc_pd(&self, pd: Self::Pd) -> io::Result<()>;

    fn create_cq(&self, ctx: &Self::Context, cqe: u32) -> io::Result<Self::Cq>;
    fn destroy_cq(&self, cq: Self::Cq) -> io::Result<()>;

    /// Create a UD queue pair whose send and receive completions both go to
    /// `cq`. Returns the queue pair with the capabilities actually granted.
    fn create_ud_qp(
        &self,
        pd: &Self::Pd,
        cq: &Self::Cq,
        caps: &QpCaps,
    ) -> io::Result<(Self::Qp, QpCaps)>;
    fn destroy_qp(&self, qp: Self::Qp) -> io::Result<()>;
    fn qp_num(&self, qp: &Self::Qp) -> Qpn;
    fn modify_qp(&self, qp: &Self::Qp, step: &QpModify) -> io::Result<()>;

    fn create_ah(&self, pd: &Self::Pd, attr: &AhAttr) -> io::Result<Self::Ah>;
    fn destroy_ah(&self, ah: Self::Ah) -> io::Result<()>;

    /// Register `len` bytes at `addr`.
    ///
    /// # Safety
    ///
    /// The memory must stay valid and must not move until the region is
    /// deregistered.
    unsafe fn reg_mr(
        &self,
        pd: &Self::Pd,
        addr: *mut u8,
        len: usize,
        perm: Permission,
    ) -> io::Result<Self::Mr>;
    fn dereg_mr(&self, mr: Self::Mr) -> io::Result<()>;
    fn lkey(&self, mr: &Self::Mr) -> LKey;

    /// Submit a chain of send descriptors. On failure, reports how many were
    /// accepted before the first refused one.
    fn post_send(&self, qp: &Self::Qp, chain: WrChain<'_, SendWr<Self::Ah>>)
        -> Result<(), Rejected>;

    /// Submit a chain of receive descriptors, same contract as `post_send`.
    fn post_recv(&self, qp: &Self::Qp, chain: WrChain<'_, RecvWr>) -> Result<(), Rejected>;

    /// Non-blockingly poll up to `wc.len()` completions into `wc`.
    fn poll_cq(&self, cq: &Self::Cq, wc: &mut [Wc]) -> io::Result<usize>;
}
