//! Device, protection domain, completion queue and queue pair of one session.

use std::cell::Cell;
use std::fmt;
use std::io;
use std::mem;

use thiserror::Error;

use super::endpoint::{QpEndpoint, MAX_QPN};
use super::gid::Gid;
use super::owned::Owned;
use super::provider::*;
use super::state::QpState;
use super::type_alias::*;
use crate::wire::{self, DEFAULT_QKEY};

/// Port every context binds to.
pub const PORT_NUM: PortNum = 1;

/// GID table entry used as the source GID.
pub const GID_INDEX: GidIndex = 0;

/// Default P_Key table entry.
pub const PKEY_INDEX: PkeyIndex = 0;

/// Extra completion queue entries beyond the queue depth.
pub const CQ_HEADROOM: u32 = 1;

/// Largest queue depth a context accepts.
pub const MAX_QUEUE_DEPTH: usize = 1 << 16;

/// Hop limit of the address handle toward the peer.
pub const AH_HOP_LIMIT: u8 = 1;

/// Setup refused because of what was asked, not because of the hardware.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("RDMA device {0:?} not found")]
    DeviceNotFound(String),

    #[error("big-endian hosts are not supported")]
    UnsupportedByteOrder,

    #[error("invalid QP state transition {from} -> {to}")]
    InvalidTransition { from: QpState, to: QpState },

    #[error("queue depth must be in 1..={max}, got {got}")]
    InvalidQueueDepth { got: usize, max: usize },

    #[error("context is not connected to a peer")]
    NotASender,

    #[error("QPN {0:#x} does not fit in 24 bits")]
    InvalidQpn(Qpn),

    #[error("message size must be in 1..={max}, got {size}")]
    InvalidMessageSize { size: usize, max: usize },

    /// The completion queue is shared by both directions, so a context
    /// serves a single ring.
    #[error("context already has a request ring")]
    RingAttached,

    #[error("port {0} is not active")]
    PortDown(PortNum),
}

/// Transport setup or teardown failure.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A resource could not be acquired.
    #[error("cannot {what}")]
    Resource {
        what: &'static str,
        #[source]
        source: io::Error,
    },

    /// A resource could not be released; teardown stopped there.
    #[error("cannot release {what}")]
    Teardown {
        what: &'static str,
        #[source]
        source: io::Error,
    },
}

/// Tag an I/O error with the step that produced it.
pub(crate) fn resource(what: &'static str) -> impl FnOnce(io::Error) -> TransportError {
    move |source| TransportError::Resource { what, source }
}

/// Everything one side of a UD session allocates on a device.
///
/// Resources are released in reverse acquisition order, either by
/// [`TransportContext::close`] or on drop. If `open` fails halfway, whatever
/// was acquired so far is released the same way.
pub struct TransportContext<P: Provider> {
    // Field order is drop order.
    ah: Option<Owned<P, P::Ah>>,
    qp: Owned<P, P::Qp>,
    cq: Owned<P, P::Cq>,
    pd: Owned<P, P::Pd>,
    ctx: Owned<P, P::Context>,

    provider: P,
    device: String,
    port: PortAttr,
    gid: Gid,
    qpn: Qpn,
    caps: QpCaps,
    state: QpState,
    queue_depth: usize,
    remote: Option<QpEndpoint>,
    ring_attached: Cell<bool>,
}

impl<P: Provider> fmt::Debug for TransportContext<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportContext")
            .field("device", &self.device)
            .field("port", &self.port)
            .field("gid", &self.gid)
            .field("qpn", &self.qpn)
            .field("caps", &self.caps)
            .field("state", &self.state)
            .field("queue_depth", &self.queue_depth)
            .field("remote", &self.remote)
            .field("ring_attached", &self.ring_attached)
            .finish_non_exhaustive()
    }
}

impl<P: Provider> TransportContext<P> {
    /// Open `device` and bring a UD queue pair of `queue_depth` entries to RTR.
    pub fn open(provider: &P, device: &str, queue_depth: usize) -> Result<Self, TransportError> {
        if !wire::host_byte_order_supported() {
            return Err(ConfigError::UnsupportedByteOrder.into());
        }
        if queue_depth == 0 || queue_depth > MAX_QUEUE_DEPTH {
            return Err(ConfigError::InvalidQueueDepth {
                got: queue_depth,
                max: MAX_QUEUE_DEPTH,
            }
            .into());
        }

        let names = provider
            .device_names()
            .map_err(resource("enumerate RDMA devices"))?;
        if !names.iter().any(|n| n == device) {
            return Err(ConfigError::DeviceNotFound(device.to_owned()).into());
        }

        let ctx = provider
            .open_device(device)
            .map_err(resource("open device"))?;
        let ctx = Owned::new(provider, ctx, P::close_device, "device context");

        let port = provider
            .query_port(&ctx, PORT_NUM)
            .map_err(resource("query port"))?;
        if !port.active {
            log::error!("{} port {} is down", device, PORT_NUM);
            return Err(ConfigError::PortDown(PORT_NUM).into());
        }
        let gid = provider
            .query_gid(&ctx, PORT_NUM, GID_INDEX)
            .map_err(resource("query GID"))?;
        log::debug!(
            "{} port {}: LID {}, GID {}, MTU {}",
            device,
            PORT_NUM,
            port.lid,
            gid,
            port.active_mtu.bytes()
        );

        let pd = provider.alloc_pd(&ctx).map_err(resource("allocate PD"))?;
        let pd = Owned::new(provider, pd, P::dealloc_pd, "protection domain");

        let cq = provider
            .create_cq(&ctx, queue_depth as u32 + CQ_HEADROOM)
            .map_err(resource("create CQ"))?;
        let cq = Owned::new(provider, cq, P::destroy_cq, "completion queue");

        let want = QpCaps {
            max_send_wr: queue_depth as u32,
            max_recv_wr: queue_depth as u32,
            max_send_sge: 1,
            max_recv_sge: 2,
            max_inline_data: 0,
        };
        let (qp, caps) = provider
            .create_ud_qp(&pd, &cq, &want)
            .map_err(resource("create UD QP"))?;
        let qp = Owned::new(provider, qp, P::destroy_qp, "queue pair");
        let qpn = provider.qp_num(&qp);

        let mut this = Self {
            ah: None,
            qp,
            cq,
            pd,
            ctx,
            provider: provider.clone(),
            device: device.to_owned(),
            port,
            gid,
            qpn,
            caps,
            state: QpState::Reset,
            queue_depth,
            remote: None,
            ring_attached: Cell::new(false),
        };
        this.modify(QpModify::Init {
            pkey_index: PKEY_INDEX,
            port_num: PORT_NUM,
            qkey: DEFAULT_QKEY,
        })?;
        this.modify(QpModify::Rtr)?;
        Ok(this)
    }

    /// Open `device` and connect it to `peer`, ready to send.
    pub fn open_sender(
        provider: &P,
        device: &str,
        queue_depth: usize,
        peer: &QpEndpoint,
    ) -> Result<Self, TransportError> {
        let mut this = Self::open(provider, device, queue_depth)?;
        this.make_sender(peer)?;
        Ok(this)
    }

    /// Take the queue pair to RTS and build an address handle toward `peer`.
    pub fn make_sender(&mut self, peer: &QpEndpoint) -> Result<(), TransportError> {
        if peer.qpn > MAX_QPN {
            return Err(ConfigError::InvalidQpn(peer.qpn).into());
        }
        self.modify(QpModify::Rts { sq_psn: 0 })?;

        let attr = AhAttr {
            dlid: peer.lid,
            dgid: peer.gid,
            sgid_index: GID_INDEX,
            hop_limit: AH_HOP_LIMIT,
            port_num: PORT_NUM,
        };
        let ah = self
            .provider
            .create_ah(&self.pd, &attr)
            .map_err(resource("create address handle"))?;
        self.ah = Some(Owned::new(&self.provider, ah, P::destroy_ah, "address handle"));
        self.remote = Some(*peer);
        log::info!("QP {:#x} sends to {}", self.qpn, peer);
        Ok(())
    }

    /// Apply one state machine step. Steps must follow
    /// RESET, INIT, RTR, RTS without skipping.
    pub fn modify(&mut self, step: QpModify) -> Result<(), TransportError> {
        let to = step.target();
        if !self.state.can_transition_to(to) {
            return Err(ConfigError::InvalidTransition {
                from: self.state,
                to,
            }
            .into());
        }
        self.provider
            .modify_qp(&self.qp, &step)
            .map_err(resource("modify QP"))?;
        log::info!("QP {:#x}: {} -> {}", self.qpn, self.state, to);
        self.state = to;
        Ok(())
    }

    /// Release everything in reverse acquisition order.
    ///
    /// The first failure stops the teardown: later resources are leaked
    /// rather than released out of order.
    pub fn close(self) -> Result<(), TransportError> {
        let Self {
            ah, qp, cq, pd, ctx, ..
        } = self;

        macro_rules! release {
            ($res:expr $(, $rest:expr)*) => {{
                let res = $res;
                let what = res.what();
                if let Err(source) = res.release() {
                    log::error!("teardown stopped at {}: {}", what, source);
                    $( mem::forget($rest); )*
                    return Err(TransportError::Teardown { what, source });
                }
            }};
        }

        if let Some(ah) = ah {
            release!(ah, qp, cq, pd, ctx);
        }
        release!(qp, cq, pd, ctx);
        release!(cq, pd, ctx);
        release!(pd, ctx);
        release!(ctx);
        Ok(())
    }
}

impl<P: Provider> TransportContext<P> {
    #[inline]
    pub fn provider(&self) -> &P {
        &self.provider
    }

    #[inline]
    pub fn device_name(&self) -> &str {
        &self.device
    }

    #[inline]
    pub fn state(&self) -> QpState {
        self.state
    }

    #[inline]
    pub fn qpn(&self) -> Qpn {
        self.qpn
    }

    #[inline]
    pub fn lid(&self) -> Lid {
        self.port.lid
    }

    #[inline]
    pub fn gid(&self) -> Gid {
        self.gid
    }

    #[inline]
    pub fn port_attr(&self) -> &PortAttr {
        &self.port
    }

    /// Capabilities granted to the queue pair.
    #[inline]
    pub fn caps(&self) -> &QpCaps {
        &self.caps
    }

    #[inline]
    pub fn queue_depth(&self) -> usize {
        self.queue_depth
    }

    /// Largest message a single UD send can carry.
    #[inline]
    pub fn max_msg_size(&self) -> usize {
        self.port.active_mtu.bytes()
    }

    /// Whether messages of `size` bytes can be posted inline.
    #[inline]
    pub fn inline_ok(&self, size: usize) -> bool {
        self.caps.max_inline_data as usize >= size
    }

    /// What a peer needs to send to this context.
    pub fn endpoint(&self) -> QpEndpoint {
        QpEndpoint {
            lid: self.port.lid,
            gid: self.gid,
            qpn: self.qpn,
        }
    }

    /// The peer this context sends to, if any.
    #[inline]
    pub fn remote(&self) -> Option<&QpEndpoint> {
        self.remote.as_ref()
    }

    #[inline]
    pub(crate) fn ah(&self) -> Option<P::Ah> {
        self.ah.as_deref().copied()
    }

    #[inline]
    pub(crate) fn pd(&self) -> &P::Pd {
        &self.pd
    }

    #[inline]
    pub(crate) fn cq(&self) -> &P::Cq {
        &self.cq
    }

    #[inline]
    pub(crate) fn qp(&self) -> &P::Qp {
        &self.qp
    }

    /// Claim the context for a ring. Fails if another ring holds it.
    pub(crate) fn attach_ring(&self) -> Result<(), ConfigError> {
        if self.ring_attached.replace(true) {
            return Err(ConfigError::RingAttached);
        }
        Ok(())
    }

    #[inline]
    pub(crate) fn detach_ring(&self) {
        self.ring_attached.set(false);
    }
}
