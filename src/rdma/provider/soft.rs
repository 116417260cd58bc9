//! In-process RoCE v1 fabric.
//!
//! Every UD send is encoded into a real frame with the wire codec, hashed
//! with the invariant CRC, then parsed and verified again on the receiving
//! side before it is scattered into a posted receive. Queue pair state,
//! queue capacities, memory region bounds and resource dependencies are
//! enforced the way a kernel driver would.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::ptr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::*;
use crate::rdma::state::QpState;
use crate::rdma::wr::Sge;
use crate::utils::interop::{explained, recv_err_explanation, send_err_explanation};
use crate::wire::{HeaderBuilder, MacAddr, RocePacket, ETH_LEN, GRH_LEN};

/// Verbs whose next call can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    OpenDevice,
    CloseDevice,
    QueryPort,
    QueryGid,
    AllocPd,
    DeallocPd,
    CreateCq,
    DestroyCq,
    CreateQp,
    DestroyQp,
    ModifyQp,
    CreateAh,
    DestroyAh,
    RegMr,
    DeregMr,
    PostSend,
    PostRecv,
    PollCq,
}

/// A device attached to the fabric.
#[derive(Debug, Clone)]
pub struct SoftDevice {
    pub name: String,
    pub lid: Lid,
    pub gid: Gid,
    pub mac: MacAddr,
    pub mtu: Mtu,
    pub max_qp_wr: u32,
    pub max_cqe: u32,
    pub max_sge: u32,
    pub max_inline_data: u32,
    pub port_active: bool,
}

impl SoftDevice {
    /// A device with a 1024-byte MTU and a MAC derived from the low GID bytes.
    pub fn new(name: impl Into<String>, lid: Lid, gid: Gid) -> Self {
        let g = gid.octets();
        Self {
            name: name.into(),
            lid,
            gid,
            mac: MacAddr([0x02, 0x00, g[12], g[13], g[14], g[15]]),
            mtu: Mtu::Mtu1024,
            max_qp_wr: 16384,
            max_cqe: 65536,
            max_sge: 2,
            max_inline_data: 64,
            port_active: true,
        }
    }

    pub fn with_mtu(mut self, mtu: Mtu) -> Self {
        self.mtu = mtu;
        self
    }

    pub fn with_max_inline_data(mut self, max_inline_data: u32) -> Self {
        self.max_inline_data = max_inline_data;
        self
    }

    /// Report the port as down.
    pub fn with_port_down(mut self) -> Self {
        self.port_active = false;
        self
    }
}

/// Resources currently alive on the fabric.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LiveResources {
    pub contexts: usize,
    pub pds: usize,
    pub cqs: usize,
    pub qps: usize,
    pub mrs: usize,
    pub ahs: usize,
}

impl LiveResources {
    #[inline]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Frame counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FabricStats {
    pub frames: u64,
    pub delivered: u64,
    pub dropped_malformed: u64,
    pub dropped_icrc: u64,
    pub dropped_unroutable: u64,
    pub dropped_qkey: u64,
    pub dropped_no_recv: u64,
}

#[derive(Debug)]
pub struct SoftContext(u32);

#[derive(Debug)]
pub struct SoftPd(u32);

#[derive(Debug)]
pub struct SoftCq(u32);

#[derive(Debug)]
pub struct SoftQp(u32);

#[derive(Debug)]
pub struct SoftMr(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SoftAh(u32);

struct CqEntry {
    ctx: u32,
    capacity: usize,
    queue: VecDeque<Wc>,
    overrun: bool,
}

struct QpEntry {
    ctx: u32,
    pd: u32,
    cq: u32,
    qpn: Qpn,
    state: QpState,
    qkey: QKey,
    caps: QpCaps,
    sq_outstanding: u32,
    rq: VecDeque<RecvWr>,
}

struct MrEntry {
    pd: u32,
    addr: u64,
    len: usize,
    perm: Permission,
}

struct AhEntry {
    pd: u32,
    attr: AhAttr,
}

#[derive(Default)]
struct Fabric {
    devices: Vec<SoftDevice>,
    next_id: u32,
    next_qpn: Qpn,
    contexts: HashMap<u32, usize>,
    pds: HashMap<u32, u32>,
    cqs: HashMap<u32, CqEntry>,
    qps: HashMap<u32, QpEntry>,
    mrs: HashMap<u32, MrEntry>,
    ahs: HashMap<u32, AhEntry>,
    faults: HashMap<Verb, (u32, i32)>,
    flip_bit: Option<usize>,
    forced_status: Option<WcStatus>,
    stats: FabricStats,
}

#[inline]
fn errno(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

impl Fabric {
    fn alloc_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn take_fault(&mut self, verb: Verb) -> io::Result<()> {
        let Some((skip, code)) = self.faults.get_mut(&verb) else {
            return Ok(());
        };
        if *skip > 0 {
            *skip -= 1;
            return Ok(());
        }
        let code = *code;
        self.faults.remove(&verb);
        log::debug!("soft fabric: injected failure of {:?}", verb);
        Err(errno(code))
    }

    fn device_of(&self, ctx: u32) -> io::Result<&SoftDevice> {
        self.contexts
            .get(&ctx)
            .map(|&dev| &self.devices[dev])
            .ok_or_else(|| errno(libc::EINVAL))
    }

    fn ctx_of_pd(&self, pd: u32) -> io::Result<u32> {
        self.pds.get(&pd).copied().ok_or_else(|| errno(libc::EINVAL))
    }

    /// Resolve an SGE to a host address, checking key, bounds, domain and
    /// access rights.
    fn resolve_sge(&self, sge: &Sge, pd: u32, need: Permission) -> Option<*mut u8> {
        let mr = self.mrs.get(&sge.lkey)?;
        if mr.pd != pd || !mr.perm.contains(need) {
            return None;
        }
        let start = sge.addr.checked_sub(mr.addr)? as usize;
        let end = start.checked_add(sge.length as usize)?;
        if end > mr.len {
            return None;
        }
        Some(sge.addr as usize as *mut u8)
    }

    fn complete(&mut self, cq: u32, mut wc: Wc) {
        if let Some(status) = self.forced_status.take() {
            wc.status = status;
        }
        let Some(cq) = self.cqs.get_mut(&cq) else {
            return;
        };
        if cq.queue.len() >= cq.capacity {
            log::error!("soft fabric: CQ overrun, completion for wr {} lost", wc.wr_id);
            cq.overrun = true;
            return;
        }
        cq.queue.push_back(wc);
    }

    /// Build the frame for one send and hand it to the receiving side.
    /// Returns the status of the send itself.
    fn transmit(&mut self, qp: u32, wr: &SendWr<SoftAh>) -> WcStatus {
        let (pd, ctx, src_qpn) = match self.qps.get(&qp) {
            Some(q) => (q.pd, q.ctx, q.qpn),
            None => return WcStatus::LocQpOpErr,
        };
        let Some(ah) = self.ahs.get(&wr.dest.ah.0) else {
            return WcStatus::LocQpOpErr;
        };
        if ah.pd != pd {
            return WcStatus::LocQpOpErr;
        }
        let attr = ah.attr;
        let Some(src) = self.resolve_sge(&wr.sge, pd, Permission::EMPTY) else {
            return WcStatus::LocProtErr;
        };
        let Ok(device) = self.device_of(ctx) else {
            return WcStatus::LocQpOpErr;
        };
        if wr.sge.length as usize > device.mtu.bytes() {
            return WcStatus::LocLenErr;
        }
        let (sgid, src_mac) = (device.gid, device.mac);
        let dst_mac = self
            .devices
            .iter()
            .find(|d| d.gid == attr.dgid)
            .map(|d| d.mac)
            .unwrap_or(MacAddr::BROADCAST);

        let len = wr.sge.length as usize;
        // SAFETY: the SGE lies within a registered region, which the caller
        // of `reg_mr` keeps valid until deregistration.
        let payload = unsafe { std::slice::from_raw_parts(src as *const u8, len) };
        let frame = HeaderBuilder::new(len)
            .macs(dst_mac, src_mac)
            .gids(sgid, attr.dgid)
            .dest_qp(wr.dest.remote_qpn)
            .src_qp(src_qpn)
            .qkey(wr.dest.remote_qkey)
            .build()
            .and_then(|tpl| tpl.encode(payload));
        let mut frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("soft fabric: cannot encode frame: {}", e);
                return WcStatus::LocQpOpErr;
            }
        };
        if let Some(bit) = self.flip_bit.take() {
            let bit = bit % (frame.len() * 8);
            frame[bit / 8] ^= 1 << (bit % 8);
        }
        self.deliver(&frame);
        WcStatus::Success
    }

    /// Receive one frame. Undeliverable frames are dropped silently.
    fn deliver(&mut self, frame: &[u8]) {
        self.stats.frames += 1;
        let pkt = match RocePacket::parse(frame) {
            Ok(pkt) => pkt,
            Err(e) => {
                log::warn!("soft fabric: dropping malformed frame: {}", e);
                self.stats.dropped_malformed += 1;
                return;
            }
        };
        if let Err(e) = pkt.verify() {
            log::warn!("soft fabric: dropping frame: {}", e);
            self.stats.dropped_icrc += 1;
            return;
        }

        let Some(dev) = self.devices.iter().position(|d| d.gid == pkt.grh.dgid) else {
            self.stats.dropped_unroutable += 1;
            return;
        };
        let target = self.qps.iter().find_map(|(&id, q)| {
            let on_dev = self.contexts.get(&q.ctx) == Some(&dev);
            (on_dev && q.qpn == pkt.bth.dest_qp && q.state.can_receive()).then_some(id)
        });
        let Some(target) = target else {
            log::warn!("soft fabric: no ready QP {:#x} on {}", pkt.bth.dest_qp, self.devices[dev].name);
            self.stats.dropped_unroutable += 1;
            return;
        };

        let Some(q) = self.qps.get_mut(&target) else {
            return;
        };
        if q.qkey != pkt.deth.qkey {
            log::warn!("soft fabric: Q_Key mismatch on QP {:#x}", q.qpn);
            self.stats.dropped_qkey += 1;
            return;
        }
        let Some(wr) = q.rq.pop_front() else {
            log::warn!("soft fabric: QP {:#x} has no receive posted", q.qpn);
            self.stats.dropped_no_recv += 1;
            return;
        };
        let (pd, cq, qpn) = (q.pd, q.cq, q.qpn);

        let grh = &frame[ETH_LEN..ETH_LEN + GRH_LEN];
        let total = GRH_LEN + pkt.payload.len();
        let mut wc = Wc {
            wr_id: wr.wr_id,
            status: WcStatus::Success,
            opcode: WcOpcode::Recv,
            byte_len: 0,
            qp_num: qpn,
            src_qp: pkt.deth.src_qp,
        };

        let mut targets = Vec::with_capacity(wr.sgl.len());
        for sge in wr.sgl.iter().filter(|s| s.length > 0) {
            match self.resolve_sge(sge, pd, Permission::LOCAL_WRITE) {
                Some(p) => targets.push((p, sge.length as usize)),
                None => {
                    wc.status = WcStatus::LocProtErr;
                    self.complete(cq, wc);
                    return;
                }
            }
        }
        let capacity: usize = targets.iter().map(|t| t.1).sum();
        if capacity < total {
            wc.status = WcStatus::LocLenErr;
            self.complete(cq, wc);
            return;
        }

        let mut src = grh.iter().chain(pkt.payload.iter()).copied();
        let mut left = total;
        for (dst, cap) in targets {
            let n = cap.min(left);
            for off in 0..n {
                let byte = src.next().unwrap_or(0);
                // SAFETY: `off < cap`, and the SGE was checked against its
                // registered region above.
                unsafe { ptr::write(dst.add(off), byte) };
            }
            left -= n;
            if left == 0 {
                break;
            }
        }

        wc.byte_len = total as u32;
        self.stats.delivered += 1;
        self.complete(cq, wc);
    }
}

/// In-process RoCE v1 fabric.
///
/// Clones share the same fabric.
#[derive(Clone)]
pub struct SoftFabric {
    inner: Arc<Mutex<Fabric>>,
}

impl SoftFabric {
    /// An empty fabric.
    pub fn new() -> Self {
        let fabric = Fabric {
            next_qpn: 0x11,
            ..Default::default()
        };
        Self {
            inner: Arc::new(Mutex::new(fabric)),
        }
    }

    /// Attach a device.
    pub fn with_device(self, dev: SoftDevice) -> Self {
        self.add_device(dev);
        self
    }

    /// Attach a device.
    pub fn add_device(&self, dev: SoftDevice) {
        log::debug!("soft fabric: attach {} ({})", dev.name, dev.gid);
        self.lock().devices.push(dev);
    }

    /// Make the next call of `verb` fail with `code`.
    pub fn fail_next(&self, verb: Verb, code: i32) {
        self.fail_nth(verb, 0, code);
    }

    /// Let `skip` calls of `verb` through, then fail the one after with `code`.
    pub fn fail_nth(&self, verb: Verb, skip: u32, code: i32) {
        self.lock().faults.insert(verb, (skip, code));
    }

    /// Flip bit `bit` (modulo the frame size) of the next frame on the wire.
    pub fn corrupt_next_frame(&self, bit: usize) {
        self.lock().flip_bit = Some(bit);
    }

    /// Give the next completion generated `status` instead of its own.
    pub fn fail_next_completion(&self, status: WcStatus) {
        self.lock().forced_status = Some(status);
    }

    /// Count resources still allocated.
    pub fn live(&self) -> LiveResources {
        let f = self.lock();
        LiveResources {
            contexts: f.contexts.len(),
            pds: f.pds.len(),
            cqs: f.cqs.len(),
            qps: f.qps.len(),
            mrs: f.mrs.len(),
            ahs: f.ahs.len(),
        }
    }

    pub fn stats(&self) -> FabricStats {
        self.lock().stats
    }

    fn lock(&self) -> MutexGuard<'_, Fabric> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for SoftFabric {
    fn default() -> Self {
        Self::new()
    }
}

impl Provider for SoftFabric {
    type Context = SoftContext;
    type Pd = SoftPd;
    type Cq = SoftCq;
    type Qp = SoftQp;
    type Mr = SoftMr;
    type Ah = SoftAh;

    fn device_names(&self) -> io::Result<Vec<String>> {
        Ok(self.lock().devices.iter().map(|d| d.name.clone()).collect())
    }

    fn open_device(&self, name: &str) -> io::Result<SoftContext> {
        let mut f = self.lock();
        f.take_fault(Verb::OpenDevice)?;
        let dev = f
            .devices
            .iter()
            .position(|d| d.name == name)
            .ok_or_else(|| errno(libc::ENODEV))?;
        let id = f.alloc_id();
        f.contexts.insert(id, dev);
        Ok(SoftContext(id))
    }

    fn close_device(&self, ctx: SoftContext) -> io::Result<()> {
        let mut f = self.lock();
        f.take_fault(Verb::CloseDevice)?;
        if f.pds.values().any(|&c| c == ctx.0) || f.cqs.values().any(|c| c.ctx == ctx.0) {
            return Err(errno(libc::EBUSY));
        }
        f.contexts.remove(&ctx.0).map(drop).ok_or_else(|| errno(libc::EINVAL))
    }

    fn query_port(&self, ctx: &SoftContext, port: PortNum) -> io::Result<PortAttr> {
        let mut f = self.lock();
        f.take_fault(Verb::QueryPort)?;
        if port != 1 {
            return Err(errno(libc::EINVAL));
        }
        let dev = f.device_of(ctx.0)?;
        Ok(PortAttr {
            active: dev.port_active,
            active_mtu: dev.mtu,
            lid: dev.lid,
        })
    }

    fn query_gid(&self, ctx: &SoftContext, port: PortNum, index: GidIndex) -> io::Result<Gid> {
        let mut f = self.lock();
        f.take_fault(Verb::QueryGid)?;
        if port != 1 || index != 0 {
            return Err(errno(libc::EINVAL));
        }
        Ok(f.device_of(ctx.0)?.gid)
    }

    fn alloc_pd(&self, ctx: &SoftContext) -> io::Result<SoftPd> {
        let mut f = self.lock();
        f.take_fault(Verb::AllocPd)?;
        f.device_of(ctx.0)?;
        let id = f.alloc_id();
        f.pds.insert(id, ctx.0);
        Ok(SoftPd(id))
    }

    fn dealloc_pd(&self, pd: SoftPd) -> io::Result<()> {
        let mut f = self.lock();
        f.take_fault(Verb::DeallocPd)?;
        let in_use = f.mrs.values().any(|m| m.pd == pd.0)
            || f.qps.values().any(|q| q.pd == pd.0)
            || f.ahs.values().any(|a| a.pd == pd.0);
        if in_use {
            return Err(errno(libc::EBUSY));
        }
        f.pds.remove(&pd.0).map(drop).ok_or_else(|| errno(libc::EINVAL))
    }

    fn create_cq(&self, ctx: &SoftContext, cqe: u32) -> io::Result<SoftCq> {
        let mut f = self.lock();
        f.take_fault(Verb::CreateCq)?;
        let dev = f.device_of(ctx.0)?;
        if cqe == 0 || cqe > dev.max_cqe {
            return Err(errno(libc::EINVAL));
        }
        let id = f.alloc_id();
        f.cqs.insert(
            id,
            CqEntry {
                ctx: ctx.0,
                capacity: cqe as usize,
                queue: VecDeque::with_capacity(cqe as usize),
                overrun: false,
            },
        );
        Ok(SoftCq(id))
    }

    fn destroy_cq(&self, cq: SoftCq) -> io::Result<()> {
        let mut f = self.lock();
        f.take_fault(Verb::DestroyCq)?;
        if f.qps.values().any(|q| q.cq == cq.0) {
            return Err(errno(libc::EBUSY));
        }
        f.cqs.remove(&cq.0).map(drop).ok_or_else(|| errno(libc::EINVAL))
    }

    fn create_ud_qp(
        &self,
        pd: &SoftPd,
        cq: &SoftCq,
        caps: &QpCaps,
    ) -> io::Result<(SoftQp, QpCaps)> {
        let mut f = self.lock();
        f.take_fault(Verb::CreateQp)?;
        let ctx = f.ctx_of_pd(pd.0)?;
        match f.cqs.get(&cq.0) {
            Some(c) if c.ctx == ctx => {}
            _ => return Err(errno(libc::EINVAL)),
        }
        let dev = f.device_of(ctx)?;
        let fits = caps.max_send_wr <= dev.max_qp_wr
            && caps.max_recv_wr <= dev.max_qp_wr
            && caps.max_send_sge <= dev.max_sge
            && caps.max_recv_sge <= dev.max_sge
            && caps.max_inline_data <= dev.max_inline_data;
        if !fits {
            return Err(errno(libc::EINVAL));
        }

        let granted = QpCaps {
            max_inline_data: dev.max_inline_data,
            ..*caps
        };
        let id = f.alloc_id();
        let qpn = f.next_qpn;
        f.next_qpn += 1;
        f.qps.insert(
            id,
            QpEntry {
                ctx,
                pd: pd.0,
                cq: cq.0,
                qpn,
                state: QpState::Reset,
                qkey: 0,
                caps: granted,
                sq_outstanding: 0,
                rq: VecDeque::with_capacity(caps.max_recv_wr as usize),
            },
        );
        Ok((SoftQp(id), granted))
    }

    fn destroy_qp(&self, qp: SoftQp) -> io::Result<()> {
        let mut f = self.lock();
        f.take_fault(Verb::DestroyQp)?;
        f.qps.remove(&qp.0).map(drop).ok_or_else(|| errno(libc::EINVAL))
    }

    fn qp_num(&self, qp: &SoftQp) -> Qpn {
        self.lock().qps.get(&qp.0).map_or(0, |q| q.qpn)
    }

    fn modify_qp(&self, qp: &SoftQp, step: &QpModify) -> io::Result<()> {
        let mut f = self.lock();
        f.take_fault(Verb::ModifyQp)?;
        let q = f.qps.get_mut(&qp.0).ok_or_else(|| errno(libc::EINVAL))?;
        let to = step.target();
        if !q.state.can_transition_to(to) {
            return Err(errno(libc::EINVAL));
        }
        if let QpModify::Init { port_num, qkey, .. } = *step {
            if port_num != 1 {
                return Err(errno(libc::EINVAL));
            }
            q.qkey = qkey;
        }
        q.state = to;
        Ok(())
    }

    fn create_ah(&self, pd: &SoftPd, attr: &AhAttr) -> io::Result<SoftAh> {
        let mut f = self.lock();
        f.take_fault(Verb::CreateAh)?;
        f.ctx_of_pd(pd.0)?;
        if attr.port_num != 1 {
            return Err(errno(libc::EINVAL));
        }
        let id = f.alloc_id();
        f.ahs.insert(id, AhEntry { pd: pd.0, attr: *attr });
        Ok(SoftAh(id))
    }

    fn destroy_ah(&self, ah: SoftAh) -> io::Result<()> {
        let mut f = self.lock();
        f.take_fault(Verb::DestroyAh)?;
        f.ahs.remove(&ah.0).map(drop).ok_or_else(|| errno(libc::EINVAL))
    }

    unsafe fn reg_mr(
        &self,
        pd: &SoftPd,
        addr: *mut u8,
        len: usize,
        perm: Permission,
    ) -> io::Result<SoftMr> {
        let mut f = self.lock();
        f.take_fault(Verb::RegMr)?;
        f.ctx_of_pd(pd.0)?;
        if addr.is_null() || len == 0 {
            return Err(errno(libc::EINVAL));
        }
        // Remote write access requires local write access, as in libibverbs.
        if perm.contains(Permission::REMOTE_WRITE) && !perm.contains(Permission::LOCAL_WRITE) {
            return Err(errno(libc::EINVAL));
        }
        let id = f.alloc_id();
        f.mrs.insert(
            id,
            MrEntry {
                pd: pd.0,
                addr: addr as usize as u64,
                len,
                perm,
            },
        );
        Ok(SoftMr(id))
    }

    fn dereg_mr(&self, mr: SoftMr) -> io::Result<()> {
        let mut f = self.lock();
        f.take_fault(Verb::DeregMr)?;
        f.mrs.remove(&mr.0).map(drop).ok_or_else(|| errno(libc::EINVAL))
    }

    fn lkey(&self, mr: &SoftMr) -> LKey {
        mr.0
    }

    fn post_send(&self, qp: &SoftQp, chain: WrChain<'_, SendWr<SoftAh>>) -> Result<(), Rejected> {
        let mut f = self.lock();
        for (posted, wr) in chain.enumerate() {
            let reject = |code| Rejected {
                posted,
                source: explained(errno(code), send_err_explanation),
            };
            if let Err(source) = f.take_fault(Verb::PostSend) {
                return Err(Rejected {
                    posted,
                    source: explained(source, send_err_explanation),
                });
            }
            let q = f.qps.get_mut(&qp.0).ok_or_else(|| reject(libc::EINVAL))?;
            if !q.state.can_send() {
                return Err(reject(libc::EINVAL));
            }
            if wr.inline && wr.sge.length > q.caps.max_inline_data {
                return Err(reject(libc::EINVAL));
            }
            if q.sq_outstanding >= q.caps.max_send_wr {
                return Err(reject(libc::ENOMEM));
            }
            q.sq_outstanding += 1;
            let (cq, qpn) = (q.cq, q.qpn);

            let status = f.transmit(qp.0, wr);
            f.complete(
                cq,
                Wc {
                    wr_id: wr.wr_id,
                    status,
                    opcode: WcOpcode::Send,
                    byte_len: wr.sge.length,
                    qp_num: qpn,
                    src_qp: 0,
                },
            );
        }
        Ok(())
    }

    fn post_recv(&self, qp: &SoftQp, chain: WrChain<'_, RecvWr>) -> Result<(), Rejected> {
        let mut f = self.lock();
        for (posted, wr) in chain.enumerate() {
            let reject = |code| Rejected {
                posted,
                source: explained(errno(code), recv_err_explanation),
            };
            if let Err(source) = f.take_fault(Verb::PostRecv) {
                return Err(Rejected {
                    posted,
                    source: explained(source, recv_err_explanation),
                });
            }
            let q = f.qps.get_mut(&qp.0).ok_or_else(|| reject(libc::EINVAL))?;
            if !q.state.can_post_recv() {
                return Err(reject(libc::EINVAL));
            }
            let sges = wr.sgl.iter().filter(|s| s.length > 0).count() as u32;
            if sges > q.caps.max_recv_sge {
                return Err(reject(libc::EINVAL));
            }
            if q.rq.len() >= q.caps.max_recv_wr as usize {
                return Err(reject(libc::ENOMEM));
            }
            q.rq.push_back(*wr);
        }
        Ok(())
    }

    fn poll_cq(&self, cq: &SoftCq, wc: &mut [Wc]) -> io::Result<usize> {
        let mut f = self.lock();
        f.take_fault(Verb::PollCq)?;
        let entry = f.cqs.get_mut(&cq.0).ok_or_else(|| errno(libc::EINVAL))?;
        if entry.overrun {
            return Err(errno(libc::EOVERFLOW));
        }
        let n = wc.len().min(entry.queue.len());
        for slot in wc.iter_mut().take(n) {
            if let Some(c) = entry.queue.pop_front() {
                *slot = c;
            }
        }
        for c in &wc[..n] {
            if c.opcode != WcOpcode::Send {
                continue;
            }
            if let Some(q) = f.qps.values_mut().find(|q| q.qpn == c.qp_num) {
                q.sq_outstanding = q.sq_outstanding.saturating_sub(1);
            }
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CAPS: QpCaps = QpCaps {
        max_send_wr: 4,
        max_recv_wr: 4,
        max_send_sge: 1,
        max_recv_sge: 2,
        max_inline_data: 0,
    };

    fn fabric() -> SoftFabric {
        SoftFabric::new().with_device(SoftDevice::new("soft0", 1, "fe80::1".parse().unwrap()))
    }

    #[test]
    fn test_dependencies_block_release() {
        let f = fabric();
        let ctx = f.open_device("soft0").unwrap();
        let pd = f.alloc_pd(&ctx).unwrap();
        let cq = f.create_cq(&ctx, 8).unwrap();
        let (qp, _) = f.create_ud_qp(&pd, &cq, &CAPS).unwrap();
        assert_eq!(f.live().qps, 1);

        let err = f.close_device(SoftContext(ctx.0)).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EBUSY));
        let err = f.destroy_cq(SoftCq(cq.0)).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EBUSY));

        f.destroy_qp(qp).unwrap();
        f.destroy_cq(cq).unwrap();
        f.dealloc_pd(pd).unwrap();
        f.close_device(ctx).unwrap();
        assert!(f.live().is_empty());
    }

    #[test]
    fn test_state_rules() {
        let f = fabric();
        let ctx = f.open_device("soft0").unwrap();
        let pd = f.alloc_pd(&ctx).unwrap();
        let cq = f.create_cq(&ctx, 8).unwrap();
        let (qp, _) = f.create_ud_qp(&pd, &cq, &CAPS).unwrap();

        let mut buf = vec![0u8; 64];
        let mr = unsafe { f.reg_mr(&pd, buf.as_mut_ptr(), buf.len(), Permission::LOCAL_WRITE) }
            .unwrap();
        let wr = RecvWr {
            wr_id: 0,
            sgl: [
                Sge {
                    addr: buf.as_ptr() as u64,
                    length: 40,
                    lkey: f.lkey(&mr),
                },
                Sge {
                    addr: buf.as_ptr() as u64 + 40,
                    length: 24,
                    lkey: f.lkey(&mr),
                },
            ],
        };
        let ring = [wr];

        // RESET refuses receives, and RTR cannot be reached directly.
        let err = f.post_recv(&qp, WrChain::new(&ring, 0, 1)).unwrap_err();
        assert_eq!(err.posted, 0);
        assert!(f.modify_qp(&qp, &QpModify::Rtr).is_err());

        f.modify_qp(
            &qp,
            &QpModify::Init {
                pkey_index: 0,
                port_num: 1,
                qkey: 7,
            },
        )
        .unwrap();
        f.post_recv(&qp, WrChain::new(&ring, 0, 1)).unwrap();

        f.destroy_qp(qp).unwrap();
        f.dereg_mr(mr).unwrap();
        f.destroy_cq(cq).unwrap();
        f.dealloc_pd(pd).unwrap();
        f.close_device(ctx).unwrap();
    }

    #[test]
    fn test_mr_permissions() {
        let f = fabric();
        let ctx = f.open_device("soft0").unwrap();
        let pd = f.alloc_pd(&ctx).unwrap();
        let mut buf = vec![0u8; 64];

        let err = unsafe { f.reg_mr(&pd, buf.as_mut_ptr(), buf.len(), Permission::REMOTE_WRITE) }
            .unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EINVAL));

        // A read-only region can be sent from but not scattered into.
        let mr = unsafe { f.reg_mr(&pd, buf.as_mut_ptr(), buf.len(), Permission::EMPTY) }.unwrap();
        let sge = Sge {
            addr: buf.as_ptr() as u64,
            length: 64,
            lkey: f.lkey(&mr),
        };
        {
            let fab = f.lock();
            assert!(fab.resolve_sge(&sge, pd.0, Permission::EMPTY).is_some());
            assert!(fab.resolve_sge(&sge, pd.0, Permission::LOCAL_WRITE).is_none());
        }

        f.dereg_mr(mr).unwrap();
        f.dealloc_pd(pd).unwrap();
        f.close_device(ctx).unwrap();
    }

    #[test]
    fn test_injected_fault_is_one_shot() {
        let f = fabric();
        f.fail_next(Verb::OpenDevice, libc::ENOMEM);
        assert_eq!(
            f.open_device("soft0").unwrap_err().raw_os_error(),
            Some(libc::ENOMEM)
        );
        let ctx = f.open_device("soft0").unwrap();
        assert_eq!(
            f.open_device("nope").unwrap_err().raw_os_error(),
            Some(libc::ENODEV)
        );
        f.close_device(ctx).unwrap();
    }
}
