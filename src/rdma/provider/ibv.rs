//! libibverbs provider.

use std::ffi::CStr;
use std::fmt;
use std::io;
use std::os::raw::c_int;
use std::ptr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::*;
use crate::bindings::*;
use crate::utils::interop::*;

ibv_handle! {
    /// Opened device context.
    pub struct VerbsContext(ibv_context);
}

ibv_handle! {
    /// Protection domain.
    pub struct VerbsPd(ibv_pd);
}

ibv_handle! {
    /// Memory region.
    pub struct VerbsMr(ibv_mr);
}

ibv_handle! {
    /// Address handle.
    #[derive(Clone, Copy)]
    pub struct VerbsAh(ibv_ah);
}

ibv_handle! {
    struct RawCq(ibv_cq);
}

ibv_handle! {
    struct RawQp(ibv_qp);
}

/// Completion queue with its poll buffer.
pub struct VerbsCq {
    raw: RawCq,
    wc: Mutex<Vec<ibv_wc>>,
}

impl fmt::Debug for VerbsCq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerbsCq").field("raw", &self.raw).finish()
    }
}

/// Native work request lists, rebuilt from a [`WrChain`] at each post.
///
/// The vectors only grow, so a steady-state post does not allocate.
#[derive(Default)]
struct PostScratch {
    send: Vec<ibv_send_wr>,
    send_sge: Vec<ibv_sge>,
    recv: Vec<ibv_recv_wr>,
    recv_sge: Vec<ibv_sge>,
}

// SAFETY: the raw pointers only ever point into the vectors themselves, and
// the scratch is only reachable through its mutex.
unsafe impl Send for PostScratch {}

/// UD queue pair.
pub struct VerbsQp {
    raw: RawQp,
    scratch: Mutex<PostScratch>,
}

impl fmt::Debug for VerbsQp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerbsQp").field("raw", &self.raw).finish()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// RDMA devices seen through libibverbs.
#[derive(Debug, Clone, Copy, Default)]
pub struct Verbs;

impl Verbs {
    pub fn new() -> Self {
        Self
    }

    /// Run `f` over the device list, freeing the list afterwards.
    fn with_device_list<T>(f: impl FnOnce(&[*mut ibv_device]) -> io::Result<T>) -> io::Result<T> {
        let mut n: c_int = 0;
        // SAFETY: FFI.
        let list = unsafe { ibv_get_device_list(&mut n) };
        if list.is_null() {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: `ibv_get_device_list` returns an array of `n` valid device pointers.
        let devices = unsafe { std::slice::from_raw_parts(list, n as usize) };
        let ret = f(devices);
        // SAFETY: FFI; no device pointer outlives this call.
        unsafe { ibv_free_device_list(list) };
        ret
    }

    fn device_name(dev: *mut ibv_device) -> String {
        // SAFETY: FFI; the name is a NUL-terminated string owned by the device.
        unsafe { CStr::from_ptr(ibv_get_device_name(dev)) }
            .to_string_lossy()
            .into_owned()
    }
}

impl Provider for Verbs {
    type Context = VerbsContext;
    type Pd = VerbsPd;
    type Cq = VerbsCq;
    type Qp = VerbsQp;
    type Mr = VerbsMr;
    type Ah = VerbsAh;

    fn device_names(&self) -> io::Result<Vec<String>> {
        Self::with_device_list(|devs| Ok(devs.iter().map(|&d| Self::device_name(d)).collect()))
    }

    fn open_device(&self, name: &str) -> io::Result<VerbsContext> {
        Self::with_device_list(|devs| {
            let dev = devs
                .iter()
                .copied()
                .find(|&d| Self::device_name(d) == name)
                .ok_or_else(|| io::Error::from_raw_os_error(libc::ENODEV))?;
            // SAFETY: FFI.
            VerbsContext::from_raw(unsafe { ibv_open_device(dev) })
        })
    }

    fn close_device(&self, ctx: VerbsContext) -> io::Result<()> {
        // SAFETY: FFI.
        from_c_ret(unsafe { ibv_close_device(ctx.as_raw()) })
    }

    fn query_port(&self, ctx: &VerbsContext, port: PortNum) -> io::Result<PortAttr> {
        let mut attr = ibv_port_attr::default();
        // SAFETY: FFI. The exported symbol fills the compat prefix of
        // `ibv_port_attr`, which is a layout prefix of the full struct.
        let ret = unsafe {
            ibv_query_port(
                ctx.as_raw(),
                port,
                &mut attr as *mut ibv_port_attr as *mut _compat_ibv_port_attr,
            )
        };
        from_c_ret(ret)?;

        let active_mtu = Mtu::from_raw(attr.active_mtu as u32)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))?;
        Ok(PortAttr {
            active: attr.state == ibv_port_state::IBV_PORT_ACTIVE,
            active_mtu,
            lid: attr.lid,
        })
    }

    fn query_gid(&self, ctx: &VerbsContext, port: PortNum, index: GidIndex) -> io::Result<Gid> {
        let mut gid = ibv_gid::default();
        // SAFETY: FFI.
        let ret = unsafe { ibv_query_gid(ctx.as_raw(), port, index as c_int, &mut gid) };
        from_c_ret(ret)?;
        Ok(Gid::from(gid))
    }

    fn alloc_pd(&self, ctx: &VerbsContext) -> io::Result<VerbsPd> {
        // SAFETY: FFI.
        VerbsPd::from_raw(unsafe { ibv_alloc_pd(ctx.as_raw()) })
    }

    fn dealloc_pd(&self, pd: VerbsPd) -> io::Result<()> {
        // SAFETY: FFI.
        from_c_ret(unsafe { ibv_dealloc_pd(pd.as_raw()) })
    }

    fn create_cq(&self, ctx: &VerbsContext, cqe: u32) -> io::Result<VerbsCq> {
        // SAFETY: FFI.
        let cq = unsafe {
            ibv_create_cq(
                ctx.as_raw(),
                cqe as c_int,
                ptr::null_mut(),
                ptr::null_mut(),
                0,
            )
        };
        Ok(VerbsCq {
            raw: RawCq::from_raw(cq)?,
            wc: Mutex::new(Vec::new()),
        })
    }

    fn destroy_cq(&self, cq: VerbsCq) -> io::Result<()> {
        // SAFETY: FFI.
        from_c_ret(unsafe { ibv_destroy_cq(cq.raw.as_raw()) })
    }

    fn create_ud_qp(
        &self,
        pd: &VerbsPd,
        cq: &VerbsCq,
        caps: &QpCaps,
    ) -> io::Result<(VerbsQp, QpCaps)> {
        let mut init_attr = ibv_qp_init_attr {
            send_cq: cq.raw.as_raw(),
            recv_cq: cq.raw.as_raw(),
            cap: ibv_qp_cap {
                max_send_wr: caps.max_send_wr,
                max_recv_wr: caps.max_recv_wr,
                max_send_sge: caps.max_send_sge,
                max_recv_sge: caps.max_recv_sge,
                max_inline_data: caps.max_inline_data,
            },
            qp_type: ibv_qp_type::IBV_QPT_UD,
            sq_sig_all: 0,
            ..Default::default()
        };

        // SAFETY: FFI.
        let qp = RawQp::from_raw(unsafe { ibv_create_qp(pd.as_raw(), &mut init_attr) })?;

        // The driver writes the granted capabilities back.
        let granted = QpCaps {
            max_send_wr: init_attr.cap.max_send_wr,
            max_recv_wr: init_attr.cap.max_recv_wr,
            max_send_sge: init_attr.cap.max_send_sge,
            max_recv_sge: init_attr.cap.max_recv_sge,
            max_inline_data: init_attr.cap.max_inline_data,
        };
        let qp = VerbsQp {
            raw: qp,
            scratch: Mutex::new(PostScratch::default()),
        };
        Ok((qp, granted))
    }

    fn destroy_qp(&self, qp: VerbsQp) -> io::Result<()> {
        // SAFETY: FFI.
        from_c_ret(unsafe { ibv_destroy_qp(qp.raw.as_raw()) })
    }

    fn qp_num(&self, qp: &VerbsQp) -> Qpn {
        // SAFETY: the queue pair is alive for as long as the handle is.
        unsafe { (*qp.raw.as_raw()).qp_num }
    }

    fn modify_qp(&self, qp: &VerbsQp, step: &QpModify) -> io::Result<()> {
        let mut attr = ibv_qp_attr::default();
        let mask = match *step {
            QpModify::Init {
                pkey_index,
                port_num,
                qkey,
            } => {
                attr.qp_state = ibv_qp_state::IBV_QPS_INIT;
                attr.pkey_index = pkey_index;
                attr.port_num = port_num;
                attr.qkey = qkey;
                ibv_qp_attr_mask::IBV_QP_STATE
                    | ibv_qp_attr_mask::IBV_QP_PKEY_INDEX
                    | ibv_qp_attr_mask::IBV_QP_PORT
                    | ibv_qp_attr_mask::IBV_QP_QKEY
            }
            QpModify::Rtr => {
                attr.qp_state = ibv_qp_state::IBV_QPS_RTR;
                ibv_qp_attr_mask::IBV_QP_STATE
            }
            QpModify::Rts { sq_psn } => {
                attr.qp_state = ibv_qp_state::IBV_QPS_RTS;
                attr.sq_psn = sq_psn;
                ibv_qp_attr_mask::IBV_QP_STATE | ibv_qp_attr_mask::IBV_QP_SQ_PSN
            }
        };
        // SAFETY: FFI.
        from_c_ret(unsafe { ibv_modify_qp(qp.raw.as_raw(), &mut attr, mask.0 as c_int) })
    }

    fn create_ah(&self, pd: &VerbsPd, attr: &AhAttr) -> io::Result<VerbsAh> {
        let mut ah_attr = ibv_ah_attr {
            grh: ibv_global_route {
                dgid: attr.dgid.into(),
                flow_label: 0,
                sgid_index: attr.sgid_index,
                hop_limit: attr.hop_limit,
                traffic_class: 0,
            },
            dlid: attr.dlid,
            is_global: 1,
            port_num: attr.port_num,
            ..Default::default()
        };
        // SAFETY: FFI.
        VerbsAh::from_raw(unsafe { ibv_create_ah(pd.as_raw(), &mut ah_attr) })
    }

    fn destroy_ah(&self, ah: VerbsAh) -> io::Result<()> {
        // SAFETY: FFI.
        from_c_ret(unsafe { ibv_destroy_ah(ah.as_raw()) })
    }

    unsafe fn reg_mr(
        &self,
        pd: &VerbsPd,
        addr: *mut u8,
        len: usize,
        perm: Permission,
    ) -> io::Result<VerbsMr> {
        VerbsMr::from_raw(ibv_reg_mr(pd.as_raw(), addr.cast(), len, perm.bits() as c_int))
    }

    fn dereg_mr(&self, mr: VerbsMr) -> io::Result<()> {
        // SAFETY: FFI.
        from_c_ret(unsafe { ibv_dereg_mr(mr.as_raw()) })
    }

    fn lkey(&self, mr: &VerbsMr) -> LKey {
        // SAFETY: the region is alive for as long as the handle is.
        unsafe { (*mr.as_raw()).lkey }
    }

    fn post_send(&self, qp: &VerbsQp, chain: WrChain<'_, SendWr<VerbsAh>>) -> Result<(), Rejected> {
        if chain.is_empty() {
            return Ok(());
        }

        let mut scratch = lock(&qp.scratch);
        let PostScratch { send, send_sge, .. } = &mut *scratch;
        send.clear();
        send_sge.clear();
        for wr in chain {
            send_sge.push(ibv_sge {
                addr: wr.sge.addr,
                length: wr.sge.length,
                lkey: wr.sge.lkey,
            });

            let mut flags = ibv_send_flags::IBV_SEND_SIGNALED;
            if wr.inline {
                flags = flags | ibv_send_flags::IBV_SEND_INLINE;
            }
            send.push(ibv_send_wr {
                wr_id: wr.wr_id,
                num_sge: 1,
                opcode: ibv_wr_opcode::IBV_WR_SEND,
                send_flags: flags.0,
                wr: wr_t {
                    ud: ud_t {
                        ah: wr.dest.ah.as_raw(),
                        remote_qpn: wr.dest.remote_qpn,
                        remote_qkey: wr.dest.remote_qkey,
                    },
                },
                ..Default::default()
            });
        }

        // Link only once both vectors are final, so no pointer is invalidated.
        let n = send.len();
        let base = send.as_mut_ptr();
        for (i, sge) in send_sge.iter_mut().enumerate() {
            // SAFETY: `i < n`, and `i + 1` is only formed when it is in bounds.
            unsafe {
                let wr = &mut *base.add(i);
                wr.sg_list = sge;
                wr.next = if i + 1 < n {
                    base.add(i + 1)
                } else {
                    ptr::null_mut()
                };
            }
        }

        let mut bad_wr = ptr::null_mut();
        // SAFETY: FFI; the list is well-formed and outlives the call.
        let ret = unsafe { ibv_post_send(qp.raw.as_raw(), base, &mut bad_wr) };
        from_c_ret_explained(ret, send_err_explanation).map_err(|source| Rejected {
            posted: offset_in(base, bad_wr, n),
            source,
        })
    }

    fn post_recv(&self, qp: &VerbsQp, chain: WrChain<'_, RecvWr>) -> Result<(), Rejected> {
        if chain.is_empty() {
            return Ok(());
        }

        let mut scratch = lock(&qp.scratch);
        let PostScratch { recv, recv_sge, .. } = &mut *scratch;
        recv.clear();
        recv_sge.clear();
        for wr in chain {
            let used = wr.sgl.iter().take_while(|s| s.length > 0);
            let mut num_sge = 0;
            for s in used {
                recv_sge.push(ibv_sge {
                    addr: s.addr,
                    length: s.length,
                    lkey: s.lkey,
                });
                num_sge += 1;
            }
            // Pad to a fixed stride so the i-th request owns entries `i * RECV_SGES..`.
            for _ in num_sge..RECV_SGES {
                recv_sge.push(ibv_sge::default());
            }
            recv.push(ibv_recv_wr {
                wr_id: wr.wr_id,
                num_sge: num_sge as c_int,
                ..Default::default()
            });
        }

        let n = recv.len();
        let base = recv.as_mut_ptr();
        let sge_base = recv_sge.as_mut_ptr();
        for i in 0..n {
            // SAFETY: `recv_sge` holds exactly `n * RECV_SGES` entries.
            unsafe {
                let wr = &mut *base.add(i);
                wr.sg_list = sge_base.add(i * RECV_SGES);
                wr.next = if i + 1 < n {
                    base.add(i + 1)
                } else {
                    ptr::null_mut()
                };
            }
        }

        let mut bad_wr = ptr::null_mut();
        // SAFETY: FFI; the list is well-formed and outlives the call.
        let ret = unsafe { ibv_post_recv(qp.raw.as_raw(), base, &mut bad_wr) };
        from_c_ret_explained(ret, recv_err_explanation).map_err(|source| Rejected {
            posted: offset_in(base, bad_wr, n),
            source,
        })
    }

    fn poll_cq(&self, cq: &VerbsCq, wc: &mut [Wc]) -> io::Result<usize> {
        if wc.is_empty() {
            return Ok(0);
        }

        let mut buf = lock(&cq.wc);
        if buf.len() < wc.len() {
            buf.resize(wc.len(), ibv_wc::default());
        }

        // SAFETY: FFI; `buf` holds at least `wc.len()` entries.
        let num = unsafe { ibv_poll_cq(cq.raw.as_raw(), wc.len() as c_int, buf.as_mut_ptr()) };
        if num < 0 {
            return Err(poll_error(num));
        }

        let num = num as usize;
        for (dst, src) in wc.iter_mut().zip(buf.iter()).take(num) {
            *dst = Wc {
                wr_id: src.wr_id,
                status: WcStatus::from_raw(src.status),
                opcode: WcOpcode::from_raw(src.opcode),
                byte_len: src.byte_len,
                qp_num: src.qp_num,
                src_qp: src.src_qp,
            };
        }
        Ok(num)
    }
}

/// Number of requests before `bad` in a list starting at `base`.
///
/// A null or out-of-list `bad` means the driver did not say; nothing is
/// assumed posted then.
fn offset_in<T>(base: *mut T, bad: *mut T, len: usize) -> usize {
    if bad.is_null() {
        return 0;
    }
    let off = (bad as usize).wrapping_sub(base as usize) / std::mem::size_of::<T>();
    if off < len {
        off
    } else {
        0
    }
}

/// `ibv_poll_cq` reports failure with a negative value that is not an errno
/// (mlx5 returns -2, others -1).
fn poll_error(ret: c_int) -> io::Error {
    io::Error::other(format!("ibv_poll_cq failed ({})", ret))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_in() {
        let mut wrs = [0u64; 4];
        let base = wrs.as_mut_ptr();
        assert_eq!(offset_in(base, ptr::null_mut(), 4), 0);
        assert_eq!(offset_in(base, unsafe { base.add(2) }, 4), 2);
        assert_eq!(offset_in(base, unsafe { base.add(4) }, 4), 0);
    }

    #[test]
    fn test_poll_error_is_not_errno() {
        for ret in [-1, -2] {
            let err = poll_error(ret);
            assert_eq!(err.kind(), io::ErrorKind::Other);
            assert!(err.raw_os_error().is_none());
            assert!(err.to_string().contains(&ret.to_string()));
        }
    }
}
