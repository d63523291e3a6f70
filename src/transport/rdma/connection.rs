//! Reliable-connected queue pairs.
//!
//! Two-phase construction:
//! 1. `RdmaContext::prepare_connection()` creates a QP in INIT state.
//! 2. Endpoints are exchanged over the pair's TCP stream.
//! 3. `PreparedQueuePair::complete()` moves the QP through RTR to RTS.

use super::context::RdmaContext;
use super::mr::RdmaMr;
use crate::error::{CollieError, Result};
use ibverbs_sys::{ibv_qp_attr_mask, ibv_qp_state, ibv_send_flags, ibv_wr_opcode};
use std::os::raw::c_int;
use std::ptr;
use std::sync::Arc;

/// Addressing data one side of a pair needs about the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RdmaEndpoint {
    pub qp_num: u32,
    pub lid: u16,
    pub gid: [u8; 16],
}

/// A queue pair in INIT state, waiting for the remote endpoint.
pub struct PreparedQueuePair {
    pub(super) qp: *mut ibverbs_sys::ibv_qp,
    pub(super) send_cq: *mut ibverbs_sys::ibv_cq,
    pub(super) recv_cq: *mut ibverbs_sys::ibv_cq,
    pub(super) local: RdmaEndpoint,
    pub(super) ctx: Arc<RdmaContext>,
}

unsafe impl Send for PreparedQueuePair {}
unsafe impl Sync for PreparedQueuePair {}

impl PreparedQueuePair {
    pub fn endpoint(&self) -> RdmaEndpoint {
        self.local
    }

    /// Connect to `remote` and transition to ready-to-send.
    pub fn complete(mut self, remote: RdmaEndpoint) -> Result<QueuePair> {
        unsafe {
            // INIT -> RTR
            let mut attr: ibverbs_sys::ibv_qp_attr = std::mem::zeroed();
            attr.qp_state = ibv_qp_state::IBV_QPS_RTR;
            attr.path_mtu = ibverbs_sys::IBV_MTU_4096;
            attr.dest_qp_num = remote.qp_num;
            attr.rq_psn = 0;
            attr.max_dest_rd_atomic = 1;
            attr.min_rnr_timer = 12;

            attr.ah_attr.is_global = 1;
            attr.ah_attr.grh.dgid.raw = remote.gid;
            attr.ah_attr.grh.sgid_index = self.ctx.gid_index;
            attr.ah_attr.grh.hop_limit = 64;
            attr.ah_attr.grh.traffic_class = 0;
            attr.ah_attr.dlid = remote.lid;
            attr.ah_attr.sl = 0;
            attr.ah_attr.src_path_bits = 0;
            attr.ah_attr.port_num = self.ctx.port;

            let mask = ibv_qp_attr_mask::IBV_QP_STATE
                | ibv_qp_attr_mask::IBV_QP_AV
                | ibv_qp_attr_mask::IBV_QP_PATH_MTU
                | ibv_qp_attr_mask::IBV_QP_DEST_QPN
                | ibv_qp_attr_mask::IBV_QP_RQ_PSN
                | ibv_qp_attr_mask::IBV_QP_MAX_DEST_RD_ATOMIC
                | ibv_qp_attr_mask::IBV_QP_MIN_RNR_TIMER;

            let rc = ibverbs_sys::ibv_modify_qp(self.qp, &mut attr, mask.0 as c_int);
            if rc != 0 {
                return Err(CollieError::device(format!(
                    "RDMA: ibv_modify_qp to RTR failed (rc={rc})"
                )));
            }

            // RTR -> RTS. rnr_retry 7 retries forever while the receiver has
            // no buffer posted, which is the flow control for large frames.
            let mut attr: ibverbs_sys::ibv_qp_attr = std::mem::zeroed();
            attr.qp_state = ibv_qp_state::IBV_QPS_RTS;
            attr.sq_psn = 0;
            attr.timeout = 14;
            attr.retry_cnt = 7;
            attr.rnr_retry = 7;
            attr.max_rd_atomic = 1;

            let mask = ibv_qp_attr_mask::IBV_QP_STATE
                | ibv_qp_attr_mask::IBV_QP_TIMEOUT
                | ibv_qp_attr_mask::IBV_QP_RETRY_CNT
                | ibv_qp_attr_mask::IBV_QP_RNR_RETRY
                | ibv_qp_attr_mask::IBV_QP_SQ_PSN
                | ibv_qp_attr_mask::IBV_QP_MAX_QP_RD_ATOMIC;

            let rc = ibverbs_sys::ibv_modify_qp(self.qp, &mut attr, mask.0 as c_int);
            if rc != 0 {
                return Err(CollieError::device(format!(
                    "RDMA: ibv_modify_qp to RTS failed (rc={rc})"
                )));
            }
        }

        let qp = QueuePair {
            qp: self.qp,
            send_cq: self.send_cq,
            recv_cq: self.recv_cq,
            ctx: Arc::clone(&self.ctx),
        };
        self.qp = ptr::null_mut();
        self.send_cq = ptr::null_mut();
        self.recv_cq = ptr::null_mut();
        Ok(qp)
    }
}

impl Drop for PreparedQueuePair {
    fn drop(&mut self) {
        unsafe { destroy(self.qp, self.send_cq, self.recv_cq) }
    }
}

/// A connected RC queue pair to one peer.
pub struct QueuePair {
    qp: *mut ibverbs_sys::ibv_qp,
    send_cq: *mut ibverbs_sys::ibv_cq,
    recv_cq: *mut ibverbs_sys::ibv_cq,
    pub(super) ctx: Arc<RdmaContext>,
}

unsafe impl Send for QueuePair {}
unsafe impl Sync for QueuePair {}

/// Outcome of a single completion-queue poll.
pub(super) enum Poll {
    Empty,
    /// `(wr_id, byte_len)` of a successful work request.
    Done(u64, usize),
}

impl QueuePair {
    /// Post a signaled SEND of `len` bytes starting at the beginning of `mr`.
    pub(super) fn post_send(&self, mr: &RdmaMr, len: usize, wr_id: u64) -> Result<()> {
        unsafe {
            let mut sge: ibverbs_sys::ibv_sge = std::mem::zeroed();
            sge.addr = mr.addr();
            sge.length = len as u32;
            sge.lkey = mr.lkey();

            let mut wr: ibverbs_sys::ibv_send_wr = std::mem::zeroed();
            wr.wr_id = wr_id;
            wr.sg_list = &mut sge;
            wr.num_sge = 1;
            wr.opcode = ibv_wr_opcode::IBV_WR_SEND;
            wr.send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;

            let mut bad_wr: *mut ibverbs_sys::ibv_send_wr = ptr::null_mut();
            let ops = &mut (*(*self.qp).context).ops;
            let post_send = ops
                .post_send
                .as_mut()
                .ok_or_else(|| CollieError::device("RDMA: post_send missing"))?;
            let rc = post_send(self.qp, &mut wr, &mut bad_wr);
            if rc != 0 {
                return Err(CollieError::device(format!(
                    "RDMA: post_send failed (rc={rc})"
                )));
            }
        }
        Ok(())
    }

    /// Post a receive into `len` bytes of `mr` starting at `offset`.
    pub(super) fn post_recv(&self, mr: &RdmaMr, offset: usize, len: usize, wr_id: u64) -> Result<()> {
        unsafe {
            let mut sge: ibverbs_sys::ibv_sge = std::mem::zeroed();
            sge.addr = mr.addr() + offset as u64;
            sge.length = len as u32;
            sge.lkey = mr.lkey();

            let mut wr: ibverbs_sys::ibv_recv_wr = std::mem::zeroed();
            wr.wr_id = wr_id;
            wr.sg_list = &mut sge;
            wr.num_sge = 1;

            let mut bad_wr: *mut ibverbs_sys::ibv_recv_wr = ptr::null_mut();
            let ops = &mut (*(*self.qp).context).ops;
            let post_recv = ops
                .post_recv
                .as_mut()
                .ok_or_else(|| CollieError::device("RDMA: post_recv missing"))?;
            let rc = post_recv(self.qp, &mut wr, &mut bad_wr);
            if rc != 0 {
                return Err(CollieError::device(format!(
                    "RDMA: post_recv failed (rc={rc})"
                )));
            }
        }
        Ok(())
    }

    pub(super) fn poll_send(&self) -> Result<Poll> {
        poll_cq(self.send_cq)
    }

    pub(super) fn poll_recv(&self) -> Result<Poll> {
        poll_cq(self.recv_cq)
    }
}

impl Drop for QueuePair {
    fn drop(&mut self) {
        unsafe { destroy(self.qp, self.send_cq, self.recv_cq) }
    }
}

fn poll_cq(cq: *mut ibverbs_sys::ibv_cq) -> Result<Poll> {
    unsafe {
        let mut wc = ibverbs_sys::ibv_wc::default();
        let ops = &mut (*(*cq).context).ops;
        let poll = ops
            .poll_cq
            .as_mut()
            .ok_or_else(|| CollieError::device("RDMA: poll_cq missing"))?;
        let n = poll(cq, 1, &mut wc);
        if n < 0 {
            return Err(CollieError::device("RDMA: poll_cq failed"));
        }
        if n == 0 {
            return Ok(Poll::Empty);
        }
        if let Some((status, vendor_err)) = wc.error() {
            return Err(CollieError::device(format!(
                "RDMA: work completion failed (status={status:?}, vendor_err={vendor_err}, wr_id={})",
                wc.wr_id()
            )));
        }
        Ok(Poll::Done(wc.wr_id(), wc.len()))
    }
}

unsafe fn destroy(
    qp: *mut ibverbs_sys::ibv_qp,
    send_cq: *mut ibverbs_sys::ibv_cq,
    recv_cq: *mut ibverbs_sys::ibv_cq,
) {
    unsafe {
        if !qp.is_null() {
            ibverbs_sys::ibv_destroy_qp(qp);
        }
        if !send_cq.is_null() {
            ibverbs_sys::ibv_destroy_cq(send_cq);
        }
        if !recv_cq.is_null() {
            ibverbs_sys::ibv_destroy_cq(recv_cq);
        }
    }
}

/// Tiered backoff for completion polling: spin, then short sleeps.
pub(super) struct Backoff {
    iter: u32,
}

impl Backoff {
    pub(super) fn new() -> Self {
        Self { iter: 0 }
    }

    pub(super) fn reset(&mut self) {
        self.iter = 0;
    }

    pub(super) fn snooze(&mut self) {
        if self.iter < 1000 {
            std::hint::spin_loop();
        } else if self.iter < 5000 {
            std::thread::sleep(std::time::Duration::from_micros(10));
        } else {
            std::thread::sleep(std::time::Duration::from_micros(100));
        }
        self.iter = self.iter.saturating_add(1);
    }
}
