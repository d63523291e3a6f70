//! Per-device RDMA resources: device context and protection domain.

use super::connection::{PreparedQueuePair, RdmaEndpoint};
use super::mr::RdmaMr;
use crate::config::FabricSpec;
use crate::error::{CollieError, Result};
use ibverbs_sys::ibv_access_flags;
use std::ffi::CStr;
use std::os::raw::c_int;
use std::ptr;
use std::sync::Arc;

/// Completion queue depth per queue pair side.
const CQ_DEPTH: c_int = 256;

/// An opened RDMA device.
///
/// Owns the ibverbs context and protection domain. Queue pairs and memory
/// regions created from it hold an `Arc` so the device outlives them.
pub struct RdmaContext {
    pub(super) ctx: *mut ibverbs_sys::ibv_context,
    pub(super) pd: *mut ibverbs_sys::ibv_pd,
    pub(super) port: u8,
    pub(super) gid_index: u8,
    gid: [u8; 16],
}

unsafe impl Send for RdmaContext {}
unsafe impl Sync for RdmaContext {}

impl RdmaContext {
    /// Open the device named in `spec` and check that `gid_index` is valid
    /// on its port.
    pub fn open(spec: &FabricSpec, gid_index: u8) -> Result<Arc<Self>> {
        unsafe {
            let mut num_devices: c_int = 0;
            let dev_list = ibverbs_sys::ibv_get_device_list(&mut num_devices);
            if dev_list.is_null() || num_devices == 0 {
                return Err(CollieError::device("RDMA: no devices found"));
            }

            let mut found = ptr::null_mut();
            for i in 0..num_devices as usize {
                let dev = *dev_list.add(i);
                let name = ibverbs_sys::ibv_get_device_name(dev);
                if !name.is_null() && CStr::from_ptr(name).to_bytes() == spec.device.as_bytes() {
                    found = dev;
                    break;
                }
            }
            if found.is_null() {
                ibverbs_sys::ibv_free_device_list(dev_list);
                return Err(CollieError::device(format!(
                    "RDMA: device '{}' not found ({num_devices} present)",
                    spec.device
                )));
            }

            let ctx = ibverbs_sys::ibv_open_device(found);
            ibverbs_sys::ibv_free_device_list(dev_list);
            if ctx.is_null() {
                return Err(CollieError::device(format!(
                    "RDMA: ibv_open_device({}) failed",
                    spec.device
                )));
            }

            let pd = ibverbs_sys::ibv_alloc_pd(ctx);
            if pd.is_null() {
                ibverbs_sys::ibv_close_device(ctx);
                return Err(CollieError::device("RDMA: ibv_alloc_pd failed"));
            }

            let mut gid: ibverbs_sys::ibv_gid = std::mem::zeroed();
            let rc = ibverbs_sys::ibv_query_gid(ctx, spec.port, gid_index as c_int, &mut gid);
            if rc != 0 {
                ibverbs_sys::ibv_dealloc_pd(pd);
                ibverbs_sys::ibv_close_device(ctx);
                return Err(CollieError::device(format!(
                    "RDMA: ibv_query_gid(port={}, index={gid_index}) failed (rc={rc})",
                    spec.port
                )));
            }

            Ok(Arc::new(Self {
                ctx,
                pd,
                port: spec.port,
                gid_index,
                gid: gid.raw,
            }))
        }
    }

    /// Allocate and register a zeroed memory region of `size` bytes.
    pub fn allocate(self: &Arc<Self>, size: usize) -> Result<RdmaMr> {
        unsafe {
            let buf = vec![0u8; size].into_boxed_slice();
            let ptr = Box::into_raw(buf) as *mut u8;

            let access = ibv_access_flags::IBV_ACCESS_LOCAL_WRITE;
            let mr = ibverbs_sys::ibv_reg_mr(self.pd, ptr as *mut _, size, access.0 as c_int);
            if mr.is_null() {
                drop(Box::from_raw(ptr::slice_from_raw_parts_mut(ptr, size)));
                return Err(CollieError::device(format!(
                    "RDMA: ibv_reg_mr failed for size={size}"
                )));
            }

            Ok(RdmaMr::new(mr, ptr, size, Arc::clone(self)))
        }
    }

    /// Create a queue pair in INIT state with its own completion queues.
    pub fn prepare_connection(self: &Arc<Self>) -> Result<PreparedQueuePair> {
        unsafe {
            let send_cq = ibverbs_sys::ibv_create_cq(
                self.ctx,
                CQ_DEPTH,
                ptr::null_mut(),
                ptr::null_mut(),
                0,
            );
            if send_cq.is_null() {
                return Err(CollieError::device("RDMA: ibv_create_cq (send) failed"));
            }
            let recv_cq = ibverbs_sys::ibv_create_cq(
                self.ctx,
                CQ_DEPTH,
                ptr::null_mut(),
                ptr::null_mut(),
                0,
            );
            if recv_cq.is_null() {
                ibverbs_sys::ibv_destroy_cq(send_cq);
                return Err(CollieError::device("RDMA: ibv_create_cq (recv) failed"));
            }

            let mut init_attr: ibverbs_sys::ibv_qp_init_attr = std::mem::zeroed();
            init_attr.qp_type = ibverbs_sys::ibv_qp_type::IBV_QPT_RC;
            init_attr.send_cq = send_cq;
            init_attr.recv_cq = recv_cq;
            init_attr.cap.max_send_wr = 16;
            init_attr.cap.max_recv_wr = super::transport::RECV_SLOTS as u32;
            init_attr.cap.max_send_sge = 1;
            init_attr.cap.max_recv_sge = 1;

            let qp = ibverbs_sys::ibv_create_qp(self.pd, &mut init_attr);
            if qp.is_null() {
                ibverbs_sys::ibv_destroy_cq(recv_cq);
                ibverbs_sys::ibv_destroy_cq(send_cq);
                return Err(CollieError::device("RDMA: ibv_create_qp failed"));
            }

            // From here on PreparedQueuePair's Drop releases the QP and CQs.
            let prepared = PreparedQueuePair {
                qp,
                send_cq,
                recv_cq,
                local: RdmaEndpoint {
                    qp_num: (*qp).qp_num,
                    // RoCE routes by GID; the LID is only meaningful on IB
                    // fabrics with a subnet manager and is left at 0.
                    lid: 0,
                    gid: self.gid,
                },
                ctx: Arc::clone(self),
            };

            let mut attr: ibverbs_sys::ibv_qp_attr = std::mem::zeroed();
            attr.qp_state = ibverbs_sys::ibv_qp_state::IBV_QPS_INIT;
            attr.pkey_index = 0;
            attr.port_num = self.port;
            attr.qp_access_flags = ibv_access_flags::IBV_ACCESS_LOCAL_WRITE.0;

            let mask = ibverbs_sys::ibv_qp_attr_mask::IBV_QP_STATE
                | ibverbs_sys::ibv_qp_attr_mask::IBV_QP_PKEY_INDEX
                | ibverbs_sys::ibv_qp_attr_mask::IBV_QP_PORT
                | ibverbs_sys::ibv_qp_attr_mask::IBV_QP_ACCESS_FLAGS;

            let rc = ibverbs_sys::ibv_modify_qp(qp, &mut attr, mask.0 as c_int);
            if rc != 0 {
                return Err(CollieError::device(format!(
                    "RDMA: ibv_modify_qp to INIT failed (rc={rc})"
                )));
            }

            Ok(prepared)
        }
    }
}

impl Drop for RdmaContext {
    fn drop(&mut self) {
        unsafe {
            if !self.pd.is_null() {
                ibverbs_sys::ibv_dealloc_pd(self.pd);
            }
            if !self.ctx.is_null() {
                ibverbs_sys::ibv_close_device(self.ctx);
            }
        }
    }
}
