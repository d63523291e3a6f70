//! Registered RDMA memory regions.

use super::context::RdmaContext;
use std::sync::Arc;

/// A heap buffer registered with the device's protection domain.
pub struct RdmaMr {
    mr: *mut ibverbs_sys::ibv_mr,
    ptr: *mut u8,
    size: usize,
    // Deregistration must happen before the PD is released.
    _ctx: Arc<RdmaContext>,
}

unsafe impl Send for RdmaMr {}
unsafe impl Sync for RdmaMr {}

impl RdmaMr {
    pub(super) fn new(
        mr: *mut ibverbs_sys::ibv_mr,
        ptr: *mut u8,
        size: usize,
        ctx: Arc<RdmaContext>,
    ) -> Self {
        Self {
            mr,
            ptr,
            size,
            _ctx: ctx,
        }
    }

    pub fn lkey(&self) -> u32 {
        unsafe { (*self.mr).lkey }
    }

    pub fn addr(&self) -> u64 {
        self.ptr as u64
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.size) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.size) }
    }
}

impl Drop for RdmaMr {
    fn drop(&mut self) {
        unsafe {
            if !self.mr.is_null() {
                ibverbs_sys::ibv_dereg_mr(self.mr);
            }
            if !self.ptr.is_null() {
                drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                    self.ptr, self.size,
                )));
            }
        }
    }
}
