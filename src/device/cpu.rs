use crate::device::adapter::DeviceAdapter;
use crate::error::{CollieError, Result};
use crate::reduce::sum_into;
use crate::types::DataType;

/// DeviceAdapter for host memory. Direct pointer access, no staging copies
/// beyond the send buffer itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuAdapter;

impl CpuAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl DeviceAdapter for CpuAdapter {
    unsafe fn stage_for_send(&self, ptr: u64, size_bytes: usize) -> Result<Vec<u8>> {
        if size_bytes == 0 {
            return Ok(Vec::new());
        }
        let slice = unsafe { std::slice::from_raw_parts(ptr as *const u8, size_bytes) };
        Ok(slice.to_vec())
    }

    unsafe fn receive_to_device(&self, data: &[u8], dst_ptr: u64) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst_ptr as *mut u8, data.len());
        }
        Ok(())
    }

    unsafe fn reduce_sum_inplace(
        &self,
        dst_ptr: u64,
        src: &[u8],
        count: usize,
        dtype: DataType,
    ) -> Result<()> {
        let expected = count * dtype.size_in_bytes();
        if src.len() != expected {
            return Err(CollieError::BufferSizeMismatch {
                expected,
                actual: src.len(),
            });
        }
        if expected == 0 {
            return Ok(());
        }
        let dst = unsafe { std::slice::from_raw_parts_mut(dst_ptr as *mut u8, expected) };
        sum_into(dst, src, count, dtype)
    }
}
