use crate::error::Result;
use crate::types::DataType;

/// The compute-device boundary: copy and local-reduce capabilities on
/// memory the core does not own.
///
/// The collective engine only ever works on byte ranges of a caller buffer
/// through these three calls, so the same ring algorithm serves host and
/// device memory. Allocation stays with the caller.
///
/// - [`CpuAdapter`](super::CpuAdapter) (built-in): direct pointer access.
/// - Accelerator adapters: device-to-host / host-to-device copies and an
///   on-device add kernel, implemented outside this crate.
pub trait DeviceAdapter: Send + Sync {
    /// Copy `size_bytes` starting at `ptr` into a host buffer for sending.
    ///
    /// # Safety
    /// `ptr` must be valid for reads of `size_bytes` bytes.
    unsafe fn stage_for_send(&self, ptr: u64, size_bytes: usize) -> Result<Vec<u8>>;

    /// Copy received host bytes into memory at `dst_ptr`.
    ///
    /// # Safety
    /// `dst_ptr` must be valid for writes of `data.len()` bytes.
    unsafe fn receive_to_device(&self, data: &[u8], dst_ptr: u64) -> Result<()>;

    /// Local reduction: `dst[i] += src[i]` for `count` elements of `dtype`.
    ///
    /// # Safety
    /// `dst_ptr` must be valid for reads and writes of
    /// `count * dtype.size_in_bytes()` bytes.
    unsafe fn reduce_sum_inplace(
        &self,
        dst_ptr: u64,
        src: &[u8],
        count: usize,
        dtype: DataType,
    ) -> Result<()>;
}
