use super::ProcessGroup;
use crate::collective::{dissemination_barrier, ring_allreduce};
use crate::device::CpuAdapter;
use crate::error::Result;
use crate::memory::{BufferRef, MemorySpace};
use crate::types::{DataType, Element};
use std::time::Duration;

impl ProcessGroup {
    /// Element-wise sum of `buf` across all ranks, in place.
    ///
    /// Every rank must call this with a buffer of the same length and type,
    /// in the same position of its operation sequence. On return each rank
    /// holds the identical sum. Uses the group's default operation timeout.
    pub async fn all_reduce_sum<T: Element>(&self, buf: &mut [T]) -> Result<()> {
        self.all_reduce_sum_with_timeout(buf, self.config.operation_timeout)
            .await
    }

    /// [`all_reduce_sum`](Self::all_reduce_sum) with an explicit deadline.
    /// `None` waits indefinitely.
    pub async fn all_reduce_sum_with_timeout<T: Element>(
        &self,
        buf: &mut [T],
        timeout: Option<Duration>,
    ) -> Result<()> {
        let op = self.begin("all_reduce_sum")?.with_timeout(timeout);
        // SAFETY: the exclusive borrow keeps the slice valid and unaliased
        // for the whole call.
        unsafe {
            ring_allreduce(
                &op,
                &CpuAdapter,
                buf.as_mut_ptr() as u64,
                buf.len(),
                T::DTYPE,
            )
            .await
        }
    }

    /// All-reduce (sum) on a raw buffer in host or device memory.
    ///
    /// Device buffers go through the group's [`DeviceAdapter`](crate::DeviceAdapter).
    /// The byte length must be a whole number of `dtype` elements.
    pub async fn all_reduce_sum_buffer<S: MemorySpace>(
        &self,
        buf: &mut BufferRef<S>,
        dtype: DataType,
    ) -> Result<()> {
        self.all_reduce_sum_buffer_with_timeout(buf, dtype, self.config.operation_timeout)
            .await
    }

    pub async fn all_reduce_sum_buffer_with_timeout<S: MemorySpace>(
        &self,
        buf: &mut BufferRef<S>,
        dtype: DataType,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let count = buf.element_count(dtype)?;
        let op = self.begin("all_reduce_sum")?.with_timeout(timeout);
        // SAFETY: `BufferRef::new` obliges the creator to keep the memory
        // valid; `&mut` keeps this call the only user.
        unsafe {
            ring_allreduce(&op, self.adapter_for::<S>(), buf.as_u64(), count, dtype).await
        }
    }

    /// Block until every rank of the group has entered the barrier.
    pub async fn barrier(&self) -> Result<()> {
        self.barrier_with_timeout(self.config.operation_timeout)
            .await
    }

    pub async fn barrier_with_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        let op = self.begin("barrier")?.with_timeout(timeout);
        let epoch = self.next_barrier_epoch();
        dissemination_barrier(&op, epoch).await
    }
}
