use super::ProcessGroup;
use crate::device::{CpuAdapter, DeviceAdapter};
use crate::error::{CollieError, Result};
use crate::memory::{BufferRef, MemorySpace};
use crate::transport::tags;
use crate::types::{Element, Rank};
use std::time::Duration;

impl ProcessGroup {
    /// Send `buf` to `dst`. Returns once the transport has taken every byte;
    /// it does not wait for the receiver to post its `recv`.
    ///
    /// Sends from this rank to `dst` are delivered in call order.
    pub async fn send<T: Element>(&self, dst: Rank, buf: &[T]) -> Result<()> {
        self.send_with_timeout(dst, buf, self.config.operation_timeout)
            .await
    }

    pub async fn send_with_timeout<T: Element>(
        &self,
        dst: Rank,
        buf: &[T],
        timeout: Option<Duration>,
    ) -> Result<()> {
        // SAFETY: the slice is borrowed for the whole call.
        unsafe {
            self.send_raw(
                dst,
                &CpuAdapter,
                buf.as_ptr() as u64,
                std::mem::size_of_val(buf),
                timeout,
            )
            .await
        }
    }

    /// Receive exactly `buf.len()` elements from `src` into `buf`.
    ///
    /// A message of any other size fails with
    /// [`CollieError::BufferSizeMismatch`] and leaves `buf` untouched.
    pub async fn recv<T: Element>(&self, src: Rank, buf: &mut [T]) -> Result<()> {
        self.recv_with_timeout(src, buf, self.config.operation_timeout)
            .await
    }

    pub async fn recv_with_timeout<T: Element>(
        &self,
        src: Rank,
        buf: &mut [T],
        timeout: Option<Duration>,
    ) -> Result<()> {
        // SAFETY: the exclusive borrow keeps the slice valid and unaliased.
        unsafe {
            self.recv_raw(
                src,
                &CpuAdapter,
                buf.as_mut_ptr() as u64,
                std::mem::size_of_val(buf),
                timeout,
            )
            .await
        }
    }

    /// Send the contents of a host or device buffer to `dst`.
    pub async fn send_buffer<S: MemorySpace>(&self, dst: Rank, buf: &BufferRef<S>) -> Result<()> {
        self.send_buffer_with_timeout(dst, buf, self.config.operation_timeout)
            .await
    }

    pub async fn send_buffer_with_timeout<S: MemorySpace>(
        &self,
        dst: Rank,
        buf: &BufferRef<S>,
        timeout: Option<Duration>,
    ) -> Result<()> {
        // SAFETY: validity is the obligation of `BufferRef::new`.
        unsafe {
            self.send_raw(
                dst,
                self.adapter_for::<S>(),
                buf.as_u64(),
                buf.len_bytes(),
                timeout,
            )
            .await
        }
    }

    /// Receive exactly `buf.len_bytes()` bytes from `src` into a host or
    /// device buffer.
    pub async fn recv_buffer<S: MemorySpace>(
        &self,
        src: Rank,
        buf: &mut BufferRef<S>,
    ) -> Result<()> {
        self.recv_buffer_with_timeout(src, buf, self.config.operation_timeout)
            .await
    }

    pub async fn recv_buffer_with_timeout<S: MemorySpace>(
        &self,
        src: Rank,
        buf: &mut BufferRef<S>,
        timeout: Option<Duration>,
    ) -> Result<()> {
        // SAFETY: validity is the obligation of `BufferRef::new`.
        unsafe {
            self.recv_raw(
                src,
                self.adapter_for::<S>(),
                buf.as_u64(),
                buf.len_bytes(),
                timeout,
            )
            .await
        }
    }

    /// # Safety
    /// `ptr` must be valid for reads of `len` bytes through `adapter`.
    async unsafe fn send_raw(
        &self,
        dst: Rank,
        adapter: &dyn DeviceAdapter,
        ptr: u64,
        len: usize,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let op = self.begin("send")?;
        self.check_peer(dst, "send")?;
        let op = op.with_timeout(timeout);

        let payload = unsafe { adapter.stage_for_send(ptr, len)? };
        op.send(dst, tags::P2P, payload).await
    }

    /// # Safety
    /// `ptr` must be valid for writes of `len` bytes through `adapter`.
    async unsafe fn recv_raw(
        &self,
        src: Rank,
        adapter: &dyn DeviceAdapter,
        ptr: u64,
        len: usize,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let op = self.begin("recv")?;
        self.check_peer(src, "recv")?;
        let op = op.with_timeout(timeout);

        let payload = op.recv(src, tags::P2P).await?;
        if payload.len() != len {
            return Err(CollieError::BufferSizeMismatch {
                expected: len,
                actual: payload.len(),
            });
        }
        unsafe { adapter.receive_to_device(&payload, ptr) }
    }
}
