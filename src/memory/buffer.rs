//! Typed buffer references that encode memory space in the type system.
//!
//! Zero-cost wrappers around raw `u64` pointers. The type parameter keeps a
//! host pointer from being handed to the device path and vice versa; the
//! process group routes `Host` buffers through direct pointer access and
//! `Device` buffers through its [`DeviceAdapter`](crate::DeviceAdapter).

use crate::error::{CollieError, Result};
use crate::types::DataType;
use std::marker::PhantomData;

mod private {
    pub trait Sealed {}
}

/// Marker trait for memory spaces (host vs device).
pub trait MemorySpace: private::Sealed {
    /// Whether buffers in this space must go through the device adapter.
    const IS_DEVICE: bool;
}

/// Host (CPU) memory.
pub enum Host {}
impl private::Sealed for Host {}
impl MemorySpace for Host {
    const IS_DEVICE: bool = false;
}

/// Device (accelerator) memory.
pub enum Device {}
impl private::Sealed for Device {}
impl MemorySpace for Device {
    const IS_DEVICE: bool = true;
}

/// A typed pointer to memory in a specific memory space.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferPtr<S: MemorySpace> {
    ptr: u64,
    _space: PhantomData<S>,
}

impl<S: MemorySpace> BufferPtr<S> {
    /// Wrap a raw `u64` pointer.
    ///
    /// # Safety
    /// The pointer must actually point to memory in the space `S`.
    pub unsafe fn new(ptr: u64) -> Self {
        Self {
            ptr,
            _space: PhantomData,
        }
    }

    pub fn as_u64(&self) -> u64 {
        self.ptr
    }
}

impl<S: MemorySpace> std::fmt::Display for BufferPtr<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BufferPtr(0x{:x})", self.ptr)
    }
}

/// A typed, sized buffer reference in a specific memory space.
///
/// The core never allocates or frees the memory behind it; it only reads
/// and writes within `len_bytes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferRef<S: MemorySpace> {
    ptr: BufferPtr<S>,
    len_bytes: usize,
}

impl<S: MemorySpace> BufferRef<S> {
    /// # Safety
    /// `ptr` must point to at least `len_bytes` of valid memory in space `S`
    /// for as long as the reference is used.
    pub unsafe fn new(ptr: u64, len_bytes: usize) -> Self {
        Self {
            ptr: unsafe { BufferPtr::new(ptr) },
            len_bytes,
        }
    }

    pub fn ptr(&self) -> &BufferPtr<S> {
        &self.ptr
    }

    pub fn len_bytes(&self) -> usize {
        self.len_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.len_bytes == 0
    }

    pub fn as_u64(&self) -> u64 {
        self.ptr.as_u64()
    }

    /// Number of `dtype` elements in the buffer.
    ///
    /// Fails if the byte length is not a whole number of elements.
    pub fn element_count(&self, dtype: DataType) -> Result<usize> {
        let size = dtype.size_in_bytes();
        if self.len_bytes % size != 0 {
            return Err(CollieError::configuration(format!(
                "buffer of {} bytes is not a whole number of {dtype} elements",
                self.len_bytes
            )));
        }
        Ok(self.len_bytes / size)
    }
}

impl<S: MemorySpace> std::fmt::Display for BufferRef<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "BufferRef(0x{:x}, {}B)",
            self.ptr.as_u64(),
            self.len_bytes
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_ref_size() {
        let data: Vec<u8> = vec![0; 1024];
        let buf = unsafe { BufferRef::<Host>::new(data.as_ptr() as u64, 1024) };
        assert_eq!(buf.len_bytes(), 1024);
        assert_eq!(buf.as_u64(), data.as_ptr() as u64);
        assert!(!buf.is_empty());
    }

    #[test]
    fn test_element_count() {
        let buf = unsafe { BufferRef::<Host>::new(0x1000, 24) };
        assert_eq!(buf.element_count(DataType::F32).unwrap(), 6);
        assert_eq!(buf.element_count(DataType::F64).unwrap(), 3);
        assert!(buf.element_count(DataType::I64).is_ok());

        let odd = unsafe { BufferRef::<Host>::new(0x1000, 6) };
        assert!(odd.element_count(DataType::F32).is_err());
    }

    #[test]
    fn test_memory_space_flags() {
        assert!(!Host::IS_DEVICE);
        assert!(Device::IS_DEVICE);
    }

    #[test]
    fn test_display() {
        let ptr = unsafe { BufferPtr::<Device>::new(0xDEAD) };
        assert!(ptr.to_string().contains("0xdead"));

        let buf = unsafe { BufferRef::<Host>::new(0xFF, 256) };
        let s = buf.to_string();
        assert!(s.contains("0xff"));
        assert!(s.contains("256B"));
    }
}
