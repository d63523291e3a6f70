pub mod buffer;

pub use buffer::{BufferPtr, BufferRef, Device, Host, MemorySpace};
