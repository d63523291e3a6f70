mod collective;
pub mod config;
pub mod device;
pub mod error;
pub mod group;
pub mod memory;
pub mod protocol;
mod reduce;
pub mod rendezvous;
mod sync_group;
pub mod transport;
pub mod types;

pub use config::{CollieConfig, FabricSpec};
pub use device::{CpuAdapter, DeviceAdapter};
pub use error::{CollieError, Result};
pub use group::{GroupState, ProcessGroup};
pub use memory::{BufferPtr, BufferRef, Device, Host, MemorySpace};
pub use rendezvous::{Rendezvous, RendezvousListener, join};
pub use sync_group::SyncProcessGroup;
pub use transport::TransportKind;
pub use types::{DataType, Element, GroupToken, Rank};
