//! RDMA data path for InfiniBand/RoCE fabrics over raw `ibverbs-sys`.
//!
//! Only compiled when the `rdma` feature is enabled.

mod connection;
mod context;
mod mr;
mod transport;

pub use connection::{PreparedQueuePair, QueuePair, RdmaEndpoint};
pub use context::RdmaContext;
pub use mr::RdmaMr;
pub use transport::RdmaTransport;
