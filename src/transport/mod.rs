//! Point-to-point byte channels between two ranks.
//!
//! Every pair of ranks in a group owns exactly one [`PeerTransport`]. TCP is
//! always available; an RDMA reliable-connected queue pair replaces it for
//! data frames when both sides negotiate a fabric (feature `rdma`).

pub mod fabric;
pub mod iface;
mod listener;
#[cfg(feature = "rdma")]
pub mod rdma;
pub mod tcp;

use crate::error::Result;
use futures::future::BoxFuture;

pub use listener::TransportListener;
pub use tcp::TcpTransport;

/// Frame tags on an established pair connection.
///
/// A receiver always knows which kind of frame it expects next; a different
/// tag means the two ranks disagree about the operation in progress.
pub mod tags {
    pub const P2P: u64 = 1;
    pub const ALL_REDUCE: u64 = 2;
    pub const BARRIER: u64 = 3;
}

/// Which data path a pair ended up on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Tcp,
    Rdma,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Tcp => f.write_str("tcp"),
            TransportKind::Rdma => f.write_str("rdma"),
        }
    }
}

/// Ordered, reliable, bidirectional frame channel to a single peer.
///
/// Frames are delivered in send order, never duplicated, and a broken
/// connection surfaces as an error on the next call instead of being
/// swallowed. A send and a receive may be in flight at the same time.
pub trait PeerTransport: Send + Sync {
    /// Send one frame; resolves once the transport has accepted all bytes.
    fn send_frame<'a>(&'a self, tag: u64, payload: Vec<u8>) -> BoxFuture<'a, Result<()>>;

    /// Receive the next frame, which must carry `tag`.
    fn recv_frame<'a>(&'a self, tag: u64) -> BoxFuture<'a, Result<Vec<u8>>>;

    /// Tear the connection down. Idempotent; pending and later calls fail.
    fn close(&self);

    fn kind(&self) -> TransportKind;
}
