use crate::types::Rank;

pub type Result<T> = std::result::Result<T, CollieError>;

#[derive(Debug, thiserror::Error)]
pub enum CollieError {
    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    #[error("rendezvous timed out after {timeout_ms}ms while {stage}")]
    RendezvousTimeout { stage: String, timeout_ms: u64 },

    #[error("rendezvous mismatch: {reason}")]
    RendezvousMismatch { reason: String },

    #[error("connection to rank {rank} lost: {reason}")]
    PeerConnectionLost { rank: Rank, reason: String },

    #[error("{operation} timed out after {timeout_ms}ms")]
    OperationTimeout {
        operation: &'static str,
        timeout_ms: u64,
    },

    #[error("process group destroyed")]
    GroupDestroyed,

    #[error("buffer size mismatch: expected {expected} bytes, got {actual}")]
    BufferSizeMismatch { expected: usize, actual: usize },

    #[error("protocol version mismatch: local={local}, remote={remote}")]
    ProtocolMismatch { local: u16, remote: u16 },

    #[error("message decode failed: {0}")]
    DecodeFailed(String),

    #[error("message encode failed: {0}")]
    EncodeFailed(String),

    #[error("transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("device adapter error: {message}")]
    DeviceError {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CollieError {
    /// Create a `Configuration` error.
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    /// Create a `Transport` error with just a message.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport {
            message: msg.into(),
            source: None,
        }
    }

    /// Create a `Transport` error with a message and a source error.
    pub fn transport_with_source(
        msg: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transport {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a `DeviceError` with just a message.
    pub fn device(msg: impl Into<String>) -> Self {
        Self::DeviceError {
            message: msg.into(),
            source: None,
        }
    }

    /// Create a `DeviceError` with a message and a source error.
    pub fn device_with_source(
        msg: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::DeviceError {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Whether this error leaves the group's connections in an unknown state.
    ///
    /// Precondition failures (bad rank, wrong buffer size on the local side)
    /// do not touch the wire and leave the group usable.
    pub fn invalidates_group(&self) -> bool {
        matches!(
            self,
            CollieError::PeerConnectionLost { .. }
                | CollieError::OperationTimeout { .. }
                | CollieError::Transport { .. }
                | CollieError::DecodeFailed(_)
                | CollieError::Io(_)
        )
    }
}
