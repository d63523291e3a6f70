//! Runtime configuration for rendezvous, transports and operation deadlines.
//!
//! All values have sensible defaults. A `CollieConfig` is passed explicitly
//! into [`Rendezvous`](crate::Rendezvous); `from_env()` is a convenience
//! that reads `COLLIE_*` variables once and returns a plain value.

use crate::error::{CollieError, Result};
use std::time::Duration;

/// Identifies the high-speed fabric device to prefer, written `device[:port]`
/// (for example `mlx5_0:1`). The port defaults to 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FabricSpec {
    pub device: String,
    pub port: u8,
}

impl FabricSpec {
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        let (device, port) = match s.split_once(':') {
            Some((dev, port)) => {
                let port = port.parse::<u8>().ok().filter(|p| *p > 0).ok_or_else(|| {
                    CollieError::configuration(format!("invalid fabric port in '{s}'"))
                })?;
                (dev, port)
            }
            None => (s, 1),
        };
        if device.is_empty() {
            return Err(CollieError::configuration(format!(
                "empty fabric device name in '{s}'"
            )));
        }
        Ok(Self {
            device: device.to_string(),
            port,
        })
    }
}

impl std::fmt::Display for FabricSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.device, self.port)
    }
}

/// Tuning and transport-selection parameters.
#[derive(Debug, Clone)]
pub struct CollieConfig {
    /// Bound on the whole rendezvous: dial retries, identity exchange and
    /// full-mesh establishment.
    pub rendezvous_timeout: Duration,

    /// Default deadline for collective and point-to-point calls.
    /// `None` waits indefinitely; connection loss still surfaces.
    pub operation_timeout: Option<Duration>,

    /// First retry delay when dialing a peer that is not listening yet.
    pub connect_backoff_initial: Duration,

    /// Cap on the exponential dial backoff.
    pub connect_backoff_max: Duration,

    /// RDMA device to prefer for data transfers. `None` selects TCP.
    pub preferred_fabric: Option<FabricSpec>,

    /// GID table index used for RoCE addressing.
    pub gid_index: u8,

    /// Interface whose address is advertised for TCP data connections.
    pub fallback_interface: Option<String>,

    /// Size of each registered RDMA staging region.
    pub fabric_chunk_bytes: usize,
}

impl Default for CollieConfig {
    fn default() -> Self {
        Self {
            rendezvous_timeout: Duration::from_secs(60),
            operation_timeout: Some(Duration::from_secs(300)),
            connect_backoff_initial: Duration::from_millis(50),
            connect_backoff_max: Duration::from_secs(2),
            preferred_fabric: None,
            gid_index: 0,
            fallback_interface: None,
            fabric_chunk_bytes: 4 * 1024 * 1024, // 4 MiB
        }
    }
}

impl CollieConfig {
    /// Load config from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `COLLIE_RENDEZVOUS_TIMEOUT_SECS`
    /// - `COLLIE_OPERATION_TIMEOUT_SECS` (`0` disables the deadline)
    /// - `COLLIE_IB_HCA` (`device[:port]`)
    /// - `COLLIE_IB_GID_INDEX`
    /// - `COLLIE_SOCKET_IFNAME`
    /// - `COLLIE_FABRIC_CHUNK_BYTES`
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(s) = env_parse::<u64>("COLLIE_RENDEZVOUS_TIMEOUT_SECS") {
            cfg.rendezvous_timeout = Duration::from_secs(s);
        }
        if let Some(s) = env_parse::<u64>("COLLIE_OPERATION_TIMEOUT_SECS") {
            cfg.operation_timeout = (s > 0).then(|| Duration::from_secs(s));
        }
        if let Ok(v) = std::env::var("COLLIE_IB_HCA") {
            match FabricSpec::parse(&v) {
                Ok(spec) => cfg.preferred_fabric = Some(spec),
                Err(e) => tracing::warn!("ignoring COLLIE_IB_HCA: {e}"),
            }
        }
        if let Some(idx) = env_parse::<u8>("COLLIE_IB_GID_INDEX") {
            cfg.gid_index = idx;
        }
        if let Ok(v) = std::env::var("COLLIE_SOCKET_IFNAME") {
            if !v.trim().is_empty() {
                cfg.fallback_interface = Some(v.trim().to_string());
            }
        }
        if let Some(n) = env_parse::<usize>("COLLIE_FABRIC_CHUNK_BYTES") {
            if n > 0 {
                cfg.fabric_chunk_bytes = n;
            }
        }

        cfg
    }

    pub fn with_rendezvous_timeout(mut self, timeout: Duration) -> Self {
        self.rendezvous_timeout = timeout;
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn with_preferred_fabric(mut self, fabric: Option<FabricSpec>) -> Self {
        self.preferred_fabric = fabric;
        self
    }

    pub fn with_fallback_interface(mut self, iface: Option<String>) -> Self {
        self.fallback_interface = iface;
        self
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let v = std::env::var(name).ok()?;
    match v.trim().parse::<T>() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!("ignoring unparsable {name}={v:?}");
            None
        }
    }
}
