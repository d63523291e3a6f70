//! Group formation: rank 0 collects identities, publishes the membership
//! table, then every pair of ranks connects directly.
//!
//! ```no_run
//! use collie::{GroupToken, Rendezvous};
//! use std::time::Duration;
//!
//! # async fn example() -> collie::Result<()> {
//! let group = Rendezvous::new(1, 4, "10.0.0.1:29500", GroupToken::from("job-42"))
//!     .with_timeout(Duration::from_secs(30))
//!     .join()
//!     .await?;
//! assert_eq!(group.world_size(), 4);
//! # Ok(())
//! # }
//! ```

mod coordinator;
mod local;
mod mesh;

use crate::config::CollieConfig;
use crate::device::{CpuAdapter, DeviceAdapter};
use crate::error::{CollieError, Result};
use crate::group::ProcessGroup;
use crate::transport::TransportListener;
use crate::transport::fabric::LocalFabric;
use crate::types::{GroupToken, Rank};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Rank 0's rendezvous endpoint, bound ahead of `join`.
///
/// Binding first lets rank 0 use port 0 and publish the real address to the
/// other ranks before any of them dial.
pub struct RendezvousListener {
    inner: TransportListener,
}

impl RendezvousListener {
    pub async fn bind(address: &str) -> Result<Self> {
        let addr = resolve(address).await?;
        Ok(Self {
            inner: TransportListener::bind(addr).await?,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr()
    }
}

/// Parameters for joining one process group.
pub struct Rendezvous {
    rank: Rank,
    world_size: u32,
    address: String,
    token: GroupToken,
    config: CollieConfig,
    adapter: Arc<dyn DeviceAdapter>,
    listener: Option<RendezvousListener>,
}

impl Rendezvous {
    /// `address` is rank 0's rendezvous endpoint as `host:port`. Rank 0
    /// listens on it; every other rank dials it.
    pub fn new(
        rank: Rank,
        world_size: u32,
        address: impl Into<String>,
        token: impl Into<GroupToken>,
    ) -> Self {
        Self {
            rank,
            world_size,
            address: address.into(),
            token: token.into(),
            config: CollieConfig::default(),
            adapter: Arc::new(CpuAdapter::new()),
            listener: None,
        }
    }

    /// Build from launcher-provided environment variables:
    /// `COLLIE_RANK`, `COLLIE_WORLD_SIZE`, `COLLIE_MASTER_ADDR`,
    /// `COLLIE_MASTER_PORT` and `COLLIE_GROUP_TOKEN`. Tuning comes from
    /// [`CollieConfig::from_env`].
    pub fn from_env() -> Result<Self> {
        let rank: Rank = env_required("COLLIE_RANK")?;
        let world_size: u32 = env_required("COLLIE_WORLD_SIZE")?;
        let host: String = env_required("COLLIE_MASTER_ADDR")?;
        let port: u16 = env_required("COLLIE_MASTER_PORT")?;
        let token: String = env_required("COLLIE_GROUP_TOKEN")?;

        let address = if host.contains(':') && !host.starts_with('[') {
            format!("[{host}]:{port}")
        } else {
            format!("{host}:{port}")
        };
        Ok(Self::new(rank, world_size, address, token).with_config(CollieConfig::from_env()))
    }

    pub fn with_config(mut self, config: CollieConfig) -> Self {
        self.config = config;
        self
    }

    /// Bound on the whole rendezvous, including full-mesh setup.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.rendezvous_timeout = timeout;
        self
    }

    /// Adapter used for `Device` buffers in the formed group.
    pub fn with_adapter(mut self, adapter: Arc<dyn DeviceAdapter>) -> Self {
        self.adapter = adapter;
        self
    }

    /// Use an already bound listener (rank 0 only).
    pub fn with_listener(mut self, listener: RendezvousListener) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn world_size(&self) -> u32 {
        self.world_size
    }

    fn validate(&self) -> Result<()> {
        if self.world_size == 0 {
            return Err(CollieError::configuration("world_size must be at least 1"));
        }
        if self.rank >= self.world_size {
            return Err(CollieError::configuration(format!(
                "rank {} out of range for world_size {}",
                self.rank, self.world_size
            )));
        }
        if self.rank != 0 && self.listener.is_some() {
            return Err(CollieError::configuration(
                "only rank 0 accepts a rendezvous listener",
            ));
        }
        if self.listener.is_none() && self.address.trim().is_empty() {
            return Err(CollieError::configuration("empty rendezvous address"));
        }
        Ok(())
    }

    /// Run the rendezvous and return an `Active` group.
    ///
    /// Fails with `RendezvousTimeout` if the group is not fully connected
    /// within the configured timeout, or `RendezvousMismatch` if any rank
    /// disagrees on token, world size, rank assignment or protocol version.
    /// Partially opened connections are closed on failure.
    pub async fn join(self) -> Result<ProcessGroup> {
        self.validate()?;
        let deadline = Instant::now() + self.config.rendezvous_timeout;

        if self.world_size == 1 {
            let group = ProcessGroup::new(
                0,
                1,
                self.token,
                HashMap::new(),
                self.adapter,
                self.config,
            );
            group.activate();
            tracing::info!(rank = 0, world_size = 1, "process group active");
            return Ok(group);
        }

        let fabric = LocalFabric::open(&self.config);
        let ctx = JoinContext {
            rank: self.rank,
            world_size: self.world_size,
            token: &self.token,
            config: &self.config,
            fabric: fabric.as_ref(),
            deadline,
        };

        let (table, data_listener) = if self.rank == 0 {
            let listener = match self.listener {
                Some(l) => l,
                None => RendezvousListener::bind(&self.address).await?,
            };
            coordinator::coordinate(&listener, &ctx).await?
        } else {
            let addr = resolve(&self.address).await?;
            coordinator::register(addr, &ctx).await?
        };

        let peers = mesh::connect_mesh(&ctx, &table, data_listener).await?;

        let group = ProcessGroup::new(
            self.rank,
            self.world_size,
            self.token.clone(),
            peers,
            self.adapter,
            self.config.clone(),
        );
        group.activate();
        tracing::info!(
            rank = self.rank,
            world_size = self.world_size,
            "process group active"
        );
        Ok(group)
    }
}

/// Join a process group with default tuning and the given rendezvous timeout.
pub async fn join(
    rank: Rank,
    world_size: u32,
    address: &str,
    token: GroupToken,
    timeout: Duration,
) -> Result<ProcessGroup> {
    Rendezvous::new(rank, world_size, address, token)
        .with_timeout(timeout)
        .join()
        .await
}

/// What one rank brings to the rendezvous.
pub(crate) struct JoinContext<'a> {
    pub rank: Rank,
    pub world_size: u32,
    pub token: &'a GroupToken,
    pub config: &'a CollieConfig,
    pub fabric: Option<&'a LocalFabric>,
    pub deadline: Instant,
}

impl JoinContext<'_> {
    pub fn timed_out(&self, stage: impl Into<String>) -> CollieError {
        CollieError::RendezvousTimeout {
            stage: stage.into(),
            timeout_ms: self.config.rendezvous_timeout.as_millis() as u64,
        }
    }
}

/// The agreed membership: every rank's data address and fabric capability.
pub(crate) struct MembershipTable {
    /// Indexed by rank.
    pub addrs: Vec<SocketAddr>,
    pub fabric_ranks: Vec<Rank>,
}

impl MembershipTable {
    pub fn has_fabric(&self, rank: Rank) -> bool {
        self.fabric_ranks.contains(&rank)
    }
}

async fn resolve(address: &str) -> Result<SocketAddr> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host(address)
        .await
        .map_err(|e| {
            CollieError::configuration(format!(
                "cannot resolve rendezvous address '{address}': {e}"
            ))
        })?
        .collect();
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| {
            CollieError::configuration(format!(
                "rendezvous address '{address}' resolved to nothing"
            ))
        })
}

fn env_required<T: std::str::FromStr>(name: &str) -> Result<T> {
    let raw = std::env::var(name)
        .map_err(|_| CollieError::configuration(format!("{name} is not set")))?;
    raw.trim()
        .parse()
        .map_err(|_| CollieError::configuration(format!("{name}={raw:?} is not valid")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_rank_is_configuration_error() {
        let err = Rendezvous::new(4, 4, "127.0.0.1:1", "t")
            .join()
            .await
            .unwrap_err();
        assert!(matches!(err, CollieError::Configuration { .. }), "{err:?}");

        let err = Rendezvous::new(0, 0, "127.0.0.1:1", "t")
            .join()
            .await
            .unwrap_err();
        assert!(matches!(err, CollieError::Configuration { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn test_unresolvable_address_is_configuration_error() {
        let err = Rendezvous::new(1, 2, "not an address", "t")
            .join()
            .await
            .unwrap_err();
        assert!(matches!(err, CollieError::Configuration { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn test_listener_rejected_for_non_zero_rank() {
        let listener = RendezvousListener::bind("127.0.0.1:0").await.unwrap();
        let err = Rendezvous::new(1, 2, "", "t")
            .with_listener(listener)
            .join()
            .await
            .unwrap_err();
        assert!(matches!(err, CollieError::Configuration { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn test_world_size_one_is_immediately_active() {
        let group = join(0, 1, "127.0.0.1:0", GroupToken::from("solo"), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(group.state(), crate::GroupState::Active);
        assert_eq!(group.rank(), 0);
        assert!(group.transport_kind(0).is_none());
    }

    #[test]
    fn test_from_env() {
        // SAFETY: no other test reads or writes these variables.
        unsafe {
            std::env::set_var("COLLIE_RANK", "2");
            std::env::set_var("COLLIE_WORLD_SIZE", "4");
            std::env::set_var("COLLIE_MASTER_ADDR", "::1");
            std::env::set_var("COLLIE_MASTER_PORT", "29500");
            std::env::set_var("COLLIE_GROUP_TOKEN", "job-7");
            std::env::set_var("COLLIE_RENDEZVOUS_TIMEOUT_SECS", "9");
        }
        let rdv = Rendezvous::from_env().unwrap();
        assert_eq!(rdv.rank(), 2);
        assert_eq!(rdv.world_size(), 4);
        assert_eq!(rdv.address, "[::1]:29500");
        assert_eq!(rdv.token, GroupToken::from("job-7"));
        assert_eq!(rdv.config.rendezvous_timeout, Duration::from_secs(9));

        unsafe { std::env::set_var("COLLIE_MASTER_PORT", "not-a-port") };
        let err = Rendezvous::from_env().err().unwrap();
        assert!(matches!(err, CollieError::Configuration { .. }), "{err:?}");

        unsafe {
            for name in [
                "COLLIE_RANK",
                "COLLIE_WORLD_SIZE",
                "COLLIE_MASTER_ADDR",
                "COLLIE_MASTER_PORT",
                "COLLIE_GROUP_TOKEN",
                "COLLIE_RENDEZVOUS_TIMEOUT_SECS",
            ] {
                std::env::remove_var(name);
            }
        }
    }

    #[tokio::test]
    async fn test_resolve_prefers_ipv4() {
        let addr = resolve("localhost:80").await.unwrap();
        assert!(addr.is_ipv4() || addr.is_ipv6());
        assert_eq!(addr.port(), 80);
    }
}
