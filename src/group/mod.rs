mod collectives;
mod messaging;

use crate::config::CollieConfig;
use crate::device::{CpuAdapter, DeviceAdapter};
use crate::error::{CollieError, Result};
use crate::memory::MemorySpace;
use crate::transport::{PeerTransport, TransportKind};
use crate::types::{GroupToken, Rank};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::time::Instant;

/// Lifecycle of a [`ProcessGroup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GroupState {
    /// Connections are being established.
    Forming = 0,
    /// Every pair is connected; operations are accepted.
    Active = 1,
    /// Torn down; every operation fails with `GroupDestroyed`.
    Destroyed = 2,
}

impl GroupState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => GroupState::Forming,
            1 => GroupState::Active,
            _ => GroupState::Destroyed,
        }
    }
}

/// A fixed set of ranks with one established connection per pair.
///
/// Created by [`Rendezvous::join`](crate::Rendezvous::join). Membership never
/// changes after formation. Operations are issued in the same order on every
/// rank; the group runs at most one at a time.
///
/// Any connection-level failure during an operation (peer loss, timeout,
/// protocol violation) closes every connection of the group. The failed
/// operation returns the original error and later operations fail with
/// [`CollieError::PeerConnectionLost`]. The caller should destroy the group
/// and rendezvous again.
pub struct ProcessGroup {
    rank: Rank,
    world_size: u32,
    token: GroupToken,
    peers: HashMap<Rank, Box<dyn PeerTransport>>,
    state: AtomicU8,
    busy: AtomicBool,
    barrier_epoch: AtomicU64,
    /// First invalidating failure: `(peer, reason)`.
    failure: OnceLock<(Rank, String)>,
    adapter: Arc<dyn DeviceAdapter>,
    config: CollieConfig,
}

impl ProcessGroup {
    /// Assemble a group in `Forming` state from established pair transports.
    pub(crate) fn new(
        rank: Rank,
        world_size: u32,
        token: GroupToken,
        peers: HashMap<Rank, Box<dyn PeerTransport>>,
        adapter: Arc<dyn DeviceAdapter>,
        config: CollieConfig,
    ) -> Self {
        Self {
            rank,
            world_size,
            token,
            peers,
            state: AtomicU8::new(GroupState::Forming as u8),
            busy: AtomicBool::new(false),
            barrier_epoch: AtomicU64::new(0),
            failure: OnceLock::new(),
            adapter,
            config,
        }
    }

    /// Forming -> Active. Only valid once every pair is connected.
    pub(crate) fn activate(&self) {
        debug_assert_eq!(self.peers.len(), self.world_size as usize - 1);
        let _ = self.state.compare_exchange(
            GroupState::Forming as u8,
            GroupState::Active as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn world_size(&self) -> u32 {
        self.world_size
    }

    pub fn token(&self) -> &GroupToken {
        &self.token
    }

    pub fn state(&self) -> GroupState {
        GroupState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn config(&self) -> &CollieConfig {
        &self.config
    }

    pub fn adapter(&self) -> &dyn DeviceAdapter {
        &*self.adapter
    }

    /// Reason the group became unusable, if an operation failed.
    pub fn failure(&self) -> Option<&str> {
        self.failure.get().map(|(_, reason)| reason.as_str())
    }

    /// The data path used for the pair with `peer`, or `None` for self or
    /// an unknown rank.
    pub fn transport_kind(&self, peer: Rank) -> Option<TransportKind> {
        self.peers.get(&peer).map(|t| t.kind())
    }

    /// Tear the group down and close every connection.
    ///
    /// Idempotent and safe to call concurrently: exactly one caller performs
    /// the teardown, the rest observe it already done and return `Ok`.
    pub fn destroy(&self) -> Result<()> {
        let prev = self
            .state
            .swap(GroupState::Destroyed as u8, Ordering::AcqRel);
        if prev == GroupState::Destroyed as u8 {
            tracing::debug!(rank = self.rank, "process group already destroyed");
            return Ok(());
        }
        self.close_all();
        tracing::info!(
            rank = self.rank,
            world_size = self.world_size,
            "process group destroyed"
        );
        Ok(())
    }

    fn close_all(&self) {
        for transport in self.peers.values() {
            transport.close();
        }
    }

    /// Check that an operation may start and claim the group for it.
    pub(crate) fn begin(&self, operation: &'static str) -> Result<OpGuard<'_>> {
        match self.state() {
            GroupState::Destroyed => return Err(CollieError::GroupDestroyed),
            GroupState::Forming => {
                return Err(CollieError::configuration(format!(
                    "{operation} called before the group is active"
                )));
            }
            GroupState::Active => {}
        }
        if let Some((peer, reason)) = self.failure.get() {
            return Err(CollieError::PeerConnectionLost {
                rank: *peer,
                reason: format!("group invalidated by earlier failure: {reason}"),
            });
        }
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(CollieError::configuration(format!(
                "{operation} called while another operation is in flight on this group"
            )));
        }
        Ok(OpGuard {
            group: self,
            operation,
        })
    }

    /// Validate a point-to-point peer rank.
    pub(crate) fn check_peer(&self, peer: Rank, operation: &'static str) -> Result<()> {
        if self.world_size == 1 {
            return Err(CollieError::configuration(format!(
                "{operation} is not available in a group of size 1"
            )));
        }
        if peer >= self.world_size {
            return Err(CollieError::configuration(format!(
                "{operation}: rank {peer} out of range for world_size {}",
                self.world_size
            )));
        }
        if peer == self.rank {
            return Err(CollieError::configuration(format!(
                "{operation}: rank {peer} is this rank; self-transfer is not supported"
            )));
        }
        Ok(())
    }

    fn peer(&self, rank: Rank) -> Result<&dyn PeerTransport> {
        self.peers
            .get(&rank)
            .map(|t| &**t)
            .ok_or_else(|| CollieError::configuration(format!("no connection to rank {rank}")))
    }

    /// Record the first connection-level failure and close everything so
    /// peers blocked on this rank fail promptly too.
    fn invalidate(&self, peer: Rank, err: &CollieError) {
        if self.failure.set((peer, err.to_string())).is_ok() {
            tracing::warn!(
                rank = self.rank,
                peer,
                "process group invalidated: {err}"
            );
            self.close_all();
        }
    }

    /// Next barrier epoch. Every rank calls barriers in the same order, so the
    /// counters agree group-wide.
    pub(crate) fn next_barrier_epoch(&self) -> u64 {
        self.barrier_epoch.fetch_add(1, Ordering::Relaxed)
    }

    /// Adapter for a buffer in memory space `S`.
    pub(crate) fn adapter_for<S: MemorySpace>(&self) -> &dyn DeviceAdapter {
        if S::IS_DEVICE {
            &*self.adapter
        } else {
            &CpuAdapter
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.close_all();
    }
}

impl std::fmt::Debug for ProcessGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessGroup")
            .field("rank", &self.rank)
            .field("world_size", &self.world_size)
            .field("state", &self.state())
            .field("failure", &self.failure())
            .finish_non_exhaustive()
    }
}

/// Exclusive claim on a group for one operation, with its deadline.
///
/// All frame I/O of an operation goes through this guard so that timeouts
/// and connection failures invalidate the group in one place.
#[derive(Debug)]
pub(crate) struct OpGuard<'a> {
    group: &'a ProcessGroup,
    operation: &'static str,
}

impl<'a> OpGuard<'a> {
    /// Attach a deadline computed from `timeout`, starting now.
    pub(crate) fn with_timeout(self, timeout: Option<Duration>) -> OpContext<'a> {
        OpContext {
            deadline: timeout.map(|t| (Instant::now() + t, t)),
            guard: self,
        }
    }
}

impl Drop for OpGuard<'_> {
    fn drop(&mut self) {
        self.group.busy.store(false, Ordering::Release);
    }
}

/// A running operation: the group claim plus its deadline.
pub(crate) struct OpContext<'a> {
    guard: OpGuard<'a>,
    deadline: Option<(Instant, Duration)>,
}

impl<'a> OpContext<'a> {
    pub(crate) fn group(&self) -> &'a ProcessGroup {
        self.guard.group
    }

    pub(crate) fn rank(&self) -> Rank {
        self.guard.group.rank
    }

    pub(crate) fn world_size(&self) -> u32 {
        self.guard.group.world_size
    }

    async fn bounded<T>(
        &self,
        peer: Rank,
        fut: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        let res = match self.deadline {
            Some((deadline, timeout)) => match tokio::time::timeout_at(deadline, fut).await {
                Ok(res) => res,
                Err(_) => Err(CollieError::OperationTimeout {
                    operation: self.guard.operation,
                    timeout_ms: timeout.as_millis() as u64,
                }),
            },
            None => fut.await,
        };
        if let Err(e) = &res {
            self.fail(peer, e);
        }
        res
    }

    /// Send one frame to `peer`, bounded by the operation deadline.
    pub(crate) async fn send(&self, peer: Rank, tag: u64, payload: Vec<u8>) -> Result<()> {
        let transport = self.group().peer(peer)?;
        self.bounded(peer, transport.send_frame(tag, payload)).await
    }

    /// Receive one frame from `peer`, bounded by the operation deadline.
    pub(crate) async fn recv(&self, peer: Rank, tag: u64) -> Result<Vec<u8>> {
        let transport = self.group().peer(peer)?;
        self.bounded(peer, transport.recv_frame(tag)).await
    }

    /// Report a failure detected while handling data from `peer`.
    ///
    /// Invalidating errors tear the group down; precondition errors do not.
    pub(crate) fn fail(&self, peer: Rank, err: &CollieError) {
        if err.invalidates_group() {
            self.group().invalidate(peer, err);
        }
    }

    /// Tear the group down for a failure that is not connection-level by
    /// itself but leaves the ranks out of step (wrong chunk size, wrong
    /// barrier epoch).
    pub(crate) fn poison(&self, peer: Rank, err: &CollieError) {
        self.group().invalidate(peer, err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lone_group() -> ProcessGroup {
        let g = ProcessGroup::new(
            0,
            1,
            GroupToken::from("t"),
            HashMap::new(),
            Arc::new(CpuAdapter::new()),
            CollieConfig::default(),
        );
        g.activate();
        g
    }

    #[test]
    fn test_state_transitions() {
        let g = ProcessGroup::new(
            0,
            1,
            GroupToken::from("t"),
            HashMap::new(),
            Arc::new(CpuAdapter::new()),
            CollieConfig::default(),
        );
        assert_eq!(g.state(), GroupState::Forming);
        assert!(matches!(
            g.begin("barrier"),
            Err(CollieError::Configuration { .. })
        ));
        g.activate();
        assert_eq!(g.state(), GroupState::Active);
        g.destroy().unwrap();
        assert_eq!(g.state(), GroupState::Destroyed);
        // Destroyed never goes back to Active.
        g.activate();
        assert_eq!(g.state(), GroupState::Destroyed);
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let g = lone_group();
        g.destroy().unwrap();
        g.destroy().unwrap();
        assert!(matches!(g.begin("send"), Err(CollieError::GroupDestroyed)));
    }

    #[test]
    fn test_single_in_flight_operation() {
        let g = lone_group();
        let guard = g.begin("all_reduce_sum").unwrap();
        match g.begin("barrier") {
            Err(CollieError::Configuration { reason }) => {
                assert!(reason.contains("in flight"), "{reason}")
            }
            other => panic!("expected Configuration, got {other:?}"),
        }
        drop(guard);
        assert!(g.begin("barrier").is_ok());
    }

    #[test]
    fn test_check_peer() {
        let g = lone_group();
        assert!(matches!(
            g.check_peer(1, "send"),
            Err(CollieError::Configuration { .. })
        ));
    }

    #[test]
    fn test_invalidation_is_sticky() {
        let g = lone_group();
        g.invalidate(
            3,
            &CollieError::PeerConnectionLost {
                rank: 3,
                reason: "eof".into(),
            },
        );
        match g.begin("barrier") {
            Err(CollieError::PeerConnectionLost { rank, reason }) => {
                assert_eq!(rank, 3);
                assert!(reason.contains("eof"), "{reason}");
            }
            other => panic!("expected PeerConnectionLost, got {other:?}"),
        }
        assert!(g.failure().is_some());
    }

    #[test]
    fn test_adapter_routing() {
        struct Marker;
        impl DeviceAdapter for Marker {
            unsafe fn stage_for_send(&self, _: u64, _: usize) -> Result<Vec<u8>> {
                Err(CollieError::device("marker"))
            }
            unsafe fn receive_to_device(&self, _: &[u8], _: u64) -> Result<()> {
                Err(CollieError::device("marker"))
            }
            unsafe fn reduce_sum_inplace(
                &self,
                _: u64,
                _: &[u8],
                _: usize,
                _: crate::types::DataType,
            ) -> Result<()> {
                Err(CollieError::device("marker"))
            }
        }
        let g = ProcessGroup::new(
            0,
            1,
            GroupToken::from("t"),
            HashMap::new(),
            Arc::new(Marker),
            CollieConfig::default(),
        );
        let data = [1u8, 2, 3];
        let host = unsafe {
            g.adapter_for::<crate::memory::Host>()
                .stage_for_send(data.as_ptr() as u64, 3)
        };
        assert_eq!(host.unwrap(), vec![1, 2, 3]);
        let dev = unsafe {
            g.adapter_for::<crate::memory::Device>()
                .stage_for_send(data.as_ptr() as u64, 3)
        };
        assert!(dev.is_err());
    }
}
