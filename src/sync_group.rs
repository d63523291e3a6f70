use crate::config::CollieConfig;
use crate::error::{CollieError, Result};
use crate::group::{GroupState, ProcessGroup};
use crate::rendezvous::Rendezvous;
use crate::types::{Element, Rank};
use std::sync::Arc;

/// Blocking wrapper around [`ProcessGroup`].
///
/// Owns (a share of) a multi-threaded tokio runtime and calls `block_on()`
/// for each operation. Members of one group may block on the same runtime
/// from different threads. Must not be used from inside an async context.
pub struct SyncProcessGroup {
    inner: ProcessGroup,
    rt: Arc<tokio::runtime::Runtime>,
}

fn new_runtime() -> Result<Arc<tokio::runtime::Runtime>> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("collie-sync")
        .build()
        .map(Arc::new)
        .map_err(|e| CollieError::transport(format!("tokio runtime: {e}")))
}

impl SyncProcessGroup {
    /// Run `rendezvous` to completion on a fresh runtime.
    pub fn join(rendezvous: Rendezvous) -> Result<Self> {
        let rt = new_runtime()?;
        let inner = rt.block_on(rendezvous.join())?;
        Ok(Self { inner, rt })
    }

    /// Form a whole group in this process; see
    /// [`ProcessGroup::bootstrap_local`]. All members share one runtime, so
    /// their connections stay serviced while any one of them is blocked.
    pub fn bootstrap_local(world_size: u32, config: CollieConfig) -> Result<Vec<Self>> {
        let rt = new_runtime()?;
        let groups = rt.block_on(ProcessGroup::bootstrap_local(world_size, config))?;
        Ok(groups
            .into_iter()
            .map(|inner| Self {
                inner,
                rt: Arc::clone(&rt),
            })
            .collect())
    }

    pub fn rank(&self) -> Rank {
        self.inner.rank()
    }

    pub fn world_size(&self) -> u32 {
        self.inner.world_size()
    }

    pub fn state(&self) -> GroupState {
        self.inner.state()
    }

    /// The wrapped async group.
    pub fn inner(&self) -> &ProcessGroup {
        &self.inner
    }

    pub fn all_reduce_sum<T: Element>(&self, buf: &mut [T]) -> Result<()> {
        self.rt.block_on(self.inner.all_reduce_sum(buf))
    }

    pub fn send<T: Element>(&self, dst: Rank, buf: &[T]) -> Result<()> {
        self.rt.block_on(self.inner.send(dst, buf))
    }

    pub fn recv<T: Element>(&self, src: Rank, buf: &mut [T]) -> Result<()> {
        self.rt.block_on(self.inner.recv(src, buf))
    }

    pub fn barrier(&self) -> Result<()> {
        self.rt.block_on(self.inner.barrier())
    }

    pub fn destroy(&self) -> Result<()> {
        self.inner.destroy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_allreduce_across_threads() {
        let groups = SyncProcessGroup::bootstrap_local(3, CollieConfig::default()).unwrap();
        let handles: Vec<_> = groups
            .into_iter()
            .map(|g| {
                std::thread::spawn(move || {
                    let mut data = vec![g.rank() as f32 + 1.0; 10];
                    g.all_reduce_sum(&mut data).unwrap();
                    g.barrier().unwrap();
                    g.destroy().unwrap();
                    data
                })
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), vec![6.0f32; 10]);
        }
    }

    #[test]
    fn test_sync_send_recv() {
        let mut groups = SyncProcessGroup::bootstrap_local(2, CollieConfig::default()).unwrap();
        let g1 = groups.pop().unwrap();
        let g0 = groups.pop().unwrap();

        let receiver = std::thread::spawn(move || {
            let mut buf = [0u64; 4];
            g1.recv(0, &mut buf).unwrap();
            buf
        });
        g0.send(1, &[1u64, 2, 3, 4]).unwrap();
        assert_eq!(receiver.join().unwrap(), [1, 2, 3, 4]);
    }
}
