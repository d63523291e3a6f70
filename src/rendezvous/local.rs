use super::{Rendezvous, RendezvousListener};
use crate::config::CollieConfig;
use crate::device::{CpuAdapter, DeviceAdapter};
use crate::error::{CollieError, Result};
use crate::group::ProcessGroup;
use crate::types::GroupToken;
use std::sync::Arc;

impl ProcessGroup {
    /// Form a whole group inside this process, one member per rank, over
    /// loopback TCP. Returns the members ordered by rank.
    ///
    /// Useful for tests and single-host experiments; the members run the
    /// same rendezvous and data paths as separate processes would.
    pub async fn bootstrap_local(world_size: u32, config: CollieConfig) -> Result<Vec<ProcessGroup>> {
        Self::bootstrap_local_with_adapter(world_size, config, Arc::new(CpuAdapter::new())).await
    }

    pub async fn bootstrap_local_with_adapter(
        world_size: u32,
        config: CollieConfig,
        adapter: Arc<dyn DeviceAdapter>,
    ) -> Result<Vec<ProcessGroup>> {
        if world_size == 0 {
            return Err(CollieError::configuration("world_size must be at least 1"));
        }

        let listener = RendezvousListener::bind("127.0.0.1:0").await?;
        let address = listener.local_addr().to_string();
        let token = GroupToken::generate();
        let mut listener = Some(listener);

        let handles: Vec<_> = (0..world_size)
            .map(|rank| {
                let mut rdv = Rendezvous::new(rank, world_size, address.clone(), token.clone())
                    .with_config(config.clone())
                    .with_adapter(Arc::clone(&adapter));
                if let Some(l) = listener.take().filter(|_| rank == 0) {
                    rdv = rdv.with_listener(l);
                }
                tokio::spawn(rdv.join())
            })
            .collect();

        let mut groups = Vec::with_capacity(world_size as usize);
        for joined in futures::future::join_all(handles).await {
            let group = joined
                .map_err(|e| CollieError::transport(format!("rendezvous task failed: {e}")))??;
            groups.push(group);
        }
        Ok(groups)
    }
}
