//! Ring all-reduce (sum) across 4 ranks in one process.
//!
//! Each rank starts with its own data. After `all_reduce_sum`, every rank
//! holds the element-wise sum of all inputs.
//!
//! ```bash
//! cargo run --example allreduce
//! ```

use collie::{CollieConfig, ProcessGroup};
use std::sync::Arc;

#[tokio::main]
async fn main() -> collie::Result<()> {
    let world_size = 4u32;
    let groups: Vec<Arc<ProcessGroup>> =
        ProcessGroup::bootstrap_local(world_size, CollieConfig::default())
            .await?
            .into_iter()
            .map(Arc::new)
            .collect();

    let count = 8usize;

    // rank 0: [0.0, 0.0, ...], rank 1: [1.0, 1.0, ...], etc.
    let mut handles = Vec::new();
    for group in &groups {
        let g = Arc::clone(group);
        handles.push(tokio::spawn(async move {
            let rank = g.rank();
            let mut data = vec![rank as f32; count];
            g.all_reduce_sum(&mut data).await?;
            collie::Result::Ok((rank, data))
        }));
    }

    for h in handles {
        let (rank, data) = h
            .await
            .map_err(|e| collie::CollieError::transport(format!("task failed: {e}")))??;
        println!("rank {rank}: {data:?}");
    }
    // Output (all ranks identical):
    // rank 0: [6.0, 6.0, 6.0, 6.0, 6.0, 6.0, 6.0, 6.0]
    // rank 1: [6.0, 6.0, 6.0, 6.0, 6.0, 6.0, 6.0, 6.0]
    // ...

    for g in &groups {
        g.destroy()?;
    }
    Ok(())
}
