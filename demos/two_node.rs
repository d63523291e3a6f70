//! One rank of a multi-process group, configured from the environment.
//!
//! Run one process per rank, e.g. on two shells:
//!
//! ```bash
//! COLLIE_RANK=0 COLLIE_WORLD_SIZE=2 COLLIE_MASTER_ADDR=127.0.0.1 \
//!   COLLIE_MASTER_PORT=29500 COLLIE_GROUP_TOKEN=demo cargo run --example two_node
//! COLLIE_RANK=1 COLLIE_WORLD_SIZE=2 COLLIE_MASTER_ADDR=127.0.0.1 \
//!   COLLIE_MASTER_PORT=29500 COLLIE_GROUP_TOKEN=demo cargo run --example two_node
//! ```
//!
//! Set `COLLIE_IB_HCA=mlx5_0` (with `--features rdma`) to try the fabric path,
//! and `RUST_LOG=collie=debug` for connection details.

use collie::Rendezvous;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> collie::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let group = Rendezvous::from_env()?.join().await?;
    let rank = group.rank();
    let world_size = group.world_size();
    println!("rank {rank}/{world_size} joined");

    for peer in (0..world_size).filter(|&p| p != rank) {
        println!("  rank {peer}: {:?}", group.transport_kind(peer));
    }

    if world_size > 1 {
        if rank == 0 {
            group.send(1, &[0.0f32]).await?;
            println!("rank 0: sent [0.0] to rank 1");
        } else if rank == 1 {
            let mut buf = [f32::NAN];
            group.recv(0, &mut buf).await?;
            println!("rank 1: received {buf:?} from rank 0");
        }
    }

    let mut data = vec![(rank + 1) as f32; 1024];
    group.all_reduce_sum(&mut data).await?;
    println!("rank {rank}: all-reduce result {}", data[0]);

    group.barrier().await?;
    group.destroy()?;
    Ok(())
}
