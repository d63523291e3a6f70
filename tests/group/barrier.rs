use super::helpers::run_group;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

#[tokio::test]
async fn test_barrier_world_sizes() {
    for world in 1..=5u32 {
        run_group(world, |group| async move {
            group.barrier().await.unwrap();
        })
        .await;
    }
}

#[tokio::test]
async fn test_barrier_waits_for_slowest_rank() {
    let arrived = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&arrived);
    run_group(4, move |group| {
        let arrived = Arc::clone(&counter);
        async move {
            if group.rank() == 3 {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            arrived.fetch_add(1, Ordering::SeqCst);
            group.barrier().await.unwrap();
            assert_eq!(arrived.load(Ordering::SeqCst), 4, "rank {}", group.rank());
        }
    })
    .await;
}

#[tokio::test]
async fn test_repeated_barriers_interleaved_with_allreduce() {
    run_group(3, |group| async move {
        for round in 0..5u64 {
            group.barrier().await.unwrap();
            let mut v = [round];
            group.all_reduce_sum(&mut v).await.unwrap();
            assert_eq!(v, [3 * round]);
        }
    })
    .await;
}
