use super::helpers::run_group;
use collie::{BufferRef, CollieError, DataType, Host};

#[tokio::test]
async fn test_allreduce_sum_world_sizes_1_to_5() {
    for world in 1..=5u32 {
        run_group(world, move |group| async move {
            let rank = group.rank();
            let mut data = vec![(rank + 1) as f32; 16];
            group.all_reduce_sum(&mut data).await.unwrap();

            let expected = (world * (world + 1) / 2) as f32;
            assert_eq!(data, vec![expected; 16], "world {world}, rank {rank}");
        })
        .await;
    }
}

#[tokio::test]
async fn test_allreduce_4_ranks_f32() {
    run_group(4, |group| async move {
        let rank = group.rank() as f32;
        let mut data = vec![rank, rank * 2.0, rank * 3.0];
        group.all_reduce_sum(&mut data).await.unwrap();

        // ranks 0..4 sum to 6
        assert_eq!(data, vec![6.0, 12.0, 18.0]);
    })
    .await;
}

#[tokio::test]
async fn test_allreduce_per_element_values() {
    run_group(3, |group| async move {
        let rank = group.rank() as i64;
        let mut data: Vec<i64> = (0..1000).map(|i| i * 10 + rank).collect();
        group.all_reduce_sum(&mut data).await.unwrap();

        let expected: Vec<i64> = (0..1000).map(|i| 3 * i * 10 + 3).collect();
        assert_eq!(data, expected);
    })
    .await;
}

#[tokio::test]
async fn test_allreduce_count_smaller_than_world() {
    run_group(5, |group| async move {
        let mut data = vec![1u32, 2];
        group.all_reduce_sum(&mut data).await.unwrap();
        assert_eq!(data, vec![5, 10]);
    })
    .await;
}

#[tokio::test]
async fn test_allreduce_uneven_chunks() {
    run_group(4, |group| async move {
        let rank = group.rank() as f64;
        let mut data = vec![rank + 0.5; 1031];
        group.all_reduce_sum(&mut data).await.unwrap();

        // 0.5 + 1.5 + 2.5 + 3.5
        assert_eq!(data, vec![8.0; 1031]);
    })
    .await;
}

#[tokio::test]
async fn test_allreduce_empty_buffer() {
    run_group(3, |group| async move {
        let mut data: Vec<f32> = Vec::new();
        group.all_reduce_sum(&mut data).await.unwrap();
        assert!(data.is_empty());
    })
    .await;
}

#[tokio::test]
async fn test_allreduce_integer_wraps() {
    run_group(2, |group| async move {
        let mut bytes = vec![200u8, 1];
        group.all_reduce_sum(&mut bytes).await.unwrap();
        assert_eq!(bytes, vec![144, 2]);

        let mut small = vec![i8::MAX, -1];
        group.all_reduce_sum(&mut small).await.unwrap();
        assert_eq!(small, vec![-2, -2]);
    })
    .await;
}

#[tokio::test]
async fn test_allreduce_large_buffer() {
    run_group(3, |group| async move {
        let rank = group.rank() as u64;
        let mut data = vec![rank + 1; 1 << 20];
        group.all_reduce_sum(&mut data).await.unwrap();
        assert!(data.iter().all(|&v| v == 6));
    })
    .await;
}

#[tokio::test]
async fn test_allreduce_results_bit_identical_across_ranks() {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    run_group(4, move |group| {
        let tx = tx.clone();
        async move {
            let rank = group.rank();
            let mut data: Vec<f32> = (0..257)
                .map(|i| (i as f32 * 0.1 + rank as f32).sin() * 1e-3)
                .collect();
            group.all_reduce_sum(&mut data).await.unwrap();
            let bits: Vec<u32> = data.iter().map(|v| v.to_bits()).collect();
            tx.send(bits).unwrap();
        }
    })
    .await;

    let first = rx.recv().await.unwrap();
    for _ in 1..4 {
        assert_eq!(rx.recv().await.unwrap(), first);
    }
}

#[tokio::test]
async fn test_sequential_allreduces_do_not_interfere() {
    run_group(3, |group| async move {
        let rank = group.rank() as i32;
        for round in 0..10 {
            let mut data = vec![rank * round; 33];
            group.all_reduce_sum(&mut data).await.unwrap();
            assert_eq!(data, vec![3 * round; 33], "round {round}");
        }
    })
    .await;
}

#[tokio::test]
async fn test_allreduce_host_buffer() {
    run_group(2, |group| async move {
        let mut data = vec![group.rank() as u32 + 7; 8];
        let mut buf = unsafe { BufferRef::<Host>::new(data.as_mut_ptr() as u64, 8 * 4) };
        group
            .all_reduce_sum_buffer(&mut buf, DataType::U32)
            .await
            .unwrap();
        assert_eq!(data, vec![15; 8]);
    })
    .await;
}

#[tokio::test]
async fn test_allreduce_buffer_rejects_partial_element() {
    run_group(2, |group| async move {
        let mut data = vec![0u8; 6];
        let mut buf = unsafe { BufferRef::<Host>::new(data.as_mut_ptr() as u64, 6) };
        let err = group
            .all_reduce_sum_buffer(&mut buf, DataType::F32)
            .await
            .unwrap_err();
        assert!(matches!(err, CollieError::Configuration { .. }), "{err:?}");
    })
    .await;
}
