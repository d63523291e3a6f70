use super::helpers::{bootstrap, run_group};
use collie::{BufferRef, CollieConfig, CollieError, GroupState, Host};

#[tokio::test]
async fn test_send_recv_bit_exact() {
    run_group(2, |group| async move {
        let payload: Vec<f64> = vec![f64::NAN, -0.0, 1e-310, f64::INFINITY, 3.5];
        if group.rank() == 0 {
            group.send(1, &payload).await.unwrap();
        } else {
            let mut buf = vec![0.0f64; payload.len()];
            group.recv(0, &mut buf).await.unwrap();
            let sent: Vec<u64> = payload.iter().map(|v| v.to_bits()).collect();
            let got: Vec<u64> = buf.iter().map(|v| v.to_bits()).collect();
            assert_eq!(got, sent);
        }
    })
    .await;
}

#[tokio::test]
async fn test_sends_delivered_in_order() {
    run_group(2, |group| async move {
        if group.rank() == 0 {
            for i in 0..50u32 {
                group.send(1, &[i, i * 2]).await.unwrap();
            }
        } else {
            for i in 0..50u32 {
                let mut buf = [0u32; 2];
                group.recv(0, &mut buf).await.unwrap();
                assert_eq!(buf, [i, i * 2]);
            }
        }
    })
    .await;
}

#[tokio::test]
async fn test_send_completes_before_recv_posted() {
    let groups = bootstrap(2, CollieConfig::default()).await;
    groups[0].send(1, &[42u8; 1024]).await.unwrap();

    let mut buf = [0u8; 1024];
    groups[1].recv(0, &mut buf).await.unwrap();
    assert!(buf.iter().all(|&b| b == 42));
}

#[tokio::test]
async fn test_ring_exchange_all_pairs() {
    run_group(4, |group| async move {
        let rank = group.rank();
        let world = group.world_size();
        for peer in 0..world {
            if peer == rank {
                continue;
            }
            // Lower rank sends first so every pair makes progress.
            let out = [rank * 100 + peer];
            let mut got = [0u32];
            if rank < peer {
                group.send(peer, &out).await.unwrap();
                group.recv(peer, &mut got).await.unwrap();
            } else {
                group.recv(peer, &mut got).await.unwrap();
                group.send(peer, &out).await.unwrap();
            }
            assert_eq!(got, [peer * 100 + rank]);
        }
    })
    .await;
}

#[tokio::test]
async fn test_recv_size_mismatch_leaves_buffer_untouched() {
    let groups = bootstrap(2, CollieConfig::default()).await;
    groups[0].send(1, &[1u32, 2, 3]).await.unwrap();

    let mut buf = [7u32; 4];
    let err = groups[1].recv(0, &mut buf).await.unwrap_err();
    assert!(
        matches!(
            err,
            CollieError::BufferSizeMismatch {
                expected: 16,
                actual: 12
            }
        ),
        "{err:?}"
    );
    assert_eq!(buf, [7; 4]);

    // The connection is still usable afterwards.
    assert_eq!(groups[1].state(), GroupState::Active);
    groups[0].send(1, &[9u32; 4]).await.unwrap();
    groups[1].recv(0, &mut buf).await.unwrap();
    assert_eq!(buf, [9; 4]);
}

#[tokio::test]
async fn test_self_send_is_configuration_error() {
    let groups = bootstrap(2, CollieConfig::default()).await;
    let err = groups[0].send(0, &[1u8]).await.unwrap_err();
    assert!(matches!(err, CollieError::Configuration { .. }), "{err:?}");

    let mut buf = [0u8];
    let err = groups[1].recv(1, &mut buf).await.unwrap_err();
    assert!(matches!(err, CollieError::Configuration { .. }), "{err:?}");
}

#[tokio::test]
async fn test_out_of_range_peer_is_configuration_error() {
    let groups = bootstrap(2, CollieConfig::default()).await;
    let err = groups[0].send(5, &[1u8]).await.unwrap_err();
    assert!(matches!(err, CollieError::Configuration { .. }), "{err:?}");
    assert!(groups[0].failure().is_none());
}

#[tokio::test]
async fn test_send_recv_host_buffers() {
    let groups = bootstrap(2, CollieConfig::default()).await;

    let mut src = vec![3i64, -4, 5];
    let buf = unsafe { BufferRef::<Host>::new(src.as_mut_ptr() as u64, 24) };
    groups[1].send_buffer(0, &buf).await.unwrap();

    let mut dst = vec![0i64; 3];
    let mut out = unsafe { BufferRef::<Host>::new(dst.as_mut_ptr() as u64, 24) };
    groups[0].recv_buffer(1, &mut out).await.unwrap();
    assert_eq!(dst, src);
}

#[tokio::test]
async fn test_empty_message() {
    let groups = bootstrap(2, CollieConfig::default()).await;
    groups[0].send::<u8>(1, &[]).await.unwrap();
    let mut buf: [u8; 0] = [];
    groups[1].recv(0, &mut buf).await.unwrap();
}
