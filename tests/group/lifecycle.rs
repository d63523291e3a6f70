use super::helpers::bootstrap;
use collie::{CollieConfig, CollieError, GroupState, GroupToken, ProcessGroup, Rendezvous};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_destroy_is_idempotent() {
    let groups = bootstrap(2, CollieConfig::default()).await;
    groups[0].destroy().unwrap();
    groups[0].destroy().unwrap();
    assert_eq!(groups[0].state(), GroupState::Destroyed);
}

#[tokio::test]
async fn test_concurrent_destroy() {
    let groups = bootstrap(3, CollieConfig::default()).await;
    let g = Arc::clone(&groups[1]);
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let g = Arc::clone(&g);
            tokio::spawn(async move { g.destroy() })
        })
        .collect();
    for h in handles {
        h.await.unwrap().unwrap();
    }
    assert_eq!(g.state(), GroupState::Destroyed);
}

#[tokio::test]
async fn test_operations_after_destroy_fail() {
    let groups = bootstrap(2, CollieConfig::default()).await;
    groups[0].destroy().unwrap();

    let mut data = [1.0f32; 4];
    let err = groups[0].all_reduce_sum(&mut data).await.unwrap_err();
    assert!(matches!(err, CollieError::GroupDestroyed), "{err:?}");
    assert_eq!(data, [1.0; 4]);

    let err = groups[0].send(1, &data).await.unwrap_err();
    assert!(matches!(err, CollieError::GroupDestroyed), "{err:?}");

    let err = groups[0].barrier().await.unwrap_err();
    assert!(matches!(err, CollieError::GroupDestroyed), "{err:?}");

    let mut buf = [7u32; 2];
    let err = groups[0].recv(1, &mut buf).await.unwrap_err();
    assert!(matches!(err, CollieError::GroupDestroyed), "{err:?}");
    assert_eq!(buf, [7, 7]);
}

#[tokio::test]
async fn test_peer_destroy_surfaces_as_connection_lost() {
    let groups = bootstrap(2, CollieConfig::default()).await;
    let receiver = Arc::clone(&groups[1]);
    let pending = tokio::spawn(async move {
        let mut buf = [0u8; 8];
        receiver.recv(0, &mut buf).await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    groups[0].destroy().unwrap();

    let err = pending.await.unwrap().unwrap_err();
    assert!(
        matches!(err, CollieError::PeerConnectionLost { rank: 0, .. }),
        "{err:?}"
    );
    assert!(groups[1].failure().is_some());
}

#[tokio::test]
async fn test_world_size_one() {
    let group = Rendezvous::new(0, 1, "127.0.0.1:0", GroupToken::from("solo"))
        .join()
        .await
        .unwrap();
    assert_eq!(group.state(), GroupState::Active);

    let mut data = vec![2.5f32, -1.0];
    group.all_reduce_sum(&mut data).await.unwrap();
    assert_eq!(data, vec![2.5, -1.0]);
    group.barrier().await.unwrap();

    let err = group.send(0, &data).await.unwrap_err();
    assert!(matches!(err, CollieError::Configuration { .. }), "{err:?}");

    let mut buf = [0.0f32; 2];
    let err = group.recv(0, &mut buf).await.unwrap_err();
    assert!(matches!(err, CollieError::Configuration { .. }), "{err:?}");

    group.destroy().unwrap();
    assert_eq!(group.state(), GroupState::Destroyed);
}

#[tokio::test]
async fn test_concurrent_operations_rejected() {
    let groups = bootstrap(2, CollieConfig::default()).await;
    let g = Arc::clone(&groups[0]);
    let pending = tokio::spawn(async move {
        let mut buf = [0u8; 4];
        g.recv(1, &mut buf).await.map(|_| buf)
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = groups[0].send(1, &[1u8]).await.unwrap_err();
    assert!(matches!(err, CollieError::Configuration { .. }), "{err:?}");

    groups[1].send(0, &[1u8, 2, 3, 4]).await.unwrap();
    assert_eq!(pending.await.unwrap().unwrap(), [1, 2, 3, 4]);
}

#[tokio::test]
async fn test_groups_are_independent() {
    let a = ProcessGroup::bootstrap_local(2, CollieConfig::default())
        .await
        .unwrap();
    let b = ProcessGroup::bootstrap_local(2, CollieConfig::default())
        .await
        .unwrap();
    assert_ne!(a[0].token(), b[0].token());

    a[0].destroy().unwrap();

    b[0].send(1, &[5u8]).await.unwrap();
    let mut buf = [0u8];
    b[1].recv(0, &mut buf).await.unwrap();
    assert_eq!(buf, [5]);
    assert_eq!(b[0].state(), GroupState::Active);
}

#[tokio::test]
async fn test_concurrent_allreduce_on_separate_groups() {
    let a = bootstrap(3, CollieConfig::default()).await;
    let b = bootstrap(3, CollieConfig::default()).await;

    let run = |groups: Vec<Arc<ProcessGroup>>, scale: i64| async move {
        let handles: Vec<_> = groups
            .into_iter()
            .map(|g| {
                tokio::spawn(async move {
                    let mut results = Vec::new();
                    for _ in 0..10 {
                        let mut data = vec![(g.rank() as i64 + 1) * scale; 4096];
                        g.all_reduce_sum(&mut data).await.unwrap();
                        results.push(data);
                    }
                    results
                })
            })
            .collect();
        let mut out = Vec::new();
        for h in handles {
            out.push(h.await.unwrap());
        }
        out
    };

    let (ra, rb) = tokio::join!(run(a, 1), run(b, 100));
    for rounds in ra {
        for data in rounds {
            assert!(data.iter().all(|&x| x == 6), "group a: {:?}", &data[..4]);
        }
    }
    for rounds in rb {
        for data in rounds {
            assert!(data.iter().all(|&x| x == 600), "group b: {:?}", &data[..4]);
        }
    }
}
