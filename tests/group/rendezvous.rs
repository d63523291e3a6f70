use collie::{
    CollieConfig, CollieError, GroupState, GroupToken, ProcessGroup, Rendezvous,
    RendezvousListener, Result, TransportKind,
};
use std::time::Duration;

/// Run `ranks` through a rendezvous against a fresh rank-0 listener.
/// Each entry is `(rank, world_size, token)`; rank 0 must be first.
async fn rendezvous_all(
    ranks: Vec<(u32, u32, &'static str)>,
    timeout: Duration,
) -> Vec<Result<ProcessGroup>> {
    let listener = RendezvousListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().to_string();
    let mut listener = Some(listener);

    let handles: Vec<_> = ranks
        .into_iter()
        .map(|(rank, world_size, token)| {
            let mut rdv = Rendezvous::new(rank, world_size, address.clone(), token)
                .with_timeout(timeout);
            if rank == 0 {
                if let Some(l) = listener.take() {
                    rdv = rdv.with_listener(l);
                }
            }
            tokio::spawn(rdv.join())
        })
        .collect();

    let mut results = Vec::new();
    for h in handles {
        results.push(h.await.unwrap());
    }
    results
}

#[tokio::test]
async fn test_rendezvous_forms_full_mesh() {
    let results = rendezvous_all(
        vec![(0, 4, "job"), (3, 4, "job"), (1, 4, "job"), (2, 4, "job")],
        Duration::from_secs(10),
    )
    .await;

    for res in &results {
        let group = res.as_ref().unwrap();
        assert_eq!(group.state(), GroupState::Active);
        assert_eq!(group.world_size(), 4);
        for peer in (0..4).filter(|&p| p != group.rank()) {
            assert_eq!(group.transport_kind(peer), Some(TransportKind::Tcp));
        }
    }
}

#[tokio::test]
async fn test_participants_dial_before_rank_zero_listens() {
    // Reserve a port, release it, and let the participants retry until
    // rank 0 starts listening there.
    let address = {
        let probe = RendezvousListener::bind("127.0.0.1:0").await.unwrap();
        probe.local_addr().to_string()
    };
    let token = GroupToken::from("late-coordinator");

    let participant = {
        let address = address.clone();
        let token = token.clone();
        tokio::spawn(async move {
            Rendezvous::new(1, 2, address, token)
                .with_timeout(Duration::from_secs(10))
                .join()
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;
    let coordinator = Rendezvous::new(0, 2, address, token)
        .with_timeout(Duration::from_secs(10))
        .join()
        .await
        .unwrap();
    let participant = participant.await.unwrap().unwrap();

    coordinator.send(1, &[11u32]).await.unwrap();
    let mut buf = [0u32];
    participant.recv(0, &mut buf).await.unwrap();
    assert_eq!(buf, [11]);
}

#[tokio::test]
async fn test_token_mismatch_fails_every_rank() {
    let results = rendezvous_all(
        vec![(0, 2, "job-a"), (1, 2, "job-b")],
        Duration::from_secs(5),
    )
    .await;
    for res in results {
        let err = res.unwrap_err();
        assert!(matches!(err, CollieError::RendezvousMismatch { .. }), "{err:?}");
    }
}

#[tokio::test]
async fn test_world_size_mismatch_fails() {
    let results = rendezvous_all(
        vec![(0, 2, "job"), (1, 3, "job")],
        Duration::from_secs(5),
    )
    .await;
    for res in results {
        let err = res.unwrap_err();
        assert!(matches!(err, CollieError::RendezvousMismatch { .. }), "{err:?}");
    }
}

#[tokio::test]
async fn test_duplicate_rank_fails() {
    let results = rendezvous_all(
        vec![(0, 3, "job"), (1, 3, "job"), (1, 3, "job")],
        Duration::from_secs(5),
    )
    .await;
    for res in results {
        let err = res.unwrap_err();
        assert!(matches!(err, CollieError::RendezvousMismatch { .. }), "{err:?}");
    }
}

#[tokio::test]
async fn test_missing_rank_times_out() {
    let results = rendezvous_all(
        vec![(0, 3, "job"), (1, 3, "job")],
        Duration::from_millis(500),
    )
    .await;
    for (i, res) in results.into_iter().enumerate() {
        match res.unwrap_err() {
            CollieError::RendezvousTimeout { stage, timeout_ms } => {
                assert_eq!(timeout_ms, 500);
                if i == 0 {
                    assert!(stage.contains("2/3 joined"), "{stage}");
                }
            }
            other => panic!("expected RendezvousTimeout, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_unreachable_rank_zero_times_out() {
    let address = {
        let probe = RendezvousListener::bind("127.0.0.1:0").await.unwrap();
        probe.local_addr().to_string()
    };
    let err = Rendezvous::new(1, 2, address, "nobody-home")
        .with_timeout(Duration::from_millis(300))
        .join()
        .await
        .unwrap_err();
    assert!(matches!(err, CollieError::RendezvousTimeout { .. }), "{err:?}");
}

#[tokio::test]
async fn test_config_timeout_applies() {
    let config = CollieConfig::default().with_rendezvous_timeout(Duration::from_millis(200));
    let address = {
        let probe = RendezvousListener::bind("127.0.0.1:0").await.unwrap();
        probe.local_addr().to_string()
    };
    let started = std::time::Instant::now();
    let err = Rendezvous::new(1, 2, address, "t")
        .with_config(config)
        .join()
        .await
        .unwrap_err();
    assert!(matches!(err, CollieError::RendezvousTimeout { .. }), "{err:?}");
    assert!(started.elapsed() < Duration::from_secs(5));
}
