use collie::{CollieConfig, ProcessGroup};
use std::sync::Arc;

/// Run `f` on every member of a freshly bootstrapped local group concurrently.
/// Keeps all members alive until every task completes.
pub async fn run_group<F, Fut>(world_size: u32, f: F)
where
    F: Fn(Arc<ProcessGroup>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    run_group_with_config(world_size, CollieConfig::default(), f).await;
}

pub async fn run_group_with_config<F, Fut>(world_size: u32, config: CollieConfig, f: F)
where
    F: Fn(Arc<ProcessGroup>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let groups = bootstrap(world_size, config).await;

    let f = Arc::new(f);
    let mut handles = Vec::new();
    for g in &groups {
        let g = Arc::clone(g);
        let f = Arc::clone(&f);
        handles.push(tokio::spawn(async move { f(g).await }));
    }
    for h in handles {
        h.await.unwrap();
    }
}

pub async fn bootstrap(world_size: u32, config: CollieConfig) -> Vec<Arc<ProcessGroup>> {
    ProcessGroup::bootstrap_local(world_size, config)
        .await
        .unwrap()
        .into_iter()
        .map(Arc::new)
        .collect()
}
