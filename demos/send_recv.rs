//! Point-to-point transfer between two ranks.
//!
//! ```bash
//! cargo run --example send_recv
//! ```

use collie::{CollieConfig, ProcessGroup};

#[tokio::main]
async fn main() -> collie::Result<()> {
    let mut groups = ProcessGroup::bootstrap_local(2, CollieConfig::default()).await?;
    let receiver = groups.pop().expect("rank 1");
    let sender = groups.pop().expect("rank 0");

    let payload: Vec<u64> = (0..16).map(|i| i * i).collect();

    let recv_task = tokio::spawn(async move {
        let mut buf = vec![0u64; 16];
        receiver.recv(0, &mut buf).await?;
        collie::Result::Ok(buf)
    });

    sender.send(1, &payload).await?;
    println!("rank 0 sent {} elements", payload.len());

    let received = recv_task
        .await
        .map_err(|e| collie::CollieError::transport(format!("task failed: {e}")))??;
    println!("rank 1 received: {received:?}");
    assert_eq!(received, payload);

    Ok(())
}
