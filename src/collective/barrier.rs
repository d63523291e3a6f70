use crate::collective::helpers::ceil_log2;
use crate::error::{CollieError, Result};
use crate::group::OpContext;
use crate::transport::tags;

/// Dissemination barrier: ceil(log2 N) rounds, no coordinator.
///
/// In round k every rank signals rank + 2^k and waits for rank - 2^k. Each
/// signal carries the group's barrier epoch so a rank that skipped a barrier
/// is detected instead of being released early.
pub(crate) async fn dissemination_barrier(op: &OpContext<'_>, epoch: u64) -> Result<()> {
    let rank = op.rank();
    let world = op.world_size();
    if world <= 1 {
        return Ok(());
    }

    for round in 0..ceil_log2(world) {
        let distance = 1u32 << round;
        let send_to = (rank + distance) % world;
        let recv_from = (rank + world - distance) % world;

        let (send_result, recv_result) = tokio::join!(
            op.send(send_to, tags::BARRIER, epoch.to_le_bytes().to_vec()),
            op.recv(recv_from, tags::BARRIER),
        );
        send_result?;
        let received = recv_result?;

        let theirs = <[u8; 8]>::try_from(received.as_slice())
            .ok()
            .map(u64::from_le_bytes);
        if theirs != Some(epoch) {
            let err = CollieError::transport(format!(
                "barrier round {round}: rank {recv_from} sent {received:?}, expected epoch {epoch}"
            ));
            op.poison(recv_from, &err);
            return Err(err);
        }
    }

    Ok(())
}
