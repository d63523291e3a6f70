use crate::collective::helpers::ChunkLayout;
use crate::device::DeviceAdapter;
use crate::error::{CollieError, Result};
use crate::group::OpContext;
use crate::transport::tags;
use crate::types::{DataType, Rank};

/// Ring all-reduce (sum), in place on `count` elements at `ptr`.
///
/// Algorithm:
/// 1. Reduce-scatter: N-1 rounds. Each rank sends one chunk to the next rank
///    and receives one chunk from the previous rank, accumulating it in place.
///    Afterwards rank r holds the full sum of chunk (r+1) mod N.
/// 2. Allgather: N-1 rounds. Each rank forwards its last completed chunk to
///    the next rank and overwrites the chunk it receives.
///
/// Every chunk is summed along the same ring path on every call, so the
/// floating-point accumulation order only depends on rank order.
///
/// On failure the buffer holds a partial sum and the group is invalidated.
///
/// # Safety
/// `ptr` must be valid for reads and writes of `count * dtype.size_in_bytes()`
/// bytes through `adapter`, and not be accessed elsewhere until this returns.
pub(crate) async unsafe fn ring_allreduce(
    op: &OpContext<'_>,
    adapter: &dyn DeviceAdapter,
    ptr: u64,
    count: usize,
    dtype: DataType,
) -> Result<()> {
    let world = op.world_size() as usize;
    let rank = op.rank() as usize;

    if world <= 1 {
        return Ok(());
    }

    let elem_size = dtype.size_in_bytes();
    let layout = ChunkLayout::new(count, world);
    let next = ((rank + 1) % world) as Rank;
    let prev = ((rank + world - 1) % world) as Rank;

    let chunk_ptr = |idx: usize| ptr + (layout.range(idx).start * elem_size) as u64;

    // Phase 1: reduce-scatter.
    for step in 0..(world - 1) {
        let send_idx = (rank + world - step) % world;
        let recv_idx = (rank + world - step - 1) % world;

        let send_len = layout.range(send_idx).len() * elem_size;
        let staged = unsafe { adapter.stage_for_send(chunk_ptr(send_idx), send_len) };
        let outgoing = device_step(op, next, staged)?;

        let (send_result, recv_result) = tokio::join!(
            op.send(next, tags::ALL_REDUCE, outgoing),
            op.recv(prev, tags::ALL_REDUCE),
        );
        send_result?;
        let incoming = recv_result?;

        let recv_count = layout.range(recv_idx).len();
        check_chunk(op, prev, recv_count * elem_size, incoming.len())?;
        let reduced = unsafe {
            adapter.reduce_sum_inplace(chunk_ptr(recv_idx), &incoming, recv_count, dtype)
        };
        device_step(op, prev, reduced)?;
    }

    // Phase 2: allgather.
    for step in 0..(world - 1) {
        let send_idx = (rank + world + 1 - step) % world;
        let recv_idx = (rank + world - step) % world;

        let send_len = layout.range(send_idx).len() * elem_size;
        let staged = unsafe { adapter.stage_for_send(chunk_ptr(send_idx), send_len) };
        let outgoing = device_step(op, next, staged)?;

        let (send_result, recv_result) = tokio::join!(
            op.send(next, tags::ALL_REDUCE, outgoing),
            op.recv(prev, tags::ALL_REDUCE),
        );
        send_result?;
        let incoming = recv_result?;

        check_chunk(op, prev, layout.range(recv_idx).len() * elem_size, incoming.len())?;
        let written = unsafe { adapter.receive_to_device(&incoming, chunk_ptr(recv_idx)) };
        device_step(op, prev, written)?;
    }

    Ok(())
}

/// A chunk of the wrong size means the ranks disagree on the buffer length;
/// the ring is out of step from here on, so the group is torn down.
fn check_chunk(op: &OpContext<'_>, peer: Rank, expected: usize, actual: usize) -> Result<()> {
    if expected == actual {
        return Ok(());
    }
    let err = CollieError::BufferSizeMismatch { expected, actual };
    op.poison(peer, &err);
    Err(err)
}

/// A failed adapter call leaves this rank's ring position behind its
/// neighbours, so the group is torn down before the error is returned.
fn device_step<T>(op: &OpContext<'_>, peer: Rank, res: Result<T>) -> Result<T> {
    if let Err(err) = &res {
        op.poison(peer, err);
    }
    res
}
