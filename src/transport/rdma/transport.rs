//! Frame channel over a connected queue pair.
//!
//! Each frame travels as one 16-byte header SEND (`[tag u64 LE][len u64 LE]`)
//! followed by the payload split into chunk-sized SENDs. A dedicated
//! receiver thread keeps `RECV_SLOTS` receive buffers posted and reassembles
//! frames; senders copy through a registered staging region on the blocking
//! pool. The pair's TCP stream stays open purely as a liveness signal: the
//! peer going away closes it even when the queue pair is idle.

use super::connection::{Backoff, Poll, QueuePair};
use super::mr::RdmaMr;
use crate::error::{CollieError, Result};
use crate::transport::{PeerTransport, TcpTransport, TransportKind};
use crate::types::Rank;
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Receive buffers kept posted per queue pair.
pub(super) const RECV_SLOTS: usize = 8;

const FRAME_HEADER: usize = 16;
const MIN_CHUNK: usize = 4096;
const READ_QUEUE_DEPTH: usize = 64;

/// Tag of the liveness watch on the control stream; no frame is ever sent
/// with it, so a read only completes when the stream breaks.
const LIVENESS_TAG: u64 = u64::MAX;

type ReadItem = std::result::Result<(u64, Vec<u8>), String>;

pub struct RdmaTransport {
    peer: Rank,
    qp: Arc<QueuePair>,
    staging: Arc<Mutex<RdmaMr>>,
    frames: tokio::sync::Mutex<mpsc::Receiver<ReadItem>>,
    control: TcpTransport,
    closed: Arc<AtomicBool>,
    chunk_bytes: usize,
}

impl RdmaTransport {
    pub fn new(qp: QueuePair, control: TcpTransport, peer: Rank, chunk_bytes: usize) -> Result<Self> {
        let chunk_bytes = chunk_bytes.max(MIN_CHUNK);
        let qp = Arc::new(qp);
        let staging = qp.ctx.allocate(chunk_bytes)?;
        let slots = qp.ctx.allocate(chunk_bytes * RECV_SLOTS)?;
        for slot in 0..RECV_SLOTS {
            qp.post_recv(&slots, slot * chunk_bytes, chunk_bytes, slot as u64)?;
        }

        let closed = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel(READ_QUEUE_DEPTH);
        let receiver = Receiver {
            qp: Arc::clone(&qp),
            slots,
            chunk_bytes,
            tx,
            closed: Arc::clone(&closed),
            peer,
        };
        std::thread::Builder::new()
            .name(format!("collie-rdma-recv-{peer}"))
            .spawn(move || receiver.run())
            .map_err(|e| CollieError::device_with_source("spawn RDMA receiver thread", e))?;

        Ok(Self {
            peer,
            qp,
            staging: Arc::new(Mutex::new(staging)),
            frames: tokio::sync::Mutex::new(rx),
            control,
            closed,
            chunk_bytes,
        })
    }

    fn lost(&self, reason: impl Into<String>) -> CollieError {
        CollieError::PeerConnectionLost {
            rank: self.peer,
            reason: reason.into(),
        }
    }

    async fn write_frame(&self, tag: u64, payload: Vec<u8>) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(self.lost("connection closed locally"));
        }
        let qp = Arc::clone(&self.qp);
        let staging = Arc::clone(&self.staging);
        let closed = Arc::clone(&self.closed);
        let chunk = self.chunk_bytes;
        let res = tokio::task::spawn_blocking(move || {
            send_blocking(&qp, &staging, &closed, chunk, tag, &payload)
        })
        .await
        .map_err(|e| self.lost(format!("send task failed: {e}")))?;
        res.map_err(|e| {
            self.closed.store(true, Ordering::Release);
            self.lost(e.to_string())
        })
    }

    async fn read_frame(&self, expected_tag: u64) -> Result<Vec<u8>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(self.lost("connection closed locally"));
        }
        let mut frames = self.frames.lock().await;
        tokio::select! {
            item = frames.recv() => match item {
                Some(Ok((tag, payload))) if tag == expected_tag => Ok(payload),
                Some(Ok((tag, _))) => Err(CollieError::transport(format!(
                    "rank {}: expected frame tag {expected_tag}, got {tag}",
                    self.peer
                ))),
                Some(Err(reason)) => Err(self.lost(reason)),
                None => Err(self.lost("receiver stopped")),
            },
            watch = self.control.recv_frame(LIVENESS_TAG) => {
                let reason = match watch {
                    Err(e) => e.to_string(),
                    Ok(_) => "unexpected frame on control stream".to_string(),
                };
                self.closed.store(true, Ordering::Release);
                Err(self.lost(reason))
            }
        }
    }
}

impl PeerTransport for RdmaTransport {
    fn send_frame<'a>(&'a self, tag: u64, payload: Vec<u8>) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.write_frame(tag, payload))
    }

    fn recv_frame<'a>(&'a self, tag: u64) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(self.read_frame(tag))
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::debug!(peer = self.peer, "closing rdma transport");
        }
        self.control.close();
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Rdma
    }
}

impl Drop for RdmaTransport {
    fn drop(&mut self) {
        // The receiver thread notices the flag and releases its queue pair
        // reference on its own.
        self.closed.store(true, Ordering::Release);
    }
}

fn send_blocking(
    qp: &QueuePair,
    staging: &Mutex<RdmaMr>,
    closed: &AtomicBool,
    chunk: usize,
    tag: u64,
    payload: &[u8],
) -> Result<()> {
    let mut mr = staging
        .lock()
        .map_err(|e| CollieError::device(format!("staging lock poisoned: {e}")))?;

    let mut header = [0u8; FRAME_HEADER];
    header[0..8].copy_from_slice(&tag.to_le_bytes());
    header[8..16].copy_from_slice(&(payload.len() as u64).to_le_bytes());
    mr.as_mut_slice()[..FRAME_HEADER].copy_from_slice(&header);
    qp.post_send(&mr, FRAME_HEADER, 0)?;
    wait_send(qp, closed)?;

    for (i, piece) in payload.chunks(chunk).enumerate() {
        mr.as_mut_slice()[..piece.len()].copy_from_slice(piece);
        qp.post_send(&mr, piece.len(), i as u64 + 1)?;
        wait_send(qp, closed)?;
    }
    Ok(())
}

fn wait_send(qp: &QueuePair, closed: &AtomicBool) -> Result<()> {
    let mut backoff = Backoff::new();
    loop {
        if let Poll::Done(..) = qp.poll_send()? {
            return Ok(());
        }
        if closed.load(Ordering::Acquire) {
            return Err(CollieError::transport("connection closed during send"));
        }
        backoff.snooze();
    }
}

struct Receiver {
    qp: Arc<QueuePair>,
    slots: RdmaMr,
    chunk_bytes: usize,
    tx: mpsc::Sender<ReadItem>,
    closed: Arc<AtomicBool>,
    peer: Rank,
}

/// Reassembly state for the frame currently arriving.
struct Partial {
    tag: u64,
    remaining: usize,
    payload: Vec<u8>,
}

impl Receiver {
    fn run(self) {
        if let Err(e) = self.receive_loop() {
            tracing::debug!(peer = self.peer, "rdma recv loop ended: {e}");
            let _ = self.tx.blocking_send(Err(e.to_string()));
        }
    }

    fn receive_loop(&self) -> Result<()> {
        let mut backoff = Backoff::new();
        let mut partial: Option<Partial> = None;
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Ok(());
            }
            let (slot, len) = match self.qp.poll_recv()? {
                Poll::Empty => {
                    backoff.snooze();
                    continue;
                }
                Poll::Done(wr_id, len) => (wr_id as usize, len),
            };
            backoff.reset();

            let offset = slot * self.chunk_bytes;
            let data = &self.slots.as_slice()[offset..offset + len];

            let frame = match partial.as_mut() {
                None => {
                    if len != FRAME_HEADER {
                        return Err(CollieError::DecodeFailed(format!(
                            "expected {FRAME_HEADER}-byte frame header, got {len} bytes"
                        )));
                    }
                    let mut tag = [0u8; 8];
                    let mut size = [0u8; 8];
                    tag.copy_from_slice(&data[0..8]);
                    size.copy_from_slice(&data[8..16]);
                    let size = u64::from_le_bytes(size) as usize;
                    let p = Partial {
                        tag: u64::from_le_bytes(tag),
                        remaining: size,
                        payload: Vec::with_capacity(size),
                    };
                    if size == 0 {
                        Some(p)
                    } else {
                        partial = Some(p);
                        None
                    }
                }
                Some(p) => {
                    if len > p.remaining {
                        return Err(CollieError::DecodeFailed(format!(
                            "payload chunk of {len} bytes overruns frame ({} remaining)",
                            p.remaining
                        )));
                    }
                    p.payload.extend_from_slice(data);
                    p.remaining -= len;
                    if p.remaining == 0 { partial.take() } else { None }
                }
            };

            self.qp
                .post_recv(&self.slots, offset, self.chunk_bytes, slot as u64)?;

            if let Some(p) = frame {
                if self.tx.blocking_send(Ok((p.tag, p.payload))).is_err() {
                    return Ok(());
                }
            }
        }
    }
}
