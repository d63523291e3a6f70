use crate::error::{CollieError, Result};
use crate::transport::{PeerTransport, TransportKind};
use crate::types::Rank;
use futures::future::BoxFuture;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Frames larger than this are treated as a corrupt stream (4 GiB).
const MAX_FRAME_SIZE: u64 = 4 * 1024 * 1024 * 1024;

/// Frames buffered between the reader task and `recv_frame`.
const READ_QUEUE_DEPTH: usize = 64;

struct WriteRequest {
    tag: u64,
    payload: Vec<u8>,
    done: oneshot::Sender<std::result::Result<(), String>>,
}

type ReadItem = std::result::Result<(u64, Vec<u8>), String>;

/// Ordered, reliable byte channel to one peer over TCP.
///
/// Wire format per frame: `[tag: u64 LE][len: u64 LE][payload]`.
///
/// One reader task drains the socket into a bounded queue and one writer
/// task serializes outgoing frames, so a send and a receive on the same
/// pair can be in flight together without either side stalling the other.
pub struct TcpTransport {
    peer: Rank,
    write_tx: mpsc::Sender<WriteRequest>,
    read_rx: Mutex<mpsc::Receiver<ReadItem>>,
    closed: AtomicBool,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl TcpTransport {
    /// Take over an established stream. Spawns the reader and writer tasks.
    pub fn from_stream(stream: TcpStream, peer: Rank) -> Self {
        let (read_half, write_half) = stream.into_split();
        let (write_tx, write_rx) = mpsc::channel(READ_QUEUE_DEPTH);
        let (read_tx, read_rx) = mpsc::channel(READ_QUEUE_DEPTH);

        let reader = tokio::spawn(read_loop(read_half, read_tx, peer));
        let writer = tokio::spawn(write_loop(write_half, write_rx, peer));

        Self {
            peer,
            write_tx,
            read_rx: Mutex::new(read_rx),
            closed: AtomicBool::new(false),
            reader,
            writer,
        }
    }

    pub fn peer(&self) -> Rank {
        self.peer
    }

    fn lost(&self, reason: impl Into<String>) -> CollieError {
        CollieError::PeerConnectionLost {
            rank: self.peer,
            reason: reason.into(),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(self.lost("connection closed locally"));
        }
        Ok(())
    }

    async fn write_frame(&self, tag: u64, payload: Vec<u8>) -> Result<()> {
        self.ensure_open()?;
        let (done, ack) = oneshot::channel();
        self.write_tx
            .send(WriteRequest { tag, payload, done })
            .await
            .map_err(|_| self.lost("writer stopped"))?;
        match ack.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => Err(self.lost(reason)),
            Err(_) => Err(self.lost("writer stopped before acknowledging frame")),
        }
    }

    async fn read_frame(&self, expected_tag: u64) -> Result<Vec<u8>> {
        self.ensure_open()?;
        let item = self.read_rx.lock().await.recv().await;
        match item {
            Some(Ok((tag, payload))) if tag == expected_tag => Ok(payload),
            Some(Ok((tag, _))) => Err(CollieError::transport(format!(
                "rank {}: expected frame tag {expected_tag}, got {tag}",
                self.peer
            ))),
            Some(Err(reason)) => Err(self.lost(reason)),
            None => Err(self.lost("connection closed")),
        }
    }
}

impl PeerTransport for TcpTransport {
    fn send_frame<'a>(&'a self, tag: u64, payload: Vec<u8>) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.write_frame(tag, payload))
    }

    fn recv_frame<'a>(&'a self, tag: u64) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(self.read_frame(tag))
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::debug!(peer = self.peer, "closing tcp transport");
        }
        self.reader.abort();
        self.writer.abort();
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

async fn read_loop(mut reader: OwnedReadHalf, tx: mpsc::Sender<ReadItem>, peer: Rank) {
    let mut header = [0u8; 16];
    loop {
        if let Err(e) = reader.read_exact(&mut header).await {
            tracing::debug!(peer, "tcp recv loop ended: {e}");
            let _ = tx.send(Err(format!("read frame header: {e}"))).await;
            return;
        }
        let tag = u64::from_le_bytes([
            header[0], header[1], header[2], header[3], header[4], header[5], header[6], header[7],
        ]);
        let len = u64::from_le_bytes([
            header[8], header[9], header[10], header[11], header[12], header[13], header[14],
            header[15],
        ]);

        if len > MAX_FRAME_SIZE {
            tracing::warn!(peer, len, "tcp frame too large, closing connection");
            let _ = tx.send(Err(format!("frame of {len} bytes exceeds limit"))).await;
            return;
        }

        let mut payload = vec![0u8; len as usize];
        if let Err(e) = reader.read_exact(&mut payload).await {
            tracing::debug!(peer, "tcp recv loop ended reading payload: {e}");
            let _ = tx.send(Err(format!("read frame payload: {e}"))).await;
            return;
        }

        if tx.send(Ok((tag, payload))).await.is_err() {
            return;
        }
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::Receiver<WriteRequest>, peer: Rank) {
    while let Some(req) = rx.recv().await {
        let mut header = [0u8; 16];
        header[0..8].copy_from_slice(&req.tag.to_le_bytes());
        header[8..16].copy_from_slice(&(req.payload.len() as u64).to_le_bytes());

        let result = async {
            writer.write_all(&header).await?;
            writer.write_all(&req.payload).await?;
            writer.flush().await
        }
        .await;

        match result {
            Ok(()) => {
                let _ = req.done.send(Ok(()));
            }
            Err(e) => {
                tracing::debug!(peer, "tcp write failed: {e}");
                let _ = req.done.send(Err(format!("write frame: {e}")));
                return;
            }
        }
    }
}

/// Apply latency and liveness options to a freshly connected stream.
pub(crate) fn configure_stream(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::warn!("failed to set TCP_NODELAY: {e}");
    }
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(60))
        .with_interval(Duration::from_secs(10));
    if let Err(e) = socket2::SockRef::from(stream).set_tcp_keepalive(&keepalive) {
        tracing::warn!("failed to set TCP keepalive: {e}");
    }
}

/// Dial `addr`, retrying with exponential backoff until `deadline`.
///
/// Returns `None` if the deadline passes without a successful connect.
pub(crate) async fn connect_with_backoff(
    addr: SocketAddr,
    deadline: Instant,
    initial: Duration,
    max: Duration,
) -> Option<TcpStream> {
    let mut delay = initial;
    loop {
        match tokio::time::timeout_at(deadline, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                configure_stream(&stream);
                return Some(stream);
            }
            Ok(Err(e)) => tracing::debug!(%addr, "connect failed, retrying in {delay:?}: {e}"),
            Err(_) => return None,
        }
        let now = Instant::now();
        if now >= deadline {
            return None;
        }
        tokio::time::sleep_until((now + delay).min(deadline)).await;
        delay = (delay * 2).min(max);
    }
}
