//! Full-mesh connection setup.
//!
//! Each rank dials every lower rank and accepts one connection from every
//! higher rank, so each unordered pair ends up with exactly one stream. The
//! first frame on a stream identifies the dialer; the reply settles whether
//! the pair negotiates a fabric.

use super::{JoinContext, MembershipTable};
use crate::error::{CollieError, Result};
use crate::protocol::{ControlMessage, MessageType, read_message, write_message};
use crate::transport::tcp::connect_with_backoff;
use crate::transport::{PeerTransport, TransportListener, fabric};
use crate::types::Rank;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

type Peer = (Rank, Box<dyn PeerTransport>);

pub(super) async fn connect_mesh(
    ctx: &JoinContext<'_>,
    table: &MembershipTable,
    listener: TransportListener,
) -> Result<HashMap<Rank, Box<dyn PeerTransport>>> {
    let expected = ctx.world_size as usize - 1;
    let connected = AtomicUsize::new(0);

    let outbound =
        futures::future::try_join_all((0..ctx.rank).map(|peer| dial(ctx, table, peer, &connected)));
    let inbound = accept(
        ctx,
        &listener,
        (ctx.world_size - 1 - ctx.rank) as usize,
        &connected,
    );
    let work = async {
        let (dialed, accepted) = tokio::try_join!(outbound, inbound)?;
        Ok::<_, CollieError>(dialed.into_iter().chain(accepted).collect::<HashMap<_, _>>())
    };

    match tokio::time::timeout_at(ctx.deadline, work).await {
        Ok(Ok(peers)) => {
            tracing::debug!(rank = ctx.rank, peers = peers.len(), "mesh established");
            Ok(peers)
        }
        Ok(Err(e)) => Err(e),
        Err(_) => Err(ctx.timed_out(format!(
            "connecting to peers ({}/{expected} connected)",
            connected.load(Ordering::Relaxed)
        ))),
    }
}

async fn dial(
    ctx: &JoinContext<'_>,
    table: &MembershipTable,
    peer: Rank,
    connected: &AtomicUsize,
) -> Result<Peer> {
    let addr = table.addrs[peer as usize];
    let mut stream = connect_with_backoff(
        addr,
        ctx.deadline,
        ctx.config.connect_backoff_initial,
        ctx.config.connect_backoff_max,
    )
    .await
    .ok_or_else(|| ctx.timed_out(format!("dialing rank {peer} at {addr}")))?;

    let want_fabric = ctx.fabric.is_some() && table.has_fabric(peer);
    let hello = ControlMessage::PeerHello {
        rank: ctx.rank,
        token: ctx.token.as_bytes().to_vec(),
        fabric: want_fabric,
    };
    write_message(&mut stream, &hello, MessageType::Mesh)
        .await
        .map_err(|e| handshake_error(peer, e))?;

    let (_, reply) = read_message(&mut stream)
        .await
        .map_err(|e| handshake_error(peer, e))?;
    let negotiate = match reply {
        ControlMessage::PeerAck { rank, fabric } if rank == peer => fabric && want_fabric,
        ControlMessage::Reject { reason } => return Err(CollieError::RendezvousMismatch { reason }),
        other => {
            return Err(CollieError::RendezvousMismatch {
                reason: format!("rank {peer} at {addr} answered with {}", describe(&other)),
            });
        }
    };

    let transport = fabric::establish(stream, peer, ctx.fabric, negotiate).await?;
    connected.fetch_add(1, Ordering::Relaxed);
    tracing::debug!(rank = ctx.rank, peer, kind = %transport.kind(), "peer connected");
    Ok((peer, transport))
}

async fn accept(
    ctx: &JoinContext<'_>,
    listener: &TransportListener,
    expected: usize,
    connected: &AtomicUsize,
) -> Result<Vec<Peer>> {
    let mut peers = Vec::with_capacity(expected);
    let mut seen = HashSet::with_capacity(expected);

    while peers.len() < expected {
        let (mut stream, remote) = listener.accept().await?;
        let msg = match read_message(&mut stream).await {
            Ok((_, msg)) => msg,
            Err(CollieError::ProtocolMismatch { local, remote: theirs }) => {
                return Err(CollieError::RendezvousMismatch {
                    reason: format!(
                        "peer at {remote} speaks protocol version {theirs}, this rank speaks {local}"
                    ),
                });
            }
            Err(e) => {
                tracing::debug!(%remote, "dropping mesh connection: {e}");
                continue;
            }
        };
        let ControlMessage::PeerHello {
            rank: peer,
            token,
            fabric: peer_fabric,
        } = msg
        else {
            tracing::debug!(%remote, kind = msg.kind(), "dropping mesh connection: not a PeerHello");
            continue;
        };

        let problem = if token != ctx.token.as_bytes() {
            Some(format!("rank {peer} at {remote} presented a different group token"))
        } else if peer <= ctx.rank || peer >= ctx.world_size || !seen.insert(peer) {
            Some(format!("unexpected mesh connection from {remote} claiming rank {peer}"))
        } else {
            None
        };
        if let Some(reason) = problem {
            let reject = ControlMessage::Reject {
                reason: reason.clone(),
            };
            let _ = write_message(&mut stream, &reject, MessageType::Mesh).await;
            return Err(CollieError::RendezvousMismatch { reason });
        }

        let negotiate = peer_fabric && ctx.fabric.is_some();
        let ack = ControlMessage::PeerAck {
            rank: ctx.rank,
            fabric: negotiate,
        };
        write_message(&mut stream, &ack, MessageType::Mesh)
            .await
            .map_err(|e| handshake_error(peer, e))?;

        let transport = fabric::establish(stream, peer, ctx.fabric, negotiate).await?;
        connected.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(rank = ctx.rank, peer, kind = %transport.kind(), "peer accepted");
        peers.push((peer, transport));
    }

    Ok(peers)
}

fn handshake_error(peer: Rank, err: CollieError) -> CollieError {
    match err {
        CollieError::ProtocolMismatch { local, remote } => CollieError::RendezvousMismatch {
            reason: format!("rank {peer} speaks protocol version {remote}, this rank speaks {local}"),
        },
        other => CollieError::PeerConnectionLost {
            rank: peer,
            reason: format!("mesh handshake: {other}"),
        },
    }
}

fn describe(msg: &ControlMessage) -> String {
    match msg {
        ControlMessage::PeerAck { rank, .. } => format!("an acknowledgement from rank {rank}"),
        other => other.kind().to_string(),
    }
}
