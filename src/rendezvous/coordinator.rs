//! Identity exchange with rank 0.
//!
//! Rank 0 accepts one connection per participant, validates each `Hello`,
//! and once all `world_size - 1` are admitted sends every participant the
//! same `Membership` table. Any inconsistency aborts the whole rendezvous:
//! the offender and every admitted participant receive `Reject`. Running
//! out of time sends `Expired` instead.

use super::{JoinContext, MembershipTable, RendezvousListener};
use crate::error::{CollieError, Result};
use crate::protocol::{ControlMessage, MessageType, read_message, write_message};
use crate::transport::TransportListener;
use crate::transport::iface::interface_ip;
use crate::transport::tcp::connect_with_backoff;
use crate::types::Rank;
use std::net::{IpAddr, SocketAddr};
use tokio::net::TcpStream;

/// A participant rank 0 has accepted.
struct Admitted {
    rank: Rank,
    stream: TcpStream,
    data_addr: SocketAddr,
    fabric: bool,
}

/// Address the data listener binds to: the configured interface, else the
/// address this rank already uses for the rendezvous.
fn data_bind_ip(ctx: &JoinContext<'_>, fallback: IpAddr) -> Result<IpAddr> {
    match &ctx.config.fallback_interface {
        Some(name) => interface_ip(name),
        None => Ok(fallback),
    }
}

/// Rank 0 side. Returns the membership table and this rank's data listener.
pub(super) async fn coordinate(
    listener: &RendezvousListener,
    ctx: &JoinContext<'_>,
) -> Result<(MembershipTable, TransportListener)> {
    let world = ctx.world_size;
    let data_ip = data_bind_ip(ctx, listener.local_addr().ip())?;
    let data_listener = TransportListener::bind(SocketAddr::new(data_ip, 0)).await?;
    let data_port = data_listener.local_addr().port();

    tracing::info!(
        world_size = world,
        addr = %listener.local_addr(),
        "rendezvous coordinator waiting for ranks"
    );

    let mut admitted: Vec<Admitted> = Vec::with_capacity(world as usize - 1);
    while admitted.len() < world as usize - 1 {
        let joined_stage = |n: usize| format!("waiting for ranks to join ({}/{world} joined)", n + 1);

        let (mut stream, remote) = tokio::select! {
            res = listener.inner.accept() => res?,
            _ = tokio::time::sleep_until(ctx.deadline) => {
                let stage = joined_stage(admitted.len());
                return Err(expire(ctx, &mut admitted, stage).await);
            }
        };

        let msg = match tokio::time::timeout_at(ctx.deadline, read_message(&mut stream)).await {
            Err(_) => {
                let stage = joined_stage(admitted.len());
                return Err(expire(ctx, &mut admitted, stage).await);
            }
            Ok(Err(CollieError::ProtocolMismatch { local, remote: theirs })) => {
                let reason = format!(
                    "participant at {remote} speaks protocol version {theirs}, rank 0 speaks {local}"
                );
                return Err(abort(stream, &mut admitted, reason).await);
            }
            Ok(Err(e)) => {
                tracing::debug!(%remote, "dropping rendezvous connection: {e}");
                continue;
            }
            Ok(Ok((_, msg))) => msg,
        };

        let ControlMessage::Hello {
            rank,
            world_size,
            token,
            data_addr,
            fabric,
        } = msg
        else {
            tracing::debug!(%remote, kind = msg.kind(), "dropping rendezvous connection: not a Hello");
            continue;
        };

        let checked = validate_hello(ctx, &admitted, rank, world_size, &token, &data_addr);
        match checked {
            Ok(data_addr) => {
                admitted.push(Admitted {
                    rank,
                    stream,
                    data_addr,
                    fabric: fabric.is_some(),
                });
                tracing::info!(
                    "rank joined: rank={rank}, total={}/{world}",
                    admitted.len() + 1
                );
            }
            Err(reason) => return Err(abort(stream, &mut admitted, reason).await),
        }
    }

    let mut addrs = vec![SocketAddr::new(data_ip, data_port); world as usize];
    let mut fabric_ranks = Vec::new();
    if ctx.fabric.is_some() {
        fabric_ranks.push(0);
    }
    for a in &admitted {
        addrs[a.rank as usize] = a.data_addr;
        if a.fabric {
            fabric_ranks.push(a.rank);
        }
    }
    fabric_ranks.sort_unstable();

    for a in &mut admitted {
        let mut members = addrs.clone();
        // A wildcard bind is not dialable; advertise the address this
        // participant reached us on instead.
        if data_ip.is_unspecified() {
            members[0] = SocketAddr::new(a.stream.local_addr()?.ip(), data_port);
        }
        let table = ControlMessage::Membership {
            members: members
                .iter()
                .enumerate()
                .map(|(r, addr)| (r as Rank, addr.to_string()))
                .collect(),
            fabric_ranks: fabric_ranks.clone(),
        };
        let sent = tokio::time::timeout_at(
            ctx.deadline,
            write_message(&mut a.stream, &table, MessageType::Rendezvous),
        )
        .await;
        match sent {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(CollieError::PeerConnectionLost {
                    rank: a.rank,
                    reason: format!("sending membership table: {e}"),
                });
            }
            Err(_) => return Err(ctx.timed_out("sending the membership table")),
        }
    }

    tracing::info!(world_size = world, ?fabric_ranks, "membership finalized");
    Ok((
        MembershipTable {
            addrs,
            fabric_ranks,
        },
        data_listener,
    ))
}

fn validate_hello(
    ctx: &JoinContext<'_>,
    admitted: &[Admitted],
    rank: Rank,
    world_size: u32,
    token: &[u8],
    data_addr: &str,
) -> std::result::Result<SocketAddr, String> {
    if token != ctx.token.as_bytes() {
        return Err(format!("rank {rank} presented a different group token"));
    }
    if world_size != ctx.world_size {
        return Err(format!(
            "rank {rank} expects world_size {world_size}, rank 0 expects {}",
            ctx.world_size
        ));
    }
    if rank == 0 || admitted.iter().any(|a| a.rank == rank) {
        return Err(format!("duplicate rank {rank}"));
    }
    if rank >= ctx.world_size {
        return Err(format!(
            "rank {rank} out of range for world_size {}",
            ctx.world_size
        ));
    }
    data_addr
        .parse()
        .map_err(|_| format!("rank {rank} advertised invalid data address '{data_addr}'"))
}

/// Reject the offender and everyone admitted so far.
async fn abort(mut offender: TcpStream, admitted: &mut [Admitted], reason: String) -> CollieError {
    tracing::warn!("rendezvous aborted: {reason}");
    let reject = ControlMessage::Reject {
        reason: reason.clone(),
    };
    let _ = write_message(&mut offender, &reject, MessageType::Rendezvous).await;
    reject_all(admitted, &reason).await;
    CollieError::RendezvousMismatch { reason }
}

/// Tell everyone admitted that the rendezvous ran out of time.
async fn expire(ctx: &JoinContext<'_>, admitted: &mut [Admitted], stage: String) -> CollieError {
    tracing::warn!("rendezvous timed out while {stage}");
    let expired = ControlMessage::Expired {
        joined: admitted.len() as u32 + 1,
    };
    for a in admitted.iter_mut() {
        let _ = write_message(&mut a.stream, &expired, MessageType::Rendezvous).await;
    }
    ctx.timed_out(stage)
}

async fn reject_all(admitted: &mut [Admitted], reason: &str) {
    let reject = ControlMessage::Reject {
        reason: reason.to_string(),
    };
    for a in admitted {
        if let Err(e) = write_message(&mut a.stream, &reject, MessageType::Rendezvous).await {
            tracing::debug!(rank = a.rank, "failed to deliver Reject: {e}");
        }
    }
}

/// Participant side. Returns the membership table and this rank's data
/// listener.
pub(super) async fn register(
    coordinator: SocketAddr,
    ctx: &JoinContext<'_>,
) -> Result<(MembershipTable, TransportListener)> {
    let mut stream = connect_with_backoff(
        coordinator,
        ctx.deadline,
        ctx.config.connect_backoff_initial,
        ctx.config.connect_backoff_max,
    )
    .await
    .ok_or_else(|| ctx.timed_out(format!("dialing rank 0 at {coordinator}")))?;

    let data_ip = data_bind_ip(ctx, stream.local_addr()?.ip())?;
    let data_listener = TransportListener::bind(SocketAddr::new(data_ip, 0)).await?;

    let hello = ControlMessage::Hello {
        rank: ctx.rank,
        world_size: ctx.world_size,
        token: ctx.token.as_bytes().to_vec(),
        data_addr: data_listener.local_addr().to_string(),
        fabric: ctx.fabric.map(|f| f.spec().device.clone()),
    };
    write_message(&mut stream, &hello, MessageType::Rendezvous)
        .await
        .map_err(|e| CollieError::PeerConnectionLost {
            rank: 0,
            reason: format!("sending Hello: {e}"),
        })?;
    tracing::debug!(rank = ctx.rank, %coordinator, "registered with rank 0");

    let msg = match tokio::time::timeout_at(ctx.deadline, read_message(&mut stream)).await {
        Err(_) => return Err(ctx.timed_out("waiting for the membership table from rank 0")),
        Ok(Err(CollieError::ProtocolMismatch { local, remote })) => {
            return Err(CollieError::RendezvousMismatch {
                reason: format!("rank 0 speaks protocol version {remote}, this rank speaks {local}"),
            });
        }
        Ok(Err(e)) => {
            return Err(CollieError::PeerConnectionLost {
                rank: 0,
                reason: format!("waiting for membership table: {e}"),
            });
        }
        Ok(Ok((_, msg))) => msg,
    };

    match msg {
        ControlMessage::Membership {
            members,
            fabric_ranks,
        } => {
            let table = parse_table(ctx, members, fabric_ranks)
                .map_err(|reason| CollieError::RendezvousMismatch { reason })?;
            tracing::info!(rank = ctx.rank, world_size = ctx.world_size, "membership received");
            Ok((table, data_listener))
        }
        ControlMessage::Reject { reason } => Err(CollieError::RendezvousMismatch { reason }),
        ControlMessage::Expired { joined } => Err(ctx.timed_out(format!(
            "waiting for ranks to join ({joined}/{} joined at rank 0)",
            ctx.world_size
        ))),
        other => Err(CollieError::DecodeFailed(format!(
            "expected Membership from rank 0, got {}",
            other.kind()
        ))),
    }
}

fn parse_table(
    ctx: &JoinContext<'_>,
    members: Vec<(Rank, String)>,
    fabric_ranks: Vec<Rank>,
) -> std::result::Result<MembershipTable, String> {
    if members.len() != ctx.world_size as usize {
        return Err(format!(
            "membership table lists {} ranks, expected {}",
            members.len(),
            ctx.world_size
        ));
    }
    let mut addrs = Vec::with_capacity(members.len());
    for (i, (rank, addr)) in members.into_iter().enumerate() {
        if rank as usize != i {
            return Err(format!("membership table out of order at position {i}"));
        }
        let addr: SocketAddr = addr
            .parse()
            .map_err(|_| format!("invalid data address '{addr}' for rank {rank}"))?;
        addrs.push(addr);
    }
    Ok(MembershipTable {
        addrs,
        fabric_ranks,
    })
}
