//! Per-pair transport selection.
//!
//! A rank opens its preferred fabric once per rendezvous. Each mesh
//! connection then starts life as TCP and is upgraded to an RDMA queue pair
//! only when both ends advertised a fabric and the endpoint exchange succeeds
//! on both sides. Any failure along the way leaves the pair on TCP.

use crate::config::{CollieConfig, FabricSpec};
use crate::error::Result;
use crate::transport::{PeerTransport, TcpTransport};
use crate::types::Rank;
use tokio::net::TcpStream;

#[cfg(feature = "rdma")]
use std::sync::Arc;

/// An opened fabric device, shared by every pair this rank negotiates.
pub struct LocalFabric {
    spec: FabricSpec,
    #[cfg(feature = "rdma")]
    ctx: Arc<super::rdma::RdmaContext>,
    #[cfg(feature = "rdma")]
    chunk_bytes: usize,
}

impl LocalFabric {
    /// Open the configured fabric, if any.
    ///
    /// Returns `None` when no fabric is configured or the device cannot be
    /// used; the latter is logged and the rank proceeds on TCP.
    pub fn open(config: &CollieConfig) -> Option<Self> {
        let spec = config.preferred_fabric.clone()?;
        Self::open_spec(spec, config)
    }

    #[cfg(feature = "rdma")]
    fn open_spec(spec: FabricSpec, config: &CollieConfig) -> Option<Self> {
        match super::rdma::RdmaContext::open(&spec, config.gid_index) {
            Ok(ctx) => {
                tracing::info!(fabric = %spec, "fabric device opened");
                Some(Self {
                    spec,
                    ctx,
                    chunk_bytes: config.fabric_chunk_bytes,
                })
            }
            Err(e) => {
                tracing::warn!(fabric = %spec, "fabric unavailable, using TCP: {e}");
                None
            }
        }
    }

    #[cfg(not(feature = "rdma"))]
    fn open_spec(spec: FabricSpec, _config: &CollieConfig) -> Option<Self> {
        tracing::warn!(
            fabric = %spec,
            "fabric requested but built without the `rdma` feature, using TCP"
        );
        None
    }

    pub fn spec(&self) -> &FabricSpec {
        &self.spec
    }
}

/// Turn an identified mesh stream into the pair's transport.
///
/// `negotiate` is true when both ends advertised a fabric. Both sides of the
/// pair must pass the same value, which the `PeerHello`/`PeerAck` exchange
/// guarantees.
pub(crate) async fn establish(
    stream: TcpStream,
    peer: Rank,
    fabric: Option<&LocalFabric>,
    negotiate: bool,
) -> Result<Box<dyn PeerTransport>> {
    match fabric {
        Some(fabric) if negotiate => upgrade(stream, peer, fabric).await,
        _ => Ok(Box::new(TcpTransport::from_stream(stream, peer))),
    }
}

#[cfg(not(feature = "rdma"))]
async fn upgrade(
    stream: TcpStream,
    peer: Rank,
    _fabric: &LocalFabric,
) -> Result<Box<dyn PeerTransport>> {
    // Unreachable in practice: `LocalFabric::open` never succeeds without rdma.
    Ok(Box::new(TcpTransport::from_stream(stream, peer)))
}

#[cfg(feature = "rdma")]
async fn upgrade(
    mut stream: TcpStream,
    peer: Rank,
    fabric: &LocalFabric,
) -> Result<Box<dyn PeerTransport>> {
    use super::rdma::{RdmaEndpoint, RdmaTransport};
    use crate::protocol::{ControlMessage, MessageType, read_message, write_message};

    let prepared = match fabric.ctx.prepare_connection() {
        Ok(p) => Some(p),
        Err(e) => {
            tracing::warn!(peer, "failed to prepare queue pair: {e}");
            None
        }
    };

    let ours = match &prepared {
        Some(p) => {
            let ep = p.endpoint();
            ControlMessage::FabricEndpoint {
                qp_num: ep.qp_num,
                lid: ep.lid,
                gid: ep.gid.to_vec(),
                chunk_bytes: fabric.chunk_bytes as u64,
            }
        }
        None => ControlMessage::FabricReady { ok: false },
    };
    write_message(&mut stream, &ours, MessageType::Mesh).await?;

    let (_, theirs) = read_message(&mut stream).await?;
    let remote = match theirs {
        ControlMessage::FabricEndpoint {
            qp_num,
            lid,
            gid,
            chunk_bytes,
        } => <[u8; 16]>::try_from(gid.as_slice())
            .ok()
            .map(|gid| (RdmaEndpoint { qp_num, lid, gid }, chunk_bytes as usize)),
        ControlMessage::FabricReady { .. } => None,
        other => {
            return Err(crate::error::CollieError::DecodeFailed(format!(
                "unexpected {} during fabric negotiation with rank {peer}",
                other.kind()
            )));
        }
    };

    let (Some(prepared), Some((remote, remote_chunk))) = (prepared, remote) else {
        tracing::info!(peer, "fabric negotiation declined, pair uses TCP");
        return Ok(Box::new(TcpTransport::from_stream(stream, peer)));
    };

    let connected = prepared.complete(remote);
    if let Err(e) = &connected {
        tracing::warn!(peer, "queue pair handshake failed: {e}");
    }
    write_message(
        &mut stream,
        &ControlMessage::FabricReady {
            ok: connected.is_ok(),
        },
        MessageType::Mesh,
    )
    .await?;
    let peer_ok = match read_message(&mut stream).await? {
        (_, ControlMessage::FabricReady { ok }) => ok,
        (_, other) => {
            return Err(crate::error::CollieError::DecodeFailed(format!(
                "expected FabricReady from rank {peer}, got {}",
                other.kind()
            )));
        }
    };

    let control = TcpTransport::from_stream(stream, peer);
    match connected {
        Ok(qp) if peer_ok => {
            // Both sides are committed here; a local setup failure cannot be
            // renegotiated. Slot sizes must agree, so the smaller one wins.
            let chunk_bytes = fabric.chunk_bytes.min(remote_chunk);
            let transport = RdmaTransport::new(qp, control, peer, chunk_bytes)?;
            tracing::info!(peer, fabric = %fabric.spec, "pair upgraded to RDMA");
            Ok(Box::new(transport))
        }
        _ => {
            tracing::info!(peer, "fabric handshake incomplete, pair uses TCP");
            Ok(Box::new(control))
        }
    }
}
