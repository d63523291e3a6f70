use crate::types::Rank;

/// Control messages exchanged during rendezvous and mesh setup.
///
/// Buffer contents never flow through this enum. Once a pair connection is
/// established, data moves as raw tagged frames on the transport.
#[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, PartialEq)]
pub enum ControlMessage {
    /// Participant identity, sent to rank 0 on the rendezvous connection.
    Hello {
        rank: Rank,
        world_size: u32,
        token: Vec<u8>,
        /// `host:port` of the participant's data listener.
        data_addr: String,
        /// Fabric device the participant could open, if any.
        fabric: Option<String>,
    },

    /// Finalized membership table broadcast by rank 0.
    Membership {
        /// `(rank, data_addr)` for every rank, sorted by rank.
        members: Vec<(Rank, String)>,
        /// Ranks that advertised a usable fabric device.
        fabric_ranks: Vec<Rank>,
    },

    /// Rendezvous aborted; `reason` names the offending participant.
    Reject { reason: String },

    /// Rank 0 gave up waiting; `joined` ranks (itself included) had arrived.
    Expired { joined: u32 },

    /// First frame on a mesh connection, sent by the dialing (higher) rank.
    PeerHello {
        rank: Rank,
        token: Vec<u8>,
        fabric: bool,
    },

    /// Accepting rank's confirmation of a `PeerHello`.
    PeerAck { rank: Rank, fabric: bool },

    /// RDMA queue pair addressing for one side of a pair, plus the size of
    /// the receive slots that side will post.
    FabricEndpoint {
        qp_num: u32,
        lid: u16,
        gid: Vec<u8>,
        chunk_bytes: u64,
    },

    /// Whether the sender's queue pair reached ready-to-send.
    FabricReady { ok: bool },
}

impl ControlMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::Hello { .. } => "Hello",
            ControlMessage::Membership { .. } => "Membership",
            ControlMessage::Reject { .. } => "Reject",
            ControlMessage::Expired { .. } => "Expired",
            ControlMessage::PeerHello { .. } => "PeerHello",
            ControlMessage::PeerAck { .. } => "PeerAck",
            ControlMessage::FabricEndpoint { .. } => "FabricEndpoint",
            ControlMessage::FabricReady { .. } => "FabricReady",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_variants_roundtrip() {
        let messages = vec![
            ControlMessage::Hello {
                rank: 2,
                world_size: 4,
                token: vec![1, 2, 3],
                data_addr: "10.0.0.2:41000".into(),
                fabric: Some("mlx5_0".into()),
            },
            ControlMessage::Membership {
                members: (0..4).map(|r| (r, format!("10.0.0.{r}:41000"))).collect(),
                fabric_ranks: vec![0, 3],
            },
            ControlMessage::Reject {
                reason: "token mismatch".into(),
            },
            ControlMessage::Expired { joined: 3 },
            ControlMessage::PeerHello {
                rank: 3,
                token: vec![9; 16],
                fabric: false,
            },
            ControlMessage::PeerAck {
                rank: 1,
                fabric: true,
            },
            ControlMessage::FabricEndpoint {
                qp_num: 42,
                lid: 7,
                gid: vec![0xfe; 16],
                chunk_bytes: 4 << 20,
            },
            ControlMessage::FabricReady { ok: true },
        ];

        for msg in messages {
            let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(&msg).unwrap();
            let back = rkyv::from_bytes::<ControlMessage, rkyv::rancor::Error>(&bytes).unwrap();
            assert_eq!(msg, back, "roundtrip failed for {}", msg.kind());
        }
    }
}
