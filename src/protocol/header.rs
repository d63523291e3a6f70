/// Size of the control header in bytes.
pub const HEADER_SIZE: usize = 8;

/// Which phase of group formation a control frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Participant ↔ rank 0 traffic on the rendezvous address.
    Rendezvous = 0,
    /// Pair traffic on a mesh connection (peer hello, fabric negotiation).
    Mesh = 1,
}

impl MessageType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(MessageType::Rendezvous),
            1 => Some(MessageType::Mesh),
            _ => None,
        }
    }
}

/// 8-byte header prepended to every control frame.
///
/// ```text
/// [0..4] payload_length: u32 LE
/// [4..6] protocol_version: u16 LE
/// [6]    message_type: u8
/// [7]    reserved: u8 (must be 0)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub payload_length: u32,
    pub protocol_version: u16,
    pub message_type: MessageType,
}

impl Header {
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.payload_length.to_le_bytes());
        buf[4..6].copy_from_slice(&self.protocol_version.to_le_bytes());
        buf[6] = self.message_type as u8;
        buf
    }

    /// Returns `None` if the message type byte is unknown.
    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Option<Self> {
        let payload_length = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let protocol_version = u16::from_le_bytes([buf[4], buf[5]]);
        let message_type = MessageType::from_u8(buf[6])?;
        Some(Header {
            payload_length,
            protocol_version,
            message_type,
        })
    }
}
