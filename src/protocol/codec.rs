use crate::error::{CollieError, Result};
use crate::protocol::header::{HEADER_SIZE, Header, MessageType};
use crate::protocol::message::ControlMessage;
use crate::types::PROTOCOL_VERSION;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Control frames above this size are treated as corrupt.
pub const MAX_CONTROL_FRAME: usize = 16 * 1024 * 1024;

/// Encode a `ControlMessage` into a framed byte buffer: `[header][rkyv payload]`.
pub fn encode_message(msg: &ControlMessage, message_type: MessageType) -> Result<Vec<u8>> {
    let payload = rkyv::to_bytes::<rkyv::rancor::Error>(msg)
        .map_err(|e| CollieError::EncodeFailed(e.to_string()))?;

    if payload.len() > MAX_CONTROL_FRAME {
        return Err(CollieError::EncodeFailed(format!(
            "control payload of {} bytes exceeds {MAX_CONTROL_FRAME}",
            payload.len()
        )));
    }

    let header = Header {
        payload_length: payload.len() as u32,
        protocol_version: PROTOCOL_VERSION,
        message_type,
    };

    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Decode a framed byte buffer back into a `(Header, ControlMessage)`.
pub fn decode_message(buf: &[u8]) -> Result<(Header, ControlMessage)> {
    if buf.len() < HEADER_SIZE {
        return Err(CollieError::DecodeFailed(format!(
            "buffer too short: {} < {HEADER_SIZE}",
            buf.len()
        )));
    }

    let header_bytes: &[u8; HEADER_SIZE] = buf[..HEADER_SIZE]
        .try_into()
        .map_err(|_| CollieError::DecodeFailed("header slice length mismatch".into()))?;
    let header = decode_header(header_bytes)?;

    let payload_end = HEADER_SIZE + header.payload_length as usize;
    if buf.len() < payload_end {
        return Err(CollieError::DecodeFailed(format!(
            "buffer too short for payload: {} < {payload_end}",
            buf.len()
        )));
    }

    let msg = decode_payload(&buf[HEADER_SIZE..payload_end])?;
    Ok((header, msg))
}

fn decode_header(bytes: &[u8; HEADER_SIZE]) -> Result<Header> {
    let header = Header::decode(bytes)
        .ok_or_else(|| CollieError::DecodeFailed("invalid header: unknown message type".into()))?;
    if header.protocol_version != PROTOCOL_VERSION {
        return Err(CollieError::ProtocolMismatch {
            local: PROTOCOL_VERSION,
            remote: header.protocol_version,
        });
    }
    if header.payload_length as usize > MAX_CONTROL_FRAME {
        return Err(CollieError::DecodeFailed(format!(
            "control frame of {} bytes exceeds {MAX_CONTROL_FRAME}",
            header.payload_length
        )));
    }
    Ok(header)
}

fn decode_payload(payload: &[u8]) -> Result<ControlMessage> {
    // rkyv validates alignment; copy into an aligned buffer first.
    let mut aligned = rkyv::util::AlignedVec::<16>::with_capacity(payload.len());
    aligned.extend_from_slice(payload);
    rkyv::from_bytes::<ControlMessage, rkyv::rancor::Error>(&aligned)
        .map_err(|e| CollieError::DecodeFailed(e.to_string()))
}

/// Write one control frame to a stream and flush it.
pub async fn write_message<W>(
    writer: &mut W,
    msg: &ControlMessage,
    message_type: MessageType,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let buf = encode_message(msg, message_type)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one control frame from a stream.
pub async fn read_message<R>(reader: &mut R) -> Result<(Header, ControlMessage)>
where
    R: AsyncRead + Unpin,
{
    let mut header_buf = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header_buf).await?;
    let header = decode_header(&header_buf)?;

    let mut payload = vec![0u8; header.payload_length as usize];
    reader.read_exact(&mut payload).await?;
    let msg = decode_payload(&payload)?;
    Ok((header, msg))
}
