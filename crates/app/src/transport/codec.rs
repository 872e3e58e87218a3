//! Binary wire framing: 4-byte big-endian length, 1-byte kind tag, payload.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single message payload. Anything larger is a protocol
/// violation, not a legitimate audio block.
pub const MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WireKind {
    /// PCM16 audio block, client to server.
    AudioClient = 0x01,
    /// PCM16 audio block, server to client.
    AudioServer = 0x02,
    /// JSON control message, either direction.
    Control = 0x10,
    /// JSON error, server to client.
    Error = 0x20,
    /// JSON system message (hello/accept/drain), either direction.
    System = 0xFF,
}

impl WireKind {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x01 => Some(WireKind::AudioClient),
            0x02 => Some(WireKind::AudioServer),
            0x10 => Some(WireKind::Control),
            0x20 => Some(WireKind::Error),
            0xFF => Some(WireKind::System),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WireFrame {
    pub kind: WireKind,
    pub payload: Vec<u8>,
}

impl WireFrame {
    pub fn new(kind: WireKind, payload: Vec<u8>) -> Self {
        Self { kind, payload }
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("connection closed")]
    Closed,

    #[error("payload of {0} bytes exceeds the {MAX_PAYLOAD_BYTES}-byte limit")]
    PayloadTooLarge(usize),

    #[error("unknown frame kind tag 0x{0:02x}")]
    UnknownKind(u8),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Read one wire frame. The length prefix counts the kind tag plus payload.
pub async fn read_wire_frame<R>(reader: &mut R) -> Result<WireFrame, CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Err(CodecError::Closed),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 {
        return Err(CodecError::UnknownKind(0));
    }
    let payload_len = len - 1;
    if payload_len > MAX_PAYLOAD_BYTES {
        return Err(CodecError::PayloadTooLarge(payload_len));
    }

    let mut tag = [0u8; 1];
    reader.read_exact(&mut tag).await?;
    let kind = WireKind::from_tag(tag[0]).ok_or(CodecError::UnknownKind(tag[0]))?;

    let mut payload = vec![0u8; payload_len];
    reader.read_exact(&mut payload).await?;
    Ok(WireFrame { kind, payload })
}

pub async fn write_wire_frame<W>(writer: &mut W, frame: &WireFrame) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    if frame.payload.len() > MAX_PAYLOAD_BYTES {
        return Err(CodecError::PayloadTooLarge(frame.payload.len()));
    }
    let len = (frame.payload.len() + 1) as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&[frame.kind as u8]).await?;
    writer.write_all(&frame.payload).await?;
    writer.flush().await?;
    Ok(())
}
