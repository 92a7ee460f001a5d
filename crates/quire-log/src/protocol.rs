use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use quire_types::{BlockInfo, DiscoveryKey};

use crate::error::{LogError, LogResult};

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

/// Top-level replication frame.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// First frame on every connection.
    Handshake { version: u32, expected_feeds: u32 },
    /// A message for the feed session identified by `key`.
    Feed {
        key: DiscoveryKey,
        message: FeedMessage,
    },
}

/// Messages exchanged within one feed session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeedMessage {
    Open,
    /// Infos for blocks `from..from + infos.len()` and the runs of blocks
    /// the sender holds.
    Have {
        from: u64,
        infos: Vec<BlockInfo>,
        available: Vec<(u64, u64)>,
    },
    Request { index: u64 },
    Data { index: u64, data: Vec<u8> },
}

impl Frame {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Handshake { .. } => "Handshake",
            Self::Feed { message, .. } => match message {
                FeedMessage::Open => "Open",
                FeedMessage::Have { .. } => "Have",
                FeedMessage::Request { .. } => "Request",
                FeedMessage::Data { .. } => "Data",
            },
        }
    }
}

/// Encode a frame: `[4 bytes len BE][bincode payload]`.
pub fn encode(frame: &Frame) -> LogResult<Vec<u8>> {
    let payload = bincode::serialize(frame).map_err(|e| LogError::Serialization(e.to_string()))?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(LogError::Protocol(format!(
            "frame of {} bytes exceeds {MAX_FRAME_SIZE}",
            payload.len()
        )));
    }
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Decode one framed message from the front of `data`. Returns the frame and
/// the number of bytes consumed.
pub fn decode(data: &[u8]) -> LogResult<(Frame, usize)> {
    let header: [u8; 4] = data
        .get(..4)
        .and_then(|h| h.try_into().ok())
        .ok_or_else(|| LogError::Protocol("truncated frame header".into()))?;
    let len = u32::from_be_bytes(header) as usize;
    check_len(len)?;
    let payload = data
        .get(4..4 + len)
        .ok_or_else(|| LogError::Protocol(format!("incomplete frame: need {len} bytes")))?;
    Ok((decode_payload(payload)?, 4 + len))
}

fn check_len(len: usize) -> LogResult<()> {
    if len == 0 {
        return Err(LogError::Protocol("zero-length frame".into()));
    }
    if len > MAX_FRAME_SIZE {
        return Err(LogError::Protocol(format!(
            "frame of {len} bytes exceeds {MAX_FRAME_SIZE}"
        )));
    }
    Ok(())
}

fn decode_payload(payload: &[u8]) -> LogResult<Frame> {
    bincode::deserialize(payload).map_err(|e| LogError::Protocol(format!("undecodable frame: {e}")))
}

/// Read the next frame. Returns `Ok(None)` on a clean end of stream.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> LogResult<Option<Frame>> {
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(header) as usize;
    check_len(len)?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    decode_payload(&payload).map(Some)
}

/// Write one frame and flush.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> LogResult<()> {
    let bytes = encode(frame)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}
