//! Framed message codec
//!
//! Frames are a little-endian 4-byte length followed by that many bytes of
//! UTF-8 JSON. The length must be in `1 ..= MAX_FRAME_LEN`; anything else is
//! a protocol error and the connection carrying it is closed by the caller.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::message::{Envelope, MessageType};

/// Maximum frame payload length: 1 MiB
pub const MAX_FRAME_LEN: usize = 1_048_576;

/// Errors raised by the codec and the wire protocol
#[derive(Debug, Error)]
pub enum ProtoError {
    /// Declared frame length exceeds the maximum
    #[error("Frame of {len} bytes exceeds the {MAX_FRAME_LEN}-byte limit")]
    FrameTooLarge {
        /// Declared length
        len: usize,
    },

    /// Declared frame length was zero
    #[error("Zero-length frame")]
    EmptyFrame,

    /// The payload was not valid UTF-8 JSON of the expected shape
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// The `type` field named no registered message type
    #[error("Unknown message type: {0}")]
    UnknownType(String),

    /// A typed payload was requested from an envelope of another type
    #[error("Expected {expected} payload but envelope is {actual}")]
    PayloadMismatch {
        /// The requested payload's type
        expected: MessageType,
        /// The envelope's actual type
        actual: MessageType,
    },

    /// Underlying I/O failure
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Serialize an envelope into a complete frame (length prefix included)
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, ProtoError> {
    let body = serde_json::to_vec(envelope)
        .map_err(|e| ProtoError::Malformed(format!("serialization: {e}")))?;
    if body.len() > MAX_FRAME_LEN {
        return Err(ProtoError::FrameTooLarge { len: body.len() });
    }
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Deserialize a frame body (without the length prefix)
pub fn decode(body: &[u8]) -> Result<Envelope, ProtoError> {
    if body.is_empty() {
        return Err(ProtoError::EmptyFrame);
    }
    if body.len() > MAX_FRAME_LEN {
        return Err(ProtoError::FrameTooLarge { len: body.len() });
    }
    // Surface an unknown `type` as UnknownType rather than a serde error,
    // so callers can close the connection with a precise reason.
    let value: serde_json::Value =
        serde_json::from_slice(body).map_err(|e| ProtoError::Malformed(format!("JSON: {e}")))?;
    if let Some(type_name) = value.get("type").and_then(|t| t.as_str()) {
        MessageType::parse(type_name)?;
    }
    serde_json::from_value(value).map_err(|e| ProtoError::Malformed(format!("envelope: {e}")))
}

/// Read one frame from the stream
///
/// Returns `Ok(None)` on clean EOF at a frame boundary. EOF in the middle of
/// a frame, an invalid length, or a malformed body is an error; the caller
/// must close the connection.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Envelope>, ProtoError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_le_bytes(len_buf) as usize;
    if len == 0 {
        return Err(ProtoError::EmptyFrame);
    }
    if len > MAX_FRAME_LEN {
        return Err(ProtoError::FrameTooLarge { len });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;

    decode(&body).map(Some)
}

/// Write one frame to the stream and flush it
pub async fn write_frame<W>(writer: &mut W, envelope: &Envelope) -> Result<(), ProtoError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode(envelope)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}
