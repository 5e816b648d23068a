//! Native messaging framing.
//!
//! The browser talks to the host over stdin/stdout. Each message is a 32-bit
//! length in native byte order followed by that many bytes of UTF-8 JSON.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest message accepted in either direction.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Errors while reading or writing framed messages.
#[derive(Error, Debug)]
pub enum MessageError {
    /// The stream failed or ended inside a frame.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame exceeds [`MAX_MESSAGE_SIZE`].
    #[error("message of {size} bytes exceeds the {MAX_MESSAGE_SIZE} byte limit")]
    TooLarge { size: usize },

    /// The payload is not valid JSON for the expected type.
    #[error("invalid message JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Reads one raw frame. Returns `Ok(None)` on a clean end of stream.
///
/// # Errors
///
/// Returns [`MessageError::TooLarge`] for oversized frames and
/// [`MessageError::Io`] if the stream ends mid-frame.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>, MessageError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "stream ended inside a length prefix",
            )
            .into());
        }
        filled += n;
    }

    let size = u32::from_ne_bytes(header) as usize;
    if size > MAX_MESSAGE_SIZE {
        return Err(MessageError::TooLarge { size });
    }

    let mut payload = vec![0u8; size];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

/// Reads and deserializes one message. Returns `Ok(None)` on a clean end of
/// stream.
///
/// # Errors
///
/// See [`read_frame`]; additionally [`MessageError::Json`] for bad payloads.
pub async fn read_message<R, T>(reader: &mut R) -> Result<Option<T>, MessageError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    match read_frame(reader).await? {
        Some(payload) => Ok(Some(serde_json::from_slice(&payload)?)),
        None => Ok(None),
    }
}

/// Serializes and writes one message, then flushes.
///
/// # Errors
///
/// Returns [`MessageError::TooLarge`] if the encoded message exceeds the limit.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<(), MessageError>
where
    W: AsyncWrite + Unpin,
    T: Serialize + ?Sized,
{
    let payload = serde_json::to_vec(message)?;
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(MessageError::TooLarge {
            size: payload.len(),
        });
    }

    let size = u32::try_from(payload.len()).map_err(|_| MessageError::TooLarge {
        size: payload.len(),
    })?;

    writer.write_all(&size.to_ne_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use tokio_test::io::Builder;

    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut bytes = (payload.len() as u32).to_ne_bytes().to_vec();
        bytes.extend_from_slice(payload);
        bytes
    }

    #[tokio::test]
    async fn reads_a_framed_message() {
        let mut reader = Builder::new().read(&frame(br#"{"type":"getStatus"}"#)).build();

        let message: Option<Value> = read_message(&mut reader).await.unwrap();

        assert_eq!(message, Some(json!({ "type": "getStatus" })));
    }

    #[tokio::test]
    async fn reads_frames_split_across_reads() {
        let bytes = frame(br#"{"id":1}"#);
        let mut reader = Builder::new()
            .read(&bytes[..2])
            .read(&bytes[2..6])
            .read(&bytes[6..])
            .build();

        let message: Option<Value> = read_message(&mut reader).await.unwrap();

        assert_eq!(message, Some(json!({ "id": 1 })));
    }

    #[tokio::test]
    async fn clean_eof_returns_none() {
        let mut reader = Builder::new().build();

        let message: Option<Value> = read_message(&mut reader).await.unwrap();

        assert!(message.is_none());
    }

    #[tokio::test]
    async fn eof_inside_prefix_is_an_error() {
        let mut reader = Builder::new().read(&[1, 0]).build();

        let err = read_frame(&mut reader).await.unwrap_err();

        assert!(matches!(err, MessageError::Io(ref e) if e.kind() == std::io::ErrorKind::UnexpectedEof));
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let size = (MAX_MESSAGE_SIZE as u32 + 1).to_ne_bytes();
        let mut reader = Builder::new().read(&size).build();

        let err = read_frame(&mut reader).await.unwrap_err();

        assert!(matches!(err, MessageError::TooLarge { size } if size == MAX_MESSAGE_SIZE + 1));
    }

    #[tokio::test]
    async fn invalid_json_is_reported() {
        let mut reader = Builder::new().read(&frame(b"not json")).build();

        let result: Result<Option<Value>, _> = read_message(&mut reader).await;

        assert!(matches!(result, Err(MessageError::Json(_))));
    }

    #[tokio::test]
    async fn writes_length_prefixed_json() {
        let expected = frame(br#"{"ok":true}"#);
        let mut writer = Builder::new().write(&expected).build();

        write_message(&mut writer, &json!({ "ok": true })).await.unwrap();
    }

    #[tokio::test]
    async fn refuses_to_write_oversized_messages() {
        let mut sink = Vec::new();
        let huge = "x".repeat(MAX_MESSAGE_SIZE);

        let err = write_message(&mut sink, &huge).await.unwrap_err();

        assert!(matches!(err, MessageError::TooLarge { .. }));
        assert!(sink.is_empty());
    }
}
