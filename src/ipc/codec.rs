//! Frame codec for the worker wire protocol.
//!
//! Frame format:
//! ```text
//! ┌──────────┬──────────┬────────────────────────┐
//! │ len (4B) │ type(1B) │   msgpack payload      │
//! │ u32 BE   │ u8       │                        │
//! └──────────┴──────────┴────────────────────────┘
//! ```
//! Length = sizeof(type byte) + sizeof(payload), NOT including the 4-byte prefix.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::envelope::Envelope;
use crate::types::{Error, ProcessId, Result};

/// Frame type: worker announces its process id; the host echoes it on accept.
pub const FRAME_HELLO: u8 = 0x01;
/// Frame type: a single envelope.
pub const FRAME_ENVELOPE: u8 = 0x02;
/// Frame type: an ordered array of envelopes.
pub const FRAME_BATCH: u8 = 0x03;
/// Frame type: connection-level error.
pub const FRAME_ERROR: u8 = 0xFF;

/// Payload of a `HELLO` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
    pub process_id: ProcessId,
}

/// Payload of an `ERROR` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub code: String,
    pub message: String,
}

impl From<&Error> for WireError {
    fn from(e: &Error) -> Self {
        Self {
            code: e.to_ipc_error_code().to_string(),
            message: e.to_string(),
        }
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Hello(Hello),
    Envelope(Box<Envelope>),
    Batch(Vec<Envelope>),
    Error(WireError),
}

impl Frame {
    pub fn frame_type(&self) -> u8 {
        match self {
            Frame::Hello(_) => FRAME_HELLO,
            Frame::Envelope(_) => FRAME_ENVELOPE,
            Frame::Batch(_) => FRAME_BATCH,
            Frame::Error(_) => FRAME_ERROR,
        }
    }

    /// Msgpack payload of the frame (type byte not included).
    pub fn encode_payload(&self) -> Result<Vec<u8>> {
        let payload = match self {
            Frame::Hello(hello) => rmp_serde::to_vec_named(hello)?,
            Frame::Envelope(envelope) => rmp_serde::to_vec_named(envelope.as_ref())?,
            Frame::Batch(envelopes) => rmp_serde::to_vec_named(envelopes)?,
            Frame::Error(error) => rmp_serde::to_vec_named(error)?,
        };
        Ok(payload)
    }

    pub fn decode(frame_type: u8, payload: &[u8]) -> Result<Self> {
        let frame = match frame_type {
            FRAME_HELLO => Frame::Hello(rmp_serde::from_slice(payload)?),
            FRAME_ENVELOPE => Frame::Envelope(Box::new(rmp_serde::from_slice(payload)?)),
            FRAME_BATCH => Frame::Batch(rmp_serde::from_slice(payload)?),
            FRAME_ERROR => Frame::Error(rmp_serde::from_slice(payload)?),
            other => {
                return Err(Error::malformed(format!(
                    "unexpected frame type: 0x{:02X}",
                    other
                )))
            }
        };
        Ok(frame)
    }
}

/// Read one raw frame from the stream.
///
/// Returns `(frame_type, payload_bytes)`. Returns `None` on clean EOF.
/// `max_frame_bytes` caps the maximum accepted payload size.
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    max_frame_bytes: u32,
) -> std::io::Result<Option<(u8, Vec<u8>)>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let frame_len = u32::from_be_bytes(len_buf);
    if frame_len > max_frame_bytes.saturating_add(1) {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame too large: {} bytes", frame_len),
        ));
    }
    if frame_len < 1 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "frame too short: missing type byte",
        ));
    }

    let mut frame_data = vec![0u8; frame_len as usize];
    reader.read_exact(&mut frame_data).await?;

    let payload = frame_data.split_off(1);
    Ok(Some((frame_data[0], payload)))
}

/// Write one raw frame to the stream.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    frame_type: u8,
    payload: &[u8],
) -> std::io::Result<()> {
    let frame_len = u32::try_from(payload.len() + 1).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "frame exceeds u32 length")
    })?;
    writer.write_all(&frame_len.to_be_bytes()).await?;
    writer.write_all(&[frame_type]).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read and decode one frame. `None` on clean EOF.
pub async fn read<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    max_frame_bytes: u32,
) -> Result<Option<Frame>> {
    match read_frame(reader, max_frame_bytes).await? {
        Some((frame_type, payload)) => Frame::decode(frame_type, &payload).map(Some),
        None => Ok(None),
    }
}

/// Encode and write one frame.
pub async fn write<W: AsyncWriteExt + Unpin>(writer: &mut W, frame: &Frame) -> Result<()> {
    let payload = frame.encode_payload()?;
    write_frame(writer, frame.frame_type(), &payload).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::MessageKind;
    use crate::types::RequestId;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::io::Cursor;

    #[tokio::test]
    async fn test_raw_frame_layout() {
        let mut buf = Vec::new();
        write_frame(&mut buf, FRAME_ENVELOPE, b"abc").await.unwrap();
        assert_eq!(buf, vec![0, 0, 0, 4, FRAME_ENVELOPE, b'a', b'b', b'c']);

        let mut cursor = Cursor::new(buf);
        let (frame_type, payload) = read_frame(&mut cursor, 1024).await.unwrap().unwrap();
        assert_eq!(frame_type, FRAME_ENVELOPE);
        assert_eq!(payload, b"abc");
        assert!(read_frame(&mut cursor, 1024).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let mut buf = Vec::new();
        write_frame(&mut buf, FRAME_ENVELOPE, &[0u8; 64]).await.unwrap();
        let err = read_frame(&mut Cursor::new(buf), 16).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_empty_frame_is_rejected() {
        let err = read_frame(&mut Cursor::new(vec![0, 0, 0, 0]), 16)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_request_envelope_survives_the_wire() {
        let mut envelope = Envelope::request(
            ProcessId::new(4),
            ProcessId::HOST,
            "host.analyze",
            json!({ "kind": "classify", "input": { "text": "great product!" } }),
        );
        envelope.request_id = Some(RequestId::new(12));

        let mut buf = Vec::new();
        write(&mut buf, &Frame::Envelope(Box::new(envelope.clone())))
            .await
            .unwrap();
        let decoded = read(&mut Cursor::new(buf), 1 << 20).await.unwrap().unwrap();

        match decoded {
            Frame::Envelope(got) => {
                assert_eq!(got.kind, MessageKind::Request);
                assert_eq!(*got, envelope);
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_topic_batch_and_hello() {
        let batch = vec![
            Envelope::event(ProcessId::HOST, "session.crashed", json!({ "pid": 3 })),
            Envelope::notify(ProcessId::HOST, ProcessId::new(3), "render.frame", json!(null)),
        ];
        let mut buf = Vec::new();
        write(&mut buf, &Frame::Hello(Hello { process_id: ProcessId::new(3) }))
            .await
            .unwrap();
        write(&mut buf, &Frame::Batch(batch.clone())).await.unwrap();

        let mut cursor = Cursor::new(buf);
        assert_eq!(
            read(&mut cursor, 1 << 20).await.unwrap(),
            Some(Frame::Hello(Hello { process_id: ProcessId::new(3) }))
        );
        assert_eq!(read(&mut cursor, 1 << 20).await.unwrap(), Some(Frame::Batch(batch)));
    }

    #[test]
    fn test_unknown_frame_type() {
        let err = Frame::decode(0x42, &[]).unwrap_err();
        assert!(matches!(err, Error::MalformedMessage(_)));
    }

    #[test]
    fn test_wire_error_from_error() {
        let wire = WireError::from(&Error::RateLimited("too fast".to_string()));
        assert_eq!(wire.code, "RATE_LIMITED");
    }
}
