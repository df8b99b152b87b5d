//! Message framing for the plugin RPC transport.
//!
//! Wire format: [4-byte length (big-endian)][JSON-encoded frame]. The
//! length prefix keeps frame boundaries explicit on the stream transport;
//! JSON keeps the payload schema-less so plugins built against other host
//! versions can still exchange configuration bundles.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::CoreError;
use crate::plugin::protocol::Frame;

/// Maximum frame size (10MB) to prevent memory exhaustion.
const MAX_FRAME_SIZE: u32 = 10 * 1024 * 1024;

/// Send one frame with length-prefix framing and flush it.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), CoreError> {
    let buf = serde_json::to_vec(frame)
        .map_err(|e| CoreError::comm(format!("failed to encode frame: {e}")))?;

    if buf.len() > MAX_FRAME_SIZE as usize {
        return Err(CoreError::comm(format!(
            "frame too large: {} bytes (max {MAX_FRAME_SIZE})",
            buf.len()
        )));
    }

    let len = buf.len() as u32;
    writer
        .write_all(&len.to_be_bytes())
        .await
        .map_err(|e| CoreError::comm(format!("failed to write frame length: {e}")))?;
    writer
        .write_all(&buf)
        .await
        .map_err(|e| CoreError::comm(format!("failed to write frame body: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| CoreError::comm(format!("failed to flush frame: {e}")))?;

    Ok(())
}

/// Read one length-prefixed frame. `Ok(None)` means the peer closed the
/// stream at a frame boundary.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Frame>, CoreError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(CoreError::comm(format!("failed to read frame length: {e}"))),
    }

    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_SIZE {
        return Err(CoreError::comm(format!(
            "frame too large: {len} bytes (max {MAX_FRAME_SIZE})"
        )));
    }

    let mut buf = vec![0u8; len as usize];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|e| CoreError::comm(format!("failed to read frame body: {e}")))?;

    let frame: Frame = serde_json::from_slice(&buf)
        .map_err(|e| CoreError::comm(format!("failed to decode frame: {e}")))?;
    Ok(Some(frame))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::protocol::Payload;

    #[tokio::test]
    async fn send_receive_round_trip() {
        let original = Frame {
            id: 42,
            payload: Payload::Reply {
                result: serde_json::json!({"ok": true}),
            },
        };

        let mut buf = Vec::new();
        write_frame(&mut buf, &original).await.unwrap();

        let decoded = read_frame(&mut &buf[..]).await.unwrap().unwrap();
        assert_eq!(decoded.id, 42);
        match decoded.payload {
            Payload::Reply { result } => assert_eq!(result["ok"], true),
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn clean_eof_is_none() {
        let buf: Vec<u8> = Vec::new();
        assert!(read_frame(&mut &buf[..]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn partial_length_prefix_reads_as_closed_peer() {
        let buf = [0x00, 0x00];
        assert!(read_frame(&mut &buf[..]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn truncated_body_is_an_error() {
        let mut buf = vec![0x00, 0x00, 0x00, 0x64]; // length = 100
        buf.extend_from_slice(&[0u8; 10]);
        let err = read_frame(&mut &buf[..]).await.unwrap_err();
        assert!(err.to_string().contains("frame body"));
    }

    #[tokio::test]
    async fn oversized_length_is_rejected() {
        let len = (MAX_FRAME_SIZE + 1).to_be_bytes();
        let err = read_frame(&mut &len[..]).await.unwrap_err();
        assert!(err.to_string().contains("too large"));
    }

    #[tokio::test]
    async fn garbage_body_is_a_decode_error() {
        let mut buf = vec![0x00, 0x00, 0x00, 0x0A];
        buf.extend_from_slice(&[0xFF; 10]);
        let err = read_frame(&mut &buf[..]).await.unwrap_err();
        assert!(err.to_string().contains("decode"));
    }
}
