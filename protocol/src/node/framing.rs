//! Stream framing shared by the node protocols.
//!
//! Two framings are in use: single-object streams, where the writer sends
//! one payload and closes, and newline-delimited JSON, one object per line.

use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::warn;

use crate::config;
use crate::error::ProtocolError;
use crate::network::PeerStream;

/// Reads everything the remote writes until it closes the stream cleanly.
///
/// Returns `None` after a non-clean read error, or when the payload exceeds
/// [`config::MAX_SINGLE_MESSAGE_BYTES`]. Both cases are logged here.
pub async fn read_single_message(stream: &mut PeerStream) -> Option<Vec<u8>> {
    let limit = config::MAX_SINGLE_MESSAGE_BYTES;
    let mut payload = Vec::new();
    let result = (&mut *stream)
        .take(limit as u64 + 1)
        .read_to_end(&mut payload)
        .await;

    match result {
        Ok(_) if payload.len() > limit => {
            warn!(
                peer = %stream.remote_peer(),
                protocol = stream.protocol(),
                limit,
                "single message exceeds size limit"
            );
            None
        }
        Ok(_) => Some(payload),
        Err(e) => {
            warn!(
                peer = %stream.remote_peer(),
                protocol = stream.protocol(),
                error = %e,
                "error reading single message"
            );
            None
        }
    }
}

/// Writes `value` as one JSON line and flushes.
pub async fn write_json_line<W, T>(writer: &mut W, value: &T) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use libp2p::PeerId;

    fn pipe() -> (PeerStream, PeerStream) {
        let (a, b) = tokio::io::duplex(1024);
        let peer = PeerId::random();
        (
            PeerStream::new(peer, "/test/1", a),
            PeerStream::new(peer, "/test/1", b),
        )
    }

    #[tokio::test]
    async fn reads_until_clean_close() {
        let (mut tx, mut rx) = pipe();
        tokio::spawn(async move {
            tx.write_all(b"{\"hello\":").await.unwrap();
            tx.write_all(b"\"world\"}").await.unwrap();
            tx.shutdown().await.unwrap();
        });
        assert_eq!(
            read_single_message(&mut rx).await.as_deref(),
            Some(&b"{\"hello\":\"world\"}"[..])
        );
    }

    #[tokio::test]
    async fn empty_stream_is_an_empty_message() {
        let (mut tx, mut rx) = pipe();
        tx.shutdown().await.unwrap();
        assert_eq!(read_single_message(&mut rx).await, Some(Vec::new()));
    }

    #[tokio::test]
    async fn oversized_message_is_rejected() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let peer = PeerId::random();
        let mut tx = PeerStream::new(peer, "/test/1", a);
        let mut rx = PeerStream::new(peer, "/test/1", b);
        tokio::spawn(async move {
            let chunk = vec![b'x'; 64 * 1024];
            for _ in 0..(config::MAX_SINGLE_MESSAGE_BYTES / chunk.len() + 1) {
                if tx.write_all(&chunk).await.is_err() {
                    break;
                }
            }
            let _ = tx.shutdown().await;
        });
        assert_eq!(read_single_message(&mut rx).await, None);
    }

    #[tokio::test]
    async fn json_lines_are_newline_terminated() {
        let (mut tx, mut rx) = pipe();
        write_json_line(&mut tx, &serde_json::json!({"n": 1}))
            .await
            .unwrap();
        tx.shutdown().await.unwrap();
        let mut buf = String::new();
        rx.read_to_string(&mut buf).await.unwrap();
        assert_eq!(buf, "{\"n\":1}\n");
    }
}
