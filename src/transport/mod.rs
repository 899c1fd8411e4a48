//! Transport layer for collector ↔ agent communication.
//!
//! Agents dial in and hold one stream open; everything the collector sends
//! them is multiplexed over it. This module provides the length-prefixed
//! framing; `connection` drives a single stream and `listener` accepts them.

pub mod connection;
pub mod listener;
pub mod payload;
pub mod protocol;

pub use connection::serve_connection;
pub use listener::AgentListener;
pub use protocol::{AgentMessage, ClientResponse, ClientResult, CollectorMessage, Command};

use anyhow::{Context, Result};

/// Maximum message size (64 MB). Safety valve against malformed messages.
const MAX_MESSAGE_SIZE: u32 = 64 * 1024 * 1024;

/// Write a length-prefixed message to a writer.
///
/// Format: [4-byte big-endian length][payload bytes]
pub async fn send_message<W: tokio::io::AsyncWriteExt + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> Result<()> {
    let len = u32::try_from(payload.len())
        .map_err(|_| anyhow::anyhow!("Message too large: {} bytes", payload.len()))?;
    anyhow::ensure!(
        len <= MAX_MESSAGE_SIZE,
        "Message exceeds max size: {len} > {MAX_MESSAGE_SIZE}"
    );

    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a length-prefixed message from a reader.
///
/// Returns `None` when the peer closed the stream cleanly on a frame
/// boundary. Enforces `MAX_MESSAGE_SIZE`.
pub async fn recv_message<R: tokio::io::AsyncReadExt + Unpin>(
    reader: &mut R,
) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e).context("Failed to read message length"),
    }
    let len = u32::from_be_bytes(len_buf);

    anyhow::ensure!(
        len <= MAX_MESSAGE_SIZE,
        "Message exceeds max size: {len} > {MAX_MESSAGE_SIZE}"
    );

    let mut buf = vec![0u8; len as usize];
    reader
        .read_exact(&mut buf)
        .await
        .context("Failed to read message payload")?;
    Ok(Some(buf))
}

/// Serialize a message as JSON and write it as one frame.
pub async fn send_json<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: tokio::io::AsyncWriteExt + Unpin,
    T: serde::Serialize,
{
    let bytes = serde_json::to_vec(message).context("Failed to serialize message")?;
    send_message(writer, &bytes).await
}
