//! Drives one agent-initiated stream for its whole lifetime.
//!
//! The agent's first message must be `Hello`. After it, the stream is split:
//! a writer task drains the session's outbound queue (the only code that
//! writes to the stream) while the receive loop routes each response to the
//! call waiting on it. Either side failing closes the session, and the
//! connection deregisters itself on the way out.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncWrite, BufReader, BufWriter};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::protocol::{response_request_id, AgentMessage, CollectorMessage};
use super::{recv_message, send_json};
use crate::session::{AgentSession, AgentSessionRegistry, CloseReason, SessionConfig};

/// Capacity of each session's outbound queue.
pub const OUTBOUND_BUFFER_SIZE: usize = 64;

/// Serve an agent connection until the stream ends or the session is closed.
///
/// Returns the agent id announced in the handshake.
pub async fn serve_connection<S>(
    stream: S,
    registry: Arc<AgentSessionRegistry>,
    config: &SessionConfig,
) -> Result<String>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);
    let mut writer = BufWriter::new(write_half);

    let (agent_id, agent_version) =
        tokio::time::timeout(config.handshake_timeout, read_hello(&mut reader))
            .await
            .map_err(|_| {
                anyhow::anyhow!("Agent did not send Hello within {:?}", config.handshake_timeout)
            })??;

    info!(agent_id = %agent_id, agent_version = %agent_version, "Agent connected");

    let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER_SIZE);
    let session = Arc::new(AgentSession::new(
        agent_id.clone(),
        agent_version,
        tx,
        config,
    ));
    registry.register(Arc::clone(&session)).await;

    // Written before the writer task starts: requests issued meanwhile wait
    // in the queue, so the ack is always the first frame the agent reads.
    let ack = CollectorMessage::HelloAck {
        collector_version: env!("CARGO_PKG_VERSION").to_string(),
    };
    if let Err(e) = send_json(&mut writer, &ack).await {
        registry.remove(&agent_id, &session).await;
        session.close(CloseReason::StreamError).await;
        return Err(e).with_context(|| format!("Failed to acknowledge agent '{agent_id}'"));
    }
    let writer_task = tokio::spawn(run_writer(writer, rx, Arc::clone(&session)));

    let reason = receive_loop(&mut reader, &session).await;

    registry.remove(&agent_id, &session).await;
    if let Some(reason) = reason {
        session.close(reason).await;
    }
    if let Err(e) = writer_task.await {
        warn!(agent_id = %agent_id, error = %e, "Writer task failed");
    }

    Ok(agent_id)
}

/// Wait for the agent's Hello, dropping anything that arrives before it.
async fn read_hello<R>(reader: &mut R) -> Result<(String, String)>
where
    R: AsyncRead + Unpin,
{
    loop {
        let Some(bytes) = recv_message(reader).await? else {
            anyhow::bail!("Stream closed before Hello");
        };

        match serde_json::from_slice::<AgentMessage>(&bytes) {
            Ok(AgentMessage::Hello {
                agent_id,
                agent_version,
            }) => {
                anyhow::ensure!(!agent_id.is_empty(), "Agent id cannot be empty");
                return Ok((agent_id, agent_version));
            }
            Ok(AgentMessage::Response(response)) => warn!(
                request_id = response.request_id,
                "Response received before Hello; dropped"
            ),
            Err(e) => warn!(error = %e, "Undecodable message before Hello; dropped"),
        }
    }
}

/// Route inbound messages until the stream ends.
///
/// Returns why the stream ended, or `None` if the session was closed from
/// elsewhere (superseded, shutdown, writer failure).
async fn receive_loop<R>(reader: &mut R, session: &AgentSession) -> Option<CloseReason>
where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = tokio::select! {
            frame = recv_message(reader) => frame,
            () = session.closed() => return None,
        };

        match frame {
            Ok(Some(bytes)) => route_frame(session, &bytes).await,
            Ok(None) => return Some(CloseReason::StreamClosed),
            Err(e) => {
                warn!(agent_id = %session.agent_id(), error = %e, "Failed to read from agent");
                return Some(CloseReason::StreamError);
            }
        }
    }
}

async fn route_frame(session: &AgentSession, bytes: &[u8]) {
    match serde_json::from_slice::<AgentMessage>(bytes) {
        Ok(message) => session.handle_message(message).await,
        Err(e) => match response_request_id(bytes) {
            Some(request_id) => {
                session.reject(request_id, e.to_string()).await;
            }
            None => warn!(
                agent_id = %session.agent_id(),
                error = %e,
                "Undecodable message from agent; dropped"
            ),
        },
    }
}

async fn run_writer<W>(
    mut writer: W,
    mut rx: mpsc::Receiver<CollectorMessage>,
    session: Arc<AgentSession>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let message = tokio::select! {
            message = rx.recv() => match message {
                Some(message) => message,
                None => break,
            },
            () = session.closed() => break,
        };

        if let Err(e) = send_json(&mut writer, &message).await {
            warn!(agent_id = %session.agent_id(), error = %e, "Failed to write to agent");
            session.close(CloseReason::StreamError).await;
            break;
        }
    }
    debug!(agent_id = %session.agent_id(), "Writer task ended");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncWriteExt, DuplexStream};

    use super::*;
    use crate::transport::protocol::{ClientResponse, ClientResult, Command};

    async fn send(stream: &mut DuplexStream, message: &AgentMessage) {
        send_json(stream, message).await.unwrap();
    }

    async fn recv(stream: &mut DuplexStream) -> CollectorMessage {
        let bytes = recv_message(stream).await.unwrap().unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn hello(agent_id: &str) -> AgentMessage {
        AgentMessage::Hello {
            agent_id: agent_id.to_string(),
            agent_version: "0.14.0".to_string(),
        }
    }

    #[tokio::test]
    async fn handshake_registers_and_acknowledges() {
        let registry = Arc::new(AgentSessionRegistry::new());
        let (server, mut agent) = tokio::io::duplex(4096);
        let config = SessionConfig::default();
        let serve_registry = Arc::clone(&registry);
        let conn = tokio::spawn(async move { serve_connection(server, serve_registry, &config).await });

        // Noise before Hello is dropped, not fatal.
        send_message_raw(&mut agent, b"not json").await;
        send(&mut agent, &hello("a1")).await;
        assert!(matches!(recv(&mut agent).await, CollectorMessage::HelloAck { .. }));
        assert!(registry.is_available("a1").await);

        drop(agent);
        assert_eq!(conn.await.unwrap().unwrap(), "a1");
        assert!(!registry.is_available("a1").await);
    }

    #[tokio::test]
    async fn malformed_frame_does_not_end_session() {
        let registry = Arc::new(AgentSessionRegistry::new());
        let (server, mut agent) = tokio::io::duplex(4096);
        let config = SessionConfig::default();
        let serve_registry = Arc::clone(&registry);
        tokio::spawn(async move { serve_connection(server, serve_registry, &config).await });

        send(&mut agent, &hello("a1")).await;
        recv(&mut agent).await;

        let session = registry.lookup("a1").await.unwrap();
        let caller = Arc::clone(&session);
        let call = tokio::spawn(async move { caller.call(Command::Gc).await });

        let request_id = match recv(&mut agent).await {
            CollectorMessage::Request(req) => req.request_id,
            other => panic!("expected request, got {other:?}"),
        };
        send_message_raw(&mut agent, b"{\"type\":\"bogus\"}").await;
        send(
            &mut agent,
            &AgentMessage::Response(ClientResponse {
                request_id,
                result: ClientResult::Gc,
            }),
        )
        .await;

        assert_eq!(call.await.unwrap().unwrap(), ClientResult::Gc);
        assert!(registry.is_available("a1").await);
    }

    #[tokio::test]
    async fn undecodable_answer_fails_its_caller_immediately() {
        let registry = Arc::new(AgentSessionRegistry::new());
        let (server, mut agent) = tokio::io::duplex(4096);
        let config = SessionConfig::default();
        let serve_registry = Arc::clone(&registry);
        tokio::spawn(async move { serve_connection(server, serve_registry, &config).await });

        send(&mut agent, &hello("a1")).await;
        recv(&mut agent).await;

        let session = registry.lookup("a1").await.unwrap();
        let caller = Arc::clone(&session);
        let call = tokio::spawn(async move { caller.call(Command::ThreadDump).await });

        let request_id = match recv(&mut agent).await {
            CollectorMessage::Request(req) => req.request_id,
            other => panic!("expected request, got {other:?}"),
        };
        let frame = format!(
            r#"{{"type":"response","request_id":{request_id},"result":{{"type":"thread_dump","thread_dump":{{}}}}}}"#
        );
        send_message_raw(&mut agent, frame.as_bytes()).await;

        let err = tokio::time::timeout(Duration::from_secs(1), call)
            .await
            .expect("caller must not wait for its timeout")
            .unwrap()
            .unwrap_err();
        assert!(matches!(
            err,
            crate::DownstreamError::MalformedResponse { command: "thread_dump", .. }
        ));
        assert!(!session.pending().contains(request_id).await);
        assert!(registry.is_available("a1").await);
    }

    #[tokio::test]
    async fn empty_agent_id_is_rejected() {
        let registry = Arc::new(AgentSessionRegistry::new());
        let (server, mut agent) = tokio::io::duplex(4096);
        send(&mut agent, &hello("")).await;

        let result = serve_connection(server, Arc::clone(&registry), &SessionConfig::default()).await;
        assert!(result.is_err());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn missing_hello_times_out() {
        let registry = Arc::new(AgentSessionRegistry::new());
        let (server, _agent) = tokio::io::duplex(4096);
        let config = SessionConfig {
            handshake_timeout: Duration::from_millis(50),
            ..SessionConfig::default()
        };

        let err = serve_connection(server, Arc::clone(&registry), &config)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("did not send Hello"));
    }

    async fn send_message_raw(stream: &mut DuplexStream, payload: &[u8]) {
        crate::transport::send_message(stream, payload).await.unwrap();
        stream.flush().await.unwrap();
    }
}
