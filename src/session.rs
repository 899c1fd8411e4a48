//! Agent sessions: one per agent-initiated stream.
//!
//! A session owns the outbound half of the stream and the table of calls
//! waiting for an answer. Callers on any task issue commands through
//! [`AgentSession::call`]; the connection's receive loop hands responses back
//! through [`AgentSession::handle_message`], in whatever order they arrive.

mod pending;
mod registry;

pub use pending::{Delivery, PendingCallTable, Reply};
pub use registry::{AgentSessionRegistry, AgentSummary};

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::DownstreamError;
use crate::transport::protocol::{
    AgentMessage, ClientResponse, ClientResult, CollectorMessage, Command, RequestId,
    ServerRequest,
};

/// Parsed session configuration with `Duration` fields.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long a call waits for the agent's answer.
    ///
    /// Sized to outlast any legitimate agent operation (heap dumps of large
    /// heaps included), not to bound user-facing latency.
    pub call_timeout: Duration,

    /// Age after which the reaper evicts an unanswered slot.
    pub pending_retention: Duration,

    /// How long a new connection may take to send its Hello.
    pub handshake_timeout: Duration,

    /// Interval between reaper sweeps.
    pub reaper_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(3600),
            pending_retention: Duration::from_secs(3600),
            handshake_timeout: Duration::from_secs(30),
            reaper_interval: Duration::from_secs(60),
        }
    }
}

impl SessionConfig {
    /// Create from the JSON configuration values.
    pub const fn from_json(json: &crate::config::SessionConfigJson) -> Self {
        Self {
            call_timeout: Duration::from_secs(json.call_timeout_seconds),
            pending_retention: Duration::from_secs(json.pending_retention_seconds),
            handshake_timeout: Duration::from_secs(json.handshake_timeout_seconds),
            reaper_interval: Duration::from_secs(json.reaper_interval_seconds),
        }
    }

    /// Create from environment variables, falling back to defaults.
    ///
    /// Reads `DOWNSTREAM_CALL_TIMEOUT` and `DOWNSTREAM_PENDING_RETENTION` (in seconds).
    /// Unparseable or zero values fall back to the default.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            call_timeout: env_seconds("DOWNSTREAM_CALL_TIMEOUT").unwrap_or(defaults.call_timeout),
            pending_retention: env_seconds("DOWNSTREAM_PENDING_RETENTION")
                .unwrap_or(defaults.pending_retention),
            ..defaults
        }
    }
}

fn env_seconds(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|&secs| secs > 0)
        .map(Duration::from_secs)
}

/// Lifecycle of a session. No transition leaves `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Stream open, not yet registered.
    Connecting,
    /// Registered and accepting calls.
    Active,
    /// Terminal: stream ended, superseded or shut down.
    Closed,
}

/// Why a session was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The agent closed the stream cleanly.
    StreamClosed,
    /// Reading from or writing to the stream failed.
    StreamError,
    /// A newer session registered under the same agent id.
    Superseded,
    /// The collector is shutting down.
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::StreamClosed => "stream closed",
            Self::StreamError => "stream error",
            Self::Superseded => "superseded",
            Self::Shutdown => "shutdown",
        };
        f.write_str(reason)
    }
}

/// Collector-side view of one connected agent.
pub struct AgentSession {
    agent_id: String,
    agent_version: String,
    connected_at: SystemTime,
    next_request_id: AtomicU64,
    pending: PendingCallTable,
    outbound: mpsc::Sender<CollectorMessage>,
    state: watch::Sender<SessionState>,
    call_timeout: Duration,
}

impl AgentSession {
    /// Create a session in the `Connecting` state.
    ///
    /// Messages queued on `outbound` are written to the agent's stream by the
    /// connection's writer task, one at a time.
    pub fn new(
        agent_id: impl Into<String>,
        agent_version: impl Into<String>,
        outbound: mpsc::Sender<CollectorMessage>,
        config: &SessionConfig,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Connecting);
        Self {
            agent_id: agent_id.into(),
            agent_version: agent_version.into(),
            connected_at: SystemTime::now(),
            next_request_id: AtomicU64::new(0),
            pending: PendingCallTable::new(config.pending_retention),
            outbound,
            state,
            call_timeout: config.call_timeout,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn agent_version(&self) -> &str {
        &self.agent_version
    }

    pub const fn connected_at(&self) -> SystemTime {
        self.connected_at
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    pub const fn pending(&self) -> &PendingCallTable {
        &self.pending
    }

    /// Move from `Connecting` to `Active`. Returns false in any other state.
    pub(crate) fn activate(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == SessionState::Connecting {
                *state = SessionState::Active;
                true
            } else {
                false
            }
        })
    }

    /// Close the session and fail every call still waiting on it.
    ///
    /// Returns false if the session was already closed.
    pub async fn close(&self, reason: CloseReason) -> bool {
        let was_open = self.state.send_if_modified(|state| {
            if *state == SessionState::Closed {
                false
            } else {
                *state = SessionState::Closed;
                true
            }
        });
        if !was_open {
            return false;
        }

        let cut_off = self.pending.close().await;
        info!(
            agent_id = %self.agent_id,
            reason = %reason,
            pending_calls = cut_off,
            "Agent session closed"
        );
        true
    }

    /// Resolves once the session is closed.
    pub async fn closed(&self) {
        let mut state = self.state.subscribe();
        let _ = state.wait_for(|s| *s == SessionState::Closed).await;
    }

    /// Send `command` to the agent and wait for its result.
    ///
    /// `UnknownRequest` and `Exception` answers are turned into errors; any
    /// other result is returned for the caller to unwrap.
    pub async fn call(&self, command: Command) -> Result<ClientResult, DownstreamError> {
        let kind = command.kind();
        if !self.is_active() {
            return Err(self.not_connected());
        }

        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let Some(rx) = self.pending.register(request_id).await else {
            return Err(self.not_connected());
        };

        debug!(agent_id = %self.agent_id, request_id, command = kind, "Sending request");
        let request = CollectorMessage::Request(ServerRequest {
            request_id,
            command,
        });
        let exchange = async {
            if self.outbound.send(request).await.is_err() {
                return Err(());
            }
            rx.await.map_err(|_| ())
        };

        let response = match tokio::time::timeout(self.call_timeout, exchange).await {
            Ok(Ok(Reply::Response(response))) => response,
            Ok(Ok(Reply::Malformed(reason))) => {
                return Err(DownstreamError::MalformedResponse {
                    agent_id: self.agent_id.clone(),
                    command: kind,
                    request_id,
                    reason,
                });
            }
            Ok(Err(())) => {
                self.pending.remove(request_id).await;
                if self.pending.is_closed().await || self.outbound.is_closed() {
                    return Err(DownstreamError::Disconnected {
                        agent_id: self.agent_id.clone(),
                        command: kind,
                        request_id,
                    });
                }
                // Evicted by the reaper before the call's own timeout fired.
                return Err(self.timed_out(kind, request_id));
            }
            Err(_) => {
                self.pending.remove(request_id).await;
                warn!(agent_id = %self.agent_id, request_id, command = kind, "Request timed out");
                return Err(self.timed_out(kind, request_id));
            }
        };

        debug!(agent_id = %self.agent_id, request_id, result = response.result.kind(), "Received response");
        match response.result {
            ClientResult::UnknownRequest => {
                warn!(agent_id = %self.agent_id, command = kind, "Agent does not support command");
                Err(DownstreamError::StaleAgent {
                    agent_id: self.agent_id.clone(),
                    command: kind,
                })
            }
            ClientResult::Exception { message } => {
                warn!(
                    agent_id = %self.agent_id,
                    command = kind,
                    message = message.as_deref().unwrap_or_default(),
                    "Agent failed to execute command"
                );
                Err(DownstreamError::AgentSideFailure {
                    agent_id: self.agent_id.clone(),
                    command: kind,
                    message,
                })
            }
            result => Ok(result),
        }
    }

    /// Route a message read from this session's stream.
    ///
    /// Never fails: anything that cannot be matched to a waiting call is
    /// logged and dropped.
    pub async fn handle_message(&self, message: AgentMessage) {
        match message {
            AgentMessage::Hello { agent_id, .. } => {
                warn!(
                    agent_id = %self.agent_id,
                    hello_agent_id = %agent_id,
                    "Hello received on an established session; dropped"
                );
            }
            AgentMessage::Response(response) => {
                self.deliver(response).await;
            }
        }
    }

    /// Hand a response to the call waiting on its request id.
    pub async fn deliver(&self, response: ClientResponse) -> Delivery {
        let request_id = response.request_id;
        let delivery = self.pending.complete(response).await;
        match delivery {
            Delivery::Delivered => {}
            Delivery::NoSlot => warn!(
                agent_id = %self.agent_id,
                request_id,
                "Response does not match a pending call (expired or duplicate); dropped"
            ),
            Delivery::Abandoned => debug!(
                agent_id = %self.agent_id,
                request_id,
                "Caller stopped waiting before the response arrived"
            ),
        }
        delivery
    }

    /// Fail the call waiting on `request_id`: the agent answered it, but the
    /// answer could not be decoded.
    pub async fn reject(&self, request_id: RequestId, reason: String) -> Delivery {
        warn!(
            agent_id = %self.agent_id,
            request_id,
            reason = %reason,
            "Undecodable response from agent"
        );
        let delivery = self.pending.reject(request_id, reason).await;
        if delivery == Delivery::NoSlot {
            warn!(
                agent_id = %self.agent_id,
                request_id,
                "Undecodable response does not match a pending call; dropped"
            );
        }
        delivery
    }

    fn not_connected(&self) -> DownstreamError {
        DownstreamError::AgentNotConnected {
            agent_id: self.agent_id.clone(),
        }
    }

    fn timed_out(&self, command: &'static str, request_id: RequestId) -> DownstreamError {
        DownstreamError::Timeout {
            agent_id: self.agent_id.clone(),
            command,
            request_id,
            timeout: self.call_timeout,
        }
    }
}
