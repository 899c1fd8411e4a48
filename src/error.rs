//! Errors surfaced to callers of the command surface.

use std::time::Duration;

use crate::transport::protocol::RequestId;

/// Failure of a downstream command.
///
/// Variants are kept distinct so that calling layers can tell an agent that
/// is simply not connected apart from one that is too old or one that tried
/// and failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DownstreamError {
    /// No session is registered for the agent. Nothing was sent.
    #[error("agent '{agent_id}' is not connected")]
    AgentNotConnected { agent_id: String },

    /// No response arrived in time. The agent may or may not have executed
    /// the command.
    #[error("agent '{agent_id}' did not answer {command} request {request_id} within {timeout:?}")]
    Timeout {
        agent_id: String,
        command: &'static str,
        request_id: RequestId,
        timeout: Duration,
    },

    /// The agent does not recognize the command and must be upgraded.
    #[error("agent '{agent_id}' does not support {command} (agent is older than the collector)")]
    StaleAgent {
        agent_id: String,
        command: &'static str,
    },

    /// The agent attempted the command and failed.
    #[error("agent '{agent_id}' failed to execute {command}{}", fmt_message(.message))]
    AgentSideFailure {
        agent_id: String,
        command: &'static str,
        message: Option<String>,
    },

    /// The session was torn down while the call was in flight.
    #[error("agent '{agent_id}' disconnected before answering {command} request {request_id}")]
    Disconnected {
        agent_id: String,
        command: &'static str,
        request_id: RequestId,
    },

    /// The agent reported that the requested directory is missing.
    #[error("directory '{directory}' does not exist on agent '{agent_id}'")]
    DirectoryDoesNotExist { agent_id: String, directory: String },

    /// The agent answered the request, but its answer could not be decoded.
    #[error("agent '{agent_id}' sent an undecodable answer to {command} request {request_id}: {reason}")]
    MalformedResponse {
        agent_id: String,
        command: &'static str,
        request_id: RequestId,
        reason: String,
    },

    /// The agent answered with a result the command cannot use.
    #[error("agent '{agent_id}' answered {command} with an unexpected {actual} result")]
    UnexpectedResponse {
        agent_id: String,
        command: &'static str,
        actual: &'static str,
    },
}

fn fmt_message(message: &Option<String>) -> String {
    message
        .as_deref()
        .map(|m| format!(": {m}"))
        .unwrap_or_default()
}

impl DownstreamError {
    /// Agent the failed call was addressed to.
    pub fn agent_id(&self) -> &str {
        match self {
            Self::AgentNotConnected { agent_id }
            | Self::Timeout { agent_id, .. }
            | Self::StaleAgent { agent_id, .. }
            | Self::AgentSideFailure { agent_id, .. }
            | Self::Disconnected { agent_id, .. }
            | Self::DirectoryDoesNotExist { agent_id, .. }
            | Self::MalformedResponse { agent_id, .. }
            | Self::UnexpectedResponse { agent_id, .. } => agent_id,
        }
    }

    /// Whether retrying later against the same agent can reasonably succeed.
    ///
    /// Retrying is always the caller's decision; this layer never retries.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::AgentNotConnected { .. }
                | Self::Timeout { .. }
                | Self::AgentSideFailure { .. }
                | Self::Disconnected { .. }
        )
    }

    /// Whether the command may have executed on the agent despite the error.
    pub const fn is_unknown_outcome(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Disconnected { .. })
    }
}
