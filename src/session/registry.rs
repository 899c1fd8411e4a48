//! Registry of connected agents.
//!
//! Thread-safe: the map sits behind an `RwLock` and holds `Arc`s, so lookups
//! from command callers never wait on a session's own I/O.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{AgentSession, CloseReason};

/// Point-in-time description of a connected agent, for operational tooling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSummary {
    pub agent_id: String,
    pub agent_version: String,
    pub connected_at: SystemTime,
    pub in_flight: usize,
}

/// Maps each agent id to its current session. Last registration wins.
#[derive(Default)]
pub struct AgentSessionRegistry {
    sessions: RwLock<HashMap<String, Arc<AgentSession>>>,
}

impl AgentSessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Activate `session` and make it the one served for its agent id.
    ///
    /// A session previously registered under the same id is closed as
    /// superseded and returned. Sessions that are not `Connecting` are left
    /// unregistered.
    pub async fn register(&self, session: Arc<AgentSession>) -> Option<Arc<AgentSession>> {
        let agent_id = session.agent_id().to_string();
        let previous = {
            let mut sessions = self.sessions.write().await;
            // Activated under the write lock so lookups only ever see active sessions.
            if !session.activate() {
                debug!(agent_id = %agent_id, state = ?session.state(), "Session not registrable");
                return None;
            }
            sessions.insert(agent_id.clone(), session)
        };

        match &previous {
            Some(old) => {
                info!(agent_id = %agent_id, "Agent reconnected; superseding previous session");
                old.close(CloseReason::Superseded).await;
            }
            None => info!(agent_id = %agent_id, "Agent registered"),
        }
        previous
    }

    pub async fn lookup(&self, agent_id: &str) -> Option<Arc<AgentSession>> {
        self.sessions.read().await.get(agent_id).cloned()
    }

    /// Remove `session` from the registry, but only if it is still the one
    /// registered for `agent_id`.
    ///
    /// A stale session tearing down after a reconnect therefore cannot evict
    /// its replacement.
    pub async fn remove(&self, agent_id: &str, session: &Arc<AgentSession>) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get(agent_id) {
            Some(current) if Arc::ptr_eq(current, session) => {
                sessions.remove(agent_id);
                info!(agent_id = %agent_id, "Agent deregistered");
                true
            }
            _ => {
                debug!(agent_id = %agent_id, "Session already replaced; nothing to deregister");
                false
            }
        }
    }

    /// Whether commands can currently be sent to `agent_id`.
    pub async fn is_available(&self, agent_id: &str) -> bool {
        self.lookup(agent_id)
            .await
            .is_some_and(|session| session.is_active())
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Summaries of every registered agent, sorted by agent id.
    pub async fn connected_agents(&self) -> Vec<AgentSummary> {
        let sessions = self.snapshot().await;
        let mut summaries = Vec::with_capacity(sessions.len());
        for session in sessions {
            summaries.push(AgentSummary {
                agent_id: session.agent_id().to_string(),
                agent_version: session.agent_version().to_string(),
                connected_at: session.connected_at(),
                in_flight: session.pending().len().await,
            });
        }
        summaries.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        summaries
    }

    /// Evict pending calls older than the retention window in every session.
    pub async fn evict_expired_calls(&self) -> usize {
        let mut evicted = 0;
        for session in self.snapshot().await {
            let count = session.pending().evict_expired().await;
            if count > 0 {
                debug!(agent_id = %session.agent_id(), evicted = count, "Evicted expired pending calls");
            }
            evicted += count;
        }
        evicted
    }

    /// Close and deregister every session (called on collector shutdown).
    pub async fn close_all(&self) {
        let all_sessions: Vec<Arc<AgentSession>> = {
            let mut sessions = self.sessions.write().await;
            sessions.drain().map(|(_, s)| s).collect()
        };

        for session in &all_sessions {
            session.close(CloseReason::Shutdown).await;
        }
        info!(sessions = all_sessions.len(), "Closed all agent sessions");
    }

    /// Start the background reaper task.
    ///
    /// Returns a `JoinHandle` that runs until aborted. The reaper evicts
    /// expired pending calls every `interval`.
    pub fn start_reaper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // First tick is immediate, skip it
            loop {
                ticker.tick().await;
                let evicted = registry.evict_expired_calls().await;
                debug!(evicted, "Reaper sweep");
            }
        })
    }

    async fn snapshot(&self) -> Vec<Arc<AgentSession>> {
        self.sessions.read().await.values().cloned().collect()
    }
}
