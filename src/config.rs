//! Collector configuration.
//!
//! Read as JSON from a file given on the command line, or from the
//! `COLLECTOR_DOWNSTREAM_CONFIG` environment variable. Every field has a
//! default, so running with no configuration at all is valid.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;

use crate::session::SessionConfig;

/// Environment variable holding the JSON configuration.
pub const CONFIG_ENV_VAR: &str = "COLLECTOR_DOWNSTREAM_CONFIG";

/// Top-level configuration for the collector's downstream service.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Address agents connect to.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Session timing (optional).
    #[serde(default)]
    pub session: Option<SessionConfigJson>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            session: None,
        }
    }
}

/// Session timing configuration (as read from JSON).
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfigJson {
    /// Seconds a call waits for the agent's answer.
    #[serde(default = "default_call_timeout")]
    pub call_timeout_seconds: u64,

    /// Seconds after which an unanswered call's slot is evicted.
    #[serde(default = "default_pending_retention")]
    pub pending_retention_seconds: u64,

    /// Seconds a new connection may take to send its Hello.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_seconds: u64,

    /// Seconds between reaper sweeps.
    #[serde(default = "default_reaper_interval")]
    pub reaper_interval_seconds: u64,
}

impl SessionConfigJson {
    /// Every duration must be non-zero.
    fn validate(&self) -> Result<()> {
        let durations = [
            ("call_timeout_seconds", self.call_timeout_seconds),
            ("pending_retention_seconds", self.pending_retention_seconds),
            ("handshake_timeout_seconds", self.handshake_timeout_seconds),
            ("reaper_interval_seconds", self.reaper_interval_seconds),
        ];
        for (name, seconds) in durations {
            anyhow::ensure!(seconds > 0, "session.{name} must be greater than zero");
        }
        Ok(())
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0:8181".into()
}

impl Config {
    /// Load configuration from `COLLECTOR_DOWNSTREAM_CONFIG`, or defaults if unset.
    pub fn from_env() -> Result<Self> {
        match std::env::var(CONFIG_ENV_VAR) {
            Ok(json) => Self::from_json(&json)
                .with_context(|| format!("Failed to parse {CONFIG_ENV_VAR}")),
            Err(_) => {
                debug!("{CONFIG_ENV_VAR} not set, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_json(&json)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Create a config from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse JSON")?;
        if let Some(session) = &config.session {
            session.validate()?;
        }
        Ok(config)
    }

    /// Session timing: the `session` section if present, else environment
    /// overrides on top of the defaults.
    pub fn session_config(&self) -> SessionConfig {
        self.session
            .as_ref()
            .map_or_else(SessionConfig::from_env, SessionConfig::from_json)
    }
}

const fn default_call_timeout() -> u64 {
    3600
}

const fn default_pending_retention() -> u64 {
    3600
}

const fn default_handshake_timeout() -> u64 {
    30
}

const fn default_reaper_interval() -> u64 {
    60
}
