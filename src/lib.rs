//! collector-downstream library
//!
//! This crate provides the collector side of the agent command channel:
//! - Registry of agent sessions, one per agent-initiated stream
//! - Request/response correlation over each agent's single stream
//! - Typed command surface (thread dumps, heap dumps, MBeans, traces, ...)
//! - Configuration, framing and the TCP listener agents dial into

pub mod config;
pub mod error;
pub mod service;
pub mod session;
pub mod transport;

pub use error::DownstreamError;
pub use service::CommandService;
pub use session::{AgentSession, AgentSessionRegistry};
