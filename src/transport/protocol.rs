//! Downstream protocol message types.
//!
//! Length-prefixed JSON protocol multiplexed over the single stream each
//! agent opens to the collector. Messages are framed as:
//! [4-byte BE length][JSON payload]

use serde::{Deserialize, Serialize};

use super::payload::{
    Capabilities, FullTrace, GlobalMeta, HeapDumpFileInfo, MBeanDump, MBeanDumpKind, MBeanMeta,
    MethodSignature, Profile, ThreadDump, TraceEntries, TraceHeader,
};

/// Correlates a [`ServerRequest`] with its [`ClientResponse`].
///
/// Only unique within the session that generated it.
pub type RequestId = u64;

/// Message sent from agent to collector.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    /// First message on every stream.
    Hello {
        agent_id: String,
        #[serde(default)]
        agent_version: String,
    },
    /// Answer to an earlier [`ServerRequest`].
    Response(ClientResponse),
}

/// Message sent from collector to agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CollectorMessage {
    /// Reply to the agent's Hello.
    HelloAck { collector_version: String },
    Request(ServerRequest),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerRequest {
    pub request_id: RequestId,
    pub command: Command,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientResponse {
    pub request_id: RequestId,
    pub result: ClientResult,
}

/// Request id of a `response` frame whose body failed to decode.
///
/// Lets the receive loop fail the one call the agent was answering instead
/// of leaving it to time out.
pub fn response_request_id(bytes: &[u8]) -> Option<RequestId> {
    #[derive(Deserialize)]
    struct Correlation {
        #[serde(rename = "type")]
        kind: String,
        request_id: RequestId,
    }

    serde_json::from_slice::<Correlation>(bytes)
        .ok()
        .filter(|c| c.kind == "response")
        .map(|c| c.request_id)
}

/// Every command the collector can issue to an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    ThreadDump,
    AvailableDiskSpace {
        directory: String,
    },
    HeapDump {
        directory: String,
    },
    Gc,
    #[serde(rename = "mbean_dump")]
    MBeanDump {
        kind: MBeanDumpKind,
        #[serde(default)]
        object_names: Vec<String>,
    },
    #[serde(rename = "matching_mbean_object_names")]
    MatchingMBeanObjectNames {
        partial_object_name: String,
        limit: u32,
    },
    #[serde(rename = "mbean_meta")]
    MBeanMeta {
        object_name: String,
    },
    Capabilities,
    GlobalMeta,
    PreloadClasspathCache,
    MatchingClassNames {
        partial_class_name: String,
        limit: u32,
    },
    MatchingMethodNames {
        class_name: String,
        partial_method_name: String,
        limit: u32,
    },
    MethodSignatures {
        class_name: String,
        method_name: String,
    },
    Reweave,
    Header {
        trace_id: String,
    },
    Entries {
        trace_id: String,
    },
    MainThreadProfile {
        trace_id: String,
    },
    AuxThreadProfile {
        trace_id: String,
    },
    FullTrace {
        trace_id: String,
    },
    AgentConfigUpdate {
        config: serde_json::Value,
    },
}

impl Command {
    /// Short name used in logs and errors.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::ThreadDump => "thread_dump",
            Self::AvailableDiskSpace { .. } => "available_disk_space",
            Self::HeapDump { .. } => "heap_dump",
            Self::Gc => "gc",
            Self::MBeanDump { .. } => "mbean_dump",
            Self::MatchingMBeanObjectNames { .. } => "matching_mbean_object_names",
            Self::MBeanMeta { .. } => "mbean_meta",
            Self::Capabilities => "capabilities",
            Self::GlobalMeta => "global_meta",
            Self::PreloadClasspathCache => "preload_classpath_cache",
            Self::MatchingClassNames { .. } => "matching_class_names",
            Self::MatchingMethodNames { .. } => "matching_method_names",
            Self::MethodSignatures { .. } => "method_signatures",
            Self::Reweave => "reweave",
            Self::Header { .. } => "header",
            Self::Entries { .. } => "entries",
            Self::MainThreadProfile { .. } => "main_thread_profile",
            Self::AuxThreadProfile { .. } => "aux_thread_profile",
            Self::FullTrace { .. } => "full_trace",
            Self::AgentConfigUpdate { .. } => "agent_config_update",
        }
    }
}

/// Result an agent reports for a command.
///
/// Besides one arm per command, an agent may answer `UnknownRequest` when it
/// predates the command, or `Exception` when executing it failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientResult {
    ThreadDump {
        thread_dump: ThreadDump,
    },
    AvailableDiskSpace {
        #[serde(default)]
        available_bytes: u64,
        #[serde(default)]
        directory_does_not_exist: bool,
    },
    HeapDump {
        #[serde(default)]
        heap_dump_file_info: Option<HeapDumpFileInfo>,
        #[serde(default)]
        directory_does_not_exist: bool,
    },
    Gc,
    #[serde(rename = "mbean_dump")]
    MBeanDump {
        mbean_dump: MBeanDump,
    },
    #[serde(rename = "matching_mbean_object_names")]
    MatchingMBeanObjectNames {
        object_names: Vec<String>,
    },
    #[serde(rename = "mbean_meta")]
    MBeanMeta {
        mbean_meta: MBeanMeta,
    },
    Capabilities {
        capabilities: Capabilities,
    },
    GlobalMeta {
        global_meta: GlobalMeta,
    },
    PreloadClasspathCache,
    MatchingClassNames {
        class_names: Vec<String>,
    },
    MatchingMethodNames {
        method_names: Vec<String>,
    },
    MethodSignatures {
        method_signatures: Vec<MethodSignature>,
    },
    Reweave {
        class_update_count: u32,
    },
    Header {
        #[serde(default)]
        header: Option<TraceHeader>,
    },
    Entries {
        #[serde(default)]
        entries: Option<TraceEntries>,
    },
    MainThreadProfile {
        #[serde(default)]
        profile: Option<Profile>,
    },
    AuxThreadProfile {
        #[serde(default)]
        profile: Option<Profile>,
    },
    FullTrace {
        #[serde(default)]
        trace: Option<FullTrace>,
    },
    AgentConfigUpdate,
    /// The agent does not recognize the command.
    UnknownRequest,
    /// The agent recognized the command but failed while executing it.
    Exception {
        #[serde(default)]
        message: Option<String>,
    },
}

impl ClientResult {
    /// Short name used in logs and errors.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::ThreadDump { .. } => "thread_dump",
            Self::AvailableDiskSpace { .. } => "available_disk_space",
            Self::HeapDump { .. } => "heap_dump",
            Self::Gc => "gc",
            Self::MBeanDump { .. } => "mbean_dump",
            Self::MatchingMBeanObjectNames { .. } => "matching_mbean_object_names",
            Self::MBeanMeta { .. } => "mbean_meta",
            Self::Capabilities { .. } => "capabilities",
            Self::GlobalMeta { .. } => "global_meta",
            Self::PreloadClasspathCache => "preload_classpath_cache",
            Self::MatchingClassNames { .. } => "matching_class_names",
            Self::MatchingMethodNames { .. } => "matching_method_names",
            Self::MethodSignatures { .. } => "method_signatures",
            Self::Reweave { .. } => "reweave",
            Self::Header { .. } => "header",
            Self::Entries { .. } => "entries",
            Self::MainThreadProfile { .. } => "main_thread_profile",
            Self::AuxThreadProfile { .. } => "aux_thread_profile",
            Self::FullTrace { .. } => "full_trace",
            Self::AgentConfigUpdate => "agent_config_update",
            Self::UnknownRequest => "unknown_request",
            Self::Exception { .. } => "exception",
        }
    }
}
