//! Typed request arguments and result payloads carried inside envelopes.
//!
//! These mirror what the agent reports; the collector treats them as data
//! to hand back to callers and never interprets their contents.

use serde::{Deserialize, Serialize};

/// Snapshot of every live thread in the agent's JVM.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadDump {
    pub threads: Vec<ThreadSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadSnapshot {
    pub name: String,
    pub state: String,
    #[serde(default)]
    pub lock_info: Option<String>,
    #[serde(default)]
    pub stack_trace: Vec<String>,
    /// Set when the thread is currently executing a captured transaction.
    #[serde(default)]
    pub transaction: Option<ThreadTransaction>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadTransaction {
    pub transaction_type: String,
    pub transaction_name: String,
    pub duration_nanos: u64,
    #[serde(default)]
    pub trace_id: Option<String>,
}

/// Location of a heap dump written by the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeapDumpFileInfo {
    pub file_path: String,
    pub file_size_bytes: u64,
}

/// Selects which MBeans are dumped and whether attribute values are included.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MBeanDumpKind {
    AllMbeansIncludeAttributes,
    AllMbeansIncludeAttributesForSome,
    SomeMbeansIncludeAttributes,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MBeanDump {
    pub mbeans: Vec<MBeanInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MBeanInfo {
    pub object_name: String,
    #[serde(default)]
    pub attributes: Vec<MBeanAttribute>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MBeanAttribute {
    pub name: String,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MBeanMeta {
    /// No MBean matched the requested object name.
    pub unmatched: bool,
    /// The MBean matched but its MBeanServer is not available yet.
    pub unavailable: bool,
    #[serde(default)]
    pub attribute_names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Availability {
    pub available: bool,
    /// Why the capability is unavailable; empty when available.
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub thread_cpu_time: Availability,
    pub thread_contention_time: Availability,
    pub thread_allocated_bytes: Availability,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalMeta {
    pub jvm_out_of_sync: bool,
    pub jvm_retransform_classes_supported: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodSignature {
    pub name: String,
    #[serde(default)]
    pub parameter_types: Vec<String>,
    pub return_type: String,
    #[serde(default)]
    pub modifiers: Vec<String>,
}

/// Summary of a single captured trace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceHeader {
    pub partial: bool,
    pub slow: bool,
    pub error: bool,
    pub start_time: i64,
    pub capture_time: i64,
    pub duration_nanos: u64,
    pub transaction_type: String,
    pub transaction_name: String,
    pub headline: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub entry_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub depth: u32,
    pub start_offset_nanos: u64,
    pub duration_nanos: u64,
    pub message: String,
    /// Index into [`TraceEntries::shared_query_texts`], when the entry is a query.
    #[serde(default)]
    pub shared_query_text_index: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEntries {
    pub entries: Vec<TraceEntry>,
    #[serde(default)]
    pub shared_query_texts: Vec<String>,
}

/// Flattened stack-sample tree collected while the trace was running.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub package_names: Vec<String>,
    pub class_names: Vec<String>,
    pub method_names: Vec<String>,
    pub nodes: Vec<ProfileNode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileNode {
    pub depth: u32,
    pub package_index: u32,
    pub class_index: u32,
    pub method_index: u32,
    pub line_number: i32,
    pub sample_count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullTrace {
    pub header: TraceHeader,
    #[serde(default)]
    pub entries: TraceEntries,
    #[serde(default)]
    pub main_thread_profile: Option<Profile>,
    #[serde(default)]
    pub aux_thread_profile: Option<Profile>,
}
