//! Typed command surface used by UI, alerting and admin callers.
//!
//! Every operation looks up the agent's session, sends one command and
//! unwraps the matching result. Nothing here retries: re-sending a command
//! such as a heap dump or GC is the caller's decision.

use std::sync::Arc;

use tracing::instrument;

use crate::error::DownstreamError;
use crate::session::{AgentSession, AgentSessionRegistry, AgentSummary};
use crate::transport::payload::{
    Capabilities, FullTrace, GlobalMeta, HeapDumpFileInfo, MBeanDump, MBeanDumpKind, MBeanMeta,
    MethodSignature, Profile, ThreadDump, TraceEntries, TraceHeader,
};
use crate::transport::protocol::{ClientResult, Command};

type CommandResult<T> = Result<T, DownstreamError>;

/// Issues commands to connected agents.
#[derive(Clone)]
pub struct CommandService {
    registry: Arc<AgentSessionRegistry>,
}

impl CommandService {
    pub const fn new(registry: Arc<AgentSessionRegistry>) -> Self {
        Self { registry }
    }

    pub const fn registry(&self) -> &Arc<AgentSessionRegistry> {
        &self.registry
    }

    /// Whether `agent_id` currently has an open session.
    pub async fn is_available(&self, agent_id: &str) -> bool {
        self.registry.is_available(agent_id).await
    }

    pub async fn connected_agents(&self) -> Vec<AgentSummary> {
        self.registry.connected_agents().await
    }

    #[instrument(skip(self))]
    pub async fn thread_dump(&self, agent_id: &str) -> CommandResult<ThreadDump> {
        match self.call(agent_id, Command::ThreadDump).await? {
            ClientResult::ThreadDump { thread_dump } => Ok(thread_dump),
            other => Err(unexpected(agent_id, "thread_dump", &other)),
        }
    }

    /// Free space, in bytes, of `directory` on the agent's host.
    #[instrument(skip(self))]
    pub async fn available_disk_space_bytes(
        &self,
        agent_id: &str,
        directory: &str,
    ) -> CommandResult<u64> {
        let command = Command::AvailableDiskSpace {
            directory: directory.to_string(),
        };
        match self.call(agent_id, command).await? {
            ClientResult::AvailableDiskSpace {
                directory_does_not_exist: true,
                ..
            } => Err(directory_missing(agent_id, directory)),
            ClientResult::AvailableDiskSpace {
                available_bytes, ..
            } => Ok(available_bytes),
            other => Err(unexpected(agent_id, "available_disk_space", &other)),
        }
    }

    #[instrument(skip(self))]
    pub async fn heap_dump(&self, agent_id: &str, directory: &str) -> CommandResult<HeapDumpFileInfo> {
        let command = Command::HeapDump {
            directory: directory.to_string(),
        };
        match self.call(agent_id, command).await? {
            ClientResult::HeapDump {
                directory_does_not_exist: true,
                ..
            } => Err(directory_missing(agent_id, directory)),
            ClientResult::HeapDump {
                heap_dump_file_info: Some(info),
                ..
            } => Ok(info),
            ClientResult::HeapDump { .. } => Err(DownstreamError::AgentSideFailure {
                agent_id: agent_id.to_string(),
                command: "heap_dump",
                message: Some("agent reported no heap dump file".to_string()),
            }),
            other => Err(unexpected(agent_id, "heap_dump", &other)),
        }
    }

    #[instrument(skip(self))]
    pub async fn gc(&self, agent_id: &str) -> CommandResult<()> {
        match self.call(agent_id, Command::Gc).await? {
            ClientResult::Gc => Ok(()),
            other => Err(unexpected(agent_id, "gc", &other)),
        }
    }

    #[instrument(skip(self, object_names))]
    pub async fn mbean_dump(
        &self,
        agent_id: &str,
        kind: MBeanDumpKind,
        object_names: Vec<String>,
    ) -> CommandResult<MBeanDump> {
        let command = Command::MBeanDump { kind, object_names };
        match self.call(agent_id, command).await? {
            ClientResult::MBeanDump { mbean_dump } => Ok(mbean_dump),
            other => Err(unexpected(agent_id, "mbean_dump", &other)),
        }
    }

    #[instrument(skip(self))]
    pub async fn matching_mbean_object_names(
        &self,
        agent_id: &str,
        partial_object_name: &str,
        limit: u32,
    ) -> CommandResult<Vec<String>> {
        let command = Command::MatchingMBeanObjectNames {
            partial_object_name: partial_object_name.to_string(),
            limit,
        };
        match self.call(agent_id, command).await? {
            ClientResult::MatchingMBeanObjectNames { object_names } => Ok(object_names),
            other => Err(unexpected(agent_id, "matching_mbean_object_names", &other)),
        }
    }

    #[instrument(skip(self))]
    pub async fn mbean_meta(&self, agent_id: &str, object_name: &str) -> CommandResult<MBeanMeta> {
        let command = Command::MBeanMeta {
            object_name: object_name.to_string(),
        };
        match self.call(agent_id, command).await? {
            ClientResult::MBeanMeta { mbean_meta } => Ok(mbean_meta),
            other => Err(unexpected(agent_id, "mbean_meta", &other)),
        }
    }

    #[instrument(skip(self))]
    pub async fn capabilities(&self, agent_id: &str) -> CommandResult<Capabilities> {
        match self.call(agent_id, Command::Capabilities).await? {
            ClientResult::Capabilities { capabilities } => Ok(capabilities),
            other => Err(unexpected(agent_id, "capabilities", &other)),
        }
    }

    #[instrument(skip(self))]
    pub async fn global_meta(&self, agent_id: &str) -> CommandResult<GlobalMeta> {
        match self.call(agent_id, Command::GlobalMeta).await? {
            ClientResult::GlobalMeta { global_meta } => Ok(global_meta),
            other => Err(unexpected(agent_id, "global_meta", &other)),
        }
    }

    #[instrument(skip(self))]
    pub async fn preload_classpath_cache(&self, agent_id: &str) -> CommandResult<()> {
        match self.call(agent_id, Command::PreloadClasspathCache).await? {
            ClientResult::PreloadClasspathCache => Ok(()),
            other => Err(unexpected(agent_id, "preload_classpath_cache", &other)),
        }
    }

    #[instrument(skip(self))]
    pub async fn matching_class_names(
        &self,
        agent_id: &str,
        partial_class_name: &str,
        limit: u32,
    ) -> CommandResult<Vec<String>> {
        let command = Command::MatchingClassNames {
            partial_class_name: partial_class_name.to_string(),
            limit,
        };
        match self.call(agent_id, command).await? {
            ClientResult::MatchingClassNames { class_names } => Ok(class_names),
            other => Err(unexpected(agent_id, "matching_class_names", &other)),
        }
    }

    #[instrument(skip(self))]
    pub async fn matching_method_names(
        &self,
        agent_id: &str,
        class_name: &str,
        partial_method_name: &str,
        limit: u32,
    ) -> CommandResult<Vec<String>> {
        let command = Command::MatchingMethodNames {
            class_name: class_name.to_string(),
            partial_method_name: partial_method_name.to_string(),
            limit,
        };
        match self.call(agent_id, command).await? {
            ClientResult::MatchingMethodNames { method_names } => Ok(method_names),
            other => Err(unexpected(agent_id, "matching_method_names", &other)),
        }
    }

    #[instrument(skip(self))]
    pub async fn method_signatures(
        &self,
        agent_id: &str,
        class_name: &str,
        method_name: &str,
    ) -> CommandResult<Vec<MethodSignature>> {
        let command = Command::MethodSignatures {
            class_name: class_name.to_string(),
            method_name: method_name.to_string(),
        };
        match self.call(agent_id, command).await? {
            ClientResult::MethodSignatures { method_signatures } => Ok(method_signatures),
            other => Err(unexpected(agent_id, "method_signatures", &other)),
        }
    }

    /// Re-apply instrumentation. Returns the number of classes updated.
    #[instrument(skip(self))]
    pub async fn reweave(&self, agent_id: &str) -> CommandResult<u32> {
        match self.call(agent_id, Command::Reweave).await? {
            ClientResult::Reweave { class_update_count } => Ok(class_update_count),
            other => Err(unexpected(agent_id, "reweave", &other)),
        }
    }

    /// `Ok(None)` when the agent no longer holds the trace.
    #[instrument(skip(self))]
    pub async fn get_header(&self, agent_id: &str, trace_id: &str) -> CommandResult<Option<TraceHeader>> {
        let command = Command::Header {
            trace_id: trace_id.to_string(),
        };
        match self.call(agent_id, command).await? {
            ClientResult::Header { header } => Ok(header),
            other => Err(unexpected(agent_id, "header", &other)),
        }
    }

    #[instrument(skip(self))]
    pub async fn get_entries(&self, agent_id: &str, trace_id: &str) -> CommandResult<Option<TraceEntries>> {
        let command = Command::Entries {
            trace_id: trace_id.to_string(),
        };
        match self.call(agent_id, command).await? {
            ClientResult::Entries { entries } => Ok(entries),
            other => Err(unexpected(agent_id, "entries", &other)),
        }
    }

    #[instrument(skip(self))]
    pub async fn get_main_thread_profile(
        &self,
        agent_id: &str,
        trace_id: &str,
    ) -> CommandResult<Option<Profile>> {
        let command = Command::MainThreadProfile {
            trace_id: trace_id.to_string(),
        };
        match self.call(agent_id, command).await? {
            ClientResult::MainThreadProfile { profile } => Ok(profile),
            other => Err(unexpected(agent_id, "main_thread_profile", &other)),
        }
    }

    #[instrument(skip(self))]
    pub async fn get_aux_thread_profile(
        &self,
        agent_id: &str,
        trace_id: &str,
    ) -> CommandResult<Option<Profile>> {
        let command = Command::AuxThreadProfile {
            trace_id: trace_id.to_string(),
        };
        match self.call(agent_id, command).await? {
            ClientResult::AuxThreadProfile { profile } => Ok(profile),
            other => Err(unexpected(agent_id, "aux_thread_profile", &other)),
        }
    }

    #[instrument(skip(self))]
    pub async fn get_full_trace(&self, agent_id: &str, trace_id: &str) -> CommandResult<Option<FullTrace>> {
        let command = Command::FullTrace {
            trace_id: trace_id.to_string(),
        };
        match self.call(agent_id, command).await? {
            ClientResult::FullTrace { trace } => Ok(trace),
            other => Err(unexpected(agent_id, "full_trace", &other)),
        }
    }

    /// Push a new configuration document to the agent.
    #[instrument(skip(self, config))]
    pub async fn update_agent_config(
        &self,
        agent_id: &str,
        config: serde_json::Value,
    ) -> CommandResult<()> {
        match self.call(agent_id, Command::AgentConfigUpdate { config }).await? {
            ClientResult::AgentConfigUpdate => Ok(()),
            other => Err(unexpected(agent_id, "agent_config_update", &other)),
        }
    }

    /// Look up the session, failing fast without touching any pending table.
    async fn session(&self, agent_id: &str) -> CommandResult<Arc<AgentSession>> {
        self.registry
            .lookup(agent_id)
            .await
            .ok_or_else(|| DownstreamError::AgentNotConnected {
                agent_id: agent_id.to_string(),
            })
    }

    async fn call(&self, agent_id: &str, command: Command) -> CommandResult<ClientResult> {
        self.session(agent_id).await?.call(command).await
    }
}

fn unexpected(agent_id: &str, command: &'static str, actual: &ClientResult) -> DownstreamError {
    DownstreamError::UnexpectedResponse {
        agent_id: agent_id.to_string(),
        command,
        actual: actual.kind(),
    }
}

fn directory_missing(agent_id: &str, directory: &str) -> DownstreamError {
    DownstreamError::DirectoryDoesNotExist {
        agent_id: agent_id.to_string(),
        directory: directory.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::session::SessionConfig;
    use crate::transport::protocol::{ClientResponse, CollectorMessage, ServerRequest};

    fn service_with_agent(agent_id: &str) -> (CommandService, Arc<AgentSession>, mpsc::Receiver<CollectorMessage>) {
        let registry = Arc::new(AgentSessionRegistry::new());
        let (tx, rx) = mpsc::channel(8);
        let config = SessionConfig {
            call_timeout: Duration::from_secs(5),
            ..SessionConfig::default()
        };
        let session = Arc::new(AgentSession::new(agent_id, "1.0", tx, &config));
        let service = CommandService::new(Arc::clone(&registry));
        (service, session, rx)
    }

    /// Answer the next request on `rx` with `result`, returning the request.
    async fn answer(
        session: &AgentSession,
        rx: &mut mpsc::Receiver<CollectorMessage>,
        result: ClientResult,
    ) -> ServerRequest {
        let req = match rx.recv().await {
            Some(CollectorMessage::Request(req)) => req,
            other => panic!("expected request, got {other:?}"),
        };
        session
            .deliver(ClientResponse {
                request_id: req.request_id,
                result,
            })
            .await;
        req
    }

    /// Run `call` while answering its request with `result`.
    async fn exchange<T>(
        session: &AgentSession,
        rx: &mut mpsc::Receiver<CollectorMessage>,
        call: impl Future<Output = CommandResult<T>>,
        result: ClientResult,
    ) -> (Command, CommandResult<T>) {
        let (value, req) = tokio::join!(call, answer(session, rx, result));
        (req.command, value)
    }

    #[tokio::test]
    async fn every_operation_fails_fast_for_unknown_agent() {
        let (service, session, mut rx) = service_with_agent("a1");
        service.registry().register(Arc::clone(&session)).await;

        let results = vec![
            service.thread_dump("missing").await.map(drop),
            service.available_disk_space_bytes("missing", "/tmp").await.map(drop),
            service.heap_dump("missing", "/tmp").await.map(drop),
            service.gc("missing").await,
            service
                .mbean_dump("missing", MBeanDumpKind::AllMbeansIncludeAttributes, vec![])
                .await
                .map(drop),
            service.matching_mbean_object_names("missing", "java", 10).await.map(drop),
            service.mbean_meta("missing", "java.lang:type=Memory").await.map(drop),
            service.capabilities("missing").await.map(drop),
            service.global_meta("missing").await.map(drop),
            service.preload_classpath_cache("missing").await,
            service.matching_class_names("missing", "Foo", 10).await.map(drop),
            service.matching_method_names("missing", "Foo", "ba", 10).await.map(drop),
            service.method_signatures("missing", "Foo", "bar").await.map(drop),
            service.reweave("missing").await.map(drop),
            service.get_header("missing", "t").await.map(drop),
            service.get_entries("missing", "t").await.map(drop),
            service.get_main_thread_profile("missing", "t").await.map(drop),
            service.get_aux_thread_profile("missing", "t").await.map(drop),
            service.get_full_trace("missing", "t").await.map(drop),
            service
                .update_agent_config("missing", serde_json::json!({}))
                .await,
        ];

        assert_eq!(results.len(), 20);
        for result in results {
            assert_eq!(
                result.unwrap_err(),
                DownstreamError::AgentNotConnected {
                    agent_id: "missing".to_string()
                }
            );
        }
        assert!(session.pending().is_empty().await);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn operations_build_commands_and_unwrap_results() {
        let (service, session, mut rx) = service_with_agent("a1");
        service.registry().register(Arc::clone(&session)).await;

        let (command, space) = exchange(
            &session,
            &mut rx,
            service.available_disk_space_bytes("a1", "/var/tmp"),
            ClientResult::AvailableDiskSpace {
                available_bytes: 4096,
                directory_does_not_exist: false,
            },
        )
        .await;
        assert_eq!(
            command,
            Command::AvailableDiskSpace {
                directory: "/var/tmp".to_string()
            }
        );
        assert_eq!(space.unwrap(), 4096);

        let (_, space) = exchange(
            &session,
            &mut rx,
            service.available_disk_space_bytes("a1", "/nope"),
            ClientResult::AvailableDiskSpace {
                available_bytes: 0,
                directory_does_not_exist: true,
            },
        )
        .await;
        assert!(matches!(space, Err(DownstreamError::DirectoryDoesNotExist { .. })));

        let dump = MBeanDump::default();
        let (command, result) = exchange(
            &session,
            &mut rx,
            service.mbean_dump(
                "a1",
                MBeanDumpKind::SomeMbeansIncludeAttributes,
                vec!["java.lang:type=Memory".to_string()],
            ),
            ClientResult::MBeanDump {
                mbean_dump: dump.clone(),
            },
        )
        .await;
        assert_eq!(
            command,
            Command::MBeanDump {
                kind: MBeanDumpKind::SomeMbeansIncludeAttributes,
                object_names: vec!["java.lang:type=Memory".to_string()],
            }
        );
        assert_eq!(result.unwrap(), dump);

        let meta = MBeanMeta {
            unmatched: false,
            unavailable: false,
            attribute_names: vec!["HeapMemoryUsage".to_string()],
        };
        let (command, result) = exchange(
            &session,
            &mut rx,
            service.mbean_meta("a1", "java.lang:type=Memory"),
            ClientResult::MBeanMeta {
                mbean_meta: meta.clone(),
            },
        )
        .await;
        assert_eq!(
            command,
            Command::MBeanMeta {
                object_name: "java.lang:type=Memory".to_string()
            }
        );
        assert_eq!(result.unwrap(), meta);

        let signatures = vec![MethodSignature {
            name: "bar".to_string(),
            parameter_types: vec!["int".to_string()],
            return_type: "void".to_string(),
            modifiers: vec!["public".to_string()],
        }];
        let (command, result) = exchange(
            &session,
            &mut rx,
            service.method_signatures("a1", "com.example.Foo", "bar"),
            ClientResult::MethodSignatures {
                method_signatures: signatures.clone(),
            },
        )
        .await;
        assert_eq!(
            command,
            Command::MethodSignatures {
                class_name: "com.example.Foo".to_string(),
                method_name: "bar".to_string(),
            }
        );
        assert_eq!(result.unwrap(), signatures);

        let entries = TraceEntries::default();
        let (command, result) = exchange(
            &session,
            &mut rx,
            service.get_entries("a1", "t1"),
            ClientResult::Entries {
                entries: Some(entries.clone()),
            },
        )
        .await;
        assert_eq!(command, Command::Entries { trace_id: "t1".to_string() });
        assert_eq!(result.unwrap(), Some(entries));

        let profile = Profile {
            package_names: vec!["java.lang".to_string()],
            ..Profile::default()
        };
        let (command, result) = exchange(
            &session,
            &mut rx,
            service.get_main_thread_profile("a1", "t1"),
            ClientResult::MainThreadProfile {
                profile: Some(profile.clone()),
            },
        )
        .await;
        assert_eq!(command, Command::MainThreadProfile { trace_id: "t1".to_string() });
        assert_eq!(result.unwrap(), Some(profile));

        let (command, result) = exchange(
            &session,
            &mut rx,
            service.get_aux_thread_profile("a1", "t1"),
            ClientResult::AuxThreadProfile { profile: None },
        )
        .await;
        assert_eq!(command, Command::AuxThreadProfile { trace_id: "t1".to_string() });
        assert_eq!(result.unwrap(), None);

        let trace = FullTrace::default();
        let (command, result) = exchange(
            &session,
            &mut rx,
            service.get_full_trace("a1", "t1"),
            ClientResult::FullTrace {
                trace: Some(trace.clone()),
            },
        )
        .await;
        assert_eq!(command, Command::FullTrace { trace_id: "t1".to_string() });
        assert_eq!(result.unwrap(), Some(trace));

        let config = serde_json::json!({"transactions": {"slow_threshold_millis": 2000}});
        let (command, result) = exchange(
            &session,
            &mut rx,
            service.update_agent_config("a1", config.clone()),
            ClientResult::AgentConfigUpdate,
        )
        .await;
        assert_eq!(command, Command::AgentConfigUpdate { config });
        result.unwrap();

        assert!(session.pending().is_empty().await);
    }

    #[tokio::test]
    async fn heap_dump_without_file_is_agent_side_failure() {
        let (service, session, mut rx) = service_with_agent("a1");
        service.registry().register(Arc::clone(&session)).await;

        let (_, result) = exchange(
            &session,
            &mut rx,
            service.heap_dump("a1", "/var/tmp"),
            ClientResult::HeapDump {
                heap_dump_file_info: None,
                directory_does_not_exist: false,
            },
        )
        .await;
        assert!(matches!(
            result.unwrap_err(),
            DownstreamError::AgentSideFailure {
                command: "heap_dump",
                message: Some(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn unknown_agent_fails_fast() {
        let service = CommandService::new(Arc::new(AgentSessionRegistry::new()));
        let err = service.thread_dump("missing").await.unwrap_err();
        assert_eq!(
            err,
            DownstreamError::AgentNotConnected {
                agent_id: "missing".to_string()
            }
        );
        assert!(!service.is_available("missing").await);
    }

    #[tokio::test]
    async fn missing_trace_is_none_not_error() {
        let (service, session, mut rx) = service_with_agent("a1");
        service.registry().register(Arc::clone(&session)).await;

        let svc = service.clone();
        let call = tokio::spawn(async move { svc.get_header("a1", "trace-1").await });
        let req = answer(&session, &mut rx, ClientResult::Header { header: None }).await;

        assert_eq!(
            req.command,
            Command::Header {
                trace_id: "trace-1".to_string()
            }
        );
        assert_eq!(call.await.unwrap().unwrap(), None);
    }

    #[tokio::test]
    async fn heap_dump_reports_missing_directory() {
        let (service, session, mut rx) = service_with_agent("a1");
        service.registry().register(Arc::clone(&session)).await;

        let svc = service.clone();
        let call = tokio::spawn(async move { svc.heap_dump("a1", "/nope").await });
        answer(
            &session,
            &mut rx,
            ClientResult::HeapDump {
                heap_dump_file_info: None,
                directory_does_not_exist: true,
            },
        )
        .await;

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, DownstreamError::DirectoryDoesNotExist { ref directory, .. } if directory == "/nope"));
    }

    #[tokio::test]
    async fn mismatched_result_is_unexpected_response() {
        let (service, session, mut rx) = service_with_agent("a1");
        service.registry().register(Arc::clone(&session)).await;

        let svc = service.clone();
        let call = tokio::spawn(async move { svc.capabilities("a1").await });
        answer(&session, &mut rx, ClientResult::Gc).await;

        let err = call.await.unwrap().unwrap_err();
        assert_eq!(
            err,
            DownstreamError::UnexpectedResponse {
                agent_id: "a1".to_string(),
                command: "capabilities",
                actual: "gc",
            }
        );
    }

    #[tokio::test]
    async fn matching_method_names_builds_command() {
        let (service, session, mut rx) = service_with_agent("a1");
        service.registry().register(Arc::clone(&session)).await;

        let svc = service.clone();
        let call = tokio::spawn(async move {
            svc.matching_method_names("a1", "com.example.Foo", "ge", 5).await
        });
        let req = answer(
            &session,
            &mut rx,
            ClientResult::MatchingMethodNames {
                method_names: vec!["get".to_string(), "getAll".to_string()],
            },
        )
        .await;

        assert_eq!(
            req.command,
            Command::MatchingMethodNames {
                class_name: "com.example.Foo".to_string(),
                partial_method_name: "ge".to_string(),
                limit: 5,
            }
        );
        assert_eq!(call.await.unwrap().unwrap(), vec!["get", "getAll"]);
    }
}
