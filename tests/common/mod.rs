//! Shared doubles for kernel integration tests: a null provider, a scripted
//! agent factory and a plain tool registry.

#![allow(dead_code)]

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use switchboard::agent::{
    AgentBuildContext, AgentError, AgentFactory, AgentMessage, AgentRunOutcome, AgentRunStatus,
    AgentTool, GenerateOptions, LoopBoundaryHook, ManagedAgent, Provider, ProviderError,
    ProviderOutput, StreamCallback, ToolRegistry,
};
use switchboard::{
    AgentId, AgentProfile, Kernel, KernelConfig, ManualTimeProvider, RunId, RunRecord, SessionId,
};
use tokio::sync::Notify;

/// Provider that completes instantly; the scripted agents never call it, but
/// profiles need one.
pub struct NullProvider;

#[async_trait]
impl Provider for NullProvider {
    async fn generate(
        &self,
        _messages: Vec<AgentMessage>,
        _options: GenerateOptions,
    ) -> Result<ProviderOutput, ProviderError> {
        Ok(ProviderOutput::Complete(AgentMessage::assistant("ok")))
    }
}

/// What a scripted agent does when executed.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Poll the loop-boundary hook once, stream one message, complete.
    Complete(String),
    /// Finish with a failed outcome.
    FailOutcome(String),
    /// Return an engine-level error.
    FailHard(String),
    /// Sleep until aborted or the duration elapses, then complete.
    Sleep(Duration),
}

/// Factory producing deterministic agents, scripted per agent id.
#[derive(Default)]
pub struct ScriptedFactory {
    behaviors: DashMap<String, Behavior>,
    /// Injection blocks agents observed at loop boundaries, by agent id.
    pub injections: Arc<Mutex<Vec<(String, String)>>>,
    /// How many agents were constructed.
    pub created: AtomicUsize,
}

impl ScriptedFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, agent_id: &str, behavior: Behavior) {
        self.behaviors.insert(agent_id.to_string(), behavior);
    }

    pub fn injection_blocks_for(&self, agent_id: &str) -> Vec<String> {
        self.injections
            .lock()
            .unwrap()
            .iter()
            .filter(|(agent, _)| agent == agent_id)
            .map(|(_, block)| block.clone())
            .collect()
    }
}

#[async_trait]
impl AgentFactory for ScriptedFactory {
    async fn create_agent(
        &self,
        context: AgentBuildContext,
    ) -> Result<Arc<dyn ManagedAgent>, AgentError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        let agent_id = context.profile.agent_id.as_str().to_string();
        let behavior = self
            .behaviors
            .get(&agent_id)
            .map(|entry| entry.clone())
            .unwrap_or(Behavior::Complete("done".to_string()));
        let session_id = context
            .previous_session_id
            .clone()
            .unwrap_or_else(|| SessionId::try_new(format!("sess-{agent_id}")).unwrap());
        Ok(Arc::new(ScriptedAgent {
            agent_id,
            behavior,
            session_id,
            stream: context.stream,
            hook: context.loop_boundary,
            injections: Arc::clone(&self.injections),
            aborted: AtomicBool::new(false),
            abort_signal: Notify::new(),
        }))
    }
}

struct ScriptedAgent {
    agent_id: String,
    behavior: Behavior,
    session_id: SessionId,
    stream: StreamCallback,
    hook: Arc<dyn LoopBoundaryHook>,
    injections: Arc<Mutex<Vec<(String, String)>>>,
    aborted: AtomicBool,
    abort_signal: Notify,
}

#[async_trait]
impl ManagedAgent for ScriptedAgent {
    async fn execute_with_result(&self, input: String) -> Result<AgentRunOutcome, AgentError> {
        if let Some(block) = self.hook.next_injection().await {
            self.injections
                .lock()
                .unwrap()
                .push((self.agent_id.clone(), block));
        }
        (self.stream)(AgentMessage::assistant(format!("working on: {input}")));

        let outcome = |status: AgentRunStatus, final_message, failure| AgentRunOutcome {
            status,
            final_message,
            failure,
            session_id: self.session_id.clone(),
            loop_count: 1,
            retry_count: 0,
        };

        match &self.behavior {
            Behavior::Complete(text) => Ok(outcome(
                AgentRunStatus::Completed,
                Some(AgentMessage::assistant(text.clone())),
                None,
            )),
            Behavior::FailOutcome(reason) => Ok(outcome(
                AgentRunStatus::Failed,
                None,
                Some(reason.clone()),
            )),
            Behavior::FailHard(reason) => Err(AgentError::Execution(reason.clone())),
            Behavior::Sleep(duration) => {
                tokio::select! {
                    () = tokio::time::sleep(*duration) => {}
                    () = self.abort_signal.notified() => {}
                }
                if self.aborted.load(Ordering::SeqCst) {
                    Ok(outcome(AgentRunStatus::Aborted, None, None))
                } else {
                    Ok(outcome(
                        AgentRunStatus::Completed,
                        Some(AgentMessage::assistant("slept")),
                        None,
                    ))
                }
            }
        }
    }

    async fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        self.abort_signal.notify_waiters();
    }

    async fn close(&self) {}

    fn session_id(&self) -> Option<SessionId> {
        Some(self.session_id.clone())
    }
}

/// Minimal in-memory tool registry.
#[derive(Default)]
pub struct SimpleToolRegistry {
    tools: Mutex<HashMap<String, Arc<dyn AgentTool>>>,
}

impl SimpleToolRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn tool(&self, name: &str) -> Option<Arc<dyn AgentTool>> {
        self.tools.lock().unwrap().get(name).cloned()
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }
}

impl ToolRegistry for SimpleToolRegistry {
    fn has_tool(&self, name: &str) -> bool {
        self.tools.lock().unwrap().contains_key(name)
    }

    fn register(&self, tools: Vec<Arc<dyn AgentTool>>) {
        let mut map = self.tools.lock().unwrap();
        for tool in tools {
            map.insert(tool.name().to_string(), tool);
        }
    }
}

pub fn agent(id: &str) -> AgentId {
    AgentId::try_new(id).unwrap()
}

pub fn profile(id: &str) -> AgentProfile {
    AgentProfile::new(agent(id), "worker", "You are a worker.", Arc::new(NullProvider))
}

/// A kernel on a manual clock with the scripted factory.
pub fn test_kernel(
    config: KernelConfig,
    factory: Arc<ScriptedFactory>,
) -> (Arc<Kernel>, Arc<ManualTimeProvider>) {
    let time = Arc::new(ManualTimeProvider::new());
    let kernel = Kernel::builder(config, factory)
        .time_provider(time.clone())
        .build()
        .expect("test config is valid");
    (kernel, time)
}

/// Polls until the run reaches a terminal status.
pub async fn wait_for_terminal(kernel: &Kernel, run_id: RunId) -> RunRecord {
    for _ in 0..1000 {
        if let Some(record) = kernel.run_status(run_id)
            && record.is_terminal()
        {
            return record;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("run {run_id} did not reach a terminal status in time");
}

/// Polls until `predicate` holds.
pub async fn wait_until(mut predicate: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("condition did not hold in time");
}

pub fn json_map(entries: &[(&str, Value)]) -> serde_json::Map<String, Value> {
    entries
        .iter()
        .map(|(key, value)| ((*key).to_string(), value.clone()))
        .collect()
}
