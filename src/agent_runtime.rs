//! Drives runs of external agent engines
//!
//! The runtime owns the run lifecycle: it persists the queued record and
//! publishes `run.queued` synchronously, then drives the agent engine in a
//! spawned task through `running` to exactly one terminal status, publishing
//! the matching events along the way. It also owns the loop-boundary
//! injection contract: at every loop boundary the engine polls the runtime's
//! hook, which leases pending mailbox messages, hands them to the engine as
//! a synthetic user turn and acks them.

use crate::agent::{
    AgentBuildContext, AgentFactory, AgentMessage, LoopBoundaryHook, ManagedAgent,
};
use crate::agent::AgentRunStatus;
use crate::config::InjectionConfig;
use crate::domain_types::{AgentId, RunDepth, RunId, RunRecord, RunStatus, SessionId};
use crate::error::KernelError;
use crate::event_bus::{EventBus, SubscriptionId};
use crate::events::{EventFilter, EventType, RuntimeEvent};
use crate::state_store::StateStore;
use crate::state_store::mailbox::MailboxMessage;
use crate::time_provider::SharedTimeProvider;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Everything needed to schedule one run
#[derive(Debug, Clone)]
pub struct ExecuteSpec {
    /// Agent to run
    pub agent_id: AgentId,
    /// Input handed to the engine
    pub input: String,
    /// Run that requested this one, if any
    pub parent_run_id: Option<RunId>,
    /// Depth of the new run
    pub depth: RunDepth,
    /// Model resolved by policy, if overridden
    pub resolved_model: Option<String>,
    /// Annotations recorded on the run
    pub metadata: serde_json::Map<String, Value>,
}

/// Handle returned by [`AgentRuntime::execute`] while the run is still queued
#[derive(Debug, Clone)]
pub struct RunHandle {
    /// Id of the scheduled run
    pub run_id: RunId,
    /// Agent being run
    pub agent_id: AgentId,
    /// Status at scheduling time (always [`RunStatus::Queued`])
    pub status: RunStatus,
}

/// One item relayed to a [`AgentRuntime::stream`] listener
#[derive(Debug, Clone)]
pub enum RunStreamItem {
    /// A message the agent emitted mid-run
    Message(AgentMessage),
    /// Any other runtime event of the run, unchanged
    Event(RuntimeEvent),
}

/// Callback receiving a run's stream
pub type RunStreamListener = Arc<dyn Fn(RunStreamItem) + Send + Sync>;

/// Runs agents and owns their lifecycle
pub struct AgentRuntime {
    store: Arc<StateStore>,
    bus: Arc<EventBus>,
    factory: Arc<dyn AgentFactory>,
    time: SharedTimeProvider,
    injection: InjectionConfig,
    active: Arc<DashMap<RunId, Arc<dyn ManagedAgent>>>,
}

impl AgentRuntime {
    /// Creates a runtime over the shared store and bus.
    #[must_use]
    pub fn new(
        store: Arc<StateStore>,
        bus: Arc<EventBus>,
        factory: Arc<dyn AgentFactory>,
        time: SharedTimeProvider,
        injection: InjectionConfig,
    ) -> Self {
        Self {
            store,
            bus,
            factory,
            time,
            injection,
            active: Arc::new(DashMap::new()),
        }
    }

    /// Schedules a run and returns immediately with a queued handle.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::AgentNotFound`] when the agent is not
    /// registered. Execution failures never surface here; they are recorded
    /// on the run and published as `run.failed`.
    pub fn execute(&self, spec: ExecuteSpec) -> Result<RunHandle, KernelError> {
        if !self.store.contains_agent(&spec.agent_id) {
            return Err(KernelError::AgentNotFound(spec.agent_id));
        }

        let run_id = RunId::generate();
        let now = self.time.now();
        let record = RunRecord::queued(
            run_id,
            spec.agent_id.clone(),
            spec.parent_run_id,
            spec.depth,
            spec.input.clone(),
            now,
            spec.metadata.clone(),
        );
        self.store.insert_run(record);
        self.bus.publish(RuntimeEvent::at(
            now,
            EventType::RunQueued,
            Some(run_id),
            Some(spec.agent_id.clone()),
            json!({
                "agentId": spec.agent_id,
                "parentRunId": spec.parent_run_id,
                "depth": spec.depth,
            }),
        ));

        let task = RunTask {
            store: Arc::clone(&self.store),
            bus: Arc::clone(&self.bus),
            factory: Arc::clone(&self.factory),
            time: Arc::clone(&self.time),
            injection: self.injection.clone(),
            active: Arc::clone(&self.active),
            run_id,
        };
        let handle = RunHandle {
            run_id,
            agent_id: spec.agent_id.clone(),
            status: RunStatus::Queued,
        };
        tokio::spawn(task.drive(spec));
        Ok(handle)
    }

    /// Requests the running agent abort. Best effort: returns `false` when
    /// the run is not currently executing.
    pub async fn abort(&self, run_id: RunId) -> bool {
        let agent = self.active.get(&run_id).map(|entry| Arc::clone(&entry));
        match agent {
            Some(agent) => {
                agent.abort().await;
                true
            }
            None => false,
        }
    }

    /// Current record of a run.
    #[must_use]
    pub fn status(&self, run_id: RunId) -> Option<RunRecord> {
        self.store.run(run_id)
    }

    /// Relays a run's events to `listener`: `run.stream` payloads arrive as
    /// agent messages, everything else as the event itself.
    pub fn stream(&self, run_id: RunId, listener: RunStreamListener) -> SubscriptionId {
        self.bus.subscribe(
            EventFilter::for_run(run_id),
            Arc::new(move |event| {
                if event.event_type == EventType::RunStream {
                    let message = event
                        .payload
                        .get("message")
                        .cloned()
                        .and_then(|value| serde_json::from_value::<AgentMessage>(value).ok());
                    if let Some(message) = message {
                        listener(RunStreamItem::Message(message));
                        return;
                    }
                }
                listener(RunStreamItem::Event(event.clone()));
            }),
        )
    }

    /// Stops relaying a stream subscription.
    pub fn unsubscribe(&self, subscription: SubscriptionId) -> bool {
        self.bus.unsubscribe(subscription)
    }

    /// Number of runs currently executing in this process.
    #[must_use]
    pub fn executing_runs(&self) -> usize {
        self.active.len()
    }

    /// Aborts every executing run, best effort.
    pub async fn close(&self) {
        let agents: Vec<Arc<dyn ManagedAgent>> = self
            .active
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for agent in agents {
            agent.abort().await;
        }
    }
}

impl std::fmt::Debug for AgentRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRuntime")
            .field("executing_runs", &self.active.len())
            .finish_non_exhaustive()
    }
}

/// Owned context for one spawned run
struct RunTask {
    store: Arc<StateStore>,
    bus: Arc<EventBus>,
    factory: Arc<dyn AgentFactory>,
    time: SharedTimeProvider,
    injection: InjectionConfig,
    active: Arc<DashMap<RunId, Arc<dyn ManagedAgent>>>,
    run_id: RunId,
}

impl RunTask {
    async fn drive(self, spec: ExecuteSpec) {
        let agent_id = spec.agent_id.clone();

        let Some(profile) = self.store.profile(&agent_id) else {
            self.finish(
                &agent_id,
                RunStatus::Failed,
                None,
                Some("agent profile disappeared before the run started".to_string()),
                None,
            );
            return;
        };

        let stream_bus = Arc::clone(&self.bus);
        let stream_run = self.run_id;
        let stream_agent = agent_id.clone();
        let stream: crate::agent::StreamCallback = Arc::new(move |message: AgentMessage| {
            let payload = serde_json::to_value(&message).unwrap_or(Value::Null);
            stream_bus.publish(RuntimeEvent::new(
                EventType::RunStream,
                Some(stream_run),
                Some(stream_agent.clone()),
                json!({ "message": payload }),
            ));
        });

        let injector = Arc::new(MailboxInjector {
            store: Arc::clone(&self.store),
            bus: Arc::clone(&self.bus),
            time: Arc::clone(&self.time),
            config: self.injection.clone(),
            agent_id: agent_id.clone(),
            run_id: self.run_id,
        });

        let previous_session_id = self
            .store
            .session_for_agent(&agent_id)
            .or_else(|| profile.session_id.clone());

        let built = self
            .factory
            .create_agent(AgentBuildContext {
                profile,
                resolved_model: spec.resolved_model.clone(),
                previous_session_id,
                stream,
                loop_boundary: injector,
            })
            .await;
        let agent = match built {
            Ok(agent) => agent,
            Err(error) => {
                self.finish(
                    &agent_id,
                    RunStatus::Failed,
                    None,
                    Some(error.to_string()),
                    None,
                );
                return;
            }
        };

        self.active.insert(self.run_id, Arc::clone(&agent));

        let now = self.time.now();
        let session_id = agent.session_id();
        if let Some(session_id) = &session_id {
            self.store.bind_session(session_id.clone(), agent_id.clone());
        }
        self.transition(|record| {
            record.status = RunStatus::Running;
            record.started_at = Some(now);
            record.session_id = session_id.clone();
        });
        self.bus.publish(RuntimeEvent::at(
            now,
            EventType::RunStarted,
            Some(self.run_id),
            Some(agent_id.clone()),
            json!({ "agentId": agent_id, "sessionId": session_id }),
        ));

        let result = agent.execute_with_result(spec.input.clone()).await;
        match result {
            Ok(outcome) => {
                self.store
                    .bind_session(outcome.session_id.clone(), agent_id.clone());
                match outcome.status {
                    AgentRunStatus::Completed => {
                        let output = outcome
                            .final_message
                            .as_ref()
                            .map(|message| message.body.to_text())
                            .unwrap_or_default();
                        self.finish(
                            &agent_id,
                            RunStatus::Completed,
                            Some(output.clone()),
                            None,
                            Some(outcome.session_id.clone()),
                        );
                        self.bus.publish(RuntimeEvent::new(
                            EventType::RunCompleted,
                            Some(self.run_id),
                            Some(agent_id.clone()),
                            json!({
                                "output": output,
                                "loopCount": outcome.loop_count,
                                "retryCount": outcome.retry_count,
                            }),
                        ));
                    }
                    AgentRunStatus::Aborted => {
                        self.finish(
                            &agent_id,
                            RunStatus::Aborted,
                            None,
                            None,
                            Some(outcome.session_id.clone()),
                        );
                        self.bus.publish(RuntimeEvent::new(
                            EventType::RunAborted,
                            Some(self.run_id),
                            Some(agent_id.clone()),
                            json!({}),
                        ));
                    }
                    AgentRunStatus::Failed => {
                        let error = outcome
                            .failure
                            .clone()
                            .unwrap_or_else(|| "agent execution failed".to_string());
                        self.finish(
                            &agent_id,
                            RunStatus::Failed,
                            None,
                            Some(error),
                            Some(outcome.session_id.clone()),
                        );
                    }
                }
            }
            Err(error) => {
                self.finish(&agent_id, RunStatus::Failed, None, Some(error.to_string()), None);
            }
        }

        self.active.remove(&self.run_id);
        agent.close().await;
        debug!(run_id = %self.run_id, agent_id = %agent_id, "run finished");
    }

    /// Records a terminal status and, for failures, publishes `run.failed`.
    fn finish(
        &self,
        agent_id: &AgentId,
        status: RunStatus,
        output: Option<String>,
        error: Option<String>,
        session_id: Option<SessionId>,
    ) {
        let now = self.time.now();
        self.transition(|record| {
            record.status = status;
            record.finished_at = Some(now);
            if output.is_some() {
                record.output.clone_from(&output);
            }
            if error.is_some() {
                record.error.clone_from(&error);
            }
            if session_id.is_some() {
                record.session_id.clone_from(&session_id);
            }
        });
        if status == RunStatus::Failed {
            self.bus.publish(RuntimeEvent::at(
                now,
                EventType::RunFailed,
                Some(self.run_id),
                Some(agent_id.clone()),
                json!({ "error": error }),
            ));
        }
    }

    fn transition(&self, mutate: impl FnOnce(&mut RunRecord)) {
        let run_id = self.run_id;
        self.store.update_run(run_id, |record| {
            let before = record.status;
            mutate(record);
            if before != record.status && !before.can_transition_to(record.status) {
                warn!(
                    run_id = %run_id,
                    from = ?before,
                    to = ?record.status,
                    "invalid run status transition suppressed"
                );
                record.status = before;
            }
        });
    }
}

/// Serialized form of one injected message
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InjectedMessage {
    message_id: crate::domain_types::MessageId,
    from_agent_id: AgentId,
    topic: Option<crate::domain_types::TopicName>,
    correlation_id: Option<String>,
    payload: Value,
}

/// The runtime's side of the loop-boundary injection contract.
///
/// Leases pending mail, serializes it as a synthetic user turn and acks it.
/// On any failure every delivered message is nacked with no requeue delay;
/// errors never escape into the agent loop.
struct MailboxInjector {
    store: Arc<StateStore>,
    bus: Arc<EventBus>,
    time: SharedTimeProvider,
    config: InjectionConfig,
    agent_id: AgentId,
    run_id: RunId,
}

impl MailboxInjector {
    fn build_block(delivered: &[MailboxMessage]) -> Result<String, serde_json::Error> {
        let injected: Vec<InjectedMessage> = delivered
            .iter()
            .map(|message| InjectedMessage {
                message_id: message.message_id,
                from_agent_id: message.from.clone(),
                topic: message.topic.clone(),
                correlation_id: message.correlation_id.clone(),
                payload: message.payload.clone(),
            })
            .collect();
        let array = serde_json::to_string(&injected)?;
        Ok(format!(
            "Inter-agent messages injected at loop boundary:\n{array}"
        ))
    }

    fn nack_all(&self, delivered: &[MailboxMessage]) {
        let now = self.time.now();
        for message in delivered {
            let outcome = self.store.nack_message(
                &self.agent_id,
                message.message_id,
                Some("loop-boundary injection failed".to_string()),
                Duration::ZERO,
                now,
            );
            if let Some(outcome) = outcome {
                let event_type = if outcome.dead_lettered {
                    EventType::AgentMessageDeadLetter
                } else {
                    EventType::AgentMessageNacked
                };
                self.bus.publish(RuntimeEvent::at(
                    now,
                    event_type,
                    Some(self.run_id),
                    Some(self.agent_id.clone()),
                    json!({
                        "messageId": message.message_id,
                        "requeued": outcome.requeued,
                        "error": outcome.message.last_error,
                    }),
                ));
            }
        }
    }

    fn publish_dead_lettered(&self, dead_lettered: &[MailboxMessage]) {
        for message in dead_lettered {
            self.bus.publish(RuntimeEvent::new(
                EventType::AgentMessageDeadLetter,
                Some(self.run_id),
                Some(self.agent_id.clone()),
                json!({
                    "messageId": message.message_id,
                    "error": message.last_error,
                }),
            ));
        }
    }
}

#[async_trait]
impl LoopBoundaryHook for MailboxInjector {
    async fn next_injection(&self) -> Option<String> {
        if !self.config.enabled {
            return None;
        }

        let now = self.time.now();
        let outcome = self.store.receive_messages(
            &self.agent_id,
            now,
            self.config.receive_limit,
            Duration::from_millis(self.config.lease_ms),
        );
        self.publish_dead_lettered(&outcome.dead_lettered);
        if outcome.delivered.is_empty() {
            return None;
        }

        let block = match Self::build_block(&outcome.delivered) {
            Ok(block) => block,
            Err(error) => {
                warn!(
                    agent_id = %self.agent_id,
                    %error,
                    "failed to serialize injected messages; nacking"
                );
                self.nack_all(&outcome.delivered);
                return None;
            }
        };

        let mut all_acked = true;
        for message in &outcome.delivered {
            if self
                .store
                .ack_message(&self.agent_id, message.message_id)
                .is_some()
            {
                self.bus.publish(RuntimeEvent::at(
                    now,
                    EventType::AgentMessageAcked,
                    Some(self.run_id),
                    Some(self.agent_id.clone()),
                    json!({
                        "messageId": message.message_id,
                        "mode": "in-loop-injection",
                    }),
                ));
            } else {
                all_acked = false;
            }
        }
        if all_acked {
            Some(block)
        } else {
            self.nack_all(&outcome.delivered);
            None
        }
    }
}
