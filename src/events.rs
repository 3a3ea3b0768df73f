//! Runtime event envelope and subscription filters
//!
//! Every observable state change in the kernel is published as a
//! [`RuntimeEvent`]: a strongly-typed envelope around an opaque JSON payload.
//! Events are immutable after publish and are retained by the bus for replay.

use crate::domain_types::{AgentId, EventId, RunId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::time::SystemTime;

/// The kind of a runtime event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// A run record was persisted in the queued state
    #[serde(rename = "run.queued")]
    RunQueued,
    /// The agent loop for a run started
    #[serde(rename = "run.started")]
    RunStarted,
    /// The agent emitted a streaming message during a run
    #[serde(rename = "run.stream")]
    RunStream,
    /// A run finished with output
    #[serde(rename = "run.completed")]
    RunCompleted,
    /// A run finished with an error
    #[serde(rename = "run.failed")]
    RunFailed,
    /// A run was stopped by an abort request
    #[serde(rename = "run.aborted")]
    RunAborted,
    /// A child agent profile was derived and registered
    #[serde(rename = "agent.spawned")]
    AgentSpawned,
    /// An inter-agent message was enqueued
    #[serde(rename = "agent.message")]
    AgentMessage,
    /// A delivered message was acknowledged
    #[serde(rename = "agent.message.acked")]
    AgentMessageAcked,
    /// A delivered message was negatively acknowledged and requeued
    #[serde(rename = "agent.message.nacked")]
    AgentMessageNacked,
    /// A message exhausted its delivery budget and was quarantined
    #[serde(rename = "agent.message.dead_letter")]
    AgentMessageDeadLetter,
    /// A send was collapsed onto an existing message by its idempotency key
    #[serde(rename = "agent.message.deduplicated")]
    AgentMessageDeduplicated,
}

impl EventType {
    /// The dotted wire name of this event type.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RunQueued => "run.queued",
            Self::RunStarted => "run.started",
            Self::RunStream => "run.stream",
            Self::RunCompleted => "run.completed",
            Self::RunFailed => "run.failed",
            Self::RunAborted => "run.aborted",
            Self::AgentSpawned => "agent.spawned",
            Self::AgentMessage => "agent.message",
            Self::AgentMessageAcked => "agent.message.acked",
            Self::AgentMessageNacked => "agent.message.nacked",
            Self::AgentMessageDeadLetter => "agent.message.dead_letter",
            Self::AgentMessageDeduplicated => "agent.message.deduplicated",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A published runtime event.
///
/// The envelope (`event_id`, `timestamp`, `event_type`, `run_id`, `agent_id`)
/// is strongly typed; the payload stays opaque at the bus layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeEvent {
    /// Unique id assigned at construction
    pub event_id: EventId,
    /// When the event was produced
    pub timestamp: SystemTime,
    /// What happened
    pub event_type: EventType,
    /// The run this event concerns, if any
    pub run_id: Option<RunId>,
    /// The agent this event concerns, if any
    pub agent_id: Option<AgentId>,
    /// Event-type-specific detail
    pub payload: Value,
}

impl RuntimeEvent {
    /// Creates an event stamped with the current wall clock.
    #[must_use]
    pub fn new(
        event_type: EventType,
        run_id: Option<RunId>,
        agent_id: Option<AgentId>,
        payload: Value,
    ) -> Self {
        Self::at(SystemTime::now(), event_type, run_id, agent_id, payload)
    }

    /// Creates an event with an explicit timestamp.
    #[must_use]
    pub fn at(
        timestamp: SystemTime,
        event_type: EventType,
        run_id: Option<RunId>,
        agent_id: Option<AgentId>,
        payload: Value,
    ) -> Self {
        Self {
            event_id: EventId::generate(),
            timestamp,
            event_type,
            run_id,
            agent_id,
            payload,
        }
    }
}

/// Conjunction of optional predicates over runtime events.
///
/// An empty filter matches every event.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Require an exact run id
    pub run_id: Option<RunId>,
    /// Require an exact agent id
    pub agent_id: Option<AgentId>,
    /// Require membership in this set of event types
    pub types: Option<HashSet<EventType>>,
}

impl EventFilter {
    /// A filter that matches every event.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// A filter scoped to one run.
    #[must_use]
    pub fn for_run(run_id: RunId) -> Self {
        Self {
            run_id: Some(run_id),
            ..Self::default()
        }
    }

    /// A filter scoped to one agent.
    #[must_use]
    pub fn for_agent(agent_id: AgentId) -> Self {
        Self {
            agent_id: Some(agent_id),
            ..Self::default()
        }
    }

    /// A filter scoped to a set of event types.
    #[must_use]
    pub fn of_types(types: impl IntoIterator<Item = EventType>) -> Self {
        Self {
            types: Some(types.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Narrows this filter to one agent.
    #[must_use]
    pub fn and_agent(mut self, agent_id: AgentId) -> Self {
        self.agent_id = Some(agent_id);
        self
    }

    /// Whether `event` satisfies every configured predicate.
    #[must_use]
    pub fn matches(&self, event: &RuntimeEvent) -> bool {
        if let Some(run_id) = self.run_id
            && event.run_id != Some(run_id)
        {
            return false;
        }
        if let Some(agent_id) = &self.agent_id
            && event.agent_id.as_ref() != Some(agent_id)
        {
            return false;
        }
        if let Some(types) = &self.types
            && !types.contains(&event.event_type)
        {
            return false;
        }
        true
    }
}
