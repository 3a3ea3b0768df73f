//! The orchestrator kernel: public façade over routing, execution and
//! messaging
//!
//! A [`Kernel`] composes the state store, event bus, policy engine, router
//! and agent runtime, and owns the auto-dispatch loop that wakes idle
//! recipients when messages arrive. All external callers — the request
//! router, agents (through the messaging tools) and control surfaces — go
//! through the operations here.

use crate::agent::{AgentCapabilities, AgentFactory, AgentLimits, AgentProfile};
use crate::config::{ConfigError, KernelConfig};
use crate::domain_types::{
    AgentId, BindingId, IdempotencyKey, MaxDeliveryAttempts, MessageId, PartitionKey,
    RouteBinding, RunDepth, RunId, RunRecord, SessionId, StickyKey, TopicName,
};
use crate::error::KernelError;
use crate::event_bus::{EventBus, EventListener, SubscriptionId};
use crate::events::{EventFilter, EventType, RuntimeEvent};
use crate::messaging_tools::messaging_tool_set;
use crate::policy::{ExecuteCheck, MessageCheck, PolicyEngine, SpawnCheck};
use crate::router::{RouteDecision, RouteRequest, Router};
use crate::agent_runtime::{AgentRuntime, ExecuteSpec, RunHandle, RunStreamListener};
use crate::state_store::StateStore;
use crate::state_store::mailbox::{DrainReport, MailboxMessage, MailboxStats, NewMessage};
use crate::time_provider::{SharedTimeProvider, production_time_provider};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Receive limit applied when the caller does not supply one
const DEFAULT_RECEIVE_LIMIT: usize = 10;

/// A request to run an agent
#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    /// Agent to run
    pub agent_id: AgentId,
    /// Input handed to the engine
    pub input: String,
    /// Run requesting this one, if any
    pub parent_run_id: Option<RunId>,
    /// Requested model override, resolved through policy
    pub model: Option<String>,
    /// Annotations recorded on the run
    pub metadata: serde_json::Map<String, Value>,
}

impl ExecuteRequest {
    /// A top-level request with only agent and input set.
    #[must_use]
    pub fn new(agent_id: AgentId, input: impl Into<String>) -> Self {
        Self {
            agent_id,
            input: input.into(),
            parent_run_id: None,
            model: None,
            metadata: serde_json::Map::new(),
        }
    }
}

/// A request to derive and register a child agent under a controller
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    /// Agent requesting the spawn
    pub controller_agent_id: AgentId,
    /// Run the child is recorded under
    pub parent_run_id: RunId,
    /// Id of the new child agent
    pub child_agent_id: AgentId,
    /// Child role; inherits the controller's when unset
    pub role: Option<String>,
    /// Child system prompt; inherits the controller's when unset
    pub system_prompt: Option<String>,
    /// Child routing capabilities
    pub capabilities: Option<AgentCapabilities>,
    /// Child execution limits; inherits the controller's when unset
    pub limits: Option<AgentLimits>,
    /// Annotations recorded on the child profile
    pub metadata: serde_json::Map<String, Value>,
}

/// A request to enqueue an inter-agent message
#[derive(Debug, Clone)]
pub struct SendMessageRequest {
    /// Sending agent
    pub from: AgentId,
    /// Receiving agent
    pub to: AgentId,
    /// Arbitrary payload
    pub payload: Value,
    /// Topic; inferred from `payload.topic` when unset
    pub topic: Option<TopicName>,
    /// Explicit partition key override
    pub partition_key: Option<PartitionKey>,
    /// Idempotency key; inferred from `payload.idempotencyKey` when unset
    pub idempotency_key: Option<IdempotencyKey>,
    /// Correlates request/response pairs
    pub correlation_id: Option<String>,
    /// Run sending the message, if any
    pub run_id: Option<RunId>,
    /// Delivery budget override
    pub max_attempts: Option<MaxDeliveryAttempts>,
    /// Earliest delivery time
    pub visible_at: Option<SystemTime>,
}

impl SendMessageRequest {
    /// A message with only the addressing and payload set.
    #[must_use]
    pub fn new(from: AgentId, to: AgentId, payload: Value) -> Self {
        Self {
            from,
            to,
            payload,
            topic: None,
            partition_key: None,
            idempotency_key: None,
            correlation_id: None,
            run_id: None,
            max_attempts: None,
            visible_at: None,
        }
    }

    /// Sets the topic.
    #[must_use]
    pub fn with_topic(mut self, topic: TopicName) -> Self {
        self.topic = Some(topic);
        self
    }

    /// Sets the idempotency key.
    #[must_use]
    pub fn with_idempotency_key(mut self, key: IdempotencyKey) -> Self {
        self.idempotency_key = Some(key);
        self
    }
}

/// Options for [`Kernel::receive_mailbox`]
#[derive(Debug, Clone, Copy, Default)]
pub struct ReceiveOptions {
    /// Maximum messages to lease; defaults to 10
    pub limit: Option<usize>,
    /// Lease duration; defaults to the configured receive lease
    pub lease_ms: Option<u64>,
}

/// Options for [`Kernel::nack_mailbox_message`]
#[derive(Debug, Clone, Default)]
pub struct NackOptions {
    /// Error recorded on the message
    pub error: Option<String>,
    /// Redelivery delay; defaults to the configured nack delay
    pub requeue_delay_ms: Option<u64>,
}

/// Options for [`Kernel::requeue_dead_letter`]
#[derive(Debug, Clone, Copy, Default)]
pub struct RequeueOptions {
    /// Delay before the message becomes visible again
    pub delay_ms: u64,
    /// Reset the attempt counter so the full budget applies again
    pub reset_attempts: bool,
}

/// Result of a nack as surfaced to callers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NackResult {
    /// The message went back to the queue
    pub requeued: bool,
    /// The message moved to the dead letter queue
    pub dead_lettered: bool,
}

/// A node in the recursive run tree
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunGraphNode {
    /// The run at this node
    pub record: RunRecord,
    /// Its direct children, oldest first
    pub children: Vec<RunGraphNode>,
}

/// Point-in-time kernel counters
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct KernelStats {
    /// Registered agents
    pub registered_agents: usize,
    /// Runs currently queued or running
    pub active_runs: usize,
    /// Runs ever recorded
    pub total_runs: usize,
    /// Events published on the bus
    pub events_published: usize,
}

/// The inbound message that most recently woke a recipient
#[derive(Debug, Clone)]
pub struct DispatchTrigger {
    /// Recipient to dispatch
    pub to: AgentId,
    /// Sender of the triggering message, if known
    pub from: Option<AgentId>,
    /// Id of the triggering message, if known
    pub message_id: Option<MessageId>,
    /// Topic of the triggering message, if known
    pub topic: Option<String>,
    /// When the trigger was observed
    pub observed_at: SystemTime,
}

/// Builds the input handed to an auto-dispatched agent
pub type DispatchInputBuilder = Arc<dyn Fn(&DispatchTrigger) -> String + Send + Sync>;

struct AutoDispatcher {
    triggers: DashMap<AgentId, DispatchTrigger>,
    timers: Mutex<HashMap<AgentId, JoinHandle<()>>>,
    dispatching: DashMap<AgentId, ()>,
    input_builder: Option<DispatchInputBuilder>,
    subscription: Mutex<Option<SubscriptionId>>,
}

/// Builder for [`Kernel`]
pub struct KernelBuilder {
    config: KernelConfig,
    factory: Arc<dyn AgentFactory>,
    time: Option<SharedTimeProvider>,
    dispatch_input_builder: Option<DispatchInputBuilder>,
}

impl KernelBuilder {
    /// Overrides the time provider (tests use a manual clock).
    #[must_use]
    pub fn time_provider(mut self, time: SharedTimeProvider) -> Self {
        self.time = Some(time);
        self
    }

    /// Overrides the input built for auto-dispatched runs.
    #[must_use]
    pub fn dispatch_input_builder(mut self, builder: DispatchInputBuilder) -> Self {
        self.dispatch_input_builder = Some(builder);
        self
    }

    /// Validates the configuration and assembles the kernel.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the configuration is invalid.
    pub fn build(self) -> Result<Arc<Kernel>, ConfigError> {
        self.config.validate()?;
        let time = self.time.unwrap_or_else(production_time_provider);
        let store = Arc::new(StateStore::new());
        let bus = Arc::new(EventBus::new());
        let policy = PolicyEngine::new(
            self.config.budget.clone(),
            self.config.messaging_policy.clone(),
            Arc::clone(&store),
        );
        let router = Router::new(
            Arc::clone(&store),
            self.config.semantic_routing.clone(),
            self.config.default_agent.clone(),
        );
        let runtime = AgentRuntime::new(
            Arc::clone(&store),
            Arc::clone(&bus),
            self.factory,
            Arc::clone(&time),
            self.config.injection.clone(),
        );
        let dispatcher = self.config.auto_dispatch.enabled.then(|| AutoDispatcher {
            triggers: DashMap::new(),
            timers: Mutex::new(HashMap::new()),
            dispatching: DashMap::new(),
            input_builder: self.dispatch_input_builder,
            subscription: Mutex::new(None),
        });

        let kernel = Arc::new(Kernel {
            config: self.config,
            store,
            bus,
            policy,
            router,
            runtime,
            time,
            dispatcher,
            closed: AtomicBool::new(false),
            self_ref: OnceLock::new(),
        });
        kernel
            .self_ref
            .set(Arc::downgrade(&kernel))
            .expect("self reference is set exactly once");
        kernel.start_auto_dispatch();
        info!(auto_dispatch = kernel.dispatcher.is_some(), "kernel ready");
        Ok(kernel)
    }
}

/// Process-wide orchestration kernel
pub struct Kernel {
    config: KernelConfig,
    store: Arc<StateStore>,
    bus: Arc<EventBus>,
    policy: PolicyEngine,
    router: Router,
    runtime: AgentRuntime,
    time: SharedTimeProvider,
    dispatcher: Option<AutoDispatcher>,
    closed: AtomicBool,
    self_ref: OnceLock<Weak<Kernel>>,
}

impl Kernel {
    fn weak_self(&self) -> Weak<Kernel> {
        self.self_ref.get().cloned().unwrap_or_else(Weak::new)
    }

    fn strong_self(&self) -> Option<Arc<Kernel>> {
        self.weak_self().upgrade()
    }

    /// Starts building a kernel from a configuration and an agent factory.
    #[must_use]
    pub fn builder(config: KernelConfig, factory: Arc<dyn AgentFactory>) -> KernelBuilder {
        KernelBuilder {
            config,
            factory,
            time: None,
            dispatch_input_builder: None,
        }
    }

    /// The configuration the kernel was built with.
    #[must_use]
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    // ---- agents ------------------------------------------------------------

    /// Registers (or re-registers) an agent.
    ///
    /// When the profile carries a tool registry without the messaging tools,
    /// they are attached so the agent can send and receive mail from inside
    /// its loop. Returns the stored profile.
    pub fn register_agent(&self, profile: AgentProfile) -> AgentProfile {
        if let Some(tools) = &profile.tools
            && !tools.has_tool("send_message")
            && let Some(kernel) = self.strong_self()
        {
            tools.register(messaging_tool_set(&kernel));
        }
        if let Some(session_id) = &profile.session_id {
            self.store
                .bind_session(session_id.clone(), profile.agent_id.clone());
        }
        debug!(agent_id = %profile.agent_id, "agent registered");
        self.store.upsert_profile(profile)
    }

    /// A copy of a registered agent's profile.
    #[must_use]
    pub fn agent_profile(&self, agent_id: &AgentId) -> Option<AgentProfile> {
        self.store.profile(agent_id)
    }

    /// All registered profiles, in registration order.
    #[must_use]
    pub fn list_agents(&self) -> Vec<AgentProfile> {
        self.store.list_agents()
    }

    /// Derives a child profile from a controller, registers it and publishes
    /// `agent.spawned`.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::AgentNotFound`] for an unknown controller and
    /// [`KernelError::PolicyDenied`] when the children budget is spent.
    pub fn spawn(&self, request: SpawnRequest) -> Result<AgentProfile, KernelError> {
        let controller = self
            .store
            .profile(&request.controller_agent_id)
            .ok_or_else(|| KernelError::AgentNotFound(request.controller_agent_id.clone()))?;

        self.policy
            .can_spawn(&SpawnCheck {
                controller_agent_id: request.controller_agent_id.clone(),
                parent_run_id: request.parent_run_id,
            })
            .into_result()?;

        let child = AgentProfile {
            agent_id: request.child_agent_id.clone(),
            role: request.role.unwrap_or_else(|| controller.role.clone()),
            system_prompt: request
                .system_prompt
                .unwrap_or_else(|| controller.system_prompt.clone()),
            provider: Arc::clone(&controller.provider),
            tools: controller.tools.clone(),
            memory: None,
            session_id: None,
            limits: request.limits.unwrap_or_else(|| controller.limits.clone()),
            thinking: controller.thinking,
            plan_mode: controller.plan_mode,
            capabilities: request.capabilities.unwrap_or_default(),
            metadata: request.metadata,
        };
        let registered = self.register_agent(child);
        self.store.record_spawn(request.parent_run_id);
        self.bus.publish(RuntimeEvent::at(
            self.time.now(),
            EventType::AgentSpawned,
            Some(request.parent_run_id),
            Some(registered.agent_id.clone()),
            json!({
                "controllerAgentId": request.controller_agent_id,
                "childAgentId": registered.agent_id,
            }),
        ));
        Ok(registered)
    }

    // ---- routing -----------------------------------------------------------

    /// Routes a request to an agent without executing it.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::NoRouteMatched`] when nothing claims the
    /// request.
    pub fn route(&self, request: &RouteRequest) -> Result<RouteDecision, KernelError> {
        self.router.route(request)
    }

    /// Routes a request, then executes the selected agent with the routing
    /// provenance recorded in the run metadata.
    ///
    /// # Errors
    ///
    /// Propagates routing, policy and scheduling errors.
    pub fn route_and_execute(
        &self,
        request: &RouteRequest,
        input: impl Into<String>,
    ) -> Result<(RouteDecision, RunHandle), KernelError> {
        let decision = self.route(request)?;
        let mut metadata = serde_json::Map::new();
        metadata.insert("routeDecision".to_string(), serde_json::to_value(&decision)?);
        metadata.insert("routeRequest".to_string(), serde_json::to_value(request)?);
        let handle = self.execute(ExecuteRequest {
            agent_id: decision.agent_id.clone(),
            input: input.into(),
            parent_run_id: None,
            model: None,
            metadata,
        })?;
        Ok((decision, handle))
    }

    /// Pins a sticky key to an agent by hand.
    pub fn set_sticky_route(&self, key: StickyKey, agent_id: AgentId) {
        self.store.set_sticky(key, agent_id);
    }

    /// Removes a sticky pin. Returns whether it existed.
    pub fn clear_sticky_route(&self, key: &StickyKey) -> bool {
        self.store.clear_sticky(key)
    }

    /// The agent a sticky key is pinned to, if any.
    #[must_use]
    pub fn sticky_route_for(&self, key: &StickyKey) -> Option<AgentId> {
        self.store.sticky_for(key)
    }

    /// Adds a route binding.
    pub fn add_binding(&self, binding: RouteBinding) {
        self.store.add_binding(binding);
    }

    /// Removes a route binding. Returns whether it existed.
    pub fn remove_binding(&self, binding_id: &BindingId) -> bool {
        self.store.remove_binding(binding_id)
    }

    /// All bindings, sorted by ascending priority.
    #[must_use]
    pub fn list_bindings(&self) -> Vec<RouteBinding> {
        self.store.list_bindings()
    }

    // ---- runs --------------------------------------------------------------

    /// Schedules a run of an agent and returns a queued handle immediately.
    ///
    /// The run depth is the parent's depth plus one (0 for top-level runs, 1
    /// when the named parent run is unknown); the budget policy gates the
    /// schedule.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::Closed`], [`KernelError::AgentNotFound`] or
    /// [`KernelError::PolicyDenied`]. Execution failures are reported via
    /// the run record and `run.failed` events, never here.
    pub fn execute(&self, request: ExecuteRequest) -> Result<RunHandle, KernelError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(KernelError::Closed);
        }
        if !self.store.contains_agent(&request.agent_id) {
            return Err(KernelError::AgentNotFound(request.agent_id));
        }

        let depth = match request.parent_run_id {
            None => RunDepth::root(),
            Some(parent) => self
                .store
                .run(parent)
                .map_or_else(|| RunDepth::new(1), |record| record.depth.child()),
        };

        self.policy
            .can_execute(&ExecuteCheck {
                agent_id: request.agent_id.clone(),
                parent_run_id: request.parent_run_id,
                depth,
            })
            .into_result()?;

        let resolved_model = self.policy.resolve_model(&request.agent_id, request.model);
        self.runtime.execute(ExecuteSpec {
            agent_id: request.agent_id,
            input: request.input,
            parent_run_id: request.parent_run_id,
            depth,
            resolved_model,
            metadata: request.metadata,
        })
    }

    /// Requests a running agent abort. Best effort; `false` when the run is
    /// not currently executing.
    pub async fn abort(&self, run_id: RunId) -> bool {
        self.runtime.abort(run_id).await
    }

    /// Current record of a run.
    #[must_use]
    pub fn run_status(&self, run_id: RunId) -> Option<RunRecord> {
        self.runtime.status(run_id)
    }

    /// Copies of all run records, oldest first.
    #[must_use]
    pub fn list_runs(&self) -> Vec<RunRecord> {
        self.store.list_runs()
    }

    /// Relays a run's stream to `listener`.
    pub fn stream(&self, run_id: RunId, listener: RunStreamListener) -> SubscriptionId {
        self.runtime.stream(run_id, listener)
    }

    /// The recursive tree of runs under `root`, or `None` for an unknown run.
    #[must_use]
    pub fn build_run_graph(&self, root: RunId) -> Option<RunGraphNode> {
        let record = self.store.run(root)?;
        Some(self.graph_node(record))
    }

    fn graph_node(&self, record: RunRecord) -> RunGraphNode {
        let children = self
            .store
            .child_runs(record.run_id)
            .into_iter()
            .map(|child| self.graph_node(child))
            .collect();
        RunGraphNode { record, children }
    }

    // ---- messaging ---------------------------------------------------------

    /// Enqueues an inter-agent message and publishes `agent.message`.
    ///
    /// A send carrying a known, non-expired idempotency key is collapsed:
    /// the existing message is returned unchanged and only
    /// `agent.message.deduplicated` is published.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::Closed`] or [`KernelError::PolicyDenied`].
    pub fn send_message(
        &self,
        request: SendMessageRequest,
    ) -> Result<MailboxMessage, KernelError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(KernelError::Closed);
        }

        let topic = request.topic.clone().or_else(|| {
            request
                .payload
                .get("topic")
                .and_then(Value::as_str)
                .and_then(|raw| TopicName::try_new(raw).ok())
        });
        let idempotency_key = request.idempotency_key.clone().or_else(|| {
            request
                .payload
                .get("idempotencyKey")
                .and_then(Value::as_str)
                .and_then(|raw| IdempotencyKey::try_new(raw).ok())
        });

        let now = self.time.now();
        let dedup_window = self.config.message_runtime.dedup_window_ms;
        if let Some(key) = &idempotency_key
            && dedup_window > 0
            && let Some(existing) = self
                .store
                .find_message_by_idempotency(&request.to, key, now)
        {
            self.bus.publish(RuntimeEvent::at(
                now,
                EventType::AgentMessageDeduplicated,
                request.run_id,
                Some(request.to.clone()),
                json!({
                    "messageId": existing.message_id,
                    "idempotencyKey": key,
                }),
            ));
            return Ok(existing);
        }

        self.policy
            .can_message(&MessageCheck {
                from: request.from.clone(),
                to: request.to.clone(),
                topic: topic.clone(),
            })
            .into_result()?;

        let partition_key = request.partition_key.clone().or_else(|| {
            if self.config.message_runtime.enforce_topic_partition_order {
                // Fall through to the store's topic → default resolution.
                None
            } else {
                // Give every send its own partition so sends never block
                // each other.
                let base = topic
                    .as_ref()
                    .map_or(crate::domain_types::DEFAULT_PARTITION, TopicName::as_str);
                let suffix = &Uuid::new_v4().simple().to_string()[..8];
                Some(
                    PartitionKey::try_new(format!("{base}:{suffix}"))
                        .expect("partition key from topic and suffix is valid"),
                )
            }
        });

        let max_attempts = request.max_attempts.unwrap_or_else(|| {
            MaxDeliveryAttempts::try_new(self.config.message_runtime.max_attempts)
                .expect("max_attempts validated at build time")
        });

        let to = request.to.clone();
        let message = self.store.enqueue_message(
            NewMessage {
                from: request.from,
                to: to.clone(),
                payload: request.payload,
                topic,
                partition_key,
                idempotency_key: idempotency_key.clone(),
                max_attempts,
                visible_at: request.visible_at,
                correlation_id: request.correlation_id,
                run_id: request.run_id,
            },
            now,
        );

        if let Some(key) = idempotency_key
            && dedup_window > 0
        {
            self.store.save_idempotency(
                &to,
                key,
                message.message_id,
                now + Duration::from_millis(dedup_window),
                now,
            );
        }

        self.bus.publish(RuntimeEvent::at(
            now,
            EventType::AgentMessage,
            message.run_id,
            Some(to),
            json!({
                "messageId": message.message_id,
                "fromAgentId": message.from,
                "toAgentId": message.to,
                "topic": message.topic,
                "partitionKey": message.partition_key,
                "payload": message.payload,
            }),
        ));
        Ok(message)
    }

    /// Leases up to `limit` messages from an agent's mailbox.
    #[must_use]
    pub fn receive_mailbox(
        &self,
        agent_id: &AgentId,
        options: ReceiveOptions,
    ) -> Vec<MailboxMessage> {
        let now = self.time.now();
        let limit = options.limit.unwrap_or(DEFAULT_RECEIVE_LIMIT);
        let lease = Duration::from_millis(
            options
                .lease_ms
                .unwrap_or(self.config.message_runtime.receive_lease_ms),
        );
        let outcome = self.store.receive_messages(agent_id, now, limit, lease);
        for message in &outcome.dead_lettered {
            self.publish_dead_letter(agent_id, message, now);
        }
        outcome.delivered
    }

    /// Acks a delivered message. Returns whether it was in flight.
    pub fn ack_mailbox_message(&self, agent_id: &AgentId, message_id: MessageId) -> bool {
        let now = self.time.now();
        match self.store.ack_message(agent_id, message_id) {
            Some(message) => {
                self.bus.publish(RuntimeEvent::at(
                    now,
                    EventType::AgentMessageAcked,
                    message.run_id,
                    Some(agent_id.clone()),
                    json!({ "messageId": message_id, "mode": "explicit" }),
                ));
                true
            }
            None => false,
        }
    }

    /// Nacks a delivered message: requeues it with budget remaining,
    /// dead-letters it otherwise. Returns `None` when the message is not in
    /// flight.
    pub fn nack_mailbox_message(
        &self,
        agent_id: &AgentId,
        message_id: MessageId,
        options: NackOptions,
    ) -> Option<NackResult> {
        let now = self.time.now();
        let delay = Duration::from_millis(
            options
                .requeue_delay_ms
                .unwrap_or(self.config.message_runtime.nack_requeue_delay_ms),
        );
        let outcome = self
            .store
            .nack_message(agent_id, message_id, options.error, delay, now)?;
        if outcome.dead_lettered {
            self.publish_dead_letter(agent_id, &outcome.message, now);
        } else {
            self.bus.publish(RuntimeEvent::at(
                now,
                EventType::AgentMessageNacked,
                outcome.message.run_id,
                Some(agent_id.clone()),
                json!({
                    "messageId": message_id,
                    "requeued": true,
                    "error": outcome.message.last_error,
                }),
            ));
        }
        Some(NackResult {
            requeued: outcome.requeued,
            dead_lettered: outcome.dead_lettered,
        })
    }

    /// Copies of an agent's dead letters, oldest first.
    #[must_use]
    pub fn list_dead_letters(
        &self,
        agent_id: &AgentId,
        limit: Option<usize>,
    ) -> Vec<MailboxMessage> {
        self.store.list_dead_letters(agent_id, limit)
    }

    /// Moves a dead letter back to the queue. Returns the requeued message,
    /// or `None` for an unknown id.
    pub fn requeue_dead_letter(
        &self,
        agent_id: &AgentId,
        message_id: MessageId,
        options: RequeueOptions,
    ) -> Option<MailboxMessage> {
        self.store.requeue_dead_letter(
            agent_id,
            message_id,
            Duration::from_millis(options.delay_ms),
            options.reset_attempts,
            self.time.now(),
        )
    }

    /// Empties an agent's mailbox (queue, in-flight and dead letters).
    pub fn drain_mailbox(&self, agent_id: &AgentId) -> DrainReport {
        self.store.drain_mailbox(agent_id)
    }

    /// Point-in-time mailbox counters for an agent.
    #[must_use]
    pub fn mailbox_stats(&self, agent_id: &AgentId) -> MailboxStats {
        self.store.mailbox_stats(agent_id)
    }

    /// The agent behind a tool session, if any.
    #[must_use]
    pub fn agent_for_session(&self, session_id: &SessionId) -> Option<AgentId> {
        self.store.agent_for_session(session_id)
    }

    // ---- events ------------------------------------------------------------

    /// Subscribes a listener to runtime events matching `filter`.
    pub fn subscribe(&self, filter: EventFilter, listener: EventListener) -> SubscriptionId {
        self.bus.subscribe(filter, listener)
    }

    /// Removes an event subscription.
    pub fn unsubscribe(&self, subscription: SubscriptionId) -> bool {
        self.bus.unsubscribe(subscription)
    }

    /// Copies of retained events matching `filter`, in publish order.
    #[must_use]
    pub fn replay(&self, filter: Option<&EventFilter>) -> Vec<RuntimeEvent> {
        self.bus.replay(filter)
    }

    /// Point-in-time kernel counters.
    #[must_use]
    pub fn stats(&self) -> KernelStats {
        KernelStats {
            registered_agents: self.store.agent_count(),
            active_runs: self.store.active_run_count(),
            total_runs: self.store.total_runs(),
            events_published: self.bus.events_published(),
        }
    }

    // ---- lifecycle ---------------------------------------------------------

    /// Closes the kernel: rejects new work, cancels auto-dispatch timers and
    /// aborts executing runs best-effort.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(dispatcher) = &self.dispatcher {
            if let Some(subscription) = dispatcher
                .subscription
                .lock()
                .expect("dispatch subscription lock poisoned")
                .take()
            {
                self.bus.unsubscribe(subscription);
            }
            let timers = std::mem::take(
                &mut *dispatcher.timers.lock().expect("dispatch timers lock poisoned"),
            );
            for handle in timers.into_values() {
                handle.abort();
            }
            dispatcher.triggers.clear();
            dispatcher.dispatching.clear();
        }
        self.runtime.close().await;
        info!("kernel closed");
    }

    // ---- auto-dispatch -----------------------------------------------------

    fn start_auto_dispatch(&self) {
        let Some(dispatcher) = &self.dispatcher else {
            return;
        };
        let weak = self.weak_self();
        let subscription = self.bus.subscribe(
            EventFilter::of_types([EventType::AgentMessage]),
            Arc::new(move |event| {
                let Some(kernel) = weak.upgrade() else {
                    return;
                };
                if let Some(trigger) = trigger_from_event(event, kernel.time.now()) {
                    kernel.schedule_dispatch(trigger);
                }
            }),
        );
        *dispatcher
            .subscription
            .lock()
            .expect("dispatch subscription lock poisoned") = Some(subscription);
    }

    /// Stores the trigger (latest wins) and restarts the recipient's
    /// debounce timer.
    fn schedule_dispatch(&self, trigger: DispatchTrigger) {
        let Some(dispatcher) = &self.dispatcher else {
            return;
        };
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        let agent_id = trigger.to.clone();
        dispatcher.triggers.insert(agent_id.clone(), trigger);

        let weak = self.weak_self();
        let debounce = Duration::from_millis(self.config.auto_dispatch.debounce_ms);
        let timer_agent = agent_id.clone();
        let handle = tokio::spawn(async move {
            loop {
                let Some(kernel) = weak.upgrade() else {
                    return;
                };
                let time = Arc::clone(&kernel.time);
                let skip_if_running = kernel.config.auto_dispatch.skip_if_agent_running;
                drop(kernel);

                time.sleep(debounce).await;

                let Some(kernel) = weak.upgrade() else {
                    return;
                };
                if kernel.closed.load(Ordering::SeqCst) {
                    return;
                }
                if skip_if_running && kernel.store.has_active_run(&timer_agent) {
                    continue;
                }
                kernel.dispatch_now(&timer_agent);
                return;
            }
        });

        let mut timers = dispatcher
            .timers
            .lock()
            .expect("dispatch timers lock poisoned");
        if let Some(previous) = timers.insert(agent_id, handle) {
            previous.abort();
        }
    }

    /// Runs one coalesced dispatch for a recipient, guarded against
    /// double-dispatch.
    fn dispatch_now(&self, agent_id: &AgentId) {
        let Some(dispatcher) = &self.dispatcher else {
            return;
        };
        if dispatcher
            .dispatching
            .insert(agent_id.clone(), ())
            .is_some()
        {
            return;
        }

        let trigger = dispatcher.triggers.get(agent_id).map(|entry| entry.clone());
        let mut reschedule = false;
        if let Some(trigger) = trigger {
            let input = match &dispatcher.input_builder {
                Some(builder) => builder(&trigger),
                None => self.default_dispatch_input(),
            };
            let mut metadata = serde_json::Map::new();
            metadata.insert("autoDispatch".to_string(), Value::Bool(true));
            if let Some(message_id) = trigger.message_id {
                metadata.insert(
                    "triggerMessageId".to_string(),
                    Value::String(message_id.to_string()),
                );
            }

            match self.execute(ExecuteRequest {
                agent_id: agent_id.clone(),
                input,
                parent_run_id: None,
                model: None,
                metadata,
            }) {
                Ok(handle) => {
                    debug!(agent_id = %agent_id, run_id = %handle.run_id, "auto-dispatched");
                    dispatcher.triggers.remove(agent_id);
                }
                Err(error) => {
                    warn!(agent_id = %agent_id, %error, "auto-dispatch failed");
                    self.bus.publish(RuntimeEvent::at(
                        self.time.now(),
                        EventType::RunFailed,
                        None,
                        Some(agent_id.clone()),
                        json!({ "error": format!("auto-dispatch failed: {error}") }),
                    ));
                    reschedule = true;
                }
            }
        }
        dispatcher.dispatching.remove(agent_id);

        if reschedule
            && let Some(trigger) = dispatcher.triggers.get(agent_id).map(|entry| entry.clone())
        {
            self.schedule_dispatch(trigger);
        }
    }

    fn default_dispatch_input(&self) -> String {
        format!(
            "You have pending inter-agent messages. Drain your mailbox now: \
             call receive_messages (limit {}) to lease them, handle each one, \
             call ack_messages for the ones you processed and nack_message for \
             any you could not handle, then check list_dead_letters for \
             quarantined messages.",
            self.config.auto_dispatch.receive_limit
        )
    }

    fn publish_dead_letter(&self, agent_id: &AgentId, message: &MailboxMessage, now: SystemTime) {
        self.bus.publish(RuntimeEvent::at(
            now,
            EventType::AgentMessageDeadLetter,
            message.run_id,
            Some(agent_id.clone()),
            json!({
                "messageId": message.message_id,
                "error": message.last_error,
            }),
        ));
    }
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("agents", &self.store.agent_count())
            .field("active_runs", &self.store.active_run_count())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

fn trigger_from_event(event: &RuntimeEvent, observed_at: SystemTime) -> Option<DispatchTrigger> {
    let to = event.agent_id.clone()?;
    let from = event
        .payload
        .get("fromAgentId")
        .and_then(Value::as_str)
        .and_then(|raw| AgentId::try_new(raw).ok());
    let message_id = event
        .payload
        .get("messageId")
        .cloned()
        .and_then(|value| serde_json::from_value::<MessageId>(value).ok());
    let topic = event
        .payload
        .get("topic")
        .and_then(Value::as_str)
        .map(str::to_string);
    Some(DispatchTrigger {
        to,
        from,
        message_id,
        topic,
        observed_at,
    })
}
