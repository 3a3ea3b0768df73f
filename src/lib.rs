//! # Switchboard — an orchestration kernel for multi-agent runtimes
//!
//! Switchboard coordinates many LLM-backed agents inside one process. It
//! routes external requests to the right agent (sticky sessions, bindings,
//! optional semantic scoring), runs agent executions under budget and depth
//! limits, and carries reliable inter-agent messages through per-agent
//! mailboxes with leases, bounded retries, dead-lettering and optional
//! auto-dispatch of idle recipients.
//!
//! The crate is the kernel only: the LLM provider, the per-agent
//! conversation engine and the tool layer are external collaborators,
//! consumed through the traits in [`agent`].
//!
//! ## Quick tour
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use switchboard::{AgentProfile, Kernel, KernelConfig, SendMessageRequest};
//!
//! let kernel = Kernel::builder(KernelConfig::default(), my_agent_factory).build()?;
//! kernel.register_agent(AgentProfile::new(coder_id, "coder", prompt, provider));
//!
//! // Route and run.
//! let (decision, handle) = kernel.route_and_execute(&request, "fix the build")?;
//!
//! // Reliable inter-agent mail.
//! kernel.send_message(SendMessageRequest::new(planner_id, coder_id, payload))?;
//! ```
//!
//! ## Architecture
//!
//! - [`event_bus`] — multi-subscriber pub/sub with filters and full replay
//! - [`state_store`] — authoritative in-memory state; the mailbox engine
//! - [`policy`] — budget and messaging policy, model resolution
//! - [`router`] — sticky + binding + semantic routing
//! - [`agent_runtime`] — drives one run of an external agent engine
//! - [`kernel`] — the public façade and the auto-dispatch loop
//! - [`messaging_tools`] — mailbox operations as in-loop agent tools

pub mod agent;
pub mod agent_runtime;
pub mod config;
pub mod domain_types;
pub mod error;
pub mod event_bus;
pub mod events;
pub mod kernel;
pub mod messaging_tools;
pub mod policy;
pub mod router;
pub mod state_store;
pub mod time_provider;

pub use agent::{
    AgentBuildContext, AgentCapabilities, AgentFactory, AgentLimits, AgentMessage, AgentProfile,
    AgentRunOutcome, AgentRunStatus, AgentTool, LoopBoundaryHook, ManagedAgent, MessageBody,
    Provider, ToolRegistry,
};
pub use agent_runtime::{ExecuteSpec, RunHandle, RunStreamItem, RunStreamListener};
pub use config::{
    AutoDispatchConfig, BudgetConfig, InjectionConfig, KernelConfig, MessageRuntimeConfig,
    MessagingPolicyConfig, MessagingRule, SemanticRoutingConfig,
};
pub use domain_types::{
    AgentId, BindingId, IdempotencyKey, MaxDeliveryAttempts, MessageId, PartitionKey, RouteBinding,
    RunDepth, RunId, RunRecord, RunStatus, SessionId, StickyKey, TopicName,
};
pub use error::KernelError;
pub use event_bus::{EventBus, EventListener, SubscriptionId};
pub use events::{EventFilter, EventType, RuntimeEvent};
pub use kernel::{
    DispatchTrigger, ExecuteRequest, Kernel, KernelStats, NackOptions, ReceiveOptions,
    RequeueOptions, RunGraphNode, SendMessageRequest, SpawnRequest,
};
pub use policy::{PolicyDecision, PolicyEngine};
pub use router::{RouteDecision, RouteReason, RouteRequest, Router};
pub use state_store::StateStore;
pub use state_store::mailbox::{
    DrainReport, MailboxMessage, MailboxStats, MessageStatus, NackOutcome,
};
pub use time_provider::{
    ManualTimeProvider, RealTimeProvider, SharedTimeProvider, TimeProvider,
    manual_time_provider, production_time_provider,
};
