//! Interfaces of the external collaborators the kernel drives
//!
//! The kernel does not implement an LLM provider or a conversation engine;
//! it consumes them through the traits in this module. Implementations live
//! outside this crate (or in test doubles). The [`AgentProfile`] is the
//! kernel-owned description of one registered agent, created on registration
//! and mutated only by re-registration.

use crate::domain_types::{AgentId, SessionId};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

/// Role of a conversation message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Primes or constrains assistant behaviour
    System,
    /// End-user (or synthetic user) input
    User,
    /// Model output
    Assistant,
    /// Result of a tool invocation
    Tool,
}

/// One part of a multimodal message body
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContentPart {
    /// Plain text
    Text {
        /// The text content
        text: String,
    },
    /// Non-text content the kernel passes through untouched
    Data {
        /// Provider-specific payload
        data: Value,
    },
}

/// Body of a conversation message: plain text or multimodal parts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageBody {
    /// A plain string body
    Text(String),
    /// A multimodal array of parts
    Parts(Vec<ContentPart>),
}

impl MessageBody {
    /// Flattens the body to text, concatenating the text parts of a
    /// multimodal array and skipping everything else.
    #[must_use]
    pub fn to_text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::Data { .. } => None,
                })
                .collect(),
        }
    }
}

/// A message flowing through an agent's conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessage {
    /// Who authored the message
    pub role: Role,
    /// The message body
    pub body: MessageBody,
}

impl AgentMessage {
    /// Creates an assistant text message.
    #[must_use]
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            body: MessageBody::Text(text.into()),
        }
    }

    /// Creates a user text message.
    #[must_use]
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            body: MessageBody::Text(text.into()),
        }
    }
}

/// An incremental piece of a streaming provider response
#[derive(Debug, Clone)]
pub struct ProviderChunk {
    /// The content delta carried by this chunk
    pub delta: String,
    /// Provider-specific completion status, set on the final chunk
    pub finish_reason: Option<String>,
}

/// Result of one provider generation call
pub enum ProviderOutput {
    /// The full response at once
    Complete(AgentMessage),
    /// A stream of chunks the engine consumes incrementally
    Stream(BoxStream<'static, Result<ProviderChunk, ProviderError>>),
}

/// Options forwarded to the provider on each generation call
#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    /// Model override resolved by policy, if any
    pub model: Option<String>,
    /// Upper bound on generated tokens
    pub max_tokens: Option<u32>,
    /// Whether extended thinking is requested
    pub thinking: bool,
}

/// Errors raised by a provider
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The provider could not be reached
    #[error("provider transport error: {0}")]
    Transport(String),
    /// The provider rejected the request
    #[error("provider rejected request: {0}")]
    Rejected(String),
}

/// An LLM provider the kernel hands to agent engines
#[async_trait]
pub trait Provider: Send + Sync {
    /// Generates a response (or response stream) for the given conversation.
    async fn generate(
        &self,
        messages: Vec<AgentMessage>,
        options: GenerateOptions,
    ) -> Result<ProviderOutput, ProviderError>;
}

/// Terminal status of one agent execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRunStatus {
    /// The loop finished with a final message
    Completed,
    /// The loop was stopped by an abort request
    Aborted,
    /// The loop ended without a usable result
    Failed,
}

/// What one agent execution produced
#[derive(Debug, Clone)]
pub struct AgentRunOutcome {
    /// How the execution ended
    pub status: AgentRunStatus,
    /// The final assistant message when completed
    pub final_message: Option<AgentMessage>,
    /// Failure description when failed
    pub failure: Option<String>,
    /// Session the engine used (new or resumed)
    pub session_id: SessionId,
    /// LLM turns consumed
    pub loop_count: u32,
    /// Provider retries consumed
    pub retry_count: u32,
}

/// Errors raised by an agent engine
#[derive(Debug, Error)]
pub enum AgentError {
    /// The engine could not be constructed from the profile
    #[error("agent construction failed: {0}")]
    Construction(String),
    /// The engine failed in a way it could not record as an outcome
    #[error("agent execution error: {0}")]
    Execution(String),
}

/// Callback through which a running agent streams messages to the runtime
pub type StreamCallback = Arc<dyn Fn(AgentMessage) + Send + Sync>;

/// Hook the runtime hands to an agent engine; the engine polls it once per
/// loop boundary, before composing the next LLM request.
///
/// A returned block must be appended to the conversation as a synthetic user
/// turn. `None` means there is nothing to inject. Implementations never
/// propagate errors into the agent loop.
#[async_trait]
pub trait LoopBoundaryHook: Send + Sync {
    /// Returns the synthetic user turn to append, if any.
    async fn next_injection(&self) -> Option<String>;
}

/// A constructed, runnable agent instance (the external conversation engine)
#[async_trait]
pub trait ManagedAgent: Send + Sync {
    /// Runs the agent loop to completion on `input`.
    ///
    /// # Errors
    ///
    /// Returns `AgentError` only for failures the engine could not fold into
    /// an [`AgentRunOutcome`]; ordinary failures come back as
    /// [`AgentRunStatus::Failed`].
    async fn execute_with_result(&self, input: String) -> Result<AgentRunOutcome, AgentError>;

    /// Requests the current loop stop at the next opportunity.
    async fn abort(&self);

    /// Releases engine resources. Best effort; called exactly once.
    async fn close(&self);

    /// The session this instance is bound to, once known.
    fn session_id(&self) -> Option<SessionId>;
}

/// Everything the factory needs to construct an agent instance for one run
pub struct AgentBuildContext {
    /// The registered profile being executed
    pub profile: AgentProfile,
    /// Model name resolved by policy, if overridden
    pub resolved_model: Option<String>,
    /// Session to resume, from the per-agent session map or the profile
    pub previous_session_id: Option<SessionId>,
    /// Receives every message the agent emits while running
    pub stream: StreamCallback,
    /// Polled at each loop boundary for synthetic user turns
    pub loop_boundary: Arc<dyn LoopBoundaryHook>,
}

/// Builds agent instances from profiles; implemented by the embedding
/// application (or test doubles).
#[async_trait]
pub trait AgentFactory: Send + Sync {
    /// Constructs an agent instance for one run.
    async fn create_agent(
        &self,
        context: AgentBuildContext,
    ) -> Result<Arc<dyn ManagedAgent>, AgentError>;
}

/// Context available to a tool invocation
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// Session of the agent loop invoking the tool
    pub session_id: SessionId,
}

/// Errors raised by tool invocations
#[derive(Debug, Error)]
pub enum ToolError {
    /// The invocation context carried a session the kernel has never seen
    #[error("unknown session: {0}")]
    UnknownSession(SessionId),
    /// The tool input did not deserialize
    #[error("invalid tool input: {0}")]
    InvalidInput(String),
    /// The underlying operation failed
    #[error("tool execution failed: {0}")]
    Execution(String),
}

/// A tool callable from inside an agent loop
#[async_trait]
pub trait AgentTool: Send + Sync {
    /// Stable tool name agents call it by
    fn name(&self) -> &str;

    /// One-line description surfaced to the model
    fn description(&self) -> &str;

    /// Runs the tool.
    async fn invoke(&self, context: &ToolContext, input: Value) -> Result<Value, ToolError>;
}

/// Registry of tools exposed to one agent
pub trait ToolRegistry: Send + Sync {
    /// Whether a tool with this name is already registered
    fn has_tool(&self, name: &str) -> bool;

    /// Adds tools to the registry
    fn register(&self, tools: Vec<Arc<dyn AgentTool>>);
}

/// Optional per-agent memory lifecycle hooks
#[async_trait]
pub trait MemoryManager: Send + Sync {
    /// Prepares memory before the first run.
    async fn initialize(&self) -> Result<(), AgentError>;

    /// Flushes and releases memory resources.
    async fn close(&self) -> Result<(), AgentError>;
}

/// Per-agent execution limits forwarded to the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentLimits {
    /// Provider retries per run
    pub max_retries: u32,
    /// LLM turns per run
    pub max_loops: u32,
    /// Wall-clock budget per run, if any
    pub timeout_ms: Option<u64>,
}

impl Default for AgentLimits {
    fn default() -> Self {
        Self {
            max_retries: 2,
            max_loops: 50,
            timeout_ms: None,
        }
    }
}

/// What an agent is good at, consumed by semantic routing
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentCapabilities {
    /// Free-form matching keywords
    pub keywords: Vec<String>,
    /// Domains of expertise
    pub domains: Vec<String>,
    /// Tool names the agent is fluent with
    pub tools: Vec<String>,
    /// One-line summary
    pub summary: Option<String>,
}

/// The kernel's record of one registered agent
#[derive(Clone)]
pub struct AgentProfile {
    /// Unique agent id
    pub agent_id: AgentId,
    /// Short role description ("coder", "reviewer", ...)
    pub role: String,
    /// System prompt handed to the engine
    pub system_prompt: String,
    /// Provider the engine generates with
    pub provider: Arc<dyn Provider>,
    /// Tool registry the agent's loop draws from, if any
    pub tools: Option<Arc<dyn ToolRegistry>>,
    /// Memory hooks, if any
    pub memory: Option<Arc<dyn MemoryManager>>,
    /// Session to resume on the next run, if known
    pub session_id: Option<SessionId>,
    /// Execution limits
    pub limits: AgentLimits,
    /// Whether extended thinking is requested
    pub thinking: bool,
    /// Whether the agent runs in plan mode
    pub plan_mode: bool,
    /// Routing capabilities
    pub capabilities: AgentCapabilities,
    /// Caller-supplied annotations
    pub metadata: serde_json::Map<String, Value>,
}

impl AgentProfile {
    /// Creates a profile with defaults for everything but identity, prompt
    /// and provider.
    #[must_use]
    pub fn new(
        agent_id: AgentId,
        role: impl Into<String>,
        system_prompt: impl Into<String>,
        provider: Arc<dyn Provider>,
    ) -> Self {
        Self {
            agent_id,
            role: role.into(),
            system_prompt: system_prompt.into(),
            provider,
            tools: None,
            memory: None,
            session_id: None,
            limits: AgentLimits::default(),
            thinking: false,
            plan_mode: false,
            capabilities: AgentCapabilities::default(),
            metadata: serde_json::Map::new(),
        }
    }

    /// Sets the tool registry.
    #[must_use]
    pub fn with_tools(mut self, tools: Arc<dyn ToolRegistry>) -> Self {
        self.tools = Some(tools);
        self
    }

    /// Sets the routing capabilities.
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: AgentCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }
}

impl std::fmt::Debug for AgentProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentProfile")
            .field("agent_id", &self.agent_id)
            .field("role", &self.role)
            .field("session_id", &self.session_id)
            .field("thinking", &self.thinking)
            .field("plan_mode", &self.plan_mode)
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}
