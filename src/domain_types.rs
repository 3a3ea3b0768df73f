//! Domain types for the orchestration kernel
//!
//! This module defines strongly-typed domain values to prevent primitive
//! obsession and improve type safety throughout the codebase.

use nutype::nutype;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::SystemTime;
use uuid::Uuid;

/// Unique identifier for an agent.
///
/// Agent ids are caller-chosen, human-readable names such as `"coder"` or
/// `"security-reviewer"`. They are trimmed and must be non-empty.
#[nutype(
    sanitize(trim),
    validate(len_char_min = 1, len_char_max = 128),
    derive(
        Clone,
        Debug,
        Eq,
        PartialEq,
        Hash,
        Display,
        Serialize,
        Deserialize,
        TryFrom,
        Into,
        AsRef
    )
)]
pub struct AgentId(String);

impl AgentId {
    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.as_ref()
    }
}

/// Unique identifier for a run
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct RunId(Uuid);

impl RunId {
    /// Creates a new random run ID
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Unique identifier for an inter-agent message
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct MessageId(Uuid);

impl MessageId {
    /// Creates a new random message ID
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Unique identifier for a runtime event
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct EventId(Uuid);

impl EventId {
    /// Creates a new random event ID
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Identifier of a conversation session chosen by the agent engine.
///
/// The kernel treats session ids as opaque: it records the id an agent
/// reports after a run and hands it back on the next run of the same agent
/// so the engine can resume the conversation.
#[nutype(
    validate(len_char_min = 1, len_char_max = 256),
    derive(
        Clone,
        Debug,
        Eq,
        PartialEq,
        Hash,
        Display,
        Serialize,
        Deserialize,
        TryFrom,
        Into,
        AsRef
    )
)]
pub struct SessionId(String);

impl SessionId {
    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.as_ref()
    }
}

/// Unique identifier for a route binding
#[nutype(
    sanitize(trim),
    validate(len_char_min = 1, len_char_max = 128),
    derive(
        Clone,
        Debug,
        Eq,
        PartialEq,
        Hash,
        Display,
        Serialize,
        Deserialize,
        TryFrom,
        Into
    )
)]
pub struct BindingId(String);

/// Topic of an inter-agent message
#[nutype(
    sanitize(trim),
    validate(len_char_min = 1, len_char_max = 128),
    derive(
        Clone,
        Debug,
        Eq,
        PartialEq,
        Hash,
        Display,
        Serialize,
        Deserialize,
        TryFrom,
        Into,
        AsRef
    )
)]
pub struct TopicName(String);

impl TopicName {
    /// Returns the topic as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.as_ref()
    }
}

/// Logical channel within a recipient's mailbox.
///
/// Ordering and at-most-one-in-flight are enforced per partition key.
#[nutype(
    validate(len_char_min = 1, len_char_max = 256),
    derive(
        Clone,
        Debug,
        Eq,
        PartialEq,
        Hash,
        Display,
        Serialize,
        Deserialize,
        TryFrom,
        Into,
        AsRef
    )
)]
pub struct PartitionKey(String);

/// Partition key used when a message carries neither an explicit key nor a
/// topic.
pub const DEFAULT_PARTITION: &str = "__default__";

impl PartitionKey {
    /// The partition used for messages without an explicit key or topic.
    #[must_use]
    pub fn default_partition() -> Self {
        Self::try_new(DEFAULT_PARTITION).expect("default partition key is valid")
    }

    /// Returns the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.as_ref()
    }
}

/// Sender-chosen key that collapses duplicate sends within the dedup window
#[nutype(
    validate(len_char_min = 1, len_char_max = 256),
    derive(
        Clone,
        Debug,
        Eq,
        PartialEq,
        Hash,
        Display,
        Serialize,
        Deserialize,
        TryFrom,
        Into
    )
)]
pub struct IdempotencyKey(String);

/// Caller-identifying key that pins a session to the agent that handled its
/// first routed request.
#[nutype(
    validate(len_char_min = 1, len_char_max = 512),
    derive(
        Clone,
        Debug,
        Eq,
        PartialEq,
        Hash,
        Display,
        Serialize,
        Deserialize,
        TryFrom,
        Into,
        AsRef
    )
)]
pub struct StickyKey(String);

impl StickyKey {
    /// Builds the default sticky key `channel:account:threadId`, substituting
    /// `*` for any missing or empty part.
    #[must_use]
    pub fn compose(channel: Option<&str>, account: Option<&str>, thread_id: Option<&str>) -> Self {
        fn part(v: Option<&str>) -> &str {
            v.filter(|s| !s.is_empty()).unwrap_or("*")
        }
        Self::try_new(format!(
            "{}:{}:{}",
            part(channel),
            part(account),
            part(thread_id)
        ))
        .expect("composed sticky key is non-empty")
    }

    /// Returns the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.as_ref()
    }
}

/// Monotonically increasing sequence number within one mailbox partition
#[nutype(
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        Serialize,
        Deserialize,
        Display,
        Default,
        From,
        Into
    ),
    default = 0
)]
pub struct PartitionSeq(u64);

impl PartitionSeq {
    /// The first sequence number of a partition
    #[must_use]
    pub fn zero() -> Self {
        Self::default()
    }

    /// Returns the next sequence number
    #[must_use]
    pub fn next(self) -> Self {
        Self::new(self.into_inner().saturating_add(1))
    }
}

/// Number of delivery attempts a message has consumed
#[nutype(
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        From,
        Into
    ),
    default = 0
)]
pub struct AttemptCount(u32);

impl AttemptCount {
    /// Zero attempts (the state of a freshly enqueued message)
    #[must_use]
    pub fn zero() -> Self {
        Self::default()
    }

    /// Returns the count incremented by one
    #[must_use]
    pub fn increment(self) -> Self {
        Self::new(self.into_inner().saturating_add(1))
    }

    /// Gets the value as u32
    #[must_use]
    pub fn as_u32(&self) -> u32 {
        self.into_inner()
    }

    /// Whether this count has reached or exceeded the delivery budget
    #[must_use]
    pub fn exhausted(&self, max: MaxDeliveryAttempts) -> bool {
        self.into_inner() >= max.as_u32()
    }
}

/// Maximum delivery attempts before a message is dead-lettered
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 100),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 3
)]
pub struct MaxDeliveryAttempts(u32);

impl MaxDeliveryAttempts {
    /// Gets the value as u32
    #[must_use]
    pub fn as_u32(&self) -> u32 {
        self.into_inner()
    }
}

/// Nesting depth of a run in the spawn tree (0 for top-level runs)
#[nutype(
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        From,
        Into
    ),
    default = 0
)]
pub struct RunDepth(u32);

impl RunDepth {
    /// Depth of a top-level run
    #[must_use]
    pub fn root() -> Self {
        Self::default()
    }

    /// Depth of a run spawned under this one
    #[must_use]
    pub fn child(self) -> Self {
        Self::new(self.into_inner().saturating_add(1))
    }

    /// Gets the value as u32
    #[must_use]
    pub fn as_u32(&self) -> u32 {
        self.into_inner()
    }
}

/// Route binding priority; lower values are matched earlier
#[nutype(
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        From,
        Into
    ),
    default = 0
)]
pub struct BindingPriority(i32);

/// Lifecycle status of a run.
///
/// Transitions form the DAG `queued → running → {completed|failed|aborted}`.
/// `Cancelled` is reserved for callers outside this kernel and is never
/// produced here. Terminal statuses are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Persisted, not yet started
    Queued,
    /// The agent loop is executing
    Running,
    /// Finished with a final message
    Completed,
    /// Finished with an error
    Failed,
    /// Stopped by an abort request
    Aborted,
    /// Reserved; never produced by the kernel
    Cancelled,
}

impl RunStatus {
    /// Whether this status is terminal
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Aborted | Self::Cancelled
        )
    }

    /// Whether the run still counts against the concurrency budget
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }

    /// Whether a transition from `self` to `next` is allowed
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Running)
                | (
                    Self::Queued | Self::Running,
                    Self::Completed | Self::Failed | Self::Aborted
                )
        )
    }
}

/// Authoritative record of one agent run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    /// Unique id of this run
    pub run_id: RunId,
    /// The agent being executed
    pub agent_id: AgentId,
    /// The run that requested this one, if any
    pub parent_run_id: Option<RunId>,
    /// Nesting depth in the spawn tree
    pub depth: RunDepth,
    /// Current lifecycle status
    pub status: RunStatus,
    /// The input handed to the agent
    pub input: String,
    /// Final output text once completed
    pub output: Option<String>,
    /// Error text once failed
    pub error: Option<String>,
    /// Session the agent engine chose for this run
    pub session_id: Option<SessionId>,
    /// When the run was queued
    pub created_at: SystemTime,
    /// When the agent loop started
    pub started_at: Option<SystemTime>,
    /// When the run reached a terminal status
    pub finished_at: Option<SystemTime>,
    /// Caller-supplied annotations
    pub metadata: serde_json::Map<String, Value>,
}

impl RunRecord {
    /// Creates a queued record for a new run.
    #[must_use]
    pub fn queued(
        run_id: RunId,
        agent_id: AgentId,
        parent_run_id: Option<RunId>,
        depth: RunDepth,
        input: String,
        created_at: SystemTime,
        metadata: serde_json::Map<String, Value>,
    ) -> Self {
        Self {
            run_id,
            agent_id,
            parent_run_id,
            depth,
            status: RunStatus::Queued,
            input,
            output: None,
            error: None,
            session_id: None,
            created_at,
            started_at: None,
            finished_at: None,
            metadata,
        }
    }

    /// Whether the run has reached a terminal status
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// A configured rule mapping request attributes to a specific agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteBinding {
    /// Unique id of the binding
    pub binding_id: BindingId,
    /// Agent that matched requests are routed to
    pub agent_id: AgentId,
    /// Match order; lower is earlier
    pub priority: BindingPriority,
    /// Disabled bindings never match
    pub enabled: bool,
    /// Required request channel, if set
    pub channel: Option<String>,
    /// Required request account, if set
    pub account: Option<String>,
    /// Required prefix of the request's thread id, if set
    pub thread_prefix: Option<String>,
    /// Caller-supplied annotations
    pub metadata: serde_json::Map<String, Value>,
}

impl RouteBinding {
    /// Creates an enabled binding with no selectors and default priority.
    #[must_use]
    pub fn new(binding_id: BindingId, agent_id: AgentId) -> Self {
        Self {
            binding_id,
            agent_id,
            priority: BindingPriority::default(),
            enabled: true,
            channel: None,
            account: None,
            thread_prefix: None,
            metadata: serde_json::Map::new(),
        }
    }

    /// Sets the match priority.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = BindingPriority::new(priority);
        self
    }

    /// Restricts the binding to one channel.
    #[must_use]
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    /// Restricts the binding to one account.
    #[must_use]
    pub fn with_account(mut self, account: impl Into<String>) -> Self {
        self.account = Some(account.into());
        self
    }

    /// Restricts the binding to thread ids starting with `prefix`.
    #[must_use]
    pub fn with_thread_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_prefix = Some(prefix.into());
        self
    }
}
