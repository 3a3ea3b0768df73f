//! Kernel configuration
//!
//! Provides serde-derived configuration with validation and presets for
//! development and tests. Every knob the kernel consults is enumerated here;
//! components receive the sub-struct they care about.

use crate::domain_types::AgentId;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field holds an out-of-range or inconsistent value
    #[error("invalid configuration: {field} - {reason}")]
    ValidationError {
        /// Name of the offending field
        field: String,
        /// What was wrong with it
        reason: String,
    },
}

/// Budget limits on run scheduling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Maximum runs in the queued or running state at once
    pub max_concurrent_runs: usize,
    /// Maximum spawn-tree depth of a run
    pub max_depth: u32,
    /// Maximum children a single run may spawn
    pub max_children_per_run: usize,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs: 8,
            max_depth: 4,
            max_children_per_run: 16,
        }
    }
}

/// Mailbox delivery behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageRuntimeConfig {
    /// Delivery attempts before a message is dead-lettered
    pub max_attempts: u32,
    /// Default lease duration granted on receive
    pub receive_lease_ms: u64,
    /// Default redelivery delay after a nack
    pub nack_requeue_delay_ms: u64,
    /// How long an idempotency key collapses duplicate sends (0 disables)
    pub dedup_window_ms: u64,
    /// When true, all messages of one topic share a partition so they are
    /// delivered strictly in order; when false each send gets its own
    /// partition and sends never block one another
    pub enforce_topic_partition_order: bool,
}

impl Default for MessageRuntimeConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            receive_lease_ms: 60_000,
            nack_requeue_delay_ms: 5_000,
            dedup_window_ms: 60_000,
            enforce_topic_partition_order: true,
        }
    }
}

/// Loop-boundary message injection behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InjectionConfig {
    /// Whether pending mail is injected into running agent loops
    pub enabled: bool,
    /// Maximum messages leased per loop boundary
    pub receive_limit: usize,
    /// Lease duration for injected messages
    pub lease_ms: u64,
}

impl Default for InjectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            receive_limit: 10,
            lease_ms: 15_000,
        }
    }
}

/// Auto-dispatch loop behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoDispatchConfig {
    /// Whether inbound messages wake idle recipients
    pub enabled: bool,
    /// Quiet period before a trigger fires; later triggers for the same
    /// recipient supersede earlier ones within the window
    pub debounce_ms: u64,
    /// Receive limit suggested to the dispatched agent
    pub receive_limit: usize,
    /// Lease duration for the dispatched drain; defaults to
    /// [`MessageRuntimeConfig::receive_lease_ms`] when unset
    pub lease_ms: Option<u64>,
    /// When true, a recipient with an active run is left alone and the
    /// trigger is rescheduled
    pub skip_if_agent_running: bool,
}

impl Default for AutoDispatchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            debounce_ms: 250,
            receive_limit: 10,
            lease_ms: None,
            skip_if_agent_running: true,
        }
    }
}

/// Semantic routing behavior and tuning constants.
///
/// The weights reproduce the scoring the router has always used; they are
/// exposed here so deployments can tune them without a code change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SemanticRoutingConfig {
    /// Whether intent-based scoring participates in routing
    pub enabled: bool,
    /// Minimum normalized score for a semantic hit
    pub min_score: f64,
    /// Prefer agents with matched bindings as the candidate pool
    pub prefer_bindings: bool,
    /// Score contribution of a substring keyword match
    pub substring_weight: f64,
    /// Score contribution of a whole-token keyword match
    pub token_weight: f64,
    /// Score subtracted per active run of a candidate
    pub load_penalty_per_run: f64,
}

impl Default for SemanticRoutingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_score: 0.2,
            prefer_bindings: true,
            substring_weight: 1.0,
            token_weight: 0.6,
            load_penalty_per_run: 0.05,
        }
    }
}

/// One allow or block rule over sender/recipient pairs.
///
/// `*` matches any agent id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagingRule {
    /// Sender pattern (`*` or an exact agent id)
    pub from: String,
    /// Recipient pattern (`*` or an exact agent id)
    pub to: String,
}

impl MessagingRule {
    /// Creates a rule from sender and recipient patterns.
    #[must_use]
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }

    /// Whether this rule matches the given sender/recipient pair.
    #[must_use]
    pub fn matches(&self, from: &AgentId, to: &AgentId) -> bool {
        let hit = |pattern: &str, id: &AgentId| pattern == "*" || pattern == id.as_str();
        hit(&self.from, from) && hit(&self.to, to)
    }
}

/// Inter-agent messaging policy
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingPolicyConfig {
    /// When set, every message must carry a topic from this set
    pub allowed_topics: Option<HashSet<String>>,
    /// When set, a message must match at least one rule to pass
    pub allowed_rules: Option<Vec<MessagingRule>>,
    /// Rules that reject a message outright, checked first
    pub blocked_rules: Vec<MessagingRule>,
}

/// Complete kernel configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Run scheduling budgets
    pub budget: BudgetConfig,
    /// Mailbox delivery behavior
    pub message_runtime: MessageRuntimeConfig,
    /// Loop-boundary injection behavior
    pub injection: InjectionConfig,
    /// Auto-dispatch behavior
    pub auto_dispatch: AutoDispatchConfig,
    /// Semantic routing behavior
    pub semantic_routing: SemanticRoutingConfig,
    /// Messaging allow/deny policy
    pub messaging_policy: MessagingPolicyConfig,
    /// Agent that receives requests nothing else claims
    pub default_agent: Option<AgentId>,
}

impl KernelConfig {
    /// A configuration tuned for local development: short leases and delays
    /// so feedback loops stay tight.
    #[must_use]
    pub fn development() -> Self {
        Self {
            message_runtime: MessageRuntimeConfig {
                receive_lease_ms: 10_000,
                nack_requeue_delay_ms: 1_000,
                dedup_window_ms: 10_000,
                ..MessageRuntimeConfig::default()
            },
            ..Self::default()
        }
    }

    /// A configuration for tests: everything immediate, injection on.
    #[must_use]
    pub fn testing() -> Self {
        Self {
            message_runtime: MessageRuntimeConfig {
                receive_lease_ms: 1_000,
                nack_requeue_delay_ms: 0,
                dedup_window_ms: 60_000,
                ..MessageRuntimeConfig::default()
            },
            auto_dispatch: AutoDispatchConfig {
                debounce_ms: 10,
                ..AutoDispatchConfig::default()
            },
            ..Self::default()
        }
    }

    /// Validates the configuration for consistency and reasonable values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` naming the first offending
    /// field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.budget.max_concurrent_runs == 0 {
            return Err(ConfigError::ValidationError {
                field: "budget.max_concurrent_runs".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.message_runtime.max_attempts == 0 {
            return Err(ConfigError::ValidationError {
                field: "message_runtime.max_attempts".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.message_runtime.receive_lease_ms == 0 {
            return Err(ConfigError::ValidationError {
                field: "message_runtime.receive_lease_ms".to_string(),
                reason: "must be at least 1ms".to_string(),
            });
        }
        if self.injection.enabled && self.injection.receive_limit == 0 {
            return Err(ConfigError::ValidationError {
                field: "injection.receive_limit".to_string(),
                reason: "must be at least 1 when injection is enabled".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.semantic_routing.min_score) {
            return Err(ConfigError::ValidationError {
                field: "semantic_routing.min_score".to_string(),
                reason: "must be within [0, 1]".to_string(),
            });
        }
        if self.semantic_routing.load_penalty_per_run < 0.0 {
            return Err(ConfigError::ValidationError {
                field: "semantic_routing.load_penalty_per_run".to_string(),
                reason: "must not be negative".to_string(),
            });
        }
        Ok(())
    }
}
