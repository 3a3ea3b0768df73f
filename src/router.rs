//! Request routing: sticky sessions, bindings, semantic scoring
//!
//! Routing resolves an inbound request to an agent id in four stages:
//! sticky session, semantic scoring (when enabled and the request carries an
//! intent), binding match, then the configured default agent. Every
//! non-sticky decision pins the request's sticky key so the same caller
//! lands on the same agent next time.

use crate::config::SemanticRoutingConfig;
use crate::domain_types::{AgentId, BindingId, RouteBinding, StickyKey};
use crate::error::KernelError;
use crate::state_store::StateStore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;

/// Metadata keys probed for a semantic query when `intent` is absent
const QUERY_METADATA_KEYS: [&str; 6] = [
    "semanticQuery",
    "query",
    "task",
    "objective",
    "message",
    "input",
];

/// An inbound request to be routed to an agent
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RouteRequest {
    /// Originating channel ("slack", "http", ...)
    pub channel: Option<String>,
    /// Originating account within the channel
    pub account: Option<String>,
    /// Conversation thread within the account
    pub thread_id: Option<String>,
    /// Free-text description of what the caller wants
    pub intent: Option<String>,
    /// Explicit sticky key override
    pub sticky_key: Option<StickyKey>,
    /// Caller-supplied annotations; may carry the semantic query
    pub metadata: serde_json::Map<String, Value>,
}

impl RouteRequest {
    /// A request with only an intent set.
    #[must_use]
    pub fn with_intent(intent: impl Into<String>) -> Self {
        Self {
            intent: Some(intent.into()),
            ..Self::default()
        }
    }

    /// The sticky key of this request: the explicit override or the
    /// composed `channel:account:threadId` default.
    #[must_use]
    pub fn sticky_key(&self) -> StickyKey {
        self.sticky_key.clone().unwrap_or_else(|| {
            StickyKey::compose(
                self.channel.as_deref(),
                self.account.as_deref(),
                self.thread_id.as_deref(),
            )
        })
    }

    /// The text semantic scoring runs against, if any.
    #[must_use]
    pub fn semantic_query(&self) -> Option<String> {
        if let Some(intent) = &self.intent
            && !intent.trim().is_empty()
        {
            return Some(intent.clone());
        }
        for key in QUERY_METADATA_KEYS {
            if let Some(Value::String(text)) = self.metadata.get(key)
                && !text.trim().is_empty()
            {
                return Some(text.clone());
            }
        }
        None
    }
}

/// Which stage produced a routing decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteReason {
    /// A sticky pin existed for the request's key
    Sticky,
    /// A binding matched the request's selectors
    Binding,
    /// Semantic scoring selected the agent
    Semantic,
    /// Nothing matched; the configured default agent took it
    DefaultAgent,
}

/// A routing decision with its provenance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteDecision {
    /// The selected agent
    pub agent_id: AgentId,
    /// Which stage selected it
    pub reason: RouteReason,
    /// Sticky key the decision was (or is now) pinned under
    pub sticky_key: StickyKey,
    /// The binding that matched, for binding decisions
    pub binding_id: Option<BindingId>,
    /// The winning normalized score, for semantic decisions
    pub semantic_score: Option<f64>,
}

/// Sticky + binding + semantic router
pub struct Router {
    store: Arc<StateStore>,
    semantic: SemanticRoutingConfig,
    default_agent: Option<AgentId>,
}

impl Router {
    /// Creates a router over `store`.
    #[must_use]
    pub fn new(
        store: Arc<StateStore>,
        semantic: SemanticRoutingConfig,
        default_agent: Option<AgentId>,
    ) -> Self {
        Self {
            store,
            semantic,
            default_agent,
        }
    }

    /// Routes a request to an agent.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::NoRouteMatched`] when no sticky pin, binding,
    /// semantic hit or default agent applies.
    pub fn route(&self, request: &RouteRequest) -> Result<RouteDecision, KernelError> {
        let sticky_key = request.sticky_key();

        if let Some(agent_id) = self.store.sticky_for(&sticky_key) {
            return Ok(RouteDecision {
                agent_id,
                reason: RouteReason::Sticky,
                sticky_key,
                binding_id: None,
                semantic_score: None,
            });
        }

        let matched = self.matched_bindings(request);

        if self.semantic.enabled
            && let Some(query) = request.semantic_query()
            && let Some((agent_id, score)) = self.best_semantic_match(&query, &matched)
        {
            return Ok(self.pin(RouteDecision {
                agent_id,
                reason: RouteReason::Semantic,
                sticky_key,
                binding_id: None,
                semantic_score: Some(score),
            }));
        }

        if let Some(binding) = matched.first() {
            return Ok(self.pin(RouteDecision {
                agent_id: binding.agent_id.clone(),
                reason: RouteReason::Binding,
                sticky_key,
                binding_id: Some(binding.binding_id.clone()),
                semantic_score: None,
            }));
        }

        if let Some(agent_id) = &self.default_agent {
            return Ok(self.pin(RouteDecision {
                agent_id: agent_id.clone(),
                reason: RouteReason::DefaultAgent,
                sticky_key,
                binding_id: None,
                semantic_score: None,
            }));
        }

        Err(KernelError::NoRouteMatched {
            reason: "no sticky entry, binding, semantic hit or default agent".to_string(),
        })
    }

    fn pin(&self, decision: RouteDecision) -> RouteDecision {
        self.store
            .set_sticky(decision.sticky_key.clone(), decision.agent_id.clone());
        decision
    }

    /// Enabled bindings whose selectors all match the request, by ascending
    /// priority.
    fn matched_bindings(&self, request: &RouteRequest) -> Vec<RouteBinding> {
        self.store
            .list_bindings()
            .into_iter()
            .filter(|binding| binding_matches(binding, request))
            .collect()
    }

    /// The highest-scoring candidate at or above the minimum score.
    ///
    /// Candidates are the matched bindings' agents when `prefer_bindings` is
    /// set and any matched, otherwise every registered agent. Ties keep the
    /// earlier candidate.
    fn best_semantic_match(
        &self,
        query: &str,
        matched: &[RouteBinding],
    ) -> Option<(AgentId, f64)> {
        let candidates: Vec<AgentId> = if self.semantic.prefer_bindings && !matched.is_empty() {
            let mut seen = HashSet::new();
            matched
                .iter()
                .map(|binding| binding.agent_id.clone())
                .filter(|id| seen.insert(id.clone()))
                .collect()
        } else {
            self.store
                .list_agents()
                .into_iter()
                .map(|profile| profile.agent_id)
                .collect()
        };

        let query_lower = query.to_lowercase();
        let query_tokens = tokenize(&query_lower);
        let bindings = self.store.list_bindings();

        let mut best: Option<(AgentId, f64)> = None;
        for agent_id in candidates {
            let keywords = self.keyword_set(&agent_id, &bindings);
            let mut raw = 0.0;
            for keyword in &keywords {
                if query_lower.contains(keyword.as_str()) {
                    raw += self.semantic.substring_weight;
                } else if query_tokens.contains(keyword.as_str()) {
                    raw += self.semantic.token_weight;
                }
            }

            #[allow(clippy::cast_precision_loss)]
            let normalized = raw / keywords.len().max(1) as f64;
            #[allow(clippy::cast_precision_loss)]
            let penalty =
                self.semantic.load_penalty_per_run * self.store.active_runs_for(&agent_id) as f64;
            let score = (normalized - penalty).max(0.0);

            let better = best.as_ref().is_none_or(|(_, top)| score > *top);
            if better {
                best = Some((agent_id, score));
            }
        }

        best.filter(|(_, score)| *score >= self.semantic.min_score)
    }

    /// Lowercased keywords describing one agent: its id, role, binding
    /// selectors and capabilities.
    fn keyword_set(&self, agent_id: &AgentId, bindings: &[RouteBinding]) -> HashSet<String> {
        let mut keywords = HashSet::new();
        let mut add = |text: &str| {
            let lowered = text.trim().to_lowercase();
            if !lowered.is_empty() {
                keywords.insert(lowered);
            }
        };

        add(agent_id.as_str());
        if let Some(profile) = self.store.profile(agent_id) {
            add(&profile.role);
            for keyword in &profile.capabilities.keywords {
                add(keyword);
            }
            for domain in &profile.capabilities.domains {
                add(domain);
            }
            for tool in &profile.capabilities.tools {
                add(tool);
            }
            if let Some(summary) = &profile.capabilities.summary {
                add(summary);
            }
        }
        for binding in bindings {
            if binding.agent_id == *agent_id {
                if let Some(channel) = &binding.channel {
                    add(channel);
                }
                if let Some(account) = &binding.account {
                    add(account);
                }
                if let Some(prefix) = &binding.thread_prefix {
                    add(prefix);
                }
            }
        }
        keywords
    }
}

fn binding_matches(binding: &RouteBinding, request: &RouteRequest) -> bool {
    if !binding.enabled {
        return false;
    }
    if let Some(channel) = &binding.channel
        && request.channel.as_deref() != Some(channel.as_str())
    {
        return false;
    }
    if let Some(account) = &binding.account
        && request.account.as_deref() != Some(account.as_str())
    {
        return false;
    }
    if let Some(prefix) = &binding.thread_prefix {
        let Some(thread_id) = request.thread_id.as_deref() else {
            return false;
        };
        if !thread_id.starts_with(prefix.as_str()) {
            return false;
        }
    }
    true
}

/// Splits `text` into lowercase tokens on runs of characters that are
/// neither alphanumeric nor CJK.
fn tokenize(text: &str) -> HashSet<String> {
    text.split(|c: char| !is_token_char(c))
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect()
}

fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || is_cjk(c)
}

// Han (plus extension A and compatibility), kana and hangul ranges.
fn is_cjk(c: char) -> bool {
    matches!(
        c as u32,
        0x3400..=0x4DBF | 0x4E00..=0x9FFF | 0xF900..=0xFAFF | 0x3040..=0x30FF | 0xAC00..=0xD7AF
    )
}
