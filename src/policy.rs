//! Budget and messaging policy
//!
//! Three pure predicates plus a model hook. Denials carry the reason string
//! so callers can surface actionable errors; nothing here throws.

use crate::config::{BudgetConfig, MessagingPolicyConfig};
use crate::domain_types::{AgentId, RunDepth, RunId, TopicName};
use crate::error::KernelError;
use crate::state_store::StateStore;
use std::sync::Arc;

/// Outcome of a policy check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyDecision {
    /// Whether the operation may proceed
    pub allowed: bool,
    /// Why it may not, when denied
    pub reason: Option<String>,
}

impl PolicyDecision {
    /// An allowing decision.
    #[must_use]
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    /// A denying decision with a reason.
    #[must_use]
    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }

    /// Converts a denial into [`KernelError::PolicyDenied`].
    ///
    /// # Errors
    ///
    /// Returns `PolicyDenied` carrying the decision's reason when denied.
    pub fn into_result(self) -> Result<(), KernelError> {
        if self.allowed {
            Ok(())
        } else {
            Err(KernelError::PolicyDenied {
                reason: self
                    .reason
                    .unwrap_or_else(|| "denied by policy".to_string()),
            })
        }
    }
}

/// Inputs to [`PolicyEngine::can_execute`]
#[derive(Debug, Clone)]
pub struct ExecuteCheck {
    /// Agent about to run
    pub agent_id: AgentId,
    /// Requesting parent run, if any
    pub parent_run_id: Option<RunId>,
    /// Depth the new run would have
    pub depth: RunDepth,
}

/// Inputs to [`PolicyEngine::can_spawn`]
#[derive(Debug, Clone)]
pub struct SpawnCheck {
    /// Agent requesting the spawn
    pub controller_agent_id: AgentId,
    /// Run the child would be recorded under
    pub parent_run_id: RunId,
}

/// Inputs to [`PolicyEngine::can_message`]
#[derive(Debug, Clone)]
pub struct MessageCheck {
    /// Sending agent
    pub from: AgentId,
    /// Receiving agent
    pub to: AgentId,
    /// Topic of the message, if any
    pub topic: Option<TopicName>,
}

/// Budget, messaging allow/deny, and model resolution
pub struct PolicyEngine {
    budget: BudgetConfig,
    messaging: MessagingPolicyConfig,
    store: Arc<StateStore>,
}

impl PolicyEngine {
    /// Creates an engine reading live counts from `store`.
    #[must_use]
    pub fn new(
        budget: BudgetConfig,
        messaging: MessagingPolicyConfig,
        store: Arc<StateStore>,
    ) -> Self {
        Self {
            budget,
            messaging,
            store,
        }
    }

    /// Whether a new run may be scheduled.
    ///
    /// Denies when the run would exceed the depth budget or when the number
    /// of active (queued or running) runs has reached the concurrency budget.
    #[must_use]
    pub fn can_execute(&self, check: &ExecuteCheck) -> PolicyDecision {
        if check.depth.as_u32() > self.budget.max_depth {
            return PolicyDecision::deny(format!(
                "run depth {} exceeds max depth {} for agent {}",
                check.depth,
                self.budget.max_depth,
                check.agent_id
            ));
        }
        let active = self.store.active_run_count();
        if active >= self.budget.max_concurrent_runs {
            return PolicyDecision::deny(format!(
                "{active} active runs reached the max of {}",
                self.budget.max_concurrent_runs
            ));
        }
        PolicyDecision::allow()
    }

    /// Whether a controller may spawn another child under `parent_run_id`.
    #[must_use]
    pub fn can_spawn(&self, check: &SpawnCheck) -> PolicyDecision {
        let children = self.store.spawned_children(check.parent_run_id);
        if children >= self.budget.max_children_per_run {
            return PolicyDecision::deny(format!(
                "run {} already spawned {children} children (max {})",
                check.parent_run_id, self.budget.max_children_per_run
            ));
        }
        PolicyDecision::allow()
    }

    /// Whether a message may be sent.
    ///
    /// Applies, in order: blocked rules, the allowed-topics set (which makes
    /// a topic mandatory when configured), then allowed rules.
    #[must_use]
    pub fn can_message(&self, check: &MessageCheck) -> PolicyDecision {
        for rule in &self.messaging.blocked_rules {
            if rule.matches(&check.from, &check.to) {
                return PolicyDecision::deny(format!(
                    "messaging from {} to {} is blocked",
                    check.from, check.to
                ));
            }
        }

        if let Some(allowed_topics) = &self.messaging.allowed_topics {
            match &check.topic {
                None => {
                    return PolicyDecision::deny(
                        "a topic is required by the messaging policy".to_string(),
                    );
                }
                Some(topic) if !allowed_topics.contains(topic.as_str()) => {
                    return PolicyDecision::deny(format!("topic {topic} is not allowed"));
                }
                Some(_) => {}
            }
        }

        if let Some(allowed_rules) = &self.messaging.allowed_rules {
            let permitted = allowed_rules
                .iter()
                .any(|rule| rule.matches(&check.from, &check.to));
            if !permitted {
                return PolicyDecision::deny(format!(
                    "no allow rule matches messaging from {} to {}",
                    check.from, check.to
                ));
            }
        }

        PolicyDecision::allow()
    }

    /// Resolves the effective model for a run. Default: the requested model
    /// passes through unchanged.
    #[must_use]
    pub fn resolve_model(
        &self,
        _agent_id: &AgentId,
        requested_model: Option<String>,
    ) -> Option<String> {
        requested_model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MessagingRule;
    use crate::domain_types::{RunRecord, RunStatus};
    use std::collections::HashSet;
    use std::time::SystemTime;

    fn agent(id: &str) -> AgentId {
        AgentId::try_new(id).unwrap()
    }

    fn engine_with(
        budget: BudgetConfig,
        messaging: MessagingPolicyConfig,
    ) -> (PolicyEngine, Arc<StateStore>) {
        let store = Arc::new(StateStore::new());
        (
            PolicyEngine::new(budget, messaging, Arc::clone(&store)),
            store,
        )
    }

    fn active_run(store: &StateStore, agent_id: &str) {
        store.insert_run(RunRecord::queued(
            crate::domain_types::RunId::generate(),
            agent(agent_id),
            None,
            RunDepth::root(),
            String::new(),
            SystemTime::now(),
            serde_json::Map::new(),
        ));
    }

    #[test]
    fn execute_denied_past_max_depth() {
        let (engine, _store) = engine_with(
            BudgetConfig {
                max_depth: 2,
                ..BudgetConfig::default()
            },
            MessagingPolicyConfig::default(),
        );

        let check = |depth: u32| ExecuteCheck {
            agent_id: agent("a"),
            parent_run_id: None,
            depth: RunDepth::new(depth),
        };
        assert!(engine.can_execute(&check(2)).allowed);
        let denied = engine.can_execute(&check(3));
        assert!(!denied.allowed);
        assert!(denied.reason.unwrap().contains("depth"));
    }

    #[test]
    fn execute_denied_at_concurrency_budget() {
        let (engine, store) = engine_with(
            BudgetConfig {
                max_concurrent_runs: 2,
                ..BudgetConfig::default()
            },
            MessagingPolicyConfig::default(),
        );
        active_run(&store, "a");
        active_run(&store, "b");

        let check = ExecuteCheck {
            agent_id: agent("c"),
            parent_run_id: None,
            depth: RunDepth::root(),
        };
        let denied = engine.can_execute(&check);
        assert!(!denied.allowed);

        // Finishing a run frees the budget.
        let run = store.list_runs().remove(0);
        store.update_run(run.run_id, |record| {
            record.status = RunStatus::Completed;
        });
        assert!(engine.can_execute(&check).allowed);
    }

    #[test]
    fn spawn_denied_at_children_budget() {
        let (engine, store) = engine_with(
            BudgetConfig {
                max_children_per_run: 1,
                ..BudgetConfig::default()
            },
            MessagingPolicyConfig::default(),
        );
        let parent = crate::domain_types::RunId::generate();
        let check = SpawnCheck {
            controller_agent_id: agent("ctl"),
            parent_run_id: parent,
        };

        assert!(engine.can_spawn(&check).allowed);
        store.record_spawn(parent);
        assert!(!engine.can_spawn(&check).allowed);
    }

    #[test]
    fn blocked_rules_win_over_everything() {
        let (engine, _store) = engine_with(
            BudgetConfig::default(),
            MessagingPolicyConfig {
                blocked_rules: vec![MessagingRule::new("*", "vault")],
                allowed_rules: Some(vec![MessagingRule::new("*", "*")]),
                allowed_topics: None,
            },
        );

        let denied = engine.can_message(&MessageCheck {
            from: agent("a"),
            to: agent("vault"),
            topic: None,
        });
        assert!(!denied.allowed);

        let allowed = engine.can_message(&MessageCheck {
            from: agent("a"),
            to: agent("b"),
            topic: None,
        });
        assert!(allowed.allowed);
    }

    #[test]
    fn allowed_topics_make_topics_mandatory() {
        let topics: HashSet<String> = ["reviews".to_string()].into_iter().collect();
        let (engine, _store) = engine_with(
            BudgetConfig::default(),
            MessagingPolicyConfig {
                allowed_topics: Some(topics),
                allowed_rules: None,
                blocked_rules: Vec::new(),
            },
        );

        let check = |topic: Option<&str>| MessageCheck {
            from: agent("a"),
            to: agent("b"),
            topic: topic.map(|t| TopicName::try_new(t).unwrap()),
        };
        assert!(!engine.can_message(&check(None)).allowed);
        assert!(!engine.can_message(&check(Some("gossip"))).allowed);
        assert!(engine.can_message(&check(Some("reviews"))).allowed);
    }

    #[test]
    fn allow_rules_deny_unmatched_pairs() {
        let (engine, _store) = engine_with(
            BudgetConfig::default(),
            MessagingPolicyConfig {
                allowed_rules: Some(vec![MessagingRule::new("planner", "*")]),
                allowed_topics: None,
                blocked_rules: Vec::new(),
            },
        );

        assert!(
            engine
                .can_message(&MessageCheck {
                    from: agent("planner"),
                    to: agent("b"),
                    topic: None,
                })
                .allowed
        );
        assert!(
            !engine
                .can_message(&MessageCheck {
                    from: agent("rogue"),
                    to: agent("b"),
                    topic: None,
                })
                .allowed
        );
    }

    #[test]
    fn resolve_model_is_identity_by_default() {
        let (engine, _store) =
            engine_with(BudgetConfig::default(), MessagingPolicyConfig::default());
        assert_eq!(
            engine.resolve_model(&agent("a"), Some("opus".to_string())),
            Some("opus".to_string())
        );
        assert_eq!(engine.resolve_model(&agent("a"), None), None);
    }
}
