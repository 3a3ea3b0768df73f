//! Routing behavior: sticky precedence, binding matching, semantic scoring
//! with load penalty, and fallbacks.

mod common;

use common::{ScriptedFactory, agent, profile, test_kernel};
use approx::assert_relative_eq;
use std::sync::Arc;
use switchboard::agent::AgentCapabilities;
use switchboard::{
    BindingId, KernelConfig, KernelError, RouteBinding, RouteReason, RouteRequest, Router,
    RunDepth, RunId, RunRecord, StateStore, StickyKey,
};

fn binding(id: &str, agent_id: &str) -> RouteBinding {
    RouteBinding::new(BindingId::try_new(id).unwrap(), agent(agent_id))
}

fn capable_profile(id: &str, keywords: &[&str]) -> switchboard::AgentProfile {
    profile(id).with_capabilities(AgentCapabilities {
        keywords: keywords.iter().map(|k| (*k).to_string()).collect(),
        ..AgentCapabilities::default()
    })
}

#[test_log::test(tokio::test)]
async fn sticky_wins_over_everything_once_set() {
    let (kernel, _time) = test_kernel(KernelConfig::testing(), ScriptedFactory::new());
    kernel.register_agent(profile("first"));
    kernel.register_agent(profile("second"));
    kernel.add_binding(binding("b1", "first").with_channel("slack"));

    let request = RouteRequest {
        channel: Some("slack".to_string()),
        account: Some("acct".to_string()),
        thread_id: Some("T-1".to_string()),
        ..RouteRequest::default()
    };

    let first = kernel.route(&request).unwrap();
    assert_eq!(first.agent_id, agent("first"));
    assert_eq!(first.reason, RouteReason::Binding);

    // Swap the binding target; the sticky pin must still win.
    assert!(kernel.remove_binding(&BindingId::try_new("b1").unwrap()));
    kernel.add_binding(binding("b2", "second").with_channel("slack"));

    for _ in 0..3 {
        let decision = kernel.route(&request).unwrap();
        assert_eq!(decision.agent_id, agent("first"));
        assert_eq!(decision.reason, RouteReason::Sticky);
        assert_eq!(decision.sticky_key.as_str(), "slack:acct:T-1");
    }

    // Clearing the pin lets the new binding take over.
    assert!(kernel.clear_sticky_route(&StickyKey::compose(
        Some("slack"),
        Some("acct"),
        Some("T-1")
    )));
    let rerouted = kernel.route(&request).unwrap();
    assert_eq!(rerouted.agent_id, agent("second"));
    assert_eq!(rerouted.reason, RouteReason::Binding);
}

#[test_log::test(tokio::test)]
async fn bindings_match_by_priority_and_selectors() {
    let (kernel, _time) = test_kernel(KernelConfig::testing(), ScriptedFactory::new());
    kernel.register_agent(profile("low"));
    kernel.register_agent(profile("high"));
    kernel.register_agent(profile("other"));

    kernel.add_binding(binding("b-low", "low").with_channel("slack").with_priority(10));
    kernel.add_binding(binding("b-high", "high").with_channel("slack").with_priority(1));
    kernel.add_binding(
        binding("b-thread", "other")
            .with_channel("slack")
            .with_thread_prefix("OPS-")
            .with_priority(0),
    );

    // Without the OPS- prefix, the priority-1 binding wins.
    let decision = kernel
        .route(&RouteRequest {
            channel: Some("slack".to_string()),
            thread_id: Some("T-9".to_string()),
            ..RouteRequest::default()
        })
        .unwrap();
    assert_eq!(decision.agent_id, agent("high"));
    assert_eq!(decision.binding_id, Some(BindingId::try_new("b-high").unwrap()));

    // With it, the prefix binding at priority 0 wins.
    let decision = kernel
        .route(&RouteRequest {
            channel: Some("slack".to_string()),
            thread_id: Some("OPS-17".to_string()),
            ..RouteRequest::default()
        })
        .unwrap();
    assert_eq!(decision.agent_id, agent("other"));
}

#[test_log::test(tokio::test)]
async fn semantic_routing_selects_the_capability_match() {
    // S6: Chinese-language intent matched against capability keywords.
    let mut config = KernelConfig::testing();
    config.semantic_routing.enabled = true;
    let (kernel, _time) = test_kernel(config, ScriptedFactory::new());

    kernel.register_agent(capable_profile("controller", &["协调", "分解"]));
    kernel.register_agent(capable_profile(
        "security-reviewer",
        &["安全", "漏洞", "审计", "风控"],
    ));

    let decision = kernel
        .route(&RouteRequest::with_intent(
            "请对支付模块做安全漏洞审计和风控评估",
        ))
        .unwrap();

    assert_eq!(decision.agent_id, agent("security-reviewer"));
    assert_eq!(decision.reason, RouteReason::Semantic);
    assert!(decision.semantic_score.unwrap() > 0.0);
}

#[test_log::test(tokio::test)]
async fn semantic_score_normalizes_over_the_keyword_set() {
    let store = Arc::new(StateStore::new());
    store.upsert_profile(capable_profile("dense", &["billing", "ledger"]));

    let mut semantic = KernelConfig::default().semantic_routing;
    semantic.enabled = true;
    let router = Router::new(Arc::clone(&store), semantic, None);

    let decision = router
        .route(&RouteRequest::with_intent("fix the billing ledger export"))
        .unwrap();
    assert_eq!(decision.reason, RouteReason::Semantic);
    // Keywords: id, role ("worker"), "billing", "ledger" → 2 substring hits
    // out of 4 keywords.
    assert_relative_eq!(decision.semantic_score.unwrap(), 0.5, epsilon = 1e-9);
}

#[test_log::test(tokio::test)]
async fn load_penalty_reorders_equally_capable_agents() {
    // Property 7: the returned agent maximizes score minus load penalty.
    let store = Arc::new(StateStore::new());
    store.upsert_profile(capable_profile("busy", &["deploy"]));
    store.upsert_profile(capable_profile("idle", &["deploy"]));

    // Give "busy" two active runs: 2 × 0.05 penalty.
    for _ in 0..2 {
        store.insert_run(RunRecord::queued(
            RunId::generate(),
            agent("busy"),
            None,
            RunDepth::root(),
            String::new(),
            std::time::SystemTime::now(),
            serde_json::Map::new(),
        ));
    }

    let mut semantic = KernelConfig::default().semantic_routing;
    semantic.enabled = true;
    let router = Router::new(Arc::clone(&store), semantic, None);

    let decision = router
        .route(&RouteRequest::with_intent("deploy the api"))
        .unwrap();
    assert_eq!(decision.agent_id, agent("idle"));
    assert_eq!(decision.reason, RouteReason::Semantic);
}

#[test_log::test(tokio::test)]
async fn semantic_prefers_binding_candidates_when_configured() {
    let store = Arc::new(StateStore::new());
    store.upsert_profile(capable_profile("bound", &["reviews"]));
    store.upsert_profile(capable_profile("unbound", &["reviews", "audits"]));
    store.add_binding(binding("b", "bound").with_channel("slack"));

    let mut semantic = KernelConfig::default().semantic_routing;
    semantic.enabled = true;
    let router = Router::new(Arc::clone(&store), semantic, None);

    // The unbound agent would score at least as well, but the matched
    // binding narrows the candidate pool.
    let decision = router
        .route(&RouteRequest {
            channel: Some("slack".to_string()),
            intent: Some("handle the reviews backlog".to_string()),
            ..RouteRequest::default()
        })
        .unwrap();
    assert_eq!(decision.agent_id, agent("bound"));
}

#[test_log::test(tokio::test)]
async fn below_min_score_falls_back_to_bindings_then_default() {
    let mut config = KernelConfig::testing();
    config.semantic_routing.enabled = true;
    config.default_agent = Some(agent("fallback"));
    let (kernel, _time) = test_kernel(config, ScriptedFactory::new());

    kernel.register_agent(profile("fallback"));
    kernel.register_agent(capable_profile("specialist", &["kubernetes"]));

    // No keyword overlap: semantic declines, no bindings, default takes it.
    let decision = kernel
        .route(&RouteRequest::with_intent("weather report please"))
        .unwrap();
    assert_eq!(decision.agent_id, agent("fallback"));
    assert_eq!(decision.reason, RouteReason::DefaultAgent);
}

#[test_log::test(tokio::test)]
async fn no_route_is_an_error_not_a_panic() {
    let (kernel, _time) = test_kernel(KernelConfig::testing(), ScriptedFactory::new());
    let error = kernel.route(&RouteRequest::default()).unwrap_err();
    assert!(matches!(error, KernelError::NoRouteMatched { .. }));
}

#[test_log::test(tokio::test)]
async fn non_sticky_decisions_pin_the_sticky_key() {
    let mut config = KernelConfig::testing();
    config.default_agent = Some(agent("d"));
    let (kernel, _time) = test_kernel(config, ScriptedFactory::new());
    kernel.register_agent(profile("d"));

    let request = RouteRequest {
        channel: Some("web".to_string()),
        ..RouteRequest::default()
    };
    let first = kernel.route(&request).unwrap();
    assert_eq!(first.reason, RouteReason::DefaultAgent);

    let second = kernel.route(&request).unwrap();
    assert_eq!(second.reason, RouteReason::Sticky);
    assert_eq!(second.agent_id, agent("d"));
    assert_eq!(
        kernel.sticky_route_for(&StickyKey::compose(Some("web"), None, None)),
        Some(agent("d"))
    );
}
