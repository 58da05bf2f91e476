//! Gate and breaker property tests
//!
//! Checks the boundary behaviour of the compression gate, the monotonic
//! properties of the cost circuit breaker, and the panel size bands over the
//! full risk metadata space.

use std::sync::Arc;

use tiergate_coordination::gates::{
    BlastRadius, Domain, Impact, PanelSizeSelector, Reversibility, TaskMetadata,
};
use tiergate_coordination::{
    BreakerState, CompressionGate, CostCircuitBreaker, EstimateConfidence, GateAction, GateError,
    PipelineConfig, PricingTable, Tier, TieredTokenOracle, TripCause,
};

/// Gate measuring with the char-ratio counter only (4 chars per token).
fn char_ratio_gate(config: &PipelineConfig) -> CompressionGate {
    let oracle = Arc::new(TieredTokenOracle::new(Vec::new(), PricingTable::default()));
    CompressionGate::from_config(&config.compression, oracle).unwrap()
}

fn tokens(n: usize) -> String {
    "abcd".repeat(n)
}

/// Test: execution → strategic handoffs hit the accept / auto-route / reject bands
#[test]
fn test_compression_bands_execution_to_strategic() {
    let gate = char_ratio_gate(&PipelineConfig::default());

    let at_budget = gate.evaluate(&tokens(300), Tier::Execution, Tier::Strategic);
    assert_eq!(at_budget.budget, 300);
    assert_eq!(at_budget.action, GateAction::Accept);

    let over = gate.evaluate(&tokens(400), Tier::Execution, Tier::Strategic);
    assert_eq!(over.action, GateAction::AutoRoute);
    assert!(over.reason.contains("major"));

    let at_hard_limit = gate.evaluate(&tokens(600), Tier::Execution, Tier::Strategic);
    assert_eq!(at_hard_limit.action, GateAction::AutoRoute);

    let far_over = gate.evaluate(&tokens(700), Tier::Execution, Tier::Strategic);
    assert_eq!(far_over.action, GateAction::Reject);
    assert!(far_over.reason.contains("at most 300 tokens"));
}

/// Test: the default oracle chain cannot be bypassed with unspaced payloads
#[test]
fn test_default_oracle_rejects_unspaced_payload() {
    let config = PipelineConfig::default();
    let oracle = Arc::new(TieredTokenOracle::from_config(
        &config.oracle,
        config.pricing.clone(),
    ));
    let gate = CompressionGate::from_config(&config.compression, oracle).unwrap();

    let blob = "x".repeat(4000);
    let decision = gate.evaluate(&blob, Tier::Execution, Tier::Strategic);
    assert_eq!(decision.measured_tokens, 1000);
    assert_eq!(decision.estimate_confidence, EstimateConfidence::Fallback);
    assert_eq!(decision.action, GateAction::Reject);

    let minified = format!("{{\"data\":\"{}\"}}", "QUJD".repeat(700));
    assert_eq!(
        gate.evaluate(&minified, Tier::Execution, Tier::Strategic).action,
        GateAction::Reject
    );
}

/// Test: the gate's action never improves as the payload grows
#[test]
fn test_compression_action_is_monotonic_in_size() {
    let gate = char_ratio_gate(&PipelineConfig::default());
    let rank = |a: GateAction| match a {
        GateAction::Accept => 0,
        GateAction::AutoRoute => 1,
        GateAction::Reject => 2,
    };

    for (source, target) in [
        (Tier::Execution, Tier::Analytical),
        (Tier::Analytical, Tier::Strategic),
        (Tier::Strategic, Tier::Orchestrator),
    ] {
        let mut last = 0;
        for n in (0..=4000).step_by(50) {
            let decision = gate.decide(n, source, target);
            let r = rank(decision.action);
            assert!(r >= last, "{source}→{target} at {n} tokens went from {last} to {r}");
            last = r;
        }
        assert_eq!(last, 2, "{source}→{target} never rejected");
    }
}

/// Test: TOML budget overrides replace the built-in matrix entry
#[test]
fn test_config_overrides_budget_matrix() {
    let config = PipelineConfig::from_toml_str(
        r#"
        [compression]
        hard_threshold = 1.5

        [[compression.budgets]]
        source = "haiku"
        target = "opus"
        tokens = 100
        "#,
    )
    .unwrap();
    config.validate().unwrap();

    let gate = char_ratio_gate(&config);
    assert_eq!(gate.matrix().budget_for(Tier::Execution, Tier::Strategic), 100);
    assert_eq!(
        gate.evaluate(&tokens(140), Tier::Execution, Tier::Strategic).action,
        GateAction::AutoRoute
    );
    assert_eq!(
        gate.evaluate(&tokens(160), Tier::Execution, Tier::Strategic).action,
        GateAction::Reject
    );
    // Untouched pairs keep their defaults.
    assert_eq!(gate.matrix().budget_for(Tier::Execution, Tier::Analytical), 500);
}

/// Test: once open, the breaker refuses everything and cumulative cost only grows
#[test]
fn test_breaker_never_untrips() {
    let mut breaker = CostCircuitBreaker::new(1.0);
    let mut last = 0.0;
    let mut tripped = false;

    for i in 0..40 {
        let amount = 0.01 * (i % 7) as f64;
        let allowed = breaker.allow(amount);
        if tripped {
            assert!(!allowed, "breaker reopened at step {i}");
        }
        if allowed {
            breaker.record_spend(format!("charge-{i}"), amount).unwrap();
        }
        assert!(breaker.cumulative() >= last);
        assert!(breaker.cumulative() <= breaker.limit());
        last = breaker.cumulative();
        tripped |= breaker.state() == BreakerState::Open;
    }

    assert!(tripped);
    assert!(!breaker.allow(0.0));
    assert_eq!(
        breaker.trip_details().unwrap().cause,
        TripCause::EstimateExceedsBudget
    );
}

/// Test: a repeated charge id is refused and does not move the total
#[test]
fn test_breaker_charges_are_idempotent() {
    let mut breaker = CostCircuitBreaker::new(1.0);
    breaker.record_spend("research-1#1", 0.2).unwrap();
    assert!(breaker.record_spend("research-1#1", 0.2).is_err());
    assert!((breaker.cumulative() - 0.2).abs() < 1e-12);
    assert_eq!(breaker.snapshot().charges, 1);

    // Actual spend may overshoot an estimate; the breaker trips on record.
    assert_eq!(
        breaker.record_spend("research-1#2", 0.9).unwrap(),
        BreakerState::Open
    );
    assert_eq!(
        breaker.trip_details().unwrap().cause,
        TripCause::SpendExceededBudget
    );
}

fn all_metadata() -> Vec<TaskMetadata> {
    let mut out = Vec::new();
    for r in [
        Reversibility::Reversible,
        Reversibility::Easy,
        Reversibility::Moderate,
        Reversibility::Difficult,
        Reversibility::Irreversible,
    ] {
        for b in [
            BlastRadius::Internal,
            BlastRadius::Team,
            BlastRadius::Organization,
            BlastRadius::External,
        ] {
            for d in [Domain::Business, Domain::Software, Domain::Hardware, Domain::Mixed] {
                for i in [
                    Impact::Low,
                    Impact::Moderate,
                    Impact::High,
                    Impact::Severe,
                    Impact::Critical,
                ] {
                    out.push(TaskMetadata::new(r, b, d, i));
                }
            }
        }
    }
    out
}

/// Test: every risk profile lands in an odd panel band that grows with the score
#[test]
fn test_panel_size_bands_cover_metadata_space() {
    let selector = PanelSizeSelector::default();
    let mut selections: Vec<_> = all_metadata()
        .iter()
        .map(|m| selector.select_panel(m))
        .collect();
    assert_eq!(selections.len(), 400);

    for s in &selections {
        assert!([3, 5, 7].contains(&s.size), "size {} for score {}", s.size, s.score);
        assert_eq!(s.score, s.breakdown.total());
        let expected = match s.score {
            0..=3 => 3,
            4..=7 => 5,
            _ => 7,
        };
        assert_eq!(s.size, expected);
        assert!(!s.justification.is_empty());
    }

    selections.sort_by_key(|s| s.score);
    assert!(selections.windows(2).all(|w| w[0].size <= w[1].size));
    assert_eq!(selections.first().unwrap().score, 1);
    assert_eq!(selections.last().unwrap().size, 7);
}

/// Test: overrides may only grow the panel, up to the roster
#[test]
fn test_panel_override_direction() {
    let selector = PanelSizeSelector::default();
    let high = TaskMetadata::new(
        Reversibility::Irreversible,
        BlastRadius::External,
        Domain::Mixed,
        Impact::Critical,
    );

    assert!(matches!(
        selector.select_with_override(&high, Some(5)),
        Err(GateError::PanelSizeDowngradeRejected { requested: 5, computed: 7 })
    ));
    let same = selector.select_with_override(&high, Some(7)).unwrap();
    assert!(!same.overridden);

    let raised = selector
        .select_with_override(&TaskMetadata::low_risk(), Some(5))
        .unwrap();
    assert_eq!((raised.size, raised.computed_size), (5, 3));
    assert!(raised.overridden);
    assert!(selector
        .select_with_override(&TaskMetadata::low_risk(), Some(8))
        .is_err());
}
