//! Compression gate: per-tier-pair token budgets on agent handoffs.
//!
//! Decision policy on `ratio = measured / budget`:
//!
//! ```text
//! ratio ≤ 1.0                 → Accept
//! 1.0 < ratio ≤ soft (1.25)   → AutoRoute (minor overage)
//! soft < ratio ≤ hard (2.0)   → AutoRoute (major overage)
//! ratio > hard                → Reject
//! ```
//!
//! The soft threshold only changes how an overage is reported; the hard
//! threshold is the sole rejection trigger. An auto-routed payload is
//! compressed and re-evaluated exactly once.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{CompressionConfig, ConfigError};
use crate::invoke::{
    invoke_with_timeout, AgentResponse, InvocationError, InvocationRequest, SharedInvoker,
};
use crate::oracle::{EstimateConfidence, TokenBudgetOracle};
use crate::tier::Tier;

/// What to do with a handoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateAction {
    Accept,
    AutoRoute,
    Reject,
}

impl std::fmt::Display for GateAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Accept => write!(f, "accept"),
            Self::AutoRoute => write!(f, "auto_route"),
            Self::Reject => write!(f, "reject"),
        }
    }
}

/// Immutable verdict for one handoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateDecision {
    pub action: GateAction,
    pub measured_tokens: u32,
    pub budget: u32,
    pub ratio: f64,
    pub reason: String,
    pub source: Tier,
    pub target: Tier,
    pub estimate_confidence: EstimateConfidence,
}

impl GateDecision {
    pub fn is_accept(&self) -> bool {
        self.action == GateAction::Accept
    }
}

/// Static (source tier, target tier) → token budget table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetMatrix {
    entries: HashMap<(Tier, Tier), u32>,
    default_budget: u32,
}

impl BudgetMatrix {
    /// Empty matrix; every lookup returns `default_budget`.
    pub fn empty(default_budget: u32) -> Self {
        Self {
            entries: HashMap::new(),
            default_budget: default_budget.max(1),
        }
    }

    /// Built-in matrix merged with config overrides.
    pub fn from_config(config: &CompressionConfig) -> Result<Self, ConfigError> {
        let mut matrix = Self::default();
        matrix.default_budget = config.default_budget.max(1);
        for entry in &config.budgets {
            let source: Tier = entry
                .source
                .parse()
                .map_err(|_| ConfigError::InvalidTier(entry.source.clone()))?;
            let target: Tier = entry
                .target
                .parse()
                .map_err(|_| ConfigError::InvalidTier(entry.target.clone()))?;
            matrix.set(source, target, entry.tokens);
        }
        Ok(matrix)
    }

    /// Insert or replace a budget.
    pub fn set(&mut self, source: Tier, target: Tier, tokens: u32) {
        self.entries.insert((source, target), tokens.max(1));
    }

    /// Budget for a handoff.
    ///
    /// Lookup order: exact pair, then the pair with the orchestrator folded
    /// into the opus-class strategic tier, then the default budget.
    pub fn budget_for(&self, source: Tier, target: Tier) -> u32 {
        self.lookup(source, target).unwrap_or(self.default_budget)
    }

    /// Whether the pair resolves without the default budget.
    pub fn has_entry(&self, source: Tier, target: Tier) -> bool {
        self.lookup(source, target).is_some()
    }

    pub fn default_budget(&self) -> u32 {
        self.default_budget
    }

    fn lookup(&self, source: Tier, target: Tier) -> Option<u32> {
        if let Some(tokens) = self.entries.get(&(source, target)) {
            return Some(*tokens);
        }
        let fold = |t: Tier| {
            if t == Tier::Orchestrator {
                Tier::Strategic
            } else {
                t
            }
        };
        self.entries.get(&(fold(source), fold(target))).copied()
    }
}

impl Default for BudgetMatrix {
    fn default() -> Self {
        let mut matrix = Self::empty(1000);
        matrix.set(Tier::Execution, Tier::Strategic, 300);
        matrix.set(Tier::Execution, Tier::Analytical, 500);
        matrix.set(Tier::Analytical, Tier::Strategic, 1000);
        matrix.set(Tier::Analytical, Tier::Analytical, 1500);
        // Plans fanned out to execution workers and final critique reports.
        matrix.set(Tier::Strategic, Tier::Execution, 2000);
        matrix.set(Tier::Strategic, Tier::Strategic, 1500);
        matrix
    }
}

/// Shrinks an over-budget payload. Production wiring uses [`AgentCompressor`].
#[async_trait]
pub trait Compressor: Send + Sync {
    async fn compress(
        &self,
        payload: &str,
        target_tokens: u32,
    ) -> Result<AgentResponse, InvocationError>;

    /// Model billed for compression calls.
    fn model(&self) -> &str {
        ""
    }
}

/// Compressor backed by a cheap summarisation agent.
pub struct AgentCompressor {
    invoker: SharedInvoker,
    model: String,
    timeout: std::time::Duration,
}

impl AgentCompressor {
    pub fn new(invoker: SharedInvoker, model: impl Into<String>, timeout: std::time::Duration) -> Self {
        Self {
            invoker,
            model: model.into(),
            timeout,
        }
    }
}

#[async_trait]
impl Compressor for AgentCompressor {
    async fn compress(
        &self,
        payload: &str,
        target_tokens: u32,
    ) -> Result<AgentResponse, InvocationError> {
        let request = InvocationRequest::new(
            "compressor",
            self.model.clone(),
            format!(
                "Compress the following handoff to at most {target_tokens} tokens. \
                 Keep every field, identifier, finding and number; drop repetition \
                 and prose. Output only the compressed handoff.\n\n{payload}"
            ),
        )
        .with_temperature(0.0);
        invoke_with_timeout(self.invoker.as_ref(), request, self.timeout).await
    }

    fn model(&self) -> &str {
        &self.model
    }
}

/// Result of gating a handoff including the single auto-route attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionOutcome {
    /// Decision that determines whether the handoff proceeds.
    pub decision: GateDecision,
    /// Decision on the original payload.
    pub initial: GateDecision,
    /// Payload to forward (compressed when auto-routing succeeded).
    pub payload: String,
    pub compressed: bool,
    /// `(tokens_in, tokens_out)` of the compressor call, if one was made.
    pub compressor_tokens: Option<(u32, u32)>,
}

/// Enforces the budget matrix on handoffs.
pub struct CompressionGate {
    matrix: BudgetMatrix,
    soft_threshold: f64,
    hard_threshold: f64,
    oracle: Arc<dyn TokenBudgetOracle>,
}

impl CompressionGate {
    pub fn new(
        matrix: BudgetMatrix,
        soft_threshold: f64,
        hard_threshold: f64,
        oracle: Arc<dyn TokenBudgetOracle>,
    ) -> Self {
        Self {
            matrix,
            soft_threshold,
            hard_threshold,
            oracle,
        }
    }

    pub fn from_config(
        config: &CompressionConfig,
        oracle: Arc<dyn TokenBudgetOracle>,
    ) -> Result<Self, ConfigError> {
        Ok(Self::new(
            BudgetMatrix::from_config(config)?,
            config.soft_threshold,
            config.hard_threshold,
            oracle,
        ))
    }

    pub fn matrix(&self) -> &BudgetMatrix {
        &self.matrix
    }

    /// Measure `payload` with the oracle and decide.
    pub fn evaluate(&self, payload: &str, source: Tier, target: Tier) -> GateDecision {
        let estimate = self.oracle.estimate_tokens(payload);
        let mut decision = self.decide(estimate.count, source, target);
        decision.estimate_confidence = estimate.confidence;
        decision
    }

    /// Decide on an already-measured token count.
    pub fn decide(&self, measured_tokens: u32, source: Tier, target: Tier) -> GateDecision {
        let budget = self.matrix.budget_for(source, target);
        let ratio = measured_tokens as f64 / budget as f64;

        let (action, reason) = if ratio <= 1.0 {
            (
                GateAction::Accept,
                format!(
                    "{measured_tokens} tokens within the {budget}-token budget for {source}→{target}"
                ),
            )
        } else if ratio <= self.hard_threshold {
            let severity = if ratio <= self.soft_threshold {
                "minor"
            } else {
                "major"
            };
            (
                GateAction::AutoRoute,
                format!(
                    "{measured_tokens} tokens exceed the {budget}-token budget for {source}→{target} \
                     by {:.0}% ({severity} overage); routing to compressor",
                    (ratio - 1.0) * 100.0
                ),
            )
        } else {
            (
                GateAction::Reject,
                format!(
                    "{measured_tokens} tokens exceed the {budget}-token budget for {source}→{target} \
                     by {} tokens ({ratio:.2}x, hard limit {:.2}x); reduce output to at most {budget} tokens",
                    measured_tokens - budget,
                    self.hard_threshold
                ),
            )
        };

        debug!(
            %source, %target, measured_tokens, budget, ratio, %action,
            "Compression gate decision"
        );

        GateDecision {
            action,
            measured_tokens,
            budget,
            ratio,
            reason,
            source,
            target,
            estimate_confidence: EstimateConfidence::Exact,
        }
    }

    /// Gate a handoff, compressing and re-evaluating at most once.
    ///
    /// A compressed payload that still is not within budget is rejected so
    /// compression can never loop.
    pub async fn evaluate_with_compression(
        &self,
        payload: &str,
        source: Tier,
        target: Tier,
        compressor: &dyn Compressor,
    ) -> CompressionOutcome {
        let initial = self.evaluate(payload, source, target);
        if initial.action != GateAction::AutoRoute {
            return CompressionOutcome {
                decision: initial.clone(),
                initial,
                payload: payload.to_string(),
                compressed: false,
                compressor_tokens: None,
            };
        }

        info!(
            %source, %target,
            measured = initial.measured_tokens,
            budget = initial.budget,
            "Auto-routing handoff to compressor"
        );

        match compressor.compress(payload, initial.budget).await {
            Ok(response) => {
                let compressed = response.text;
                let mut second = self.evaluate(&compressed, source, target);
                if second.action != GateAction::Accept {
                    second.action = GateAction::Reject;
                    second.reason = format!(
                        "still over budget after compression: {} tokens for a {}-token budget ({:.2}x)",
                        second.measured_tokens, second.budget, second.ratio
                    );
                    warn!(%source, %target, ratio = second.ratio, "Compression retry exhausted");
                }
                CompressionOutcome {
                    decision: second,
                    initial,
                    payload: compressed,
                    compressed: true,
                    compressor_tokens: Some((response.tokens_in, response.tokens_out)),
                }
            }
            Err(e) => {
                warn!(%source, %target, "Compressor failed: {e}");
                let mut rejected = initial.clone();
                rejected.action = GateAction::Reject;
                rejected.reason = format!("{}; compression failed: {e}", initial.reason);
                CompressionOutcome {
                    decision: rejected,
                    initial,
                    payload: payload.to_string(),
                    compressed: false,
                    compressor_tokens: None,
                }
            }
        }
    }
}
