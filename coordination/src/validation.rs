//! Validation layer stack applied at every tier boundary.
//!
//! Layers run in order and the first non-passing layer decides:
//!
//! ```text
//! compression ──▶ synthesis input ──▶ judge panel
//!   (all)          (into analytical)    (into orchestrator, or risk metadata set)
//! ```
//!
//! Layers may rewrite the handoff (compression replaces the payload,
//! synthesis updates the loop counters) and record usage that the engine
//! charges to the workflow budget.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::{ConfigError, PipelineConfig};
use crate::error::FailureKind;
use crate::gates::compression::{AgentCompressor, Compressor};
use crate::gates::{
    CompressionGate, GateAction, PanelSizeSelector, SynthesisInputValidator,
    SynthesisValidationState, TaskMetadata, ValidationAction,
};
use crate::invoke::SharedInvoker;
use crate::oracle::TokenBudgetOracle;
use crate::panel::{EscalationReason, JudgePanel, PanelOutcome};
use crate::tier::Tier;

/// A payload crossing a tier boundary, plus what the layers learn about it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Handoff {
    pub workflow_id: String,
    pub task_id: String,
    pub source: Tier,
    pub target: Tier,
    pub payload: String,
    /// Loop counters carried between synthesis-input passes.
    pub synthesis_state: SynthesisValidationState,
    /// Risk metadata; its presence puts the handoff in front of the panel.
    pub metadata: Option<TaskMetadata>,
    /// Requested panel size (upward only).
    pub panel_override: Option<usize>,
    /// Fields documented as missing when synthesis input is waved through.
    pub gaps: Vec<String>,
    /// Paid calls made by layers.
    pub usage: Vec<LayerUsage>,
    /// Per-layer results in evaluation order.
    pub reports: Vec<LayerReport>,
}

impl Handoff {
    pub fn new(
        workflow_id: impl Into<String>,
        task_id: impl Into<String>,
        source: Tier,
        target: Tier,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            task_id: task_id.into(),
            source,
            target,
            payload: payload.into(),
            synthesis_state: SynthesisValidationState::default(),
            metadata: None,
            panel_override: None,
            gaps: Vec::new(),
            usage: Vec::new(),
            reports: Vec::new(),
        }
    }

    pub fn with_synthesis_state(mut self, state: SynthesisValidationState) -> Self {
        self.synthesis_state = state;
        self
    }

    pub fn with_metadata(mut self, metadata: Option<TaskMetadata>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_panel_override(mut self, size: Option<usize>) -> Self {
        self.panel_override = size;
        self
    }
}

/// Tokens consumed by a layer's own model calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerUsage {
    pub layer: String,
    pub agent: String,
    pub model: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
}

/// One layer's recorded result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerReport {
    pub layer: String,
    pub passed: bool,
    pub detail: Value,
}

/// A single layer's verdict.
#[derive(Debug, Clone, PartialEq)]
pub enum LayerVerdict {
    Pass,
    Reject {
        reason: String,
        kind: FailureKind,
    },
    Escalate {
        reason: EscalationReason,
        detail: String,
        snapshot: Value,
        suspend: bool,
    },
}

/// Outcome of the whole stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StackOutcome {
    Accept {
        payload: String,
    },
    Reject {
        layer: String,
        reason: String,
        kind: FailureKind,
    },
    Escalate {
        layer: String,
        reason: EscalationReason,
        detail: String,
        snapshot: Value,
        suspend: bool,
    },
}

impl StackOutcome {
    pub fn is_accept(&self) -> bool {
        matches!(self, Self::Accept { .. })
    }
}

/// One check in the stack.
#[async_trait]
pub trait ValidationLayer: Send + Sync {
    fn name(&self) -> &'static str;

    fn applies_to(&self, handoff: &Handoff) -> bool;

    async fn check(&self, handoff: &mut Handoff) -> LayerVerdict;
}

/// Ordered, short-circuiting chain of layers.
#[derive(Default)]
pub struct ValidationLayerStack {
    layers: Vec<Box<dyn ValidationLayer>>,
}

impl ValidationLayerStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_layer(mut self, layer: impl ValidationLayer + 'static) -> Self {
        self.layers.push(Box::new(layer));
        self
    }

    /// Compression, synthesis input and judge panel wired from config.
    pub fn standard(
        config: &PipelineConfig,
        oracle: Arc<dyn TokenBudgetOracle>,
        invoker: SharedInvoker,
    ) -> Result<Self, ConfigError> {
        let gate = CompressionGate::from_config(&config.compression, oracle)?;
        let compressor = AgentCompressor::new(
            invoker.clone(),
            config.model_for(Tier::Execution),
            Duration::from_secs(config.engine.agent_timeout_secs),
        );
        let panel = JudgePanel::from_config(config, invoker);
        Ok(Self::new()
            .with_layer(CompressionLayer::new(gate, Arc::new(compressor)))
            .with_layer(SynthesisLayer::new(SynthesisInputValidator::from_config(
                &config.synthesis,
            )))
            .with_layer(PanelLayer::new(
                panel,
                PanelSizeSelector::default(),
            )))
    }

    pub fn layer_names(&self) -> Vec<&'static str> {
        self.layers.iter().map(|l| l.name()).collect()
    }

    pub async fn evaluate(&self, handoff: &mut Handoff) -> StackOutcome {
        for layer in &self.layers {
            if !layer.applies_to(handoff) {
                continue;
            }
            let layer_name = layer.name().to_string();
            match layer.check(handoff).await {
                LayerVerdict::Pass => {
                    debug!(layer = %layer_name, task_id = %handoff.task_id, "Layer passed");
                }
                LayerVerdict::Reject { reason, kind } => {
                    warn!(layer = %layer_name, task_id = %handoff.task_id, %kind, "Layer rejected handoff: {reason}");
                    return StackOutcome::Reject {
                        layer: layer_name,
                        reason,
                        kind,
                    };
                }
                LayerVerdict::Escalate {
                    reason,
                    detail,
                    snapshot,
                    suspend,
                } => {
                    return StackOutcome::Escalate {
                        layer: layer_name,
                        reason,
                        detail,
                        snapshot,
                        suspend,
                    };
                }
            }
        }
        StackOutcome::Accept {
            payload: handoff.payload.clone(),
        }
    }
}

/// Token budget per tier pair, with one compression attempt.
pub struct CompressionLayer {
    gate: CompressionGate,
    compressor: Arc<dyn Compressor>,
}

impl CompressionLayer {
    pub fn new(gate: CompressionGate, compressor: Arc<dyn Compressor>) -> Self {
        Self { gate, compressor }
    }
}

#[async_trait]
impl ValidationLayer for CompressionLayer {
    fn name(&self) -> &'static str {
        "compression"
    }

    fn applies_to(&self, _handoff: &Handoff) -> bool {
        true
    }

    async fn check(&self, handoff: &mut Handoff) -> LayerVerdict {
        let outcome = self
            .gate
            .evaluate_with_compression(
                &handoff.payload,
                handoff.source,
                handoff.target,
                self.compressor.as_ref(),
            )
            .await;
        if let Some((tokens_in, tokens_out)) = outcome.compressor_tokens {
            handoff.usage.push(LayerUsage {
                layer: self.name().to_string(),
                agent: "compressor".to_string(),
                model: self.compressor.model().to_string(),
                tokens_in,
                tokens_out,
            });
        }
        let passed = outcome.decision.action == GateAction::Accept;
        handoff.reports.push(LayerReport {
            layer: self.name().to_string(),
            passed,
            detail: json!({
                "initial": outcome.initial,
                "decision": outcome.decision,
                "compressed": outcome.compressed,
            }),
        });
        if passed {
            handoff.payload = outcome.payload;
            LayerVerdict::Pass
        } else {
            LayerVerdict::Reject {
                reason: outcome.decision.reason,
                kind: FailureKind::ValidationRejected,
            }
        }
    }
}

/// Required-field check on handoffs entering the analytical synthesis tier.
pub struct SynthesisLayer {
    validator: SynthesisInputValidator,
}

impl SynthesisLayer {
    pub fn new(validator: SynthesisInputValidator) -> Self {
        Self { validator }
    }
}

#[async_trait]
impl ValidationLayer for SynthesisLayer {
    fn name(&self) -> &'static str {
        "synthesis_input"
    }

    fn applies_to(&self, handoff: &Handoff) -> bool {
        handoff.target == Tier::Analytical
    }

    async fn check(&self, handoff: &mut Handoff) -> LayerVerdict {
        let parsed = SynthesisInputValidator::parse_handoff(&handoff.payload).and_then(|value| {
            self.validator
                .validate(&value, handoff.synthesis_state)
                .map(|result| (value, result))
        });
        let (value, (action, state)) = match parsed {
            Ok(ok) => ok,
            Err(e) => {
                handoff.reports.push(LayerReport {
                    layer: self.name().to_string(),
                    passed: false,
                    detail: json!({ "error": e.to_string() }),
                });
                return LayerVerdict::Reject {
                    reason: e.to_string(),
                    kind: FailureKind::SchemaInvalid,
                };
            }
        };

        handoff.synthesis_state = state;
        handoff.reports.push(LayerReport {
            layer: self.name().to_string(),
            passed: action.is_accept(),
            detail: json!({ "action": action, "state": state }),
        });

        match action {
            ValidationAction::Accept => {
                // Normalise to the parsed object so fences and prose are dropped.
                handoff.payload = value.to_string();
                LayerVerdict::Pass
            }
            ValidationAction::Reject { missing } => LayerVerdict::Reject {
                reason: format!("handoff is missing required fields: {}", missing.join(", ")),
                kind: FailureKind::ValidationRejected,
            },
            ValidationAction::Escalate {
                target,
                missing,
                rejections,
            } => {
                handoff.payload = value.to_string();
                handoff.gaps = missing.clone();
                LayerVerdict::Escalate {
                    reason: EscalationReason::LoopExhausted,
                    detail: format!(
                        "{rejections} consecutive rejections without progress; proceeding with gaps: {}",
                        missing.join(", ")
                    ),
                    snapshot: json!({
                        "target": target,
                        "missing": missing,
                        "rejections": rejections,
                    }),
                    suspend: false,
                }
            }
        }
    }
}

/// Judge panel over high-stakes handoffs.
pub struct PanelLayer {
    panel: JudgePanel,
    selector: PanelSizeSelector,
}

impl PanelLayer {
    pub fn new(panel: JudgePanel, selector: PanelSizeSelector) -> Self {
        Self { panel, selector }
    }
}

#[async_trait]
impl ValidationLayer for PanelLayer {
    fn name(&self) -> &'static str {
        "judge_panel"
    }

    fn applies_to(&self, handoff: &Handoff) -> bool {
        handoff.target == Tier::Orchestrator || handoff.metadata.is_some()
    }

    async fn check(&self, handoff: &mut Handoff) -> LayerVerdict {
        let metadata = handoff.metadata.unwrap_or_else(TaskMetadata::low_risk);
        let selection = match self
            .selector
            .select_with_override(&metadata, handoff.panel_override)
        {
            Ok(selection) => selection,
            Err(e) => {
                return LayerVerdict::Reject {
                    reason: e.to_string(),
                    kind: FailureKind::PanelSizeDowngradeRejected,
                }
            }
        };

        let decision = match self.panel.judge(&handoff.payload, selection.size).await {
            Ok(decision) => decision,
            Err(e) => {
                return LayerVerdict::Reject {
                    reason: e.to_string(),
                    kind: FailureKind::ValidationRejected,
                }
            }
        };

        for v in &decision.verdict.verdicts {
            if v.tokens_in > 0 || v.tokens_out > 0 {
                handoff.usage.push(LayerUsage {
                    layer: self.name().to_string(),
                    agent: format!("judge:{}", v.judge),
                    model: v.model.clone(),
                    tokens_in: v.tokens_in,
                    tokens_out: v.tokens_out,
                });
            }
        }
        let snapshot = json!({
            "selection": selection,
            "verdict": decision.verdict,
            "outcome": decision.outcome,
        });
        handoff.reports.push(LayerReport {
            layer: self.name().to_string(),
            passed: decision.outcome == PanelOutcome::Pass,
            detail: snapshot.clone(),
        });

        match decision.outcome {
            PanelOutcome::Pass => LayerVerdict::Pass,
            PanelOutcome::Fail => {
                let rationale: Vec<String> = decision
                    .verdict
                    .verdicts
                    .iter()
                    .filter(|v| v.verdict.participates() && !v.verdict.rationale.is_empty())
                    .map(|v| format!("{}: {}", v.judge, v.verdict.rationale))
                    .collect();
                LayerVerdict::Reject {
                    reason: format!(
                        "panel mean score {:.1} is below the pass score {:.1}{}",
                        decision.verdict.mean_score,
                        self.panel.pass_score(),
                        if rationale.is_empty() {
                            String::new()
                        } else {
                            format!("; {}", rationale.join("; "))
                        }
                    ),
                    kind: FailureKind::ValidationRejected,
                }
            }
            PanelOutcome::Escalate(reason) => LayerVerdict::Escalate {
                reason,
                detail: format!(
                    "panel of {} escalated: mean score {:.1}, confidence {:.2}, dispersion {:.2}",
                    selection.size,
                    decision.verdict.mean_score,
                    decision.verdict.mean_confidence,
                    decision.verdict.dispersion
                ),
                snapshot,
                suspend: true,
            },
        }
    }
}
