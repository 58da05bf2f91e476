//! Tier-boundary gates: deterministic checks applied to handoffs.
//!
//! ```text
//! handoff ──▶ CompressionGate ──▶ SynthesisInputValidator ──▶ PanelSizeSelector ──▶ JudgePanel
//!              (token budget)       (schema + loop limit)       (risk → N judges)
//! ```
//!
//! None of the gates call a model directly; auto-routing and judging go
//! through the invocation port owned by the caller.

pub mod compression;
pub mod panel_size;
pub mod synthesis;

use thiserror::Error;

pub use compression::{BudgetMatrix, CompressionGate, GateAction, GateDecision};
pub use panel_size::{
    panel_size_for_score, BlastRadius, Domain, Impact, PanelSelection, PanelSizeSelector,
    Reversibility, ScoreBreakdown, TaskMetadata,
};
pub use synthesis::{SynthesisInputValidator, SynthesisValidationState, ValidationAction};

/// Errors raised by gates for malformed input or caller mistakes.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GateError {
    #[error("handoff schema invalid: {0}")]
    SchemaInvalid(String),

    #[error("panel size {requested} is smaller than the computed size {computed}; panels may only grow")]
    PanelSizeDowngradeRejected { requested: usize, computed: usize },

    #[error("panel size {requested} exceeds the {available} configured judges")]
    PanelSizeUnavailable { requested: usize, available: usize },
}
