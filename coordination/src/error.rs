//! Failure taxonomy and engine-level errors.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::breaker::BreakerSnapshot;
use crate::config::ConfigError;
use crate::gates::GateError;
use crate::panel::EscalationReason;
use crate::workflow::Phase;

/// Classes of failure the pipeline distinguishes when deciding whether to
/// retry, escalate or stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Breaker open. Fatal to the workflow.
    BudgetExceeded,
    /// A gate refused the handoff; the tier retries with feedback.
    ValidationRejected,
    /// Malformed handoff; rejected immediately, never retried.
    SchemaInvalid,
    /// Synthesis input kept failing without progress.
    LoopExhausted,
    PanelDisagreement,
    LowConfidence,
    SafetyVeto,
    /// External agent call failed; retried up to a bound.
    AgentInvocationFailed,
    /// Caller asked for a smaller panel than the risk score requires.
    PanelSizeDowngradeRejected,
}

impl FailureKind {
    /// Stable machine-readable code.
    pub fn code(self) -> &'static str {
        match self {
            Self::BudgetExceeded => "budget_exceeded",
            Self::ValidationRejected => "validation_rejected",
            Self::SchemaInvalid => "schema_invalid",
            Self::LoopExhausted => "loop_exhausted",
            Self::PanelDisagreement => "panel_disagreement",
            Self::LowConfidence => "low_confidence",
            Self::SafetyVeto => "safety_veto",
            Self::AgentInvocationFailed => "agent_invocation_failed",
            Self::PanelSizeDowngradeRejected => "panel_size_downgrade_rejected",
        }
    }

    pub fn is_retryable(self) -> bool {
        matches!(self, Self::ValidationRejected | Self::AgentInvocationFailed)
    }

    /// Whether this failure turns into an escalation rather than a failure.
    pub fn escalates(self) -> bool {
        matches!(
            self,
            Self::LoopExhausted | Self::PanelDisagreement | Self::LowConfidence | Self::SafetyVeto
        )
    }

    pub fn is_fatal(self) -> bool {
        self == Self::BudgetExceeded
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

impl From<EscalationReason> for FailureKind {
    fn from(reason: EscalationReason) -> Self {
        match reason {
            EscalationReason::BudgetExceeded => Self::BudgetExceeded,
            EscalationReason::LoopExhausted => Self::LoopExhausted,
            EscalationReason::PanelDisagreement => Self::PanelDisagreement,
            EscalationReason::LowConfidence => Self::LowConfidence,
            EscalationReason::SafetyVeto => Self::SafetyVeto,
            EscalationReason::RetriesExhausted => Self::ValidationRejected,
        }
    }
}

/// Errors returned by [`WorkflowEngine`](crate::workflow::WorkflowEngine).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("workflow {0} not found")]
    WorkflowNotFound(String),

    #[error("workflow {id} is terminal ({phase})")]
    WorkflowTerminal { id: String, phase: Phase },

    #[error("workflow {id} is suspended pending escalation {escalation_id}")]
    WorkflowSuspended { id: String, escalation_id: String },

    #[error("escalation {0} not found")]
    EscalationNotFound(String),

    #[error("escalation {0} is already resolved")]
    EscalationAlreadyResolved(String),

    #[error("illegal phase transition: {from} → {to}")]
    IllegalTransition { from: Phase, to: Phase },

    #[error("workflow {0} was cancelled")]
    Cancelled(String),

    #[error("workflow {workflow_id} exceeded its budget: {breaker}")]
    BudgetExceeded {
        workflow_id: String,
        breaker: BreakerSnapshot,
    },

    #[error("task {task_id} in workflow {workflow_id} failed after {attempts} attempts: {message}")]
    AgentInvocationFailed {
        workflow_id: String,
        task_id: String,
        attempts: u32,
        message: String,
    },

    #[error("task {task_id} in workflow {workflow_id} produced an invalid handoff: {reason}")]
    SchemaInvalid {
        workflow_id: String,
        task_id: String,
        reason: String,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Gate(#[from] GateError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl EngineError {
    /// Taxonomy entry for errors that map onto one.
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            Self::BudgetExceeded { .. } => Some(FailureKind::BudgetExceeded),
            Self::AgentInvocationFailed { .. } => Some(FailureKind::AgentInvocationFailed),
            Self::SchemaInvalid { .. } => Some(FailureKind::SchemaInvalid),
            Self::Gate(GateError::SchemaInvalid(_)) => Some(FailureKind::SchemaInvalid),
            Self::Gate(GateError::PanelSizeDowngradeRejected { .. }) => {
                Some(FailureKind::PanelSizeDowngradeRejected)
            }
            _ => None,
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        if let Some(kind) = self.kind() {
            return kind.code();
        }
        match self {
            Self::WorkflowNotFound(_) => "workflow_not_found",
            Self::WorkflowTerminal { .. } => "workflow_terminal",
            Self::WorkflowSuspended { .. } => "workflow_suspended",
            Self::EscalationNotFound(_) => "escalation_not_found",
            Self::EscalationAlreadyResolved(_) => "escalation_already_resolved",
            Self::IllegalTransition { .. } => "illegal_transition",
            Self::Cancelled(_) => "cancelled",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Gate(_) => "gate_error",
            Self::Config(_) => "config_error",
            _ => "engine_error",
        }
    }
}
