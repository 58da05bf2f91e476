//! Audit event schema.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kinds of audit events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    WorkflowCreated,
    PhaseTransition,
    TaskStateChanged,
    GateDecision,
    LayerRejected,
    SpendRecorded,
    /// The breaker refused a charge (duplicate id or invalid amount).
    SpendRejected,
    BreakerTripped,
    PanelVerdict,
    EscalationRaised,
    EscalationResolved,
    WorkflowCancelled,
}

impl AuditEventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WorkflowCreated => "workflow_created",
            Self::PhaseTransition => "phase_transition",
            Self::TaskStateChanged => "task_state_changed",
            Self::GateDecision => "gate_decision",
            Self::LayerRejected => "layer_rejected",
            Self::SpendRecorded => "spend_recorded",
            Self::SpendRejected => "spend_rejected",
            Self::BreakerTripped => "breaker_tripped",
            Self::PanelVerdict => "panel_verdict",
            Self::EscalationRaised => "escalation_raised",
            Self::EscalationResolved => "escalation_resolved",
            Self::WorkflowCancelled => "workflow_cancelled",
        }
    }
}

impl std::fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One append-only audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub workflow_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub event_type: AuditEventType,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl AuditEvent {
    /// Workflow-scoped event with an empty payload.
    pub fn workflow(workflow_id: impl Into<String>, event_type: AuditEventType) -> Self {
        Self {
            timestamp: Utc::now(),
            workflow_id: workflow_id.into(),
            task_id: None,
            event_type,
            payload: serde_json::Value::Null,
        }
    }

    /// Task-scoped event with an empty payload.
    pub fn task(
        workflow_id: impl Into<String>,
        task_id: impl Into<String>,
        event_type: AuditEventType,
    ) -> Self {
        Self {
            task_id: Some(task_id.into()),
            ..Self::workflow(workflow_id, event_type)
        }
    }

    /// Attach a JSON payload.
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}
