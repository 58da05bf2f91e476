//! Escalation decisions and the append-only escalation log.
//!
//! [`EscalationHandler`] is deterministic: it inspects an aggregated verdict
//! and returns a reason or nothing. Requests and their resolutions are
//! separate append-only records; a request's status is derived from whether
//! a resolution referencing it exists.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::aggregate::AggregatedVerdict;
use crate::error::EngineError;
use crate::tier::Tier;

/// Why a boundary was escalated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationReason {
    BudgetExceeded,
    LoopExhausted,
    PanelDisagreement,
    LowConfidence,
    SafetyVeto,
    RetriesExhausted,
}

impl std::fmt::Display for EscalationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BudgetExceeded => write!(f, "budget_exceeded"),
            Self::LoopExhausted => write!(f, "loop_exhausted"),
            Self::PanelDisagreement => write!(f, "panel_disagreement"),
            Self::LowConfidence => write!(f, "low_confidence"),
            Self::SafetyVeto => write!(f, "safety_veto"),
            Self::RetriesExhausted => write!(f, "retries_exhausted"),
        }
    }
}

/// Panel escalation thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EscalationHandler {
    pub disagreement_threshold: f64,
    pub min_confidence: f64,
}

impl EscalationHandler {
    pub fn new(disagreement_threshold: f64, min_confidence: f64) -> Self {
        Self {
            disagreement_threshold,
            min_confidence,
        }
    }

    /// Checked in order: veto, disagreement, confidence.
    pub fn should_escalate(&self, verdict: &AggregatedVerdict) -> Option<EscalationReason> {
        if verdict.has_veto() {
            return Some(EscalationReason::SafetyVeto);
        }
        if verdict.participating == 0 {
            return Some(EscalationReason::LowConfidence);
        }
        if verdict.dispersion > self.disagreement_threshold {
            return Some(EscalationReason::PanelDisagreement);
        }
        if verdict.mean_confidence < self.min_confidence {
            return Some(EscalationReason::LowConfidence);
        }
        None
    }
}

impl Default for EscalationHandler {
    fn default() -> Self {
        Self::new(2.0, 0.6)
    }
}

/// Immutable escalation record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationRequest {
    pub id: String,
    pub reason: EscalationReason,
    pub workflow_id: String,
    pub task_id: Option<String>,
    /// Tier boundary where the escalation fired.
    pub source: Tier,
    pub target: Tier,
    /// Triggering data (verdict, gate decision, breaker snapshot, …).
    pub snapshot: serde_json::Value,
    pub detail: String,
    pub created_at: DateTime<Utc>,
    /// Whether the workflow halts until this is resolved.
    pub suspends: bool,
}

impl EscalationRequest {
    pub fn new(
        reason: EscalationReason,
        workflow_id: impl Into<String>,
        task_id: Option<String>,
        source: Tier,
        target: Tier,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            reason,
            workflow_id: workflow_id.into(),
            task_id,
            source,
            target,
            snapshot: serde_json::Value::Null,
            detail: String::new(),
            created_at: Utc::now(),
            suspends: true,
        }
    }

    pub fn with_snapshot(mut self, snapshot: serde_json::Value) -> Self {
        self.snapshot = snapshot;
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }

    /// Record-only escalation; the workflow keeps going.
    pub fn non_suspending(mut self) -> Self {
        self.suspends = false;
        self
    }
}

/// Human (or operator) choice for a pending escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionDecision {
    /// Accept the suspended output and advance.
    Proceed,
    /// Reset the suspended task and re-run its phase.
    RetryPhase,
    /// Fail the workflow.
    Abort,
}

impl std::fmt::Display for ResolutionDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Proceed => write!(f, "proceed"),
            Self::RetryPhase => write!(f, "retry_phase"),
            Self::Abort => write!(f, "abort"),
        }
    }
}

/// Appended when an escalation is resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationResolution {
    pub escalation_id: String,
    pub decision: ResolutionDecision,
    pub note: Option<String>,
    pub resolved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationStatus {
    Pending,
    Resolved,
}

/// Request joined with its resolution, if any.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationView {
    pub request: EscalationRequest,
    pub status: EscalationStatus,
    pub resolution: Option<EscalationResolution>,
}

/// Append-only store of requests and resolutions.
#[derive(Debug, Default)]
pub struct EscalationLog {
    requests: Vec<EscalationRequest>,
    resolutions: Vec<EscalationResolution>,
}

impl EscalationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&mut self, request: EscalationRequest) -> String {
        warn!(
            escalation_id = %request.id,
            workflow_id = %request.workflow_id,
            reason = %request.reason,
            suspends = request.suspends,
            "Escalation raised"
        );
        let id = request.id.clone();
        self.requests.push(request);
        id
    }

    pub fn get(&self, id: &str) -> Option<&EscalationRequest> {
        self.requests.iter().find(|r| r.id == id)
    }

    pub fn resolution_for(&self, id: &str) -> Option<&EscalationResolution> {
        self.resolutions.iter().find(|r| r.escalation_id == id)
    }

    pub fn status(&self, id: &str) -> Option<EscalationStatus> {
        self.get(id)?;
        Some(if self.resolution_for(id).is_some() {
            EscalationStatus::Resolved
        } else {
            EscalationStatus::Pending
        })
    }

    /// Append a resolution. Each request is resolved at most once.
    pub fn resolve(
        &mut self,
        id: &str,
        decision: ResolutionDecision,
        note: Option<String>,
    ) -> Result<EscalationResolution, EngineError> {
        if self.get(id).is_none() {
            return Err(EngineError::EscalationNotFound(id.to_string()));
        }
        if self.resolution_for(id).is_some() {
            return Err(EngineError::EscalationAlreadyResolved(id.to_string()));
        }
        let resolution = EscalationResolution {
            escalation_id: id.to_string(),
            decision,
            note,
            resolved_at: Utc::now(),
        };
        self.resolutions.push(resolution.clone());
        Ok(resolution)
    }

    /// Requests in creation order, optionally filtered by status.
    pub fn list(&self, status: Option<EscalationStatus>) -> Vec<EscalationView> {
        self.requests
            .iter()
            .map(|request| {
                let resolution = self.resolution_for(&request.id).cloned();
                let status = if resolution.is_some() {
                    EscalationStatus::Resolved
                } else {
                    EscalationStatus::Pending
                };
                EscalationView {
                    request: request.clone(),
                    status,
                    resolution,
                }
            })
            .filter(|view| status.map_or(true, |s| view.status == s))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}
