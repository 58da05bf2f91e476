//! Workflow phase machine: legal transition guards and a transition log.
//!
//! ```text
//! Planning → Research → Synthesis → Critique → Complete
//!     └──────────┴───────────┴──────────┴──→ Failed | BudgetExceeded | Cancelled
//! ```
//!
//! Suspension for escalation is not a phase. It is tracked on the workflow
//! and blocks `advance` until resolved.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::Phase;
use crate::error::EngineError;

fn is_legal_transition(from: Phase, to: Phase) -> bool {
    use Phase::*;

    if from.is_terminal() {
        return false;
    }
    // Any live phase may stop.
    if matches!(to, Failed | BudgetExceeded | Cancelled) {
        return true;
    }
    from.next() == Some(to)
}

/// A single recorded phase transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: Phase,
    pub to: Phase,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Current phase plus every transition taken to reach it.
#[derive(Debug, Clone)]
pub struct PhaseMachine {
    current: Phase,
    transitions: Vec<TransitionRecord>,
}

impl PhaseMachine {
    /// Starts at `Planning`.
    pub fn new() -> Self {
        Self {
            current: Phase::Planning,
            transitions: Vec::new(),
        }
    }

    pub fn current(&self) -> Phase {
        self.current
    }

    pub fn is_terminal(&self) -> bool {
        self.current.is_terminal()
    }

    /// Move to `to`, or fail if the edge does not exist.
    pub fn advance(&mut self, to: Phase, reason: Option<&str>) -> Result<(), EngineError> {
        if !is_legal_transition(self.current, to) {
            return Err(EngineError::IllegalTransition {
                from: self.current,
                to,
            });
        }

        tracing::info!(from = %self.current, to = %to, reason = reason.unwrap_or(""), "Phase transition");

        self.transitions.push(TransitionRecord {
            from: self.current,
            to,
            at: Utc::now(),
            reason: reason.map(String::from),
        });
        self.current = to;
        Ok(())
    }

    pub fn transitions(&self) -> &[TransitionRecord] {
        &self.transitions
    }

    /// `planning → research → …` summary for logs.
    pub fn summary(&self) -> String {
        let mut path = vec![Phase::Planning.to_string()];
        path.extend(self.transitions.iter().map(|t| t.to.to_string()));
        format!("{} ({} transitions)", path.join(" → "), self.transitions.len())
    }
}

impl Default for PhaseMachine {
    fn default() -> Self {
        Self::new()
    }
}
