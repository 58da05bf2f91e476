//! Synthesis input validator: schema check plus progress-aware loop limit.
//!
//! Guards entry into the synthesis tier. A handoff must carry the required
//! fields; a submitter that keeps failing without progress is escalated to
//! the orchestrator after `max_consecutive_rejections` passes. A submitter
//! that closes at least half of its remaining gaps in one pass has its
//! counter reset, though the pass itself is still rejected.
//!
//! On escalation the synthesis tier proceeds with the gaps documented
//! rather than blocking.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::GateError;
use crate::config::SynthesisConfig;
use crate::tier::Tier;

/// Fields every synthesis handoff must carry.
pub const REQUIRED_FIELDS: &[&str] = &["task_id", "outcome", "key_findings", "confidence"];

/// Per-task loop counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynthesisValidationState {
    pub consecutive_rejections: u32,
    pub fields_missing_last_pass: u32,
    /// Whether the most recent rejected pass counted as progress.
    pub progress_flag: bool,
}

/// Validator outcome for one pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ValidationAction {
    Accept,
    Reject { missing: Vec<String> },
    Escalate {
        target: Tier,
        missing: Vec<String>,
        rejections: u32,
    },
}

impl ValidationAction {
    pub fn is_accept(&self) -> bool {
        matches!(self, Self::Accept)
    }
}

/// Stateless validator; callers own and pass back the per-task state.
#[derive(Debug, Clone)]
pub struct SynthesisInputValidator {
    max_consecutive_rejections: u32,
    progress_reset_threshold: f64,
}

impl SynthesisInputValidator {
    pub fn new(max_consecutive_rejections: u32, progress_reset_threshold: f64) -> Self {
        Self {
            max_consecutive_rejections: max_consecutive_rejections.max(1),
            progress_reset_threshold,
        }
    }

    pub fn from_config(config: &SynthesisConfig) -> Self {
        Self::new(
            config.max_consecutive_rejections,
            config.progress_reset_threshold,
        )
    }

    pub fn max_consecutive_rejections(&self) -> u32 {
        self.max_consecutive_rejections
    }

    /// Parse handoff text into a JSON object. Accepts a bare object or one
    /// wrapped in a fenced code block.
    pub fn parse_handoff(text: &str) -> Result<Value, GateError> {
        let body = extract_json_body(text);
        let value: Value = serde_json::from_str(body)
            .map_err(|e| GateError::SchemaInvalid(format!("handoff is not valid JSON: {e}")))?;
        if !value.is_object() {
            return Err(GateError::SchemaInvalid(
                "handoff must be a JSON object".to_string(),
            ));
        }
        Ok(value)
    }

    /// Required fields absent from `handoff`.
    pub fn missing_fields(handoff: &Value) -> Vec<String> {
        REQUIRED_FIELDS
            .iter()
            .filter(|field| is_missing(handoff.get(**field)))
            .map(|field| field.to_string())
            .collect()
    }

    /// Validate one pass, returning the action and the updated state.
    pub fn validate(
        &self,
        handoff: &Value,
        prior: SynthesisValidationState,
    ) -> Result<(ValidationAction, SynthesisValidationState), GateError> {
        if !handoff.is_object() {
            return Err(GateError::SchemaInvalid(
                "handoff must be a JSON object".to_string(),
            ));
        }

        let missing = Self::missing_fields(handoff);
        if missing.is_empty() {
            return Ok((ValidationAction::Accept, SynthesisValidationState::default()));
        }

        let missing_now = missing.len() as u32;
        let last = prior.fields_missing_last_pass;
        let progress = (last as f64 - missing_now as f64) / last.max(1) as f64;

        let mut state = SynthesisValidationState {
            consecutive_rejections: prior.consecutive_rejections + 1,
            fields_missing_last_pass: missing_now,
            progress_flag: false,
        };

        if progress >= self.progress_reset_threshold {
            debug!(progress, missing = missing_now, "Synthesis input progressing; counter reset");
            state.consecutive_rejections = 0;
            state.progress_flag = true;
        }

        if state.consecutive_rejections >= self.max_consecutive_rejections {
            warn!(
                rejections = state.consecutive_rejections,
                ?missing,
                "Synthesis input loop exhausted; escalating to orchestrator"
            );
            // Escalation clears the counters for whatever comes next.
            return Ok((
                ValidationAction::Escalate {
                    target: Tier::Orchestrator,
                    missing,
                    rejections: state.consecutive_rejections,
                },
                SynthesisValidationState::default(),
            ));
        }

        Ok((ValidationAction::Reject { missing }, state))
    }
}

impl Default for SynthesisInputValidator {
    fn default() -> Self {
        Self::from_config(&SynthesisConfig::default())
    }
}

fn is_missing(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(Value::Array(a)) => a.is_empty(),
        Some(Value::Object(o)) => o.is_empty(),
        Some(_) => false,
    }
}

/// Strip a surrounding ```json fence if present.
fn extract_json_body(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        if let Some(end) = after.find("```") {
            return after[..end].trim();
        }
    }
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            return &trimmed[start..=end];
        }
    }
    trimmed
}
