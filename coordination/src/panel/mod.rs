//! Judge panel: concurrent evaluation, weighted aggregation, escalation.
//!
//! ```text
//! content ──▶ JoinSet::spawn(judge_i) × N   (Semaphore(N), per-judge timeout)
//!                  │
//!                  ▼
//!           VerdictParser::parse  (timeouts and failures abstain)
//!                  │
//!                  ▼
//!           aggregate ──▶ EscalationHandler ──▶ PanelOutcome
//! ```

pub mod aggregate;
pub mod escalation;
pub mod judge;
pub mod verdict;

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

pub use aggregate::{aggregate, AggregatedVerdict, JudgeVerdict};
pub use escalation::{
    EscalationHandler, EscalationLog, EscalationReason, EscalationRequest, EscalationResolution,
    EscalationStatus, EscalationView, ResolutionDecision,
};
pub use judge::{JudgeConfig, JudgePersona, ROSTER_SIZE};
pub use verdict::{ParsedVerdict, VerdictParser, VerdictStatus};

use crate::config::PipelineConfig;
use crate::invoke::{invoke_with_timeout, InvocationError, InvocationRequest, SharedInvoker};

/// Errors from seating a panel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PanelError {
    #[error("panel size must be at least 1")]
    EmptyPanel,

    #[error("panel size {requested} exceeds the {available} available judges")]
    SizeUnavailable { requested: usize, available: usize },
}

/// What the panel concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum PanelOutcome {
    Pass,
    Fail,
    Escalate(EscalationReason),
}

/// Aggregated verdict plus the outcome derived from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PanelDecision {
    pub verdict: AggregatedVerdict,
    pub outcome: PanelOutcome,
}

/// Seats judges and adjudicates content.
pub struct JudgePanel {
    invoker: SharedInvoker,
    judge_timeout: Duration,
    handler: EscalationHandler,
    pass_score: f64,
    roster: Vec<JudgeConfig>,
}

impl JudgePanel {
    pub fn new(
        invoker: SharedInvoker,
        judge_timeout: Duration,
        handler: EscalationHandler,
        pass_score: f64,
    ) -> Self {
        Self {
            invoker,
            judge_timeout,
            handler,
            pass_score,
            roster: JudgeConfig::assemble(ROSTER_SIZE),
        }
    }

    /// Thresholds and per-tier judge models from config.
    pub fn from_config(config: &PipelineConfig, invoker: SharedInvoker) -> Self {
        let panel = &config.panel;
        Self {
            invoker,
            judge_timeout: Duration::from_secs(panel.judge_timeout_secs),
            handler: EscalationHandler::new(panel.disagreement_threshold, panel.min_confidence),
            pass_score: panel.pass_score,
            roster: JudgeConfig::assemble_with(ROSTER_SIZE, |tier| config.model_for(tier)),
        }
    }

    pub fn handler(&self) -> &EscalationHandler {
        &self.handler
    }

    pub fn pass_score(&self) -> f64 {
        self.pass_score
    }

    pub fn available_judges(&self) -> usize {
        self.roster.len()
    }

    /// Run `panel_size` judges over `content` and aggregate their verdicts.
    pub async fn run(
        &self,
        content: &str,
        panel_size: usize,
    ) -> Result<AggregatedVerdict, PanelError> {
        if panel_size == 0 {
            return Err(PanelError::EmptyPanel);
        }
        if panel_size > self.roster.len() {
            return Err(PanelError::SizeUnavailable {
                requested: panel_size,
                available: self.roster.len(),
            });
        }

        let seats: Vec<JudgeConfig> = self.roster.iter().take(panel_size).cloned().collect();
        let sem = Arc::new(Semaphore::new(panel_size));
        let content: Arc<str> = Arc::from(content);
        let mut join_set: JoinSet<JudgeVerdict> = JoinSet::new();

        for seat in seats.iter().cloned() {
            let sem = sem.clone();
            let content = content.clone();
            let invoker = self.invoker.clone();
            let timeout = self.judge_timeout;

            join_set.spawn(async move {
                let _permit = match sem.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return seat_verdict(
                            &seat,
                            ParsedVerdict::abstain(VerdictStatus::Failed, "judge pool closed"),
                            0,
                            0,
                        )
                    }
                };
                let start = Instant::now();
                let request = InvocationRequest::new(
                    format!("judge:{}", seat.persona),
                    seat.model.clone(),
                    seat.prompt(&content),
                )
                .with_system(seat.persona.instructions())
                .with_temperature(seat.temperature);

                let verdict = match invoke_with_timeout(invoker.as_ref(), request, timeout).await {
                    Ok(response) => {
                        let parsed = VerdictParser::parse(&response.text);
                        seat_verdict(&seat, parsed, response.tokens_in, response.tokens_out)
                    }
                    Err(InvocationError::Timeout(after)) => seat_verdict(
                        &seat,
                        ParsedVerdict::abstain(
                            VerdictStatus::TimedOut,
                            format!("judge timed out after {after:?}"),
                        ),
                        0,
                        0,
                    ),
                    Err(e) => seat_verdict(
                        &seat,
                        ParsedVerdict::abstain(VerdictStatus::Failed, e.to_string()),
                        0,
                        0,
                    ),
                };
                debug!(
                    judge = %seat.persona,
                    status = %verdict.verdict.status,
                    score = verdict.verdict.score,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Judge finished"
                );
                verdict
            });
        }

        let mut verdicts = Vec::with_capacity(panel_size);
        while let Some(res) = join_set.join_next().await {
            match res {
                Ok(verdict) => verdicts.push(verdict),
                Err(e) => warn!(error = %e, "Judge task panicked"),
            }
        }

        // Seats lost to a panicked task still abstain.
        let returned: BTreeSet<JudgePersona> = verdicts.iter().map(|v| v.judge).collect();
        for seat in seats.iter().filter(|s| !returned.contains(&s.persona)) {
            verdicts.push(seat_verdict(
                seat,
                ParsedVerdict::abstain(VerdictStatus::Failed, "judge task panicked"),
                0,
                0,
            ));
        }

        let aggregated = aggregate(verdicts, self.handler.disagreement_threshold);
        info!(
            panel_size,
            participating = aggregated.participating,
            abstaining = aggregated.abstaining,
            mean_score = aggregated.mean_score,
            dispersion = aggregated.dispersion,
            "Panel verdict aggregated"
        );
        Ok(aggregated)
    }

    /// Derive the outcome for an aggregated verdict.
    pub fn decide(&self, verdict: &AggregatedVerdict) -> PanelOutcome {
        if let Some(reason) = self.handler.should_escalate(verdict) {
            return PanelOutcome::Escalate(reason);
        }
        if verdict.mean_score >= self.pass_score {
            PanelOutcome::Pass
        } else {
            PanelOutcome::Fail
        }
    }

    /// [`run`](Self::run) followed by [`decide`](Self::decide).
    pub async fn judge(&self, content: &str, panel_size: usize) -> Result<PanelDecision, PanelError> {
        let verdict = self.run(content, panel_size).await?;
        let outcome = self.decide(&verdict);
        Ok(PanelDecision { verdict, outcome })
    }
}

fn seat_verdict(
    seat: &JudgeConfig,
    verdict: ParsedVerdict,
    tokens_in: u32,
    tokens_out: u32,
) -> JudgeVerdict {
    JudgeVerdict {
        judge: seat.persona,
        model: seat.model.clone(),
        weight: seat.weight,
        verdict,
        tokens_in,
        tokens_out,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoke::{AgentInvoker, AgentResponse};
    use async_trait::async_trait;

    /// Answers by persona; personas without an answer sleep past the timeout.
    struct PersonaInvoker {
        answers: Vec<(&'static str, &'static str)>,
    }

    #[async_trait]
    impl AgentInvoker for PersonaInvoker {
        async fn invoke(&self, request: InvocationRequest) -> Result<AgentResponse, InvocationError> {
            for (persona, answer) in &self.answers {
                if request.agent == format!("judge:{persona}") {
                    return Ok(AgentResponse {
                        text: answer.to_string(),
                        tokens_in: 100,
                        tokens_out: 20,
                    });
                }
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
            Err(InvocationError::Unavailable("never".into()))
        }
    }

    fn panel(answers: Vec<(&'static str, &'static str)>) -> JudgePanel {
        JudgePanel::new(
            Arc::new(PersonaInvoker { answers }),
            Duration::from_millis(50),
            EscalationHandler::default(),
            7.0,
        )
    }

    #[tokio::test]
    async fn test_unanimous_pass() {
        let p = panel(vec![
            ("rubric_based", "SCORE: 8\nCONFIDENCE: 0.9"),
            ("safety_auditor", r#"{"score": 8, "confidence": 0.9}"#),
            ("skeptic", "SCORE: 8\nCONFIDENCE: 0.8"),
        ]);
        let decision = p.judge("report", 3).await.unwrap();
        assert_eq!(decision.outcome, PanelOutcome::Pass);
        assert_eq!(decision.verdict.participating, 3);
        assert_eq!(decision.verdict.tokens(), (300, 60));
    }

    #[tokio::test]
    async fn test_timed_out_judge_abstains() {
        let p = panel(vec![
            ("rubric_based", "SCORE: 9\nCONFIDENCE: 0.9"),
            ("safety_auditor", "SCORE: 9\nCONFIDENCE: 0.9"),
        ]);
        let verdict = p.run("report", 3).await.unwrap();
        assert_eq!(verdict.participating, 2);
        assert_eq!(verdict.abstaining, 1);
        let skeptic = verdict
            .verdicts
            .iter()
            .find(|v| v.judge == JudgePersona::Skeptic)
            .unwrap();
        assert_eq!(skeptic.verdict.status, VerdictStatus::TimedOut);
    }

    #[tokio::test]
    async fn test_veto_escalates() {
        let p = panel(vec![
            ("rubric_based", "SCORE: 9\nCONFIDENCE: 0.9"),
            ("safety_auditor", "SCORE: 9\nCONFIDENCE: 0.9\nVETO: true"),
            ("skeptic", "SCORE: 9\nCONFIDENCE: 0.9"),
        ]);
        let decision = p.judge("report", 3).await.unwrap();
        assert_eq!(
            decision.outcome,
            PanelOutcome::Escalate(EscalationReason::SafetyVeto)
        );
    }

    #[tokio::test]
    async fn test_scoreless_veto_escalates_despite_high_scores() {
        let p = panel(vec![
            ("rubric_based", "SCORE: 9\nCONFIDENCE: 0.9"),
            ("safety_auditor", "VETO: true\nRATIONALE: output leaks credentials"),
            ("skeptic", "SCORE: 9\nCONFIDENCE: 0.9"),
        ]);
        let decision = p.judge("report", 3).await.unwrap();
        assert_eq!(decision.verdict.participating, 2);
        assert_eq!(decision.verdict.vetoes, vec![JudgePersona::SafetyAuditor]);
        assert_eq!(
            decision.outcome,
            PanelOutcome::Escalate(EscalationReason::SafetyVeto)
        );
    }

    #[tokio::test]
    async fn test_concern_flag_escalates() {
        let p = panel(vec![
            ("rubric_based", "SCORE: 9\nCONFIDENCE: 0.9"),
            ("safety_auditor", "SCORE: 9\nCONFIDENCE: 0.9"),
            ("skeptic", "SCORE: 9\nCONFIDENCE: 0.9\nFLAGS: safety_concern"),
        ]);
        let decision = p.judge("report", 3).await.unwrap();
        assert_eq!(decision.verdict.vetoes, vec![JudgePersona::Skeptic]);
        assert_eq!(
            decision.outcome,
            PanelOutcome::Escalate(EscalationReason::SafetyVeto)
        );
    }

    #[tokio::test]
    async fn test_low_score_fails() {
        let p = panel(vec![
            ("rubric_based", "SCORE: 4\nCONFIDENCE: 0.9"),
            ("safety_auditor", "SCORE: 5\nCONFIDENCE: 0.9"),
            ("skeptic", "SCORE: 4\nCONFIDENCE: 0.9"),
        ]);
        assert_eq!(p.judge("report", 3).await.unwrap().outcome, PanelOutcome::Fail);
    }

    #[tokio::test]
    async fn test_all_unparseable_is_low_confidence() {
        let p = panel(vec![
            ("rubric_based", "looks fine"),
            ("safety_auditor", "no comment"),
            ("skeptic", "???"),
        ]);
        let decision = p.judge("report", 3).await.unwrap();
        assert_eq!(
            decision.outcome,
            PanelOutcome::Escalate(EscalationReason::LowConfidence)
        );
    }

    #[tokio::test]
    async fn test_size_bounds() {
        let p = panel(Vec::new());
        assert_eq!(p.run("x", 0).await.unwrap_err(), PanelError::EmptyPanel);
        assert!(matches!(
            p.run("x", 8).await.unwrap_err(),
            PanelError::SizeUnavailable { requested: 8, .. }
        ));
    }
}
