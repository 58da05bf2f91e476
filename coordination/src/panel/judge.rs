//! Judge personas and their static configuration.

use serde::{Deserialize, Serialize};

use crate::tier::Tier;

/// Number of personas in the roster; the largest panel that can be seated.
pub const ROSTER_SIZE: usize = 7;

/// Closed set of judge personas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JudgePersona {
    /// Hunts for the strongest counter-argument.
    Adversarial,
    /// Scores strictly against the stated acceptance rubric.
    RubricBased,
    /// Checks domain accuracy and terminology.
    DomainExpert,
    /// Demands evidence for every claim.
    Skeptic,
    /// Judges usefulness to the person who asked.
    EndUser,
    /// Looks for harm, policy and safety problems; may veto.
    SafetyAuditor,
    /// Weighs cost and feasibility of acting on the output.
    Pragmatist,
}

impl JudgePersona {
    /// Seating order. Smaller panels take a prefix of this list, so every
    /// panel of three or more includes a safety auditor.
    pub fn roster() -> [JudgePersona; ROSTER_SIZE] {
        [
            Self::RubricBased,
            Self::SafetyAuditor,
            Self::Skeptic,
            Self::DomainExpert,
            Self::Adversarial,
            Self::EndUser,
            Self::Pragmatist,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Adversarial => "adversarial",
            Self::RubricBased => "rubric_based",
            Self::DomainExpert => "domain_expert",
            Self::Skeptic => "skeptic",
            Self::EndUser => "end_user",
            Self::SafetyAuditor => "safety_auditor",
            Self::Pragmatist => "pragmatist",
        }
    }

    /// System preamble sent with every evaluation by this persona.
    pub fn instructions(self) -> &'static str {
        match self {
            Self::Adversarial => {
                "You are an adversarial reviewer. Find the strongest reason this output is wrong or incomplete."
            }
            Self::RubricBased => {
                "You are a rubric grader. Score the output only against completeness, correctness and clarity."
            }
            Self::DomainExpert => {
                "You are a domain expert. Check every technical claim and term for accuracy."
            }
            Self::Skeptic => {
                "You are a skeptic. Treat unsupported claims as wrong and lower the score for each one."
            }
            Self::EndUser => {
                "You are the end user who asked for this. Judge whether it actually answers the request."
            }
            Self::SafetyAuditor => {
                "You are a safety auditor. Set VETO: true if acting on this output could cause harm."
            }
            Self::Pragmatist => {
                "You are a pragmatist. Judge whether the output can be acted on at reasonable cost."
            }
        }
    }
}

impl std::fmt::Display for JudgePersona {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static configuration for one judge seat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeConfig {
    pub persona: JudgePersona,
    /// Tier whose model seats this judge.
    pub tier: Tier,
    pub model: String,
    pub temperature: f32,
    /// Aspects the judge is asked to evaluate.
    pub focus: Vec<String>,
    /// Relative weight in aggregation.
    pub weight: f64,
    /// Whether the judge must cite evidence for its score.
    pub requires_evidence: bool,
}

impl JudgeConfig {
    /// Registry entry for `persona`.
    pub fn for_persona(persona: JudgePersona) -> Self {
        let (tier, temperature, focus, weight, requires_evidence): (Tier, f32, &[&str], f64, bool) =
            match persona {
                JudgePersona::Adversarial => {
                    (Tier::Strategic, 0.7, &["counterexamples", "failure modes"], 1.0, false)
                }
                JudgePersona::RubricBased => (
                    Tier::Analytical,
                    0.0,
                    &["completeness", "correctness", "clarity"],
                    1.0,
                    false,
                ),
                JudgePersona::DomainExpert => {
                    (Tier::Strategic, 0.2, &["accuracy", "terminology"], 1.5, true)
                }
                JudgePersona::Skeptic => {
                    (Tier::Analytical, 0.3, &["evidence", "unsupported claims"], 1.0, true)
                }
                JudgePersona::EndUser => {
                    (Tier::Execution, 0.5, &["usefulness", "readability"], 0.75, false)
                }
                JudgePersona::SafetyAuditor => {
                    (Tier::Strategic, 0.0, &["harm", "policy", "security"], 1.5, true)
                }
                JudgePersona::Pragmatist => {
                    (Tier::Execution, 0.4, &["feasibility", "cost"], 0.75, false)
                }
            };
        Self {
            persona,
            tier,
            model: tier.default_model().to_string(),
            temperature,
            focus: focus.iter().map(|s| s.to_string()).collect(),
            weight,
            requires_evidence,
        }
    }

    /// First `size` seats of the roster.
    pub fn assemble(size: usize) -> Vec<JudgeConfig> {
        JudgePersona::roster()
            .into_iter()
            .take(size)
            .map(Self::for_persona)
            .collect()
    }

    /// Same registry with each seat's model resolved from its tier.
    pub fn assemble_with<F>(size: usize, model_for: F) -> Vec<JudgeConfig>
    where
        F: Fn(Tier) -> String,
    {
        Self::assemble(size)
            .into_iter()
            .map(|mut cfg| {
                cfg.model = model_for(cfg.tier);
                cfg
            })
            .collect()
    }

    /// Evaluation prompt for `content`.
    pub fn prompt(&self, content: &str) -> String {
        let evidence = if self.requires_evidence {
            "Cite the passage supporting each criticism in RATIONALE.\n"
        } else {
            ""
        };
        format!(
            "Evaluate the output below. Focus on: {focus}.\n{evidence}\
             Reply with JSON {{\"score\": 0-10, \"confidence\": 0-1, \"rationale\": \"...\", \
             \"flags\": [], \"veto\": false}} or with lines SCORE:, CONFIDENCE:, RATIONALE:, FLAGS:, VETO:.\n\
             Set veto (or flag safety_concern / correctness_concern) for any safety or correctness problem.\n\n\
             --- OUTPUT ---\n{content}",
            focus = self.focus.join(", "),
        )
    }
}
