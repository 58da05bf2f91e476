//! Weighted aggregation of judge verdicts.

use serde::{Deserialize, Serialize};

use super::judge::JudgePersona;
use super::verdict::ParsedVerdict;

/// A verdict attributed to the judge seat that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeVerdict {
    pub judge: JudgePersona,
    pub model: String,
    pub weight: f64,
    pub verdict: ParsedVerdict,
    #[serde(default)]
    pub tokens_in: u32,
    #[serde(default)]
    pub tokens_out: u32,
}

/// Panel-level result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedVerdict {
    /// Weighted mean of participating scores.
    pub mean_score: f64,
    /// Weighted mean of participating confidences.
    pub mean_confidence: f64,
    /// Population standard deviation of participating scores.
    pub dispersion: f64,
    /// Dispersion within the disagreement threshold.
    pub consensus: bool,
    /// Judges that raised a safety veto, participating or not.
    pub vetoes: Vec<JudgePersona>,
    pub participating: usize,
    pub abstaining: usize,
    /// Verdicts in canonical (persona) order.
    pub verdicts: Vec<JudgeVerdict>,
}

impl AggregatedVerdict {
    pub fn has_veto(&self) -> bool {
        !self.vetoes.is_empty()
    }

    pub fn tokens(&self) -> (u32, u32) {
        self.verdicts.iter().fold((0, 0), |(i, o), v| {
            (i.saturating_add(v.tokens_in), o.saturating_add(v.tokens_out))
        })
    }
}

/// Combine verdicts. Input order does not affect the result.
pub fn aggregate(mut verdicts: Vec<JudgeVerdict>, disagreement_threshold: f64) -> AggregatedVerdict {
    verdicts.sort_by(|a, b| {
        a.judge
            .cmp(&b.judge)
            .then_with(|| a.verdict.score.total_cmp(&b.verdict.score))
    });

    let participating: Vec<&JudgeVerdict> =
        verdicts.iter().filter(|v| v.verdict.participates()).collect();
    let abstaining = verdicts.len() - participating.len();

    let total_weight: f64 = participating.iter().map(|v| v.weight.max(0.0)).sum();
    let (mean_score, mean_confidence) = if total_weight > 0.0 {
        let score: f64 = participating
            .iter()
            .map(|v| v.weight.max(0.0) * v.verdict.score)
            .sum();
        let confidence: f64 = participating
            .iter()
            .map(|v| v.weight.max(0.0) * v.verdict.confidence)
            .sum();
        (score / total_weight, confidence / total_weight)
    } else {
        (0.0, 0.0)
    };

    let dispersion = population_std_dev(participating.iter().map(|v| v.verdict.score));
    // Abstaining judges can still veto.
    let vetoes: Vec<JudgePersona> = verdicts
        .iter()
        .filter(|v| v.verdict.veto)
        .map(|v| v.judge)
        .collect();
    let participating = participating.len();

    AggregatedVerdict {
        mean_score,
        mean_confidence,
        dispersion,
        consensus: participating > 0 && dispersion <= disagreement_threshold,
        vetoes,
        participating,
        abstaining,
        verdicts,
    }
}

fn population_std_dev(values: impl Iterator<Item = f64> + Clone) -> f64 {
    let n = values.clone().count();
    if n == 0 {
        return 0.0;
    }
    let mean = values.clone().sum::<f64>() / n as f64;
    let variance = values.map(|x| (x - mean).powi(2)).sum::<f64>() / n as f64;
    variance.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::panel::verdict::VerdictStatus;

    fn verdict(judge: JudgePersona, weight: f64, score: f64, confidence: f64) -> JudgeVerdict {
        JudgeVerdict {
            judge,
            model: "m".into(),
            weight,
            verdict: ParsedVerdict {
                score,
                confidence,
                rationale: String::new(),
                flags: Vec::new(),
                veto: false,
                status: VerdictStatus::Parsed,
            },
            tokens_in: 10,
            tokens_out: 5,
        }
    }

    #[test]
    fn test_weighted_mean_and_dispersion() {
        let agg = aggregate(
            vec![
                verdict(JudgePersona::Skeptic, 1.0, 6.0, 0.8),
                verdict(JudgePersona::DomainExpert, 3.0, 8.0, 0.6),
            ],
            2.0,
        );
        assert!((agg.mean_score - 7.5).abs() < 1e-9);
        assert!((agg.mean_confidence - 0.65).abs() < 1e-9);
        assert!((agg.dispersion - 1.0).abs() < 1e-9);
        assert!(agg.consensus);
        assert_eq!(agg.tokens(), (20, 10));
    }

    #[test]
    fn test_order_invariant() {
        let a = vec![
            verdict(JudgePersona::Skeptic, 1.0, 3.1, 0.7),
            verdict(JudgePersona::EndUser, 0.75, 9.7, 0.9),
            verdict(JudgePersona::Pragmatist, 0.75, 5.3, 0.4),
        ];
        let mut b = a.clone();
        b.reverse();
        assert_eq!(aggregate(a, 2.0), aggregate(b, 2.0));
    }

    #[test]
    fn test_abstainers_excluded() {
        let mut timed_out = verdict(JudgePersona::Adversarial, 1.0, 0.0, 0.0);
        timed_out.verdict = ParsedVerdict::abstain(VerdictStatus::TimedOut, "timeout");
        let agg = aggregate(
            vec![verdict(JudgePersona::Skeptic, 1.0, 8.0, 0.9), timed_out],
            2.0,
        );
        assert_eq!(agg.participating, 1);
        assert_eq!(agg.abstaining, 1);
        assert_eq!(agg.mean_score, 8.0);
        assert_eq!(agg.dispersion, 0.0);
    }

    #[test]
    fn test_no_participants() {
        let agg = aggregate(Vec::new(), 2.0);
        assert_eq!(agg.participating, 0);
        assert_eq!(agg.mean_confidence, 0.0);
        assert!(!agg.consensus);
    }

    #[test]
    fn test_veto_collected() {
        let mut v = verdict(JudgePersona::SafetyAuditor, 1.5, 9.0, 0.9);
        v.verdict.veto = true;
        let agg = aggregate(vec![v, verdict(JudgePersona::Skeptic, 1.0, 9.0, 0.9)], 2.0);
        assert_eq!(agg.vetoes, vec![JudgePersona::SafetyAuditor]);
        assert!(agg.has_veto());
    }

    #[test]
    fn test_scoreless_veto_counts_without_moving_mean() {
        let vetoer = JudgeVerdict {
            judge: JudgePersona::SafetyAuditor,
            model: "m".into(),
            weight: 1.5,
            verdict: crate::panel::verdict::VerdictParser::parse(
                "VETO: true\nRATIONALE: output leaks credentials",
            ),
            tokens_in: 10,
            tokens_out: 5,
        };
        let agg = aggregate(
            vec![
                verdict(JudgePersona::RubricBased, 1.0, 9.0, 0.9),
                vetoer,
                verdict(JudgePersona::Skeptic, 1.0, 9.0, 0.9),
            ],
            2.0,
        );
        assert_eq!(agg.vetoes, vec![JudgePersona::SafetyAuditor]);
        assert_eq!((agg.participating, agg.abstaining), (2, 1));
        assert_eq!(agg.mean_score, 9.0);
    }
}
