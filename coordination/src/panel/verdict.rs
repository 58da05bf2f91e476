//! Verdict parsing.
//!
//! Judges answer either with a JSON object (bare or fenced) or with
//! `KEY: value` lines. Both shapes produce the same [`ParsedVerdict`];
//! anything else produces an unparseable verdict that abstains instead of
//! failing the panel. A veto survives even when the score does not: a
//! score-less veto abstains from the mean but still blocks the panel.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::LazyLock;

/// Score scale upper bound.
pub const MAX_SCORE: f64 = 10.0;

/// Confidence assumed when a judge scores without stating one.
const DEFAULT_CONFIDENCE: f64 = 0.5;

/// Flags that raise a veto on their own.
const VETO_FLAGS: &[&str] = &[
    "veto",
    "safety_veto",
    "safety",
    "safety_concern",
    "safety_issue",
    "unsafe",
    "harmful",
    "correctness",
    "correctness_concern",
    "correctness_issue",
    "incorrect",
];

static LINE_FIELD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^[ \t>*_#-]*(score|confidence|rationale|flags|veto)[*_]*[ \t]*[:=][*_ \t]*(.*?)[ \t]*$")
        .expect("LINE_FIELD_RE regex should compile")
});

static LEADING_NUMBER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[+-]?\d+(?:\.\d+)?").expect("LEADING_NUMBER_RE regex should compile")
});

/// How a verdict was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictStatus {
    Parsed,
    Unparseable,
    TimedOut,
    Failed,
}

impl std::fmt::Display for VerdictStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Parsed => write!(f, "parsed"),
            Self::Unparseable => write!(f, "unparseable"),
            Self::TimedOut => write!(f, "timed_out"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// One judge's verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedVerdict {
    /// 0–10.
    pub score: f64,
    /// 0–1.
    pub confidence: f64,
    pub rationale: String,
    pub flags: Vec<String>,
    pub veto: bool,
    pub status: VerdictStatus,
}

impl ParsedVerdict {
    /// Abstaining verdict carrying why the judge produced nothing usable.
    pub fn abstain(status: VerdictStatus, rationale: impl Into<String>) -> Self {
        Self {
            score: 0.0,
            confidence: 0.0,
            rationale: rationale.into(),
            flags: Vec::new(),
            veto: false,
            status,
        }
    }

    /// Whether this verdict counts toward aggregation.
    pub fn participates(&self) -> bool {
        self.status == VerdictStatus::Parsed
    }
}

/// Parses raw judge output. Never fails.
pub struct VerdictParser;

impl VerdictParser {
    pub fn parse(raw: &str) -> ParsedVerdict {
        if let Some(verdict) = Self::parse_json(raw) {
            return verdict;
        }
        if let Some(verdict) = Self::parse_lines(raw) {
            return verdict;
        }
        let preview: String = raw.chars().take(120).collect();
        ParsedVerdict::abstain(
            VerdictStatus::Unparseable,
            format!("no score found in judge output: {preview}"),
        )
    }

    fn parse_json(raw: &str) -> Option<ParsedVerdict> {
        let body = json_body(raw)?;
        let value: Value = serde_json::from_str(body).ok()?;
        let obj = value.as_object()?;
        let get = |key: &str| {
            obj.iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .map(|(_, v)| v)
        };

        let score = get("score").and_then(number_from_value);
        let confidence = get("confidence").and_then(number_from_value);
        let rationale = get("rationale")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let flags = match get("flags") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str())
                .map(normalize_flag)
                .filter(|f| !f.is_empty())
                .collect(),
            Some(Value::String(s)) => split_flags(s),
            _ => Vec::new(),
        };
        let veto = match get("veto") {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => truthy(s),
            _ => false,
        };

        build(score, confidence, rationale, flags, veto)
    }

    fn parse_lines(raw: &str) -> Option<ParsedVerdict> {
        let mut score = None;
        let mut confidence = None;
        let mut rationale = String::new();
        let mut flags = Vec::new();
        let mut veto = false;

        for caps in LINE_FIELD_RE.captures_iter(raw) {
            let key = caps[1].to_ascii_lowercase();
            let value = caps[2].trim();
            match key.as_str() {
                "score" if score.is_none() => score = leading_number(value),
                "confidence" if confidence.is_none() => {
                    confidence = leading_number(value).map(|c| {
                        if value.contains('%') {
                            c / 100.0
                        } else {
                            c
                        }
                    })
                }
                "rationale" if rationale.is_empty() => rationale = value.to_string(),
                "flags" => flags.extend(split_flags(value)),
                "veto" => veto |= truthy(value),
                _ => {}
            }
        }

        build(score, confidence, rationale, flags, veto)
    }
}

/// Whether a normalized flag signals a safety or correctness veto.
pub fn is_veto_flag(flag: &str) -> bool {
    VETO_FLAGS.contains(&flag)
}

fn build(
    score: Option<f64>,
    confidence: Option<f64>,
    rationale: String,
    flags: Vec<String>,
    veto: bool,
) -> Option<ParsedVerdict> {
    let veto = veto || flags.iter().any(|f| is_veto_flag(f));
    let Some(score) = score else {
        if !veto {
            return None;
        }
        let rationale = if rationale.is_empty() {
            "veto raised without a score".to_string()
        } else {
            rationale
        };
        return Some(ParsedVerdict {
            flags,
            veto,
            ..ParsedVerdict::abstain(VerdictStatus::Unparseable, rationale)
        });
    };
    let confidence = confidence.unwrap_or(DEFAULT_CONFIDENCE);
    // Percentages written without a % sign.
    let confidence = if confidence > 1.0 && confidence <= 100.0 {
        confidence / 100.0
    } else {
        confidence
    };
    Some(ParsedVerdict {
        score: score.clamp(0.0, MAX_SCORE),
        confidence: confidence.clamp(0.0, 1.0),
        rationale,
        flags,
        veto,
        status: VerdictStatus::Parsed,
    })
}

fn json_body(raw: &str) -> Option<&str> {
    let trimmed = raw.trim();
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') {
                return Some(inner);
            }
        }
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    (start < end).then(|| &trimmed[start..=end])
}

fn number_from_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64().filter(|f| f.is_finite()),
        Value::String(s) => {
            let n = leading_number(s)?;
            Some(if s.contains('%') { n / 100.0 } else { n })
        }
        _ => None,
    }
}

fn leading_number(text: &str) -> Option<f64> {
    LEADING_NUMBER_RE
        .find(text.trim())
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .filter(|f| f.is_finite())
}

fn split_flags(text: &str) -> Vec<String> {
    text.split([',', ';'])
        .map(normalize_flag)
        .filter(|f| !f.is_empty() && f != "none")
        .collect()
}

fn normalize_flag(flag: &str) -> String {
    flag.trim()
        .trim_matches(|c| c == '[' || c == ']' || c == '"')
        .trim()
        .to_ascii_lowercase()
        .replace([' ', '-'], "_")
}

fn truthy(text: &str) -> bool {
    matches!(
        text.trim().to_ascii_lowercase().as_str(),
        "true" | "yes" | "y" | "1"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_json_object() {
        let v = VerdictParser::parse(
            r#"{"score": 8, "confidence": 0.9, "rationale": "solid", "flags": ["Minor Gap"], "veto": false}"#,
        );
        assert_eq!(v.status, VerdictStatus::Parsed);
        assert_eq!(v.score, 8.0);
        assert_eq!(v.confidence, 0.9);
        assert_eq!(v.flags, vec!["minor_gap"]);
        assert!(!v.veto);
    }

    #[test]
    fn test_fenced_json_with_prose() {
        let raw = "My assessment:\n```json\n{\"score\": \"6/10\", \"confidence\": \"70%\"}\n```\nThanks.";
        let v = VerdictParser::parse(raw);
        assert_eq!(v.score, 6.0);
        assert!((v.confidence - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_line_format_matches_json() {
        let json = VerdictParser::parse(
            r#"{"score": 7.5, "confidence": 0.8, "rationale": "ok", "flags": ["needs_sources"], "veto": false}"#,
        );
        let lines = VerdictParser::parse(
            "SCORE: 7.5\nCONFIDENCE: 80%\nRATIONALE: ok\nFLAGS: needs sources\nVETO: no\n",
        );
        assert_eq!(json, lines);
    }

    #[test]
    fn test_markdown_decorated_lines() {
        let v = VerdictParser::parse("**Score:** 9/10\n- Confidence = 0.95\n");
        assert_eq!(v.score, 9.0);
        assert_eq!(v.confidence, 0.95);
    }

    #[test]
    fn test_veto_from_flag_or_key() {
        assert!(VerdictParser::parse("SCORE: 2\nVETO: true").veto);
        assert!(VerdictParser::parse(r#"{"score": 3, "flags": ["safety_veto"]}"#).veto);
        assert!(VerdictParser::parse("SCORE: 3\nFLAGS: safety veto, pii").veto);
    }

    #[test]
    fn test_scoreless_veto_is_kept() {
        let v = VerdictParser::parse("VETO: true\nRATIONALE: output leaks credentials");
        assert_eq!(v.status, VerdictStatus::Unparseable);
        assert!(!v.participates());
        assert!(v.veto);
        assert_eq!(v.rationale, "output leaks credentials");

        let v = VerdictParser::parse(r#"{"veto": true, "flags": ["pii"]}"#);
        assert!(v.veto);
        assert_eq!(v.flags, vec!["pii"]);
    }

    #[test]
    fn test_concern_flags_veto() {
        assert!(VerdictParser::parse("SCORE: 9\nFLAGS: safety_concern").veto);
        assert!(VerdictParser::parse(r#"{"score": 8, "flags": ["Correctness"]}"#).veto);
        assert!(VerdictParser::parse("FLAGS: correctness issue").veto);
        assert!(!VerdictParser::parse("SCORE: 9\nFLAGS: style, minor gap").veto);
    }

    #[test]
    fn test_out_of_range_values_clamped() {
        let v = VerdictParser::parse(r#"{"score": 14, "confidence": 250}"#);
        assert_eq!(v.score, 10.0);
        assert_eq!(v.confidence, 1.0);
    }

    #[test]
    fn test_missing_confidence_defaults() {
        let v = VerdictParser::parse("SCORE: 5");
        assert_eq!(v.confidence, DEFAULT_CONFIDENCE);
    }

    #[test]
    fn test_garbage_is_unparseable_not_error() {
        let v = VerdictParser::parse("I refuse to grade this.");
        assert_eq!(v.status, VerdictStatus::Unparseable);
        assert!(!v.participates());
        assert_eq!(v.confidence, 0.0);
    }
}
