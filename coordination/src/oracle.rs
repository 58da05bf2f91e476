//! Token budget oracle: token estimates and per-model cost.
//!
//! The gates consume the [`TokenBudgetOracle`] trait. [`TieredTokenOracle`]
//! is the bundled implementation: a list of counting strategies is
//! capability-checked once at construction, the first available one serves
//! every estimate, and a character-ratio counter that cannot fail always
//! terminates the chain. The character ratio is also a floor under every
//! estimate: word-based heuristics see unspaced payloads (minified JSON,
//! base64, long URLs) as one or two words and would undercount them.

use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use tracing::{debug, info};

use crate::config::{OracleConfig, PricingTable};

/// How much to trust a token estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimateConfidence {
    /// Produced by the model's own tokenizer.
    Exact,
    /// Close approximation (e.g. a compatible BPE tokenizer).
    Approximate,
    /// Word-based heuristic.
    Heuristic,
    /// Last-resort character ratio.
    Fallback,
}

impl std::fmt::Display for EstimateConfidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exact => write!(f, "exact"),
            Self::Approximate => write!(f, "approximate"),
            Self::Heuristic => write!(f, "heuristic"),
            Self::Fallback => write!(f, "fallback"),
        }
    }
}

/// Token count plus the confidence tag of the strategy that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenEstimate {
    pub count: u32,
    pub confidence: EstimateConfidence,
}

/// Contract every gate consumes. Implementations never fail.
pub trait TokenBudgetOracle: Send + Sync {
    /// Estimate the number of tokens in `text`.
    fn estimate_tokens(&self, text: &str) -> TokenEstimate;

    /// Cost of a call to `model` with the given token counts.
    fn estimate_cost(&self, tokens_in: u32, tokens_out: u32, model: &str) -> f64;
}

/// A single counting strategy in the oracle chain.
pub trait TokenCounter: Send + Sync {
    /// Strategy name for logging and config.
    fn name(&self) -> &str;

    /// Confidence tag attached to this strategy's counts.
    fn confidence(&self) -> EstimateConfidence;

    /// Whether the strategy can run in this process (checked once).
    fn is_available(&self) -> bool {
        true
    }

    /// Count tokens in `text`.
    fn count(&self, text: &str) -> u32;
}

/// Word-count based counter (words × factor).
///
/// Uses the approximation of ~1.3 tokens per English word.
#[derive(Debug, Clone)]
pub struct WordCountCounter {
    pub factor: f64,
}

impl Default for WordCountCounter {
    fn default() -> Self {
        Self { factor: 1.3 }
    }
}

impl TokenCounter for WordCountCounter {
    fn name(&self) -> &str {
        "word_count"
    }

    fn confidence(&self) -> EstimateConfidence {
        EstimateConfidence::Heuristic
    }

    fn count(&self, text: &str) -> u32 {
        let words = text.split_whitespace().count();
        (words as f64 * self.factor).ceil() as u32
    }
}

/// Character-ratio counter (chars / divisor). Always available.
#[derive(Debug, Clone)]
pub struct CharRatioCounter {
    pub chars_per_token: f64,
}

impl Default for CharRatioCounter {
    fn default() -> Self {
        Self {
            chars_per_token: 4.0,
        }
    }
}

impl TokenCounter for CharRatioCounter {
    fn name(&self) -> &str {
        "char_ratio"
    }

    fn confidence(&self) -> EstimateConfidence {
        EstimateConfidence::Fallback
    }

    fn count(&self, text: &str) -> u32 {
        (text.chars().count() as f64 / self.chars_per_token).ceil() as u32
    }
}

/// Build a built-in counter by config name.
pub fn counter_by_name(name: &str) -> Option<Box<dyn TokenCounter>> {
    match name {
        "word_count" => Some(Box::new(WordCountCounter::default())),
        "char_ratio" => Some(Box::new(CharRatioCounter::default())),
        _ => None,
    }
}

/// Oracle backed by a capability-checked strategy chain and a memo cache.
pub struct TieredTokenOracle {
    counters: Vec<Box<dyn TokenCounter>>,
    floor: CharRatioCounter,
    pricing: PricingTable,
    cache: Mutex<HashMap<u64, TokenEstimate>>,
    cache_capacity: usize,
}

impl TieredTokenOracle {
    /// Keep only available counters; append the char-ratio fallback if the
    /// chain does not already end with an always-available counter.
    pub fn new(counters: Vec<Box<dyn TokenCounter>>, pricing: PricingTable) -> Self {
        let mut available: Vec<Box<dyn TokenCounter>> =
            counters.into_iter().filter(|c| c.is_available()).collect();
        if !available.iter().any(|c| c.name() == "char_ratio") {
            available.push(Box::new(CharRatioCounter::default()));
        }
        let names: Vec<&str> = available.iter().map(|c| c.name()).collect();
        info!(strategies = ?names, "Token oracle strategies selected");
        Self {
            counters: available,
            floor: CharRatioCounter::default(),
            pricing,
            cache: Mutex::new(HashMap::new()),
            cache_capacity: 1024,
        }
    }

    /// Build from config; unknown strategy names are skipped.
    pub fn from_config(config: &OracleConfig, pricing: PricingTable) -> Self {
        let counters = config
            .strategies
            .iter()
            .filter_map(|name| {
                let counter = counter_by_name(name);
                if counter.is_none() {
                    debug!(strategy = %name, "Unknown token counter skipped");
                }
                counter
            })
            .collect();
        let mut oracle = Self::new(counters, pricing);
        oracle.cache_capacity = config.cache_capacity;
        oracle
    }

    /// Names of the strategies that passed the capability check, in order.
    pub fn available_strategies(&self) -> Vec<&str> {
        self.counters.iter().map(|c| c.name()).collect()
    }

    fn cache_key(text: &str) -> u64 {
        let mut hasher = DefaultHasher::new();
        text.hash(&mut hasher);
        hasher.finish()
    }
}

impl TokenBudgetOracle for TieredTokenOracle {
    fn estimate_tokens(&self, text: &str) -> TokenEstimate {
        let key = Self::cache_key(text);
        if let Ok(cache) = self.cache.lock() {
            if let Some(hit) = cache.get(&key) {
                return *hit;
            }
        }

        let floor = self.floor.count(text);
        let primary = self
            .counters
            .first()
            .map(|counter| (counter.count(text), counter.confidence()));
        let estimate = match primary {
            Some((count, confidence)) if count >= floor => TokenEstimate { count, confidence },
            _ => TokenEstimate {
                count: floor,
                confidence: EstimateConfidence::Fallback,
            },
        };

        if let Ok(mut cache) = self.cache.lock() {
            if cache.len() >= self.cache_capacity {
                cache.clear();
            }
            if self.cache_capacity > 0 {
                cache.insert(key, estimate);
            }
        }
        estimate
    }

    fn estimate_cost(&self, tokens_in: u32, tokens_out: u32, model: &str) -> f64 {
        self.pricing.cost(tokens_in, tokens_out, model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct UnavailableCounter;

    impl TokenCounter for UnavailableCounter {
        fn name(&self) -> &str {
            "tokenizer"
        }
        fn confidence(&self) -> EstimateConfidence {
            EstimateConfidence::Exact
        }
        fn is_available(&self) -> bool {
            false
        }
        fn count(&self, _text: &str) -> u32 {
            unreachable!("unavailable counters are never consulted")
        }
    }

    #[test]
    fn test_word_count_counter() {
        let counter = WordCountCounter::default();
        assert_eq!(counter.count("one two three four five six seven eight nine ten"), 13);
        assert_eq!(counter.count(""), 0);
    }

    #[test]
    fn test_char_ratio_counter() {
        let counter = CharRatioCounter::default();
        assert_eq!(counter.count("abcdefgh"), 2);
        assert_eq!(counter.count("abcde"), 2);
    }

    #[test]
    fn test_unavailable_strategy_dropped_at_construction() {
        let oracle = TieredTokenOracle::new(
            vec![
                Box::new(UnavailableCounter),
                Box::new(WordCountCounter::default()),
            ],
            PricingTable::default(),
        );
        assert_eq!(oracle.available_strategies(), vec!["word_count", "char_ratio"]);
        let est = oracle.estimate_tokens("hello world");
        assert_eq!(est.confidence, EstimateConfidence::Heuristic);
    }

    #[test]
    fn test_empty_chain_falls_back_to_char_ratio() {
        let oracle = TieredTokenOracle::new(Vec::new(), PricingTable::default());
        let est = oracle.estimate_tokens("abcdefgh");
        assert_eq!(est.count, 2);
        assert_eq!(est.confidence, EstimateConfidence::Fallback);
    }

    #[test]
    fn test_unspaced_text_floored_by_char_ratio() {
        let oracle =
            TieredTokenOracle::from_config(&OracleConfig::default(), PricingTable::default());
        assert_eq!(oracle.available_strategies(), vec!["word_count", "char_ratio"]);

        let blob = "x".repeat(4000);
        let est = oracle.estimate_tokens(&blob);
        assert_eq!(est.count, 1000);
        assert_eq!(est.confidence, EstimateConfidence::Fallback);

        // Ordinary prose keeps the word-count estimate when it is the larger one.
        let prose = oracle.estimate_tokens("a b c d e f g h i j");
        assert_eq!(prose.count, 13);
        assert_eq!(prose.confidence, EstimateConfidence::Heuristic);
    }

    #[test]
    fn test_from_config_skips_unknown() {
        let config = OracleConfig {
            strategies: vec!["nonexistent".into(), "char_ratio".into()],
            cache_capacity: 4,
        };
        let oracle = TieredTokenOracle::from_config(&config, PricingTable::default());
        assert_eq!(oracle.available_strategies(), vec!["char_ratio"]);
    }

    #[test]
    fn test_cache_returns_same_estimate() {
        let oracle = TieredTokenOracle::new(Vec::new(), PricingTable::default());
        let a = oracle.estimate_tokens("repeated text");
        let b = oracle.estimate_tokens("repeated text");
        assert_eq!(a, b);
    }

    #[test]
    fn test_estimate_cost_uses_pricing() {
        let oracle = TieredTokenOracle::new(Vec::new(), PricingTable::default());
        let cost = oracle.estimate_cost(1_000_000, 1_000_000, "claude-sonnet");
        assert!((cost - 18.0).abs() < 1e-9);
    }
}
