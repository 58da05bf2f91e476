//! Pipeline configuration: loaded once at startup, passed into constructors.
//!
//! Resolution order: built-in defaults → TOML file → `TIERGATE_*` environment
//! variables. The binary applies CLI flags on top of the result.
//!
//! ```toml
//! [engine]
//! max_agent_retries = 2
//!
//! [[compression.budgets]]
//! source = "haiku"
//! target = "opus"
//! tokens = 300
//!
//! [pricing."claude-haiku"]
//! input_per_mtok = 0.8
//! output_per_mtok = 4.0
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

use crate::tier::Tier;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid tier '{0}' in config")]
    InvalidTier(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration for the engine and every gate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub engine: EngineConfig,
    pub compression: CompressionConfig,
    pub synthesis: SynthesisConfig,
    pub panel: PanelConfig,
    pub oracle: OracleConfig,
    /// Model id per tier, keyed by tier name or family alias.
    pub models: BTreeMap<String, String>,
    /// Per-model token prices.
    pub pricing: PricingTable,
}

/// Workflow engine limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Retries after a failed agent invocation before the task fails.
    pub max_agent_retries: u32,
    /// Validation rejections tolerated per task before escalation.
    pub max_validation_retries: u32,
    /// Per-invocation timeout in seconds.
    pub agent_timeout_secs: u64,
    /// Upper bound on research tasks produced by decomposition.
    pub max_research_tasks: usize,
    /// Output token allowance assumed when estimating a task's cost.
    pub default_output_tokens: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_agent_retries: 2,
            max_validation_retries: 6,
            agent_timeout_secs: 120,
            max_research_tasks: 4,
            default_output_tokens: 1024,
        }
    }
}

/// One entry of the tier-pair budget matrix as written in config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierPairBudget {
    pub source: String,
    pub target: String,
    pub tokens: u32,
}

/// Compression gate thresholds and budget overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Ratio up to which an overage is reported as minor.
    pub soft_threshold: f64,
    /// Ratio above which a handoff is rejected outright.
    pub hard_threshold: f64,
    /// Budget for tier pairs missing from the matrix.
    pub default_budget: u32,
    /// Overrides applied on top of the built-in matrix.
    pub budgets: Vec<TierPairBudget>,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            soft_threshold: 1.25,
            hard_threshold: 2.0,
            default_budget: 1000,
            budgets: Vec::new(),
        }
    }
}

/// Synthesis input validator limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    pub max_consecutive_rejections: u32,
    /// Fractional reduction in missing fields that counts as progress.
    pub progress_reset_threshold: f64,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            max_consecutive_rejections: 5,
            progress_reset_threshold: 0.5,
        }
    }
}

/// Judge panel thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PanelConfig {
    /// Standard deviation of scores (0–10 scale) above which judges disagree.
    pub disagreement_threshold: f64,
    /// Weighted mean confidence below which the panel escalates.
    pub min_confidence: f64,
    /// Weighted mean score required to pass.
    pub pass_score: f64,
    pub judge_timeout_secs: u64,
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            disagreement_threshold: 2.0,
            min_confidence: 0.6,
            pass_score: 7.0,
            judge_timeout_secs: 60,
        }
    }
}

/// Token oracle strategy selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    /// Counter names in preference order.
    pub strategies: Vec<String>,
    pub cache_capacity: usize,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            strategies: vec!["word_count".to_string(), "char_ratio".to_string()],
            cache_capacity: 1024,
        }
    }
}

/// Price of a model in currency units per million tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPrice {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
}

/// Model id → price. Unknown models are charged the fallback price.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PricingTable {
    pub models: BTreeMap<String, ModelPrice>,
    pub fallback: ModelPrice,
}

impl PricingTable {
    /// Price for `model`, or the fallback price.
    pub fn price_for(&self, model: &str) -> ModelPrice {
        self.models.get(model).copied().unwrap_or(self.fallback)
    }

    /// Cost of a call with the given token counts.
    pub fn cost(&self, tokens_in: u32, tokens_out: u32, model: &str) -> f64 {
        let price = self.price_for(model);
        (tokens_in as f64 * price.input_per_mtok + tokens_out as f64 * price.output_per_mtok)
            / 1_000_000.0
    }
}

impl Default for PricingTable {
    fn default() -> Self {
        let opus = ModelPrice {
            input_per_mtok: 15.0,
            output_per_mtok: 75.0,
        };
        let mut models = BTreeMap::new();
        models.insert("claude-opus".to_string(), opus);
        models.insert(
            "claude-sonnet".to_string(),
            ModelPrice {
                input_per_mtok: 3.0,
                output_per_mtok: 15.0,
            },
        );
        models.insert(
            "claude-haiku".to_string(),
            ModelPrice {
                input_per_mtok: 0.8,
                output_per_mtok: 4.0,
            },
        );
        // Unknown models are priced like the most expensive tier.
        Self {
            models,
            fallback: opus,
        }
    }
}

impl PipelineConfig {
    /// Parse configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = toml::from_str(text)?;
        Ok(config)
    }

    /// Read configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Defaults or file, then environment overrides, then validation.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Overlay `TIERGATE_*` environment variables.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Overlay values from an arbitrary key lookup (environment in production).
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let u32_var = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u32>().ok());
        let u64_var = |key: &str| {
            lookup(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .filter(|v| *v > 0)
        };
        let f64_var = |key: &str| lookup(key).and_then(|v| v.trim().parse::<f64>().ok());

        if let Some(v) = u32_var("TIERGATE_MAX_AGENT_RETRIES") {
            self.engine.max_agent_retries = v;
        }
        if let Some(v) = u32_var("TIERGATE_MAX_VALIDATION_RETRIES") {
            self.engine.max_validation_retries = v;
        }
        if let Some(v) = u64_var("TIERGATE_AGENT_TIMEOUT_SECS") {
            self.engine.agent_timeout_secs = v;
        }
        if let Some(v) = u64_var("TIERGATE_JUDGE_TIMEOUT_SECS") {
            self.panel.judge_timeout_secs = v;
        }
        if let Some(v) = f64_var("TIERGATE_MIN_CONFIDENCE") {
            self.panel.min_confidence = v;
        }
        if let Some(v) = f64_var("TIERGATE_DISAGREEMENT_THRESHOLD") {
            self.panel.disagreement_threshold = v;
        }
        if let Some(v) = f64_var("TIERGATE_PASS_SCORE") {
            self.panel.pass_score = v;
        }
        if let Some(v) = u32_var("TIERGATE_SYNTHESIS_MAX_REJECTIONS") {
            self.synthesis.max_consecutive_rejections = v;
        }
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.compression;
        if !c.soft_threshold.is_finite() || c.soft_threshold < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "compression.soft_threshold ({}) must be >= 1.0",
                c.soft_threshold
            )));
        }
        if !c.hard_threshold.is_finite() || c.hard_threshold < c.soft_threshold {
            return Err(ConfigError::Invalid(format!(
                "compression.hard_threshold ({}) must be >= soft_threshold ({})",
                c.hard_threshold, c.soft_threshold
            )));
        }
        if c.default_budget == 0 {
            return Err(ConfigError::Invalid(
                "compression.default_budget must be > 0".to_string(),
            ));
        }
        for entry in &c.budgets {
            entry
                .source
                .parse::<Tier>()
                .map_err(|_| ConfigError::InvalidTier(entry.source.clone()))?;
            entry
                .target
                .parse::<Tier>()
                .map_err(|_| ConfigError::InvalidTier(entry.target.clone()))?;
            if entry.tokens == 0 {
                return Err(ConfigError::Invalid(format!(
                    "budget for {}→{} must be > 0",
                    entry.source, entry.target
                )));
            }
        }
        if self.synthesis.max_consecutive_rejections == 0 {
            return Err(ConfigError::Invalid(
                "synthesis.max_consecutive_rejections must be > 0".to_string(),
            ));
        }
        let reset = self.synthesis.progress_reset_threshold;
        if reset.is_nan() || reset <= 0.0 || reset > 1.0 {
            return Err(ConfigError::Invalid(format!(
                "synthesis.progress_reset_threshold ({reset}) must be within (0.0, 1.0]"
            )));
        }
        if self.engine.agent_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "engine.agent_timeout_secs must be > 0".to_string(),
            ));
        }
        if self.panel.judge_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "panel.judge_timeout_secs must be > 0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.panel.min_confidence) {
            return Err(ConfigError::Invalid(format!(
                "panel.min_confidence ({}) must be within 0.0–1.0",
                self.panel.min_confidence
            )));
        }
        if !(0.0..=crate::panel::verdict::MAX_SCORE).contains(&self.panel.pass_score) {
            return Err(ConfigError::Invalid(format!(
                "panel.pass_score ({}) must be within 0–10",
                self.panel.pass_score
            )));
        }
        if self.panel.disagreement_threshold.is_nan() || self.panel.disagreement_threshold < 0.0 {
            return Err(ConfigError::Invalid(
                "panel.disagreement_threshold must be >= 0".to_string(),
            ));
        }
        for key in self.models.keys() {
            key.parse::<Tier>()
                .map_err(|_| ConfigError::InvalidTier(key.clone()))?;
        }
        Ok(())
    }

    /// Model assigned to `tier`, honouring overrides.
    pub fn model_for(&self, tier: Tier) -> String {
        self.models
            .iter()
            .find(|(key, _)| key.parse::<Tier>().ok() == Some(tier))
            .map(|(_, model)| model.clone())
            .unwrap_or_else(|| tier.default_model().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_validate() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.synthesis.max_consecutive_rejections, 5);
        assert_eq!(config.compression.hard_threshold, 2.0);
    }

    #[test]
    fn test_toml_partial_override() {
        let config = PipelineConfig::from_toml_str(
            r#"
            [engine]
            max_agent_retries = 4

            [[compression.budgets]]
            source = "haiku"
            target = "opus"
            tokens = 450

            [models]
            sonnet = "claude-sonnet-next"
            "#,
        )
        .unwrap();
        assert_eq!(config.engine.max_agent_retries, 4);
        // Untouched fields keep their defaults.
        assert_eq!(config.engine.max_validation_retries, 6);
        assert_eq!(config.compression.budgets.len(), 1);
        assert_eq!(config.model_for(Tier::Analytical), "claude-sonnet-next");
        assert_eq!(config.model_for(Tier::Execution), "claude-haiku");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_tier_rejected() {
        let config = PipelineConfig::from_toml_str(
            r#"
            [[compression.budgets]]
            source = "gpt"
            target = "opus"
            tokens = 10
            "#,
        )
        .unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::InvalidTier(t)) if t == "gpt"));
    }

    #[test]
    fn test_threshold_ordering_enforced() {
        let mut config = PipelineConfig::default();
        config.compression.hard_threshold = 1.1;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_nan_and_zero_values_rejected() {
        let mut config = PipelineConfig::default();
        config.compression.soft_threshold = f64::NAN;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.compression.hard_threshold = f64::NAN;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.panel.disagreement_threshold = f64::NAN;
        assert!(config.validate().is_err());

        for reset in [0.0, 1.5, f64::NAN] {
            let mut config = PipelineConfig::default();
            config.synthesis.progress_reset_threshold = reset;
            assert!(config.validate().is_err(), "reset {reset} accepted");
        }

        let config = PipelineConfig::from_toml_str("[engine]\nagent_timeout_secs = 0\n").unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid(msg)) if msg.contains("agent_timeout_secs")
        ));
    }

    #[test]
    fn test_overrides_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("TIERGATE_MAX_AGENT_RETRIES", "7"),
            ("TIERGATE_MIN_CONFIDENCE", "0.75"),
            ("TIERGATE_AGENT_TIMEOUT_SECS", "0"),
        ]
        .into_iter()
        .collect();
        let mut config = PipelineConfig::default();
        config.apply_overrides_from(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.engine.max_agent_retries, 7);
        assert_eq!(config.panel.min_confidence, 0.75);
        // Zero timeouts are ignored.
        assert_eq!(config.engine.agent_timeout_secs, 120);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiergate.toml");
        std::fs::write(&path, "[panel]\npass_score = 8.5\n").unwrap();
        let config = PipelineConfig::from_file(&path).unwrap();
        assert_eq!(config.panel.pass_score, 8.5);
    }

    #[test]
    fn test_pricing_cost() {
        let pricing = PricingTable::default();
        let cost = pricing.cost(1_000_000, 0, "claude-haiku");
        assert!((cost - 0.8).abs() < 1e-9);
        // Unknown model charged at the fallback price.
        let unknown = pricing.cost(0, 1_000_000, "mystery");
        assert!((unknown - 75.0).abs() < 1e-9);
    }
}
