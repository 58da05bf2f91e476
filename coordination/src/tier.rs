//! Agent tiers: cost/capability classes in the pipeline hierarchy.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Cost/capability class of an agent.
///
/// The numeric level follows the pipeline convention: lower is more
/// expensive and more strategic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Tier 0: orchestrator-level strategic planning.
    Orchestrator,
    /// Tier 1: opus-class strategic reasoning.
    Strategic,
    /// Tier 2: sonnet-class analysis and synthesis.
    Analytical,
    /// Tier 3: haiku-class execution.
    Execution,
}

impl Tier {
    /// All tiers, most expensive first.
    pub fn all() -> &'static [Tier] {
        &[
            Self::Orchestrator,
            Self::Strategic,
            Self::Analytical,
            Self::Execution,
        ]
    }

    /// Numeric tier level (0–3).
    pub fn level(self) -> u8 {
        match self {
            Self::Orchestrator => 0,
            Self::Strategic => 1,
            Self::Analytical => 2,
            Self::Execution => 3,
        }
    }

    /// Tier for a numeric level.
    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            0 => Some(Self::Orchestrator),
            1 => Some(Self::Strategic),
            2 => Some(Self::Analytical),
            3 => Some(Self::Execution),
            _ => None,
        }
    }

    /// Model family alias used in config files and on the command line.
    pub fn family(self) -> &'static str {
        match self {
            Self::Orchestrator | Self::Strategic => "opus",
            Self::Analytical => "sonnet",
            Self::Execution => "haiku",
        }
    }

    /// Default model id for agents at this tier.
    pub fn default_model(self) -> &'static str {
        match self {
            Self::Orchestrator | Self::Strategic => "claude-opus",
            Self::Analytical => "claude-sonnet",
            Self::Execution => "claude-haiku",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Orchestrator => write!(f, "orchestrator"),
            Self::Strategic => write!(f, "strategic"),
            Self::Analytical => write!(f, "analytical"),
            Self::Execution => write!(f, "execution"),
        }
    }
}

impl FromStr for Tier {
    type Err = String;

    /// Accepts tier names, family aliases (`opus`, `sonnet`, `haiku`) and
    /// numeric levels. `opus` resolves to [`Tier::Strategic`].
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "0" | "orchestrator" => Ok(Self::Orchestrator),
            "1" | "strategic" | "opus" => Ok(Self::Strategic),
            "2" | "analytical" | "sonnet" => Ok(Self::Analytical),
            "3" | "execution" | "haiku" => Ok(Self::Execution),
            other => Err(format!("unknown tier '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels_roundtrip() {
        for tier in Tier::all() {
            assert_eq!(Tier::from_level(tier.level()), Some(*tier));
        }
        assert_eq!(Tier::from_level(4), None);
    }

    #[test]
    fn test_parse_family_aliases() {
        assert_eq!("haiku".parse::<Tier>().unwrap(), Tier::Execution);
        assert_eq!("Sonnet".parse::<Tier>().unwrap(), Tier::Analytical);
        assert_eq!("opus".parse::<Tier>().unwrap(), Tier::Strategic);
        assert_eq!("0".parse::<Tier>().unwrap(), Tier::Orchestrator);
        assert!("gpt".parse::<Tier>().is_err());
    }

    #[test]
    fn test_ordering_follows_level() {
        assert!(Tier::Orchestrator < Tier::Execution);
        assert!(Tier::Strategic < Tier::Analytical);
    }
}
