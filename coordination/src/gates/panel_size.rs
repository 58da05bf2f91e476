//! Panel size selection from task risk.
//!
//! ```text
//! score = reversibility (0–4) + blast radius (0–3) + domain (1–2) + impact (0–4)
//!
//! 0–3  → 3 judges
//! 4–7  → 5 judges
//! 8+   → 7 judges
//! ```
//!
//! Callers may ask for a larger panel than the score warrants, never a
//! smaller one.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::GateError;
use crate::panel::judge::ROSTER_SIZE;

/// How hard the outcome is to undo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reversibility {
    Reversible,
    Easy,
    Moderate,
    Difficult,
    Irreversible,
}

impl Reversibility {
    pub fn score(self) -> u8 {
        match self {
            Self::Reversible => 0,
            Self::Easy => 1,
            Self::Moderate => 2,
            Self::Difficult => 3,
            Self::Irreversible => 4,
        }
    }
}

/// Who is affected when the outcome is wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlastRadius {
    Internal,
    Team,
    Organization,
    External,
}

impl BlastRadius {
    pub fn score(self) -> u8 {
        match self {
            Self::Internal => 0,
            Self::Team => 1,
            Self::Organization => 2,
            Self::External => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Business,
    Software,
    Hardware,
    Mixed,
}

impl Domain {
    /// Physical and cross-domain work weighs more.
    pub fn score(self) -> u8 {
        match self {
            Self::Business | Self::Software => 1,
            Self::Hardware | Self::Mixed => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Impact {
    Low,
    Moderate,
    High,
    Severe,
    Critical,
}

impl Impact {
    pub fn score(self) -> u8 {
        match self {
            Self::Low => 0,
            Self::Moderate => 1,
            Self::High => 2,
            Self::Severe => 3,
            Self::Critical => 4,
        }
    }
}

/// Risk inputs for a task under review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMetadata {
    pub reversibility: Reversibility,
    pub blast_radius: BlastRadius,
    pub domain: Domain,
    pub impact: Impact,
}

impl TaskMetadata {
    pub fn new(
        reversibility: Reversibility,
        blast_radius: BlastRadius,
        domain: Domain,
        impact: Impact,
    ) -> Self {
        Self {
            reversibility,
            blast_radius,
            domain,
            impact,
        }
    }

    /// Lowest-risk metadata (score 1).
    pub fn low_risk() -> Self {
        Self::new(
            Reversibility::Reversible,
            BlastRadius::Internal,
            Domain::Software,
            Impact::Low,
        )
    }
}

/// Per-dimension contributions to the risk score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub reversibility: u8,
    pub blast_radius: u8,
    pub domain: u8,
    pub impact: u8,
}

impl ScoreBreakdown {
    pub fn from_metadata(meta: &TaskMetadata) -> Self {
        Self {
            reversibility: meta.reversibility.score(),
            blast_radius: meta.blast_radius.score(),
            domain: meta.domain.score(),
            impact: meta.impact.score(),
        }
    }

    pub fn total(&self) -> u8 {
        self.reversibility + self.blast_radius + self.domain + self.impact
    }
}

/// Chosen panel size with its justification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PanelSelection {
    pub size: usize,
    /// Size the score alone produced.
    pub computed_size: usize,
    pub score: u8,
    pub breakdown: ScoreBreakdown,
    pub justification: String,
    pub overridden: bool,
}

/// Map a total risk score to a panel size.
pub fn panel_size_for_score(score: u8) -> usize {
    match score {
        0..=3 => 3,
        4..=7 => 5,
        _ => 7,
    }
}

/// Stateless selector; holds only the number of judges available.
#[derive(Debug, Clone)]
pub struct PanelSizeSelector {
    available_judges: usize,
}

impl PanelSizeSelector {
    pub fn new(available_judges: usize) -> Self {
        Self { available_judges }
    }

    pub fn available_judges(&self) -> usize {
        self.available_judges
    }

    /// Size the panel from risk metadata alone.
    pub fn select_panel(&self, meta: &TaskMetadata) -> PanelSelection {
        let breakdown = ScoreBreakdown::from_metadata(meta);
        let score = breakdown.total();
        let size = panel_size_for_score(score).min(self.available_judges.max(1));
        let justification = format!(
            "risk score {score} (reversibility {}, blast radius {}, domain {}, impact {}) → {size} judges",
            breakdown.reversibility, breakdown.blast_radius, breakdown.domain, breakdown.impact
        );
        debug!(score, size, "Panel size selected");
        PanelSelection {
            size,
            computed_size: size,
            score,
            breakdown,
            justification,
            overridden: false,
        }
    }

    /// Size the panel, honouring an explicit request only if it grows the panel.
    pub fn select_with_override(
        &self,
        meta: &TaskMetadata,
        requested: Option<usize>,
    ) -> Result<PanelSelection, GateError> {
        let mut selection = self.select_panel(meta);
        let Some(requested) = requested else {
            return Ok(selection);
        };

        if requested < selection.computed_size {
            return Err(GateError::PanelSizeDowngradeRejected {
                requested,
                computed: selection.computed_size,
            });
        }
        if requested > self.available_judges {
            return Err(GateError::PanelSizeUnavailable {
                requested,
                available: self.available_judges,
            });
        }
        if requested > selection.size {
            info!(
                computed = selection.computed_size,
                requested, "Panel size raised by override"
            );
            selection.justification = format!(
                "{}; raised to {requested} by caller override",
                selection.justification
            );
            selection.size = requested;
            selection.overridden = true;
        }
        Ok(selection)
    }
}

impl Default for PanelSizeSelector {
    fn default() -> Self {
        Self::new(ROSTER_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(r: Reversibility, b: BlastRadius, d: Domain, i: Impact) -> TaskMetadata {
        TaskMetadata::new(r, b, d, i)
    }

    #[test]
    fn test_score_bands() {
        assert_eq!(panel_size_for_score(0), 3);
        assert_eq!(panel_size_for_score(3), 3);
        assert_eq!(panel_size_for_score(4), 5);
        assert_eq!(panel_size_for_score(7), 5);
        assert_eq!(panel_size_for_score(8), 7);
        assert_eq!(panel_size_for_score(13), 7);
    }

    #[test]
    fn test_low_risk_gets_three() {
        let sel = PanelSizeSelector::default().select_panel(&TaskMetadata::low_risk());
        assert_eq!(sel.score, 1);
        assert_eq!(sel.size, 3);
        assert!(!sel.overridden);
    }

    #[test]
    fn test_score_seven_gets_five() {
        let m = meta(
            Reversibility::Moderate,
            BlastRadius::Team,
            Domain::Hardware,
            Impact::High,
        );
        let sel = PanelSizeSelector::default().select_panel(&m);
        assert_eq!(sel.score, 7);
        assert_eq!(sel.size, 5);
        assert_eq!(sel.breakdown.domain, 2);
    }

    #[test]
    fn test_score_eight_gets_seven() {
        let m = meta(
            Reversibility::Difficult,
            BlastRadius::Organization,
            Domain::Software,
            Impact::High,
        );
        let sel = PanelSizeSelector::default().select_panel(&m);
        assert_eq!(sel.score, 8);
        assert_eq!(sel.size, 7);
    }

    #[test]
    fn test_downgrade_rejected() {
        let m = meta(
            Reversibility::Moderate,
            BlastRadius::Team,
            Domain::Hardware,
            Impact::High,
        );
        let err = PanelSizeSelector::default()
            .select_with_override(&m, Some(3))
            .unwrap_err();
        assert_eq!(
            err,
            GateError::PanelSizeDowngradeRejected {
                requested: 3,
                computed: 5
            }
        );
    }

    #[test]
    fn test_upgrade_accepted() {
        let m = meta(
            Reversibility::Moderate,
            BlastRadius::Team,
            Domain::Hardware,
            Impact::High,
        );
        let sel = PanelSizeSelector::default()
            .select_with_override(&m, Some(7))
            .unwrap();
        assert_eq!(sel.size, 7);
        assert_eq!(sel.computed_size, 5);
        assert!(sel.overridden);
        assert!(sel.justification.contains("override"));
    }

    #[test]
    fn test_override_beyond_roster_unavailable() {
        let err = PanelSizeSelector::default()
            .select_with_override(&TaskMetadata::low_risk(), Some(9))
            .unwrap_err();
        assert!(matches!(err, GateError::PanelSizeUnavailable { requested: 9, .. }));
    }

    #[test]
    fn test_equal_override_is_not_flagged() {
        let sel = PanelSizeSelector::default()
            .select_with_override(&TaskMetadata::low_risk(), Some(3))
            .unwrap();
        assert_eq!(sel.size, 3);
        assert!(!sel.overridden);
    }
}
