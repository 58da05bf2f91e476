//! Cost circuit breaker: tracks cumulative spend against a workflow budget.
//!
//! Two states only. Once open the breaker stays open for the life of the
//! workflow; there is no cooldown or half-open probe because a spent budget
//! does not recover.
//!
//! `record_spend` is the single mutator of cumulative cost. Each charge
//! carries an id and a repeated id is refused, so a retried bookkeeping call
//! can never double-count an execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;
use tracing::{debug, warn};

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Spend allowed.
    Closed,
    /// Tripped; every further request is refused.
    Open,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
        }
    }
}

/// What tripped the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TripCause {
    /// Budget limit was zero or negative.
    NonPositiveBudget,
    /// An estimate would have crossed the limit.
    EstimateExceedsBudget,
    /// Recorded spend crossed the limit.
    SpendExceededBudget,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripDetails {
    pub cause: TripCause,
    pub at: DateTime<Utc>,
    /// Cumulative spend when the breaker tripped.
    pub cumulative: f64,
    /// Estimate or charge that tripped it.
    pub attempted: f64,
}

/// Point-in-time view for snapshots and error messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub limit: f64,
    pub cumulative: f64,
    pub remaining: f64,
    pub state: BreakerState,
    pub trip: Option<TripDetails>,
    pub charges: usize,
}

impl std::fmt::Display for BreakerSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "breaker {} (spent ${:.4} of ${:.4}, ${:.4} remaining)",
            self.state, self.cumulative, self.limit, self.remaining
        )
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BreakerError {
    #[error("charge '{0}' was already recorded")]
    DuplicateCharge(String),

    #[error("invalid spend amount {0}")]
    InvalidAmount(f64),
}

/// Per-workflow spend guard.
#[derive(Debug, Clone)]
pub struct CostCircuitBreaker {
    limit: f64,
    cumulative: f64,
    state: BreakerState,
    trip: Option<TripDetails>,
    charges: HashSet<String>,
}

impl CostCircuitBreaker {
    pub fn new(limit: f64) -> Self {
        Self {
            limit,
            cumulative: 0.0,
            state: BreakerState::Closed,
            trip: None,
            charges: HashSet::new(),
        }
    }

    pub fn limit(&self) -> f64 {
        self.limit
    }

    pub fn cumulative(&self) -> f64 {
        self.cumulative
    }

    pub fn remaining(&self) -> f64 {
        (self.limit - self.cumulative).max(0.0)
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == BreakerState::Open
    }

    pub fn trip_details(&self) -> Option<&TripDetails> {
        self.trip.as_ref()
    }

    /// Whether a call estimated at `estimated` may proceed. Refusal trips
    /// the breaker.
    pub fn allow(&mut self, estimated: f64) -> bool {
        if self.is_open() {
            return false;
        }
        if self.limit.is_nan() || self.limit <= 0.0 {
            self.trip(TripCause::NonPositiveBudget, estimated);
            return false;
        }
        let estimated = if estimated.is_finite() { estimated.max(0.0) } else { f64::MAX };
        if self.cumulative + estimated > self.limit {
            self.trip(TripCause::EstimateExceedsBudget, estimated);
            return false;
        }
        debug!(
            estimated,
            cumulative = self.cumulative,
            limit = self.limit,
            "Spend allowed"
        );
        true
    }

    /// Record an actual charge. Returns the state after recording.
    pub fn record_spend(
        &mut self,
        charge_id: impl Into<String>,
        amount: f64,
    ) -> Result<BreakerState, BreakerError> {
        if !amount.is_finite() || amount < 0.0 {
            return Err(BreakerError::InvalidAmount(amount));
        }
        let charge_id = charge_id.into();
        if self.charges.contains(&charge_id) {
            return Err(BreakerError::DuplicateCharge(charge_id));
        }
        self.charges.insert(charge_id);
        self.cumulative += amount;

        if !self.is_open() && self.cumulative > self.limit {
            self.trip(TripCause::SpendExceededBudget, amount);
        }
        Ok(self.state)
    }

    pub fn has_charge(&self, charge_id: &str) -> bool {
        self.charges.contains(charge_id)
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            limit: self.limit,
            cumulative: self.cumulative,
            remaining: self.remaining(),
            state: self.state,
            trip: self.trip.clone(),
            charges: self.charges.len(),
        }
    }

    fn trip(&mut self, cause: TripCause, attempted: f64) {
        warn!(
            ?cause,
            attempted,
            cumulative = self.cumulative,
            limit = self.limit,
            "Cost circuit breaker tripped"
        );
        self.state = BreakerState::Open;
        self.trip = Some(TripDetails {
            cause,
            at: Utc::now(),
            cumulative: self.cumulative,
            attempted,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allows_within_budget() {
        let mut b = CostCircuitBreaker::new(1.0);
        assert!(b.allow(0.4));
        assert_eq!(b.record_spend("t1#1", 0.4).unwrap(), BreakerState::Closed);
        assert!(b.allow(0.6));
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn test_estimate_over_remaining_trips_and_stays_open() {
        let mut b = CostCircuitBreaker::new(1.0);
        b.record_spend("t1#1", 0.7).unwrap();
        assert!(!b.allow(0.31));
        assert!(b.is_open());
        assert_eq!(
            b.trip_details().unwrap().cause,
            TripCause::EstimateExceedsBudget
        );
        // No half-open recovery.
        assert!(!b.allow(0.0));
    }

    #[test]
    fn test_non_positive_budget_refuses_everything() {
        for limit in [0.0, -5.0] {
            let mut b = CostCircuitBreaker::new(limit);
            assert!(!b.allow(0.0));
            assert_eq!(b.trip_details().unwrap().cause, TripCause::NonPositiveBudget);
        }
    }

    #[test]
    fn test_duplicate_charge_rejected() {
        let mut b = CostCircuitBreaker::new(1.0);
        b.record_spend("t1#1", 0.2).unwrap();
        assert_eq!(
            b.record_spend("t1#1", 0.2).unwrap_err(),
            BreakerError::DuplicateCharge("t1#1".into())
        );
        assert!((b.cumulative() - 0.2).abs() < 1e-12);
        assert_eq!(b.snapshot().charges, 1);
    }

    #[test]
    fn test_spend_past_limit_trips() {
        let mut b = CostCircuitBreaker::new(1.0);
        assert_eq!(b.record_spend("a", 1.5).unwrap(), BreakerState::Open);
        assert_eq!(b.trip_details().unwrap().cause, TripCause::SpendExceededBudget);
        assert_eq!(b.remaining(), 0.0);
    }

    #[test]
    fn test_invalid_amounts() {
        let mut b = CostCircuitBreaker::new(1.0);
        assert!(b.record_spend("neg", -0.1).is_err());
        assert!(b.record_spend("nan", f64::NAN).is_err());
        assert!(!b.has_charge("neg"));
    }

    #[test]
    fn test_closed_breaker_never_exceeds_limit() {
        let mut b = CostCircuitBreaker::new(1.0);
        let mut i = 0;
        while b.allow(0.3) {
            i += 1;
            b.record_spend(format!("c{i}"), 0.3).unwrap();
            assert!(b.cumulative() <= b.limit());
        }
        assert_eq!(i, 3);
    }
}
