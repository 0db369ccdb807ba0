//! Weekly weight-decay model
//!
//! One facility-wide weekly loss rate drives every estimate in the engine:
//! orchestrator defaults, finalization fallbacks and timeline backfill.
//! Measured weights always win over these estimates.
use super::types::Weight;

/// Weekly loss fraction used when no configuration says otherwise.
pub const DEFAULT_WEEKLY_RATE: f64 = 0.0366;

/// Box transfers from intake to finalization.
pub const LIFECYCLE_STAGES: u32 = 7;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecayModel {
    rate_per_week: f64,
}

impl DecayModel {
    /// `rate` is clamped into `[0, 1)`; a non-finite rate falls back to zero loss.
    pub fn new(rate: f64) -> Self {
        let rate_per_week = if rate.is_finite() {
            rate.clamp(0.0, 0.999_999)
        } else {
            0.0
        };
        Self { rate_per_week }
    }

    pub fn rate(&self) -> f64 {
        self.rate_per_week
    }

    /// `weight × (1 − r)^weeks`, rounded to the nearest gram.
    ///
    /// With a positive rate at least one week always costs at least one gram,
    /// so a few grams still decay where plain rounding would keep them.
    pub fn expected(&self, weight: Weight, weeks: u32) -> Weight {
        if weeks == 0 || weight.is_zero() || self.rate_per_week == 0.0 {
            return weight;
        }
        let factor = (1.0 - self.rate_per_week).powi(weeks as i32);
        let grams = (weight.grams() as f64 * factor).round() as u64;
        Weight::from_grams(grams.min(weight.grams() - 1))
    }

    /// Estimate for the next weekly stage.
    pub fn next_week(&self, weight: Weight) -> Weight {
        self.expected(weight, 1)
    }

    /// Expected finished mass for freshly collected material.
    pub fn project_final(&self, initial: Weight) -> Weight {
        self.expected(initial, LIFECYCLE_STAGES)
    }

    /// Fraction of mass lost over the full lifecycle.
    pub fn lifecycle_loss(&self) -> f64 {
        1.0 - (1.0 - self.rate_per_week).powi(LIFECYCLE_STAGES as i32)
    }
}

impl Default for DecayModel {
    fn default() -> Self {
        Self::new(DEFAULT_WEEKLY_RATE)
    }
}
