use serde::{Deserialize, Serialize};

use crate::error::{BacktestError, EngineResult};

/// One step of a volume-tiered commission schedule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CommissionTier {
    /// Cumulative traded notional at which this tier starts to apply.
    pub volume_threshold: f64,
    /// Commission as a fraction of notional.
    pub rate: f64,
}

impl CommissionTier {
    pub fn new(volume_threshold: f64, rate: f64) -> Self {
        Self {
            volume_threshold,
            rate,
        }
    }
}

/// Tiers must ascend strictly by threshold and never raise the rate as volume grows.
pub fn validate_tiers(tiers: &[CommissionTier]) -> EngineResult<()> {
    for tier in tiers {
        if !tier.volume_threshold.is_finite() || tier.volume_threshold < 0.0 {
            return Err(BacktestError::InvalidConfig(format!(
                "commission tier threshold must be a non-negative number, got {}",
                tier.volume_threshold
            )));
        }
        if !tier.rate.is_finite() || !(0.0..=1.0).contains(&tier.rate) {
            return Err(BacktestError::InvalidConfig(format!(
                "commission tier rate must be in [0, 1], got {}",
                tier.rate
            )));
        }
    }
    for pair in tiers.windows(2) {
        if pair[1].volume_threshold <= pair[0].volume_threshold {
            return Err(BacktestError::invalid(
                "commission tiers must be sorted by strictly ascending volume threshold",
            ));
        }
        if pair[1].rate > pair[0].rate {
            return Err(BacktestError::invalid(
                "commission tier rates must not increase with volume",
            ));
        }
    }
    Ok(())
}

/// Rate of the highest tier whose threshold is at or below the cumulative
/// traded notional. Falls back to `flat_rate` when no tier applies yet.
pub fn applicable_rate(tiers: &[CommissionTier], cumulative_notional: f64, flat_rate: f64) -> f64 {
    tiers
        .iter()
        .rev()
        .find(|t| cumulative_notional >= t.volume_threshold)
        .map(|t| t.rate)
        .unwrap_or(flat_rate)
}

/// Commission owed on a fill of `notional`, priced at the tier reached so far.
pub fn compute_tiered_commission(
    tiers: &[CommissionTier],
    notional: f64,
    cumulative_notional: f64,
    flat_rate: f64,
) -> (f64, f64) {
    let rate = applicable_rate(tiers, cumulative_notional, flat_rate);
    (notional.abs() * rate, rate)
}
