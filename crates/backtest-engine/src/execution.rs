use chrono::{DateTime, NaiveTime, Timelike, Utc};
use rand::Rng;
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::commission::{compute_tiered_commission, validate_tiers, CommissionTier};
use crate::error::{BacktestError, EngineResult};
use crate::market_impact::{apply_adverse, compute_market_impact, rolling_volatility};
use crate::models::check_ratio;

/// Adverse price moves are capped here so a sell can never fill at or below zero.
const MAX_ADVERSE_FRACTION: f64 = 0.5;

/// Session windows around the open and close where fills cost more.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub market_open: NaiveTime,
    pub market_close: NaiveTime,
    /// Length of the open and close windows.
    pub window_minutes: u32,
    pub open_multiplier: f64,
    pub close_multiplier: f64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            market_open: NaiveTime::from_hms_opt(14, 30, 0).expect("valid session time"),
            market_close: NaiveTime::from_hms_opt(21, 0, 0).expect("valid session time"),
            window_minutes: 30,
            open_multiplier: 1.5,
            close_multiplier: 1.25,
        }
    }
}

/// Configuration for the execution cost model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Base slippage as a fraction of price.
    pub base_slippage: f64,
    /// Square-root impact coefficient.
    pub market_impact_coefficient: f64,
    /// Full quoted spread as a fraction of price; half is paid per fill.
    pub spread: f64,
    /// Average daily volume in units. `None` = mean volume of the run range.
    pub average_daily_volume: Option<f64>,
    pub volatility_window: usize,
    /// Per-bar return stdev treated as "normal" (multiplier 1.0).
    pub baseline_volatility: f64,
    pub min_volatility_multiplier: f64,
    pub max_volatility_multiplier: f64,
    /// Session timestamps are compared in UTC.
    pub session: SessionConfig,
    pub commission_tiers: Vec<CommissionTier>,
    /// Upper bound of uniform intrabar jitter added to slippage. 0 disables it.
    pub jitter: f64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            base_slippage: 0.0005,
            market_impact_coefficient: 0.1,
            spread: 0.0002,
            average_daily_volume: None,
            volatility_window: 20,
            baseline_volatility: 0.01,
            min_volatility_multiplier: 0.5,
            max_volatility_multiplier: 3.0,
            session: SessionConfig::default(),
            commission_tiers: Vec::new(),
            jitter: 0.0,
        }
    }
}

impl ExecutionConfig {
    pub fn validate(&self) -> EngineResult<()> {
        let non_negative = [
            ("base_slippage", self.base_slippage),
            ("market_impact_coefficient", self.market_impact_coefficient),
            ("spread", self.spread),
            ("jitter", self.jitter),
        ];
        for (name, value) in non_negative {
            if !value.is_finite() || !(0.0..MAX_ADVERSE_FRACTION).contains(&value) {
                return Err(BacktestError::InvalidConfig(format!(
                    "{name} must be in [0, {MAX_ADVERSE_FRACTION}), got {value}"
                )));
            }
        }
        if let Some(adv) = self.average_daily_volume {
            if !adv.is_finite() || adv <= 0.0 {
                return Err(BacktestError::invalid("average_daily_volume must be positive"));
            }
        }
        if self.volatility_window < 2 {
            return Err(BacktestError::invalid("volatility_window must be at least 2"));
        }
        check_ratio("baseline_volatility", self.baseline_volatility, 1.0)?;
        if !(self.min_volatility_multiplier > 0.0
            && self.min_volatility_multiplier <= self.max_volatility_multiplier
            && self.max_volatility_multiplier.is_finite())
        {
            return Err(BacktestError::invalid(
                "volatility multiplier bounds must satisfy 0 < min <= max",
            ));
        }
        if self.session.open_multiplier < 1.0 || self.session.close_multiplier < 1.0 {
            return Err(BacktestError::invalid(
                "session multipliers must be at least 1.0",
            ));
        }
        validate_tiers(&self.commission_tiers)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderSide {
    Buy,
    Sell,
}

/// Everything the model needs to price one fill.
#[derive(Debug, Clone)]
pub struct FillRequest<'a> {
    pub price: Decimal,
    pub quantity: Decimal,
    pub side: OrderSide,
    pub timestamp: DateTime<Utc>,
    /// Closes strictly before the fill bar.
    pub recent_closes: &'a [Decimal],
    pub average_daily_volume: f64,
    pub cumulative_notional: f64,
    pub flat_commission_rate: f64,
}

/// A priced fill with its cost breakdown in currency.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fill {
    pub price: Decimal,
    pub commission: Decimal,
    pub commission_rate: f64,
    pub slippage: Decimal,
    pub market_impact: Decimal,
    pub spread: Decimal,
}

impl Fill {
    pub fn notional(&self, quantity: Decimal) -> Decimal {
        self.price * quantity
    }
}

/// Turns an intended price into a realistic fill price.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ExecutionModel {
    config: ExecutionConfig,
}

impl ExecutionModel {
    pub fn new(config: ExecutionConfig) -> EngineResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    /// Price a fill. `rng` is only drawn from when jitter is enabled.
    pub fn execute<R: Rng>(&self, request: &FillRequest<'_>, rng: &mut R) -> Fill {
        let reference = request.price.to_f64().unwrap_or(0.0);
        let quantity = request.quantity.to_f64().unwrap_or(0.0);
        let notional = reference * quantity;

        let impact = compute_market_impact(
            notional,
            request.average_daily_volume,
            reference,
            self.config.market_impact_coefficient,
        );

        let multiplier = self.time_of_day_multiplier(request.timestamp)
            * self.volatility_multiplier(request.recent_closes);

        let jitter = if self.config.jitter > 0.0 {
            rng.gen_range(0.0..self.config.jitter)
        } else {
            0.0
        };

        let slippage_fraction = self.config.base_slippage * multiplier + jitter;
        let impact_fraction = impact.impact * multiplier;
        let spread_fraction = self.config.spread / 2.0;

        let total = slippage_fraction + impact_fraction + spread_fraction;
        let scale = if total > MAX_ADVERSE_FRACTION {
            MAX_ADVERSE_FRACTION / total
        } else {
            1.0
        };

        let is_buy = request.side == OrderSide::Buy;
        let price = apply_adverse(request.price, is_buy, total * scale);
        let fill_notional = price.to_f64().unwrap_or(0.0) * quantity;
        let (commission, commission_rate) = compute_tiered_commission(
            &self.config.commission_tiers,
            fill_notional,
            request.cumulative_notional,
            request.flat_commission_rate,
        );

        let money = |fraction: f64| {
            Decimal::from_f64(fraction * scale * notional).unwrap_or(Decimal::ZERO)
        };

        Fill {
            price,
            commission: Decimal::from_f64(commission).unwrap_or(Decimal::ZERO),
            commission_rate,
            slippage: money(slippage_fraction),
            market_impact: money(impact_fraction),
            spread: money(spread_fraction),
        }
    }

    /// Multiplier for fills inside the opening or closing window, else 1.0.
    pub fn time_of_day_multiplier(&self, timestamp: DateTime<Utc>) -> f64 {
        let session = &self.config.session;
        let minute_of_day = |t: NaiveTime| t.hour() as i64 * 60 + t.minute() as i64;
        let now = minute_of_day(timestamp.time());
        let open = minute_of_day(session.market_open);
        let close = minute_of_day(session.market_close);
        let window = session.window_minutes as i64;

        if now >= open && now < open + window {
            session.open_multiplier
        } else if now <= close && now > close - window {
            session.close_multiplier
        } else {
            1.0
        }
    }

    /// Recent volatility relative to the baseline, clamped to the configured bounds.
    /// Insufficient history yields 1.0.
    pub fn volatility_multiplier(&self, recent_closes: &[Decimal]) -> f64 {
        match rolling_volatility(recent_closes, self.config.volatility_window) {
            Some(vol) => (vol / self.config.baseline_volatility).clamp(
                self.config.min_volatility_multiplier,
                self.config.max_volatility_multiplier,
            ),
            None => 1.0,
        }
    }

    /// Normalized 0-1 estimate of how much size a market absorbs, from its
    /// average daily dollar volume ($10k/day → 0, $1B/day → 1, log-scaled).
    pub fn estimate_liquidity_score(avg_volume: f64, avg_price: f64) -> f64 {
        let dollar_volume = avg_volume * avg_price;
        if !dollar_volume.is_finite() || dollar_volume <= 0.0 {
            return 0.0;
        }
        ((dollar_volume.log10() - 4.0) / 5.0).clamp(0.0, 1.0)
    }

    /// Copy of this model with base slippage scaled inversely to liquidity:
    /// ×2.0 for the least liquid markets down to ×0.5 for the most liquid.
    pub fn adjust_for_liquidity(&self, liquidity_score: f64) -> Self {
        let score = if liquidity_score.is_finite() {
            liquidity_score.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let mut config = self.config.clone();
        config.base_slippage *= 2.0 - 1.5 * score;
        Self { config }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn request(side: OrderSide, timestamp: DateTime<Utc>) -> FillRequest<'static> {
        FillRequest {
            price: Decimal::new(100, 0),
            quantity: Decimal::new(1_000, 0),
            side,
            timestamp,
            recent_closes: &[],
            average_daily_volume: 1_000_000.0,
            cumulative_notional: 0.0,
            flat_commission_rate: 0.001,
        }
    }

    fn midday() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 5, 17, 0, 0).unwrap()
    }

    #[test]
    fn test_fills_are_adverse() {
        let model = ExecutionModel::default();
        let mut rng = StdRng::seed_from_u64(1);
        let buy = model.execute(&request(OrderSide::Buy, midday()), &mut rng);
        let sell = model.execute(&request(OrderSide::Sell, midday()), &mut rng);
        assert!(buy.price > Decimal::new(100, 0));
        assert!(sell.price < Decimal::new(100, 0));
        assert!(buy.market_impact > Decimal::ZERO);
        assert!(buy.spread > Decimal::ZERO);
    }

    #[test]
    fn test_multipliers_compose_multiplicatively() {
        let config = ExecutionConfig {
            base_slippage: 0.001,
            market_impact_coefficient: 0.1,
            spread: 0.0,
            ..Default::default()
        };
        let model = ExecutionModel::new(config).unwrap();
        let mut rng = StdRng::seed_from_u64(1);

        let calm = model.execute(&request(OrderSide::Buy, midday()), &mut rng);
        let at_open = Utc.with_ymd_and_hms(2024, 3, 5, 14, 35, 0).unwrap();
        let busy = model.execute(&request(OrderSide::Buy, at_open), &mut rng);

        let calm_move = calm.price.to_f64().unwrap() - 100.0;
        let busy_move = busy.price.to_f64().unwrap() - 100.0;
        assert!((busy_move / calm_move - 1.5).abs() < 1e-6);
    }

    #[test]
    fn test_time_of_day_windows() {
        let model = ExecutionModel::default();
        let open = Utc.with_ymd_and_hms(2024, 3, 5, 14, 45, 0).unwrap();
        let close = Utc.with_ymd_and_hms(2024, 3, 5, 20, 50, 0).unwrap();
        assert_eq!(model.time_of_day_multiplier(open), 1.5);
        assert_eq!(model.time_of_day_multiplier(close), 1.25);
        assert_eq!(model.time_of_day_multiplier(midday()), 1.0);
    }

    #[test]
    fn test_volatility_multiplier_is_floored() {
        let model = ExecutionModel::default();
        let flat = vec![Decimal::new(50, 0); 40];
        assert_eq!(model.volatility_multiplier(&flat), 0.5);
        assert_eq!(model.volatility_multiplier(&flat[..1]), 1.0);
    }

    #[test]
    fn test_commission_uses_tiers() {
        let config = ExecutionConfig {
            commission_tiers: vec![
                CommissionTier::new(0.0, 0.1),
                CommissionTier::new(100_000.0, 0.05),
            ],
            ..Default::default()
        };
        let model = ExecutionModel::new(config).unwrap();
        let mut rng = StdRng::seed_from_u64(1);

        let mut req = request(OrderSide::Buy, midday());
        req.cumulative_notional = 50_000.0;
        assert_eq!(model.execute(&req, &mut rng).commission_rate, 0.1);
        req.cumulative_notional = 150_000.0;
        assert_eq!(model.execute(&req, &mut rng).commission_rate, 0.05);
    }

    #[test]
    fn test_jitter_is_reproducible() {
        let config = ExecutionConfig {
            jitter: 0.001,
            ..Default::default()
        };
        let model = ExecutionModel::new(config).unwrap();
        let req = request(OrderSide::Buy, midday());

        let a = model.execute(&req, &mut StdRng::seed_from_u64(9));
        let b = model.execute(&req, &mut StdRng::seed_from_u64(9));
        assert_eq!(a, b);
    }

    #[test]
    fn test_liquidity_scaling() {
        assert_eq!(ExecutionModel::estimate_liquidity_score(0.0, 10.0), 0.0);
        assert_eq!(ExecutionModel::estimate_liquidity_score(1e9, 100.0), 1.0);
        let mid = ExecutionModel::estimate_liquidity_score(100_000.0, 30.0);
        assert!(mid > 0.0 && mid < 1.0);

        let model = ExecutionModel::default();
        let illiquid = model.adjust_for_liquidity(0.0);
        let liquid = model.adjust_for_liquidity(1.0);
        assert!((illiquid.config().base_slippage - 0.001).abs() < 1e-12);
        assert!((liquid.config().base_slippage - 0.00025).abs() < 1e-12);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = ExecutionConfig {
            base_slippage: -0.01,
            ..Default::default()
        };
        assert!(ExecutionModel::new(config).is_err());

        let config = ExecutionConfig {
            min_volatility_multiplier: 2.0,
            max_volatility_multiplier: 1.0,
            ..Default::default()
        };
        assert!(ExecutionModel::new(config).is_err());
    }
}
