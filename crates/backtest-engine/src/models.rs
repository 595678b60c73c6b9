use std::collections::BTreeMap;
use std::ops::Range;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{BacktestError, EngineResult};

/// Named strategy parameters. Ordered so grid enumeration and reports are stable.
pub type ParameterSet = BTreeMap<String, f64>;

/// A single OHLCV bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// +1 for long, -1 for short.
    pub fn sign(self) -> Decimal {
        match self {
            Side::Long => Decimal::ONE,
            Side::Short => Decimal::NEGATIVE_ONE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    Signal,
    StopLoss,
    TakeProfit,
    DrawdownHalt,
    EndOfData,
}

/// Execution costs attached to a round trip (entry + exit legs).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TradeCosts {
    pub commission: Decimal,
    pub slippage: Decimal,
    pub market_impact: Decimal,
    pub spread: Decimal,
}

impl TradeCosts {
    pub fn total(&self) -> Decimal {
        self.commission + self.slippage + self.market_impact + self.spread
    }

    pub fn add(&mut self, other: &TradeCosts) {
        self.commission += other.commission;
        self.slippage += other.slippage;
        self.market_impact += other.market_impact;
        self.spread += other.spread;
    }
}

/// A closed round-trip trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub entry_index: usize,
    pub exit_index: usize,
    pub entry_timestamp: DateTime<Utc>,
    pub exit_timestamp: DateTime<Utc>,
    /// Quantity-weighted average fill price (includes adverse execution).
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub quantity: Decimal,
    pub side: Side,
    /// Net of commissions. Slippage, impact and spread are already in the fill prices.
    pub pnl: Decimal,
    pub pnl_percent: f64,
    pub costs: TradeCosts,
    pub exit_reason: ExitReason,
}

/// Configuration for a backtest run. Validated by `BacktestEngine::new`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BacktestConfig {
    pub initial_capital: Decimal,
    /// Flat commission as a fraction of notional, used when no commission tier applies.
    pub commission_rate: f64,
    /// Fraction of equity risked on an engine-sized order.
    pub risk_per_trade: f64,
    /// Maximum position notional as a fraction of equity.
    pub max_position_percent: f64,
    /// Drawdown (fraction of peak) at which trading halts for the rest of the run.
    pub max_drawdown_limit: f64,
    pub allow_short: bool,
    pub use_stop_loss: bool,
    pub use_take_profit: bool,
    pub stop_loss_percent: f64,
    pub take_profit_percent: f64,
    /// Seed for any randomized execution step (intrabar jitter).
    pub seed: u64,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            initial_capital: Decimal::new(100_000, 0),
            commission_rate: 0.001,
            risk_per_trade: 0.02,
            max_position_percent: 0.25,
            max_drawdown_limit: 0.5,
            allow_short: false,
            use_stop_loss: false,
            use_take_profit: false,
            stop_loss_percent: 0.05,
            take_profit_percent: 0.10,
            seed: 42,
        }
    }
}

pub const MAX_COMMISSION_RATE: f64 = 0.1;

impl BacktestConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if self.initial_capital <= Decimal::ZERO {
            return Err(BacktestError::invalid("initial_capital must be positive"));
        }
        check_ratio("commission_rate", self.commission_rate, MAX_COMMISSION_RATE)?;
        check_ratio("risk_per_trade", self.risk_per_trade, 1.0)?;
        check_ratio("max_position_percent", self.max_position_percent, 1.0)?;
        check_ratio("max_drawdown_limit", self.max_drawdown_limit, 1.0)?;
        check_ratio("stop_loss_percent", self.stop_loss_percent, 1.0)?;
        check_ratio("take_profit_percent", self.take_profit_percent, 1.0)?;
        Ok(())
    }
}

/// Ratio must be finite, strictly positive and at most `cap`.
pub(crate) fn check_ratio(name: &str, value: f64, cap: f64) -> EngineResult<()> {
    if !value.is_finite() || value <= 0.0 || value > cap {
        return Err(BacktestError::InvalidConfig(format!(
            "{name} must be in (0, {cap}], got {value}"
        )));
    }
    Ok(())
}

/// A point on the equity curve, recorded after all fills on that bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub index: usize,
    pub timestamp: DateTime<Utc>,
    pub equity: Decimal,
    /// Fraction below the running peak.
    pub drawdown: f64,
}

/// Performance metrics derived once from a finished run. Ratios are fractions, not percents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub total_return: f64,
    pub annualized_return: f64,
    pub volatility: f64,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    pub max_drawdown: f64,
    /// Longest stretch of bars spent below a prior peak.
    pub max_drawdown_duration: usize,
    pub win_rate: f64,
    pub profit_factor: f64,
    pub calmar_ratio: f64,
    pub average_win: f64,
    /// Mean losing trade as a positive magnitude.
    pub average_loss: f64,
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub largest_win: f64,
    /// Worst losing trade as a positive magnitude, like `average_loss`.
    pub largest_loss: f64,
    pub max_consecutive_wins: usize,
    pub max_consecutive_losses: usize,
    pub total_commission: f64,
    /// Slippage + market impact + spread.
    pub total_slippage: f64,
    /// Fraction of bars with an open position at the close.
    pub exposure: f64,
    pub final_equity: f64,
    pub duration_bars: usize,
}

/// Result of a completed backtest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestResult {
    pub trades: Vec<Trade>,
    pub equity_curve: Vec<EquityPoint>,
    pub metrics: Metrics,
    pub config: BacktestConfig,
    pub start_index: usize,
    /// Exclusive.
    pub end_index: usize,
}

// --- Walk-Forward Analysis ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowType {
    Rolling,
    Expanding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationMetric {
    Sharpe,
    TotalReturn,
    ProfitFactor,
}

impl OptimizationMetric {
    pub fn score(self, metrics: &Metrics) -> f64 {
        match self {
            OptimizationMetric::Sharpe => metrics.sharpe_ratio,
            OptimizationMetric::TotalReturn => metrics.total_return,
            OptimizationMetric::ProfitFactor => metrics.profit_factor,
        }
    }
}

/// Inclusive numeric range walked with a fixed step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParameterRange {
    pub min: f64,
    pub max: f64,
    pub step: f64,
}

impl ParameterRange {
    pub fn new(min: f64, max: f64, step: f64) -> Self {
        Self { min, max, step }
    }

    /// Number of grid values. Computed arithmetically, so a very fine range
    /// costs nothing until its values are walked.
    pub fn len(&self) -> usize {
        let finite = self.min.is_finite() && self.max.is_finite() && self.step.is_finite();
        if !finite || self.step <= 0.0 || self.min > self.max {
            return 0;
        }
        let limit = self.max + self.step * 1e-9;
        // `as` saturates, so absurdly fine ranges clamp to usize::MAX
        let mut last = ((self.max - self.min) / self.step).floor() as usize;
        while last < usize::MAX && self.value_at(last + 1) <= limit {
            last += 1;
        }
        while last > 0 && self.value_at(last) > limit {
            last -= 1;
        }
        last.saturating_add(1)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The `k`-th grid value, `min + k * step` so repeated steps do not drift.
    pub fn value_at(&self, k: usize) -> f64 {
        self.min + k as f64 * self.step
    }

    /// Grid values in ascending order, generated on demand.
    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        (0..self.len()).map(move |k| self.value_at(k))
    }

    pub fn validate(&self, name: &str) -> EngineResult<()> {
        if !self.min.is_finite() || !self.max.is_finite() || !self.step.is_finite() {
            return Err(BacktestError::InvalidConfig(format!(
                "parameter range {name} must be finite"
            )));
        }
        if self.step <= 0.0 {
            return Err(BacktestError::InvalidConfig(format!(
                "parameter range {name} needs a positive step"
            )));
        }
        if self.min > self.max {
            return Err(BacktestError::InvalidConfig(format!(
                "parameter range {name} has min > max"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalkForwardConfig {
    pub training_size: usize,
    pub test_size: usize,
    pub window_type: WindowType,
    pub min_data_points: usize,
    pub parameter_ranges: BTreeMap<String, ParameterRange>,
    pub optimization_metric: OptimizationMetric,
    /// When false (or no ranges are declared) every window uses the base parameters.
    pub optimize: bool,
    pub max_combinations: usize,
    /// Evaluate windows on the rayon pool.
    pub parallel: bool,
}

impl Default for WalkForwardConfig {
    fn default() -> Self {
        Self {
            training_size: 120,
            test_size: 40,
            window_type: WindowType::Rolling,
            min_data_points: 160,
            parameter_ranges: BTreeMap::new(),
            optimization_metric: OptimizationMetric::Sharpe,
            optimize: true,
            max_combinations: 500,
            parallel: false,
        }
    }
}

impl WalkForwardConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if self.training_size == 0 || self.test_size == 0 {
            return Err(BacktestError::invalid(
                "walk-forward training_size and test_size must be positive",
            ));
        }
        if self.max_combinations == 0 {
            return Err(BacktestError::invalid("max_combinations must be positive"));
        }
        for (name, range) in &self.parameter_ranges {
            range.validate(name)?;
        }
        Ok(())
    }
}

/// One train/test slide of the walk-forward analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalkForwardWindow {
    pub index: usize,
    pub train_range: Range<usize>,
    pub test_range: Range<usize>,
    pub optimized_params: ParameterSet,
    pub train_result: BacktestResult,
    pub test_result: BacktestResult,
    pub train_metric: f64,
    pub test_metric: f64,
    pub performance_degradation: f64,
    pub combinations_evaluated: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WalkForwardSummary {
    pub total_windows: usize,
    pub avg_train_return: f64,
    pub avg_test_return: f64,
    pub avg_degradation: f64,
    pub success_rate: f64,
    pub stability: f64,
    pub correlation: f64,
    pub avg_test_sharpe: f64,
    pub total_test_trades: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalkForwardReport {
    pub windows: Vec<WalkForwardWindow>,
    pub summary: WalkForwardSummary,
    pub robustness_score: f64,
    pub parameter_stability: f64,
    pub recommendations: Vec<String>,
    /// Set when a cancellation signal or deadline cut the analysis short.
    pub cancelled: bool,
}

// --- Monte Carlo Simulation ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonteCarloMethod {
    /// Permute realized trade P&Ls without replacement.
    TradeShuffling,
    /// Draw trade P&Ls with replacement.
    BootstrapResampling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonteCarloMetric {
    TotalReturn,
    MaxDrawdown,
    SharpeRatio,
    WinRate,
    ProfitFactor,
    FinalEquity,
}

/// Upper bound on Monte Carlo worker threads.
pub const MAX_PARALLEL_RUNS: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonteCarloConfig {
    pub num_simulations: usize,
    pub method: MonteCarloMethod,
    pub confidence_levels: Vec<f64>,
    pub metrics: Vec<MonteCarloMetric>,
    pub seed: u64,
    /// Worker count. Results do not depend on it.
    pub parallel_runs: usize,
    /// Loss fraction counted as ruin.
    pub ruin_threshold: f64,
}

impl Default for MonteCarloConfig {
    fn default() -> Self {
        Self {
            num_simulations: 1000,
            method: MonteCarloMethod::TradeShuffling,
            confidence_levels: vec![0.90, 0.95, 0.99],
            metrics: vec![
                MonteCarloMetric::TotalReturn,
                MonteCarloMetric::MaxDrawdown,
                MonteCarloMetric::SharpeRatio,
                MonteCarloMetric::WinRate,
                MonteCarloMetric::ProfitFactor,
                MonteCarloMetric::FinalEquity,
            ],
            seed: 42,
            parallel_runs: 1,
            ruin_threshold: 0.5,
        }
    }
}

impl MonteCarloConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if self.num_simulations == 0 {
            return Err(BacktestError::invalid("num_simulations must be positive"));
        }
        if self.parallel_runs == 0 || self.parallel_runs > MAX_PARALLEL_RUNS {
            return Err(BacktestError::InvalidConfig(format!(
                "parallel_runs must be in [1, {MAX_PARALLEL_RUNS}], got {}",
                self.parallel_runs
            )));
        }
        if self.confidence_levels.is_empty() {
            return Err(BacktestError::invalid("at least one confidence level is required"));
        }
        for level in &self.confidence_levels {
            if !level.is_finite() || *level <= 0.0 || *level >= 1.0 {
                return Err(BacktestError::InvalidConfig(format!(
                    "confidence level must be in (0, 1), got {level}"
                )));
            }
        }
        if self.metrics.is_empty() {
            return Err(BacktestError::invalid("at least one metric is required"));
        }
        check_ratio("ruin_threshold", self.ruin_threshold, 1.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceInterval {
    pub level: f64,
    pub lower: f64,
    pub upper: f64,
}

impl ConfidenceInterval {
    pub fn width(&self) -> f64 {
        self.upper - self.lower
    }
}

/// Simulated distribution of one metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDistribution {
    pub mean: f64,
    pub median: f64,
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
    pub intervals: Vec<ConfidenceInterval>,
}

impl MetricDistribution {
    pub fn interval(&self, level: f64) -> Option<&ConfidenceInterval> {
        self.intervals
            .iter()
            .find(|ci| (ci.level - level).abs() < 1e-9)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskCategory {
    Low,
    Moderate,
    High,
    Extreme,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    /// 5th percentile of simulated total return.
    pub var95: f64,
    pub expected_max_drawdown_95: f64,
    /// p95 - p5 of simulated max drawdown.
    pub drawdown_spread: f64,
    /// 0-100, higher is riskier.
    pub risk_score: f64,
    pub risk_category: RiskCategory,
}

/// Monte Carlo simulation results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonteCarloResult {
    pub simulations: usize,
    pub method: MonteCarloMethod,
    pub confidence_intervals: BTreeMap<MonteCarloMetric, MetricDistribution>,
    pub probability_of_profit: f64,
    pub probability_of_ruin: f64,
    pub risk_assessment: RiskAssessment,
    /// Sampled return values for histogram (up to 200 points).
    pub return_distribution: Vec<f64>,
    /// Sampled max drawdown values for histogram (up to 200 points).
    pub drawdown_distribution: Vec<f64>,
}
