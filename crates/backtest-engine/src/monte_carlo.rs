use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use rust_decimal::prelude::*;
use tracing::{debug, info};

use crate::error::{BacktestError, EngineResult};
use crate::models::*;
use crate::statistical::{mean, percentile_sorted, sample_distribution, sort_values, std_dev};

/// Histogram sample size for the return and drawdown distributions.
const HISTOGRAM_POINTS: usize = 200;

/// Metrics of one resampled equity path.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimulationOutcome {
    pub total_return: f64,
    pub max_drawdown: f64,
    pub sharpe_ratio: f64,
    pub win_rate: f64,
    pub profit_factor: f64,
    pub final_equity: f64,
}

impl SimulationOutcome {
    fn get(&self, metric: MonteCarloMetric) -> f64 {
        match metric {
            MonteCarloMetric::TotalReturn => self.total_return,
            MonteCarloMetric::MaxDrawdown => self.max_drawdown,
            MonteCarloMetric::SharpeRatio => self.sharpe_ratio,
            MonteCarloMetric::WinRate => self.win_rate,
            MonteCarloMetric::ProfitFactor => self.profit_factor,
            MonteCarloMetric::FinalEquity => self.final_equity,
        }
    }
}

/// Seed of simulation `k`. Independent of how simulations are spread over workers.
fn simulation_seed(seed: u64, k: usize) -> u64 {
    seed.wrapping_add((k as u64).wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15))
}

/// Replay trade P&Ls in the given order from `initial_capital`.
pub fn replay_trades(pnls: &[f64], initial_capital: f64) -> SimulationOutcome {
    let mut equity = initial_capital;
    let mut peak = initial_capital;
    let mut max_dd = 0.0_f64;
    let mut step_returns = Vec::with_capacity(pnls.len());
    let mut gross_profit = 0.0;
    let mut gross_loss = 0.0;
    let mut wins = 0usize;

    for pnl in pnls {
        let prev = equity;
        equity += pnl;
        if equity > peak {
            peak = equity;
        }
        if peak > 0.0 {
            max_dd = max_dd.max((peak - equity) / peak);
        }
        step_returns.push(if prev > 0.0 { equity / prev - 1.0 } else { 0.0 });

        if *pnl > 0.0 {
            wins += 1;
            gross_profit += pnl;
        } else if *pnl < 0.0 {
            gross_loss += pnl.abs();
        }
    }

    let sd = std_dev(&step_returns);
    let sharpe_ratio = if sd > 0.0 {
        mean(&step_returns) / sd * (step_returns.len() as f64).min(252.0).sqrt()
    } else {
        0.0
    };

    SimulationOutcome {
        total_return: if initial_capital > 0.0 {
            equity / initial_capital - 1.0
        } else {
            0.0
        },
        max_drawdown: max_dd,
        sharpe_ratio,
        win_rate: if pnls.is_empty() {
            0.0
        } else {
            wins as f64 / pnls.len() as f64
        },
        profit_factor: if gross_loss > 0.0 {
            gross_profit / gross_loss
        } else {
            gross_profit
        },
        final_equity: equity,
    }
}

/// Risk score (0-100, higher is riskier) and category from the simulated tails.
pub fn risk_score(var95: f64, drawdown_95: f64, drawdown_spread: f64) -> (f64, RiskCategory) {
    let mut score = 0.0;

    score += if var95 < -0.2 {
        40.0
    } else if var95 < -0.1 {
        25.0
    } else if var95 < -0.05 {
        15.0
    } else if var95 < 0.0 {
        5.0
    } else {
        0.0
    };

    score += if drawdown_95 > 0.3 {
        30.0
    } else if drawdown_95 > 0.2 {
        20.0
    } else if drawdown_95 > 0.1 {
        10.0
    } else {
        0.0
    };

    score += if drawdown_spread > 0.2 {
        30.0
    } else if drawdown_spread > 0.1 {
        15.0
    } else if drawdown_spread > 0.05 {
        5.0
    } else {
        0.0
    };

    let score = f64::min(score, 100.0);
    let category = if score < 25.0 {
        RiskCategory::Low
    } else if score < 50.0 {
        RiskCategory::Moderate
    } else if score < 70.0 {
        RiskCategory::High
    } else {
        RiskCategory::Extreme
    };
    (score, category)
}

/// Summarize sorted simulated values. Interval bounds are widened to include
/// the mean so `lower <= mean <= upper` holds for skewed distributions.
fn summarize(sorted: &[f64], levels: &[f64]) -> MetricDistribution {
    let avg = mean(sorted);
    let intervals = levels
        .iter()
        .map(|&level| {
            let lower = percentile_sorted(sorted, (1.0 - level) / 2.0);
            let upper = percentile_sorted(sorted, (1.0 + level) / 2.0);
            ConfidenceInterval {
                level,
                lower: lower.min(avg),
                upper: upper.max(avg),
            }
        })
        .collect();

    MetricDistribution {
        mean: avg,
        median: percentile_sorted(sorted, 0.5),
        std_dev: std_dev(sorted),
        min: sorted.first().copied().unwrap_or(0.0),
        max: sorted.last().copied().unwrap_or(0.0),
        intervals,
    }
}

/// Resamples a finished backtest's trades to estimate how much of its
/// outcome is owed to trade order and sample composition.
pub struct MonteCarloSimulator {
    config: MonteCarloConfig,
}

impl MonteCarloSimulator {
    pub fn new(config: MonteCarloConfig) -> EngineResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &MonteCarloConfig {
        &self.config
    }

    pub fn run(&self, result: &BacktestResult) -> EngineResult<MonteCarloResult> {
        let pnls: Vec<f64> = result
            .trades
            .iter()
            .map(|t| t.pnl.to_f64().unwrap_or(0.0))
            .collect();
        let initial_capital = result.config.initial_capital.to_f64().unwrap_or(0.0);
        self.run_pnls(&pnls, initial_capital)
    }

    /// Simulate from raw trade P&Ls.
    pub fn run_pnls(&self, pnls: &[f64], initial_capital: f64) -> EngineResult<MonteCarloResult> {
        if pnls.is_empty() {
            return Err(BacktestError::InsufficientData {
                component: "monte_carlo",
                required: 1,
                available: 0,
            });
        }

        let config = &self.config;
        info!(
            simulations = config.num_simulations,
            trades = pnls.len(),
            method = ?config.method,
            workers = config.parallel_runs,
            "Starting Monte Carlo simulation"
        );

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.parallel_runs)
            .build()
            .map_err(|e| BacktestError::ThreadPool(e.to_string()))?;

        let outcomes: Vec<SimulationOutcome> = pool.install(|| {
            (0..config.num_simulations)
                .into_par_iter()
                .map(|k| {
                    let mut rng = StdRng::seed_from_u64(simulation_seed(config.seed, k));
                    let sample = match config.method {
                        MonteCarloMethod::TradeShuffling => {
                            let mut order = pnls.to_vec();
                            order.shuffle(&mut rng);
                            order
                        }
                        MonteCarloMethod::BootstrapResampling => (0..pnls.len())
                            .map(|_| pnls[rng.gen_range(0..pnls.len())])
                            .collect(),
                    };
                    replay_trades(&sample, initial_capital)
                })
                .collect()
        });

        let n = outcomes.len() as f64;
        let sorted = |metric: MonteCarloMetric| {
            let mut values: Vec<f64> = outcomes
                .iter()
                .map(|o| o.get(metric))
                .filter(|v| v.is_finite())
                .collect();
            sort_values(&mut values);
            values
        };

        let returns = sorted(MonteCarloMetric::TotalReturn);
        let drawdowns = sorted(MonteCarloMetric::MaxDrawdown);

        let mut confidence_intervals = BTreeMap::new();
        for &metric in &config.metrics {
            let values = match metric {
                MonteCarloMetric::TotalReturn => returns.clone(),
                MonteCarloMetric::MaxDrawdown => drawdowns.clone(),
                other => sorted(other),
            };
            confidence_intervals.insert(metric, summarize(&values, &config.confidence_levels));
        }

        let probability_of_profit =
            outcomes.iter().filter(|o| o.total_return > 0.0).count() as f64 / n;
        let probability_of_ruin = outcomes
            .iter()
            .filter(|o| o.total_return <= -config.ruin_threshold)
            .count() as f64
            / n;

        let var95 = percentile_sorted(&returns, 0.05);
        let expected_max_drawdown_95 = percentile_sorted(&drawdowns, 0.95);
        let drawdown_spread = expected_max_drawdown_95 - percentile_sorted(&drawdowns, 0.05);
        let (score, risk_category) = risk_score(var95, expected_max_drawdown_95, drawdown_spread);

        debug!(
            probability_of_profit,
            var95,
            risk_score = score,
            "Monte Carlo simulation finished"
        );

        Ok(MonteCarloResult {
            simulations: outcomes.len(),
            method: config.method,
            confidence_intervals,
            probability_of_profit,
            probability_of_ruin,
            risk_assessment: RiskAssessment {
                var95,
                expected_max_drawdown_95,
                drawdown_spread,
                risk_score: score,
                risk_category,
            },
            return_distribution: sample_distribution(&returns, HISTOGRAM_POINTS),
            drawdown_distribution: sample_distribution(&drawdowns, HISTOGRAM_POINTS),
        })
    }
}
