use std::collections::BTreeMap;
use std::ops::Range;

use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::cancel::CancellationToken;
use crate::engine::BacktestEngine;
use crate::error::{BacktestError, EngineResult};
use crate::models::*;
use crate::statistical::{coefficient_of_variation, correlation, mean, std_dev};
use crate::strategy::StrategyFactory;

/// Train/test index ranges for every window that fits in `n` bars.
///
/// Rolling windows slide by `test_size` with a fixed training length.
/// Expanding windows stay anchored at 0 and grow the training span by
/// `test_size` each step. Test always starts exactly where train ends.
pub fn window_ranges(n: usize, config: &WalkForwardConfig) -> Vec<(Range<usize>, Range<usize>)> {
    let mut windows = Vec::new();
    let mut start = 0usize;
    let mut train = config.training_size;
    let test = config.test_size;
    if train == 0 || test == 0 {
        return windows;
    }

    while start + train + test <= n {
        let train_end = start + train;
        windows.push((start..train_end, train_end..train_end + test));
        match config.window_type {
            WindowType::Rolling => start += test,
            WindowType::Expanding => train += test,
        }
    }
    windows
}

/// Cartesian product of the declared ranges in deterministic order (names
/// sorted, last name varying fastest), capped at `max_combinations`.
/// Returns the grid and the uncapped size.
///
/// Combinations are generated by index, so only the kept ones are ever built
/// no matter how fine an individual range is.
pub fn parameter_grid(
    base: &ParameterSet,
    ranges: &BTreeMap<String, ParameterRange>,
    max_combinations: usize,
) -> (Vec<ParameterSet>, usize) {
    let axes: Vec<(&String, &ParameterRange, usize)> = ranges
        .iter()
        .map(|(name, range)| (name, range, range.len()))
        .collect();
    if axes.is_empty() || axes.iter().any(|&(_, _, len)| len == 0) {
        return (vec![base.clone()], 1);
    }

    let total = axes
        .iter()
        .fold(1usize, |acc, &(_, _, len)| acc.saturating_mul(len));
    let grid = Odometer::new(axes.iter().map(|&(_, _, len)| len).collect())
        .take(max_combinations)
        .map(|cursor| {
            let mut params = base.clone();
            for (&(name, range, _), k) in axes.iter().zip(cursor) {
                params.insert(name.clone(), range.value_at(k));
            }
            params
        })
        .collect();

    (grid, total)
}

/// Mixed-radix counter over axis indices, last axis fastest.
struct Odometer {
    lens: Vec<usize>,
    cursor: Option<Vec<usize>>,
}

impl Odometer {
    fn new(lens: Vec<usize>) -> Self {
        let cursor = Some(vec![0; lens.len()]);
        Self { lens, cursor }
    }
}

impl Iterator for Odometer {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Vec<usize>> {
        let current = self.cursor.take()?;
        let mut next = current.clone();
        for axis in (0..next.len()).rev() {
            next[axis] += 1;
            if next[axis] < self.lens[axis] {
                self.cursor = Some(next);
                break;
            }
            next[axis] = 0;
        }
        Some(current)
    }
}

/// Result of optimizing one training slice.
struct GridSearch {
    params: ParameterSet,
    evaluated: usize,
    cancelled: bool,
}

/// Walk-forward analyzer: re-optimizes on each training slice and measures
/// how the winner holds up on the following unseen slice.
pub struct WalkForwardAnalyzer {
    config: WalkForwardConfig,
    engine: BacktestEngine,
}

impl WalkForwardAnalyzer {
    pub fn new(config: WalkForwardConfig, engine: BacktestEngine) -> EngineResult<Self> {
        config.validate()?;
        Ok(Self { config, engine })
    }

    pub fn config(&self) -> &WalkForwardConfig {
        &self.config
    }

    pub fn analyze<F: StrategyFactory>(
        &self,
        bars: &[Bar],
        factory: &F,
        base_params: &ParameterSet,
        cancel: &CancellationToken,
    ) -> EngineResult<WalkForwardReport> {
        if bars.len() < self.config.min_data_points {
            return Err(BacktestError::InsufficientData {
                component: "walk_forward",
                required: self.config.min_data_points,
                available: bars.len(),
            });
        }
        let ranges = window_ranges(bars.len(), &self.config);
        if ranges.is_empty() {
            return Err(BacktestError::InsufficientData {
                component: "walk_forward",
                required: self.config.training_size + self.config.test_size,
                available: bars.len(),
            });
        }

        let optimizing = self.config.optimize && !self.config.parameter_ranges.is_empty();
        let grid = if optimizing {
            let (grid, total) = parameter_grid(
                base_params,
                &self.config.parameter_ranges,
                self.config.max_combinations,
            );
            if total > grid.len() {
                warn!(
                    total,
                    evaluated = grid.len(),
                    "Parameter grid truncated to max_combinations"
                );
            }
            grid
        } else {
            vec![base_params.clone()]
        };

        info!(
            bars = bars.len(),
            windows = ranges.len(),
            combinations = grid.len(),
            "Starting walk-forward analysis"
        );

        let (windows, cancelled) = if self.config.parallel {
            let results: Vec<Option<(WalkForwardWindow, bool)>> = ranges
                .into_par_iter()
                .enumerate()
                .map(|(index, (train, test))| {
                    if cancel.is_cancelled() {
                        return Ok(None);
                    }
                    self.evaluate_window(bars, factory, &grid, optimizing, index, train, test, cancel)
                })
                .collect::<EngineResult<_>>()?;

            let skipped = results.iter().any(Option::is_none);
            let mut windows = Vec::with_capacity(results.len());
            let mut cancelled = skipped;
            for (window, window_cancelled) in results.into_iter().flatten() {
                cancelled |= window_cancelled;
                windows.push(window);
            }
            windows.sort_by_key(|w| w.index);
            (windows, cancelled)
        } else {
            let mut windows = Vec::with_capacity(ranges.len());
            let mut cancelled = false;
            for (index, (train, test)) in ranges.into_iter().enumerate() {
                if cancel.is_cancelled() {
                    cancelled = true;
                    break;
                }
                match self.evaluate_window(bars, factory, &grid, optimizing, index, train, test, cancel)? {
                    Some((window, window_cancelled)) => {
                        windows.push(window);
                        if window_cancelled {
                            cancelled = true;
                            break;
                        }
                    }
                    None => {
                        cancelled = true;
                        break;
                    }
                }
            }
            (windows, cancelled)
        };

        if cancelled {
            warn!(
                completed = windows.len(),
                "Walk-forward analysis cancelled, returning partial results"
            );
        }

        let report = self.build_report(windows, optimizing, cancelled);
        info!(
            windows = report.summary.total_windows,
            robustness = report.robustness_score,
            parameter_stability = report.parameter_stability,
            "Walk-forward analysis finished"
        );
        Ok(report)
    }

    /// Search the grid on the train slice, then run the winner on the test
    /// slice. Returns `None` if cancelled before any combination ran, and a
    /// flag telling whether the search stopped early.
    #[allow(clippy::too_many_arguments)]
    fn evaluate_window<F: StrategyFactory>(
        &self,
        bars: &[Bar],
        factory: &F,
        grid: &[ParameterSet],
        optimizing: bool,
        index: usize,
        train: Range<usize>,
        test: Range<usize>,
        cancel: &CancellationToken,
    ) -> EngineResult<Option<(WalkForwardWindow, bool)>> {
        let search = if optimizing {
            self.search_grid(bars, factory, grid, train.clone(), cancel)
        } else {
            GridSearch {
                params: grid[0].clone(),
                evaluated: 1,
                cancelled: false,
            }
        };
        if search.evaluated == 0 {
            return Ok(None);
        }

        let metric = self.config.optimization_metric;
        let train_result = self
            .engine
            .run_range(bars, train.clone(), &factory.create(&search.params))?;
        let test_result = self
            .engine
            .run_range(bars, test.clone(), &factory.create(&search.params))?;

        let train_metric = finite_or_zero(metric.score(&train_result.metrics));
        let test_metric = finite_or_zero(metric.score(&test_result.metrics));
        let performance_degradation = if train_metric == 0.0 {
            0.0
        } else {
            (train_metric - test_metric) / train_metric.abs()
        };

        debug!(
            window = index,
            train_start = train.start,
            test_start = test.start,
            train_metric,
            test_metric,
            combinations = search.evaluated,
            "Walk-forward window evaluated"
        );

        Ok(Some((
            WalkForwardWindow {
                index,
                train_range: train,
                test_range: test,
                optimized_params: search.params,
                train_result,
                test_result,
                train_metric,
                test_metric,
                performance_degradation,
                combinations_evaluated: search.evaluated,
            },
            search.cancelled,
        )))
    }

    /// Parallel grid evaluation. Each combination checks the token before it
    /// runs; the winner is the highest score with ties going to the earliest
    /// combination in grid order.
    fn search_grid<F: StrategyFactory>(
        &self,
        bars: &[Bar],
        factory: &F,
        grid: &[ParameterSet],
        train: Range<usize>,
        cancel: &CancellationToken,
    ) -> GridSearch {
        let metric = self.config.optimization_metric;
        let scores: Vec<Option<f64>> = grid
            .par_iter()
            .map(|params| {
                if cancel.is_cancelled() {
                    return None;
                }
                let score = match self
                    .engine
                    .run_range(bars, train.clone(), &factory.create(params))
                {
                    Ok(result) => metric.score(&result.metrics),
                    Err(_) => f64::NEG_INFINITY,
                };
                Some(if score.is_finite() {
                    score
                } else {
                    f64::NEG_INFINITY
                })
            })
            .collect();

        let mut best: Option<(usize, f64)> = None;
        let mut evaluated = 0usize;
        for (i, score) in scores.iter().enumerate() {
            let Some(score) = *score else { continue };
            evaluated += 1;
            if best.map_or(true, |(_, b)| score > b) {
                best = Some((i, score));
            }
        }

        GridSearch {
            params: best
                .map(|(i, _)| grid[i].clone())
                .unwrap_or_else(|| grid[0].clone()),
            evaluated,
            cancelled: evaluated < grid.len(),
        }
    }

    fn build_report(
        &self,
        windows: Vec<WalkForwardWindow>,
        optimizing: bool,
        cancelled: bool,
    ) -> WalkForwardReport {
        let train_returns: Vec<f64> = windows
            .iter()
            .map(|w| w.train_result.metrics.total_return)
            .collect();
        let test_returns: Vec<f64> = windows
            .iter()
            .map(|w| w.test_result.metrics.total_return)
            .collect();
        let degradations: Vec<f64> = windows.iter().map(|w| w.performance_degradation).collect();
        let test_sharpes: Vec<f64> = windows
            .iter()
            .map(|w| w.test_result.metrics.sharpe_ratio)
            .collect();

        let success_rate = if windows.is_empty() {
            0.0
        } else {
            test_returns.iter().filter(|r| **r > 0.0).count() as f64 / windows.len() as f64
        };

        let avg_test = mean(&test_returns);
        let denom = if avg_test == 0.0 { 1.0 } else { avg_test.abs() };
        let stability = if windows.is_empty() {
            0.0
        } else {
            (1.0 - std_dev(&test_returns) / denom).max(0.0)
        };
        let corr = correlation(&train_returns, &test_returns);

        let summary = WalkForwardSummary {
            total_windows: windows.len(),
            avg_train_return: mean(&train_returns),
            avg_test_return: avg_test,
            avg_degradation: mean(&degradations),
            success_rate,
            stability,
            correlation: corr,
            avg_test_sharpe: mean(&test_sharpes),
            total_test_trades: windows
                .iter()
                .map(|w| w.test_result.metrics.total_trades)
                .sum(),
        };

        let robustness_score = 0.4 * stability + 0.3 * success_rate + 0.3 * corr.abs();
        let parameter_stability = self.parameter_stability(&windows, optimizing);
        let recommendations =
            recommendations(&summary, robustness_score, parameter_stability, optimizing, cancelled);

        WalkForwardReport {
            windows,
            summary,
            robustness_score,
            parameter_stability,
            recommendations,
            cancelled,
        }
    }

    /// Mean over optimized parameters of `max(0, 1 - CV)` of the values the
    /// windows picked. 1.0 when nothing was optimized.
    fn parameter_stability(&self, windows: &[WalkForwardWindow], optimizing: bool) -> f64 {
        if !optimizing || windows.is_empty() {
            return 1.0;
        }
        let per_param: Vec<f64> = self
            .config
            .parameter_ranges
            .keys()
            .map(|name| {
                let values: Vec<f64> = windows
                    .iter()
                    .filter_map(|w| w.optimized_params.get(name).copied())
                    .collect();
                (1.0 - coefficient_of_variation(&values)).max(0.0)
            })
            .collect();
        if per_param.is_empty() {
            1.0
        } else {
            mean(&per_param)
        }
    }
}

fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

fn recommendations(
    summary: &WalkForwardSummary,
    robustness: f64,
    parameter_stability: f64,
    optimizing: bool,
    cancelled: bool,
) -> Vec<String> {
    let mut recs = Vec::new();

    if cancelled {
        recs.push(format!(
            "Analysis was cancelled after {} window(s); results cover only completed windows",
            summary.total_windows
        ));
    }
    if summary.total_windows == 0 {
        return recs;
    }
    if robustness < 0.5 {
        recs.push(format!(
            "Low robustness score ({robustness:.2}): out-of-sample results vary widely between windows"
        ));
    }
    if summary.avg_degradation > 0.3 {
        recs.push(format!(
            "Average out-of-sample degradation of {:.0}% suggests parameters are fit to training noise",
            summary.avg_degradation * 100.0
        ));
    }
    if optimizing && parameter_stability < 0.5 {
        recs.push(format!(
            "Optimized parameters drift between windows (stability {parameter_stability:.2}); consider coarser ranges or fewer parameters"
        ));
    }
    if summary.success_rate < 0.5 {
        recs.push(format!(
            "Only {:.0}% of test windows were profitable",
            summary.success_rate * 100.0
        ));
    }
    if summary.correlation < 0.0 {
        recs.push(
            "Training and test returns are negatively correlated; in-sample strength does not carry forward"
                .to_string(),
        );
    }
    if recs.is_empty() {
        recs.push("Walk-forward results are consistent across windows".to_string());
    }
    recs
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_rolling_window_count() {
        let config = WalkForwardConfig::default();
        for (n, expected) in [(159, 0), (160, 1), (199, 1), (200, 2), (280, 4), (1000, 22)] {
            assert_eq!(window_ranges(n, &config).len(), expected, "n = {n}");
        }

        let windows = window_ranges(200, &config);
        assert_eq!(windows[0], (0..120, 120..160));
        assert_eq!(windows[1], (40..160, 160..200));
    }

    #[test]
    fn test_expanding_windows_stay_anchored() {
        let config = WalkForwardConfig {
            window_type: WindowType::Expanding,
            ..Default::default()
        };
        let windows = window_ranges(240, &config);
        assert_eq!(windows.len(), 3);
        assert_eq!(windows[2], (0..200, 200..240));
        assert!(windows.iter().all(|(train, test)| train.start == 0 && train.end == test.start));
    }

    #[test]
    fn test_grid_order_and_cap() {
        let mut ranges = BTreeMap::new();
        ranges.insert("a".to_string(), ParameterRange::new(1.0, 2.0, 1.0));
        ranges.insert("b".to_string(), ParameterRange::new(10.0, 30.0, 10.0));
        let base: ParameterSet = [("c".to_string(), 7.0)].into_iter().collect();

        let (grid, total) = parameter_grid(&base, &ranges, 500);
        assert_eq!(total, 6);
        assert_eq!(grid.len(), 6);
        assert_eq!(grid[0]["a"], 1.0);
        assert_eq!(grid[0]["b"], 10.0);
        assert_eq!(grid[1]["b"], 20.0);
        assert_eq!(grid[3]["a"], 2.0);
        assert!(grid.iter().all(|p| p["c"] == 7.0));

        let (capped, total) = parameter_grid(&base, &ranges, 4);
        assert_eq!(total, 6);
        assert_eq!(capped.len(), 4);
        assert_eq!(capped[..], grid[..4]);
    }

    #[test]
    fn test_range_length_tolerates_float_steps() {
        let range = ParameterRange::new(0.1, 0.3, 0.1);
        assert_eq!(range.len(), 3);
        let values: Vec<f64> = range.values().collect();
        assert_abs_diff_eq!(values[2], 0.3, epsilon = 1e-12);

        assert_eq!(ParameterRange::new(3.0, 9.0, 3.0).len(), 3);
        assert_eq!(ParameterRange::new(5.0, 5.0, 1.0).len(), 1);
        assert!(ParameterRange::new(5.0, 4.0, 1.0).is_empty());
        assert!(ParameterRange::new(0.0, 1.0, 0.0).is_empty());
    }

    #[test]
    fn test_grid_with_fine_range_only_builds_kept_combinations() {
        let mut ranges = BTreeMap::new();
        ranges.insert("lookback".to_string(), ParameterRange::new(1.0, 5e6, 1.0));
        ranges.insert("z".to_string(), ParameterRange::new(0.0, 1e12, 1.0));

        let (grid, total) = parameter_grid(&ParameterSet::new(), &ranges, 500);
        assert_eq!(grid.len(), 500);
        assert_eq!(total as u128, 5_000_000u128 * 1_000_000_000_001);
        assert_eq!(grid[0]["lookback"], 1.0);
        assert_eq!(grid[499]["z"], 499.0);

        ranges.remove("z");
        let (grid, total) = parameter_grid(&ParameterSet::new(), &ranges, 500);
        assert_eq!(grid.len(), 500);
        assert_eq!(total, 5_000_000);
        assert_eq!(grid[499]["lookback"], 500.0);
    }
}
