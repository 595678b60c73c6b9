use std::collections::BTreeMap;
use std::sync::mpsc;

use approx::assert_abs_diff_eq;
use chrono::{Duration, TimeZone, Utc};
use rust_decimal::prelude::*;
use rust_decimal::Decimal;

use backtest_engine::{
    Action, Bar, BacktestConfig, BacktestError, CancellationToken, ExecutionConfig,
    MonteCarloConfig, ParameterRange, ParameterSet, Strategy, StrategyContext, WalkForwardConfig,
};

use crate::assessment::{robustness_score, Grade};
use crate::config::{SplitRatios, ValidationConfig};
use crate::orchestrator::{liquidity_score, Orchestrator};
use crate::progress::{ProgressEvent, Stage};

/// Helper: create a bar on day `i`.
fn bar(i: usize, open: f64, close: f64, volume: f64) -> Bar {
    Bar {
        timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 17, 0, 0).unwrap() + Duration::days(i as i64),
        open: Decimal::from_f64(open).unwrap().round_dp(4),
        high: Decimal::from_f64(open.max(close) + 0.5).unwrap().round_dp(4),
        low: Decimal::from_f64(open.min(close) - 0.5).unwrap().round_dp(4),
        close: Decimal::from_f64(close).unwrap().round_dp(4),
        volume,
    }
}

/// Helper: a drifting sine wave that produces regular moving-average crossovers.
fn wave_bars(n: usize) -> Vec<Bar> {
    let mut prev = 100.0;
    (0..n)
        .map(|i| {
            let close = 100.0 + 10.0 * (i as f64 / 8.0).sin() + 0.05 * i as f64;
            let b = bar(i, prev, close, 500_000.0 + 1_000.0 * (i % 7) as f64);
            prev = close;
            b
        })
        .collect()
}

struct HoldStrategy;

impl Strategy for HoldStrategy {
    fn name(&self) -> &str {
        "hold"
    }

    fn on_bar(&self, _bar: &Bar, _index: usize, _ctx: &mut StrategyContext<'_>) -> Action {
        Action::Hold
    }
}

fn hold_factory(_: &ParameterSet) -> HoldStrategy {
    HoldStrategy
}

struct SmaCross {
    fast: usize,
    slow: usize,
}

impl Strategy for SmaCross {
    fn name(&self) -> &str {
        "sma_cross"
    }

    fn on_bar(&self, _bar: &Bar, _index: usize, ctx: &mut StrategyContext<'_>) -> Action {
        if self.fast == 0 || self.slow == 0 || ctx.history.len() < self.slow {
            return Action::Hold;
        }
        let avg = |n: usize| {
            ctx.recent_closes(n)
                .map(|c| c.to_f64().unwrap_or(0.0))
                .sum::<f64>()
                / n as f64
        };
        let (fast, slow) = (avg(self.fast), avg(self.slow));
        if fast > slow && ctx.is_flat() {
            Action::Buy(Decimal::ZERO)
        } else if fast < slow && !ctx.is_flat() {
            Action::Close
        } else {
            Action::Hold
        }
    }
}

fn sma_factory(params: &ParameterSet) -> SmaCross {
    SmaCross {
        fast: params.get("fast").copied().unwrap_or(5.0) as usize,
        slow: params.get("slow").copied().unwrap_or(20.0) as usize,
    }
}

fn validation_config() -> ValidationConfig {
    let mut ranges = BTreeMap::new();
    ranges.insert("fast".to_string(), ParameterRange::new(3.0, 9.0, 3.0));
    ranges.insert("slow".to_string(), ParameterRange::new(15.0, 30.0, 15.0));

    ValidationConfig {
        backtest: BacktestConfig {
            initial_capital: Decimal::new(100_000, 0),
            commission_rate: 0.001,
            ..Default::default()
        },
        walk_forward: Some(WalkForwardConfig {
            parameter_ranges: ranges,
            ..Default::default()
        }),
        monte_carlo: Some(MonteCarloConfig {
            num_simulations: 200,
            ..Default::default()
        }),
        base_params: [("fast".to_string(), 5.0), ("slow".to_string(), 20.0)]
            .into_iter()
            .collect(),
        ..Default::default()
    }
}

fn collect_events(orchestrator: &mut Orchestrator) -> mpsc::Receiver<ProgressEvent> {
    let (tx, rx) = mpsc::channel();
    orchestrator.add_listener(tx);
    rx
}

#[test]
fn test_full_pipeline_produces_every_stage() {
    let bars = wave_bars(300);
    let mut orchestrator = Orchestrator::new(validation_config()).unwrap();
    let rx = collect_events(&mut orchestrator);

    let report = orchestrator.run(&bars, &sma_factory).unwrap();

    assert_eq!(report.strategy, "sma_cross");
    assert!(!report.backtest.trades.is_empty());
    assert!(report.walk_forward.is_some());
    assert!(report.monte_carlo.is_some());
    assert!(report.overfitting.is_some());

    let a = &report.assessment;
    assert!((0.0..=100.0).contains(&a.overall_score));
    assert_eq!(a.grade, Grade::from_score(a.overall_score));
    for score in [
        a.detailed_scores.profitability,
        a.detailed_scores.stability,
        a.detailed_scores.risk_management,
        a.detailed_scores.robustness,
        a.detailed_scores.statistical_significance,
    ] {
        assert!((0.0..=100.0).contains(&score));
    }
    assert!((0.0..=1.0).contains(&a.confidence_score));

    let events: Vec<ProgressEvent> = rx.try_iter().collect();
    assert_eq!(
        events.first(),
        Some(&ProgressEvent::StageStarted {
            stage: Stage::Liquidity
        })
    );
    assert_eq!(
        events.last(),
        Some(&ProgressEvent::Finished {
            overall_score: a.overall_score
        })
    );
    assert!(!events
        .iter()
        .any(|e| matches!(e, ProgressEvent::StageSkipped { .. })));
    for stage in [Stage::WalkForward, Stage::MonteCarlo, Stage::Overfitting] {
        assert!(events.contains(&ProgressEvent::StageCompleted { stage }));
    }
}

#[test]
fn test_pipeline_is_deterministic() {
    let bars = wave_bars(300);
    let orchestrator = Orchestrator::new(validation_config()).unwrap();

    let a = orchestrator.run(&bars, &sma_factory).unwrap();
    let b = orchestrator.run(&bars, &sma_factory).unwrap();
    assert_eq!(a, b);
}

#[test]
fn test_short_history_skips_walk_forward() {
    let bars = wave_bars(100);
    let mut orchestrator = Orchestrator::new(validation_config()).unwrap();
    let rx = collect_events(&mut orchestrator);

    let report = orchestrator.run(&bars, &sma_factory).unwrap();

    assert!(report.walk_forward.is_none());
    assert!(report.monte_carlo.is_some());
    let expected = "Walk-forward analysis skipped: need 160 bars, got 100";
    assert_eq!(report.warnings, vec![expected.to_string()]);
    assert_eq!(report.assessment.warnings[0], expected);

    let events: Vec<ProgressEvent> = rx.try_iter().collect();
    assert!(events.contains(&ProgressEvent::StageSkipped {
        stage: Stage::WalkForward,
        reason: expected.to_string(),
    }));
    assert!(!events.contains(&ProgressEvent::StageStarted {
        stage: Stage::WalkForward
    }));
}

#[test]
fn test_no_trades_skips_monte_carlo() {
    let bars = wave_bars(200);
    let report = Orchestrator::new(validation_config())
        .unwrap()
        .run(&bars, &hold_factory)
        .unwrap();

    assert!(report.backtest.trades.is_empty());
    assert!(report.monte_carlo.is_none());
    assert!(report
        .warnings
        .iter()
        .any(|w| w.starts_with("Monte Carlo simulation skipped")));
    assert_eq!(report.assessment.detailed_scores.profitability, 0.0);
    assert_eq!(report.assessment.grade, Grade::F);
}

#[test]
fn test_disabled_stages_are_not_run() {
    let bars = wave_bars(300);
    let config = ValidationConfig {
        walk_forward: None,
        monte_carlo: None,
        overfitting: None,
        ..validation_config()
    };
    let mut orchestrator = Orchestrator::new(config).unwrap();
    let rx = collect_events(&mut orchestrator);

    let report = orchestrator.run(&bars, &sma_factory).unwrap();

    assert!(report.walk_forward.is_none());
    assert!(report.monte_carlo.is_none());
    assert!(report.overfitting.is_none());
    assert!(report.warnings.is_empty());
    assert_eq!(report.assessment.detailed_scores.robustness, 0.0);
    assert_eq!(report.assessment.confidence_score, 0.0);

    let stages: Vec<Stage> = rx
        .try_iter()
        .filter_map(|e| match e {
            ProgressEvent::StageStarted { stage } => Some(stage),
            _ => None,
        })
        .collect();
    assert_eq!(
        stages,
        vec![Stage::Liquidity, Stage::Backtest, Stage::Assessment]
    );
}

#[test]
fn test_overfit_verdict_scales_robustness() {
    let bars = wave_bars(300);
    let report = Orchestrator::new(validation_config())
        .unwrap()
        .run(&bars, &sma_factory)
        .unwrap();

    let overfitting = report.overfitting.as_ref().unwrap();
    let unpenalized = robustness_score(
        report.walk_forward.as_ref(),
        report.monte_carlo.as_ref(),
        None,
    );
    let expected = if overfitting.is_overfit {
        unpenalized * (1.0 - 0.5 * overfitting.overfitting_score)
    } else {
        unpenalized
    };
    assert_abs_diff_eq!(
        report.assessment.detailed_scores.robustness,
        expected,
        epsilon = 1e-9
    );
}

/// Buys on even bars and closes on the next one. Only pays while prices
/// keep the zigzag they show in the training segment.
struct EvenBarTrader;

impl Strategy for EvenBarTrader {
    fn name(&self) -> &str {
        "even_bar"
    }

    fn on_bar(&self, _bar: &Bar, index: usize, ctx: &mut StrategyContext<'_>) -> Action {
        if index % 2 == 0 && ctx.is_flat() {
            Action::Buy(Decimal::new(100, 0))
        } else if index % 2 == 1 && !ctx.is_flat() {
            Action::Close
        } else {
            Action::Hold
        }
    }
}

#[test]
fn test_in_sample_only_strategy_is_flagged_overfit() {
    // Even bars sit high through the 0.6 training split, then the zigzag flips
    let bars: Vec<Bar> = (0..200)
        .map(|i| {
            let high = if i < 120 { i % 2 == 0 } else { i % 2 == 1 };
            let price = if high { 102.0 } else { 100.0 };
            bar(i, price, price, 1_000_000.0)
        })
        .collect();
    let config = ValidationConfig {
        walk_forward: None,
        monte_carlo: None,
        ..validation_config()
    };
    let report = Orchestrator::new(config)
        .unwrap()
        .run(&bars, &|_: &ParameterSet| EvenBarTrader)
        .unwrap();

    let overfitting = report.overfitting.as_ref().unwrap();
    assert!(overfitting.is_overfit);
    assert!(!overfitting.tests.degradation.passed);
    assert!(overfitting.tests.degradation.test_degradation > 1.0);
    assert!(report
        .assessment
        .warnings
        .iter()
        .any(|w| w.contains("out of sample")));
}

#[test]
fn test_tiny_split_skips_overfitting() {
    let bars = wave_bars(2);
    let config = ValidationConfig {
        walk_forward: None,
        monte_carlo: None,
        ..validation_config()
    };
    let report = Orchestrator::new(config)
        .unwrap()
        .run(&bars, &hold_factory)
        .unwrap();

    // 2 bars split 0.6/0.2/0.2 leave an empty validation segment
    assert!(report.overfitting.is_none());
    assert!(report.warnings[0].starts_with("Overfitting analysis skipped"));
}

#[test]
fn test_cancelled_walk_forward_is_reported() {
    let bars = wave_bars(240);
    let token = CancellationToken::new();
    token.cancel();
    let orchestrator = Orchestrator::new(validation_config())
        .unwrap()
        .with_cancellation(token);

    let report = orchestrator.run(&bars, &sma_factory).unwrap();

    let wf = report.walk_forward.as_ref().unwrap();
    assert!(wf.cancelled);
    assert!(wf.windows.is_empty());
    assert_eq!(
        report.warnings[0],
        "Walk-forward analysis was cancelled after 0 windows"
    );
}

#[test]
fn test_illiquid_data_doubles_slippage() {
    let bars: Vec<Bar> = (0..50).map(|i| bar(i, 100.0, 100.0, 10.0)).collect();
    assert_eq!(liquidity_score(&bars), 0.0);

    let config = ValidationConfig {
        walk_forward: None,
        monte_carlo: None,
        overfitting: None,
        ..validation_config()
    };
    let adjusted = Orchestrator::new(config.clone())
        .unwrap()
        .run(&bars, &hold_factory)
        .unwrap();
    assert_abs_diff_eq!(
        adjusted.execution.base_slippage,
        ExecutionConfig::default().base_slippage * 2.0,
        epsilon = 1e-12
    );

    let unadjusted = Orchestrator::new(ValidationConfig {
        adjust_for_liquidity: false,
        ..config
    })
    .unwrap()
    .run(&bars, &hold_factory)
    .unwrap();
    assert_eq!(unadjusted.execution, ExecutionConfig::default());
}

#[test]
fn test_liquid_data_score() {
    // ~$50M a day
    let score = liquidity_score(&wave_bars(100));
    assert!(score > 0.7 && score < 0.8, "score = {score}");
}

#[test]
fn test_empty_bars_rejected() {
    let err = Orchestrator::new(validation_config())
        .unwrap()
        .run(&[], &sma_factory)
        .unwrap_err();
    assert!(matches!(
        err,
        BacktestError::InsufficientData {
            component: "validation",
            ..
        }
    ));
}

#[test]
fn test_invalid_config_rejected() {
    let bad_split = ValidationConfig {
        split_ratios: SplitRatios {
            train: 0.5,
            validation: 0.5,
            test: 0.5,
        },
        ..validation_config()
    };
    assert!(matches!(
        Orchestrator::new(bad_split),
        Err(BacktestError::InvalidConfig(_))
    ));

    let mut bad_backtest = validation_config();
    bad_backtest.backtest.commission_rate = 0.5;
    assert!(Orchestrator::new(bad_backtest).is_err());

    let mut bad_monte_carlo = validation_config();
    if let Some(mc) = bad_monte_carlo.monte_carlo.as_mut() {
        mc.num_simulations = 0;
    }
    assert!(Orchestrator::new(bad_monte_carlo).is_err());
}

#[test]
fn test_report_serializes() {
    let bars = wave_bars(120);
    let config = ValidationConfig {
        walk_forward: None,
        ..validation_config()
    };
    let report = Orchestrator::new(config)
        .unwrap()
        .run(&bars, &sma_factory)
        .unwrap();

    let json = serde_json::to_value(&report).unwrap();
    assert!(json["assessment"]["grade"].is_string());
    assert!(json["walk_forward"].is_null());
    assert!(report.summary().starts_with("sma_cross: grade "));
}
