use crate::assessment::{assess, AssessmentInputs};
use crate::config::ValidationConfig;
use crate::progress::{ProgressEvent, ProgressListener, Stage};
use crate::report::RealisticBacktestReport;
use backtest_engine::{
    BacktestEngine, BacktestError, BacktestResult, Bar, CancellationToken, EngineResult,
    ExecutionModel, MonteCarloResult, MonteCarloSimulator, OptimizationMetric,
    OverfittingAnalysis, OverfittingDetector, ParameterSet, PerformanceScores, Strategy,
    StrategyFactory, WalkForwardAnalyzer, WalkForwardReport,
};
use rust_decimal::prelude::ToPrimitive;
use std::ops::Range;
use tracing::{debug, info, warn};

/// Average daily dollar volume of `bars` mapped to a 0-1 liquidity score.
pub fn liquidity_score(bars: &[Bar]) -> f64 {
    if bars.is_empty() {
        return 0.0;
    }
    let n = bars.len() as f64;
    let avg_volume = bars.iter().map(|b| b.volume).sum::<f64>() / n;
    let avg_price = bars
        .iter()
        .map(|b| b.close.to_f64().unwrap_or(0.0))
        .sum::<f64>()
        / n;
    ExecutionModel::estimate_liquidity_score(avg_volume, avg_price)
}

/// Runs the full validation pipeline for one strategy:
///
/// 1. Liquidity-adjusted execution model
/// 2. Base backtest over all bars
/// 3. Walk-forward analysis
/// 4. Monte Carlo resampling of the base trades
/// 5. Overfitting diagnostics on a train/validation/test split
/// 6. Weighted assessment
///
/// Only a failing base backtest aborts the run. Later stages that fail or
/// lack data are skipped with a warning.
pub struct Orchestrator {
    config: ValidationConfig,
    listeners: Vec<Box<dyn ProgressListener>>,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(config: ValidationConfig) -> EngineResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            listeners: Vec::new(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &ValidationConfig {
        &self.config
    }

    pub fn add_listener<L: ProgressListener + 'static>(&mut self, listener: L) {
        self.listeners.push(Box::new(listener));
    }

    /// Token checked by the walk-forward stage. Cancel it to stop a long search early.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn run<F: StrategyFactory>(
        &self,
        bars: &[Bar],
        factory: &F,
    ) -> EngineResult<RealisticBacktestReport> {
        if bars.is_empty() {
            return Err(BacktestError::InsufficientData {
                component: "validation",
                required: 1,
                available: 0,
            });
        }
        info!(bars = bars.len(), "Starting strategy validation");
        let mut warnings = Vec::new();

        self.emit(ProgressEvent::StageStarted {
            stage: Stage::Liquidity,
        });
        let liquidity_score = liquidity_score(bars);
        let model = ExecutionModel::new(self.config.execution.clone())?;
        let model = if self.config.adjust_for_liquidity {
            model.adjust_for_liquidity(liquidity_score)
        } else {
            model
        };
        debug!(
            liquidity_score,
            base_slippage = model.config().base_slippage,
            "Execution model prepared"
        );
        self.emit(ProgressEvent::StageCompleted {
            stage: Stage::Liquidity,
        });

        self.emit(ProgressEvent::StageStarted {
            stage: Stage::Backtest,
        });
        let engine = BacktestEngine::new(self.config.backtest.clone(), model)?;
        let strategy = factory.create(&self.config.base_params);
        let backtest = engine.run(bars, &strategy)?;
        info!(
            strategy = strategy.name(),
            total_return = backtest.metrics.total_return,
            trades = backtest.metrics.total_trades,
            "Base backtest finished"
        );
        self.emit(ProgressEvent::StageCompleted {
            stage: Stage::Backtest,
        });

        let walk_forward = self.walk_forward_stage(&engine, bars, factory, &mut warnings);
        let monte_carlo = self.monte_carlo_stage(&backtest, &mut warnings);
        let overfitting = self.overfitting_stage(&engine, bars, factory, &mut warnings);

        self.emit(ProgressEvent::StageStarted {
            stage: Stage::Assessment,
        });
        let assessment = assess(
            &AssessmentInputs {
                metrics: &backtest.metrics,
                walk_forward: walk_forward.as_ref(),
                monte_carlo: monte_carlo.as_ref(),
                overfitting: overfitting.as_ref(),
            },
            &warnings,
        );
        self.emit(ProgressEvent::StageCompleted {
            stage: Stage::Assessment,
        });

        info!(
            overall_score = assessment.overall_score,
            grade = %assessment.grade,
            warnings = assessment.warnings.len(),
            "Strategy validation finished"
        );
        self.emit(ProgressEvent::Finished {
            overall_score: assessment.overall_score,
        });

        Ok(RealisticBacktestReport {
            strategy: strategy.name().to_string(),
            liquidity_score,
            execution: engine.execution().config().clone(),
            backtest,
            walk_forward,
            monte_carlo,
            overfitting,
            assessment,
            warnings,
        })
    }

    fn walk_forward_stage<F: StrategyFactory>(
        &self,
        engine: &BacktestEngine,
        bars: &[Bar],
        factory: &F,
        warnings: &mut Vec<String>,
    ) -> Option<WalkForwardReport> {
        let config = self.config.walk_forward.as_ref()?;
        if bars.len() < config.min_data_points {
            self.skip(
                Stage::WalkForward,
                format!(
                    "Walk-forward analysis skipped: need {} bars, got {}",
                    config.min_data_points,
                    bars.len()
                ),
                warnings,
            );
            return None;
        }

        self.emit(ProgressEvent::StageStarted {
            stage: Stage::WalkForward,
        });
        let outcome = WalkForwardAnalyzer::new(config.clone(), engine.clone()).and_then(|wf| {
            wf.analyze(bars, factory, &self.config.base_params, &self.cancel)
        });
        match outcome {
            Ok(report) => {
                if report.cancelled {
                    warnings.push(format!(
                        "Walk-forward analysis was cancelled after {} windows",
                        report.windows.len()
                    ));
                }
                self.emit(ProgressEvent::StageCompleted {
                    stage: Stage::WalkForward,
                });
                Some(report)
            }
            Err(e) => {
                self.skip(
                    Stage::WalkForward,
                    format!("Walk-forward analysis failed: {e}"),
                    warnings,
                );
                None
            }
        }
    }

    fn monte_carlo_stage(
        &self,
        backtest: &BacktestResult,
        warnings: &mut Vec<String>,
    ) -> Option<MonteCarloResult> {
        let config = self.config.monte_carlo.as_ref()?;
        self.emit(ProgressEvent::StageStarted {
            stage: Stage::MonteCarlo,
        });
        match MonteCarloSimulator::new(config.clone()).and_then(|mc| mc.run(backtest)) {
            Ok(result) => {
                self.emit(ProgressEvent::StageCompleted {
                    stage: Stage::MonteCarlo,
                });
                Some(result)
            }
            Err(e) => {
                self.skip(
                    Stage::MonteCarlo,
                    format!("Monte Carlo simulation skipped: {e}"),
                    warnings,
                );
                None
            }
        }
    }

    fn overfitting_stage<F: StrategyFactory>(
        &self,
        engine: &BacktestEngine,
        bars: &[Bar],
        factory: &F,
        warnings: &mut Vec<String>,
    ) -> Option<OverfittingAnalysis> {
        self.config.overfitting.as_ref()?;
        self.emit(ProgressEvent::StageStarted {
            stage: Stage::Overfitting,
        });
        match self.detect_overfitting(engine, bars, factory) {
            Ok(analysis) => {
                self.emit(ProgressEvent::StageCompleted {
                    stage: Stage::Overfitting,
                });
                Some(analysis)
            }
            Err(e) => {
                self.skip(
                    Stage::Overfitting,
                    format!("Overfitting analysis skipped: {e}"),
                    warnings,
                );
                None
            }
        }
    }

    /// Score the base parameters on each split segment, then let the
    /// detector perturb them against the train segment.
    fn detect_overfitting<F: StrategyFactory>(
        &self,
        engine: &BacktestEngine,
        bars: &[Bar],
        factory: &F,
    ) -> EngineResult<OverfittingAnalysis> {
        let config = self
            .config
            .overfitting
            .clone()
            .ok_or_else(|| BacktestError::invalid("overfitting stage is disabled"))?;
        let detector = OverfittingDetector::new(config)?;
        let metric = self.objective();
        let params = &self.config.base_params;
        let [train, validation, test] = self.config.split_ratios.split(bars.len());

        let strategy = factory.create(params);
        let score = |range: Range<usize>| -> EngineResult<f64> {
            Ok(metric.score(&engine.run_range(bars, range, &strategy)?.metrics))
        };
        let scores = PerformanceScores {
            train: score(train.clone())?,
            validation: score(validation)?,
            test: score(test)?,
            observations: bars.len(),
        };
        debug!(
            train = scores.train,
            validation = scores.validation,
            test = scores.test,
            "Split segment scores"
        );

        let evaluator = |perturbed: &ParameterSet| -> f64 {
            engine
                .run_range(bars, train.clone(), &factory.create(perturbed))
                .map(|r| metric.score(&r.metrics))
                .unwrap_or(f64::NAN)
        };
        Ok(detector.analyze(&scores, params, &evaluator))
    }

    fn objective(&self) -> OptimizationMetric {
        self.config
            .walk_forward
            .as_ref()
            .map_or(OptimizationMetric::Sharpe, |wf| wf.optimization_metric)
    }

    fn skip(&self, stage: Stage, reason: String, warnings: &mut Vec<String>) {
        warn!(%stage, "{reason}");
        self.emit(ProgressEvent::StageSkipped {
            stage,
            reason: reason.clone(),
        });
        warnings.push(reason);
    }

    fn emit(&self, event: ProgressEvent) {
        for listener in &self.listeners {
            listener.on_event(&event);
        }
    }
}
