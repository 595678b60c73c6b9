use crate::assessment::OverallAssessment;
use backtest_engine::{
    BacktestResult, ExecutionConfig, MonteCarloResult, OverfittingAnalysis, WalkForwardReport,
};
use serde::{Deserialize, Serialize};

/// Combined output of one validation run. Optional stages that were
/// disabled, skipped or failed are `None` and explained in `warnings`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealisticBacktestReport {
    pub strategy: String,
    /// 0-1 estimate from average dollar volume.
    pub liquidity_score: f64,
    /// Execution settings actually used, after any liquidity adjustment.
    pub execution: ExecutionConfig,
    pub backtest: BacktestResult,
    pub walk_forward: Option<WalkForwardReport>,
    pub monte_carlo: Option<MonteCarloResult>,
    pub overfitting: Option<OverfittingAnalysis>,
    pub assessment: OverallAssessment,
    pub warnings: Vec<String>,
}

impl RealisticBacktestReport {
    /// One-line human readable verdict.
    pub fn summary(&self) -> String {
        let m = &self.backtest.metrics;
        format!(
            "{}: grade {} ({:.1}/100, {:?} confidence), return {:.2}%, sharpe {:.2}, max drawdown {:.2}%, {} trades",
            self.strategy,
            self.assessment.grade,
            self.assessment.overall_score,
            self.assessment.confidence,
            m.total_return * 100.0,
            m.sharpe_ratio,
            m.max_drawdown * 100.0,
            m.total_trades
        )
    }
}
