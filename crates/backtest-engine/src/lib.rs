pub mod cancel;
pub mod circuit_breaker;
pub mod commission;
pub mod engine;
pub mod error;
pub mod execution;
pub mod market_impact;
pub mod metrics;
pub mod models;
pub mod monte_carlo;
pub mod overfitting;
pub mod statistical;
pub mod strategy;
pub mod walk_forward_opt;


pub use cancel::CancellationToken;
pub use commission::CommissionTier;
pub use engine::BacktestEngine;
pub use error::{BacktestError, EngineResult};
pub use execution::{ExecutionConfig, ExecutionModel, SessionConfig};
pub use models::*;
pub use monte_carlo::MonteCarloSimulator;
pub use overfitting::{
    ObjectiveEvaluator, OverfittingAnalysis, OverfittingConfig, OverfittingDetector,
    PerformanceScores,
};
pub use strategy::{Action, IndicatorCache, Strategy, StrategyContext, StrategyFactory};
pub use walk_forward_opt::WalkForwardAnalyzer;
