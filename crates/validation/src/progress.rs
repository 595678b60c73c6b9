use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::mpsc::Sender;

/// Pipeline stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Liquidity,
    Backtest,
    WalkForward,
    MonteCarlo,
    Overfitting,
    Assessment,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Liquidity => "liquidity",
            Stage::Backtest => "backtest",
            Stage::WalkForward => "walk_forward",
            Stage::MonteCarlo => "monte_carlo",
            Stage::Overfitting => "overfitting",
            Stage::Assessment => "assessment",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    StageStarted { stage: Stage },
    StageCompleted { stage: Stage },
    StageSkipped { stage: Stage, reason: String },
    Finished { overall_score: f64 },
}

/// Receives progress events synchronously, on the thread running the pipeline.
pub trait ProgressListener: Send + Sync {
    fn on_event(&self, event: &ProgressEvent);
}

impl<F> ProgressListener for F
where
    F: Fn(&ProgressEvent) + Send + Sync,
{
    fn on_event(&self, event: &ProgressEvent) {
        self(event)
    }
}

/// A dropped receiver just means nobody is listening any more.
impl ProgressListener for Sender<ProgressEvent> {
    fn on_event(&self, event: &ProgressEvent) {
        let _ = self.send(event.clone());
    }
}
