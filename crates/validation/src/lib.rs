pub mod assessment;
pub mod config;
pub mod orchestrator;
pub mod progress;
pub mod report;

#[cfg(test)]
mod tests;

pub use assessment::{ConfidenceLevel, DetailedScores, Grade, OverallAssessment};
pub use config::{SplitRatios, ValidationConfig};
pub use orchestrator::Orchestrator;
pub use progress::{ProgressEvent, ProgressListener, Stage};
pub use report::RealisticBacktestReport;
