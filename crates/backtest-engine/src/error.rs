use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BacktestError {
    #[error("Insufficient data for {component}: need {required} bars, got {available}")]
    InsufficientData {
        component: &'static str,
        required: usize,
        available: usize,
    },

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Thread pool error: {0}")]
    ThreadPool(String),
}

impl BacktestError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }
}

pub type EngineResult<T> = Result<T, BacktestError>;
