use backtest_engine::overfitting::OverfittingConfig;
use backtest_engine::{
    BacktestConfig, BacktestError, EngineResult, ExecutionConfig, MonteCarloConfig,
    ParameterSet, WalkForwardConfig,
};
use serde::{Deserialize, Serialize};

/// Fractions of the data used as train, validation and test segments by the
/// overfitting stage. Must be positive and sum to 1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SplitRatios {
    pub train: f64,
    pub validation: f64,
    pub test: f64,
}

impl Default for SplitRatios {
    fn default() -> Self {
        Self {
            train: 0.6,
            validation: 0.2,
            test: 0.2,
        }
    }
}

impl SplitRatios {
    pub fn validate(&self) -> EngineResult<()> {
        for (name, value) in [
            ("train", self.train),
            ("validation", self.validation),
            ("test", self.test),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(BacktestError::InvalidConfig(format!(
                    "split ratio {name} must be positive, got {value}"
                )));
            }
        }
        let sum = self.train + self.validation + self.test;
        if (sum - 1.0).abs() > 1e-9 {
            return Err(BacktestError::InvalidConfig(format!(
                "split ratios must sum to 1, got {sum}"
            )));
        }
        Ok(())
    }

    /// Cut `n` bars into three contiguous index ranges. Test takes the remainder.
    pub fn split(&self, n: usize) -> [std::ops::Range<usize>; 3] {
        let train_end = (n as f64 * self.train).floor() as usize;
        let validation_end =
            ((n as f64 * (self.train + self.validation)).floor() as usize).max(train_end);
        [0..train_end, train_end..validation_end.min(n), validation_end.min(n)..n]
    }
}

/// Everything one validation run needs. Optional stages are disabled by
/// leaving their config unset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub backtest: BacktestConfig,
    pub execution: ExecutionConfig,
    /// Scale slippage by the data's estimated liquidity before running.
    pub adjust_for_liquidity: bool,
    pub walk_forward: Option<WalkForwardConfig>,
    pub monte_carlo: Option<MonteCarloConfig>,
    pub overfitting: Option<OverfittingConfig>,
    pub split_ratios: SplitRatios,
    /// Parameters of the base run. Walk-forward grids override the names they declare.
    pub base_params: ParameterSet,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            backtest: BacktestConfig::default(),
            execution: ExecutionConfig::default(),
            adjust_for_liquidity: true,
            walk_forward: Some(WalkForwardConfig::default()),
            monte_carlo: Some(MonteCarloConfig::default()),
            overfitting: Some(OverfittingConfig::default()),
            split_ratios: SplitRatios::default(),
            base_params: ParameterSet::new(),
        }
    }
}

impl ValidationConfig {
    pub fn validate(&self) -> EngineResult<()> {
        self.backtest.validate()?;
        self.execution.validate()?;
        if let Some(wf) = &self.walk_forward {
            wf.validate()?;
        }
        if let Some(mc) = &self.monte_carlo {
            mc.validate()?;
        }
        if let Some(of) = &self.overfitting {
            of.validate()?;
        }
        self.split_ratios.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        ValidationConfig::default().validate().unwrap();
    }

    #[test]
    fn test_ratios_must_sum_to_one() {
        let ratios = SplitRatios {
            train: 0.6,
            validation: 0.3,
            test: 0.2,
        };
        assert!(ratios.validate().is_err());

        let ratios = SplitRatios {
            train: 0.8,
            validation: 0.0,
            test: 0.2,
        };
        assert!(ratios.validate().is_err());
    }

    #[test]
    fn test_split_covers_all_bars() {
        let [train, validation, test] = SplitRatios::default().split(250);
        assert_eq!(train, 0..150);
        assert_eq!(validation, 150..200);
        assert_eq!(test, 200..250);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: ValidationConfig =
            serde_json::from_str(r#"{"monte_carlo": null, "base_params": {"fast": 5.0}}"#)
                .unwrap();
        assert!(config.monte_carlo.is_none());
        assert!(config.walk_forward.is_some());
        assert_eq!(config.base_params["fast"], 5.0);
    }
}
