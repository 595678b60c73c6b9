use std::collections::BTreeMap;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{BacktestError, EngineResult};
use crate::models::{check_ratio, ParameterSet};
use crate::statistical::{
    autocorrelation_lag1, chi_square_p_value, mean, std_dev, two_tailed_p_value,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverfittingConfig {
    /// Maximum tolerated train → out-of-sample degradation.
    pub degradation_threshold: f64,
    /// Relative parameter perturbations (−0.10 = 10% lower).
    pub perturbations: Vec<f64>,
    pub max_avg_sensitivity: f64,
    pub max_sensitivity: f64,
    /// Parameters more sensitive than this are reported as unstable.
    pub unstable_threshold: f64,
    pub white_noise_threshold: f64,
    pub significance_level: f64,
    /// Train/test effect sizes at or above this are suspicious on their own.
    pub max_effect_size: f64,
}

impl Default for OverfittingConfig {
    fn default() -> Self {
        Self {
            degradation_threshold: 0.2,
            perturbations: vec![-0.10, -0.05, 0.05, 0.10],
            max_avg_sensitivity: 0.15,
            max_sensitivity: 0.3,
            unstable_threshold: 0.2,
            white_noise_threshold: 0.05,
            significance_level: 0.05,
            max_effect_size: 1.0,
        }
    }
}

impl OverfittingConfig {
    pub fn validate(&self) -> EngineResult<()> {
        check_ratio("degradation_threshold", self.degradation_threshold, 1.0)?;
        check_ratio("max_avg_sensitivity", self.max_avg_sensitivity, 1.0)?;
        check_ratio("max_sensitivity", self.max_sensitivity, 1.0)?;
        check_ratio("unstable_threshold", self.unstable_threshold, 1.0)?;
        check_ratio("white_noise_threshold", self.white_noise_threshold, 0.5)?;
        check_ratio("significance_level", self.significance_level, 0.5)?;
        if !self.max_effect_size.is_finite() || self.max_effect_size <= 0.0 {
            return Err(BacktestError::invalid("max_effect_size must be positive"));
        }
        if self.perturbations.is_empty() {
            return Err(BacktestError::invalid("at least one perturbation is required"));
        }
        for p in &self.perturbations {
            if !p.is_finite() || *p == 0.0 || *p <= -1.0 {
                return Err(BacktestError::InvalidConfig(format!(
                    "perturbation must be non-zero and above -1, got {p}"
                )));
            }
        }
        Ok(())
    }
}

/// Objective scores of one parameter set on the three data segments.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PerformanceScores {
    pub train: f64,
    pub validation: f64,
    pub test: f64,
    /// Sample size behind the scores (bars or trades).
    pub observations: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    None,
    Low,
    Medium,
    High,
    Severe,
}

impl Severity {
    pub fn from_degradation(degradation: f64) -> Self {
        if degradation > 0.5 {
            Severity::Severe
        } else if degradation > 0.35 {
            Severity::High
        } else if degradation > 0.2 {
            Severity::Medium
        } else if degradation > 0.1 {
            Severity::Low
        } else {
            Severity::None
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::None => "none",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Severe => "severe",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DegradationTest {
    pub passed: bool,
    pub degradation: f64,
    pub validation_degradation: f64,
    pub test_degradation: f64,
    pub severity: Severity,
    pub threshold: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensitivityTest {
    pub passed: bool,
    pub sensitivities: BTreeMap<String, f64>,
    pub avg_sensitivity: f64,
    pub max_sensitivity: f64,
    pub unstable_parameters: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WhiteNoiseTest {
    pub passed: bool,
    pub autocorrelation: f64,
    pub statistic: f64,
    pub p_value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignificanceTest {
    pub passed: bool,
    pub significant: bool,
    pub effect_size: f64,
    pub t_statistic: f64,
    pub p_value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverfittingTests {
    pub degradation: DegradationTest,
    pub sensitivity: SensitivityTest,
    pub white_noise: WhiteNoiseTest,
    pub significance: SignificanceTest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverfittingAnalysis {
    pub is_overfit: bool,
    /// 0 (clean) to 1 (heavily overfit).
    pub overfitting_score: f64,
    pub tests: OverfittingTests,
    pub recommendations: Vec<String>,
    pub warnings: Vec<String>,
}

/// Re-scores a strategy under a different parameter set. Supplied by the
/// caller so the detector stays independent of how scores are produced.
pub trait ObjectiveEvaluator: Sync {
    fn evaluate(&self, params: &ParameterSet) -> f64;
}

impl<F> ObjectiveEvaluator for F
where
    F: Fn(&ParameterSet) -> f64 + Sync,
{
    fn evaluate(&self, params: &ParameterSet) -> f64 {
        self(params)
    }
}

/// Runs four independent overfitting diagnostics and folds them into one score.
///
/// 1. Degradation: relative drop from train to validation and test.
/// 2. Parameter sensitivity: objective change under small parameter nudges.
/// 3. White noise: Ljung-Box style check on the ordered score triple.
/// 4. Significance: normal-approximation test on the train/test effect size.
///
/// Any failing test marks the strategy overfit.
pub struct OverfittingDetector {
    config: OverfittingConfig,
}

impl OverfittingDetector {
    pub fn new(config: OverfittingConfig) -> EngineResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &OverfittingConfig {
        &self.config
    }

    /// # Arguments
    /// * `scores` - Objective on train, validation and test segments
    /// * `params` - Parameter set that produced `scores`
    /// * `evaluator` - Re-scores perturbed parameter sets
    pub fn analyze<E: ObjectiveEvaluator>(
        &self,
        scores: &PerformanceScores,
        params: &ParameterSet,
        evaluator: &E,
    ) -> OverfittingAnalysis {
        let tests = OverfittingTests {
            degradation: self.degradation_test(scores),
            sensitivity: self.sensitivity_test(params, evaluator),
            white_noise: self.white_noise_test(scores),
            significance: self.significance_test(scores),
        };

        let is_overfit = !(tests.degradation.passed
            && tests.sensitivity.passed
            && tests.white_noise.passed
            && tests.significance.passed);
        let overfitting_score = self.composite_score(&tests);
        let (recommendations, warnings) = self.messages(&tests);

        info!(
            is_overfit,
            overfitting_score,
            degradation = tests.degradation.degradation,
            avg_sensitivity = tests.sensitivity.avg_sensitivity,
            "Overfitting analysis finished"
        );

        OverfittingAnalysis {
            is_overfit,
            overfitting_score,
            tests,
            recommendations,
            warnings,
        }
    }

    pub fn degradation_test(&self, scores: &PerformanceScores) -> DegradationTest {
        let relative = |out_of_sample: f64| {
            if scores.train == 0.0 || !scores.train.is_finite() || !out_of_sample.is_finite() {
                0.0
            } else {
                (scores.train - out_of_sample) / scores.train.abs()
            }
        };
        let validation_degradation = relative(scores.validation);
        let test_degradation = relative(scores.test);
        let degradation = validation_degradation.max(test_degradation);

        DegradationTest {
            passed: degradation <= self.config.degradation_threshold,
            degradation,
            validation_degradation,
            test_degradation,
            severity: Severity::from_degradation(degradation),
            threshold: self.config.degradation_threshold,
        }
    }

    pub fn sensitivity_test<E: ObjectiveEvaluator>(
        &self,
        params: &ParameterSet,
        evaluator: &E,
    ) -> SensitivityTest {
        let base_score = evaluator.evaluate(params);
        let perturbations = &self.config.perturbations;

        let sensitivities: BTreeMap<String, f64> = params
            .par_iter()
            .map(|(name, &value)| {
                let changes: Vec<f64> = perturbations
                    .iter()
                    .map(|&p| {
                        // Zero-valued parameters get absolute nudges
                        let nudged = if value == 0.0 { p } else { value * (1.0 + p) };
                        let mut perturbed = params.clone();
                        perturbed.insert(name.clone(), nudged);
                        let score = evaluator.evaluate(&perturbed);
                        if !score.is_finite() || !base_score.is_finite() {
                            1.0
                        } else if base_score == 0.0 {
                            (score - base_score).abs()
                        } else {
                            ((score - base_score) / base_score).abs()
                        }
                    })
                    .collect();
                (name.clone(), mean(&changes))
            })
            .collect();

        let values: Vec<f64> = sensitivities.values().copied().collect();
        let avg_sensitivity = mean(&values);
        let max_sensitivity = values.iter().copied().fold(0.0, f64::max);
        let unstable_parameters = sensitivities
            .iter()
            .filter(|(_, s)| **s > self.config.unstable_threshold)
            .map(|(name, _)| name.clone())
            .collect();

        debug!(avg_sensitivity, max_sensitivity, "Parameter sensitivity computed");

        SensitivityTest {
            passed: avg_sensitivity < self.config.max_avg_sensitivity
                && max_sensitivity < self.config.max_sensitivity,
            sensitivities,
            avg_sensitivity,
            max_sensitivity,
            unstable_parameters,
        }
    }

    /// Ljung-Box test (lag 1) over the train, validation and test scores.
    ///
    /// Three points bound the lag-1 autocorrelation to [-2/3, 0], so the
    /// statistic never exceeds 10/3 and the p-value never drops below about
    /// 0.068. Only thresholds above that can reject.
    pub fn white_noise_test(&self, scores: &PerformanceScores) -> WhiteNoiseTest {
        let series = [scores.train, scores.validation, scores.test];
        let n = series.len() as f64;
        let autocorrelation = autocorrelation_lag1(&series);
        let statistic = n * (n + 2.0) * autocorrelation.powi(2) / (n - 1.0);
        let p_value = chi_square_p_value(statistic, 1.0);

        WhiteNoiseTest {
            passed: p_value > self.config.white_noise_threshold,
            autocorrelation,
            statistic,
            p_value,
        }
    }

    pub fn significance_test(&self, scores: &PerformanceScores) -> SignificanceTest {
        let pooled = std_dev(&[scores.train, scores.validation, scores.test]);
        let effect_size = if pooled > 0.0 && pooled.is_finite() {
            (scores.train - scores.test) / pooled
        } else {
            0.0
        };
        let t_statistic = effect_size.abs() * (scores.observations as f64).sqrt();
        let p_value = two_tailed_p_value(t_statistic);
        let significant = p_value < self.config.significance_level;

        SignificanceTest {
            passed: significant && effect_size.abs() < self.config.max_effect_size,
            significant,
            effect_size,
            t_statistic,
            p_value,
        }
    }

    fn composite_score(&self, tests: &OverfittingTests) -> f64 {
        let degradation = 0.4 * tests.degradation.degradation.clamp(0.0, 1.0);
        let sensitivity =
            0.3 * (tests.sensitivity.avg_sensitivity / self.config.max_sensitivity).min(1.0);
        let white_noise = if tests.white_noise.passed { 0.0 } else { 0.15 };
        let excess_effect = (tests.significance.effect_size.abs() - self.config.max_effect_size)
            .clamp(0.0, 1.0);
        (degradation + sensitivity + white_noise + 0.15 * excess_effect).min(1.0)
    }

    fn messages(&self, tests: &OverfittingTests) -> (Vec<String>, Vec<String>) {
        let mut recommendations = Vec::new();
        let mut warnings = Vec::new();

        let degradation = &tests.degradation;
        if !degradation.passed {
            warnings.push(format!(
                "Performance degrades {:.0}% out of sample ({} severity)",
                degradation.degradation * 100.0,
                degradation.severity.as_str()
            ));
            recommendations.push(match degradation.severity {
                Severity::Severe | Severity::High => {
                    "Reduce the number of free parameters or simplify the entry rules".to_string()
                }
                _ => "Re-optimize on a longer training window and confirm on fresh data".to_string(),
            });
        }

        let sensitivity = &tests.sensitivity;
        if !sensitivity.passed {
            if sensitivity.unstable_parameters.is_empty() {
                warnings.push(format!(
                    "Objective is sensitive to small parameter changes (average {:.2})",
                    sensitivity.avg_sensitivity
                ));
            } else {
                warnings.push(format!(
                    "Unstable parameters: {}",
                    sensitivity.unstable_parameters.join(", ")
                ));
            }
            recommendations.push(
                "Choose parameters from a plateau where neighbouring values perform similarly"
                    .to_string(),
            );
        }

        let white_noise = &tests.white_noise;
        if !white_noise.passed {
            warnings.push(format!(
                "Scores across segments are autocorrelated (p = {:.3})",
                white_noise.p_value
            ));
            recommendations.push(
                "Check for look-ahead or leakage between the train, validation and test segments"
                    .to_string(),
            );
        }

        let significance = &tests.significance;
        if !significance.passed {
            if !significance.significant {
                warnings.push(format!(
                    "Train/test difference is not statistically significant (p = {:.3})",
                    significance.p_value
                ));
                recommendations.push(
                    "Gather more out-of-sample data before relying on these results".to_string(),
                );
            }
            if significance.effect_size.abs() >= self.config.max_effect_size {
                warnings.push(format!(
                    "Train/test effect size {:.2} is implausibly large",
                    significance.effect_size
                ));
                recommendations.push(
                    "Treat in-sample performance as unreliable and re-validate on unseen data"
                        .to_string(),
                );
            }
        }

        if recommendations.is_empty() {
            recommendations.push("No overfitting indicators detected".to_string());
        }
        (recommendations, warnings)
    }
}
