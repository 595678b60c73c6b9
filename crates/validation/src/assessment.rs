use backtest_engine::{
    Metrics, MonteCarloMetric, MonteCarloResult, OverfittingAnalysis, RiskCategory,
    WalkForwardReport,
};
use serde::{Deserialize, Serialize};
use std::fmt;

const PROFITABILITY_WEIGHT: f64 = 0.25;
const STABILITY_WEIGHT: f64 = 0.20;
const RISK_WEIGHT: f64 = 0.25;
const ROBUSTNESS_WEIGHT: f64 = 0.20;
const SIGNIFICANCE_WEIGHT: f64 = 0.10;

/// Trade count below which results get a reliability warning.
const MIN_RELIABLE_TRADES: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Grade {
    #[serde(rename = "A+")]
    APlus,
    A,
    B,
    C,
    D,
    F,
}

impl Grade {
    pub fn from_score(score: f64) -> Self {
        if score >= 95.0 {
            Grade::APlus
        } else if score >= 85.0 {
            Grade::A
        } else if score >= 70.0 {
            Grade::B
        } else if score >= 55.0 {
            Grade::C
        } else if score >= 40.0 {
            Grade::D
        } else {
            Grade::F
        }
    }
}

impl fmt::Display for Grade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Grade::APlus => "A+",
            Grade::A => "A",
            Grade::B => "B",
            Grade::C => "C",
            Grade::D => "D",
            Grade::F => "F",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceLevel {
    VeryLow,
    Low,
    Moderate,
    High,
    VeryHigh,
}

impl ConfidenceLevel {
    /// Band a 0-1 confidence value in steps of 0.2.
    pub fn from_score(score: f64) -> Self {
        if score >= 0.8 {
            ConfidenceLevel::VeryHigh
        } else if score >= 0.6 {
            ConfidenceLevel::High
        } else if score >= 0.4 {
            ConfidenceLevel::Moderate
        } else if score >= 0.2 {
            ConfidenceLevel::Low
        } else {
            ConfidenceLevel::VeryLow
        }
    }
}

/// Component scores, each 0-100.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetailedScores {
    pub profitability: f64,
    pub stability: f64,
    pub risk_management: f64,
    pub robustness: f64,
    pub statistical_significance: f64,
}

impl DetailedScores {
    pub fn weighted_total(&self) -> f64 {
        PROFITABILITY_WEIGHT * self.profitability
            + STABILITY_WEIGHT * self.stability
            + RISK_WEIGHT * self.risk_management
            + ROBUSTNESS_WEIGHT * self.robustness
            + SIGNIFICANCE_WEIGHT * self.statistical_significance
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverallAssessment {
    pub overall_score: f64,
    pub grade: Grade,
    pub detailed_scores: DetailedScores,
    pub confidence: ConfidenceLevel,
    /// Raw 0-1 value behind `confidence`.
    pub confidence_score: f64,
    pub warnings: Vec<String>,
}

/// Stage outputs the assessment is computed from. Missing stages score zero
/// in the components that depend on them.
#[derive(Debug, Clone, Copy)]
pub struct AssessmentInputs<'a> {
    pub metrics: &'a Metrics,
    pub walk_forward: Option<&'a WalkForwardReport>,
    pub monte_carlo: Option<&'a MonteCarloResult>,
    pub overfitting: Option<&'a OverfittingAnalysis>,
}

/// Score, grade and annotate one validation run.
///
/// `stage_warnings` are carried through ahead of the scoring warnings.
pub fn assess(inputs: &AssessmentInputs<'_>, stage_warnings: &[String]) -> OverallAssessment {
    let detailed_scores = DetailedScores {
        profitability: profitability_score(inputs.metrics, inputs.monte_carlo),
        stability: stability_score(inputs.metrics, inputs.walk_forward),
        risk_management: risk_management_score(inputs.metrics, inputs.monte_carlo),
        robustness: robustness_score(inputs.walk_forward, inputs.monte_carlo, inputs.overfitting),
        statistical_significance: significance_score(inputs.metrics),
    };
    let overall_score = detailed_scores.weighted_total().clamp(0.0, 100.0);
    let confidence_score = confidence_score(inputs.walk_forward, inputs.monte_carlo);

    let mut warnings = stage_warnings.to_vec();
    warnings.extend(scoring_warnings(inputs));

    OverallAssessment {
        overall_score,
        grade: Grade::from_score(overall_score),
        detailed_scores,
        confidence: ConfidenceLevel::from_score(confidence_score),
        confidence_score,
        warnings,
    }
}

pub fn profitability_score(metrics: &Metrics, monte_carlo: Option<&MonteCarloResult>) -> f64 {
    let mut score: f64 = 0.0;

    score += match metrics.total_return {
        r if r > 0.5 => 30.0,
        r if r > 0.2 => 22.0,
        r if r > 0.1 => 15.0,
        r if r > 0.0 => 8.0,
        _ => 0.0,
    };
    score += match metrics.sharpe_ratio {
        s if s > 2.0 => 25.0,
        s if s > 1.5 => 20.0,
        s if s > 1.0 => 15.0,
        s if s > 0.5 => 8.0,
        _ => 0.0,
    };
    score += match metrics.profit_factor {
        p if p > 2.0 => 20.0,
        p if p > 1.5 => 15.0,
        p if p > 1.2 => 10.0,
        p if p > 1.0 => 5.0,
        _ => 0.0,
    };
    score += match metrics.win_rate {
        w if w > 0.6 => 15.0,
        w if w > 0.5 => 10.0,
        w if w > 0.4 => 5.0,
        _ => 0.0,
    };
    if let Some(mc) = monte_carlo {
        score += 10.0 * mc.probability_of_profit;
    }

    score.clamp(0.0, 100.0)
}

pub fn stability_score(metrics: &Metrics, walk_forward: Option<&WalkForwardReport>) -> f64 {
    let mut score: f64 = 0.0;

    score += match metrics.sortino_ratio {
        s if s > 2.0 => 30.0,
        s if s > 1.5 => 22.0,
        s if s > 1.0 => 15.0,
        s if s > 0.5 => 8.0,
        _ => 0.0,
    };
    score += match metrics.max_drawdown {
        d if d < 0.05 => 30.0,
        d if d < 0.10 => 25.0,
        d if d < 0.20 => 18.0,
        d if d < 0.30 => 10.0,
        _ => 0.0,
    };
    score += match metrics.calmar_ratio {
        c if c > 3.0 => 25.0,
        c if c > 2.0 => 20.0,
        c if c > 1.0 => 12.0,
        c if c > 0.5 => 6.0,
        _ => 0.0,
    };
    if let Some(wf) = walk_forward {
        score += 15.0 * wf.summary.correlation.max(0.0);
    }

    score.clamp(0.0, 100.0)
}

pub fn risk_management_score(metrics: &Metrics, monte_carlo: Option<&MonteCarloResult>) -> f64 {
    let mut score: f64 = 0.0;

    if metrics.duration_bars > 0 {
        let underwater = metrics.max_drawdown_duration as f64 / metrics.duration_bars as f64;
        score += match underwater {
            u if u < 0.10 => 35.0,
            u if u < 0.25 => 25.0,
            u if u < 0.50 => 15.0,
            _ => 5.0,
        };
    }

    // Payoff ratio: average win over average loss.
    score += if metrics.average_loss > 0.0 {
        match metrics.average_win / metrics.average_loss {
            p if p > 2.0 => 35.0,
            p if p > 1.5 => 28.0,
            p if p > 1.0 => 20.0,
            p if p > 0.75 => 10.0,
            _ => 0.0,
        }
    } else if metrics.average_win > 0.0 {
        35.0
    } else {
        0.0
    };

    score += match monte_carlo {
        Some(mc) => match mc.risk_assessment.var95 {
            v if v > 0.0 => 30.0,
            v if v > -0.05 => 24.0,
            v if v > -0.10 => 18.0,
            v if v > -0.20 => 10.0,
            _ => 0.0,
        },
        None => 10.0,
    };

    score.clamp(0.0, 100.0)
}

pub fn robustness_score(
    walk_forward: Option<&WalkForwardReport>,
    monte_carlo: Option<&MonteCarloResult>,
    overfitting: Option<&OverfittingAnalysis>,
) -> f64 {
    let mut score: f64 = 0.0;

    if let Some(wf) = walk_forward {
        score += 50.0 * wf.robustness_score.clamp(0.0, 1.0);
        score += 30.0 * wf.parameter_stability.clamp(0.0, 1.0);
    }

    if let Some(width) = monte_carlo.and_then(widest_return_interval) {
        score += match width {
            w if w < 0.10 => 20.0,
            w if w < 0.25 => 14.0,
            w if w < 0.50 => 8.0,
            _ => 2.0,
        };
    }

    if let Some(of) = overfitting.filter(|of| of.is_overfit) {
        score *= 1.0 - 0.5 * of.overfitting_score.clamp(0.0, 1.0);
    }

    score.clamp(0.0, 100.0)
}

pub fn significance_score(metrics: &Metrics) -> f64 {
    let trades = match metrics.total_trades {
        n if n >= 100 => 60.0,
        n if n >= 50 => 45.0,
        n if n >= MIN_RELIABLE_TRADES => 30.0,
        n if n >= 10 => 15.0,
        _ => 0.0,
    };
    let duration = match metrics.duration_bars {
        n if n >= 756 => 40.0,
        n if n >= 504 => 30.0,
        n if n >= 252 => 20.0,
        n if n >= 126 => 10.0,
        _ => 0.0,
    };
    trades + duration
}

/// Average of walk-forward robustness and Monte Carlo profit probability.
pub fn confidence_score(
    walk_forward: Option<&WalkForwardReport>,
    monte_carlo: Option<&MonteCarloResult>,
) -> f64 {
    let robustness = walk_forward.map_or(0.0, |wf| wf.robustness_score.clamp(0.0, 1.0));
    let profit = monte_carlo.map_or(0.0, |mc| mc.probability_of_profit);
    0.5 * robustness + 0.5 * profit
}

/// Width of the total-return interval at the highest configured level.
fn widest_return_interval(mc: &MonteCarloResult) -> Option<f64> {
    mc.confidence_intervals
        .get(&MonteCarloMetric::TotalReturn)?
        .intervals
        .iter()
        .max_by(|a, b| a.level.total_cmp(&b.level))
        .map(|ci| ci.width())
}

fn scoring_warnings(inputs: &AssessmentInputs<'_>) -> Vec<String> {
    let metrics = inputs.metrics;
    let mut warnings = Vec::new();

    if metrics.total_trades < MIN_RELIABLE_TRADES {
        warnings.push(format!(
            "Only {} trades: results are not statistically reliable",
            metrics.total_trades
        ));
    }
    if metrics.total_trades > 0 && metrics.profit_factor < 1.0 {
        warnings.push("Profit factor below 1.0: strategy loses money after costs".to_string());
    }
    if metrics.max_drawdown > 0.25 {
        warnings.push(format!(
            "Maximum drawdown of {:.1}% exceeds 25%",
            metrics.max_drawdown * 100.0
        ));
    }
    if let Some(wf) = inputs.walk_forward {
        if wf.robustness_score < 0.5 {
            warnings.push(format!(
                "Walk-forward robustness is low ({:.2})",
                wf.robustness_score
            ));
        }
    }
    if let Some(mc) = inputs.monte_carlo {
        if matches!(
            mc.risk_assessment.risk_category,
            RiskCategory::High | RiskCategory::Extreme
        ) {
            warnings.push(format!(
                "Monte Carlo risk score {:.0} is in the {:?} category",
                mc.risk_assessment.risk_score, mc.risk_assessment.risk_category
            ));
        }
    }
    if let Some(of) = inputs.overfitting.filter(|of| of.is_overfit) {
        warnings.push(format!(
            "Strategy appears overfit (score {:.2})",
            of.overfitting_score
        ));
        warnings.extend(of.warnings.iter().cloned());
    }

    warnings
}
