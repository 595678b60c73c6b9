//! Small numeric helpers shared by the engine, walk-forward, Monte Carlo and
//! overfitting code. Every function returns a finite fallback on degenerate input.

use statrs::distribution::{ChiSquared, ContinuousCDF, Normal};

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample standard deviation (Bessel's correction). 0 for fewer than two values.
pub fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let variance =
        values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    variance.sqrt()
}

/// `std / |mean|`. A zero mean gives 0 when the values are constant and 1 otherwise.
pub fn coefficient_of_variation(values: &[f64]) -> f64 {
    let m = mean(values);
    let sd = std_dev(values);
    if m.abs() < 1e-12 {
        if sd < 1e-12 {
            0.0
        } else {
            1.0
        }
    } else {
        sd / m.abs()
    }
}

/// Pearson correlation. 0 when either side has no variance or lengths differ.
pub fn correlation(xs: &[f64], ys: &[f64]) -> f64 {
    if xs.len() != ys.len() || xs.len() < 2 {
        return 0.0;
    }
    let mx = mean(xs);
    let my = mean(ys);
    let mut cov = 0.0;
    let mut vx = 0.0;
    let mut vy = 0.0;
    for (x, y) in xs.iter().zip(ys) {
        cov += (x - mx) * (y - my);
        vx += (x - mx).powi(2);
        vy += (y - my).powi(2);
    }
    let denom = (vx * vy).sqrt();
    if denom < 1e-15 {
        0.0
    } else {
        (cov / denom).clamp(-1.0, 1.0)
    }
}

/// Lag-1 autocorrelation of an ordered series. 0 when the series has no variance.
pub fn autocorrelation_lag1(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let denom: f64 = values.iter().map(|v| (v - m).powi(2)).sum();
    if denom < 1e-15 {
        return 0.0;
    }
    let numer: f64 = values
        .windows(2)
        .map(|w| (w[1] - m) * (w[0] - m))
        .sum();
    numer / denom
}

/// Sort ascending with NaNs treated as equal (callers filter them first).
pub fn sort_values(values: &mut [f64]) {
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
}

/// Linear-interpolated percentile of already sorted values. `p` in [0, 1].
pub fn percentile_sorted(sorted: &[f64], p: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let rank = p.clamp(0.0, 1.0) * (n - 1) as f64;
            let lo = rank.floor() as usize;
            let hi = rank.ceil() as usize;
            let weight = rank - lo as f64;
            sorted[lo] + (sorted[hi] - sorted[lo]) * weight
        }
    }
}

/// Down-sample sorted values to at most `max_pts` for histograms.
pub fn sample_distribution(sorted: &[f64], max_pts: usize) -> Vec<f64> {
    if sorted.len() <= max_pts {
        return sorted.to_vec();
    }
    let step = sorted.len() as f64 / max_pts as f64;
    (0..max_pts)
        .map(|i| sorted[(i as f64 * step) as usize])
        .collect()
}

/// Standard normal CDF.
pub fn normal_cdf(x: f64) -> f64 {
    match Normal::new(0.0, 1.0) {
        Ok(normal) => normal.cdf(x),
        Err(_) => 0.5,
    }
}

/// Two-tailed p-value of a z statistic under the standard normal.
pub fn two_tailed_p_value(z: f64) -> f64 {
    if !z.is_finite() {
        return 0.0;
    }
    (2.0 * (1.0 - normal_cdf(z.abs()))).clamp(0.0, 1.0)
}

/// Upper-tail p-value of a chi-square statistic.
pub fn chi_square_p_value(statistic: f64, degrees_of_freedom: f64) -> f64 {
    if !statistic.is_finite() {
        return 0.0;
    }
    if statistic <= 0.0 {
        return 1.0;
    }
    match ChiSquared::new(degrees_of_freedom) {
        Ok(dist) => (1.0 - dist.cdf(statistic)).clamp(0.0, 1.0),
        Err(_) => 1.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_mean_and_std() {
        let v = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert_abs_diff_eq!(mean(&v), 5.0);
        assert_abs_diff_eq!(std_dev(&v), 2.138089935, epsilon = 1e-8);
        assert_eq!(std_dev(&[1.0]), 0.0);
        assert_eq!(mean(&[]), 0.0);
    }

    #[test]
    fn test_percentile_interpolates() {
        let sorted = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_abs_diff_eq!(percentile_sorted(&sorted, 0.0), 1.0);
        assert_abs_diff_eq!(percentile_sorted(&sorted, 0.5), 3.0);
        assert_abs_diff_eq!(percentile_sorted(&sorted, 0.1), 1.4, epsilon = 1e-12);
        assert_abs_diff_eq!(percentile_sorted(&sorted, 1.0), 5.0);
    }

    #[test]
    fn test_correlation_degenerate() {
        assert_abs_diff_eq!(correlation(&[1.0, 2.0, 3.0], &[2.0, 4.0, 6.0]), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(correlation(&[1.0, 2.0, 3.0], &[3.0, 2.0, 1.0]), -1.0, epsilon = 1e-12);
        assert_eq!(correlation(&[1.0, 1.0, 1.0], &[1.0, 2.0, 3.0]), 0.0);
    }

    #[test]
    fn test_cv_zero_mean() {
        assert_eq!(coefficient_of_variation(&[0.0, 0.0]), 0.0);
        assert_eq!(coefficient_of_variation(&[-1.0, 1.0]), 1.0);
        assert_abs_diff_eq!(coefficient_of_variation(&[10.0, 10.0, 10.0]), 0.0);
    }

    #[test]
    fn test_distribution_tails() {
        assert_abs_diff_eq!(normal_cdf(0.0), 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(two_tailed_p_value(1.959964), 0.05, epsilon = 1e-4);
        // chi-square(1) at 3.841 is the 5% critical value
        assert_abs_diff_eq!(chi_square_p_value(3.841459, 1.0), 0.05, epsilon = 1e-4);
        assert_eq!(chi_square_p_value(0.0, 1.0), 1.0);
    }

    #[test]
    fn test_autocorrelation() {
        assert_eq!(autocorrelation_lag1(&[1.0, 1.0, 1.0]), 0.0);
        // (1, -2, 1) deviations → (−2 −2) / 6
        assert_abs_diff_eq!(autocorrelation_lag1(&[1.0, -2.0, 1.0]), -2.0 / 3.0, epsilon = 1e-12);
    }
}
