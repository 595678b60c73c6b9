use rust_decimal::prelude::*;
use rust_decimal::Decimal;

use crate::models::{EquityPoint, Metrics, Trade};
use crate::statistical::{mean, std_dev};

pub const TRADING_DAYS_PER_YEAR: f64 = 252.0;

/// Drawdown figures tracked live during the run.
#[derive(Debug, Clone, Copy, Default)]
pub struct DrawdownStats {
    pub max_drawdown: f64,
    pub max_duration: usize,
}

/// Per-bar simple returns of the equity curve, the first measured against the
/// starting capital.
pub fn equity_returns(initial_capital: Decimal, equity_curve: &[EquityPoint]) -> Vec<f64> {
    let mut prev = initial_capital.to_f64().unwrap_or(0.0);
    equity_curve
        .iter()
        .map(|p| {
            let e = p.equity.to_f64().unwrap_or(0.0);
            let r = if prev > 0.0 { e / prev - 1.0 } else { 0.0 };
            prev = e;
            r
        })
        .collect()
}

/// Annualized Sharpe and Sortino from per-bar returns. Zero volatility or
/// zero downside deviation yields 0, never NaN.
pub fn risk_ratios(returns: &[f64]) -> (f64, f64, f64) {
    if returns.is_empty() {
        return (0.0, 0.0, 0.0);
    }
    let annual_mean = mean(returns) * TRADING_DAYS_PER_YEAR;
    let volatility = std_dev(returns) * TRADING_DAYS_PER_YEAR.sqrt();
    let sharpe = if volatility > 0.0 {
        annual_mean / volatility
    } else {
        0.0
    };

    let downside_sq = returns
        .iter()
        .map(|r| r.min(0.0).powi(2))
        .sum::<f64>()
        / returns.len() as f64;
    let downside_dev = downside_sq.sqrt() * TRADING_DAYS_PER_YEAR.sqrt();
    let sortino = if downside_dev > 0.0 {
        annual_mean / downside_dev
    } else {
        0.0
    };

    (volatility, sharpe, sortino)
}

fn max_consecutive_streaks(trades: &[Trade]) -> (usize, usize) {
    let mut max_w = 0;
    let mut max_l = 0;
    let mut w = 0;
    let mut l = 0;
    for t in trades {
        if t.pnl > Decimal::ZERO {
            w += 1;
            l = 0;
            max_w = max_w.max(w);
        } else if t.pnl < Decimal::ZERO {
            l += 1;
            w = 0;
            max_l = max_l.max(l);
        } else {
            w = 0;
            l = 0;
        }
    }
    (max_w, max_l)
}

/// Compute all run metrics once the simulation has finished.
pub fn compute_metrics(
    initial_capital: Decimal,
    equity_curve: &[EquityPoint],
    trades: &[Trade],
    drawdown: DrawdownStats,
    exposed_bars: usize,
) -> Metrics {
    let initial = initial_capital.to_f64().unwrap_or(0.0);
    let final_equity = equity_curve
        .last()
        .map(|p| p.equity)
        .unwrap_or(initial_capital)
        .to_f64()
        .unwrap_or(initial);
    let total_return = if initial > 0.0 {
        final_equity / initial - 1.0
    } else {
        0.0
    };

    let duration = equity_curve.len();
    let annualized_return = if duration > 0 {
        total_return * TRADING_DAYS_PER_YEAR / duration as f64
    } else {
        0.0
    };

    let returns = equity_returns(initial_capital, equity_curve);
    let (volatility, sharpe_ratio, sortino_ratio) = risk_ratios(&returns);

    let pnls: Vec<f64> = trades.iter().map(|t| t.pnl.to_f64().unwrap_or(0.0)).collect();
    let wins: Vec<f64> = pnls.iter().copied().filter(|p| *p > 0.0).collect();
    let losses: Vec<f64> = pnls.iter().copied().filter(|p| *p < 0.0).collect();
    let gross_profit: f64 = wins.iter().sum();
    let gross_loss: f64 = losses.iter().sum::<f64>().abs();

    let total_trades = trades.len();
    let win_rate = if total_trades > 0 {
        wins.len() as f64 / total_trades as f64
    } else {
        0.0
    };
    let profit_factor = if gross_loss > 0.0 {
        gross_profit / gross_loss
    } else {
        gross_profit
    };
    let calmar_ratio = if drawdown.max_drawdown > 0.0 {
        annualized_return / drawdown.max_drawdown
    } else {
        0.0
    };
    let (max_consecutive_wins, max_consecutive_losses) = max_consecutive_streaks(trades);

    let total_commission: f64 = trades
        .iter()
        .map(|t| t.costs.commission.to_f64().unwrap_or(0.0))
        .sum();
    let total_slippage: f64 = trades
        .iter()
        .map(|t| {
            (t.costs.slippage + t.costs.market_impact + t.costs.spread)
                .to_f64()
                .unwrap_or(0.0)
        })
        .sum();

    Metrics {
        total_return,
        annualized_return,
        volatility,
        sharpe_ratio,
        sortino_ratio,
        max_drawdown: drawdown.max_drawdown,
        max_drawdown_duration: drawdown.max_duration,
        win_rate,
        profit_factor,
        calmar_ratio,
        average_win: mean(&wins),
        average_loss: mean(&losses).abs(),
        total_trades,
        winning_trades: wins.len(),
        losing_trades: losses.len(),
        largest_win: wins.iter().copied().fold(0.0, f64::max),
        largest_loss: losses.iter().map(|l| l.abs()).fold(0.0, f64::max),
        max_consecutive_wins,
        max_consecutive_losses,
        total_commission,
        total_slippage,
        exposure: if duration > 0 {
            exposed_bars as f64 / duration as f64
        } else {
            0.0
        },
        final_equity,
        duration_bars: duration,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use chrono::{TimeZone, Utc};

    fn curve(equities: &[i64]) -> Vec<EquityPoint> {
        equities
            .iter()
            .enumerate()
            .map(|(i, e)| EquityPoint {
                index: i,
                timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
                    + chrono::Duration::days(i as i64),
                equity: Decimal::new(*e, 0),
                drawdown: 0.0,
            })
            .collect()
    }

    #[test]
    fn test_flat_curve_has_no_nan() {
        let m = compute_metrics(
            Decimal::new(1000, 0),
            &curve(&[1000, 1000, 1000]),
            &[],
            DrawdownStats::default(),
            0,
        );
        assert_eq!(m.total_return, 0.0);
        assert_eq!(m.volatility, 0.0);
        assert_eq!(m.sharpe_ratio, 0.0);
        assert_eq!(m.sortino_ratio, 0.0);
        assert_eq!(m.calmar_ratio, 0.0);
        assert_eq!(m.profit_factor, 0.0);
        assert_eq!(m.win_rate, 0.0);
    }

    #[test]
    fn test_annualization_is_linear_in_bars() {
        let m = compute_metrics(
            Decimal::new(1000, 0),
            &curve(&[1010, 1020, 1050, 1100]),
            &[],
            DrawdownStats::default(),
            4,
        );
        assert_abs_diff_eq!(m.total_return, 0.1, epsilon = 1e-12);
        assert_abs_diff_eq!(m.annualized_return, 0.1 * 252.0 / 4.0, epsilon = 1e-12);
        assert_eq!(m.exposure, 1.0);
        // All returns positive → no downside deviation
        assert_eq!(m.sortino_ratio, 0.0);
        assert!(m.sharpe_ratio > 0.0);
    }

    #[test]
    fn test_returns_start_from_capital() {
        let r = equity_returns(Decimal::new(100, 0), &curve(&[110, 99]));
        assert_abs_diff_eq!(r[0], 0.1, epsilon = 1e-12);
        assert_abs_diff_eq!(r[1], -0.1, epsilon = 1e-12);
    }
}
