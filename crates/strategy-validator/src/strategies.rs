use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use backtest_engine::{Action, Bar, ParameterRange, ParameterSet, Side, Strategy, StrategyContext};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

/// Built-in strategies the CLI can validate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    SmaCrossover,
    BuyAndHold,
}

impl StrategyKind {
    pub fn default_params(self) -> ParameterSet {
        match self {
            StrategyKind::SmaCrossover => [("fast".to_string(), 10.0), ("slow".to_string(), 30.0)]
                .into_iter()
                .collect(),
            StrategyKind::BuyAndHold => ParameterSet::new(),
        }
    }

    /// Walk-forward search space used when the config file does not give one.
    pub fn default_ranges(self) -> BTreeMap<String, ParameterRange> {
        match self {
            StrategyKind::SmaCrossover => [
                ("fast".to_string(), ParameterRange::new(5.0, 15.0, 5.0)),
                ("slow".to_string(), ParameterRange::new(20.0, 40.0, 10.0)),
            ]
            .into_iter()
            .collect(),
            StrategyKind::BuyAndHold => BTreeMap::new(),
        }
    }

    pub fn build(self, params: &ParameterSet) -> Box<dyn Strategy> {
        match self {
            StrategyKind::SmaCrossover => Box::new(SmaCrossover::from_params(params)),
            StrategyKind::BuyAndHold => Box::new(BuyAndHold),
        }
    }
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sma" | "sma_crossover" => Ok(StrategyKind::SmaCrossover),
            "buy_and_hold" | "hold" => Ok(StrategyKind::BuyAndHold),
            other => Err(format!(
                "unknown strategy '{other}', expected sma_crossover or buy_and_hold"
            )),
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategyKind::SmaCrossover => f.write_str("sma_crossover"),
            StrategyKind::BuyAndHold => f.write_str("buy_and_hold"),
        }
    }
}

/// Long-only moving-average crossover. Enters when the fast average crosses
/// above the slow one and exits on the cross back below.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SmaCrossover {
    pub fast: usize,
    pub slow: usize,
}

impl SmaCrossover {
    const SPREAD_KEY: &'static str = "sma_spread";

    pub fn from_params(params: &ParameterSet) -> Self {
        let period = |name: &str, default: f64| {
            params.get(name).copied().unwrap_or(default).round().max(1.0) as usize
        };
        Self {
            fast: period("fast", 10.0),
            slow: period("slow", 30.0),
        }
    }

    fn average(ctx: &StrategyContext<'_>, period: usize) -> f64 {
        let sum: f64 = ctx
            .recent_closes(period)
            .map(|c| c.to_f64().unwrap_or(0.0))
            .sum();
        sum / period as f64
    }
}

impl Strategy for SmaCrossover {
    fn name(&self) -> &str {
        "sma_crossover"
    }

    fn on_bar(&self, _bar: &Bar, _index: usize, ctx: &mut StrategyContext<'_>) -> Action {
        if self.fast >= self.slow || ctx.history.len() < self.slow {
            return Action::Hold;
        }

        let spread = Self::average(ctx, self.fast) - Self::average(ctx, self.slow);
        let previous = ctx.indicators.insert(Self::SPREAD_KEY.to_string(), spread);

        match previous {
            Some(prev) if prev <= 0.0 && spread > 0.0 && ctx.is_flat() => {
                Action::Buy(Decimal::ZERO)
            }
            Some(prev) if prev >= 0.0 && spread < 0.0 && ctx.position == Some(Side::Long) => {
                Action::Close
            }
            _ => Action::Hold,
        }
    }
}

/// Buys on the first bar and holds to the end of the data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuyAndHold;

impl Strategy for BuyAndHold {
    fn name(&self) -> &str {
        "buy_and_hold"
    }

    fn on_bar(&self, _bar: &Bar, _index: usize, ctx: &mut StrategyContext<'_>) -> Action {
        if ctx.is_flat() && ctx.indicators.insert("entered".to_string(), 1.0).is_none() {
            Action::Buy(Decimal::ZERO)
        } else {
            Action::Hold
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backtest_engine::{BacktestConfig, BacktestEngine, ExecutionConfig, ExecutionModel};
    use chrono::{Duration, TimeZone, Utc};

    fn bars(closes: &[f64]) -> Vec<Bar> {
        closes
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let price = Decimal::from_f64_retain(*c).unwrap_or_default().round_dp(4);
                Bar {
                    timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 17, 0, 0).unwrap()
                        + Duration::days(i as i64),
                    open: price,
                    high: price,
                    low: price,
                    close: price,
                    volume: 1_000_000.0,
                }
            })
            .collect()
    }

    fn engine() -> BacktestEngine {
        let execution = ExecutionModel::new(ExecutionConfig {
            base_slippage: 0.0,
            market_impact_coefficient: 0.0,
            spread: 0.0,
            ..Default::default()
        })
        .unwrap();
        BacktestEngine::new(BacktestConfig::default(), execution).unwrap()
    }

    #[test]
    fn test_parse_kind() {
        assert_eq!("sma".parse::<StrategyKind>(), Ok(StrategyKind::SmaCrossover));
        assert_eq!("Buy_And_Hold".parse::<StrategyKind>(), Ok(StrategyKind::BuyAndHold));
        assert!("momentum".parse::<StrategyKind>().is_err());
    }

    #[test]
    fn test_params_are_rounded_periods() {
        let params: ParameterSet = [("fast".to_string(), 4.6), ("slow".to_string(), 0.0)]
            .into_iter()
            .collect();
        assert_eq!(
            SmaCrossover::from_params(&params),
            SmaCrossover { fast: 5, slow: 1 }
        );
    }

    #[test]
    fn test_crossover_round_trip() {
        // Falls, rallies above the slow average, then falls back below it.
        let mut closes = vec![100.0, 99.0, 98.0, 97.0, 96.0];
        closes.extend([100.0, 104.0, 108.0, 112.0]);
        closes.extend([100.0, 90.0, 80.0, 80.0]);
        let strategy = SmaCrossover { fast: 2, slow: 4 };

        let result = engine().run(&bars(&closes), &strategy).unwrap();

        assert_eq!(result.trades.len(), 1);
        let trade = &result.trades[0];
        assert_eq!(trade.side, Side::Long);
        assert_eq!(trade.entry_index, 6);
        assert_eq!(trade.exit_index, 11);
    }

    #[test]
    fn test_fast_not_below_slow_never_trades() {
        let closes: Vec<f64> = (0..50).map(|i| 100.0 + (i as f64).sin() * 5.0).collect();
        let strategy = SmaCrossover { fast: 20, slow: 20 };
        let result = engine().run(&bars(&closes), &strategy).unwrap();
        assert!(result.trades.is_empty());
    }

    #[test]
    fn test_buy_and_hold_enters_once() {
        let closes: Vec<f64> = (0..20).map(|i| 100.0 + i as f64).collect();
        let result = engine().run(&bars(&closes), &BuyAndHold).unwrap();

        assert_eq!(result.trades.len(), 1);
        assert_eq!(result.trades[0].entry_index, 1);
        assert_eq!(result.trades[0].exit_index, 19);
        assert!(result.metrics.total_return > 0.0);
    }
}
