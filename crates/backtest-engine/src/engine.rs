use std::ops::Range;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rust_decimal::prelude::*;
use rust_decimal::{Decimal, RoundingStrategy};
use tracing::{debug, warn};

use crate::circuit_breaker::DrawdownBreaker;
use crate::error::{BacktestError, EngineResult};
use crate::execution::{ExecutionModel, Fill, FillRequest, OrderSide};
use crate::metrics::{compute_metrics, DrawdownStats};
use crate::models::*;
use crate::strategy::{Action, IndicatorCache, Strategy, StrategyContext};

/// Position sizes are rounded down to this many decimal places.
const QUANTITY_DP: u32 = 4;

/// Bar-by-bar backtesting engine with next-bar execution, realistic fills
/// from an [`ExecutionModel`], risk-based sizing, stop-loss, take-profit and
/// a drawdown circuit breaker.
///
/// The engine holds configuration only. Every run owns its own state and its
/// own seeded generator, so one engine can serve many runs (including
/// concurrent ones).
#[derive(Debug, Clone)]
pub struct BacktestEngine {
    config: BacktestConfig,
    execution: ExecutionModel,
}

/// An open position being tracked during the backtest.
struct OpenPosition {
    side: Side,
    quantity: Decimal,
    /// Quantity-weighted average fill price across all adds.
    avg_price: Decimal,
    entry_index: usize,
    entry_timestamp: DateTime<Utc>,
    entry_costs: TradeCosts,
    stop_loss: Option<Decimal>,
    take_profit: Option<Decimal>,
}

impl BacktestEngine {
    pub fn new(config: BacktestConfig, execution: ExecutionModel) -> EngineResult<Self> {
        config.validate()?;
        execution.config().validate()?;
        Ok(Self { config, execution })
    }

    pub fn config(&self) -> &BacktestConfig {
        &self.config
    }

    pub fn execution(&self) -> &ExecutionModel {
        &self.execution
    }

    /// Same backtest settings with a different execution model.
    pub fn with_execution(&self, execution: ExecutionModel) -> Self {
        Self {
            config: self.config.clone(),
            execution,
        }
    }

    /// Run the strategy over every bar.
    pub fn run<S: Strategy + ?Sized>(
        &self,
        bars: &[Bar],
        strategy: &S,
    ) -> EngineResult<BacktestResult> {
        self.run_range(bars, 0..bars.len(), strategy)
    }

    /// Run the strategy over `bars[range]`.
    ///
    /// Indices stay absolute: the strategy sees `index` as a position in
    /// `bars` and its history includes the bars before `range.start`, which
    /// serve as warm-up. Actions returned on bar `i` fill at bar `i + 1`'s
    /// open. Any position still open after the last bar is closed at its close.
    pub fn run_range<S: Strategy + ?Sized>(
        &self,
        bars: &[Bar],
        range: Range<usize>,
        strategy: &S,
    ) -> EngineResult<BacktestResult> {
        if range.start > range.end || range.end > bars.len() {
            return Err(BacktestError::InvalidConfig(format!(
                "run range {}..{} is outside the {} available bars",
                range.start,
                range.end,
                bars.len()
            )));
        }
        if range.is_empty() {
            return Err(BacktestError::InsufficientData {
                component: "backtest",
                required: 1,
                available: 0,
            });
        }

        let mut run = RunState::new(self, bars, &range);
        let mut breaker =
            DrawdownBreaker::new(self.config.initial_capital, self.config.max_drawdown_limit);
        let mut indicators = IndicatorCache::new();
        let mut equity_curve = Vec::with_capacity(range.len());
        let mut pending: Option<Action> = None;
        let mut exposed_bars = 0usize;
        let last = range.end - 1;

        for i in range.clone() {
            let bar = &bars[i];

            // 1. Execute the previous bar's decision at today's open
            if let Some(action) = pending.take() {
                run.apply(i, action);
            }

            // 2. Stops and targets against the bar's range
            run.check_exits(i);

            if run.position.is_some() {
                exposed_bars += 1;
            }

            // 3. Mark to the close, trip the breaker or flatten on the final bar
            let mark = run.equity_at(bar.close);
            if !breaker.is_halted() && breaker.breaches(mark) {
                warn!(
                    index = i,
                    drawdown = breaker.drawdown_of(mark),
                    limit = self.config.max_drawdown_limit,
                    "Drawdown limit reached, halting trading"
                );
                run.close(i, bar.close, ExitReason::DrawdownHalt);
            } else if i == last {
                run.close(i, bar.close, ExitReason::EndOfData);
            }

            let equity = run.equity_at(bar.close);
            let drawdown = breaker.record(equity);
            equity_curve.push(EquityPoint {
                index: i,
                timestamp: bar.timestamp,
                equity,
                drawdown,
            });

            if breaker.is_halted() {
                continue;
            }

            // 4. Ask the strategy for the next bar
            let (position, quantity, entry_price) = match &run.position {
                Some(p) => (Some(p.side), p.quantity, Some(p.avg_price)),
                None => (None, Decimal::ZERO, None),
            };
            let mut ctx = StrategyContext {
                position,
                quantity,
                entry_price,
                equity,
                cash: run.cash,
                history: &bars[..=i],
                indicators: &mut indicators,
            };
            let action = strategy.on_bar(bar, i, &mut ctx);
            if i < last {
                pending = Some(action);
            } else if action != Action::Hold {
                debug!(index = i, ?action, "Dropping action returned on the final bar");
            }
        }

        let metrics = compute_metrics(
            self.config.initial_capital,
            &equity_curve,
            &run.trades,
            DrawdownStats {
                max_drawdown: breaker.max_drawdown(),
                max_duration: breaker.max_duration(),
            },
            exposed_bars,
        );

        debug!(
            strategy = strategy.name(),
            start = range.start,
            end = range.end,
            trades = metrics.total_trades,
            total_return = metrics.total_return,
            "Backtest finished"
        );

        Ok(BacktestResult {
            trades: run.trades,
            equity_curve,
            metrics,
            config: self.config.clone(),
            start_index: range.start,
            end_index: range.end,
        })
    }
}

fn dec(value: f64) -> Decimal {
    Decimal::from_f64(value).unwrap_or(Decimal::ZERO)
}

fn floor_quantity(quantity: Decimal) -> Decimal {
    quantity.round_dp_with_strategy(QUANTITY_DP, RoundingStrategy::ToZero)
}

fn fill_costs(fill: &Fill) -> TradeCosts {
    TradeCosts {
        commission: fill.commission,
        slippage: fill.slippage,
        market_impact: fill.market_impact,
        spread: fill.spread,
    }
}

/// Stop-loss and take-profit prices around an average entry.
fn exit_levels(
    config: &BacktestConfig,
    side: Side,
    avg_price: Decimal,
) -> (Option<Decimal>, Option<Decimal>) {
    let sl = dec(config.stop_loss_percent);
    let tp = dec(config.take_profit_percent);
    let stop_loss = config.use_stop_loss.then(|| match side {
        Side::Long => avg_price * (Decimal::ONE - sl),
        Side::Short => avg_price * (Decimal::ONE + sl),
    });
    let take_profit = config.use_take_profit.then(|| match side {
        Side::Long => avg_price * (Decimal::ONE + tp),
        Side::Short => avg_price * (Decimal::ONE - tp),
    });
    (stop_loss, take_profit)
}

/// Mutable state of a single run.
struct RunState<'a> {
    engine: &'a BacktestEngine,
    bars: &'a [Bar],
    closes: Vec<Decimal>,
    average_daily_volume: f64,
    cash: Decimal,
    position: Option<OpenPosition>,
    trades: Vec<Trade>,
    cumulative_notional: f64,
    rng: StdRng,
}

impl<'a> RunState<'a> {
    fn new(engine: &'a BacktestEngine, bars: &'a [Bar], range: &Range<usize>) -> Self {
        let in_range = &bars[range.clone()];
        let average_daily_volume = engine
            .execution
            .config()
            .average_daily_volume
            .unwrap_or_else(|| {
                in_range.iter().map(|b| b.volume).sum::<f64>() / in_range.len() as f64
            });

        Self {
            engine,
            bars,
            closes: bars[..range.end].iter().map(|b| b.close).collect(),
            average_daily_volume,
            cash: engine.config.initial_capital,
            position: None,
            trades: Vec::new(),
            cumulative_notional: 0.0,
            rng: StdRng::seed_from_u64(engine.config.seed),
        }
    }

    fn equity_at(&self, price: Decimal) -> Decimal {
        match &self.position {
            Some(p) => self.cash + p.side.sign() * p.quantity * price,
            None => self.cash,
        }
    }

    fn price_fill(
        &mut self,
        index: usize,
        reference: Decimal,
        quantity: Decimal,
        side: OrderSide,
    ) -> Fill {
        let request = FillRequest {
            price: reference,
            quantity,
            side,
            timestamp: self.bars[index].timestamp,
            recent_closes: &self.closes[..index],
            average_daily_volume: self.average_daily_volume,
            cumulative_notional: self.cumulative_notional,
            flat_commission_rate: self.engine.config.commission_rate,
        };
        self.engine.execution.execute(&request, &mut self.rng)
    }

    fn record_notional(&mut self, fill: &Fill, quantity: Decimal) {
        self.cumulative_notional += fill.notional(quantity).to_f64().unwrap_or(0.0);
    }

    fn apply(&mut self, index: usize, action: Action) {
        match action {
            Action::Hold => {}
            Action::Close => self.close(index, self.bars[index].open, ExitReason::Signal),
            Action::Buy(quantity) => self.order(index, Side::Long, quantity),
            Action::Sell(quantity) => self.order(index, Side::Short, quantity),
        }
    }

    fn order(&mut self, index: usize, side: Side, requested: Decimal) {
        if requested < Decimal::ZERO {
            debug!(index, %requested, "Ignoring order with negative quantity");
            return;
        }
        let open = self.bars[index].open;
        match self.position.as_ref().map(|p| p.side) {
            // Opposite-side orders flatten, they never reverse
            Some(held) if held != side => self.close(index, open, ExitReason::Signal),
            Some(_) => self.open_or_add(index, side, requested),
            None if side == Side::Short && !self.engine.config.allow_short => {
                debug!(index, "Short selling disabled, ignoring sell");
            }
            None => self.open_or_add(index, side, requested),
        }
    }

    /// Quantity implied by `risk_per_trade`: risk capital over the per-unit
    /// loss at the stop, or over the price when stops are off.
    fn risk_sized_quantity(&self, equity: Decimal, price: Decimal) -> Decimal {
        let config = &self.engine.config;
        let risk_capital = equity * dec(config.risk_per_trade);
        let per_unit_risk = if config.use_stop_loss {
            price * dec(config.stop_loss_percent)
        } else {
            price
        };
        if per_unit_risk <= Decimal::ZERO {
            Decimal::ZERO
        } else {
            risk_capital / per_unit_risk
        }
    }

    fn open_or_add(&mut self, index: usize, side: Side, requested: Decimal) {
        let engine = self.engine;
        let bars = self.bars;
        let price = bars[index].open;
        if price <= Decimal::ZERO {
            return;
        }

        let equity = self.equity_at(price);
        let mut quantity = if requested > Decimal::ZERO {
            requested
        } else {
            self.risk_sized_quantity(equity, price)
        };

        let held_notional = self
            .position
            .as_ref()
            .map(|p| p.quantity * price)
            .unwrap_or(Decimal::ZERO);
        let room = equity * dec(engine.config.max_position_percent) - held_notional;
        if room <= Decimal::ZERO {
            return;
        }
        quantity = floor_quantity(quantity.min(room / price));
        if quantity <= Decimal::ZERO {
            return;
        }

        let order_side = match side {
            Side::Long => OrderSide::Buy,
            Side::Short => OrderSide::Sell,
        };
        let mut fill = self.price_fill(index, price, quantity, order_side);

        // If cost exceeds available cash, reduce to affordable size
        if fill.notional(quantity) + fill.commission > self.cash {
            let per_unit = fill.price * (Decimal::ONE + dec(fill.commission_rate));
            if per_unit <= Decimal::ZERO || self.cash <= Decimal::ZERO {
                return;
            }
            quantity = floor_quantity(self.cash / per_unit);
            if quantity <= Decimal::ZERO {
                return;
            }
            fill = self.price_fill(index, price, quantity, order_side);
            if fill.notional(quantity) + fill.commission > self.cash {
                debug!(index, %quantity, "Order unaffordable after resizing, skipping");
                return;
            }
        }

        self.record_notional(&fill, quantity);
        let notional = fill.notional(quantity);
        match side {
            Side::Long => self.cash -= notional + fill.commission,
            Side::Short => self.cash += notional - fill.commission,
        }
        let costs = fill_costs(&fill);

        match &mut self.position {
            Some(pos) => {
                let total = pos.quantity + quantity;
                pos.avg_price = (pos.avg_price * pos.quantity + fill.price * quantity) / total;
                pos.quantity = total;
                pos.entry_costs.add(&costs);
                let (stop_loss, take_profit) = exit_levels(&engine.config, side, pos.avg_price);
                pos.stop_loss = stop_loss;
                pos.take_profit = take_profit;
            }
            None => {
                let (stop_loss, take_profit) = exit_levels(&engine.config, side, fill.price);
                self.position = Some(OpenPosition {
                    side,
                    quantity,
                    avg_price: fill.price,
                    entry_index: index,
                    entry_timestamp: bars[index].timestamp,
                    entry_costs: costs,
                    stop_loss,
                    take_profit,
                });
            }
        }
    }

    /// Close on a stop or target hit. Gaps through the level fill at the open.
    fn check_exits(&mut self, index: usize) {
        let bars = self.bars;
        let bar = &bars[index];
        let Some(pos) = self.position.as_ref() else {
            return;
        };

        let trigger = match pos.side {
            Side::Long => pos
                .stop_loss
                .filter(|s| bar.low <= *s)
                .map(|s| (s.min(bar.open), ExitReason::StopLoss))
                .or_else(|| {
                    pos.take_profit
                        .filter(|t| bar.high >= *t)
                        .map(|t| (t.max(bar.open), ExitReason::TakeProfit))
                }),
            Side::Short => pos
                .stop_loss
                .filter(|s| bar.high >= *s)
                .map(|s| (s.max(bar.open), ExitReason::StopLoss))
                .or_else(|| {
                    pos.take_profit
                        .filter(|t| bar.low <= *t)
                        .map(|t| (t.min(bar.open), ExitReason::TakeProfit))
                }),
        };

        if let Some((price, reason)) = trigger {
            self.close(index, price, reason);
        }
    }

    fn close(&mut self, index: usize, reference: Decimal, reason: ExitReason) {
        let Some(pos) = self.position.take() else {
            return;
        };

        let order_side = match pos.side {
            Side::Long => OrderSide::Sell,
            Side::Short => OrderSide::Buy,
        };
        let fill = self.price_fill(index, reference, pos.quantity, order_side);
        self.record_notional(&fill, pos.quantity);

        let notional = fill.notional(pos.quantity);
        match pos.side {
            Side::Long => self.cash += notional - fill.commission,
            Side::Short => self.cash -= notional + fill.commission,
        }

        let mut costs = pos.entry_costs;
        costs.add(&fill_costs(&fill));

        // P&L: long = (exit - entry), short = (entry - exit), net of both commissions
        let pnl = (fill.price - pos.avg_price) * pos.quantity * pos.side.sign() - costs.commission;
        let entry_notional = pos.avg_price * pos.quantity;
        let pnl_percent = if entry_notional > Decimal::ZERO {
            (pnl / entry_notional).to_f64().unwrap_or(0.0) * 100.0
        } else {
            0.0
        };

        self.trades.push(Trade {
            entry_index: pos.entry_index,
            exit_index: index,
            entry_timestamp: pos.entry_timestamp,
            exit_timestamp: self.bars[index].timestamp,
            entry_price: pos.avg_price,
            exit_price: fill.price,
            quantity: pos.quantity,
            side: pos.side,
            pnl,
            pnl_percent,
            costs,
            exit_reason: reason,
        });
    }
}
