use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::{Bar, ParameterSet, Side};

/// What a strategy wants done on the next bar's open.
///
/// A zero quantity on `Buy`/`Sell` lets the engine size the order from
/// `risk_per_trade`. An order against an open position of the other side
/// closes that position instead of reversing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", content = "quantity", rename_all = "snake_case")]
pub enum Action {
    Buy(Decimal),
    Sell(Decimal),
    Close,
    Hold,
}

/// Scratch space a strategy may memoize indicator values into. Scoped to one run.
pub type IndicatorCache = HashMap<String, f64>;

/// Read-only view of the run handed to the strategy on every bar.
pub struct StrategyContext<'a> {
    pub position: Option<Side>,
    pub quantity: Decimal,
    pub entry_price: Option<Decimal>,
    pub equity: Decimal,
    pub cash: Decimal,
    /// Bars up to and including the current one. Nothing later is reachable.
    pub history: &'a [Bar],
    pub indicators: &'a mut IndicatorCache,
}

impl StrategyContext<'_> {
    pub fn is_flat(&self) -> bool {
        self.position.is_none()
    }

    /// Closing prices of the last `n` bars (fewer if history is shorter).
    pub fn recent_closes(&self, n: usize) -> impl Iterator<Item = &Decimal> {
        let start = self.history.len().saturating_sub(n);
        self.history[start..].iter().map(|b| &b.close)
    }
}

/// Decision function evaluated once per bar. Must not depend on anything
/// outside its arguments and its own immutable state.
pub trait Strategy: Send + Sync {
    fn name(&self) -> &str {
        "strategy"
    }

    fn on_bar(&self, bar: &Bar, index: usize, ctx: &mut StrategyContext<'_>) -> Action;
}

impl<S: Strategy + ?Sized> Strategy for Box<S> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn on_bar(&self, bar: &Bar, index: usize, ctx: &mut StrategyContext<'_>) -> Action {
        (**self).on_bar(bar, index, ctx)
    }
}

/// Builds a strategy instance from a parameter set. Used wherever
/// parameters are searched or perturbed.
pub trait StrategyFactory: Send + Sync {
    type Output: Strategy;

    fn create(&self, params: &ParameterSet) -> Self::Output;
}

impl<F, S> StrategyFactory for F
where
    F: Fn(&ParameterSet) -> S + Send + Sync,
    S: Strategy,
{
    type Output = S;

    fn create(&self, params: &ParameterSet) -> S {
        self(params)
    }
}
