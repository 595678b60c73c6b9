use rust_decimal::prelude::*;
use rust_decimal::Decimal;

/// Market impact modeling using the square root model.
///
/// The square root model estimates price impact from order notional relative
/// to the dollar volume the market trades in a day. Marginal impact per added
/// unit of size shrinks as the order grows.
///
/// Model: Impact = Coefficient × sqrt(OrderNotional / (ADV × ReferencePrice))
///
/// Where:
/// - Coefficient: market impact coefficient (typically 0.05-0.3)
/// - OrderNotional: quantity × reference price
/// - ADV: average daily volume in units

/// Market impact result.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarketImpact {
    /// Price impact as a fraction (e.g., 0.002 = 0.2% = 20 bps).
    pub impact: f64,
    /// Participation rate (order notional / daily dollar volume).
    pub participation_rate: f64,
}

impl MarketImpact {
    pub const NONE: MarketImpact = MarketImpact {
        impact: 0.0,
        participation_rate: 0.0,
    };
}

/// Compute market impact using the square root model.
///
/// Returns [`MarketImpact::NONE`] when volume or price is not positive, so a
/// missing volume feed never produces NaN fills.
pub fn compute_market_impact(
    order_notional: f64,
    average_daily_volume: f64,
    reference_price: f64,
    coefficient: f64,
) -> MarketImpact {
    let daily_dollar_volume = average_daily_volume * reference_price;
    if order_notional <= 0.0 || daily_dollar_volume <= 0.0 || !daily_dollar_volume.is_finite() {
        return MarketImpact::NONE;
    }

    let participation_rate = order_notional / daily_dollar_volume;
    MarketImpact {
        impact: coefficient * participation_rate.sqrt(),
        participation_rate,
    }
}

/// Apply an adverse price adjustment to a fill price.
///
/// For buy orders: price increases by `fraction`.
/// For sell orders: price decreases by `fraction`.
pub fn apply_adverse(base_price: Decimal, is_buy: bool, fraction: f64) -> Decimal {
    let multiplier = if is_buy {
        1.0 + fraction
    } else {
        1.0 - fraction
    };
    Decimal::from_f64(multiplier)
        .map(|m| base_price * m)
        .unwrap_or(base_price)
}

/// Standard deviation of simple returns over the last `window` closes.
///
/// Returns `None` when fewer than two returns are available.
pub fn rolling_volatility(closes: &[Decimal], window: usize) -> Option<f64> {
    if window == 0 || closes.len() < 3 {
        return None;
    }
    let lookback = window.min(closes.len() - 1);
    let returns: Vec<f64> = closes[closes.len() - lookback - 1..]
        .windows(2)
        .map(|w| {
            let p0 = w[0].to_f64().unwrap_or(0.0);
            let p1 = w[1].to_f64().unwrap_or(0.0);
            if p0 > 0.0 {
                p1 / p0 - 1.0
            } else {
                0.0
            }
        })
        .collect();

    if returns.len() < 2 {
        return None;
    }

    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>()
        / (returns.len() - 1) as f64;
    Some(variance.sqrt())
}
