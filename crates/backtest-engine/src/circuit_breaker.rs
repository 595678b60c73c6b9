use rust_decimal::prelude::*;
use rust_decimal::Decimal;

/// Tracks the running equity peak, drawdown and drawdown duration, and trips
/// once drawdown from the peak reaches the configured limit.
pub struct DrawdownBreaker {
    limit: f64,
    peak: Decimal,
    bars_below_peak: usize,
    max_drawdown: f64,
    max_duration: usize,
    halted: bool,
}

impl DrawdownBreaker {
    pub fn new(initial_equity: Decimal, limit: f64) -> Self {
        Self {
            limit,
            peak: initial_equity,
            bars_below_peak: 0,
            max_drawdown: 0.0,
            max_duration: 0,
            halted: false,
        }
    }

    /// Drawdown of `equity` against the current peak without recording it.
    pub fn drawdown_of(&self, equity: Decimal) -> f64 {
        let peak = self.peak.to_f64().unwrap_or(0.0);
        let equity = equity.to_f64().unwrap_or(0.0);
        if peak > 0.0 && equity < peak {
            (peak - equity) / peak
        } else {
            0.0
        }
    }

    /// Whether `equity` would trip the breaker.
    pub fn breaches(&self, equity: Decimal) -> bool {
        self.drawdown_of(equity) >= self.limit
    }

    /// Record the equity for one bar. Returns that bar's drawdown.
    pub fn record(&mut self, equity: Decimal) -> f64 {
        if equity >= self.peak {
            self.peak = equity;
            self.bars_below_peak = 0;
            return 0.0;
        }

        self.bars_below_peak += 1;
        self.max_duration = self.max_duration.max(self.bars_below_peak);

        let drawdown = self.drawdown_of(equity);
        if drawdown > self.max_drawdown {
            self.max_drawdown = drawdown;
        }
        if drawdown >= self.limit {
            self.halted = true;
        }
        drawdown
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn max_drawdown(&self) -> f64 {
        self.max_drawdown
    }

    pub fn max_duration(&self) -> usize {
        self.max_duration
    }
}
