// =============================================================================
// Exponential Moving Average (EMA) — incremental form
// =============================================================================
//
// Formula:
//   alpha = 2 / (period + 1)
//   EMA_t = alpha * price_t + (1 - alpha) * EMA_{t-1}
//
// The first sample seeds the average directly. The state reports ready once
// it has absorbed `period` samples; the warmup counter saturates there.
// =============================================================================

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmaState {
    period: usize,
    alpha: f64,
    value: f64,
    warmup: usize,
}

impl EmaState {
    /// A period below 1 is treated as 1.
    pub fn new(period: usize) -> Self {
        let period = period.max(1);
        Self {
            period,
            alpha: 2.0 / (period as f64 + 1.0),
            value: 0.0,
            warmup: 0,
        }
    }

    /// Fold one price into the average. Non-finite prices are ignored.
    pub fn update(&mut self, price: f64) {
        if !price.is_finite() {
            return;
        }
        if self.warmup == 0 {
            self.value = price;
            self.warmup = 1;
            return;
        }
        self.value = self.alpha * price + (1.0 - self.alpha) * self.value;
        if self.warmup < self.period {
            self.warmup += 1;
        }
    }

    pub fn is_ready(&self) -> bool {
        self.warmup >= self.period
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn period(&self) -> usize {
        self.period
    }

    pub fn samples(&self) -> usize {
        self.warmup
    }
}
