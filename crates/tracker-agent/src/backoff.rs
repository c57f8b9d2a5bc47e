use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff: `delay(n) = min(initial * factor^n, max)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub factor: f64,
    pub max_delay_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay_ms: 1_000,
            factor: 1.5,
            max_delay_ms: 30_000,
        }
    }
}

impl BackoffPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        let cap = self.max_delay_ms;
        // a factor below 1 would shrink delays; treat it as constant backoff
        let factor = if self.factor.is_finite() { self.factor.max(1.0) } else { 1.0 };
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = self.initial_delay_ms as f64 * factor.powi(exponent);
        let millis = if raw.is_finite() && raw < cap as f64 {
            raw as u64
        } else {
            cap
        };
        Duration::from_millis(millis.min(cap))
    }
}
