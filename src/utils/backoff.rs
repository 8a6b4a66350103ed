//! Exponential backoff with jitter for engine retries.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    factor: f64,
    max: Duration,
    /// Symmetric jitter fraction, e.g. 0.2 for +/-20%.
    jitter: f64,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, factor: f64, max: Duration, jitter: f64) -> Self {
        Self {
            base,
            factor,
            max,
            jitter,
            attempt: 0,
        }
    }

    /// Engine retry schedule: 200ms base, doubling, capped at 5s, +/-20%.
    pub fn engine() -> Self {
        Self::new(Duration::from_millis(200), 2.0, Duration::from_secs(5), 0.2)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Delay for the next attempt, advancing the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.base.as_millis() as f64 * self.factor.powi(self.attempt as i32);
        self.attempt = self.attempt.saturating_add(1);
        let capped = exp.min(self.max.as_millis() as f64);
        let jittered = if self.jitter > 0.0 {
            let spread = capped * self.jitter;
            capped + rand::thread_rng().gen_range(-spread..=spread)
        } else {
            capped
        };
        Duration::from_millis(jittered.max(0.0) as u64)
    }
}
