//! Sample-rate estimation.
//!
//! A one-pole recursive average of frame inter-arrival times, maintained
//! incrementally so no history is ever buffered. The estimator is owned by
//! the decode loop and reset on every streaming start.

use tokio::time::Instant;

/// Running estimate of the effective sample rate.
#[derive(Debug)]
pub struct RateEstimator {
    samples: u64,
    last_arrival: Option<Instant>,
    smoothed_interval: f64,
    rate: f64,
}

impl RateEstimator {
    /// Fresh estimator with no samples recorded.
    pub fn new() -> Self {
        Self {
            samples: 0,
            last_arrival: None,
            smoothed_interval: 0.0,
            rate: 0.0,
        }
    }

    /// Discard all state, as if no sample had ever arrived.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Record one accepted sample at the current instant.
    ///
    /// Returns the updated rate estimate, or `None` until two samples have
    /// arrived (a single timestamp carries no rate information). The first
    /// interval seeds the average; each later interval is folded in with a
    /// weight of `1 / (samples + 1)`.
    pub fn record_arrival(&mut self) -> Option<f64> {
        let now = Instant::now();
        let result = match self.last_arrival {
            None => None,
            Some(prev) => {
                let elapsed = now.duration_since(prev).as_secs_f64();
                if elapsed <= 0.0 {
                    // Two frames inside one clock tick; skip the update
                    // rather than divide by zero.
                    None
                } else if self.samples == 1 {
                    self.smoothed_interval = elapsed;
                    self.rate = 1.0 / elapsed;
                    Some(self.rate)
                } else {
                    self.smoothed_interval +=
                        (elapsed - self.smoothed_interval) / (self.samples as f64 + 1.0);
                    self.rate = 1.0 / self.smoothed_interval;
                    Some(self.rate)
                }
            }
        };
        self.last_arrival = Some(now);
        self.samples += 1;
        result
    }

    /// Samples recorded since construction or the last reset.
    pub fn samples(&self) -> u64 {
        self.samples
    }

    /// Most recent rate estimate, 0.0 before the second sample.
    pub fn rate(&self) -> f64 {
        self.rate
    }
}

impl Default for RateEstimator {
    fn default() -> Self {
        Self::new()
    }
}
