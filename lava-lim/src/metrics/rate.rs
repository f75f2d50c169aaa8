//! Counter-to-rate conversion shared by the stateful collectors

use std::time::{Duration, Instant};

/// Turns a monotonically increasing counter into a per-second rate
///
/// The first reading (and the first after a gap longer than `max_gap`, or
/// after the counter went backwards) only records a baseline and reports 0.
/// A reading with no elapsed time reports the previous rate and leaves the
/// baseline alone.
#[derive(Debug, Clone)]
pub struct RateTracker {
    baseline: Option<(u64, Instant)>,
    last_rate: f64,
    max_gap: Duration,
}

impl RateTracker {
    pub fn new(max_gap: Duration) -> Self {
        Self {
            baseline: None,
            last_rate: 0.0,
            max_gap,
        }
    }

    /// Rate of `counter` since the previous call, divided by `scale`
    pub fn update(&mut self, counter: u64, now: Instant, scale: f64) -> f64 {
        let Some((previous, then)) = self.baseline else {
            self.rebase(counter, now);
            return 0.0;
        };

        let elapsed = now.saturating_duration_since(then);
        if elapsed.is_zero() {
            return self.last_rate;
        }
        if elapsed > self.max_gap || counter < previous {
            self.rebase(counter, now);
            return 0.0;
        }

        let scale = if scale > 0.0 { scale } else { 1.0 };
        let rate = (counter - previous) as f64 / (elapsed.as_secs_f64() * scale);
        self.baseline = Some((counter, now));
        self.last_rate = rate;
        rate
    }

    pub fn last_rate(&self) -> f64 {
        self.last_rate
    }

    fn rebase(&mut self, counter: u64, now: Instant) {
        self.baseline = Some((counter, now));
        self.last_rate = 0.0;
    }
}
