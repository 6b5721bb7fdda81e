//! Rolling frame-rate telemetry.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Number of interval samples kept in the rolling window.
const WINDOW: usize = 256;

#[derive(Debug, Clone, Copy)]
struct Sample {
    /// Full wall-clock interval between two frames.
    total: Duration,
    /// Portion of the interval spent in explicit timed waits.
    sleep: Duration,
}

/// Rolling window of recent inter-frame intervals.
///
/// `add_frame`/`add_sleep` are O(1); derived values are read by status
/// consumers without blocking the executor.
#[derive(Debug, Default)]
pub struct FrameStats {
    samples: VecDeque<Sample>,
    last_frame: Option<Instant>,
    pending_sleep: Duration,
}

impl FrameStats {
    /// Create empty stats.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record explicit idle time spent in a timed wait.
    pub fn add_sleep(&mut self, duration: Duration) {
        self.pending_sleep += duration;
    }

    /// Record a completed cycle; the interval is measured from the previous
    /// call. The first call only establishes the baseline.
    pub fn add_frame(&mut self) {
        let now = Instant::now();
        if let Some(last) = self.last_frame {
            let total = now - last;
            if self.samples.len() == WINDOW {
                self.samples.pop_front();
            }
            self.samples.push_back(Sample {
                total,
                // A wait can span a pause window, so the recorded sleep may
                // exceed the measured interval; clamp it.
                sleep: self.pending_sleep.min(total),
            });
        }
        self.last_frame = Some(now);
        self.pending_sleep = Duration::ZERO;
    }

    /// Mean frame interval in milliseconds, `0.0` with no samples yet.
    pub fn mean_ms(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let total: Duration = self.samples.iter().map(|s| s.total).sum();
        total.as_secs_f64() * 1000.0 / self.samples.len() as f64
    }

    /// Mean non-sleep share of the interval, in milliseconds.
    pub fn mean_busy_ms(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let busy: Duration = self
            .samples
            .iter()
            .map(|s| s.total.saturating_sub(s.sleep))
            .sum();
        busy.as_secs_f64() * 1000.0 / self.samples.len() as f64
    }

    /// Derived frames per second, `None` until a mean interval exists.
    pub fn fps(&self) -> Option<u32> {
        let mean = self.mean_ms();
        if mean > 0.0 {
            Some((1000.0 / mean).round() as u32)
        } else {
            None
        }
    }

    /// Number of interval samples currently in the window.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Returns `true` when no interval has been recorded yet.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
