// Timing helpers for session phases

use std::time::{Duration, Instant};

/// Timer that reports a session phase running longer than its threshold
///
/// The report is a warning under the `perf` target, emitted when the
/// timer is dropped.
pub struct PerfTimer {
    name: &'static str,
    start: Instant,
    threshold_ms: u64,
}

impl PerfTimer {
    pub fn with_threshold(name: &'static str, threshold_ms: u64) -> Self {
        Self {
            name,
            start: Instant::now(),
            threshold_ms,
        }
    }

    fn exceeded(&self, elapsed: Duration) -> bool {
        elapsed.as_millis() >= self.threshold_ms as u128
    }
}

impl Drop for PerfTimer {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        if self.exceeded(elapsed) {
            tracing::warn!(
                target: "perf",
                phase = self.name,
                duration_ms = elapsed.as_millis() as u64,
                "Slow phase detected"
            );
        } else {
            tracing::trace!(
                target: "perf",
                phase = self.name,
                duration_ms = elapsed.as_millis() as u64,
                "Phase completed"
            );
        }
    }
}

/// Macro for easy phase timing
#[macro_export]
macro_rules! perf_time {
    ($name:expr, $threshold_ms:expr) => {
        $crate::perf::PerfTimer::with_threshold($name, $threshold_ms)
    };
}
