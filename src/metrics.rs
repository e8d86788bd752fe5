use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Shared progress counters for a batch of queued requests.
///
/// The queue updates these as tasks settle; consumers read them to render
/// progress. Cloning the handle shares the underlying counters.
#[derive(Debug, Clone)]
pub struct ProgressMetrics {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    total: AtomicU64,
    completed: AtomicU64,
    errors: AtomicU64,
    started_at: Instant,
    finalized: AtomicBool,
    // Elapsed milliseconds captured at finalize time.
    final_elapsed_ms: AtomicU64,
}

impl ProgressMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                total: AtomicU64::new(0),
                completed: AtomicU64::new(0),
                errors: AtomicU64::new(0),
                started_at: Instant::now(),
                finalized: AtomicBool::new(false),
                final_elapsed_ms: AtomicU64::new(0),
            }),
        }
    }

    /// Registers `count` newly scheduled tasks.
    pub fn add_tasks(&self, count: u64) {
        self.inner.total.fetch_add(count, Ordering::Relaxed);
    }

    /// Records one terminal resolution. Retries of the same task do not pass
    /// through here; only the final settle does.
    pub fn mark_resolved(&self, ok: bool) {
        self.inner.completed.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.inner.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn total(&self) -> u64 {
        self.inner.total.load(Ordering::Relaxed)
    }

    pub fn completed(&self) -> u64 {
        self.inner.completed.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.inner.errors.load(Ordering::Relaxed)
    }

    /// Wall time since creation, frozen once [`finalize`](Self::finalize)
    /// has run.
    pub fn elapsed(&self) -> Duration {
        if self.inner.finalized.load(Ordering::Acquire) {
            Duration::from_millis(self.inner.final_elapsed_ms.load(Ordering::Acquire))
        } else {
            self.inner.started_at.elapsed()
        }
    }

    /// Average resolutions per second over the elapsed window.
    pub fn speed_rps(&self) -> f64 {
        let secs = self.elapsed().as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.completed() as f64 / secs
    }

    /// Estimated time to drain the remaining tasks at the current speed.
    /// `None` until at least one task has resolved.
    pub fn remaining_estimate(&self) -> Option<Duration> {
        let speed = self.speed_rps();
        if speed <= 0.0 {
            return None;
        }
        let remaining = self.total().saturating_sub(self.completed());
        Some(Duration::from_secs_f64(remaining as f64 / speed))
    }

    /// Freezes the elapsed clock. Safe to call more than once; only the
    /// first call takes effect.
    pub fn finalize(&self) {
        if self
            .inner
            .finalized
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let elapsed = self.inner.started_at.elapsed();
            self.inner
                .final_elapsed_ms
                .store(elapsed.as_millis() as u64, Ordering::Release);
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.inner.finalized.load(Ordering::Acquire)
    }
}

impl Default for ProgressMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Formats a duration as `m:ss`.
pub fn format_mmss(duration: Duration) -> String {
    let total = duration.as_secs();
    format!("{}:{:02}", total / 60, total % 60)
}

/// Formats a duration as a coarse human-readable estimate.
pub fn format_readable(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_resolutions_and_errors() {
        let metrics = ProgressMetrics::new();
        metrics.add_tasks(3);
        metrics.mark_resolved(true);
        metrics.mark_resolved(false);

        assert_eq!(metrics.total(), 3);
        assert_eq!(metrics.completed(), 2);
        assert_eq!(metrics.errors(), 1);
    }

    #[test]
    fn finalize_is_idempotent() {
        let metrics = ProgressMetrics::new();
        metrics.finalize();
        let first = metrics.elapsed();
        std::thread::sleep(Duration::from_millis(20));
        metrics.finalize();
        assert_eq!(metrics.elapsed(), first);
        assert!(metrics.is_finalized());
    }

    #[test]
    fn remaining_estimate_needs_progress() {
        let metrics = ProgressMetrics::new();
        metrics.add_tasks(10);
        assert!(metrics.remaining_estimate().is_none());

        metrics.mark_resolved(true);
        std::thread::sleep(Duration::from_millis(5));
        assert!(metrics.remaining_estimate().is_some());
    }

    #[test]
    fn formats_durations() {
        assert_eq!(format_mmss(Duration::from_secs(65)), "1:05");
        assert_eq!(format_mmss(Duration::from_secs(9)), "0:09");
        assert_eq!(format_readable(Duration::from_secs(45)), "45s");
        assert_eq!(format_readable(Duration::from_secs(125)), "2m 5s");
        assert_eq!(format_readable(Duration::from_secs(3700)), "1h 1m");
    }

    #[test]
    fn shared_handles_see_the_same_counters() {
        let metrics = ProgressMetrics::new();
        let clone = metrics.clone();
        metrics.add_tasks(2);
        clone.mark_resolved(true);

        assert_eq!(metrics.completed(), 1);
        assert_eq!(clone.total(), 2);
    }
}
