//! Statistics tracking for chunk processing.
//!
//! Counts per-chunk outcomes and latency across a run so interactive
//! callers can report throughput. Shared by every pool worker, so all
//! counters are lock-free except the rolling per-second window.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Statistics tracker for chunk-level completions.
#[derive(Debug)]
pub struct StatsTracker {
    start_time: Instant,
    success_count: AtomicU64,
    skipped_count: AtomicU64,
    failed_count: AtomicU64,
    total_latency_us: AtomicU64,
    recent: Mutex<VecDeque<Instant>>,
}

impl StatsTracker {
    /// Create a new tracker with its clock started now.
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            success_count: AtomicU64::new(0),
            skipped_count: AtomicU64::new(0),
            failed_count: AtomicU64::new(0),
            total_latency_us: AtomicU64::new(0),
            recent: Mutex::new(VecDeque::new()),
        }
    }

    /// Record a successful chunk completion.
    pub fn record_success(&self, latency: Duration) {
        self.success_count.fetch_add(1, Ordering::Relaxed);
        self.total_latency_us
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
        self.record_recent();
    }

    /// Record a skipped chunk.
    pub fn record_skipped(&self) {
        self.skipped_count.fetch_add(1, Ordering::Relaxed);
        self.record_recent();
    }

    /// Record a failed chunk.
    pub fn record_failed(&self) {
        self.failed_count.fetch_add(1, Ordering::Relaxed);
        self.record_recent();
    }

    fn record_recent(&self) {
        let now = Instant::now();
        let mut recent = self.recent.lock();
        recent.push_back(now);
        let cutoff = now - Duration::from_secs(1);
        while let Some(front) = recent.front() {
            if *front < cutoff {
                recent.pop_front();
            } else {
                break;
            }
        }
    }

    /// Chunks completed in the last second.
    pub fn chunks_per_second(&self) -> f64 {
        let now = Instant::now();
        let mut recent = self.recent.lock();
        let cutoff = now - Duration::from_secs(1);
        while let Some(front) = recent.front() {
            if *front < cutoff {
                recent.pop_front();
            } else {
                break;
            }
        }
        recent.len() as f64
    }

    /// Snapshot of the current statistics.
    pub fn snapshot(&self) -> StatsSnapshot {
        let success = self.success_count.load(Ordering::Relaxed);
        let skipped = self.skipped_count.load(Ordering::Relaxed);
        let failed = self.failed_count.load(Ordering::Relaxed);
        let total_latency = self.total_latency_us.load(Ordering::Relaxed);

        let avg_latency_ms = if success > 0 {
            (total_latency as f64 / success as f64) / 1000.0
        } else {
            0.0
        };

        StatsSnapshot {
            elapsed: self.start_time.elapsed(),
            success_count: success,
            skipped_count: skipped,
            failed_count: failed,
            avg_latency_ms,
        }
    }
}

impl Default for StatsTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// A snapshot of current statistics.
#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    /// Elapsed time since the tracker was created.
    pub elapsed: Duration,
    /// Chunks completed successfully.
    pub success_count: u64,
    /// Chunks skipped.
    pub skipped_count: u64,
    /// Chunks failed.
    pub failed_count: u64,
    /// Average completion latency in milliseconds.
    pub avg_latency_ms: f64,
}

impl StatsSnapshot {
    /// Total chunks processed, whatever the outcome.
    pub fn total(&self) -> u64 {
        self.success_count + self.skipped_count + self.failed_count
    }

    /// Overall chunks per second since the tracker started.
    pub fn overall_rate(&self) -> f64 {
        if self.elapsed.as_secs_f64() > 0.0 {
            self.total() as f64 / self.elapsed.as_secs_f64()
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_counting() {
        let tracker = StatsTracker::new();
        tracker.record_success(Duration::from_millis(50));
        tracker.record_success(Duration::from_millis(100));
        tracker.record_skipped();
        tracker.record_failed();

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.success_count, 2);
        assert_eq!(snapshot.skipped_count, 1);
        assert_eq!(snapshot.failed_count, 1);
        assert_eq!(snapshot.total(), 4);
        assert_eq!(snapshot.avg_latency_ms, 75.0);
    }

    #[test]
    fn test_recent_rate_tracks_last_second() {
        let tracker = StatsTracker::new();
        for _ in 0..5 {
            tracker.record_skipped();
        }
        assert_eq!(tracker.chunks_per_second(), 5.0);
    }

    #[test]
    fn test_empty_snapshot() {
        let tracker = StatsTracker::new();
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.total(), 0);
        assert_eq!(snapshot.avg_latency_ms, 0.0);
    }
}
