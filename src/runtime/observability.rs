//! In-process engine counters.
//!
//! Plain atomics with a snapshot view; exporters live outside the engine.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct EngineMetrics {
    tasks_succeeded: AtomicU64,
    tasks_failed: AtomicU64,
    retries_scheduled: AtomicU64,
    max_retries_exceeded: AtomicU64,
    dead_lettered: AtomicU64,
    tasks_expired: AtomicU64,
    stale_tasks_reaped: AtomicU64,
    poll_cycles: AtomicU64,
}

impl EngineMetrics {
    pub fn record_success(&self) {
        self.tasks_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.tasks_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_max_retries_exceeded(&self) {
        self.max_retries_exceeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_letter(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_expired(&self) {
        self.tasks_expired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reaped(&self, n: u64) {
        self.stale_tasks_reaped.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_poll_cycle(&self) {
        self.poll_cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            tasks_succeeded: self.tasks_succeeded.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            retries_scheduled: self.retries_scheduled.load(Ordering::Relaxed),
            max_retries_exceeded: self.max_retries_exceeded.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            tasks_expired: self.tasks_expired.load(Ordering::Relaxed),
            stale_tasks_reaped: self.stale_tasks_reaped.load(Ordering::Relaxed),
            poll_cycles: self.poll_cycles.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time counter values, for tests and diagnostics endpoints.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    pub retries_scheduled: u64,
    pub max_retries_exceeded: u64,
    pub dead_lettered: u64,
    pub tasks_expired: u64,
    pub stale_tasks_reaped: u64,
    pub poll_cycles: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let m = EngineMetrics::default();
        m.record_success();
        m.record_success();
        m.record_failure();
        m.record_retry();
        m.record_reaped(3);
        let snap = m.snapshot();
        assert_eq!(snap.tasks_succeeded, 2);
        assert_eq!(snap.tasks_failed, 1);
        assert_eq!(snap.retries_scheduled, 1);
        assert_eq!(snap.stale_tasks_reaped, 3);
        assert_eq!(snap.dead_lettered, 0);
    }
}
