//! Stale-lock reaper.
//!
//! The fetch predicate already ignores expired locks, so abandoned tasks
//! would eventually be picked up anyway. The reaper exists to turn them
//! back explicitly: the row gets a synthetic, operator-visible error and a
//! near-term retry slot instead of silently re-entering the queue.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{Runtime, REAPER_MUTEX};
use crate::task::{now_ms, TaskId};

/// Reaped tasks become eligible again shortly after the sweep.
const REAPED_RETRY_DELAY_MS: i64 = 60_000;
/// Lease on the reaper's cluster mutex.
const REAPER_LEASE_MS: i64 = 5 * 60 * 1000;

impl Runtime {
    pub(super) fn start_reaper(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.options.stale_check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if self.shutdown.load(Ordering::Relaxed) {
                            break;
                        }
                        self.reap_stale_tasks().await;
                    }
                    _ = self.shutdown_notify.notified() => {
                        debug!("reaper exiting on shutdown");
                        break;
                    }
                }
            }
        })
    }

    /// Run one reap sweep; returns how many tasks were reset.
    ///
    /// Public so tests and operator tooling can force a sweep.
    pub async fn reap_stale_tasks(&self) -> u64 {
        let now = now_ms();

        match self
            .store
            .acquire_cluster_lock(REAPER_MUTEX, &self.instance_id, REAPER_LEASE_MS, now)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!("another replica holds the reaper mutex");
                return 0;
            }
            Err(e) => {
                warn!(error = %e, "failed to acquire reaper mutex");
                return 0;
            }
        }

        let reset = self.sweep(now).await;
        if let Err(e) = self
            .store
            .release_cluster_lock(REAPER_MUTEX, &self.instance_id)
            .await
        {
            warn!(error = %e, "failed to release reaper mutex");
        }
        reset
    }

    async fn sweep(&self, now: i64) -> u64 {
        let threshold = now - self.options.stale_task_threshold.as_millis() as i64;

        let stale = match self.store.find_stale_tasks(threshold).await {
            Ok(stale) => stale,
            Err(e) => {
                error!(error = %e, "failed to query stale tasks");
                return 0;
            }
        };

        if stale.is_empty() {
            debug!("no stale tasks found");
            return 0;
        }

        warn!(count = stale.len(), "found stale tasks, resetting for retry");
        let ids: Vec<TaskId> = stale.iter().map(|t| t.id).collect();

        match self
            .store
            .reset_stale_tasks(&ids, now + REAPED_RETRY_DELAY_MS, now)
            .await
        {
            Ok(reset) => {
                info!(reset, "reset stale tasks for retry");
                self.metrics.record_reaped(reset);
                reset
            }
            Err(e) => {
                error!(error = %e, "failed to reset stale tasks");
                0
            }
        }
    }
}
