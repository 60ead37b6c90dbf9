//! Polling loop: fetch ready tasks under the cluster mutex and fan them
//! out to the executor.
//!
//! The cluster mutex keeps one replica polling at a time; per-task locks
//! keep the actual work distributed, so the mutex is a load optimization
//! rather than a correctness requirement.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use super::{Runtime, POLL_MUTEX};
use crate::task::now_ms;

impl Runtime {
    pub(super) fn start_poller(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.options.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // Skip the immediate first tick so startup stays quiet.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if self.shutdown.load(Ordering::Relaxed) {
                            break;
                        }
                        self.poll_once().await;
                    }
                    _ = self.shutdown_notify.notified() => {
                        debug!("poller exiting on shutdown");
                        break;
                    }
                }
            }
        })
    }

    /// Run one polling cycle: singleton guard, fetch, fan-out, await.
    ///
    /// Public so tests and operator tooling can drive a cycle on demand.
    pub async fn poll_once(&self) {
        // A replica never overlaps its own cycles.
        if self
            .poll_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("previous polling cycle still running, skipping");
            return;
        }

        self.run_poll_cycle().await;
        self.poll_in_flight.store(false, Ordering::SeqCst);
    }

    async fn run_poll_cycle(&self) {
        let now = now_ms();
        let lease_ms = self.options.poll_mutex_lease().as_millis() as i64;

        match self
            .store
            .acquire_cluster_lock(POLL_MUTEX, &self.instance_id, lease_ms, now)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!("another replica holds the polling mutex");
                return;
            }
            Err(e) => {
                warn!(error = %e, "failed to acquire polling mutex");
                return;
            }
        }

        self.metrics.record_poll_cycle();

        let tasks = match self.store.fetch_due_tasks(now, self.options.batch_size).await {
            Ok(tasks) => tasks,
            Err(e) => {
                error!(error = %e, "failed to fetch due tasks");
                self.release_poll_mutex().await;
                return;
            }
        };

        if tasks.is_empty() {
            debug!("no tasks ready for execution");
            self.release_poll_mutex().await;
            return;
        }

        info!(count = tasks.len(), "found tasks ready for execution");

        // Spawn one unit per task; the semaphore bounds how many actually
        // run at once. Executions begin in fetch order but may finish in
        // any order.
        let mut executions = JoinSet::new();
        for task in tasks {
            let executor = Arc::clone(&self.executor);
            let permits = Arc::clone(&self.execution_permits);
            executions.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return false;
                };
                executor.process_task(&task).await
            });
        }

        let total = executions.len();
        let mut succeeded = 0usize;

        // The batch must finish inside the lock lease; whatever is still
        // running after that keeps its own task locks and the mutex is
        // released regardless.
        let deadline = tokio::time::Instant::now() + self.options.lock_duration;
        loop {
            let next = tokio::time::timeout_at(deadline, executions.join_next()).await;
            match next {
                Ok(Some(Ok(true))) => succeeded += 1,
                Ok(Some(Ok(false))) => {}
                Ok(Some(Err(e))) => warn!(error = %e, "task execution unit failed"),
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        remaining = executions.len(),
                        "batch exceeded lock duration; leaving stragglers to their task locks"
                    );
                    executions.detach_all();
                    break;
                }
            }
        }

        info!(total, succeeded, "completed polling cycle");
        self.release_poll_mutex().await;
    }

    async fn release_poll_mutex(&self) {
        if let Err(e) = self
            .store
            .release_cluster_lock(POLL_MUTEX, &self.instance_id)
            .await
        {
            warn!(error = %e, "failed to release polling mutex");
        }
    }
}
