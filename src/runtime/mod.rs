//! The scheduling engine: poller, executor, reaper, and their lifecycle.
//!
//! A [`Runtime`] is one replica. Replicas coordinate exclusively through
//! the shared store (cluster mutexes + per-task conditional locks); there
//! is no replica-to-replica channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub mod executor;
pub mod observability;
pub mod registry;

mod poller;
mod reaper;

pub use executor::TaskExecutor;
pub use observability::{EngineMetrics, MetricsSnapshot};
pub use registry::{HandlerRegistry, HandlerRegistryBuilder};

use crate::alert::{AlertSink, NoopAlerts};
use crate::client::Client;
use crate::config::SchedulerOptions;
use crate::providers::sqlite::SqliteTaskStore;
use crate::providers::TaskStore;
use crate::task::TaskId;

/// Cluster-mutex name guarding the polling loop.
pub(crate) const POLL_MUTEX: &str = "taskPollingJob";
/// Cluster-mutex name guarding the stale-task reaper.
pub(crate) const REAPER_MUTEX: &str = "staleTaskCleanup";

pub struct Runtime {
    pub(crate) store: Arc<dyn TaskStore>,
    pub(crate) executor: Arc<TaskExecutor>,
    pub(crate) options: SchedulerOptions,
    pub(crate) metrics: Arc<EngineMetrics>,
    pub(crate) instance_id: String,
    pub(crate) shutdown: Arc<AtomicBool>,
    pub(crate) shutdown_notify: Arc<Notify>,
    /// Single-flight guard: a tick is skipped while the previous one runs.
    pub(crate) poll_in_flight: Arc<AtomicBool>,
    /// Bounds concurrent task executions per replica.
    pub(crate) execution_permits: Arc<Semaphore>,
    dispatch_tx: mpsc::Sender<TaskId>,
    joins: Mutex<Vec<JoinHandle<()>>>,
}

impl Runtime {
    /// Start a replica against an in-memory SQLite store with alerting
    /// disabled. Convenient for tests and local development.
    pub async fn start(
        registry: Arc<HandlerRegistry>,
        options: SchedulerOptions,
    ) -> Result<Arc<Self>, crate::providers::StoreError> {
        let store = SqliteTaskStore::new_in_memory().await.map_err(|e| {
            crate::providers::StoreError::permanent("runtime_start", e.to_string())
        })?;
        Ok(Self::start_with_store(Arc::new(store), registry, Arc::new(NoopAlerts), options).await)
    }

    /// Start a replica with a custom store and alert sink.
    pub async fn start_with_store(
        store: Arc<dyn TaskStore>,
        registry: Arc<HandlerRegistry>,
        alerts: Arc<dyn AlertSink>,
        options: SchedulerOptions,
    ) -> Arc<Self> {
        // Install a default subscriber if none set (ok to call many times).
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
            )
            .try_init();

        let options = options.validated();
        let instance_id = replica_instance_id();
        let metrics = Arc::new(EngineMetrics::default());
        let executor = Arc::new(TaskExecutor::new(
            Arc::clone(&store),
            registry,
            alerts,
            options.clone(),
            instance_id.clone(),
            Arc::clone(&metrics),
        ));

        let (dispatch_tx, dispatch_rx) = mpsc::channel::<TaskId>(64);

        let runtime = Arc::new(Self {
            store,
            executor,
            execution_permits: Arc::new(Semaphore::new(options.executor_pool_size)),
            options,
            metrics,
            instance_id,
            shutdown: Arc::new(AtomicBool::new(false)),
            shutdown_notify: Arc::new(Notify::new()),
            poll_in_flight: Arc::new(AtomicBool::new(false)),
            dispatch_tx,
            joins: Mutex::new(Vec::new()),
        });

        info!(
            instance_id = %runtime.instance_id,
            store = runtime.store.name(),
            "starting task scheduler runtime"
        );

        let poller = runtime.clone().start_poller();
        let reaper = runtime.clone().start_reaper();
        let dispatcher = runtime.clone().start_direct_dispatcher(dispatch_rx);
        {
            let mut joins = runtime.joins.lock().await;
            joins.push(poller);
            joins.push(reaper);
            joins.push(dispatcher);
        }

        runtime
    }

    /// `hostname:pid`, fixed for the replica lifetime.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn store(&self) -> Arc<dyn TaskStore> {
        Arc::clone(&self.store)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Management client wired for immediate `retry-now` dispatch.
    pub fn client(&self) -> Client {
        Client::new(Arc::clone(&self.store)).with_dispatch(self.dispatch_tx.clone())
    }

    /// Listens for task ids pushed by `retry-now` and runs them outside
    /// the polling cadence.
    fn start_direct_dispatcher(self: Arc<Self>, mut rx: mpsc::Receiver<TaskId>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(task_id) = rx.recv().await {
                if self.shutdown.load(Ordering::Relaxed) {
                    break;
                }
                let executor = Arc::clone(&self.executor);
                let permits = Arc::clone(&self.execution_permits);
                tokio::spawn(async move {
                    let Ok(_permit) = permits.acquire_owned().await else {
                        return;
                    };
                    executor.process_task_by_id(task_id).await;
                });
            }
        })
    }

    /// Graceful stop: no new ticks, wait for in-flight work up to
    /// `shutdown_grace`, then abort the loops. Tasks still locked at that
    /// point are recovered by the reaper on another replica.
    pub async fn shutdown(self: &Arc<Self>) {
        info!(instance_id = %self.instance_id, "shutting down task scheduler runtime");
        self.shutdown.store(true, Ordering::Relaxed);
        self.shutdown_notify.notify_waiters();

        let drained = tokio::time::timeout(self.options.shutdown_grace, async {
            // All permits free means no execution is in flight.
            let _ = self
                .execution_permits
                .acquire_many(self.options.executor_pool_size as u32)
                .await;
        })
        .await;

        if drained.is_err() {
            warn!(
                instance_id = %self.instance_id,
                "shutdown grace expired with executions in flight; their locks will be reaped"
            );
        }

        let mut joins = self.joins.lock().await;
        for handle in joins.drain(..) {
            handle.abort();
        }
    }
}

/// Replica identity: `hostname:pid`, with a sequence suffix when several
/// runtimes share one process (tests, embedded deployments).
fn replica_instance_id() -> String {
    static REPLICA_SEQ: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
    let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    let pid = std::process::id();
    match REPLICA_SEQ.fetch_add(1, Ordering::Relaxed) {
        0 => format!("{hostname}:{pid}"),
        seq => format!("{hostname}:{pid}-{seq}"),
    }
}
