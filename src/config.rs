//! Engine configuration.
//!
//! Options are plain structs with sensible defaults; `from_env` overlays
//! `REDRIVE_*` environment variables for container deployments.

use std::time::Duration;

/// Tuning knobs for the scheduling engine.
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Poller tick. Clamped to at least one second.
    pub poll_interval: Duration,
    /// Maximum tasks fetched per poll cycle.
    pub batch_size: u32,
    /// Maximum concurrent task executions per replica.
    pub executor_pool_size: usize,
    /// Retry ceiling when a task carries no override.
    pub default_max_retries: u32,
    /// Backoff base in hours when a task carries no override.
    pub default_retry_delay_hours: u32,
    /// Per-task lock lease.
    pub lock_duration: Duration,
    /// A PROCESSING lock older than this counts as stale.
    pub stale_task_threshold: Duration,
    /// Reaper tick.
    pub stale_check_interval: Duration,
    /// How long graceful shutdown waits for in-flight work.
    pub shutdown_grace: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            batch_size: 100,
            executor_pool_size: 20,
            default_max_retries: 5,
            default_retry_delay_hours: 24,
            lock_duration: Duration::from_secs(30 * 60),
            stale_task_threshold: Duration::from_secs(60 * 60),
            stale_check_interval: Duration::from_secs(5 * 60),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl SchedulerOptions {
    /// Overlay `REDRIVE_*` environment variables on the defaults.
    pub fn from_env() -> Self {
        let mut opts = Self::default();
        if let Some(ms) = env_u64("REDRIVE_POLL_INTERVAL_MS") {
            opts.poll_interval = Duration::from_millis(ms);
        }
        if let Some(n) = env_u64("REDRIVE_BATCH_SIZE") {
            opts.batch_size = n as u32;
        }
        if let Some(n) = env_u64("REDRIVE_EXECUTOR_POOL_SIZE") {
            opts.executor_pool_size = n as usize;
        }
        if let Some(n) = env_u64("REDRIVE_DEFAULT_MAX_RETRIES") {
            opts.default_max_retries = n as u32;
        }
        if let Some(n) = env_u64("REDRIVE_DEFAULT_RETRY_DELAY_HOURS") {
            opts.default_retry_delay_hours = n as u32;
        }
        if let Some(n) = env_u64("REDRIVE_LOCK_DURATION_MINUTES") {
            opts.lock_duration = Duration::from_secs(n * 60);
        }
        if let Some(n) = env_u64("REDRIVE_STALE_TASK_THRESHOLD_MINUTES") {
            opts.stale_task_threshold = Duration::from_secs(n * 60);
        }
        if let Some(ms) = env_u64("REDRIVE_STALE_CHECK_INTERVAL_MS") {
            opts.stale_check_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = env_u64("REDRIVE_SHUTDOWN_GRACE_SECONDS") {
            opts.shutdown_grace = Duration::from_secs(secs);
        }
        opts.validated()
    }

    /// Clamp out-of-range values instead of failing startup.
    pub fn validated(mut self) -> Self {
        if self.poll_interval < Duration::from_secs(1) {
            self.poll_interval = Duration::from_secs(1);
        }
        if self.batch_size == 0 {
            self.batch_size = 1;
        }
        if self.executor_pool_size == 0 {
            self.executor_pool_size = 1;
        }
        if self.lock_duration < Duration::from_secs(60) {
            self.lock_duration = Duration::from_secs(60);
        }
        self
    }

    /// Cluster-mutex lease for the poller: must outlast the longest tick.
    pub fn poll_mutex_lease(&self) -> Duration {
        self.lock_duration.max(Duration::from_secs(5 * 60))
    }
}

/// Connection settings for one outbound service client.
#[derive(Debug, Clone)]
pub struct ServiceClientOptions {
    pub base_url: String,
    pub timeout: Duration,
}

impl ServiceClientOptions {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Chat-webhook alert sink settings.
#[derive(Debug, Clone)]
pub struct AlertOptions {
    pub enabled: bool,
    pub webhook_url: Option<String>,
    pub channel: Option<String>,
    /// Base URL used to build clickable task links in alert payloads.
    pub dashboard_base_url: Option<String>,
}

impl Default for AlertOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            webhook_url: None,
            channel: None,
            dashboard_base_url: None,
        }
    }
}

impl AlertOptions {
    pub fn from_env() -> Self {
        Self {
            enabled: std::env::var("REDRIVE_ALERT_ENABLED")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
            webhook_url: std::env::var("REDRIVE_ALERT_WEBHOOK_URL").ok(),
            channel: std::env::var("REDRIVE_ALERT_CHANNEL").ok(),
            dashboard_base_url: std::env::var("REDRIVE_DASHBOARD_BASE_URL").ok(),
        }
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
