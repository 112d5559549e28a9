//! # Global queue configuration.
//!
//! [`QueueConfig`] defines the controller's behavior: worker pool bounds,
//! per-worker concurrency, task retry/timeout defaults, info cache intervals,
//! and the worker restart backoff.
//!
//! ## Environment
//! The process environment is consulted **once**, at construction:
//! - `MAX_TASK_RETRIES` — default task retry budget (fallback 3)
//! - `TASK_TIMEOUT_MS` — default task timeout in milliseconds (fallback 30000)
//! - `MAX_CONCURRENT_TASKS` — per-worker in-flight cap (fallback 5)
//! - `ANQUEUE_GENERATE_TYPES` — toggles the type-generation hash glue
//!
//! # Example
//! ```
//! use std::time::Duration;
//! use anqueue::QueueConfig;
//!
//! let mut cfg = QueueConfig::from_env("./tasks");
//! cfg.max_workers = 4;
//! cfg.cache_interval = Duration::from_millis(100);
//!
//! assert_eq!(cfg.max_workers, 4);
//! assert_eq!(cfg.worker_prefix, "Anqueue-worker-");
//! ```

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use crate::policies::BackoffPolicy;

/// Fallback task retry budget when `MAX_TASK_RETRIES` is unset.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Fallback task timeout when `TASK_TIMEOUT_MS` is unset.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Fallback per-worker in-flight cap when `MAX_CONCURRENT_TASKS` is unset.
pub const DEFAULT_MAX_CONCURRENT_TASKS: u32 = 5;

static ENV_MAX_RETRIES: OnceLock<u32> = OnceLock::new();
static ENV_TASK_TIMEOUT: OnceLock<Duration> = OnceLock::new();
static ENV_MAX_CONCURRENT: OnceLock<u32> = OnceLock::new();

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Default task retry budget (`MAX_TASK_RETRIES`, read once).
pub fn default_max_retries() -> u32 {
    *ENV_MAX_RETRIES.get_or_init(|| env_parse("MAX_TASK_RETRIES").unwrap_or(DEFAULT_MAX_RETRIES))
}

/// Default task timeout (`TASK_TIMEOUT_MS`, read once).
pub fn default_task_timeout() -> Duration {
    *ENV_TASK_TIMEOUT.get_or_init(|| {
        env_parse("TASK_TIMEOUT_MS")
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_TASK_TIMEOUT)
    })
}

/// Default per-worker in-flight cap (`MAX_CONCURRENT_TASKS`, read once).
pub fn default_max_concurrent_tasks() -> u32 {
    *ENV_MAX_CONCURRENT.get_or_init(|| {
        env_parse("MAX_CONCURRENT_TASKS").unwrap_or(DEFAULT_MAX_CONCURRENT_TASKS)
    })
}

/// Global configuration for the controller and its worker pool.
#[derive(Clone, Debug)]
pub struct QueueConfig {
    /// Queue identity; prefixes worker ids and log lines.
    pub id: String,
    /// Directory scanned for executor manifests.
    pub task_dir: PathBuf,
    /// Prefix for generated worker ids (`{id}-worker-` by default).
    pub worker_prefix: String,
    /// Upper bound on the worker set.
    pub max_workers: usize,
    /// Per-worker in-flight task cap (`MAX_CONCURRENT_TASKS`).
    pub max_concurrent_tasks: u32,
    /// Default retry budget for new tasks (`MAX_TASK_RETRIES`).
    pub max_task_retries: u32,
    /// Default timeout for new tasks (`TASK_TIMEOUT_MS`).
    pub task_timeout: Duration,
    /// Interval of the per-worker info cache refresher.
    pub cache_interval: Duration,
    /// Deadline for a single worker info request.
    pub info_timeout: Duration,
    /// Backoff applied between worker restart attempts.
    pub restart_backoff: BackoffPolicy,
    /// Restart attempts before a crashed worker is force-closed.
    pub max_restart_attempts: u32,
    /// Whether the type-generation hash glue runs at init
    /// (`ANQUEUE_GENERATE_TYPES`).
    pub generate_types: bool,
}

impl QueueConfig {
    /// Builds a configuration for the given task directory, consulting the
    /// environment once for the overridable defaults.
    pub fn from_env(task_dir: impl AsRef<Path>) -> Self {
        let id = "Anqueue".to_string();
        Self {
            worker_prefix: format!("{id}-worker-"),
            id,
            task_dir: task_dir.as_ref().to_path_buf(),
            max_workers: 3,
            max_concurrent_tasks: default_max_concurrent_tasks(),
            max_task_retries: default_max_retries(),
            task_timeout: default_task_timeout(),
            cache_interval: Duration::from_millis(200),
            info_timeout: Duration::from_secs(5),
            restart_backoff: BackoffPolicy::worker_restart(),
            max_restart_attempts: 5,
            generate_types: std::env::var("ANQUEUE_GENERATE_TYPES")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        }
    }

    /// Overrides the queue id and keeps the worker prefix in sync, unless the
    /// prefix was customized already.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        let default_prefix = format!("{}-worker-", self.id);
        let id = id.into();
        if self.worker_prefix == default_prefix {
            self.worker_prefix = format!("{id}-worker-");
        }
        self.id = id;
        self
    }
}
