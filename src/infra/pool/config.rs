//! Worker pool tuning.

use std::{num::NonZeroUsize, thread, time::Duration};

const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_MAX_RESTARTS: u32 = 5;
const DEFAULT_RESTART_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Workers spawned by `start` and `reinitialize`.
    pub workers: usize,
    /// Upper bound on one job; a worker exceeding it is treated as lost.
    pub job_timeout: Duration,
    /// Budget for every worker's readiness probe.
    pub startup_timeout: Duration,
    /// Consecutive failed replacements tolerated before the pool turns fatal.
    pub max_restarts: u32,
    /// Base delay between replacement attempts, multiplied by the attempt number.
    pub restart_backoff: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1),
            job_timeout: DEFAULT_JOB_TIMEOUT,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            max_restarts: DEFAULT_MAX_RESTARTS,
            restart_backoff: DEFAULT_RESTART_BACKOFF,
        }
    }
}

impl From<&crate::config::PoolSettings> for PoolConfig {
    fn from(settings: &crate::config::PoolSettings) -> Self {
        Self {
            workers: settings.workers.get(),
            job_timeout: settings.job_timeout,
            startup_timeout: settings.startup_timeout,
            max_restarts: settings.max_restarts,
            restart_backoff: settings.restart_backoff,
        }
    }
}
