use std::{fmt, time::Duration};

use thiserror::Error;

use super::job::JobError;

/// Why a worker stopped holding its job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LossReason {
    Panicked(String),
    TimedOut(Duration),
    Terminated,
}

impl fmt::Display for LossReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Panicked(message) => write!(f, "panicked: {message}"),
            Self::TimedOut(after) => write!(f, "timed out after {}ms", after.as_millis()),
            Self::Terminated => f.write_str("terminated"),
        }
    }
}

impl LossReason {
    pub(crate) fn as_label(&self) -> &'static str {
        match self {
            Self::Panicked(_) => "panicked",
            Self::TimedOut(_) => "timed_out",
            Self::Terminated => "terminated",
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum PoolError {
    #[error("no handler registered for job `{0}`")]
    UnknownJob(String),
    #[error("handlers can only be registered while the pool is stopped")]
    AlreadyStarted,
    #[error("worker pool is not running")]
    NotRunning,
    #[error("worker startup failed: {0}")]
    Startup(String),
    #[error("worker {worker_id} lost its job: {reason}")]
    WorkerLost { worker_id: usize, reason: LossReason },
    #[error(transparent)]
    Job(#[from] JobError),
    #[error("worker pool is fatal: {0}")]
    Fatal(String),
    #[error("worker pool stopped before the job completed")]
    Stopped,
}

impl PoolError {
    /// True when the failure says nothing about the job itself, only about
    /// the pool's ability to run it.
    pub fn is_backend_down(&self) -> bool {
        matches!(
            self,
            Self::NotRunning | Self::Startup(_) | Self::Fatal(_) | Self::Stopped
        )
    }
}
