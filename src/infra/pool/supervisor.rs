//! Replaces dead workers and escalates to fatal when replacements keep failing.

use std::sync::Arc;

use metrics::counter;
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::{
    METRIC_POOL_WORKER_RESTART, PoolInner, PoolPhase, SOURCE,
    worker::{Handlers, WorkerStatus, probe, spawn_worker},
};
use crate::util::lock::mutex_lock;

pub(super) async fn supervise(
    inner: Arc<PoolInner>,
    epoch: u64,
    handlers: Handlers,
    mut dead: mpsc::UnboundedReceiver<usize>,
) {
    while let Some(worker_id) = dead.recv().await {
        if !replace_worker(&inner, epoch, &handlers, worker_id).await {
            break;
        }
    }
}

/// Probe a replacement until one passes or the restart budget is spent.
/// Returns false once supervision should end.
async fn replace_worker(
    inner: &Arc<PoolInner>,
    epoch: u64,
    handlers: &Handlers,
    worker_id: usize,
) -> bool {
    let mut attempt: u32 = 0;
    loop {
        {
            let mut state = mutex_lock(&inner.state, SOURCE, "replace_worker");
            if state.epoch != epoch || state.phase != PoolPhase::Running {
                return false;
            }
            let Some(slot) = state.workers.get_mut(worker_id) else {
                return true;
            };
            slot.status = WorkerStatus::Starting;
        }

        if attempt > 0 {
            tokio::time::sleep(inner.config.restart_backoff.saturating_mul(attempt)).await;
        }
        attempt += 1;

        let outcome =
            match tokio::time::timeout(inner.config.startup_timeout, probe(Arc::clone(handlers)))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(format!(
                    "replacement not ready within {}ms",
                    inner.config.startup_timeout.as_millis()
                )),
            };

        let mut state = mutex_lock(&inner.state, SOURCE, "replace_worker");
        if state.epoch != epoch || state.phase != PoolPhase::Running {
            return false;
        }

        match outcome {
            Ok(()) => {
                state.restart_failures = 0;
                if let Some(slot) = state.workers.get_mut(worker_id) {
                    spawn_worker(Arc::clone(inner), slot, epoch, Arc::clone(handlers));
                }
                inner.drain_backlog_into(&mut state, worker_id);
                inner.publish_health(&state);
                counter!(METRIC_POOL_WORKER_RESTART, "result" => "ok").increment(1);
                info!(
                    target = SOURCE,
                    op = "replace_worker",
                    result = "ok",
                    worker_id,
                    attempt,
                    "Worker replaced"
                );
                return true;
            }
            Err(reason) => {
                state.restart_failures += 1;
                counter!(METRIC_POOL_WORKER_RESTART, "result" => "error").increment(1);
                warn!(
                    target = SOURCE,
                    op = "replace_worker",
                    result = "error",
                    worker_id,
                    attempt,
                    restart_failures = state.restart_failures,
                    error = %reason,
                    "Worker replacement failed"
                );
                if state.restart_failures > inner.config.max_restarts {
                    let fatal = format!(
                        "{} consecutive worker restarts failed; last error: {reason}",
                        state.restart_failures
                    );
                    inner.enter_fatal(&mut state, fatal);
                    return false;
                }
                if let Some(slot) = state.workers.get_mut(worker_id) {
                    slot.status = WorkerStatus::Dead;
                }
                inner.publish_health(&state);
            }
        }
    }
}
