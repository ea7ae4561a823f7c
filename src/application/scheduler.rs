//! Single-flight render scheduler.
//!
//! Every cache key has at most one active task. Callers that enqueue a key
//! while its task is queued or running attach to the same task and receive
//! the same result, in attachment order. Admission is FIFO across keys and
//! bounded by a concurrency limit.
//!
//! Backend outages are handled in two steps. A task whose executor reports
//! [`TaskError::BackendUnavailable`] is parked with its waiters instead of
//! failing them; the owner then pauses admission, collects parked and running
//! tasks with [`RenderScheduler::take_in_flight`], and either re-admits them
//! with [`RenderScheduler::recover_in_flight`] once the backend is back or
//! opens the circuit, which fails them and rejects new work immediately.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use metrics::{counter, gauge};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::{
    domain::{CacheEntry, RenderArgs},
    util::lock::mutex_lock,
};

const SOURCE: &str = "application::scheduler";

pub(crate) const METRIC_SCHEDULER_COLLAPSED: &str = "crawlsnap_scheduler_collapsed_total";
pub(crate) const METRIC_SCHEDULER_ACTIVE: &str = "crawlsnap_scheduler_active_tasks";
pub(crate) const METRIC_SCHEDULER_REJECTED: &str = "crawlsnap_scheduler_rejected_total";

/// Task failure delivered to every waiter of the task.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("render failed: {0}")]
    Render(String),
    #[error("render worker lost: {0}")]
    WorkerLost(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("render backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("scheduler error: {0}")]
    Internal(String),
}

pub type TaskResult = Result<CacheEntry, TaskError>;

/// Performs the render for one admitted task and persists its outcome.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, key: &str, args: &RenderArgs) -> TaskResult;
}

/// Where a key's active task currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPhase {
    Queued,
    InFlight,
    /// Lost to a backend outage; waiting for recovery or the circuit to open.
    Stranded,
}

/// A task lifted out of the scheduler by [`RenderScheduler::take_in_flight`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrandedTask {
    pub key: String,
    pub args: RenderArgs,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerStats {
    pub active: usize,
    pub queued: usize,
    pub running: usize,
    pub concurrency: usize,
    pub paused: bool,
    pub fatal: bool,
}

/// Handle on a pending task result. Dropping it detaches without cancelling.
#[derive(Debug)]
pub struct RenderTicket {
    receiver: oneshot::Receiver<TaskResult>,
}

impl RenderTicket {
    pub async fn outcome(self) -> TaskResult {
        self.receiver.await.unwrap_or_else(|_| {
            Err(TaskError::Internal(
                "task dropped without a result".to_string(),
            ))
        })
    }

    /// Wait at most `deadline`; `None` when it elapses first.
    pub async fn outcome_within(self, deadline: Duration) -> Option<TaskResult> {
        tokio::time::timeout(deadline, self.outcome()).await.ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Queued,
    InFlight { generation: u64 },
    Stranded { generation: u64 },
    /// Handed out by `take_in_flight`; results of its old run are ignored.
    Detached { generation: u64 },
}

struct ActiveTask {
    args: RenderArgs,
    waiters: Vec<oneshot::Sender<TaskResult>>,
    slot: Slot,
}

struct SchedulerState {
    active: HashMap<String, ActiveTask>,
    queue: VecDeque<String>,
    running: usize,
    paused: bool,
    circuit: Option<String>,
    next_generation: u64,
}

#[derive(Clone)]
pub struct RenderScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    executor: Arc<dyn TaskExecutor>,
    concurrency: usize,
    state: Mutex<SchedulerState>,
}

impl std::fmt::Debug for RenderScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderScheduler")
            .field("stats", &self.stats())
            .finish()
    }
}

impl RenderScheduler {
    pub fn new(executor: Arc<dyn TaskExecutor>, concurrency: usize) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                executor,
                concurrency: concurrency.max(1),
                state: Mutex::new(SchedulerState {
                    active: HashMap::new(),
                    queue: VecDeque::new(),
                    running: 0,
                    paused: false,
                    circuit: None,
                    next_generation: 0,
                }),
            }),
        }
    }

    /// Request a render of `key`. Attaches to the active task when there is
    /// one; otherwise queues a new task. Never blocks.
    pub fn enqueue(&self, key: &str, args: RenderArgs) -> RenderTicket {
        let (waiter, receiver) = oneshot::channel();
        let ticket = RenderTicket { receiver };
        {
            let mut state = mutex_lock(&self.inner.state, SOURCE, "enqueue");
            if let Some(reason) = state.circuit.clone() {
                counter!(METRIC_SCHEDULER_REJECTED).increment(1);
                let _ = waiter.send(Err(TaskError::BackendUnavailable(reason)));
                return ticket;
            }

            if let Some(task) = state.active.get_mut(key) {
                task.waiters.push(waiter);
                counter!(METRIC_SCHEDULER_COLLAPSED).increment(1);
                debug!(
                    target = SOURCE,
                    op = "enqueue",
                    key,
                    waiters = task.waiters.len(),
                    "Attached to active task"
                );
                return ticket;
            }

            state.active.insert(
                key.to_string(),
                ActiveTask {
                    args,
                    waiters: vec![waiter],
                    slot: Slot::Queued,
                },
            );
            state.queue.push_back(key.to_string());
            gauge!(METRIC_SCHEDULER_ACTIVE).set(state.active.len() as f64);
            debug!(target = SOURCE, op = "enqueue", key, "Queued new task");
        }
        self.pump();
        ticket
    }

    /// Stop admitting queued tasks. Running tasks finish normally.
    pub fn pause(&self) {
        let mut state = mutex_lock(&self.inner.state, SOURCE, "pause");
        if !state.paused {
            state.paused = true;
            info!(target = SOURCE, op = "pause", queued = state.queue.len(), "Scheduler paused");
        }
    }

    /// Restore admission and flush whatever queued up meanwhile.
    pub fn resume(&self) {
        {
            let mut state = mutex_lock(&self.inner.state, SOURCE, "resume");
            if !state.paused {
                return;
            }
            state.paused = false;
            info!(target = SOURCE, op = "resume", queued = state.queue.len(), "Scheduler resumed");
        }
        self.pump();
    }

    /// Detach every running or parked task, keeping its waiters attached to the
    /// key. Results still arriving from the detached runs are discarded.
    pub fn take_in_flight(&self) -> Vec<StrandedTask> {
        let mut state = mutex_lock(&self.inner.state, SOURCE, "take_in_flight");
        let mut taken: Vec<(u64, StrandedTask)> = state
            .active
            .iter_mut()
            .filter_map(|(key, task)| {
                let generation = match task.slot {
                    Slot::InFlight { generation } | Slot::Stranded { generation } => generation,
                    Slot::Queued | Slot::Detached { .. } => return None,
                };
                task.slot = Slot::Detached { generation };
                Some((
                    generation,
                    StrandedTask {
                        key: key.clone(),
                        args: task.args.clone(),
                    },
                ))
            })
            .collect();
        taken.sort_by_key(|(generation, _)| *generation);
        warn!(
            target = SOURCE,
            op = "take_in_flight",
            tasks = taken.len(),
            "Detached in-flight tasks"
        );
        taken.into_iter().map(|(_, task)| task).collect()
    }

    /// Put detached tasks back at the head of the queue, in their original
    /// order, with their waiter lists intact.
    pub fn recover_in_flight(&self, tasks: Vec<StrandedTask>) {
        {
            let mut state = mutex_lock(&self.inner.state, SOURCE, "recover_in_flight");
            if let Some(reason) = state.circuit.clone() {
                for task in tasks {
                    if let Some(active) = state.active.remove(&task.key) {
                        notify(active.waiters, &Err(TaskError::BackendUnavailable(reason.clone())));
                    }
                }
                return;
            }

            let count = tasks.len();
            for task in tasks.into_iter().rev() {
                match state.active.get_mut(&task.key) {
                    Some(active) if matches!(active.slot, Slot::Detached { .. }) => {
                        active.slot = Slot::Queued;
                    }
                    Some(_) => continue,
                    None => {
                        state.active.insert(
                            task.key.clone(),
                            ActiveTask {
                                args: task.args,
                                waiters: Vec::new(),
                                slot: Slot::Queued,
                            },
                        );
                    }
                }
                state.queue.push_front(task.key);
            }
            info!(
                target = SOURCE,
                op = "recover_in_flight",
                tasks = count,
                "Re-admitted in-flight tasks"
            );
        }
        self.pump();
    }

    /// Fail everything not currently running and reject new work until
    /// [`close_circuit`](Self::close_circuit).
    pub fn open_circuit(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let mut state = mutex_lock(&self.inner.state, SOURCE, "open_circuit");
        error!(
            target = SOURCE,
            op = "open_circuit",
            reason = %reason,
            queued = state.queue.len(),
            "Render circuit opened"
        );
        state.queue.clear();
        let failed: Vec<String> = state
            .active
            .iter()
            .filter(|(_, task)| !matches!(task.slot, Slot::InFlight { .. }))
            .map(|(key, _)| key.clone())
            .collect();
        let error = Err(TaskError::BackendUnavailable(reason.clone()));
        for key in failed {
            if let Some(task) = state.active.remove(&key) {
                notify(task.waiters, &error);
            }
        }
        gauge!(METRIC_SCHEDULER_ACTIVE).set(state.active.len() as f64);
        state.circuit = Some(reason);
    }

    pub fn close_circuit(&self) {
        {
            let mut state = mutex_lock(&self.inner.state, SOURCE, "close_circuit");
            if state.circuit.take().is_none() {
                return;
            }
            info!(target = SOURCE, op = "close_circuit", "Render circuit closed");
        }
        self.pump();
    }

    pub fn is_fatal(&self) -> bool {
        mutex_lock(&self.inner.state, SOURCE, "is_fatal")
            .circuit
            .is_some()
    }

    pub fn phase(&self, key: &str) -> Option<TaskPhase> {
        let state = mutex_lock(&self.inner.state, SOURCE, "phase");
        state.active.get(key).map(|task| match task.slot {
            Slot::Queued => TaskPhase::Queued,
            Slot::InFlight { .. } => TaskPhase::InFlight,
            Slot::Stranded { .. } | Slot::Detached { .. } => TaskPhase::Stranded,
        })
    }

    pub fn stats(&self) -> SchedulerStats {
        let state = mutex_lock(&self.inner.state, SOURCE, "stats");
        SchedulerStats {
            active: state.active.len(),
            queued: state.queue.len(),
            running: state.running,
            concurrency: self.inner.concurrency,
            paused: state.paused,
            fatal: state.circuit.is_some(),
        }
    }

    /// Admit queued tasks while capacity allows.
    fn pump(&self) {
        loop {
            let (key, args, generation) = {
                let mut state = mutex_lock(&self.inner.state, SOURCE, "pump");
                if state.paused
                    || state.circuit.is_some()
                    || state.running >= self.inner.concurrency
                {
                    return;
                }
                let Some(key) = state.queue.pop_front() else {
                    return;
                };
                state.next_generation += 1;
                let generation = state.next_generation;
                let Some(task) = state.active.get_mut(&key) else {
                    continue;
                };
                task.slot = Slot::InFlight { generation };
                let args = task.args.clone();
                state.running += 1;
                (key, args, generation)
            };
            self.spawn_task(key, args, generation);
        }
    }

    fn spawn_task(&self, key: String, args: RenderArgs, generation: u64) {
        let scheduler = self.clone();
        let executor = Arc::clone(&self.inner.executor);
        tokio::spawn(async move {
            let run_key = key.clone();
            let result = tokio::spawn(async move { executor.execute(&run_key, &args).await })
                .await
                .unwrap_or_else(|err| {
                    Err(TaskError::Internal(format!("render task aborted: {err}")))
                });
            scheduler.complete(&key, generation, result);
        });
    }

    fn complete(&self, key: &str, generation: u64, result: TaskResult) {
        {
            let mut state = mutex_lock(&self.inner.state, SOURCE, "complete");
            state.running = state.running.saturating_sub(1);

            let current = state.active.get(key).map(|task| task.slot);
            if current != Some(Slot::InFlight { generation }) {
                debug!(
                    target = SOURCE,
                    op = "complete",
                    key,
                    generation,
                    "Discarding result of detached run"
                );
            } else if matches!(result, Err(TaskError::BackendUnavailable(_)))
                && state.circuit.is_none()
            {
                if let Some(task) = state.active.get_mut(key) {
                    task.slot = Slot::Stranded { generation };
                }
                warn!(
                    target = SOURCE,
                    op = "complete",
                    key,
                    "Backend unavailable; task parked until recovery"
                );
            } else if let Some(task) = state.active.remove(key) {
                debug!(
                    target = SOURCE,
                    op = "complete",
                    key,
                    ok = result.is_ok(),
                    waiters = task.waiters.len(),
                    "Task completed"
                );
                notify(task.waiters, &result);
            }
            gauge!(METRIC_SCHEDULER_ACTIVE).set(state.active.len() as f64);
        }
        self.pump();
    }
}

fn notify(waiters: Vec<oneshot::Sender<TaskResult>>, result: &TaskResult) {
    for waiter in waiters {
        // A dropped ticket just means nobody is listening.
        let _ = waiter.send(result.clone());
    }
}
