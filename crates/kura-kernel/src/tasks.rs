//! Bounded-concurrency task engine.
//!
//! Tasks are submitted with a description and a work function. At most
//! `max_concurrency` run at once; the rest wait in FIFO order. Every task is
//! tracked from submission until it is purged, and moves through
//!
//! ```text
//! pending ─► running ─► succeeded | failed | canceled
//!    └──────────────────────────────────────► canceled
//! ```
//!
//! Cancellation is cooperative. A running task's work function sees its
//! token fire and is expected to return promptly; a pending task is dropped
//! from the queue and never runs.

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::SystemTime;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::context::OpContext;
use crate::error::{StorageError, StorageResult};
use crate::ids::TaskId;

/// Default number of concurrently running tasks.
pub const DEFAULT_MAX_CONCURRENCY: usize = 4;

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

/// Snapshot of one task.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub description: String,
    pub state: TaskState,
    /// Latest message from the work function.
    pub status: String,
    pub error: Option<StorageError>,
    pub created: SystemTime,
    pub started: Option<SystemTime>,
    pub ended: Option<SystemTime>,
}

/// Task registry lookups that can fail.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("task not found: {0}")]
    NotFound(TaskId),
    #[error("task {0} is still {1}")]
    NotTerminal(TaskId, TaskState),
}

type Work = Box<dyn FnOnce(TaskContext) -> BoxFuture<'static, StorageResult<()>> + Send>;

struct TaskCell {
    task: Mutex<Task>,
    token: CancellationToken,
    /// Fires once the task is terminal.
    done: CancellationToken,
}

impl TaskCell {
    fn snapshot(&self) -> Task {
        self.task.lock().clone()
    }

    fn id(&self) -> TaskId {
        self.task.lock().id
    }

    /// Move to `running`. Returns false if the task is no longer pending.
    fn start(&self) -> bool {
        let mut task = self.task.lock();
        if task.state != TaskState::Pending {
            return false;
        }
        task.state = TaskState::Running;
        task.started = Some(SystemTime::now());
        true
    }

    /// Enter a terminal state. Terminal tasks are never changed again.
    fn finish(&self, state: TaskState, error: Option<StorageError>) {
        {
            let mut task = self.task.lock();
            if task.state.is_terminal() {
                return;
            }
            task.state = state;
            task.error = error;
            task.ended = Some(SystemTime::now());
        }
        self.done.cancel();
    }
}

struct Queued {
    cell: Arc<TaskCell>,
    work: Work,
}

#[derive(Default)]
struct Scheduler {
    queue: VecDeque<Queued>,
    running: usize,
}

struct Inner {
    tasks: Mutex<HashMap<TaskId, Arc<TaskCell>>>,
    sched: Mutex<Scheduler>,
    max_concurrency: usize,
}

/// Handle passed to a running work function.
#[derive(Clone)]
pub struct TaskContext {
    cell: Arc<TaskCell>,
    manager: TaskManager,
}

impl TaskContext {
    pub fn id(&self) -> TaskId {
        self.cell.id()
    }

    /// Publish a progress or status message.
    pub fn set_status(&self, status: impl Into<String>) {
        let mut task = self.cell.task.lock();
        if !task.state.is_terminal() {
            task.status = status.into();
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.cell.token.is_cancelled()
    }

    /// The task's cancellation token. Children submitted with it as parent
    /// are canceled along with this task.
    pub fn token(&self) -> &CancellationToken {
        &self.cell.token
    }

    /// An operation context bound to this task's cancellation.
    pub fn op_context(&self) -> OpContext {
        OpContext::with_token(self.cell.token.clone())
    }

    /// The engine running this task.
    pub fn manager(&self) -> &TaskManager {
        &self.manager
    }
}

/// A submitted task.
#[derive(Clone)]
pub struct TaskHandle {
    cell: Arc<TaskCell>,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.cell.id()
    }

    pub fn snapshot(&self) -> Task {
        self.cell.snapshot()
    }

    /// Wait until the task is terminal and return its final snapshot.
    pub async fn wait(&self) -> Task {
        self.cell.done.cancelled().await;
        self.cell.snapshot()
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("TaskHandle").field(&self.id()).finish()
    }
}

/// The task engine. Cloning shares the same engine.
#[derive(Clone)]
pub struct TaskManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskManager")
            .field("max_concurrency", &self.inner.max_concurrency)
            .field("tasks", &self.inner.tasks.lock().len())
            .finish()
    }
}

impl TaskManager {
    /// Create an engine running at most `max_concurrency` tasks (minimum 1).
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                tasks: Mutex::new(HashMap::new()),
                sched: Mutex::new(Scheduler::default()),
                max_concurrency: max_concurrency.max(1),
            }),
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.inner.max_concurrency
    }

    /// Submit a task with its own cancellation scope.
    pub fn submit<F, Fut>(&self, description: impl Into<String>, work: F) -> TaskHandle
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = StorageResult<()>> + Send + 'static,
    {
        self.submit_with_token(CancellationToken::new(), description.into(), work)
    }

    /// Submit a task that is canceled whenever `parent` is.
    pub fn submit_child<F, Fut>(
        &self,
        parent: &CancellationToken,
        description: impl Into<String>,
        work: F,
    ) -> TaskHandle
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = StorageResult<()>> + Send + 'static,
    {
        self.submit_with_token(parent.child_token(), description.into(), work)
    }

    fn submit_with_token<F, Fut>(
        &self,
        token: CancellationToken,
        description: String,
        work: F,
    ) -> TaskHandle
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = StorageResult<()>> + Send + 'static,
    {
        let id = TaskId::new();
        let cell = Arc::new(TaskCell {
            task: Mutex::new(Task {
                id,
                description: description.clone(),
                state: TaskState::Pending,
                status: String::new(),
                error: None,
                created: SystemTime::now(),
                started: None,
                ended: None,
            }),
            token,
            done: CancellationToken::new(),
        });
        self.inner.tasks.lock().insert(id, Arc::clone(&cell));
        debug!(task = %id, %description, "task submitted");

        // Cancellation of the scope from outside (a parent, or the token
        // handed to the work itself) must reach a task still in the queue.
        let watcher = self.clone();
        let (token, done) = (cell.token.clone(), cell.done.clone());
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => { let _ = watcher.cancel(id); }
                _ = done.cancelled() => {}
            }
        });

        let work: Work = Box::new(move |cx| work(cx).boxed());
        self.inner.sched.lock().queue.push_back(Queued {
            cell: Arc::clone(&cell),
            work,
        });
        self.pump();

        TaskHandle { cell }
    }

    /// Dispatch queued tasks into free slots.
    fn pump(&self) {
        loop {
            let (next, claimed) = {
                let mut sched = self.inner.sched.lock();
                if sched.running >= self.inner.max_concurrency {
                    return;
                }
                let Some(queued) = sched.queue.pop_front() else {
                    return;
                };
                let claimed = !queued.cell.token.is_cancelled();
                if claimed {
                    sched.running += 1;
                }
                (queued, claimed)
            };

            if !claimed {
                next.cell.finish(TaskState::Canceled, None);
                continue;
            }
            if !next.cell.start() {
                self.inner.sched.lock().running -= 1;
                continue;
            }
            self.spawn(next);
        }
    }

    fn spawn(&self, queued: Queued) {
        let Queued { cell, work } = queued;
        let id = cell.id();
        let cx = TaskContext {
            cell: Arc::clone(&cell),
            manager: self.clone(),
        };
        let manager = self.clone();

        let span = info_span!("task", id = %id);
        tokio::spawn(
            async move {
                debug!("task running");
                let outcome = AssertUnwindSafe(work(cx)).catch_unwind().await;
                let result = outcome.unwrap_or_else(|_| Err(StorageError::other("task panicked")));

                match result {
                    Ok(()) if cell.token.is_cancelled() => {
                        cell.finish(TaskState::Canceled, None)
                    }
                    Ok(()) => cell.finish(TaskState::Succeeded, None),
                    Err(StorageError::Canceled) => cell.finish(TaskState::Canceled, None),
                    Err(e) => {
                        warn!(error = %e, "task failed");
                        cell.finish(TaskState::Failed, Some(e))
                    }
                }
                info!(state = %cell.snapshot().state, "task finished");

                manager.inner.sched.lock().running -= 1;
                manager.pump();
            }
            .instrument(span),
        );
    }

    /// Cancel a task.
    ///
    /// Pending tasks leave the queue and become `canceled` at once; running
    /// tasks are signaled and become `canceled` when their work returns;
    /// terminal tasks are left alone.
    pub fn cancel(&self, id: TaskId) -> Result<(), TaskError> {
        let cell = self
            .inner
            .tasks
            .lock()
            .get(&id)
            .cloned()
            .ok_or(TaskError::NotFound(id))?;
        cell.token.cancel();

        let dequeued = {
            let mut sched = self.inner.sched.lock();
            sched
                .queue
                .iter()
                .position(|q| Arc::ptr_eq(&q.cell, &cell))
                .and_then(|pos| sched.queue.remove(pos))
        };
        if dequeued.is_some() {
            debug!(task = %id, "pending task canceled");
            cell.finish(TaskState::Canceled, None);
        }
        Ok(())
    }

    /// Snapshot of one task.
    pub fn get(&self, id: TaskId) -> Option<Task> {
        self.inner.tasks.lock().get(&id).map(|c| c.snapshot())
    }

    /// Snapshots of every retained task, oldest first.
    pub fn list(&self) -> Vec<Task> {
        let cells: Vec<Arc<TaskCell>> = self.inner.tasks.lock().values().cloned().collect();
        let mut tasks: Vec<Task> = cells.iter().map(|c| c.snapshot()).collect();
        tasks.sort_by_key(|t| t.id);
        tasks
    }

    /// Purge one terminal task.
    pub fn remove(&self, id: TaskId) -> Result<Task, TaskError> {
        let mut tasks = self.inner.tasks.lock();
        let cell = tasks.get(&id).ok_or(TaskError::NotFound(id))?;
        let snapshot = cell.snapshot();
        if !snapshot.state.is_terminal() {
            return Err(TaskError::NotTerminal(id, snapshot.state));
        }
        tasks.remove(&id);
        Ok(snapshot)
    }

    /// Purge every terminal task. Returns how many were removed.
    pub fn clear_done(&self) -> usize {
        self.purge(|state| state.is_terminal())
    }

    /// Purge succeeded tasks only.
    pub fn clear_succeeded(&self) -> usize {
        self.purge(|state| state == TaskState::Succeeded)
    }

    fn purge(&self, pred: impl Fn(TaskState) -> bool) -> usize {
        let mut tasks = self.inner.tasks.lock();
        let before = tasks.len();
        tasks.retain(|_, cell| !pred(cell.task.lock().state));
        before - tasks.len()
    }

    /// Number of tasks currently running.
    pub fn running(&self) -> usize {
        self.inner.sched.lock().running
    }

    /// Number of tasks waiting for a slot.
    pub fn pending(&self) -> usize {
        self.inner.sched.lock().queue.len()
    }
}
