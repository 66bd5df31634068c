//! Task runner
//!
//! Executes an ordered list of tasks strictly sequentially under a failure
//! policy, tracking per-task results and aggregate progress.
//!
//! Execution loop, per task:
//! 1. Check the cancel flag; if set, mark the rest `Cancelled` and stop.
//! 2. Publish task-start, then `validate()`. A validation failure is
//!    handled like an execution failure but is never retried.
//! 3. `execute()`, retried up to `max_retries` extra times. A retry that is
//!    abandoned because of cancellation marks the task `Cancelled` and ends
//!    the run without applying the policy.
//! 4. On success: `Completed`, task-complete and progress events.
//! 5. On final failure: `Failed`, task-error event, then the policy:
//!    - **Abort**: return the error
//!    - **Skip**: continue; the run still succeeds
//!    - **Rollback**: roll back completed, rollback-capable tasks in reverse
//!      order, then return the error
//!
//! All methods take `&self`, so a runner can be shared behind an `Arc` and
//! cancelled from another thread while `run` blocks. The queue is taken out
//! of its mutex for the duration of a run, so tasks and event handlers may
//! queue more work without deadlocking.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use crate::config::{OnFailure, TaskConfig};
use crate::context::{InstallContext, LogLevel};
use crate::error::Result;
use crate::events::EventBus;
use crate::registry::Registries;
use crate::sync::lock;
use crate::task::{FailureHandling, FailurePolicy, Task, TaskError, TaskResult, TaskState, describe};

/// Shareable cooperative cancellation flag
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Takes effect at the next task boundary.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

struct QueuedTask {
    task: Box<dyn Task>,
    on_failure: Option<OnFailure>,
    retries: Option<u32>,
}

/// Clears the running flag when a run or rollback ends, however it ends
struct RunningFlag<'a>(&'a AtomicBool);

impl<'a> RunningFlag<'a> {
    fn acquire(flag: &'a AtomicBool) -> std::result::Result<Self, TaskError> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| Self(flag))
            .map_err(|_| TaskError::AlreadyRunning)
    }
}

impl Drop for RunningFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct TaskRunner {
    ctx: Arc<InstallContext>,
    bus: Arc<EventBus>,
    registries: Arc<Registries>,
    tasks: Mutex<Vec<QueuedTask>>,
    results: Mutex<Vec<TaskResult>>,
    handling: Mutex<FailureHandling>,
    total: AtomicUsize,
    completed: AtomicUsize,
    running: AtomicBool,
    cancel: CancelHandle,
}

impl std::fmt::Debug for TaskRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRunner")
            .field("total", &self.len())
            .field("completed", &self.completed.load(Ordering::SeqCst))
            .field("running", &self.is_running())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl TaskRunner {
    pub fn new(ctx: Arc<InstallContext>, bus: Arc<EventBus>, registries: Arc<Registries>) -> Self {
        Self {
            ctx,
            bus,
            registries,
            tasks: Mutex::new(Vec::new()),
            results: Mutex::new(Vec::new()),
            handling: Mutex::new(FailureHandling::default()),
            total: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            running: AtomicBool::new(false),
            cancel: CancelHandle::new(),
        }
    }

    /// Share an existing cancel flag (e.g. one wired to Ctrl-C)
    pub fn with_cancel_handle(mut self, handle: CancelHandle) -> Self {
        self.cancel = handle;
        self
    }

    // ------------------------------------------------------------------
    // Queueing
    // ------------------------------------------------------------------

    /// Append a task. Tasks added while a run is in progress are queued
    /// behind the current run and execute on the next `run`.
    pub fn add_task(&self, task: Box<dyn Task>) {
        self.push(QueuedTask {
            task,
            on_failure: None,
            retries: None,
        });
    }

    pub fn add_tasks(&self, tasks: impl IntoIterator<Item = Box<dyn Task>>) {
        for task in tasks {
            self.add_task(task);
        }
    }

    /// Build a task from configuration and append it. The task's own
    /// `on_failure`/`retries` override the runner-wide handling.
    ///
    /// Unknown task types and bad parameters fail here, not in `run`.
    pub fn queue_config(&self, config: &TaskConfig) -> Result<()> {
        let task = self.registries.build_task(config, &self.ctx)?;
        tracing::debug!("Queued task '{}' ({})", task.id(), config.kind);
        self.push(QueuedTask {
            task,
            on_failure: config.on_failure,
            retries: config.retries,
        });
        Ok(())
    }

    fn push(&self, queued: QueuedTask) {
        let mut tasks = lock(&self.tasks);
        lock(&self.results).push(TaskResult::pending(queued.task.id(), queued.task.kind()));
        tasks.push(queued);
        self.total.fetch_add(1, Ordering::SeqCst);
    }

    /// Move the queue out of its mutex for a run or rollback
    fn take_queue(&self) -> Vec<QueuedTask> {
        std::mem::take(&mut *lock(&self.tasks))
    }

    /// Put the queue back, keeping anything added in the meantime behind it
    fn restore_queue(&self, mut tasks: Vec<QueuedTask>) {
        let mut slot = lock(&self.tasks);
        tasks.append(&mut slot);
        *slot = tasks;
    }

    // ------------------------------------------------------------------
    // Configuration and state
    // ------------------------------------------------------------------

    pub fn set_failure_policy(&self, policy: FailurePolicy) {
        lock(&self.handling).policy = policy;
    }

    pub fn set_max_retries(&self, max_retries: u32) {
        lock(&self.handling).max_retries = max_retries;
    }

    pub fn failure_handling(&self) -> FailureHandling {
        *lock(&self.handling)
    }

    pub fn len(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        tracing::info!("Cancellation requested");
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Snapshot of per-task results in queue order
    pub fn results(&self) -> Vec<TaskResult> {
        lock(&self.results).clone()
    }

    /// Completed fraction of queued tasks; `1.0` when nothing is queued
    pub fn progress(&self) -> f64 {
        let total = self.total.load(Ordering::SeqCst);
        if total == 0 {
            return 1.0;
        }
        let completed = self.completed.load(Ordering::SeqCst).min(total);
        completed as f64 / total as f64
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    /// Run every queued task in order. Not reentrant.
    pub fn run(&self) -> Result<()> {
        let _running = RunningFlag::acquire(&self.running)?;
        let mut tasks = self.take_queue();
        let outcome = self.run_queue(&mut tasks);
        self.restore_queue(tasks);
        outcome
    }

    fn run_queue(&self, tasks: &mut [QueuedTask]) -> Result<()> {
        self.completed.store(0, Ordering::SeqCst);
        *lock(&self.results) = tasks
            .iter()
            .map(|q| TaskResult::pending(q.task.id(), q.task.kind()))
            .collect();

        if tasks.is_empty() {
            self.ctx.set_progress(1.0);
            return Ok(());
        }

        let defaults = self.failure_handling();
        tracing::info!("Running {} task(s)", tasks.len());

        for index in 0..tasks.len() {
            if self.cancel.is_cancelled() {
                self.mark_cancelled_from(index);
                self.ctx.add_log(LogLevel::Warn, "Installation cancelled");
                return Err(TaskError::Cancelled.into());
            }

            let queued = &mut tasks[index];
            let handling = defaults.with_override(queued.on_failure, queued.retries);

            let err = match self.run_one(index, queued.task.as_mut(), handling) {
                Ok(()) => {
                    self.report_progress(queued.task.id());
                    continue;
                }
                Err(TaskError::Cancelled) => {
                    self.mark_cancelled_from(index + 1);
                    self.ctx.add_log(LogLevel::Warn, "Installation cancelled");
                    return Err(TaskError::Cancelled.into());
                }
                Err(err) => err,
            };

            match handling.policy {
                FailurePolicy::Abort => return Err(err.into()),
                FailurePolicy::Skip => {
                    tracing::warn!("Skipping failed task: {}", err);
                }
                FailurePolicy::Rollback => {
                    self.ctx
                        .add_log(LogLevel::Warn, format!("Rolling back after failure: {err}"));
                    let _ = self.rollback_completed(&mut tasks[..index]);
                    self.ctx.set_progress(self.progress());
                    return Err(err.into());
                }
            }
        }

        self.ctx.set_progress(self.progress());
        Ok(())
    }

    fn run_one(
        &self,
        index: usize,
        task: &mut dyn Task,
        handling: FailureHandling,
    ) -> std::result::Result<(), TaskError> {
        let task_id = task.id().to_string();
        let task_type = task.kind().to_string();

        self.update_result(index, |r| {
            r.state = TaskState::Running;
            r.started_at = Some(SystemTime::now());
        });
        self.bus.publish_task_start(&task_id, &task_type);
        self.ctx
            .add_log(LogLevel::Info, format!("Starting task: {task_id}"));

        if let Err(e) = task.validate() {
            let err = TaskError::Validation {
                task_id,
                message: describe(&e),
            };
            self.record_failure(index, &task_type, &err);
            return Err(err);
        }

        let mut attempts = 0;
        loop {
            attempts += 1;
            self.update_result(index, |r| r.attempts = attempts);

            match task.execute(&self.ctx, &self.bus) {
                Ok(()) => {
                    self.update_result(index, |r| {
                        r.state = TaskState::Completed;
                        r.error = None;
                        r.finished_at = Some(SystemTime::now());
                    });
                    self.completed.fetch_add(1, Ordering::SeqCst);
                    self.bus.publish_task_complete(&task_id, &task_type);
                    self.ctx
                        .add_log(LogLevel::Info, format!("Task completed: {task_id}"));
                    return Ok(());
                }
                Err(e) if attempts <= handling.max_retries && self.cancel.is_cancelled() => {
                    tracing::warn!(
                        "Task '{}' failed and cancellation is pending, not retrying: {:#}",
                        task_id,
                        e
                    );
                    self.update_result(index, |r| {
                        r.state = TaskState::Cancelled;
                        r.error = Some(describe(&e));
                        r.finished_at = Some(SystemTime::now());
                    });
                    return Err(TaskError::Cancelled);
                }
                Err(e) if attempts <= handling.max_retries => {
                    tracing::warn!(
                        "Task '{}' failed (attempt {}/{}), retrying: {:#}",
                        task_id,
                        attempts,
                        handling.max_retries + 1,
                        e
                    );
                }
                Err(e) => {
                    let err = TaskError::Execution {
                        task_id,
                        message: describe(&e),
                    };
                    self.record_failure(index, &task_type, &err);
                    return Err(err);
                }
            }
        }
    }

    fn record_failure(&self, index: usize, task_type: &str, err: &TaskError) {
        let message = err.to_string();
        self.update_result(index, |r| {
            r.state = TaskState::Failed;
            r.error = Some(message.clone());
            r.finished_at = Some(SystemTime::now());
        });
        let task_id = err.task_id().unwrap_or_default();
        self.bus.publish_task_error(task_id, task_type, &message);
        self.ctx.add_error(&message);
        self.ctx.add_log(LogLevel::Error, message);
    }

    fn report_progress(&self, task_id: &str) {
        let progress = self.progress();
        self.ctx.set_progress(progress);
        self.bus
            .publish_progress(task_id, progress, &format!("Completed {task_id}"));
    }

    fn mark_cancelled_from(&self, start: usize) {
        let mut results = lock(&self.results);
        for result in results.iter_mut().skip(start) {
            result.state = TaskState::Cancelled;
        }
    }

    fn update_result(&self, index: usize, f: impl FnOnce(&mut TaskResult)) {
        if let Some(result) = lock(&self.results).get_mut(index) {
            f(result);
        }
    }

    // ------------------------------------------------------------------
    // Rollback
    // ------------------------------------------------------------------

    /// Roll back every completed, rollback-capable task in reverse order.
    /// Returns the first rollback failure; later rollbacks still run.
    pub fn rollback(&self) -> Result<()> {
        let _running = RunningFlag::acquire(&self.running)?;
        let mut tasks = self.take_queue();
        let first_error = self.rollback_completed(&mut tasks);
        self.restore_queue(tasks);
        match first_error {
            Some(err) => Err(err.into()),
            None => {
                self.ctx.set_progress(self.progress());
                Ok(())
            }
        }
    }

    /// `tasks` is a prefix of the queue, so indices line up with results
    fn rollback_completed(&self, tasks: &mut [QueuedTask]) -> Option<TaskError> {
        let states: Vec<TaskState> = lock(&self.results).iter().map(|r| r.state).collect();
        let mut first_error = None;

        for (index, queued) in tasks.iter_mut().enumerate().rev() {
            if states.get(index) != Some(&TaskState::Completed) || !queued.task.can_rollback() {
                continue;
            }

            let task_id = queued.task.id().to_string();
            let task_type = queued.task.kind().to_string();
            tracing::info!("Rolling back task '{}'", task_id);

            match queued.task.rollback(&self.ctx, &self.bus) {
                Ok(()) => {
                    self.update_result(index, |r| r.state = TaskState::RolledBack);
                    self.completed.fetch_sub(1, Ordering::SeqCst);
                    self.bus.publish_task_rolled_back(&task_id, &task_type);
                    self.ctx
                        .add_log(LogLevel::Info, format!("Rolled back task: {task_id}"));
                }
                Err(e) => {
                    let err = TaskError::Rollback {
                        task_id,
                        message: describe(&e),
                    };
                    self.ctx.add_error(&err);
                    self.ctx.add_log(LogLevel::Error, err.to_string());
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }

        first_error
    }
}
