//! Task contract
//!
//! A task is one unit of installation work with a validate → execute →
//! (optional) rollback lifecycle. Built-in and extension tasks implement
//! `Task`; the `TaskRunner` orchestrates them.
//!
//! Leaf operations report failures as `anyhow::Error` so they can attach
//! context freely. The runner wraps those into `TaskError` with the task ID.

use std::time::SystemTime;
use strum::{Display, EnumString};
use thiserror::Error;

use crate::config::{DEFAULT_RETRIES, OnFailure};
use crate::context::InstallContext;
use crate::events::EventBus;

/// The unit of installation work
pub trait Task: Send {
    /// Unique ID within a run (falls back to the type name)
    fn id(&self) -> &str;

    /// Registered type name
    fn kind(&self) -> &str;

    /// Check parameters before execution. Called once per run.
    fn validate(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Perform the work. May publish progress on `bus`.
    fn execute(&mut self, ctx: &InstallContext, bus: &EventBus) -> anyhow::Result<()>;

    /// Whether `rollback` undoes anything
    fn can_rollback(&self) -> bool {
        false
    }

    /// Undo a completed `execute`
    fn rollback(&mut self, _ctx: &InstallContext, _bus: &EventBus) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Lifecycle state of one task in a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum TaskState {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    RolledBack,
}

impl TaskState {
    /// Returns true once the task will not change state again in this run
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled | TaskState::RolledBack
        )
    }
}

/// Per-task outcome
#[derive(Debug, Clone, PartialEq)]
pub struct TaskResult {
    pub task_id: String,
    pub task_type: String,
    pub state: TaskState,
    pub error: Option<String>,
    /// Number of `execute` calls made
    pub attempts: u32,
    pub started_at: Option<SystemTime>,
    pub finished_at: Option<SystemTime>,
}

impl TaskResult {
    pub fn pending(task_id: &str, task_type: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            task_type: task_type.to_string(),
            state: TaskState::Pending,
            error: None,
            attempts: 0,
            started_at: None,
            finished_at: None,
        }
    }
}

/// What the runner does once a task has failed for good
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum FailurePolicy {
    /// Stop and return the error
    #[default]
    Abort,
    /// Record the failure and continue with the next task
    Skip,
    /// Roll back completed tasks in reverse order, then return the error
    Rollback,
}

/// Base failure policy plus a retry budget for `execute`.
///
/// Retrying is a wrapper around the base policy: a task is executed up to
/// `max_retries + 1` times, and only the final failure reaches `policy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FailureHandling {
    pub policy: FailurePolicy,
    pub max_retries: u32,
}

impl FailureHandling {
    pub fn new(policy: FailurePolicy) -> Self {
        Self {
            policy,
            max_retries: 0,
        }
    }

    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Apply a task's own `on_failure`/`retries` on top of the runner default
    pub fn with_override(self, on_failure: Option<OnFailure>, retries: Option<u32>) -> Self {
        match on_failure {
            None => Self {
                policy: self.policy,
                max_retries: retries.unwrap_or(self.max_retries),
            },
            Some(OnFailure::Retry) => Self {
                policy: FailurePolicy::Abort,
                max_retries: retries.unwrap_or(DEFAULT_RETRIES),
            },
            Some(base) => Self {
                policy: FailurePolicy::from(base),
                max_retries: retries.unwrap_or(0),
            },
        }
    }
}

impl From<OnFailure> for FailurePolicy {
    fn from(value: OnFailure) -> Self {
        match value {
            OnFailure::Abort | OnFailure::Retry => FailurePolicy::Abort,
            OnFailure::Skip => FailurePolicy::Skip,
            OnFailure::Rollback => FailurePolicy::Rollback,
        }
    }
}

impl From<OnFailure> for FailureHandling {
    fn from(value: OnFailure) -> Self {
        FailureHandling::default().with_override(Some(value), None)
    }
}

/// Task runner errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("task '{task_id}' validation failed: {message}")]
    Validation { task_id: String, message: String },

    #[error("task '{task_id}' failed: {message}")]
    Execution { task_id: String, message: String },

    #[error("installation cancelled")]
    Cancelled,

    #[error("task runner is already running")]
    AlreadyRunning,

    #[error("rollback of task '{task_id}' failed: {message}")]
    Rollback { task_id: String, message: String },
}

impl TaskError {
    /// Task that produced the error, if any
    pub fn task_id(&self) -> Option<&str> {
        match self {
            TaskError::Validation { task_id, .. }
            | TaskError::Execution { task_id, .. }
            | TaskError::Rollback { task_id, .. } => Some(task_id),
            TaskError::Cancelled | TaskError::AlreadyRunning => None,
        }
    }
}

/// Flatten an anyhow chain into one line (`outer: inner: root`)
pub(crate) fn describe(err: &anyhow::Error) -> String {
    format!("{err:#}")
}
