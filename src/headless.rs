//! Unattended execution of a flow
//!
//! Walks the selected flow from its entry step to completion without a
//! user interface: screen defaults stand in for user answers, each step's
//! tasks run in their own `TaskRunner`, and navigation follows the same
//! guards and branches as an interactive session. Nobody is there to
//! break a loop formed by `next` or branch targets, so a step entered more
//! than a bounded number of times stops the run.

use std::sync::Arc;

use crate::context::LogLevel;
use crate::error::{InstallError, Result};
use crate::privilege::ensure_privilege;
use crate::runner::{CancelHandle, TaskRunner};
use crate::session::Session;
use crate::task::{FailurePolicy, TaskError, TaskResult};
use crate::workflow::NavigationError;

/// Times a single step may be entered in one headless run
pub const DEFAULT_MAX_STEP_VISITS: usize = 3;

/// Outcome of a headless run
#[derive(Debug, Default)]
pub struct HeadlessReport {
    pub flow_id: String,
    /// Steps entered, in order
    pub steps: Vec<String>,
    /// Task results across all steps, in execution order
    pub results: Vec<TaskResult>,
    pub completed: bool,
    /// True when finished steps were rolled back after a failure
    pub rolled_back: bool,
    /// Why the run stopped early
    pub error: Option<InstallError>,
}

impl HeadlessReport {
    pub fn is_success(&self) -> bool {
        self.completed && self.error.is_none()
    }
}

#[derive(Debug, Clone, Default)]
pub struct HeadlessRunner {
    rollback_on_failure: bool,
    failure_policy: FailurePolicy,
    cancel: CancelHandle,
    max_step_visits: Option<usize>,
}

impl HeadlessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Undo previously finished steps, newest first, when a step fails
    pub fn rollback_on_failure(mut self, enabled: bool) -> Self {
        self.rollback_on_failure = enabled;
        self
    }

    /// Runner-wide policy for tasks without their own `on_failure`
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Share a cancel flag, e.g. one set from a Ctrl-C handler
    pub fn with_cancel_handle(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Stop with `NavigationError::StepLoop` once any step is entered more
    /// than `visits` times
    pub fn with_max_step_visits(mut self, visits: usize) -> Self {
        self.max_step_visits = Some(visits.max(1));
        self
    }

    /// Drive `flow_id` to completion.
    ///
    /// Errors before the first step (unknown flow, missing privileges) are
    /// returned as `Err`. Anything that stops the run later is recorded in
    /// the report.
    pub fn run(&self, session: &mut Session, flow_id: &str) -> Result<HeadlessReport> {
        ensure_privilege(session.context(), session.needs_privilege(flow_id))?;
        session.workflow_mut().select_flow(flow_id)?;

        let mut report = HeadlessReport {
            flow_id: flow_id.to_string(),
            ..HeadlessReport::default()
        };
        let mut finished: Vec<TaskRunner> = Vec::new();

        loop {
            if let Err(err) = self.run_step(session, &mut report, &mut finished) {
                tracing::error!("Flow '{}' stopped: {}", flow_id, err);
                session
                    .context()
                    .add_log(LogLevel::Error, format!("Installation stopped: {err}"));
                if self.rollback_on_failure && !finished.is_empty() {
                    report.rolled_back = self.rollback_steps(session, &mut finished, &mut report);
                }
                report.error = Some(err);
                return Ok(report);
            }

            let workflow = session.workflow_mut();
            if workflow.is_last_step() {
                workflow.complete()?;
                report.completed = true;
                tracing::info!("Flow '{}' completed headless", flow_id);
                return Ok(report);
            }
            if let Err(err) = workflow.next() {
                session
                    .context()
                    .add_log(LogLevel::Error, format!("Cannot continue: {err}"));
                if self.rollback_on_failure && !finished.is_empty() {
                    report.rolled_back = self.rollback_steps(session, &mut finished, &mut report);
                }
                report.error = Some(err);
                return Ok(report);
            }
        }
    }

    /// Apply screen defaults and run the current step's tasks. The step's
    /// runner is kept in `finished` even when it fails, so a later rollback
    /// also covers the tasks that completed before the failure.
    fn run_step(
        &self,
        session: &Session,
        report: &mut HeadlessReport,
        finished: &mut Vec<TaskRunner>,
    ) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(TaskError::Cancelled.into());
        }

        let workflow = session.workflow();
        let step = workflow
            .current_step()
            .ok_or_else(|| InstallError::general("no current step"))?;
        let visits = report.steps.iter().filter(|id| **id == step.id).count() + 1;
        if visits > self.max_step_visits.unwrap_or(DEFAULT_MAX_STEP_VISITS) {
            return Err(NavigationError::StepLoop {
                step: step.id.clone(),
                visits,
            }
            .into());
        }
        report.steps.push(step.id.clone());
        tracing::debug!("Headless step '{}'", step.id);

        if let Some(screen) = workflow.current_screen() {
            screen.apply_defaults(session.context())?;
        }
        if step.tasks.is_empty() {
            return Ok(());
        }

        let runner = TaskRunner::new(
            Arc::clone(session.context()),
            Arc::clone(session.event_bus()),
            Arc::clone(workflow.registries()),
        )
        .with_cancel_handle(self.cancel.clone());
        runner.set_failure_policy(self.failure_policy);
        for task in &step.tasks {
            runner.queue_config(task)?;
        }

        let outcome = runner.run();
        report.results.extend(runner.results());
        finished.push(runner);
        outcome
    }

    /// Returns true if every rollback succeeded
    fn rollback_steps(
        &self,
        session: &Session,
        finished: &mut Vec<TaskRunner>,
        report: &mut HeadlessReport,
    ) -> bool {
        session
            .context()
            .add_log(LogLevel::Warn, "Rolling back finished steps");
        let mut clean = true;
        while let Some(runner) = finished.pop() {
            if let Err(err) = runner.rollback() {
                tracing::warn!("Rollback incomplete: {}", err);
                clean = false;
            }
            // Reflect rolled back states in the report
            for result in runner.results() {
                if let Some(existing) = report
                    .results
                    .iter_mut()
                    .rev()
                    .find(|r| r.task_id == result.task_id && r.task_type == result.task_type)
                {
                    *existing = result;
                }
            }
        }
        clean
    }
}
