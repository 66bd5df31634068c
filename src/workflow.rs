//! Flow navigation state machine
//!
//! A `Workflow` holds every registered `Flow` and navigates one of them at a
//! time. Per step it tracks whether the step has been visited or disabled;
//! the user-facing `StepStatus` is derived from those sets plus the current
//! position, never stored.
//!
//! ```text
//!   select_flow ──► entry step (Current, visited)
//!        │
//!        ▼
//!   next():  guards ─► explicit next ─► branch rule ─► declaration order
//!   prev():            explicit prev ─────────────────► declaration order
//!   jump_to(): visited or allow_jump, never disabled, no guards
//!   complete(): terminal
//! ```
//!
//! Guard failures and unresolved branches are returned from `next()` without
//! mutating any state. Disabled steps are skipped transparently in both
//! directions.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use strum::Display;
use thiserror::Error;

use crate::config::{BranchConfig, FlowConfig, GuardConfig, ScreenConfig, StepConfig, TaskConfig};
use crate::context::{InstallContext, LogLevel, value_to_string};
use crate::error::{InstallError, Result};
use crate::events::EventBus;
use crate::guard::Guard;
use crate::registry::Registries;
use crate::screen::Screen;

/// Navigation errors. None of these mutate workflow state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NavigationError {
    #[error("no flow selected")]
    NoFlowSelected,

    #[error("unknown flow '{0}'")]
    UnknownFlow(String),

    #[error("unknown step '{0}'")]
    UnknownStep(String),

    #[error("already at the last step")]
    AtLastStep,

    #[error("already at the first step")]
    AtFirstStep,

    #[error("step '{step}': no branch for {condition} = '{value}' and no default")]
    BranchUnresolved {
        step: String,
        condition: String,
        value: String,
    },

    #[error("cannot jump to step '{0}': not visited and jumping is not allowed")]
    JumpNotAllowed(String),

    #[error("step '{0}' is disabled")]
    StepDisabled(String),

    #[error("cannot disable the current step '{0}'")]
    CannotDisableCurrent(String),

    #[error("flow is already completed")]
    FlowCompleted,

    #[error("step '{step}' entered {visits} times; the flow loops")]
    StepLoop { step: String, visits: usize },
}

/// Derived status of a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "snake_case")]
pub enum StepStatus {
    NotStarted,
    Current,
    Completed,
    Disabled,
}

/// One node of a flow
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Step {
    pub id: String,
    pub title: String,
    pub next: Option<String>,
    pub prev: Option<String>,
    pub branch: Option<BranchConfig>,
    pub allow_jump: bool,
    pub guards: Vec<GuardConfig>,
    pub tasks: Vec<TaskConfig>,
    /// Presentation payload, opaque to navigation
    pub screen: Option<ScreenConfig>,
}

impl Step {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            ..Self::default()
        }
    }

    /// Build from configuration; the title is rendered through the context
    pub fn from_config(config: &StepConfig, ctx: &InstallContext) -> Self {
        Self {
            id: config.id.clone(),
            title: ctx.render(&config.title),
            next: config.next.clone().filter(|s| !s.is_empty()),
            prev: config.prev.clone().filter(|s| !s.is_empty()),
            branch: config.branch.clone(),
            allow_jump: config.allow_jump,
            guards: config.guards.clone(),
            tasks: config.tasks.clone(),
            screen: config.screen.clone(),
        }
    }

    pub fn with_next(mut self, next: impl Into<String>) -> Self {
        self.next = Some(next.into());
        self
    }

    pub fn with_prev(mut self, prev: impl Into<String>) -> Self {
        self.prev = Some(prev.into());
        self
    }

    pub fn with_branch(mut self, branch: BranchConfig) -> Self {
        self.branch = Some(branch);
        self
    }

    pub fn allow_jump(mut self) -> Self {
        self.allow_jump = true;
        self
    }

    pub fn with_guard(mut self, guard: GuardConfig) -> Self {
        self.guards.push(guard);
        self
    }

    pub fn with_task(mut self, task: TaskConfig) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn with_screen(mut self, screen: ScreenConfig) -> Self {
        self.screen = Some(screen);
        self
    }
}

/// A named, ordered sequence of steps
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Flow {
    pub id: String,
    /// Entry step; empty means the first step
    pub entry: String,
    pub steps: Vec<Step>,
}

impl Flow {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn from_config(id: &str, config: &FlowConfig, ctx: &InstallContext) -> Self {
        Self {
            id: id.to_string(),
            entry: config.entry.clone(),
            steps: config
                .steps
                .iter()
                .map(|s| Step::from_config(s, ctx))
                .collect(),
        }
    }

    pub fn with_entry(mut self, entry: impl Into<String>) -> Self {
        self.entry = entry.into();
        self
    }

    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn position(&self, step_id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == step_id)
    }
}

/// A validated flow with its guards and screens built
struct RegisteredFlow {
    flow: Flow,
    entry: usize,
    guards: Vec<Vec<Box<dyn Guard>>>,
    screens: Vec<Option<Box<dyn Screen>>>,
}

#[derive(Debug, Default)]
struct Position {
    flow_id: String,
    current: usize,
    visited: HashSet<String>,
    disabled: HashSet<String>,
    completed: bool,
}

/// Navigation over registered flows
pub struct Workflow {
    ctx: Arc<InstallContext>,
    bus: Arc<EventBus>,
    registries: Arc<Registries>,
    flows: BTreeMap<String, RegisteredFlow>,
    position: Option<Position>,
}

impl std::fmt::Debug for Workflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workflow")
            .field("flows", &self.flows.keys().collect::<Vec<_>>())
            .field("position", &self.position)
            .finish()
    }
}

impl Workflow {
    pub fn new(ctx: Arc<InstallContext>, bus: Arc<EventBus>, registries: Arc<Registries>) -> Self {
        Self {
            ctx,
            bus,
            registries,
            flows: BTreeMap::new(),
            position: None,
        }
    }

    pub fn context(&self) -> &Arc<InstallContext> {
        &self.ctx
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn registries(&self) -> &Arc<Registries> {
        &self.registries
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Validate and register a flow.
    ///
    /// Rejects empty IDs, duplicates, flows without steps, duplicate step
    /// IDs, missing entry/next/prev/branch targets, and unregistered screen,
    /// task or guard types. Guards and screens are built here.
    pub fn add_flow(&mut self, mut flow: Flow) -> Result<()> {
        if flow.id.trim().is_empty() {
            return Err(InstallError::config("flow id must not be empty"));
        }
        if self.flows.contains_key(&flow.id) {
            return Err(InstallError::config(format!(
                "flow '{}' is already registered",
                flow.id
            )));
        }
        if flow.steps.is_empty() {
            return Err(InstallError::config(format!("flow '{}' has no steps", flow.id)));
        }

        let mut ids = HashSet::new();
        for step in &flow.steps {
            if step.id.trim().is_empty() {
                return Err(InstallError::config(format!(
                    "flow '{}' has a step without an id",
                    flow.id
                )));
            }
            if !ids.insert(step.id.as_str()) {
                return Err(InstallError::config(format!(
                    "flow '{}' has duplicate step id '{}'",
                    flow.id, step.id
                )));
            }
        }

        if flow.entry.is_empty() {
            flow.entry = flow.steps[0].id.clone();
        }
        let entry = flow.position(&flow.entry).ok_or_else(|| {
            InstallError::config(format!(
                "flow '{}' entry step '{}' does not exist",
                flow.id, flow.entry
            ))
        })?;

        for step in &flow.steps {
            let targets = step
                .next
                .iter()
                .chain(step.prev.iter())
                .map(String::as_str)
                .chain(step.branch.iter().flat_map(|b| b.targets()));
            for target in targets {
                if !ids.contains(target) {
                    return Err(InstallError::config(format!(
                        "flow '{}' step '{}' references unknown step '{}'",
                        flow.id, step.id, target
                    )));
                }
            }
            for task in &step.tasks {
                self.registries.tasks.lookup(&task.kind)?;
            }
        }

        let mut guards = Vec::with_capacity(flow.steps.len());
        let mut screens = Vec::with_capacity(flow.steps.len());
        for step in &flow.steps {
            guards.push(
                step.guards
                    .iter()
                    .map(|g| self.registries.build_guard(g))
                    .collect::<Result<Vec<_>>>()?,
            );
            screens.push(
                step.screen
                    .as_ref()
                    .map(|s| self.registries.build_screen(s))
                    .transpose()?,
            );
        }

        tracing::debug!("Registered flow '{}' with {} step(s)", flow.id, flow.steps.len());
        self.flows.insert(
            flow.id.clone(),
            RegisteredFlow {
                flow,
                entry,
                guards,
                screens,
            },
        );
        Ok(())
    }

    pub fn flow_ids(&self) -> Vec<String> {
        self.flows.keys().cloned().collect()
    }

    pub fn has_flow(&self, id: &str) -> bool {
        self.flows.contains_key(id)
    }

    /// Make `id` the active flow and reset navigation to its entry step
    pub fn select_flow(&mut self, id: &str) -> Result<()> {
        let registered = self
            .flows
            .get(id)
            .ok_or_else(|| NavigationError::UnknownFlow(id.to_string()))?;

        let entry_id = registered.flow.steps[registered.entry].id.clone();
        let mut visited = HashSet::new();
        visited.insert(entry_id.clone());

        self.position = Some(Position {
            flow_id: id.to_string(),
            current: registered.entry,
            visited,
            disabled: HashSet::new(),
            completed: false,
        });
        self.ctx.set_flow(id, &entry_id);
        tracing::info!("Selected flow '{}' at step '{}'", id, entry_id);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    fn active(&self) -> Option<(&RegisteredFlow, &Position)> {
        let position = self.position.as_ref()?;
        let registered = self.flows.get(&position.flow_id)?;
        Some((registered, position))
    }

    fn active_or_err(&self) -> std::result::Result<(&RegisteredFlow, &Position), NavigationError> {
        self.active().ok_or(NavigationError::NoFlowSelected)
    }

    pub fn current_flow(&self) -> Option<&Flow> {
        self.active().map(|(r, _)| &r.flow)
    }

    pub fn current_step(&self) -> Option<&Step> {
        self.active().map(|(r, p)| &r.flow.steps[p.current])
    }

    pub fn current_step_id(&self) -> Option<&str> {
        self.current_step().map(|s| s.id.as_str())
    }

    /// Built screen of the current step, if it has one
    pub fn current_screen(&self) -> Option<&dyn Screen> {
        let (registered, position) = self.active()?;
        registered.screens[position.current].as_deref()
    }

    /// Steps of the active flow; empty when none is selected
    pub fn steps(&self) -> &[Step] {
        self.current_flow().map(|f| f.steps.as_slice()).unwrap_or(&[])
    }

    pub fn step_status(&self, step_id: &str) -> StepStatus {
        let Some((registered, position)) = self.active() else {
            return StepStatus::NotStarted;
        };
        if position.disabled.contains(step_id) {
            return StepStatus::Disabled;
        }
        let is_current = registered.flow.steps[position.current].id == step_id;
        if is_current {
            return if position.completed {
                StepStatus::Completed
            } else {
                StepStatus::Current
            };
        }
        if position.visited.contains(step_id) {
            StepStatus::Completed
        } else {
            StepStatus::NotStarted
        }
    }

    pub fn is_visited(&self, step_id: &str) -> bool {
        self.active()
            .is_some_and(|(_, p)| p.visited.contains(step_id))
    }

    pub fn is_disabled(&self, step_id: &str) -> bool {
        self.active()
            .is_some_and(|(_, p)| p.disabled.contains(step_id))
    }

    pub fn is_complete(&self) -> bool {
        self.active().is_some_and(|(_, p)| p.completed)
    }

    /// True when there is nothing before the current step to go back to
    pub fn is_first_step(&self) -> bool {
        match self.active() {
            Some((registered, position)) => {
                registered.flow.steps[position.current].prev.is_none()
                    && enabled_before(registered, position, position.current).is_none()
            }
            None => false,
        }
    }

    /// True when `next()` has no target: no override, no branch and no
    /// enabled step later in declaration order
    pub fn is_last_step(&self) -> bool {
        match self.active() {
            Some((registered, position)) => {
                let step = &registered.flow.steps[position.current];
                step.next.is_none()
                    && step.branch.is_none()
                    && enabled_from(registered, position, position.current + 1).is_none()
            }
            None => false,
        }
    }

    pub fn can_go_back(&self) -> bool {
        !self.is_complete() && self.active().is_some() && !self.is_first_step()
    }

    /// Run the current step's guards in order; the first failure wins
    pub fn can_go_next(&self) -> Result<()> {
        let (registered, position) = self.active_or_err()?;
        for guard in &registered.guards[position.current] {
            if let Err(err) = guard.check(&self.ctx) {
                tracing::debug!("Guard '{}' blocked navigation: {}", guard.kind(), err);
                return Err(err);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------

    /// Advance past the current step. Returns the new step ID.
    pub fn next(&mut self) -> Result<String> {
        let (registered, position) = self.active_or_err()?;
        if position.completed {
            return Err(NavigationError::FlowCompleted.into());
        }
        self.can_go_next()?;

        let step = &registered.flow.steps[position.current];
        let target = if let Some(next) = &step.next {
            position_of(registered, next)
                .and_then(|i| enabled_from(registered, position, i))
                .ok_or(NavigationError::AtLastStep)?
        } else if let Some(branch) = &step.branch {
            let target_id = self.resolve_branch(&step.id, branch)?;
            position_of(registered, &target_id)
                .and_then(|i| enabled_from(registered, position, i))
                .ok_or(NavigationError::AtLastStep)?
        } else {
            enabled_from(registered, position, position.current + 1)
                .ok_or(NavigationError::AtLastStep)?
        };

        Ok(self.transition(target))
    }

    /// Go back one step. Guards are not consulted.
    pub fn prev(&mut self) -> Result<String> {
        let (registered, position) = self.active_or_err()?;
        if position.completed {
            return Err(NavigationError::FlowCompleted.into());
        }

        let step = &registered.flow.steps[position.current];
        let target = match &step.prev {
            Some(prev) => position_of(registered, prev)
                .and_then(|i| enabled_before(registered, position, i + 1)),
            None => enabled_before(registered, position, position.current),
        }
        .ok_or(NavigationError::AtFirstStep)?;

        Ok(self.transition(target))
    }

    /// Jump to a visited step, or to any step that allows jumping
    pub fn jump_to(&mut self, step_id: &str) -> Result<()> {
        let (registered, position) = self.active_or_err()?;
        if position.completed {
            return Err(NavigationError::FlowCompleted.into());
        }
        let target = position_of(registered, step_id)
            .ok_or_else(|| NavigationError::UnknownStep(step_id.to_string()))?;
        if position.disabled.contains(step_id) {
            return Err(NavigationError::StepDisabled(step_id.to_string()).into());
        }
        if target == position.current {
            return Ok(());
        }
        if !position.visited.contains(step_id) && !registered.flow.steps[target].allow_jump {
            return Err(NavigationError::JumpNotAllowed(step_id.to_string()).into());
        }

        self.transition(target);
        Ok(())
    }

    pub fn disable_step(&mut self, step_id: &str) -> Result<()> {
        let (registered, position) = self.active_or_err()?;
        let index = position_of(registered, step_id)
            .ok_or_else(|| NavigationError::UnknownStep(step_id.to_string()))?;
        if index == position.current {
            return Err(NavigationError::CannotDisableCurrent(step_id.to_string()).into());
        }
        if let Some(position) = self.position.as_mut() {
            position.disabled.insert(step_id.to_string());
        }
        tracing::debug!("Disabled step '{}'", step_id);
        Ok(())
    }

    /// Re-enable a step. Its visited marking is dropped, so it reports
    /// `NotStarted` again.
    pub fn enable_step(&mut self, step_id: &str) -> Result<()> {
        let (registered, _) = self.active_or_err()?;
        if position_of(registered, step_id).is_none() {
            return Err(NavigationError::UnknownStep(step_id.to_string()).into());
        }
        if let Some(position) = self.position.as_mut() {
            position.disabled.remove(step_id);
            position.visited.remove(step_id);
        }
        tracing::debug!("Enabled step '{}'", step_id);
        Ok(())
    }

    /// Finish the active flow
    pub fn complete(&mut self) -> Result<()> {
        let (_, position) = self.active_or_err()?;
        if position.completed {
            return Err(NavigationError::FlowCompleted.into());
        }
        let flow_id = position.flow_id.clone();

        if let Some(position) = self.position.as_mut() {
            position.completed = true;
        }
        self.ctx.mark_completed();
        self.ctx
            .add_log(LogLevel::Info, format!("Flow '{flow_id}' completed"));
        self.bus.publish_flow_complete(&flow_id);
        Ok(())
    }

    fn resolve_branch(&self, step_id: &str, branch: &BranchConfig) -> Result<String> {
        let value = if branch.condition.contains("${") {
            self.ctx.render(&branch.condition)
        } else {
            self.ctx
                .get(&branch.condition)
                .map(|v| value_to_string(&v))
                .unwrap_or_default()
        };

        if let Some(target) = branch.branches.get(&value) {
            return Ok(target.clone());
        }
        if let Some(default) = &branch.default {
            return Ok(default.clone());
        }
        Err(NavigationError::BranchUnresolved {
            step: step_id.to_string(),
            condition: branch.condition.clone(),
            value,
        }
        .into())
    }

    fn transition(&mut self, target: usize) -> String {
        let Some(position) = self.position.as_mut() else {
            return String::new();
        };
        let Some(registered) = self.flows.get(&position.flow_id) else {
            return String::new();
        };

        let from = registered.flow.steps[position.current].id.clone();
        let to = registered.flow.steps[target].id.clone();
        position.current = target;
        position.visited.insert(to.clone());

        self.ctx.set_current_step(&to);
        tracing::info!("Step change: {} -> {}", from, to);
        self.bus.publish_step_change(&from, &to);
        to
    }
}

fn position_of(registered: &RegisteredFlow, step_id: &str) -> Option<usize> {
    registered.flow.position(step_id)
}

/// First enabled step at or after `start`
fn enabled_from(registered: &RegisteredFlow, position: &Position, start: usize) -> Option<usize> {
    registered
        .flow
        .steps
        .iter()
        .enumerate()
        .skip(start)
        .find(|(_, s)| !position.disabled.contains(&s.id))
        .map(|(i, _)| i)
}

/// Last enabled step strictly before `end`
fn enabled_before(registered: &RegisteredFlow, position: &Position, end: usize) -> Option<usize> {
    registered.flow.steps[..end.min(registered.flow.steps.len())]
        .iter()
        .enumerate()
        .rev()
        .find(|(_, s)| !position.disabled.contains(&s.id))
        .map(|(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventType;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_flow() -> Flow {
        Flow::new("install")
            .with_entry("welcome")
            .with_step(Step::new("welcome", "Welcome"))
            .with_step(Step::new("license", "License"))
            .with_step(Step::new("destination", "Destination"))
            .with_step(Step::new("install", "Install"))
            .with_step(Step::new("finish", "Finish"))
    }

    fn workflow() -> Workflow {
        Workflow::new(
            Arc::new(InstallContext::new()),
            Arc::new(EventBus::new()),
            Arc::new(Registries::with_builtins()),
        )
    }

    fn selected(flow: Flow) -> Workflow {
        let mut w = workflow();
        let id = flow.id.clone();
        w.add_flow(flow).expect("add flow");
        w.select_flow(&id).expect("select flow");
        w
    }

    // =========================================================================
    // Registration and selection
    // =========================================================================

    #[test]
    fn test_add_flow_validation() {
        let mut w = workflow();
        w.add_flow(test_flow()).expect("add");

        assert!(w.add_flow(test_flow()).is_err(), "duplicate flow");
        assert!(w.add_flow(Flow::new("empty")).is_err(), "empty steps");
        assert!(
            w.add_flow(Flow::new("").with_step(Step::new("a", "A"))).is_err(),
            "empty id"
        );
        assert!(
            w.add_flow(
                Flow::new("dupes")
                    .with_step(Step::new("a", "A"))
                    .with_step(Step::new("a", "A again"))
            )
            .is_err(),
            "duplicate step ids"
        );
        assert!(
            w.add_flow(Flow::new("bad-entry").with_entry("zzz").with_step(Step::new("a", "A")))
                .is_err(),
            "missing entry"
        );
        assert!(
            w.add_flow(Flow::new("bad-next").with_step(Step::new("a", "A").with_next("zzz")))
                .is_err(),
            "dangling next"
        );
    }

    #[test]
    fn test_add_flow_rejects_unregistered_types() {
        let mut w = workflow();
        let err = w
            .add_flow(
                Flow::new("t").with_step(Step::new("a", "A").with_task(TaskConfig::new("go:nope"))),
            )
            .unwrap_err();
        assert!(matches!(err, InstallError::Registry(_)));

        let err = w
            .add_flow(Flow::new("g").with_step(Step::new("a", "A").with_guard(GuardConfig::new("nope"))))
            .unwrap_err();
        assert!(matches!(err, InstallError::Registry(_)));

        let err = w
            .add_flow(
                Flow::new("s").with_step(Step::new("a", "A").with_screen(ScreenConfig::new("nope"))),
            )
            .unwrap_err();
        assert!(matches!(err, InstallError::Registry(_)));

        // Malformed guard config fails at registration
        let err = w
            .add_flow(
                Flow::new("m")
                    .with_step(Step::new("a", "A").with_guard(GuardConfig::new("mustAccept"))),
            )
            .unwrap_err();
        assert!(matches!(err, InstallError::Config(_)));
        assert!(w.flow_ids().is_empty());
    }

    #[test]
    fn test_select_flow() {
        let w = selected(test_flow());
        assert_eq!(w.current_step_id(), Some("welcome"));

        let runtime = w.context().runtime();
        assert_eq!(runtime.flow_id, "install");
        assert_eq!(runtime.current_step, "welcome");

        let mut w = w;
        let err = w.select_flow("nonexistent").unwrap_err();
        assert!(matches!(
            err,
            InstallError::Navigation(NavigationError::UnknownFlow(_))
        ));
    }

    #[test]
    fn test_empty_entry_defaults_to_first_step() {
        let w = selected(
            Flow::new("x")
                .with_step(Step::new("first", "First"))
                .with_step(Step::new("second", "Second")),
        );
        assert_eq!(w.current_step_id(), Some("first"));
    }

    #[test]
    fn test_no_flow_selected() {
        let mut w = workflow();
        assert!(w.current_step().is_none());
        assert!(w.current_step_id().is_none());
        assert!(w.steps().is_empty());
        assert!(matches!(
            w.next().unwrap_err(),
            InstallError::Navigation(NavigationError::NoFlowSelected)
        ));
        assert!(w.prev().is_err());
        assert!(w.complete().is_err());
        assert!(!w.is_first_step());
        assert!(!w.is_last_step());
    }

    // =========================================================================
    // Linear navigation
    // =========================================================================

    #[test]
    fn test_linear_navigation_publishes_step_changes() {
        let mut w = selected(test_flow());
        let changes = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&changes);
        w.event_bus().subscribe(EventType::StepChange, move |e| {
            if let Some(p) = e.step_change_payload() {
                sink.lock().expect("lock").push((p.from_step.clone(), p.to_step.clone()));
            }
        });

        assert_eq!(w.next().expect("next"), "license");
        assert_eq!(w.next().expect("next"), "destination");
        assert_eq!(w.prev().expect("prev"), "license");

        let changes = changes.lock().expect("lock");
        assert_eq!(changes.len(), 3);
        assert_eq!(changes[2], ("destination".to_string(), "license".to_string()));
        assert_eq!(w.context().runtime().current_step, "license");
    }

    #[test]
    fn test_boundaries() {
        let mut w = selected(test_flow());
        assert!(w.is_first_step());
        assert!(!w.is_last_step());
        assert!(!w.can_go_back());
        assert!(matches!(
            w.prev().unwrap_err(),
            InstallError::Navigation(NavigationError::AtFirstStep)
        ));

        for _ in 0..4 {
            w.next().expect("next");
        }
        assert!(!w.is_first_step());
        assert!(w.is_last_step());
        assert!(w.can_go_back());
        assert!(matches!(
            w.next().unwrap_err(),
            InstallError::Navigation(NavigationError::AtLastStep)
        ));
        assert_eq!(w.current_step_id(), Some("finish"));
    }

    #[test]
    fn test_step_status() {
        let mut w = selected(test_flow());
        assert_eq!(w.step_status("welcome"), StepStatus::Current);
        assert_eq!(w.step_status("license"), StepStatus::NotStarted);

        w.next().expect("next");
        assert_eq!(w.step_status("welcome"), StepStatus::Completed);
        assert_eq!(w.step_status("license"), StepStatus::Current);
        assert!(w.is_visited("license"));
        assert!(!w.is_visited("destination"));
    }

    #[test]
    fn test_explicit_next_and_prev() {
        let mut w = selected(
            Flow::new("test")
                .with_step(Step::new("a", "A").with_next("c"))
                .with_step(Step::new("b", "B"))
                .with_step(Step::new("c", "C").with_prev("a")),
        );

        assert_eq!(w.next().expect("next"), "c");
        assert_eq!(w.prev().expect("prev"), "a");
    }

    // =========================================================================
    // Disabled steps and jumps
    // =========================================================================

    #[test]
    fn test_disabled_step_is_skipped() {
        let mut w = selected(test_flow());
        w.disable_step("license").expect("disable");
        assert_eq!(w.step_status("license"), StepStatus::Disabled);

        assert_eq!(w.next().expect("next"), "destination");
        assert_eq!(w.prev().expect("prev"), "welcome");

        assert!(matches!(
            w.disable_step("welcome").unwrap_err(),
            InstallError::Navigation(NavigationError::CannotDisableCurrent(_))
        ));
    }

    #[test]
    fn test_trailing_disabled_step_makes_current_last() {
        let mut w = selected(
            Flow::new("x")
                .with_step(Step::new("a", "A"))
                .with_step(Step::new("b", "B")),
        );
        w.disable_step("b").expect("disable");
        assert!(w.is_last_step());
    }

    #[test]
    fn test_enable_step_resets_status() {
        let mut w = selected(test_flow());
        w.next().expect("next");
        w.prev().expect("prev");
        assert_eq!(w.step_status("license"), StepStatus::Completed);

        w.disable_step("license").expect("disable");
        w.enable_step("license").expect("enable");
        assert_eq!(w.step_status("license"), StepStatus::NotStarted);
    }

    #[test]
    fn test_jump_rules() {
        let mut flow = test_flow();
        flow.steps[3].allow_jump = true;
        let mut w = selected(flow);

        assert!(matches!(
            w.jump_to("finish").unwrap_err(),
            InstallError::Navigation(NavigationError::JumpNotAllowed(_))
        ));
        w.jump_to("install").expect("allow_jump target");
        assert_eq!(w.current_step_id(), Some("install"));

        w.select_flow("install").expect("reselect");
        w.next().expect("license");
        w.next().expect("destination");
        w.jump_to("license").expect("visited target");
        assert_eq!(w.current_step_id(), Some("license"));

        w.disable_step("destination").expect("disable");
        assert!(matches!(
            w.jump_to("destination").unwrap_err(),
            InstallError::Navigation(NavigationError::StepDisabled(_))
        ));
        assert!(w.jump_to("nowhere").is_err());
        w.jump_to("license").expect("jump to self is a no-op");
    }

    // =========================================================================
    // Guards
    // =========================================================================

    /// Counts its checks so short-circuiting can be observed
    struct SpyGuard {
        pass: bool,
        message: String,
        calls: Arc<AtomicUsize>,
    }

    impl Guard for SpyGuard {
        fn kind(&self) -> &str {
            "spy"
        }

        fn message(&self) -> &str {
            &self.message
        }

        fn check(&self, _ctx: &InstallContext) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.pass {
                Ok(())
            } else {
                Err(InstallError::guard(&self.message))
            }
        }
    }

    fn spy_registries(calls: &Arc<AtomicUsize>) -> Arc<Registries> {
        let registries = Registries::new();
        let calls = Arc::clone(calls);
        registries
            .register_guard("spy", move |config| {
                Ok(Box::new(SpyGuard {
                    pass: config.param("pass") == Some(&serde_json::Value::Bool(true)),
                    message: config.message().unwrap_or("guard failed").to_string(),
                    calls: Arc::clone(&calls),
                }) as Box<dyn Guard>)
            })
            .expect("register spy");
        Arc::new(registries)
    }

    #[test]
    fn test_first_failing_guard_short_circuits() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut w = Workflow::new(
            Arc::new(InstallContext::new()),
            Arc::new(EventBus::new()),
            spy_registries(&calls),
        );
        w.add_flow(
            Flow::new("test")
                .with_step(
                    Step::new("step1", "Step 1")
                        .with_guard(
                            GuardConfig::new("spy")
                                .with_param("pass", false)
                                .with_param("message", "must accept"),
                        )
                        .with_guard(GuardConfig::new("spy").with_param("pass", true)),
                )
                .with_step(Step::new("step2", "Step 2")),
        )
        .expect("add");
        w.select_flow("test").expect("select");

        let err = w.can_go_next().unwrap_err();
        assert_eq!(err.to_string(), "must accept");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let err = w.next().unwrap_err();
        assert!(err.is_guard());
        assert_eq!(w.current_step_id(), Some("step1"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_builtin_guard_blocks_until_accepted() {
        let mut w = selected(
            Flow::new("install")
                .with_step(
                    Step::new("license", "License").with_guard(
                        GuardConfig::new("mustAccept")
                            .with_param("field", "license.accepted")
                            .with_param("message", "Please accept the license"),
                    ),
                )
                .with_step(Step::new("done", "Done")),
        );

        assert_eq!(w.next().unwrap_err().to_string(), "Please accept the license");
        w.context().set("license.accepted", true);
        assert_eq!(w.next().expect("next"), "done");
    }

    // =========================================================================
    // Branching
    // =========================================================================

    fn branching_flow(default: Option<&str>) -> Flow {
        let mut branch = BranchConfig::new("install.type")
            .with_branch("full", "full_install")
            .with_branch("minimal", "minimal_install");
        if let Some(default) = default {
            branch = branch.with_default(default);
        }
        Flow::new("test")
            .with_step(Step::new("start", "Start").with_branch(branch))
            .with_step(Step::new("full_install", "Full"))
            .with_step(Step::new("minimal_install", "Minimal"))
            .with_step(Step::new("finish", "Finish"))
    }

    #[test]
    fn test_branch_resolution() {
        let mut w = selected(branching_flow(Some("full_install")));

        w.context().set("install.type", "minimal");
        assert_eq!(w.next().expect("next"), "minimal_install");

        w.select_flow("test").expect("reselect");
        w.context().set("install.type", "unknown");
        assert_eq!(w.next().expect("next"), "full_install");
    }

    #[test]
    fn test_unresolved_branch_does_not_move() {
        let mut w = selected(branching_flow(None));
        w.context().set("install.type", "custom");

        let err = w.next().unwrap_err();
        assert!(matches!(
            err,
            InstallError::Navigation(NavigationError::BranchUnresolved { ref value, .. }) if value == "custom"
        ));
        assert_eq!(w.current_step_id(), Some("start"));
        assert!(!w.is_last_step());
    }

    #[test]
    fn test_branch_on_boolean_and_template() {
        let mut w = selected(
            Flow::new("b")
                .with_step(
                    Step::new("start", "Start").with_branch(
                        BranchConfig::new("${options.advanced}")
                            .with_branch("true", "advanced")
                            .with_default("summary"),
                    ),
                )
                .with_step(Step::new("advanced", "Advanced"))
                .with_step(Step::new("summary", "Summary")),
        );

        w.context().set("options.advanced", true);
        assert_eq!(w.next().expect("next"), "advanced");
    }

    // =========================================================================
    // Completion
    // =========================================================================

    #[test]
    fn test_complete() {
        let mut w = selected(test_flow());
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        w.event_bus().subscribe(EventType::FlowComplete, move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });

        for _ in 0..4 {
            w.next().expect("next");
        }
        w.complete().expect("complete");

        assert!(w.context().is_completed());
        assert!(w.is_complete());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(w.step_status("finish"), StepStatus::Completed);
        assert!(!w.can_go_back());

        assert!(matches!(
            w.complete().unwrap_err(),
            InstallError::Navigation(NavigationError::FlowCompleted)
        ));
        assert!(w.next().is_err());
    }

    #[test]
    fn test_steps_and_titles_from_config() {
        let ctx = Arc::new(InstallContext::new());
        ctx.set("product.name", "Demo");
        let config: FlowConfig = serde_json::from_value(serde_json::json!({
            "steps": [
                { "id": "welcome", "title": "Welcome to ${product.name}" },
                { "id": "finish", "title": "Done" }
            ]
        }))
        .expect("decode");

        let mut w = Workflow::new(
            Arc::clone(&ctx),
            Arc::new(EventBus::new()),
            Arc::new(Registries::with_builtins()),
        );
        w.add_flow(Flow::from_config("install", &config, &ctx)).expect("add");
        w.select_flow("install").expect("select");

        assert_eq!(w.steps().len(), 2);
        assert_eq!(w.steps()[0].title, "Welcome to Demo");
    }
}
