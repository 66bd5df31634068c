//! Dry-run preview of the tasks a flow would execute

use serde::Serialize;
use std::fmt;

use crate::config::FlowConfig;

/// One task as it would be queued
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedTask {
    pub step_id: String,
    pub task_type: String,
    /// Task ID, or the type name when the task has none
    pub description: String,
    pub requires_root: bool,
}

/// Every task of a flow in declaration order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TaskPlan {
    pub flow_id: String,
    pub tasks: Vec<PlannedTask>,
}

impl TaskPlan {
    pub fn build(flow_id: &str, flow: &FlowConfig) -> Self {
        let tasks = flow
            .steps
            .iter()
            .flat_map(|step| {
                step.tasks.iter().map(move |task| PlannedTask {
                    step_id: step.id.clone(),
                    task_type: task.kind.to_string(),
                    description: task.display_id(),
                    requires_root: task.requires_privilege(),
                })
            })
            .collect();
        Self {
            flow_id: flow_id.to_string(),
            tasks,
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Returns true if any planned task needs root
    pub fn requires_root(&self) -> bool {
        self.tasks.iter().any(|t| t.requires_root)
    }
}

impl fmt::Display for TaskPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Flow '{}': {} task(s)", self.flow_id, self.tasks.len())?;
        for (i, task) in self.tasks.iter().enumerate() {
            let root = if task.requires_root { " [root]" } else { "" };
            writeln!(
                f,
                "  {:>2}. [{}] {} ({}){}",
                i + 1,
                task.step_id,
                task.description,
                task.task_type,
                root
            )?;
        }
        Ok(())
    }
}
