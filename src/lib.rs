//! installkit library
//!
//! Configuration-driven installation wizard engine: flows of steps with
//! guards and branches, a task runner with retry and rollback, and the
//! shared install context both of them work against.

pub mod builtin;
pub mod cli;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod guard;
pub mod headless;
pub mod plan;
pub mod preflight;
pub mod privilege;
pub mod process_guard;
pub mod registry;
pub mod runner;
pub mod screen;
pub mod session;
mod sync;
pub mod task;
pub mod workflow;

// Re-export main types for convenience
pub use config::{
    BranchConfig, Config, FieldConfig, FlowConfig, GuardConfig, OnFailure, OptionConfig,
    ProductConfig, ScreenConfig, StepConfig, TaskConfig,
};
pub use context::{EnvInfo, InstallContext, LogEntry, LogLevel, Runtime};
pub use error::{InstallError, Result};
pub use events::{Event, EventBus, EventType, SubscriptionId};
pub use guard::Guard;
pub use headless::{HeadlessReport, HeadlessRunner};
pub use plan::{PlannedTask, TaskPlan};
pub use preflight::detect_env;
pub use privilege::{PrivilegeStrategy, ensure_privilege, needs_privilege};
pub use process_guard::{ChildRegistry, CommandOutput, CommandProcessGroup, ProcessGuard};
pub use registry::{Registries, Registry, RegistryError, TypeRef};
pub use runner::{CancelHandle, TaskRunner};
pub use screen::Screen;
pub use session::Session;
pub use task::{FailureHandling, FailurePolicy, Task, TaskError, TaskResult, TaskState};
pub use workflow::{Flow, NavigationError, Step, StepStatus, Workflow};
