//! Built-in leaf tasks.
//!
//! Each module owns one task type and a typed parameter struct decoded
//! from the task's configuration entry. String parameters are rendered
//! through the install context when the task is built, so `${...}`
//! placeholders resolve against the answers collected up to that step.
//!
//! - `shell` runs a command, optionally with a rollback command
//! - `copy` copies a file or directory tree
//! - `writeConfig` writes a text, JSON or YAML file
//! - `symlink` creates a symbolic link
//! - `removePath` deletes a file or directory
//! - `download` fetches a file over HTTP(S) and checks its SHA-256
//! - `unpack` extracts a tar, tar.gz or zip archive
//! - `desktopEntry` / `removeDesktopEntry` manage `.desktop` launchers
//! - `permission` changes file modes

pub mod copy;
pub mod desktop_entry;
pub mod download;
mod journal;
pub mod permission;
pub mod remove_path;
pub mod shell;
pub mod symlink;
pub mod unpack;
pub mod write_config;

use std::sync::Arc;

use crate::config::TaskConfig;
use crate::context::InstallContext;
use crate::registry::{Registry, TaskFactory};
use crate::task::Task;

pub use copy::CopyTask;
pub use desktop_entry::{DesktopEntryTask, RemoveDesktopEntryTask};
pub use download::DownloadTask;
pub use permission::PermissionTask;
pub use remove_path::RemovePathTask;
pub use shell::ShellTask;
pub use symlink::SymlinkTask;
pub use unpack::UnpackTask;
pub use write_config::WriteConfigTask;

/// Register the built-in task types
pub fn register_builtin_tasks(registry: &Registry<TaskFactory>) {
    registry.must_register(
        "shell",
        Arc::new(|c: &TaskConfig, ctx: &InstallContext| {
            Ok(Box::new(ShellTask::from_config(c, ctx)?) as Box<dyn Task>)
        }),
    );
    registry.must_register(
        "copy",
        Arc::new(|c: &TaskConfig, ctx: &InstallContext| {
            Ok(Box::new(CopyTask::from_config(c, ctx)?) as Box<dyn Task>)
        }),
    );
    registry.must_register(
        "writeConfig",
        Arc::new(|c: &TaskConfig, ctx: &InstallContext| {
            Ok(Box::new(WriteConfigTask::from_config(c, ctx)?) as Box<dyn Task>)
        }),
    );
    registry.must_register(
        "symlink",
        Arc::new(|c: &TaskConfig, ctx: &InstallContext| {
            Ok(Box::new(SymlinkTask::from_config(c, ctx)?) as Box<dyn Task>)
        }),
    );
    registry.must_register(
        "removePath",
        Arc::new(|c: &TaskConfig, ctx: &InstallContext| {
            Ok(Box::new(RemovePathTask::from_config(c, ctx)?) as Box<dyn Task>)
        }),
    );
    registry.must_register(
        "download",
        Arc::new(|c: &TaskConfig, ctx: &InstallContext| {
            Ok(Box::new(DownloadTask::from_config(c, ctx)?) as Box<dyn Task>)
        }),
    );
    registry.must_register(
        "unpack",
        Arc::new(|c: &TaskConfig, ctx: &InstallContext| {
            Ok(Box::new(UnpackTask::from_config(c, ctx)?) as Box<dyn Task>)
        }),
    );
    registry.must_register(
        "desktopEntry",
        Arc::new(|c: &TaskConfig, ctx: &InstallContext| {
            Ok(Box::new(DesktopEntryTask::from_config(c, ctx)?) as Box<dyn Task>)
        }),
    );
    registry.must_register(
        "removeDesktopEntry",
        Arc::new(|c: &TaskConfig, ctx: &InstallContext| {
            Ok(Box::new(RemoveDesktopEntryTask::from_config(c, ctx)?) as Box<dyn Task>)
        }),
    );
    registry.must_register(
        "permission",
        Arc::new(|c: &TaskConfig, ctx: &InstallContext| {
            Ok(Box::new(PermissionTask::from_config(c, ctx)?) as Box<dyn Task>)
        }),
    );
}

/// Task ID from the config, or `<kind>-<suffix>` when none was given
pub(crate) fn task_id(config: &TaskConfig, kind: &str, suffix: &str) -> String {
    if !config.id.is_empty() {
        return config.id.clone();
    }
    if suffix.is_empty() {
        kind.to_string()
    } else {
        format!("{kind}-{suffix}")
    }
}
