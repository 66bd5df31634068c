//! `permission` task: set the mode of a file or directory tree.
//!
//! With `requirePrivilege` the task refuses to run without root. Rollback
//! puts back the modes it changed.

use anyhow::{Context, bail};
use nix::sys::stat::{Mode, stat};
use serde::Deserialize;
use serde_json::Value;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use super::copy::parse_mode;
use crate::config::TaskConfig;
use crate::context::{InstallContext, LogLevel};
use crate::error::{InstallError, Result};
use crate::events::EventBus;
use crate::privilege::ensure_privilege;
use crate::task::Task;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionParams {
    #[serde(default)]
    pub path: String,
    /// Octal string (`"0600"`) or number
    #[serde(default)]
    pub mode: Option<Value>,
    /// Apply to everything below a directory as well
    #[serde(default)]
    pub recursive: bool,
    #[serde(default)]
    pub require_privilege: bool,
}

#[derive(Debug)]
pub struct PermissionTask {
    id: String,
    params: PermissionParams,
    mode: Option<Mode>,
    /// Original permission bits, in the order they were changed
    previous: Vec<(PathBuf, u32)>,
}

impl PermissionTask {
    pub fn from_config(config: &TaskConfig, ctx: &InstallContext) -> Result<Self> {
        let params: PermissionParams = config.decode_rendered(ctx)?;
        let mode = match &params.mode {
            None | Some(Value::Null) => None,
            Some(value) => Some(
                parse_mode(value)
                    .and_then(Mode::from_bits)
                    .ok_or_else(|| {
                        InstallError::config(format!(
                            "task '{}' (permission): invalid mode {}",
                            config.display_id(),
                            value
                        ))
                    })?,
            ),
        };
        Ok(Self {
            id: super::task_id(config, "permission", ""),
            params,
            mode,
            previous: Vec::new(),
        })
    }

    fn targets(&self, root: &Path) -> anyhow::Result<Vec<PathBuf>> {
        if !self.params.recursive {
            return Ok(vec![root.to_path_buf()]);
        }
        let mut targets = Vec::new();
        for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
            let entry = entry.with_context(|| format!("Failed to walk '{}'", root.display()))?;
            if !entry.file_type().is_symlink() {
                targets.push(entry.into_path());
            }
        }
        Ok(targets)
    }

    fn apply(&mut self, path: &Path, mode: Mode) -> anyhow::Result<()> {
        let current = stat(path)
            .with_context(|| format!("Failed to stat '{}'", path.display()))?
            .st_mode
            & 0o7777;
        if !self.previous.iter().any(|(p, _)| p == path) {
            self.previous.push((path.to_path_buf(), current));
        }
        fs::set_permissions(path, fs::Permissions::from_mode(mode.bits()))
            .with_context(|| format!("Failed to set mode on '{}'", path.display()))
    }
}

impl Task for PermissionTask {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &str {
        "permission"
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.params.path.is_empty() {
            bail!("path is required");
        }
        if self.mode.is_none() {
            bail!("mode is required");
        }
        Ok(())
    }

    fn execute(&mut self, ctx: &InstallContext, _bus: &EventBus) -> anyhow::Result<()> {
        ensure_privilege(ctx, self.params.require_privilege)?;
        let mode = self.mode.context("mode is required")?;
        let root = PathBuf::from(&self.params.path);

        let targets = self.targets(&root)?;
        for target in &targets {
            self.apply(target, mode)?;
        }

        ctx.add_log(
            LogLevel::Info,
            format!(
                "Set mode {:04o} on {} ({} path(s))",
                mode.bits(),
                root.display(),
                targets.len()
            ),
        );
        Ok(())
    }

    fn can_rollback(&self) -> bool {
        true
    }

    fn rollback(&mut self, ctx: &InstallContext, _bus: &EventBus) -> anyhow::Result<()> {
        for (path, mode) in std::mem::take(&mut self.previous).into_iter().rev() {
            fs::set_permissions(&path, fs::Permissions::from_mode(mode))
                .with_context(|| format!("Failed to restore mode on '{}'", path.display()))?;
        }
        ctx.add_log(
            LogLevel::Info,
            format!("Restored permissions of {}", self.params.path),
        );
        Ok(())
    }
}
