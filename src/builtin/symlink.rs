//! `symlink` task: create `link` pointing at `target`.

use anyhow::{Context, bail};
use serde::Deserialize;
use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use crate::config::TaskConfig;
use crate::context::{InstallContext, LogLevel};
use crate::error::Result;
use crate::events::EventBus;
use crate::task::Task;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SymlinkParams {
    #[serde(default)]
    pub target: String,
    #[serde(default, alias = "linkPath", alias = "link_path")]
    pub link: String,
    #[serde(default)]
    pub overwrite: bool,
}

#[derive(Debug)]
pub struct SymlinkTask {
    id: String,
    params: SymlinkParams,
    /// Set after execute: the link target that was replaced, if any
    replaced: Option<Option<PathBuf>>,
}

impl SymlinkTask {
    pub fn from_config(config: &TaskConfig, ctx: &InstallContext) -> Result<Self> {
        let params: SymlinkParams = config.decode_rendered(ctx)?;
        Ok(Self {
            id: super::task_id(config, "symlink", ""),
            params,
            replaced: None,
        })
    }
}

fn remove_link(link: &Path) -> anyhow::Result<()> {
    fs::remove_file(link).with_context(|| format!("Failed to remove link '{}'", link.display()))
}

impl Task for SymlinkTask {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &str {
        "symlink"
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.params.target.is_empty() {
            bail!("target is required");
        }
        if self.params.link.is_empty() {
            bail!("link is required");
        }
        Ok(())
    }

    fn execute(&mut self, ctx: &InstallContext, _bus: &EventBus) -> anyhow::Result<()> {
        let link = PathBuf::from(&self.params.link);
        let mut previous = None;

        if let Ok(meta) = fs::symlink_metadata(&link) {
            if !self.params.overwrite {
                bail!("'{}' already exists", link.display());
            }
            if !meta.file_type().is_symlink() {
                bail!("'{}' exists and is not a symbolic link", link.display());
            }
            previous = Some(fs::read_link(&link)?);
            remove_link(&link)?;
        }

        if let Some(parent) = link.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create '{}'", parent.display()))?;
        }
        symlink(&self.params.target, &link).with_context(|| {
            format!("Failed to link '{}' -> '{}'", link.display(), self.params.target)
        })?;
        self.replaced = Some(previous);

        ctx.add_log(
            LogLevel::Info,
            format!("Linked {} -> {}", link.display(), self.params.target),
        );
        Ok(())
    }

    fn can_rollback(&self) -> bool {
        true
    }

    fn rollback(&mut self, ctx: &InstallContext, _bus: &EventBus) -> anyhow::Result<()> {
        let Some(previous) = self.replaced.take() else {
            return Ok(());
        };
        let link = PathBuf::from(&self.params.link);
        if fs::symlink_metadata(&link).is_ok() {
            remove_link(&link)?;
        }
        if let Some(old_target) = previous {
            symlink(&old_target, &link)
                .with_context(|| format!("Failed to restore link '{}'", link.display()))?;
            ctx.add_log(
                LogLevel::Info,
                format!("Restored {} -> {}", link.display(), old_target.display()),
            );
        } else {
            ctx.add_log(LogLevel::Info, format!("Removed link {}", link.display()));
        }
        Ok(())
    }
}
