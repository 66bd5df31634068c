//! `removePath` task: delete a file, link or directory.
//!
//! A symbolic link is removed itself, never what it points at. Removal
//! cannot be undone, so this task is not rollback-capable.

use anyhow::{Context, bail};
use serde::Deserialize;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use crate::config::TaskConfig;
use crate::context::{InstallContext, LogLevel};
use crate::error::Result;
use crate::events::EventBus;
use crate::task::Task;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemovePathParams {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub recursive: bool,
    /// Fail when the path does not exist
    #[serde(default, alias = "must_exist")]
    pub must_exist: bool,
}

#[derive(Debug)]
pub struct RemovePathTask {
    id: String,
    params: RemovePathParams,
}

impl RemovePathTask {
    pub fn from_config(config: &TaskConfig, ctx: &InstallContext) -> Result<Self> {
        Ok(Self {
            id: super::task_id(config, "removePath", ""),
            params: config.decode_rendered(ctx)?,
        })
    }
}

impl Task for RemovePathTask {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &str {
        "removePath"
    }

    fn validate(&self) -> anyhow::Result<()> {
        let path = self.params.path.trim();
        if path.is_empty() {
            bail!("path is required");
        }
        if path == "/" {
            bail!("refusing to remove '/'");
        }
        Ok(())
    }

    fn execute(&mut self, ctx: &InstallContext, _bus: &EventBus) -> anyhow::Result<()> {
        let path = PathBuf::from(&self.params.path);
        let meta = match fs::symlink_metadata(&path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                if self.params.must_exist {
                    bail!("'{}' does not exist", path.display());
                }
                ctx.add_log(
                    LogLevel::Debug,
                    format!("{} already absent", path.display()),
                );
                return Ok(());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to inspect '{}'", path.display()));
            }
        };

        if meta.is_dir() {
            let removed = if self.params.recursive {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_dir(&path)
            };
            removed.with_context(|| format!("Failed to remove directory '{}'", path.display()))?;
        } else {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to remove '{}'", path.display()))?;
        }

        ctx.add_log(LogLevel::Info, format!("Removed {}", path.display()));
        Ok(())
    }
}
