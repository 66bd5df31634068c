//! `copy` task: copy a file or a directory tree.
//!
//! Rollback removes every file and directory the copy created and restores
//! files it overwrote. The journal spans retries: a path written by an
//! earlier attempt is overwritten by the next one and undone only once.

use anyhow::{Context, bail};
use serde::Deserialize;
use serde_json::Value;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use super::journal::FileJournal;
use crate::config::TaskConfig;
use crate::context::{InstallContext, LogLevel};
use crate::error::{InstallError, Result};
use crate::events::EventBus;
use crate::task::Task;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CopyParams {
    #[serde(default, alias = "src")]
    pub source: String,
    #[serde(default, alias = "dest")]
    pub destination: String,
    #[serde(default)]
    pub overwrite: bool,
    /// Octal string (`"0644"`) or number applied to copied files
    #[serde(default)]
    pub mode: Option<Value>,
}

#[derive(Debug)]
pub struct CopyTask {
    id: String,
    params: CopyParams,
    mode: Option<u32>,
    journal: FileJournal,
}

impl CopyTask {
    pub fn from_config(config: &TaskConfig, ctx: &InstallContext) -> Result<Self> {
        let params: CopyParams = config.decode_rendered(ctx)?;
        let mode = match &params.mode {
            None | Some(Value::Null) => None,
            Some(value) => Some(parse_mode(value).ok_or_else(|| {
                InstallError::config(format!(
                    "task '{}' (copy): invalid mode {}",
                    config.display_id(),
                    value
                ))
            })?),
        };
        Ok(Self {
            id: super::task_id(config, "copy", ""),
            params,
            mode,
            journal: FileJournal::default(),
        })
    }

    fn copy_file(&mut self, src: &Path, dst: &Path) -> anyhow::Result<()> {
        self.journal.record_target(dst, self.params.overwrite)?;
        fs::copy(src, dst)
            .with_context(|| format!("Failed to copy '{}' to '{}'", src.display(), dst.display()))?;
        if let Some(mode) = self.mode {
            fs::set_permissions(dst, fs::Permissions::from_mode(mode))
                .with_context(|| format!("Failed to set mode on '{}'", dst.display()))?;
        }
        Ok(())
    }

    fn copy_tree(&mut self, src: &Path, dst: &Path) -> anyhow::Result<usize> {
        let mut copied = 0;
        for entry in WalkDir::new(src).follow_links(false).sort_by_file_name() {
            let entry = entry.with_context(|| format!("Failed to walk '{}'", src.display()))?;
            let relative = entry.path().strip_prefix(src)?;
            let target = dst.join(relative);
            let file_type = entry.file_type();

            if file_type.is_dir() {
                self.journal.ensure_dir(&target)?;
            } else if file_type.is_symlink() {
                let link = fs::read_link(entry.path())?;
                if self.journal.owns(&target) {
                    continue;
                }
                if fs::symlink_metadata(&target).is_ok() {
                    if !self.params.overwrite {
                        bail!("destination '{}' already exists", target.display());
                    }
                    continue;
                }
                std::os::unix::fs::symlink(&link, &target).with_context(|| {
                    format!("Failed to recreate link '{}'", target.display())
                })?;
                self.journal.record_created(target);
            } else {
                self.copy_file(entry.path(), &target)?;
                copied += 1;
            }
        }
        Ok(copied)
    }
}

impl Task for CopyTask {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &str {
        "copy"
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.params.source.is_empty() {
            bail!("source is required");
        }
        if self.params.destination.is_empty() {
            bail!("destination is required");
        }
        Ok(())
    }

    fn execute(&mut self, ctx: &InstallContext, _bus: &EventBus) -> anyhow::Result<()> {
        let src = PathBuf::from(&self.params.source);
        let dst = PathBuf::from(&self.params.destination);

        let meta = fs::metadata(&src)
            .with_context(|| format!("source '{}' is not accessible", src.display()))?;

        if meta.is_dir() {
            let copied = self.copy_tree(&src, &dst)?;
            ctx.add_log(
                LogLevel::Info,
                format!("Copied {} file(s) from {} to {}", copied, src.display(), dst.display()),
            );
        } else {
            if let Some(parent) = dst.parent() {
                self.journal.ensure_dir(parent)?;
            }
            self.copy_file(&src, &dst)?;
            ctx.add_log(
                LogLevel::Info,
                format!("Copied {} to {}", src.display(), dst.display()),
            );
        }
        Ok(())
    }

    fn can_rollback(&self) -> bool {
        true
    }

    fn rollback(&mut self, ctx: &InstallContext, _bus: &EventBus) -> anyhow::Result<()> {
        self.journal.undo()?;
        ctx.add_log(
            LogLevel::Info,
            format!("Removed copy of {}", self.params.source),
        );
        Ok(())
    }
}

/// `"0755"`, `"755"`, `"0o755"` or a number (interpreted as already decoded)
pub(crate) fn parse_mode(value: &Value) -> Option<u32> {
    let mode = match value {
        Value::Number(n) => n.as_u64().and_then(|m| u32::try_from(m).ok()),
        Value::String(s) => {
            let s = s.trim();
            let digits = s.strip_prefix("0o").unwrap_or(s);
            u32::from_str_radix(digits, 8).ok()
        }
        _ => None,
    };
    mode.filter(|mode| *mode <= 0o7777)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn copy_config(src: &Path, dst: &Path) -> TaskConfig {
        TaskConfig::new("copy")
            .with_id("test-copy")
            .with_param("source", src.to_string_lossy().to_string())
            .with_param("destination", dst.to_string_lossy().to_string())
    }

    #[test]
    fn test_validate_requires_paths() {
        let ctx = InstallContext::new();
        let task = CopyTask::from_config(
            &TaskConfig::new("copy").with_param("destination", "/tmp/dst"),
            &ctx,
        )
        .expect("build");
        assert_eq!(task.validate().unwrap_err().to_string(), "source is required");

        let task =
            CopyTask::from_config(&TaskConfig::new("copy").with_param("source", "/tmp/src"), &ctx)
                .expect("build");
        assert_eq!(
            task.validate().unwrap_err().to_string(),
            "destination is required"
        );
    }

    #[test]
    fn test_parse_mode() {
        assert_eq!(parse_mode(&json!("0755")), Some(0o755));
        assert_eq!(parse_mode(&json!("644")), Some(0o644));
        assert_eq!(parse_mode(&json!("0o600")), Some(0o600));
        assert_eq!(parse_mode(&json!(420)), Some(0o644));
        assert_eq!(parse_mode(&json!("rwx")), None);
        assert_eq!(parse_mode(&json!("99999")), None);
    }

    #[test]
    fn test_invalid_mode_is_config_error() {
        let ctx = InstallContext::new();
        let config = copy_config(Path::new("/a"), Path::new("/b")).with_param("mode", "bogus");
        let err = CopyTask::from_config(&config, &ctx).unwrap_err();
        assert!(matches!(err, InstallError::Config(_)));
    }

    #[test]
    fn test_copy_file_with_mode() {
        let dir = TempDir::new().expect("tempdir");
        let src = dir.path().join("source.txt");
        let dst = dir.path().join("nested/dest.txt");
        fs::write(&src, "test content").expect("write");

        let ctx = InstallContext::new();
        let config = copy_config(&src, &dst).with_param("mode", "0600");
        let mut task = CopyTask::from_config(&config, &ctx).expect("build");
        task.execute(&ctx, &EventBus::new()).expect("execute");

        assert_eq!(fs::read_to_string(&dst).expect("read"), "test content");
        let mode = fs::metadata(&dst).expect("meta").permissions().mode() & 0o7777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn test_copy_directory_tree() {
        let dir = TempDir::new().expect("tempdir");
        let src = dir.path().join("source");
        let dst = dir.path().join("dest");
        fs::create_dir_all(src.join("subdir")).expect("mkdir");
        fs::write(src.join("file1.txt"), "content1").expect("write");
        fs::write(src.join("subdir/file2.txt"), "content2").expect("write");

        let ctx = InstallContext::new();
        let mut task = CopyTask::from_config(&copy_config(&src, &dst), &ctx).expect("build");
        task.execute(&ctx, &EventBus::new()).expect("execute");

        assert_eq!(fs::read_to_string(dst.join("file1.txt")).expect("read"), "content1");
        assert_eq!(
            fs::read_to_string(dst.join("subdir/file2.txt")).expect("read"),
            "content2"
        );
    }

    #[test]
    fn test_existing_destination_requires_overwrite() {
        let dir = TempDir::new().expect("tempdir");
        let src = dir.path().join("source.txt");
        let dst = dir.path().join("dest.txt");
        fs::write(&src, "new content").expect("write");
        fs::write(&dst, "old content").expect("write");

        let ctx = InstallContext::new();
        let bus = EventBus::new();
        let mut task = CopyTask::from_config(&copy_config(&src, &dst), &ctx).expect("build");
        assert!(task.execute(&ctx, &bus).is_err());
        assert_eq!(fs::read_to_string(&dst).expect("read"), "old content");

        let config = copy_config(&src, &dst).with_param("overwrite", true);
        let mut task = CopyTask::from_config(&config, &ctx).expect("build");
        task.execute(&ctx, &bus).expect("execute");
        assert_eq!(fs::read_to_string(&dst).expect("read"), "new content");

        task.rollback(&ctx, &bus).expect("rollback");
        assert_eq!(fs::read_to_string(&dst).expect("read"), "old content");
    }

    #[test]
    fn test_rollback_removes_created_tree() {
        let dir = TempDir::new().expect("tempdir");
        let src = dir.path().join("source");
        let dst = dir.path().join("out/dest");
        fs::create_dir_all(src.join("a/b")).expect("mkdir");
        fs::write(src.join("a/b/file.txt"), "x").expect("write");

        let ctx = InstallContext::new();
        let bus = EventBus::new();
        let mut task = CopyTask::from_config(&copy_config(&src, &dst), &ctx).expect("build");
        assert!(task.can_rollback());
        task.execute(&ctx, &bus).expect("execute");
        assert!(dst.join("a/b/file.txt").exists());

        task.rollback(&ctx, &bus).expect("rollback");
        assert!(!dir.path().join("out").exists());
        assert!(src.join("a/b/file.txt").exists());
    }

    #[test]
    fn test_retry_after_partial_copy() {
        let dir = TempDir::new().expect("tempdir");
        let src = dir.path().join("source");
        let dst = dir.path().join("dest");
        fs::create_dir_all(&src).expect("mkdir");
        fs::create_dir_all(&dst).expect("mkdir");
        fs::write(src.join("a.txt"), "a").expect("write");
        fs::write(src.join("b.txt"), "b").expect("write");
        fs::write(dst.join("b.txt"), "in the way").expect("write");

        let ctx = InstallContext::new();
        let bus = EventBus::new();
        let mut task = CopyTask::from_config(&copy_config(&src, &dst), &ctx).expect("build");

        // First attempt copies a.txt, then stops at the blocker
        let err = task.execute(&ctx, &bus).unwrap_err();
        assert!(err.to_string().contains("b.txt"), "got: {err}");
        assert!(dst.join("a.txt").exists());

        fs::remove_file(dst.join("b.txt")).expect("clear blocker");
        task.execute(&ctx, &bus).expect("second attempt");
        assert_eq!(fs::read_to_string(dst.join("a.txt")).expect("read"), "a");
        assert_eq!(fs::read_to_string(dst.join("b.txt")).expect("read"), "b");

        task.rollback(&ctx, &bus).expect("rollback");
        assert!(!dst.join("a.txt").exists());
        assert!(!dst.join("b.txt").exists());
        assert!(dst.exists());
    }

    #[test]
    fn test_missing_source_fails() {
        let dir = TempDir::new().expect("tempdir");
        let ctx = InstallContext::new();
        let mut task = CopyTask::from_config(
            &copy_config(&dir.path().join("nonexistent"), &dir.path().join("dest")),
            &ctx,
        )
        .expect("build");
        let err = task.execute(&ctx, &EventBus::new()).unwrap_err();
        assert!(err.to_string().contains("not accessible"));
    }
}
