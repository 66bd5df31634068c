//! Record of filesystem changes made by a task, so they can be undone.
//!
//! A journal spans retries: a path written by an earlier attempt is treated
//! as the task's own and may be overwritten without another backup.

use anyhow::{Context, bail};
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

#[derive(Debug, Default)]
pub(crate) struct FileJournal {
    created_dirs: Vec<PathBuf>,
    created_files: Vec<PathBuf>,
    replaced: Vec<(PathBuf, Vec<u8>, u32)>,
}

impl FileJournal {
    /// Written by an earlier attempt of this task
    pub(crate) fn owns(&self, path: &Path) -> bool {
        self.created_files.iter().any(|p| p == path)
            || self.replaced.iter().any(|(p, _, _)| p == path)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.created_dirs.is_empty() && self.created_files.is_empty() && self.replaced.is_empty()
    }

    pub(crate) fn created_files(&self) -> &[PathBuf] {
        &self.created_files
    }

    /// Create `dir` and any missing ancestors, recording each one
    pub(crate) fn ensure_dir(&mut self, dir: &Path) -> anyhow::Result<()> {
        let mut missing = Vec::new();
        let mut cursor = Some(dir);
        while let Some(path) = cursor {
            if path.as_os_str().is_empty() || path.exists() {
                break;
            }
            missing.push(path.to_path_buf());
            cursor = path.parent();
        }
        for path in missing.into_iter().rev() {
            fs::create_dir(&path)
                .with_context(|| format!("Failed to create directory '{}'", path.display()))?;
            self.created_dirs.push(path);
        }
        Ok(())
    }

    /// Journal `dst` before its first write. An existing regular file is
    /// backed up when `overwrite` is set and refused otherwise.
    pub(crate) fn record_target(&mut self, dst: &Path, overwrite: bool) -> anyhow::Result<()> {
        if self.owns(dst) {
            return Ok(());
        }
        match fs::symlink_metadata(dst) {
            Ok(_) if !overwrite => bail!("destination '{}' already exists", dst.display()),
            Ok(meta) if meta.is_dir() => bail!("destination '{}' is a directory", dst.display()),
            Ok(meta) if meta.is_file() => {
                let previous = fs::read(dst)
                    .with_context(|| format!("Failed to back up '{}'", dst.display()))?;
                self.replaced
                    .push((dst.to_path_buf(), previous, meta.permissions().mode()));
            }
            // An overwritten link is not restored
            Ok(_) => {}
            Err(_) => self.created_files.push(dst.to_path_buf()),
        }
        Ok(())
    }

    /// Record a path created outside `record_target`, e.g. a symlink
    pub(crate) fn record_created(&mut self, path: PathBuf) {
        self.created_files.push(path);
    }

    /// Restore replaced files, then remove created files and directories,
    /// newest first. The journal is empty afterwards, even on error.
    pub(crate) fn undo(&mut self) -> anyhow::Result<()> {
        let journal = std::mem::take(self);

        for (path, content, mode) in journal.replaced.into_iter().rev() {
            fs::write(&path, content)
                .with_context(|| format!("Failed to restore '{}'", path.display()))?;
            fs::set_permissions(&path, fs::Permissions::from_mode(mode))?;
        }
        for path in journal.created_files.iter().rev() {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to remove '{}'", path.display()));
                }
            }
        }
        for dir in journal.created_dirs.iter().rev() {
            // Leave directories that picked up foreign content
            if let Err(e) = fs::remove_dir(dir) {
                tracing::debug!("Keeping directory {}: {}", dir.display(), e);
            }
        }
        Ok(())
    }
}
