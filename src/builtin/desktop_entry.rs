//! `desktopEntry` and `removeDesktopEntry` tasks: freedesktop.org launcher
//! files.
//!
//! Without an explicit destination the entry goes to
//! `/usr/share/applications` when running as root, else to
//! `~/.local/share/applications`. The file name is derived from the entry
//! name: `"Demo App"` becomes `demo-app.desktop`.

use anyhow::{Context, bail};
use serde::Deserialize;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use super::journal::FileJournal;
use crate::config::TaskConfig;
use crate::context::{InstallContext, LogLevel};
use crate::error::Result;
use crate::events::EventBus;
use crate::task::Task;

pub const SYSTEM_APPLICATIONS_DIR: &str = "/usr/share/applications";

/// `~/.local/share/applications`, relative to `home`
fn user_applications_dir(home: &Path) -> PathBuf {
    home.join(".local/share/applications")
}

/// Where entries go for this user
fn default_applications_dir(is_root: bool, home: Option<PathBuf>) -> Option<PathBuf> {
    if is_root {
        Some(PathBuf::from(SYSTEM_APPLICATIONS_DIR))
    } else {
        home.map(|home| user_applications_dir(&home))
    }
}

/// `"Demo App"` -> `demo-app.desktop`
pub fn desktop_file_name(name: &str) -> String {
    let slug = name
        .split_whitespace()
        .map(|word| word.replace('/', "").to_lowercase())
        .filter(|word| !word.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    format!("{slug}.desktop")
}

/// `a;b;` as used by list-valued keys
fn join_list(items: &[String]) -> String {
    items.iter().map(|item| format!("{item};")).collect()
}

fn default_entry_type() -> String {
    "Application".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DesktopEntryParams {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub exec: String,
    #[serde(default)]
    pub icon: String,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub terminal: bool,
    #[serde(default = "default_entry_type", rename = "type")]
    pub entry_type: String,
    #[serde(default, alias = "mimeType")]
    pub mime_types: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Full path of the `.desktop` file
    #[serde(default, alias = "path")]
    pub destination: String,
}

#[derive(Debug)]
pub struct DesktopEntryTask {
    id: String,
    params: DesktopEntryParams,
    journal: FileJournal,
}

impl DesktopEntryTask {
    pub fn from_config(config: &TaskConfig, ctx: &InstallContext) -> Result<Self> {
        let params: DesktopEntryParams = config.decode_rendered(ctx)?;
        Ok(Self {
            id: super::task_id(config, "desktopEntry", ""),
            params,
            journal: FileJournal::default(),
        })
    }

    /// File contents in desktop entry syntax
    pub fn render(&self) -> String {
        let p = &self.params;
        let mut lines = vec![
            "[Desktop Entry]".to_string(),
            format!("Type={}", p.entry_type),
            format!("Name={}", p.name),
        ];
        if !p.comment.is_empty() {
            lines.push(format!("Comment={}", p.comment));
        }
        lines.push(format!("Exec={}", p.exec));
        if !p.icon.is_empty() {
            lines.push(format!("Icon={}", p.icon));
        }
        lines.push(format!("Terminal={}", p.terminal));
        if !p.categories.is_empty() {
            lines.push(format!("Categories={}", join_list(&p.categories)));
        }
        if !p.mime_types.is_empty() {
            lines.push(format!("MimeType={}", join_list(&p.mime_types)));
        }
        if !p.keywords.is_empty() {
            lines.push(format!("Keywords={}", join_list(&p.keywords)));
        }
        let mut text = lines.join("\n");
        text.push('\n');
        text
    }

    fn destination(&self, ctx: &InstallContext) -> anyhow::Result<PathBuf> {
        if !self.params.destination.is_empty() {
            return Ok(PathBuf::from(&self.params.destination));
        }
        let dir = default_applications_dir(ctx.env().is_root, home::home_dir())
            .context("cannot locate the applications directory: no home directory")?;
        Ok(dir.join(desktop_file_name(&self.params.name)))
    }
}

impl Task for DesktopEntryTask {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &str {
        "desktopEntry"
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.params.name.trim().is_empty() {
            bail!("name is required");
        }
        if self.params.exec.trim().is_empty() {
            bail!("exec is required");
        }
        Ok(())
    }

    fn execute(&mut self, ctx: &InstallContext, _bus: &EventBus) -> anyhow::Result<()> {
        let path = self.destination(ctx)?;
        if let Some(parent) = path.parent() {
            self.journal.ensure_dir(parent)?;
        }
        self.journal.record_target(&path, true)?;
        fs::write(&path, self.render())
            .with_context(|| format!("Failed to write '{}'", path.display()))?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644))?;

        ctx.add_log(
            LogLevel::Info,
            format!("Created desktop entry {}", path.display()),
        );
        Ok(())
    }

    fn can_rollback(&self) -> bool {
        true
    }

    fn rollback(&mut self, ctx: &InstallContext, _bus: &EventBus) -> anyhow::Result<()> {
        self.journal.undo()?;
        ctx.add_log(
            LogLevel::Info,
            format!("Removed desktop entry for {}", self.params.name),
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RemoveDesktopEntryParams {
    #[serde(default)]
    pub name: String,
    /// Exact file to remove instead of searching by name
    #[serde(default, alias = "destination")]
    pub path: String,
}

#[derive(Debug)]
pub struct RemoveDesktopEntryTask {
    id: String,
    params: RemoveDesktopEntryParams,
    /// Searched in order when only a name is given
    search_dirs: Vec<PathBuf>,
    removed: Vec<(PathBuf, Vec<u8>, u32)>,
}

impl RemoveDesktopEntryTask {
    pub fn from_config(config: &TaskConfig, ctx: &InstallContext) -> Result<Self> {
        let params: RemoveDesktopEntryParams = config.decode_rendered(ctx)?;
        let mut search_dirs: Vec<PathBuf> = home::home_dir()
            .map(|home| user_applications_dir(&home))
            .into_iter()
            .collect();
        // Only root can remove system-wide entries
        if ctx.env().is_root {
            search_dirs.push(PathBuf::from(SYSTEM_APPLICATIONS_DIR));
        }
        Ok(Self {
            id: super::task_id(config, "removeDesktopEntry", ""),
            params,
            search_dirs,
            removed: Vec::new(),
        })
    }

    fn candidates(&self) -> Vec<PathBuf> {
        if !self.params.path.is_empty() {
            return vec![PathBuf::from(&self.params.path)];
        }
        let file_name = desktop_file_name(&self.params.name);
        self.search_dirs.iter().map(|dir| dir.join(&file_name)).collect()
    }
}

impl Task for RemoveDesktopEntryTask {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &str {
        "removeDesktopEntry"
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.params.name.trim().is_empty() && self.params.path.is_empty() {
            bail!("name or path is required");
        }
        Ok(())
    }

    fn execute(&mut self, ctx: &InstallContext, _bus: &EventBus) -> anyhow::Result<()> {
        let mut found = false;
        for path in self.candidates() {
            let meta = match fs::symlink_metadata(&path) {
                Ok(meta) => meta,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to inspect '{}'", path.display()));
                }
            };
            let content = fs::read(&path)
                .with_context(|| format!("Failed to back up '{}'", path.display()))?;
            fs::remove_file(&path)
                .with_context(|| format!("Failed to remove '{}'", path.display()))?;
            ctx.add_log(
                LogLevel::Info,
                format!("Removed desktop entry {}", path.display()),
            );
            self.removed.push((path, content, meta.permissions().mode()));
            found = true;
        }
        if !found {
            ctx.add_log(
                LogLevel::Debug,
                format!("No desktop entry found for '{}'", self.params.name),
            );
        }
        Ok(())
    }

    fn can_rollback(&self) -> bool {
        true
    }

    fn rollback(&mut self, ctx: &InstallContext, _bus: &EventBus) -> anyhow::Result<()> {
        for (path, content, mode) in std::mem::take(&mut self.removed).into_iter().rev() {
            fs::write(&path, content)
                .with_context(|| format!("Failed to restore '{}'", path.display()))?;
            fs::set_permissions(&path, fs::Permissions::from_mode(mode))?;
            ctx.add_log(LogLevel::Info, format!("Restored {}", path.display()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn entry(path: &Path) -> TaskConfig {
        TaskConfig::new("desktopEntry")
            .with_id("test-desktop")
            .with_param("name", "My App")
            .with_param("exec", "/usr/bin/myapp %U")
            .with_param("destination", path.to_string_lossy().to_string())
    }

    #[test]
    fn test_validate() {
        let ctx = InstallContext::new();
        let task = DesktopEntryTask::from_config(
            &TaskConfig::new("desktopEntry").with_param("exec", "/usr/bin/myapp"),
            &ctx,
        )
        .expect("build");
        assert_eq!(task.validate().unwrap_err().to_string(), "name is required");

        let task = DesktopEntryTask::from_config(
            &TaskConfig::new("desktopEntry").with_param("name", "My App"),
            &ctx,
        )
        .expect("build");
        assert_eq!(task.validate().unwrap_err().to_string(), "exec is required");

        let task = RemoveDesktopEntryTask::from_config(&TaskConfig::new("removeDesktopEntry"), &ctx)
            .expect("build");
        assert!(task.validate().is_err());
    }

    #[test]
    fn test_desktop_file_name() {
        assert_eq!(desktop_file_name("Demo App"), "demo-app.desktop");
        assert_eq!(desktop_file_name("  Tool  "), "tool.desktop");
        assert_eq!(desktop_file_name("A/B Suite"), "ab-suite.desktop");
    }

    #[test]
    fn test_default_applications_dir() {
        let home = PathBuf::from("/home/demo");
        assert_eq!(
            default_applications_dir(false, Some(home.clone())),
            Some(PathBuf::from("/home/demo/.local/share/applications"))
        );
        assert_eq!(
            default_applications_dir(true, Some(home)),
            Some(PathBuf::from(SYSTEM_APPLICATIONS_DIR))
        );
        assert_eq!(default_applications_dir(false, None), None);
    }

    #[test]
    fn test_write_full_entry() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("apps/myapp.desktop");
        let ctx = InstallContext::new();
        ctx.set("icon.dir", "/usr/share/icons");
        let config = entry(&path)
            .with_param("icon", "${icon.dir}/myapp.png")
            .with_param("comment", "A test application")
            .with_param("categories", json!(["Development", "Utility"]))
            .with_param("mimeTypes", json!(["text/plain"]))
            .with_param("keywords", json!(["app", "test"]));

        let mut task = DesktopEntryTask::from_config(&config, &ctx).expect("build");
        task.validate().expect("valid");
        task.execute(&ctx, &EventBus::new()).expect("execute");

        let content = fs::read_to_string(&path).expect("read");
        assert!(content.starts_with("[Desktop Entry]\n"));
        for line in [
            "Name=My App",
            "Exec=/usr/bin/myapp %U",
            "Icon=/usr/share/icons/myapp.png",
            "Comment=A test application",
            "Categories=Development;Utility;",
            "Terminal=false",
            "Type=Application",
            "MimeType=text/plain;",
            "Keywords=app;test;",
        ] {
            assert!(content.lines().any(|l| l == line), "missing {line}:\n{content}");
        }
    }

    #[test]
    fn test_minimal_entry_with_terminal() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("term.desktop");
        let ctx = InstallContext::new();
        let config = entry(&path).with_param("terminal", true);

        let mut task = DesktopEntryTask::from_config(&config, &ctx).expect("build");
        task.execute(&ctx, &EventBus::new()).expect("execute");

        let content = fs::read_to_string(&path).expect("read");
        assert!(content.contains("Terminal=true"));
        assert!(!content.contains("Icon="));
        assert!(!content.contains("Categories="));
    }

    #[test]
    fn test_rollback_removes_entry() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("share/applications/myapp.desktop");
        let ctx = InstallContext::new();
        let bus = EventBus::new();
        let mut task = DesktopEntryTask::from_config(&entry(&path), &ctx).expect("build");
        assert!(task.can_rollback());

        task.execute(&ctx, &bus).expect("execute");
        assert!(path.exists());
        task.rollback(&ctx, &bus).expect("rollback");
        assert!(!path.exists());
        assert!(!dir.path().join("share").exists());
    }

    #[test]
    fn test_remove_by_name_searches_dirs() {
        let dir = TempDir::new().expect("tempdir");
        let user = dir.path().join("user");
        let system = dir.path().join("system");
        fs::create_dir_all(&user).expect("mkdir");
        fs::create_dir_all(&system).expect("mkdir");
        fs::write(system.join("demo-app.desktop"), "[Desktop Entry]\n").expect("seed");

        let ctx = InstallContext::new();
        let bus = EventBus::new();
        let config = TaskConfig::new("removeDesktopEntry").with_param("name", "Demo App");
        let mut task = RemoveDesktopEntryTask::from_config(&config, &ctx).expect("build");
        task.search_dirs = vec![user.clone(), system.clone()];

        task.validate().expect("valid");
        task.execute(&ctx, &bus).expect("execute");
        assert!(!system.join("demo-app.desktop").exists());

        task.rollback(&ctx, &bus).expect("rollback");
        assert_eq!(
            fs::read_to_string(system.join("demo-app.desktop")).expect("read"),
            "[Desktop Entry]\n"
        );
    }

    #[test]
    fn test_remove_explicit_path_and_missing_entry() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("custom.desktop");
        fs::write(&path, "x").expect("seed");

        let ctx = InstallContext::new();
        let bus = EventBus::new();
        let config = TaskConfig::new("removeDesktopEntry")
            .with_param("path", path.to_string_lossy().to_string());
        let mut task = RemoveDesktopEntryTask::from_config(&config, &ctx).expect("build");
        task.execute(&ctx, &bus).expect("execute");
        assert!(!path.exists());

        // Already gone: nothing to do
        let mut again = RemoveDesktopEntryTask::from_config(&config, &ctx).expect("build");
        again.execute(&ctx, &bus).expect("execute");
        again.rollback(&ctx, &bus).expect("rollback");
        assert!(!path.exists());
    }
}
