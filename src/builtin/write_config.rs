//! `writeConfig` task: write a configuration file.
//!
//! String content is written verbatim. Any other value is serialized in the
//! file's format: YAML for `.yaml`/`.yml`, pretty-printed JSON otherwise.
//! An explicit `format` overrides the extension. Rollback puts back the
//! previous file, or removes the file if it did not exist before.

use anyhow::{Context, bail};
use serde::Deserialize;
use serde_json::Value;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use strum::Display;

use super::copy::parse_mode;
use crate::config::TaskConfig;
use crate::context::{InstallContext, LogLevel};
use crate::error::{InstallError, Result};
use crate::events::EventBus;
use crate::task::Task;

/// Serialization of non-string content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ConfigFormat {
    Json,
    Yaml,
    Text,
}

impl ConfigFormat {
    /// `.json` is JSON, `.yaml`/`.yml` is YAML, anything else is text
    pub fn detect(path: &Path) -> Self {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match extension.as_deref() {
            Some("json") => Self::Json,
            Some("yaml" | "yml") => Self::Yaml,
            _ => Self::Text,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WriteConfigParams {
    #[serde(default, alias = "destination")]
    pub path: String,
    #[serde(default)]
    pub content: Value,
    #[serde(default)]
    pub format: Option<ConfigFormat>,
    #[serde(default)]
    pub mode: Option<Value>,
}

/// State of the target before `execute`
#[derive(Debug)]
enum Previous {
    Missing,
    Existing { content: Vec<u8>, mode: u32 },
}

#[derive(Debug)]
pub struct WriteConfigTask {
    id: String,
    params: WriteConfigParams,
    format: ConfigFormat,
    mode: Option<u32>,
    previous: Option<Previous>,
}

impl WriteConfigTask {
    pub fn from_config(config: &TaskConfig, ctx: &InstallContext) -> Result<Self> {
        let params: WriteConfigParams = config.decode_rendered(ctx)?;
        let mode = match &params.mode {
            None | Some(Value::Null) => None,
            Some(value) => Some(parse_mode(value).ok_or_else(|| {
                InstallError::config(format!(
                    "task '{}' (writeConfig): invalid mode {}",
                    config.display_id(),
                    value
                ))
            })?),
        };
        let format = params
            .format
            .unwrap_or_else(|| ConfigFormat::detect(Path::new(&params.path)));
        Ok(Self {
            id: super::task_id(config, "writeConfig", ""),
            params,
            format,
            mode,
            previous: None,
        })
    }

    pub fn format(&self) -> ConfigFormat {
        self.format
    }

    /// Bytes that `execute` writes
    pub fn rendered_content(&self) -> anyhow::Result<Vec<u8>> {
        match (&self.params.content, self.format) {
            (Value::String(text), _) => Ok(text.clone().into_bytes()),
            (value, ConfigFormat::Yaml) => Ok(serde_yaml::to_string(value)?.into_bytes()),
            (value, ConfigFormat::Json | ConfigFormat::Text) => {
                let mut text = serde_json::to_string_pretty(value)?;
                text.push('\n');
                Ok(text.into_bytes())
            }
        }
    }
}

impl Task for WriteConfigTask {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &str {
        "writeConfig"
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.params.path.is_empty() {
            bail!("path is required");
        }
        if self.params.content.is_null() {
            bail!("content is required");
        }
        Ok(())
    }

    fn execute(&mut self, ctx: &InstallContext, _bus: &EventBus) -> anyhow::Result<()> {
        let path = PathBuf::from(&self.params.path);
        let content = self.rendered_content()?;

        let previous = match fs::symlink_metadata(&path) {
            Ok(meta) if meta.is_dir() => bail!("'{}' is a directory", path.display()),
            Ok(meta) => Previous::Existing {
                content: fs::read(&path)
                    .with_context(|| format!("Failed to back up '{}'", path.display()))?,
                mode: meta.permissions().mode(),
            },
            Err(_) => Previous::Missing,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create '{}'", parent.display()))?;
        }
        fs::write(&path, &content)
            .with_context(|| format!("Failed to write '{}'", path.display()))?;
        if let Some(mode) = self.mode {
            fs::set_permissions(&path, fs::Permissions::from_mode(mode))?;
        }
        self.previous = Some(previous);

        ctx.add_log(
            LogLevel::Info,
            format!("Wrote {} ({}, {} bytes)", path.display(), self.format, content.len()),
        );
        Ok(())
    }

    fn can_rollback(&self) -> bool {
        true
    }

    fn rollback(&mut self, ctx: &InstallContext, _bus: &EventBus) -> anyhow::Result<()> {
        let path = PathBuf::from(&self.params.path);
        match self.previous.take() {
            None => {}
            Some(Previous::Missing) => match fs::remove_file(&path) {
                Ok(()) => ctx.add_log(LogLevel::Info, format!("Removed {}", path.display())),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to remove '{}'", path.display()));
                }
            },
            Some(Previous::Existing { content, mode }) => {
                fs::write(&path, content)
                    .with_context(|| format!("Failed to restore '{}'", path.display()))?;
                fs::set_permissions(&path, fs::Permissions::from_mode(mode))?;
                ctx.add_log(LogLevel::Info, format!("Restored {}", path.display()));
            }
        }
        Ok(())
    }
}
