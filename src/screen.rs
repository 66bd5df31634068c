//! Screen extension point
//!
//! Screens belong to the presentation layer; navigation never looks inside
//! them. The engine only needs two things from a screen: a registered type
//! (so unknown screens are caught when a flow is added) and the ability to
//! seed default answers into the context, which headless mode relies on.

use std::sync::Arc;

use crate::config::{FieldConfig, OptionConfig, ScreenConfig};
use crate::context::InstallContext;
use crate::error::{InstallError, Result};
use crate::registry::{Registry, ScreenFactory};

pub trait Screen: Send + Sync {
    fn kind(&self) -> &str;

    fn title(&self) -> &str;

    /// Write default answers for anything the user has not set yet
    fn apply_defaults(&self, _ctx: &InstallContext) -> Result<()> {
        Ok(())
    }
}

/// Screens with no input: welcome, summary, progress, finish
#[derive(Debug, Clone)]
pub struct InfoScreen {
    kind: &'static str,
    title: String,
}

impl InfoScreen {
    pub fn new(kind: &'static str, config: &ScreenConfig) -> Self {
        Self {
            kind,
            title: config.title.clone(),
        }
    }
}

impl Screen for InfoScreen {
    fn kind(&self) -> &str {
        self.kind
    }

    fn title(&self) -> &str {
        &self.title
    }
}

/// License text with an acceptance checkbox bound to a context path
#[derive(Debug, Clone)]
pub struct LicenseScreen {
    title: String,
    bind: String,
}

impl LicenseScreen {
    pub fn from_config(config: &ScreenConfig) -> Result<Self> {
        if config.content.is_empty() && config.content_file.is_empty() {
            tracing::debug!("License screen '{}' has no content", config.title);
        }
        let bind = if config.bind.is_empty() {
            "license.accepted".to_string()
        } else {
            config.bind.clone()
        };
        Ok(Self {
            title: config.title.clone(),
            bind,
        })
    }

    pub fn bind(&self) -> &str {
        &self.bind
    }
}

impl Screen for LicenseScreen {
    fn kind(&self) -> &str {
        "license"
    }

    fn title(&self) -> &str {
        &self.title
    }

    /// Acceptance is never implied; an unset answer becomes `false`
    fn apply_defaults(&self, ctx: &InstallContext) -> Result<()> {
        if !ctx.has_input(&self.bind) {
            ctx.set(&self.bind, false);
        }
        Ok(())
    }
}

/// Single choice between options, bound to a context path
#[derive(Debug, Clone)]
pub struct OptionsScreen {
    title: String,
    bind: String,
    options: Vec<OptionConfig>,
}

impl OptionsScreen {
    pub fn from_config(config: &ScreenConfig) -> Result<Self> {
        if config.bind.is_empty() {
            return Err(InstallError::config(format!(
                "options screen '{}' needs a 'bind' path",
                config.title
            )));
        }
        if config.options.is_empty() {
            return Err(InstallError::config(format!(
                "options screen '{}' has no options",
                config.title
            )));
        }
        Ok(Self {
            title: config.title.clone(),
            bind: config.bind.clone(),
            options: config.options.clone(),
        })
    }

    /// The option marked default, or the first one
    pub fn default_value(&self) -> Option<&str> {
        self.options
            .iter()
            .find(|o| o.default)
            .or_else(|| self.options.first())
            .map(|o| o.value.as_str())
    }
}

impl Screen for OptionsScreen {
    fn kind(&self) -> &str {
        "options"
    }

    fn title(&self) -> &str {
        &self.title
    }

    fn apply_defaults(&self, ctx: &InstallContext) -> Result<()> {
        if ctx.has_input(&self.bind) {
            return Ok(());
        }
        if let Some(value) = self.default_value() {
            ctx.set(&self.bind, value);
        }
        Ok(())
    }
}

/// Input form; each field writes to its own context path
#[derive(Debug, Clone)]
pub struct FormScreen {
    title: String,
    fields: Vec<FieldConfig>,
}

impl FormScreen {
    pub fn from_config(config: &ScreenConfig) -> Result<Self> {
        if let Some(field) = config.fields.iter().find(|f| f.variable.trim().is_empty()) {
            return Err(InstallError::config(format!(
                "form screen '{}': field '{}' has no variable",
                config.title, field.label
            )));
        }
        Ok(Self {
            title: config.title.clone(),
            fields: config.fields.clone(),
        })
    }
}

impl Screen for FormScreen {
    fn kind(&self) -> &str {
        "form"
    }

    fn title(&self) -> &str {
        &self.title
    }

    fn apply_defaults(&self, ctx: &InstallContext) -> Result<()> {
        for field in &self.fields {
            if ctx.has_input(&field.variable) {
                continue;
            }
            let Some(default) = &field.default else {
                continue;
            };
            let rendered = ctx.render(default);
            if field.kind == "checkbox" {
                ctx.set(&field.variable, rendered.trim().eq_ignore_ascii_case("true"));
            } else {
                ctx.set(&field.variable, rendered);
            }
        }
        Ok(())
    }
}

/// Register the built-in screen kinds
pub fn register_builtin_screens(registry: &Registry<ScreenFactory>) {
    for kind in ["welcome", "summary", "progress", "finish"] {
        registry.must_register(
            kind,
            Arc::new(move |c: &ScreenConfig| Ok(Box::new(InfoScreen::new(kind, c)) as Box<dyn Screen>)),
        );
    }
    registry.must_register(
        "license",
        Arc::new(|c: &ScreenConfig| Ok(Box::new(LicenseScreen::from_config(c)?) as Box<dyn Screen>)),
    );
    registry.must_register(
        "options",
        Arc::new(|c: &ScreenConfig| Ok(Box::new(OptionsScreen::from_config(c)?) as Box<dyn Screen>)),
    );
    registry.must_register(
        "form",
        Arc::new(|c: &ScreenConfig| Ok(Box::new(FormScreen::from_config(c)?) as Box<dyn Screen>)),
    );
}
