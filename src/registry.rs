//! Extension registries
//!
//! A `Registry` is a name→factory table. The three extension points of the
//! engine (tasks, guards, screens) each get one, bundled in `Registries`.
//! Registries are plain values owned by the application entry point and
//! handed to the workflow and runner; there is no process-global table.
//!
//! Type names arrive from configuration already decoded into a `TypeRef`,
//! which records whether the name was marked as externally supplied. The
//! marker is structural: lookups go through the same table either way.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use thiserror::Error;

use crate::config::{GuardConfig, ScreenConfig, TaskConfig};
use crate::context::InstallContext;
use crate::error::Result;
use crate::guard::Guard;
use crate::screen::Screen;
use crate::sync::{read, write};
use crate::task::Task;

/// Prefixes that mark a type name as externally supplied
const EXTENSION_MARKERS: [&str; 2] = ["go:", "ext:"];

/// Registry errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("{registry} type '{name}' is already registered")]
    Duplicate { registry: String, name: String },

    #[error("unknown {registry} type '{name}'")]
    Unknown { registry: String, name: String },

    #[error("type name must not be empty")]
    EmptyName,
}

/// A decoded type reference from configuration
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TypeRef {
    Builtin(String),
    Extension(String),
}

impl TypeRef {
    /// Parse a raw type string, recognizing the extension markers
    pub fn parse(raw: &str) -> std::result::Result<Self, RegistryError> {
        let raw = raw.trim();
        let parsed = match EXTENSION_MARKERS
            .iter()
            .find_map(|marker| raw.strip_prefix(marker))
        {
            Some(name) => TypeRef::Extension(name.trim().to_string()),
            None => TypeRef::Builtin(raw.to_string()),
        };
        if parsed.name().is_empty() {
            return Err(RegistryError::EmptyName);
        }
        Ok(parsed)
    }

    /// Registry key, with any extension marker removed
    pub fn name(&self) -> &str {
        match self {
            TypeRef::Builtin(name) | TypeRef::Extension(name) => name,
        }
    }

    pub fn is_extension(&self) -> bool {
        matches!(self, TypeRef::Extension(_))
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeRef::Builtin(name) => f.write_str(name),
            TypeRef::Extension(name) => write!(f, "ext:{name}"),
        }
    }
}

impl std::str::FromStr for TypeRef {
    type Err = RegistryError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for TypeRef {
    type Error = RegistryError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TypeRef> for String {
    fn from(value: TypeRef) -> Self {
        value.to_string()
    }
}

impl From<&str> for TypeRef {
    /// Infallible convenience for code-built configs; an empty name
    /// surfaces as an unknown type at lookup.
    fn from(value: &str) -> Self {
        Self::parse(value).unwrap_or_else(|_| TypeRef::Builtin(String::new()))
    }
}

/// Generic name→factory table
pub struct Registry<F: Clone> {
    kind: &'static str,
    entries: RwLock<BTreeMap<String, F>>,
}

impl<F: Clone> fmt::Debug for Registry<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("kind", &self.kind)
            .field("keys", &self.keys())
            .finish()
    }
}

impl<F: Clone> Registry<F> {
    /// Create an empty registry; `kind` names it in error messages
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    /// Register a factory. Fails if the name is already taken.
    pub fn register(&self, name: &str, factory: F) -> std::result::Result<(), RegistryError> {
        if name.is_empty() {
            return Err(RegistryError::EmptyName);
        }
        let mut entries = write(&self.entries);
        if entries.contains_key(name) {
            return Err(RegistryError::Duplicate {
                registry: self.kind.to_string(),
                name: name.to_string(),
            });
        }
        entries.insert(name.to_string(), factory);
        tracing::debug!("Registered {} type '{}'", self.kind, name);
        Ok(())
    }

    /// Register a factory, panicking on conflict.
    ///
    /// # Panics
    ///
    /// Panics if the name is empty or already registered. Meant for
    /// start-up wiring where a conflict is a programming error.
    pub fn must_register(&self, name: &str, factory: F) {
        if let Err(e) = self.register(name, factory) {
            panic!("{e}");
        }
    }

    pub fn get(&self, name: &str) -> Option<F> {
        read(&self.entries).get(name).cloned()
    }

    /// Resolve a decoded type reference
    pub fn lookup(&self, type_ref: &TypeRef) -> std::result::Result<F, RegistryError> {
        self.get(type_ref.name()).ok_or_else(|| RegistryError::Unknown {
            registry: self.kind.to_string(),
            name: type_ref.to_string(),
        })
    }

    pub fn has(&self, name: &str) -> bool {
        read(&self.entries).contains_key(name)
    }

    /// Registered names in sorted order
    pub fn keys(&self) -> Vec<String> {
        read(&self.entries).keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        read(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        read(&self.entries).is_empty()
    }

    pub fn clear(&self) {
        write(&self.entries).clear();
    }
}

/// Builds a task bound to the session context. String parameters are
/// rendered through the context here, not at execution time.
pub type TaskFactory =
    Arc<dyn Fn(&TaskConfig, &InstallContext) -> Result<Box<dyn Task>> + Send + Sync>;

/// Builds a guard; malformed configuration fails here, not in `check`
pub type GuardFactory = Arc<dyn Fn(&GuardConfig) -> Result<Box<dyn Guard>> + Send + Sync>;

pub type ScreenFactory = Arc<dyn Fn(&ScreenConfig) -> Result<Box<dyn Screen>> + Send + Sync>;

/// The engine's three extension points
#[derive(Debug)]
pub struct Registries {
    pub tasks: Registry<TaskFactory>,
    pub guards: Registry<GuardFactory>,
    pub screens: Registry<ScreenFactory>,
}

impl Default for Registries {
    fn default() -> Self {
        Self::new()
    }
}

impl Registries {
    /// Empty registries
    pub fn new() -> Self {
        Self {
            tasks: Registry::new("task"),
            guards: Registry::new("guard"),
            screens: Registry::new("screen"),
        }
    }

    /// Registries pre-populated with the built-in guards, screens and tasks
    pub fn with_builtins() -> Self {
        let registries = Self::new();
        crate::guard::register_builtin_guards(&registries.guards);
        crate::screen::register_builtin_screens(&registries.screens);
        crate::builtin::register_builtin_tasks(&registries.tasks);
        registries
    }

    pub fn register_task<F>(&self, name: &str, factory: F) -> std::result::Result<(), RegistryError>
    where
        F: Fn(&TaskConfig, &InstallContext) -> Result<Box<dyn Task>> + Send + Sync + 'static,
    {
        self.tasks.register(name, Arc::new(factory))
    }

    pub fn register_guard<F>(&self, name: &str, factory: F) -> std::result::Result<(), RegistryError>
    where
        F: Fn(&GuardConfig) -> Result<Box<dyn Guard>> + Send + Sync + 'static,
    {
        self.guards.register(name, Arc::new(factory))
    }

    pub fn register_screen<F>(&self, name: &str, factory: F) -> std::result::Result<(), RegistryError>
    where
        F: Fn(&ScreenConfig) -> Result<Box<dyn Screen>> + Send + Sync + 'static,
    {
        self.screens.register(name, Arc::new(factory))
    }

    /// Resolve and construct a task
    pub fn build_task(&self, config: &TaskConfig, ctx: &InstallContext) -> Result<Box<dyn Task>> {
        let factory = self.tasks.lookup(&config.kind)?;
        factory(config, ctx)
    }

    /// Resolve and construct a guard
    pub fn build_guard(&self, config: &GuardConfig) -> Result<Box<dyn Guard>> {
        let factory = self.guards.lookup(&config.kind)?;
        factory(config)
    }

    /// Resolve and construct a screen
    pub fn build_screen(&self, config: &ScreenConfig) -> Result<Box<dyn Screen>> {
        let factory = self.screens.lookup(&config.kind)?;
        factory(config)
    }
}
