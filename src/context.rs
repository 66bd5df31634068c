//! Shared install context
//!
//! The `InstallContext` is the single piece of state shared between the
//! navigation caller (UI or headless loop) and the task runner. It holds:
//!
//! - **User input**: answers keyed by dotted path (`license.accepted`,
//!   `install.dir`), materialized as nested JSON objects on write
//! - **Meta**: product/build metadata, a separate namespace from user input
//! - **Env**: the environment-detection snapshot written by preflight
//! - **Runtime**: current flow/step, completion flag, logs, errors, progress
//!
//! Every accessor takes the store's read/write lock, so the context can be
//! shared behind an `Arc` and mutated from event handlers running inside
//! `EventBus::publish` as well as from the runner's execution loop.

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, LazyLock, Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};
use strum::{Display, EnumString};

use crate::error::Result;
use crate::events::EventBus;
use crate::sync::{lock, read, write};

/// Matches `${path}` placeholders in templates
static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([^}]+)\}").unwrap_or_else(|e| panic!("invalid placeholder regex: {e}"))
});

/// Severity of a runtime log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[derive(Display, EnumString)]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// A single timestamped runtime log entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Seconds since UNIX epoch
    pub timestamp: u64,
    pub level: LogLevel,
    pub message: String,
}

impl LogEntry {
    fn new(level: LogLevel, message: String) -> Self {
        Self {
            timestamp: unix_now(),
            level,
            message,
        }
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}] {}", self.timestamp, self.level, self.message)
    }
}

/// Environment facts collected once by preflight.
///
/// Field names as seen from templates and guards are the camelCase forms
/// (`distro`, `distroVersion`, `diskFreeMB`, ...), reachable both bare and
/// with an `env.` prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvInfo {
    pub distro: String,
    pub distro_version: String,
    pub arch: String,
    pub desktop: String,
    pub is_root: bool,
    pub has_sudo: bool,
    pub has_polkit: bool,
    #[serde(rename = "diskFreeMB")]
    pub disk_free_mb: u64,
}

impl EnvInfo {
    /// Look up an environment field by its template name
    pub fn field(&self, name: &str) -> Option<Value> {
        let value = match name {
            "distro" => Value::from(self.distro.clone()),
            "distroVersion" => Value::from(self.distro_version.clone()),
            "arch" => Value::from(self.arch.clone()),
            "desktop" => Value::from(self.desktop.clone()),
            "isRoot" => Value::from(self.is_root),
            "hasSudo" => Value::from(self.has_sudo),
            "hasPolkit" => Value::from(self.has_polkit),
            "diskFreeMB" => Value::from(self.disk_free_mb),
            _ => return None,
        };
        Some(value)
    }
}

/// Runtime bookkeeping for the current session
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Runtime {
    pub flow_id: String,
    pub current_step: String,
    pub completed: bool,
    pub logs: Vec<LogEntry>,
    pub errors: Vec<String>,
    /// Overall progress fraction in `[0.0, 1.0]`
    pub progress: f64,
}

#[derive(Debug, Default)]
struct Store {
    user_input: Map<String, Value>,
    meta: Map<String, Value>,
    env: EnvInfo,
    runtime: Runtime,
}

impl Store {
    /// Resolve a path: user input, then meta, then environment fields
    fn lookup(&self, path: &str) -> Option<Value> {
        if let Some(value) = lookup_path(&self.user_input, path) {
            return Some(value.clone());
        }
        if let Some(value) = lookup_path(&self.meta, path) {
            return Some(value.clone());
        }
        if let Some(value) = path
            .strip_prefix("meta.")
            .and_then(|rest| lookup_path(&self.meta, rest))
        {
            return Some(value.clone());
        }
        self.env.field(path.strip_prefix("env.").unwrap_or(path))
    }
}

/// Shared, internally synchronized state for one installation session.
#[derive(Default)]
pub struct InstallContext {
    store: RwLock<Store>,
    log_file: Mutex<Option<File>>,
    bus: RwLock<Option<Arc<EventBus>>>,
}

impl fmt::Debug for InstallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let store = read(&self.store);
        f.debug_struct("InstallContext")
            .field("user_input", &store.user_input)
            .field("meta", &store.meta)
            .field("env", &store.env)
            .field("flow_id", &store.runtime.flow_id)
            .field("current_step", &store.runtime.current_step)
            .finish()
    }
}

impl InstallContext {
    /// Create an empty context
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // User input
    // ------------------------------------------------------------------

    /// Set a value at a dotted path, creating intermediate objects.
    ///
    /// A non-object value sitting on an intermediate segment is replaced.
    pub fn set(&self, path: &str, value: impl Into<Value>) {
        if path.is_empty() {
            return;
        }
        insert_path(&mut write(&self.store).user_input, path, value.into());
    }

    /// Get the value at a dotted path (user input, then meta, then env)
    pub fn get(&self, path: &str) -> Option<Value> {
        read(&self.store).lookup(path)
    }

    /// Returns true if any namespace resolves `path`
    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// Returns true if user input alone resolves `path`
    pub fn has_input(&self, path: &str) -> bool {
        lookup_path(&read(&self.store).user_input, path).is_some()
    }

    /// String at `path`, or `""` when absent or not a string
    pub fn get_string(&self, path: &str) -> String {
        match self.get(path) {
            Some(Value::String(s)) => s,
            _ => String::new(),
        }
    }

    /// Bool at `path`, or `false` when absent or not a bool
    pub fn get_bool(&self, path: &str) -> bool {
        matches!(self.get(path), Some(Value::Bool(true)))
    }

    /// Integer at `path`, or `0` when absent or not numeric.
    /// Floating point values are truncated toward zero.
    pub fn get_int(&self, path: &str) -> i64 {
        match self.get(path) {
            Some(Value::Number(n)) => number_to_i64(&n),
            _ => 0,
        }
    }

    /// Snapshot of all user input as a JSON object
    pub fn user_input(&self) -> Value {
        Value::Object(read(&self.store).user_input.clone())
    }

    // ------------------------------------------------------------------
    // Meta and environment
    // ------------------------------------------------------------------

    /// Set a metadata entry
    pub fn set_meta(&self, key: &str, value: impl Into<Value>) {
        if key.is_empty() {
            return;
        }
        write(&self.store).meta.insert(key.to_string(), value.into());
    }

    /// Get a metadata entry (meta namespace only)
    pub fn meta(&self, key: &str) -> Option<Value> {
        read(&self.store).meta.get(key).cloned()
    }

    /// Replace the environment snapshot
    pub fn set_env(&self, env: EnvInfo) {
        write(&self.store).env = env;
    }

    /// Mutate the environment snapshot in place
    pub fn update_env(&self, f: impl FnOnce(&mut EnvInfo)) {
        f(&mut write(&self.store).env);
    }

    /// Copy of the environment snapshot
    pub fn env(&self) -> EnvInfo {
        read(&self.store).env.clone()
    }

    // ------------------------------------------------------------------
    // Templates
    // ------------------------------------------------------------------

    /// Replace every `${path}` with the stringified value at `path`.
    ///
    /// Unresolvable placeholders are left verbatim so partially configured
    /// templates stay readable.
    pub fn render(&self, template: &str) -> String {
        if !template.contains("${") {
            return template.to_string();
        }
        let store = read(&self.store);
        PLACEHOLDER
            .replace_all(template, |caps: &Captures<'_>| {
                match store.lookup(caps[1].trim()) {
                    Some(value) => value_to_string(&value),
                    None => caps[0].to_string(),
                }
            })
            .into_owned()
    }

    /// Render every string inside a JSON value, recursively
    pub fn render_value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => Value::String(self.render(s)),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.render_value(v)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.render_value(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    // ------------------------------------------------------------------
    // Runtime
    // ------------------------------------------------------------------

    /// Attach the event bus that log entries are published on
    pub fn set_event_bus(&self, bus: Arc<EventBus>) {
        *write(&self.bus) = Some(bus);
    }

    /// The attached event bus, if any
    pub fn event_bus(&self) -> Option<Arc<EventBus>> {
        read(&self.bus).clone()
    }

    /// Persist log entries to `path` (appending) in addition to memory
    pub fn set_log_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        *lock(&self.log_file) = Some(file);
        Ok(())
    }

    /// Append a runtime log entry.
    ///
    /// The in-memory append always happens. The file write and the bus
    /// publish are best effort and never fail the caller.
    pub fn add_log(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Debug => tracing::debug!("{}", message),
            LogLevel::Info => tracing::info!("{}", message),
            LogLevel::Warn => tracing::warn!("{}", message),
            LogLevel::Error => tracing::error!("{}", message),
        }

        let entry = LogEntry::new(level, message);
        write(&self.store).runtime.logs.push(entry.clone());

        if let Some(file) = lock(&self.log_file).as_mut() {
            if let Err(e) = writeln!(file, "{entry}") {
                tracing::warn!("Failed to write log file: {}", e);
            }
        }

        if let Some(bus) = self.event_bus() {
            bus.publish_log(level, &entry.message);
        }
    }

    /// Record an error in the runtime state
    pub fn add_error(&self, err: impl fmt::Display) {
        write(&self.store).runtime.errors.push(err.to_string());
    }

    /// Set overall progress, clamped to `[0.0, 1.0]`
    pub fn set_progress(&self, fraction: f64) {
        let fraction = if fraction.is_nan() { 0.0 } else { fraction.clamp(0.0, 1.0) };
        write(&self.store).runtime.progress = fraction;
    }

    /// Current overall progress
    pub fn progress(&self) -> f64 {
        read(&self.store).runtime.progress
    }

    /// Record the selected flow and its entry step
    pub fn set_flow(&self, flow_id: &str, entry_step: &str) {
        let mut store = write(&self.store);
        store.runtime.flow_id = flow_id.to_string();
        store.runtime.current_step = entry_step.to_string();
        store.runtime.completed = false;
    }

    /// Record the current step
    pub fn set_current_step(&self, step_id: &str) {
        write(&self.store).runtime.current_step = step_id.to_string();
    }

    /// Mark the session's flow as completed
    pub fn mark_completed(&self) {
        write(&self.store).runtime.completed = true;
    }

    /// Returns true once the flow has been completed
    pub fn is_completed(&self) -> bool {
        read(&self.store).runtime.completed
    }

    /// Snapshot of runtime state
    pub fn runtime(&self) -> Runtime {
        read(&self.store).runtime.clone()
    }

    /// Snapshot of the runtime log
    pub fn logs(&self) -> Vec<LogEntry> {
        read(&self.store).runtime.logs.clone()
    }

    /// Snapshot of recorded errors
    pub fn errors(&self) -> Vec<String> {
        read(&self.store).runtime.errors.clone()
    }
}

// ============================================================================
// Value helpers
// ============================================================================

/// Stringify a context value the way templates and branch rules see it
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Returns true for the "empty" value of each JSON type
pub fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
    }
}

pub(crate) fn number_to_i64(n: &serde_json::Number) -> i64 {
    if let Some(i) = n.as_i64() {
        i
    } else if let Some(u) = n.as_u64() {
        i64::try_from(u).unwrap_or(i64::MAX)
    } else {
        // Saturating float-to-int cast truncates toward zero
        n.as_f64().map(|f| f as i64).unwrap_or(0)
    }
}

fn lookup_path<'a>(map: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    if let Some(value) = map.get(path) {
        return Some(value);
    }
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = map.get(first)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn insert_path(map: &mut Map<String, Value>, path: &str, value: Value) {
    let segments: Vec<&str> = path.split('.').collect();
    let Some((last, parents)) = segments.split_last() else {
        return;
    };

    let mut current = map;
    for segment in parents {
        let entry = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        let Some(next) = entry.as_object_mut() else {
            return;
        };
        current = next;
    }
    current.insert(last.to_string(), value);
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
