//! Error handling for the installer engine
//!
//! Provides a single crate-wide error type built with thiserror. Each engine
//! component owns a narrower error enum (`RegistryError`, `NavigationError`,
//! `TaskError`) that converts into `InstallError` so callers can use `?`
//! across component boundaries.

use thiserror::Error;

use crate::registry::RegistryError;
use crate::task::TaskError;
use crate::workflow::NavigationError;

/// Main error type for the installer engine
#[derive(Error, Debug)]
pub enum InstallError {
    /// IO errors (log file, config file, task file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors (malformed flows, bad guard/task parameters).
    /// Raised at construction or registration time, before navigation.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Extension registry errors (duplicate or unknown type names)
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// A guard blocked forward navigation. Displays the guard message verbatim
    /// so the presentation layer can show it as-is.
    #[error("{0}")]
    Guard(String),

    /// Step navigation errors
    #[error(transparent)]
    Navigation(#[from] NavigationError),

    /// Task validation, execution, cancellation and rollback errors
    #[error(transparent)]
    Task(#[from] TaskError),

    /// Privilege requirements not met
    #[error("Privilege error: {0}")]
    Privilege(String),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// General errors (catch-all for edge cases)
    #[error("{0}")]
    General(String),
}

/// Result type alias for installer operations
pub type Result<T> = std::result::Result<T, InstallError>;

impl InstallError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a guard failure carrying a user-facing message
    pub fn guard(msg: impl Into<String>) -> Self {
        Self::Guard(msg.into())
    }

    /// Create a privilege error
    pub fn privilege(msg: impl Into<String>) -> Self {
        Self::Privilege(msg.into())
    }

    /// Create a general error
    pub fn general(msg: impl Into<String>) -> Self {
        Self::General(msg.into())
    }

    /// Returns true if this error was produced by a guard check
    pub fn is_guard(&self) -> bool {
        matches!(self, Self::Guard(_))
    }

    /// Returns true if this error reports cooperative cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Task(TaskError::Cancelled))
    }
}
