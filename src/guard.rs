//! Navigation guards
//!
//! A guard is a precondition evaluated before the workflow leaves a step
//! going forward. Guards are built eagerly from configuration: a malformed
//! entry (missing field name, non-numeric threshold) fails at construction,
//! while `check` only fails when the runtime condition is not met.
//!
//! Built-in kinds:
//! - `mustAccept`: a boolean field must be strictly `true`
//! - `diskSpace`: `env.diskFreeMB` must be at least `minMB`
//! - `fieldNotEmpty`: a field must be present and non-empty
//! - `expression`: a field must equal `expected` (default `true`)

use serde_json::Value;
use std::sync::Arc;

use crate::config::GuardConfig;
use crate::context::{InstallContext, is_empty_value, value_to_string};
use crate::error::{InstallError, Result};
use crate::registry::{GuardFactory, Registry};

/// A precondition checked before forward navigation
pub trait Guard: Send + Sync {
    /// Registered type name
    fn kind(&self) -> &str;

    /// User-facing message reported when the check fails
    fn message(&self) -> &str;

    /// Evaluate against the context. Failures are `InstallError::Guard`
    /// carrying `message()` verbatim.
    fn check(&self, ctx: &InstallContext) -> Result<()>;
}

fn required_field(config: &GuardConfig, key: &str) -> Result<String> {
    config.str_param(key).map(str::to_string).ok_or_else(|| {
        InstallError::config(format!("{} guard: '{}' is required", config.kind, key))
    })
}

fn message_or(config: &GuardConfig, default: String) -> String {
    config.message().map(str::to_string).unwrap_or(default)
}

// ============================================================================
// mustAccept
// ============================================================================

#[derive(Debug, Clone)]
pub struct MustAcceptGuard {
    field: String,
    message: String,
}

impl MustAcceptGuard {
    pub fn from_config(config: &GuardConfig) -> Result<Self> {
        let field = required_field(config, "field")?;
        let message = message_or(config, format!("You must accept '{field}' to continue"));
        Ok(Self { field, message })
    }

    pub fn field(&self) -> &str {
        &self.field
    }
}

impl Guard for MustAcceptGuard {
    fn kind(&self) -> &str {
        "mustAccept"
    }

    fn message(&self) -> &str {
        &self.message
    }

    fn check(&self, ctx: &InstallContext) -> Result<()> {
        match ctx.get(&self.field) {
            Some(Value::Bool(true)) => Ok(()),
            _ => Err(InstallError::guard(&self.message)),
        }
    }
}

// ============================================================================
// diskSpace
// ============================================================================

#[derive(Debug, Clone)]
pub struct DiskSpaceGuard {
    min_mb: u64,
    message: String,
}

impl DiskSpaceGuard {
    pub fn from_config(config: &GuardConfig) -> Result<Self> {
        let min_mb = match config.param("minMB") {
            Some(Value::Number(n)) => positive_whole_number(n),
            _ => None,
        }
        .ok_or_else(|| {
            InstallError::config("diskSpace guard: 'minMB' must be a positive number")
        })?;

        let message = message_or(
            config,
            format!("At least {min_mb} MB of free disk space is required"),
        );
        Ok(Self { min_mb, message })
    }

    pub fn min_mb(&self) -> u64 {
        self.min_mb
    }
}

/// Accepts `500`, `500u64` and `500.0`; rejects zero, negatives and fractions
fn positive_whole_number(n: &serde_json::Number) -> Option<u64> {
    if let Some(u) = n.as_u64() {
        return (u > 0).then_some(u);
    }
    if n.as_i64().is_some() {
        return None;
    }
    let f = n.as_f64()?;
    (f >= 1.0 && f.fract() == 0.0 && f <= u64::MAX as f64).then_some(f as u64)
}

impl Guard for DiskSpaceGuard {
    fn kind(&self) -> &str {
        "diskSpace"
    }

    fn message(&self) -> &str {
        &self.message
    }

    fn check(&self, ctx: &InstallContext) -> Result<()> {
        let free = ctx.env().disk_free_mb;
        if free >= self.min_mb {
            Ok(())
        } else {
            tracing::debug!("Disk space guard: {} MB free, {} MB required", free, self.min_mb);
            Err(InstallError::guard(&self.message))
        }
    }
}

// ============================================================================
// fieldNotEmpty
// ============================================================================

#[derive(Debug, Clone)]
pub struct FieldNotEmptyGuard {
    field: String,
    message: String,
}

impl FieldNotEmptyGuard {
    pub fn from_config(config: &GuardConfig) -> Result<Self> {
        let field = required_field(config, "field")?;
        let message = message_or(config, format!("'{field}' must not be empty"));
        Ok(Self { field, message })
    }
}

impl Guard for FieldNotEmptyGuard {
    fn kind(&self) -> &str {
        "fieldNotEmpty"
    }

    fn message(&self) -> &str {
        &self.message
    }

    fn check(&self, ctx: &InstallContext) -> Result<()> {
        match ctx.get(&self.field) {
            Some(value) if !is_empty_value(&value) => Ok(()),
            _ => Err(InstallError::guard(&self.message)),
        }
    }
}

// ============================================================================
// expression
// ============================================================================

#[derive(Debug, Clone)]
pub struct ExpressionGuard {
    expression: String,
    expected: Value,
    message: String,
}

impl ExpressionGuard {
    pub fn from_config(config: &GuardConfig) -> Result<Self> {
        let expression = required_field(config, "expression")?;
        let expected = config.param("expected").cloned().unwrap_or(Value::Bool(true));
        let message = message_or(
            config,
            format!(
                "Condition not met: {} must be {}",
                expression,
                value_to_string(&expected)
            ),
        );
        Ok(Self {
            expression,
            expected,
            message,
        })
    }
}

/// Loose equality: exact JSON match, numeric match across representations,
/// or matching string forms
fn values_match(actual: &Value, expected: &Value) -> bool {
    if actual == expected {
        return true;
    }
    if let (Value::Number(a), Value::Number(b)) = (actual, expected) {
        return a.as_f64() == b.as_f64();
    }
    value_to_string(actual) == value_to_string(expected)
}

impl Guard for ExpressionGuard {
    fn kind(&self) -> &str {
        "expression"
    }

    fn message(&self) -> &str {
        &self.message
    }

    fn check(&self, ctx: &InstallContext) -> Result<()> {
        match ctx.get(&self.expression) {
            Some(actual) if values_match(&actual, &self.expected) => Ok(()),
            _ => Err(InstallError::guard(&self.message)),
        }
    }
}

/// Register the built-in guard kinds
pub fn register_builtin_guards(registry: &Registry<GuardFactory>) {
    registry.must_register(
        "mustAccept",
        Arc::new(|c: &GuardConfig| Ok(Box::new(MustAcceptGuard::from_config(c)?) as Box<dyn Guard>)),
    );
    registry.must_register(
        "diskSpace",
        Arc::new(|c: &GuardConfig| Ok(Box::new(DiskSpaceGuard::from_config(c)?) as Box<dyn Guard>)),
    );
    registry.must_register(
        "fieldNotEmpty",
        Arc::new(|c: &GuardConfig| {
            Ok(Box::new(FieldNotEmptyGuard::from_config(c)?) as Box<dyn Guard>)
        }),
    );
    registry.must_register(
        "expression",
        Arc::new(|c: &GuardConfig| Ok(Box::new(ExpressionGuard::from_config(c)?) as Box<dyn Guard>)),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn must_accept(field: &str) -> GuardConfig {
        GuardConfig::new("mustAccept").with_param("field", field)
    }

    // =========================================================================
    // mustAccept
    // =========================================================================

    #[test]
    fn test_must_accept_requires_strict_true() {
        let guard = MustAcceptGuard::from_config(&must_accept("license.accepted")).expect("build");
        assert_eq!(guard.kind(), "mustAccept");

        let ctx = InstallContext::new();
        assert!(guard.check(&ctx).is_err());

        ctx.set("license.accepted", false);
        assert!(guard.check(&ctx).is_err());

        ctx.set("license.accepted", "true");
        assert!(guard.check(&ctx).is_err());

        ctx.set("license.accepted", true);
        assert!(guard.check(&ctx).is_ok());
    }

    #[test]
    fn test_must_accept_custom_message_is_verbatim() {
        let config = must_accept("terms.accepted").with_param("message", "You must accept the terms");
        let guard = MustAcceptGuard::from_config(&config).expect("build");
        assert_eq!(guard.message(), "You must accept the terms");

        let err = guard.check(&InstallContext::new()).unwrap_err();
        assert!(err.is_guard());
        assert_eq!(err.to_string(), "You must accept the terms");
    }

    #[test]
    fn test_must_accept_missing_field_is_config_error() {
        assert!(MustAcceptGuard::from_config(&GuardConfig::new("mustAccept")).is_err());
        assert!(MustAcceptGuard::from_config(&must_accept("")).is_err());
    }

    // =========================================================================
    // diskSpace
    // =========================================================================

    #[test]
    fn test_disk_space_threshold() {
        let config = GuardConfig::new("diskSpace").with_param("minMB", 500);
        let guard = DiskSpaceGuard::from_config(&config).expect("build");

        let ctx = InstallContext::new();
        ctx.update_env(|env| env.disk_free_mb = 100);
        assert!(guard.check(&ctx).is_err());

        ctx.update_env(|env| env.disk_free_mb = 1000);
        assert!(guard.check(&ctx).is_ok());

        ctx.update_env(|env| env.disk_free_mb = 500);
        assert!(guard.check(&ctx).is_ok());
    }

    #[test]
    fn test_disk_space_numeric_representations() {
        for (value, expected) in [(json!(100), 100), (json!(200_i64), 200), (json!(300.0), 300)] {
            let config = GuardConfig::new("diskSpace").with_param("minMB", value);
            let guard = DiskSpaceGuard::from_config(&config).expect("build");
            assert_eq!(guard.min_mb(), expected);
        }
    }

    #[test]
    fn test_disk_space_rejects_bad_minimums() {
        let bad = [json!(0), json!(-100), json!("500"), json!(12.5), json!(null)];
        for value in bad {
            let config = GuardConfig::new("diskSpace").with_param("minMB", value.clone());
            assert!(DiskSpaceGuard::from_config(&config).is_err(), "accepted {value}");
        }
        assert!(DiskSpaceGuard::from_config(&GuardConfig::new("diskSpace")).is_err());
    }

    // =========================================================================
    // fieldNotEmpty
    // =========================================================================

    #[test]
    fn test_field_not_empty() {
        let config = GuardConfig::new("fieldNotEmpty").with_param("field", "install.dir");
        let guard = FieldNotEmptyGuard::from_config(&config).expect("build");

        let ctx = InstallContext::new();
        assert!(guard.check(&ctx).is_err());

        ctx.set("install.dir", "");
        assert!(guard.check(&ctx).is_err());

        ctx.set("install.dir", "/opt/myapp");
        assert!(guard.check(&ctx).is_ok());

        assert!(FieldNotEmptyGuard::from_config(&GuardConfig::new("fieldNotEmpty")).is_err());
    }

    // =========================================================================
    // expression
    // =========================================================================

    #[test]
    fn test_expression_bool_against_env() {
        let config = GuardConfig::new("expression")
            .with_param("expression", "env.isRoot")
            .with_param("expected", true)
            .with_param("message", "Root access required");
        let guard = ExpressionGuard::from_config(&config).expect("build");
        assert_eq!(guard.kind(), "expression");

        let ctx = InstallContext::new();
        let err = guard.check(&ctx).unwrap_err();
        assert_eq!(err.to_string(), "Root access required");

        ctx.update_env(|env| env.is_root = true);
        assert!(guard.check(&ctx).is_ok());
    }

    #[test]
    fn test_expression_string_comparison() {
        let config = GuardConfig::new("expression")
            .with_param("expression", "env.distro")
            .with_param("expected", "ubuntu");
        let guard = ExpressionGuard::from_config(&config).expect("build");

        let ctx = InstallContext::new();
        ctx.update_env(|env| env.distro = "fedora".into());
        assert!(guard.check(&ctx).is_err());

        ctx.update_env(|env| env.distro = "ubuntu".into());
        assert!(guard.check(&ctx).is_ok());
    }

    #[test]
    fn test_expression_defaults_to_true_and_missing_field_fails() {
        let config = GuardConfig::new("expression").with_param("expression", "feature.enabled");
        let guard = ExpressionGuard::from_config(&config).expect("build");

        let ctx = InstallContext::new();
        assert!(guard.check(&ctx).is_err());

        ctx.set("feature.enabled", true);
        assert!(guard.check(&ctx).is_ok());

        ctx.set("feature.enabled", false);
        assert!(guard.check(&ctx).is_err());

        assert!(ExpressionGuard::from_config(&GuardConfig::new("expression")).is_err());
    }

    #[test]
    fn test_expression_numeric_match_across_representations() {
        let config = GuardConfig::new("expression")
            .with_param("expression", "count")
            .with_param("expected", 3.0);
        let guard = ExpressionGuard::from_config(&config).expect("build");

        let ctx = InstallContext::new();
        ctx.set("count", 3);
        assert!(guard.check(&ctx).is_ok());
    }

    #[test]
    fn test_register_builtin_guards() {
        let registry: Registry<GuardFactory> = Registry::new("guard");
        register_builtin_guards(&registry);

        let factory = registry.get("mustAccept").expect("registered");
        let guard = factory(&must_accept("license.accepted")).expect("build");
        assert_eq!(guard.kind(), "mustAccept");
        assert_eq!(registry.len(), 4);
    }
}
