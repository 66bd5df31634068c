//! Privilege requirements
//!
//! Tasks marked `requirePrivilege: true` need root. The engine never
//! elevates itself; it reports what is needed and which tool would do it,
//! and refuses to start a flow that needs root when it does not have it.

use strum::{Display, EnumString};

use crate::config::Config;
use crate::context::{EnvInfo, InstallContext};
use crate::error::{InstallError, Result};

/// Context path holding the configured strategy
pub const STRATEGY_PATH: &str = "meta.privilegeStrategy";

/// How the installer expects to obtain root
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum PrivilegeStrategy {
    /// Never elevate
    None,
    Sudo,
    Pkexec,
    /// sudo when available, else pkexec
    #[default]
    Auto,
}

impl PrivilegeStrategy {
    /// Strategy configured in the context; unknown values fall back to `Auto`
    pub fn from_context(ctx: &InstallContext) -> Self {
        let raw = ctx.get_string(STRATEGY_PATH);
        if raw.trim().is_empty() {
            return Self::default();
        }
        raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!("Unknown privilege strategy '{}', using auto", raw);
            Self::default()
        })
    }

    /// The elevation tool this strategy would use on `env`
    pub fn elevation_tool(self, env: &EnvInfo) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Sudo => env.has_sudo.then_some("sudo"),
            Self::Pkexec => env.has_polkit.then_some("pkexec"),
            Self::Auto => {
                if env.has_sudo {
                    Some("sudo")
                } else if env.has_polkit {
                    Some("pkexec")
                } else {
                    None
                }
            }
        }
    }
}

/// Fail when `required` and the process is not running as root
pub fn ensure_privilege(ctx: &InstallContext, required: bool) -> Result<()> {
    if !required {
        return Ok(());
    }
    let env = ctx.env();
    if env.is_root {
        return Ok(());
    }

    let strategy = PrivilegeStrategy::from_context(ctx);
    let hint = match strategy.elevation_tool(&env) {
        Some(tool) => format!("re-run with {tool}"),
        None if strategy == PrivilegeStrategy::None => {
            "privilege elevation is disabled for this product".to_string()
        }
        None => "no elevation tool (sudo, pkexec) was found".to_string(),
    };
    Err(InstallError::privilege(format!(
        "this installation requires root privileges; {hint}"
    )))
}

/// Returns true if any task in `flow_id` is marked `requirePrivilege`
pub fn needs_privilege(config: &Config, flow_id: &str) -> bool {
    config
        .all_flows()
        .get(flow_id)
        .is_some_and(|flow| {
            flow.steps
                .iter()
                .flat_map(|step| step.tasks.iter())
                .any(|task| task.requires_privilege())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(is_root: bool, has_sudo: bool, has_polkit: bool) -> EnvInfo {
        EnvInfo {
            is_root,
            has_sudo,
            has_polkit,
            ..EnvInfo::default()
        }
    }

    #[test]
    fn test_strategy_from_context() {
        let ctx = InstallContext::new();
        assert_eq!(PrivilegeStrategy::from_context(&ctx), PrivilegeStrategy::Auto);

        ctx.set_meta("privilegeStrategy", "PKEXEC");
        assert_eq!(PrivilegeStrategy::from_context(&ctx), PrivilegeStrategy::Pkexec);

        ctx.set_meta("privilegeStrategy", "doas");
        assert_eq!(PrivilegeStrategy::from_context(&ctx), PrivilegeStrategy::Auto);
    }

    #[test]
    fn test_elevation_tool() {
        assert_eq!(PrivilegeStrategy::Auto.elevation_tool(&env(false, true, true)), Some("sudo"));
        assert_eq!(PrivilegeStrategy::Auto.elevation_tool(&env(false, false, true)), Some("pkexec"));
        assert_eq!(PrivilegeStrategy::Auto.elevation_tool(&env(false, false, false)), None);
        assert_eq!(PrivilegeStrategy::Sudo.elevation_tool(&env(false, false, true)), None);
        assert_eq!(PrivilegeStrategy::None.elevation_tool(&env(false, true, true)), None);
    }

    #[test]
    fn test_ensure_privilege() {
        let ctx = InstallContext::new();
        ctx.set_env(env(false, true, false));
        assert!(ensure_privilege(&ctx, false).is_ok());

        let err = ensure_privilege(&ctx, true).unwrap_err();
        assert!(matches!(err, InstallError::Privilege(_)));
        assert!(err.to_string().contains("re-run with sudo"));

        ctx.set_env(env(true, false, false));
        assert!(ensure_privilege(&ctx, true).is_ok());
    }

    #[test]
    fn test_needs_privilege() {
        let config = Config::from_json_str(
            r#"{
                "product": { "name": "demo" },
                "flows": {
                    "install": { "steps": [
                        { "id": "a", "tasks": [ { "type": "shell", "command": "true" } ] },
                        { "id": "b", "tasks": [ { "type": "shell", "command": "true", "requirePrivilege": true } ] }
                    ] },
                    "uninstall": { "steps": [ { "id": "c" } ] }
                }
            }"#,
        )
        .expect("parse");

        assert!(needs_privilege(&config, "install"));
        assert!(!needs_privilege(&config, "uninstall"));
        assert!(!needs_privilege(&config, "missing"));
    }
}
