use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::task::FailurePolicy;

/// installkit - configuration-driven installation wizard engine
#[derive(Parser, Debug)]
#[command(name = "installkit")]
#[command(about = "Run, validate and preview installer flows described in JSON")]
#[command(version)]
pub struct Cli {
    /// Enable debug logging (RUST_LOG still takes precedence)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a flow headless, using screen defaults and --set answers
    Run {
        /// Installer configuration file
        #[arg(short, long)]
        config: PathBuf,

        /// Flow to run (install, uninstall, upgrade, repair, ...)
        #[arg(short, long, default_value = "install")]
        action: String,

        /// Answer a question up front: --set license.accepted=true
        #[arg(long = "set", value_name = "KEY=VALUE")]
        set: Vec<String>,

        /// Append the session log to this file
        #[arg(long)]
        log_file: Option<PathBuf>,

        /// Undo finished steps when a task fails
        #[arg(long)]
        rollback_on_failure: bool,

        /// Failure policy for tasks without their own on_failure
        #[arg(long, default_value = "abort", value_parser = parse_policy)]
        on_failure: FailurePolicy,

        /// Do not detect the environment before running
        #[arg(long)]
        skip_preflight: bool,
    },
    /// Validate a configuration file and every flow in it
    Validate {
        /// Installer configuration file
        #[arg(short, long)]
        config: PathBuf,
    },
    /// List the tasks a flow would run, without running them
    Plan {
        /// Installer configuration file
        #[arg(short, long)]
        config: PathBuf,

        /// Flow to preview
        #[arg(short, long, default_value = "install")]
        action: String,

        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },
}

fn parse_policy(raw: &str) -> Result<FailurePolicy, String> {
    raw.parse()
        .map_err(|_| format!("unknown policy '{raw}' (expected abort, skip or rollback)"))
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_requires_subcommand() {
        assert!(Cli::try_parse_from(["installkit"]).is_err());
    }

    #[test]
    fn test_cli_run_defaults() {
        let cli = Cli::try_parse_from(["installkit", "run", "--config", "/etc/app/installer.json"])
            .expect("parse");
        match cli.command {
            Commands::Run {
                config,
                action,
                set,
                rollback_on_failure,
                on_failure,
                skip_preflight,
                log_file,
            } => {
                assert_eq!(config, PathBuf::from("/etc/app/installer.json"));
                assert_eq!(action, "install");
                assert!(set.is_empty());
                assert!(!rollback_on_failure);
                assert_eq!(on_failure, FailurePolicy::Abort);
                assert!(!skip_preflight);
                assert!(log_file.is_none());
            }
            other => panic!("Expected Run command, got {other:?}"),
        }
    }

    #[test]
    fn test_cli_run_with_answers() {
        let cli = Cli::try_parse_from([
            "installkit",
            "-v",
            "run",
            "-c",
            "cfg.json",
            "--action",
            "uninstall",
            "--set",
            "license.accepted=true",
            "--set",
            "install.dir=/opt/demo",
            "--on-failure",
            "rollback",
            "--rollback-on-failure",
        ])
        .expect("parse");
        assert!(cli.verbose);
        match cli.command {
            Commands::Run {
                action,
                set,
                on_failure,
                rollback_on_failure,
                ..
            } => {
                assert_eq!(action, "uninstall");
                assert_eq!(set, ["license.accepted=true", "install.dir=/opt/demo"]);
                assert_eq!(on_failure, FailurePolicy::Rollback);
                assert!(rollback_on_failure);
            }
            other => panic!("Expected Run command, got {other:?}"),
        }
    }

    #[test]
    fn test_cli_rejects_unknown_policy() {
        let result = Cli::try_parse_from([
            "installkit",
            "run",
            "--config",
            "cfg.json",
            "--on-failure",
            "retry",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_validate_and_plan() {
        let cli = Cli::try_parse_from(["installkit", "validate", "--config", "cfg.json"])
            .expect("parse");
        assert!(matches!(cli.command, Commands::Validate { .. }));

        let cli = Cli::try_parse_from(["installkit", "plan", "-c", "cfg.json", "--json"])
            .expect("parse");
        match cli.command {
            Commands::Plan { action, json, .. } => {
                assert_eq!(action, "install");
                assert!(json);
            }
            other => panic!("Expected Plan command, got {other:?}"),
        }
    }
}
