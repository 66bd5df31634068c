//! `shell` task: run a command and capture its output.
//!
//! Without `args` the command line is handed to `sh -c`; with `args` the
//! command is executed directly. The child runs in its own process group
//! and is killed, with everything it spawned, once `timeout` expires.

use anyhow::Context;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::process::Command;
use std::time::Duration;

use crate::config::TaskConfig;
use crate::context::{InstallContext, LogLevel};
use crate::error::Result;
use crate::events::EventBus;
use crate::process_guard::{CommandOutput, run_command};
use crate::task::Task;

/// Default command timeout in seconds
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShellParams {
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, alias = "workDir", alias = "cwd")]
    pub workdir: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Seconds; zero or absent means the default
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default, alias = "rollback_command")]
    pub rollback_command: String,
}

#[derive(Debug)]
pub struct ShellTask {
    id: String,
    params: ShellParams,
}

impl ShellTask {
    pub fn new(id: impl Into<String>, params: ShellParams) -> Self {
        Self {
            id: id.into(),
            params,
        }
    }

    pub fn from_config(config: &TaskConfig, ctx: &InstallContext) -> Result<Self> {
        let params: ShellParams = config.decode_rendered(ctx)?;
        let first_word = params.command.split_whitespace().next().unwrap_or("cmd");
        let id = super::task_id(config, "shell", first_word);
        Ok(Self::new(id, params))
    }

    pub fn params(&self) -> &ShellParams {
        &self.params
    }

    fn timeout(&self) -> Duration {
        match self.params.timeout {
            Some(secs) if secs > 0 => Duration::from_secs(secs),
            _ => Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    fn command_line(&self) -> String {
        if self.params.args.is_empty() {
            self.params.command.clone()
        } else {
            format!("{} {}", self.params.command, self.params.args.join(" "))
        }
    }

    fn build_command(&self, line: &str, direct: bool) -> Command {
        let mut cmd = if direct {
            let mut cmd = Command::new(&self.params.command);
            cmd.args(&self.params.args);
            cmd
        } else {
            let mut cmd = Command::new("sh");
            cmd.args(["-c", line]);
            cmd
        };
        if !self.params.workdir.is_empty() {
            cmd.current_dir(&self.params.workdir);
        }
        cmd.envs(&self.params.env);
        cmd
    }

    fn run(&self, ctx: &InstallContext, line: &str, direct: bool) -> anyhow::Result<CommandOutput> {
        let mut cmd = self.build_command(line, direct);
        let output = run_command(&mut cmd, self.timeout())
            .with_context(|| format!("command '{line}'"))?;
        for out_line in output.stdout.lines().filter(|l| !l.trim().is_empty()) {
            ctx.add_log(LogLevel::Debug, out_line);
        }
        output.ensure_success(&format!("command '{line}'"))?;
        Ok(output)
    }
}

impl Task for ShellTask {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &str {
        "shell"
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.params.command.trim().is_empty() {
            anyhow::bail!("command is required");
        }
        if !self.params.workdir.is_empty() && !std::path::Path::new(&self.params.workdir).is_dir() {
            anyhow::bail!("working directory '{}' does not exist", self.params.workdir);
        }
        Ok(())
    }

    fn execute(&mut self, ctx: &InstallContext, _bus: &EventBus) -> anyhow::Result<()> {
        let line = self.command_line();
        ctx.add_log(LogLevel::Info, format!("Executing: {line}"));
        self.run(ctx, &line, !self.params.args.is_empty())?;
        Ok(())
    }

    fn can_rollback(&self) -> bool {
        !self.params.rollback_command.trim().is_empty()
    }

    fn rollback(&mut self, ctx: &InstallContext, _bus: &EventBus) -> anyhow::Result<()> {
        if !self.can_rollback() {
            return Ok(());
        }
        let line = self.params.rollback_command.clone();
        ctx.add_log(LogLevel::Info, format!("Rolling back: {line}"));
        self.run(ctx, &line, false)?;
        Ok(())
    }
}
