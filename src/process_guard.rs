//! Child process lifecycle for shell tasks
//!
//! Commands launched by tasks run in their own process group so the whole
//! tree (`sh -c` plus whatever it spawns) can be signalled at once, and they
//! receive SIGTERM if the installer itself dies.
//!
//! - `run_command` spawns, tracks and waits for a command with a timeout;
//!   on timeout the process group is killed
//! - `ChildRegistry` tracks live children so SIGTERM/SIGHUP and
//!   `ProcessGuard` drop can terminate them
//! - SIGINT is left to the Ctrl-C handler, which cancels cooperatively

use anyhow::{Context, Result};
use nix::libc;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashSet;
use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::sync::lock;

static CHILD_REGISTRY: OnceLock<Arc<Mutex<ChildRegistry>>> = OnceLock::new();

/// How often a running child is polled for exit
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Live child process groups started by tasks
#[derive(Debug, Default)]
pub struct ChildRegistry {
    pids: HashSet<u32>,
    cleanup_initiated: bool,
}

impl ChildRegistry {
    /// The process-wide registry
    pub fn global() -> Arc<Mutex<ChildRegistry>> {
        CHILD_REGISTRY
            .get_or_init(|| Arc::new(Mutex::new(ChildRegistry::default())))
            .clone()
    }

    pub fn register(&mut self, pid: u32) {
        self.pids.insert(pid);
        tracing::debug!("Tracking child process group {}", pid);
    }

    pub fn unregister(&mut self, pid: u32) {
        self.pids.remove(&pid);
        tracing::debug!("Released child process group {}", pid);
    }

    pub fn count(&self) -> usize {
        self.pids.len()
    }

    /// SIGTERM every tracked group, wait up to `grace_period`, then SIGKILL
    /// whatever is left. Runs at most once per registry.
    pub fn terminate_all(&mut self, grace_period: Duration) {
        if self.cleanup_initiated {
            return;
        }
        self.cleanup_initiated = true;

        if self.pids.is_empty() {
            return;
        }

        let pids: Vec<u32> = self.pids.iter().copied().collect();
        tracing::info!("Terminating {} child process group(s)", pids.len());
        for &pid in &pids {
            signal_group_or_process(pid, Signal::SIGTERM);
        }

        let start = Instant::now();
        while start.elapsed() < grace_period {
            if !pids.iter().any(|&pid| is_process_alive(pid)) {
                self.pids.clear();
                return;
            }
            thread::sleep(Duration::from_millis(100));
        }

        for &pid in pids.iter().filter(|&&pid| is_process_alive(pid)) {
            tracing::warn!("Process group {} ignored SIGTERM, sending SIGKILL", pid);
            signal_group_or_process(pid, Signal::SIGKILL);
        }
        self.pids.clear();
    }
}

fn send_signal(pid: u32, signal: Signal) -> std::result::Result<(), nix::Error> {
    signal::kill(Pid::from_raw(pid as i32), signal)
}

/// Negative PID addresses the whole process group
fn send_signal_to_group(pgid: u32, signal: Signal) -> std::result::Result<(), nix::Error> {
    signal::kill(Pid::from_raw(-(pgid as i32)), signal)
}

fn signal_group_or_process(pid: u32, signal: Signal) {
    if let Err(e) = send_signal_to_group(pid, signal) {
        tracing::debug!("Group signal {} to {} failed: {}", signal, pid, e);
        if let Err(e) = send_signal(pid, signal) {
            tracing::warn!("Failed to send {} to PID {}: {}", signal, pid, e);
        }
    }
}

/// Alive means present and not a zombie
fn is_process_alive(pid: u32) -> bool {
    if signal::kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }
    if let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        // Third field is the state letter
        if let Some(state) = stat.split_whitespace().nth(2) {
            return !matches!(state, "Z" | "X");
        }
    }
    true
}

/// Terminates tracked children when dropped. Held by the binary for the
/// lifetime of a session.
pub struct ProcessGuard {
    registry: Arc<Mutex<ChildRegistry>>,
}

impl ProcessGuard {
    pub fn new() -> Self {
        Self {
            registry: ChildRegistry::global(),
        }
    }

    pub fn child_count(&self) -> usize {
        lock(&self.registry).count()
    }
}

impl Default for ProcessGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        lock(&self.registry).terminate_all(Duration::from_secs(5));
    }
}

/// Terminate children on SIGTERM/SIGHUP, then exit with `128 + signal`
pub fn init_signal_handlers() -> std::result::Result<(), std::io::Error> {
    use signal_hook::consts::signal::{SIGHUP, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGTERM, SIGHUP])?;
    thread::spawn(move || {
        if let Some(sig) = signals.forever().next() {
            tracing::info!("Received signal {}, cleaning up", sig);
            lock(&ChildRegistry::global()).terminate_all(Duration::from_secs(3));
            std::process::exit(128 + sig);
        }
    });
    Ok(())
}

/// Run a `Command` as the leader of a new process group that dies with us
pub trait CommandProcessGroup {
    fn in_new_process_group(&mut self) -> &mut Self;
}

impl CommandProcessGroup for Command {
    fn in_new_process_group(&mut self) -> &mut Self {
        use std::os::unix::process::CommandExt;
        // SAFETY: the hook only calls async-signal-safe functions
        // (setpgid, prctl) between fork and exec.
        unsafe {
            self.pre_exec(|| {
                nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
                    .map_err(std::io::Error::other)?;
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
        self
    }
}

/// Captured result of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when terminated by a signal
    pub exit_code: Option<i32>,
    pub success: bool,
}

impl CommandOutput {
    /// Turn a non-zero exit into an error carrying stderr
    pub fn ensure_success(&self, what: &str) -> Result<()> {
        if self.success {
            return Ok(());
        }
        match self.exit_code {
            Some(code) => anyhow::bail!("{} failed (exit code {}): {}", what, code, self.stderr.trim()),
            None => anyhow::bail!("{} was terminated by a signal: {}", what, self.stderr.trim()),
        }
    }
}

/// Spawn `cmd` in its own process group, capture output and wait.
///
/// If the command outlives `timeout`, its process group is killed and an
/// error is returned.
pub fn run_command(cmd: &mut Command, timeout: Duration) -> Result<CommandOutput> {
    let program = format!("{:?}", cmd.get_program());
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .in_new_process_group()
        .spawn()
        .with_context(|| format!("Failed to spawn {program}"))?;

    let pid = child.id();
    lock(&ChildRegistry::global()).register(pid);
    let result = wait_with_timeout(&mut child, timeout);
    lock(&ChildRegistry::global()).unregister(pid);
    result.with_context(|| format!("Running {program}"))
}

fn wait_with_timeout(child: &mut Child, timeout: Duration) -> Result<CommandOutput> {
    let stdout = spawn_reader(child.stdout.take());
    let stderr = spawn_reader(child.stderr.take());
    let started = Instant::now();

    let status = loop {
        if let Some(status) = child.try_wait().context("Failed to poll child")? {
            break status;
        }
        if started.elapsed() >= timeout {
            signal_group_or_process(child.id(), Signal::SIGKILL);
            let _ = child.wait();
            let _ = join_reader(stdout);
            let _ = join_reader(stderr);
            anyhow::bail!("command timed out after {}s", timeout.as_secs_f64());
        }
        thread::sleep(POLL_INTERVAL);
    };

    Ok(CommandOutput {
        stdout: join_reader(stdout),
        stderr: join_reader(stderr),
        exit_code: status.code(),
        success: status.success(),
    })
}

fn spawn_reader<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<String>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            String::from_utf8_lossy(&buf).into_owned()
        })
    })
}

fn join_reader(handle: Option<JoinHandle<String>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}
