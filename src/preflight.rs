//! Environment detection
//!
//! Collects the facts guards and templates need about the host before the
//! first step is shown: distribution, architecture, desktop session,
//! privileges and free disk space on the install target.
//!
//! Detection never fails. Anything that cannot be determined falls back to
//! `"unknown"` or zero and is logged at debug level.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::context::{EnvInfo, InstallContext};

const UNKNOWN: &str = "unknown";

impl EnvInfo {
    /// Probe the running system; free space is measured on `target`
    pub fn detect(target: impl AsRef<Path>) -> Self {
        let (distro, distro_version) = fs::read_to_string("/etc/os-release")
            .map(|content| parse_os_release(&content))
            .unwrap_or_else(|e| {
                tracing::debug!("Cannot read /etc/os-release: {}", e);
                (UNKNOWN.to_string(), UNKNOWN.to_string())
            });

        let info = Self {
            distro,
            distro_version,
            arch: env::consts::ARCH.to_string(),
            desktop: detect_desktop(),
            is_root: nix::unistd::geteuid().is_root(),
            has_sudo: find_in_path("sudo").is_some(),
            has_polkit: find_in_path("pkexec").is_some(),
            disk_free_mb: free_space_mb(target.as_ref()),
        };

        tracing::info!(
            "Environment: distro={} {}, arch={}, desktop={}, root={}, diskFreeMB={}",
            info.distro,
            info.distro_version,
            info.arch,
            info.desktop,
            info.is_root,
            info.disk_free_mb
        );
        info
    }
}

/// Detect the environment and store it in the context.
///
/// Free space is measured on `install.dir` when the user has set it,
/// otherwise on `/`.
pub fn detect_env(ctx: &InstallContext) -> EnvInfo {
    let target = match ctx.get_string("install.dir") {
        dir if dir.is_empty() => PathBuf::from("/"),
        dir => PathBuf::from(dir),
    };
    let info = EnvInfo::detect(&target);
    ctx.set_env(info.clone());
    info
}

/// `ID` and `VERSION_ID` from an os-release file
pub fn parse_os_release(content: &str) -> (String, String) {
    let mut id = None;
    let mut version = None;
    for line in content.lines() {
        let Some((key, value)) = line.trim().split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"').trim_matches('\'').to_string();
        match key {
            "ID" => id = Some(value),
            "VERSION_ID" => version = Some(value),
            _ => {}
        }
    }
    let or_unknown = |v: Option<String>| {
        v.filter(|s| !s.is_empty())
            .unwrap_or_else(|| UNKNOWN.to_string())
    };
    (or_unknown(id), or_unknown(version))
}

fn detect_desktop() -> String {
    ["XDG_CURRENT_DESKTOP", "DESKTOP_SESSION"]
        .iter()
        .filter_map(|var| env::var(var).ok())
        .map(|v| v.trim().to_string())
        .find(|v| !v.is_empty())
        .unwrap_or_else(|| UNKNOWN.to_string())
}

/// First executable named `name` on `PATH`
pub fn find_in_path(name: &str) -> Option<PathBuf> {
    use std::os::unix::fs::PermissionsExt;

    let path = env::var_os("PATH")?;
    env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| {
            fs::metadata(candidate)
                .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
                .unwrap_or(false)
        })
}

/// Free space in MB on the filesystem holding `target`, measured on the
/// nearest existing ancestor since the target may not exist yet
pub fn free_space_mb(target: &Path) -> u64 {
    let Some(existing) = target.ancestors().find(|p| p.exists()) else {
        return 0;
    };
    match nix::sys::statvfs::statvfs(existing) {
        Ok(stat) => {
            let bytes = (stat.blocks_available() as u64).saturating_mul(stat.fragment_size() as u64);
            bytes / (1024 * 1024)
        }
        Err(e) => {
            tracing::debug!("statvfs({}) failed: {}", existing.display(), e);
            0
        }
    }
}
