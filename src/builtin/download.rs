//! `download` task: fetch a file over HTTP(S), optionally verifying its
//! SHA-256 checksum.
//!
//! The body is streamed into a `.part` file next to the destination and
//! hashed on the way; only a verified download replaces the destination.
//! Progress is published as `Downloading: N%` when the server reports a
//! length. Rollback removes the file, or restores the one it replaced.

use anyhow::{Context, bail};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::journal::FileJournal;
use crate::config::TaskConfig;
use crate::context::{InstallContext, LogLevel};
use crate::error::Result;
use crate::events::EventBus;
use crate::task::Task;

pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

const CHUNK_SIZE: usize = 64 * 1024;

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

#[derive(Debug, Clone, Deserialize)]
pub struct DownloadParams {
    #[serde(default)]
    pub url: String,
    #[serde(default, alias = "dest", alias = "path")]
    pub destination: String,
    /// Expected hex digest, optionally prefixed with `sha256:`
    #[serde(default, alias = "checksum")]
    pub sha256: Option<String>,
    /// Whole-request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

#[derive(Debug)]
pub struct DownloadTask {
    id: String,
    params: DownloadParams,
    journal: FileJournal,
}

impl DownloadTask {
    pub fn from_config(config: &TaskConfig, ctx: &InstallContext) -> Result<Self> {
        let params: DownloadParams = config.decode_rendered(ctx)?;
        Ok(Self {
            id: super::task_id(config, "download", url_basename(&params.url)),
            params,
            journal: FileJournal::default(),
        })
    }

    fn expected_digest(&self) -> Option<String> {
        self.params
            .sha256
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| s.strip_prefix("sha256:").unwrap_or(s).to_ascii_lowercase())
    }

    /// Stream the body into `part`, returning its hex digest and size
    fn fetch(&self, part: &Path, bus: &EventBus) -> anyhow::Result<(String, u64)> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(self.params.timeout.max(1)))
            .build()
            .context("Failed to build HTTP client")?;
        let mut response = client
            .get(&self.params.url)
            .send()
            .with_context(|| format!("Failed to fetch '{}'", self.params.url))?;
        if response.status() != reqwest::StatusCode::OK {
            bail!("download failed: HTTP {}", response.status());
        }

        let total = response.content_length().filter(|len| *len > 0);
        let mut file = fs::File::create(part)
            .with_context(|| format!("Failed to create '{}'", part.display()))?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut received: u64 = 0;
        let mut last_percent = None;

        loop {
            let n = response
                .read(&mut buf)
                .with_context(|| format!("Failed to read '{}'", self.params.url))?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n])
                .with_context(|| format!("Failed to write '{}'", part.display()))?;
            hasher.update(&buf[..n]);
            received += n as u64;

            if let Some(total) = total {
                let percent = (received.min(total) * 100 / total) as u32;
                if last_percent != Some(percent) {
                    last_percent = Some(percent);
                    bus.publish_progress(
                        &self.id,
                        f64::from(percent) / 100.0,
                        &format!("Downloading: {percent}%"),
                    );
                }
            }
        }
        file.flush()?;

        Ok((hex::encode(hasher.finalize()), received))
    }
}

impl Task for DownloadTask {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &str {
        "download"
    }

    fn validate(&self) -> anyhow::Result<()> {
        let url = self.params.url.trim();
        if url.is_empty() {
            bail!("url is required");
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            bail!("unsupported url '{}': expected http or https", url);
        }
        if self.params.destination.is_empty() {
            bail!("destination is required");
        }
        if let Some(digest) = self.expected_digest()
            && (digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()))
        {
            bail!("sha256 must be 64 hex characters");
        }
        Ok(())
    }

    fn execute(&mut self, ctx: &InstallContext, bus: &EventBus) -> anyhow::Result<()> {
        let dst = PathBuf::from(&self.params.destination);
        let file_name = dst
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .with_context(|| format!("destination '{}' has no file name", dst.display()))?;
        let part = dst.with_file_name(format!("{file_name}.part"));

        if let Some(parent) = dst.parent() {
            self.journal.ensure_dir(parent)?;
        }
        ctx.add_log(
            LogLevel::Info,
            format!("Downloading {} to {}", self.params.url, dst.display()),
        );

        let (digest, size) = match self.fetch(&part, bus) {
            Ok(fetched) => fetched,
            Err(e) => {
                let _ = fs::remove_file(&part);
                return Err(e);
            }
        };
        if let Some(expected) = self.expected_digest()
            && expected != digest
        {
            let _ = fs::remove_file(&part);
            bail!("checksum mismatch: expected {expected}, got {digest}");
        }

        self.journal.record_target(&dst, true)?;
        fs::rename(&part, &dst)
            .with_context(|| format!("Failed to move download into '{}'", dst.display()))?;

        ctx.add_log(
            LogLevel::Info,
            format!("Downloaded {} ({} bytes)", dst.display(), size),
        );
        Ok(())
    }

    fn can_rollback(&self) -> bool {
        true
    }

    fn rollback(&mut self, ctx: &InstallContext, _bus: &EventBus) -> anyhow::Result<()> {
        if self.journal.is_empty() {
            return Ok(());
        }
        self.journal.undo()?;
        ctx.add_log(
            LogLevel::Info,
            format!("Removed download {}", self.params.destination),
        );
        Ok(())
    }
}

/// Last path segment of a URL, without query or fragment
fn url_basename(url: &str) -> &str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.trim_end_matches('/').rsplit('/').next().unwrap_or("")
}
