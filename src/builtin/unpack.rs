//! `unpack` task: extract a tar, tar.gz or zip archive.
//!
//! The format comes from the file's magic bytes unless `format` is given.
//! Entry paths are confined to the destination: absolute paths, `..`
//! components and symlinks pointing outside it are rejected.
//! `stripPrefix` drops that many leading path components from every entry.
//! Rollback removes what was extracted and restores overwritten files.

use anyhow::{Context, bail};
use flate2::read::GzDecoder;
use serde::Deserialize;
use std::fs;
use std::io::{self, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use strum::Display;

use super::journal::FileJournal;
use crate::config::TaskConfig;
use crate::context::{InstallContext, LogLevel};
use crate::error::Result;
use crate::events::EventBus;
use crate::task::Task;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Display)]
pub enum ArchiveFormat {
    #[serde(rename = "tar")]
    #[strum(serialize = "tar")]
    Tar,
    #[serde(rename = "tar.gz", alias = "tgz")]
    #[strum(serialize = "tar.gz")]
    TarGz,
    #[serde(rename = "zip")]
    #[strum(serialize = "zip")]
    Zip,
}

impl ArchiveFormat {
    /// Recognize an archive from its leading bytes
    pub fn detect(header: &[u8]) -> Option<Self> {
        match header {
            [0x50, 0x4B, 0x03, 0x04, ..] => Some(Self::Zip),
            [0x1F, 0x8B, ..] => Some(Self::TarGz),
            _ if header.len() >= 262 && &header[257..262] == b"ustar" => Some(Self::Tar),
            _ => None,
        }
    }

    fn detect_file(path: &Path) -> anyhow::Result<Option<Self>> {
        let mut header = Vec::with_capacity(512);
        fs::File::open(path)
            .with_context(|| format!("source '{}' is not accessible", path.display()))?
            .take(512)
            .read_to_end(&mut header)?;
        Ok(Self::detect(&header))
    }
}

fn default_overwrite() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnpackParams {
    #[serde(default, alias = "archive")]
    pub source: String,
    #[serde(default, alias = "dest")]
    pub destination: String,
    /// Leading path components dropped from each entry
    #[serde(default, alias = "stripComponents")]
    pub strip_prefix: usize,
    #[serde(default)]
    pub format: Option<ArchiveFormat>,
    #[serde(default = "default_overwrite")]
    pub overwrite: bool,
}

#[derive(Debug)]
pub struct UnpackTask {
    id: String,
    params: UnpackParams,
    journal: FileJournal,
}

impl UnpackTask {
    pub fn from_config(config: &TaskConfig, ctx: &InstallContext) -> Result<Self> {
        let params: UnpackParams = config.decode_rendered(ctx)?;
        Ok(Self {
            id: super::task_id(config, "unpack", ""),
            params,
            journal: FileJournal::default(),
        })
    }

    fn unpack_tar<R: Read>(&mut self, reader: R, dest: &Path) -> anyhow::Result<usize> {
        let strip = self.params.strip_prefix;
        let mut archive = tar::Archive::new(reader);
        let mut files = 0;

        for entry in archive.entries().context("Failed to read tar archive")? {
            let mut entry = entry.context("Corrupted tar entry")?;
            let raw = entry.path().context("Invalid path in tar entry")?.into_owned();
            let Some(target) = entry_target(dest, &raw, strip)? else {
                continue;
            };
            let entry_type = entry.header().entry_type();

            if entry_type.is_dir() {
                self.journal.ensure_dir(&target)?;
            } else if entry_type.is_file() {
                let mode = entry.header().mode().ok();
                self.write_file(&target, &mut entry, mode)?;
                files += 1;
            } else if entry_type.is_symlink() {
                let link = entry
                    .link_name()?
                    .with_context(|| format!("symlink '{}' has no target", raw.display()))?
                    .into_owned();
                self.write_symlink(dest, &target, &link)?;
            } else {
                tracing::debug!("Skipping {:?} entry {}", entry_type, raw.display());
            }
        }
        Ok(files)
    }

    fn unpack_zip(&mut self, file: fs::File, dest: &Path) -> anyhow::Result<usize> {
        let strip = self.params.strip_prefix;
        let mut archive = zip::ZipArchive::new(file).context("Failed to read zip archive")?;
        let mut files = 0;

        for index in 0..archive.len() {
            let mut entry = archive
                .by_index(index)
                .with_context(|| format!("Corrupted zip entry #{index}"))?;
            let raw = entry
                .enclosed_name()
                .map(|p| p.to_path_buf())
                .with_context(|| format!("unsafe path '{}' in archive", entry.name()))?;
            let Some(target) = entry_target(dest, &raw, strip)? else {
                continue;
            };

            if entry.is_dir() {
                self.journal.ensure_dir(&target)?;
            } else {
                let mode = entry.unix_mode();
                self.write_file(&target, &mut entry, mode)?;
                files += 1;
            }
        }
        Ok(files)
    }

    fn write_file(
        &mut self,
        target: &Path,
        reader: &mut dyn Read,
        mode: Option<u32>,
    ) -> anyhow::Result<()> {
        if let Some(parent) = target.parent() {
            self.journal.ensure_dir(parent)?;
        }
        self.journal.record_target(target, self.params.overwrite)?;
        let mut file = fs::File::create(target)
            .with_context(|| format!("Failed to create '{}'", target.display()))?;
        io::copy(reader, &mut file)
            .with_context(|| format!("Failed to extract '{}'", target.display()))?;
        if let Some(mode) = mode.map(|m| m & 0o7777).filter(|m| *m != 0) {
            fs::set_permissions(target, fs::Permissions::from_mode(mode))?;
        }
        Ok(())
    }

    fn write_symlink(&mut self, dest: &Path, target: &Path, link: &Path) -> anyhow::Result<()> {
        if !link_stays_inside(dest, target, link) {
            bail!(
                "symlink '{}' -> '{}' points outside '{}'",
                target.display(),
                link.display(),
                dest.display()
            );
        }
        if self.journal.owns(target) {
            return Ok(());
        }
        if fs::symlink_metadata(target).is_ok() {
            bail!("destination '{}' already exists", target.display());
        }
        if let Some(parent) = target.parent() {
            self.journal.ensure_dir(parent)?;
        }
        std::os::unix::fs::symlink(link, target)
            .with_context(|| format!("Failed to create link '{}'", target.display()))?;
        self.journal.record_created(target.to_path_buf());
        Ok(())
    }
}

impl Task for UnpackTask {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &str {
        "unpack"
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.params.source.is_empty() {
            bail!("source is required");
        }
        if self.params.destination.is_empty() {
            bail!("destination is required");
        }
        Ok(())
    }

    fn execute(&mut self, ctx: &InstallContext, _bus: &EventBus) -> anyhow::Result<()> {
        let src = PathBuf::from(&self.params.source);
        let dest = PathBuf::from(&self.params.destination);

        let format = match self.params.format {
            Some(format) => format,
            None => ArchiveFormat::detect_file(&src)?.with_context(|| {
                format!("unsupported archive format: '{}'", src.display())
            })?,
        };
        self.journal.ensure_dir(&dest)?;

        let file = fs::File::open(&src)
            .with_context(|| format!("source '{}' is not accessible", src.display()))?;
        let files = match format {
            ArchiveFormat::Tar => self.unpack_tar(file, &dest)?,
            ArchiveFormat::TarGz => self.unpack_tar(GzDecoder::new(file), &dest)?,
            ArchiveFormat::Zip => self.unpack_zip(file, &dest)?,
        };

        ctx.add_log(
            LogLevel::Info,
            format!(
                "Unpacked {} file(s) from {} ({}) to {}",
                files,
                src.display(),
                format,
                dest.display()
            ),
        );
        Ok(())
    }

    fn can_rollback(&self) -> bool {
        true
    }

    fn rollback(&mut self, ctx: &InstallContext, _bus: &EventBus) -> anyhow::Result<()> {
        self.journal.undo()?;
        ctx.add_log(
            LogLevel::Info,
            format!("Removed files unpacked from {}", self.params.source),
        );
        Ok(())
    }
}

/// Where an entry lands under `dest`, or `None` when stripping leaves
/// nothing. Only plain components are accepted.
fn entry_target(dest: &Path, raw: &Path, strip: usize) -> anyhow::Result<Option<PathBuf>> {
    let mut parts = Vec::new();
    for component in raw.components() {
        match component {
            Component::Normal(part) => parts.push(part),
            Component::CurDir => {}
            _ => bail!("unsafe path '{}' in archive", raw.display()),
        }
    }
    if parts.len() <= strip {
        return Ok(None);
    }
    Ok(Some(parts[strip..].iter().fold(dest.to_path_buf(), |path, part| path.join(part))))
}

/// A relative `link` placed at `target` resolves inside `dest`
fn link_stays_inside(dest: &Path, target: &Path, link: &Path) -> bool {
    let Some(mut depth) = target
        .parent()
        .and_then(|parent| parent.strip_prefix(dest).ok())
        .map(|relative| relative.components().count())
    else {
        return false;
    };
    for component in link.components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            Component::ParentDir => match depth.checked_sub(1) {
                Some(up) => depth = up,
                None => return false,
            },
            Component::RootDir | Component::Prefix(_) => return false,
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;
    use tempfile::TempDir;

    /// `None` content makes a directory entry
    type Entries<'a> = &'a [(&'a str, Option<&'a str>)];

    fn tar_gz(path: &Path, entries: Entries<'_>) {
        let file = fs::File::create(path).expect("create");
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
        for (name, content) in entries {
            let mut header = tar::Header::new_gnu();
            match content {
                None => {
                    header.set_entry_type(tar::EntryType::Directory);
                    header.set_mode(0o755);
                    header.set_size(0);
                    builder
                        .append_data(&mut header, *name, io::empty())
                        .expect("dir entry");
                }
                Some(text) => {
                    header.set_entry_type(tar::EntryType::Regular);
                    header.set_mode(0o640);
                    header.set_size(text.len() as u64);
                    builder
                        .append_data(&mut header, *name, text.as_bytes())
                        .expect("file entry");
                }
            }
        }
        builder.into_inner().expect("tar").finish().expect("gzip");
    }

    fn zip_file(path: &Path, entries: Entries<'_>) {
        let file = fs::File::create(path).expect("create");
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        for (name, content) in entries {
            match content {
                None => writer.add_directory(*name, options).expect("dir entry"),
                Some(text) => {
                    writer.start_file(*name, options).expect("file entry");
                    writer.write_all(text.as_bytes()).expect("write");
                }
            }
        }
        writer.finish().expect("finish");
    }

    fn unpack(src: &Path, dest: &Path) -> TaskConfig {
        TaskConfig::new("unpack")
            .with_id("test-unpack")
            .with_param("source", src.to_string_lossy().to_string())
            .with_param("destination", dest.to_string_lossy().to_string())
    }

    const SAMPLE: &[(&str, Option<&str>)] = &[
        ("testdir/", None),
        ("testdir/file.txt", Some("test content")),
        ("testdir/sub/deep.txt", Some("deep")),
    ];

    #[test]
    fn test_validate() {
        let ctx = InstallContext::new();
        let task = UnpackTask::from_config(
            &TaskConfig::new("unpack").with_param("destination", "/tmp/out"),
            &ctx,
        )
        .expect("build");
        assert_eq!(task.validate().unwrap_err().to_string(), "source is required");

        let task = UnpackTask::from_config(
            &TaskConfig::new("unpack").with_param("source", "/tmp/a.tar.gz"),
            &ctx,
        )
        .expect("build");
        assert_eq!(
            task.validate().unwrap_err().to_string(),
            "destination is required"
        );
    }

    #[test]
    fn test_detect_format() {
        assert_eq!(ArchiveFormat::detect(&[0x50, 0x4B, 0x03, 0x04, 0x14]), Some(ArchiveFormat::Zip));
        assert_eq!(ArchiveFormat::detect(&[0x1F, 0x8B, 0x08]), Some(ArchiveFormat::TarGz));
        let mut tar_header = vec![0u8; 512];
        tar_header[257..263].copy_from_slice(b"ustar\0");
        assert_eq!(ArchiveFormat::detect(&tar_header), Some(ArchiveFormat::Tar));
        assert_eq!(ArchiveFormat::detect(b"data"), None);
    }

    #[test]
    fn test_unpack_tar_gz() {
        let dir = TempDir::new().expect("tempdir");
        let archive = dir.path().join("test.tar.gz");
        let dest = dir.path().join("extracted");
        tar_gz(&archive, SAMPLE);

        let ctx = InstallContext::new();
        let mut task = UnpackTask::from_config(&unpack(&archive, &dest), &ctx).expect("build");
        task.execute(&ctx, &EventBus::new()).expect("execute");

        let file = dest.join("testdir/file.txt");
        assert_eq!(fs::read_to_string(&file).expect("read"), "test content");
        assert_eq!(fs::read_to_string(dest.join("testdir/sub/deep.txt")).expect("read"), "deep");
        let mode = fs::metadata(&file).expect("meta").permissions().mode() & 0o7777;
        assert_eq!(mode, 0o640);
    }

    #[test]
    fn test_unpack_zip() {
        let dir = TempDir::new().expect("tempdir");
        let archive = dir.path().join("test.zip");
        let dest = dir.path().join("extracted");
        zip_file(&archive, SAMPLE);

        let ctx = InstallContext::new();
        let mut task = UnpackTask::from_config(&unpack(&archive, &dest), &ctx).expect("build");
        task.execute(&ctx, &EventBus::new()).expect("execute");

        assert_eq!(
            fs::read_to_string(dest.join("testdir/file.txt")).expect("read"),
            "test content"
        );
    }

    #[test]
    fn test_unpack_with_strip_prefix() {
        let dir = TempDir::new().expect("tempdir");
        let archive = dir.path().join("release.bin");
        let dest = dir.path().join("extracted");
        tar_gz(&archive, SAMPLE);

        let ctx = InstallContext::new();
        let config = unpack(&archive, &dest).with_param("stripPrefix", 1);
        let mut task = UnpackTask::from_config(&config, &ctx).expect("build");
        task.execute(&ctx, &EventBus::new()).expect("execute");

        assert_eq!(fs::read_to_string(dest.join("file.txt")).expect("read"), "test content");
        assert!(dest.join("sub/deep.txt").exists());
        assert!(!dest.join("testdir").exists());
    }

    #[test]
    fn test_rollback_removes_extracted_files() {
        let dir = TempDir::new().expect("tempdir");
        let archive = dir.path().join("test.zip");
        let dest = dir.path().join("extracted");
        zip_file(&archive, SAMPLE);

        let ctx = InstallContext::new();
        let bus = EventBus::new();
        let mut task = UnpackTask::from_config(&unpack(&archive, &dest), &ctx).expect("build");
        assert!(task.can_rollback());
        task.execute(&ctx, &bus).expect("execute");
        assert!(dest.join("testdir/file.txt").exists());

        task.rollback(&ctx, &bus).expect("rollback");
        assert!(!dest.exists());
        assert!(archive.exists());
    }

    #[test]
    fn test_rollback_restores_overwritten_file() {
        let dir = TempDir::new().expect("tempdir");
        let archive = dir.path().join("test.tar.gz");
        let dest = dir.path().join("extracted");
        fs::create_dir_all(dest.join("testdir")).expect("mkdir");
        fs::write(dest.join("testdir/file.txt"), "previous").expect("seed");
        tar_gz(&archive, SAMPLE);

        let ctx = InstallContext::new();
        let bus = EventBus::new();
        let mut task = UnpackTask::from_config(&unpack(&archive, &dest), &ctx).expect("build");
        task.execute(&ctx, &bus).expect("execute");
        assert_eq!(
            fs::read_to_string(dest.join("testdir/file.txt")).expect("read"),
            "test content"
        );

        task.rollback(&ctx, &bus).expect("rollback");
        assert_eq!(
            fs::read_to_string(dest.join("testdir/file.txt")).expect("read"),
            "previous"
        );
        assert!(!dest.join("testdir/sub").exists());
    }

    #[test]
    fn test_unsupported_format() {
        let dir = TempDir::new().expect("tempdir");
        let archive = dir.path().join("test.xyz");
        fs::write(&archive, "data").expect("write");

        let ctx = InstallContext::new();
        let mut task =
            UnpackTask::from_config(&unpack(&archive, &dir.path().join("extracted")), &ctx)
                .expect("build");
        let err = task.execute(&ctx, &EventBus::new()).unwrap_err();
        assert!(err.to_string().contains("unsupported archive format"), "{err}");
    }

    #[test]
    fn test_zip_entry_outside_destination_is_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let archive = dir.path().join("evil.zip");
        let dest = dir.path().join("extracted");
        zip_file(&archive, &[("../evil.txt", Some("escaped"))]);

        let ctx = InstallContext::new();
        let mut task = UnpackTask::from_config(&unpack(&archive, &dest), &ctx).expect("build");
        let err = task.execute(&ctx, &EventBus::new()).unwrap_err();
        assert!(err.to_string().contains("unsafe path"), "{err}");
        assert!(!dir.path().join("evil.txt").exists());
    }

    #[test]
    fn test_entry_target_and_link_confinement() {
        let dest = Path::new("/opt/app");
        assert_eq!(
            entry_target(dest, Path::new("./a/b.txt"), 0).expect("ok"),
            Some(PathBuf::from("/opt/app/a/b.txt"))
        );
        assert_eq!(entry_target(dest, Path::new("top/"), 1).expect("ok"), None);
        assert!(entry_target(dest, Path::new("a/../../etc/passwd"), 0).is_err());
        assert!(entry_target(dest, Path::new("/etc/passwd"), 0).is_err());

        let link = Path::new("/opt/app/bin/tool");
        assert!(link_stays_inside(dest, link, Path::new("../lib/tool")));
        assert!(!link_stays_inside(dest, link, Path::new("../../etc")));
        assert!(!link_stays_inside(dest, link, Path::new("/usr/bin/tool")));
    }
}
