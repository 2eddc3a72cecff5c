//! Per-kind knowledge of how to fetch, cache, locate and package the engine.

mod container;
mod jvm;
mod native;
mod serverless;

pub use container::ContainerProvider;
pub use jvm::{JarProvider, UnpackedProvider, UNPACKED_MAIN_CLASS};
pub use native::{NativeProvider, NATIVE_BINARY};
pub use serverless::ServerlessProvider;

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::cache::{release_asset_url, ArtifactSource};
use crate::error::{EngineError, Result};
use crate::kind::{EngineKind, PullPolicy};
use crate::options::LATEST_VERSION;

/// A version present in the local cache or image store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CachedVersion {
    pub kind: EngineKind,
    pub version: String,
}

/// The materialized form of a (kind, version).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineArtifact {
    File(PathBuf),
    Directory(PathBuf),
    Image(String),
}

impl fmt::Display for EngineArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineArtifact::File(path) | EngineArtifact::Directory(path) => {
                write!(f, "{}", path.display())
            }
            EngineArtifact::Image(tag) => f.write_str(tag),
        }
    }
}

/// Program, argv and extra environment for launching a process engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// `KEY=VALUE` entries added on top of the inherited environment.
    pub env: Vec<String>,
}

impl StartCommand {
    pub fn to_command(&self) -> tokio::process::Command {
        let mut command = tokio::process::Command::new(&self.program);
        command.args(&self.args);
        for entry in &self.env {
            if let Some((key, value)) = entry.split_once('=') {
                command.env(key, value);
            }
        }
        command
    }
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn kind(&self) -> EngineKind;

    fn version(&self) -> &str;

    /// Whether the host can run this kind, with human-readable findings.
    async fn check_prereqs(&self) -> (bool, Vec<String>);

    /// Versions of this kind already available locally.
    async fn list(&self) -> Result<Vec<CachedVersion>>;

    async fn materialize(&self, policy: PullPolicy) -> Result<EngineArtifact>;

    /// Package `config_dir` with the engine. `dest` is a file path for zip
    /// kinds and an image tag for container kinds.
    async fn bundle(&self, config_dir: &Path, dest: &str) -> Result<()>;

    /// How to launch this kind as a host process.
    fn start_command(&self, _args: &[String], _env: &[String]) -> Result<StartCommand> {
        Err(EngineError::Unsupported {
            kind: self.kind(),
            operation: "launching as a process",
        })
    }

    /// Sealed distributions cannot take additional plugins.
    fn is_sealed_distro(&self) -> bool;
}

/// Source for a release asset named `<stem>-<version><ext>`, falling back
/// to the unversioned `<stem><ext>` that older releases published.
pub(crate) fn release_source(base: &str, version: &str, stem: &str, ext: &str) -> ArtifactSource {
    let plain = format!("{stem}{ext}");
    if version == LATEST_VERSION {
        return ArtifactSource::new(release_asset_url(base, version, &plain));
    }
    ArtifactSource::new(release_asset_url(base, version, &format!("{stem}-{version}{ext}")))
        .with_fallback(release_asset_url(base, version, &plain))
}

/// Versions encoded in file names `<prefix><version><suffix>` inside `dir`.
pub(crate) fn versioned_files(dir: &Path, prefix: &str, suffix: &str) -> Result<Vec<String>> {
    let mut versions = Vec::new();
    for entry in read_dir_tolerant(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(version) = name
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_suffix(suffix))
            .filter(|v| !v.is_empty())
        {
            versions.push(version.to_string());
        }
    }
    versions.sort();
    Ok(versions)
}

/// Names of sub-directories of `dir` that contain `marker`.
pub(crate) fn versioned_dirs(dir: &Path, marker: &str) -> Result<Vec<String>> {
    let mut versions = Vec::new();
    for entry in read_dir_tolerant(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() && entry.path().join(marker).exists() {
            versions.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    versions.sort();
    Ok(versions)
}

fn read_dir_tolerant(dir: &Path) -> Result<Vec<std::io::Result<fs::DirEntry>>> {
    match fs::read_dir(dir) {
        Ok(entries) => Ok(entries.collect()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}
