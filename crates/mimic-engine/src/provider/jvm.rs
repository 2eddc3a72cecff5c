use async_trait::async_trait;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use zip::ZipArchive;

use super::{
    release_source, versioned_dirs, versioned_files, CachedVersion, EngineArtifact, Provider,
    StartCommand,
};
use crate::cache::is_present;
use crate::context::EngineContext;
use crate::error::{EngineError, Result};
use crate::java::find_java;
use crate::kind::{EngineKind, PullPolicy};

pub const UNPACKED_MAIN_CLASS: &str = "io.mimic.server.Main";

const JAR_PREFIX: &str = "engine-";
const JAR_SUFFIX: &str = ".jar";
const DISTRO_ARCHIVE_PREFIX: &str = "engine-distro-";
const DISTRO_DIR: &str = "distro";

fn java_prereqs() -> (bool, Vec<String>) {
    match find_java() {
        Ok(java) => (true, vec![format!("java found at {}", java.display())]),
        Err(e) => (false, vec![e.to_string()]),
    }
}

fn no_bundle(kind: EngineKind) -> EngineError {
    EngineError::Unsupported {
        kind,
        operation: "bundling",
    }
}

/// A single executable JAR run with the host's `java -jar`.
pub struct JarProvider {
    ctx: EngineContext,
    version: String,
}

impl JarProvider {
    pub fn new(ctx: EngineContext, version: impl Into<String>) -> Self {
        Self {
            ctx,
            version: version.into(),
        }
    }

    pub fn jar_path(&self) -> PathBuf {
        self.ctx
            .paths
            .cache_dir()
            .join(format!("{JAR_PREFIX}{}{JAR_SUFFIX}", self.version))
    }
}

#[async_trait]
impl Provider for JarProvider {
    fn kind(&self) -> EngineKind {
        EngineKind::JvmSingleJar
    }

    fn version(&self) -> &str {
        &self.version
    }

    async fn check_prereqs(&self) -> (bool, Vec<String>) {
        java_prereqs()
    }

    async fn list(&self) -> Result<Vec<CachedVersion>> {
        let versions = versioned_files(&self.ctx.paths.cache_dir(), JAR_PREFIX, JAR_SUFFIX)?;
        Ok(versions
            .into_iter()
            .map(|version| CachedVersion {
                kind: self.kind(),
                version,
            })
            .collect())
    }

    async fn materialize(&self, policy: PullPolicy) -> Result<EngineArtifact> {
        self.ctx.cache.ensure_dir(&self.ctx.paths.cache_dir())?;
        let source = release_source(
            &self.ctx.settings.download_url,
            &self.version,
            "mimic-engine",
            JAR_SUFFIX,
        );
        let path = self
            .ctx
            .cache
            .materialize(&self.jar_path(), &source, policy)
            .await?;
        Ok(EngineArtifact::File(path))
    }

    async fn bundle(&self, _config_dir: &Path, _dest: &str) -> Result<()> {
        Err(no_bundle(self.kind()))
    }

    fn start_command(&self, args: &[String], env: &[String]) -> Result<StartCommand> {
        let mut argv = vec!["-jar".to_string(), self.jar_path().display().to_string()];
        argv.extend_from_slice(args);
        Ok(StartCommand {
            program: find_java()?,
            args: argv,
            env: env.to_vec(),
        })
    }

    fn is_sealed_distro(&self) -> bool {
        false
    }
}

/// A Java distribution (a `lib/` directory of JARs) extracted into the cache.
pub struct UnpackedProvider {
    ctx: EngineContext,
    version: String,
}

impl UnpackedProvider {
    pub fn new(ctx: EngineContext, version: impl Into<String>) -> Self {
        Self {
            ctx,
            version: version.into(),
        }
    }

    fn distro_root(&self) -> PathBuf {
        self.ctx.paths.cache_dir().join(DISTRO_DIR)
    }

    pub fn install_dir(&self) -> PathBuf {
        self.distro_root().join(&self.version)
    }

    fn archive_path(&self) -> PathBuf {
        self.ctx
            .paths
            .cache_dir()
            .join(format!("{DISTRO_ARCHIVE_PREFIX}{}.zip", self.version))
    }

    fn classpath(&self) -> String {
        let lib = self.install_dir().join("lib");
        format!("{}{}*", lib.display(), std::path::MAIN_SEPARATOR)
    }
}

#[async_trait]
impl Provider for UnpackedProvider {
    fn kind(&self) -> EngineKind {
        EngineKind::JvmUnpacked
    }

    fn version(&self) -> &str {
        &self.version
    }

    async fn check_prereqs(&self) -> (bool, Vec<String>) {
        java_prereqs()
    }

    async fn list(&self) -> Result<Vec<CachedVersion>> {
        let versions = versioned_dirs(&self.distro_root(), "lib")?;
        Ok(versions
            .into_iter()
            .map(|version| CachedVersion {
                kind: self.kind(),
                version,
            })
            .collect())
    }

    async fn materialize(&self, policy: PullPolicy) -> Result<EngineArtifact> {
        let install_dir = self.install_dir();
        if policy == PullPolicy::Skip
            || (policy == PullPolicy::IfAbsent && is_present(&install_dir))
        {
            return Ok(EngineArtifact::Directory(install_dir));
        }

        self.ctx.cache.ensure_dir(&self.distro_root())?;
        let source = release_source(
            &self.ctx.settings.download_url,
            &self.version,
            "mimic-engine-distro",
            ".zip",
        );
        let archive = self
            .ctx
            .cache
            .materialize(&self.archive_path(), &source, policy)
            .await?;

        let target = install_dir.clone();
        tokio::task::spawn_blocking(move || install_distribution(&archive, &target))
            .await
            .map_err(|e| EngineError::Lifecycle(format!("extraction task failed: {e}")))??;
        Ok(EngineArtifact::Directory(install_dir))
    }

    async fn bundle(&self, _config_dir: &Path, _dest: &str) -> Result<()> {
        Err(no_bundle(self.kind()))
    }

    fn start_command(&self, args: &[String], env: &[String]) -> Result<StartCommand> {
        let mut argv = vec![
            "-classpath".to_string(),
            self.classpath(),
            UNPACKED_MAIN_CLASS.to_string(),
        ];
        argv.extend_from_slice(args);
        Ok(StartCommand {
            program: find_java()?,
            args: argv,
            env: env.to_vec(),
        })
    }

    fn is_sealed_distro(&self) -> bool {
        false
    }
}

/// Extract `archive` into a sibling temp directory, then swap it into `target`.
/// A single top-level directory in the archive is unwrapped.
fn install_distribution(archive: &Path, target: &Path) -> Result<()> {
    let parent = target
        .parent()
        .ok_or_else(|| EngineError::Config(format!("invalid install path {}", target.display())))?;
    let staging = parent.join(format!(".extract-{}", uuid::Uuid::new_v4()));

    let result = extract_zip(archive, &staging).and_then(|()| {
        let root = distribution_root(&staging)?;
        if target.exists() {
            fs::remove_dir_all(target)?;
        }
        fs::rename(&root, target)?;
        Ok(())
    });
    let _ = fs::remove_dir_all(&staging);
    if result.is_ok() {
        info!(path = %target.display(), "Engine distribution installed");
    }
    result
}

fn extract_zip(archive: &Path, dest: &Path) -> Result<()> {
    let mut zip = ZipArchive::new(File::open(archive)?)?;
    fs::create_dir_all(dest)?;
    for index in 0..zip.len() {
        let mut entry = zip.by_index(index)?;
        let Some(rel) = entry.enclosed_name() else {
            debug!(name = entry.name(), "Skipping archive entry outside the target");
            continue;
        };
        let out = dest.join(rel);
        if entry.is_dir() {
            fs::create_dir_all(&out)?;
            continue;
        }
        if let Some(parent) = out.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = File::create(&out)?;
        io::copy(&mut entry, &mut file)?;
    }
    Ok(())
}

fn distribution_root(staging: &Path) -> Result<PathBuf> {
    if staging.join("lib").is_dir() {
        return Ok(staging.to_path_buf());
    }
    let mut dirs = fs::read_dir(staging)?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .map(|e| e.path());
    match (dirs.next(), dirs.next()) {
        (Some(only), None) if only.join("lib").is_dir() => Ok(only),
        _ => Err(EngineError::Artifact {
            url: staging.display().to_string(),
            status: None,
            reason: "distribution archive has no lib directory".to_string(),
        }),
    }
}
