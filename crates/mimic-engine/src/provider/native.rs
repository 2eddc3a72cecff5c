use async_trait::async_trait;
use std::env::consts::{ARCH, OS};
use std::path::{Path, PathBuf};
use tracing::warn;

use super::{release_source, versioned_dirs, CachedVersion, EngineArtifact, Provider, StartCommand};
use crate::context::EngineContext;
use crate::error::{EngineError, Result};
use crate::kind::{EngineKind, PullPolicy};
use crate::paths::set_file_mode;

#[cfg(windows)]
pub const NATIVE_BINARY: &str = "mimic-engine.exe";
#[cfg(not(windows))]
pub const NATIVE_BINARY: &str = "mimic-engine";

/// Self-contained engine executable, one directory per version under `images/`.
pub struct NativeProvider {
    ctx: EngineContext,
    version: String,
}

impl NativeProvider {
    pub fn new(ctx: EngineContext, version: impl Into<String>) -> Self {
        Self {
            ctx,
            version: version.into(),
        }
    }

    pub fn binary_path(&self) -> PathBuf {
        self.ctx
            .paths
            .images_dir()
            .join(&self.version)
            .join(NATIVE_BINARY)
    }

    /// Release asset stem for this host, e.g. `mimic-engine_linux_x86_64`.
    fn asset_stem() -> String {
        format!("mimic-engine_{OS}_{ARCH}")
    }
}

#[async_trait]
impl Provider for NativeProvider {
    fn kind(&self) -> EngineKind {
        EngineKind::NativeBinary
    }

    fn version(&self) -> &str {
        &self.version
    }

    async fn check_prereqs(&self) -> (bool, Vec<String>) {
        (
            true,
            vec![format!("native engine needs no runtime ({OS}/{ARCH})")],
        )
    }

    async fn list(&self) -> Result<Vec<CachedVersion>> {
        let versions = versioned_dirs(&self.ctx.paths.images_dir(), NATIVE_BINARY)?;
        Ok(versions
            .into_iter()
            .map(|version| CachedVersion {
                kind: self.kind(),
                version,
            })
            .collect())
    }

    async fn materialize(&self, policy: PullPolicy) -> Result<EngineArtifact> {
        let binary = self.binary_path();
        if let Some(dir) = binary.parent() {
            self.ctx.cache.ensure_dir(dir)?;
        }
        let ext = if cfg!(windows) { ".exe" } else { "" };
        let source = release_source(
            &self.ctx.settings.download_url,
            &self.version,
            &Self::asset_stem(),
            ext,
        );
        let path = self.ctx.cache.materialize(&binary, &source, policy).await?;
        if policy != PullPolicy::Skip {
            if let Err(e) = set_file_mode(&path, 0o755) {
                warn!(path = %path.display(), error = %e, "Unable to mark engine executable");
            }
        }
        Ok(EngineArtifact::File(path))
    }

    async fn bundle(&self, _config_dir: &Path, _dest: &str) -> Result<()> {
        Err(EngineError::Unsupported {
            kind: self.kind(),
            operation: "bundling",
        })
    }

    fn start_command(&self, args: &[String], env: &[String]) -> Result<StartCommand> {
        Ok(StartCommand {
            program: self.binary_path(),
            args: args.to_vec(),
            env: env.to_vec(),
        })
    }

    fn is_sealed_distro(&self) -> bool {
        true
    }
}
