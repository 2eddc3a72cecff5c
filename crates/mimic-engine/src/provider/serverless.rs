use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::info;

use super::{release_source, versioned_files, CachedVersion, EngineArtifact, Provider};
use crate::bundle::zip_bundle;
use crate::context::EngineContext;
use crate::error::{EngineError, Result};
use crate::kind::{EngineKind, PullPolicy};

const PACKAGE_PREFIX: &str = "engine-lambda-";
const PACKAGE_SUFFIX: &str = ".zip";
pub const REGION_ENV: &str = "AWS_DEFAULT_REGION";

/// Serverless deployment package. Never runs locally; only bundles.
pub struct ServerlessProvider {
    ctx: EngineContext,
    version: String,
}

impl ServerlessProvider {
    pub fn new(ctx: EngineContext, version: impl Into<String>) -> Self {
        Self {
            ctx,
            version: version.into(),
        }
    }

    pub fn package_path(&self) -> PathBuf {
        self.ctx
            .paths
            .cache_dir()
            .join(format!("{PACKAGE_PREFIX}{}{PACKAGE_SUFFIX}", self.version))
    }
}

#[async_trait]
impl Provider for ServerlessProvider {
    fn kind(&self) -> EngineKind {
        EngineKind::ServerlessPackage
    }

    fn version(&self) -> &str {
        &self.version
    }

    async fn check_prereqs(&self) -> (bool, Vec<String>) {
        let region = std::env::var(REGION_ENV).ok().filter(|r| !r.is_empty());
        let message = match region {
            Some(region) => format!("deployment region is {region}"),
            None => format!("{REGION_ENV} is not set; deployments need an explicit region"),
        };
        (true, vec![message])
    }

    async fn list(&self) -> Result<Vec<CachedVersion>> {
        let versions =
            versioned_files(&self.ctx.paths.cache_dir(), PACKAGE_PREFIX, PACKAGE_SUFFIX)?;
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
            "mimic-engine-lambda",
            PACKAGE_SUFFIX,
        );
        let path = self
            .ctx
            .cache
            .materialize(&self.package_path(), &source, policy)
            .await?;
        Ok(EngineArtifact::File(path))
    }

    async fn bundle(&self, config_dir: &Path, dest: &str) -> Result<()> {
        let EngineArtifact::File(package) = self.materialize(PullPolicy::IfAbsent).await? else {
            return Err(EngineError::Lifecycle("engine package is not a file".into()));
        };
        let config_dir = config_dir.to_path_buf();
        let dest = PathBuf::from(dest);
        let written = dest.clone();
        tokio::task::spawn_blocking(move || zip_bundle(&package, &config_dir, &dest))
            .await
            .map_err(|e| EngineError::Lifecycle(format!("bundle task failed: {e}")))??;
        info!(path = %written.display(), "Serverless bundle written");
        Ok(())
    }

    fn is_sealed_distro(&self) -> bool {
        true
    }
}
