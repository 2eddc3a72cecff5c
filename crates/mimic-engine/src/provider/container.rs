use async_trait::async_trait;
use bollard::image::{CreateImageOptions, ListImagesOptions};
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

use super::{CachedVersion, EngineArtifact, Provider};
use crate::bundle::{build_context, build_image};
use crate::context::EngineContext;
use crate::error::{EngineError, Result};
use crate::kind::{EngineKind, PullPolicy};

/// Engine shipped as a container image; the runtime's image store is the cache.
pub struct ContainerProvider {
    ctx: EngineContext,
    kind: EngineKind,
    version: String,
    repository: String,
}

impl ContainerProvider {
    pub fn new(ctx: EngineContext, kind: EngineKind, version: impl Into<String>) -> Result<Self> {
        let repository = ctx
            .settings
            .images
            .for_kind(kind)
            .ok_or_else(|| EngineError::Config(format!("{kind} is not a container engine type")))?
            .to_string();
        Ok(Self {
            ctx,
            kind,
            version: version.into(),
            repository,
        })
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn image_tag(&self) -> String {
        format!("{}:{}", self.repository, self.version)
    }

    async fn image_present(&self, docker: &Docker, tag: &str) -> Result<bool> {
        match docker.inspect_image(tag).await {
            Ok(_) => Ok(true),
            Err(e) => {
                let e = EngineError::from(e);
                if e.is_not_found() {
                    Ok(false)
                } else {
                    Err(e)
                }
            }
        }
    }

    async fn pull(&self, docker: &Docker) -> Result<()> {
        let tag = self.image_tag();
        info!(image = %tag, "Pulling engine image");
        let options = CreateImageOptions {
            from_image: self.repository.clone(),
            tag: self.version.clone(),
            ..Default::default()
        };

        let mut progress = docker.create_image(Some(options), None, None);
        while let Some(event) = progress.next().await {
            let event = event.map_err(|e| EngineError::Artifact {
                url: tag.clone(),
                status: None,
                reason: e.to_string(),
            })?;
            if let Some(error) = event.error {
                return Err(EngineError::Artifact {
                    url: tag.clone(),
                    status: None,
                    reason: error,
                });
            }
            if let Some(status) = event.status {
                debug!(image = %tag, progress = event.progress.as_deref().unwrap_or(""), "{}", status);
            }
        }
        info!(image = %tag, "Pulled engine image");
        Ok(())
    }
}

#[async_trait]
impl Provider for ContainerProvider {
    fn kind(&self) -> EngineKind {
        self.kind
    }

    fn version(&self) -> &str {
        &self.version
    }

    async fn check_prereqs(&self) -> (bool, Vec<String>) {
        let docker = match self.ctx.docker() {
            Ok(docker) => docker,
            Err(e) => return (false, vec![e.to_string()]),
        };
        match docker.version().await {
            Ok(version) => (
                true,
                vec![format!(
                    "container runtime reachable (server version {})",
                    version.version.as_deref().unwrap_or("unknown")
                )],
            ),
            Err(e) => (
                false,
                vec![format!(
                    "container runtime is not reachable: {e} (make sure the Docker daemon is running)"
                )],
            ),
        }
    }

    async fn list(&self) -> Result<Vec<CachedVersion>> {
        let docker = self.ctx.docker()?;
        let options = ListImagesOptions {
            filters: HashMap::from([("reference".to_string(), vec![self.repository.clone()])]),
            ..Default::default()
        };
        let prefix = format!("{}:", self.repository);

        let mut versions: Vec<CachedVersion> = docker
            .list_images(Some(options))
            .await?
            .into_iter()
            .flat_map(|image| image.repo_tags)
            .filter_map(|tag| tag.strip_prefix(&prefix).map(str::to_string))
            .map(|version| CachedVersion {
                kind: self.kind,
                version,
            })
            .collect();
        versions.sort_by(|a, b| a.version.cmp(&b.version));
        versions.dedup();
        Ok(versions)
    }

    async fn materialize(&self, policy: PullPolicy) -> Result<EngineArtifact> {
        let tag = self.image_tag();
        match policy {
            PullPolicy::Skip => {}
            PullPolicy::IfAbsent => {
                let docker = self.ctx.docker()?;
                if self.image_present(&docker, &tag).await? {
                    debug!(image = %tag, "Engine image already present");
                } else {
                    self.pull(&docker).await?;
                }
            }
            PullPolicy::Always => {
                let docker = self.ctx.docker()?;
                self.pull(&docker).await?;
            }
        }
        Ok(EngineArtifact::Image(tag))
    }

    async fn bundle(&self, config_dir: &Path, dest: &str) -> Result<()> {
        let base = self.image_tag();
        self.materialize(PullPolicy::IfAbsent).await?;
        let context = build_context(config_dir, &self.repository, &self.version)?;
        let docker = self.ctx.docker()?;
        build_image(&docker, context, dest, &base).await
    }

    fn is_sealed_distro(&self) -> bool {
        self.kind == EngineKind::ContainerDistroless
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::EngineSettings;
    use crate::paths::ToolPaths;

    fn ctx() -> (tempfile::TempDir, EngineContext) {
        let tmp = tempfile::TempDir::new().unwrap();
        let ctx = EngineContext::new(ToolPaths::with_root(tmp.path()), EngineSettings::default())
            .unwrap();
        (tmp, ctx)
    }

    #[test]
    fn test_image_tag_uses_kind_repository() {
        let (_tmp, ctx) = ctx();
        let provider = ContainerProvider::new(ctx, EngineKind::ContainerAll, "4.2.0").unwrap();
        assert_eq!(provider.image_tag(), "mimicdev/engine-all:4.2.0");
        assert!(!provider.is_sealed_distro());
    }

    #[test]
    fn test_non_container_kind_is_rejected() {
        let (_tmp, ctx) = ctx();
        let result = ContainerProvider::new(ctx, EngineKind::NativeBinary, "4.2.0");
        assert!(matches!(result, Err(EngineError::Config(_))));
    }

    #[test]
    fn test_start_command_is_unsupported() {
        let (_tmp, ctx) = ctx();
        let provider = ContainerProvider::new(ctx, EngineKind::ContainerDistroless, "4.2.0").unwrap();
        assert!(provider.is_sealed_distro());
        assert!(matches!(
            provider.start_command(&[], &[]),
            Err(EngineError::Unsupported { .. })
        ));
    }

    #[tokio::test]
    async fn test_skip_policy_does_not_contact_runtime() {
        let (_tmp, ctx) = ctx();
        let provider = ContainerProvider::new(ctx, EngineKind::ContainerCore, "4.2.0").unwrap();
        let artifact = provider.materialize(PullPolicy::Skip).await.unwrap();
        assert_eq!(artifact, EngineArtifact::Image("mimicdev/engine:4.2.0".to_string()));
    }
}
