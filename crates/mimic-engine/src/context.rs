//! Shared state handed to providers and engines for one CLI invocation.

use bollard::Docker;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::cache::BinaryCache;
use crate::debounce::Debouncer;
use crate::error::{EngineError, Result};
use crate::kind::EngineKind;
use crate::paths::ToolPaths;
use crate::prefs::Preferences;
use crate::readiness::DEFAULT_START_TIMEOUT;
use crate::version::VersionResolver;

pub const DEFAULT_RELEASE_API_URL: &str =
    "https://api.github.com/repos/mimic-dev/mimic-engine/releases/latest";
pub const DEFAULT_DOWNLOAD_URL: &str = "https://github.com/mimic-dev/mimic-engine/releases";

/// Image repository per container kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImageRepositories {
    pub core: String,
    pub all: String,
    pub distroless: String,
}

impl Default for ImageRepositories {
    fn default() -> Self {
        Self {
            core: "mimicdev/engine".to_string(),
            all: "mimicdev/engine-all".to_string(),
            distroless: "mimicdev/engine-distroless".to_string(),
        }
    }
}

impl ImageRepositories {
    pub fn for_kind(&self, kind: EngineKind) -> Option<&str> {
        match kind {
            EngineKind::ContainerCore => Some(&self.core),
            EngineKind::ContainerAll => Some(&self.all),
            EngineKind::ContainerDistroless => Some(&self.distroless),
            _ => None,
        }
    }
}

/// Settings resolved from the configuration file and environment.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub images: ImageRepositories,
    pub release_api_url: String,
    /// Base of release downloads; assets live under `download/v<version>/`.
    pub download_url: String,
    pub start_timeout: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            images: ImageRepositories::default(),
            release_api_url: DEFAULT_RELEASE_API_URL.to_string(),
            download_url: DEFAULT_DOWNLOAD_URL.to_string(),
            start_timeout: DEFAULT_START_TIMEOUT,
        }
    }
}

/// Everything a provider or engine needs from its surroundings.
/// Cloning is cheap; clones share the HTTP pool, cache locks and debouncer.
#[derive(Debug, Clone)]
pub struct EngineContext {
    pub paths: ToolPaths,
    pub prefs: Preferences,
    pub client: reqwest::Client,
    pub cache: BinaryCache,
    pub settings: Arc<EngineSettings>,
    pub debouncer: Arc<Debouncer>,
}

impl EngineContext {
    pub fn new(paths: ToolPaths, settings: EngineSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("mimic/", env!("CARGO_PKG_VERSION")))
            .pool_idle_timeout(Duration::from_secs(30))
            .build()?;
        let prefs = Preferences::new(paths.prefs_file());
        Ok(Self {
            paths,
            prefs,
            cache: BinaryCache::new(client.clone()),
            client,
            settings: Arc::new(settings),
            debouncer: Arc::new(Debouncer::new()),
        })
    }

    pub fn version_resolver(&self) -> VersionResolver {
        VersionResolver::new(
            self.client.clone(),
            self.prefs.clone(),
            self.settings.release_api_url.clone(),
        )
    }

    /// Connect to the local container runtime. Does not contact the daemon.
    pub fn docker(&self) -> Result<Docker> {
        Docker::connect_with_local_defaults().map_err(|e| {
            EngineError::prerequisite(
                format!("unable to connect to the container runtime: {e}"),
                "install Docker and make sure the daemon is running",
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_for_kind() {
        let images = ImageRepositories::default();
        assert_eq!(images.for_kind(EngineKind::ContainerAll), Some("mimicdev/engine-all"));
        assert_eq!(images.for_kind(EngineKind::JvmSingleJar), None);
    }

    #[test]
    fn test_partial_image_config_keeps_defaults() {
        let images: ImageRepositories = serde_json::from_str(r#"{"core": "acme/mock"}"#).unwrap();
        assert_eq!(images.core, "acme/mock");
        assert_eq!(images.distroless, "mimicdev/engine-distroless");
    }

    #[test]
    fn test_context_shares_debouncer_between_clones() {
        let tmp = tempfile::TempDir::new().unwrap();
        let ctx = EngineContext::new(ToolPaths::with_root(tmp.path()), EngineSettings::default())
            .unwrap();
        let other = ctx.clone();
        assert!(Arc::ptr_eq(&ctx.debouncer, &other.debouncer));
        assert_eq!(ctx.prefs.path(), tmp.path().join("prefs.json"));
    }
}
