//! Resolution of the `latest` engine version via release metadata.

use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::options::LATEST_VERSION;
use crate::prefs::{Preferences, KEY_LATEST_CHECKED, KEY_LATEST_VERSION};

/// How long a resolved `latest` stays fresh.
pub const STALENESS_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct ReleaseMetadata {
    tag_name: String,
}

/// Turns `latest` into a concrete version, caching the answer in preferences.
#[derive(Debug, Clone)]
pub struct VersionResolver {
    client: reqwest::Client,
    prefs: Preferences,
    api_url: String,
    staleness: Duration,
}

impl VersionResolver {
    pub fn new(client: reqwest::Client, prefs: Preferences, api_url: impl Into<String>) -> Self {
        Self {
            client,
            prefs,
            api_url: api_url.into(),
            staleness: STALENESS_WINDOW,
        }
    }

    pub fn with_staleness(mut self, staleness: Duration) -> Self {
        self.staleness = staleness;
        self
    }

    /// Concrete versions pass through; `latest` is resolved.
    pub async fn resolve(&self, requested: &str) -> String {
        if requested != LATEST_VERSION {
            return requested.to_string();
        }
        self.resolve_latest(true).await
    }

    /// Resolve `latest`. Falls back to the cached value (when `allow_cached`)
    /// and finally to the literal `latest` when nothing better is known.
    pub async fn resolve_latest(&self, allow_cached: bool) -> String {
        let cached = self.prefs.read_string(KEY_LATEST_VERSION).unwrap_or_else(|e| {
            warn!(error = %e, "Unable to read cached latest version");
            None
        });
        let checked = self.prefs.read_i64(KEY_LATEST_CHECKED).ok().flatten();

        if let (true, Some(version), Some(checked)) = (allow_cached, cached.as_ref(), checked) {
            let age = chrono::Utc::now().timestamp() - checked;
            if age >= 0 && (age as u64) < self.staleness.as_secs() {
                debug!(version = %version, age_secs = age, "Using cached latest version");
                return version.clone();
            }
        }

        match self.fetch_latest().await {
            Ok(version) => {
                info!(version = %version, "Resolved latest engine version");
                if let Err(e) = self.prefs.write(KEY_LATEST_VERSION, version.clone()) {
                    warn!(error = %e, "Unable to cache latest version");
                }
                if let Err(e) = self
                    .prefs
                    .write(KEY_LATEST_CHECKED, chrono::Utc::now().timestamp())
                {
                    warn!(error = %e, "Unable to record latest version check time");
                }
                version
            }
            Err(e) => match cached {
                Some(version) if allow_cached => {
                    warn!(error = %e, version = %version, "Release lookup failed, using cached latest version");
                    version
                }
                _ => {
                    warn!(error = %e, "Release lookup failed and no cached version is available");
                    LATEST_VERSION.to_string()
                }
            },
        }
    }

    async fn fetch_latest(&self) -> Result<String, reqwest::Error> {
        let metadata: ReleaseMetadata = self
            .client
            .get(&self.api_url)
            .header(reqwest::header::ACCEPT, "application/json")
            .timeout(LOOKUP_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(strip_version_prefix(&metadata.tag_name).to_string())
    }
}

/// `v4.2.1` → `4.2.1`
pub fn strip_version_prefix(tag: &str) -> &str {
    tag.strip_prefix('v').unwrap_or(tag)
}
