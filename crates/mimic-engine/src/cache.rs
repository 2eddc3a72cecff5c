//! Versioned on-disk cache of engine artifacts.
//!
//! Files are downloaded to a uniquely named temporary path next to their
//! destination and renamed into place, so a cache entry is either complete or
//! absent. Fills for the same destination within one process queue behind a
//! per-path lock; racing processes each download and the last rename wins.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::kind::PullPolicy;
use crate::options::LATEST_VERSION;
use crate::paths::{ensure_dir, set_file_mode};

/// Where an artifact is downloaded from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactSource {
    pub url: String,
    /// Tried once when `url` answers 404.
    pub fallback_url: Option<String>,
}

impl ArtifactSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            fallback_url: None,
        }
    }

    pub fn with_fallback(mut self, url: impl Into<String>) -> Self {
        self.fallback_url = Some(url.into());
        self
    }
}

/// URL of a release asset: the untagged-latest location for `latest`,
/// otherwise the `v<version>` tag.
pub fn release_asset_url(base: &str, version: &str, file: &str) -> String {
    let base = base.trim_end_matches('/');
    if version == LATEST_VERSION {
        format!("{base}/latest/download/{file}")
    } else {
        format!("{base}/download/v{version}/{file}")
    }
}

#[derive(Debug, Clone)]
pub struct BinaryCache {
    client: reqwest::Client,
    in_flight: Arc<Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>>,
}

/// Per-destination fill lock. The map entry is removed when the last holder
/// drops its handle.
struct InFlight<'a> {
    map: &'a Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
    dest: PathBuf,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut map = self.map.lock();
        // the map's reference plus ours
        if Arc::strong_count(&self.lock) == 2 {
            map.remove(&self.dest);
        }
    }
}

impl BinaryCache {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Cache directory for one kind, created with mode 0700 when absent.
    pub fn ensure_dir(&self, dir: &Path) -> Result<PathBuf> {
        ensure_dir(dir)
    }

    /// Make `dest` hold the artifact described by `source`.
    ///
    /// - `Skip` returns `dest` without touching disk or network.
    /// - `IfAbsent` returns early when a non-empty entry is present.
    /// - `Always` downloads unconditionally.
    pub async fn materialize(
        &self,
        dest: &Path,
        source: &ArtifactSource,
        policy: PullPolicy,
    ) -> Result<PathBuf> {
        if policy == PullPolicy::Skip {
            return Ok(dest.to_path_buf());
        }

        let in_flight = self.lock_for(dest);
        let _guard = in_flight.lock.lock().await;

        if policy == PullPolicy::IfAbsent && is_present(dest) {
            debug!(path = %dest.display(), "Artifact already cached");
            return Ok(dest.to_path_buf());
        }

        self.fetch(dest, source).await?;
        Ok(dest.to_path_buf())
    }

    fn lock_for(&self, dest: &Path) -> InFlight<'_> {
        let mut in_flight = self.in_flight.lock();
        let lock = Arc::clone(in_flight.entry(dest.to_path_buf()).or_default());
        InFlight {
            map: &self.in_flight,
            dest: dest.to_path_buf(),
            lock,
        }
    }

    async fn fetch(&self, dest: &Path, source: &ArtifactSource) -> Result<()> {
        if let Some(parent) = dest.parent() {
            ensure_dir(parent)?;
        }
        let temp = temp_path(dest);

        let result = match self.fetch_with_fallback(&temp, source).await {
            Ok(()) => tokio::fs::rename(&temp, dest).await.map_err(EngineError::from),
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                if let Err(e) = set_file_mode(dest, 0o644) {
                    warn!(path = %dest.display(), error = %e, "Unable to set artifact permissions");
                }
                info!(path = %dest.display(), "Artifact cached");
                Ok(())
            }
            Err(e) => {
                remove_residue(&temp, dest);
                Err(e)
            }
        }
    }

    async fn fetch_with_fallback(&self, temp: &Path, source: &ArtifactSource) -> Result<()> {
        match (self.download(&source.url, temp).await, source.fallback_url.as_deref()) {
            (Err(EngineError::Artifact { status: Some(404), .. }), Some(fallback)) => {
                info!(url = %source.url, fallback = %fallback, "Artifact not found, trying fallback name");
                self.download(fallback, temp).await
            }
            (result, _) => result,
        }
    }

    async fn download(&self, url: &str, temp: &Path) -> Result<()> {
        info!(url = %url, "Downloading engine artifact");
        let artifact_err = |status: Option<u16>, reason: String| EngineError::Artifact {
            url: url.to_string(),
            status,
            reason,
        };

        let mut resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| artifact_err(None, e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(artifact_err(
                Some(status.as_u16()),
                format!("unexpected HTTP status {status}"),
            ));
        }

        let mut file = tokio::fs::File::create(temp).await?;
        let mut written: u64 = 0;
        while let Some(chunk) = resp
            .chunk()
            .await
            .map_err(|e| artifact_err(Some(status.as_u16()), e.to_string()))?
        {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        if written == 0 {
            return Err(artifact_err(
                Some(status.as_u16()),
                "empty response body".to_string(),
            ));
        }
        debug!(url = %url, bytes = written, "Download complete");
        Ok(())
    }
}

/// A cache entry counts when it is a directory or a non-empty file.
pub fn is_present(path: &Path) -> bool {
    fs::metadata(path)
        .map(|meta| meta.is_dir() || meta.len() > 0)
        .unwrap_or(false)
}

fn temp_path(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "artifact".to_string());
    dest.with_file_name(format!("{name}.{}.download", uuid::Uuid::new_v4()))
}

fn remove_residue(temp: &Path, dest: &Path) {
    let _ = fs::remove_file(temp);
    if fs::metadata(dest).map(|m| m.is_file() && m.len() == 0).unwrap_or(false) {
        debug!(path = %dest.display(), "Removing empty artifact");
        let _ = fs::remove_file(dest);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_release_asset_url() {
        assert_eq!(
            release_asset_url("https://example.com/releases/", "latest", "engine.jar"),
            "https://example.com/releases/latest/download/engine.jar"
        );
        assert_eq!(
            release_asset_url("https://example.com/releases", "4.1.0", "engine-4.1.0.jar"),
            "https://example.com/releases/download/v4.1.0/engine-4.1.0.jar"
        );
    }

    #[tokio::test]
    async fn test_skip_returns_path_without_fetching() {
        let tmp = TempDir::new().unwrap();
        let cache = BinaryCache::new(reqwest::Client::new());
        let dest = tmp.path().join("engine-1.0.0.jar");
        // the source is unreachable; skip must never try it
        let source = ArtifactSource::new("http://127.0.0.1:9/engine.jar");

        let path = cache.materialize(&dest, &source, PullPolicy::Skip).await.unwrap();
        assert_eq!(path, dest);
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_if_absent_short_circuits_on_present_file() {
        let tmp = TempDir::new().unwrap();
        let cache = BinaryCache::new(reqwest::Client::new());
        let dest = tmp.path().join("engine-1.0.0.jar");
        fs::write(&dest, b"cached").unwrap();
        let source = ArtifactSource::new("http://127.0.0.1:9/engine.jar");

        let path = cache
            .materialize(&dest, &source, PullPolicy::IfAbsent)
            .await
            .unwrap();
        assert_eq!(fs::read(path).unwrap(), b"cached");
    }

    #[tokio::test]
    async fn test_failed_fetch_leaves_no_residue() {
        let tmp = TempDir::new().unwrap();
        let cache = BinaryCache::new(reqwest::Client::new());
        let dest = tmp.path().join("engine-1.0.0.jar");
        fs::write(&dest, b"").unwrap();
        let source = ArtifactSource::new("http://127.0.0.1:9/engine.jar");

        let err = cache
            .materialize(&dest, &source, PullPolicy::IfAbsent)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Artifact { status: None, .. }));
        assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_empty_file_is_not_present() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("empty");
        fs::write(&file, b"").unwrap();
        assert!(!is_present(&file));
        assert!(is_present(tmp.path()));
        assert!(!is_present(&tmp.path().join("missing")));
    }

    #[test]
    fn test_in_flight_entry_removed_with_last_holder() {
        let tmp = TempDir::new().unwrap();
        let cache = BinaryCache::new(reqwest::Client::new());
        let dest = tmp.path().join("engine.jar");

        let first = cache.lock_for(&dest);
        let second = cache.lock_for(&dest);
        assert!(Arc::ptr_eq(&first.lock, &second.lock));
        drop(first);
        assert_eq!(cache.in_flight.lock().len(), 1);
        drop(second);
        assert!(cache.in_flight.lock().is_empty());
    }

    #[tokio::test]
    async fn test_materialize_leaves_no_in_flight_entry() {
        let tmp = TempDir::new().unwrap();
        let cache = BinaryCache::new(reqwest::Client::new());
        let dest = tmp.path().join("engine.jar");
        std::fs::write(&dest, b"jar").unwrap();
        let source = ArtifactSource::new("http://127.0.0.1:9/engine.jar");

        cache.materialize(&dest, &source, PullPolicy::IfAbsent).await.unwrap();
        assert!(cache.in_flight.lock().is_empty());
    }
}
