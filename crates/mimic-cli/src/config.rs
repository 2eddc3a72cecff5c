//! User configuration file (`~/.mimic/config.yaml`).
//!
//! Every key is optional. Command-line flags and their environment variables
//! take precedence over values read here.

use anyhow::{Context, Result};
use mimic_engine::{EngineKind, EngineSettings, ImageRepositories, LogLevel};
use mimic_recorder::PoolSettings;
use serde::Deserialize;
use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CliConfig {
    pub engine: EngineConfig,
    pub log_level: Option<LogLevel>,
    pub images: ImageRepositories,
    pub releases: ReleasesConfig,
    pub proxy: ProxyConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    #[serde(rename = "type")]
    pub kind: Option<EngineKind>,
    pub version: Option<String>,
    /// Seconds to wait for a started engine to report ready.
    pub start_timeout: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReleasesConfig {
    pub api_url: Option<String>,
    pub download_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxyConfig {
    pub max_idle_per_host: Option<usize>,
    pub idle_timeout_secs: Option<u64>,
}

impl CliConfig {
    /// Read the file at `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()))
            }
        };
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&contents).with_context(|| format!("invalid configuration in {}", path.display()))
    }

    pub fn engine_settings(&self) -> EngineSettings {
        let defaults = EngineSettings::default();
        EngineSettings {
            images: self.images.clone(),
            release_api_url: self
                .releases
                .api_url
                .clone()
                .unwrap_or(defaults.release_api_url),
            download_url: self
                .releases
                .download_url
                .clone()
                .unwrap_or(defaults.download_url),
            start_timeout: self
                .engine
                .start_timeout
                .map(Duration::from_secs)
                .unwrap_or(defaults.start_timeout),
        }
    }

    pub fn pool_settings(&self) -> PoolSettings {
        let defaults = PoolSettings::default();
        PoolSettings {
            max_idle_per_host: self.proxy.max_idle_per_host.unwrap_or(defaults.max_idle_per_host),
            idle_timeout: self
                .proxy
                .idle_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.idle_timeout),
            ..defaults
        }
    }
}
