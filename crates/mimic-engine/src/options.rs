//! Options an engine instance is launched with.

use std::path::PathBuf;
use std::str::FromStr;

use crate::error::EngineError;
use crate::kind::{LogLevel, PullPolicy};

pub const DEFAULT_PORT: u16 = 8080;
pub const LATEST_VERSION: &str = "latest";

/// A host directory exposed to the engine at a guest path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryMount {
    pub host: PathBuf,
    pub guest: String,
}

impl FromStr for DirectoryMount {
    type Err = EngineError;

    /// Parses `host-path:guest-path`. The last colon splits, so Windows
    /// drive letters in the host part survive.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, guest) = s.rsplit_once(':').ok_or_else(|| {
            EngineError::Config(format!("invalid mount '{s}'; expected host-path:guest-path"))
        })?;
        if host.is_empty() || guest.is_empty() {
            return Err(EngineError::Config(format!(
                "invalid mount '{s}'; both paths are required"
            )));
        }
        Ok(Self {
            host: PathBuf::from(host),
            guest: guest.to_string(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct StartOptions {
    pub port: u16,
    pub version: String,
    pub pull_policy: PullPolicy,
    pub log_level: LogLevel,
    /// Ignored by kinds that cannot mount.
    pub directory_mounts: Vec<DirectoryMount>,
    /// `KEY=VALUE` entries appended to the inherited environment.
    pub environment: Vec<String>,
    /// Stop any peer with the same fingerprint before starting.
    pub replace_running: bool,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            version: LATEST_VERSION.to_string(),
            pull_policy: PullPolicy::default(),
            log_level: LogLevel::default(),
            directory_mounts: Vec::new(),
            environment: Vec::new(),
            replace_running: false,
        }
    }
}

impl StartOptions {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.version.trim().is_empty() {
            return Err(EngineError::Config("engine version must not be empty".into()));
        }
        if let Some(bad) = self.environment.iter().find(|entry| !entry.contains('=')) {
            return Err(EngineError::Config(format!(
                "invalid environment entry '{bad}'; expected KEY=VALUE"
            )));
        }
        Ok(())
    }

    /// Environment handed to the engine: the log level first, then user entries
    /// so that users can override it.
    pub fn engine_environment(&self) -> Vec<String> {
        let mut env = vec![format!("MIMIC_LOG_LEVEL={}", self.log_level.engine_value())];
        env.extend(self.environment.iter().cloned());
        env
    }
}
