//! Error type shared by every engine component.

use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by providers, the artifact cache and engine instances.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Unrecognized kind, missing value or an invalid option.
    #[error("configuration error: {0}")]
    Config(String),

    /// A runtime the kind depends on is missing or unreachable.
    #[error("{message} ({hint})")]
    Prerequisite { message: String, hint: String },

    /// Fetching or locating an engine artifact failed.
    #[error("failed to fetch {url}: {reason}")]
    Artifact {
        url: String,
        status: Option<u16>,
        reason: String,
    },

    /// Creating, starting or removing an engine failed.
    #[error("engine lifecycle error: {0}")]
    Lifecycle(String),

    /// The engine did not answer its status endpoint in time.
    #[error("engine on port {port} was not ready within {timeout_secs}s")]
    NotReady { port: u16, timeout_secs: u64 },

    /// This kind does not support the requested operation.
    #[error("{operation} is not supported for engine type {kind}")]
    Unsupported {
        kind: crate::EngineKind,
        operation: &'static str,
    },

    #[error("destination {0} already exists")]
    AlreadyExists(PathBuf),

    #[error("container runtime error: {0}")]
    Container(#[from] bollard::errors::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn prerequisite(message: impl Into<String>, hint: impl Into<String>) -> Self {
        Self::Prerequisite {
            message: message.into(),
            hint: hint.into(),
        }
    }

    /// True when the container runtime reported that the object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            EngineError::Container(bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                ..
            })
        )
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
