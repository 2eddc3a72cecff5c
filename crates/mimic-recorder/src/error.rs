//! Error type for the recording proxy and the exchange recorder.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecorderError {
    /// Invalid upstream URL or recorder option.
    #[error("configuration error: {0}")]
    Config(String),

    /// The session's mock configuration is already on disk.
    #[error("mock configuration {0} already exists; remove it or choose another output directory")]
    AlreadyExists(PathBuf),

    /// Building the upstream TLS connector failed.
    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_yaml::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RecorderError>;
