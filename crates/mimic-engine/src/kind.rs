//! Engine kinds, pull policies and log levels.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::EngineError;

/// The ways mimic knows how to fetch and run the mock engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EngineKind {
    /// Container image with the core plugins
    ContainerCore,
    /// Container image with every plugin bundled
    ContainerAll,
    /// Distroless container image
    ContainerDistroless,
    /// Single JAR run with the host's Java
    JvmSingleJar,
    /// Unpacked Java distribution run with the host's Java
    JvmUnpacked,
    /// Self-contained native executable
    NativeBinary,
    /// Deployment package for a serverless runtime
    ServerlessPackage,
}

impl EngineKind {
    pub const ALL: [EngineKind; 7] = [
        EngineKind::ContainerCore,
        EngineKind::ContainerAll,
        EngineKind::ContainerDistroless,
        EngineKind::JvmSingleJar,
        EngineKind::JvmUnpacked,
        EngineKind::NativeBinary,
        EngineKind::ServerlessPackage,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::ContainerCore => "container-core",
            EngineKind::ContainerAll => "container-all",
            EngineKind::ContainerDistroless => "container-distroless",
            EngineKind::JvmSingleJar => "jvm-single-jar",
            EngineKind::JvmUnpacked => "jvm-unpacked",
            EngineKind::NativeBinary => "native-binary",
            EngineKind::ServerlessPackage => "serverless-package",
        }
    }

    /// Kinds whose artifacts live in the container runtime's image store.
    pub fn is_container(&self) -> bool {
        matches!(
            self,
            EngineKind::ContainerCore | EngineKind::ContainerAll | EngineKind::ContainerDistroless
        )
    }

    /// Kinds that run on the host JVM.
    pub fn is_jvm(&self) -> bool {
        matches!(self, EngineKind::JvmSingleJar | EngineKind::JvmUnpacked)
    }

    /// Kinds that can be started as a local engine instance.
    pub fn is_runnable(&self) -> bool {
        !matches!(self, EngineKind::ServerlessPackage)
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EngineKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| {
                let known: Vec<&str> = EngineKind::ALL.iter().map(|k| k.as_str()).collect();
                EngineError::Config(format!(
                    "unknown engine type '{s}'; expected one of: {}",
                    known.join(", ")
                ))
            })
    }
}

/// Whether the artifact cache is consulted, refreshed or bypassed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PullPolicy {
    /// Trust that the artifact is already present
    Skip,
    /// Fetch only when the artifact is missing
    #[default]
    IfAbsent,
    /// Always fetch
    Always,
}

impl PullPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            PullPolicy::Skip => "skip",
            PullPolicy::IfAbsent => "if-absent",
            PullPolicy::Always => "always",
        }
    }
}

impl fmt::Display for PullPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PullPolicy {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "skip" => Ok(PullPolicy::Skip),
            "if-absent" | "ifabsent" => Ok(PullPolicy::IfAbsent),
            "always" => Ok(PullPolicy::Always),
            other => Err(EngineError::Config(format!(
                "unknown pull policy '{other}'; expected skip, if-absent or always"
            ))),
        }
    }
}

/// Log level handed to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    /// Form the engine expects in its `MIMIC_LOG_LEVEL` variable.
    pub fn engine_value(&self) -> String {
        self.as_str().to_uppercase()
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(EngineError::Config(format!("unknown log level '{other}'"))),
        }
    }
}
