//! Engine providers, artifact cache and lifecycle supervision for mimic.

// ===== Building blocks =====
pub mod debounce;
pub mod error;
pub mod kind;
pub mod options;
pub mod paths;
pub mod prefs;
pub mod waitgroup;

// ===== Host and network probes =====
pub mod discovery;
pub mod java;
pub mod readiness;
pub mod version;

// ===== Artifacts =====
pub mod bundle;
pub mod cache;

// ===== Providers and engines =====
pub mod context;
pub mod engine;
pub mod provider;
pub mod registry;

pub use context::{EngineContext, EngineSettings, ImageRepositories};
pub use debounce::{Debouncer, LifecycleEvent};
pub use discovery::ManagedEngine;
pub use engine::Engine;
pub use error::{EngineError, Result};
pub use kind::{EngineKind, LogLevel, PullPolicy};
pub use options::{DirectoryMount, StartOptions, DEFAULT_PORT, LATEST_VERSION};
pub use paths::ToolPaths;
pub use provider::{CachedVersion, EngineArtifact, Provider};
pub use registry::Registry;
pub use waitgroup::WaitGroup;
