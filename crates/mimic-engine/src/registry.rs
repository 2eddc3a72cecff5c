//! Mapping from engine kind to provider and engine constructors.
//!
//! Built once in `main` and read-only afterwards. This is the only place
//! that knows the concrete set of kinds.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::context::EngineContext;
use crate::discovery::{jvm_port, native_port, ProcessDiscovery, ProcessMatcher};
use crate::engine::{ContainerEngine, Engine, ProcessEngine};
use crate::error::{EngineError, Result};
use crate::kind::EngineKind;
use crate::options::StartOptions;
use crate::provider::{
    ContainerProvider, JarProvider, NativeProvider, Provider, ServerlessProvider,
    UnpackedProvider, NATIVE_BINARY, UNPACKED_MAIN_CLASS,
};

pub type ProviderFactory = fn(EngineContext, &str) -> Result<Box<dyn Provider>>;
pub type EngineFactory = fn(EngineContext, PathBuf, StartOptions) -> Result<Box<dyn Engine>>;

pub struct Registry {
    ctx: EngineContext,
    providers: HashMap<EngineKind, ProviderFactory>,
    engines: HashMap<EngineKind, EngineFactory>,
}

impl Registry {
    /// An empty registry. Most callers want [`Registry::with_builtin_kinds`].
    pub fn new(ctx: EngineContext) -> Self {
        Self {
            ctx,
            providers: HashMap::new(),
            engines: HashMap::new(),
        }
    }

    pub fn with_builtin_kinds(ctx: EngineContext) -> Self {
        let mut registry = Self::new(ctx);
        registry.register(EngineKind::ContainerCore, core_provider, core_engine);
        registry.register(EngineKind::ContainerAll, all_provider, all_engine);
        registry.register(EngineKind::ContainerDistroless, distroless_provider, distroless_engine);
        registry.register(EngineKind::JvmSingleJar, jar_provider, jar_engine);
        registry.register(EngineKind::JvmUnpacked, unpacked_provider, unpacked_engine);
        registry.register(EngineKind::NativeBinary, native_provider, native_engine);
        registry.register_provider(EngineKind::ServerlessPackage, serverless_provider);
        registry
    }

    pub fn register(&mut self, kind: EngineKind, provider: ProviderFactory, engine: EngineFactory) {
        self.register_provider(kind, provider);
        self.engines.insert(kind, engine);
    }

    pub fn register_provider(&mut self, kind: EngineKind, provider: ProviderFactory) {
        self.providers.insert(kind, provider);
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    /// Kinds with a provider, in declaration order.
    pub fn kinds(&self) -> Vec<EngineKind> {
        EngineKind::ALL
            .into_iter()
            .filter(|kind| self.providers.contains_key(kind))
            .collect()
    }

    /// Kinds that can run as a local engine.
    pub fn runnable_kinds(&self) -> Vec<EngineKind> {
        EngineKind::ALL
            .into_iter()
            .filter(|kind| self.engines.contains_key(kind))
            .collect()
    }

    /// `latest` becomes the resolved release; other versions pass through.
    pub async fn resolve_version(&self, requested: &str) -> String {
        self.ctx.version_resolver().resolve(requested).await
    }

    pub fn provider(&self, kind: EngineKind, version: &str) -> Result<Box<dyn Provider>> {
        let factory = self
            .providers
            .get(&kind)
            .ok_or_else(|| EngineError::Config(format!("no provider registered for {kind}")))?;
        factory(self.ctx.clone(), version)
    }

    pub fn engine(
        &self,
        kind: EngineKind,
        config_dir: impl Into<PathBuf>,
        options: StartOptions,
    ) -> Result<Box<dyn Engine>> {
        let factory = self.engines.get(&kind).ok_or(EngineError::Unsupported {
            kind,
            operation: "running locally",
        })?;
        factory(self.ctx.clone(), config_dir.into(), options)
    }
}

fn container_provider(
    ctx: EngineContext,
    kind: EngineKind,
    version: &str,
) -> Result<Box<dyn Provider>> {
    Ok(Box::new(ContainerProvider::new(ctx, kind, version)?))
}

fn core_provider(ctx: EngineContext, version: &str) -> Result<Box<dyn Provider>> {
    container_provider(ctx, EngineKind::ContainerCore, version)
}

fn all_provider(ctx: EngineContext, version: &str) -> Result<Box<dyn Provider>> {
    container_provider(ctx, EngineKind::ContainerAll, version)
}

fn distroless_provider(ctx: EngineContext, version: &str) -> Result<Box<dyn Provider>> {
    container_provider(ctx, EngineKind::ContainerDistroless, version)
}

fn container_engine(
    ctx: EngineContext,
    kind: EngineKind,
    config_dir: PathBuf,
    options: StartOptions,
) -> Result<Box<dyn Engine>> {
    let provider = ContainerProvider::new(ctx.clone(), kind, options.version.clone())?;
    Ok(Box::new(ContainerEngine::new(ctx, provider, config_dir, options)))
}

fn core_engine(ctx: EngineContext, dir: PathBuf, options: StartOptions) -> Result<Box<dyn Engine>> {
    container_engine(ctx, EngineKind::ContainerCore, dir, options)
}

fn all_engine(ctx: EngineContext, dir: PathBuf, options: StartOptions) -> Result<Box<dyn Engine>> {
    container_engine(ctx, EngineKind::ContainerAll, dir, options)
}

fn distroless_engine(
    ctx: EngineContext,
    dir: PathBuf,
    options: StartOptions,
) -> Result<Box<dyn Engine>> {
    container_engine(ctx, EngineKind::ContainerDistroless, dir, options)
}

fn jar_provider(ctx: EngineContext, version: &str) -> Result<Box<dyn Provider>> {
    Ok(Box::new(JarProvider::new(ctx, version)))
}

fn unpacked_provider(ctx: EngineContext, version: &str) -> Result<Box<dyn Provider>> {
    Ok(Box::new(UnpackedProvider::new(ctx, version)))
}

fn native_provider(ctx: EngineContext, version: &str) -> Result<Box<dyn Provider>> {
    Ok(Box::new(NativeProvider::new(ctx, version)))
}

fn serverless_provider(ctx: EngineContext, version: &str) -> Result<Box<dyn Provider>> {
    Ok(Box::new(ServerlessProvider::new(ctx, version)))
}

/// Matches `java ... engine-<version>.jar`.
pub fn jar_matcher() -> Result<ProcessMatcher> {
    ProcessMatcher::new("java", r"[/\\]engine-[^/\\]+\.jar$", jvm_port)
}

/// Matches `java -classpath ... <main class>`.
pub fn unpacked_matcher() -> Result<ProcessMatcher> {
    ProcessMatcher::new(
        "java",
        &format!("^{}$", regex::escape(UNPACKED_MAIN_CLASS)),
        jvm_port,
    )
}

/// Matches the native engine executable.
pub fn native_matcher() -> Result<ProcessMatcher> {
    let name = NATIVE_BINARY.trim_end_matches(".exe");
    ProcessMatcher::new(
        name,
        &format!(r"(^|[/\\]){}(\.exe)?$", regex::escape(name)),
        native_port,
    )
}

fn process_engine(
    ctx: EngineContext,
    provider: Box<dyn Provider>,
    matcher: ProcessMatcher,
    config_dir: PathBuf,
    options: StartOptions,
) -> Result<Box<dyn Engine>> {
    Ok(Box::new(ProcessEngine::new(
        ctx,
        provider,
        ProcessDiscovery::new(matcher),
        config_dir,
        options,
    )))
}

fn jar_engine(ctx: EngineContext, dir: PathBuf, options: StartOptions) -> Result<Box<dyn Engine>> {
    let provider = jar_provider(ctx.clone(), &options.version)?;
    process_engine(ctx, provider, jar_matcher()?, dir, options)
}

fn unpacked_engine(
    ctx: EngineContext,
    dir: PathBuf,
    options: StartOptions,
) -> Result<Box<dyn Engine>> {
    let provider = unpacked_provider(ctx.clone(), &options.version)?;
    process_engine(ctx, provider, unpacked_matcher()?, dir, options)
}

fn native_engine(
    ctx: EngineContext,
    dir: PathBuf,
    options: StartOptions,
) -> Result<Box<dyn Engine>> {
    let provider = native_provider(ctx.clone(), &options.version)?;
    process_engine(ctx, provider, native_matcher()?, dir, options)
}
