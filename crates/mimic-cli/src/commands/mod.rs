mod bundle;
mod doctor;
mod down;
mod engine;
mod list;
mod proxy;
mod up;
mod version;

use anyhow::Result;
use mimic_engine::{EngineKind, LogLevel, Registry, LATEST_VERSION};
use tracing::{info, warn};

use crate::cli::{Commands, EngineArgs, EngineCommands, KindFilter};
use crate::config::CliConfig;

/// Everything a command needs, resolved once in `main`.
pub struct App {
    pub registry: Registry,
    pub config: CliConfig,
    pub log_level: LogLevel,
}

impl App {
    /// Flag or environment first, then the config file, then `container-core`.
    pub fn engine_kind(&self, args: &EngineArgs) -> EngineKind {
        args.engine_type
            .or(self.config.engine.kind)
            .unwrap_or(EngineKind::ContainerCore)
    }

    /// Requested version before `latest` is resolved.
    pub fn requested_version(&self, args: &EngineArgs) -> String {
        args.engine_version
            .clone()
            .or_else(|| self.config.engine.version.clone())
            .unwrap_or_else(|| LATEST_VERSION.to_string())
    }

    pub async fn engine_version(&self, args: &EngineArgs) -> String {
        self.registry
            .resolve_version(&self.requested_version(args))
            .await
    }

    /// The one kind asked for, or every kind that can run locally.
    pub fn runnable_kinds(&self, filter: &KindFilter) -> Vec<EngineKind> {
        match filter.engine_type {
            Some(kind) => vec![kind],
            None => self.registry.runnable_kinds(),
        }
    }
}

pub async fn run(app: &App, cmd: Commands) -> Result<()> {
    match cmd {
        Commands::Up(args) => up::cmd_up(app, args).await,
        Commands::Down(args) => down::cmd_down(app, args).await,
        Commands::List(args) => list::cmd_list(app, args).await,
        Commands::Proxy(args) => proxy::cmd_proxy(app, args).await,
        Commands::Bundle(args) => bundle::cmd_bundle(app, args).await,
        Commands::Engine(args) => match args.cmd {
            EngineCommands::Pull(args) => engine::cmd_pull(app, args).await,
            EngineCommands::List(args) => engine::cmd_list(app, args).await,
        },
        Commands::Version(args) => version::cmd_version(app, args).await,
        Commands::Doctor => doctor::cmd_doctor(app).await,
    }
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
