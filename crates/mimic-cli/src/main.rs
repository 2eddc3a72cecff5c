//! `mimic`: run, record and package mock HTTP engines.

mod cli;
mod commands;
mod config;
mod logging;

use anyhow::{Context, Result};
use clap::Parser;
use mimic_engine::{EngineContext, Registry, ToolPaths};
use tracing::error;

use crate::cli::Cli;
use crate::commands::App;
use crate::config::CliConfig;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let paths = ToolPaths::resolve(cli.home.clone())?;
    let config = CliConfig::load(&paths.config_file())?;
    let log_level = cli.log_level.or(config.log_level).unwrap_or_default();
    logging::init(log_level);

    let ctx = EngineContext::new(paths, config.engine_settings())
        .context("failed to initialize engine context")?;
    let app = App {
        registry: Registry::with_builtin_kinds(ctx),
        config,
        log_level,
    };

    if let Err(e) = commands::run(&app, cli.cmd).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
    Ok(())
}
