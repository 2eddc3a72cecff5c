use anyhow::{Context, Result};
use mimic_engine::paths::ensure_dir;
use std::path::Path;
use tracing::info;

use super::App;
use crate::cli::BundleArgs;

pub async fn cmd_bundle(app: &App, args: BundleArgs) -> Result<()> {
    let kind = app.engine_kind(&args.engine);
    let version = app.engine_version(&args.engine).await;
    let config_dir = args
        .config_dir
        .canonicalize()
        .with_context(|| format!("config directory {} not found", args.config_dir.display()))?;

    let dest = match args.output {
        Some(dest) => dest,
        None => default_destination(app, kind.is_container(), &config_dir)?,
    };

    let provider = app.registry.provider(kind, &version)?;
    info!(kind = %kind, version = %version, "Bundling {}", config_dir.display());
    provider
        .bundle(&config_dir, &dest)
        .await
        .with_context(|| format!("failed to bundle {}", config_dir.display()))?;

    println!("{dest}");
    Ok(())
}

/// `<dir-name>:latest` for images, `~/.mimic/bundles/<dir-name>.zip` otherwise.
fn default_destination(app: &App, image: bool, config_dir: &Path) -> Result<String> {
    let name = config_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "mocks".to_string());
    if image {
        return Ok(format!("{name}:latest"));
    }
    let bundles = ensure_dir(&app.registry.context().paths.bundles_dir())?;
    Ok(bundles.join(format!("{name}.zip")).display().to_string())
}
