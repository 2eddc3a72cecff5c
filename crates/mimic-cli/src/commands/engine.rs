use anyhow::{Context, Result};
use mimic_engine::LATEST_VERSION;
use tracing::{info, warn};

use super::App;
use crate::cli::{KindFilter, PullArgs};

pub async fn cmd_pull(app: &App, args: PullArgs) -> Result<()> {
    let kind = app.engine_kind(&args.engine);
    let version = app.engine_version(&args.engine).await;
    let provider = app.registry.provider(kind, &version)?;

    info!(kind = %kind, version = %version, policy = %args.pull_policy, "Pulling engine");
    let artifact = provider
        .materialize(args.pull_policy)
        .await
        .with_context(|| format!("failed to pull {kind} {version}"))?;
    println!("{artifact}");
    Ok(())
}

pub async fn cmd_list(app: &App, args: KindFilter) -> Result<()> {
    let explicit = args.engine_type.is_some();
    let kinds = match args.engine_type {
        Some(kind) => vec![kind],
        None => app.registry.kinds(),
    };

    let mut versions = Vec::new();
    for kind in kinds {
        let provider = app.registry.provider(kind, LATEST_VERSION)?;
        match provider.list().await {
            Ok(found) => versions.extend(found),
            Err(e) if !explicit => warn!(kind = %kind, "Skipping: {}", e),
            Err(e) => return Err(e.into()),
        }
    }

    if versions.is_empty() {
        println!("No engines cached");
        return Ok(());
    }
    println!("{:<22} VERSION", "TYPE");
    for cached in versions {
        println!("{:<22} {}", cached.kind.as_str(), cached.version);
    }
    Ok(())
}
