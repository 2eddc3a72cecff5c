use anyhow::Result;
use mimic_engine::{PullPolicy, StartOptions};
use tracing::warn;

use super::App;
use crate::cli::EngineArgs;

pub async fn cmd_version(app: &App, args: EngineArgs) -> Result<()> {
    println!("mimic {}", env!("CARGO_PKG_VERSION"));

    let kind = app.engine_kind(&args);
    let options = StartOptions {
        version: app.engine_version(&args).await,
        pull_policy: PullPolicy::IfAbsent,
        log_level: app.log_level,
        ..Default::default()
    };
    let engine_version = match app.registry.engine(kind, ".", options) {
        Ok(engine) => engine.version_string().await,
        Err(e) => Err(e),
    };
    match engine_version {
        Ok(v) => println!("engine ({kind}) {}", v.trim()),
        Err(e) => warn!(kind = %kind, "Unable to determine engine version: {}", e),
    }
    Ok(())
}
