use anyhow::Result;
use mimic_engine::StartOptions;
use tracing::{info, warn};

use super::App;
use crate::cli::KindFilter;

pub async fn cmd_down(app: &App, args: KindFilter) -> Result<()> {
    let explicit = args.engine_type.is_some();
    let mut stopped = 0;

    for kind in app.runnable_kinds(&args) {
        let engine = app.registry.engine(kind, ".", StartOptions::default())?;
        match engine.stop_all_managed().await {
            Ok(n) => {
                if n > 0 {
                    info!(kind = %kind, count = n, "Stopped engines");
                }
                stopped += n;
            }
            // Without a filter, a missing runtime only means nothing of that kind runs.
            Err(e) if !explicit => warn!(kind = %kind, "Skipping: {}", e),
            Err(e) => return Err(e.into()),
        }
    }

    println!("Stopped {stopped} engine(s)");
    Ok(())
}
