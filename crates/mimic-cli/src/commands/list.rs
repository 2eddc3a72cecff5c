use anyhow::Result;
use mimic_engine::{EngineKind, StartOptions};
use serde::Serialize;
use tracing::warn;

use super::App;
use crate::cli::ListArgs;

#[derive(Debug, Serialize)]
struct Row {
    kind: EngineKind,
    name: String,
    id: String,
    port: u16,
}

pub async fn cmd_list(app: &App, args: ListArgs) -> Result<()> {
    let explicit = args.filter.engine_type.is_some();
    let mut rows = Vec::new();

    for kind in app.runnable_kinds(&args.filter) {
        let engine = app.registry.engine(kind, ".", StartOptions::default())?;
        match engine.list_all_managed().await {
            Ok(found) => rows.extend(found.into_iter().map(|e| Row {
                kind,
                name: e.name,
                id: e.id,
                port: e.port,
            })),
            Err(e) if !explicit => warn!(kind = %kind, "Skipping: {}", e),
            Err(e) => return Err(e.into()),
        }
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }
    if rows.is_empty() {
        println!("No managed engines running");
        return Ok(());
    }
    println!("{:<22} {:<28} {:<14} {:>6}", "TYPE", "NAME", "ID", "PORT");
    for row in rows {
        println!(
            "{:<22} {:<28} {:<14} {:>6}",
            row.kind.as_str(),
            row.name,
            row.id,
            row.port
        );
    }
    Ok(())
}
