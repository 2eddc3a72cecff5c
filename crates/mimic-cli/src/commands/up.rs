use anyhow::{bail, Context, Result};
use mimic_engine::{LifecycleEvent, StartOptions, WaitGroup};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{error, info, warn};

use super::{shutdown_signal, App};
use crate::cli::UpArgs;

/// How long stopped engines get to report termination before we exit anyway.
const STOP_WAIT: Duration = Duration::from_secs(10);

/// How long to wait for the termination event once the wait-group drains.
const EVENT_WAIT: Duration = Duration::from_millis(500);

pub async fn cmd_up(app: &App, args: UpArgs) -> Result<()> {
    let kind = app.engine_kind(&args.engine);
    let version = app.engine_version(&args.engine).await;
    let config_dir = args
        .config_dir
        .canonicalize()
        .with_context(|| format!("config directory {} not found", args.config_dir.display()))?;

    let options = StartOptions {
        port: args.port,
        version,
        pull_policy: args.pull_policy,
        log_level: app.log_level,
        directory_mounts: args.mounts,
        environment: args.env,
        replace_running: args.replace_running,
    };

    let wg = WaitGroup::new();
    let mut events = app.registry.context().debouncer.subscribe();
    let mut engine = app
        .registry
        .engine(kind, &config_dir, options)
        .with_context(|| format!("cannot run {kind} engines"))?;

    info!(
        kind = %kind,
        version = %engine.options().version,
        config_dir = %config_dir.display(),
        "Starting engine"
    );
    engine
        .start(&wg)
        .await
        .with_context(|| format!("failed to start {kind} engine"))?;
    info!(
        id = engine.id().as_deref().unwrap_or("-"),
        "Mock engine up at http://localhost:{}",
        args.port
    );

    tokio::select! {
        _ = shutdown_signal() => {
            info!("Stopping engine");
            engine.stop(&wg).await.context("failed to stop engine")?;
            if !wg.wait_timeout(STOP_WAIT).await {
                warn!("Engine did not report termination within {:?}", STOP_WAIT);
            }
            return Ok(());
        }
        _ = wg.wait() => {}
    }

    // The engine went away on its own; report why.
    if let Some(event) = termination_event(&mut events).await {
        if let Some(err) = event.err {
            error!(id = %event.id, "Engine terminated: {}", err);
            bail!("engine {} exited unexpectedly: {err}", event.id);
        }
    }
    info!("Engine stopped");
    Ok(())
}

/// The event that drained the wait-group, if one arrives within
/// [`EVENT_WAIT`].
async fn termination_event(
    events: &mut broadcast::Receiver<LifecycleEvent>,
) -> Option<LifecycleEvent> {
    loop {
        match tokio::time::timeout(EVENT_WAIT, events.recv()).await {
            Ok(Ok(event)) => return Some(event),
            Ok(Err(RecvError::Lagged(skipped))) => {
                warn!(skipped, "Missed lifecycle events");
            }
            Ok(Err(RecvError::Closed)) | Err(_) => return None,
        }
    }
}
