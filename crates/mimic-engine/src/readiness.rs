//! Readiness probe against an engine's status endpoint.

use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::error::{EngineError, Result};

pub const STATUS_PATH: &str = "/system/status";
pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_millis(100);
const REQUEST_TIMEOUT: Duration = Duration::from_millis(500);

pub fn status_url(port: u16) -> String {
    format!("http://localhost:{port}{STATUS_PATH}")
}

/// Poll `http://localhost:<port>/system/status` until it answers 2xx.
///
/// When `terminated` is given and flips to true the probe gives up early,
/// since an engine that already exited will never become ready.
pub async fn wait_until_up(
    client: &reqwest::Client,
    port: u16,
    timeout: Duration,
    mut terminated: Option<watch::Receiver<bool>>,
) -> Result<()> {
    let url = status_url(port);
    let start = Instant::now();
    debug!(url = %url, timeout_secs = timeout.as_secs(), "Waiting for engine readiness");

    loop {
        match client.get(&url).timeout(REQUEST_TIMEOUT).send().await {
            Ok(resp) if resp.status().is_success() => {
                info!(port, elapsed_ms = start.elapsed().as_millis() as u64, "Engine is up");
                return Ok(());
            }
            Ok(resp) => {
                debug!(url = %url, status = %resp.status(), "Engine not ready");
            }
            Err(e) => {
                debug!(url = %url, error = %e, "Status request failed");
            }
        }

        if let Some(rx) = terminated.as_mut() {
            if *rx.borrow_and_update() {
                return Err(EngineError::Lifecycle(format!(
                    "engine on port {port} exited before becoming ready"
                )));
            }
        }

        if start.elapsed() >= timeout {
            return Err(EngineError::NotReady {
                port,
                timeout_secs: timeout.as_secs(),
            });
        }
        sleep(POLL_INTERVAL).await;
    }
}
