//! Running engine instances and their supervision.
//!
//! An instance moves NEW → RUNNING on a successful `start` (readiness probe
//! included), and RUNNING → STOPPING → STOPPED once a stop is requested. The
//! supervisor task spawned by `start` is the only thing that observes the
//! final transition; it reports through the context's [`Debouncer`] so the
//! CLI's wait-group drains exactly once per instance.
//!
//! [`Debouncer`]: crate::debounce::Debouncer

mod container;
mod process;

pub use container::{
    fingerprint, ContainerDiscovery, ContainerEngine, FINGERPRINT_LABEL, KIND_LABEL,
    MANAGED_BY_LABEL, MANAGED_BY_VALUE,
};
pub use process::ProcessEngine;

use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::discovery::ManagedEngine;
use crate::error::Result;
use crate::kind::{EngineKind, PullPolicy};
use crate::options::StartOptions;
use crate::waitgroup::WaitGroup;

/// How long `restart` waits for the old instance to go away, and how long a
/// removal supervisor waits before reporting a container as gone.
pub const TERMINATION_GRACE: Duration = Duration::from_secs(5);

#[async_trait]
pub trait Engine: Send + Sync {
    fn kind(&self) -> EngineKind;

    fn config_dir(&self) -> &Path;

    fn options(&self) -> &StartOptions;

    fn options_mut(&mut self) -> &mut StartOptions;

    /// Container or process id while running.
    fn id(&self) -> Option<String>;

    /// Flips to true once the current instance's supervisor saw it exit.
    fn terminated(&self) -> Option<watch::Receiver<bool>>;

    /// Launch, then block until the status endpoint answers. On success the
    /// wait-group carries one extra count until the instance terminates.
    async fn start(&mut self, wg: &WaitGroup) -> Result<()>;

    /// Ask the instance to stop. Stopping an instance that is not running,
    /// or whose id the runtime no longer knows, succeeds.
    async fn stop(&mut self, wg: &WaitGroup) -> Result<()>;

    /// Kill without a graceful phase.
    async fn stop_immediately(&mut self, wg: &WaitGroup) -> Result<()>;

    /// Stop, wait for the old instance to exit, start again without pulling.
    async fn restart(&mut self, wg: &WaitGroup) -> Result<()> {
        let terminated = self.terminated();
        info!(kind = %self.kind(), port = self.options().port, "Restarting engine");
        self.stop(wg).await?;
        if let Some(mut rx) = terminated {
            if !wait_for_termination(&mut rx, TERMINATION_GRACE).await {
                debug!("Previous instance still shutting down, starting anyway");
            }
        }
        self.options_mut().pull_policy = PullPolicy::Skip;
        self.start(wg).await
    }

    /// Every engine of this kind the tool manages on the host.
    async fn list_all_managed(&self) -> Result<Vec<ManagedEngine>>;

    /// Kill every managed engine of this kind; returns how many were stopped.
    async fn stop_all_managed(&self) -> Result<usize>;

    /// Output of the engine's `--version`, verbatim.
    async fn version_string(&self) -> Result<String>;
}

/// Wait until `rx` reports termination. A dropped sender counts as
/// terminated. Returns false on timeout.
pub async fn wait_for_termination(rx: &mut watch::Receiver<bool>, timeout: Duration) -> bool {
    tokio::time::timeout(timeout, rx.wait_for(|terminated| *terminated))
        .await
        .is_ok()
}

/// Arguments every process kind is launched with.
pub(crate) fn engine_args(config_dir: &Path, port: u16) -> Vec<String> {
    vec![
        "--configDir".to_string(),
        config_dir.display().to_string(),
        "--listenPort".to_string(),
        port.to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_for_termination() {
        let (tx, mut rx) = watch::channel(false);
        assert!(!wait_for_termination(&mut rx, Duration::from_millis(20)).await);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = tx.send(true);
        });
        assert!(wait_for_termination(&mut rx, Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn test_dropped_supervisor_counts_as_terminated() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        assert!(wait_for_termination(&mut rx, Duration::from_secs(2)).await);
    }

    #[test]
    fn test_engine_args() {
        let args = engine_args(Path::new("/tmp/mocks"), 9090);
        assert_eq!(args, vec!["--configDir", "/tmp/mocks", "--listenPort", "9090"]);
    }
}
