use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::process::Child;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

use super::{engine_args, wait_for_termination, Engine, TERMINATION_GRACE};
use crate::context::EngineContext;
use crate::debounce::LifecycleEvent;
use crate::discovery::{ManagedEngine, PeerDiscovery, ProcessDiscovery};
use crate::error::{EngineError, Result};
use crate::kind::EngineKind;
use crate::options::StartOptions;
use crate::provider::Provider;
use crate::readiness::wait_until_up;
use crate::waitgroup::WaitGroup;

struct RunningProcess {
    pid: u32,
    id: String,
    kill: Option<oneshot::Sender<()>>,
    stopping: Arc<AtomicBool>,
    terminated: watch::Receiver<bool>,
}

/// An engine launched as a child process of the CLI (JVM and native kinds).
pub struct ProcessEngine {
    ctx: EngineContext,
    provider: Box<dyn Provider>,
    discovery: ProcessDiscovery,
    config_dir: PathBuf,
    options: StartOptions,
    running: Option<RunningProcess>,
}

impl ProcessEngine {
    pub fn new(
        ctx: EngineContext,
        provider: Box<dyn Provider>,
        discovery: ProcessDiscovery,
        config_dir: impl Into<PathBuf>,
        options: StartOptions,
    ) -> Self {
        Self {
            ctx,
            provider,
            discovery,
            config_dir: config_dir.into(),
            options,
            running: None,
        }
    }

    fn spawn_supervisor(
        &self,
        wg: &WaitGroup,
        id: String,
        mut child: Child,
        kill: oneshot::Receiver<()>,
        stopping: Arc<AtomicBool>,
        terminated: watch::Sender<bool>,
    ) {
        let debouncer = Arc::clone(&self.ctx.debouncer);
        let wg = wg.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                Ok(()) = kill => {
                    debug!(pid = %id, "Killing engine process");
                    if let Err(e) = child.start_kill() {
                        warn!(pid = %id, error = %e, "Unable to kill engine process");
                    }
                    child.wait().await
                }
            };

            let event = match status {
                Ok(status) if status.success() || stopping.load(Ordering::SeqCst) => {
                    info!(pid = %id, status = %status, "Engine process stopped");
                    LifecycleEvent::stopped(&id)
                }
                Ok(status) => {
                    error!(pid = %id, status = %status, "Engine process exited unexpectedly");
                    LifecycleEvent::failed(&id, format!("engine exited with {status}"))
                }
                Err(e) => {
                    error!(pid = %id, error = %e, "Unable to wait for engine process");
                    LifecycleEvent::failed(&id, e.to_string())
                }
            };
            debouncer.notify(&wg, event);
            let _ = terminated.send(true);
        });
    }

    /// Send SIGINT. Returns false when the signal could not be delivered for
    /// a reason other than the process being gone.
    #[cfg(unix)]
    fn interrupt(pid: u32) -> bool {
        use nix::errno::Errno;
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        match kill(Pid::from_raw(raw), Signal::SIGINT) {
            Ok(()) | Err(Errno::ESRCH) => true,
            Err(e) => {
                warn!(pid, error = %e, "Unable to interrupt engine process");
                false
            }
        }
    }

    #[cfg(not(unix))]
    fn interrupt(_pid: u32) -> bool {
        false
    }
}

#[async_trait]
impl Engine for ProcessEngine {
    fn kind(&self) -> EngineKind {
        self.provider.kind()
    }

    fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    fn options(&self) -> &StartOptions {
        &self.options
    }

    fn options_mut(&mut self) -> &mut StartOptions {
        &mut self.options
    }

    fn id(&self) -> Option<String> {
        self.running.as_ref().map(|r| r.id.clone())
    }

    fn terminated(&self) -> Option<watch::Receiver<bool>> {
        self.running.as_ref().map(|r| r.terminated.clone())
    }

    async fn start(&mut self, wg: &WaitGroup) -> Result<()> {
        self.options.validate()?;
        let artifact = self.provider.materialize(self.options.pull_policy).await?;
        debug!(kind = %self.kind(), artifact = %artifact, "Engine artifact ready");

        if self.options.replace_running {
            let replaced = self.discovery.stop_port(self.options.port).await?;
            if replaced > 0 {
                info!(port = self.options.port, replaced, "Replaced running engines");
            }
        }

        let args = engine_args(&self.config_dir, self.options.port);
        let command = self
            .provider
            .start_command(&args, &self.options.engine_environment())?;
        info!(
            kind = %self.kind(),
            port = self.options.port,
            program = %command.program.display(),
            "Starting engine"
        );

        let child = command
            .to_command()
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                EngineError::Lifecycle(format!(
                    "failed to launch {}: {e}",
                    command.program.display()
                ))
            })?;
        let pid = child
            .id()
            .ok_or_else(|| EngineError::Lifecycle("engine exited during launch".into()))?;
        let id = pid.to_string();

        self.ctx.debouncer.register(wg, &id);
        let (kill_tx, kill_rx) = oneshot::channel();
        let (term_tx, term_rx) = watch::channel(false);
        let stopping = Arc::new(AtomicBool::new(false));
        self.spawn_supervisor(wg, id.clone(), child, kill_rx, Arc::clone(&stopping), term_tx);
        self.running = Some(RunningProcess {
            pid,
            id: id.clone(),
            kill: Some(kill_tx),
            stopping,
            terminated: term_rx.clone(),
        });

        let ready = wait_until_up(
            &self.ctx.client,
            self.options.port,
            self.ctx.settings.start_timeout,
            Some(term_rx),
        )
        .await;
        if let Err(e) = ready {
            error!(pid = %id, error = %e, "Engine failed to become ready");
            self.stop_immediately(wg).await?;
            return Err(e);
        }
        info!(pid = %id, port = self.options.port, "Engine started");
        Ok(())
    }

    async fn stop(&mut self, _wg: &WaitGroup) -> Result<()> {
        let Some(mut running) = self.running.take() else {
            return Ok(());
        };
        info!(pid = %running.id, "Stopping engine");
        running.stopping.store(true, Ordering::SeqCst);

        let kill = running.kill.take();
        if !Self::interrupt(running.pid) {
            if let Some(kill) = kill {
                let _ = kill.send(());
            }
            return Ok(());
        }

        // escalate to a kill if the engine ignores the interrupt
        let mut terminated = running.terminated.clone();
        let id = running.id.clone();
        tokio::spawn(async move {
            if !wait_for_termination(&mut terminated, TERMINATION_GRACE).await {
                warn!(pid = %id, "Engine ignored interrupt, killing");
                if let Some(kill) = kill {
                    let _ = kill.send(());
                }
            }
        });
        Ok(())
    }

    async fn stop_immediately(&mut self, _wg: &WaitGroup) -> Result<()> {
        let Some(mut running) = self.running.take() else {
            return Ok(());
        };
        info!(pid = %running.id, "Killing engine");
        running.stopping.store(true, Ordering::SeqCst);
        if let Some(kill) = running.kill.take() {
            let _ = kill.send(());
        }
        Ok(())
    }

    async fn list_all_managed(&self) -> Result<Vec<ManagedEngine>> {
        self.discovery.list().await
    }

    async fn stop_all_managed(&self) -> Result<usize> {
        self.discovery.stop_all().await
    }

    async fn version_string(&self) -> Result<String> {
        self.provider.materialize(self.options.pull_policy).await?;
        let command = self
            .provider
            .start_command(&["--version".to_string()], &self.options.engine_environment())?;
        let output = command
            .to_command()
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| EngineError::Lifecycle(format!("failed to run engine: {e}")))?;
        if !output.status.success() {
            return Err(EngineError::Lifecycle(format!(
                "engine --version exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::context::EngineSettings;
    use crate::discovery::{native_port, ProcessMatcher};
    use crate::kind::PullPolicy;
    use crate::paths::ToolPaths;
    use crate::provider::{CachedVersion, EngineArtifact, StartCommand};
    use std::time::Duration;
    use tempfile::TempDir;

    /// Launches `/bin/sh -c <script>` in place of a real engine.
    struct ShellProvider {
        script: String,
    }

    #[async_trait]
    impl Provider for ShellProvider {
        fn kind(&self) -> EngineKind {
            EngineKind::NativeBinary
        }

        fn version(&self) -> &str {
            "test"
        }

        async fn check_prereqs(&self) -> (bool, Vec<String>) {
            (true, Vec::new())
        }

        async fn list(&self) -> Result<Vec<CachedVersion>> {
            Ok(Vec::new())
        }

        async fn materialize(&self, _policy: PullPolicy) -> Result<EngineArtifact> {
            Ok(EngineArtifact::File(PathBuf::from("/bin/sh")))
        }

        async fn bundle(&self, _config_dir: &Path, _dest: &str) -> Result<()> {
            Ok(())
        }

        fn start_command(&self, _args: &[String], env: &[String]) -> Result<StartCommand> {
            Ok(StartCommand {
                program: PathBuf::from("/bin/sh"),
                args: vec!["-c".to_string(), self.script.clone()],
                env: env.to_vec(),
            })
        }

        fn is_sealed_distro(&self) -> bool {
            true
        }
    }

    fn engine(tmp: &TempDir, script: &str, port: u16) -> ProcessEngine {
        let matcher = ProcessMatcher::new("no-such-engine", ".*", native_port).unwrap();
        engine_matching(tmp, script, port, matcher)
    }

    fn engine_matching(
        tmp: &TempDir,
        script: &str,
        port: u16,
        matcher: ProcessMatcher,
    ) -> ProcessEngine {
        let settings = EngineSettings {
            start_timeout: Duration::from_secs(5),
            ..Default::default()
        };
        let ctx = EngineContext::new(ToolPaths::with_root(tmp.path()), settings).unwrap();
        ProcessEngine::new(
            ctx,
            Box::new(ShellProvider {
                script: script.to_string(),
            }),
            ProcessDiscovery::new(matcher),
            tmp.path(),
            StartOptions {
                port,
                ..Default::default()
            },
        )
    }

    /// Loopback server answering every request with 200, so the readiness
    /// probe passes for a script that only sleeps.
    async fn status_server() -> u16 {
        use http_body_util::Full;
        use hyper::server::conn::http1;
        use hyper::service::service_fn;
        use hyper_util::rt::TokioIo;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let service = service_fn(|_req| async {
                        Ok::<_, std::convert::Infallible>(hyper::Response::new(Full::new(
                            bytes::Bytes::from_static(b"ok"),
                        )))
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });
        port
    }

    fn sleeper(arg: &str, listen_port: u16) -> tokio::process::Child {
        tokio::process::Command::new("sleep")
            .arg(arg)
            .env("MIMIC_LISTEN_PORT", listen_port.to_string())
            .kill_on_drop(true)
            .spawn()
            .unwrap()
    }

    #[tokio::test]
    async fn test_engine_exiting_early_fails_start_and_drains() {
        let tmp = TempDir::new().unwrap();
        let mut engine = engine(&tmp, "exit 3", 9);
        let wg = WaitGroup::new();

        let err = engine.start(&wg).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Lifecycle(_) | EngineError::NotReady { .. }
        ));
        assert!(wg.wait_timeout(Duration::from_secs(5)).await);
        assert!(engine.id().is_none());
    }

    #[tokio::test]
    async fn test_stop_without_start_is_noop() {
        let tmp = TempDir::new().unwrap();
        let mut engine = engine(&tmp, "true", 9);
        let wg = WaitGroup::new();
        engine.stop(&wg).await.unwrap();
        engine.stop_immediately(&wg).await.unwrap();
        assert_eq!(wg.count(), 0);
    }

    #[tokio::test]
    async fn test_version_string_is_stdout_verbatim() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp, "echo 'mimic engine 4.0.0'", 9);
        let version = engine.version_string().await.unwrap();
        assert_eq!(version, "mimic engine 4.0.0\n");
    }

    #[tokio::test]
    async fn test_environment_reaches_engine() {
        let tmp = TempDir::new().unwrap();
        let mut engine = engine(&tmp, "echo $MIMIC_LOG_LEVEL $EXTRA", 9);
        engine.options_mut().environment = vec!["EXTRA=yes".to_string()];
        let version = engine.version_string().await.unwrap();
        assert_eq!(version, "INFO yes\n");
    }

    #[tokio::test]
    async fn test_start_stop_twice_drains_each_time() {
        let tmp = TempDir::new().unwrap();
        let port = status_server().await;
        let mut engine = engine(&tmp, "exec sleep 30", port);
        let wg = WaitGroup::new();

        for _ in 0..2 {
            engine.start(&wg).await.unwrap();
            assert_eq!(wg.count(), 1);
            engine.stop(&wg).await.unwrap();
            assert!(wg.wait_timeout(Duration::from_secs(5)).await);
            assert!(engine.id().is_none());
        }
    }

    #[tokio::test]
    async fn test_restart_starts_new_process() {
        let tmp = TempDir::new().unwrap();
        let port = status_server().await;
        let mut engine = engine(&tmp, "exec sleep 30", port);
        let wg = WaitGroup::new();

        engine.start(&wg).await.unwrap();
        let first = engine.id().unwrap();
        engine.restart(&wg).await.unwrap();

        assert_ne!(engine.id().unwrap(), first);
        assert_eq!(wg.count(), 1);
        assert_eq!(engine.options().pull_policy, PullPolicy::Skip);

        engine.stop(&wg).await.unwrap();
        assert!(wg.wait_timeout(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_replace_running_kills_peer_on_same_port() {
        let tmp = TempDir::new().unwrap();
        let port = status_server().await;
        let matcher = ProcessMatcher::new("sleep", "^3603$", native_port).unwrap();
        let mut same_port = sleeper("3603", port);
        let mut other_port = sleeper("3603", port.wrapping_add(1));
        let mut engine = engine_matching(&tmp, "exec sleep 30", port, matcher);
        let wg = WaitGroup::new();

        engine.start(&wg).await.unwrap();
        engine.stop(&wg).await.unwrap();
        assert!(wg.wait_timeout(Duration::from_secs(5)).await);
        assert!(same_port.try_wait().unwrap().is_none());

        engine.options_mut().replace_running = true;
        engine.start(&wg).await.unwrap();
        let status = tokio::time::timeout(Duration::from_secs(5), same_port.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(!status.success());
        assert!(other_port.try_wait().unwrap().is_none());

        engine.stop(&wg).await.unwrap();
        assert!(wg.wait_timeout(Duration::from_secs(5)).await);
        other_port.kill().await.unwrap();
    }
}
