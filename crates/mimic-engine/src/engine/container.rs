use async_trait::async_trait;
use bollard::container::{
    Config, ListContainersOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::models::{HostConfig, PortBinding};
use bollard::Docker;
use futures::StreamExt;
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::{wait_for_termination, Engine, TERMINATION_GRACE};
use crate::bundle::CONFIG_MOUNT;
use crate::context::EngineContext;
use crate::debounce::LifecycleEvent;
use crate::discovery::{ManagedEngine, PeerDiscovery};
use crate::error::{EngineError, Result};
use crate::kind::EngineKind;
use crate::options::{StartOptions, DEFAULT_PORT};
use crate::provider::{ContainerProvider, EngineArtifact, Provider};
use crate::readiness::wait_until_up;
use crate::waitgroup::WaitGroup;

pub const MANAGED_BY_LABEL: &str = "managed-by";
pub const MANAGED_BY_VALUE: &str = "mimic";
pub const FINGERPRINT_LABEL: &str = "mimic.fingerprint";
pub const KIND_LABEL: &str = "mimic.engine-type";

fn engine_port() -> String {
    format!("{DEFAULT_PORT}/tcp")
}

/// SHA-1 over `<config dir>:<port>`, identifying instances that would serve
/// the same mocks on the same port.
pub fn fingerprint(config_dir: &Path, port: u16) -> String {
    let mut hasher = Sha1::new();
    hasher.update(format!("{}:{port}", config_dir.display()).as_bytes());
    hex::encode(hasher.finalize())
}

fn label_filter(labels: &[(&str, &str)]) -> HashMap<String, Vec<String>> {
    HashMap::from([(
        "label".to_string(),
        labels.iter().map(|(k, v)| format!("{k}={v}")).collect(),
    )])
}

async fn remove_container(docker: &Docker, id: &str) -> Result<bool> {
    let options = RemoveContainerOptions {
        force: true,
        ..Default::default()
    };
    match docker.remove_container(id, Some(options)).await {
        Ok(()) => Ok(true),
        Err(e) => {
            let e = EngineError::from(e);
            if e.is_not_found() {
                debug!(id = %id, "Container already gone");
                Ok(false)
            } else {
                Err(e)
            }
        }
    }
}

/// Finds containers carrying the managed-by label (and the kind label when
/// a kind is given).
#[derive(Debug, Clone)]
pub struct ContainerDiscovery {
    ctx: EngineContext,
    kind: Option<EngineKind>,
}

impl ContainerDiscovery {
    pub fn new(ctx: EngineContext, kind: Option<EngineKind>) -> Self {
        Self { ctx, kind }
    }

    fn filters(&self) -> HashMap<String, Vec<String>> {
        let mut labels = vec![(MANAGED_BY_LABEL, MANAGED_BY_VALUE)];
        if let Some(kind) = self.kind {
            labels.push((KIND_LABEL, kind.as_str()));
        }
        label_filter(&labels)
    }
}

#[async_trait]
impl PeerDiscovery for ContainerDiscovery {
    async fn list(&self) -> Result<Vec<ManagedEngine>> {
        let docker = self.ctx.docker()?;
        let options = ListContainersOptions {
            filters: self.filters(),
            ..Default::default()
        };

        let mut engines: Vec<ManagedEngine> = docker
            .list_containers(Some(options))
            .await?
            .into_iter()
            .filter_map(|summary| {
                let id = summary.id?;
                let name = summary
                    .names
                    .and_then(|names| names.into_iter().next())
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_default();
                let port = summary
                    .ports
                    .unwrap_or_default()
                    .into_iter()
                    .find(|p| p.private_port == DEFAULT_PORT)
                    .and_then(|p| p.public_port)
                    .unwrap_or(DEFAULT_PORT);
                Some(ManagedEngine {
                    name,
                    id: id.chars().take(12).collect(),
                    port,
                })
            })
            .collect();
        engines.sort_by(|a, b| a.port.cmp(&b.port).then_with(|| a.id.cmp(&b.id)));
        Ok(engines)
    }

    async fn stop_all(&self) -> Result<usize> {
        let docker = self.ctx.docker()?;
        let mut stopped = 0;
        for engine in self.list().await? {
            match remove_container(&docker, &engine.id).await {
                Ok(true) => {
                    info!(id = %engine.id, port = engine.port, "Removed engine container");
                    stopped += 1;
                }
                Ok(false) => {}
                Err(e) => warn!(id = %engine.id, error = %e, "Unable to remove engine container"),
            }
        }
        Ok(stopped)
    }
}

struct RunningContainer {
    id: String,
    stopping: Arc<AtomicBool>,
    terminated: watch::Receiver<bool>,
}

/// An engine running in a container on the local runtime.
pub struct ContainerEngine {
    ctx: EngineContext,
    provider: ContainerProvider,
    discovery: ContainerDiscovery,
    config_dir: PathBuf,
    options: StartOptions,
    running: Option<RunningContainer>,
}

impl ContainerEngine {
    pub fn new(
        ctx: EngineContext,
        provider: ContainerProvider,
        config_dir: impl Into<PathBuf>,
        options: StartOptions,
    ) -> Self {
        let discovery = ContainerDiscovery::new(ctx.clone(), Some(provider.kind()));
        Self {
            ctx,
            provider,
            discovery,
            config_dir: config_dir.into(),
            options,
            running: None,
        }
    }

    /// Remove containers with the same fingerprint, or refuse to start when
    /// replacing was not requested.
    async fn handle_duplicates(&self, docker: &Docker, fingerprint: &str) -> Result<()> {
        let options = ListContainersOptions {
            all: true,
            filters: label_filter(&[
                (MANAGED_BY_LABEL, MANAGED_BY_VALUE),
                (FINGERPRINT_LABEL, fingerprint),
            ]),
            ..Default::default()
        };
        let duplicates: Vec<String> = docker
            .list_containers(Some(options))
            .await?
            .into_iter()
            .filter_map(|c| c.id)
            .collect();
        if duplicates.is_empty() {
            return Ok(());
        }

        if !self.options.replace_running {
            return Err(EngineError::Lifecycle(format!(
                "an engine for {} on port {} is already running (container {}); pass --replace to stop it first",
                self.config_dir.display(),
                self.options.port,
                short_id(&duplicates[0]),
            )));
        }
        for id in duplicates {
            info!(id = %short_id(&id), "Replacing running engine container");
            remove_container(docker, &id).await?;
        }
        Ok(())
    }

    fn container_config(&self, image: String, config_dir: &Path, fingerprint: &str) -> Config<String> {
        let mut binds = vec![format!("{}:{CONFIG_MOUNT}", config_dir.display())];
        binds.extend(
            self.options
                .directory_mounts
                .iter()
                .map(|m| format!("{}:{}", m.host.display(), m.guest)),
        );
        let host_config = HostConfig {
            binds: Some(binds),
            port_bindings: Some(HashMap::from([(
                engine_port(),
                Some(vec![PortBinding {
                    host_ip: None,
                    host_port: Some(self.options.port.to_string()),
                }]),
            )])),
            ..Default::default()
        };

        Config {
            image: Some(image),
            env: Some(self.options.engine_environment()),
            labels: Some(HashMap::from([
                (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
                (FINGERPRINT_LABEL.to_string(), fingerprint.to_string()),
                (KIND_LABEL.to_string(), self.provider.kind().as_str().to_string()),
            ])),
            exposed_ports: Some(HashMap::from([(engine_port(), HashMap::new())])),
            host_config: Some(host_config),
            ..Default::default()
        }
    }

    fn spawn_log_forwarder(&self, docker: Docker, id: String) {
        tokio::spawn(async move {
            let options = LogsOptions::<String> {
                follow: true,
                stdout: true,
                stderr: true,
                ..Default::default()
            };
            let mut logs = docker.logs(&id, Some(options));
            let mut stdout = tokio::io::stdout();
            let mut stderr = tokio::io::stderr();
            while let Some(line) = logs.next().await {
                let written = match line {
                    Ok(LogOutput::StdErr { message }) => stderr.write_all(&message).await,
                    Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                        stdout.write_all(&message).await
                    }
                    Ok(LogOutput::StdIn { .. }) => Ok(()),
                    Err(e) => {
                        debug!(id = %short_id(&id), error = %e, "Log stream ended");
                        break;
                    }
                };
                if written.is_err() {
                    break;
                }
            }
        });
    }

    fn spawn_supervisor(
        &self,
        docker: Docker,
        wg: &WaitGroup,
        id: String,
        stopping: Arc<AtomicBool>,
        terminated: watch::Sender<bool>,
    ) {
        let debouncer = Arc::clone(&self.ctx.debouncer);
        let wg = wg.clone();
        tokio::spawn(async move {
            let mut wait = docker.wait_container(&id, None::<WaitContainerOptions<String>>);
            let outcome = wait.next().await;
            let stopping = stopping.load(Ordering::SeqCst);

            let event = match outcome {
                None => LifecycleEvent::stopped(&id),
                Some(Ok(resp)) if resp.status_code == 0 || stopping => LifecycleEvent::stopped(&id),
                Some(Ok(resp)) => LifecycleEvent::failed(
                    &id,
                    format!("container exited with status {}", resp.status_code),
                ),
                Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. }))
                    if stopping =>
                {
                    debug!(id = %short_id(&id), code, "Container exited after stop request");
                    LifecycleEvent::stopped(&id)
                }
                Some(Err(e)) => {
                    let e = EngineError::from(e);
                    if e.is_not_found() {
                        // removed before the wait was registered
                        LifecycleEvent::stopped(&id)
                    } else {
                        LifecycleEvent::failed(&id, e.to_string())
                    }
                }
            };

            match &event.err {
                None => info!(id = %short_id(&id), "engine container stopped"),
                Some(err) => error!(id = %short_id(&id), error = %err, "Engine container failed"),
            }
            debouncer.notify(&wg, event);
            let _ = terminated.send(true);
        });
    }

    /// Report the container as gone if its supervisor has not done so
    /// within the grace period.
    fn spawn_removal_supervisor(&self, wg: &WaitGroup, running: &RunningContainer) {
        let debouncer = Arc::clone(&self.ctx.debouncer);
        let wg = wg.clone();
        let id = running.id.clone();
        let mut terminated = running.terminated.clone();
        tokio::spawn(async move {
            if !wait_for_termination(&mut terminated, TERMINATION_GRACE).await {
                warn!(id = %short_id(&id), "Timed out waiting for container removal");
                debouncer.notify(&wg, LifecycleEvent::stopped(&id));
            }
        });
    }

    async fn remove_running(&mut self, wg: &WaitGroup) -> Result<()> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };
        info!(id = %short_id(&running.id), "Removing engine container");
        running.stopping.store(true, Ordering::SeqCst);
        let docker = self.ctx.docker()?;
        self.spawn_removal_supervisor(wg, &running);
        remove_container(&docker, &running.id).await?;
        Ok(())
    }
}

fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

#[async_trait]
impl Engine for ContainerEngine {
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
        let docker = self.ctx.docker()?;
        let image = match self.provider.materialize(self.options.pull_policy).await? {
            EngineArtifact::Image(tag) => tag,
            other => {
                return Err(EngineError::Lifecycle(format!(
                    "expected an image, got {other}"
                )))
            }
        };

        let config_dir = self.config_dir.canonicalize().map_err(|e| {
            EngineError::Config(format!(
                "config directory {}: {e}",
                self.config_dir.display()
            ))
        })?;
        let fingerprint = fingerprint(&config_dir, self.options.port);
        self.handle_duplicates(&docker, &fingerprint).await?;

        let config = self.container_config(image.clone(), &config_dir, &fingerprint);
        let created = docker
            .create_container::<String, String>(None, config)
            .await
            .map_err(|e| EngineError::Lifecycle(format!("failed to create container: {e}")))?;
        let id = created.id;
        for warning in &created.warnings {
            warn!(id = %short_id(&id), "{}", warning);
        }

        if let Err(e) = docker
            .start_container(&id, None::<StartContainerOptions<String>>)
            .await
        {
            let _ = remove_container(&docker, &id).await;
            return Err(EngineError::Lifecycle(format!(
                "failed to start container: {e}"
            )));
        }
        info!(
            id = %short_id(&id),
            image = %image,
            port = self.options.port,
            "Engine container started"
        );

        self.ctx.debouncer.register(wg, &id);
        let (term_tx, term_rx) = watch::channel(false);
        let stopping = Arc::new(AtomicBool::new(false));
        self.spawn_log_forwarder(docker.clone(), id.clone());
        self.spawn_supervisor(docker, wg, id.clone(), Arc::clone(&stopping), term_tx);
        self.running = Some(RunningContainer {
            id: id.clone(),
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
            error!(id = %short_id(&id), error = %e, "Engine failed to become ready");
            self.remove_running(wg).await?;
            return Err(e);
        }
        Ok(())
    }

    async fn stop(&mut self, wg: &WaitGroup) -> Result<()> {
        self.remove_running(wg).await
    }

    async fn stop_immediately(&mut self, wg: &WaitGroup) -> Result<()> {
        self.remove_running(wg).await
    }

    async fn list_all_managed(&self) -> Result<Vec<ManagedEngine>> {
        self.discovery.list().await
    }

    async fn stop_all_managed(&self) -> Result<usize> {
        self.discovery.stop_all().await
    }

    async fn version_string(&self) -> Result<String> {
        let image = self.provider.materialize(self.options.pull_policy).await?.to_string();
        let docker = self.ctx.docker()?;
        let config = Config {
            image: Some(image),
            cmd: Some(vec!["--version".to_string()]),
            labels: Some(HashMap::from([(
                MANAGED_BY_LABEL.to_string(),
                MANAGED_BY_VALUE.to_string(),
            )])),
            ..Default::default()
        };
        let id = docker.create_container::<String, String>(None, config).await?.id;

        let result = async {
            docker
                .start_container(&id, None::<StartContainerOptions<String>>)
                .await?;
            let mut wait = docker.wait_container(&id, None::<WaitContainerOptions<String>>);
            while wait.next().await.is_some() {}

            let options = LogsOptions::<String> {
                stdout: true,
                ..Default::default()
            };
            let mut logs = docker.logs(&id, Some(options));
            let mut output = Vec::new();
            while let Some(line) = logs.next().await {
                output.extend_from_slice(&line?.into_bytes());
            }
            Ok::<_, EngineError>(String::from_utf8_lossy(&output).into_owned())
        }
        .await;

        if let Err(e) = remove_container(&docker, &id).await {
            warn!(id = %short_id(&id), error = %e, "Unable to remove version container");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::EngineSettings;
    use crate::options::DirectoryMount;
    use crate::paths::ToolPaths;

    #[test]
    fn test_fingerprint_is_deterministic() {
        let a = fingerprint(Path::new("/home/u/mocks"), 8080);
        assert_eq!(a, fingerprint(Path::new("/home/u/mocks"), 8080));
        assert_ne!(a, fingerprint(Path::new("/home/u/mocks"), 8081));
        assert_ne!(a, fingerprint(Path::new("/home/u/other"), 8080));
        assert_eq!(a.len(), 40);
    }

    #[test]
    fn test_container_config_binds_and_labels() {
        let tmp = tempfile::TempDir::new().unwrap();
        let ctx =
            EngineContext::new(ToolPaths::with_root(tmp.path()), EngineSettings::default()).unwrap();
        let provider = ContainerProvider::new(ctx.clone(), EngineKind::ContainerCore, "4.0.0").unwrap();
        let options = StartOptions {
            port: 9123,
            directory_mounts: vec![DirectoryMount {
                host: PathBuf::from("/data"),
                guest: "/opt/data".to_string(),
            }],
            environment: vec!["FOO=bar".to_string()],
            ..Default::default()
        };
        let engine = ContainerEngine::new(ctx, provider, "/mocks", options);

        let config = engine.container_config("mimicdev/engine:4.0.0".into(), Path::new("/mocks"), "abc");
        let host = config.host_config.unwrap();
        assert_eq!(
            host.binds.unwrap(),
            vec!["/mocks:/opt/engine/config", "/data:/opt/data"]
        );
        let bindings = host.port_bindings.unwrap();
        let binding = bindings["8080/tcp"].as_ref().unwrap();
        assert_eq!(binding[0].host_port.as_deref(), Some("9123"));

        let labels = config.labels.unwrap();
        assert_eq!(labels[MANAGED_BY_LABEL], "mimic");
        assert_eq!(labels[FINGERPRINT_LABEL], "abc");
        assert_eq!(labels[KIND_LABEL], "container-core");
        assert_eq!(
            config.env.unwrap(),
            vec!["MIMIC_LOG_LEVEL=INFO", "FOO=bar"]
        );
    }

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("0123456789abcdef"), "0123456789ab");
        assert_eq!(short_id("abc"), "abc");
    }

    #[test]
    fn test_discovery_filters_by_kind() {
        let tmp = tempfile::TempDir::new().unwrap();
        let ctx =
            EngineContext::new(ToolPaths::with_root(tmp.path()), EngineSettings::default()).unwrap();
        let filters = ContainerDiscovery::new(ctx, Some(EngineKind::ContainerAll)).filters();
        assert_eq!(
            filters["label"],
            vec!["managed-by=mimic", "mimic.engine-type=container-all"]
        );
    }
}
