//! Start/stop/restart of real engines. These need a container daemon and
//! network access to pull the engine image, so they are ignored by default:
//!
//! ```sh
//! cargo test -p mimic-engine --test lifecycle -- --ignored
//! ```

use mimic_engine::{
    EngineContext, EngineKind, EngineSettings, Registry, StartOptions, ToolPaths, WaitGroup,
};
use std::fs;
use std::net::TcpListener;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

const ENGINE_VERSION: &str = "latest";

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn write_hello_world(dir: &Path) {
    fs::write(
        dir.join("hello-config.yaml"),
        "plugin: rest\nresources:\n  - path: /example\n    method: GET\n    response:\n      content: Hello world\n",
    )
    .unwrap();
}

fn registry(root: &TempDir) -> Registry {
    let ctx = EngineContext::new(ToolPaths::with_root(root.path()), EngineSettings::default())
        .unwrap();
    Registry::with_builtin_kinds(ctx)
}

fn options(port: u16) -> StartOptions {
    StartOptions {
        port,
        version: ENGINE_VERSION.to_string(),
        ..Default::default()
    }
}

async fn get(port: u16, path: &str) -> (u16, String) {
    let resp = reqwest::get(format!("http://localhost:{port}{path}"))
        .await
        .unwrap();
    let status = resp.status().as_u16();
    (status, resp.text().await.unwrap())
}

#[tokio::test]
#[ignore = "requires a container daemon"]
async fn test_start_probe_stop_container() {
    let root = TempDir::new().unwrap();
    let mocks = TempDir::new().unwrap();
    write_hello_world(mocks.path());
    let registry = registry(&root);
    let port = free_port();
    let wg = WaitGroup::new();

    let mut engine = registry
        .engine(EngineKind::ContainerCore, mocks.path(), options(port))
        .unwrap();
    engine.start(&wg).await.unwrap();
    assert_eq!(wg.count(), 1);

    assert_eq!(get(port, "/system/status").await.0, 200);
    assert_eq!(get(port, "/example").await, (200, "Hello world".to_string()));

    engine.stop(&wg).await.unwrap();
    assert!(wg.wait_timeout(Duration::from_secs(10)).await);
}

#[tokio::test]
#[ignore = "requires a container daemon"]
async fn test_restart_preserves_readiness() {
    let root = TempDir::new().unwrap();
    let mocks = TempDir::new().unwrap();
    write_hello_world(mocks.path());
    let registry = registry(&root);
    let port = free_port();
    let wg = WaitGroup::new();

    let mut engine = registry
        .engine(EngineKind::ContainerCore, mocks.path(), options(port))
        .unwrap();
    engine.start(&wg).await.unwrap();
    let first_id = engine.id();

    engine.restart(&wg).await.unwrap();
    assert_ne!(engine.id(), first_id);
    assert_eq!(wg.count(), 1);
    assert_eq!(get(port, "/system/status").await.0, 200);

    engine.stop(&wg).await.unwrap();
    assert!(wg.wait_timeout(Duration::from_secs(10)).await);
}

#[tokio::test]
#[ignore = "requires a container daemon"]
async fn test_list_managed_containers() {
    let root = TempDir::new().unwrap();
    let registry = registry(&root);
    let wg = WaitGroup::new();

    let mut engines = Vec::new();
    let mut ports = Vec::new();
    let mut dirs = Vec::new();
    for _ in 0..2 {
        let mocks = TempDir::new().unwrap();
        write_hello_world(mocks.path());
        let port = free_port();
        let mut engine = registry
            .engine(EngineKind::ContainerCore, mocks.path(), options(port))
            .unwrap();
        engine.start(&wg).await.unwrap();
        engines.push(engine);
        ports.push(port);
        dirs.push(mocks);
    }

    let mut listed: Vec<u16> = engines[0]
        .list_all_managed()
        .await
        .unwrap()
        .into_iter()
        .filter(|e| ports.contains(&e.port))
        .map(|e| e.port)
        .collect();
    listed.sort_unstable();
    ports.sort_unstable();
    assert_eq!(listed, ports);

    for engine in &mut engines {
        engine.stop(&wg).await.unwrap();
    }
    assert!(wg.wait_timeout(Duration::from_secs(10)).await);
}

#[tokio::test]
#[ignore = "requires a container daemon"]
async fn test_duplicate_fingerprint_requires_replace() {
    let root = TempDir::new().unwrap();
    let mocks = TempDir::new().unwrap();
    write_hello_world(mocks.path());
    let registry = registry(&root);
    let port = free_port();
    let wg = WaitGroup::new();

    let mut first = registry
        .engine(EngineKind::ContainerCore, mocks.path(), options(port))
        .unwrap();
    first.start(&wg).await.unwrap();

    let mut second = registry
        .engine(EngineKind::ContainerCore, mocks.path(), options(port))
        .unwrap();
    assert!(second.start(&wg).await.is_err());

    second.options_mut().replace_running = true;
    second.start(&wg).await.unwrap();
    assert_eq!(get(port, "/system/status").await.0, 200);

    second.stop(&wg).await.unwrap();
    first.stop(&wg).await.unwrap();
    assert!(wg.wait_timeout(Duration::from_secs(10)).await);
}

#[tokio::test]
#[ignore = "requires a Java runtime and network access"]
async fn test_start_probe_stop_jar() {
    let root = TempDir::new().unwrap();
    let mocks = TempDir::new().unwrap();
    write_hello_world(mocks.path());
    let registry = registry(&root);
    let port = free_port();
    let wg = WaitGroup::new();

    let mut engine = registry
        .engine(EngineKind::JvmSingleJar, mocks.path(), options(port))
        .unwrap();
    engine.start(&wg).await.unwrap();
    assert_eq!(get(port, "/example").await, (200, "Hello world".to_string()));

    let managed = engine.list_all_managed().await.unwrap();
    assert!(managed.iter().any(|e| e.port == port));

    engine.stop(&wg).await.unwrap();
    assert!(wg.wait_timeout(Duration::from_secs(10)).await);
}
