//! End-to-end recording sessions: a loopback upstream, the proxy in front of
//! it and a real HTTP client.

use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{HeaderMap, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use mimic_recorder::{
    MockConfig, PoolSettings, ProxyServer, ProxySettings, Recorder, RecorderError,
    RecorderHandle, RecorderOptions,
};
use std::collections::HashMap;
use std::convert::Infallible;
use std::fs;
use std::net::{SocketAddr, TcpListener as StdListener};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

struct Route {
    status: u16,
    headers: Vec<(&'static str, String)>,
    body: String,
}

fn route(status: u16, headers: &[(&'static str, &str)], body: &str) -> Route {
    Route {
        status,
        headers: headers.iter().map(|(k, v)| (*k, v.to_string())).collect(),
        body: body.to_string(),
    }
}

/// Upstream serving fixed routes and remembering the headers of every request.
struct Upstream {
    port: u16,
    seen: Arc<Mutex<Vec<HeaderMap>>>,
}

impl Upstream {
    async fn start(routes: Vec<(&'static str, Route)>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let routes: Arc<HashMap<&'static str, Route>> = Arc::new(routes.into_iter().collect());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let recorded = Arc::clone(&seen);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let routes = Arc::clone(&routes);
                let recorded = Arc::clone(&recorded);
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                        let routes = Arc::clone(&routes);
                        let recorded = Arc::clone(&recorded);
                        async move {
                            recorded.lock().unwrap().push(req.headers().clone());
                            let mut resp = match routes.get(req.uri().path()) {
                                Some(r) => {
                                    let body = r.body.replace("{port}", &port.to_string());
                                    let mut resp = Response::new(Full::new(Bytes::from(body)));
                                    *resp.status_mut() = StatusCode::from_u16(r.status).unwrap();
                                    for (name, value) in &r.headers {
                                        resp.headers_mut().insert(*name, value.parse().unwrap());
                                    }
                                    resp
                                }
                                None => {
                                    let mut resp = Response::new(Full::new(Bytes::new()));
                                    *resp.status_mut() = StatusCode::NOT_FOUND;
                                    resp
                                }
                            };
                            resp.headers_mut()
                                .insert("keep-alive", "timeout=5".parse().unwrap());
                            Ok::<_, Infallible>(resp)
                        }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        Self { port, seen }
    }

    fn url(&self) -> String {
        format!("http://localhost:{}", self.port)
    }

    fn seen(&self) -> Vec<HeaderMap> {
        self.seen.lock().unwrap().clone()
    }
}

struct Session {
    addr: SocketAddr,
    recorder: RecorderHandle,
    stop: oneshot::Sender<()>,
    server: JoinHandle<mimic_recorder::Result<()>>,
}

impl Session {
    async fn start(upstream: &str, out: &Path, options: RecorderOptions, rewrite: bool) -> Self {
        let upstream = upstream.parse().unwrap();
        let recorder = Recorder::new(out, &upstream, options).unwrap().spawn();
        let settings = ProxySettings {
            listen: "127.0.0.1:0".parse().unwrap(),
            upstream,
            rewrite_urls: rewrite,
            pool: PoolSettings::default(),
        };
        let proxy = ProxyServer::bind(settings, recorder.sender()).await.unwrap();
        let addr = proxy.local_addr().unwrap();
        let (stop, stopped) = oneshot::channel();
        let server = tokio::spawn(proxy.run_until(async {
            let _ = stopped.await;
        }));
        Self {
            addr,
            recorder,
            stop,
            server,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Stop the proxy and wait for every queued exchange to be recorded.
    async fn finish(self) -> Recorder {
        let _ = self.stop.send(());
        self.server.await.unwrap().unwrap();
        self.recorder.finish().await.unwrap()
    }
}

fn files(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn test_hierarchical_layout() {
    let upstream = Upstream::start(vec![(
        "/",
        route(200, &[("content-disposition", "filename=hello.txt")], "hello world"),
    )])
    .await;
    let out = TempDir::new().unwrap();
    let session = Session::start(&upstream.url(), out.path(), RecorderOptions::default(), false).await;

    let body = reqwest::get(session.url("/")).await.unwrap().text().await.unwrap();
    assert_eq!(body, "hello world");
    let recorder = session.finish().await;

    let config_name = format!("localhost-{}-config.yaml", upstream.port);
    assert_eq!(files(out.path()), vec!["GET-index.txt".to_string(), config_name.clone()]);
    assert_eq!(fs::read_to_string(out.path().join("GET-index.txt")).unwrap(), "hello world");

    let config = MockConfig::load(&out.path().join(config_name)).unwrap();
    assert_eq!(config.plugin, "rest");
    assert_eq!(config.resources.len(), 1);
    assert_eq!(config.resources[0].path, "/");
    assert_eq!(config.resources[0].method, "GET");
    assert_eq!(config.resources[0].response.static_file.as_deref(), Some("GET-index.txt"));
    assert_eq!(config.resources, recorder.resources());
}

#[tokio::test]
async fn test_flat_layout() {
    let upstream = Upstream::start(vec![(
        "/",
        route(200, &[("content-disposition", "filename=hello.txt")], "hello world"),
    )])
    .await;
    let out = TempDir::new().unwrap();
    let options = RecorderOptions {
        flat_response_file_structure: true,
        ..Default::default()
    };
    let session = Session::start(&upstream.url(), out.path(), options, false).await;

    reqwest::get(session.url("/")).await.unwrap();
    session.finish().await;

    let file_name = format!("localhost-{}-GET-index.txt", upstream.port);
    let config_name = format!("localhost-{}-config.yaml", upstream.port);
    assert_eq!(files(out.path()), vec![file_name.clone(), config_name.clone()]);
    let config = MockConfig::load(&out.path().join(config_name)).unwrap();
    assert_eq!(config.resources[0].response.static_file, Some(file_name));
}

#[tokio::test]
async fn test_identical_bodies_are_written_once() {
    let upstream = Upstream::start(vec![
        ("/a", route(200, &[("content-type", "application/json")], "{\"same\":true}")),
        ("/b", route(200, &[("content-type", "application/json")], "{\"same\":true}")),
    ])
    .await;
    let out = TempDir::new().unwrap();
    let session = Session::start(&upstream.url(), out.path(), RecorderOptions::default(), false).await;

    let client = reqwest::Client::new();
    for path in ["/a", "/b"] {
        let resp = client.get(session.url(path)).send().await.unwrap();
        assert_eq!(resp.status(), 200);
    }
    let recorder = session.finish().await;

    let resources = recorder.resources();
    assert_eq!(resources.len(), 2);
    assert_eq!(resources[0].response.static_file.as_deref(), Some("GET-a.json"));
    assert_eq!(resources[1].response.static_file, resources[0].response.static_file);
    let bodies: Vec<_> = files(out.path())
        .into_iter()
        .filter(|f| !f.ends_with("-config.yaml"))
        .collect();
    assert_eq!(bodies, vec!["GET-a.json".to_string()]);
}

#[tokio::test]
async fn test_hop_by_hop_headers_never_cross_the_proxy() {
    let upstream = Upstream::start(vec![(
        "/data",
        route(200, &[("content-type", "text/plain"), ("x-custom", "1")], "payload"),
    )])
    .await;
    let out = TempDir::new().unwrap();
    let session = Session::start(&upstream.url(), out.path(), RecorderOptions::default(), false).await;

    let resp = reqwest::Client::new()
        .get(session.url("/data?x=1"))
        .header("accept-encoding", "gzip")
        .header("x-trace", "abc")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert!(resp.headers().get("keep-alive").is_none());
    assert_eq!(resp.headers().get("x-custom").unwrap(), "1");
    assert_eq!(resp.text().await.unwrap(), "payload");
    let recorder = session.finish().await;

    let seen = upstream.seen();
    assert_eq!(seen.len(), 1);
    assert!(seen[0].get("accept-encoding").is_none());
    assert_eq!(seen[0].get("x-trace").unwrap(), "abc");

    let resource = &recorder.resources()[0];
    let headers = resource.response.headers.as_ref().unwrap();
    assert!(!headers.contains_key("keep-alive"));
    assert_eq!(headers.get("x-custom").map(String::as_str), Some("1"));
    assert_eq!(
        resource.query_params.as_ref().unwrap().get("x").map(String::as_str),
        Some("1")
    );
}

#[tokio::test]
async fn test_status_endpoint_is_local() {
    let upstream = Upstream::start(vec![]).await;
    let out = TempDir::new().unwrap();
    let session = Session::start(&upstream.url(), out.path(), RecorderOptions::default(), false).await;

    let resp = reqwest::get(session.url("/system/status")).await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "ok");
    let recorder = session.finish().await;

    assert!(upstream.seen().is_empty());
    assert!(recorder.resources().is_empty());
}

#[tokio::test]
async fn test_unreachable_upstream_is_bad_gateway() {
    let port = {
        let listener = StdListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let out = TempDir::new().unwrap();
    let session = Session::start(
        &format!("http://127.0.0.1:{port}"),
        out.path(),
        RecorderOptions::default(),
        false,
    )
    .await;

    let resp = reqwest::get(session.url("/anything")).await.unwrap();
    assert_eq!(resp.status(), 502);
    let json: serde_json::Value = resp.json().await.unwrap();
    assert!(json["error"].is_string());
    let recorder = session.finish().await;

    assert!(recorder.resources().is_empty());
    assert!(files(out.path()).is_empty());
}

#[tokio::test]
async fn test_rewrites_upstream_urls_in_text() {
    let upstream = Upstream::start(vec![
        (
            "/links",
            route(
                200,
                &[("content-type", "application/json")],
                "{\"next\":\"http://localhost:{port}/links?page=2\"}",
            ),
        ),
        (
            "/blob",
            route(
                200,
                &[("content-type", "application/octet-stream")],
                "http://localhost:{port}/raw",
            ),
        ),
    ])
    .await;
    let out = TempDir::new().unwrap();
    let session = Session::start(&upstream.url(), out.path(), RecorderOptions::default(), true).await;
    let proxy_port = session.addr.port();

    let links = reqwest::get(session.url("/links")).await.unwrap().text().await.unwrap();
    assert_eq!(
        links,
        format!("{{\"next\":\"http://localhost:{proxy_port}/links?page=2\"}}")
    );
    let blob = reqwest::get(session.url("/blob")).await.unwrap().text().await.unwrap();
    assert_eq!(blob, format!("http://localhost:{}/raw", upstream.port));
    session.finish().await;

    let recorded = fs::read_to_string(out.path().join("GET-links.json")).unwrap();
    assert_eq!(recorded, links);
}

#[tokio::test]
async fn test_rerun_refuses_and_leaves_output_untouched() {
    let upstream = Upstream::start(vec![("/a", route(200, &[], "one"))]).await;
    let out = TempDir::new().unwrap();
    let session = Session::start(&upstream.url(), out.path(), RecorderOptions::default(), false).await;
    reqwest::get(session.url("/a")).await.unwrap();
    session.finish().await;

    let before: Vec<(String, String)> = files(out.path())
        .into_iter()
        .map(|f| {
            let contents = fs::read_to_string(out.path().join(&f)).unwrap();
            (f, contents)
        })
        .collect();

    let result = Recorder::new(
        out.path(),
        &upstream.url().parse().unwrap(),
        RecorderOptions::default(),
    );
    assert!(matches!(result, Err(RecorderError::AlreadyExists(_))));

    let after: Vec<(String, String)> = files(out.path())
        .into_iter()
        .map(|f| {
            let contents = fs::read_to_string(out.path().join(&f)).unwrap();
            (f, contents)
        })
        .collect();
    assert_eq!(before, after);
}
