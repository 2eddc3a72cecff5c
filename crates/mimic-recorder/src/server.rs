//! Recording reverse proxy.
//!
//! Every request is buffered, forwarded to the upstream over a pooled client,
//! answered from the buffered upstream response and then posted to the
//! recorder queue. Proxy-path failures are answered, never propagated.

use chrono::Utc;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, ACCEPT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, HOST};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use hyper_util::server::graceful::GracefulShutdown;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

use crate::client::{create_upstream_client, PoolSettings, UpstreamClient};
use crate::error::{RecorderError, Result};
use crate::exchange::HttpExchange;
use crate::headers::{first_value, is_textual, strip_hop_by_hop};

/// Answered locally so readiness probes work against the proxy.
pub const STATUS_PATH: &str = "/system/status";

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub listen: SocketAddr,
    pub upstream: Uri,
    /// Rewrite upstream URLs in textual bodies to point at the proxy.
    pub rewrite_urls: bool,
    pub pool: PoolSettings,
}

pub struct ProxyServer {
    listener: TcpListener,
    state: Arc<ProxyState>,
}

struct ProxyState {
    client: UpstreamClient,
    upstream_base: String,
    local_base: String,
    rewrite_urls: bool,
    sink: UnboundedSender<HttpExchange>,
}

impl ProxyServer {
    /// Bind the listener. Exchanges are posted to `sink`.
    pub async fn bind(settings: ProxySettings, sink: UnboundedSender<HttpExchange>) -> Result<Self> {
        let upstream_base = upstream_base(&settings.upstream)?;
        let client = create_upstream_client(&settings.pool)?;
        let listener = TcpListener::bind(settings.listen).await?;
        let port = listener.local_addr()?.port();

        Ok(Self {
            listener,
            state: Arc::new(ProxyState {
                client,
                upstream_base,
                local_base: format!("http://localhost:{port}"),
                rewrite_urls: settings.rewrite_urls,
                sink,
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until `shutdown` resolves, then close the listener and give open
    /// connections a short grace period.
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        info!(
            "Recording proxy listening on {}, forwarding to {}",
            self.local_addr()?,
            self.state.upstream_base
        );

        let graceful = GracefulShutdown::new();
        tokio::pin!(shutdown);

        loop {
            let (stream, remote_addr) = tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                        continue;
                    }
                },
                _ = &mut shutdown => break,
            };

            let state = Arc::clone(&self.state);
            let service = service_fn(move |req| {
                let state = Arc::clone(&state);
                async move { Ok::<_, Infallible>(state.handle(req).await) }
            });
            let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
            let conn = graceful.watch(conn);

            tokio::spawn(async move {
                if let Err(err) = conn.await {
                    error!("Error serving connection from {}: {}", remote_addr, err);
                }
            });
        }

        drop(self.listener);
        info!("Recording proxy stopped accepting connections");
        if tokio::time::timeout(SHUTDOWN_GRACE, graceful.shutdown())
            .await
            .is_err()
        {
            warn!("Open proxy connections did not close within {:?}", SHUTDOWN_GRACE);
        }
        Ok(())
    }
}

impl ProxyState {
    async fn handle(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        if req.uri().path() == STATUS_PATH {
            return text_response(StatusCode::OK, "ok");
        }

        let (parts, body) = req.into_parts();
        let request_body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                warn!("Failed to read request body: {}", e);
                return error_response(StatusCode::BAD_REQUEST, "failed to read request body");
            }
        };

        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let target: Uri = match format!("{}{path_and_query}", self.upstream_base).parse() {
            Ok(uri) => uri,
            Err(e) => {
                warn!("Invalid upstream target for {}: {}", path_and_query, e);
                return error_response(StatusCode::BAD_REQUEST, "invalid request target");
            }
        };

        let mut forward_headers = parts.headers.clone();
        strip_hop_by_hop(&mut forward_headers);
        forward_headers.remove(ACCEPT_ENCODING);
        forward_headers.remove(HOST);

        debug!("Forwarding {} {}", parts.method, target);

        let mut upstream_req = Request::new(Full::new(request_body.clone()));
        *upstream_req.method_mut() = parts.method.clone();
        *upstream_req.uri_mut() = target;
        *upstream_req.headers_mut() = forward_headers.clone();

        let upstream_response = match self.client.request(upstream_req).await {
            Ok(response) => response,
            Err(e) => {
                error!("Failed to forward request to upstream: {}", e);
                return error_response(StatusCode::BAD_GATEWAY, &format!("upstream request failed: {e}"));
            }
        };

        let (mut response_parts, upstream_body) = upstream_response.into_parts();
        let mut response_body = match upstream_body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                error!("Failed to collect upstream response body: {}", e);
                return error_response(StatusCode::BAD_GATEWAY, "failed to read upstream response");
            }
        };

        strip_hop_by_hop(&mut response_parts.headers);
        response_parts.headers.remove(CONTENT_LENGTH);

        if self.rewrite_urls
            && first_value(&response_parts.headers, CONTENT_TYPE).is_some_and(is_textual)
        {
            response_body = self.rewrite(response_body);
        }

        let exchange = HttpExchange {
            method: parts.method,
            uri: parts.uri,
            request_headers: forward_headers,
            request_body: (!request_body.is_empty()).then_some(request_body),
            status: response_parts.status,
            response_headers: response_parts.headers.clone(),
            response_body: response_body.clone(),
            timestamp: Utc::now(),
        };
        if self.sink.send(exchange).is_err() {
            debug!("Recorder queue closed; exchange not recorded");
        }

        let mut response = Response::new(Full::new(response_body));
        *response.status_mut() = response_parts.status;
        *response.headers_mut() = response_parts.headers;
        response
    }

    fn rewrite(&self, body: Bytes) -> Bytes {
        match std::str::from_utf8(&body) {
            Ok(text) if text.contains(&self.upstream_base) => {
                Bytes::from(text.replace(&self.upstream_base, &self.local_base))
            }
            _ => body,
        }
    }
}

/// The upstream URL without a trailing slash. Only `http` and `https` with a
/// host are accepted.
fn upstream_base(upstream: &Uri) -> Result<String> {
    match upstream.scheme_str() {
        Some("http") | Some("https") => {}
        _ => {
            return Err(RecorderError::Config(format!(
                "upstream {upstream} must be an http or https URL"
            )))
        }
    }
    if upstream.host().is_none() {
        return Err(RecorderError::Config(format!("upstream {upstream} has no host")));
    }
    Ok(upstream.to_string().trim_end_matches('/').to_string())
}

fn text_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

/// JSON error body `{"error": "<message>"}`.
pub fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let body = serde_json::json!({ "error": message }).to_string();
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}
