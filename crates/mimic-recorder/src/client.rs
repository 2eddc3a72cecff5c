//! Pooled upstream client shared by every proxied request.

use http_body_util::Full;
use hyper::body::Bytes;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{RecorderError, Result};

pub type UpstreamClient = Client<hyper_rustls::HttpsConnector<HttpConnector>, Full<Bytes>>;

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_idle_per_host: usize,
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_idle_per_host: 32,
            idle_timeout: Duration::from_secs(90),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// HTTP/1.1 client that speaks both `http` and `https` upstreams, verifying
/// certificates against the platform roots.
pub fn create_upstream_client(pool: &PoolSettings) -> Result<UpstreamClient> {
    let mut http_connector = HttpConnector::new();
    http_connector.set_connect_timeout(Some(pool.connect_timeout));
    http_connector.enforce_http(false);

    let builder = match hyper_rustls::HttpsConnectorBuilder::new()
        .with_provider_and_native_roots(rustls::crypto::ring::default_provider())
    {
        Ok(builder) => builder,
        Err(e) => {
            // Plain http upstreams still work without platform roots.
            warn!(error = %e, "No platform root certificates; https upstreams will fail verification");
            let config = rustls::ClientConfig::builder_with_provider(Arc::new(
                rustls::crypto::ring::default_provider(),
            ))
            .with_safe_default_protocol_versions()
            .map_err(|e| RecorderError::Tls(e.to_string()))?
            .with_root_certificates(rustls::RootCertStore::empty())
            .with_no_client_auth();
            hyper_rustls::HttpsConnectorBuilder::new().with_tls_config(config)
        }
    };
    let https_connector = builder
        .https_or_http()
        .enable_http1()
        .wrap_connector(http_connector);

    debug!(
        max_idle = pool.max_idle_per_host,
        idle_timeout_secs = pool.idle_timeout.as_secs(),
        "Upstream connection pool configured"
    );

    Ok(Client::builder(TokioExecutor::new())
        .pool_idle_timeout(pool.idle_timeout)
        .pool_max_idle_per_host(pool.max_idle_per_host)
        .build(https_connector))
}
