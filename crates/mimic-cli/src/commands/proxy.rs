use anyhow::{Context, Result};
use hyper::Uri;
use mimic_recorder::{ProxyServer, ProxySettings, Recorder, RecorderOptions};
use std::collections::BTreeSet;
use std::net::SocketAddr;
use tracing::info;

use super::{shutdown_signal, App};
use crate::cli::ProxyArgs;

pub async fn cmd_proxy(app: &App, args: ProxyArgs) -> Result<()> {
    let upstream: Uri = args
        .upstream
        .parse()
        .with_context(|| format!("invalid upstream URL '{}'", args.upstream))?;

    let options = RecorderOptions {
        capture_request_body: args.capture_request_body,
        capture_request_headers: args.capture_request_headers,
        ignore_duplicate_requests: args.ignore_duplicate_requests,
        record_only_response_headers: args
            .record_only_response_headers
            .map(|names| names.into_iter().map(|n| n.trim().to_lowercase()).collect::<BTreeSet<_>>()),
        flat_response_file_structure: args.flat_response_file_structure,
    };

    let recorder = Recorder::new(&args.output_dir, &upstream, options)
        .context("failed to start recording session")?;
    info!(
        output_dir = %args.output_dir.display(),
        config = %recorder.config_path().display(),
        "Recording responses"
    );
    let handle = recorder.spawn();

    let settings = ProxySettings {
        listen: SocketAddr::from(([0, 0, 0, 0], args.port)),
        upstream,
        rewrite_urls: args.rewrite_urls,
        pool: app.config.pool_settings(),
    };
    let server = ProxyServer::bind(settings, handle.sender())
        .await
        .with_context(|| format!("failed to listen on port {}", args.port))?;
    server.run_until(shutdown_signal()).await?;

    let recorder = handle.finish().await?;
    info!(
        resources = recorder.resources().len(),
        "Recording finished"
    );
    Ok(())
}
