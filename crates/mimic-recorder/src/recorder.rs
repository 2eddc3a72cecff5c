//! Turns proxied exchanges into response files and a mock configuration.
//!
//! A single consumer owns all session state, so the fingerprint set, the
//! body-hash map and the resource list need no locking. Exchanges are
//! recorded in the order they reach the queue.

use bytes::Bytes;
use hyper::header::HeaderMap;
use hyper::Uri;
use sha1::{Digest, Sha1};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{RecorderError, Result};
use crate::exchange::HttpExchange;
use crate::headers::{is_hop_by_hop, is_skipped, is_textual};
use crate::mockconfig::{BodyOperator, MockConfig, RequestBody, Resource, ResponseSpec};
use crate::namer::{host_label, ResponseNamer};

#[derive(Debug, Clone, Default)]
pub struct RecorderOptions {
    pub capture_request_body: bool,
    pub capture_request_headers: bool,
    pub ignore_duplicate_requests: bool,
    /// When set, only these response headers (case-insensitive) are recorded.
    pub record_only_response_headers: Option<BTreeSet<String>>,
    pub flat_response_file_structure: bool,
}

/// What happened to one exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// A resource was appended; `file` is its response file, if any.
    Recorded { file: Option<String> },
    /// Repeat request while duplicates are ignored.
    Duplicate,
}

pub struct Recorder {
    options: RecorderOptions,
    namer: ResponseNamer,
    config_path: PathBuf,
    request_fingerprints: HashSet<String>,
    body_hash_to_file: HashMap<String, String>,
    document: MockConfig,
}

impl Recorder {
    /// Fails if the session's configuration file already exists.
    pub fn new(output_dir: impl Into<PathBuf>, upstream: &Uri, options: RecorderOptions) -> Result<Self> {
        let output_dir = output_dir.into();
        let label = host_label(upstream)?;
        let config_path = output_dir.join(format!("{label}-config.yaml"));
        if config_path.exists() {
            return Err(RecorderError::AlreadyExists(config_path));
        }
        fs::create_dir_all(&output_dir)?;

        Ok(Self {
            namer: ResponseNamer::new(output_dir, label, options.flat_response_file_structure),
            options,
            config_path,
            request_fingerprints: HashSet::new(),
            body_hash_to_file: HashMap::new(),
            document: MockConfig::default(),
        })
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn output_dir(&self) -> &Path {
        self.namer.output_dir()
    }

    pub fn resources(&self) -> &[Resource] {
        &self.document.resources
    }

    /// Record one exchange. Session state only changes once the response
    /// file and the configuration rewrite have both succeeded, so a failed
    /// exchange can be retried.
    pub fn record(&mut self, exchange: &HttpExchange) -> Result<Outcome> {
        let fingerprint = request_fingerprint(exchange);
        let prefix = if !self.request_fingerprints.contains(&fingerprint) {
            String::new()
        } else if self.options.ignore_duplicate_requests {
            debug!(method = %exchange.method, path = exchange.path(), "Skipping duplicate request");
            return Ok(Outcome::Duplicate);
        } else {
            format!("{}-", Uuid::new_v4())
        };

        let body = self.response_file(exchange, &prefix)?;
        let file = body.as_ref().map(|b| b.name.clone());
        let resource = self.resource(exchange, file.clone());
        self.document.resources.push(resource);
        if let Err(e) = self.document.write_atomic(&self.config_path) {
            self.document.resources.pop();
            if let Some(ResponseFile { name, new_hash: Some(_) }) = &body {
                let _ = fs::remove_file(self.output_dir().join(name));
            }
            return Err(e);
        }

        self.request_fingerprints.insert(fingerprint);
        if let Some(ResponseFile { name, new_hash: Some(hash) }) = body {
            self.body_hash_to_file.insert(hash, name);
        }

        info!(
            method = %exchange.method,
            path = exchange.path(),
            status = exchange.status.as_u16(),
            file = file.as_deref().unwrap_or("-"),
            "Recorded exchange"
        );
        Ok(Outcome::Recorded { file })
    }

    /// Start the consumer loop on a blocking thread. The loop ends once every
    /// sender is dropped.
    pub fn spawn(self) -> RecorderHandle {
        let (sender, mut receiver) = mpsc::unbounded_channel::<HttpExchange>();
        let join = tokio::task::spawn_blocking(move || {
            let mut recorder = self;
            while let Some(exchange) = receiver.blocking_recv() {
                if let Err(e) = recorder.record(&exchange) {
                    warn!(
                        method = %exchange.method,
                        path = exchange.path(),
                        error = %e,
                        "Failed to record exchange"
                    );
                }
            }
            recorder
        });
        RecorderHandle { sender, join }
    }

    /// Reuse the file of an identical body, or write a new one. A new file's
    /// hash is returned for the caller to commit.
    fn response_file(&self, exchange: &HttpExchange, prefix: &str) -> Result<Option<ResponseFile>> {
        if exchange.response_body.is_empty() {
            return Ok(None);
        }
        let hash = sha1_hex(&exchange.response_body);
        if let Some(existing) = self.body_hash_to_file.get(&hash) {
            return Ok(Some(ResponseFile {
                name: existing.clone(),
                new_hash: None,
            }));
        }

        let mut name = self.namer.name(exchange, prefix)?;
        // Different queries can map to the same name; keep earlier bodies intact.
        if self.output_dir().join(&name).exists() {
            name = self.namer.name(exchange, &format!("{}-{prefix}", Uuid::new_v4()))?;
        }
        write_response_file(&self.output_dir().join(&name), &exchange.response_body)?;
        Ok(Some(ResponseFile {
            name,
            new_hash: Some(hash),
        }))
    }

    fn resource(&self, exchange: &HttpExchange, static_file: Option<String>) -> Resource {
        let mut query_params = BTreeMap::new();
        for (key, value) in exchange.query_pairs() {
            query_params.entry(key).or_insert(value);
        }

        let request_headers = self
            .options
            .capture_request_headers
            .then(|| first_values(&exchange.request_headers, |name| !is_skipped(name)))
            .filter(|h| !h.is_empty());

        let request_body = exchange
            .request_body
            .as_ref()
            .filter(|body| {
                self.options.capture_request_body
                    && !body.is_empty()
                    && exchange.request_content_type().is_some_and(is_textual)
            })
            .map(|body| RequestBody {
                value: String::from_utf8_lossy(body).into_owned(),
                operator: BodyOperator::EqualTo,
            });

        let headers = match &self.options.record_only_response_headers {
            Some(only) => first_values(&exchange.response_headers, |name| {
                only.iter().any(|o| o.eq_ignore_ascii_case(name))
            }),
            None => first_values(&exchange.response_headers, |name| !is_skipped(name)),
        };

        Resource {
            path: exchange.path().to_string(),
            method: exchange.method.as_str().to_string(),
            query_params: (!query_params.is_empty()).then_some(query_params),
            request_headers,
            request_body,
            response: ResponseSpec {
                status_code: exchange.status.as_u16(),
                static_file,
                headers: (!headers.is_empty()).then_some(headers),
            },
        }
    }
}

struct ResponseFile {
    name: String,
    /// Set when the file was written for this exchange.
    new_hash: Option<String>,
}

/// Sender side of a running consumer.
pub struct RecorderHandle {
    sender: mpsc::UnboundedSender<HttpExchange>,
    join: JoinHandle<Recorder>,
}

impl RecorderHandle {
    pub fn sender(&self) -> mpsc::UnboundedSender<HttpExchange> {
        self.sender.clone()
    }

    /// Close the queue, let the consumer drain it and hand back the recorder.
    pub async fn finish(self) -> Result<Recorder> {
        drop(self.sender);
        self.join
            .await
            .map_err(|e| RecorderError::Io(std::io::Error::other(e)))
    }
}

/// SHA-1 over the method and the URL with its query pairs sorted.
pub fn request_fingerprint(exchange: &HttpExchange) -> String {
    let mut pairs: Vec<&str> = exchange
        .query()
        .map(|q| q.split('&').filter(|p| !p.is_empty()).collect())
        .unwrap_or_default();
    pairs.sort_unstable();

    let mut hasher = Sha1::new();
    hasher.update(exchange.method.as_str().as_bytes());
    hasher.update(b" ");
    hasher.update(exchange.path().as_bytes());
    if !pairs.is_empty() {
        hasher.update(b"?");
        hasher.update(pairs.join("&").as_bytes());
    }
    hex::encode(hasher.finalize())
}

fn sha1_hex(body: &Bytes) -> String {
    hex::encode(Sha1::digest(body))
}

/// First value per header name, minus hop-by-hop headers and whatever `keep`
/// rejects.
fn first_values(headers: &HeaderMap, keep: impl Fn(&str) -> bool) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for name in headers.keys() {
        let name = name.as_str();
        if is_hop_by_hop(name) || !keep(name) {
            continue;
        }
        if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
            out.insert(name.to_string(), value.to_string());
        }
    }
    out
}

fn write_response_file(path: &Path, body: &[u8]) -> Result<()> {
    fs::write(path, body)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o644))?;
    }
    Ok(())
}
