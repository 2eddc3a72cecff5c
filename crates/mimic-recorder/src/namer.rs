//! On-disk names for captured response bodies.
//!
//! Names are a pure function of the upstream host label, the request path and
//! method, the response media type and an optional uniqueness prefix. In
//! hierarchical mode the request path becomes nested directories; in flat mode
//! every file lands in the output directory with the nesting encoded in its
//! name.

use hyper::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use hyper::Uri;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::{RecorderError, Result};
use crate::exchange::HttpExchange;
use crate::headers::{first_value, media_type};

const INDEX: &str = "index";
const DEFAULT_EXTENSION: &str = ".txt";

/// Extensions for common media types. Consulted before `mime_guess`, whose
/// first entry for a type is not always the conventional one.
const KNOWN_EXTENSIONS: [(&str, &str); 14] = [
    ("application/javascript", ".js"),
    ("application/json", ".json"),
    ("application/octet-stream", ".bin"),
    ("application/pdf", ".pdf"),
    ("application/xml", ".xml"),
    ("image/gif", ".gif"),
    ("image/jpeg", ".jpg"),
    ("image/png", ".png"),
    ("image/svg+xml", ".svg"),
    ("text/css", ".css"),
    ("text/csv", ".csv"),
    ("text/html", ".html"),
    ("text/plain", ".txt"),
    ("text/xml", ".xml"),
];

/// `host` or `host-port` when the upstream names a non-default port.
pub fn host_label(upstream: &Uri) -> Result<String> {
    let host = upstream
        .host()
        .ok_or_else(|| RecorderError::Config(format!("upstream {upstream} has no host")))?;
    let default_port = match upstream.scheme_str() {
        Some("https") => 443,
        _ => 80,
    };
    Ok(match upstream.port_u16() {
        Some(port) if port != default_port => format!("{host}-{port}"),
        _ => host.to_string(),
    })
}

#[derive(Debug, Clone)]
pub struct ResponseNamer {
    output_dir: PathBuf,
    host_label: String,
    flat: bool,
}

impl ResponseNamer {
    pub fn new(output_dir: impl Into<PathBuf>, host_label: impl Into<String>, flat: bool) -> Self {
        Self {
            output_dir: output_dir.into(),
            host_label: host_label.into(),
            flat,
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Name for the response body of `exchange`, relative to the output
    /// directory with `/` separators. Hierarchical mode creates the parent
    /// directories.
    pub fn name(&self, exchange: &HttpExchange, prefix: &str) -> io::Result<String> {
        let (parent, mut base) = split_path(exchange.path());
        if Path::new(&base).extension().is_none() {
            base.push_str(&extension_for(exchange));
        }
        let method = exchange.method.as_str();

        if self.flat {
            let name = if parent.is_empty() {
                format!("{}-{method}-{prefix}{base}", self.host_label)
            } else {
                format!(
                    "{}-{method}-{}_{prefix}{base}",
                    self.host_label,
                    parent.replace('/', "_")
                )
            };
            return Ok(name);
        }

        let file = format!("{method}-{prefix}{base}");
        if parent.is_empty() {
            return Ok(file);
        }
        fs::create_dir_all(self.output_dir.join(&parent))?;
        Ok(format!("{parent}/{file}"))
    }
}

/// Split a request path into its parent directory and final segment. Empty,
/// `.` and `..` segments are dropped so names never escape the output directory.
fn split_path(path: &str) -> (String, String) {
    let trailing_slash = path.ends_with('/');
    let mut segments: Vec<&str> = path
        .split('/')
        .filter(|s| !s.is_empty() && *s != "." && *s != "..")
        .collect();
    let base = if trailing_slash {
        None
    } else {
        segments.pop()
    };
    (
        segments.join("/"),
        base.unwrap_or(INDEX).to_string(),
    )
}

/// Extension for a base name that lacks one: the `filename=` of a
/// Content-Disposition header, else the response media type, else `.txt`.
fn extension_for(exchange: &HttpExchange) -> String {
    if let Some(ext) = first_value(&exchange.response_headers, CONTENT_DISPOSITION)
        .and_then(disposition_filename)
        .and_then(|name| {
            Path::new(&name)
                .extension()
                .map(|e| format!(".{}", e.to_string_lossy()))
        })
    {
        return ext;
    }

    first_value(&exchange.response_headers, CONTENT_TYPE)
        .map(media_type)
        .and_then(|media| extension_for_media_type(&media))
        .unwrap_or_else(|| DEFAULT_EXTENSION.to_string())
}

pub fn extension_for_media_type(media: &str) -> Option<String> {
    if let Some((_, ext)) = KNOWN_EXTENSIONS.iter().find(|(m, _)| *m == media) {
        return Some(ext.to_string());
    }
    mime_guess::get_mime_extensions_str(media)
        .and_then(|exts| exts.first())
        .map(|ext| format!(".{ext}"))
}

fn disposition_filename(value: &str) -> Option<String> {
    value.split(';').find_map(|directive| {
        let (key, name) = directive.trim().split_once('=')?;
        if !key.trim().eq_ignore_ascii_case("filename") {
            return None;
        }
        let name = name.trim().trim_matches('"');
        (!name.is_empty()).then(|| name.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::tests::exchange;
    use hyper::Method;
    use tempfile::TempDir;

    #[test]
    fn test_host_label() {
        let label = |u: &str| host_label(&u.parse().unwrap()).unwrap();
        assert_eq!(label("http://localhost:8081"), "localhost-8081");
        assert_eq!(label("http://example.com"), "example.com");
        assert_eq!(label("https://example.com:443/api"), "example.com");
        assert_eq!(label("http://example.com:443"), "example.com-443");
        assert!(host_label(&"/relative".parse().unwrap()).is_err());
    }

    #[test]
    fn test_split_path() {
        assert_eq!(split_path("/"), (String::new(), "index".to_string()));
        assert_eq!(split_path(""), (String::new(), "index".to_string()));
        assert_eq!(
            split_path("/api/v1/users.json"),
            ("api/v1".to_string(), "users.json".to_string())
        );
        assert_eq!(
            split_path("/api/users/"),
            ("api/users".to_string(), "index".to_string())
        );
        assert_eq!(
            split_path("/../etc/./passwd"),
            ("etc".to_string(), "passwd".to_string())
        );
    }

    #[test]
    fn test_index_uses_disposition_extension() {
        let tmp = TempDir::new().unwrap();
        let namer = ResponseNamer::new(tmp.path(), "localhost-9000", false);
        let mut ex = exchange(Method::GET, "/", "application/octet-stream", "hello world");
        ex.response_headers.insert(
            CONTENT_DISPOSITION,
            "attachment; filename=\"hello.txt\"".parse().unwrap(),
        );
        assert_eq!(namer.name(&ex, "").unwrap(), "GET-index.txt");
    }

    #[test]
    fn test_extension_from_content_type() {
        let tmp = TempDir::new().unwrap();
        let namer = ResponseNamer::new(tmp.path(), "localhost-9000", false);
        let ex = exchange(Method::POST, "/users", "application/json; charset=utf-8", "{}");
        assert_eq!(namer.name(&ex, "").unwrap(), "POST-users.json");
    }

    #[test]
    fn test_missing_content_type_defaults_to_txt() {
        let tmp = TempDir::new().unwrap();
        let namer = ResponseNamer::new(tmp.path(), "localhost-9000", false);
        let ex = exchange(Method::GET, "/", "", "x");
        assert_eq!(namer.name(&ex, "").unwrap(), "GET-index.txt");
    }

    #[test]
    fn test_existing_extension_is_kept() {
        let tmp = TempDir::new().unwrap();
        let namer = ResponseNamer::new(tmp.path(), "localhost-9000", false);
        let ex = exchange(Method::GET, "/static/app.css", "text/plain", "x");
        assert_eq!(namer.name(&ex, "").unwrap(), "static/GET-app.css");
    }

    #[test]
    fn test_hierarchical_creates_directories() {
        let tmp = TempDir::new().unwrap();
        let namer = ResponseNamer::new(tmp.path(), "localhost-9000", false);
        let ex = exchange(Method::GET, "/api/v1/users", "application/json", "[]");
        let name = namer.name(&ex, "abc-").unwrap();
        assert_eq!(name, "api/v1/GET-abc-users.json");
        assert!(tmp.path().join("api/v1").is_dir());
    }

    #[test]
    fn test_flat_encodes_nesting() {
        let tmp = TempDir::new().unwrap();
        let namer = ResponseNamer::new(tmp.path(), "localhost-9000", true);

        let root = exchange(Method::GET, "/", "text/plain", "x");
        assert_eq!(namer.name(&root, "").unwrap(), "localhost-9000-GET-index.txt");

        let nested = exchange(Method::GET, "/api/v1/users", "application/json", "[]");
        assert_eq!(
            namer.name(&nested, "p-").unwrap(),
            "localhost-9000-GET-api_v1_p-users.json"
        );
        assert!(!tmp.path().join("api").exists());
    }

    #[test]
    fn test_media_type_fallback_to_mime_table() {
        assert_eq!(extension_for_media_type("text/plain").as_deref(), Some(".txt"));
        assert_eq!(extension_for_media_type("application/x-unknown-thing"), None);
        assert!(extension_for_media_type("audio/mpeg").is_some());
    }
}
