//! Header classification shared by the proxy and the recorder.

use hyper::header::{HeaderMap, HeaderName, CONNECTION};

/// Headers that describe one transport hop and are never forwarded or recorded.
pub const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Headers left out of generated resources. They either change on every
/// response or are recomputed by the engine when it serves the mock.
pub const SKIPPED_HEADERS: [&str; 16] = [
    "accept-encoding",
    "age",
    "cache-control",
    "content-length",
    "date",
    "etag",
    "expires",
    "host",
    "if-modified-since",
    "if-none-match",
    "last-modified",
    "pragma",
    "server",
    "vary",
    "via",
    "x-request-id",
];

const TEXTUAL_TYPES: [&str; 4] = [
    "application/json",
    "application/xml",
    "application/javascript",
    "application/x-www-form-urlencoded",
];

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

pub fn is_skipped(name: &str) -> bool {
    SKIPPED_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// Remove hop-by-hop headers, including any the `Connection` header names.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Media type without parameters, lowercased.
pub fn media_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Whether a body of this content type can be inspected as text.
pub fn is_textual(content_type: &str) -> bool {
    let media = media_type(content_type);
    media.starts_with("text/") || TEXTUAL_TYPES.contains(&media.as_str())
}

/// First value of the named header, if it is valid UTF-8.
pub fn first_value<'a>(headers: &'a HeaderMap, name: impl hyper::header::AsHeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}
