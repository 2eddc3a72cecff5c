//! One request/response pair observed by the proxy.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use hyper::{HeaderMap, Method, StatusCode, Uri};

use crate::headers::first_value;

#[derive(Debug, Clone)]
pub struct HttpExchange {
    pub method: Method,
    /// Request target as received, path and query only.
    pub uri: Uri,
    pub request_headers: HeaderMap,
    pub request_body: Option<Bytes>,
    pub status: StatusCode,
    pub response_headers: HeaderMap,
    pub response_body: Bytes,
    pub timestamp: DateTime<Utc>,
}

impl HttpExchange {
    pub fn path(&self) -> &str {
        self.uri.path()
    }

    pub fn query(&self) -> Option<&str> {
        self.uri.query()
    }

    pub fn request_content_type(&self) -> Option<&str> {
        first_value(&self.request_headers, hyper::header::CONTENT_TYPE)
    }

    pub fn response_content_type(&self) -> Option<&str> {
        first_value(&self.response_headers, hyper::header::CONTENT_TYPE)
    }

    /// Query pairs in request order, percent-decoded. Keys without `=` get
    /// an empty value.
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        self.query()
            .map(|query| {
                query
                    .split('&')
                    .filter(|pair| !pair.is_empty())
                    .map(|pair| {
                        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                        (percent_decode(key), percent_decode(value))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Decode `%XX` escapes and `+` as space. Invalid escapes are kept as-is.
pub fn percent_decode(input: &str) -> String {
    let spaced = input.replace('+', " ");
    match urlencoding::decode(&spaced) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => String::from_utf8_lossy(&urlencoding::decode_binary(spaced.as_bytes())).into_owned(),
    }
}
