//! Consul KV client
//!
//! The daemon only ever issues one kind of request: a recursive, blocking
//! listing of a key prefix. [`KvClient`] is the seam between the watchers
//! and the transport, with one implementation per [`Endpoint`] flavour:
//!
//! - [`HttpKvClient`]: reqwest over TCP (http/https)
//! - [`UnixKvClient`]: hyper over a unix domain socket
//!
//! Both share [`decode_listing`], so status handling, cursor parsing and
//! value decoding behave identically whatever the transport.

mod http;
#[cfg(any(test, feature = "test-support"))]
mod mock;
#[cfg(unix)]
mod unix;

pub use http::HttpKvClient;
#[cfg(any(test, feature = "test-support"))]
pub use mock::MockKvClient;
#[cfg(unix)]
pub use unix::UnixKvClient;

use crate::config::Endpoint;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Response header carrying the blocking-query cursor
pub const INDEX_HEADER: &str = "X-Consul-Index";

/// Request header carrying the ACL token
pub const TOKEN_HEADER: &str = "X-Consul-Token";

/// Longest slice of an error body kept in [`ConsulError::Status`]
const MAX_ERROR_BODY: usize = 256;

/// One row of a KV listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    pub key: String,
    pub value: Vec<u8>,
    pub modify_index: u64,
}

impl KvEntry {
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>, modify_index: u64) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            modify_index,
        }
    }
}

/// Full listing of a prefix plus the cursor for the next blocking call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KvListing {
    pub entries: Vec<KvEntry>,
    /// `X-Consul-Index`, when present and numeric
    pub index: Option<u64>,
}

/// Errors from a listing request
#[derive(Debug, Error)]
pub enum ConsulError {
    /// Transport failure (connect, TLS, timeout) on the HTTP client
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Transport failure on the unix socket
    #[error("socket I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// Request did not complete within the long-poll budget
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Non-2xx status other than 404
    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    /// Body is not a JSON array of KV entries
    #[error("invalid listing body: {0}")]
    Decode(#[from] serde_json::Error),

    /// Entry value is not valid base64
    #[error("invalid base64 value for key {key}: {source}")]
    Base64 {
        key: String,
        source: base64::DecodeError,
    },

    /// HTTP framing failure on the unix socket connection
    #[error("socket HTTP exchange failed: {0}")]
    Http(#[from] hyper::Error),

    /// Request could not be built (invalid path or header value)
    #[error("invalid request: {0}")]
    InvalidRequest(#[from] hyper::http::Error),

    /// Endpoint flavour not available on this platform
    #[error("unsupported endpoint: {0}")]
    Unsupported(String),
}

/// Blocking prefix listing against the KV store.
#[async_trait]
pub trait KvClient: Send + Sync {
    /// List every key under `prefix`, blocking until the store's index
    /// moves past `index` or `wait` elapses. `index == 0` never blocks.
    async fn list(&self, prefix: &str, index: u64, wait: Duration)
    -> Result<KvListing, ConsulError>;
}

/// Build the client matching `endpoint`.
pub fn client_for(
    endpoint: &Endpoint,
    token: Option<String>,
) -> Result<Arc<dyn KvClient>, ConsulError> {
    match endpoint {
        Endpoint::Http(_) => Ok(Arc::new(HttpKvClient::new(endpoint, token)?)),
        #[cfg(unix)]
        Endpoint::Socket(path) => Ok(Arc::new(UnixKvClient::new(path.clone(), token))),
        #[cfg(not(unix))]
        Endpoint::Socket(path) => Err(ConsulError::Unsupported(format!(
            "unix socket {} on this platform",
            path.display()
        ))),
    }
}

/// Path and query of a recursive blocking listing.
pub fn listing_path(prefix: &str, index: u64, wait: Duration) -> String {
    let prefix = prefix.trim_start_matches('/');
    format!(
        "/v1/kv/{prefix}?recurse&wait={}&index={index}",
        format_wait(wait)
    )
}

/// Total time a request may take: the wait, the store's wait/16 jitter, and slack.
pub fn request_budget(wait: Duration) -> Duration {
    wait + wait / 16 + Duration::from_secs(5)
}

fn format_wait(wait: Duration) -> String {
    if wait.subsec_millis() == 0 {
        format!("{}s", wait.as_secs().max(1))
    } else {
        format!("{}ms", wait.as_millis())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawEntry {
    key: String,
    #[serde(default)]
    value: Option<String>,
    modify_index: u64,
}

/// Turn a raw response into a listing.
///
/// 404 means the prefix currently holds no keys; it is an empty listing, not
/// a failure, so keys deleted down to nothing are still observed as removed.
pub fn decode_listing(
    status: u16,
    index_header: Option<&str>,
    body: &[u8],
) -> Result<KvListing, ConsulError> {
    let index = index_header.and_then(|v| v.trim().parse::<u64>().ok());

    match status {
        404 => Ok(KvListing {
            entries: Vec::new(),
            index,
        }),
        200..=299 => {
            let raw: Vec<RawEntry> = if body.iter().all(u8::is_ascii_whitespace) {
                Vec::new()
            } else {
                serde_json::from_slice(body)?
            };
            let entries = raw
                .into_iter()
                .map(decode_entry)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(KvListing { entries, index })
        }
        _ => Err(ConsulError::Status {
            status,
            body: String::from_utf8_lossy(body)
                .chars()
                .take(MAX_ERROR_BODY)
                .collect(),
        }),
    }
}

fn decode_entry(raw: RawEntry) -> Result<KvEntry, ConsulError> {
    let value = match raw.value {
        Some(encoded) => STANDARD
            .decode(encoded.as_bytes())
            .map_err(|source| ConsulError::Base64 {
                key: raw.key.clone(),
                source,
            })?,
        None => Vec::new(),
    };
    Ok(KvEntry {
        key: raw.key,
        value,
        modify_index: raw.modify_index,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listing_path() {
        assert_eq!(
            listing_path("/service/web", 42, Duration::from_secs(10)),
            "/v1/kv/service/web?recurse&wait=10s&index=42"
        );
        assert_eq!(
            listing_path("service", 0, Duration::from_millis(1500)),
            "/v1/kv/service?recurse&wait=1500ms&index=0"
        );
    }

    #[test]
    fn test_decode_listing_entries() {
        let body = br#"[
            {"Key":"service/web/a.ctmpl","Value":"WA==","ModifyIndex":7,"Flags":0},
            {"Key":"service/web/","Value":null,"ModifyIndex":3}
        ]"#;
        let listing = decode_listing(200, Some("12"), body).unwrap();

        assert_eq!(listing.index, Some(12));
        assert_eq!(
            listing.entries,
            vec![
                KvEntry::new("service/web/a.ctmpl", b"X".to_vec(), 7),
                KvEntry::new("service/web/", Vec::new(), 3),
            ]
        );
    }

    #[test]
    fn test_decode_listing_not_found_is_empty() {
        let listing = decode_listing(404, Some("99"), b"").unwrap();
        assert!(listing.entries.is_empty());
        assert_eq!(listing.index, Some(99));
    }

    #[test]
    fn test_decode_listing_unparseable_index_ignored() {
        let listing = decode_listing(200, Some("not-a-number"), b"[]").unwrap();
        assert_eq!(listing.index, None);
    }

    #[test]
    fn test_decode_listing_server_error() {
        let err = decode_listing(500, None, b"rpc error: No cluster leader").unwrap_err();
        match err {
            ConsulError::Status { status, body } => {
                assert_eq!(status, 500);
                assert!(body.contains("No cluster leader"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_decode_listing_bad_base64() {
        let body = br#"[{"Key":"a.ctmpl","Value":"%%%","ModifyIndex":1}]"#;
        assert!(matches!(
            decode_listing(200, None, body),
            Err(ConsulError::Base64 { .. })
        ));
    }
}
