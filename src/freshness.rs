//! Validators and conditional request evaluation.
//!
//! Cached bodies carry a strong validator derived from a SHA-256 of the exact
//! bytes served, so each encoding variant has its own tag. Objects streamed
//! straight from a backend use the backend's own ETag, or a size and
//! modification time composite when the backend has none.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use httpdate::parse_http_date;
use hyper::HeaderMap;
use hyper::header::{IF_MODIFIED_SINCE, IF_NONE_MATCH};
use sha2::{Digest, Sha256};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Client copy is current: answer 304 without a body.
    NotModified,
    /// Send the full representation.
    Modified,
}

/// Strong validator for the exact bytes of `body`.
pub fn content_etag(body: &[u8]) -> String {
    let digest = Sha256::digest(body);
    format!("\"{}\"", URL_SAFE_NO_PAD.encode(&digest[..18]))
}

/// Validator for a body that is streamed rather than hashed.
pub fn metadata_etag(backend_etag: Option<&str>, size: u64, modified: Option<SystemTime>) -> String {
    if let Some(etag) = backend_etag.map(str::trim).filter(|v| !v.is_empty()) {
        let etag = etag.strip_prefix("W/").unwrap_or(etag);
        return if etag.starts_with('"') {
            etag.to_string()
        } else {
            format!("\"{}\"", etag)
        };
    }

    let mtime_secs = modified
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format!("\"{:x}-{:x}\"", size, mtime_secs)
}

/// Whether `etag` appears in an `If-None-Match` list (or the list is `*`).
pub fn etag_matches(etag: &str, if_none_match: &str) -> bool {
    if if_none_match.trim() == "*" {
        return true;
    }
    if_none_match.split(',').any(|candidate| candidate.trim() == etag)
}

/// Whether the resource changed after the `If-Modified-Since` date.
pub fn modified_since(last_modified: Option<SystemTime>, if_modified_since: &str) -> bool {
    let Some(file_time) = last_modified else {
        return true; // Unknown mtime, assume modified
    };
    let Ok(since) = parse_http_date(if_modified_since) else {
        return true; // Invalid header, assume modified
    };

    // HTTP dates have one second resolution
    match file_time.duration_since(since) {
        Ok(delta) => delta >= Duration::from_secs(1),
        Err(_) => false,
    }
}

/// Decides between a full response and 304.
///
/// `If-None-Match` takes precedence: when present, `If-Modified-Since` is
/// ignored.
pub fn evaluate(headers: &HeaderMap, etag: &str, last_modified: Option<SystemTime>) -> Freshness {
    if let Some(if_none_match) = headers.get(IF_NONE_MATCH) {
        let matched = if_none_match
            .to_str()
            .map(|value| etag_matches(etag, value))
            .unwrap_or(false);
        return if matched {
            Freshness::NotModified
        } else {
            Freshness::Modified
        };
    }

    if let Some(since) = headers.get(IF_MODIFIED_SINCE).and_then(|v| v.to_str().ok()) {
        if !modified_since(last_modified, since) {
            return Freshness::NotModified;
        }
    }

    Freshness::Modified
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;

    #[test]
    fn test_content_etag_is_stable_and_content_sensitive() {
        let a = content_etag(b"hello");
        assert_eq!(a, content_etag(b"hello"));
        assert_ne!(a, content_etag(b"hello!"));
        assert!(a.starts_with('"') && a.ends_with('"'));
        assert!(!a.starts_with("W/"));
    }

    #[test]
    fn test_metadata_etag() {
        assert_eq!(metadata_etag(Some("\"abc\""), 1, None), "\"abc\"");
        assert_eq!(metadata_etag(Some("abc"), 1, None), "\"abc\"");
        assert_eq!(metadata_etag(Some("W/\"abc\""), 1, None), "\"abc\"");

        let mtime = UNIX_EPOCH + Duration::from_secs(0x10);
        assert_eq!(metadata_etag(None, 0xff, Some(mtime)), "\"ff-10\"");
    }

    #[test]
    fn test_if_none_match_precedence() {
        let etag = "\"v1\"";
        let mtime = UNIX_EPOCH + Duration::from_secs(1_700_000_000);

        let mut headers = HeaderMap::new();
        headers.insert(IF_NONE_MATCH, HeaderValue::from_static("\"v0\", \"v1\""));
        assert_eq!(evaluate(&headers, etag, Some(mtime)), Freshness::NotModified);

        // A mismatching validator wins over a matching date
        let mut headers = HeaderMap::new();
        headers.insert(IF_NONE_MATCH, HeaderValue::from_static("\"v0\""));
        headers.insert(
            IF_MODIFIED_SINCE,
            HeaderValue::from_str(&httpdate::fmt_http_date(mtime)).unwrap(),
        );
        assert_eq!(evaluate(&headers, etag, Some(mtime)), Freshness::Modified);

        let mut headers = HeaderMap::new();
        headers.insert(IF_NONE_MATCH, HeaderValue::from_static("*"));
        assert_eq!(evaluate(&headers, etag, None), Freshness::NotModified);
    }

    #[test]
    fn test_if_modified_since() {
        let mtime = UNIX_EPOCH + Duration::from_millis(1_700_000_000_500);

        let mut headers = HeaderMap::new();
        headers.insert(
            IF_MODIFIED_SINCE,
            HeaderValue::from_str(&httpdate::fmt_http_date(mtime)).unwrap(),
        );
        assert_eq!(evaluate(&headers, "\"x\"", Some(mtime)), Freshness::NotModified);

        let later = mtime + Duration::from_secs(5);
        assert_eq!(evaluate(&headers, "\"x\"", Some(later)), Freshness::Modified);
        assert_eq!(evaluate(&headers, "\"x\"", None), Freshness::Modified);

        let mut garbage = HeaderMap::new();
        garbage.insert(IF_MODIFIED_SINCE, HeaderValue::from_static("yesterday"));
        assert_eq!(evaluate(&garbage, "\"x\"", Some(mtime)), Freshness::Modified);

        assert_eq!(evaluate(&HeaderMap::new(), "\"x\"", Some(mtime)), Freshness::Modified);
    }
}
