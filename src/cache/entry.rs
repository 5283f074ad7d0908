//! Stored response representations.

use std::collections::BTreeSet;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use tokio::time::Instant;

use crate::http::{Headers, Response, StatusCode};

use super::key::KeyId;

/// A cached response. Immutable once built; replacing it means storing a new
/// entry under the same key.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    key: KeyId,
    status: StatusCode,
    headers: Headers,
    body: Bytes,
    created_at: Instant,
    stored_at: SystemTime,
    lifetime: Duration,
    etag: Option<String>,
    last_modified: Option<SystemTime>,
    tags: BTreeSet<String>,
}

impl CacheEntry {
    /// Captures `response` under `key`. `ETag` and `Last-Modified` are lifted
    /// out of the response headers; an unparseable `Last-Modified` is ignored.
    pub fn from_response(
        key: KeyId,
        response: &Response,
        lifetime: Duration,
        tags: BTreeSet<String>,
    ) -> Self {
        let headers = response.headers().clone();
        let etag = headers.get("etag").map(|v| v.trim().to_owned());
        let last_modified = headers
            .get("last-modified")
            .and_then(|v| httpdate::parse_http_date(v.trim()).ok());

        Self {
            key,
            status: response.status(),
            headers,
            body: response.payload().clone(),
            created_at: Instant::now(),
            stored_at: SystemTime::now(),
            lifetime,
            etag,
            last_modified,
            tags,
        }
    }

    pub fn key(&self) -> KeyId {
        self.key
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Wall-clock time the entry was built; the validator for
    /// `If-Modified-Since` when the response carried no `Last-Modified`.
    pub fn stored_at(&self) -> SystemTime {
        self.stored_at
    }

    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    pub fn etag(&self) -> Option<&str> {
        self.etag.as_deref()
    }

    pub fn last_modified(&self) -> Option<SystemTime> {
        self.last_modified
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    /// `true` while `now - created_at < lifetime`.
    pub fn is_fresh_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) < self.lifetime
    }

    /// Bytes charged against the store's size limit.
    pub fn size(&self) -> usize {
        self.body.len() + self.headers.wire_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(response: Response, lifetime: Duration) -> CacheEntry {
        CacheEntry::from_response(KeyId::from_bytes([7; 16]), &response, lifetime, BTreeSet::new())
    }

    #[test]
    fn captures_validators() {
        let response = Response::new(StatusCode::Ok)
            .header("ETag", "\"abc\"")
            .header("Last-Modified", "Sun, 06 Nov 1994 08:49:37 GMT")
            .body("hi");
        let e = entry(response, Duration::from_secs(60));

        assert_eq!(e.etag(), Some("\"abc\""));
        assert_eq!(
            e.last_modified(),
            Some(SystemTime::UNIX_EPOCH + Duration::from_secs(784_111_777))
        );
        assert_eq!(e.body(), &Bytes::from_static(b"hi"));
    }

    #[test]
    fn unparseable_last_modified_is_ignored() {
        let response = Response::new(StatusCode::Ok).header("Last-Modified", "yesterday");
        assert_eq!(entry(response, Duration::from_secs(1)).last_modified(), None);
    }

    #[test]
    fn size_counts_body_and_headers() {
        let response = Response::new(StatusCode::Ok).header("A", "b").body("12345");
        // "A" + "b" + ": " + "\r\n"
        assert_eq!(entry(response, Duration::from_secs(1)).size(), 5 + 6);
    }

    #[tokio::test(start_paused = true)]
    async fn freshness_boundary() {
        let e = entry(Response::new(StatusCode::Ok), Duration::from_secs(10));
        let start = e.created_at();

        assert!(e.is_fresh_at(start));
        assert!(e.is_fresh_at(start + Duration::from_millis(9_999)));
        assert!(!e.is_fresh_at(start + Duration::from_secs(10)));
        assert!(!e.is_fresh_at(start + Duration::from_millis(10_001)));
    }
}
