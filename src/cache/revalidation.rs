//! Freshness and conditional-request evaluation.
//!
//! Given the stored entry for a key (if any) and the request's conditional
//! headers, [`evaluate`] decides between a full hit, a `304 Not Modified`,
//! and a miss. Expired entries are never served.
//!
//! `If-None-Match` takes precedence: when it is present and well formed,
//! `If-Modified-Since` is ignored (RFC 9110 §13.2.2). Malformed conditional
//! headers are treated as absent.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::time::Instant;

use crate::http::{Headers, Response, StatusCode};

use super::entry::CacheEntry;
use super::error::CacheError;

/// Headers carried over from the stored response onto a `304`.
const NOT_MODIFIED_HEADERS: &[&str] = &[
    "cache-control",
    "content-location",
    "date",
    "etag",
    "expires",
    "last-modified",
    "vary",
];

/// Outcome of looking up a request against the store.
#[derive(Debug, Clone)]
pub enum Revalidation {
    /// Nothing stored under the key.
    NoCacheEntry,
    /// A fresh entry whose full response should be replayed.
    FreshHit(Arc<CacheEntry>),
    /// An entry exists but has outlived its freshness lifetime.
    StaleMiss,
    /// A fresh entry the client already holds.
    NotModified(Arc<CacheEntry>),
}

impl Revalidation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoCacheEntry => "miss",
            Self::FreshHit(_) => "hit",
            Self::StaleMiss => "stale",
            Self::NotModified(_) => "not_modified",
        }
    }
}

/// Classifies `entry` for a request carrying `headers`, at `now`.
pub fn evaluate(entry: Option<Arc<CacheEntry>>, headers: &Headers, now: Instant) -> Revalidation {
    let Some(entry) = entry else {
        return Revalidation::NoCacheEntry;
    };
    if !entry.is_fresh_at(now) {
        return Revalidation::StaleMiss;
    }

    match if_none_match(headers) {
        Ok(Some(condition)) => {
            return if condition.matches(entry.etag()) {
                Revalidation::NotModified(entry)
            } else {
                Revalidation::FreshHit(entry)
            };
        }
        Ok(None) => {}
        Err(e) => tracing::debug!(cache = "output", error = %e, "ignoring conditional header"),
    }

    match if_modified_since(headers) {
        Ok(Some(since)) if not_modified_since(&entry, since) => Revalidation::NotModified(entry),
        Ok(_) => Revalidation::FreshHit(entry),
        Err(e) => {
            tracing::debug!(cache = "output", error = %e, "ignoring conditional header");
            Revalidation::FreshHit(entry)
        }
    }
}

/// Replays the stored response verbatim.
pub fn full_response(entry: &CacheEntry) -> Response {
    Response::from_parts(entry.status(), entry.headers().clone(), entry.body().clone())
}

/// Builds the `304 Not Modified` answer for `entry`: no body, validator and
/// caching headers preserved in their stored order.
pub fn not_modified_response(entry: &CacheEntry) -> Response {
    let headers = entry.headers().select(NOT_MODIFIED_HEADERS);
    Response::from_parts(StatusCode::NotModified, headers, Default::default())
}

enum EntityTagCondition {
    Any,
    Tags(Vec<String>),
}

impl EntityTagCondition {
    // Weak comparison: the `W/` prefix is ignored on both sides.
    fn matches(&self, etag: Option<&str>) -> bool {
        let Some(etag) = etag else {
            return false;
        };
        match self {
            Self::Any => true,
            Self::Tags(tags) => {
                let stored = opaque_tag(etag);
                stored.is_some() && tags.iter().any(|t| Some(t.as_str()) == stored)
            }
        }
    }
}

fn if_none_match(headers: &Headers) -> Result<Option<EntityTagCondition>, CacheError> {
    const MALFORMED: CacheError = CacheError::MalformedConditionalHeader {
        header: "If-None-Match",
    };

    if !headers.contains("if-none-match") {
        return Ok(None);
    }
    let elements: Vec<&str> = headers.list("if-none-match").collect();
    if elements == ["*"] {
        return Ok(Some(EntityTagCondition::Any));
    }
    // A header holding only separators has no tags to match.
    if elements.is_empty() {
        return Err(MALFORMED);
    }

    let tags = elements
        .into_iter()
        .map(|t| opaque_tag(t).map(str::to_owned).ok_or(MALFORMED))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Some(EntityTagCondition::Tags(tags)))
}

/// Strips an optional `W/` and the surrounding quotes. Unquoted tags are
/// accepted as-is; anything with unbalanced quotes is rejected.
fn opaque_tag(raw: &str) -> Option<&str> {
    let raw = raw.trim();
    let raw = raw.strip_prefix("W/").unwrap_or(raw);
    let tag = match raw.strip_prefix('"') {
        Some(rest) => rest.strip_suffix('"')?,
        None => raw,
    };
    if raw.is_empty() || tag.contains('"') {
        return None;
    }
    Some(tag)
}

fn if_modified_since(headers: &Headers) -> Result<Option<SystemTime>, CacheError> {
    headers
        .get("if-modified-since")
        .map(|v| {
            httpdate::parse_http_date(v.trim()).map_err(|_| {
                CacheError::MalformedConditionalHeader {
                    header: "If-Modified-Since",
                }
            })
        })
        .transpose()
}

// The validator is the stored Last-Modified, else the stored Date. An entry
// with neither never answers 304 to If-Modified-Since. HTTP dates have
// one-second resolution, so compare whole seconds.
fn not_modified_since(entry: &CacheEntry, since: SystemTime) -> bool {
    let validator = entry.last_modified().or_else(|| {
        entry
            .headers()
            .get("date")
            .and_then(|d| httpdate::parse_http_date(d.trim()).ok())
    });
    validator.is_some_and(|v| unix_secs(since) >= unix_secs(v))
}

fn unix_secs(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs())
}
