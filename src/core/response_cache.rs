//! In-memory cache for idempotent registry metadata endpoints.
//!
//! Only a fixed allowlist of `"<METHOD> <path+query>"` patterns is cached:
//! the API version probe, catalog listing, tag listing and manifest `HEAD`
//! checks. Upstream cache-control headers are ignored on purpose; these
//! endpoints are cached for the configured TTL regardless.
use std::{fmt, sync::Arc, time::Duration};

use axum::{
    body::Body,
    http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, header},
    response::Response,
};
use bytes::Bytes;
use moka::{policy::EvictionPolicy, sync::Cache};
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

/// Response header reporting whether the cache answered.
pub const X_CACHE: &str = "x-cache";

static CACHEABLE_ENDPOINTS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"^GET /v2/$",
        r"^HEAD /v2/$",
        r"^GET /v2/_catalog$",
        r"^GET /v2/_catalog\?n=\d*$",
        r"^GET /v2/.*/tags/list$",
        r"^GET /v2/.*/tags/list\?n=\d*$",
        r"^HEAD /v2/.*/manifests/.*$",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("valid regex"))
    .collect()
});

fn path_and_query(uri: &Uri) -> &str {
    uri.path_and_query()
        .map_or_else(|| uri.path(), |pq| pq.as_str())
}

/// Whether a request hits one of the cacheable registry endpoints.
pub fn is_cacheable(method: &Method, uri: &Uri) -> bool {
    let line = format!("{method} {}", path_and_query(uri));
    CACHEABLE_ENDPOINTS.iter().any(|pattern| pattern.is_match(&line))
}

/// SHA-256 digest of method, request target and sorted `Accept` values.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn from_request(method: &Method, uri: &Uri, headers: &HeaderMap) -> Self {
        let mut accept: Vec<&str> = headers
            .get_all(header::ACCEPT)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .collect();
        accept.sort_unstable();

        let mut hasher = Sha256::new();
        hasher.update(method.as_str());
        hasher.update(b"\n");
        hasher.update(uri.to_string());
        hasher.update(b"\n");
        hasher.update(accept.join(","));
        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A stored upstream response.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub content_length: u64,
}

impl CachedResponse {
    /// Only `200 OK` and `204 No Content` responses are worth replaying.
    pub fn is_storable(status: StatusCode) -> bool {
        matches!(status, StatusCode::OK | StatusCode::NO_CONTENT)
    }

    /// Build an entry from captured parts, dropping the `Date` header.
    pub fn capture(status: StatusCode, mut headers: HeaderMap, body: Bytes) -> Self {
        headers.remove(header::DATE);
        let content_length = headers
            .get(header::CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok())
            .unwrap_or(body.len() as u64);
        Self {
            status,
            headers,
            body,
            content_length,
        }
    }

    /// Replay the entry, marked as a cache hit.
    pub fn to_response(&self) -> Response<Body> {
        let mut response = Response::new(Body::from(self.body.clone()));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers.clone();
        response
            .headers_mut()
            .insert(X_CACHE, HeaderValue::from_static("HIT"));
        response
    }
}

/// TTL and LRU bounded response store. Clones share the same table.
#[derive(Clone)]
pub struct ResponseCache {
    entries: Cache<CacheKey, Arc<CachedResponse>>,
    max_entry_bytes: usize,
}

impl ResponseCache {
    pub fn new(ttl: Duration, capacity: u64, max_entry_bytes: usize) -> Self {
        Self {
            entries: Cache::builder()
                .max_capacity(capacity)
                .time_to_live(ttl)
                .eviction_policy(EvictionPolicy::lru())
                .build(),
            max_entry_bytes,
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<Arc<CachedResponse>> {
        self.entries.get(key)
    }

    pub fn insert(&self, key: CacheKey, response: CachedResponse) {
        if response.body.len() > self.max_entry_bytes {
            tracing::debug!(%key, size = response.body.len(), "response too large to cache");
            return;
        }
        tracing::debug!(%key, status = %response.status, "caching response");
        self.entries.insert(key, Arc::new(response));
    }

    pub fn max_entry_bytes(&self) -> usize {
        self.max_entry_bytes
    }

    pub fn entry_count(&self) -> u64 {
        self.entries.run_pending_tasks();
        self.entries.entry_count()
    }
}
