//! Two-tier response cache.
//!
//! # Design
//! `PersistentCache` is the source of truth; `MemoryCache` holds a bounded
//! subset of it. Writers store to disk first and only then to memory, so a
//! memory hit always matches what the disk would have returned. Both tiers
//! hold the same `CacheEntry` shape, including the time it was stored, and
//! both drop an entry once it is older than the disk tier's maximum age.

mod memory;
mod persistent;

pub use memory::MemoryCache;
pub use persistent::PersistentCache;

use chrono::{DateTime, Duration, Utc};

use crate::cache_headers::{self, Validator};
use crate::http;
use crate::key::RequestKey;
use crate::observer::{Response, ResponseSource};

/// One cached response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: RequestKey,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub validator: Option<Validator>,
    pub expires_at: DateTime<Utc>,
    /// Set once the entry has been observed past its expiry.
    pub stale: bool,
    /// When the entry was written. Bounds its life in both tiers
    /// independently of HTTP expiry.
    pub stored_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(
        key: RequestKey,
        status: u16,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        let validator = cache_headers::validator(&headers);
        Self {
            key,
            status,
            headers,
            body,
            validator,
            expires_at,
            stale: false,
            stored_at: Utc::now(),
        }
    }

    /// Whether the entry has outlived `max_age` since it was stored.
    pub fn is_over_age(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.stored_at) > max_age
    }

    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        !self.stale && now < self.expires_at
    }

    /// Stale but revalidatable with a conditional request.
    pub fn is_revalidatable(&self, now: DateTime<Utc>) -> bool {
        !self.is_fresh(now) && self.validator.is_some()
    }

    /// The entry after a `304 Not Modified`: headers merged, new expiry,
    /// same body.
    pub fn refreshed(&self, headers: &[(String, String)], expires_at: DateTime<Utc>) -> Self {
        let mut merged = self.headers.clone();
        http::merge_headers(&mut merged, headers);
        let validator = cache_headers::validator(&merged);
        Self {
            key: self.key.clone(),
            status: self.status,
            headers: merged,
            body: self.body.clone(),
            validator,
            expires_at,
            stale: false,
            stored_at: Utc::now(),
        }
    }

    pub fn to_response(&self, source: ResponseSource) -> Response {
        Response {
            status: self.status,
            headers: self.headers.clone(),
            body: self.body.clone(),
            source,
            file: None,
        }
    }
}
