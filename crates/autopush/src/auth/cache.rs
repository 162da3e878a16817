//! Shared cache of exchanged provider tokens.

use std::time::{Duration, Instant};

use chrono::Utc;
use moka::sync::Cache;
use moka::Expiry;

use super::AccessToken;
use crate::resource::{GitProvider, ObjectKey};

/// Builds the cache key `provider/namespace/name/fingerprint`.
pub fn cache_key(provider: GitProvider, target: &ObjectKey, fingerprint: &str) -> String {
    format!(
        "{}/{}/{}/{}",
        provider, target.namespace, target.name, fingerprint
    )
}

/// Entries live for 80% of the token's remaining lifetime.
struct TokenExpiry;

impl Expiry<String, AccessToken> for TokenExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &AccessToken,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(cache_ttl(value))
    }
}

fn cache_ttl(token: &AccessToken) -> Duration {
    let remaining = (token.expires_at - Utc::now())
        .to_std()
        .unwrap_or(Duration::ZERO);
    remaining.mul_f64(0.8)
}

/// Concurrent token cache keyed by target identity.
///
/// Cloning is cheap and clones share the same entries.
#[derive(Clone)]
pub struct TokenCache {
    inner: Cache<String, AccessToken>,
}

impl TokenCache {
    /// Creates a cache holding at most `max_entries` tokens.
    pub fn new(max_entries: u64) -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(max_entries)
                .expire_after(TokenExpiry)
                .build(),
        }
    }

    /// Returns a live token for the key.
    pub fn get(&self, key: &str) -> Option<AccessToken> {
        self.inner.get(key)
    }

    /// Stores a token; tokens that are already expired are not cached.
    pub fn insert(&self, key: String, token: AccessToken) {
        if cache_ttl(&token).is_zero() {
            return;
        }
        self.inner.insert(key, token);
    }

    /// Drops every entry.
    pub fn clear(&self) {
        self.inner.invalidate_all();
    }
}

impl std::fmt::Debug for TokenCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCache")
            .field("entries", &self.inner.entry_count())
            .finish()
    }
}
