// SPDX-License-Identifier: MIT OR Apache-2.0
//! Optional bounded replay cache (§9 open question, decided in
//! `SPEC_FULL.md`: disabled by default, timestamp freshness alone is the
//! v1 default per §7).

use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;

/// Bounded LRU of recently seen `(source, nonce)` pairs.
///
/// A `capacity` of `0` disables the cache: [`NonceCache::seen`] always
/// returns `false` and nothing is stored, matching the default
/// timestamp-only replay protection described in §7.
pub struct NonceCache {
    inner: Option<Mutex<LruCache<(String, String), ()>>>,
}

impl NonceCache {
    /// Build a cache holding up to `capacity` `(source, nonce)` pairs.
    /// `capacity == 0` disables the cache entirely.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let inner = NonZeroUsize::new(capacity).map(|n| Mutex::new(LruCache::new(n)));
        Self { inner }
    }

    /// Record `(source, nonce)` and return whether it had already been
    /// seen. When the cache is disabled, always returns `false`.
    pub fn seen_or_record(&self, source: &str, nonce: &str) -> bool {
        let Some(cache) = &self.inner else {
            return false;
        };
        let mut guard = cache.lock().expect("nonce cache mutex poisoned");
        let key = (source.to_string(), nonce.to_string());
        if guard.contains(&key) {
            true
        } else {
            guard.put(key, ());
            false
        }
    }

    /// Whether this cache is active (`capacity > 0`).
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }
}
