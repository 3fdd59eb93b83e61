//! Adapter cache using [`moka`].
//!
//! Providers are cheap to call but not free to construct (HTTP client setup,
//! config validation), and hosts resolve the same model id on every request.
//! This cache replaces the process-wide service map the gateway grew out of:
//! it is an explicit object owned by whichever component constructs
//! adapters, with explicit invalidation exposed to the host for credential
//! rotation.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use moka::future::Cache;
use tracing::debug;

use crate::adapter::ProviderAdapter;
use crate::error::Result;

/// Default number of cached adapters.
const DEFAULT_CAPACITY: u64 = 64;

/// Default time-to-idle before an unused adapter is evicted.
const DEFAULT_TTI: Duration = Duration::from_secs(30 * 60);

// ── cache stats ──────────────────────────────────────────────────────

/// Counters tracking cache effectiveness.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheStats {
    /// Total cache hits since creation.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Total cache misses since creation.
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

// ── cache ────────────────────────────────────────────────────────────

/// Concurrent cache of constructed [`ProviderAdapter`] instances keyed by a
/// configuration fingerprint.
///
/// Adapters are stateless per call, so sharing one instance across requests
/// is safe; a changed configuration produces a different fingerprint and a
/// fresh adapter.
pub struct AdapterCache {
    cache: Cache<String, Arc<dyn ProviderAdapter>>,
    stats: Arc<CacheStats>,
}

impl AdapterCache {
    /// Create a cache with default capacity and idle eviction.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY, DEFAULT_TTI)
    }

    /// Create a cache with explicit capacity and time-to-idle.
    pub fn with_capacity(capacity: u64, tti: Duration) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(capacity)
                .time_to_idle(tti)
                .build(),
            stats: Arc::new(CacheStats::default()),
        }
    }

    /// Fetch the adapter for `key`, constructing it with `build` on a miss.
    ///
    /// A concurrent miss may build twice; the adapters are interchangeable
    /// and the extra instance is dropped by the insert.
    pub async fn get_or_build<F>(&self, key: &str, build: F) -> Result<Arc<dyn ProviderAdapter>>
    where
        F: FnOnce() -> Result<Arc<dyn ProviderAdapter>>,
    {
        if let Some(adapter) = self.cache.get(key).await {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(adapter);
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        debug!(key, "adapter cache miss, constructing");

        let adapter = build()?;
        self.cache.insert(key.to_owned(), adapter.clone()).await;
        Ok(adapter)
    }

    /// Drop one cached adapter (e.g. after rotating its credentials).
    pub async fn invalidate(&self, key: &str) {
        self.cache.invalidate(key).await;
    }

    /// Drop every cached adapter.
    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }

    /// Effectiveness counters.
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }
}

impl Default for AdapterCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Build a cache key from the parts of a provider configuration that select
/// an adapter.  The api key contributes only a hash, so the fingerprint is
/// safe to log.
pub fn config_fingerprint(kind: &str, base_url: &str, model: &str, api_key: &str) -> String {
    let mut hasher = DefaultHasher::new();
    api_key.hash(&mut hasher);
    format!("{kind}:{base_url}:{model}:{:016x}", hasher.finish())
}
