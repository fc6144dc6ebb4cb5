//! Feature Cache
//!
//! Bounded LRU cache of user profiles and item feature vectors in front of the
//! attribute store. Entries expire after their TTL regardless of access, "not
//! found" answers are cached for a shorter TTL, and concurrent misses on one
//! key share a single upstream fetch.

mod source;

pub use source::{AttributeSource, CatalogDocument, CatalogSnapshot, InteractionSource};

use crate::config::CacheConfig;
use crate::metrics;
use crate::models::FeatureVector;
use moka::future::Cache;
use moka::policy::EvictionPolicy;
use moka::Expiry;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FeatureKey {
    /// Preference profile of a user.
    User(String),
    /// Content features of an item.
    Item(String),
}

impl fmt::Display for FeatureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeatureKey::User(id) => write!(f, "user:{}", id),
            FeatureKey::Item(id) => write!(f, "item:{}", id),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum FeatureError {
    #[error("attribute store error for {key}: {message}")]
    Upstream { key: String, message: String },

    #[error("attribute fetch for {key} exceeded {timeout_ms}ms")]
    Timeout { key: String, timeout_ms: u64 },

    #[error("cache fetch failure for {key}: {message}")]
    CacheFetchFailure { key: String, message: String },

    #[error("catalog {path}: {message}")]
    Catalog { path: String, message: String },
}

impl FeatureError {
    pub fn upstream(key: &FeatureKey, err: impl fmt::Display) -> Self {
        FeatureError::Upstream {
            key: key.to_string(),
            message: err.to_string(),
        }
    }

    fn catalog(path: &Path, err: impl fmt::Display) -> Self {
        FeatureError::Catalog {
            path: path.display().to_string(),
            message: err.to_string(),
        }
    }
}

/// What the cache knows about a key without going upstream.
#[derive(Debug, Clone)]
pub enum CacheLookup {
    Hit(FeatureVector),
    /// The attribute store recently answered "not found".
    NegativeHit,
    Miss,
}

#[derive(Debug, Clone)]
struct CachedFeature {
    vector: Option<FeatureVector>,
    ttl: Duration,
}

struct FeatureExpiry;

impl Expiry<FeatureKey, CachedFeature> for FeatureExpiry {
    fn expire_after_create(
        &self,
        _key: &FeatureKey,
        value: &CachedFeature,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &FeatureKey,
        value: &CachedFeature,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

pub struct FeatureCache {
    cache: Cache<FeatureKey, CachedFeature>,
    source: Arc<dyn AttributeSource>,
    ttl: Duration,
    negative_ttl: Duration,
    fetch_timeout: Duration,
    upstream_fetches: AtomicU64,
}

impl FeatureCache {
    pub fn new(config: &CacheConfig, source: Arc<dyn AttributeSource>) -> Self {
        let cache = Cache::builder()
            .name("feature-cache")
            .max_capacity(config.capacity)
            .eviction_policy(EvictionPolicy::lru())
            .expire_after(FeatureExpiry)
            .build();

        Self {
            cache,
            source,
            ttl: config.ttl(),
            negative_ttl: config.negative_ttl(),
            fetch_timeout: config.fetch_timeout(),
            upstream_fetches: AtomicU64::new(0),
        }
    }

    pub async fn get(&self, key: &FeatureKey) -> CacheLookup {
        let lookup = match self.cache.get(key).await {
            Some(CachedFeature {
                vector: Some(vector),
                ..
            }) => CacheLookup::Hit(vector),
            Some(CachedFeature { vector: None, .. }) => CacheLookup::NegativeHit,
            None => CacheLookup::Miss,
        };

        metrics::record_cache_lookup(match lookup {
            CacheLookup::Hit(_) => "hit",
            CacheLookup::NegativeHit => "negative_hit",
            CacheLookup::Miss => "miss",
        });

        lookup
    }

    /// Insert or replace an entry. `None` caches a "not found" answer.
    pub async fn put(&self, key: FeatureKey, value: Option<FeatureVector>, ttl: Duration) {
        self.cache
            .insert(key, CachedFeature { vector: value, ttl })
            .await;
    }

    /// Cached value for `key`, fetching it from the attribute store on a miss.
    ///
    /// Concurrent misses on the same key wait for one shared fetch. If that
    /// fetch fails, the waiters retry once through a second shared fetch, so a
    /// burst of misses costs at most two upstream calls. The cache stays empty
    /// for the key unless one of them succeeds.
    pub async fn get_or_fetch(
        &self,
        key: &FeatureKey,
    ) -> Result<Option<FeatureVector>, FeatureError> {
        let entry = self
            .cache
            .entry_by_ref(key)
            .or_try_insert_with(self.fetch_upstream(key))
            .await;

        match entry {
            Ok(entry) => {
                metrics::record_cache_lookup(if entry.is_fresh() { "miss" } else { "hit" });
                Ok(entry.into_value().vector)
            }
            Err(err) => {
                metrics::record_cache_lookup("fetch_failure");
                warn!(key = %key, error = %err, "Shared feature fetch failed, retrying once");

                let retry = self
                    .cache
                    .entry_by_ref(key)
                    .or_try_insert_with(self.fetch_upstream(key))
                    .await
                    .map_err(|retry| FeatureError::CacheFetchFailure {
                        key: key.to_string(),
                        message: retry.to_string(),
                    })?;

                Ok(retry.into_value().vector)
            }
        }
    }

    async fn fetch_upstream(&self, key: &FeatureKey) -> Result<CachedFeature, FeatureError> {
        self.upstream_fetches.fetch_add(1, Ordering::Relaxed);

        let result = tokio::time::timeout(self.fetch_timeout, self.source.fetch(key)).await;

        match result {
            Ok(Ok(Some(vector))) => {
                metrics::record_upstream_fetch("found");
                Ok(CachedFeature {
                    vector: Some(vector),
                    ttl: self.ttl,
                })
            }
            Ok(Ok(None)) => {
                metrics::record_upstream_fetch("not_found");
                debug!(key = %key, "Attribute store has no record, caching negative entry");
                Ok(CachedFeature {
                    vector: None,
                    ttl: self.negative_ttl,
                })
            }
            Ok(Err(e)) => {
                metrics::record_upstream_fetch("error");
                Err(e)
            }
            Err(_) => {
                metrics::record_upstream_fetch("timeout");
                Err(FeatureError::Timeout {
                    key: key.to_string(),
                    timeout_ms: self.fetch_timeout.as_millis() as u64,
                })
            }
        }
    }

    pub async fn invalidate(&self, key: &FeatureKey) {
        self.cache.invalidate(key).await;
    }

    /// Live entries after pending evictions and expirations are applied.
    pub async fn entry_count(&self) -> u64 {
        self.cache.run_pending_tasks().await;
        self.cache.entry_count()
    }

    /// Upstream fetches issued so far, direct escalations included.
    pub fn upstream_fetches(&self) -> u64 {
        self.upstream_fetches.load(Ordering::Relaxed)
    }

    /// Periodic expiry and eviction housekeeping. Send on (or drop) the
    /// returned sender to stop it.
    pub fn spawn_maintenance(
        self: &Arc<Self>,
        interval: Duration,
    ) -> (watch::Sender<()>, JoinHandle<()>) {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(());
        let cache = Arc::clone(self);

        let handle = tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "Starting feature cache maintenance");

            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        cache.cache.run_pending_tasks().await;
                        debug!(entries = cache.cache.entry_count(), "Feature cache maintenance completed");
                    }
                    _ = shutdown_rx.changed() => {
                        info!("Feature cache maintenance stopped");
                        break;
                    }
                }
            }
        });

        (shutdown_tx, handle)
    }
}
