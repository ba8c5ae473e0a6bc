//! Public key cache.
//!
//! `tenant → key id → CachedKey`, backed by [`KeyStorage`] on miss. Every hit
//! refreshes the entry's last-access time; [`spawn_purge`] periodically drops
//! entries idle for longer than the configured TTL, and tenant buckets once
//! they are empty.
//!
//! Reads go through `DashMap` shard read locks and an atomic timestamp, so the
//! verification hot path never takes an exclusive lock. Storage errors are
//! returned to the caller and nothing is cached for them.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

use super::PublicKey;
use crate::Result;
use crate::storage::KeyStorage;

/// A cache entry.
#[derive(Debug)]
pub struct CachedKey {
    key: Arc<PublicKey>,
    /// Nanoseconds since the cache's epoch
    last_access: AtomicU64,
}

impl CachedKey {
    /// The cached public key.
    #[must_use]
    pub fn key(&self) -> &Arc<PublicKey> {
        &self.key
    }
}

/// Per-tenant verification key cache.
pub struct PublicKeyCache {
    storage: Arc<dyn KeyStorage>,
    idle_ttl: Duration,
    epoch: Instant,
    buckets: DashMap<String, DashMap<String, CachedKey>>,
}

impl PublicKeyCache {
    /// New cache evicting entries idle for longer than `idle_ttl`.
    #[must_use]
    pub fn new(storage: Arc<dyn KeyStorage>, idle_ttl: Duration) -> Self {
        Self {
            storage,
            idle_ttl,
            epoch: Instant::now(),
            buckets: DashMap::new(),
        }
    }

    fn ticks(&self, at: Instant) -> u64 {
        u64::try_from(at.saturating_duration_since(self.epoch).as_nanos()).unwrap_or(u64::MAX)
    }

    /// Get a key, loading it from storage on miss.
    pub async fn get_key(&self, tenant: &str, key_id: &str) -> Result<Arc<PublicKey>> {
        self.get_key_at(tenant, key_id, Instant::now()).await
    }

    /// [`get_key`](Self::get_key) with an explicit access time.
    pub async fn get_key_at(
        &self,
        tenant: &str,
        key_id: &str,
        now: Instant,
    ) -> Result<Arc<PublicKey>> {
        let ticks = self.ticks(now);
        if let Some(bucket) = self.buckets.get(tenant) {
            if let Some(entry) = bucket.get(key_id) {
                entry.last_access.fetch_max(ticks, Ordering::Relaxed);
                return Ok(Arc::clone(&entry.key));
            }
        }

        let key = Arc::new(self.storage.public_key_by_id(tenant, key_id).await?);
        debug!(tenant, key_id, "Public key cached");
        self.buckets
            .entry(tenant.to_string())
            .or_default()
            .insert(
                key_id.to_string(),
                CachedKey {
                    key: Arc::clone(&key),
                    last_access: AtomicU64::new(ticks),
                },
            );
        Ok(key)
    }

    /// Whether `key_id` is currently cached for `tenant`.
    #[must_use]
    pub fn contains(&self, tenant: &str, key_id: &str) -> bool {
        self.buckets
            .get(tenant)
            .is_some_and(|b| b.contains_key(key_id))
    }

    /// Number of tenant buckets.
    #[must_use]
    pub fn tenant_count(&self) -> usize {
        self.buckets.len()
    }

    /// Evict idle entries. Returns the number of keys removed.
    pub fn purge_idle(&self) -> usize {
        self.purge_idle_at(Instant::now())
    }

    /// [`purge_idle`](Self::purge_idle) with an explicit clock.
    pub fn purge_idle_at(&self, now: Instant) -> usize {
        let Some(cutoff) = now.checked_sub(self.idle_ttl) else {
            return 0;
        };
        let cutoff = self.ticks(cutoff);
        let mut removed = 0;
        self.buckets.retain(|_, bucket| {
            let before = bucket.len();
            bucket.retain(|_, entry| entry.last_access.load(Ordering::Relaxed) > cutoff);
            removed += before - bucket.len();
            !bucket.is_empty()
        });
        removed
    }
}

/// Spawn the periodic purge task. Stops on `shutdown`.
pub fn spawn_purge(
    cache: Arc<PublicKeyCache>,
    interval: Duration,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let purged = cache.purge_idle();
                    if purged > 0 {
                        debug!(count = purged, "Purged idle public keys");
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Public key cache purge shutting down");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use crate::storage::{InMemoryStore, PrivateKeys};
    use chrono::{DateTime, Utc};
    use jsonwebtoken::Algorithm;

    struct FailingStorage;

    #[async_trait::async_trait]
    impl KeyStorage for FailingStorage {
        async fn active_private_signing_keys(&self, _: &str, _: Duration) -> Result<PrivateKeys> {
            Err(Error::internal("down"))
        }
        async fn latest_key_sequence(&self, _: &str) -> Result<u64> {
            Err(Error::internal("down"))
        }
        async fn active_public_keys(&self, _: &str, _: DateTime<Utc>) -> Result<Vec<PublicKey>> {
            Err(Error::internal("down"))
        }
        async fn public_key_by_id(&self, _: &str, _: &str) -> Result<PublicKey> {
            Err(Error::internal("down"))
        }
        async fn generate_signing_key_pair(&self, _: &str, _: Algorithm) -> Result<()> {
            Err(Error::internal("down"))
        }
    }

    fn store_with_key(tenant: &str) -> (Arc<InMemoryStore>, String) {
        let store = Arc::new(InMemoryStore::default());
        let kid = store
            .insert_key_pair(tenant, Utc::now() + chrono::Duration::hours(1))
            .unwrap();
        (store, kid)
    }

    #[tokio::test]
    async fn hit_does_not_reach_storage() {
        // GIVEN: a cache over a store with one key
        let (store, kid) = store_with_key("t1");
        let cache = PublicKeyCache::new(store.clone(), Duration::from_secs(60));

        // WHEN: the key is fetched twice
        cache.get_key("t1", &kid).await.unwrap();
        let key = cache.get_key("t1", &kid).await.unwrap();

        // THEN: storage was queried once
        assert_eq!(key.id, kid);
        assert_eq!(store.public_key_lookup_count(), 1);
    }

    #[tokio::test]
    async fn storage_errors_are_not_cached() {
        let cache = PublicKeyCache::new(Arc::new(FailingStorage), Duration::from_secs(60));
        assert!(cache.get_key("t1", "k1").await.is_err());
        assert!(!cache.contains("t1", "k1"));
        assert_eq!(cache.tenant_count(), 0);
    }

    #[tokio::test]
    async fn unknown_key_is_not_found() {
        let (store, _) = store_with_key("t1");
        let cache = PublicKeyCache::new(store, Duration::from_secs(60));
        let err = cache.get_key("t1", "missing").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn idle_entries_and_empty_buckets_are_purged() {
        // GIVEN: two keys fetched at t0
        let (store, idle) = store_with_key("t1");
        let busy = store
            .insert_key_pair("t1", Utc::now() + chrono::Duration::hours(1))
            .unwrap();
        let ttl = Duration::from_secs(10);
        let cache = PublicKeyCache::new(store, ttl);
        let t0 = Instant::now();
        cache.get_key_at("t1", &idle, t0).await.unwrap();
        cache.get_key_at("t1", &busy, t0).await.unwrap();

        // WHEN: one key is touched again before the TTL runs out
        cache
            .get_key_at("t1", &busy, t0 + Duration::from_secs(8))
            .await
            .unwrap();
        let removed = cache.purge_idle_at(t0 + ttl + Duration::from_secs(1));

        // THEN: only the idle key is evicted
        assert_eq!(removed, 1);
        assert!(!cache.contains("t1", &idle));
        assert!(cache.contains("t1", &busy));

        // AND: the bucket goes away once empty
        cache.purge_idle_at(t0 + Duration::from_secs(30));
        assert_eq!(cache.tenant_count(), 0);
    }
}
