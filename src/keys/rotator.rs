//! Signing key rotation.
//!
//! One [`SigningKeyRotator`] per tenant keeps a usable private key available
//! to token minting:
//!
//! 1. Ask key storage for private keys that do not expire within the graceful
//!    rotation window. If one exists and is newer than the held key, push it
//!    to subscribers.
//! 2. If none exists, generate one. Generation is gated by a freshness check
//!    (our view of the key sequence must be the latest) and by a per-tenant
//!    distributed lock, so one instance in the fleet generates. Losing the
//!    lock means another instance is already generating, which is not an
//!    error.
//! 3. Sleep. Short after an error or when no key was found, otherwise until
//!    shortly before the key enters its graceful window, capped by the
//!    maximum check interval.
//!
//! The held key lives in a `watch` channel: readers clone it without blocking
//! the writer, and pushes only ever move to a strictly higher sequence.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use jsonwebtoken::Algorithm;
use tokio::sync::{Mutex, broadcast, watch};
use tracing::{debug, info, warn};

use super::SigningKey;
use crate::audit::{self, AuditEvent};
use crate::storage::{DistributedLock, KeyStorage};
use crate::{Error, Result};

/// Rotation timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationSettings {
    /// Algorithm of generated keys
    pub algorithm: Algorithm,
    /// Keys expiring within this window are no longer used for signing
    pub graceful_window: Duration,
    /// Regular check interval, also the short retry interval
    pub check_interval: Duration,
    /// Upper bound of the interval between checks
    pub max_check_interval: Duration,
    /// How long the generation lock is held (and waited for)
    pub lock_duration: Duration,
}

impl Default for RotationSettings {
    fn default() -> Self {
        let check_interval = Duration::from_secs(10);
        Self {
            algorithm: Algorithm::ES256,
            graceful_window: Duration::from_secs(600),
            check_interval,
            max_check_interval: Duration::from_secs(300),
            lock_duration: check_interval * 2,
        }
    }
}

/// Result of a generation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationOutcome {
    /// This instance generated a key
    Generated,
    /// Another instance holds the lock or already generated a newer key
    InProgressElsewhere,
}

/// Keeps the current signing key of one tenant.
pub struct SigningKeyRotator {
    tenant: String,
    owner: String,
    storage: Arc<dyn KeyStorage>,
    lock: Arc<dyn DistributedLock>,
    settings: RotationSettings,
    current: watch::Sender<Option<SigningKey>>,
    observed_sequence: AtomicU64,
    // Serializes generation attempts of this instance; the distributed lock
    // is re-entrant for its owner.
    generating: Mutex<()>,
}

impl SigningKeyRotator {
    /// New rotator with no key held yet.
    #[must_use]
    pub fn new(
        tenant: impl Into<String>,
        storage: Arc<dyn KeyStorage>,
        lock: Arc<dyn DistributedLock>,
        settings: RotationSettings,
    ) -> Self {
        let (current, _) = watch::channel(None);
        Self {
            tenant: tenant.into(),
            owner: uuid::Uuid::new_v4().to_string(),
            storage,
            lock,
            settings,
            current,
            observed_sequence: AtomicU64::new(0),
            generating: Mutex::new(()),
        }
    }

    /// Tenant this rotator serves.
    #[must_use]
    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    /// Currently held key.
    #[must_use]
    pub fn current(&self) -> Option<SigningKey> {
        self.current.borrow().clone()
    }

    /// Receive every key push.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Option<SigningKey>> {
        self.current.subscribe()
    }

    /// Held key, if it is still outside the graceful window.
    #[must_use]
    pub fn usable_key(&self) -> Option<SigningKey> {
        let cutoff = Utc::now() + chrono_duration(self.settings.graceful_window);
        self.current().filter(|k| k.expiry > cutoff)
    }

    /// Push `key` unless it is not newer than the held one.
    fn push(&self, key: SigningKey) -> bool {
        let key_id = key.id.clone();
        let sequence = key.sequence;
        let pushed = self.current.send_if_modified(|held| match held {
            Some(h) if h.sequence >= key.sequence => false,
            _ => {
                *held = Some(key);
                true
            }
        });
        if pushed {
            info!(tenant = %self.tenant, key_id = %key_id, sequence, "Signing key activated");
            audit::emit(&AuditEvent::key_rotated(&self.tenant, &key_id));
        }
        pushed
    }

    /// Load the newest usable key from storage and push it. Returns its
    /// expiry, or `None` when storage has no usable key.
    pub async fn refresh(&self) -> Result<Option<DateTime<Utc>>> {
        let active = self
            .storage
            .active_private_signing_keys(&self.tenant, self.settings.graceful_window)
            .await?;
        self.observed_sequence
            .fetch_max(active.sequence, Ordering::SeqCst);
        let Some(newest) = active.keys.iter().max_by_key(|k| k.sequence) else {
            return Ok(None);
        };
        let expiry = newest.expiry;
        let is_held = self
            .current
            .borrow()
            .as_ref()
            .is_some_and(|h| h.id == newest.id);
        if !is_held {
            self.push(newest.signing_key()?);
        }
        Ok(Some(expiry))
    }

    /// Generate a key if this instance's view is current and it wins the
    /// tenant lock.
    pub async fn lock_and_generate(&self) -> Result<GenerationOutcome> {
        let _guard = self.generating.lock().await;
        let latest = self.storage.latest_key_sequence(&self.tenant).await?;
        if latest > self.observed_sequence.load(Ordering::SeqCst) {
            debug!(tenant = %self.tenant, latest, "Newer key sequence exists, skipping generation");
            return Ok(GenerationOutcome::InProgressElsewhere);
        }

        let duration = self.settings.lock_duration;
        let acquired = tokio::time::timeout(
            duration,
            self.lock.lock(&self.tenant, &self.owner, duration),
        )
        .await
        .map_err(|_| Error::internal(format!("lock for tenant {} timed out", self.tenant)))??;
        if !acquired {
            debug!(tenant = %self.tenant, "Key generation already in progress elsewhere");
            return Ok(GenerationOutcome::InProgressElsewhere);
        }

        self.storage
            .generate_signing_key_pair(&self.tenant, self.settings.algorithm)
            .await?;
        info!(tenant = %self.tenant, "Signing key generated");
        audit::emit(&AuditEvent::key_generated(&self.tenant));
        Ok(GenerationOutcome::Generated)
    }

    /// Run one rotation pass and return the delay until the next one.
    pub async fn check(&self) -> Duration {
        match self.refresh().await {
            Ok(Some(expiry)) => return self.next_interval(Some(expiry)),
            Ok(None) => {}
            Err(e) => {
                warn!(tenant = %self.tenant, error = %e, "Failed to load signing keys");
                return self.next_interval(None);
            }
        }
        match self.lock_and_generate().await {
            Ok(GenerationOutcome::Generated) => match self.refresh().await {
                Ok(Some(expiry)) => self.next_interval(Some(expiry)),
                Ok(None) => self.next_interval(None),
                Err(e) => {
                    warn!(tenant = %self.tenant, error = %e, "Failed to load generated key");
                    self.next_interval(None)
                }
            },
            Ok(GenerationOutcome::InProgressElsewhere) => self.next_interval(None),
            Err(e) => {
                warn!(tenant = %self.tenant, error = %e, "Signing key generation failed");
                self.next_interval(None)
            }
        }
    }

    /// Delay until the next check. `None` (no key or an error) yields the
    /// short interval.
    #[must_use]
    pub fn next_interval(&self, expiry: Option<DateTime<Utc>>) -> Duration {
        let short = self.settings.check_interval;
        let Some(expiry) = expiry else {
            return short;
        };
        let remaining = (expiry - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        remaining
            .saturating_sub(self.settings.graceful_window)
            .saturating_sub(self.settings.check_interval)
            .min(self.settings.max_check_interval)
            .max(short)
    }

    /// Spawn the rotation loop. Stops on `shutdown`.
    pub fn spawn(
        self: Arc<Self>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let delay = self.check().await;
                debug!(tenant = %self.tenant, delay = ?delay, "Next signing key check");
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    _ = shutdown.recv() => {
                        debug!(tenant = %self.tenant, "Signing key rotator shutting down");
                        break;
                    }
                }
            }
        })
    }
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

/// Rotators for every tenant seen so far.
pub struct SignerRegistry {
    storage: Arc<dyn KeyStorage>,
    lock: Arc<dyn DistributedLock>,
    settings: RotationSettings,
    rotators: DashMap<String, Arc<SigningKeyRotator>>,
    shutdown: Option<broadcast::Sender<()>>,
}

impl SignerRegistry {
    /// Registry without background loops; keys are resolved on demand.
    #[must_use]
    pub fn new(
        storage: Arc<dyn KeyStorage>,
        lock: Arc<dyn DistributedLock>,
        settings: RotationSettings,
    ) -> Self {
        Self {
            storage,
            lock,
            settings,
            rotators: DashMap::new(),
            shutdown: None,
        }
    }

    /// Start a rotation loop for every tenant on first use.
    #[must_use]
    pub fn with_background(mut self, shutdown: broadcast::Sender<()>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Rotator of `tenant`, created on first use.
    pub fn rotator(&self, tenant: &str) -> Arc<SigningKeyRotator> {
        if let Some(r) = self.rotators.get(tenant) {
            return Arc::clone(&r);
        }
        let entry = self.rotators.entry(tenant.to_string()).or_insert_with(|| {
            let rotator = Arc::new(SigningKeyRotator::new(
                tenant,
                Arc::clone(&self.storage),
                Arc::clone(&self.lock),
                self.settings,
            ));
            if let Some(tx) = &self.shutdown {
                Arc::clone(&rotator).spawn(tx.subscribe());
            }
            rotator
        });
        Arc::clone(&entry)
    }

    /// Current signing key of `tenant`. Runs rotation passes inline when the
    /// held key is missing or inside its graceful window.
    pub async fn signer(&self, tenant: &str) -> Result<SigningKey> {
        let rotator = self.rotator(tenant);
        for _ in 0..2 {
            if let Some(key) = rotator.usable_key() {
                return Ok(key);
            }
            rotator.check().await;
        }
        rotator
            .usable_key()
            .ok_or_else(|| Error::internal(format!("no signing key available for tenant {tenant}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{InMemoryLock, InMemoryStore};

    fn rotator(store: &Arc<InMemoryStore>, lock: &Arc<InMemoryLock>) -> SigningKeyRotator {
        SigningKeyRotator::new("t1", store.clone(), lock.clone(), RotationSettings::default())
    }

    #[tokio::test]
    async fn generates_when_no_key_exists() {
        // GIVEN: empty key storage
        let store = Arc::new(InMemoryStore::default());
        let lock = Arc::new(InMemoryLock::new());
        let r = rotator(&store, &lock);

        // WHEN: a rotation pass runs
        let next = r.check().await;

        // THEN: a key was generated and pushed
        assert_eq!(store.generated_key_count(), 1);
        let key = r.current().expect("key pushed");
        assert_eq!(key.sequence, 1);
        assert!(next >= RotationSettings::default().check_interval);
    }

    #[tokio::test]
    async fn existing_key_is_pushed_without_generation() {
        let store = Arc::new(InMemoryStore::default());
        store
            .insert_key_pair("t1", Utc::now() + chrono::Duration::hours(6))
            .unwrap();
        let lock = Arc::new(InMemoryLock::new());
        let r = rotator(&store, &lock);

        let next = r.check().await;

        assert_eq!(store.generated_key_count(), 0);
        assert!(r.current().is_some());
        assert_eq!(next, RotationSettings::default().max_check_interval);
    }

    #[tokio::test]
    async fn key_inside_graceful_window_triggers_generation() {
        // GIVEN: the only key expires within the graceful window
        let store = Arc::new(InMemoryStore::default());
        store
            .insert_key_pair("t1", Utc::now() + chrono::Duration::minutes(5))
            .unwrap();
        let lock = Arc::new(InMemoryLock::new());
        let r = rotator(&store, &lock);

        // WHEN: checking
        r.check().await;

        // THEN: a replacement was generated and is held
        assert_eq!(store.generated_key_count(), 1);
        assert_eq!(r.current().unwrap().sequence, 2);
    }

    #[tokio::test]
    async fn held_lock_means_in_progress_elsewhere() {
        let store = Arc::new(InMemoryStore::default());
        let lock = Arc::new(InMemoryLock::new());
        lock.lock("t1", "other-instance", Duration::from_secs(60))
            .await
            .unwrap();
        let r = rotator(&store, &lock);

        let outcome = r.lock_and_generate().await.unwrap();

        assert_eq!(outcome, GenerationOutcome::InProgressElsewhere);
        assert_eq!(store.generated_key_count(), 0);
        assert_eq!(r.check().await, RotationSettings::default().check_interval);
    }

    #[tokio::test]
    async fn pushes_only_increase_sequence() {
        let store = Arc::new(InMemoryStore::default());
        store
            .insert_key_pair("t1", Utc::now() + chrono::Duration::hours(6))
            .unwrap();
        store
            .insert_key_pair("t1", Utc::now() + chrono::Duration::hours(6))
            .unwrap();
        let lock = Arc::new(InMemoryLock::new());
        let r = rotator(&store, &lock);
        let mut rx = r.subscribe();

        r.refresh().await.unwrap();
        let keys = store
            .active_private_signing_keys("t1", Duration::ZERO)
            .await
            .unwrap();
        let older = keys.keys[0].signing_key().unwrap();

        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().as_ref().unwrap().sequence, 2);
        assert!(!r.push(older));
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn registry_resolves_signer_on_demand() {
        let store = Arc::new(InMemoryStore::default());
        let registry = SignerRegistry::new(
            store.clone(),
            Arc::new(InMemoryLock::new()),
            RotationSettings::default(),
        );
        let first = registry.signer("t1").await.unwrap();
        let second = registry.signer("t1").await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(store.generated_key_count(), 1);
    }
}
