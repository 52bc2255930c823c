//! Per-app signing key store with lazy dynamic-key rotation.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use super::{DYNAMIC_KEY_PREFIX, Jwks, KeyError, STATIC_KEY_PREFIX, SigningKey, material};
use crate::clock::Clock;
use crate::config::SessionConfig;
use crate::lock::NamedLocks;
use crate::scope::AppScope;
use crate::store::KeyStore;

const SIGNING_KEYS_LOCK: &str = "signing-keys";

#[derive(Debug, Default)]
struct KeyCache {
    /// Newest first.
    dynamic: Vec<SigningKey>,
    static_key: Option<SigningKey>,
    loaded: bool,
}

/// Signing keys of one app.
///
/// Keys are cached in memory and reloaded from the [`KeyStore`] whenever a
/// decision depends on state another process may have changed. Creating a key
/// happens only while holding the app's `signing-keys` named lock.
pub struct SigningKeyStore {
    app: AppScope,
    store: Arc<dyn KeyStore>,
    locks: Arc<NamedLocks>,
    clock: Arc<dyn Clock>,
    update_interval_ms: i64,
    overlap_ms: i64,
    lifetime_ms: i64,
    cache: RwLock<KeyCache>,
}

impl SigningKeyStore {
    pub fn new(
        app: AppScope,
        store: Arc<dyn KeyStore>,
        locks: Arc<NamedLocks>,
        clock: Arc<dyn Clock>,
        config: &SessionConfig,
    ) -> Self {
        Self {
            app,
            store,
            locks,
            clock,
            update_interval_ms: config.dynamic_key_update_interval_ms,
            overlap_ms: config.effective_key_overlap_ms(),
            lifetime_ms: config.dynamic_key_lifetime_ms(),
            cache: RwLock::new(KeyCache::default()),
        }
    }

    pub fn app(&self) -> &AppScope {
        &self.app
    }

    /// Key to sign a new access token with.
    pub async fn key_for_signing(&self, prefer_static: bool) -> Result<SigningKey, KeyError> {
        if prefer_static {
            self.static_key().await
        } else {
            self.latest_dynamic_key().await
        }
    }

    /// The dynamic key currently in charge of signing, rotating first if due.
    pub async fn latest_dynamic_key(&self) -> Result<SigningKey, KeyError> {
        let now = self.clock.now_millis();
        {
            let cache = self.cache.read().await;
            if cache.loaded
                && !self.rotation_due(&cache.dynamic, now)
                && let Some(key) = self.pick_signing_key(&cache.dynamic, now)
            {
                return Ok(key);
            }
        }

        let _guard = self.locks.lock(&self.app.lock_name(SIGNING_KEYS_LOCK)).await;
        let now = self.clock.now_millis();
        let mut dynamic = self.load_dynamic(now).await?;
        if self.rotation_due(&dynamic, now) {
            let key = self.create_dynamic_key(now).await?;
            dynamic.insert(0, key);
        }
        let signing = self
            .pick_signing_key(&dynamic, now)
            .ok_or_else(|| KeyError::NotFound(format!("no dynamic signing key for {}", self.app)))?;

        let mut cache = self.cache.write().await;
        cache.dynamic = dynamic;
        cache.loaded = true;
        Ok(signing)
    }

    /// The app's static key, created on first use.
    pub async fn static_key(&self) -> Result<SigningKey, KeyError> {
        if let Some(key) = self.cache.read().await.static_key.clone() {
            return Ok(key);
        }

        let _guard = self.locks.lock(&self.app.lock_name(SIGNING_KEYS_LOCK)).await;
        let key = match self.store.static_key(&self.app).await? {
            Some(record) => material::from_record(&record, None, true)?,
            None => {
                let key_id = format!("{STATIC_KEY_PREFIX}{}", Uuid::new_v4());
                let (_, record) = material::generate_with_record(
                    key_id,
                    self.clock.now_millis(),
                    None,
                    true,
                )?;
                let stored = self.store.set_static_key_if_absent(&self.app, record).await?;
                info!(app = %self.app, kid = %stored.key_id, "created static signing key");
                material::from_record(&stored, None, true)?
            }
        };

        self.cache.write().await.static_key = Some(key.clone());
        Ok(key)
    }

    /// Look a key up by id, reloading once from storage on a miss.
    pub async fn key_for_verification(&self, key_id: &str) -> Result<SigningKey, KeyError> {
        let now = self.clock.now_millis();
        if let Some(key) = self.cached_key(key_id, now).await {
            return Ok(key);
        }

        if key_id.starts_with(STATIC_KEY_PREFIX) {
            let key = self.static_key().await?;
            return if key.key_id == key_id {
                Ok(key)
            } else {
                Err(KeyError::NotFound(key_id.to_string()))
            };
        }
        if !key_id.starts_with(DYNAMIC_KEY_PREFIX) {
            return Err(KeyError::NotFound(key_id.to_string()));
        }

        debug!(app = %self.app, kid = key_id, "verification key not cached, reloading");
        self.reload_dynamic().await?;
        self.cached_key(key_id, now)
            .await
            .ok_or_else(|| KeyError::NotFound(key_id.to_string()))
    }

    /// Unexpired dynamic keys, newest first. Loads from storage on first use.
    pub async fn dynamic_keys(&self) -> Result<Vec<SigningKey>, KeyError> {
        {
            let cache = self.cache.read().await;
            if cache.loaded {
                let now = self.clock.now_millis();
                return Ok(unexpired(&cache.dynamic, now));
            }
        }
        self.reload_dynamic().await
    }

    /// Re-read the dynamic keys from storage, replacing the cache.
    pub async fn reload_dynamic(&self) -> Result<Vec<SigningKey>, KeyError> {
        let now = self.clock.now_millis();
        let dynamic = self.load_dynamic(now).await?;
        let mut cache = self.cache.write().await;
        cache.dynamic = dynamic.clone();
        cache.loaded = true;
        Ok(dynamic)
    }

    /// Every key a verifier may need, newest first: the unexpired dynamic
    /// keys (rotating first if due) plus the static key if one exists.
    pub async fn all_keys(&self) -> Result<Vec<SigningKey>, KeyError> {
        self.latest_dynamic_key().await?;
        let mut keys = self.dynamic_keys().await?;

        let cached = self.cache.read().await.static_key.clone();
        let static_key = match cached {
            Some(key) => Some(key),
            None => match self.store.static_key(&self.app).await? {
                Some(record) => Some(material::from_record(&record, None, true)?),
                None => None,
            },
        };
        if let Some(key) = static_key {
            keys.push(key);
        }
        keys.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(keys)
    }

    pub async fn jwks(&self) -> Result<Jwks, KeyError> {
        Ok(Jwks {
            keys: self.all_keys().await?.iter().map(SigningKey::to_jwk).collect(),
        })
    }

    /// When the current signing key stops being handed out for signing.
    pub async fn signing_key_expiry_time(&self) -> Result<i64, KeyError> {
        let key = self.latest_dynamic_key().await?;
        Ok(key.created_at + self.update_interval_ms)
    }

    /// Drop dynamic keys too old to verify anything. Returns how many were removed.
    pub async fn cleanup_expired(&self) -> Result<u64, KeyError> {
        let _guard = self.locks.lock(&self.app.lock_name(SIGNING_KEYS_LOCK)).await;
        let now = self.clock.now_millis();
        let removed = self
            .store
            .remove_dynamic_keys_before(&self.app, now - self.lifetime_ms)
            .await?;
        if removed > 0 {
            info!(app = %self.app, removed, "removed expired signing keys");
        }
        let mut cache = self.cache.write().await;
        cache.dynamic.retain(|k| !k.is_expired(now));
        Ok(removed)
    }

    async fn cached_key(&self, key_id: &str, now: i64) -> Option<SigningKey> {
        let cache = self.cache.read().await;
        cache
            .static_key
            .iter()
            .chain(cache.dynamic.iter())
            .find(|k| k.key_id == key_id && !k.is_expired(now))
            .cloned()
    }

    async fn load_dynamic(&self, now: i64) -> Result<Vec<SigningKey>, KeyError> {
        let mut keys = Vec::new();
        for record in self.store.dynamic_keys(&self.app).await? {
            let expiry = record.created_at + self.lifetime_ms;
            if expiry <= now {
                continue;
            }
            keys.push(material::from_record(&record, Some(expiry), false)?);
        }
        keys.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(keys)
    }

    async fn create_dynamic_key(&self, now: i64) -> Result<SigningKey, KeyError> {
        let key_id = format!("{DYNAMIC_KEY_PREFIX}{now}");
        let (key, record) =
            material::generate_with_record(key_id, now, Some(now + self.lifetime_ms), false)?;
        self.store.add_dynamic_key(&self.app, record).await?;
        info!(app = %self.app, kid = %key.key_id, "created dynamic signing key");
        Ok(key)
    }

    /// A new key is due once the newest one is within `overlap` of the end
    /// of its signing period.
    fn rotation_due(&self, dynamic: &[SigningKey], now: i64) -> bool {
        dynamic
            .first()
            .is_none_or(|newest| now >= newest.created_at + self.update_interval_ms - self.overlap_ms)
    }

    /// The newest key signs once it has been published for `overlap`; until
    /// then the previous key keeps signing, unless its own period is over.
    fn pick_signing_key(&self, dynamic: &[SigningKey], now: i64) -> Option<SigningKey> {
        let newest = dynamic.first()?;
        match dynamic.get(1) {
            Some(previous)
                if now < newest.created_at + self.overlap_ms
                    && now < previous.created_at + self.update_interval_ms =>
            {
                Some(previous.clone())
            }
            _ => Some(newest.clone()),
        }
    }
}

fn unexpired(keys: &[SigningKey], now: i64) -> Vec<SigningKey> {
    keys.iter().filter(|k| !k.is_expired(now)).cloned().collect()
}

/// Lazily constructed [`SigningKeyStore`]s, one per app.
pub struct KeyRegistry {
    store: Arc<dyn KeyStore>,
    locks: Arc<NamedLocks>,
    clock: Arc<dyn Clock>,
    config: SessionConfig,
    apps: DashMap<AppScope, Arc<SigningKeyStore>>,
}

impl KeyRegistry {
    pub fn new(
        store: Arc<dyn KeyStore>,
        locks: Arc<NamedLocks>,
        clock: Arc<dyn Clock>,
        config: SessionConfig,
    ) -> Self {
        Self {
            store,
            locks,
            clock,
            config,
            apps: DashMap::new(),
        }
    }

    pub fn for_app(&self, app: &AppScope) -> Arc<SigningKeyStore> {
        if let Some(existing) = self.apps.get(app) {
            return Arc::clone(existing.value());
        }
        let entry = self.apps.entry(app.clone()).or_insert_with(|| {
            Arc::new(SigningKeyStore::new(
                app.clone(),
                Arc::clone(&self.store),
                Arc::clone(&self.locks),
                Arc::clone(&self.clock),
                &self.config,
            ))
        });
        Arc::clone(entry.value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    const HOUR: i64 = 3_600_000;

    fn config() -> SessionConfig {
        SessionConfig {
            access_token_validity_ms: HOUR,
            dynamic_key_update_interval_ms: 24 * HOUR,
            dynamic_key_overlap_ms: 60_000,
            ..SessionConfig::default()
        }
    }

    fn key_store(store: Arc<MemoryStore>, clock: Arc<ManualClock>) -> SigningKeyStore {
        SigningKeyStore::new(
            AppScope::default(),
            store,
            Arc::new(NamedLocks::new()),
            clock,
            &config(),
        )
    }

    #[tokio::test]
    async fn first_signing_request_creates_a_dynamic_key() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(1_000_000));
        let keys = key_store(Arc::clone(&store), clock);

        let key = keys.key_for_signing(false).await.unwrap();
        assert_eq!(key.key_id, "d-1000000");
        assert!(!key.is_static);
        assert_eq!(key.expiry_time, Some(1_000_000 + 26 * HOUR));
        assert_eq!(store.dynamic_keys(&AppScope::default()).await.unwrap().len(), 1);

        let again = keys.key_for_signing(false).await.unwrap();
        assert_eq!(again.key_id, key.key_id);
    }

    #[tokio::test]
    async fn rotation_after_interval_keeps_previous_key_verifiable() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(0));
        let keys = key_store(store, Arc::clone(&clock));

        let first = keys.key_for_signing(false).await.unwrap();
        clock.advance_millis(24 * HOUR);
        let second = keys.key_for_signing(false).await.unwrap();

        assert_ne!(first.key_id, second.key_id);
        let previous = keys.key_for_verification(&first.key_id).await.unwrap();
        assert_eq!(previous.public_key, first.public_key);
    }

    #[tokio::test]
    async fn previous_key_signs_during_overlap() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(0));
        let keys = key_store(store, Arc::clone(&clock));

        let first = keys.key_for_signing(false).await.unwrap();
        // Inside the overlap window: a new key is published but not yet used.
        clock.set_millis(24 * HOUR - 30_000);
        let signing = keys.key_for_signing(false).await.unwrap();
        assert_eq!(signing.key_id, first.key_id);
        assert_eq!(keys.dynamic_keys().await.unwrap().len(), 2);

        clock.set_millis(24 * HOUR + 30_000);
        let signing = keys.key_for_signing(false).await.unwrap();
        assert_eq!(signing.key_id, format!("d-{}", 24 * HOUR - 30_000));
    }

    #[tokio::test]
    async fn expired_keys_are_not_found() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(0));
        let keys = key_store(store, Arc::clone(&clock));

        let first = keys.key_for_signing(false).await.unwrap();
        clock.advance_millis(26 * HOUR);
        assert!(matches!(
            keys.key_for_verification(&first.key_id).await,
            Err(KeyError::NotFound(_))
        ));
        assert!(matches!(
            keys.key_for_verification("d-unknown").await,
            Err(KeyError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn concurrent_signing_requests_create_one_key() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(0));
        let keys = Arc::new(key_store(Arc::clone(&store), clock));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let keys = Arc::clone(&keys);
                tokio::spawn(async move { keys.key_for_signing(false).await.unwrap().key_id })
            })
            .collect();
        let ids: Vec<String> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        assert!(ids.iter().all(|id| id == &ids[0]));
        assert_eq!(store.dynamic_keys(&AppScope::default()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn key_created_by_another_process_is_found() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(0));
        let a = key_store(Arc::clone(&store), Arc::clone(&clock));
        let b = key_store(Arc::clone(&store), clock);

        b.dynamic_keys().await.unwrap();
        let key = a.key_for_signing(false).await.unwrap();
        assert_eq!(b.key_for_verification(&key.key_id).await.unwrap().key_id, key.key_id);
    }

    #[tokio::test]
    async fn static_key_is_shared_and_listed() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(5));
        let a = key_store(Arc::clone(&store), Arc::clone(&clock));
        let b = key_store(Arc::clone(&store), clock);

        let key = a.key_for_signing(true).await.unwrap();
        assert!(key.is_static);
        assert!(key.key_id.starts_with("s-"));
        assert_eq!(b.key_for_verification(&key.key_id).await.unwrap().public_key, key.public_key);

        let all = a.all_keys().await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.iter().any(|k| k.is_static));
        assert_eq!(a.jwks().await.unwrap().keys.len(), 2);
    }

    #[tokio::test]
    async fn cleanup_removes_only_expired_keys() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(0));
        let keys = key_store(Arc::clone(&store), Arc::clone(&clock));

        keys.key_for_signing(false).await.unwrap();
        clock.advance_millis(24 * HOUR);
        keys.key_for_signing(false).await.unwrap();
        clock.advance_millis(3 * HOUR);

        assert_eq!(keys.cleanup_expired().await.unwrap(), 1);
        assert_eq!(store.dynamic_keys(&AppScope::default()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn registry_reuses_stores_per_app() {
        let registry = KeyRegistry::new(
            Arc::new(MemoryStore::new()),
            Arc::new(NamedLocks::new()),
            Arc::new(ManualClock::new(0)),
            config(),
        );
        let a = registry.for_app(&AppScope::new("", "a1"));
        let again = registry.for_app(&AppScope::new("", "a1"));
        let other = registry.for_app(&AppScope::new("", "a2"));
        assert!(Arc::ptr_eq(&a, &again));
        assert!(!Arc::ptr_eq(&a, &other));
    }
}
