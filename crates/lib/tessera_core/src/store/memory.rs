//! In-process store used by tests and single-node deployments.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{Claims, KeyRecord, KeyStore, SessionRecord, SessionStore, StoreError};
use crate::scope::AppScope;

#[derive(Debug, Default)]
struct AppData {
    sessions: HashMap<String, SessionRecord>,
    dynamic_keys: Vec<KeyRecord>,
    static_key: Option<KeyRecord>,
    refresh_token_secret: Option<String>,
}

/// Sessions and keys held in memory, one partition per app.
#[derive(Debug, Default)]
pub struct MemoryStore {
    apps: Mutex<HashMap<AppScope, AppData>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of sessions currently stored for `app`.
    pub async fn session_count(&self, app: &AppScope) -> usize {
        self.apps
            .lock()
            .await
            .get(app)
            .map_or(0, |data| data.sessions.len())
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn create_record(
        &self,
        app: &AppScope,
        record: SessionRecord,
    ) -> Result<(), StoreError> {
        let mut apps = self.apps.lock().await;
        let sessions = &mut apps.entry(app.clone()).or_default().sessions;
        if sessions.contains_key(&record.session_handle) {
            return Err(StoreError::DuplicateHandle(record.session_handle));
        }
        sessions.insert(record.session_handle.clone(), record);
        Ok(())
    }

    async fn get_record(
        &self,
        app: &AppScope,
        session_handle: &str,
    ) -> Result<Option<SessionRecord>, StoreError> {
        let apps = self.apps.lock().await;
        Ok(apps
            .get(app)
            .and_then(|data| data.sessions.get(session_handle))
            .cloned())
    }

    async fn update_claims(
        &self,
        app: &AppScope,
        session_handle: &str,
        user_data_in_jwt: Option<&Claims>,
        user_data_in_database: Option<&Claims>,
    ) -> Result<bool, StoreError> {
        let mut apps = self.apps.lock().await;
        let Some(record) = apps
            .get_mut(app)
            .and_then(|data| data.sessions.get_mut(session_handle))
        else {
            return Ok(false);
        };
        if let Some(jwt) = user_data_in_jwt {
            record.user_data_in_jwt = jwt.clone();
        }
        if let Some(db) = user_data_in_database {
            record.user_data_in_database = db.clone();
        }
        Ok(true)
    }

    async fn update_refresh_hash(
        &self,
        app: &AppScope,
        session_handle: &str,
        expected_hash2: &str,
        new_hash2: &str,
        new_expires_at: i64,
    ) -> Result<bool, StoreError> {
        let mut apps = self.apps.lock().await;
        match apps
            .get_mut(app)
            .and_then(|data| data.sessions.get_mut(session_handle))
        {
            Some(record) if record.refresh_token_hash2 == expected_hash2 => {
                record.refresh_token_hash2 = new_hash2.to_string();
                record.expires_at = new_expires_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(
        &self,
        app: &AppScope,
        session_handles: &[String],
    ) -> Result<Vec<String>, StoreError> {
        let mut apps = self.apps.lock().await;
        let Some(data) = apps.get_mut(app) else {
            return Ok(Vec::new());
        };
        Ok(session_handles
            .iter()
            .filter(|handle| data.sessions.remove(handle.as_str()).is_some())
            .cloned()
            .collect())
    }

    async fn handles_for_user(
        &self,
        app: &AppScope,
        user_id: &str,
        tenant_id: Option<&str>,
    ) -> Result<Vec<String>, StoreError> {
        let apps = self.apps.lock().await;
        let Some(data) = apps.get(app) else {
            return Ok(Vec::new());
        };
        let mut handles: Vec<String> = data
            .sessions
            .values()
            .filter(|r| r.user_id == user_id)
            .filter(|r| tenant_id.is_none_or(|t| r.tenant_id == t))
            .map(|r| r.session_handle.clone())
            .collect();
        handles.sort();
        Ok(handles)
    }

    async fn delete_expired(&self, app: &AppScope, now: i64) -> Result<u64, StoreError> {
        let mut apps = self.apps.lock().await;
        let Some(data) = apps.get_mut(app) else {
            return Ok(0);
        };
        let before = data.sessions.len();
        data.sessions.retain(|_, r| !r.is_expired(now));
        Ok((before - data.sessions.len()) as u64)
    }
}

#[async_trait]
impl KeyStore for MemoryStore {
    async fn dynamic_keys(&self, app: &AppScope) -> Result<Vec<KeyRecord>, StoreError> {
        let apps = self.apps.lock().await;
        Ok(apps
            .get(app)
            .map(|data| data.dynamic_keys.clone())
            .unwrap_or_default())
    }

    async fn add_dynamic_key(&self, app: &AppScope, key: KeyRecord) -> Result<(), StoreError> {
        let mut apps = self.apps.lock().await;
        apps.entry(app.clone()).or_default().dynamic_keys.push(key);
        Ok(())
    }

    async fn remove_dynamic_keys_before(
        &self,
        app: &AppScope,
        created_before: i64,
    ) -> Result<u64, StoreError> {
        let mut apps = self.apps.lock().await;
        let Some(data) = apps.get_mut(app) else {
            return Ok(0);
        };
        let before = data.dynamic_keys.len();
        data.dynamic_keys.retain(|k| k.created_at >= created_before);
        Ok((before - data.dynamic_keys.len()) as u64)
    }

    async fn static_key(&self, app: &AppScope) -> Result<Option<KeyRecord>, StoreError> {
        let apps = self.apps.lock().await;
        Ok(apps.get(app).and_then(|data| data.static_key.clone()))
    }

    async fn set_static_key_if_absent(
        &self,
        app: &AppScope,
        key: KeyRecord,
    ) -> Result<KeyRecord, StoreError> {
        let mut apps = self.apps.lock().await;
        Ok(apps
            .entry(app.clone())
            .or_default()
            .static_key
            .get_or_insert(key)
            .clone())
    }

    async fn refresh_token_secret(&self, app: &AppScope) -> Result<Option<String>, StoreError> {
        let apps = self.apps.lock().await;
        Ok(apps.get(app).and_then(|data| data.refresh_token_secret.clone()))
    }

    async fn set_refresh_token_secret_if_absent(
        &self,
        app: &AppScope,
        secret: String,
    ) -> Result<String, StoreError> {
        let mut apps = self.apps.lock().await;
        Ok(apps
            .entry(app.clone())
            .or_default()
            .refresh_token_secret
            .get_or_insert(secret)
            .clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(handle: &str, tenant: &str, user: &str) -> SessionRecord {
        SessionRecord {
            session_handle: handle.to_string(),
            tenant_id: tenant.to_string(),
            user_id: user.to_string(),
            user_data_in_jwt: Claims::new(),
            user_data_in_database: Claims::new(),
            refresh_token_hash2: "h0".to_string(),
            use_static_key: false,
            expires_at: 1_000,
            created_at: 0,
        }
    }

    #[tokio::test]
    async fn duplicate_handle_is_rejected() {
        let store = MemoryStore::new();
        let app = AppScope::default();
        store.create_record(&app, record("s1", "public", "u1")).await.unwrap();
        let err = store
            .create_record(&app, record("s1", "public", "u2"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateHandle(h) if h == "s1"));
    }

    #[tokio::test]
    async fn refresh_hash_swap_requires_expected_value() {
        let store = MemoryStore::new();
        let app = AppScope::default();
        store.create_record(&app, record("s1", "public", "u1")).await.unwrap();

        assert!(!store.update_refresh_hash(&app, "s1", "nope", "h1", 5).await.unwrap());
        assert!(store.update_refresh_hash(&app, "s1", "h0", "h1", 5).await.unwrap());
        assert!(!store.update_refresh_hash(&app, "s1", "h0", "h2", 5).await.unwrap());

        let stored = store.get_record(&app, "s1").await.unwrap().unwrap();
        assert_eq!(stored.refresh_token_hash2, "h1");
        assert_eq!(stored.expires_at, 5);
    }

    #[tokio::test]
    async fn delete_reports_only_existing_handles() {
        let store = MemoryStore::new();
        let app = AppScope::default();
        store.create_record(&app, record("s1", "public", "u1")).await.unwrap();

        let deleted = store
            .delete(&app, &["s1".to_string(), "missing".to_string()])
            .await
            .unwrap();
        assert_eq!(deleted, vec!["s1".to_string()]);
        assert!(store.delete(&app, &["s1".to_string()]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn handles_for_user_filters_by_tenant() {
        let store = MemoryStore::new();
        let app = AppScope::default();
        store.create_record(&app, record("s1", "t1", "u1")).await.unwrap();
        store.create_record(&app, record("s2", "t2", "u1")).await.unwrap();
        store.create_record(&app, record("s3", "t1", "u2")).await.unwrap();

        assert_eq!(
            store.handles_for_user(&app, "u1", Some("t1")).await.unwrap(),
            vec!["s1".to_string()]
        );
        assert_eq!(
            store.handles_for_user(&app, "u1", None).await.unwrap(),
            vec!["s1".to_string(), "s2".to_string()]
        );
    }

    #[tokio::test]
    async fn apps_are_isolated() {
        let store = MemoryStore::new();
        let a1 = AppScope::new("", "a1");
        let a2 = AppScope::new("", "a2");
        store.create_record(&a1, record("s1", "public", "u1")).await.unwrap();
        assert!(store.get_record(&a2, "s1").await.unwrap().is_none());
        assert_eq!(store.session_count(&a1).await, 1);
    }

    #[tokio::test]
    async fn first_static_key_wins() {
        let store = MemoryStore::new();
        let app = AppScope::default();
        let first = KeyRecord {
            key_id: "s-1".into(),
            value: "v1".into(),
            algorithm: "EdDSA".into(),
            created_at: 1,
        };
        let second = KeyRecord {
            key_id: "s-2".into(),
            ..first.clone()
        };
        assert_eq!(store.set_static_key_if_absent(&app, first.clone()).await.unwrap(), first);
        assert_eq!(store.set_static_key_if_absent(&app, second).await.unwrap(), first);
    }

    #[tokio::test]
    async fn expired_sessions_are_purged() {
        let store = MemoryStore::new();
        let app = AppScope::default();
        store.create_record(&app, record("s1", "public", "u1")).await.unwrap();
        let mut live = record("s2", "public", "u1");
        live.expires_at = 10_000;
        store.create_record(&app, live).await.unwrap();

        assert_eq!(store.delete_expired(&app, 5_000).await.unwrap(), 1);
        assert!(store.get_record(&app, "s2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn session_expires_at_its_expiry_time() {
        let store = MemoryStore::new();
        let app = AppScope::default();
        let session = record("s1", "public", "u1");
        assert!(!session.is_expired(999));
        assert!(session.is_expired(1_000));
        store.create_record(&app, session).await.unwrap();

        assert_eq!(store.delete_expired(&app, 999).await.unwrap(), 0);
        assert_eq!(store.delete_expired(&app, 1_000).await.unwrap(), 1);
    }
}
