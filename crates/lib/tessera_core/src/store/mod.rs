//! Persistence boundary.
//!
//! The engine talks to storage only through [`SessionStore`] and [`KeyStore`].
//! Every multi-step update of a session's refresh chain goes through
//! [`SessionStore::update_refresh_hash`], a compare-and-swap that the backing
//! store must apply atomically; that is the transaction boundary that keeps
//! refresh-chain advancement linearizable per session handle.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::scope::AppScope;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Arbitrary JSON claims keyed by name.
pub type Claims = serde_json::Map<String, serde_json::Value>;

/// Storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Session handle already exists: {0}")]
    DuplicateHandle(String),

    #[error("Stored data is corrupt: {0}")]
    Corrupt(String),

    #[error("Database error: {0}")]
    DbError(#[from] sqlx::Error),
}

/// One persisted session, keyed by `(app, session_handle)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_handle: String,
    pub tenant_id: String,
    pub user_id: String,
    pub user_data_in_jwt: Claims,
    pub user_data_in_database: Claims,
    /// `sha256(sha256(current refresh token))`.
    pub refresh_token_hash2: String,
    /// Access tokens of this session are signed with the app's static key.
    pub use_static_key: bool,
    /// Milliseconds since the epoch; the refresh token's expiry.
    pub expires_at: i64,
    pub created_at: i64,
}

impl SessionRecord {
    /// Expired from `expires_at` on, the same boundary as tokens and keys.
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at <= now
    }
}

/// Serialized key material as stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRecord {
    pub key_id: String,
    /// `base64(public key)|base64(pkcs8 private key)`.
    pub value: String,
    pub algorithm: String,
    pub created_at: i64,
}

/// Session persistence.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert a new session. Fails with [`StoreError::DuplicateHandle`] if the
    /// handle is taken within the app.
    async fn create_record(&self, app: &AppScope, record: SessionRecord)
    -> Result<(), StoreError>;

    async fn get_record(
        &self,
        app: &AppScope,
        session_handle: &str,
    ) -> Result<Option<SessionRecord>, StoreError>;

    /// Replace the JWT and/or database claims. Returns `false` if the handle
    /// does not exist.
    async fn update_claims(
        &self,
        app: &AppScope,
        session_handle: &str,
        user_data_in_jwt: Option<&Claims>,
        user_data_in_database: Option<&Claims>,
    ) -> Result<bool, StoreError>;

    /// Atomically replace the refresh hash if it still equals `expected_hash2`.
    /// Returns `false` when the handle is gone or another writer got there first.
    async fn update_refresh_hash(
        &self,
        app: &AppScope,
        session_handle: &str,
        expected_hash2: &str,
        new_hash2: &str,
        new_expires_at: i64,
    ) -> Result<bool, StoreError>;

    /// Delete the given handles and return the ones that existed.
    async fn delete(
        &self,
        app: &AppScope,
        session_handles: &[String],
    ) -> Result<Vec<String>, StoreError>;

    /// Handles owned by `user_id`, optionally restricted to one tenant.
    async fn handles_for_user(
        &self,
        app: &AppScope,
        user_id: &str,
        tenant_id: Option<&str>,
    ) -> Result<Vec<String>, StoreError>;

    /// Delete every session in the app whose expiry is at or before `now`.
    async fn delete_expired(&self, app: &AppScope, now: i64) -> Result<u64, StoreError>;
}

/// Key-material persistence for signing keys and the refresh-token secret.
#[async_trait]
pub trait KeyStore: Send + Sync {
    async fn dynamic_keys(&self, app: &AppScope) -> Result<Vec<KeyRecord>, StoreError>;

    async fn add_dynamic_key(&self, app: &AppScope, key: KeyRecord) -> Result<(), StoreError>;

    async fn remove_dynamic_keys_before(
        &self,
        app: &AppScope,
        created_before: i64,
    ) -> Result<u64, StoreError>;

    async fn static_key(&self, app: &AppScope) -> Result<Option<KeyRecord>, StoreError>;

    /// Store `key` unless a static key exists; returns whichever is stored.
    async fn set_static_key_if_absent(
        &self,
        app: &AppScope,
        key: KeyRecord,
    ) -> Result<KeyRecord, StoreError>;

    async fn refresh_token_secret(&self, app: &AppScope) -> Result<Option<String>, StoreError>;

    /// Store `secret` unless one exists; returns whichever is stored.
    async fn set_refresh_token_secret_if_absent(
        &self,
        app: &AppScope,
        secret: String,
    ) -> Result<String, StoreError>;
}
