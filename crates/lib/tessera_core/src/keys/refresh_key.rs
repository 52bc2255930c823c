//! Per-app secret that seals refresh tokens.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use super::KeyError;
use crate::crypto;
use crate::lock::NamedLocks;
use crate::scope::AppScope;
use crate::store::KeyStore;

const REFRESH_KEY_LOCK: &str = "refresh-token-key";

/// Caches each app's refresh-token secret after the first lookup.
pub struct RefreshKeyCache {
    store: Arc<dyn KeyStore>,
    locks: Arc<NamedLocks>,
    secrets: DashMap<AppScope, String>,
}

impl RefreshKeyCache {
    pub fn new(store: Arc<dyn KeyStore>, locks: Arc<NamedLocks>) -> Self {
        Self {
            store,
            locks,
            secrets: DashMap::new(),
        }
    }

    /// The app's secret, generated and stored on first use.
    pub async fn secret(&self, app: &AppScope) -> Result<String, KeyError> {
        if let Some(secret) = self.secrets.get(app) {
            return Ok(secret.value().clone());
        }

        let _guard = self.locks.lock(&app.lock_name(REFRESH_KEY_LOCK)).await;
        let secret = match self.store.refresh_token_secret(app).await? {
            Some(secret) => secret,
            None => {
                let stored = self
                    .store
                    .set_refresh_token_secret_if_absent(app, crypto::generate_secret())
                    .await?;
                info!(app = %app, "created refresh token key");
                stored
            }
        };
        self.secrets.insert(app.clone(), secret.clone());
        Ok(secret)
    }
}
