//! PostgreSQL-backed session and key storage.

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::types::Json;

use super::{Claims, KeyRecord, KeyStore, SessionRecord, SessionStore, StoreError};
use crate::scope::AppScope;

/// Row shape of `session_info`.
type SessionRow = (
    String,
    String,
    String,
    Json<Claims>,
    Json<Claims>,
    String,
    bool,
    i64,
    i64,
);

/// Row shape of the key tables.
type KeyRow = (String, String, String, i64);

/// Session and key storage over a shared connection pool.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run the embedded migrations from `tessera_core/migrations/`.
    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }
}

fn session_from_row(row: SessionRow) -> SessionRecord {
    let (
        session_handle,
        tenant_id,
        user_id,
        Json(user_data_in_jwt),
        Json(user_data_in_database),
        refresh_token_hash2,
        use_static_key,
        expires_at,
        created_at,
    ) = row;
    SessionRecord {
        session_handle,
        tenant_id,
        user_id,
        user_data_in_jwt,
        user_data_in_database,
        refresh_token_hash2,
        use_static_key,
        expires_at,
        created_at,
    }
}

fn key_from_row((key_id, value, algorithm, created_at): KeyRow) -> KeyRecord {
    KeyRecord {
        key_id,
        value,
        algorithm,
        created_at,
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[async_trait]
impl SessionStore for PgStore {
    async fn create_record(
        &self,
        app: &AppScope,
        record: SessionRecord,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "INSERT INTO session_info (connection_uri_domain, app_id, session_handle, tenant_id, \
             user_id, refresh_token_hash_2, session_data, jwt_user_payload, use_static_key, expires_at, \
             created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(&app.connection_uri_domain)
        .bind(&app.app_id)
        .bind(&record.session_handle)
        .bind(&record.tenant_id)
        .bind(&record.user_id)
        .bind(&record.refresh_token_hash2)
        .bind(Json(&record.user_data_in_database))
        .bind(Json(&record.user_data_in_jwt))
        .bind(record.use_static_key)
        .bind(record.expires_at)
        .bind(record.created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => {
                Err(StoreError::DuplicateHandle(record.session_handle))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_record(
        &self,
        app: &AppScope,
        session_handle: &str,
    ) -> Result<Option<SessionRecord>, StoreError> {
        let row = sqlx::query_as::<_, SessionRow>(
            "SELECT session_handle, tenant_id, user_id, jwt_user_payload, session_data, \
             refresh_token_hash_2, use_static_key, expires_at, created_at \
             FROM session_info \
             WHERE connection_uri_domain = $1 AND app_id = $2 AND session_handle = $3",
        )
        .bind(&app.connection_uri_domain)
        .bind(&app.app_id)
        .bind(session_handle)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(session_from_row))
    }

    async fn update_claims(
        &self,
        app: &AppScope,
        session_handle: &str,
        user_data_in_jwt: Option<&Claims>,
        user_data_in_database: Option<&Claims>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE session_info SET \
             jwt_user_payload = COALESCE($4, jwt_user_payload), \
             session_data = COALESCE($5, session_data) \
             WHERE connection_uri_domain = $1 AND app_id = $2 AND session_handle = $3",
        )
        .bind(&app.connection_uri_domain)
        .bind(&app.app_id)
        .bind(session_handle)
        .bind(user_data_in_jwt.map(Json))
        .bind(user_data_in_database.map(Json))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn update_refresh_hash(
        &self,
        app: &AppScope,
        session_handle: &str,
        expected_hash2: &str,
        new_hash2: &str,
        new_expires_at: i64,
    ) -> Result<bool, StoreError> {
        // A single conditional UPDATE takes the row lock, so concurrent swaps
        // from the same expected hash cannot both match.
        let result = sqlx::query(
            "UPDATE session_info SET refresh_token_hash_2 = $5, expires_at = $6 \
             WHERE connection_uri_domain = $1 AND app_id = $2 AND session_handle = $3 \
               AND refresh_token_hash_2 = $4",
        )
        .bind(&app.connection_uri_domain)
        .bind(&app.app_id)
        .bind(session_handle)
        .bind(expected_hash2)
        .bind(new_hash2)
        .bind(new_expires_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete(
        &self,
        app: &AppScope,
        session_handles: &[String],
    ) -> Result<Vec<String>, StoreError> {
        if session_handles.is_empty() {
            return Ok(Vec::new());
        }
        let deleted = sqlx::query_scalar::<_, String>(
            "DELETE FROM session_info \
             WHERE connection_uri_domain = $1 AND app_id = $2 AND session_handle = ANY($3) \
             RETURNING session_handle",
        )
        .bind(&app.connection_uri_domain)
        .bind(&app.app_id)
        .bind(session_handles)
        .fetch_all(&self.pool)
        .await?;
        Ok(deleted)
    }

    async fn handles_for_user(
        &self,
        app: &AppScope,
        user_id: &str,
        tenant_id: Option<&str>,
    ) -> Result<Vec<String>, StoreError> {
        let handles = sqlx::query_scalar::<_, String>(
            "SELECT session_handle FROM session_info \
             WHERE connection_uri_domain = $1 AND app_id = $2 AND user_id = $3 \
               AND ($4::text IS NULL OR tenant_id = $4) \
             ORDER BY session_handle",
        )
        .bind(&app.connection_uri_domain)
        .bind(&app.app_id)
        .bind(user_id)
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(handles)
    }

    async fn delete_expired(&self, app: &AppScope, now: i64) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM session_info \
             WHERE connection_uri_domain = $1 AND app_id = $2 AND expires_at <= $3",
        )
        .bind(&app.connection_uri_domain)
        .bind(&app.app_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl KeyStore for PgStore {
    async fn dynamic_keys(&self, app: &AppScope) -> Result<Vec<KeyRecord>, StoreError> {
        let rows = sqlx::query_as::<_, KeyRow>(
            "SELECT key_id, key_value, algorithm, created_at \
             FROM access_token_signing_keys \
             WHERE connection_uri_domain = $1 AND app_id = $2 \
             ORDER BY created_at DESC",
        )
        .bind(&app.connection_uri_domain)
        .bind(&app.app_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(key_from_row).collect())
    }

    async fn add_dynamic_key(&self, app: &AppScope, key: KeyRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO access_token_signing_keys \
             (connection_uri_domain, app_id, key_id, key_value, algorithm, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&app.connection_uri_domain)
        .bind(&app.app_id)
        .bind(&key.key_id)
        .bind(&key.value)
        .bind(&key.algorithm)
        .bind(key.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_dynamic_keys_before(
        &self,
        app: &AppScope,
        created_before: i64,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM access_token_signing_keys \
             WHERE connection_uri_domain = $1 AND app_id = $2 AND created_at < $3",
        )
        .bind(&app.connection_uri_domain)
        .bind(&app.app_id)
        .bind(created_before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn static_key(&self, app: &AppScope) -> Result<Option<KeyRecord>, StoreError> {
        let row = sqlx::query_as::<_, KeyRow>(
            "SELECT key_id, key_value, algorithm, created_at FROM static_signing_keys \
             WHERE connection_uri_domain = $1 AND app_id = $2",
        )
        .bind(&app.connection_uri_domain)
        .bind(&app.app_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(key_from_row))
    }

    async fn set_static_key_if_absent(
        &self,
        app: &AppScope,
        key: KeyRecord,
    ) -> Result<KeyRecord, StoreError> {
        sqlx::query(
            "INSERT INTO static_signing_keys \
             (connection_uri_domain, app_id, key_id, key_value, algorithm, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (connection_uri_domain, app_id) DO NOTHING",
        )
        .bind(&app.connection_uri_domain)
        .bind(&app.app_id)
        .bind(&key.key_id)
        .bind(&key.value)
        .bind(&key.algorithm)
        .bind(key.created_at)
        .execute(&self.pool)
        .await?;

        self.static_key(app)
            .await?
            .ok_or_else(|| StoreError::Corrupt("static signing key vanished after insert".into()))
    }

    async fn refresh_token_secret(&self, app: &AppScope) -> Result<Option<String>, StoreError> {
        let secret = sqlx::query_scalar::<_, String>(
            "SELECT secret FROM refresh_token_secrets \
             WHERE connection_uri_domain = $1 AND app_id = $2",
        )
        .bind(&app.connection_uri_domain)
        .bind(&app.app_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(secret)
    }

    async fn set_refresh_token_secret_if_absent(
        &self,
        app: &AppScope,
        secret: String,
    ) -> Result<String, StoreError> {
        sqlx::query(
            "INSERT INTO refresh_token_secrets (connection_uri_domain, app_id, secret) \
             VALUES ($1, $2, $3) \
             ON CONFLICT (connection_uri_domain, app_id) DO NOTHING",
        )
        .bind(&app.connection_uri_domain)
        .bind(&app.app_id)
        .bind(&secret)
        .execute(&self.pool)
        .await?;

        self.refresh_token_secret(app)
            .await?
            .ok_or_else(|| StoreError::Corrupt("refresh token secret vanished after insert".into()))
    }
}
