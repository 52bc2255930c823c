//! [`SessionEngine`] ties keys, tokens and storage together.

use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    ApiVersion, IssuedToken, KeyDiscovery, NewSession, PublicKeyInfo, SessionError,
    SessionInformation, SessionSummary, SessionTokens, VerifiedSession,
};
use crate::clock::{Clock, SystemClock};
use crate::config::SessionConfig;
use crate::crypto;
use crate::keys::{Jwks, KeyError, KeyRegistry, RefreshKeyCache, SigningKey, SigningKeyStore};
use crate::lock::NamedLocks;
use crate::scope::{AppScope, TenantScope};
use crate::store::{Claims, KeyStore, SessionRecord, SessionStore};
use crate::token::refresh::{hash1, hash2};
use crate::token::{
    AccessTokenEnvelope, AccessTokenInfo, ChainPosition, RefreshChain, TokenError,
    check_protected_claims, encode_access_token,
};

/// Upper bound on re-reads when a refresh loses a race on the stored hash.
const MAX_REFRESH_ATTEMPTS: usize = 5;

/// Issues, verifies, refreshes, regenerates and revokes sessions.
///
/// All state lives in the [`SessionStore`] and [`KeyStore`]; the engine only
/// caches signing keys and refresh-token secrets. It is safe to share one
/// engine across tasks.
pub struct SessionEngine {
    config: SessionConfig,
    sessions: Arc<dyn SessionStore>,
    keys: KeyRegistry,
    refresh_keys: RefreshKeyCache,
    clock: Arc<dyn Clock>,
}

impl SessionEngine {
    /// Engine on the system clock and the process-wide lock registry.
    pub fn new(
        config: SessionConfig,
        sessions: Arc<dyn SessionStore>,
        keys: Arc<dyn KeyStore>,
    ) -> Self {
        Self::with_clock(config, sessions, keys, Arc::new(SystemClock), NamedLocks::shared())
    }

    pub fn with_clock(
        config: SessionConfig,
        sessions: Arc<dyn SessionStore>,
        keys: Arc<dyn KeyStore>,
        clock: Arc<dyn Clock>,
        locks: Arc<NamedLocks>,
    ) -> Self {
        Self {
            keys: KeyRegistry::new(
                Arc::clone(&keys),
                Arc::clone(&locks),
                Arc::clone(&clock),
                config.clone(),
            ),
            refresh_keys: RefreshKeyCache::new(keys, locks),
            config,
            sessions,
            clock,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Signing keys of `app`.
    pub fn signing_keys(&self, app: &AppScope) -> Arc<SigningKeyStore> {
        self.keys.for_app(app)
    }

    /// Start a session and issue its first tokens.
    ///
    /// Protected claim names in `user_data_in_jwt` are rejected before
    /// anything is written.
    pub async fn create_session(
        &self,
        scope: &TenantScope,
        api: ApiVersion,
        new: NewSession,
    ) -> Result<SessionTokens, SessionError> {
        check_protected_claims(&new.user_data_in_jwt).map_err(internal)?;

        let app = scope.app();
        let now = self.clock.now_millis();
        let session_handle = Uuid::new_v4().to_string();
        let anti_csrf_token = new
            .enable_anti_csrf
            .unwrap_or(self.config.anti_csrf)
            .then(|| Uuid::new_v4().to_string());
        let use_static_key = new
            .use_static_key
            .unwrap_or(!self.config.access_token_signing_key_dynamic);

        let chain = self.refresh_chain(&app).await?;
        let refresh = chain
            .mint(&session_handle, &new.user_id, None, anti_csrf_token.as_deref())
            .map_err(internal)?;
        let refresh_expiry = now + self.config.refresh_token_validity_ms;

        let access = AccessTokenInfo {
            version: api.access_token_version(),
            session_handle: session_handle.clone(),
            user_id: new.user_id.clone(),
            tenant_id: scope.tenant_id.clone(),
            refresh_token_hash1: refresh.hash1.clone(),
            parent_refresh_token_hash1: None,
            anti_csrf_token: anti_csrf_token.clone(),
            user_data: new.user_data_in_jwt.clone(),
            expiry_time: now + self.config.access_token_validity_ms,
            time_created: now,
            lmrt: now,
        }
        .normalized();
        let access_token = self.mint_access_token(&app, &access, use_static_key).await?;

        self.sessions
            .create_record(
                &app,
                SessionRecord {
                    session_handle: session_handle.clone(),
                    tenant_id: scope.tenant_id.clone(),
                    user_id: new.user_id.clone(),
                    user_data_in_jwt: new.user_data_in_jwt.clone(),
                    user_data_in_database: new.user_data_in_database,
                    refresh_token_hash2: refresh.hash2,
                    use_static_key,
                    expires_at: refresh_expiry,
                    created_at: now,
                },
            )
            .await?;
        info!(
            session_handle = %session_handle,
            app_id = %app,
            tenant_id = %scope.tenant_id,
            version = %access.version,
            "session created"
        );

        Ok(SessionTokens {
            session: SessionSummary {
                handle: session_handle,
                user_id: new.user_id,
                tenant_id: scope.tenant_id.clone(),
                user_data_in_jwt: new.user_data_in_jwt,
            },
            access_token,
            refresh_token: IssuedToken {
                token: refresh.token,
                expiry: refresh_expiry,
                created_time: now,
            },
            anti_csrf_token,
        })
    }

    /// Check an access token.
    ///
    /// With `do_anti_csrf_check` the token must carry an anti-CSRF claim equal
    /// to `anti_csrf_token`; anything else asks for a refresh.
    ///
    /// Without `check_database` (and with blacklisting off) this trusts the
    /// signature alone, so a revoked session keeps verifying until its access
    /// token expires. A fresh access token is returned when the presented one
    /// was signed by a dynamic key that no longer signs.
    pub async fn verify_session(
        &self,
        scope: &TenantScope,
        api: ApiVersion,
        access_token: &str,
        anti_csrf_token: Option<&str>,
        do_anti_csrf_check: bool,
        check_database: bool,
    ) -> Result<VerifiedSession, SessionError> {
        let app = scope.app();
        let (access, key) = self.open_access_token(&app, api, access_token).await?;
        let now = self.clock.now_millis();

        if access.is_expired(now) {
            return Err(SessionError::TryRefreshToken("access token expired".into()));
        }
        if do_anti_csrf_check {
            match access.anti_csrf_token.as_deref() {
                None => {
                    return Err(SessionError::TryRefreshToken(
                        "access token carries no anti-csrf token".into(),
                    ));
                }
                Some(expected) if anti_csrf_token != Some(expected) => {
                    return Err(SessionError::TryRefreshToken("anti-csrf token mismatch".into()));
                }
                Some(_) => {}
            }
        }
        if check_database || self.config.access_token_blacklisting {
            match self.sessions.get_record(&app, &access.session_handle).await? {
                Some(record) if !record.is_expired(now) => {}
                _ => {
                    return Err(SessionError::Unauthorised(
                        "session does not exist or has expired".into(),
                    ));
                }
            }
        }

        let mut reissued = None;
        if access.version.has_key_id() && !key.is_static {
            let current = self.keys.for_app(&app).latest_dynamic_key().await?;
            if current.key_id != key.key_id {
                debug!(
                    session_handle = %access.session_handle,
                    old_kid = %key.key_id,
                    kid = %current.key_id,
                    "re-signing access token with current key"
                );
                let token = encode_access_token(&access, &current).map_err(internal)?;
                reissued = Some(IssuedToken {
                    token,
                    expiry: access.expiry_time,
                    created_time: access.time_created,
                });
            }
        }

        Ok(VerifiedSession {
            session: summary(&access),
            access_token: reissued,
        })
    }

    /// Exchange a refresh token for a new token pair.
    ///
    /// Each refresh issues a fresh anti-CSRF token when `enable_anti_csrf` is
    /// set and none otherwise.
    ///
    /// Replaying a refresh token that has already been exchanged revokes the
    /// whole session and fails with [`SessionError::TokenTheftDetected`]. A
    /// token that cannot be opened is simply [`SessionError::Unauthorised`].
    pub async fn refresh_session(
        &self,
        scope: &TenantScope,
        api: ApiVersion,
        refresh_token: &str,
        anti_csrf_token: Option<&str>,
        enable_anti_csrf: bool,
    ) -> Result<SessionTokens, SessionError> {
        let app = scope.app();
        let chain = self.refresh_chain(&app).await?;
        let presented = chain
            .open(refresh_token)
            .map_err(|e| SessionError::Unauthorised(format!("invalid refresh token: {e}")))?;

        if enable_anti_csrf
            && let Some(expected) = presented.anti_csrf_token.as_deref()
            && anti_csrf_token != Some(expected)
        {
            return Err(SessionError::Unauthorised("anti-csrf token mismatch".into()));
        }

        let handle = presented.session_handle.as_str();
        let presented_hash2 = hash2(refresh_token);

        for _ in 0..MAX_REFRESH_ATTEMPTS {
            let now = self.clock.now_millis();
            let record = match self.sessions.get_record(&app, handle).await? {
                Some(record) if !record.is_expired(now) => record,
                _ => {
                    return Err(SessionError::Unauthorised(
                        "session does not exist or has expired".into(),
                    ));
                }
            };
            if record.user_id != presented.user_id {
                return Err(SessionError::Unauthorised(
                    "refresh token does not belong to this session".into(),
                ));
            }

            match RefreshChain::validate(refresh_token, &presented, &record.refresh_token_hash2) {
                Ok(ChainPosition::ChildOfCurrent) => {
                    // Promote the presented token, then take the current-link path.
                    self.sessions
                        .update_refresh_hash(
                            &app,
                            handle,
                            &record.refresh_token_hash2,
                            &presented_hash2,
                            record.expires_at,
                        )
                        .await?;
                }
                Ok(ChainPosition::Current) => {
                    let next_anti_csrf = enable_anti_csrf.then(|| Uuid::new_v4().to_string());
                    let next = chain
                        .mint(
                            handle,
                            &record.user_id,
                            Some(&presented_hash2),
                            next_anti_csrf.as_deref(),
                        )
                        .map_err(internal)?;
                    let refresh_expiry = now + self.config.refresh_token_validity_ms;
                    let advanced = self
                        .sessions
                        .update_refresh_hash(
                            &app,
                            handle,
                            &presented_hash2,
                            &next.hash2,
                            refresh_expiry,
                        )
                        .await?;
                    if !advanced {
                        debug!(session_handle = handle, "refresh raced another update, re-reading");
                        continue;
                    }

                    let access = AccessTokenInfo {
                        version: api.access_token_version(),
                        session_handle: handle.to_string(),
                        user_id: record.user_id.clone(),
                        tenant_id: record.tenant_id.clone(),
                        refresh_token_hash1: next.hash1.clone(),
                        parent_refresh_token_hash1: Some(hash1(refresh_token)),
                        anti_csrf_token: next_anti_csrf.clone(),
                        user_data: record.user_data_in_jwt.clone(),
                        expiry_time: now + self.config.access_token_validity_ms,
                        time_created: now,
                        lmrt: now,
                    }
                    .normalized();
                    let access_token = self
                        .mint_access_token(&app, &access, record.use_static_key)
                        .await?;
                    debug!(session_handle = handle, app_id = %app, "session refreshed");

                    return Ok(SessionTokens {
                        session: SessionSummary {
                            handle: handle.to_string(),
                            user_id: record.user_id,
                            tenant_id: record.tenant_id,
                            user_data_in_jwt: record.user_data_in_jwt,
                        },
                        access_token,
                        refresh_token: IssuedToken {
                            token: next.token,
                            expiry: refresh_expiry,
                            created_time: now,
                        },
                        anti_csrf_token: next_anti_csrf,
                    });
                }
                Err(TokenError::TheftDetected {
                    session_handle,
                    user_id,
                }) => {
                    let revoked = self
                        .sessions
                        .delete(&app, std::slice::from_ref(&session_handle))
                        .await?;
                    warn!(
                        session_handle = %session_handle,
                        user_id = %user_id,
                        app_id = %app,
                        revoked = !revoked.is_empty(),
                        "refresh token reuse detected, session revoked"
                    );
                    return Err(SessionError::TokenTheftDetected {
                        session_handle,
                        user_id,
                    });
                }
                Err(e) => return Err(internal(e)),
            }
        }

        Err(SessionError::Unauthorised(
            "refresh token could not be applied".into(),
        ))
    }

    /// Replace the session's JWT claims and re-issue the presented access token.
    ///
    /// Works on expired access tokens as long as the session exists; in that
    /// case no new token is returned. A re-issued token keeps the original
    /// expiry, version and key kind.
    pub async fn regenerate_session(
        &self,
        scope: &TenantScope,
        api: ApiVersion,
        access_token: &str,
        new_user_data_in_jwt: Option<Claims>,
    ) -> Result<VerifiedSession, SessionError> {
        if let Some(data) = &new_user_data_in_jwt {
            check_protected_claims(data).map_err(internal)?;
        }

        let app = scope.app();
        let (access, key) = self.open_access_token(&app, api, access_token).await?;
        let record = self
            .sessions
            .get_record(&app, &access.session_handle)
            .await?
            .ok_or_else(|| SessionError::Unauthorised("session does not exist".into()))?;

        let user_data = new_user_data_in_jwt.unwrap_or_else(|| record.user_data_in_jwt.clone());
        let updated = self
            .sessions
            .update_claims(&app, &access.session_handle, Some(&user_data), None)
            .await?;
        if !updated {
            return Err(SessionError::Unauthorised("session does not exist".into()));
        }

        let session = SessionSummary {
            handle: access.session_handle.clone(),
            user_id: access.user_id.clone(),
            tenant_id: record.tenant_id.clone(),
            user_data_in_jwt: user_data.clone(),
        };
        let now = self.clock.now_millis();
        if access.is_expired(now) {
            return Ok(VerifiedSession {
                session,
                access_token: None,
            });
        }

        let chain_moved =
            crypto::sha256_hex(&access.refresh_token_hash1) != record.refresh_token_hash2;
        if chain_moved {
            debug!(
                session_handle = %access.session_handle,
                "refresh chain moved since the access token was issued"
            );
        }
        let regenerated = AccessTokenInfo {
            user_data,
            parent_refresh_token_hash1: if chain_moved {
                None
            } else {
                access.parent_refresh_token_hash1.clone()
            },
            time_created: now,
            ..access
        }
        .normalized();
        let access_token = self
            .mint_access_token(&app, &regenerated, key.is_static)
            .await?;

        Ok(VerifiedSession {
            session,
            access_token: Some(access_token),
        })
    }

    /// Delete the given sessions anywhere in the app. Returns the handles
    /// that existed.
    pub async fn revoke_sessions(
        &self,
        scope: &TenantScope,
        session_handles: &[String],
    ) -> Result<Vec<String>, SessionError> {
        let app = scope.app();
        let revoked = self.sessions.delete(&app, session_handles).await?;
        info!(app_id = %app, count = revoked.len(), "sessions revoked");
        Ok(revoked)
    }

    pub async fn revoke_session(
        &self,
        scope: &TenantScope,
        session_handle: &str,
    ) -> Result<bool, SessionError> {
        let revoked = self
            .revoke_sessions(scope, &[session_handle.to_string()])
            .await?;
        Ok(!revoked.is_empty())
    }

    /// Delete every session of `user_id` in the caller's tenant, or in every
    /// tenant of the app when `across_all_tenants` is set.
    pub async fn revoke_sessions_for_user(
        &self,
        scope: &TenantScope,
        user_id: &str,
        across_all_tenants: bool,
    ) -> Result<Vec<String>, SessionError> {
        let handles = self
            .get_all_session_handles_for_user(scope, user_id, across_all_tenants)
            .await?;
        self.revoke_sessions(scope, &handles).await
    }

    pub async fn get_all_session_handles_for_user(
        &self,
        scope: &TenantScope,
        user_id: &str,
        across_all_tenants: bool,
    ) -> Result<Vec<String>, SessionError> {
        let tenant = (!across_all_tenants).then_some(scope.tenant_id.as_str());
        Ok(self
            .sessions
            .handles_for_user(&scope.app(), user_id, tenant)
            .await?)
    }

    /// Stored state of a live session, visible from any tenant of its app.
    pub async fn get_session_information(
        &self,
        scope: &TenantScope,
        session_handle: &str,
    ) -> Result<SessionInformation, SessionError> {
        let record = self.live_record(&scope.app(), session_handle).await?;
        Ok(SessionInformation {
            session_handle: record.session_handle,
            user_id: record.user_id,
            tenant_id: record.tenant_id,
            user_data_in_jwt: record.user_data_in_jwt,
            user_data_in_database: record.user_data_in_database,
            expiry: record.expires_at,
            time_created: record.created_at,
        })
    }

    pub async fn get_session_data(
        &self,
        scope: &TenantScope,
        session_handle: &str,
    ) -> Result<Claims, SessionError> {
        Ok(self
            .live_record(&scope.app(), session_handle)
            .await?
            .user_data_in_database)
    }

    pub async fn update_session_data(
        &self,
        scope: &TenantScope,
        session_handle: &str,
        data: Claims,
    ) -> Result<(), SessionError> {
        let updated = self
            .sessions
            .update_claims(&scope.app(), session_handle, None, Some(&data))
            .await?;
        if !updated {
            return Err(SessionError::Unauthorised("session does not exist".into()));
        }
        Ok(())
    }

    pub async fn get_jwt_data(
        &self,
        scope: &TenantScope,
        session_handle: &str,
    ) -> Result<Claims, SessionError> {
        Ok(self
            .live_record(&scope.app(), session_handle)
            .await?
            .user_data_in_jwt)
    }

    /// Replace the stored JWT claims without issuing a token; they reach the
    /// client on the next refresh.
    pub async fn update_jwt_data(
        &self,
        scope: &TenantScope,
        session_handle: &str,
        data: Claims,
    ) -> Result<(), SessionError> {
        check_protected_claims(&data).map_err(internal)?;
        let updated = self
            .sessions
            .update_claims(&scope.app(), session_handle, Some(&data), None)
            .await?;
        if !updated {
            return Err(SessionError::Unauthorised("session does not exist".into()));
        }
        Ok(())
    }

    /// Delete sessions whose refresh token has expired.
    pub async fn cleanup_expired_sessions(&self, app: &AppScope) -> Result<u64, SessionError> {
        let removed = self
            .sessions
            .delete_expired(app, self.clock.now_millis())
            .await?;
        if removed > 0 {
            info!(app_id = %app, removed, "expired sessions removed");
        }
        Ok(removed)
    }

    pub async fn cleanup_expired_signing_keys(&self, app: &AppScope) -> Result<u64, SessionError> {
        Ok(self.keys.for_app(app).cleanup_expired().await?)
    }

    pub async fn jwks(&self, scope: &TenantScope) -> Result<Jwks, SessionError> {
        Ok(self.keys.for_app(&scope.app()).jwks().await?)
    }

    /// The legacy signing-key fields for callers that predate JWKS.
    pub async fn key_discovery(&self, scope: &TenantScope) -> Result<KeyDiscovery, SessionError> {
        let keys = self.keys.for_app(&scope.app());
        let current = keys.latest_dynamic_key().await?;
        let expiry_time = keys.signing_key_expiry_time().await?;
        let listed = keys
            .dynamic_keys()
            .await?
            .iter()
            .map(|key| PublicKeyInfo {
                public_key: key.public_key_base64(),
                expiry_time: key.expiry_time.unwrap_or(i64::MAX),
                created_at: key.created_at,
            })
            .collect();
        Ok(KeyDiscovery {
            public_key: current.public_key_base64(),
            expiry_time,
            keys: listed,
        })
    }

    async fn refresh_chain(&self, app: &AppScope) -> Result<RefreshChain, SessionError> {
        Ok(RefreshChain::new(self.refresh_keys.secret(app).await?))
    }

    async fn live_record(
        &self,
        app: &AppScope,
        session_handle: &str,
    ) -> Result<SessionRecord, SessionError> {
        match self.sessions.get_record(app, session_handle).await? {
            Some(record) if !record.is_expired(self.clock.now_millis()) => Ok(record),
            _ => Err(SessionError::Unauthorised(
                "session does not exist or has expired".into(),
            )),
        }
    }

    async fn mint_access_token(
        &self,
        app: &AppScope,
        access: &AccessTokenInfo,
        use_static_key: bool,
    ) -> Result<IssuedToken, SessionError> {
        // Legacy generations carry no kid, so they can only use dynamic keys.
        let use_static_key = use_static_key && access.version.has_key_id();
        let key = self.keys.for_app(app).key_for_signing(use_static_key).await?;
        let token = encode_access_token(access, &key).map_err(internal)?;
        Ok(IssuedToken {
            token,
            expiry: access.expiry_time,
            created_time: access.time_created,
        })
    }

    /// Parse, enforce the caller's version ceiling and check the signature.
    /// Expiry is left to the caller.
    async fn open_access_token(
        &self,
        app: &AppScope,
        api: ApiVersion,
        token: &str,
    ) -> Result<(AccessTokenInfo, SigningKey), SessionError> {
        let envelope = AccessTokenEnvelope::parse(token).map_err(access_token_error)?;
        if envelope.version > api.max_access_token_version() {
            return Err(SessionError::TryRefreshToken(format!(
                "{} access token is newer than API {api} supports",
                envelope.version
            )));
        }

        let keys = self.keys.for_app(app);
        let key = match envelope.key_id.as_deref() {
            Some(kid) => keys
                .key_for_verification(kid)
                .await
                .map_err(|e| access_token_error(e.into()))?,
            None => find_legacy_key(&keys, &envelope).await?,
        };
        let access = envelope.verify(&key).map_err(access_token_error)?;
        Ok((access, key))
    }
}

/// V1 and V2 tokens name no key; try the dynamic keys newest first, then
/// once more after reloading them from storage.
async fn find_legacy_key(
    keys: &SigningKeyStore,
    envelope: &AccessTokenEnvelope,
) -> Result<SigningKey, SessionError> {
    let cached = keys.dynamic_keys().await?;
    if let Some(key) = cached.into_iter().find(|k| envelope.signature_valid(k)) {
        return Ok(key);
    }
    let reloaded = keys.reload_dynamic().await?;
    reloaded
        .into_iter()
        .find(|k| envelope.signature_valid(k))
        .ok_or_else(|| SessionError::Unauthorised("no signing key matches the access token".into()))
}

fn summary(access: &AccessTokenInfo) -> SessionSummary {
    SessionSummary {
        handle: access.session_handle.clone(),
        user_id: access.user_id.clone(),
        tenant_id: access.tenant_id.clone(),
        user_data_in_jwt: access.user_data.clone(),
    }
}

/// Failure of a presented access token.
fn access_token_error(e: TokenError) -> SessionError {
    match e {
        TokenError::UnsupportedVersion(v) => {
            SessionError::TryRefreshToken(format!("unsupported access token version {v}"))
        }
        TokenError::Expired => SessionError::TryRefreshToken("access token expired".into()),
        TokenError::InvalidSignature => {
            SessionError::Unauthorised("invalid access token signature".into())
        }
        TokenError::Malformed(msg) => {
            SessionError::Unauthorised(format!("malformed access token: {msg}"))
        }
        TokenError::Key(KeyError::NotFound(kid)) => {
            SessionError::Unauthorised(format!("unknown signing key {kid}"))
        }
        other => internal(other),
    }
}

/// Failure while producing a token.
fn internal(e: TokenError) -> SessionError {
    match e {
        TokenError::ProtectedClaim(name) => SessionError::ProtectedClaim(name),
        TokenError::Key(e) => SessionError::Key(e),
        TokenError::TheftDetected {
            session_handle,
            user_id,
        } => SessionError::TokenTheftDetected {
            session_handle,
            user_id,
        },
        other => SessionError::Internal(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use crate::token::AccessTokenVersion;

    struct Harness {
        engine: SessionEngine,
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
    }

    fn harness(config: SessionConfig) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let engine = SessionEngine::with_clock(
            config,
            Arc::clone(&store) as Arc<dyn SessionStore>,
            Arc::clone(&store) as Arc<dyn KeyStore>,
            Arc::clone(&clock) as Arc<dyn Clock>,
            Arc::new(NamedLocks::new()),
        );
        Harness {
            engine,
            store,
            clock,
        }
    }

    fn claims(value: serde_json::Value) -> Claims {
        value.as_object().cloned().unwrap_or_default()
    }

    fn new_session(user_id: &str) -> NewSession {
        NewSession {
            user_id: user_id.to_string(),
            user_data_in_jwt: claims(json!({"role": "user"})),
            user_data_in_database: claims(json!({"plan": "free"})),
            enable_anti_csrf: Some(false),
            use_static_key: None,
        }
    }

    #[tokio::test]
    async fn anti_csrf_is_checked_on_verify_when_asked() {
        let h = harness(SessionConfig::default());
        let scope = TenantScope::default();
        let created = h
            .engine
            .create_session(
                &scope,
                ApiVersion::LATEST,
                NewSession {
                    enable_anti_csrf: Some(true),
                    ..new_session("u1")
                },
            )
            .await
            .unwrap();
        let csrf = created.anti_csrf_token.as_deref();
        let token = created.access_token.token.as_str();
        let api = ApiVersion::LATEST;

        let missing = h
            .engine
            .verify_session(&scope, api, token, None, true, false)
            .await;
        assert!(matches!(missing, Err(SessionError::TryRefreshToken(_))));

        let wrong = h
            .engine
            .verify_session(&scope, api, token, Some("wrong"), true, false)
            .await;
        assert!(matches!(wrong, Err(SessionError::TryRefreshToken(_))));

        assert!(
            h.engine
                .verify_session(&scope, api, token, None, false, false)
                .await
                .is_ok()
        );
        assert!(
            h.engine
                .verify_session(&scope, api, token, csrf, true, false)
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn v1_tokens_enforce_anti_csrf() {
        let h = harness(SessionConfig::default());
        let scope = TenantScope::default();
        let api = ApiVersion::new(2, 8);
        let created = h
            .engine
            .create_session(
                &scope,
                api,
                NewSession {
                    enable_anti_csrf: Some(true),
                    ..new_session("u1")
                },
            )
            .await
            .unwrap();
        let token = created.access_token.token.as_str();
        assert_eq!(
            AccessTokenEnvelope::parse(token).unwrap().version,
            AccessTokenVersion::V1
        );

        let missing = h
            .engine
            .verify_session(&scope, api, token, None, true, true)
            .await;
        assert!(matches!(missing, Err(SessionError::TryRefreshToken(_))));
        let wrong = h
            .engine
            .verify_session(&scope, api, token, Some("wrong"), true, true)
            .await;
        assert!(matches!(wrong, Err(SessionError::TryRefreshToken(_))));
        assert!(
            h.engine
                .verify_session(&scope, api, token, created.anti_csrf_token.as_deref(), true, true)
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn anti_csrf_check_fails_closed_without_a_claim() {
        let h = harness(SessionConfig::default());
        let scope = TenantScope::default();
        let created = h
            .engine
            .create_session(&scope, ApiVersion::LATEST, new_session("u1"))
            .await
            .unwrap();
        assert!(created.anti_csrf_token.is_none());

        let err = h
            .engine
            .verify_session(
                &scope,
                ApiVersion::LATEST,
                &created.access_token.token,
                Some("anything"),
                true,
                false,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::TryRefreshToken(_)));
    }

    #[tokio::test]
    async fn refresh_issues_a_new_anti_csrf_token_only_when_enabled() {
        let h = harness(SessionConfig::default());
        let scope = TenantScope::default();
        let created = h
            .engine
            .create_session(
                &scope,
                ApiVersion::LATEST,
                NewSession {
                    enable_anti_csrf: Some(true),
                    ..new_session("u1")
                },
            )
            .await
            .unwrap();

        let disabled = h
            .engine
            .refresh_session(
                &scope,
                ApiVersion::LATEST,
                &created.refresh_token.token,
                None,
                false,
            )
            .await
            .unwrap();
        assert!(disabled.anti_csrf_token.is_none());
        let info = AccessTokenEnvelope::parse(&disabled.access_token.token)
            .unwrap()
            .payload_unverified()
            .unwrap();
        assert!(info.anti_csrf_token.is_none());

        let enabled = h
            .engine
            .refresh_session(
                &scope,
                ApiVersion::LATEST,
                &disabled.refresh_token.token,
                None,
                true,
            )
            .await
            .unwrap();
        let fresh = enabled.anti_csrf_token.clone().unwrap();
        assert_ne!(Some(fresh.as_str()), created.anti_csrf_token.as_deref());
        let info = AccessTokenEnvelope::parse(&enabled.access_token.token)
            .unwrap()
            .payload_unverified()
            .unwrap();
        assert_eq!(info.anti_csrf_token.as_deref(), Some(fresh.as_str()));
    }

    #[tokio::test]
    async fn expired_access_token_asks_for_refresh() {
        let h = harness(SessionConfig::default());
        let scope = TenantScope::default();
        let created = h
            .engine
            .create_session(&scope, ApiVersion::LATEST, new_session("u1"))
            .await
            .unwrap();

        h.clock.advance_millis(h.engine.config().access_token_validity_ms);
        let err = h
            .engine
            .verify_session(
                &scope,
                ApiVersion::LATEST,
                &created.access_token.token,
                None,
                false,
                false,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::TryRefreshToken(_)));
    }

    #[tokio::test]
    async fn blacklisting_config_forces_a_database_check() {
        let h = harness(SessionConfig {
            access_token_blacklisting: true,
            ..SessionConfig::default()
        });
        let scope = TenantScope::default();
        let created = h
            .engine
            .create_session(&scope, ApiVersion::LATEST, new_session("u1"))
            .await
            .unwrap();
        h.engine
            .revoke_session(&scope, &created.session.handle)
            .await
            .unwrap();

        let err = h
            .engine
            .verify_session(
                &scope,
                ApiVersion::LATEST,
                &created.access_token.token,
                None,
                false,
                false,
            )
            .await
            .unwrap_err();
        assert!(err.is_unauthorised());
    }

    #[tokio::test]
    async fn refresh_with_wrong_anti_csrf_is_unauthorised_without_revoking() {
        let h = harness(SessionConfig::default());
        let scope = TenantScope::default();
        let created = h
            .engine
            .create_session(
                &scope,
                ApiVersion::LATEST,
                NewSession {
                    enable_anti_csrf: Some(true),
                    ..new_session("u1")
                },
            )
            .await
            .unwrap();

        let err = h
            .engine
            .refresh_session(
                &scope,
                ApiVersion::LATEST,
                &created.refresh_token.token,
                Some("wrong"),
                true,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Unauthorised(_)));
        assert_eq!(h.store.session_count(&scope.app()).await, 1);

        let refreshed = h
            .engine
            .refresh_session(
                &scope,
                ApiVersion::LATEST,
                &created.refresh_token.token,
                created.anti_csrf_token.as_deref(),
                true,
            )
            .await
            .unwrap();
        assert!(refreshed.anti_csrf_token.is_some());
        assert_ne!(refreshed.anti_csrf_token, created.anti_csrf_token);
    }

    #[tokio::test]
    async fn garbage_refresh_token_does_not_revoke() {
        let h = harness(SessionConfig::default());
        let scope = TenantScope::default();
        h.engine
            .create_session(&scope, ApiVersion::LATEST, new_session("u1"))
            .await
            .unwrap();

        let err = h
            .engine
            .refresh_session(&scope, ApiVersion::LATEST, "not.a.token", None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Unauthorised(_)));
        assert_eq!(h.store.session_count(&scope.app()).await, 1);
    }

    #[tokio::test]
    async fn refresh_mints_at_the_callers_version() {
        let h = harness(SessionConfig::default());
        let scope = TenantScope::default();
        let created = h
            .engine
            .create_session(&scope, ApiVersion::new(2, 8), new_session("u1"))
            .await
            .unwrap();
        let first = AccessTokenEnvelope::parse(&created.access_token.token).unwrap();
        assert_eq!(first.version, AccessTokenVersion::V1);

        let refreshed = h
            .engine
            .refresh_session(
                &scope,
                ApiVersion::LATEST,
                &created.refresh_token.token,
                None,
                false,
            )
            .await
            .unwrap();
        let upgraded = AccessTokenEnvelope::parse(&refreshed.access_token.token).unwrap();
        assert_eq!(upgraded.version, AccessTokenVersion::V4);
    }

    #[tokio::test]
    async fn static_key_sessions_stay_on_the_static_key() {
        let h = harness(SessionConfig::default());
        let scope = TenantScope::default();
        let created = h
            .engine
            .create_session(
                &scope,
                ApiVersion::LATEST,
                NewSession {
                    use_static_key: Some(true),
                    ..new_session("u1")
                },
            )
            .await
            .unwrap();
        let kid = AccessTokenEnvelope::parse(&created.access_token.token)
            .unwrap()
            .key_id
            .unwrap();
        assert!(kid.starts_with("s-"));

        // Rotation of dynamic keys never re-signs static tokens.
        h.clock
            .advance_millis(h.engine.config().dynamic_key_update_interval_ms);
        let refreshed = h
            .engine
            .refresh_session(
                &scope,
                ApiVersion::LATEST,
                &created.refresh_token.token,
                None,
                false,
            )
            .await
            .unwrap();
        let refreshed_kid = AccessTokenEnvelope::parse(&refreshed.access_token.token)
            .unwrap()
            .key_id
            .unwrap();
        assert_eq!(refreshed_kid, kid);
    }

    #[tokio::test]
    async fn session_and_jwt_data_can_be_replaced() {
        let h = harness(SessionConfig::default());
        let scope = TenantScope::default();
        let created = h
            .engine
            .create_session(&scope, ApiVersion::LATEST, new_session("u1"))
            .await
            .unwrap();
        let handle = &created.session.handle;

        h.engine
            .update_session_data(&scope, handle, claims(json!({"plan": "pro"})))
            .await
            .unwrap();
        assert_eq!(
            h.engine.get_session_data(&scope, handle).await.unwrap(),
            claims(json!({"plan": "pro"}))
        );

        let err = h
            .engine
            .update_jwt_data(&scope, handle, claims(json!({"exp": 1})))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::ProtectedClaim(name) if name == "exp"));

        h.engine
            .update_jwt_data(&scope, handle, claims(json!({"role": "admin"})))
            .await
            .unwrap();
        let refreshed = h
            .engine
            .refresh_session(
                &scope,
                ApiVersion::LATEST,
                &created.refresh_token.token,
                None,
                false,
            )
            .await
            .unwrap();
        assert_eq!(
            refreshed.session.user_data_in_jwt,
            claims(json!({"role": "admin"}))
        );

        let missing = h
            .engine
            .update_session_data(&scope, "missing", Claims::new())
            .await;
        assert!(matches!(missing, Err(SessionError::Unauthorised(_))));
    }

    #[tokio::test]
    async fn expired_sessions_are_cleaned_up() {
        let h = harness(SessionConfig::default());
        let scope = TenantScope::default();
        h.engine
            .create_session(&scope, ApiVersion::LATEST, new_session("u1"))
            .await
            .unwrap();

        assert_eq!(h.engine.cleanup_expired_sessions(&scope.app()).await.unwrap(), 0);
        h.clock
            .advance_millis(h.engine.config().refresh_token_validity_ms + 1);
        assert_eq!(h.engine.cleanup_expired_sessions(&scope.app()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn key_discovery_lists_the_signing_key() {
        let h = harness(SessionConfig::default());
        let scope = TenantScope::default();
        let discovery = h.engine.key_discovery(&scope).await.unwrap();
        assert_eq!(discovery.keys.len(), 1);
        assert_eq!(discovery.keys[0].public_key, discovery.public_key);
        assert_eq!(
            discovery.expiry_time,
            discovery.keys[0].created_at + h.engine.config().dynamic_key_update_interval_ms
        );
    }
}
