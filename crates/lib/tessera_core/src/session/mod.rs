//! Session lifecycle: create, verify, refresh, regenerate and revoke.

pub mod engine;
pub mod protocol;

use serde::Serialize;
use thiserror::Error;

use crate::keys::KeyError;
use crate::store::{Claims, StoreError};

pub use engine::SessionEngine;
pub use protocol::ApiVersion;

/// Session operation errors.
///
/// `Unauthorised` and `TryRefreshToken` are outcomes the caller reports to
/// its client as typed statuses; `ProtectedClaim` and `Format` are caller
/// errors; the rest are internal faults.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Unauthorised: {0}")]
    Unauthorised(String),

    #[error("Try refresh token: {0}")]
    TryRefreshToken(String),

    /// A superseded refresh token was replayed; the session has been revoked.
    #[error("Token theft detected for session {session_handle}")]
    TokenTheftDetected {
        session_handle: String,
        user_id: String,
    },

    #[error("Protected claim cannot be set: {0}")]
    ProtectedClaim(String),

    #[error("Invalid input: {0}")]
    Format(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SessionError {
    /// Whether the client must sign in again.
    pub fn is_unauthorised(&self) -> bool {
        matches!(
            self,
            SessionError::Unauthorised(_) | SessionError::TokenTheftDetected { .. }
        )
    }
}

/// Parameters of a new session.
#[derive(Debug, Clone, Default)]
pub struct NewSession {
    pub user_id: String,
    pub user_data_in_jwt: Claims,
    pub user_data_in_database: Claims,
    /// `None` falls back to [`SessionConfig::anti_csrf`](crate::SessionConfig::anti_csrf).
    pub enable_anti_csrf: Option<bool>,
    /// `None` falls back to the inverse of
    /// [`SessionConfig::access_token_signing_key_dynamic`](crate::SessionConfig::access_token_signing_key_dynamic).
    pub use_static_key: Option<bool>,
}

/// Public view of a session as returned alongside tokens.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub handle: String,
    pub user_id: String,
    pub tenant_id: String,
    pub user_data_in_jwt: Claims,
}

/// A token with its validity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedToken {
    pub token: String,
    pub expiry: i64,
    pub created_time: i64,
}

/// Result of create and refresh.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionTokens {
    pub session: SessionSummary,
    pub access_token: IssuedToken,
    pub refresh_token: IssuedToken,
    pub anti_csrf_token: Option<String>,
}

/// Result of verify and regenerate. `access_token` is set only when the
/// caller should replace the token it presented.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedSession {
    pub session: SessionSummary,
    pub access_token: Option<IssuedToken>,
}

/// Everything stored about a session except its refresh hash.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInformation {
    pub session_handle: String,
    pub user_id: String,
    pub tenant_id: String,
    pub user_data_in_jwt: Claims,
    pub user_data_in_database: Claims,
    pub expiry: i64,
    pub time_created: i64,
}

/// Public signing key with its validity, for callers that predate JWKS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyInfo {
    pub public_key: String,
    pub expiry_time: i64,
    pub created_at: i64,
}

/// Signing-key fields bundled into responses for older callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDiscovery {
    /// Current dynamic signing key.
    pub public_key: String,
    pub expiry_time: i64,
    /// Every dynamic key still valid for verification, newest first.
    pub keys: Vec<PublicKeyInfo>,
}
