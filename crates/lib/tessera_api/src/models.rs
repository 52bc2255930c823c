//! Request and response bodies.
//!
//! Field names are camelCase on the wire. Fields that only some API versions
//! carry are `Option`s skipped when absent.

use serde::{Deserialize, Serialize};

use tessera_core::session::{
    IssuedToken, KeyDiscovery, PublicKeyInfo, SessionInformation, SessionSummary,
};
use tessera_core::store::Claims;

/// Outcome reported in every successful response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Ok,
    Unauthorised,
    TryRefreshToken,
}

/// Body of a 4xx/5xx response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

/// A non-OK outcome with its reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusMessage {
    pub status: Status,
    pub message: String,
}

impl StatusMessage {
    pub fn unauthorised(message: impl Into<String>) -> Self {
        Self {
            status: Status::Unauthorised,
            message: message.into(),
        }
    }

    pub fn try_refresh_token(message: impl Into<String>) -> Self {
        Self {
            status: Status::TryRefreshToken,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDto {
    pub handle: String,
    pub user_id: String,
    #[serde(rename = "userDataInJWT")]
    pub user_data_in_jwt: Claims,
    /// Only for API 4.0 and later.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
}

impl SessionDto {
    pub fn new(session: SessionSummary, include_tenant: bool) -> Self {
        Self {
            handle: session.handle,
            user_id: session.user_id,
            user_data_in_jwt: session.user_data_in_jwt,
            tenant_id: include_tenant.then_some(session.tenant_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenDto {
    pub token: String,
    pub expiry: i64,
    pub created_time: i64,
}

impl From<IssuedToken> for TokenDto {
    fn from(t: IssuedToken) -> Self {
        Self {
            token: t.token,
            expiry: t.expiry,
            created_time: t.created_time,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyDto {
    pub public_key: String,
    pub expiry_time: i64,
    pub created_at: i64,
}

impl From<PublicKeyInfo> for PublicKeyDto {
    fn from(k: PublicKeyInfo) -> Self {
        Self {
            public_key: k.public_key,
            expiry_time: k.expiry_time,
            created_at: k.created_at,
        }
    }
}

/// Signing-key fields bundled for callers older than API 3.0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyDiscoveryDto {
    pub jwt_signing_public_key: String,
    pub jwt_signing_public_key_expiry_time: i64,
    pub jwt_signing_public_key_list: Vec<PublicKeyDto>,
}

impl From<KeyDiscovery> for KeyDiscoveryDto {
    fn from(d: KeyDiscovery) -> Self {
        Self {
            jwt_signing_public_key: d.public_key,
            jwt_signing_public_key_expiry_time: d.expiry_time,
            jwt_signing_public_key_list: d.keys.into_iter().map(PublicKeyDto::from).collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Create / refresh
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub user_id: String,
    #[serde(rename = "userDataInJWT", default)]
    pub user_data_in_jwt: Claims,
    #[serde(default)]
    pub user_data_in_database: Claims,
    #[serde(default)]
    pub enable_anti_csrf: Option<bool>,
    #[serde(default)]
    pub use_static_key: Option<bool>,
}

/// Body returned by create and by a successful refresh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionTokensResponse {
    pub status: Status,
    pub session: SessionDto,
    pub access_token: TokenDto,
    pub refresh_token: TokenDto,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anti_csrf_token: Option<String>,
    #[serde(flatten)]
    pub signing_keys: Option<KeyDiscoveryDto>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshSessionRequest {
    pub refresh_token: String,
    #[serde(default)]
    pub anti_csrf_token: Option<String>,
    #[serde(default)]
    pub enable_anti_csrf: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RefreshSessionResponse {
    Refreshed(Box<SessionTokensResponse>),
    Failed(StatusMessage),
}

// ---------------------------------------------------------------------------
// Verify / regenerate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifySessionRequest {
    pub access_token: String,
    #[serde(default)]
    pub anti_csrf_token: Option<String>,
    #[serde(default)]
    pub do_anti_csrf_check: bool,
    #[serde(default)]
    pub check_database: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifySessionResponse {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionDto>,
    /// Set when the caller should replace the token it presented.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<TokenDto>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(flatten)]
    pub signing_keys: Option<KeyDiscoveryDto>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegenerateSessionRequest {
    pub access_token: String,
    #[serde(rename = "userDataInJWT", default)]
    pub user_data_in_jwt: Option<Claims>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegeneratedSession {
    pub status: Status,
    pub session: SessionDto,
    /// `null` when the presented access token had already expired.
    pub access_token: Option<TokenDto>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RegenerateSessionResponse {
    Regenerated(RegeneratedSession),
    Failed(StatusMessage),
}

// ---------------------------------------------------------------------------
// Revoke / lookup
// ---------------------------------------------------------------------------

/// Either `sessionHandles` or `userId` must be given, not both.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevokeSessionsRequest {
    #[serde(default)]
    pub session_handles: Option<Vec<String>>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub revoke_across_all_tenants: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevokeSessionsResponse {
    pub status: Status,
    pub session_handles_revoked: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSessionHandlesRequest {
    pub user_id: String,
    #[serde(default)]
    pub fetch_across_all_tenants: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSessionHandlesResponse {
    pub status: Status,
    pub session_handles: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionHandleRequest {
    pub session_handle: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInformationDto {
    pub status: Status,
    pub session_handle: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(rename = "userDataInJWT")]
    pub user_data_in_jwt: Claims,
    pub user_data_in_database: Claims,
    pub expiry: i64,
    pub time_created: i64,
}

impl SessionInformationDto {
    pub fn new(info: SessionInformation, include_tenant: bool) -> Self {
        Self {
            status: Status::Ok,
            session_handle: info.session_handle,
            user_id: info.user_id,
            tenant_id: include_tenant.then_some(info.tenant_id),
            user_data_in_jwt: info.user_data_in_jwt,
            user_data_in_database: info.user_data_in_database,
            expiry: info.expiry,
            time_created: info.time_created,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SessionInformationResponse {
    Found(Box<SessionInformationDto>),
    Failed(StatusMessage),
}

// ---------------------------------------------------------------------------
// Session and JWT data
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSessionDataRequest {
    pub session_handle: String,
    pub user_data_in_database: Claims,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateJwtDataRequest {
    pub session_handle: String,
    #[serde(rename = "userDataInJWT")]
    pub user_data_in_jwt: Claims,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDataResponse {
    pub status: Status,
    #[serde(rename = "userDataInDatabase", default, skip_serializing_if = "Option::is_none")]
    pub user_data_in_database: Option<Claims>,
    #[serde(rename = "userDataInJWT", default, skip_serializing_if = "Option::is_none")]
    pub user_data_in_jwt: Option<Claims>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl SessionDataResponse {
    pub fn ok() -> Self {
        Self {
            status: Status::Ok,
            user_data_in_database: None,
            user_data_in_jwt: None,
            message: None,
        }
    }

    pub fn unauthorised(message: impl Into<String>) -> Self {
        Self {
            status: Status::Unauthorised,
            message: Some(message.into()),
            ..Self::ok()
        }
    }
}
