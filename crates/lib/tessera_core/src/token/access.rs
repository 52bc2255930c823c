//! Access token generations V1 to V4.
//!
//! | Version | Segments        | `kid` | Times   | Custom claims        | Tenant |
//! |---------|-----------------|-------|---------|----------------------|--------|
//! | V1      | standard base64 | no    | ms      | under `userData`     | no     |
//! | V2      | standard base64 | no    | ms      | under `userData`     | no     |
//! | V3      | base64url       | yes   | seconds | top level of payload | no     |
//! | V4      | base64url       | yes   | seconds | top level of payload | `tId`  |
//!
//! V2 adds `lmrt` to V1.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::TokenError;
use super::jwt::{self, JwtHeader, JwtParts, SegmentEncoding};
use crate::keys::{ALGORITHM, SigningKey};
use crate::scope::DEFAULT_TENANT_ID;
use crate::store::Claims;

/// Claim names the token format reserves for itself.
pub const PROTECTED_CLAIMS: &[&str] = &[
    "sub",
    "iat",
    "exp",
    "sessionHandle",
    "refreshTokenHash1",
    "parentRefreshTokenHash1",
    "antiCsrfToken",
    "tId",
    "lmrt",
];

/// Reject custom claims that would collide with a reserved name.
pub fn check_protected_claims(claims: &Claims) -> Result<(), TokenError> {
    match PROTECTED_CLAIMS.iter().find(|name| claims.contains_key(**name)) {
        Some(name) => Err(TokenError::ProtectedClaim((*name).to_string())),
        None => Ok(()),
    }
}

/// Access token generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AccessTokenVersion {
    V1,
    V2,
    V3,
    V4,
}

impl AccessTokenVersion {
    pub const LATEST: AccessTokenVersion = AccessTokenVersion::V4;

    pub fn number(self) -> u8 {
        match self {
            AccessTokenVersion::V1 => 1,
            AccessTokenVersion::V2 => 2,
            AccessTokenVersion::V3 => 3,
            AccessTokenVersion::V4 => 4,
        }
    }

    /// Parse the header's `version` field.
    pub fn from_header(version: &str) -> Option<Self> {
        match version {
            "1" => Some(AccessTokenVersion::V1),
            "2" => Some(AccessTokenVersion::V2),
            "3" => Some(AccessTokenVersion::V3),
            "4" => Some(AccessTokenVersion::V4),
            _ => None,
        }
    }

    /// V3 onwards name their signing key in the header.
    pub fn has_key_id(self) -> bool {
        self >= AccessTokenVersion::V3
    }

    fn encoding(self) -> SegmentEncoding {
        if self.has_key_id() {
            SegmentEncoding::UrlSafe
        } else {
            SegmentEncoding::Standard
        }
    }
}

impl fmt::Display for AccessTokenVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "V{}", self.number())
    }
}

/// Everything an access token asserts, independent of its wire generation.
///
/// Times are milliseconds since the epoch. Generations that lack a field
/// decode it as its default: `tenant_id` is `public` before V4 and `lmrt`
/// equals `time_created` in V1.
#[derive(Debug, Clone, PartialEq)]
pub struct AccessTokenInfo {
    pub version: AccessTokenVersion,
    pub session_handle: String,
    pub user_id: String,
    pub tenant_id: String,
    pub refresh_token_hash1: String,
    pub parent_refresh_token_hash1: Option<String>,
    pub anti_csrf_token: Option<String>,
    pub user_data: Claims,
    pub expiry_time: i64,
    pub time_created: i64,
    /// Last time the refresh chain moved.
    pub lmrt: i64,
}

impl AccessTokenInfo {
    pub fn is_expired(&self, now: i64) -> bool {
        self.expiry_time <= now
    }

    /// Drop sub-second precision from times the version stores in seconds,
    /// so that what was minted is exactly what decodes.
    pub fn normalized(mut self) -> Self {
        if self.version.has_key_id() {
            self.expiry_time = self.expiry_time.div_euclid(1000) * 1000;
            self.time_created = self.time_created.div_euclid(1000) * 1000;
        }
        self
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyPayload {
    session_handle: String,
    user_id: String,
    refresh_token_hash1: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parent_refresh_token_hash1: Option<String>,
    user_data: Claims,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    anti_csrf_token: Option<String>,
    expiry_time: i64,
    time_created: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    lmrt: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JwtPayload {
    sub: String,
    exp: i64,
    iat: i64,
    session_handle: String,
    refresh_token_hash1: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parent_refresh_token_hash1: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    anti_csrf_token: Option<String>,
    #[serde(rename = "tId", default, skip_serializing_if = "Option::is_none")]
    tenant_id: Option<String>,
    lmrt: i64,
    #[serde(flatten)]
    custom: Claims,
}

fn payload_for(info: &AccessTokenInfo) -> Result<serde_json::Value, TokenError> {
    let value = match info.version {
        AccessTokenVersion::V1 | AccessTokenVersion::V2 => {
            let v2 = info.version == AccessTokenVersion::V2;
            serde_json::to_value(LegacyPayload {
                session_handle: info.session_handle.clone(),
                user_id: info.user_id.clone(),
                refresh_token_hash1: info.refresh_token_hash1.clone(),
                parent_refresh_token_hash1: info.parent_refresh_token_hash1.clone(),
                user_data: info.user_data.clone(),
                anti_csrf_token: info.anti_csrf_token.clone(),
                expiry_time: info.expiry_time,
                time_created: info.time_created,
                lmrt: v2.then_some(info.lmrt),
            })
        }
        AccessTokenVersion::V3 | AccessTokenVersion::V4 => {
            check_protected_claims(&info.user_data)?;
            serde_json::to_value(JwtPayload {
                sub: info.user_id.clone(),
                exp: info.expiry_time.div_euclid(1000),
                iat: info.time_created.div_euclid(1000),
                session_handle: info.session_handle.clone(),
                refresh_token_hash1: info.refresh_token_hash1.clone(),
                parent_refresh_token_hash1: info.parent_refresh_token_hash1.clone(),
                anti_csrf_token: info.anti_csrf_token.clone(),
                tenant_id: (info.version == AccessTokenVersion::V4)
                    .then(|| info.tenant_id.clone()),
                lmrt: info.lmrt,
                custom: info.user_data.clone(),
            })
        }
    };
    value.map_err(|e| TokenError::Malformed(format!("payload: {e}")))
}

/// Serialize and sign `info` in the generation named by `info.version`.
///
/// V3 and V4 carry `key.key_id` as `kid`; V1 and V2 must be signed with a
/// dynamic key because verifiers find their key by trial.
pub fn encode_access_token(info: &AccessTokenInfo, key: &SigningKey) -> Result<String, TokenError> {
    if !info.version.has_key_id() && key.is_static {
        return Err(TokenError::UnsupportedVersion(format!(
            "{} tokens cannot be signed with the static key",
            info.version
        )));
    }
    let header = JwtHeader {
        alg: ALGORITHM.to_string(),
        typ: "JWT".to_string(),
        version: Some(info.version.number().to_string()),
        kid: info.version.has_key_id().then(|| key.key_id.clone()),
    };
    let payload = payload_for(info)?;
    jwt::sign(&header, &payload, info.version.encoding(), key)
}

/// A token whose header has been read but whose signature is not yet checked.
#[derive(Debug, Clone)]
pub struct AccessTokenEnvelope {
    token: String,
    pub version: AccessTokenVersion,
    pub key_id: Option<String>,
}

impl AccessTokenEnvelope {
    /// Structural pre-parse: split the token and read version and `kid`.
    ///
    /// Fails with [`TokenError::UnsupportedVersion`] for a generation this
    /// build does not know and [`TokenError::Malformed`] for anything else
    /// that is not a well-formed token of a known generation.
    pub fn parse(token: &str) -> Result<Self, TokenError> {
        let parts = JwtParts::split(token)?;
        let header = jwt::peek_header(parts.header)?;
        let raw_version = header
            .version
            .as_deref()
            .ok_or_else(|| TokenError::Malformed("header has no version".into()))?;
        let version = AccessTokenVersion::from_header(raw_version)
            .ok_or_else(|| TokenError::UnsupportedVersion(raw_version.to_string()))?;

        if header.alg != ALGORITHM {
            return Err(TokenError::Malformed(format!(
                "unexpected algorithm {}",
                header.alg
            )));
        }
        // Re-read under the version's own encoding.
        version.encoding().decode(parts.header)?;
        let key_id = match (version.has_key_id(), header.kid) {
            (true, Some(kid)) => Some(kid),
            (true, None) => return Err(TokenError::Malformed("header has no kid".into())),
            (false, _) => None,
        };

        Ok(Self {
            token: token.to_string(),
            version,
            key_id,
        })
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn signature_valid(&self, key: &SigningKey) -> bool {
        JwtParts::split(&self.token)
            .map(|parts| jwt::verify_signature(&parts, self.version.encoding(), key))
            .unwrap_or(false)
    }

    /// Check the signature against `key`, then decode the payload.
    pub fn verify(&self, key: &SigningKey) -> Result<AccessTokenInfo, TokenError> {
        if !self.signature_valid(key) {
            return Err(TokenError::InvalidSignature);
        }
        self.payload_unverified()
    }

    /// Decode the payload without looking at the signature.
    pub fn payload_unverified(&self) -> Result<AccessTokenInfo, TokenError> {
        let parts = JwtParts::split(&self.token)?;
        let bytes = self.version.encoding().decode(parts.payload)?;
        let malformed = |e: serde_json::Error| TokenError::Malformed(format!("payload: {e}"));

        let info = match self.version {
            AccessTokenVersion::V1 | AccessTokenVersion::V2 => {
                let payload: LegacyPayload = serde_json::from_slice(&bytes).map_err(malformed)?;
                let v2 = self.version == AccessTokenVersion::V2;
                AccessTokenInfo {
                    version: self.version,
                    session_handle: payload.session_handle,
                    user_id: payload.user_id,
                    tenant_id: DEFAULT_TENANT_ID.to_string(),
                    refresh_token_hash1: payload.refresh_token_hash1,
                    parent_refresh_token_hash1: payload.parent_refresh_token_hash1,
                    anti_csrf_token: payload.anti_csrf_token,
                    user_data: payload.user_data,
                    expiry_time: payload.expiry_time,
                    time_created: payload.time_created,
                    lmrt: payload
                        .lmrt
                        .filter(|_| v2)
                        .unwrap_or(payload.time_created),
                }
            }
            AccessTokenVersion::V3 | AccessTokenVersion::V4 => {
                let payload: JwtPayload = serde_json::from_slice(&bytes).map_err(malformed)?;
                let tenant_id = match (self.version, payload.tenant_id) {
                    (AccessTokenVersion::V4, Some(tenant)) => tenant,
                    (AccessTokenVersion::V4, None) => {
                        return Err(TokenError::Malformed("missing tId".into()));
                    }
                    _ => DEFAULT_TENANT_ID.to_string(),
                };
                AccessTokenInfo {
                    version: self.version,
                    session_handle: payload.session_handle,
                    user_id: payload.sub,
                    tenant_id,
                    refresh_token_hash1: payload.refresh_token_hash1,
                    parent_refresh_token_hash1: payload.parent_refresh_token_hash1,
                    anti_csrf_token: payload.anti_csrf_token,
                    user_data: payload.custom,
                    expiry_time: payload.exp * 1000,
                    time_created: payload.iat * 1000,
                    lmrt: payload.lmrt,
                }
            }
        };
        Ok(info)
    }
}

/// Parse, check the signature against `key` and reject expired tokens.
pub fn verify_access_token(
    token: &str,
    key: &SigningKey,
    now: i64,
) -> Result<AccessTokenInfo, TokenError> {
    let info = AccessTokenEnvelope::parse(token)?.verify(key)?;
    if info.is_expired(now) {
        return Err(TokenError::Expired);
    }
    Ok(info)
}
