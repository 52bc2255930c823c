//! Refresh tokens and the hash chain that links them.
//!
//! A refresh token is `<sealed>.<nonce>.V1` or `<sealed>.<nonce>.V2`, where
//! `sealed` is the AES-GCM encryption (under the app's refresh-token secret)
//! of a JSON body that repeats the nonce. V2 bodies also carry the `hash2` of
//! the token they replaced and the session's anti-CSRF token.
//!
//! Sessions store only `hash2 = sha256(sha256(token))` of their current token.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::TokenError;
use crate::crypto;

/// Refresh token generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RefreshTokenVersion {
    V1,
    V2,
}

impl RefreshTokenVersion {
    fn suffix(self) -> &'static str {
        match self {
            RefreshTokenVersion::V1 => "V1",
            RefreshTokenVersion::V2 => "V2",
        }
    }

    fn from_suffix(suffix: &str) -> Option<Self> {
        match suffix {
            "V1" => Some(RefreshTokenVersion::V1),
            "V2" => Some(RefreshTokenVersion::V2),
            _ => None,
        }
    }
}

impl fmt::Display for RefreshTokenVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

/// Decrypted contents of a refresh token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshTokenInfo {
    pub version: RefreshTokenVersion,
    pub session_handle: String,
    pub user_id: String,
    pub nonce: String,
    pub parent_refresh_token_hash2: Option<String>,
    pub anti_csrf_token: Option<String>,
}

/// A freshly minted refresh token with its chain hashes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MintedRefreshToken {
    pub token: String,
    pub hash1: String,
    pub hash2: String,
}

/// Where a presented token sits relative to the session's stored hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainPosition {
    /// The token is the session's current link.
    Current,
    /// The token was minted from the current link but never promoted.
    ChildOfCurrent,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SealedBody {
    session_handle: String,
    user_id: String,
    nonce: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parent_refresh_token_hash2: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    anti_csrf_token: Option<String>,
}

/// `sha256(token)`, carried in access tokens.
pub fn hash1(token: &str) -> String {
    crypto::sha256_hex(token)
}

/// `sha256(sha256(token))`, stored on the session.
pub fn hash2(token: &str) -> String {
    crypto::sha256_hex(&hash1(token))
}

/// Mints, opens and validates refresh tokens of one app.
pub struct RefreshChain {
    secret: String,
}

impl RefreshChain {
    pub fn new(secret: String) -> Self {
        Self { secret }
    }

    /// Mint a V2 token. `parent_hash2` is `None` for the root of a chain.
    pub fn mint(
        &self,
        session_handle: &str,
        user_id: &str,
        parent_hash2: Option<&str>,
        anti_csrf_token: Option<&str>,
    ) -> Result<MintedRefreshToken, TokenError> {
        self.mint_version(
            RefreshTokenVersion::V2,
            session_handle,
            user_id,
            parent_hash2,
            anti_csrf_token,
        )
    }

    /// Mint a token of a specific generation. V1 drops the parent hash and
    /// the anti-CSRF token.
    pub fn mint_version(
        &self,
        version: RefreshTokenVersion,
        session_handle: &str,
        user_id: &str,
        parent_hash2: Option<&str>,
        anti_csrf_token: Option<&str>,
    ) -> Result<MintedRefreshToken, TokenError> {
        let v2 = version == RefreshTokenVersion::V2;
        let nonce = Uuid::new_v4().simple().to_string();
        let body = SealedBody {
            session_handle: session_handle.to_string(),
            user_id: user_id.to_string(),
            nonce: nonce.clone(),
            parent_refresh_token_hash2: parent_hash2.filter(|_| v2).map(str::to_string),
            anti_csrf_token: anti_csrf_token.filter(|_| v2).map(str::to_string),
        };
        let plaintext = serde_json::to_vec(&body)
            .map_err(|e| TokenError::Malformed(format!("refresh token body: {e}")))?;
        let sealed = crypto::encrypt(&plaintext, &self.secret)?;

        let token = format!("{sealed}.{nonce}.{}", version.suffix());
        let hash1 = hash1(&token);
        let hash2 = crypto::sha256_hex(&hash1);
        Ok(MintedRefreshToken {
            token,
            hash1,
            hash2,
        })
    }

    /// Decrypt a token. Any failure is a format error.
    pub fn open(&self, token: &str) -> Result<RefreshTokenInfo, TokenError> {
        let mut parts = token.split('.');
        let (sealed, nonce, version) = match (parts.next(), parts.next(), parts.next(), parts.next())
        {
            (Some(sealed), Some(nonce), Some(suffix), None)
                if !sealed.is_empty() && !nonce.is_empty() =>
            {
                let version = RefreshTokenVersion::from_suffix(suffix).ok_or_else(|| {
                    TokenError::Malformed(format!("unknown refresh token version {suffix}"))
                })?;
                (sealed, nonce, version)
            }
            _ => return Err(TokenError::Malformed("refresh token shape".into())),
        };

        let plaintext = crypto::decrypt(sealed, &self.secret)
            .map_err(|e| TokenError::Malformed(format!("refresh token: {e}")))?;
        let body: SealedBody = serde_json::from_slice(&plaintext)
            .map_err(|e| TokenError::Malformed(format!("refresh token body: {e}")))?;
        if body.nonce != nonce {
            return Err(TokenError::Malformed("refresh token nonce mismatch".into()));
        }

        let v2 = version == RefreshTokenVersion::V2;
        Ok(RefreshTokenInfo {
            version,
            session_handle: body.session_handle,
            user_id: body.user_id,
            nonce: body.nonce,
            parent_refresh_token_hash2: body.parent_refresh_token_hash2.filter(|_| v2),
            anti_csrf_token: body.anti_csrf_token.filter(|_| v2),
        })
    }

    /// Place an opened token on the chain whose current link hashes to
    /// `stored_hash2`. Anything else is a replay of a superseded link.
    pub fn validate(
        token: &str,
        info: &RefreshTokenInfo,
        stored_hash2: &str,
    ) -> Result<ChainPosition, TokenError> {
        if hash2(token) == stored_hash2 {
            return Ok(ChainPosition::Current);
        }
        if info.parent_refresh_token_hash2.as_deref() == Some(stored_hash2) {
            return Ok(ChainPosition::ChildOfCurrent);
        }
        Err(TokenError::TheftDetected {
            session_handle: info.session_handle.clone(),
            user_id: info.user_id.clone(),
        })
    }
}
