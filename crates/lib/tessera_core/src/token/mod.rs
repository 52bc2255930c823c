//! Access and refresh token formats.
//!
//! Access tokens are EdDSA-signed JWTs in four generations ([`AccessTokenVersion`]).
//! Refresh tokens are AES-GCM sealed blobs in two generations
//! ([`RefreshTokenVersion`]) linked into a hash chain by [`RefreshChain`].

pub mod access;
pub mod jwt;
pub mod refresh;

use thiserror::Error;

use crate::crypto::CryptoError;
use crate::keys::KeyError;

pub use access::{
    AccessTokenEnvelope, AccessTokenInfo, AccessTokenVersion, PROTECTED_CLAIMS,
    check_protected_claims, encode_access_token, verify_access_token,
};
pub use refresh::{
    ChainPosition, MintedRefreshToken, RefreshChain, RefreshTokenInfo, RefreshTokenVersion,
};

/// Token encoding and validation errors.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("Malformed token: {0}")]
    Malformed(String),

    #[error("Unsupported token version: {0}")]
    UnsupportedVersion(String),

    #[error("Invalid token signature")]
    InvalidSignature,

    #[error("Token expired")]
    Expired,

    #[error("Protected claim cannot be set: {0}")]
    ProtectedClaim(String),

    #[error("Refresh token reuse detected for session {session_handle}")]
    TheftDetected {
        session_handle: String,
        user_id: String,
    },

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}
