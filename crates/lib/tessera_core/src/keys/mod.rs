//! Access-token signing keys and the refresh-token secret.
//!
//! Every app owns one static Ed25519 key (created on first use, never rotated)
//! and a series of dynamic keys that rotate on a fixed interval. The newest
//! dynamic key signs; every dynamic key younger than
//! [`SessionConfig::dynamic_key_lifetime_ms`](crate::SessionConfig::dynamic_key_lifetime_ms)
//! still verifies.

pub mod material;
pub mod refresh_key;
pub mod signing;

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::StoreError;

pub use refresh_key::RefreshKeyCache;
pub use signing::{KeyRegistry, SigningKeyStore};

/// JWT `alg` of every signing key.
pub const ALGORITHM: &str = "EdDSA";

/// Key id prefix of the static key.
pub const STATIC_KEY_PREFIX: &str = "s-";

/// Key id prefix of dynamic keys.
pub const DYNAMIC_KEY_PREFIX: &str = "d-";

/// Key management errors.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("Key generation failed: {0}")]
    Generation(String),

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Signing key not found: {0}")]
    NotFound(String),

    #[error("Signing failed: {0}")]
    Signing(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One Ed25519 key pair together with its identity and validity window.
#[derive(Clone)]
pub struct SigningKey {
    pub key_id: String,
    /// Raw 32-byte public key.
    pub public_key: Vec<u8>,
    pub created_at: i64,
    /// `None` for the static key.
    pub expiry_time: Option<i64>,
    pub is_static: bool,
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("key_id", &self.key_id)
            .field("created_at", &self.created_at)
            .field("expiry_time", &self.expiry_time)
            .field("is_static", &self.is_static)
            .finish_non_exhaustive()
    }
}

impl SigningKey {
    pub(crate) fn new(
        key_id: String,
        public_key: Vec<u8>,
        pkcs8: &[u8],
        created_at: i64,
        expiry_time: Option<i64>,
        is_static: bool,
    ) -> Self {
        let encoding = EncodingKey::from_ed_der(pkcs8);
        let decoding = DecodingKey::from_ed_der(&public_key);
        Self {
            key_id,
            public_key,
            created_at,
            expiry_time,
            is_static,
            encoding,
            decoding,
        }
    }

    /// Sign `message`; the signature comes back as URL-safe base64 without padding.
    pub fn sign(&self, message: &[u8]) -> Result<String, KeyError> {
        jsonwebtoken::crypto::sign(message, &self.encoding, Algorithm::EdDSA)
            .map_err(|e| KeyError::Signing(e.to_string()))
    }

    /// Check a URL-safe base64 signature over `message`.
    pub fn verify(&self, signature: &str, message: &[u8]) -> bool {
        jsonwebtoken::crypto::verify(signature, message, &self.decoding, Algorithm::EdDSA)
            .unwrap_or(false)
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expiry_time.is_some_and(|expiry| expiry <= now)
    }

    /// Standard base64 of the raw public key, as handed to older clients.
    pub fn public_key_base64(&self) -> String {
        STANDARD.encode(&self.public_key)
    }

    pub fn to_jwk(&self) -> Jwk {
        Jwk {
            kty: "OKP".to_string(),
            crv: "Ed25519".to_string(),
            alg: ALGORITHM.to_string(),
            key_use: "sig".to_string(),
            kid: self.key_id.clone(),
            x: URL_SAFE_NO_PAD.encode(&self.public_key),
        }
    }
}

/// Public half of a signing key in JSON Web Key form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    pub crv: String,
    pub alg: String,
    #[serde(rename = "use")]
    pub key_use: String,
    pub kid: String,
    pub x: String,
}

/// A JSON Web Key Set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwks {
    pub keys: Vec<Jwk>,
}
