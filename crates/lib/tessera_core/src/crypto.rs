//! Hashing and symmetric encryption helpers.
//!
//! Refresh tokens are sealed with AES-256-GCM using random 12-byte nonces
//! (prepended to the ciphertext). Output is URL-safe base64 so it can sit in a
//! dotted token without escaping.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Nonce size for AES-256-GCM (12 bytes).
const NONCE_SIZE: usize = 12;
/// AES-256 key size (32 bytes).
const KEY_SIZE: usize = 32;
/// GCM tag size (16 bytes).
const TAG_SIZE: usize = 16;

/// Encryption errors.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Decryption error: {0}")]
    Decryption(String),
}

/// Lower-case hex SHA-256 of `input`.
pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Random secret suitable for [`encrypt`]/[`decrypt`] (64 hex chars).
pub fn generate_secret() -> String {
    let mut bytes = [0u8; KEY_SIZE];
    rand::rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Derive a 32-byte key from a secret using SHA-256.
fn derive_key(secret: &str) -> [u8; KEY_SIZE] {
    let digest = Sha256::digest(secret.as_bytes());
    let mut key = [0u8; KEY_SIZE];
    key.copy_from_slice(&digest);
    key
}

/// Encrypt plaintext with AES-256-GCM.
///
/// Returns URL-safe base64 of `nonce || ciphertext || tag`.
pub fn encrypt(plaintext: &[u8], secret: &str) -> Result<String, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(&derive_key(secret))
        .map_err(|e| CryptoError::Encryption(format!("key init failed: {e}")))?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| CryptoError::Encryption(format!("encryption failed: {e}")))?;

    let mut combined = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    combined.extend_from_slice(&nonce_bytes);
    combined.extend_from_slice(&ciphertext);
    Ok(URL_SAFE_NO_PAD.encode(&combined))
}

/// Decrypt URL-safe base64 `nonce || ciphertext || tag`.
pub fn decrypt(encrypted_b64: &str, secret: &str) -> Result<Vec<u8>, CryptoError> {
    let combined = URL_SAFE_NO_PAD
        .decode(encrypted_b64)
        .map_err(|e| CryptoError::Decryption(format!("base64 decode failed: {e}")))?;

    if combined.len() < NONCE_SIZE + TAG_SIZE {
        return Err(CryptoError::Decryption("ciphertext too short".into()));
    }

    let cipher = Aes256Gcm::new_from_slice(&derive_key(secret))
        .map_err(|e| CryptoError::Decryption(format!("key init failed: {e}")))?;

    let nonce = Nonce::from_slice(&combined[..NONCE_SIZE]);
    cipher
        .decrypt(nonce, &combined[NONCE_SIZE..])
        .map_err(|e| CryptoError::Decryption(format!("decryption failed: {e}")))
}
