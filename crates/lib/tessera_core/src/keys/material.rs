//! Ed25519 key generation and the stored key encoding.
//!
//! A stored key value is `base64(raw public key)|base64(pkcs8 document)`.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use ring::rand::SystemRandom;
use ring::signature::{Ed25519KeyPair, KeyPair};

use super::{ALGORITHM, KeyError, SigningKey};
use crate::store::KeyRecord;

/// Generate a fresh key pair and wrap it as a [`SigningKey`].
pub fn generate_signing_key(
    key_id: String,
    created_at: i64,
    expiry_time: Option<i64>,
    is_static: bool,
) -> Result<SigningKey, KeyError> {
    generate_with_record(key_id, created_at, expiry_time, is_static).map(|(key, _)| key)
}

/// Serialize key material for storage. Needs the pkcs8 document, so this is
/// only possible right after generation.
pub fn to_record(key: &SigningKey, pkcs8: &[u8]) -> KeyRecord {
    KeyRecord {
        key_id: key.key_id.clone(),
        value: format!(
            "{}|{}",
            STANDARD.encode(&key.public_key),
            STANDARD.encode(pkcs8)
        ),
        algorithm: ALGORITHM.to_string(),
        created_at: key.created_at,
    }
}

/// Generate a key pair and return both the usable key and its storable form.
pub fn generate_with_record(
    key_id: String,
    created_at: i64,
    expiry_time: Option<i64>,
    is_static: bool,
) -> Result<(SigningKey, KeyRecord), KeyError> {
    let rng = SystemRandom::new();
    let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng)
        .map_err(|_| KeyError::Generation("ed25519 pkcs8 generation failed".into()))?;
    let pair = Ed25519KeyPair::from_pkcs8(pkcs8.as_ref())
        .map_err(|e| KeyError::Generation(format!("generated key rejected: {e}")))?;
    let key = SigningKey::new(
        key_id,
        pair.public_key().as_ref().to_vec(),
        pkcs8.as_ref(),
        created_at,
        expiry_time,
        is_static,
    );
    let record = to_record(&key, pkcs8.as_ref());
    Ok((key, record))
}

/// Rebuild a [`SigningKey`] from storage, checking that both halves belong together.
pub fn from_record(
    record: &KeyRecord,
    expiry_time: Option<i64>,
    is_static: bool,
) -> Result<SigningKey, KeyError> {
    if record.algorithm != ALGORITHM {
        return Err(KeyError::InvalidKey(format!(
            "{}: unsupported algorithm {}",
            record.key_id, record.algorithm
        )));
    }
    let (public_b64, private_b64) = record
        .value
        .split_once('|')
        .ok_or_else(|| KeyError::InvalidKey(format!("{}: malformed key value", record.key_id)))?;
    let public_key = STANDARD
        .decode(public_b64)
        .map_err(|e| KeyError::InvalidKey(format!("{}: public key: {e}", record.key_id)))?;
    let pkcs8 = STANDARD
        .decode(private_b64)
        .map_err(|e| KeyError::InvalidKey(format!("{}: private key: {e}", record.key_id)))?;

    let pair = Ed25519KeyPair::from_pkcs8_maybe_unchecked(&pkcs8)
        .map_err(|e| KeyError::InvalidKey(format!("{}: {e}", record.key_id)))?;
    if pair.public_key().as_ref() != public_key.as_slice() {
        return Err(KeyError::InvalidKey(format!(
            "{}: public key does not match private key",
            record.key_id
        )));
    }

    Ok(SigningKey::new(
        record.key_id.clone(),
        public_key,
        &pkcs8,
        record.created_at,
        expiry_time,
        is_static,
    ))
}
