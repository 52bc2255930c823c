//! Structural JWT handling: splitting, segment encodings and signatures.
//!
//! Legacy tokens (V1, V2) encode every segment with standard base64; V3 onwards
//! uses URL-safe base64 without padding. The header is decoded leniently first
//! so the version can be read before the strict per-version rules apply.

use base64::Engine;
use base64::alphabet;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use serde::{Deserialize, Serialize};

use super::TokenError;
use crate::keys::SigningKey;

const LENIENT_STANDARD: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

const LENIENT_URL_SAFE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Segment encoding of a token generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentEncoding {
    Standard,
    UrlSafe,
}

impl SegmentEncoding {
    pub fn encode(self, bytes: &[u8]) -> String {
        match self {
            SegmentEncoding::Standard => STANDARD.encode(bytes),
            SegmentEncoding::UrlSafe => URL_SAFE_NO_PAD.encode(bytes),
        }
    }

    pub fn decode(self, segment: &str) -> Result<Vec<u8>, TokenError> {
        let decoded = match self {
            SegmentEncoding::Standard => LENIENT_STANDARD.decode(segment),
            SegmentEncoding::UrlSafe => URL_SAFE_NO_PAD.decode(segment),
        };
        decoded.map_err(|e| TokenError::Malformed(format!("segment encoding: {e}")))
    }
}

/// JWT header as written by every token generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwtHeader {
    pub alg: String,
    pub typ: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
}

/// A token split into its three segments.
#[derive(Debug, Clone, Copy)]
pub struct JwtParts<'a> {
    pub header: &'a str,
    pub payload: &'a str,
    pub signature: &'a str,
}

impl<'a> JwtParts<'a> {
    pub fn split(token: &'a str) -> Result<Self, TokenError> {
        let mut parts = token.split('.');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(header), Some(payload), Some(signature), None)
                if !header.is_empty() && !payload.is_empty() && !signature.is_empty() =>
            {
                Ok(Self {
                    header,
                    payload,
                    signature,
                })
            }
            _ => Err(TokenError::Malformed("expected three dot-separated segments".into())),
        }
    }

    /// The bytes covered by the signature.
    pub fn signing_input(&self) -> String {
        format!("{}.{}", self.header, self.payload)
    }
}

/// Read the header without committing to a segment encoding.
pub fn peek_header(header_segment: &str) -> Result<JwtHeader, TokenError> {
    let bytes = LENIENT_URL_SAFE
        .decode(header_segment)
        .or_else(|_| LENIENT_STANDARD.decode(header_segment))
        .map_err(|e| TokenError::Malformed(format!("header encoding: {e}")))?;
    serde_json::from_slice(&bytes).map_err(|e| TokenError::Malformed(format!("header: {e}")))
}

/// Sign `header.payload` and return the whole token.
pub fn sign(
    header: &JwtHeader,
    payload: &serde_json::Value,
    encoding: SegmentEncoding,
    key: &SigningKey,
) -> Result<String, TokenError> {
    let header_json =
        serde_json::to_vec(header).map_err(|e| TokenError::Malformed(format!("header: {e}")))?;
    let payload_json =
        serde_json::to_vec(payload).map_err(|e| TokenError::Malformed(format!("payload: {e}")))?;
    let signing_input = format!(
        "{}.{}",
        encoding.encode(&header_json),
        encoding.encode(&payload_json)
    );

    let signature = key.sign(signing_input.as_bytes())?;
    let signature = match encoding {
        SegmentEncoding::UrlSafe => signature,
        SegmentEncoding::Standard => {
            let raw = URL_SAFE_NO_PAD
                .decode(&signature)
                .map_err(|e| TokenError::Malformed(format!("signature encoding: {e}")))?;
            STANDARD.encode(raw)
        }
    };
    Ok(format!("{signing_input}.{signature}"))
}

/// Check the signature segment of `parts` against `key`.
pub fn verify_signature(parts: &JwtParts<'_>, encoding: SegmentEncoding, key: &SigningKey) -> bool {
    let signature = match encoding {
        SegmentEncoding::UrlSafe => parts.signature.to_string(),
        SegmentEncoding::Standard => match LENIENT_STANDARD.decode(parts.signature) {
            Ok(raw) => URL_SAFE_NO_PAD.encode(raw),
            Err(_) => return false,
        },
    };
    key.verify(&signature, parts.signing_input().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::material;

    fn header(version: &str) -> JwtHeader {
        JwtHeader {
            alg: "EdDSA".into(),
            typ: "JWT".into(),
            version: Some(version.into()),
            kid: None,
        }
    }

    #[test]
    fn split_requires_three_segments() {
        assert!(JwtParts::split("a.b.c").is_ok());
        assert!(JwtParts::split("a.b").is_err());
        assert!(JwtParts::split("a.b.c.d").is_err());
        assert!(JwtParts::split("a..c").is_err());
    }

    #[test]
    fn header_is_readable_in_either_encoding() {
        let json = serde_json::to_vec(&header("2")).unwrap();
        let standard = SegmentEncoding::Standard.encode(&json);
        let url = SegmentEncoding::UrlSafe.encode(&json);
        assert_eq!(peek_header(&standard).unwrap().version.as_deref(), Some("2"));
        assert_eq!(peek_header(&url).unwrap().version.as_deref(), Some("2"));
        assert!(peek_header("%%%").is_err());
    }

    #[test]
    fn signed_token_verifies_in_both_encodings() {
        let key = material::generate_signing_key("d-1".into(), 0, None, false).unwrap();
        let payload = serde_json::json!({"a": 1});
        for encoding in [SegmentEncoding::Standard, SegmentEncoding::UrlSafe] {
            let token = sign(&header("1"), &payload, encoding, &key).unwrap();
            let parts = JwtParts::split(&token).unwrap();
            assert!(verify_signature(&parts, encoding, &key));
        }
    }

    #[test]
    fn tampered_payload_fails_verification() {
        let key = material::generate_signing_key("d-1".into(), 0, None, false).unwrap();
        let token = sign(
            &header("3"),
            &serde_json::json!({"sub": "u1"}),
            SegmentEncoding::UrlSafe,
            &key,
        )
        .unwrap();
        let parts = JwtParts::split(&token).unwrap();
        let forged_payload = SegmentEncoding::UrlSafe.encode(br#"{"sub":"admin"}"#);
        let forged = JwtParts {
            payload: &forged_payload,
            ..parts
        };
        assert!(!verify_signature(&forged, SegmentEncoding::UrlSafe, &key));
    }
}
