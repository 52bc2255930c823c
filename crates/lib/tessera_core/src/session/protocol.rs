//! Caller-declared API versions and the token generations they map to.

use std::fmt;
use std::str::FromStr;

use super::SessionError;
use crate::token::AccessTokenVersion;

/// `major.minor` API version declared by the caller of every operation.
///
/// | API version | Mints | Accepts up to |
/// |-------------|-------|---------------|
/// | < 2.9       | V1    | V2            |
/// | 2.9 – 2.21  | V2    | V2            |
/// | 3.x         | V3    | V4            |
/// | ≥ 4.0       | V4    | V4            |
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ApiVersion {
    pub major: u32,
    pub minor: u32,
}

impl ApiVersion {
    pub const V2_9: ApiVersion = ApiVersion::new(2, 9);
    pub const V3_0: ApiVersion = ApiVersion::new(3, 0);
    pub const V4_0: ApiVersion = ApiVersion::new(4, 0);
    pub const LATEST: ApiVersion = ApiVersion::V4_0;

    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Generation minted for this caller by create, refresh and regenerate.
    pub fn access_token_version(self) -> AccessTokenVersion {
        if self >= Self::V4_0 {
            AccessTokenVersion::V4
        } else if self >= Self::V3_0 {
            AccessTokenVersion::V3
        } else if self >= Self::V2_9 {
            AccessTokenVersion::V2
        } else {
            AccessTokenVersion::V1
        }
    }

    /// Newest generation this caller may present to verify or regenerate.
    pub fn max_access_token_version(self) -> AccessTokenVersion {
        if self >= Self::V3_0 {
            AccessTokenVersion::V4
        } else {
            AccessTokenVersion::V2
        }
    }

    /// Responses name the session's tenant.
    pub fn includes_tenant_id(self) -> bool {
        self >= Self::V4_0
    }

    /// Responses bundle the legacy signing-key fields instead of relying on JWKS.
    pub fn includes_signing_keys(self) -> bool {
        self < Self::V3_0
    }
}

impl Default for ApiVersion {
    fn default() -> Self {
        Self::LATEST
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for ApiVersion {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SessionError::Format(format!("invalid API version: {s:?}"));
        let (major, minor) = s.trim().split_once('.').ok_or_else(invalid)?;
        Ok(Self::new(
            major.parse().map_err(|_| invalid())?,
            minor.parse().map_err(|_| invalid())?,
        ))
    }
}
