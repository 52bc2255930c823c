//! # tessera_api
//!
//! Versioned request/response contract for the Tessera session engine.
//!
//! Handlers take a decoded request body plus the caller's [`RequestContext`]
//! and return the response body for that caller's API version. Routing and
//! transport are left to the embedding server.

pub mod error;
pub mod handlers;
pub mod models;

use std::sync::Arc;

use tessera_core::{ApiVersion, AppScope, SessionEngine, TenantScope};

use crate::error::{ApiError, ApiResult};

/// Shared state passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SessionEngine>,
}

impl AppState {
    pub fn new(engine: SessionEngine) -> Self {
        Self {
            engine: Arc::new(engine),
        }
    }
}

/// Who is calling and which contract version they speak.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub scope: TenantScope,
    pub api_version: ApiVersion,
}

impl RequestContext {
    pub fn new(scope: TenantScope, api_version: ApiVersion) -> Self {
        Self { scope, api_version }
    }

    /// Build a context from raw request parts. Missing app and tenant ids
    /// fall back to the public defaults; a missing version means the latest.
    pub fn from_parts(
        connection_uri_domain: &str,
        app_id: Option<&str>,
        tenant_id: Option<&str>,
        api_version: Option<&str>,
    ) -> ApiResult<Self> {
        let app = AppScope::new(
            connection_uri_domain,
            app_id.unwrap_or(tessera_core::scope::DEFAULT_APP_ID),
        );
        let scope = app.tenant(tenant_id.unwrap_or(tessera_core::scope::DEFAULT_TENANT_ID));
        let api_version = match api_version {
            Some(raw) => raw.parse().map_err(ApiError::from)?,
            None => ApiVersion::LATEST,
        };
        Ok(Self { scope, api_version })
    }
}

/// Crate version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
