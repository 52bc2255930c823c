//! # tessera_core
//!
//! Core session engine for Tessera.
//!
//! Issues, verifies, refreshes, regenerates and revokes sessions for a
//! multi-tenant authentication backend, and owns the signing keys behind the
//! access tokens.

pub mod clock;
pub mod config;
pub mod crypto;
pub mod keys;
pub mod lock;
pub mod scope;
pub mod session;
pub mod store;
pub mod token;

pub use config::SessionConfig;
pub use scope::{AppScope, TenantScope};
pub use session::{ApiVersion, SessionEngine, SessionError};

/// Returns the crate version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
