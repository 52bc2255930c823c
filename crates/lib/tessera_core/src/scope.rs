//! Tenant and app scoping.
//!
//! Sessions and signing keys are partitioned per app; a session remembers the
//! tenant it was created under so that tenant-scoped queries can filter on it.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Tenant id used when the caller does not name one.
pub const DEFAULT_TENANT_ID: &str = "public";

/// App id used when the caller does not name one.
pub const DEFAULT_APP_ID: &str = "public";

/// `(connection uri domain, app id)`: the partition that owns sessions and keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AppScope {
    pub connection_uri_domain: String,
    pub app_id: String,
}

impl AppScope {
    pub fn new(connection_uri_domain: impl Into<String>, app_id: impl Into<String>) -> Self {
        Self {
            connection_uri_domain: connection_uri_domain.into(),
            app_id: app_id.into(),
        }
    }

    /// Build a tenant scope inside this app.
    pub fn tenant(&self, tenant_id: impl Into<String>) -> TenantScope {
        TenantScope {
            connection_uri_domain: self.connection_uri_domain.clone(),
            app_id: self.app_id.clone(),
            tenant_id: tenant_id.into(),
        }
    }

    /// Name for an in-process lock guarding `purpose` within this app.
    pub fn lock_name(&self, purpose: &str) -> String {
        format!("{}|{}|{purpose}", self.connection_uri_domain, self.app_id)
    }
}

impl Default for AppScope {
    fn default() -> Self {
        Self::new("", DEFAULT_APP_ID)
    }
}

impl fmt::Display for AppScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.connection_uri_domain.is_empty() {
            write!(f, "{}", self.app_id)
        } else {
            write!(f, "{}/{}", self.connection_uri_domain, self.app_id)
        }
    }
}

/// `(connection uri domain, app id, tenant id)` supplied with every request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantScope {
    pub connection_uri_domain: String,
    pub app_id: String,
    pub tenant_id: String,
}

impl TenantScope {
    pub fn new(
        connection_uri_domain: impl Into<String>,
        app_id: impl Into<String>,
        tenant_id: impl Into<String>,
    ) -> Self {
        Self {
            connection_uri_domain: connection_uri_domain.into(),
            app_id: app_id.into(),
            tenant_id: tenant_id.into(),
        }
    }

    /// The app this tenant belongs to.
    pub fn app(&self) -> AppScope {
        AppScope::new(self.connection_uri_domain.clone(), self.app_id.clone())
    }

    /// Whether `other` shares this scope's app.
    pub fn same_app(&self, other: &TenantScope) -> bool {
        self.connection_uri_domain == other.connection_uri_domain && self.app_id == other.app_id
    }
}

impl Default for TenantScope {
    fn default() -> Self {
        AppScope::default().tenant(DEFAULT_TENANT_ID)
    }
}

impl fmt::Display for TenantScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.app(), self.tenant_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_scope_is_public() {
        let scope = TenantScope::default();
        assert_eq!(scope.app_id, "public");
        assert_eq!(scope.tenant_id, "public");
        assert_eq!(scope.to_string(), "public/public");
    }

    #[test]
    fn tenants_of_one_app_share_the_app_scope() {
        let app = AppScope::new("", "a1");
        let t1 = app.tenant("t1");
        let t2 = app.tenant("t2");
        assert!(t1.same_app(&t2));
        assert_eq!(t1.app(), t2.app());
        assert!(!t1.same_app(&AppScope::new("", "a2").tenant("t1")));
    }

    #[test]
    fn lock_name_includes_domain_and_purpose() {
        let app = AppScope::new("auth.example.com", "a1");
        assert_eq!(app.lock_name("keys"), "auth.example.com|a1|keys");
    }
}
