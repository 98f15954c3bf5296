//! # Security & tenancy collaborators
//!
//! The curator consults two collaborators before returning or accepting
//! anything on behalf of a caller:
//!
//! - [`SecurityGuard::check_permissions`]: may this caller perform `action`
//!   on `resource`?
//! - [`TenantValidator::validate_tenant_access`]: is this tenant allowed to
//!   use the platform at all?
//!
//! Both are injected into the facade at construction time. List operations
//! turn a failed check into an empty result; get/register operations turn it
//! into [`CuratorError::AccessDenied`](crate::errors::CuratorError::AccessDenied).
//!
//! Record visibility follows one rule everywhere: a caller presenting tenant
//! `T` sees records scoped to `T` plus global (unscoped) records.

pub mod rbac;

use std::collections::HashSet;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use rbac::{RbacGuard, RbacManager};

/// Resource names used in permission checks.
pub mod resources {
    pub const SERVICE_REGISTRY: &str = "service_registry";
    pub const CAPABILITY_REGISTRY: &str = "capability_registry";
    pub const SOA_API_REGISTRY: &str = "soa_api_registry";
    pub const MCP_TOOL_REGISTRY: &str = "mcp_tool_registry";
    pub const AGENT_REGISTRY: &str = "agent_registry";
    pub const PATTERN_VALIDATION: &str = "pattern_validation";
    pub const REGISTRY_SNAPSHOT: &str = "registry_snapshot";
    pub const ROUTE_REGISTRY: &str = "route_registry";
}

/// Principal of [`CallerContext::anonymous`].
pub const ANONYMOUS_PRINCIPAL: &str = "anonymous";

/// Identity of the caller of a facade operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerContext {
    /// Authenticated principal (user, service or agent id).
    pub principal: String,
    /// Tenant the caller is acting for. `None` = platform-level caller.
    #[serde(default)]
    pub tenant_id: Option<String>,
    /// Roles presented by the caller.
    #[serde(default)]
    pub roles: Vec<String>,
}

impl CallerContext {
    pub fn new(principal: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            ..Default::default()
        }
    }

    /// Unauthenticated remote caller: no tenant and no roles, so it sees
    /// global records only.
    pub fn anonymous() -> Self {
        Self::new(ANONYMOUS_PRINCIPAL)
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }
}

/// Access mode being checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Read,
    Write,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Read => write!(f, "read"),
            Action::Write => write!(f, "write"),
        }
    }
}

/// Permission checks for caller/resource/action triples.
#[async_trait]
pub trait SecurityGuard: Send + Sync {
    async fn check_permissions(
        &self,
        caller: &CallerContext,
        resource: &str,
        action: Action,
    ) -> bool;
}

/// Tenant admission checks.
#[async_trait]
pub trait TenantValidator: Send + Sync {
    async fn validate_tenant_access(&self, tenant_id: &str) -> bool;
}

/// Guard and validator that allow everything. Used when no security
/// collaborator is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl SecurityGuard for AllowAll {
    async fn check_permissions(&self, _: &CallerContext, _: &str, _: Action) -> bool {
        true
    }
}

#[async_trait]
impl TenantValidator for AllowAll {
    async fn validate_tenant_access(&self, _: &str) -> bool {
        true
    }
}

/// Tenant validator backed by a fixed set of admitted tenants.
#[derive(Debug, Clone, Default)]
pub struct StaticTenantValidator {
    admitted: HashSet<String>,
}

impl StaticTenantValidator {
    pub fn new<I, S>(tenants: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            admitted: tenants.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl TenantValidator for StaticTenantValidator {
    async fn validate_tenant_access(&self, tenant_id: &str) -> bool {
        self.admitted.contains(tenant_id)
    }
}

/// Whether a record with `record_tenant` scope is visible to `caller`.
///
/// No caller means an in-process platform call and sees everything.
pub fn is_visible_to(record_tenant: Option<&str>, caller: Option<&CallerContext>) -> bool {
    match caller {
        Some(caller) => is_visible_to_tenant(record_tenant, caller.tenant_id.as_deref()),
        None => true,
    }
}

/// Tenant `T` sees records scoped to `T` plus global ones; no tenant sees
/// only global ones.
pub fn is_visible_to_tenant(record_tenant: Option<&str>, tenant: Option<&str>) -> bool {
    match (record_tenant, tenant) {
        (None, _) => true,
        (Some(scope), Some(tenant)) => scope == tenant,
        (Some(_), None) => false,
    }
}

/// Whether `caller` may replace a stored record scoped to `existing` with
/// one scoped to `submitted`.
///
/// The stored record must be visible to the caller. Changing its scope is
/// reserved to callers of the owning tenant, so a global record cannot be
/// pulled into one tenant and another tenant's record cannot be made global.
pub fn may_replace(existing: Option<&str>, submitted: Option<&str>, caller: Option<&CallerContext>) -> bool {
    let Some(caller) = caller else {
        return true;
    };
    let tenant = caller.tenant_id.as_deref();
    is_visible_to_tenant(existing, tenant)
        && (existing == submitted || (existing.is_some() && existing == tenant))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tenant_visibility() {
        let tenant_a = CallerContext::new("alice").with_tenant("A");
        let tenant_b = CallerContext::new("bob").with_tenant("B");
        let no_tenant = CallerContext::new("ops");

        assert!(is_visible_to(None, Some(&tenant_b)));
        assert!(is_visible_to(Some("A"), Some(&tenant_a)));
        assert!(!is_visible_to(Some("A"), Some(&tenant_b)));
        assert!(!is_visible_to(Some("A"), Some(&no_tenant)));
        assert!(is_visible_to(Some("A"), None));
    }

    #[test]
    fn test_replacement_requires_owning_tenant() {
        let tenant_a = CallerContext::new("alice").with_tenant("A");
        let tenant_b = CallerContext::new("bob").with_tenant("B");

        assert!(may_replace(Some("A"), Some("A"), Some(&tenant_a)));
        assert!(may_replace(Some("A"), None, Some(&tenant_a)));
        assert!(may_replace(None, None, Some(&tenant_b)));
        assert!(!may_replace(Some("A"), None, Some(&tenant_b)));
        assert!(!may_replace(Some("A"), Some("B"), Some(&tenant_b)));
        assert!(!may_replace(None, Some("B"), Some(&tenant_b)));
        assert!(!may_replace(Some("A"), Some("A"), Some(&CallerContext::anonymous())));
        assert!(may_replace(Some("A"), Some("B"), None));
    }

    #[tokio::test]
    async fn test_static_tenant_validator() {
        let validator = StaticTenantValidator::new(["A", "B"]);
        assert!(validator.validate_tenant_access("A").await);
        assert!(!validator.validate_tenant_access("C").await);
    }
}
