//! RBAC (Role-Based Access Control) guard.
//!
//! Maps principals → roles → grants. A grant is a `resource:action` pattern
//! where either side may use `*` wildcards, e.g. `capability_registry:read`,
//! `*:read` or `*`.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{Action, CallerContext, SecurityGuard};

/// RBAC state: role assignments and grants.
#[derive(Debug, Default)]
pub struct RbacManager {
    /// Principal → roles mapping
    principal_roles: HashMap<String, HashSet<String>>,

    /// Role → grant patterns mapping
    role_grants: HashMap<String, HashSet<String>>,
}

impl RbacManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign a role to a principal.
    pub fn assign_role(&mut self, principal: &str, role: &str) {
        self.principal_roles
            .entry(principal.to_string())
            .or_default()
            .insert(role.to_string());
    }

    /// Remove a role from a principal.
    pub fn revoke_role(&mut self, principal: &str, role: &str) -> bool {
        self.principal_roles
            .get_mut(principal)
            .map(|roles| roles.remove(role))
            .unwrap_or(false)
    }

    /// Grant a `resource:action` pattern to a role.
    pub fn grant(&mut self, role: &str, grant: &str) {
        self.role_grants
            .entry(role.to_string())
            .or_default()
            .insert(grant.to_string());
    }

    /// Revoke a grant from a role.
    pub fn revoke_grant(&mut self, role: &str, grant: &str) -> bool {
        self.role_grants
            .get_mut(role)
            .map(|grants| grants.remove(grant))
            .unwrap_or(false)
    }

    /// Roles assigned to a principal.
    pub fn roles_of(&self, principal: &str) -> Vec<&str> {
        self.principal_roles
            .get(principal)
            .map(|roles| roles.iter().map(|r| r.as_str()).collect())
            .unwrap_or_default()
    }

    /// Whether any of `roles` (or the principal's assigned roles) carries a
    /// grant matching `resource` and `action`.
    pub fn is_allowed(&self, principal: &str, roles: &[String], resource: &str, action: Action) -> bool {
        let wanted = format!("{}:{}", resource, action);
        let assigned = self.principal_roles.get(principal);

        roles
            .iter()
            .map(String::as_str)
            .chain(assigned.into_iter().flatten().map(String::as_str))
            .filter_map(|role| self.role_grants.get(role))
            .flatten()
            .any(|grant| grant_matches(grant, &wanted))
    }
}

/// Matches a grant against `resource:action`. A bare `*` grants everything.
fn grant_matches(grant: &str, wanted: &str) -> bool {
    if grant == "*" {
        return true;
    }
    match (grant.split_once(':'), wanted.split_once(':')) {
        (Some((g_res, g_act)), Some((w_res, w_act))) => {
            pattern_matches(g_res, w_res) && pattern_matches(g_act, w_act)
        }
        _ => false,
    }
}

/// Simple glob matching (supports `*` wildcard).
fn pattern_matches(pattern: &str, text: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if !pattern.contains('*') {
        return pattern == text;
    }

    let parts: Vec<&str> = pattern.split('*').collect();
    let mut pos = 0;

    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        match text[pos..].find(part) {
            Some(found) => {
                if i == 0 && found != 0 {
                    return false;
                }
                pos += found + part.len();
            }
            None => return false,
        }
    }

    if !pattern.ends_with('*') {
        return pos == text.len();
    }

    true
}

/// [`SecurityGuard`] backed by an [`RbacManager`].
#[derive(Debug, Default)]
pub struct RbacGuard {
    rbac: RwLock<RbacManager>,
}

impl RbacGuard {
    pub fn new(rbac: RbacManager) -> Self {
        Self {
            rbac: RwLock::new(rbac),
        }
    }

    /// Mutate the RBAC state in place.
    pub fn configure<F: FnOnce(&mut RbacManager)>(&self, f: F) {
        f(&mut self.rbac.write());
    }
}

#[async_trait]
impl SecurityGuard for RbacGuard {
    async fn check_permissions(&self, caller: &CallerContext, resource: &str, action: Action) -> bool {
        let allowed = self
            .rbac
            .read()
            .is_allowed(&caller.principal, &caller.roles, resource, action);
        if !allowed {
            log::debug!(
                "RBAC denied {} on {} for principal '{}'",
                action,
                resource,
                caller.principal
            );
        }
        allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::resources;

    #[test]
    fn test_role_assignment_and_revocation() {
        let mut rbac = RbacManager::new();
        rbac.assign_role("svc-parser", "registrar");
        rbac.grant("registrar", "capability_registry:write");

        assert!(rbac.is_allowed("svc-parser", &[], resources::CAPABILITY_REGISTRY, Action::Write));
        assert!(!rbac.is_allowed("svc-parser", &[], resources::CAPABILITY_REGISTRY, Action::Read));

        assert!(rbac.revoke_role("svc-parser", "registrar"));
        assert!(!rbac.is_allowed("svc-parser", &[], resources::CAPABILITY_REGISTRY, Action::Write));
    }

    #[test]
    fn test_presented_roles_and_wildcards() {
        let mut rbac = RbacManager::new();
        rbac.grant("reader", "*:read");
        rbac.grant("admin", "*");

        let reader = vec!["reader".to_string()];
        assert!(rbac.is_allowed("anyone", &reader, resources::SERVICE_REGISTRY, Action::Read));
        assert!(!rbac.is_allowed("anyone", &reader, resources::SERVICE_REGISTRY, Action::Write));

        let admin = vec!["admin".to_string()];
        assert!(rbac.is_allowed("root", &admin, resources::AGENT_REGISTRY, Action::Write));
    }

    #[test]
    fn test_pattern_matching() {
        assert!(pattern_matches("*", "anything"));
        assert!(pattern_matches("soa_*", "soa_api_registry"));
        assert!(!pattern_matches("soa_*", "mcp_tool_registry"));
        assert!(pattern_matches("*_registry", "agent_registry"));
    }

    #[tokio::test]
    async fn test_guard_checks_caller() {
        let guard = RbacGuard::default();
        guard.configure(|rbac| rbac.grant("viewer", "capability_registry:read"));

        let caller = CallerContext::new("alice").with_roles(["viewer"]);
        assert!(guard.check_permissions(&caller, resources::CAPABILITY_REGISTRY, Action::Read).await);
        assert!(!guard.check_permissions(&caller, resources::CAPABILITY_REGISTRY, Action::Write).await);
    }
}
