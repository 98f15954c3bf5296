//! Route records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::contracts::HttpMethod;
use crate::errors::{CuratorError, CuratorResult};

fn default_version() -> String {
    "1.0".to_string()
}

/// One HTTP route tracked by the endpoint registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteRecord {
    /// Defaults to `METHOD:path:pillar:realm`.
    #[serde(default)]
    pub route_id: String,
    pub path: String,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default)]
    pub pillar: String,
    #[serde(default)]
    pub realm: String,
    /// Service answering the route, when one is known.
    #[serde(default)]
    pub service_name: Option<String>,
    /// Handler name as reported by the defining domain.
    pub handler: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_version")]
    pub version: String,
    /// Domain that defined the route. Defaults to the realm.
    #[serde(default)]
    pub defined_by: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub tenant_scope: Option<String>,
    #[serde(default)]
    pub registered_at: Option<DateTime<Utc>>,
}

impl RouteRecord {
    pub fn new(method: HttpMethod, path: impl Into<String>, handler: impl Into<String>) -> Self {
        Self {
            route_id: String::new(),
            path: path.into(),
            method,
            pillar: String::new(),
            realm: String::new(),
            service_name: None,
            handler: handler.into(),
            description: String::new(),
            version: default_version(),
            defined_by: None,
            tags: Vec::new(),
            tenant_scope: None,
            registered_at: None,
        }
    }

    pub fn with_id(mut self, route_id: impl Into<String>) -> Self {
        self.route_id = route_id.into();
        self
    }

    pub fn with_pillar(mut self, pillar: impl Into<String>) -> Self {
        self.pillar = pillar.into();
        self
    }

    pub fn with_realm(mut self, realm: impl Into<String>) -> Self {
        self.realm = realm.into();
        self
    }

    pub fn with_service(mut self, service_name: impl Into<String>) -> Self {
        self.service_name = Some(service_name.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant_scope = Some(tenant.into());
        self
    }

    /// `METHOD:path:pillar:realm`.
    pub fn default_route_id(&self) -> String {
        format!("{}:{}:{}:{}", self.method, self.path, self.pillar, self.realm)
    }

    pub fn validate(&self) -> CuratorResult<()> {
        if !self.path.starts_with('/') {
            return Err(CuratorError::Validation(format!(
                "route path '{}' must start with '/'",
                self.path
            )));
        }
        if self.handler.trim().is_empty() {
            return Err(CuratorError::Validation(format!(
                "route {} {} has no handler",
                self.method, self.path
            )));
        }
        if self.service_name.as_deref().is_some_and(|s| s.trim().is_empty()) {
            return Err(CuratorError::Validation("route service_name is empty".to_string()));
        }
        Ok(())
    }

    /// Fill the id, the defining domain and the registration time.
    pub(crate) fn normalized(mut self, now: DateTime<Utc>) -> Self {
        if self.route_id.trim().is_empty() {
            self.route_id = self.default_route_id();
        }
        if self.defined_by.as_deref().map_or(true, |d| d.trim().is_empty()) {
            self.defined_by = Some(if self.realm.is_empty() {
                "unknown_domain".to_string()
            } else {
                self.realm.clone()
            });
        }
        self.registered_at.get_or_insert(now);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_json() {
        let route: RouteRecord = serde_json::from_value(serde_json::json!({
            "path": "/api/content/upload",
            "method": "POST",
            "pillar": "content",
            "realm": "business_enablement",
            "handler": "upload_file",
        }))
        .unwrap();
        route.validate().unwrap();

        let route = route.normalized(Utc::now());
        assert_eq!(route.route_id, "POST:/api/content/upload:content:business_enablement");
        assert_eq!(route.version, "1.0");
        assert_eq!(route.defined_by.as_deref(), Some("business_enablement"));
        assert!(route.registered_at.is_some());
    }

    #[test]
    fn test_explicit_id_is_kept() {
        let route = RouteRecord::new(HttpMethod::Get, "/health", "health")
            .with_id("health-check")
            .normalized(Utc::now());
        assert_eq!(route.route_id, "health-check");
        assert_eq!(route.defined_by.as_deref(), Some("unknown_domain"));
    }

    #[test]
    fn test_rejects_incomplete_routes() {
        assert!(RouteRecord::new(HttpMethod::Get, "health", "h").validate().is_err());
        assert!(RouteRecord::new(HttpMethod::Get, "/health", " ").validate().is_err());
        let err = RouteRecord::new(HttpMethod::Get, "/health", "h")
            .with_service("")
            .validate()
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }
}
