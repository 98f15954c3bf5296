//! External service-discovery backends.
//!
//! The local [`ServiceRegistry`](crate::services::ServiceRegistry) is the
//! source of truth. A [`DiscoveryBackend`] only receives a best-effort mirror
//! of live instances, driven by the [`mirror`] worker so that backend I/O
//! never sits on a registration path.
//!
//! ## Backends
//!
//! | Backend | Use |
//! |---------|-----|
//! | [`ConsulBackend`] | Consul agent HTTP API |
//! | [`InMemoryBackend`] | Local development and outage simulation |

pub mod consul;
pub mod memory;
pub mod mirror;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::errors::CuratorError;
use crate::services::{ServiceRecord, ServiceStatus};

pub use consul::{ConsulBackend, ConsulConfig};
pub use memory::InMemoryBackend;
pub use mirror::{MirrorCommand, MirrorHandle, MirrorState, MirrorStatus};

/// Errors raised by discovery backends.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Backend unreachable: {0}")]
    Unreachable(String),

    #[error("Backend rejected request (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Timeout after {0}ms")]
    Timeout(u64),

    #[error("Invalid backend response: {0}")]
    InvalidResponse(String),

    #[error("Invalid backend configuration: {0}")]
    InvalidConfig(String),
}

impl From<DiscoveryError> for CuratorError {
    fn from(e: DiscoveryError) -> Self {
        CuratorError::Backend(e.to_string())
    }
}

/// Backend reachability check result.
#[derive(Debug, Clone, Serialize)]
pub struct BackendHealth {
    pub reachable: bool,
    pub latency_ms: Option<u64>,
    pub message: String,
}

/// The subset of a service instance announced to a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryInstance {
    pub service_name: String,
    pub instance_id: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Registry metadata carried as backend key/values.
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
}

impl DiscoveryInstance {
    /// Backend-wide identifier of the instance.
    pub fn backend_id(&self) -> String {
        backend_id(&self.service_name, &self.instance_id)
    }

    /// Rebuild a local record from an announced instance.
    ///
    /// The imported record is live (`healthy`/`degraded` as announced,
    /// otherwise `starting`) with a fresh heartbeat so the sweeper gives it a
    /// full timeout to report in.
    pub fn to_service_record(&self, now: DateTime<Utc>) -> ServiceRecord {
        let meta = |key: &str| self.meta.get(key).filter(|v| !v.is_empty()).cloned();
        let status = match meta("status").as_deref().and_then(ServiceStatus::parse) {
            Some(s @ (ServiceStatus::Healthy | ServiceStatus::Degraded)) => s,
            _ => ServiceStatus::Starting,
        };

        let mut record = ServiceRecord::new(&self.service_name, &self.instance_id)
            .with_status(status)
            .with_tags(self.tags.clone());
        if let Some(realm) = meta("realm") {
            record.realm = realm;
        }
        record.service_type = meta("service_type").unwrap_or_default();
        record.tenant_scope = meta("tenant_scope");
        record.version = meta("version");
        record.layer = meta("layer");
        record.address = self.address.clone();
        record.port = self.port;
        record.registered_at = now;
        record.last_heartbeat_at = now;
        record
    }
}

/// Backend-wide identifier of `(service_name, instance_id)`.
///
/// `service_name:instance_id` with `%` and `:` percent-escaped in both
/// parts, so distinct pairs never share an identifier.
pub fn backend_id(service_name: &str, instance_id: &str) -> String {
    format!("{}:{}", escape_id_part(service_name), escape_id_part(instance_id))
}

fn escape_id_part(part: &str) -> String {
    let mut escaped = String::with_capacity(part.len());
    for c in part.chars() {
        match c {
            '%' => escaped.push_str("%25"),
            ':' => escaped.push_str("%3A"),
            _ => escaped.push(c),
        }
    }
    escaped
}

impl From<&ServiceRecord> for DiscoveryInstance {
    fn from(record: &ServiceRecord) -> Self {
        let mut meta = BTreeMap::new();
        meta.insert("realm".to_string(), record.realm.clone());
        meta.insert("status".to_string(), record.status.to_string());
        if !record.service_type.is_empty() {
            meta.insert("service_type".to_string(), record.service_type.clone());
        }
        if let Some(tenant) = &record.tenant_scope {
            meta.insert("tenant_scope".to_string(), tenant.clone());
        }
        if let Some(version) = &record.version {
            meta.insert("version".to_string(), version.clone());
        }
        if let Some(layer) = &record.layer {
            meta.insert("layer".to_string(), layer.clone());
        }

        Self {
            service_name: record.service_name.clone(),
            instance_id: record.instance_id.clone(),
            address: record.address.clone(),
            port: record.port,
            tags: record.tags.clone(),
            meta,
        }
    }
}

/// An external service-discovery system.
///
/// Implementations are called only from the mirror worker and during
/// bring-up; every call is wrapped in the configured mirror timeout.
#[async_trait]
pub trait DiscoveryBackend: Send + Sync {
    /// Human-readable backend name.
    fn name(&self) -> &str;

    /// Announce (or re-announce) a live instance.
    async fn announce(&self, instance: &DiscoveryInstance) -> Result<(), DiscoveryError>;

    /// Withdraw an instance. Withdrawing an unknown instance is not an error.
    async fn withdraw(&self, service_name: &str, instance_id: &str) -> Result<(), DiscoveryError>;

    /// Check reachability.
    async fn health_check(&self) -> Result<BackendHealth, DiscoveryError>;

    /// Instances currently announced in the backend.
    async fn list_instances(&self) -> Result<Vec<DiscoveryInstance>, DiscoveryError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_round_trips_registry_metadata() {
        let record = ServiceRecord::new("parser-1", "i-1")
            .with_realm("content")
            .with_service_type("parser")
            .with_status(ServiceStatus::Healthy)
            .with_tenant("A")
            .with_endpoint("10.0.0.4", 8080)
            .with_tags(["pdf"]);

        let instance = DiscoveryInstance::from(&record);
        assert_eq!(instance.backend_id(), "parser-1:i-1");
        assert_eq!(instance.meta["realm"], "content");

        let restored = instance.to_service_record(Utc::now());
        assert_eq!(restored.realm, "content");
        assert_eq!(restored.service_type, "parser");
        assert_eq!(restored.status, ServiceStatus::Healthy);
        assert_eq!(restored.tenant_scope.as_deref(), Some("A"));
        assert_eq!(restored.port, Some(8080));
    }

    #[test]
    fn test_backend_ids_do_not_collide() {
        assert_ne!(backend_id("a-b", "c"), backend_id("a", "b-c"));
        assert_ne!(backend_id("a:b", "c"), backend_id("a", "b:c"));
        assert_ne!(backend_id("a%3Ab", "c"), backend_id("a:b", "c"));
        assert_eq!(backend_id("a:b", "c"), "a%3Ab:c");
    }

    #[test]
    fn test_unknown_status_imports_as_starting() {
        let instance = DiscoveryInstance {
            service_name: "svc".into(),
            instance_id: "1".into(),
            address: None,
            port: None,
            tags: vec![],
            meta: BTreeMap::from([("status".to_string(), "stopped".to_string())]),
        };
        let restored = instance.to_service_record(Utc::now());
        assert_eq!(restored.status, ServiceStatus::Starting);
        assert_eq!(restored.realm, "default");
    }
}
