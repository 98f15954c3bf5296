//! Service instance records and the status state machine.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{CuratorError, CuratorResult};
use crate::store::ScopedKey;

/// Liveness status of one service instance.
///
/// ```text
/// starting ──► healthy ◄──► degraded
///     │           │            │
///     └───────────┴─────┬──────┘
///                       ▼
///                    stopped   (terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Starting,
    Healthy,
    Degraded,
    Stopped,
}

impl ServiceStatus {
    /// Healthy or degraded: visible to discovery.
    pub fn is_live(self) -> bool {
        matches!(self, ServiceStatus::Healthy | ServiceStatus::Degraded)
    }

    /// Whether `self → to` is allowed. Same-state reports are allowed for
    /// every non-terminal status and act as a heartbeat.
    pub fn can_transition_to(self, to: ServiceStatus) -> bool {
        use ServiceStatus::*;
        match (self, to) {
            (Stopped, _) => false,
            (_, Stopped) => true,
            (Starting, Starting | Healthy | Degraded) => true,
            (Healthy | Degraded, Healthy | Degraded) => true,
            (Healthy | Degraded, Starting) => false,
        }
    }

    /// Parse the wire name (`"healthy"`, ...).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "starting" => Some(Self::Starting),
            "healthy" => Some(Self::Healthy),
            "degraded" => Some(Self::Degraded),
            "stopped" => Some(Self::Stopped),
            _ => None,
        }
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceStatus::Starting => write!(f, "starting"),
            ServiceStatus::Healthy => write!(f, "healthy"),
            ServiceStatus::Degraded => write!(f, "degraded"),
            ServiceStatus::Stopped => write!(f, "stopped"),
        }
    }
}

/// Identity and metadata of one running service instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRecord {
    /// Logical service name, shared by all instances.
    pub service_name: String,
    #[serde(default)]
    pub service_type: String,
    /// Business-domain grouping.
    #[serde(default = "default_realm")]
    pub realm: String,
    pub instance_id: String,
    pub status: ServiceStatus,
    pub registered_at: DateTime<Utc>,
    /// `None` means globally visible.
    #[serde(default)]
    pub tenant_scope: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Architectural layer (e.g. `foundation`, `smart_city`, `business`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layer: Option<String>,
    /// Layers or services this instance depends on.
    #[serde(default)]
    pub depends_on: Vec<String>,

    pub last_heartbeat_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Utc>>,
}

fn default_realm() -> String {
    "default".to_string()
}

impl ServiceRecord {
    /// A `starting` instance in the default realm.
    pub fn new(service_name: impl Into<String>, instance_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            service_name: service_name.into(),
            service_type: String::new(),
            realm: default_realm(),
            instance_id: instance_id.into(),
            status: ServiceStatus::Starting,
            registered_at: now,
            tenant_scope: None,
            address: None,
            port: None,
            tags: Vec::new(),
            version: None,
            layer: None,
            depends_on: Vec::new(),
            last_heartbeat_at: now,
            stopped_at: None,
        }
    }

    pub fn with_service_type(mut self, service_type: impl Into<String>) -> Self {
        self.service_type = service_type.into();
        self
    }

    pub fn with_realm(mut self, realm: impl Into<String>) -> Self {
        self.realm = realm.into();
        self
    }

    pub fn with_status(mut self, status: ServiceStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant_scope = Some(tenant.into());
        self
    }

    pub fn with_endpoint(mut self, address: impl Into<String>, port: u16) -> Self {
        self.address = Some(address.into());
        self.port = Some(port);
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_layer(mut self, layer: impl Into<String>) -> Self {
        self.layer = Some(layer.into());
        self
    }

    pub fn with_depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Store key: `(service_name, instance_id)`.
    pub fn key(&self) -> ScopedKey {
        ScopedKey::new(&self.service_name, &self.instance_id)
    }

    /// Structural checks for a registration submission.
    pub fn validate_for_registration(&self) -> CuratorResult<()> {
        if self.service_name.trim().is_empty() {
            return Err(CuratorError::Validation("service_name must not be empty".into()));
        }
        if self.instance_id.trim().is_empty() {
            return Err(CuratorError::Validation(format!(
                "instance_id must not be empty for service '{}'",
                self.service_name
            )));
        }
        if !matches!(self.status, ServiceStatus::Starting | ServiceStatus::Healthy) {
            return Err(CuratorError::Validation(format!(
                "service '{}' must register as starting or healthy, got {}",
                self.service_name, self.status
            )));
        }
        Ok(())
    }

    /// Copy of this record moved to `to`, or the state-machine error.
    pub fn transitioned(&self, to: ServiceStatus, now: DateTime<Utc>) -> CuratorResult<Self> {
        if self.status == ServiceStatus::Stopped {
            return Err(CuratorError::TerminalState {
                service_name: self.service_name.clone(),
                instance_id: self.instance_id.clone(),
                requested: to,
            });
        }
        if !self.status.can_transition_to(to) {
            return Err(CuratorError::InvalidTransition {
                service_name: self.service_name.clone(),
                instance_id: self.instance_id.clone(),
                from: self.status,
                to,
            });
        }
        let mut next = self.clone();
        next.status = to;
        if to == ServiceStatus::Stopped {
            next.stopped_at = Some(now);
        } else {
            next.last_heartbeat_at = now;
        }
        Ok(next)
    }
}

/// Metadata changes for running instances. `None` fields are left as they
/// are; identity, tenant scope and status cannot be changed this way.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceUpdate {
    pub service_type: Option<String>,
    pub realm: Option<String>,
    pub address: Option<String>,
    pub port: Option<u16>,
    pub tags: Option<Vec<String>>,
    pub version: Option<String>,
    pub layer: Option<String>,
    pub depends_on: Option<Vec<String>>,
}

impl ServiceUpdate {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    pub(crate) fn apply_to(&self, record: &mut ServiceRecord) {
        if let Some(service_type) = &self.service_type {
            record.service_type = service_type.clone();
        }
        if let Some(realm) = &self.realm {
            record.realm = realm.clone();
        }
        if let Some(address) = &self.address {
            record.address = Some(address.clone());
        }
        if let Some(port) = self.port {
            record.port = Some(port);
        }
        if let Some(tags) = &self.tags {
            record.tags = tags.clone();
        }
        if let Some(version) = &self.version {
            record.version = Some(version.clone());
        }
        if let Some(layer) = &self.layer {
            record.layer = Some(layer.clone());
        }
        if let Some(depends_on) = &self.depends_on {
            record.depends_on = depends_on.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine() {
        use ServiceStatus::*;
        assert!(Starting.can_transition_to(Healthy));
        assert!(Starting.can_transition_to(Degraded));
        assert!(Healthy.can_transition_to(Degraded));
        assert!(Degraded.can_transition_to(Healthy));
        assert!(Healthy.can_transition_to(Healthy));
        assert!(Degraded.can_transition_to(Stopped));
        assert!(!Healthy.can_transition_to(Starting));
        assert!(!Stopped.can_transition_to(Healthy));
        assert!(!Stopped.can_transition_to(Stopped));
    }

    #[test]
    fn test_transitioned_errors() {
        let now = Utc::now();
        let record = ServiceRecord::new("parser-1", "i-1").with_status(ServiceStatus::Healthy);

        let err = record.transitioned(ServiceStatus::Starting, now).unwrap_err();
        assert!(matches!(err, CuratorError::InvalidTransition { .. }));

        let stopped = record.transitioned(ServiceStatus::Stopped, now).unwrap();
        assert_eq!(stopped.stopped_at, Some(now));
        let err = stopped.transitioned(ServiceStatus::Healthy, now).unwrap_err();
        assert!(matches!(err, CuratorError::TerminalState { .. }));
    }

    #[test]
    fn test_registration_validation() {
        assert!(ServiceRecord::new("", "i-1").validate_for_registration().is_err());
        assert!(ServiceRecord::new("svc", " ").validate_for_registration().is_err());
        assert!(ServiceRecord::new("svc", "i-1")
            .with_status(ServiceStatus::Degraded)
            .validate_for_registration()
            .is_err());
        assert!(ServiceRecord::new("svc", "i-1")
            .with_status(ServiceStatus::Healthy)
            .validate_for_registration()
            .is_ok());
    }

    #[test]
    fn test_status_serde_and_parse() {
        let json = serde_json::to_string(&ServiceStatus::Degraded).unwrap();
        assert_eq!(json, "\"degraded\"");
        assert_eq!(ServiceStatus::parse("HEALTHY"), Some(ServiceStatus::Healthy));
        assert_eq!(ServiceStatus::parse("up"), None);
    }
}
