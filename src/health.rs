//! Aggregated health report.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::curator::LifecycleState;

/// Health of one component. Ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        };
        write!(f, "{}", s)
    }
}

impl From<LifecycleState> for HealthStatus {
    fn from(state: LifecycleState) -> Self {
        match state {
            LifecycleState::Ready => HealthStatus::Healthy,
            LifecycleState::ShuttingDown => HealthStatus::Degraded,
            _ => HealthStatus::Unhealthy,
        }
    }
}

/// Discovery backend state as seen by the facade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendStatus {
    Healthy,
    /// Configured but unreachable; local state keeps serving.
    Degraded,
    /// No backend configured.
    Disabled,
}

impl BackendStatus {
    pub fn health(self) -> HealthStatus {
        match self {
            BackendStatus::Healthy | BackendStatus::Disabled => HealthStatus::Healthy,
            BackendStatus::Degraded => HealthStatus::Degraded,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistryStatus {
    pub registry: String,
    pub status: HealthStatus,
    pub record_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl RegistryStatus {
    pub fn new(registry: impl Into<String>, status: HealthStatus, record_count: usize) -> Self {
        Self {
            registry: registry.into(),
            status,
            record_count,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryBackendHealth {
    pub name: Option<String>,
    pub status: BackendStatus,
    pub last_error: Option<String>,
    pub last_checked_at: Option<DateTime<Utc>>,
}

/// One report across every registry, the lifecycle and the backend.
#[derive(Debug, Clone, Serialize)]
pub struct AggregatedHealth {
    pub overall_status: HealthStatus,
    pub lifecycle: LifecycleState,
    pub per_registry_status: Vec<RegistryStatus>,
    pub discovery_backend: DiscoveryBackendHealth,
    pub pending_mirror_operations: usize,
    pub generated_at: DateTime<Utc>,
}

impl AggregatedHealth {
    /// Build the report; the overall status is the worst component.
    pub fn new(
        lifecycle: LifecycleState,
        per_registry_status: Vec<RegistryStatus>,
        discovery_backend: DiscoveryBackendHealth,
        pending_mirror_operations: usize,
        generated_at: DateTime<Utc>,
    ) -> Self {
        let overall_status = per_registry_status
            .iter()
            .map(|r| r.status)
            .chain([HealthStatus::from(lifecycle), discovery_backend.status.health()])
            .max()
            .unwrap_or(HealthStatus::Healthy);

        Self {
            overall_status,
            lifecycle,
            per_registry_status,
            discovery_backend,
            pending_mirror_operations,
            generated_at,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.overall_status == HealthStatus::Healthy
    }
}
