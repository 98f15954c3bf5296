//! Acknowledgments returned by facade write operations.

use std::sync::Arc;

use serde::Serialize;

use crate::agent_registry::AgentReport;
use crate::patterns::AntiPatternViolation;
use crate::services::{ServiceRecord, ServiceStatus};

/// Outcome of `register_service`.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrationAck {
    pub accepted: bool,
    /// Effective stored instance record.
    pub service: Arc<ServiceRecord>,
    pub replaced_service: bool,
    /// A backend is configured but currently unreachable. Local
    /// registration still succeeded.
    pub degraded_discovery: bool,
    /// Open violations for the service after this registration.
    pub violations: Vec<AntiPatternViolation>,
    pub capabilities: Vec<String>,
    pub replaced_capabilities: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

/// Outcome of `report_health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthAck {
    pub service: Arc<ServiceRecord>,
    pub previous_status: ServiceStatus,
    pub degraded_discovery: bool,
}

/// Outcome of `update_service`.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceUpdateAck {
    pub service_name: String,
    /// Updated instances, every non-stopped instance of the service.
    pub services: Vec<Arc<ServiceRecord>>,
    /// Open violations for the service after the update.
    pub violations: Vec<AntiPatternViolation>,
    pub degraded_discovery: bool,
}

/// Outcome of `deregister`.
#[derive(Debug, Clone, Serialize)]
pub struct DeregistrationAck {
    pub service_name: String,
    pub instance_id: String,
    /// Unknown or already stopped instance.
    pub noop: bool,
    /// Capabilities removed because no live instance of the service remains.
    pub removed_capabilities: Vec<String>,
    pub degraded_discovery: bool,
}

/// Outcome of `register_agent`.
#[derive(Debug, Clone, Serialize)]
pub struct AgentRegistrationAck {
    pub agent: AgentReport,
    /// The agent was known before (usage history preserved).
    pub existed: bool,
}

/// Outcome of one liveness sweep.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    /// `service/instance` keys marked stopped for missed heartbeats.
    pub expired: Vec<String>,
    pub purged: usize,
}
