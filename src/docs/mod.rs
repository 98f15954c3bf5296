//! Read-only registry snapshots for documentation generators.
//!
//! The curator owns no documentation format. It hands a
//! [`RegistrySnapshot`] to an injected [`DocumentationSink`] whenever the
//! capability set changes, debounced by [`DocsTrigger`].

pub mod trigger;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::agent_registry::AgentReport;
use crate::capabilities::CapabilityDefinition;
use crate::contracts::{McpToolRecord, SoaApiRecord};
use crate::endpoints::RouteRecord;
use crate::errors::CuratorResult;
use crate::patterns::AntiPatternViolation;
use crate::services::ServiceRecord;

pub use trigger::DocsTrigger;

/// Every registry at one point in time.
///
/// Registries are read one after another, so a snapshot taken during
/// bring-up may show a service before its capabilities.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrySnapshot {
    /// Capability-set revision the snapshot was taken at.
    pub revision: u64,
    pub generated_at: DateTime<Utc>,
    pub services: Vec<ServiceRecord>,
    pub capabilities: Vec<CapabilityDefinition>,
    pub soa_apis: Vec<SoaApiRecord>,
    pub mcp_tools: Vec<McpToolRecord>,
    pub routes: Vec<RouteRecord>,
    pub agents: Vec<AgentReport>,
    pub violations: Vec<AntiPatternViolation>,
}

impl RegistrySnapshot {
    pub fn empty(revision: u64) -> Self {
        Self {
            revision,
            generated_at: Utc::now(),
            services: Vec::new(),
            capabilities: Vec::new(),
            soa_apis: Vec::new(),
            mcp_tools: Vec::new(),
            routes: Vec::new(),
            agents: Vec::new(),
            violations: Vec::new(),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Receives snapshots after material capability changes.
#[async_trait]
pub trait DocumentationSink: Send + Sync {
    async fn publish(&self, snapshot: RegistrySnapshot) -> CuratorResult<()>;
}

/// Sink that only logs a summary of each snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

#[async_trait]
impl DocumentationSink for LogSink {
    async fn publish(&self, snapshot: RegistrySnapshot) -> CuratorResult<()> {
        log::info!(
            "Registry documentation revision {}: {} services, {} capabilities, {} SOA APIs, {} MCP tools",
            snapshot.revision,
            snapshot.services.len(),
            snapshot.capabilities.len(),
            snapshot.soa_apis.len(),
            snapshot.mcp_tools.len()
        );
        Ok(())
    }
}
