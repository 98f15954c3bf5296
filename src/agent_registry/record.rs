//! Agent capability records and reports.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{CuratorError, CuratorResult};

/// Last reported health of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentHealth {
    #[default]
    Unknown,
    Healthy,
    Degraded,
    Unhealthy,
}

impl AgentHealth {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "unknown" => Some(Self::Unknown),
            "healthy" => Some(Self::Healthy),
            "degraded" => Some(Self::Degraded),
            "unhealthy" => Some(Self::Unhealthy),
            _ => None,
        }
    }
}

impl fmt::Display for AgentHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentHealth::Unknown => write!(f, "unknown"),
            AgentHealth::Healthy => write!(f, "healthy"),
            AgentHealth::Degraded => write!(f, "degraded"),
            AgentHealth::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Registration request for one agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRegistration {
    pub agent_id: String,
    #[serde(default)]
    pub capability_tags: BTreeSet<String>,
    #[serde(default)]
    pub agent_name: Option<String>,
    /// Business pillar the agent serves.
    #[serde(default)]
    pub pillar: Option<String>,
    #[serde(default)]
    pub tenant_scope: Option<String>,
}

impl AgentRegistration {
    pub fn new<I, S>(agent_id: impl Into<String>, capability_tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            agent_id: agent_id.into(),
            capability_tags: capability_tags.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.agent_name = Some(name.into());
        self
    }

    pub fn with_pillar(mut self, pillar: impl Into<String>) -> Self {
        self.pillar = Some(pillar.into());
        self
    }

    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant_scope = Some(tenant.into());
        self
    }

    pub fn validate(&self) -> CuratorResult<()> {
        if self.agent_id.trim().is_empty() {
            return Err(CuratorError::Validation("agent_id must not be empty".into()));
        }
        if self.capability_tags.iter().any(|t| t.trim().is_empty()) {
            return Err(CuratorError::Validation(format!(
                "agent '{}' declares an empty capability tag",
                self.agent_id
            )));
        }
        Ok(())
    }
}

/// What one agent can currently do, how often it has been used, and how it
/// last reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentCapabilityRecord {
    pub agent_id: String,
    pub agent_name: Option<String>,
    pub pillar: Option<String>,
    pub capability_tags: BTreeSet<String>,
    /// Monotonic total of reported uses.
    pub usage_count: u64,
    pub usage_by_tag: BTreeMap<String, u64>,
    pub last_health_status: AgentHealth,
    pub last_seen_at: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
    pub tenant_scope: Option<String>,
    /// Set when the agent shuts down; archived records stay queryable.
    pub archived_at: Option<DateTime<Utc>>,
}

impl AgentCapabilityRecord {
    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }

    /// Record for a first registration, or the re-registration of `existing`
    /// with its usage history carried over.
    pub(crate) fn from_registration(
        registration: &AgentRegistration,
        existing: Option<&AgentCapabilityRecord>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            agent_id: registration.agent_id.clone(),
            agent_name: registration.agent_name.clone(),
            pillar: registration.pillar.clone(),
            capability_tags: registration.capability_tags.clone(),
            usage_count: existing.map_or(0, |e| e.usage_count),
            usage_by_tag: existing.map(|e| e.usage_by_tag.clone()).unwrap_or_default(),
            last_health_status: existing.map_or(AgentHealth::Unknown, |e| e.last_health_status),
            last_seen_at: now,
            registered_at: existing.map_or(now, |e| e.registered_at),
            tenant_scope: registration.tenant_scope.clone(),
            archived_at: None,
        }
    }
}

/// Aggregate view of one agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentReport {
    pub agent_id: String,
    pub agent_name: Option<String>,
    pub pillar: Option<String>,
    pub capability_tags: Vec<String>,
    pub usage_count: u64,
    pub usage_by_tag: BTreeMap<String, u64>,
    /// Tags the agent advertises but has never been used for.
    pub unused_tags: Vec<String>,
    pub health_status: AgentHealth,
    pub last_seen_at: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
    pub archived: bool,
    pub tenant_scope: Option<String>,
}

impl From<&AgentCapabilityRecord> for AgentReport {
    fn from(record: &AgentCapabilityRecord) -> Self {
        let unused_tags = record
            .capability_tags
            .iter()
            .filter(|t| !record.usage_by_tag.contains_key(*t))
            .cloned()
            .collect();
        Self {
            agent_id: record.agent_id.clone(),
            agent_name: record.agent_name.clone(),
            pillar: record.pillar.clone(),
            capability_tags: record.capability_tags.iter().cloned().collect(),
            usage_count: record.usage_count,
            usage_by_tag: record.usage_by_tag.clone(),
            unused_tags,
            health_status: record.last_health_status,
            last_seen_at: record.last_seen_at,
            registered_at: record.registered_at,
            archived: record.is_archived(),
            tenant_scope: record.tenant_scope.clone(),
        }
    }
}

/// Fleet-wide agent analytics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AgentAnalytics {
    pub total_agents: usize,
    pub active_agents: usize,
    pub archived_agents: usize,
    pub total_usage: u64,
    pub usage_by_tag: BTreeMap<String, u64>,
    pub usage_by_pillar: BTreeMap<String, u64>,
    /// Active agents per health status.
    pub health_distribution: BTreeMap<String, usize>,
    /// Tags advertised by at least one active agent.
    pub advertised_tags: BTreeSet<String>,
}
