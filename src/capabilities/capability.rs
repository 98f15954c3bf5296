//! Capability definition: a named thing a service can do.
//!
//! A definition carries at most one SOA-API contract and at most one MCP-tool
//! contract. A definition with neither is a valid metadata-only capability.
//!
//! Example YAML (handlers are attached in code after loading):
//! ```yaml
//! capability_name: parse_pdf
//! owning_service: parser-1
//! protocol_name: ContentParsingProtocol
//! description: Extract text and structure from PDF documents
//! tags: [content, pdf]
//! contracts:
//!   soa_api:
//!     api_name: /v1/parse
//!     method: POST
//! semantic_mapping:
//!   domain_capability: content.parsing
//!   canonical_path: /content/parse
//!   journey: upload-and-parse
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::contracts::{Binding, HandlerRef, McpToolContract, McpToolRecord, SoaApiContract, SoaApiRecord};
use crate::errors::{CuratorError, CuratorResult};
use crate::store::ScopedKey;

/// Lifecycle state of a capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityState {
    #[default]
    Active,
    Deprecated,
    Maintenance,
    Experimental,
}

impl CapabilityState {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "active" => Some(Self::Active),
            "deprecated" => Some(Self::Deprecated),
            "maintenance" => Some(Self::Maintenance),
            "experimental" => Some(Self::Experimental),
            _ => None,
        }
    }
}

impl fmt::Display for CapabilityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapabilityState::Active => write!(f, "active"),
            CapabilityState::Deprecated => write!(f, "deprecated"),
            CapabilityState::Maintenance => write!(f, "maintenance"),
            CapabilityState::Experimental => write!(f, "experimental"),
        }
    }
}

/// Invocation contracts attached to a capability.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilityContracts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub soa_api: Option<SoaApiContract>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcp_tool: Option<McpToolContract>,
}

impl CapabilityContracts {
    pub fn is_empty(&self) -> bool {
        self.soa_api.is_none() && self.mcp_tool.is_none()
    }
}

/// Mapping of a capability onto the business domain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SemanticMapping {
    /// Domain capability tag, e.g. `content.parsing`.
    #[serde(default)]
    pub domain_capability: Option<String>,
    #[serde(default)]
    pub canonical_path: Option<String>,
    /// Human-facing journey name.
    #[serde(default)]
    pub journey: Option<String>,
}

/// A named thing a service can do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityDefinition {
    pub capability_name: String,
    pub owning_service: String,
    /// Interface contract the capability implements.
    pub protocol_name: String,
    #[serde(default)]
    pub description: String,

    /// Defaults to the owning service's realm at registration.
    #[serde(default)]
    pub realm: Option<String>,
    /// Defaults to the owning service's tenant scope at registration.
    #[serde(default)]
    pub tenant_scope: Option<String>,

    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub state: CapabilityState,

    #[serde(default)]
    pub contracts: CapabilityContracts,
    #[serde(default)]
    pub semantic_mapping: Option<SemanticMapping>,

    /// Set by the registry.
    #[serde(default)]
    pub registered_at: Option<DateTime<Utc>>,
}

impl CapabilityDefinition {
    pub fn new(
        capability_name: impl Into<String>,
        owning_service: impl Into<String>,
        protocol_name: impl Into<String>,
    ) -> Self {
        Self {
            capability_name: capability_name.into(),
            owning_service: owning_service.into(),
            protocol_name: protocol_name.into(),
            description: String::new(),
            realm: None,
            tenant_scope: None,
            tags: Vec::new(),
            version: None,
            state: CapabilityState::Active,
            contracts: CapabilityContracts::default(),
            semantic_mapping: None,
            registered_at: None,
        }
    }

    /// Parse a definition from YAML. A malformed document is a
    /// [`CuratorError::Validation`] of the submission.
    pub fn from_yaml(yaml: &str) -> CuratorResult<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| CuratorError::Validation(format!("malformed capability definition: {}", e)))
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_realm(mut self, realm: impl Into<String>) -> Self {
        self.realm = Some(realm.into());
        self
    }

    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant_scope = Some(tenant.into());
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

    pub fn with_state(mut self, state: CapabilityState) -> Self {
        self.state = state;
        self
    }

    pub fn with_soa_api(mut self, contract: SoaApiContract) -> Self {
        self.contracts.soa_api = Some(contract);
        self
    }

    pub fn with_mcp_tool(mut self, contract: McpToolContract) -> Self {
        self.contracts.mcp_tool = Some(contract);
        self
    }

    pub fn with_semantic_mapping(mut self, mapping: SemanticMapping) -> Self {
        self.semantic_mapping = Some(mapping);
        self
    }

    /// Attach a handler to the SOA-API contract (e.g. after `from_yaml`).
    pub fn bind_soa_handler(mut self, handler: HandlerRef) -> Self {
        if let Some(contract) = self.contracts.soa_api.as_mut() {
            contract.handler = Some(handler);
        }
        self
    }

    /// Attach a handler to the MCP-tool contract.
    pub fn bind_mcp_handler(mut self, handler: HandlerRef) -> Self {
        if let Some(contract) = self.contracts.mcp_tool.as_mut() {
            contract.handler = Some(handler);
        }
        self
    }

    /// Store key: `(owning_service, capability_name)`.
    pub fn key(&self) -> ScopedKey {
        ScopedKey::new(&self.owning_service, &self.capability_name)
    }

    /// Whether the capability can be invoked through a binding.
    pub fn is_invocable(&self) -> bool {
        !self.contracts.is_empty()
    }

    /// Matches a discovery tag: capability name, declared tag, or semantic
    /// domain capability.
    pub fn matches_tag(&self, tag: &str) -> bool {
        self.capability_name == tag
            || self.tags.iter().any(|t| t == tag)
            || self
                .semantic_mapping
                .as_ref()
                .and_then(|m| m.domain_capability.as_deref())
                .map_or(false, |d| d == tag)
    }

    /// Case-insensitive substring match on the name or description.
    pub fn matches_query(&self, query: &str) -> bool {
        let query = query.to_lowercase();
        self.capability_name.to_lowercase().contains(&query)
            || self.description.to_lowercase().contains(&query)
    }

    /// Required fields only. Contract bindings are validated separately by
    /// [`CapabilityDefinition::bindings`].
    pub fn validate(&self) -> CuratorResult<()> {
        let missing: Vec<&str> = [
            ("capability_name", &self.capability_name),
            ("owning_service", &self.owning_service),
            ("protocol_name", &self.protocol_name),
        ]
        .iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(field, _)| *field)
        .collect();

        if !missing.is_empty() {
            return Err(CuratorError::Validation(format!(
                "capability '{}' is missing required fields: {}",
                self.capability_name,
                missing.join(", ")
            )));
        }
        Ok(())
    }

    /// Build and validate the binding records this definition implies.
    pub fn bindings(&self, now: DateTime<Utc>) -> CuratorResult<(Option<SoaApiRecord>, Option<McpToolRecord>)> {
        let tenant = self.tenant_scope.as_deref();
        let soa = self
            .contracts
            .soa_api
            .as_ref()
            .map(|c| SoaApiRecord::from_contract(c, &self.owning_service, &self.capability_name, tenant, now));
        let mcp = self
            .contracts
            .mcp_tool
            .as_ref()
            .map(|c| McpToolRecord::from_contract(c, &self.owning_service, &self.capability_name, tenant, now));

        if let Some(record) = &soa {
            record.validate()?;
        }
        if let Some(record) = &mcp {
            record.validate()?;
        }
        Ok((soa, mcp))
    }
}
