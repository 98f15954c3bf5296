//! SOA-API and MCP-tool contracts and their stored binding records.
//!
//! A *contract* is what a service attaches to a capability at registration
//! time. A *record* is the normalized binding the registry stores, stamped
//! with owner, capability and tenant scope.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::handler::HandlerRef;
use crate::errors::{CuratorError, CuratorResult};

/// HTTP method of a SOA-API endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        };
        f.write_str(name)
    }
}

/// SOA-API contract attached to a capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SoaApiContract {
    pub api_name: String,
    /// Endpoint path; defaults to `api_name` when empty.
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(skip)]
    pub handler: Option<HandlerRef>,
}

impl SoaApiContract {
    pub fn new(api_name: impl Into<String>, method: HttpMethod, handler: HandlerRef) -> Self {
        Self {
            api_name: api_name.into(),
            endpoint: String::new(),
            method,
            handler: Some(handler),
        }
    }

    /// A contract with no handler attached. Registration rejects it.
    pub fn unbound(api_name: impl Into<String>, method: HttpMethod) -> Self {
        Self {
            api_name: api_name.into(),
            endpoint: String::new(),
            method,
            handler: None,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn effective_endpoint(&self) -> &str {
        if self.endpoint.is_empty() {
            &self.api_name
        } else {
            &self.endpoint
        }
    }
}

/// MCP-tool contract attached to a capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpToolContract {
    pub tool_name: String,
    /// Tool identifier exposed to agents; defaults to `tool_name`.
    #[serde(default)]
    pub identifier: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_object_schema")]
    pub input_schema: Value,
    #[serde(skip)]
    pub handler: Option<HandlerRef>,
}

fn empty_object_schema() -> Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

impl McpToolContract {
    pub fn new(tool_name: impl Into<String>, input_schema: Value, handler: HandlerRef) -> Self {
        Self {
            tool_name: tool_name.into(),
            identifier: String::new(),
            description: String::new(),
            input_schema,
            handler: Some(handler),
        }
    }

    pub fn unbound(tool_name: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            identifier: String::new(),
            description: String::new(),
            input_schema: empty_object_schema(),
            handler: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn effective_identifier(&self) -> &str {
        if self.identifier.is_empty() {
            &self.tool_name
        } else {
            &self.identifier
        }
    }
}

/// Common view over stored binding records.
pub trait Binding: Send + Sync + 'static {
    /// Registry kind, e.g. `"soa_api"`.
    const KIND: &'static str;

    fn binding_name(&self) -> &str;
    fn owning_service(&self) -> &str;
    fn capability_name(&self) -> &str;
    fn tenant_scope(&self) -> Option<&str>;
    fn handler(&self) -> Option<&HandlerRef>;

    /// Structural checks: non-empty name and a non-null handler.
    fn validate(&self) -> CuratorResult<()> {
        if self.binding_name().trim().is_empty() {
            return Err(CuratorError::Validation(format!(
                "{} binding of service '{}' has an empty name",
                Self::KIND,
                self.owning_service()
            )));
        }
        if self.handler().is_none() {
            return Err(CuratorError::NullHandler {
                binding_kind: Self::KIND,
                owning_service: self.owning_service().to_string(),
                binding_name: self.binding_name().to_string(),
            });
        }
        Ok(())
    }
}

/// Stored SOA-API binding.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SoaApiRecord {
    pub api_name: String,
    pub endpoint: String,
    pub method: HttpMethod,
    pub owning_service: String,
    pub capability_name: String,
    pub tenant_scope: Option<String>,
    pub registered_at: DateTime<Utc>,
    #[serde(skip)]
    pub handler: Option<HandlerRef>,
}

impl SoaApiRecord {
    pub fn from_contract(
        contract: &SoaApiContract,
        owning_service: &str,
        capability_name: &str,
        tenant_scope: Option<&str>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            api_name: contract.api_name.clone(),
            endpoint: contract.effective_endpoint().to_string(),
            method: contract.method,
            owning_service: owning_service.to_string(),
            capability_name: capability_name.to_string(),
            tenant_scope: tenant_scope.map(str::to_string),
            registered_at: now,
            handler: contract.handler.clone(),
        }
    }
}

impl Binding for SoaApiRecord {
    const KIND: &'static str = "soa_api";

    fn binding_name(&self) -> &str {
        &self.api_name
    }
    fn owning_service(&self) -> &str {
        &self.owning_service
    }
    fn capability_name(&self) -> &str {
        &self.capability_name
    }
    fn tenant_scope(&self) -> Option<&str> {
        self.tenant_scope.as_deref()
    }
    fn handler(&self) -> Option<&HandlerRef> {
        self.handler.as_ref()
    }
}

/// Stored MCP-tool binding.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct McpToolRecord {
    pub tool_name: String,
    pub identifier: String,
    pub description: String,
    pub input_schema: Value,
    pub owning_service: String,
    pub capability_name: String,
    pub tenant_scope: Option<String>,
    pub registered_at: DateTime<Utc>,
    #[serde(skip)]
    pub handler: Option<HandlerRef>,
}

impl McpToolRecord {
    pub fn from_contract(
        contract: &McpToolContract,
        owning_service: &str,
        capability_name: &str,
        tenant_scope: Option<&str>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            tool_name: contract.tool_name.clone(),
            identifier: contract.effective_identifier().to_string(),
            description: contract.description.clone(),
            input_schema: contract.input_schema.clone(),
            owning_service: owning_service.to_string(),
            capability_name: capability_name.to_string(),
            tenant_scope: tenant_scope.map(str::to_string),
            registered_at: now,
            handler: contract.handler.clone(),
        }
    }
}

impl Binding for McpToolRecord {
    const KIND: &'static str = "mcp_tool";

    fn binding_name(&self) -> &str {
        &self.tool_name
    }
    fn owning_service(&self) -> &str {
        &self.owning_service
    }
    fn capability_name(&self) -> &str {
        &self.capability_name
    }
    fn tenant_scope(&self) -> Option<&str> {
        self.tenant_scope.as_deref()
    }
    fn handler(&self) -> Option<&HandlerRef> {
        self.handler.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_from_contract_applies_defaults() {
        let contract = SoaApiContract::new("/v1/parse", HttpMethod::Post, HandlerRef::new(()));
        let record = SoaApiRecord::from_contract(&contract, "parser-1", "parse_pdf", Some("A"), Utc::now());
        assert_eq!(record.endpoint, "/v1/parse");
        assert_eq!(record.tenant_scope.as_deref(), Some("A"));
        assert!(record.validate().is_ok());
    }

    #[test]
    fn test_null_handler_rejected() {
        let contract = McpToolContract::unbound("parse_pdf_tool");
        let record = McpToolRecord::from_contract(&contract, "parser-1", "parse_pdf", None, Utc::now());
        let err = record.validate().unwrap_err();
        assert_eq!(err.code(), "NULL_HANDLER");
        assert_eq!(record.identifier, "parse_pdf_tool");
    }

    #[test]
    fn test_method_serde() {
        assert_eq!(serde_json::to_string(&HttpMethod::Post).unwrap(), "\"POST\"");
        let method: HttpMethod = serde_json::from_str("\"DELETE\"").unwrap();
        assert_eq!(method, HttpMethod::Delete);
    }
}
