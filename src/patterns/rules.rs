//! Declarative rule specs (YAML) and the built-in conventions.
//!
//! ```yaml
//! rules:
//!   - rule_id: finance_requires_tenant
//!     kind: require_tenant_scope
//!     severity: blocking
//!     realms: [finance]
//!   - rule_id: foundation_stays_low
//!     kind: forbidden_dependency
//!     layer: foundation
//!     forbidden: [business_enablement, experience]
//!   - rule_id: api_prefix
//!     kind: soa_endpoint_prefix
//!     prefix: /api/
//!   - rule_id: tool_suffix
//!     kind: name_pattern
//!     target: mcp_tool
//!     pattern: "^[a-z][a-z0-9_]*_tool$"
//!     severity: info
//! ```

use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::rule::{PatternRule, Severity};
use crate::errors::{CuratorError, CuratorResult};

/// What a `name_pattern` rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NameTarget {
    Service,
    Capability,
    SoaApi,
    McpTool,
}

/// Rule kinds that can be declared in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleKind {
    /// Services (optionally only in `realms`) must declare a tenant scope.
    RequireTenantScope {
        #[serde(default)]
        realms: Vec<String>,
    },
    /// Names of `target` must match `pattern`.
    NamePattern { target: NameTarget, pattern: String },
    /// A service in `layer` must not depend on any of `forbidden`.
    ForbiddenDependency { layer: String, forbidden: Vec<String> },
    /// SOA-API endpoints must start with `prefix`.
    SoaEndpointPrefix { prefix: String },
    /// Capabilities must carry a description.
    RequireDescription,
}

/// One declared rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub rule_id: String,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub suggested_fix: Option<String>,
    #[serde(flatten)]
    pub kind: RuleKind,
}

/// A file of rule specs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default)]
    pub rules: Vec<RuleSpec>,
}

impl RuleSet {
    pub fn from_yaml(yaml: &str) -> CuratorResult<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> CuratorResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn compile(&self) -> CuratorResult<Vec<PatternRule>> {
        self.rules.iter().map(RuleSpec::compile).collect()
    }
}

impl RuleSpec {
    /// Compile into an executable rule. Invalid regexes are configuration
    /// errors.
    pub fn compile(&self) -> CuratorResult<PatternRule> {
        if self.rule_id.trim().is_empty() {
            return Err(CuratorError::Config("pattern rule with empty rule_id".into()));
        }

        let rule = match &self.kind {
            RuleKind::RequireTenantScope { realms } => {
                let realms = realms.clone();
                PatternRule::service(&self.rule_id, self.severity, move |s| {
                    let applies = realms.is_empty() || realms.iter().any(|r| r == &s.realm);
                    (applies && s.tenant_scope.is_none()).then(|| {
                        format!("service '{}' in realm '{}' declares no tenant scope", s.service_name, s.realm)
                    })
                })
            }
            RuleKind::NamePattern { target, pattern } => {
                let regex = Regex::new(pattern).map_err(|e| {
                    CuratorError::Config(format!("rule '{}': invalid pattern '{}': {}", self.rule_id, pattern, e))
                })?;
                name_rule(&self.rule_id, self.severity, *target, regex)
            }
            RuleKind::ForbiddenDependency { layer, forbidden } => {
                let layer = layer.clone();
                let forbidden = forbidden.clone();
                PatternRule::service(&self.rule_id, self.severity, move |s| {
                    if s.layer.as_deref() != Some(layer.as_str()) {
                        return None;
                    }
                    let offending: Vec<&str> = s
                        .depends_on
                        .iter()
                        .filter(|d| forbidden.contains(d))
                        .map(String::as_str)
                        .collect();
                    (!offending.is_empty()).then(|| {
                        format!(
                            "service '{}' in layer '{}' depends on forbidden {}",
                            s.service_name,
                            layer,
                            offending.join(", ")
                        )
                    })
                })
            }
            RuleKind::SoaEndpointPrefix { prefix } => {
                let prefix = prefix.clone();
                PatternRule::capability(&self.rule_id, self.severity, move |_, c| {
                    let endpoint = c.contracts.soa_api.as_ref()?.effective_endpoint().to_string();
                    (!endpoint.starts_with(&prefix))
                        .then(|| format!("endpoint '{}' does not start with '{}'", endpoint, prefix))
                })
            }
            RuleKind::RequireDescription => PatternRule::capability(&self.rule_id, self.severity, |_, c| {
                c.description
                    .trim()
                    .is_empty()
                    .then(|| format!("capability '{}' has no description", c.capability_name))
            }),
        };

        let mut rule = rule.with_description(&self.description);
        rule.suggested_fix = self.suggested_fix.clone();
        Ok(rule)
    }
}

fn name_rule(rule_id: &str, severity: Severity, target: NameTarget, regex: Regex) -> PatternRule {
    match target {
        NameTarget::Service => PatternRule::service(rule_id, severity, move |s| {
            (!regex.is_match(&s.service_name))
                .then(|| format!("service name '{}' does not match {}", s.service_name, regex.as_str()))
        }),
        NameTarget::Capability => PatternRule::capability(rule_id, severity, move |_, c| {
            (!regex.is_match(&c.capability_name))
                .then(|| format!("capability name '{}' does not match {}", c.capability_name, regex.as_str()))
        }),
        NameTarget::SoaApi => PatternRule::capability(rule_id, severity, move |_, c| {
            let endpoint = c.contracts.soa_api.as_ref()?.effective_endpoint();
            (!regex.is_match(endpoint))
                .then(|| format!("SOA endpoint '{}' does not match {}", endpoint, regex.as_str()))
        }),
        NameTarget::McpTool => PatternRule::capability(rule_id, severity, move |_, c| {
            let tool = &c.contracts.mcp_tool.as_ref()?.tool_name;
            (!regex.is_match(tool)).then(|| format!("MCP tool name '{}' does not match {}", tool, regex.as_str()))
        }),
    }
}

static SERVICE_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z][a-z0-9_-]*$").unwrap());
static CAPABILITY_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z][a-z0-9_.]*$").unwrap());
static MCP_TOOL_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z][a-z0-9_]*$").unwrap());
static SOA_ENDPOINT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(/[a-z0-9_{}.-]+)+$").unwrap());

/// Naming and endpoint conventions applied when no rules are configured.
pub fn builtin_rules() -> Vec<PatternRule> {
    vec![
        name_rule("service_naming", Severity::Warning, NameTarget::Service, SERVICE_NAME.clone())
            .with_description("Service names are lowercase with dashes or underscores")
            .with_suggested_fix("Rename the service to lowercase, e.g. 'content-parser'"),
        name_rule("capability_naming", Severity::Warning, NameTarget::Capability, CAPABILITY_NAME.clone())
            .with_description("Capability names are lowercase snake_case")
            .with_suggested_fix("Use lowercase with underscores, e.g. 'parse_pdf'"),
        name_rule("mcp_tool_naming", Severity::Warning, NameTarget::McpTool, MCP_TOOL_NAME.clone())
            .with_description("MCP tool naming conventions")
            .with_suggested_fix("Use lowercase with underscores, consider adding _tool suffix"),
        name_rule("soa_endpoint_structure", Severity::Error, NameTarget::SoaApi, SOA_ENDPOINT.clone())
            .with_description("SOA endpoint structure requirements")
            .with_suggested_fix("Use lowercase path segments starting with '/', e.g. '/v1/parse'"),
    ]
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::capabilities::CapabilityDefinition;
    use crate::contracts::{HandlerRef, HttpMethod, McpToolContract, SoaApiContract};
    use crate::patterns::PatternEngine;
    use crate::services::ServiceRecord;

    const RULES: &str = r#"
rules:
  - rule_id: finance_requires_tenant
    kind: require_tenant_scope
    severity: blocking
    realms: [finance]
  - rule_id: foundation_stays_low
    kind: forbidden_dependency
    layer: foundation
    forbidden: [business_enablement]
  - rule_id: api_prefix
    kind: soa_endpoint_prefix
    prefix: /api/
  - rule_id: described
    kind: require_description
    severity: info
"#;

    #[test]
    fn test_yaml_rules_compile_and_apply() {
        let rules = RuleSet::from_yaml(RULES).unwrap().compile().unwrap();
        assert_eq!(rules.len(), 4);
        let engine = PatternEngine::new(rules);

        let service = ServiceRecord::new("ledger", "1")
            .with_realm("finance")
            .with_layer("foundation")
            .with_depends_on(["business_enablement", "utilities"]);
        let capability = CapabilityDefinition::new("post_entry", "ledger", "LedgerProtocol")
            .with_soa_api(SoaApiContract::new("/v1/post", HttpMethod::Post, HandlerRef::new(())));

        let violations = engine.validate(&service, [&capability], Utc::now());
        let ids: Vec<&str> = violations.iter().map(|v| v.rule_id.as_str()).collect();
        assert_eq!(ids, vec!["finance_requires_tenant", "api_prefix", "foundation_stays_low", "described"]);
        assert_eq!(violations[0].severity, Severity::Blocking);
        assert!(violations[2].details.contains("business_enablement"));
        assert!(!violations[2].details.contains("utilities"));
    }

    #[test]
    fn test_invalid_regex_is_config_error() {
        let yaml = r#"
rules:
  - rule_id: broken
    kind: name_pattern
    target: service
    pattern: "([a-z"
"#;
        let err = RuleSet::from_yaml(yaml).unwrap().compile().unwrap_err();
        assert!(matches!(err, CuratorError::Config(_)));
    }

    #[test]
    fn test_builtin_conventions() {
        let engine = PatternEngine::new(builtin_rules());
        let compliant = CapabilityDefinition::new("parse_pdf", "parser-1", "ContentParsingProtocol")
            .with_soa_api(SoaApiContract::new("/v1/parse", HttpMethod::Post, HandlerRef::new(())))
            .with_mcp_tool(McpToolContract::new("parse_pdf_tool", serde_json::json!({}), HandlerRef::new(())));
        let service = ServiceRecord::new("parser-1", "i-1");
        assert!(engine.validate(&service, [&compliant], Utc::now()).is_empty());

        let sloppy = CapabilityDefinition::new("ParsePDF", "Parser", "P")
            .with_soa_api(SoaApiContract::new("Parse", HttpMethod::Post, HandlerRef::new(())))
            .with_mcp_tool(McpToolContract::new("Parse-Tool", serde_json::json!({}), HandlerRef::new(())));
        let service = ServiceRecord::new("Parser", "i-1");
        let ids: Vec<String> = engine
            .validate(&service, [&sloppy], Utc::now())
            .into_iter()
            .map(|v| v.rule_id)
            .collect();
        assert_eq!(
            ids,
            vec!["soa_endpoint_structure", "capability_naming", "mcp_tool_naming", "service_naming"]
        );
    }
}
