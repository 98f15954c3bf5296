//! Pattern rules: pure predicates over service and capability records.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::capabilities::CapabilityDefinition;
use crate::services::ServiceRecord;

/// Violation severity, ordered `info < warning < error < blocking`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    #[default]
    Warning,
    Error,
    Blocking,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
            Severity::Blocking => write!(f, "blocking"),
        }
    }
}

pub type ServicePredicate = dyn Fn(&ServiceRecord) -> Option<String> + Send + Sync;
pub type CapabilityPredicate = dyn Fn(&ServiceRecord, &CapabilityDefinition) -> Option<String> + Send + Sync;

/// What a rule inspects. The predicate returns violation details, or `None`
/// when the subject complies.
#[derive(Clone)]
pub enum RuleCheck {
    Service(Arc<ServicePredicate>),
    Capability(Arc<CapabilityPredicate>),
}

/// One declarative architecture constraint.
#[derive(Clone)]
pub struct PatternRule {
    pub rule_id: String,
    pub severity: Severity,
    pub description: String,
    pub suggested_fix: Option<String>,
    pub check: RuleCheck,
}

impl PatternRule {
    /// A rule evaluated once per service instance.
    pub fn service<F>(rule_id: impl Into<String>, severity: Severity, check: F) -> Self
    where
        F: Fn(&ServiceRecord) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            rule_id: rule_id.into(),
            severity,
            description: String::new(),
            suggested_fix: None,
            check: RuleCheck::Service(Arc::new(check)),
        }
    }

    /// A rule evaluated once per capability of a service.
    pub fn capability<F>(rule_id: impl Into<String>, severity: Severity, check: F) -> Self
    where
        F: Fn(&ServiceRecord, &CapabilityDefinition) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            rule_id: rule_id.into(),
            severity,
            description: String::new(),
            suggested_fix: None,
            check: RuleCheck::Capability(Arc::new(check)),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_suggested_fix(mut self, fix: impl Into<String>) -> Self {
        self.suggested_fix = Some(fix.into());
        self
    }
}

impl fmt::Debug for PatternRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let target = match self.check {
            RuleCheck::Service(_) => "service",
            RuleCheck::Capability(_) => "capability",
        };
        f.debug_struct("PatternRule")
            .field("rule_id", &self.rule_id)
            .field("severity", &self.severity)
            .field("target", &target)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_order() {
        assert!(Severity::Info < Severity::Warning);
        assert!(Severity::Warning < Severity::Error);
        assert!(Severity::Error < Severity::Blocking);
        assert_eq!(serde_json::to_string(&Severity::Blocking).unwrap(), "\"blocking\"");
    }
}
