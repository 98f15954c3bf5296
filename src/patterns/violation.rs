//! Anti-pattern violations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::rule::Severity;

/// A detected breach of a pattern rule. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AntiPatternViolation {
    pub violation_id: String,
    pub rule_id: String,
    /// `service_name` for service rules, `service_name/capability_name` for
    /// capability rules.
    pub subject_id: String,
    /// Owning service of the subject.
    pub service_name: String,
    pub severity: Severity,
    pub detected_at: DateTime<Utc>,
    pub details: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_fix: Option<String>,
}

impl AntiPatternViolation {
    pub(crate) fn new(
        rule_id: &str,
        subject_id: String,
        service_name: &str,
        severity: Severity,
        details: String,
        suggested_fix: Option<String>,
        detected_at: DateTime<Utc>,
    ) -> Self {
        Self {
            violation_id: Uuid::new_v4().to_string(),
            rule_id: rule_id.to_string(),
            subject_id,
            service_name: service_name.to_string(),
            severity,
            detected_at,
            details,
            suggested_fix,
        }
    }

    /// Identity of the breach regardless of when it was detected.
    pub fn fingerprint(&self) -> (&str, &str) {
        (&self.rule_id, &self.subject_id)
    }

    /// Whether the violation concerns `subject` (subject id or service name).
    pub fn concerns(&self, subject: &str) -> bool {
        self.subject_id == subject || self.service_name == subject
    }
}
