//! Pure validation over a service and its capabilities.

use chrono::{DateTime, Utc};

use super::rule::{PatternRule, RuleCheck, Severity};
use super::violation::AntiPatternViolation;
use crate::capabilities::CapabilityDefinition;
use crate::services::ServiceRecord;

/// Evaluates every loaded rule against a subject.
#[derive(Debug, Clone, Default)]
pub struct PatternEngine {
    rules: Vec<PatternRule>,
}

impl PatternEngine {
    pub fn new(rules: Vec<PatternRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[PatternRule] {
        &self.rules
    }

    /// Collect violations for `service` and `capabilities`.
    ///
    /// Read-only. Ordered by severity descending, then `rule_id`, then
    /// `subject_id`.
    pub fn validate<'a, I>(&self, service: &ServiceRecord, capabilities: I, now: DateTime<Utc>) -> Vec<AntiPatternViolation>
    where
        I: IntoIterator<Item = &'a CapabilityDefinition>,
    {
        let capabilities: Vec<&CapabilityDefinition> = capabilities.into_iter().collect();
        let mut violations = Vec::new();

        for rule in &self.rules {
            match &rule.check {
                RuleCheck::Service(check) => {
                    if let Some(details) = check(service) {
                        violations.push(self.violation(rule, service.service_name.clone(), service, details, now));
                    }
                }
                RuleCheck::Capability(check) => {
                    for &capability in &capabilities {
                        if let Some(details) = check(service, capability) {
                            let subject = format!("{}/{}", service.service_name, capability.capability_name);
                            violations.push(self.violation(rule, subject, service, details, now));
                        }
                    }
                }
            }
        }

        violations.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then_with(|| a.rule_id.cmp(&b.rule_id))
                .then_with(|| a.subject_id.cmp(&b.subject_id))
        });
        violations
    }

    fn violation(
        &self,
        rule: &PatternRule,
        subject_id: String,
        service: &ServiceRecord,
        details: String,
        now: DateTime<Utc>,
    ) -> AntiPatternViolation {
        AntiPatternViolation::new(
            &rule.rule_id,
            subject_id,
            &service.service_name,
            rule.severity,
            details,
            rule.suggested_fix.clone(),
            now,
        )
    }
}

/// Whether any violation is severe enough to block under strict enforcement.
pub fn has_blocking(violations: &[AntiPatternViolation]) -> bool {
    violations.iter().any(|v| v.severity == Severity::Blocking)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> PatternEngine {
        PatternEngine::new(vec![
            PatternRule::service("b_service_rule", Severity::Warning, |s| {
                s.tenant_scope.is_none().then(|| "no tenant".to_string())
            }),
            PatternRule::capability("a_capability_rule", Severity::Warning, |_, c| {
                c.description.is_empty().then(|| format!("{} has no description", c.capability_name))
            }),
            PatternRule::service("z_blocking", Severity::Blocking, |s| {
                (s.service_name == "bad").then(|| "bad name".to_string())
            }),
        ])
    }

    #[test]
    fn test_ordering_is_deterministic() {
        let service = ServiceRecord::new("bad", "1");
        let caps = vec![
            CapabilityDefinition::new("zeta", "bad", "P"),
            CapabilityDefinition::new("alpha", "bad", "P"),
        ];
        let violations = engine().validate(&service, &caps, Utc::now());
        let order: Vec<(&str, &str)> = violations
            .iter()
            .map(|v| (v.rule_id.as_str(), v.subject_id.as_str()))
            .collect();
        assert_eq!(
            order,
            vec![
                ("z_blocking", "bad"),
                ("a_capability_rule", "bad/alpha"),
                ("a_capability_rule", "bad/zeta"),
                ("b_service_rule", "bad"),
            ]
        );
        assert!(has_blocking(&violations));
    }

    #[test]
    fn test_compliant_subject_yields_nothing() {
        let service = ServiceRecord::new("good", "1").with_tenant("A");
        let caps = vec![CapabilityDefinition::new("parse", "good", "P").with_description("Parses")];
        assert!(engine().validate(&service, &caps, Utc::now()).is_empty());
    }
}
