//! # Pattern Validation & Anti-Pattern Detection
//!
//! Evaluates a service and its capabilities against declarative rules and
//! reports violations. Validation is pure and advisory; whether a violation
//! blocks registration is decided by the curator's [`EnforcementMode`].
//!
//! ## Architecture
//!
//! ```text
//! RuleSet (YAML) ──compile──► PatternRule[] ──► PatternEngine::validate
//!                                                     │
//!                                                     ▼
//!                                   ViolationLedger::record_run (append-only)
//! ```

pub mod engine;
pub mod ledger;
pub mod rule;
pub mod rules;
pub mod violation;

use serde::{Deserialize, Serialize};

pub use engine::{has_blocking, PatternEngine};
pub use ledger::{LedgerEntry, LedgerUpdate, ViolationLedger};
pub use rule::{PatternRule, RuleCheck, Severity};
pub use rules::{builtin_rules, NameTarget, RuleKind, RuleSet, RuleSpec};
pub use violation::AntiPatternViolation;

/// How the curator acts on blocking violations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum EnforcementMode {
    /// Record and report; never reject.
    #[default]
    AuditOnly,
    /// Reject registrations that produce a blocking violation.
    Strict,
}

impl EnforcementMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "audit_only" | "audit" => Some(Self::AuditOnly),
            "strict" => Some(Self::Strict),
            _ => None,
        }
    }
}
