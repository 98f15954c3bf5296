//! Append-only violation ledger.
//!
//! Entries are never removed. Re-validating a service marks open entries it
//! no longer produces as resolved; violations that are still present keep
//! their original entry.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use super::rule::Severity;
use super::violation::AntiPatternViolation;
use crate::store::RecordStore;

/// A recorded violation and, once superseded, when it was resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerEntry {
    #[serde(flatten)]
    pub violation: AntiPatternViolation,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl LedgerEntry {
    pub fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }
}

/// Outcome of recording one validation run.
#[derive(Debug, Clone, Default)]
pub struct LedgerUpdate {
    /// Violations currently open for the service, in the run's order.
    pub open: Vec<AntiPatternViolation>,
    pub newly_recorded: usize,
    pub resolved: usize,
}

pub struct ViolationLedger {
    store: RecordStore<String, LedgerEntry>,
    /// Serializes runs so two validations of one service cannot both append
    /// the same breach.
    write_lock: Mutex<()>,
}

impl ViolationLedger {
    pub fn new(store: RecordStore<String, LedgerEntry>) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
        }
    }

    /// Record the complete result of validating `service_name`.
    pub fn record_run(
        &self,
        service_name: &str,
        violations: Vec<AntiPatternViolation>,
        now: DateTime<Utc>,
    ) -> LedgerUpdate {
        let _guard = self.write_lock.lock();

        let open_before = self
            .store
            .list(|e| e.is_open() && e.violation.service_name == service_name);

        let current: HashSet<(&str, &str)> = violations.iter().map(|v| v.fingerprint()).collect();
        let mut resolved = 0;
        for entry in &open_before {
            if current.contains(&entry.violation.fingerprint()) {
                continue;
            }
            let marked = self.store.update(&entry.violation.violation_id, |e| {
                let mut next = e.clone();
                next.resolved_at = Some(now);
                Ok::<_, ()>(next)
            });
            if matches!(marked, Some(Ok(_))) {
                resolved += 1;
            }
        }

        let mut update = LedgerUpdate {
            resolved,
            ..Default::default()
        };
        for violation in violations {
            let existing = open_before
                .iter()
                .find(|e| e.violation.fingerprint() == violation.fingerprint());
            match existing {
                Some(entry) => update.open.push(entry.violation.clone()),
                None => {
                    self.store.put(
                        violation.violation_id.clone(),
                        LedgerEntry {
                            violation: violation.clone(),
                            resolved_at: None,
                        },
                    );
                    update.newly_recorded += 1;
                    update.open.push(violation);
                }
            }
        }

        if update.newly_recorded > 0 || update.resolved > 0 {
            log::info!(
                "Violations for '{}': {} new, {} resolved, {} open",
                service_name,
                update.newly_recorded,
                update.resolved,
                update.open.len()
            );
        }
        update
    }

    /// Resolve every open entry of a service (e.g. when it leaves the platform).
    pub fn resolve_service(&self, service_name: &str, now: DateTime<Utc>) -> usize {
        self.record_run(service_name, Vec::new(), now).resolved
    }

    /// Open violations, optionally for one subject id or service name.
    pub fn open(&self, subject: Option<&str>) -> Vec<AntiPatternViolation> {
        self.store
            .list(|e| e.is_open() && subject.map_or(true, |s| e.violation.concerns(s)))
            .iter()
            .map(|e| e.violation.clone())
            .collect()
    }

    /// Every entry, resolved ones included.
    pub fn history(&self, subject: Option<&str>) -> Vec<Arc<LedgerEntry>> {
        self.store
            .list(|e| subject.map_or(true, |s| e.violation.concerns(s)))
    }

    pub fn open_count(&self) -> usize {
        self.store.list(LedgerEntry::is_open).len()
    }

    pub fn has_open_at_least(&self, severity: Severity) -> bool {
        !self
            .store
            .list(|e| e.is_open() && e.violation.severity >= severity)
            .is_empty()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

impl Default for ViolationLedger {
    fn default() -> Self {
        Self::new(RecordStore::new("violation"))
    }
}
