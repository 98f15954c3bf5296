//! Service registry: instance records keyed by `(service_name, instance_id)`.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use super::record::{ServiceRecord, ServiceStatus, ServiceUpdate};
use crate::errors::{CuratorError, CuratorResult};
use crate::store::{RecordStore, ScopedKey};

/// Result of a successful registration.
#[derive(Debug, Clone)]
pub struct ServiceRegistration {
    pub record: Arc<ServiceRecord>,
    /// Whether a live record for the same instance was replaced.
    pub replaced: bool,
}

/// Result of a deregistration.
#[derive(Debug, Clone)]
pub enum Deregistration {
    /// The instance was live and is now stopped.
    Stopped(Arc<ServiceRecord>),
    /// Unknown or already stopped instance.
    NoOp,
}

impl Deregistration {
    pub fn is_noop(&self) -> bool {
        matches!(self, Deregistration::NoOp)
    }
}

/// Per-status instance counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct ServiceCounts {
    pub starting: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub stopped: usize,
}

/// Registry of service instances.
pub struct ServiceRegistry {
    store: RecordStore<ScopedKey, ServiceRecord>,
}

impl ServiceRegistry {
    pub fn new(store: RecordStore<ScopedKey, ServiceRecord>) -> Self {
        Self { store }
    }

    /// Store a validated instance record.
    ///
    /// Re-registering a live instance replaces it and keeps the original
    /// `registered_at`; re-registering a stopped one is a terminal-state
    /// error.
    pub fn register(&self, record: ServiceRecord, now: DateTime<Utc>) -> CuratorResult<ServiceRegistration> {
        self.register_with(record, now, |_| Ok(()))
    }

    /// [`register`](Self::register) with an admission check run against the
    /// record being replaced, under the same entry lock as the write.
    ///
    /// A replacement must respect the status state machine: a healthy
    /// instance cannot re-register as `starting`.
    pub fn register_with<A>(&self, record: ServiceRecord, now: DateTime<Utc>, admit: A) -> CuratorResult<ServiceRegistration>
    where
        A: FnOnce(&ServiceRecord) -> CuratorResult<()>,
    {
        record.validate_for_registration()?;

        let (stored, previous) = self.store.upsert_with(record.key(), |current| {
            let mut next = record.clone();
            next.last_heartbeat_at = now;
            next.stopped_at = None;
            match current {
                Some(existing) if existing.status == ServiceStatus::Stopped => {
                    Err(CuratorError::TerminalState {
                        service_name: existing.service_name.clone(),
                        instance_id: existing.instance_id.clone(),
                        requested: record.status,
                    })
                }
                Some(existing) => {
                    admit(existing)?;
                    if !existing.status.can_transition_to(record.status) {
                        return Err(CuratorError::InvalidTransition {
                            service_name: existing.service_name.clone(),
                            instance_id: existing.instance_id.clone(),
                            from: existing.status,
                            to: record.status,
                        });
                    }
                    next.registered_at = existing.registered_at;
                    Ok(next)
                }
                None => {
                    next.registered_at = now;
                    Ok(next)
                }
            }
        })?;

        Ok(ServiceRegistration {
            record: stored,
            replaced: previous.is_some(),
        })
    }

    /// Import a record as announced elsewhere (re-hydration). Existing local
    /// records always win.
    pub fn import(&self, record: ServiceRecord) -> bool {
        if self.store.contains(&record.key()) {
            return false;
        }
        self.store.upsert_with(record.key(), |current| match current {
            Some(_) => Err(()),
            None => Ok(record.clone()),
        })
        .is_ok()
    }

    pub fn get(&self, service_name: &str, instance_id: &str) -> Option<Arc<ServiceRecord>> {
        self.store.get(&ScopedKey::new(service_name, instance_id))
    }

    /// Live instances matching realm/type and `filter`, ordered by
    /// `registered_at` ascending.
    pub fn discover<F>(&self, realm: Option<&str>, service_type: Option<&str>, filter: F) -> Vec<Arc<ServiceRecord>>
    where
        F: Fn(&ServiceRecord) -> bool,
    {
        let mut found = self.store.list(|r| {
            r.status.is_live()
                && realm.map_or(true, |realm| r.realm == realm)
                && service_type.map_or(true, |t| r.service_type == t)
                && filter(r)
        });
        // Stable: insertion order breaks registered_at ties.
        found.sort_by_key(|r| r.registered_at);
        found
    }

    /// Every stored instance in any status.
    pub fn list<F>(&self, filter: F) -> Vec<Arc<ServiceRecord>>
    where
        F: Fn(&ServiceRecord) -> bool,
    {
        self.store.list(filter)
    }

    /// Apply a health report. Returns `(previous_status, updated_record)`.
    pub fn report_health(
        &self,
        service_name: &str,
        instance_id: &str,
        status: ServiceStatus,
        now: DateTime<Utc>,
    ) -> CuratorResult<(ServiceStatus, Arc<ServiceRecord>)> {
        let key = ScopedKey::new(service_name, instance_id);
        let mut previous = None;
        let updated = self
            .store
            .update(&key, |current| {
                previous = Some(current.status);
                current.transitioned(status, now)
            })
            .ok_or_else(|| CuratorError::not_found("service instance", key.to_string()))??;
        Ok((previous.unwrap_or(status), updated))
    }

    /// Refresh liveness without changing status.
    pub fn heartbeat(&self, service_name: &str, instance_id: &str, now: DateTime<Utc>) -> CuratorResult<Arc<ServiceRecord>> {
        let key = ScopedKey::new(service_name, instance_id);
        self.store
            .update(&key, |current| {
                if current.status == ServiceStatus::Stopped {
                    // A heartbeat claims liveness, which a stopped instance cannot regain.
                    return Err(CuratorError::TerminalState {
                        service_name: current.service_name.clone(),
                        instance_id: current.instance_id.clone(),
                        requested: ServiceStatus::Healthy,
                    });
                }
                let mut next = current.clone();
                next.last_heartbeat_at = now;
                Ok(next)
            })
            .ok_or_else(|| CuratorError::not_found("service instance", key.to_string()))?
    }

    /// Mark an instance stopped. Idempotent.
    pub fn deregister(&self, service_name: &str, instance_id: &str, now: DateTime<Utc>) -> Deregistration {
        let key = ScopedKey::new(service_name, instance_id);
        match self.store.update(&key, |current| current.transitioned(ServiceStatus::Stopped, now)) {
            Some(Ok(record)) => Deregistration::Stopped(record),
            Some(Err(_)) | None => Deregistration::NoOp,
        }
    }

    /// Apply `update` to one non-stopped instance. `admit` runs against the
    /// current record under the entry lock.
    pub fn update_metadata<A>(
        &self,
        service_name: &str,
        instance_id: &str,
        update: &ServiceUpdate,
        admit: A,
    ) -> CuratorResult<Arc<ServiceRecord>>
    where
        A: FnOnce(&ServiceRecord) -> CuratorResult<()>,
    {
        let key = ScopedKey::new(service_name, instance_id);
        self.store
            .update(&key, |current| {
                admit(current)?;
                if current.status == ServiceStatus::Stopped {
                    return Err(CuratorError::TerminalState {
                        service_name: current.service_name.clone(),
                        instance_id: current.instance_id.clone(),
                        requested: current.status,
                    });
                }
                let mut next = current.clone();
                update.apply_to(&mut next);
                Ok(next)
            })
            .ok_or_else(|| CuratorError::not_found("service instance", key.to_string()))?
    }

    /// Mark every non-stopped instance whose last heartbeat is older than
    /// `timeout` as stopped. Returns the newly stopped records.
    pub fn expire(&self, now: DateTime<Utc>, timeout: Duration) -> Vec<Arc<ServiceRecord>> {
        // A timeout reaching past the earliest representable time expires nothing.
        let Some(cutoff) = now.checked_sub_signed(timeout) else {
            return Vec::new();
        };
        let candidates = self
            .store
            .list(|r| r.status != ServiceStatus::Stopped && r.last_heartbeat_at < cutoff);

        candidates
            .iter()
            .filter_map(|candidate| {
                // Re-check under the key lock; a heartbeat may have landed since the scan.
                self.store
                    .update(&candidate.key(), |current| {
                        if current.status == ServiceStatus::Stopped || current.last_heartbeat_at >= cutoff {
                            return Err(());
                        }
                        current.transitioned(ServiceStatus::Stopped, now).map_err(|_| ())
                    })
                    .and_then(Result::ok)
            })
            .collect()
    }

    /// Remove stopped instances whose stop time is older than `retention`.
    pub fn purge_stopped(&self, now: DateTime<Utc>, retention: Duration) -> Vec<Arc<ServiceRecord>> {
        let Some(cutoff) = now.checked_sub_signed(retention) else {
            return Vec::new();
        };
        self.store.delete_where(|_, r| {
            r.status == ServiceStatus::Stopped && r.stopped_at.map_or(false, |at| at < cutoff)
        })
    }

    /// Whether any non-stopped instance of `service_name` exists.
    pub fn has_active_instance(&self, service_name: &str) -> bool {
        !self
            .store
            .list(|r| r.service_name == service_name && r.status != ServiceStatus::Stopped)
            .is_empty()
    }

    pub fn counts(&self) -> ServiceCounts {
        let mut counts = ServiceCounts::default();
        for record in self.store.all() {
            match record.status {
                ServiceStatus::Starting => counts.starting += 1,
                ServiceStatus::Healthy => counts.healthy += 1,
                ServiceStatus::Degraded => counts.degraded += 1,
                ServiceStatus::Stopped => counts.stopped += 1,
            }
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new(RecordStore::new("service"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ServiceRegistry {
        ServiceRegistry::default()
    }

    #[test]
    fn test_register_and_replace_keeps_registered_at() {
        let reg = registry();
        let t0 = Utc::now();
        let first = reg
            .register(ServiceRecord::new("parser-1", "i-1").with_realm("content"), t0)
            .unwrap();
        assert!(!first.replaced);
        assert_eq!(first.record.registered_at, t0);

        let t1 = t0 + Duration::seconds(5);
        let second = reg
            .register(
                ServiceRecord::new("parser-1", "i-1")
                    .with_realm("content")
                    .with_status(ServiceStatus::Healthy),
                t1,
            )
            .unwrap();
        assert!(second.replaced);
        assert_eq!(second.record.registered_at, t0);
        assert_eq!(second.record.last_heartbeat_at, t1);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_reregistration_cannot_move_status_backwards() {
        let reg = registry();
        let now = Utc::now();
        reg.register(ServiceRecord::new("parser-1", "i-1"), now).unwrap();
        reg.report_health("parser-1", "i-1", ServiceStatus::Healthy, now).unwrap();

        let err = reg.register(ServiceRecord::new("parser-1", "i-1"), now).unwrap_err();
        assert!(matches!(
            err,
            CuratorError::InvalidTransition {
                from: ServiceStatus::Healthy,
                to: ServiceStatus::Starting,
                ..
            }
        ));
        assert_eq!(reg.get("parser-1", "i-1").unwrap().status, ServiceStatus::Healthy);

        reg.report_health("parser-1", "i-1", ServiceStatus::Degraded, now).unwrap();
        let recovered = reg
            .register(ServiceRecord::new("parser-1", "i-1").with_status(ServiceStatus::Healthy), now)
            .unwrap();
        assert_eq!(recovered.record.status, ServiceStatus::Healthy);
    }

    #[test]
    fn test_admission_runs_against_replaced_record() {
        let reg = registry();
        let now = Utc::now();
        reg.register(ServiceRecord::new("parser-1", "i-1").with_tenant("A"), now).unwrap();

        let err = reg
            .register_with(ServiceRecord::new("parser-1", "i-1"), now, |existing| {
                match existing.tenant_scope.as_deref() {
                    Some("A") => Err(CuratorError::AccessDenied("tenant A".into())),
                    _ => Ok(()),
                }
            })
            .unwrap_err();
        assert!(matches!(err, CuratorError::AccessDenied(_)));
        assert_eq!(reg.get("parser-1", "i-1").unwrap().tenant_scope.as_deref(), Some("A"));
    }

    #[test]
    fn test_update_metadata() {
        let reg = registry();
        let now = Utc::now();
        reg.register(ServiceRecord::new("parser-1", "i-1").with_version("1.0"), now).unwrap();

        let update = ServiceUpdate {
            version: Some("2.0".into()),
            tags: Some(vec!["v2".into()]),
            ..Default::default()
        };
        let updated = reg.update_metadata("parser-1", "i-1", &update, |_| Ok(())).unwrap();
        assert_eq!(updated.version.as_deref(), Some("2.0"));
        assert_eq!(updated.tags, vec!["v2"]);
        assert_eq!(updated.status, ServiceStatus::Starting);

        reg.deregister("parser-1", "i-1", now);
        assert!(matches!(
            reg.update_metadata("parser-1", "i-1", &update, |_| Ok(())).unwrap_err(),
            CuratorError::TerminalState { .. }
        ));
        assert!(matches!(
            reg.update_metadata("ghost", "1", &update, |_| Ok(())).unwrap_err(),
            CuratorError::NotFound { .. }
        ));
    }

    #[test]
    fn test_discover_excludes_starting_and_stopped() {
        let reg = registry();
        let now = Utc::now();
        reg.register(ServiceRecord::new("a", "1").with_realm("content"), now).unwrap();
        reg.register(
            ServiceRecord::new("b", "1")
                .with_realm("content")
                .with_status(ServiceStatus::Healthy),
            now + Duration::seconds(1),
        )
        .unwrap();
        reg.register(
            ServiceRecord::new("c", "1")
                .with_realm("content")
                .with_status(ServiceStatus::Healthy),
            now,
        )
        .unwrap();
        reg.deregister("c", "1", now);

        let found = reg.discover(Some("content"), None, |_| true);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].service_name, "b");
        assert!(reg.discover(Some("analytics"), None, |_| true).is_empty());
    }

    #[test]
    fn test_discover_orders_by_registered_at() {
        let reg = registry();
        let now = Utc::now();
        for (name, offset) in [("late", 10), ("early", 1), ("middle", 5)] {
            reg.register(
                ServiceRecord::new(name, "1").with_status(ServiceStatus::Healthy),
                now + Duration::seconds(offset),
            )
            .unwrap();
        }
        let names: Vec<String> = reg
            .discover(None, None, |_| true)
            .iter()
            .map(|r| r.service_name.clone())
            .collect();
        assert_eq!(names, vec!["early", "middle", "late"]);
    }

    #[test]
    fn test_terminal_state_is_immutable() {
        let reg = registry();
        let now = Utc::now();
        reg.register(ServiceRecord::new("svc", "1"), now).unwrap();
        reg.report_health("svc", "1", ServiceStatus::Stopped, now).unwrap();

        let err = reg.report_health("svc", "1", ServiceStatus::Healthy, now).unwrap_err();
        assert!(matches!(err, CuratorError::TerminalState { .. }));
        assert!(matches!(
            reg.heartbeat("svc", "1", now).unwrap_err(),
            CuratorError::TerminalState { .. }
        ));
        assert!(matches!(
            reg.register(ServiceRecord::new("svc", "1"), now).unwrap_err(),
            CuratorError::TerminalState { .. }
        ));
        assert_eq!(reg.get("svc", "1").unwrap().status, ServiceStatus::Stopped);
    }

    #[test]
    fn test_report_health_unknown_instance() {
        let reg = registry();
        let err = reg
            .report_health("ghost", "1", ServiceStatus::Healthy, Utc::now())
            .unwrap_err();
        assert!(matches!(err, CuratorError::NotFound { .. }));
    }

    #[test]
    fn test_deregister_is_idempotent() {
        let reg = registry();
        let now = Utc::now();
        reg.register(ServiceRecord::new("svc", "1"), now).unwrap();
        assert!(!reg.deregister("svc", "1", now).is_noop());
        assert!(reg.deregister("svc", "1", now).is_noop());
        assert!(reg.deregister("ghost", "1", now).is_noop());
    }

    #[test]
    fn test_expire_and_purge() {
        let reg = registry();
        let t0 = Utc::now();
        reg.register(ServiceRecord::new("stale", "1").with_status(ServiceStatus::Healthy), t0)
            .unwrap();
        reg.register(ServiceRecord::new("fresh", "1").with_status(ServiceStatus::Healthy), t0)
            .unwrap();
        reg.heartbeat("fresh", "1", t0 + Duration::seconds(80)).unwrap();

        let t1 = t0 + Duration::seconds(100);
        let expired = reg.expire(t1, Duration::seconds(90));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].service_name, "stale");
        assert!(!reg.has_active_instance("stale"));
        assert!(reg.has_active_instance("fresh"));

        assert!(reg.purge_stopped(t1, Duration::seconds(60)).is_empty());
        let purged = reg.purge_stopped(t1 + Duration::seconds(61), Duration::seconds(60));
        assert_eq!(purged.len(), 1);
        assert!(reg.get("stale", "1").is_none());
    }

    #[test]
    fn test_unbounded_windows_expire_nothing() {
        let reg = registry();
        let t0 = Utc::now();
        reg.register(ServiceRecord::new("svc", "1").with_status(ServiceStatus::Healthy), t0)
            .unwrap();
        reg.register(ServiceRecord::new("gone", "1"), t0).unwrap();
        reg.deregister("gone", "1", t0);

        let later = t0 + Duration::days(365);
        assert!(reg.expire(later, Duration::MAX).is_empty());
        assert!(reg.purge_stopped(later, Duration::MAX).is_empty());
        assert!(reg.has_active_instance("svc"));
        assert!(reg.get("gone", "1").is_some());
    }

    #[test]
    fn test_counts() {
        let reg = registry();
        let now = Utc::now();
        reg.register(ServiceRecord::new("a", "1"), now).unwrap();
        reg.register(ServiceRecord::new("b", "1").with_status(ServiceStatus::Healthy), now)
            .unwrap();
        reg.report_health("b", "1", ServiceStatus::Degraded, now).unwrap();
        let counts = reg.counts();
        assert_eq!(counts.starting, 1);
        assert_eq!(counts.degraded, 1);
    }
}
