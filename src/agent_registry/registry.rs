//! Agent capability & health registry keyed by `agent_id`.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::record::{AgentAnalytics, AgentCapabilityRecord, AgentHealth, AgentRegistration};
use crate::errors::{CuratorError, CuratorResult};
use crate::store::RecordStore;

/// Outcome of a usage report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageOutcome {
    /// Counted; carries the new total.
    Recorded { usage_count: u64 },
    /// No such agent. Nothing was created.
    UnknownAgent,
    /// The agent is archived. Nothing was counted.
    ArchivedAgent,
}

impl UsageOutcome {
    /// Whether the report was dropped with a warning.
    pub fn is_warning(&self) -> bool {
        !matches!(self, UsageOutcome::Recorded { .. })
    }
}

/// Registry of agent capability records.
pub struct AgentRegistry {
    store: RecordStore<String, AgentCapabilityRecord>,
}

impl AgentRegistry {
    pub fn new(store: RecordStore<String, AgentCapabilityRecord>) -> Self {
        Self { store }
    }

    /// Create or replace an agent record. Usage history survives
    /// re-registration; an archived agent is reactivated. Returns the record
    /// and whether one already existed.
    pub fn register(
        &self,
        registration: &AgentRegistration,
        now: DateTime<Utc>,
    ) -> CuratorResult<(Arc<AgentCapabilityRecord>, bool)> {
        self.register_with(registration, now, |_| Ok(()))
    }

    /// [`register`](Self::register), with `admit` deciding under the entry
    /// lock whether an existing record may be replaced.
    pub fn register_with<A>(
        &self,
        registration: &AgentRegistration,
        now: DateTime<Utc>,
        admit: A,
    ) -> CuratorResult<(Arc<AgentCapabilityRecord>, bool)>
    where
        A: FnOnce(&AgentCapabilityRecord) -> CuratorResult<()>,
    {
        registration.validate()?;
        let (record, previous) = self
            .store
            .upsert_with(registration.agent_id.clone(), |existing| {
                if let Some(current) = existing {
                    admit(current)?;
                }
                Ok::<_, CuratorError>(AgentCapabilityRecord::from_registration(registration, existing, now))
            })?;

        if let Some(previous) = &previous {
            if previous.is_archived() {
                log::info!("Agent '{}' reactivated", registration.agent_id);
            }
        }
        Ok((record, previous.is_some()))
    }

    /// Count one use of `tag` by `agent_id`. Never creates a record.
    pub fn record_usage(&self, agent_id: &str, tag: &str, now: DateTime<Utc>) -> UsageOutcome {
        let outcome = self.store.update(agent_id, |current| {
            if current.is_archived() {
                return Err(UsageOutcome::ArchivedAgent);
            }
            let mut next = current.clone();
            next.usage_count = next.usage_count.saturating_add(1);
            *next.usage_by_tag.entry(tag.to_string()).or_insert(0) += 1;
            next.last_seen_at = now;
            Ok(next)
        });

        match outcome {
            Some(Ok(record)) => UsageOutcome::Recorded {
                usage_count: record.usage_count,
            },
            Some(Err(outcome)) => {
                log::warn!("Usage of '{}' reported for archived agent '{}'; ignored", tag, agent_id);
                outcome
            }
            None => {
                log::warn!("Usage of '{}' reported for unknown agent '{}'; ignored", tag, agent_id);
                UsageOutcome::UnknownAgent
            }
        }
    }

    /// Update last health status and last-seen time.
    pub fn report_health(
        &self,
        agent_id: &str,
        status: AgentHealth,
        now: DateTime<Utc>,
    ) -> CuratorResult<Arc<AgentCapabilityRecord>> {
        self.store
            .update(agent_id, |current| {
                let mut next = current.clone();
                next.last_health_status = status;
                next.last_seen_at = now;
                Ok(next)
            })
            .ok_or_else(|| CuratorError::not_found("agent", agent_id))?
    }

    /// Archive an agent. Returns `false` for unknown or already archived agents.
    pub fn archive(&self, agent_id: &str, now: DateTime<Utc>) -> bool {
        let outcome = self.store.update(agent_id, |current| {
            if current.is_archived() {
                return Err(());
            }
            let mut next = current.clone();
            next.archived_at = Some(now);
            Ok(next)
        });
        matches!(outcome, Some(Ok(_)))
    }

    pub fn get(&self, agent_id: &str) -> Option<Arc<AgentCapabilityRecord>> {
        self.store.get(agent_id)
    }

    /// Records accepted by `visible`, optionally including archived ones.
    pub fn list<F>(&self, include_archived: bool, visible: F) -> Vec<Arc<AgentCapabilityRecord>>
    where
        F: Fn(&AgentCapabilityRecord) -> bool,
    {
        self.store
            .list(|r| (include_archived || !r.is_archived()) && visible(r))
    }

    /// Active agents advertising `tag`.
    pub fn discover<F>(&self, tag: &str, visible: F) -> Vec<Arc<AgentCapabilityRecord>>
    where
        F: Fn(&AgentCapabilityRecord) -> bool,
    {
        self.store
            .list(|r| !r.is_archived() && r.capability_tags.contains(tag) && visible(r))
    }

    /// Analytics over the records accepted by `visible`.
    pub fn analytics<F>(&self, visible: F) -> AgentAnalytics
    where
        F: Fn(&AgentCapabilityRecord) -> bool,
    {
        let mut analytics = AgentAnalytics::default();
        for record in self.store.list(visible) {
            analytics.total_agents += 1;
            analytics.total_usage += record.usage_count;
            for (tag, count) in &record.usage_by_tag {
                *analytics.usage_by_tag.entry(tag.clone()).or_insert(0) += count;
            }
            if let Some(pillar) = &record.pillar {
                *analytics.usage_by_pillar.entry(pillar.clone()).or_insert(0) += record.usage_count;
            }

            if record.is_archived() {
                analytics.archived_agents += 1;
                continue;
            }
            analytics.active_agents += 1;
            *analytics
                .health_distribution
                .entry(record.last_health_status.to_string())
                .or_insert(0) += 1;
            analytics
                .advertised_tags
                .extend(record.capability_tags.iter().cloned());
        }
        analytics
    }

    /// Active agents whose last report is degraded or unhealthy.
    pub fn impaired_count(&self) -> usize {
        self.store
            .list(|r| {
                !r.is_archived()
                    && matches!(r.last_health_status, AgentHealth::Degraded | AgentHealth::Unhealthy)
            })
            .len()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new(RecordStore::new("agent"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_survives_reregistration() {
        let registry = AgentRegistry::default();
        let now = Utc::now();
        let (record, existed) = registry
            .register(&AgentRegistration::new("agent-1", ["parse", "summarize"]), now)
            .unwrap();
        assert!(!existed);
        assert_eq!(record.usage_count, 0);

        registry.record_usage("agent-1", "parse", now);
        registry.record_usage("agent-1", "parse", now);

        let (record, existed) = registry
            .register(&AgentRegistration::new("agent-1", ["parse"]), now)
            .unwrap();
        assert!(existed);
        assert_eq!(record.usage_count, 2);
        assert_eq!(record.usage_by_tag.get("parse"), Some(&2));
        assert_eq!(record.capability_tags.len(), 1);
    }

    #[test]
    fn test_refused_replacement_keeps_record() {
        let registry = AgentRegistry::default();
        let now = Utc::now();
        registry
            .register(&AgentRegistration::new("agent-7", ["parse"]).with_tenant("A"), now)
            .unwrap();

        let err = registry
            .register_with(&AgentRegistration::new("agent-7", ["steal"]), now, |existing| {
                Err(CuratorError::AccessDenied(existing.agent_id.clone()))
            })
            .unwrap_err();
        assert!(matches!(err, CuratorError::AccessDenied(_)));

        let stored = registry.get("agent-7").unwrap();
        assert_eq!(stored.tenant_scope.as_deref(), Some("A"));
        assert!(stored.capability_tags.contains("parse"));
        assert!(!stored.capability_tags.contains("steal"));
    }

    #[test]
    fn test_usage_for_unknown_agent_is_a_warning() {
        let registry = AgentRegistry::default();
        let outcome = registry.record_usage("ghost", "parse", Utc::now());
        assert_eq!(outcome, UsageOutcome::UnknownAgent);
        assert!(outcome.is_warning());
        assert!(registry.get("ghost").is_none());
    }

    #[test]
    fn test_health_report() {
        let registry = AgentRegistry::default();
        let now = Utc::now();
        assert!(matches!(
            registry.report_health("ghost", AgentHealth::Healthy, now),
            Err(CuratorError::NotFound { .. })
        ));

        registry.register(&AgentRegistration::new("agent-1", ["parse"]), now).unwrap();
        let record = registry.report_health("agent-1", AgentHealth::Degraded, now).unwrap();
        assert_eq!(record.last_health_status, AgentHealth::Degraded);
        assert_eq!(registry.impaired_count(), 1);
    }

    #[test]
    fn test_archive_and_reactivate() {
        let registry = AgentRegistry::default();
        let now = Utc::now();
        registry.register(&AgentRegistration::new("agent-1", ["parse"]), now).unwrap();
        registry.record_usage("agent-1", "parse", now);

        assert!(registry.archive("agent-1", now));
        assert!(!registry.archive("agent-1", now));
        assert_eq!(registry.record_usage("agent-1", "parse", now), UsageOutcome::ArchivedAgent);
        assert!(registry.list(false, |_| true).is_empty());
        assert_eq!(registry.list(true, |_| true).len(), 1);
        assert!(registry.discover("parse", |_| true).is_empty());

        let (record, _) = registry
            .register(&AgentRegistration::new("agent-1", ["parse"]), now)
            .unwrap();
        assert!(!record.is_archived());
        assert_eq!(record.usage_count, 1);
    }

    #[test]
    fn test_concurrent_usage_is_counted() {
        let registry = Arc::new(AgentRegistry::default());
        let now = Utc::now();
        registry.register(&AgentRegistration::new("agent-1", ["parse"]), now).unwrap();

        std::thread::scope(|scope| {
            for _ in 0..4 {
                let registry = Arc::clone(&registry);
                scope.spawn(move || {
                    for _ in 0..250 {
                        registry.record_usage("agent-1", "parse", now);
                    }
                });
            }
        });
        assert_eq!(registry.get("agent-1").unwrap().usage_count, 1000);
    }

    #[test]
    fn test_analytics() {
        let registry = AgentRegistry::default();
        let now = Utc::now();
        registry
            .register(&AgentRegistration::new("a", ["parse"]).with_pillar("content"), now)
            .unwrap();
        registry.register(&AgentRegistration::new("b", ["report"]), now).unwrap();
        registry.record_usage("a", "parse", now);
        registry.record_usage("a", "parse", now);
        registry.record_usage("b", "report", now);
        registry.report_health("a", AgentHealth::Healthy, now).unwrap();
        registry.archive("b", now);

        let analytics = registry.analytics(|_| true);
        assert_eq!(analytics.total_agents, 2);
        assert_eq!(analytics.active_agents, 1);
        assert_eq!(analytics.archived_agents, 1);
        assert_eq!(analytics.total_usage, 3);
        assert_eq!(analytics.usage_by_tag.get("parse"), Some(&2));
        assert_eq!(analytics.usage_by_pillar.get("content"), Some(&2));
        assert_eq!(analytics.health_distribution.get("healthy"), Some(&1));
        assert!(analytics.advertised_tags.contains("parse"));
        assert!(!analytics.advertised_tags.contains("report"));
    }
}
