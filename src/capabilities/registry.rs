//! Capability Registry: definitions keyed by `(owning_service, capability_name)`.
//!
//! Re-registration replaces the previous definition wholesale; the returned
//! [`CapabilityAck`] says so explicitly.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::capability::{CapabilityDefinition, CapabilityState};
use crate::errors::{CuratorError, CuratorResult};
use crate::security::is_visible_to_tenant;
use crate::store::{RecordStore, ScopedKey};

/// Acknowledgment of a capability registration.
#[derive(Debug, Clone, Serialize)]
pub struct CapabilityAck {
    /// Effective stored record, defaults applied.
    pub capability: Arc<CapabilityDefinition>,
    pub replaced: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Filter for capability listings. Empty fields match everything.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CapabilityFilter {
    #[serde(default)]
    pub owning_service: Option<String>,
    #[serde(default)]
    pub realm: Option<String>,
    /// Visibility filter: records scoped to this tenant plus global ones.
    #[serde(default)]
    pub tenant_scope: Option<String>,
    #[serde(default)]
    pub state: Option<CapabilityState>,
    /// Discovery tag (name, declared tag or semantic domain capability).
    #[serde(default)]
    pub tag: Option<String>,
    /// Case-insensitive substring of the name or description.
    #[serde(default)]
    pub query: Option<String>,
}

impl CapabilityFilter {
    pub fn for_service(owning_service: impl Into<String>) -> Self {
        Self {
            owning_service: Some(owning_service.into()),
            ..Default::default()
        }
    }

    fn matches(&self, def: &CapabilityDefinition) -> bool {
        self.owning_service
            .as_deref()
            .map_or(true, |s| def.owning_service == s)
            && self
                .realm
                .as_deref()
                .map_or(true, |r| def.realm.as_deref() == Some(r))
            && self
                .tenant_scope
                .as_deref()
                .map_or(true, |t| is_visible_to_tenant(def.tenant_scope.as_deref(), Some(t)))
            && self.state.map_or(true, |s| def.state == s)
            && self.tag.as_deref().map_or(true, |t| def.matches_tag(t))
            && self.query.as_deref().map_or(true, |q| def.matches_query(q))
    }
}

/// Registry of capability definitions.
pub struct CapabilityRegistry {
    store: RecordStore<ScopedKey, CapabilityDefinition>,
}

impl CapabilityRegistry {
    pub fn new(store: RecordStore<ScopedKey, CapabilityDefinition>) -> Self {
        Self { store }
    }

    /// Validate and store a definition.
    pub fn register(&self, definition: CapabilityDefinition, now: DateTime<Utc>) -> CuratorResult<CapabilityAck> {
        definition.validate()?;
        self.commit(definition, now, |_| Ok(()))
    }

    /// Store a definition that already passed validation.
    ///
    /// `admit` sees the definition being replaced, if any, under the entry
    /// lock; an error from it leaves the stored definition untouched.
    pub(crate) fn commit<A>(
        &self,
        mut definition: CapabilityDefinition,
        now: DateTime<Utc>,
        admit: A,
    ) -> CuratorResult<CapabilityAck>
    where
        A: FnOnce(&CapabilityDefinition) -> CuratorResult<()>,
    {
        definition.registered_at.get_or_insert(now);
        let key = definition.key();
        let (capability, previous) = self.store.upsert_with(key.clone(), move |current| {
            if let Some(existing) = current {
                admit(existing)?;
            }
            Ok::<_, CuratorError>(definition)
        })?;

        let replaced = previous.is_some();
        let note = replaced.then(|| {
            log::info!("Capability '{}' replaced for service '{}'", key.name, key.scope);
            format!(
                "capability '{}' of service '{}' replaced the previous definition",
                key.name, key.scope
            )
        });

        Ok(CapabilityAck {
            capability,
            replaced,
            note,
        })
    }

    pub fn get(&self, owning_service: &str, capability_name: &str) -> Option<Arc<CapabilityDefinition>> {
        self.store.get(&ScopedKey::new(owning_service, capability_name))
    }

    /// Definitions matching `filter` and `visible`, in registration order.
    pub fn list<F>(&self, filter: &CapabilityFilter, visible: F) -> Vec<Arc<CapabilityDefinition>>
    where
        F: Fn(&CapabilityDefinition) -> bool,
    {
        self.store.list(|def| filter.matches(def) && visible(def))
    }

    /// Names of services owning at least one `visible` capability matching `tag`.
    pub fn services_with_tag<F>(&self, tag: &str, visible: F) -> HashSet<String>
    where
        F: Fn(&CapabilityDefinition) -> bool,
    {
        self.store
            .list(|def| def.matches_tag(tag) && visible(def))
            .iter()
            .map(|def| def.owning_service.clone())
            .collect()
    }

    /// Replace the lifecycle state of one capability.
    pub fn update_state(
        &self,
        owning_service: &str,
        capability_name: &str,
        state: CapabilityState,
    ) -> CuratorResult<Arc<CapabilityDefinition>> {
        let key = ScopedKey::new(owning_service, capability_name);
        self.store
            .update(&key, |current| {
                let mut next = current.clone();
                next.state = state;
                Ok(next)
            })
            .ok_or_else(|| CuratorError::not_found("capability", key.to_string()))?
    }

    pub fn remove(&self, owning_service: &str, capability_name: &str) -> Option<Arc<CapabilityDefinition>> {
        let key = ScopedKey::new(owning_service, capability_name);
        let existing = self.store.get(&key)?;
        self.store.delete(&key).then_some(existing)
    }

    pub fn remove_service(&self, owning_service: &str) -> Vec<Arc<CapabilityDefinition>> {
        self.store
            .delete_where(|key, _| key.scope == owning_service)
    }

    pub fn all(&self) -> Vec<Arc<CapabilityDefinition>> {
        self.store.all()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new(RecordStore::new("capability"))
    }
}
