//! Route registry keyed by `route_id`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::route::RouteRecord;
use crate::errors::{CuratorError, CuratorResult};
use crate::store::RecordStore;

/// Acknowledgment of a route registration.
#[derive(Debug, Clone, Serialize)]
pub struct RouteAck {
    pub route: Arc<RouteRecord>,
    pub replaced: bool,
}

/// Route discovery filter. Empty fields match everything.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RouteFilter {
    #[serde(default)]
    pub pillar: Option<String>,
    #[serde(default)]
    pub realm: Option<String>,
    #[serde(default)]
    pub service_name: Option<String>,
}

impl RouteFilter {
    fn matches(&self, route: &RouteRecord) -> bool {
        self.pillar.as_deref().map_or(true, |p| route.pillar == p)
            && self.realm.as_deref().map_or(true, |r| route.realm == r)
            && self
                .service_name
                .as_deref()
                .map_or(true, |s| route.service_name.as_deref() == Some(s))
    }
}

/// Registry of HTTP routes.
pub struct RouteRegistry {
    store: RecordStore<String, RouteRecord>,
}

impl RouteRegistry {
    pub fn new(store: RecordStore<String, RouteRecord>) -> Self {
        Self { store }
    }

    /// Validate and store a route, replacing one with the same id. `admit`
    /// decides under the entry lock whether an existing route may be
    /// replaced. A replacement keeps the original `registered_at`.
    pub fn register<A>(&self, route: RouteRecord, now: DateTime<Utc>, admit: A) -> CuratorResult<RouteAck>
    where
        A: FnOnce(&RouteRecord) -> CuratorResult<()>,
    {
        route.validate()?;
        let route = route.normalized(now);
        let (stored, previous) = self.store.upsert_with(route.route_id.clone(), move |current| {
            let mut next = route;
            if let Some(existing) = current {
                admit(existing)?;
                next.registered_at = existing.registered_at;
            }
            Ok::<_, CuratorError>(next)
        })?;

        let replaced = previous.is_some();
        if replaced {
            log::debug!("Route '{}' replaced", stored.route_id);
        }
        Ok(RouteAck { route: stored, replaced })
    }

    pub fn get(&self, route_id: &str) -> Option<Arc<RouteRecord>> {
        self.store.get(route_id)
    }

    /// Routes matching `filter` and `visible`, in registration order.
    pub fn discover<F>(&self, filter: &RouteFilter, visible: F) -> Vec<Arc<RouteRecord>>
    where
        F: Fn(&RouteRecord) -> bool,
    {
        self.store.list(|r| filter.matches(r) && visible(r))
    }

    pub fn remove(&self, route_id: &str) -> Option<Arc<RouteRecord>> {
        let existing = self.store.get(route_id)?;
        self.store.delete(route_id).then_some(existing)
    }

    /// Remove every route answered by `service_name`.
    pub fn remove_for_service(&self, service_name: &str) -> Vec<Arc<RouteRecord>> {
        self.store
            .delete_where(|_, r| r.service_name.as_deref() == Some(service_name))
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

impl Default for RouteRegistry {
    fn default() -> Self {
        Self::new(RecordStore::new("route"))
    }
}
