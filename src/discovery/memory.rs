//! Process-local discovery backend.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;

use super::{backend_id, BackendHealth, DiscoveryBackend, DiscoveryError, DiscoveryInstance};

/// In-memory backend with a reachability switch for simulating outages.
pub struct InMemoryBackend {
    instances: DashMap<String, DiscoveryInstance>,
    reachable: AtomicBool,
    announce_calls: AtomicU64,
    withdraw_calls: AtomicU64,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self {
            instances: DashMap::new(),
            reachable: AtomicBool::new(true),
            announce_calls: AtomicU64::new(0),
            withdraw_calls: AtomicU64::new(0),
        }
    }

    /// Start with `instances` already announced.
    pub fn with_instances<I: IntoIterator<Item = DiscoveryInstance>>(instances: I) -> Self {
        let backend = Self::new();
        for instance in instances {
            backend.instances.insert(instance.backend_id(), instance);
        }
        backend
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    pub fn contains(&self, service_name: &str, instance_id: &str) -> bool {
        self.instances
            .contains_key(&backend_id(service_name, instance_id))
    }

    pub fn get(&self, service_name: &str, instance_id: &str) -> Option<DiscoveryInstance> {
        self.instances
            .get(&backend_id(service_name, instance_id))
            .map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Attempted announces, including those refused while unreachable.
    pub fn announce_calls(&self) -> u64 {
        self.announce_calls.load(Ordering::SeqCst)
    }

    pub fn withdraw_calls(&self) -> u64 {
        self.withdraw_calls.load(Ordering::SeqCst)
    }

    fn ensure_reachable(&self) -> Result<(), DiscoveryError> {
        if self.is_reachable() {
            Ok(())
        } else {
            Err(DiscoveryError::Unreachable("in-memory backend switched off".to_string()))
        }
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DiscoveryBackend for InMemoryBackend {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn announce(&self, instance: &DiscoveryInstance) -> Result<(), DiscoveryError> {
        self.announce_calls.fetch_add(1, Ordering::SeqCst);
        self.ensure_reachable()?;
        self.instances.insert(instance.backend_id(), instance.clone());
        Ok(())
    }

    async fn withdraw(&self, service_name: &str, instance_id: &str) -> Result<(), DiscoveryError> {
        self.withdraw_calls.fetch_add(1, Ordering::SeqCst);
        self.ensure_reachable()?;
        self.instances
            .remove(&backend_id(service_name, instance_id));
        Ok(())
    }

    async fn health_check(&self) -> Result<BackendHealth, DiscoveryError> {
        let reachable = self.is_reachable();
        Ok(BackendHealth {
            reachable,
            latency_ms: Some(0),
            message: if reachable {
                format!("{} instances", self.instances.len())
            } else {
                "switched off".to_string()
            },
        })
    }

    async fn list_instances(&self) -> Result<Vec<DiscoveryInstance>, DiscoveryError> {
        self.ensure_reachable()?;
        let mut instances: Vec<DiscoveryInstance> =
            self.instances.iter().map(|e| e.value().clone()).collect();
        instances.sort_by(|a, b| a.backend_id().cmp(&b.backend_id()));
        Ok(instances)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn instance(name: &str) -> DiscoveryInstance {
        DiscoveryInstance {
            service_name: name.into(),
            instance_id: "1".into(),
            address: None,
            port: None,
            tags: vec![],
            meta: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_unreachable_backend_refuses_calls() {
        let backend = InMemoryBackend::new();
        backend.announce(&instance("a")).await.unwrap();

        backend.set_reachable(false);
        assert!(backend.announce(&instance("b")).await.is_err());
        assert!(backend.list_instances().await.is_err());
        assert!(!backend.health_check().await.unwrap().reachable);
        assert_eq!(backend.announce_calls(), 2);
        assert_eq!(backend.len(), 1);

        backend.set_reachable(true);
        backend.withdraw("a", "1").await.unwrap();
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_dashed_names_are_distinct_instances() {
        let backend = InMemoryBackend::new();
        let mut first = instance("a-b");
        first.instance_id = "c".into();
        let mut second = instance("a");
        second.instance_id = "b-c".into();
        backend.announce(&first).await.unwrap();
        backend.announce(&second).await.unwrap();
        assert_eq!(backend.len(), 2);

        backend.withdraw("a", "b-c").await.unwrap();
        assert!(backend.contains("a-b", "c"));
        assert!(!backend.contains("a", "b-c"));
    }
}
