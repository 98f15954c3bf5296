//! Generic binding registry keyed by `(owning_service, binding_name)`.

use std::sync::Arc;

use serde::Deserialize;

use super::binding::{Binding, McpToolRecord, SoaApiRecord};
use crate::errors::{CuratorError, CuratorResult};
use crate::store::{RecordStore, ScopedKey};

/// Filter for binding listings. Empty fields match everything.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BindingFilter {
    #[serde(default)]
    pub owning_service: Option<String>,
    #[serde(default)]
    pub capability_name: Option<String>,
}

impl BindingFilter {
    pub fn for_service(owning_service: impl Into<String>) -> Self {
        Self {
            owning_service: Some(owning_service.into()),
            capability_name: None,
        }
    }

    fn matches<B: Binding>(&self, binding: &B) -> bool {
        self.owning_service
            .as_deref()
            .map_or(true, |s| binding.owning_service() == s)
            && self
                .capability_name
                .as_deref()
                .map_or(true, |c| binding.capability_name() == c)
    }
}

/// Registry for one binding kind.
pub struct BindingRegistry<B: Binding> {
    store: RecordStore<ScopedKey, B>,
}

pub type SoaApiRegistry = BindingRegistry<SoaApiRecord>;
pub type McpToolRegistry = BindingRegistry<McpToolRecord>;

impl<B: Binding> BindingRegistry<B> {
    pub fn new(store: RecordStore<ScopedKey, B>) -> Self {
        Self { store }
    }

    fn key_of(binding: &B) -> ScopedKey {
        ScopedKey::new(binding.owning_service(), binding.binding_name())
    }

    /// Validate and store. A binding with no handler is rejected and nothing
    /// is written. Returns the stored record and whether it replaced one.
    ///
    /// A binding name belongs to one capability of its service. Taking over a
    /// name held by another capability is a [`CuratorError::Conflict`] unless
    /// that capability is in `released`, i.e. replaced by the same write.
    pub fn register(&self, binding: B, released: &[&str]) -> CuratorResult<(Arc<B>, bool)> {
        binding.validate()?;
        let key = Self::key_of(&binding);
        let (stored, previous) = self.store.upsert_with(key, move |current| {
            if let Some(existing) = current {
                Self::ensure_claimable(existing, &binding, released)?;
            }
            Ok::<_, CuratorError>(binding)
        })?;

        let replaced = previous.is_some();
        if replaced {
            log::debug!(
                "Replaced {} binding '{}' of service '{}'",
                B::KIND,
                stored.binding_name(),
                stored.owning_service()
            );
        }
        Ok((stored, replaced))
    }

    /// Check, without writing, that `binding` could be registered.
    pub fn check_claim(&self, binding: &B, released: &[&str]) -> CuratorResult<()> {
        match self.store.get(&Self::key_of(binding)) {
            Some(existing) => Self::ensure_claimable(&existing, binding, released),
            None => Ok(()),
        }
    }

    fn ensure_claimable(existing: &B, binding: &B, released: &[&str]) -> CuratorResult<()> {
        let owner = existing.capability_name();
        if owner == binding.capability_name() || released.contains(&owner) {
            return Ok(());
        }
        Err(CuratorError::Conflict(format!(
            "{} '{}' of service '{}' is bound by capability '{}', not '{}'",
            B::KIND,
            binding.binding_name(),
            binding.owning_service(),
            owner,
            binding.capability_name()
        )))
    }

    pub fn get(&self, owning_service: &str, binding_name: &str) -> Option<Arc<B>> {
        self.store.get(&ScopedKey::new(owning_service, binding_name))
    }

    /// Bindings matching `filter` and `visible`, in registration order.
    pub fn list<F>(&self, filter: &BindingFilter, visible: F) -> Vec<Arc<B>>
    where
        F: Fn(&B) -> bool,
    {
        self.store.list(|b| filter.matches(b) && visible(b))
    }

    /// Remove every binding attached to one capability.
    pub fn remove_for_capability(&self, owning_service: &str, capability_name: &str) -> Vec<Arc<B>> {
        self.store.delete_where(|_, b| {
            b.owning_service() == owning_service && b.capability_name() == capability_name
        })
    }

    /// Remove bindings of one capability other than `keep`. Used after a
    /// capability is re-registered so dropped or renamed contracts disappear.
    pub fn remove_stale(&self, owning_service: &str, capability_name: &str, keep: Option<&str>) -> Vec<Arc<B>> {
        self.store.delete_where(|_, b| {
            b.owning_service() == owning_service
                && b.capability_name() == capability_name
                && Some(b.binding_name()) != keep
        })
    }

    /// Remove every binding of a service.
    pub fn remove_for_service(&self, owning_service: &str) -> Vec<Arc<B>> {
        self.store
            .delete_where(|_, b| b.owning_service() == owning_service)
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

impl<B: Binding> Default for BindingRegistry<B> {
    fn default() -> Self {
        Self::new(RecordStore::new(B::KIND))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::contracts::binding::{HttpMethod, McpToolContract, SoaApiContract};
    use crate::contracts::handler::HandlerRef;

    fn soa(service: &str, api: &str, handler: Option<HandlerRef>) -> SoaApiRecord {
        soa_for("parse_pdf", service, api, handler)
    }

    fn soa_for(capability: &str, service: &str, api: &str, handler: Option<HandlerRef>) -> SoaApiRecord {
        let mut contract = SoaApiContract::unbound(api, HttpMethod::Post);
        contract.handler = handler;
        SoaApiRecord::from_contract(&contract, service, capability, None, Utc::now())
    }

    #[test]
    fn test_other_capability_cannot_take_over_binding() {
        let registry = SoaApiRegistry::default();
        registry
            .register(soa_for("parse_pdf", "parser-1", "/v1/parse", Some(HandlerRef::new("pdf"))), &[])
            .unwrap();

        let intruder = soa_for("parse_doc", "parser-1", "/v1/parse", Some(HandlerRef::new("doc")));
        assert!(matches!(registry.check_claim(&intruder, &[]), Err(CuratorError::Conflict(_))));
        let err = registry.register(intruder.clone(), &[]).unwrap_err();
        assert_eq!(err.code(), "CONFLICT");
        assert_eq!(registry.get("parser-1", "/v1/parse").unwrap().capability_name, "parse_pdf");

        // Released by a capability replaced in the same write.
        let (stored, replaced) = registry.register(intruder, &["parse_pdf"]).unwrap();
        assert!(replaced);
        assert_eq!(stored.capability_name, "parse_doc");

        // The same name under another service is a different binding.
        registry
            .register(soa_for("parse_pdf", "parser-2", "/v1/parse", Some(HandlerRef::new("pdf"))), &[])
            .unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_null_handler_is_not_stored() {
        let registry = SoaApiRegistry::default();
        let err = registry.register(soa("parser-1", "/v1/parse", None), &[]).unwrap_err();
        assert!(matches!(err, CuratorError::NullHandler { .. }));
        assert!(registry.get("parser-1", "/v1/parse").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_register_get_and_handler_roundtrip() {
        let registry = SoaApiRegistry::default();
        let handler = HandlerRef::new(String::from("parse-handler"));
        let (_, replaced) = registry
            .register(soa("parser-1", "/v1/parse", Some(handler.clone())), &[])
            .unwrap();
        assert!(!replaced);

        let stored = registry.get("parser-1", "/v1/parse").unwrap();
        assert!(stored.handler.as_ref().unwrap().same_handler(&handler));

        let (_, replaced) = registry
            .register(soa("parser-1", "/v1/parse", Some(HandlerRef::new(1u8))), &[])
            .unwrap();
        assert!(replaced);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_list_filter_and_removal() {
        let registry = McpToolRegistry::default();
        for (service, tool) in [("parser-1", "parse"), ("parser-1", "ocr"), ("report-1", "render")] {
            let contract = McpToolContract::new(tool, serde_json::json!({}), HandlerRef::new(()));
            registry
                .register(McpToolRecord::from_contract(&contract, service, tool, None, Utc::now()), &[])
                .unwrap();
        }

        let parser_tools = registry.list(&BindingFilter::for_service("parser-1"), |_| true);
        assert_eq!(parser_tools.len(), 2);
        assert_eq!(parser_tools[0].tool_name, "parse");

        assert_eq!(registry.remove_for_capability("parser-1", "ocr").len(), 1);
        assert_eq!(registry.remove_for_service("parser-1").len(), 1);
        assert_eq!(registry.len(), 1);
    }
}
