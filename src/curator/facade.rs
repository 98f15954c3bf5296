//! The registry facade.

use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::ack::{AgentRegistrationAck, DeregistrationAck, HealthAck, RegistrationAck, ServiceUpdateAck, SweepReport};
use super::lifecycle::{Access, Lifecycle, LifecycleState};
use crate::agent_registry::{AgentAnalytics, AgentHealth, AgentRegistration, AgentRegistry, AgentReport, UsageOutcome};
use crate::capabilities::{CapabilityAck, CapabilityDefinition, CapabilityFilter, CapabilityRegistry, CapabilityState};
use crate::config::CuratorConfig;
use crate::contracts::{
    Binding, BindingFilter, McpToolRecord, McpToolRegistry, SoaApiRecord, SoaApiRegistry,
};
use crate::discovery::mirror::{self, MirrorCommand, MirrorHandle, MirrorState, MirrorStatus};
use crate::discovery::{ConsulBackend, DiscoveryBackend};
use crate::docs::{DocsTrigger, DocumentationSink, RegistrySnapshot};
use crate::endpoints::{RouteAck, RouteFilter, RouteRecord, RouteRegistry};
use crate::errors::{CuratorError, CuratorResult};
use crate::health::{AggregatedHealth, BackendStatus, DiscoveryBackendHealth, HealthStatus, RegistryStatus};
use crate::patterns::{
    has_blocking, AntiPatternViolation, EnforcementMode, LedgerEntry, PatternEngine, PatternRule, Severity,
    ViolationLedger,
};
use crate::security::{
    is_visible_to, may_replace, resources, Action, AllowAll, CallerContext, SecurityGuard, TenantValidator,
};
use crate::services::{Deregistration, ServiceRecord, ServiceRegistry, ServiceStatus, ServiceUpdate};

/// Builds a [`Curator`] with injected collaborators.
pub struct CuratorBuilder {
    config: CuratorConfig,
    security: Arc<dyn SecurityGuard>,
    tenants: Arc<dyn TenantValidator>,
    backend: Option<Arc<dyn DiscoveryBackend>>,
    docs_sink: Option<Arc<dyn DocumentationSink>>,
    rules: Option<Vec<PatternRule>>,
}

impl CuratorBuilder {
    pub fn new(config: CuratorConfig) -> Self {
        Self {
            config,
            security: Arc::new(AllowAll),
            tenants: Arc::new(AllowAll),
            backend: None,
            docs_sink: None,
            rules: None,
        }
    }

    pub fn security_guard(mut self, guard: Arc<dyn SecurityGuard>) -> Self {
        self.security = guard;
        self
    }

    pub fn tenant_validator(mut self, validator: Arc<dyn TenantValidator>) -> Self {
        self.tenants = validator;
        self
    }

    /// Use `backend` instead of the one described by `config.consul`.
    pub fn discovery_backend(mut self, backend: Arc<dyn DiscoveryBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn documentation_sink(mut self, sink: Arc<dyn DocumentationSink>) -> Self {
        self.docs_sink = Some(sink);
        self
    }

    /// Replace the rules compiled from configuration.
    pub fn rules(mut self, rules: Vec<PatternRule>) -> Self {
        self.rules = Some(rules);
        self
    }

    pub fn build(self) -> CuratorResult<Curator> {
        self.config.validate()?;

        let backend = match (self.backend, &self.config.consul) {
            (Some(backend), _) => Some(backend),
            (None, Some(consul)) => {
                let consul = ConsulBackend::new(consul.clone(), self.config.mirror_timeout())?;
                Some(Arc::new(consul) as Arc<dyn DiscoveryBackend>)
            }
            (None, None) => None,
        };
        let rules = match self.rules {
            Some(rules) => rules,
            None => self.config.pattern_rules()?,
        };

        Ok(Curator {
            inner: Arc::new(Inner {
                mirror_state: Arc::new(MirrorState::new(backend.is_some())),
                backend,
                engine: PatternEngine::new(rules),
                config: self.config,
                lifecycle: Lifecycle::new(),
                services: ServiceRegistry::default(),
                capabilities: CapabilityRegistry::default(),
                soa_apis: SoaApiRegistry::default(),
                mcp_tools: McpToolRegistry::default(),
                routes: RouteRegistry::default(),
                agents: AgentRegistry::default(),
                ledger: ViolationLedger::default(),
                security: self.security,
                tenants: self.tenants,
                mirror: Mutex::new(None),
                commit_locks: DashMap::new(),
                docs: Arc::new(DocsTrigger::new()),
                docs_sink: self.docs_sink,
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }
}

/// Single entry point for registration, discovery and reporting.
///
/// Cheap to clone; clones share the same registries.
#[derive(Clone)]
pub struct Curator {
    inner: Arc<Inner>,
}

struct Inner {
    config: CuratorConfig,
    lifecycle: Lifecycle,
    services: ServiceRegistry,
    capabilities: CapabilityRegistry,
    soa_apis: SoaApiRegistry,
    mcp_tools: McpToolRegistry,
    routes: RouteRegistry,
    agents: AgentRegistry,
    engine: PatternEngine,
    ledger: ViolationLedger,
    security: Arc<dyn SecurityGuard>,
    tenants: Arc<dyn TenantValidator>,
    backend: Option<Arc<dyn DiscoveryBackend>>,
    mirror_state: Arc<MirrorState>,
    mirror: Mutex<Option<Arc<MirrorHandle>>>,
    /// Serializes capability and binding writes per service name.
    commit_locks: DashMap<String, Arc<Mutex<()>>>,
    docs: Arc<DocsTrigger>,
    docs_sink: Option<Arc<dyn DocumentationSink>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// A registration that passed every check and is ready to commit.
struct PreparedRegistration {
    service: ServiceRecord,
    capabilities: Vec<PreparedCapability>,
    violations: Vec<AntiPatternViolation>,
}

struct PreparedCapability {
    definition: CapabilityDefinition,
    soa_api: Option<SoaApiRecord>,
    mcp_tool: Option<McpToolRecord>,
}

impl Curator {
    pub fn new(config: CuratorConfig) -> CuratorResult<Self> {
        CuratorBuilder::new(config).build()
    }

    pub fn builder(config: CuratorConfig) -> CuratorBuilder {
        CuratorBuilder::new(config)
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.lifecycle.current()
    }

    pub fn config(&self) -> &CuratorConfig {
        &self.inner.config
    }

    pub fn mirror_status(&self) -> MirrorStatus {
        self.inner.mirror_state.status()
    }

    /// A backend is configured and the last contact with it failed.
    pub fn degraded_discovery(&self) -> bool {
        self.inner.degraded_discovery()
    }

    /// Current capability-set revision.
    pub fn docs_revision(&self) -> u64 {
        self.inner.docs.revision()
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    /// Check the backend, optionally re-hydrate from it, start background
    /// tasks and become `ready`.
    pub async fn initialize(&self) -> CuratorResult<()> {
        let inner = &self.inner;
        inner
            .lifecycle
            .transition(&[LifecycleState::Uninitialized], LifecycleState::Initializing)
            .map_err(|state| CuratorError::NotReady {
                state,
                operation: "initialize",
            })?;

        if let Some(backend) = &inner.backend {
            let reachable = mirror::check_reachability(backend.as_ref(), &inner.mirror_state, inner.config.mirror_timeout()).await;
            if reachable && inner.config.rehydrate_on_start {
                inner.rehydrate(backend.as_ref()).await;
            }
            let handle = MirrorHandle::spawn(
                Arc::clone(backend),
                Arc::clone(&inner.mirror_state),
                inner.config.mirror_timeout(),
                inner.config.mirror_retry_interval(),
            );
            *inner.mirror.lock() = Some(Arc::new(handle));
        }

        let mut tasks = vec![spawn_sweeper(Arc::downgrade(inner), inner.config.sweep_interval())];
        if let Some(sink) = &inner.docs_sink {
            let weak = Arc::downgrade(inner);
            let trigger = Arc::clone(&inner.docs);
            tasks.push(inner.docs.spawn_publisher(
                Arc::clone(sink),
                inner.config.docs_debounce(),
                move || match weak.upgrade() {
                    Some(inner) => inner.snapshot(None),
                    None => RegistrySnapshot::empty(trigger.revision()),
                },
            ));
        }
        inner.tasks.lock().extend(tasks);

        inner
            .lifecycle
            .transition(&[LifecycleState::Initializing], LifecycleState::Ready)
            .map_err(|state| CuratorError::NotReady {
                state,
                operation: "initialize",
            })?;
        Ok(())
    }

    /// Stop accepting registrations. Reads keep being served.
    pub fn begin_shutdown(&self) -> CuratorResult<()> {
        match self
            .inner
            .lifecycle
            .transition(&[LifecycleState::Ready], LifecycleState::ShuttingDown)
        {
            Ok(_) | Err(LifecycleState::ShuttingDown) => Ok(()),
            Err(state) => Err(CuratorError::NotReady {
                state,
                operation: "begin_shutdown",
            }),
        }
    }

    /// Drain, withdraw every local instance from the backend, stop background
    /// tasks and end `stopped`. Idempotent.
    pub async fn shutdown(&self) -> CuratorResult<()> {
        let inner = &self.inner;
        match inner.lifecycle.current() {
            LifecycleState::Stopped => return Ok(()),
            LifecycleState::Uninitialized => {
                let _ = inner
                    .lifecycle
                    .transition(&[LifecycleState::Uninitialized], LifecycleState::Stopped);
                return Ok(());
            }
            _ => {}
        }
        self.begin_shutdown()?;

        let drain = inner.config.drain_period();
        if !drain.is_zero() {
            log::info!("Draining for {}ms before stopping", drain.as_millis());
            tokio::time::sleep(drain).await;
        }

        let mirror = inner.mirror.lock().take();
        if let Some(mirror) = mirror {
            let local = inner.services.list(|r| r.status != ServiceStatus::Stopped);
            for record in &local {
                mirror.submit(MirrorCommand::withdraw(&record.service_name, &record.instance_id));
            }
            let wait = inner
                .config
                .mirror_timeout()
                .saturating_mul(local.len() as u32 + 1);
            mirror.shutdown(wait).await;
        }

        inner.docs.stop();
        let tasks = std::mem::take(&mut *inner.tasks.lock());
        for task in tasks {
            task.abort();
        }

        let _ = inner
            .lifecycle
            .transition(&[LifecycleState::ShuttingDown], LifecycleState::Stopped);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Services
    // ---------------------------------------------------------------------

    /// Register an instance with its capabilities.
    ///
    /// Everything is validated and every record is built before the first
    /// write, so a failed or timed-out call stores nothing. The committed
    /// instance is then announced once inline, bounded by the mirror
    /// timeout; a failed announce sets `degraded_discovery` and is retried
    /// by the mirror worker.
    pub async fn register_service(
        &self,
        record: ServiceRecord,
        capabilities: Vec<CapabilityDefinition>,
        caller: Option<&CallerContext>,
        timeout: Option<Duration>,
    ) -> CuratorResult<RegistrationAck> {
        let inner = &self.inner;
        inner.lifecycle.ensure(Access::Write, "register_service")?;

        let deadline = timeout.unwrap_or_else(|| inner.config.registration_timeout());
        let service_name = record.service_name.clone();
        let prepared = tokio::time::timeout(deadline, inner.prepare_registration(record, capabilities, caller))
            .await
            .map_err(|_| {
                log::warn!("Registration of '{}' timed out before commit", service_name);
                CuratorError::Timeout(deadline.as_millis() as u64)
            })?
            .map_err(|e| {
                log::warn!("Registration of '{}' rejected: {}", service_name, e);
                e
            })?;

        inner.lifecycle.ensure(Access::Write, "register_service")?;
        let mut ack = inner.commit_registration(prepared, caller)?;

        ack.degraded_discovery = inner.announce_inline(&ack.service).await;
        if ack.degraded_discovery {
            log::warn!(
                "Registered {}/{} locally; discovery backend unreachable",
                ack.service.service_name,
                ack.service.instance_id
            );
        }
        log::info!(
            "Registered service '{}' instance '{}' in realm '{}' with {} capabilities ({} open violations)",
            ack.service.service_name,
            ack.service.instance_id,
            ack.service.realm,
            ack.capabilities.len(),
            ack.violations.len()
        );
        Ok(ack)
    }

    /// Live instances, oldest registration first.
    pub async fn discover_services(
        &self,
        realm: Option<&str>,
        service_type: Option<&str>,
        capability_tag: Option<&str>,
        caller: Option<&CallerContext>,
    ) -> CuratorResult<Vec<Arc<ServiceRecord>>> {
        let inner = &self.inner;
        inner.lifecycle.ensure(Access::Read, "discover_services")?;
        if !inner.permitted(caller, resources::SERVICE_REGISTRY, Action::Read).await {
            return Ok(Vec::new());
        }

        let tagged: Option<HashSet<String>> = capability_tag.map(|tag| {
            inner
                .capabilities
                .services_with_tag(tag, |c| is_visible_to(c.tenant_scope.as_deref(), caller))
        });

        Ok(inner.services.discover(realm, service_type, |r| {
            is_visible_to(r.tenant_scope.as_deref(), caller)
                && tagged.as_ref().map_or(true, |names| names.contains(&r.service_name))
        }))
    }

    /// Every stored instance in any status.
    pub async fn list_services(&self, caller: Option<&CallerContext>) -> CuratorResult<Vec<Arc<ServiceRecord>>> {
        let inner = &self.inner;
        inner.lifecycle.ensure(Access::Read, "list_services")?;
        if !inner.permitted(caller, resources::SERVICE_REGISTRY, Action::Read).await {
            return Ok(Vec::new());
        }
        Ok(inner
            .services
            .list(|r| is_visible_to(r.tenant_scope.as_deref(), caller)))
    }

    pub async fn report_health(
        &self,
        service_name: &str,
        instance_id: &str,
        status: ServiceStatus,
        caller: Option<&CallerContext>,
    ) -> CuratorResult<HealthAck> {
        let inner = &self.inner;
        inner.lifecycle.ensure(Access::Write, "report_health")?;
        inner.authorize(caller, resources::SERVICE_REGISTRY, Action::Write).await?;
        inner.ensure_instance_visible(service_name, instance_id, caller)?;

        let now = Utc::now();
        let (previous_status, record) = inner
            .services
            .report_health(service_name, instance_id, status, now)
            .map_err(|e| {
                log::warn!("Health report for {}/{} refused: {}", service_name, instance_id, e);
                e
            })?;

        let degraded_discovery = if record.status == ServiceStatus::Stopped {
            log::info!("Instance {}/{} reported stopped", service_name, instance_id);
            inner.retire_if_last(service_name, now);
            inner
                .mirror_inline(MirrorCommand::withdraw(service_name, instance_id))
                .await
        } else if previous_status != record.status {
            log::info!(
                "Instance {}/{}: {} -> {}",
                service_name,
                instance_id,
                previous_status,
                record.status
            );
            inner.announce_inline(&record).await
        } else {
            inner.degraded_discovery()
        };

        Ok(HealthAck {
            service: record,
            previous_status,
            degraded_discovery,
        })
    }

    /// Refresh liveness without changing status.
    pub async fn heartbeat(
        &self,
        service_name: &str,
        instance_id: &str,
        caller: Option<&CallerContext>,
    ) -> CuratorResult<Arc<ServiceRecord>> {
        let inner = &self.inner;
        inner.lifecycle.ensure(Access::Write, "heartbeat")?;
        inner.authorize(caller, resources::SERVICE_REGISTRY, Action::Write).await?;
        inner.ensure_instance_visible(service_name, instance_id, caller)?;
        inner.services.heartbeat(service_name, instance_id, Utc::now())
    }

    /// Change metadata of every non-stopped instance of a service without
    /// re-registering. Each updated instance is re-announced inline and the
    /// service is re-validated.
    pub async fn update_service(
        &self,
        service_name: &str,
        update: ServiceUpdate,
        caller: Option<&CallerContext>,
    ) -> CuratorResult<ServiceUpdateAck> {
        let inner = &self.inner;
        inner.lifecycle.ensure(Access::Write, "update_service")?;
        inner.authorize(caller, resources::SERVICE_REGISTRY, Action::Write).await?;
        if update.is_empty() {
            return Err(CuratorError::Validation(format!(
                "update of service '{}' changes nothing",
                service_name
            )));
        }
        if update.realm.as_deref().is_some_and(|r| r.trim().is_empty()) {
            return Err(CuratorError::Validation(format!(
                "update of service '{}' clears its realm",
                service_name
            )));
        }

        let services = inner.apply_service_update(service_name, &update, caller)?;
        let mut degraded_discovery = false;
        for record in &services {
            degraded_discovery |= inner.announce_inline(record).await;
        }

        let violations = match inner.representative_instance(service_name) {
            Some(service) => inner.revalidate(&service, Utc::now()),
            None => Vec::new(),
        };
        log::info!("Updated {} instances of service '{}'", services.len(), service_name);
        Ok(ServiceUpdateAck {
            service_name: service_name.to_string(),
            services,
            violations,
            degraded_discovery,
        })
    }

    /// Mark an instance stopped. Unknown and already stopped instances are a
    /// no-op. Served while shutting down so services can leave.
    pub async fn deregister(
        &self,
        service_name: &str,
        instance_id: &str,
        caller: Option<&CallerContext>,
    ) -> CuratorResult<DeregistrationAck> {
        let inner = &self.inner;
        inner.lifecycle.ensure(Access::Read, "deregister")?;
        inner.authorize(caller, resources::SERVICE_REGISTRY, Action::Write).await?;
        inner.ensure_instance_visible(service_name, instance_id, caller)?;

        let now = Utc::now();
        let outcome = inner.services.deregister(service_name, instance_id, now);
        let noop = outcome.is_noop();
        let (removed_capabilities, degraded_discovery) = match outcome {
            Deregistration::Stopped(_) => {
                log::info!("Instance {}/{} deregistered", service_name, instance_id);
                let removed = inner.retire_if_last(service_name, now);
                let degraded = inner
                    .mirror_inline(MirrorCommand::withdraw(service_name, instance_id))
                    .await;
                (removed, degraded)
            }
            Deregistration::NoOp => {
                log::debug!("Deregistration of {}/{} was a no-op", service_name, instance_id);
                (Vec::new(), inner.degraded_discovery())
            }
        };

        Ok(DeregistrationAck {
            service_name: service_name.to_string(),
            instance_id: instance_id.to_string(),
            noop,
            removed_capabilities,
            degraded_discovery,
        })
    }

    /// Run one liveness sweep now.
    pub fn sweep(&self) -> SweepReport {
        self.inner.sweep(Utc::now())
    }

    /// Run one liveness sweep as of `now`.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        self.inner.sweep(now)
    }

    // ---------------------------------------------------------------------
    // Capabilities
    // ---------------------------------------------------------------------

    /// Register or replace one capability.
    pub async fn register_capability(
        &self,
        mut definition: CapabilityDefinition,
        caller: Option<&CallerContext>,
    ) -> CuratorResult<CapabilityAck> {
        let inner = &self.inner;
        inner.lifecycle.ensure(Access::Write, "register_capability")?;
        inner.authorize(caller, resources::CAPABILITY_REGISTRY, Action::Write).await?;
        definition.validate()?;

        let now = Utc::now();
        let service = inner.representative_instance(&definition.owning_service);
        if let Some(service) = &service {
            if definition.realm.is_none() {
                definition.realm = Some(service.realm.clone());
            }
            if definition.tenant_scope.is_none() {
                definition.tenant_scope = service.tenant_scope.clone();
            }
        }
        Inner::check_scope(caller, definition.tenant_scope.as_deref(), "capability")?;
        let (soa_api, mcp_tool) = definition.bindings(now)?;
        let violations = match &service {
            Some(service) => Some(inner.evaluate(service, &[&definition], now)?),
            None => None,
        };

        inner.lifecycle.ensure(Access::Write, "register_capability")?;
        let prepared = PreparedCapability {
            definition,
            soa_api,
            mcp_tool,
        };
        let ack = {
            let lock = inner.service_lock(&prepared.definition.owning_service);
            let _guard = lock.lock();
            inner.admit_capability(&prepared, &[], caller)?;
            inner.commit_capability(prepared, &[], caller, now)?
        };
        if let (Some(service), Some(violations)) = (service, violations) {
            inner.ledger.record_run(&service.service_name, violations, now);
        }
        inner.docs.bump();
        Ok(ack)
    }

    pub async fn get_capability(
        &self,
        owning_service: &str,
        capability_name: &str,
        caller: Option<&CallerContext>,
    ) -> CuratorResult<Arc<CapabilityDefinition>> {
        let inner = &self.inner;
        inner.lifecycle.ensure(Access::Read, "get_capability")?;
        inner.authorize(caller, resources::CAPABILITY_REGISTRY, Action::Read).await?;

        let key = format!("{}/{}", owning_service, capability_name);
        let capability = inner
            .capabilities
            .get(owning_service, capability_name)
            .ok_or_else(|| CuratorError::not_found("capability", key.as_str()))?;
        Inner::ensure_visible(capability.tenant_scope.as_deref(), caller, "capability", &key)?;
        Ok(capability)
    }

    pub async fn list_capabilities(
        &self,
        filter: &CapabilityFilter,
        caller: Option<&CallerContext>,
    ) -> CuratorResult<Vec<Arc<CapabilityDefinition>>> {
        let inner = &self.inner;
        inner.lifecycle.ensure(Access::Read, "list_capabilities")?;
        if !inner.permitted(caller, resources::CAPABILITY_REGISTRY, Action::Read).await {
            return Ok(Vec::new());
        }
        Ok(inner
            .capabilities
            .list(filter, |c| is_visible_to(c.tenant_scope.as_deref(), caller)))
    }

    /// Capabilities whose name or description contains `query`
    /// (case-insensitive), optionally narrowed to a discovery tag.
    pub async fn search_capabilities(
        &self,
        query: &str,
        tag: Option<&str>,
        caller: Option<&CallerContext>,
    ) -> CuratorResult<Vec<Arc<CapabilityDefinition>>> {
        let filter = CapabilityFilter {
            query: Some(query.trim().to_string()).filter(|q| !q.is_empty()),
            tag: tag.map(str::to_string),
            ..Default::default()
        };
        if filter.query.is_none() && filter.tag.is_none() {
            return Err(CuratorError::Validation(
                "capability search needs a query or a tag".to_string(),
            ));
        }
        self.list_capabilities(&filter, caller).await
    }

    pub async fn update_capability_state(
        &self,
        owning_service: &str,
        capability_name: &str,
        state: CapabilityState,
        caller: Option<&CallerContext>,
    ) -> CuratorResult<Arc<CapabilityDefinition>> {
        let inner = &self.inner;
        inner.lifecycle.ensure(Access::Write, "update_capability_state")?;
        inner.authorize(caller, resources::CAPABILITY_REGISTRY, Action::Write).await?;

        let key = format!("{}/{}", owning_service, capability_name);
        let updated = {
            let lock = inner.service_lock(owning_service);
            let _guard = lock.lock();
            if let Some(existing) = inner.capabilities.get(owning_service, capability_name) {
                Inner::ensure_visible(existing.tenant_scope.as_deref(), caller, "capability", &key)?;
            }
            inner
                .capabilities
                .update_state(owning_service, capability_name, state)?
        };
        log::info!("Capability '{}' is now {}", key, state);
        inner.docs.bump();
        Ok(updated)
    }

    /// Remove one capability, or every capability of the service when
    /// `capability_name` is `None`, together with their bindings. Returns
    /// the removed capability names.
    pub async fn unregister_capability(
        &self,
        owning_service: &str,
        capability_name: Option<&str>,
        caller: Option<&CallerContext>,
    ) -> CuratorResult<Vec<String>> {
        let inner = &self.inner;
        inner.lifecycle.ensure(Access::Write, "unregister_capability")?;
        inner.authorize(caller, resources::CAPABILITY_REGISTRY, Action::Write).await?;

        let now = Utc::now();
        let mut removed = Vec::new();
        {
            let lock = inner.service_lock(owning_service);
            let _guard = lock.lock();
            let targets: Vec<Arc<CapabilityDefinition>> = match capability_name {
                Some(name) => inner.capabilities.get(owning_service, name).into_iter().collect(),
                None => inner
                    .capabilities
                    .list(&CapabilityFilter::for_service(owning_service), |_| true),
            };
            for capability in &targets {
                Inner::ensure_visible(
                    capability.tenant_scope.as_deref(),
                    caller,
                    "capability",
                    &format!("{}/{}", owning_service, capability.capability_name),
                )?;
            }

            for capability in targets {
                if inner
                    .capabilities
                    .remove(owning_service, &capability.capability_name)
                    .is_some()
                {
                    inner
                        .soa_apis
                        .remove_for_capability(owning_service, &capability.capability_name);
                    inner
                        .mcp_tools
                        .remove_for_capability(owning_service, &capability.capability_name);
                    removed.push(capability.capability_name.clone());
                }
            }
        }

        if !removed.is_empty() {
            log::info!("Unregistered capabilities of '{}': {}", owning_service, removed.join(", "));
            inner.docs.bump();
            match inner.representative_instance(owning_service) {
                Some(service) => {
                    inner.revalidate(&service, now);
                }
                None => {
                    if inner
                        .capabilities
                        .list(&CapabilityFilter::for_service(owning_service), |_| true)
                        .is_empty()
                    {
                        inner.ledger.resolve_service(owning_service, now);
                    }
                }
            }
        }
        Ok(removed)
    }

    // ---------------------------------------------------------------------
    // Contract bindings
    // ---------------------------------------------------------------------

    pub async fn get_soa_api(
        &self,
        owning_service: &str,
        api_name: &str,
        caller: Option<&CallerContext>,
    ) -> CuratorResult<Arc<SoaApiRecord>> {
        let inner = &self.inner;
        inner.lifecycle.ensure(Access::Read, "get_soa_api")?;
        inner.authorize(caller, resources::SOA_API_REGISTRY, Action::Read).await?;

        let key = format!("{}/{}", owning_service, api_name);
        let binding = inner
            .soa_apis
            .get(owning_service, api_name)
            .ok_or_else(|| CuratorError::not_found(SoaApiRecord::KIND, key.as_str()))?;
        Inner::ensure_visible(binding.tenant_scope(), caller, SoaApiRecord::KIND, &key)?;
        Ok(binding)
    }

    pub async fn list_soa_apis(
        &self,
        filter: &BindingFilter,
        caller: Option<&CallerContext>,
    ) -> CuratorResult<Vec<Arc<SoaApiRecord>>> {
        let inner = &self.inner;
        inner.lifecycle.ensure(Access::Read, "list_soa_apis")?;
        if !inner.permitted(caller, resources::SOA_API_REGISTRY, Action::Read).await {
            return Ok(Vec::new());
        }
        Ok(inner
            .soa_apis
            .list(filter, |b| is_visible_to(b.tenant_scope(), caller)))
    }

    pub async fn get_mcp_tool(
        &self,
        owning_service: &str,
        tool_name: &str,
        caller: Option<&CallerContext>,
    ) -> CuratorResult<Arc<McpToolRecord>> {
        let inner = &self.inner;
        inner.lifecycle.ensure(Access::Read, "get_mcp_tool")?;
        inner.authorize(caller, resources::MCP_TOOL_REGISTRY, Action::Read).await?;

        let key = format!("{}/{}", owning_service, tool_name);
        let binding = inner
            .mcp_tools
            .get(owning_service, tool_name)
            .ok_or_else(|| CuratorError::not_found(McpToolRecord::KIND, key.as_str()))?;
        Inner::ensure_visible(binding.tenant_scope(), caller, McpToolRecord::KIND, &key)?;
        Ok(binding)
    }

    pub async fn list_mcp_tools(
        &self,
        filter: &BindingFilter,
        caller: Option<&CallerContext>,
    ) -> CuratorResult<Vec<Arc<McpToolRecord>>> {
        let inner = &self.inner;
        inner.lifecycle.ensure(Access::Read, "list_mcp_tools")?;
        if !inner.permitted(caller, resources::MCP_TOOL_REGISTRY, Action::Read).await {
            return Ok(Vec::new());
        }
        Ok(inner
            .mcp_tools
            .list(filter, |b| is_visible_to(b.tenant_scope(), caller)))
    }

    // ---------------------------------------------------------------------
    // Routes
    // ---------------------------------------------------------------------

    /// Register or replace a route. A route answered by a registered service
    /// inherits its tenant scope when it names none.
    pub async fn register_route(&self, mut route: RouteRecord, caller: Option<&CallerContext>) -> CuratorResult<RouteAck> {
        let inner = &self.inner;
        inner.lifecycle.ensure(Access::Write, "register_route")?;
        inner.authorize(caller, resources::ROUTE_REGISTRY, Action::Write).await?;

        if route.tenant_scope.is_none() {
            if let Some(service) = route
                .service_name
                .as_deref()
                .and_then(|name| inner.representative_instance(name))
            {
                route.tenant_scope = service.tenant_scope.clone();
            }
        }
        Inner::check_scope(caller, route.tenant_scope.as_deref(), "route")?;

        let submitted = route.tenant_scope.clone();
        let ack = inner.routes.register(route, Utc::now(), |existing| {
            Inner::admit_replacement(
                existing.tenant_scope.as_deref(),
                submitted.as_deref(),
                caller,
                "route",
                &existing.route_id,
            )
        })?;
        log::info!(
            "Route {} {} registered as '{}'",
            ack.route.method,
            ack.route.path,
            ack.route.route_id
        );
        inner.docs.bump();
        Ok(ack)
    }

    pub async fn get_route(&self, route_id: &str, caller: Option<&CallerContext>) -> CuratorResult<Arc<RouteRecord>> {
        let inner = &self.inner;
        inner.lifecycle.ensure(Access::Read, "get_route")?;
        inner.authorize(caller, resources::ROUTE_REGISTRY, Action::Read).await?;

        let route = inner
            .routes
            .get(route_id)
            .ok_or_else(|| CuratorError::not_found("route", route_id))?;
        Inner::ensure_visible(route.tenant_scope.as_deref(), caller, "route", route_id)?;
        Ok(route)
    }

    /// Routes filtered by pillar, realm and answering service.
    pub async fn discover_routes(
        &self,
        filter: &RouteFilter,
        caller: Option<&CallerContext>,
    ) -> CuratorResult<Vec<Arc<RouteRecord>>> {
        let inner = &self.inner;
        inner.lifecycle.ensure(Access::Read, "discover_routes")?;
        if !inner.permitted(caller, resources::ROUTE_REGISTRY, Action::Read).await {
            return Ok(Vec::new());
        }
        Ok(inner
            .routes
            .discover(filter, |r| is_visible_to(r.tenant_scope.as_deref(), caller)))
    }

    /// Remove a route. Returns `false` for unknown routes.
    pub async fn unregister_route(&self, route_id: &str, caller: Option<&CallerContext>) -> CuratorResult<bool> {
        let inner = &self.inner;
        inner.lifecycle.ensure(Access::Write, "unregister_route")?;
        inner.authorize(caller, resources::ROUTE_REGISTRY, Action::Write).await?;

        if let Some(route) = inner.routes.get(route_id) {
            Inner::ensure_visible(route.tenant_scope.as_deref(), caller, "route", route_id)?;
        }
        let removed = inner.routes.remove(route_id).is_some();
        if removed {
            log::info!("Route '{}' unregistered", route_id);
            inner.docs.bump();
        }
        Ok(removed)
    }

    // ---------------------------------------------------------------------
    // Agents
    // ---------------------------------------------------------------------

    pub async fn register_agent(
        &self,
        registration: AgentRegistration,
        caller: Option<&CallerContext>,
    ) -> CuratorResult<AgentRegistrationAck> {
        let inner = &self.inner;
        inner.lifecycle.ensure(Access::Write, "register_agent")?;
        inner.authorize(caller, resources::AGENT_REGISTRY, Action::Write).await?;
        Inner::check_scope(caller, registration.tenant_scope.as_deref(), "agent")?;

        let submitted = registration.tenant_scope.as_deref();
        let (record, existed) = inner.agents.register_with(&registration, Utc::now(), |existing| {
            Inner::admit_replacement(existing.tenant_scope.as_deref(), submitted, caller, "agent", &existing.agent_id)
        })?;
        log::info!(
            "Agent '{}' registered with {} capability tags",
            record.agent_id,
            record.capability_tags.len()
        );
        Ok(AgentRegistrationAck {
            agent: AgentReport::from(record.as_ref()),
            existed,
        })
    }

    /// Count one use of `tag`. Unknown or archived agents are not created;
    /// the outcome carries the warning instead.
    pub async fn record_usage(
        &self,
        agent_id: &str,
        tag: &str,
        caller: Option<&CallerContext>,
    ) -> CuratorResult<UsageOutcome> {
        let inner = &self.inner;
        inner.lifecycle.ensure(Access::Write, "record_usage")?;
        inner.authorize(caller, resources::AGENT_REGISTRY, Action::Write).await?;
        inner.ensure_agent_visible(agent_id, caller)?;
        Ok(inner.agents.record_usage(agent_id, tag, Utc::now()))
    }

    pub async fn report_agent_health(
        &self,
        agent_id: &str,
        status: AgentHealth,
        caller: Option<&CallerContext>,
    ) -> CuratorResult<AgentReport> {
        let inner = &self.inner;
        inner.lifecycle.ensure(Access::Write, "report_agent_health")?;
        inner.authorize(caller, resources::AGENT_REGISTRY, Action::Write).await?;
        inner.ensure_agent_visible(agent_id, caller)?;

        let record = inner.agents.report_health(agent_id, status, Utc::now())?;
        if matches!(status, AgentHealth::Degraded | AgentHealth::Unhealthy) {
            log::warn!("Agent '{}' reports {}", agent_id, status);
        }
        Ok(AgentReport::from(record.as_ref()))
    }

    /// Archive an agent. Its history stays queryable.
    pub async fn deregister_agent(&self, agent_id: &str, caller: Option<&CallerContext>) -> CuratorResult<bool> {
        let inner = &self.inner;
        inner.lifecycle.ensure(Access::Read, "deregister_agent")?;
        inner.authorize(caller, resources::AGENT_REGISTRY, Action::Write).await?;
        inner.ensure_agent_visible(agent_id, caller)?;

        let archived = inner.agents.archive(agent_id, Utc::now());
        if archived {
            log::info!("Agent '{}' archived", agent_id);
        }
        Ok(archived)
    }

    pub async fn get_agent_report(&self, agent_id: &str, caller: Option<&CallerContext>) -> CuratorResult<AgentReport> {
        let inner = &self.inner;
        inner.lifecycle.ensure(Access::Read, "get_agent_report")?;
        inner.authorize(caller, resources::AGENT_REGISTRY, Action::Read).await?;

        let record = inner
            .agents
            .get(agent_id)
            .ok_or_else(|| CuratorError::not_found("agent", agent_id))?;
        Inner::ensure_visible(record.tenant_scope.as_deref(), caller, "agent", agent_id)?;
        Ok(AgentReport::from(record.as_ref()))
    }

    pub async fn list_agent_reports(
        &self,
        include_archived: bool,
        caller: Option<&CallerContext>,
    ) -> CuratorResult<Vec<AgentReport>> {
        let inner = &self.inner;
        inner.lifecycle.ensure(Access::Read, "list_agent_reports")?;
        if !inner.permitted(caller, resources::AGENT_REGISTRY, Action::Read).await {
            return Ok(Vec::new());
        }
        Ok(inner
            .agents
            .list(include_archived, |a| is_visible_to(a.tenant_scope.as_deref(), caller))
            .iter()
            .map(|a| AgentReport::from(a.as_ref()))
            .collect())
    }

    /// Active agents advertising `capability_tag`.
    pub async fn discover_agents(
        &self,
        capability_tag: &str,
        caller: Option<&CallerContext>,
    ) -> CuratorResult<Vec<AgentReport>> {
        let inner = &self.inner;
        inner.lifecycle.ensure(Access::Read, "discover_agents")?;
        if !inner.permitted(caller, resources::AGENT_REGISTRY, Action::Read).await {
            return Ok(Vec::new());
        }
        Ok(inner
            .agents
            .discover(capability_tag, |a| is_visible_to(a.tenant_scope.as_deref(), caller))
            .iter()
            .map(|a| AgentReport::from(a.as_ref()))
            .collect())
    }

    pub async fn agent_analytics(&self, caller: Option<&CallerContext>) -> CuratorResult<AgentAnalytics> {
        let inner = &self.inner;
        inner.lifecycle.ensure(Access::Read, "agent_analytics")?;
        if !inner.permitted(caller, resources::AGENT_REGISTRY, Action::Read).await {
            return Ok(AgentAnalytics::default());
        }
        Ok(inner
            .agents
            .analytics(|a| is_visible_to(a.tenant_scope.as_deref(), caller)))
    }

    // ---------------------------------------------------------------------
    // Pattern validation
    // ---------------------------------------------------------------------

    /// Re-validate a registered service against the current store.
    pub async fn validate_service(
        &self,
        service_name: &str,
        caller: Option<&CallerContext>,
    ) -> CuratorResult<Vec<AntiPatternViolation>> {
        let inner = &self.inner;
        inner.lifecycle.ensure(Access::Read, "validate_service")?;
        inner.authorize(caller, resources::PATTERN_VALIDATION, Action::Read).await?;

        let service = inner
            .representative_instance(service_name)
            .ok_or_else(|| CuratorError::not_found("service", service_name))?;
        Inner::ensure_visible(service.tenant_scope.as_deref(), caller, "service", service_name)?;
        Ok(inner.revalidate(&service, Utc::now()))
    }

    /// Re-validate every service with a non-stopped instance. Returns all
    /// open violations afterwards.
    pub async fn validate_all(&self, caller: Option<&CallerContext>) -> CuratorResult<Vec<AntiPatternViolation>> {
        let inner = &self.inner;
        inner.lifecycle.ensure(Access::Read, "validate_all")?;
        inner.authorize(caller, resources::PATTERN_VALIDATION, Action::Read).await?;

        let now = Utc::now();
        let names: HashSet<String> = inner
            .services
            .list(|r| r.status != ServiceStatus::Stopped)
            .iter()
            .map(|r| r.service_name.clone())
            .collect();
        for name in names {
            if let Some(service) = inner.representative_instance(&name) {
                inner.revalidate(&service, now);
            }
        }
        Ok(inner
            .ledger
            .open(None)
            .into_iter()
            .filter(|v| inner.service_visible(&v.service_name, caller))
            .collect())
    }

    /// Open violations, optionally for one subject id or service name.
    pub async fn get_violations(
        &self,
        subject_id: Option<&str>,
        caller: Option<&CallerContext>,
    ) -> CuratorResult<Vec<AntiPatternViolation>> {
        let inner = &self.inner;
        inner.lifecycle.ensure(Access::Read, "get_violations")?;
        if !inner.permitted(caller, resources::PATTERN_VALIDATION, Action::Read).await {
            return Ok(Vec::new());
        }
        Ok(inner
            .ledger
            .open(subject_id)
            .into_iter()
            .filter(|v| inner.service_visible(&v.service_name, caller))
            .collect())
    }

    /// Every ledger entry, resolved ones included.
    pub async fn get_violation_history(
        &self,
        subject_id: Option<&str>,
        caller: Option<&CallerContext>,
    ) -> CuratorResult<Vec<LedgerEntry>> {
        let inner = &self.inner;
        inner.lifecycle.ensure(Access::Read, "get_violation_history")?;
        if !inner.permitted(caller, resources::PATTERN_VALIDATION, Action::Read).await {
            return Ok(Vec::new());
        }
        Ok(inner
            .ledger
            .history(subject_id)
            .iter()
            .filter(|e| inner.service_visible(&e.violation.service_name, caller))
            .map(|e| e.as_ref().clone())
            .collect())
    }

    // ---------------------------------------------------------------------
    // Health and documentation
    // ---------------------------------------------------------------------

    /// Health across every registry, the lifecycle and the backend. Served in
    /// every lifecycle state.
    pub fn get_aggregated_health(&self) -> AggregatedHealth {
        self.inner.aggregated_health()
    }

    /// Serializable view of every registry, tenant-filtered for `caller`.
    pub async fn snapshot(&self, caller: Option<&CallerContext>) -> CuratorResult<RegistrySnapshot> {
        let inner = &self.inner;
        inner.lifecycle.ensure(Access::Read, "snapshot")?;
        inner.authorize(caller, resources::REGISTRY_SNAPSHOT, Action::Read).await?;
        Ok(inner.snapshot(caller))
    }
}

impl Inner {
    fn degraded_discovery(&self) -> bool {
        self.backend.is_some() && !self.mirror_state.is_reachable()
    }

    // --- security -------------------------------------------------------

    /// Tenant admission then permission check. No caller context means a
    /// trusted in-process call.
    async fn authorize(&self, caller: Option<&CallerContext>, resource: &str, action: Action) -> CuratorResult<()> {
        let Some(caller) = caller else {
            return Ok(());
        };

        if let Some(tenant) = caller.tenant_id.as_deref() {
            if !self.tenants.validate_tenant_access(tenant).await {
                log::warn!(
                    "Tenant '{}' of principal '{}' refused for {} on {}",
                    tenant,
                    caller.principal,
                    action,
                    resource
                );
                return Err(CuratorError::AccessDenied(format!("tenant '{}' is not admitted", tenant)));
            }
        }

        if !self.security.check_permissions(caller, resource, action).await {
            log::warn!("Principal '{}' denied {} on {}", caller.principal, action, resource);
            return Err(CuratorError::AccessDenied(format!(
                "principal '{}' may not {} {}",
                caller.principal, action, resource
            )));
        }
        Ok(())
    }

    async fn permitted(&self, caller: Option<&CallerContext>, resource: &str, action: Action) -> bool {
        self.authorize(caller, resource, action).await.is_ok()
    }

    /// A caller may only submit records it can see: scoped to its own
    /// tenant, or global. A caller without a tenant submits global records.
    fn check_scope(caller: Option<&CallerContext>, scope: Option<&str>, what: &str) -> CuratorResult<()> {
        if is_visible_to(scope, caller) {
            return Ok(());
        }
        let tenant = caller.and_then(|c| c.tenant_id.as_deref()).unwrap_or("none");
        Err(CuratorError::AccessDenied(format!(
            "tenant '{}' cannot register a {} scoped to tenant '{}'",
            tenant,
            what,
            scope.unwrap_or_default()
        )))
    }

    /// Replacing a stored record requires [`may_replace`]: the caller sees
    /// it, and only its own tenant changes its scope.
    fn admit_replacement(
        existing: Option<&str>,
        submitted: Option<&str>,
        caller: Option<&CallerContext>,
        kind: &str,
        key: &str,
    ) -> CuratorResult<()> {
        if may_replace(existing, submitted, caller) {
            return Ok(());
        }
        if let Some(caller) = caller {
            log::warn!("Principal '{}' refused to replace {} '{}'", caller.principal, kind, key);
        }
        Err(CuratorError::AccessDenied(format!(
            "{} '{}' cannot be replaced by this caller",
            kind, key
        )))
    }

    fn ensure_visible(
        scope: Option<&str>,
        caller: Option<&CallerContext>,
        kind: &str,
        key: &str,
    ) -> CuratorResult<()> {
        if is_visible_to(scope, caller) {
            Ok(())
        } else {
            Err(CuratorError::AccessDenied(format!("{} '{}' is not visible to this tenant", kind, key)))
        }
    }

    fn ensure_instance_visible(
        &self,
        service_name: &str,
        instance_id: &str,
        caller: Option<&CallerContext>,
    ) -> CuratorResult<()> {
        match self.services.get(service_name, instance_id) {
            Some(record) => Self::ensure_visible(
                record.tenant_scope.as_deref(),
                caller,
                "service instance",
                &format!("{}/{}", service_name, instance_id),
            ),
            None => Ok(()),
        }
    }

    fn ensure_agent_visible(&self, agent_id: &str, caller: Option<&CallerContext>) -> CuratorResult<()> {
        match self.agents.get(agent_id) {
            Some(record) => Self::ensure_visible(record.tenant_scope.as_deref(), caller, "agent", agent_id),
            None => Ok(()),
        }
    }

    /// Violations of a service are visible when any of its instances is, or
    /// when no instance remains.
    fn service_visible(&self, service_name: &str, caller: Option<&CallerContext>) -> bool {
        if caller.is_none() {
            return true;
        }
        let instances = self.services.list(|r| r.service_name == service_name);
        instances.is_empty()
            || instances
                .iter()
                .any(|r| is_visible_to(r.tenant_scope.as_deref(), caller))
    }

    // --- registration ---------------------------------------------------

    async fn prepare_registration(
        &self,
        service: ServiceRecord,
        capabilities: Vec<CapabilityDefinition>,
        caller: Option<&CallerContext>,
    ) -> CuratorResult<PreparedRegistration> {
        self.authorize(caller, resources::SERVICE_REGISTRY, Action::Write).await?;
        if !capabilities.is_empty() {
            self.authorize(caller, resources::CAPABILITY_REGISTRY, Action::Write).await?;
        }

        service.validate_for_registration()?;
        Self::check_scope(caller, service.tenant_scope.as_deref(), "service")?;

        let now = Utc::now();
        let mut names = HashSet::new();
        let mut soa_names = HashSet::new();
        let mut mcp_names = HashSet::new();
        let mut prepared = Vec::with_capacity(capabilities.len());

        for mut definition in capabilities {
            if definition.owning_service.trim().is_empty() {
                definition.owning_service = service.service_name.clone();
            }
            if definition.owning_service != service.service_name {
                return Err(CuratorError::Validation(format!(
                    "capability '{}' is owned by '{}' but was submitted by service '{}'",
                    definition.capability_name, definition.owning_service, service.service_name
                )));
            }
            if definition.realm.is_none() {
                definition.realm = Some(service.realm.clone());
            }
            if definition.tenant_scope.is_none() {
                definition.tenant_scope = service.tenant_scope.clone();
            }
            Self::check_scope(caller, definition.tenant_scope.as_deref(), "capability")?;
            definition.validate()?;

            if !names.insert(definition.capability_name.clone()) {
                return Err(CuratorError::Validation(format!(
                    "capability '{}' submitted more than once",
                    definition.capability_name
                )));
            }

            let (soa_api, mcp_tool) = definition.bindings(now)?;
            if let Some(binding) = &soa_api {
                if !soa_names.insert(binding.binding_name().to_string()) {
                    return Err(CuratorError::Validation(format!(
                        "SOA API '{}' is bound by more than one capability",
                        binding.binding_name()
                    )));
                }
            }
            if let Some(binding) = &mcp_tool {
                if !mcp_names.insert(binding.binding_name().to_string()) {
                    return Err(CuratorError::Validation(format!(
                        "MCP tool '{}' is bound by more than one capability",
                        binding.binding_name()
                    )));
                }
            }

            prepared.push(PreparedCapability {
                definition,
                soa_api,
                mcp_tool,
            });
        }

        let submitted: Vec<&CapabilityDefinition> = prepared.iter().map(|p| &p.definition).collect();
        let violations = self.evaluate(&service, &submitted, now)?;

        Ok(PreparedRegistration {
            service,
            capabilities: prepared,
            violations,
        })
    }

    /// Validate `service` with `submitted` plus its other stored
    /// capabilities and apply the enforcement mode. Only a strict rejection
    /// is recorded here; accepted runs are recorded at commit.
    fn evaluate(
        &self,
        service: &ServiceRecord,
        submitted: &[&CapabilityDefinition],
        now: DateTime<Utc>,
    ) -> CuratorResult<Vec<AntiPatternViolation>> {
        let stored = self
            .capabilities
            .list(&CapabilityFilter::for_service(&service.service_name), |_| true);
        let mut subject: Vec<&CapabilityDefinition> = submitted.to_vec();
        subject.extend(
            stored
                .iter()
                .map(|c| c.as_ref())
                .filter(|c| !submitted.iter().any(|s| s.capability_name == c.capability_name)),
        );

        let violations = self.engine.validate(service, subject, now);
        if self.config.enforcement == EnforcementMode::Strict && has_blocking(&violations) {
            let rules = violations
                .iter()
                .filter(|v| v.severity == Severity::Blocking)
                .map(|v| v.rule_id.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            log::warn!("Rejecting '{}' for blocking violations: {}", service.service_name, rules);
            self.ledger.record_run(&service.service_name, violations, now);
            return Err(CuratorError::Validation(format!(
                "service '{}' has blocking pattern violations: {}",
                service.service_name, rules
            )));
        }
        Ok(violations)
    }

    /// Validate the stored state of a service and record the run. Never
    /// rejects.
    fn revalidate(&self, service: &ServiceRecord, now: DateTime<Utc>) -> Vec<AntiPatternViolation> {
        let stored = self
            .capabilities
            .list(&CapabilityFilter::for_service(&service.service_name), |_| true);
        let violations = self
            .engine
            .validate(service, stored.iter().map(|c| c.as_ref()), now);
        self.ledger
            .record_run(&service.service_name, violations, now)
            .open
    }

    /// Per-service lock taken by every capability and binding writer.
    fn service_lock(&self, service_name: &str) -> Arc<Mutex<()>> {
        Arc::clone(self.commit_locks.entry(service_name.to_string()).or_default().value())
    }

    /// Checks run before the first write of a capability: tenant ownership
    /// of the definition being replaced and binding claims.
    fn admit_capability(
        &self,
        capability: &PreparedCapability,
        released: &[&str],
        caller: Option<&CallerContext>,
    ) -> CuratorResult<()> {
        let definition = &capability.definition;
        if let Some(existing) = self
            .capabilities
            .get(&definition.owning_service, &definition.capability_name)
        {
            Self::admit_replacement(
                existing.tenant_scope.as_deref(),
                definition.tenant_scope.as_deref(),
                caller,
                "capability",
                &format!("{}/{}", definition.owning_service, definition.capability_name),
            )?;
        }
        if let Some(binding) = &capability.soa_api {
            self.soa_apis.check_claim(binding, released)?;
        }
        if let Some(binding) = &capability.mcp_tool {
            self.mcp_tools.check_claim(binding, released)?;
        }
        Ok(())
    }

    fn commit_registration(
        &self,
        prepared: PreparedRegistration,
        caller: Option<&CallerContext>,
    ) -> CuratorResult<RegistrationAck> {
        let now = Utc::now();
        let lock = self.service_lock(&prepared.service.service_name);
        let _guard = lock.lock();

        let names: Vec<String> = prepared
            .capabilities
            .iter()
            .map(|c| c.definition.capability_name.clone())
            .collect();
        let released: Vec<&str> = names.iter().map(String::as_str).collect();
        for capability in &prepared.capabilities {
            self.admit_capability(capability, &released, caller)?;
        }

        let submitted = prepared.service.tenant_scope.clone();
        let registration = self.services.register_with(prepared.service, now, |existing| {
            Self::admit_replacement(
                existing.tenant_scope.as_deref(),
                submitted.as_deref(),
                caller,
                "service instance",
                &existing.key().to_string(),
            )
        })?;
        let record = Arc::clone(&registration.record);
        let violations = self
            .ledger
            .record_run(&record.service_name, prepared.violations, now)
            .open;

        let mut ack = RegistrationAck {
            accepted: true,
            service: record,
            replaced_service: registration.replaced,
            degraded_discovery: false,
            violations,
            capabilities: Vec::new(),
            replaced_capabilities: Vec::new(),
            notes: Vec::new(),
        };

        for capability in prepared.capabilities {
            let name = capability.definition.capability_name.clone();
            let capability_ack = self.commit_capability(capability, &released, caller, now)?;
            if capability_ack.replaced {
                ack.replaced_capabilities.push(name.clone());
            }
            ack.notes.extend(capability_ack.note);
            ack.capabilities.push(name);
        }
        if !ack.capabilities.is_empty() {
            self.docs.bump();
        }
        Ok(ack)
    }

    /// Store a capability and replace its bindings. Callers hold the
    /// service's commit lock and have run [`Inner::admit_capability`].
    fn commit_capability(
        &self,
        capability: PreparedCapability,
        released: &[&str],
        caller: Option<&CallerContext>,
        now: DateTime<Utc>,
    ) -> CuratorResult<CapabilityAck> {
        let service = capability.definition.owning_service.clone();
        let name = capability.definition.capability_name.clone();
        let submitted = capability.definition.tenant_scope.clone();
        let key = format!("{}/{}", service, name);
        let ack = self.capabilities.commit(capability.definition, now, |existing| {
            Self::admit_replacement(existing.tenant_scope.as_deref(), submitted.as_deref(), caller, "capability", &key)
        })?;

        self.soa_apis
            .remove_stale(&service, &name, capability.soa_api.as_ref().map(|b| b.binding_name()));
        if let Some(binding) = capability.soa_api {
            self.soa_apis.register(binding, released)?;
        }
        self.mcp_tools
            .remove_stale(&service, &name, capability.mcp_tool.as_ref().map(|b| b.binding_name()));
        if let Some(binding) = capability.mcp_tool {
            self.mcp_tools.register(binding, released)?;
        }
        Ok(ack)
    }

    /// Apply `update` to every non-stopped instance of a service. Instances
    /// stopped concurrently are skipped.
    fn apply_service_update(
        &self,
        service_name: &str,
        update: &ServiceUpdate,
        caller: Option<&CallerContext>,
    ) -> CuratorResult<Vec<Arc<ServiceRecord>>> {
        let lock = self.service_lock(service_name);
        let _guard = lock.lock();

        let targets = self
            .services
            .list(|r| r.service_name == service_name && r.status != ServiceStatus::Stopped);
        if targets.is_empty() {
            return Err(CuratorError::not_found("service", service_name));
        }
        for target in &targets {
            let key = target.key().to_string();
            Self::ensure_visible(target.tenant_scope.as_deref(), caller, "service instance", &key)?;
        }

        let mut updated = Vec::with_capacity(targets.len());
        for target in targets {
            let outcome = self
                .services
                .update_metadata(&target.service_name, &target.instance_id, update, |current| {
                    Self::ensure_visible(
                        current.tenant_scope.as_deref(),
                        caller,
                        "service instance",
                        &current.key().to_string(),
                    )
                });
            match outcome {
                Ok(record) => updated.push(record),
                Err(CuratorError::TerminalState { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(updated)
    }

    /// Latest non-stopped instance of a service.
    fn representative_instance(&self, service_name: &str) -> Option<Arc<ServiceRecord>> {
        self.services
            .list(|r| r.service_name == service_name && r.status != ServiceStatus::Stopped)
            .into_iter()
            .max_by_key(|r| r.registered_at)
    }

    /// When no non-stopped instance of the service remains, remove its
    /// capabilities, bindings and routes and close its violations.
    fn retire_if_last(&self, service_name: &str, now: DateTime<Utc>) -> Vec<String> {
        let lock = self.service_lock(service_name);
        let _guard = lock.lock();
        if self.services.has_active_instance(service_name) {
            return Vec::new();
        }
        let removed: Vec<String> = self
            .capabilities
            .remove_service(service_name)
            .iter()
            .map(|c| c.capability_name.clone())
            .collect();
        self.soa_apis.remove_for_service(service_name);
        self.mcp_tools.remove_for_service(service_name);
        let routes = self.routes.remove_for_service(service_name).len();
        self.ledger.resolve_service(service_name, now);
        if routes > 0 {
            log::info!("Removed {} routes of retired service '{}'", routes, service_name);
        }

        if !removed.is_empty() {
            log::info!(
                "Last instance of '{}' gone; removed capabilities {}",
                service_name,
                removed.join(", ")
            );
            self.docs.bump();
        }
        removed
    }

    // --- background work ------------------------------------------------

    /// Hand `command` to the mirror worker.
    fn queue(&self, command: MirrorCommand) {
        if let Some(mirror) = self.mirror.lock().as_ref() {
            mirror.submit(command);
        }
    }

    /// Attempt `command` once on the calling task, bounded by the mirror
    /// timeout. Returns whether discovery is degraded; a failed command is
    /// left to the worker's retries.
    async fn mirror_inline(&self, command: MirrorCommand) -> bool {
        let mirror = self.mirror.lock().clone();
        match mirror {
            Some(mirror) => !mirror.apply_now(command).await,
            None => self.degraded_discovery(),
        }
    }

    /// [`Inner::mirror_inline`] for an announce. An instance stopped while
    /// the announce was in flight is withdrawn again.
    async fn announce_inline(&self, record: &ServiceRecord) -> bool {
        let degraded = self.mirror_inline(MirrorCommand::announce(record)).await;
        let live = self
            .services
            .get(&record.service_name, &record.instance_id)
            .is_some_and(|r| r.status != ServiceStatus::Stopped);
        if !live {
            self.queue(MirrorCommand::withdraw(&record.service_name, &record.instance_id));
        }
        degraded
    }

    async fn rehydrate(&self, backend: &dyn DiscoveryBackend) -> usize {
        let timeout = self.config.mirror_timeout();
        let instances = match tokio::time::timeout(timeout, backend.list_instances()).await {
            Ok(Ok(instances)) => instances,
            Ok(Err(e)) => {
                log::warn!("Re-hydration from '{}' failed: {}", backend.name(), e);
                return 0;
            }
            Err(_) => {
                log::warn!("Re-hydration from '{}' timed out after {}ms", backend.name(), timeout.as_millis());
                return 0;
            }
        };

        let now = Utc::now();
        let imported = instances
            .iter()
            .filter(|instance| self.services.import(instance.to_service_record(now)))
            .count();
        log::info!("Re-hydrated {} of {} instances from '{}'", imported, instances.len(), backend.name());
        imported
    }

    fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let expired = self.services.expire(now, self.config.heartbeat_timeout());
        let mut report = SweepReport::default();
        for record in &expired {
            log::warn!(
                "Instance {}/{} missed heartbeats for {}s; marked stopped",
                record.service_name,
                record.instance_id,
                self.config.heartbeat_timeout_secs
            );
            self.queue(MirrorCommand::withdraw(&record.service_name, &record.instance_id));
            self.retire_if_last(&record.service_name, now);
            report.expired.push(record.key().to_string());
        }

        report.purged = self
            .services
            .purge_stopped(now, self.config.stopped_retention())
            .len();
        if report.purged > 0 {
            log::debug!("Purged {} stopped instances", report.purged);
        }
        report
    }

    // --- reporting ------------------------------------------------------

    fn aggregated_health(&self) -> AggregatedHealth {
        let counts = self.services.counts();
        let services = RegistryStatus::new(
            resources::SERVICE_REGISTRY,
            if counts.degraded > 0 {
                HealthStatus::Degraded
            } else {
                HealthStatus::Healthy
            },
            self.services.len(),
        )
        .with_detail(format!(
            "starting {}, healthy {}, degraded {}, stopped {}",
            counts.starting, counts.healthy, counts.degraded, counts.stopped
        ));

        let impaired = self.agents.impaired_count();
        let mut agents = RegistryStatus::new(
            resources::AGENT_REGISTRY,
            if impaired > 0 {
                HealthStatus::Degraded
            } else {
                HealthStatus::Healthy
            },
            self.agents.len(),
        );
        if impaired > 0 {
            agents = agents.with_detail(format!("{} agents degraded or unhealthy", impaired));
        }

        let open = self.ledger.open_count();
        let blocking = self.ledger.has_open_at_least(Severity::Blocking);
        let mut patterns = RegistryStatus::new(
            resources::PATTERN_VALIDATION,
            if blocking {
                HealthStatus::Degraded
            } else {
                HealthStatus::Healthy
            },
            open,
        );
        if blocking {
            patterns = patterns.with_detail("blocking violations open");
        }

        let per_registry_status = vec![
            services,
            RegistryStatus::new(resources::CAPABILITY_REGISTRY, HealthStatus::Healthy, self.capabilities.len()),
            RegistryStatus::new(resources::SOA_API_REGISTRY, HealthStatus::Healthy, self.soa_apis.len()),
            RegistryStatus::new(resources::MCP_TOOL_REGISTRY, HealthStatus::Healthy, self.mcp_tools.len()),
            RegistryStatus::new(resources::ROUTE_REGISTRY, HealthStatus::Healthy, self.routes.len()),
            agents,
            patterns,
        ];

        let mirror = self.mirror_state.status();
        let discovery_backend = DiscoveryBackendHealth {
            name: self.backend.as_ref().map(|b| b.name().to_string()),
            status: match &self.backend {
                None => BackendStatus::Disabled,
                Some(_) if mirror.reachable => BackendStatus::Healthy,
                Some(_) => BackendStatus::Degraded,
            },
            last_error: mirror.last_error,
            last_checked_at: mirror.last_checked_at,
        };

        AggregatedHealth::new(
            self.lifecycle.current(),
            per_registry_status,
            discovery_backend,
            mirror.pending_operations,
            Utc::now(),
        )
    }

    fn snapshot(&self, caller: Option<&CallerContext>) -> RegistrySnapshot {
        let visible = |scope: Option<&str>| is_visible_to(scope, caller);
        let everything = BindingFilter::default();

        RegistrySnapshot {
            revision: self.docs.revision(),
            generated_at: Utc::now(),
            services: self
                .services
                .list(|r| visible(r.tenant_scope.as_deref()))
                .iter()
                .map(|r| r.as_ref().clone())
                .collect(),
            capabilities: self
                .capabilities
                .list(&CapabilityFilter::default(), |c| visible(c.tenant_scope.as_deref()))
                .iter()
                .map(|c| c.as_ref().clone())
                .collect(),
            soa_apis: self
                .soa_apis
                .list(&everything, |b| visible(b.tenant_scope()))
                .iter()
                .map(|b| b.as_ref().clone())
                .collect(),
            mcp_tools: self
                .mcp_tools
                .list(&everything, |b| visible(b.tenant_scope()))
                .iter()
                .map(|b| b.as_ref().clone())
                .collect(),
            routes: self
                .routes
                .discover(&RouteFilter::default(), |r| visible(r.tenant_scope.as_deref()))
                .iter()
                .map(|r| r.as_ref().clone())
                .collect(),
            agents: self
                .agents
                .list(true, |a| visible(a.tenant_scope.as_deref()))
                .iter()
                .map(|a| AgentReport::from(a.as_ref()))
                .collect(),
            violations: self
                .ledger
                .open(None)
                .into_iter()
                .filter(|v| self.service_visible(&v.service_name, caller))
                .collect(),
        }
    }
}

/// Periodic liveness sweep. Ends once the facade is dropped.
fn spawn_sweeper(inner: Weak<Inner>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let Some(inner) = inner.upgrade() else {
                break;
            };
            inner.sweep(Utc::now());
        }
    })
}
