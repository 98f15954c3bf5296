//! Curator configuration.
//!
//! ```yaml
//! heartbeat_timeout_secs: 60
//! enforcement: strict
//! consul:
//!   address: "http://consul.internal:8500"
//!   service_prefix: "platform-"
//! rules:
//!   - rule_id: finance_requires_tenant
//!     kind: require_tenant_scope
//!     severity: blocking
//!     realms: [finance]
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::discovery::ConsulConfig;
use crate::errors::{CuratorError, CuratorResult};
use crate::patterns::{builtin_rules, EnforcementMode, PatternRule, RuleSpec};

/// Largest heartbeat timeout or stopped retention, in seconds, that fits a
/// `chrono::Duration`.
pub const MAX_RETENTION_SECS: u64 = (i64::MAX / 1000) as u64;

/// Largest period accepted for timer-driven settings (one year).
pub const MAX_PERIOD_SECS: u64 = 365 * 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CuratorConfig {
    pub heartbeat_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub stopped_retention_secs: u64,
    pub registration_timeout_ms: u64,
    pub mirror_timeout_ms: u64,
    pub mirror_retry_interval_ms: u64,
    pub docs_debounce_ms: u64,
    pub drain_period_ms: u64,
    pub enforcement: EnforcementMode,
    pub rehydrate_on_start: bool,
    pub consul: Option<ConsulConfig>,
    pub rules: Vec<RuleSpec>,
    pub builtin_rules: bool,
    /// Honour caller roles sent in the `x-roles` header. Only safe behind a
    /// proxy that sets the header itself; otherwise roles come from the
    /// RBAC assignments of the principal.
    pub trust_forwarded_roles: bool,
}

impl Default for CuratorConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_secs: 90,
            sweep_interval_secs: 15,
            stopped_retention_secs: 3600,
            registration_timeout_ms: 5000,
            mirror_timeout_ms: 1500,
            mirror_retry_interval_ms: 5000,
            docs_debounce_ms: 500,
            drain_period_ms: 0,
            enforcement: EnforcementMode::AuditOnly,
            rehydrate_on_start: false,
            consul: None,
            rules: Vec::new(),
            builtin_rules: true,
            trust_forwarded_roles: false,
        }
    }
}

impl CuratorConfig {
    pub fn from_yaml(yaml: &str) -> CuratorResult<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> CuratorResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Apply `CURATOR_*` environment overrides.
    pub fn apply_env_overrides(&mut self) -> CuratorResult<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides<F>(&mut self, var: F) -> CuratorResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(address) = var("CURATOR_CONSUL_ADDR").filter(|v| !v.trim().is_empty()) {
            self.consul.get_or_insert_with(ConsulConfig::default).address = address;
        }
        if let Some(token) = var("CURATOR_CONSUL_TOKEN").filter(|v| !v.is_empty()) {
            self.consul.get_or_insert_with(ConsulConfig::default).token = Some(token);
        }
        if let Some(timeout) = var("CURATOR_HEARTBEAT_TIMEOUT_SECS") {
            self.heartbeat_timeout_secs = timeout.trim().parse().map_err(|_| {
                CuratorError::Config(format!("CURATOR_HEARTBEAT_TIMEOUT_SECS is not a number: '{}'", timeout))
            })?;
        }
        if let Some(trust) = var("CURATOR_TRUST_FORWARDED_ROLES") {
            self.trust_forwarded_roles = match trust.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" | "" => false,
                _ => {
                    return Err(CuratorError::Config(format!(
                        "CURATOR_TRUST_FORWARDED_ROLES is not a boolean: '{}'",
                        trust
                    )))
                }
            };
        }
        if let Some(mode) = var("CURATOR_ENFORCEMENT") {
            self.enforcement = EnforcementMode::parse(mode.trim())
                .ok_or_else(|| CuratorError::Config(format!("unknown enforcement mode '{}'", mode)))?;
        }
        self.validate()
    }

    /// Reject settings the curator cannot run with.
    pub fn validate(&self) -> CuratorResult<()> {
        if self.heartbeat_timeout_secs == 0 {
            return Err(CuratorError::Config("heartbeat_timeout_secs must be positive".into()));
        }
        if self.sweep_interval_secs == 0 {
            return Err(CuratorError::Config("sweep_interval_secs must be positive".into()));
        }
        if self.mirror_retry_interval_ms == 0 {
            return Err(CuratorError::Config("mirror_retry_interval_ms must be positive".into()));
        }
        for (name, secs) in [
            ("heartbeat_timeout_secs", self.heartbeat_timeout_secs),
            ("stopped_retention_secs", self.stopped_retention_secs),
        ] {
            if secs > MAX_RETENTION_SECS {
                return Err(CuratorError::Config(format!(
                    "{} ({}) exceeds the maximum of {}",
                    name, secs, MAX_RETENTION_SECS
                )));
            }
        }
        for (name, secs) in [
            ("sweep_interval_secs", self.sweep_interval_secs),
            ("mirror_retry_interval_ms", self.mirror_retry_interval_ms / 1000),
            ("docs_debounce_ms", self.docs_debounce_ms / 1000),
            ("drain_period_ms", self.drain_period_ms / 1000),
        ] {
            if secs > MAX_PERIOD_SECS {
                return Err(CuratorError::Config(format!("{} exceeds one year", name)));
            }
        }
        if self.mirror_timeout_ms == 0 || self.mirror_timeout_ms >= self.registration_timeout_ms {
            return Err(CuratorError::Config(format!(
                "mirror_timeout_ms ({}) must be positive and shorter than registration_timeout_ms ({})",
                self.mirror_timeout_ms, self.registration_timeout_ms
            )));
        }
        Ok(())
    }

    /// Compiled pattern rules: configured ones, plus the built-in
    /// conventions when enabled.
    pub fn pattern_rules(&self) -> CuratorResult<Vec<PatternRule>> {
        let mut rules = if self.builtin_rules { builtin_rules() } else { Vec::new() };
        for spec in &self.rules {
            rules.push(spec.compile()?);
        }
        Ok(rules)
    }

    pub fn heartbeat_timeout(&self) -> chrono::Duration {
        seconds_saturating(self.heartbeat_timeout_secs)
    }

    pub fn stopped_retention(&self) -> chrono::Duration {
        seconds_saturating(self.stopped_retention_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn registration_timeout(&self) -> Duration {
        Duration::from_millis(self.registration_timeout_ms)
    }

    pub fn mirror_timeout(&self) -> Duration {
        Duration::from_millis(self.mirror_timeout_ms)
    }

    pub fn mirror_retry_interval(&self) -> Duration {
        Duration::from_millis(self.mirror_retry_interval_ms)
    }

    pub fn docs_debounce(&self) -> Duration {
        Duration::from_millis(self.docs_debounce_ms)
    }

    pub fn drain_period(&self) -> Duration {
        Duration::from_millis(self.drain_period_ms)
    }
}

/// `secs` as a chrono duration, saturating at [`chrono::Duration::MAX`].
fn seconds_saturating(secs: u64) -> chrono::Duration {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or(chrono::Duration::MAX)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = CuratorConfig::default();
        assert_eq!(config.heartbeat_timeout_secs, 90);
        assert_eq!(config.enforcement, EnforcementMode::AuditOnly);
        assert!(config.consul.is_none());
        assert!(config.validate().is_ok());
        assert_eq!(config.pattern_rules().unwrap().len(), builtin_rules().len());
    }

    #[test]
    fn test_load_from_yaml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
heartbeat_timeout_secs: 30
enforcement: strict
builtin_rules: false
consul:
  address: "http://consul:8500"
rules:
  - rule_id: described
    kind: require_description
"#
        )
        .unwrap();

        let config = CuratorConfig::from_yaml_file(file.path()).unwrap();
        assert_eq!(config.heartbeat_timeout_secs, 30);
        assert_eq!(config.sweep_interval_secs, 15);
        assert_eq!(config.enforcement, EnforcementMode::Strict);
        assert_eq!(config.consul.as_ref().unwrap().address, "http://consul:8500");
        assert_eq!(config.consul.as_ref().unwrap().service_prefix, "");
        assert_eq!(config.pattern_rules().unwrap().len(), 1);
    }

    #[test]
    fn test_missing_file_and_bad_values_are_config_errors() {
        let dir = tempfile::tempdir().unwrap();
        let err = CuratorConfig::from_yaml_file(dir.path().join("absent.yaml")).unwrap_err();
        assert!(matches!(err, CuratorError::Config(_)));

        let err = CuratorConfig::from_yaml("mirror_timeout_ms: 9000").unwrap_err();
        assert!(err.to_string().contains("mirror_timeout_ms"));
    }

    #[test]
    fn test_durations_are_bounded() {
        let err = CuratorConfig::from_yaml(&format!("heartbeat_timeout_secs: {}", u64::MAX)).unwrap_err();
        assert!(err.to_string().contains("heartbeat_timeout_secs"));
        let err = CuratorConfig::from_yaml(&format!("stopped_retention_secs: {}", MAX_RETENTION_SECS + 1)).unwrap_err();
        assert!(err.to_string().contains("stopped_retention_secs"));
        let err = CuratorConfig::from_yaml("sweep_interval_secs: 100000000").unwrap_err();
        assert!(matches!(err, CuratorError::Config(_)));

        let config = CuratorConfig::from_yaml(&format!("heartbeat_timeout_secs: {}", MAX_RETENTION_SECS)).unwrap();
        assert!(config.heartbeat_timeout() > chrono::Duration::zero());

        let unchecked = CuratorConfig {
            stopped_retention_secs: u64::MAX,
            ..Default::default()
        };
        assert_eq!(unchecked.stopped_retention(), chrono::Duration::MAX);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("CURATOR_CONSUL_ADDR", "http://10.0.0.9:8500"),
            ("CURATOR_CONSUL_TOKEN", "t0ken"),
            ("CURATOR_HEARTBEAT_TIMEOUT_SECS", "45"),
            ("CURATOR_ENFORCEMENT", "strict"),
            ("CURATOR_TRUST_FORWARDED_ROLES", "true"),
        ]);
        let mut config = CuratorConfig::default();
        config
            .apply_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        let consul = config.consul.unwrap();
        assert_eq!(consul.address, "http://10.0.0.9:8500");
        assert_eq!(consul.token.as_deref(), Some("t0ken"));
        assert_eq!(config.heartbeat_timeout_secs, 45);
        assert_eq!(config.enforcement, EnforcementMode::Strict);
        assert!(config.trust_forwarded_roles);

        let mut config = CuratorConfig::default();
        let err = config
            .apply_overrides(|k| (k == "CURATOR_ENFORCEMENT").then(|| "lenient".to_string()))
            .unwrap_err();
        assert!(matches!(err, CuratorError::Config(_)));
    }
}
