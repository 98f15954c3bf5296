//! Curator error taxonomy.
//!
//! Every registry and facade operation returns [`CuratorError`] on failure.
//! "Not found" on the record store is an `Option`, not an error; the
//! [`CuratorError::NotFound`] variant is only produced by `get_*` facade calls
//! where the caller asked for a specific record.

use thiserror::Error;

use crate::curator::LifecycleState;
use crate::services::ServiceStatus;

/// Result alias used throughout the crate.
pub type CuratorResult<T> = Result<T, CuratorError>;

/// Errors returned by registries and the curator facade.
#[derive(Debug, Error)]
pub enum CuratorError {
    /// Malformed submission. Nothing was stored.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A specific record was requested and does not exist.
    #[error("{kind} not found: {key}")]
    NotFound { kind: &'static str, key: String },

    /// Attempt to move a `stopped` service instance to another status.
    #[error("Service instance {service_name}/{instance_id} is stopped and cannot transition to {requested}")]
    TerminalState {
        service_name: String,
        instance_id: String,
        requested: ServiceStatus,
    },

    /// Transition not allowed by the service state machine.
    #[error("Invalid status transition for {service_name}/{instance_id}: {from} -> {to}")]
    InvalidTransition {
        service_name: String,
        instance_id: String,
        from: ServiceStatus,
        to: ServiceStatus,
    },

    /// Security or tenant check failed.
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// The facade is not in a state that serves this call.
    #[error("Curator is not ready (state: {state}) for {operation}")]
    NotReady {
        state: LifecycleState,
        operation: &'static str,
    },

    /// A binding was submitted without a handler reference.
    #[error("Binding {binding_kind} '{binding_name}' of service '{owning_service}' has no handler reference")]
    NullHandler {
        binding_kind: &'static str,
        owning_service: String,
        binding_name: String,
    },

    /// The record is owned by something other than the submission.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The caller-supplied deadline elapsed before the write was committed.
    #[error("Timed out after {0}ms before commit")]
    Timeout(u64),

    /// External discovery backend failure.
    #[error("Discovery backend error: {0}")]
    Backend(String),

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl CuratorError {
    pub(crate) fn not_found(kind: &'static str, key: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            key: key.into(),
        }
    }

    /// Stable machine-readable code, used by the HTTP surface.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::TerminalState { .. } => "TERMINAL_STATE",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::AccessDenied(_) => "ACCESS_DENIED",
            Self::NotReady { .. } => "NOT_READY",
            Self::NullHandler { .. } => "NULL_HANDLER",
            Self::Conflict(_) => "CONFLICT",
            Self::Timeout(_) => "TIMEOUT",
            Self::Backend(_) => "BACKEND_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
        }
    }
}

impl From<serde_yaml::Error> for CuratorError {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Config(format!("YAML error: {}", e))
    }
}

impl From<std::io::Error> for CuratorError {
    fn from(e: std::io::Error) -> Self {
        Self::Config(format!("IO error: {}", e))
    }
}
