//! Facade lifecycle state machine.
//!
//! `uninitialized -> initializing -> ready -> shutting_down -> stopped`

use std::fmt;

use parking_lot::RwLock;
use serde::Serialize;

use crate::errors::{CuratorError, CuratorResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Uninitialized,
    Initializing,
    Ready,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Uninitialized => "uninitialized",
            LifecycleState::Initializing => "initializing",
            LifecycleState::Ready => "ready",
            LifecycleState::ShuttingDown => "shutting_down",
            LifecycleState::Stopped => "stopped",
        };
        write!(f, "{}", s)
    }
}

/// What an operation needs from the lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Access {
    /// Registrations and reports: `ready` only.
    Write,
    /// Discovery, lookups, and departures: also served while shutting down.
    Read,
}

#[derive(Debug)]
pub(crate) struct Lifecycle {
    state: RwLock<LifecycleState>,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self {
            state: RwLock::new(LifecycleState::Uninitialized),
        }
    }

    pub(crate) fn current(&self) -> LifecycleState {
        *self.state.read()
    }

    /// Move to `to` if the current state is one of `from`; otherwise return
    /// the current state.
    pub(crate) fn transition(&self, from: &[LifecycleState], to: LifecycleState) -> Result<LifecycleState, LifecycleState> {
        let mut state = self.state.write();
        if !from.contains(&*state) {
            return Err(*state);
        }
        let previous = std::mem::replace(&mut *state, to);
        log::info!("Curator lifecycle: {} -> {}", previous, to);
        Ok(previous)
    }

    pub(crate) fn ensure(&self, access: Access, operation: &'static str) -> CuratorResult<()> {
        let state = self.current();
        let allowed = match access {
            Access::Write => state == LifecycleState::Ready,
            Access::Read => matches!(state, LifecycleState::Ready | LifecycleState::ShuttingDown),
        };
        if allowed {
            Ok(())
        } else {
            Err(CuratorError::NotReady { state, operation })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_by_state() {
        let lifecycle = Lifecycle::new();
        assert!(lifecycle.ensure(Access::Read, "discover_services").is_err());

        lifecycle
            .transition(&[LifecycleState::Uninitialized], LifecycleState::Initializing)
            .unwrap();
        lifecycle
            .transition(&[LifecycleState::Initializing], LifecycleState::Ready)
            .unwrap();
        assert!(lifecycle.ensure(Access::Write, "register_service").is_ok());

        lifecycle
            .transition(&[LifecycleState::Ready], LifecycleState::ShuttingDown)
            .unwrap();
        assert!(lifecycle.ensure(Access::Read, "discover_services").is_ok());
        let err = lifecycle.ensure(Access::Write, "register_service").unwrap_err();
        assert_eq!(err.to_string(), "Curator is not ready (state: shutting_down) for register_service");
    }

    #[test]
    fn test_transition_from_wrong_state_is_refused() {
        let lifecycle = Lifecycle::new();
        let err = lifecycle
            .transition(&[LifecycleState::Ready], LifecycleState::ShuttingDown)
            .unwrap_err();
        assert_eq!(err, LifecycleState::Uninitialized);
        assert_eq!(lifecycle.current(), LifecycleState::Uninitialized);
    }
}
