//! The curator facade: one entry point over every registry.
//!
//! [`Curator`] owns the service, capability, contract-binding, route and
//! agent registries, the pattern engine with its violation ledger, the discovery
//! mirror, and the documentation trigger. Calls are gated by the
//! [`LifecycleState`] and by the injected security collaborators.

pub mod ack;
pub mod facade;
pub mod lifecycle;

pub use ack::{AgentRegistrationAck, DeregistrationAck, HealthAck, RegistrationAck, ServiceUpdateAck, SweepReport};
pub use facade::{Curator, CuratorBuilder};
pub use lifecycle::LifecycleState;
