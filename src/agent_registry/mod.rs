//! # Agent Capability & Health Registry
//!
//! Tracks what autonomous agents can do, how often each capability tag is
//! used, and the last health each agent reported. Agents come and go more
//! often than services, so records are archived on shutdown rather than
//! deleted; usage history stays queryable.

pub mod record;
pub mod registry;

pub use record::{AgentAnalytics, AgentCapabilityRecord, AgentHealth, AgentRegistration, AgentReport};
pub use registry::{AgentRegistry, UsageOutcome};
