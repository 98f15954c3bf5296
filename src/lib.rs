//! # curator
//!
//! A platform registry for service-oriented deployments. Services register
//! themselves with the capabilities they offer; each capability can be bound
//! to a SOA API and an MCP tool, and domains publish the HTTP routes they
//! define. Agents register their capability tags and
//! report usage. Every registration is checked against architectural
//! pattern rules, mirrored to an external discovery backend when one is
//! configured, and reflected in debounced registry snapshots for
//! documentation generators.
//!
//! The [`Curator`] facade is the single entry point:
//!
//! ```no_run
//! use curator::{Curator, CuratorConfig};
//! use curator::services::ServiceRecord;
//!
//! # async fn run() -> curator::CuratorResult<()> {
//! let curator = Curator::new(CuratorConfig::default())?;
//! curator.initialize().await?;
//! let ack = curator
//!     .register_service(ServiceRecord::new("parser-1", "i-1"), Vec::new(), None, None)
//!     .await?;
//! assert!(ack.accepted);
//! curator.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod agent_registry;
pub mod capabilities;
pub mod config;
pub mod contracts;
pub mod curator;
pub mod discovery;
pub mod docs;
pub mod endpoints;
pub mod errors;
pub mod health;
pub mod patterns;
pub mod security;
pub mod server;
pub mod services;
pub mod store;

pub use config::CuratorConfig;
pub use curator::{
    AgentRegistrationAck, Curator, CuratorBuilder, DeregistrationAck, HealthAck, LifecycleState, RegistrationAck,
    ServiceUpdateAck, SweepReport,
};
pub use errors::{CuratorError, CuratorResult};
pub use health::AggregatedHealth;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
