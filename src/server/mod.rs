//! HTTP surface over the curator facade.
//!
//! Exposes discovery, health reporting, metadata updates, route
//! registration, agent reporting and registry snapshots to services that run
//! out of process. Registrations that carry
//! handler references stay in-process.

pub mod routes;

pub use routes::{app_router, caller_from_headers, AppState};
