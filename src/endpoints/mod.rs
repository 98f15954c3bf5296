//! # Endpoint (Route) Registry
//!
//! Domains define HTTP routes; the curator tracks them centrally so
//! gateways and documentation can discover them by pillar, realm or owning
//! service. A route is identified by `METHOD:path:pillar:realm` unless the
//! registrant supplies its own id.
//!
//! Routes are descriptive: the registry stores the handler name, never the
//! handler itself, and performs no request matching.

pub mod registry;
pub mod route;

pub use registry::{RouteAck, RouteFilter, RouteRegistry};
pub use route::RouteRecord;
