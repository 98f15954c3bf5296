//! # Service Registry
//!
//! One [`ServiceRecord`] per running instance, keyed by
//! `(service_name, instance_id)`. Local records are authoritative; mirroring
//! to an external discovery backend is handled by [`crate::discovery`].

pub mod record;
pub mod registry;

pub use record::{ServiceRecord, ServiceStatus, ServiceUpdate};
pub use registry::{Deregistration, ServiceCounts, ServiceRegistration, ServiceRegistry};
