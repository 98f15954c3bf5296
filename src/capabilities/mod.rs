//! # Capability Registry
//!
//! Services describe what they can do as [`CapabilityDefinition`]s. Each
//! definition may carry a SOA-API contract, an MCP-tool contract, both, or
//! neither (metadata-only).
//!
//! ## Registration Flow
//!
//! 1. A service submits its definitions alongside its instance record.
//! 2. `CapabilityDefinition::validate` checks required fields.
//! 3. `CapabilityDefinition::bindings` builds and validates contract records.
//! 4. `CapabilityRegistry::commit` stores the effective definition; the
//!    contract registries store the bindings.
//!
//! Definitions are replaced, never merged: re-registering the same
//! `(owning_service, capability_name)` drops every field of the old record.

pub mod capability;
pub mod registry;

pub use capability::{CapabilityContracts, CapabilityDefinition, CapabilityState, SemanticMapping};
pub use registry::{CapabilityAck, CapabilityFilter, CapabilityRegistry};
