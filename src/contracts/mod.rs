//! # Contract Registries (SOA-API / MCP-Tool)
//!
//! Bind a logical endpoint or tool name to an opaque [`HandlerRef`] plus
//! invocation metadata. Bindings are created and removed together with their
//! parent capability.
//!
//! The registries never invoke handlers. Consumers look a binding up and call
//! the returned handler themselves, so the registry stays independent of any
//! RPC transport.

pub mod binding;
pub mod handler;
pub mod registry;

pub use binding::{Binding, HttpMethod, McpToolContract, McpToolRecord, SoaApiContract, SoaApiRecord};
pub use handler::HandlerRef;
pub use registry::{BindingFilter, BindingRegistry, McpToolRegistry, SoaApiRegistry};
