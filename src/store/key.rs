//! Composite record keys.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A `(scope, name)` key, e.g. `(owning_service, capability_name)` or
/// `(service_name, instance_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScopedKey {
    pub scope: String,
    pub name: String,
}

impl ScopedKey {
    pub fn new(scope: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ScopedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.scope, self.name)
    }
}
