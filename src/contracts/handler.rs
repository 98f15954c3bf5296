//! Opaque handler references.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// An opaque, shareable reference to whatever the owning service uses to
/// serve a binding (a closure, a trait object, a channel sender...).
///
/// The registry stores and returns it; it never calls it.
#[derive(Clone)]
pub struct HandlerRef(Arc<dyn Any + Send + Sync>);

impl HandlerRef {
    pub fn new<T: Any + Send + Sync>(handler: T) -> Self {
        Self(Arc::new(handler))
    }

    /// Recover the concrete handler type.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    /// Whether two references point at the same handler.
    pub fn same_handler(&self, other: &HandlerRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for HandlerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HandlerRef(..)")
    }
}

impl PartialEq for HandlerRef {
    fn eq(&self, other: &Self) -> bool {
        self.same_handler(other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downcast_and_identity() {
        let handler = HandlerRef::new(|input: &str| input.len());
        let clone = handler.clone();
        assert!(handler.same_handler(&clone));
        assert!(!handler.same_handler(&HandlerRef::new(42u8)));

        let number = HandlerRef::new(7u32);
        assert_eq!(number.downcast_ref::<u32>(), Some(&7));
        assert!(number.downcast_ref::<String>().is_none());
    }
}
