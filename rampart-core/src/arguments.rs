//! Typed call arguments.
//!
//! A guarded call can carry values keyed by their type. The work, user
//! interceptors and the fallback handler all see the same arguments, which
//! is how a fallback gets hold of the original call's inputs.
//!
//! ```rust
//! use rampart_core::Arguments;
//!
//! #[derive(Debug, PartialEq)]
//! struct UserId(u64);
//!
//! let args = Arguments::new().with(UserId(7)).with("en-GB");
//!
//! assert_eq!(args.get::<UserId>(), Some(&UserId(7)));
//! assert_eq!(args.get::<&str>(), Some(&"en-GB"));
//! assert!(args.get::<String>().is_none());
//! ```

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

/// Values keyed by type, shared by every stage of one call.
#[derive(Clone, Default)]
pub struct Arguments {
    map: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl Arguments {
    #[inline]
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    /// Insert a value, replacing any previous value of the same type.
    #[inline]
    pub fn insert<T: Send + Sync + 'static>(&mut self, value: T) {
        self.map.insert(TypeId::of::<T>(), Arc::new(value));
    }

    /// Builder form of [`insert`](Self::insert).
    pub fn with<T: Send + Sync + 'static>(mut self, value: T) -> Self {
        self.insert(value);
        self
    }

    #[inline]
    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }

    /// Shared handle to a value, for moving into spawned work.
    pub fn get_arc<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|value| value.clone().downcast::<T>().ok())
    }

    #[inline]
    pub fn contains<T: Send + Sync + 'static>(&self) -> bool {
        self.map.contains_key(&TypeId::of::<T>())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl std::fmt::Debug for Arguments {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arguments")
            .field("count", &self.map.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_replaces_same_type() {
        let mut args = Arguments::new();
        args.insert(1u32);
        args.insert(2u32);

        assert_eq!(args.len(), 1);
        assert_eq!(args.get::<u32>(), Some(&2));
    }

    #[test]
    fn test_get_arc_shares_value() {
        let args = Arguments::new().with(String::from("payload"));

        let shared = args.get_arc::<String>().unwrap();
        assert_eq!(shared.as_str(), "payload");
        assert!(args.get_arc::<u8>().is_none());
        assert!(args.contains::<String>());
    }
}
