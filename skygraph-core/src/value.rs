//! Computed values.
//!
//! A [`Value`] is the immutable result of one computation. Values are shared
//! between the graph and every dependent that reads them, so they live behind
//! an `Arc`. Equality compares payloads, which is what change pruning relies
//! on: a rebuilt node whose new value equals the old one does not count as
//! changed.

use std::any::Any;
use std::fmt::{self, Debug};
use std::sync::Arc;

/// Payload stored in a [`Value`].
///
/// Implemented for every `Debug + PartialEq + Send + Sync + 'static` type.
pub trait ValueData: Any + Debug + Send + Sync {
    /// Compare with another payload of possibly different type.
    fn dyn_eq(&self, other: &dyn ValueData) -> bool;

    /// View as `Any` for downcasting.
    fn as_any(&self) -> &dyn Any;
}

impl<T> ValueData for T
where
    T: Debug + PartialEq + Send + Sync + 'static,
{
    fn dyn_eq(&self, other: &dyn ValueData) -> bool {
        other
            .as_any()
            .downcast_ref::<T>()
            .is_some_and(|other| self == other)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Immutable result of a computation.
#[derive(Clone)]
pub struct Value(Arc<dyn ValueData>);

impl Value {
    /// Wrap a payload.
    pub fn new<T>(data: T) -> Self
    where
        T: Debug + PartialEq + Send + Sync + 'static,
    {
        Self(Arc::new(data))
    }

    /// Borrow the payload if it has type `T`.
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.0.as_any().downcast_ref::<T>()
    }

    /// Clone the payload out if it has type `T`.
    pub fn get<T: Clone + 'static>(&self) -> Option<T> {
        self.downcast_ref::<T>().cloned()
    }

    /// Whether two handles share one allocation.
    pub fn ptr_eq(&self, other: &Value) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other) || self.0.dyn_eq(&*other.0)
    }
}

impl Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(&*self.0, f)
    }
}
