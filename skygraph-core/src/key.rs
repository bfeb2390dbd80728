//! Graph Keys
//!
//! A [`Key`] names one computation: a [`FunctionTag`] selecting the function
//! that produces the value, plus an argument of any hashable type. Keys are the
//! universal address in the graph, so they are immutable and cheap to clone.
//!
//! # Type Erasure
//!
//! The graph stores keys of many argument types side by side. The argument is
//! kept behind a `dyn Argument` trait object that knows how to compare itself,
//! and the full hash is computed once, while the concrete type is still known.

use std::any::Any;
use std::collections::hash_map::DefaultHasher;
use std::fmt::{self, Debug, Display};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Names the function that computes a family of keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FunctionTag(&'static str);

impl FunctionTag {
    /// Create a tag from a static name.
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    /// Get the tag's name.
    pub fn name(&self) -> &'static str {
        self.0
    }
}

impl Display for FunctionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// An argument value that can be stored inside a [`Key`].
///
/// Implemented for every `Debug + Eq + Hash + Send + Sync + 'static` type.
pub trait Argument: Any + Debug + Send + Sync {
    /// Compare with another argument of possibly different type.
    fn dyn_eq(&self, other: &dyn Argument) -> bool;

    /// View as `Any` for downcasting.
    fn as_any(&self) -> &dyn Any;
}

impl<T> Argument for T
where
    T: Debug + Eq + Hash + Send + Sync + 'static,
{
    fn dyn_eq(&self, other: &dyn Argument) -> bool {
        other
            .as_any()
            .downcast_ref::<T>()
            .is_some_and(|other| self == other)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct KeyInner {
    tag: FunctionTag,
    argument: Box<dyn Argument>,
    hash: u64,
}

/// Immutable identifier of a computation.
///
/// Two keys are equal when their tags are equal and their arguments have the
/// same type and compare equal.
///
/// # Example
///
/// ```rust
/// use skygraph_core::{FunctionTag, Key};
///
/// const SQUARE: FunctionTag = FunctionTag::new("square");
///
/// let key = Key::new(SQUARE, 3_i64);
/// assert_eq!(key.argument::<i64>(), Some(&3));
/// assert_eq!(key, Key::new(SQUARE, 3_i64));
/// assert_ne!(key, Key::new(SQUARE, 3_u8));
/// ```
#[derive(Clone)]
pub struct Key(Arc<KeyInner>);

impl Key {
    /// Create a key for `tag` applied to `argument`.
    pub fn new<A>(tag: FunctionTag, argument: A) -> Self
    where
        A: Debug + Eq + Hash + Send + Sync + 'static,
    {
        let mut hasher = DefaultHasher::new();
        tag.hash(&mut hasher);
        std::any::TypeId::of::<A>().hash(&mut hasher);
        argument.hash(&mut hasher);

        Self(Arc::new(KeyInner {
            tag,
            argument: Box::new(argument),
            hash: hasher.finish(),
        }))
    }

    /// The function tag of this key.
    pub fn tag(&self) -> FunctionTag {
        self.0.tag
    }

    /// The argument, if it has type `A`.
    pub fn argument<A: 'static>(&self) -> Option<&A> {
        self.0.argument.as_any().downcast_ref::<A>()
    }

    /// The type-erased argument.
    pub fn raw_argument(&self) -> &dyn Argument {
        &*self.0.argument
    }

    /// Whether two handles point at the same allocation.
    pub fn ptr_eq(&self, other: &Key) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        if self.ptr_eq(other) {
            return true;
        }
        self.0.hash == other.0.hash
            && self.0.tag == other.0.tag
            && self.0.argument.dyn_eq(&*other.0.argument)
    }
}

impl Eq for Key {}

impl Hash for Key {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.0.hash);
    }
}

impl Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:?})", self.0.tag, self.0.argument)
    }
}

impl Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(self, f)
    }
}
