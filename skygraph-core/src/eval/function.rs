//! Function Registry
//!
//! A node function turns a [`Key`] into a [`Value`], reading whatever other
//! keys it needs through the [`Environment`]. Functions may be invoked several
//! times for the same key within one pass (every time a dependency turns out
//! not to be ready), so they must be deterministic in the values they read
//! and free of side effects visible to other computations.

use std::collections::HashMap;
use std::sync::Arc;

use super::environment::Environment;
use crate::error::{FunctionError, RegistryError};
use crate::key::{FunctionTag, Key};
use crate::value::Value;

/// Computation logic for one function tag.
pub trait NodeFunction: Send + Sync {
    /// Compute the value of `key`.
    ///
    /// Return [`FunctionError::MissingDeps`] (or any result at all) once the
    /// environment reports missing values; the function will be run again
    /// from the start when they are available.
    fn compute(&self, key: &Key, env: &mut Environment<'_>) -> Result<Value, FunctionError>;
}

impl<F> NodeFunction for F
where
    F: Fn(&Key, &mut Environment<'_>) -> Result<Value, FunctionError> + Send + Sync,
{
    fn compute(&self, key: &Key, env: &mut Environment<'_>) -> Result<Value, FunctionError> {
        self(key, env)
    }
}

/// Maps function tags to their implementations.
#[derive(Default, Clone)]
pub struct FunctionRegistry {
    functions: HashMap<FunctionTag, Arc<dyn NodeFunction>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `function` for `tag`.
    pub fn register<F>(&mut self, tag: FunctionTag, function: F) -> Result<&mut Self, RegistryError>
    where
        F: NodeFunction + 'static,
    {
        if self.functions.contains_key(&tag) {
            return Err(RegistryError::DuplicateFunction(tag));
        }
        self.functions.insert(tag, Arc::new(function));
        Ok(self)
    }

    /// Register a closure for `tag`.
    ///
    /// Same as [`FunctionRegistry::register`], but spells out the closure
    /// signature so argument types can be inferred at the call site.
    pub fn register_fn<F>(
        &mut self,
        tag: FunctionTag,
        function: F,
    ) -> Result<&mut Self, RegistryError>
    where
        F: Fn(&Key, &mut Environment<'_>) -> Result<Value, FunctionError> + Send + Sync + 'static,
    {
        self.register(tag, function)
    }

    /// The function registered for `tag`.
    pub fn get(&self, tag: FunctionTag) -> Option<Arc<dyn NodeFunction>> {
        self.functions.get(&tag).cloned()
    }

    pub fn contains(&self, tag: FunctionTag) -> bool {
        self.functions.contains_key(&tag)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}
