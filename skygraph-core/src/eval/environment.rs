//! Environment
//!
//! The environment is the only way a running function reaches the graph. Every
//! key it hands out is recorded as a dependency of the running node, which is
//! how edges are discovered while the computation executes.
//!
//! # Restarts
//!
//! Lookups never block. A dependency that is not finished yet comes back as
//! `None` and is remembered as missing; the function is expected to bail out
//! (usually with [`FunctionError::MissingDeps`]). The evaluator then parks the
//! node on the missing keys and runs the function again, from the top, once
//! they are all done. Dependencies found finished in earlier attempts are
//! replayed from a memo, so every attempt of one pass sees the same values.
//!
//! # Groups
//!
//! Each `get_values` style call is one dependency group. Groups are recorded
//! in order, and re-verification of a dirty node checks them in the same
//! order.

use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;

use super::interrupt::InterruptHandle;
use crate::error::{ErrorInfo, FunctionError};
use crate::graph::{DepGroup, GraphStore, Outcome, Version};
use crate::key::Key;
use crate::value::Value;

/// Handle a running node function uses to read other keys.
pub struct Environment<'a> {
    key: &'a Key,
    graph: &'a GraphStore,
    version: Version,
    interrupt: &'a InterruptHandle,

    /// Finished dependency outcomes, carried across attempts.
    memo: HashMap<Key, Outcome>,
    /// Everything requested by this attempt.
    requested: HashSet<Key>,
    groups: Vec<DepGroup>,
    missing: Vec<Key>,
    /// Dependency errors the function did not declare it can handle.
    failed: Vec<ErrorInfo>,
}

/// What one attempt left behind, handed back to the evaluator.
#[derive(Debug, Default)]
pub(crate) struct Attempt {
    pub groups: Vec<DepGroup>,
    pub missing: Vec<Key>,
    pub failed: Vec<ErrorInfo>,
    pub memo: HashMap<Key, Outcome>,
}

impl<'a> Environment<'a> {
    pub(crate) fn new(
        key: &'a Key,
        graph: &'a GraphStore,
        version: Version,
        interrupt: &'a InterruptHandle,
        memo: HashMap<Key, Outcome>,
    ) -> Self {
        Self {
            key,
            graph,
            version,
            interrupt,
            memo,
            requested: HashSet::new(),
            groups: Vec::new(),
            missing: Vec::new(),
            failed: Vec::new(),
        }
    }

    /// The key being computed.
    pub fn key(&self) -> &Key {
        self.key
    }

    /// Version of the running pass.
    pub fn version(&self) -> Version {
        self.version
    }

    /// Whether the evaluation was interrupted. Long-running functions may
    /// poll this and give up early; the result is discarded either way.
    pub fn is_cancelled(&self) -> bool {
        self.interrupt.is_interrupted()
    }

    /// Whether any dependency requested so far is unavailable, either because
    /// it is not finished or because it failed and was not requested
    /// tolerantly.
    pub fn values_missing(&self) -> bool {
        !self.missing.is_empty() || !self.failed.is_empty()
    }

    /// Read one dependency. `None` if it is not available.
    pub fn get_value(&mut self, key: &Key) -> Option<Value> {
        self.get_values(std::slice::from_ref(key))
            .into_values()
            .next()
            .flatten()
    }

    /// Read a group of dependencies at once.
    ///
    /// All keys in the group are scheduled together when some are missing, so
    /// a function should ask for everything it knows it needs in one call.
    pub fn get_values<'k, I>(&mut self, keys: I) -> IndexMap<Key, Option<Value>>
    where
        I: IntoIterator<Item = &'k Key>,
    {
        self.request(keys, false)
            .into_iter()
            .map(|(key, outcome)| (key, outcome.and_then(Result::ok)))
            .collect()
    }

    /// Read one dependency, receiving its error instead of failing.
    ///
    /// `None` still means the dependency is not finished.
    pub fn get_value_or_error(&mut self, key: &Key) -> Option<Result<Value, ErrorInfo>> {
        self.get_values_or_errors(std::slice::from_ref(key))
            .into_values()
            .next()
            .flatten()
    }

    /// Error-tolerant version of [`Environment::get_values`].
    pub fn get_values_or_errors<'k, I>(&mut self, keys: I) -> IndexMap<Key, Option<Outcome>>
    where
        I: IntoIterator<Item = &'k Key>,
    {
        self.request(keys, true)
    }

    /// Read one dependency or bail out with [`FunctionError::MissingDeps`].
    pub fn require(&mut self, key: &Key) -> Result<Value, FunctionError> {
        self.get_value(key).ok_or(FunctionError::MissingDeps)
    }

    /// Read a group of dependencies, in order, or bail out with
    /// [`FunctionError::MissingDeps`] if any is unavailable.
    pub fn require_all<'k, I>(&mut self, keys: I) -> Result<Vec<Value>, FunctionError>
    where
        I: IntoIterator<Item = &'k Key>,
    {
        self.get_values(keys)
            .into_values()
            .collect::<Option<Vec<_>>>()
            .ok_or(FunctionError::MissingDeps)
    }

    fn request<'k, I>(&mut self, keys: I, tolerant: bool) -> IndexMap<Key, Option<Outcome>>
    where
        I: IntoIterator<Item = &'k Key>,
    {
        let mut group = DepGroup::new();
        let mut results = IndexMap::new();

        for key in keys {
            let first_request = self.requested.insert(key.clone());
            if first_request {
                group.push(key.clone());
            }
            let outcome = self.lookup(key);
            match &outcome {
                None if first_request => self.missing.push(key.clone()),
                // A key read tolerantly first and strictly later still fails.
                Some(Err(error)) if !tolerant => self.failed.push(error.clone()),
                _ => {}
            }
            results.insert(key.clone(), outcome);
        }

        if !group.is_empty() {
            self.groups.push(group);
        }
        results
    }

    fn lookup(&mut self, key: &Key) -> Option<Outcome> {
        if let Some(outcome) = self.memo.get(key) {
            return Some(outcome.clone());
        }
        let outcome = self.graph.get_or_create(key).lock().outcome()?;
        self.memo.insert(key.clone(), outcome.clone());
        Some(outcome)
    }

    pub(crate) fn finish(self) -> Attempt {
        Attempt {
            groups: self.groups,
            missing: self.missing,
            failed: self.failed,
            memo: self.memo,
        }
    }
}
