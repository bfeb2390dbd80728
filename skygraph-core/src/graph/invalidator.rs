//! Invalidation
//!
//! The invalidator runs between evaluation passes. It does not decide what to
//! rebuild; it only records *where the next pass has to look*:
//!
//! 1. Every key reported as changed is marked [`DirtyState::Changed`]; its
//!    function will run again.
//! 2. Every node in the transitive reverse-dependency closure of those keys is
//!    marked [`DirtyState::MaybeDirty`]; the next pass re-verifies its
//!    recorded dependencies and reuses the cached value if none of them
//!    changed.
//!
//! Propagation stops at nodes that were already dirty, since their reverse
//! dependencies were visited when they were first dirtied.

use std::collections::{HashSet, VecDeque};

use tracing::{debug, trace};

use super::node::{DepGroup, DirtyState};
use super::store::GraphStore;
use crate::eval::EvaluationListener;
use crate::key::Key;
use crate::value::Value;

/// Counts of what an invalidation touched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InvalidationSummary {
    /// Changed keys that had a node in the graph.
    pub changed: usize,
    /// Reverse dependencies newly marked maybe-dirty.
    pub dirtied: usize,
}

/// Marks nodes dirty after external changes.
pub struct Invalidator<'a> {
    graph: &'a GraphStore,
    listener: Option<&'a dyn EvaluationListener>,
}

impl<'a> Invalidator<'a> {
    pub fn new(graph: &'a GraphStore) -> Self {
        Self { graph, listener: None }
    }

    /// Report every dirtied node to `listener`.
    pub fn with_listener(mut self, listener: &'a dyn EvaluationListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Mark `changed` keys dirty and their reverse closure maybe-dirty.
    ///
    /// Keys without a node are ignored; an empty set is a no-op.
    pub fn invalidate<I>(&self, changed: I) -> InvalidationSummary
    where
        I: IntoIterator<Item = Key>,
    {
        let mut summary = InvalidationSummary::default();
        let mut queue = VecDeque::new();

        for key in changed {
            let Some(handle) = self.graph.get(&key) else {
                trace!(%key, "ignoring invalidation of unknown key");
                continue;
            };
            let mut node = handle.lock();
            let first_time = node.mark_dirty(DirtyState::Changed);
            if node.is_dirty() {
                summary.changed += 1;
                self.notify(&key, DirtyState::Changed);
            }
            if first_time {
                queue.extend(node.reverse_deps().iter().cloned());
            }
        }

        summary.dirtied = self.propagate(queue);
        debug!(
            changed = summary.changed,
            dirtied = summary.dirtied,
            "invalidation finished"
        );
        summary
    }

    /// Replace the values of keys that have no function of their own.
    ///
    /// Keys whose value actually changed get a fresh version and their
    /// reverse closure is marked maybe-dirty. A key that was computed before
    /// loses its dependencies, and with them its reverse edges.
    pub fn inject<I>(&self, values: I) -> InvalidationSummary
    where
        I: IntoIterator<Item = (Key, Value)>,
    {
        let mut summary = InvalidationSummary::default();
        let mut queue = VecDeque::new();
        let mut injected_at = None;

        for (key, value) in values {
            let handle = self.graph.get_or_create(&key);
            let version = *injected_at.get_or_insert_with(|| self.graph.bump_version());
            let injected = {
                let mut node = handle.lock();
                let injected = node.inject(value, version);
                if injected.changed {
                    summary.changed += 1;
                    trace!(%key, version, "injected value");
                    queue.extend(node.reverse_deps().iter().cloned());
                }
                injected
            };
            self.unlink(&key, &injected.old_deps);
        }

        summary.dirtied = self.propagate(queue);
        debug!(
            changed = summary.changed,
            dirtied = summary.dirtied,
            "injection finished"
        );
        summary
    }

    /// Drop `key` from the reverse edges of its former dependencies.
    fn unlink(&self, key: &Key, old_deps: &[DepGroup]) {
        let deps: HashSet<&Key> = old_deps.iter().flatten().collect();
        for dep in deps {
            if let Some(handle) = self.graph.get(dep) {
                handle.lock().remove_reverse_dep(key);
            }
        }
    }

    /// Breadth-first maybe-dirty propagation along reverse edges.
    fn propagate(&self, mut queue: VecDeque<Key>) -> usize {
        let mut dirtied = 0;
        while let Some(key) = queue.pop_front() {
            let Some(handle) = self.graph.get(&key) else {
                continue;
            };
            let mut node = handle.lock();
            if node.mark_dirty(DirtyState::MaybeDirty) {
                dirtied += 1;
                self.notify(&key, DirtyState::MaybeDirty);
                queue.extend(node.reverse_deps().iter().cloned());
            }
        }
        dirtied
    }

    fn notify(&self, key: &Key, dirty: DirtyState) {
        if let Some(listener) = self.listener {
            listener.invalidated(key, dirty);
        }
    }
}
