//! Graph Store
//!
//! The store maps every [`Key`] to its [`NodeEntry`]. It is the only structure
//! mutated by several workers at once, so it is a sharded concurrent map: a
//! lookup or insertion only holds one shard lock for the duration of the map
//! operation and never while a node is being computed.
//!
//! Each entry sits behind its own mutex. Holding that mutex is how a worker
//! performs a state transition on a node; no code path holds two node mutexes
//! at the same time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};

use super::node::{NodeEntry, Version};
use crate::key::Key;

/// Shared handle to a node entry.
#[derive(Clone)]
pub struct NodeHandle(Arc<Mutex<NodeEntry>>);

impl NodeHandle {
    fn new(key: Key) -> Self {
        Self(Arc::new(Mutex::new(NodeEntry::new(key))))
    }

    /// Lock the entry for reading or for a state transition.
    pub fn lock(&self) -> MutexGuard<'_, NodeEntry> {
        self.0.lock()
    }

    /// Whether two handles refer to the same entry.
    pub fn ptr_eq(&self, other: &NodeHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Concurrent mapping from key to node entry, plus the global version
/// counter.
pub struct GraphStore {
    nodes: DashMap<Key, NodeHandle>,

    /// Graph-wide change counter. Only moves forward, except on
    /// [`GraphStore::clear`].
    version: AtomicU64,
}

impl GraphStore {
    /// Create an empty graph at version zero.
    pub fn new() -> Self {
        Self {
            nodes: DashMap::new(),
            version: AtomicU64::new(0),
        }
    }

    /// Get the entry for `key`, creating a `NotStarted` entry if absent.
    ///
    /// Racing callers for the same key all observe the single installed
    /// entry.
    pub fn get_or_create(&self, key: &Key) -> NodeHandle {
        if let Some(handle) = self.nodes.get(key) {
            return handle.value().clone();
        }
        self.nodes
            .entry(key.clone())
            .or_insert_with(|| NodeHandle::new(key.clone()))
            .value()
            .clone()
    }

    /// Get the entry for `key` if one exists.
    pub fn get(&self, key: &Key) -> Option<NodeHandle> {
        self.nodes.get(key).map(|handle| handle.value().clone())
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Snapshot of all keys currently in the graph.
    pub fn keys(&self) -> Vec<Key> {
        self.nodes.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Snapshot of all entries.
    pub(crate) fn handles(&self) -> Vec<NodeHandle> {
        self.nodes.iter().map(|entry| entry.value().clone()).collect()
    }

    /// The current value of the version counter.
    pub fn current_version(&self) -> Version {
        self.version.load(Ordering::Acquire)
    }

    /// Advance the version counter and return the new value.
    pub fn bump_version(&self) -> Version {
        self.version.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drop every entry and reset the version counter.
    pub fn clear(&self) {
        self.nodes.clear();
        self.version.store(0, Ordering::Release);
    }
}

impl Default for GraphStore {
    fn default() -> Self {
        Self::new()
    }
}
