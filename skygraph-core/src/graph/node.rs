//! Node Entries
//!
//! This module defines the per-key record stored in the graph and its state
//! machine. Everything here is plain data: locking lives in the store and the
//! scheduling protocol lives in the evaluator, which drives entries through the
//! transitions below while holding the entry's mutex.
//!
//! # States
//!
//! ```text
//! NotStarted ──► Evaluating ──► Done | Error
//!                   ▲  │ (restart: deps missing)
//!                   └──┘
//! Done|Error + dirty ──► CheckingDeps ──► Done (reused)
//!                              └────────► Evaluating (rebuild)
//! ```
//!
//! Dirtiness is orthogonal to the state: a `Done` node that was invalidated
//! keeps its value and dependency edges until the next pass decides whether
//! they can be reused.

use std::collections::HashMap;

use indexmap::IndexSet;
use serde::Serialize;
use smallvec::SmallVec;

use crate::error::ErrorInfo;
use crate::key::Key;
use crate::value::Value;

/// Graph-wide change counter value.
pub type Version = u64;

/// Keys requested together by a single `get_values` call.
pub type DepGroup = SmallVec<[Key; 4]>;

/// Finished result of a node as seen by its dependents.
pub type Outcome = Result<Value, ErrorInfo>;

/// Evaluation status of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NodeState {
    /// Created but never evaluated.
    NotStarted,
    /// Dirty node whose recorded dependencies are being re-verified.
    CheckingDeps,
    /// The node's function is running or waiting to be restarted.
    Evaluating,
    /// A value is committed.
    Done,
    /// An error is committed.
    Error,
}

/// Dirty state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DirtyState {
    /// The node's result is up-to-date.
    Clean,

    /// A transitive dependency was invalidated. The recorded dependencies
    /// must be re-verified before the cached result can be reused.
    MaybeDirty,

    /// The key itself was reported changed. Its function must run again.
    Changed,
}

/// Where an in-flight node sits in the scheduling protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    /// In the ready queue, not yet picked up by a worker.
    Queued,
    /// Claimed by a worker.
    Running,
    /// Waiting for `pending` dependencies to finish.
    Parked,
}

/// Per-pass bookkeeping of a node that has been scheduled.
///
/// Dropped when the node commits or when the pass ends.
#[derive(Debug)]
pub(crate) struct InFlight {
    phase: Phase,
    /// Registrations outstanding while parked, plus one token held by the
    /// parking worker until registration completes.
    pending: usize,
    /// Dependencies this node is parked on.
    awaiting: Vec<Key>,
    /// Dependents parked on this node.
    waiters: Vec<Key>,
    /// Number of recorded dependency groups already verified unchanged.
    checked_groups: usize,
    /// Dependency outcomes observed by earlier attempts of this pass.
    memo: HashMap<Key, Outcome>,
}

impl InFlight {
    fn queued() -> Self {
        Self {
            phase: Phase::Queued,
            pending: 0,
            awaiting: Vec::new(),
            waiters: Vec::new(),
            checked_groups: 0,
            memo: HashMap::new(),
        }
    }
}

/// What the worker that claimed a node has to do with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Task {
    /// Run the node's function.
    Evaluate,
    /// Re-verify the recorded dependencies, starting at this group.
    CheckDeps { group: usize },
    /// An injected value was invalidated; keep it.
    KeepInjected,
}

/// Answer to a dependent asking to wait on this node.
#[derive(Debug)]
pub(crate) enum Wait {
    /// The node is finished at `version`; nothing to wait for.
    Finished { version: Version },
    /// The waiter was registered. `newly_queued` is set when this call moved
    /// an idle node into the ready queue.
    Registered { newly_queued: bool },
}

/// Everything a commit hands back to the evaluator.
#[derive(Debug, Default)]
pub(crate) struct Committed {
    /// Dependents to signal.
    pub waiters: Vec<Key>,
    /// Dependencies of the previous result, for reverse-edge maintenance.
    pub old_deps: Vec<DepGroup>,
    /// Whether the committed result differs from the previous one.
    pub changed: bool,
}

/// A node in the evaluation graph.
#[derive(Debug)]
pub struct NodeEntry {
    /// The key this entry belongs to.
    key: Key,

    state: NodeState,
    dirty: DirtyState,

    /// Last committed value. Kept while dirty so a rebuild can be compared
    /// against it.
    value: Option<Value>,
    error: Option<ErrorInfo>,

    /// Dependencies read by the last completed evaluation, grouped by
    /// request.
    direct_deps: Vec<DepGroup>,

    /// Keys whose committed dependencies include this node.
    reverse_deps: IndexSet<Key>,

    /// Version at which the committed result last changed.
    version: Version,

    /// Version at which the committed result was last computed or verified.
    verified_version: Version,

    /// Number of function invocations for this key.
    generation: u32,

    /// Set for nodes whose value was injected rather than computed.
    injected: bool,

    in_flight: Option<InFlight>,
}

impl NodeEntry {
    /// Create a fresh, never evaluated entry.
    pub fn new(key: Key) -> Self {
        Self {
            key,
            state: NodeState::NotStarted,
            dirty: DirtyState::Clean,
            value: None,
            error: None,
            direct_deps: Vec::new(),
            reverse_deps: IndexSet::new(),
            version: 0,
            verified_version: 0,
            generation: 0,
            injected: false,
            in_flight: None,
        }
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn dirty_state(&self) -> DirtyState {
        self.dirty
    }

    /// Whether the node is marked dirty.
    pub fn is_dirty(&self) -> bool {
        self.dirty != DirtyState::Clean
    }

    /// Whether the node holds an up-to-date committed result.
    pub fn is_finished(&self) -> bool {
        matches!(self.state, NodeState::Done | NodeState::Error) && !self.is_dirty()
    }

    /// The committed value; present iff the node is `Done`.
    pub fn value(&self) -> Option<&Value> {
        match self.state {
            NodeState::Done => self.value.as_ref(),
            _ => None,
        }
    }

    /// The committed error; present iff the node is `Error`.
    pub fn error(&self) -> Option<&ErrorInfo> {
        match self.state {
            NodeState::Error => self.error.as_ref(),
            _ => None,
        }
    }

    /// The result dependents may read, if the node is finished.
    pub fn outcome(&self) -> Option<Outcome> {
        if !self.is_finished() {
            return None;
        }
        match (&self.value, &self.error) {
            (_, Some(error)) => Some(Err(error.clone())),
            (Some(value), None) => Some(Ok(value.clone())),
            (None, None) => None,
        }
    }

    pub fn direct_deps(&self) -> &[DepGroup] {
        &self.direct_deps
    }

    pub fn reverse_deps(&self) -> &IndexSet<Key> {
        &self.reverse_deps
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn verified_version(&self) -> Version {
        self.verified_version
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn is_injected(&self) -> bool {
        self.injected
    }

    /// Whether the node is part of the current pass.
    pub(crate) fn is_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    // ------------------------------------------------------------------
    // Invalidation
    // ------------------------------------------------------------------

    /// Mark the node dirty with at least `dirty` strength.
    ///
    /// Returns `true` when the node was clean before, meaning its reverse
    /// dependencies have not been visited yet. Nodes that never produced a
    /// result have nothing to invalidate.
    pub fn mark_dirty(&mut self, dirty: DirtyState) -> bool {
        if !matches!(self.state, NodeState::Done | NodeState::Error) {
            return false;
        }
        let was_clean = self.dirty == DirtyState::Clean;
        match (self.dirty, dirty) {
            (_, DirtyState::Clean) => {}
            (DirtyState::Changed, _) => {}
            (_, DirtyState::Changed) => self.dirty = DirtyState::Changed,
            (_, DirtyState::MaybeDirty) => self.dirty = DirtyState::MaybeDirty,
        }
        was_clean && dirty != DirtyState::Clean
    }

    pub(crate) fn add_reverse_dep(&mut self, key: Key) {
        self.reverse_deps.insert(key);
    }

    pub(crate) fn remove_reverse_dep(&mut self, key: &Key) {
        self.reverse_deps.shift_remove(key);
    }

    /// Replace the node's result with an injected value.
    ///
    /// An injected node has no dependencies; whatever it read before is
    /// handed back in `old_deps` so the caller can drop the reverse edges.
    /// `changed` is `false` if the node already held an equal value, in which
    /// case its version is kept.
    pub(crate) fn inject(&mut self, value: Value, version: Version) -> Committed {
        let old_deps = std::mem::take(&mut self.direct_deps);
        let changed = !(self.state == NodeState::Done && self.value.as_ref() == Some(&value));
        self.state = NodeState::Done;
        self.dirty = DirtyState::Clean;
        self.error = None;
        self.injected = true;
        if changed {
            self.value = Some(value);
            self.version = version;
            self.verified_version = version;
        }
        Committed {
            waiters: Vec::new(),
            old_deps,
            changed,
        }
    }

    // ------------------------------------------------------------------
    // Scheduling
    // ------------------------------------------------------------------

    /// Put an idle node that needs work into the ready queue.
    ///
    /// Returns `true` if the caller must dispatch the node.
    pub(crate) fn schedule(&mut self) -> bool {
        if self.is_finished() || self.in_flight.is_some() {
            return false;
        }
        self.in_flight = Some(InFlight::queued());
        true
    }

    /// Register `waiter` to be signalled when this node finishes.
    pub(crate) fn add_waiter(&mut self, waiter: &Key) -> Wait {
        if self.is_finished() {
            return Wait::Finished { version: self.version };
        }
        let newly_queued = self.schedule();
        if let Some(in_flight) = self.in_flight.as_mut() {
            if !in_flight.waiters.contains(waiter) {
                in_flight.waiters.push(waiter.clone());
            }
        }
        Wait::Registered { newly_queued }
    }

    /// Take the exclusive claim on a queued node.
    ///
    /// Returns `None` when the node is not queued, which would mean a second
    /// worker tried to run the same key.
    pub(crate) fn claim(&mut self) -> Option<Task> {
        let in_flight = self.in_flight.as_mut()?;
        if in_flight.phase != Phase::Queued {
            return None;
        }
        in_flight.phase = Phase::Running;

        let task = match (self.state, self.dirty) {
            (NodeState::NotStarted | NodeState::Evaluating, _) => Task::Evaluate,
            (NodeState::CheckingDeps, _) => Task::CheckDeps { group: in_flight.checked_groups },
            (NodeState::Done, DirtyState::MaybeDirty | DirtyState::Changed) if self.injected => {
                Task::KeepInjected
            }
            (NodeState::Done, DirtyState::MaybeDirty) => {
                self.state = NodeState::CheckingDeps;
                Task::CheckDeps { group: 0 }
            }
            (NodeState::Error, _) | (NodeState::Done, _) => Task::Evaluate,
        };
        if task == Task::Evaluate {
            self.state = NodeState::Evaluating;
        }
        Some(task)
    }

    /// Start a new function attempt; returns the generation number.
    pub(crate) fn begin_attempt(&mut self) -> u32 {
        self.state = NodeState::Evaluating;
        self.generation += 1;
        self.generation
    }

    /// Record that recorded dependency group `group` was verified unchanged.
    pub(crate) fn group_verified(&mut self, group: usize) {
        if let Some(in_flight) = self.in_flight.as_mut() {
            in_flight.checked_groups = group + 1;
        }
    }

    /// Move the satisfied-dependency memo out for a new attempt.
    pub(crate) fn take_memo(&mut self) -> HashMap<Key, Outcome> {
        self.in_flight
            .as_mut()
            .map(|in_flight| std::mem::take(&mut in_flight.memo))
            .unwrap_or_default()
    }

    /// Park the claimed node on `awaiting`.
    ///
    /// The pending count includes one registration token the caller must
    /// release with [`NodeEntry::release_token`] once every dependency has
    /// been registered.
    pub(crate) fn park(&mut self, awaiting: Vec<Key>, memo: HashMap<Key, Outcome>) {
        if let Some(in_flight) = self.in_flight.as_mut() {
            debug_assert_eq!(in_flight.phase, Phase::Running);
            in_flight.phase = Phase::Parked;
            in_flight.pending = awaiting.len() + 1;
            in_flight.awaiting = awaiting;
            in_flight.memo = memo;
        }
    }

    /// Release the registration token taken by [`NodeEntry::park`].
    ///
    /// Returns `true` if the node became ready and must be dispatched.
    pub(crate) fn release_token(&mut self) -> bool {
        self.dependency_finished()
    }

    /// A dependency this node is parked on finished.
    ///
    /// Returns `true` if the node became ready and must be dispatched.
    pub(crate) fn dependency_finished(&mut self) -> bool {
        let Some(in_flight) = self.in_flight.as_mut() else {
            return false;
        };
        if in_flight.phase != Phase::Parked || in_flight.pending == 0 {
            return false;
        }
        in_flight.pending -= 1;
        if in_flight.pending > 0 {
            return false;
        }
        in_flight.phase = Phase::Queued;
        true
    }

    /// Dependencies the node was last parked on.
    ///
    /// Kept after the node wakes up, until it parks again or commits, so a
    /// halted pass can still tell which dependents were waiting on what.
    pub(crate) fn awaiting(&self) -> &[Key] {
        match &self.in_flight {
            Some(in_flight) => &in_flight.awaiting,
            None => &[],
        }
    }

    /// Every dependency the current attempt asked for: those already
    /// satisfied, then those it is parked on.
    pub(crate) fn requested_deps(&self) -> DepGroup {
        let Some(in_flight) = &self.in_flight else {
            return DepGroup::new();
        };
        in_flight
            .memo
            .keys()
            .filter(|key| !in_flight.awaiting.contains(key))
            .chain(in_flight.awaiting.iter())
            .cloned()
            .collect()
    }

    // ------------------------------------------------------------------
    // Commits
    // ------------------------------------------------------------------

    /// Commit a computed value.
    ///
    /// The version only moves forward when the value differs from the one
    /// previously committed, which is what lets dependents skip rebuilding.
    pub(crate) fn commit_value(
        &mut self,
        value: Value,
        deps: Vec<DepGroup>,
        version: Version,
    ) -> Committed {
        let changed = !(self.value.as_ref() == Some(&value) && self.error.is_none());
        if changed {
            self.version = version;
        }
        self.state = NodeState::Done;
        self.value = Some(value);
        self.error = None;
        self.injected = false;
        self.finish(deps, version, changed)
    }

    /// Commit an error. Errors always count as a change.
    pub(crate) fn commit_error(
        &mut self,
        error: ErrorInfo,
        deps: Vec<DepGroup>,
        version: Version,
    ) -> Committed {
        self.state = NodeState::Error;
        self.value = None;
        self.error = Some(error);
        self.version = version;
        self.injected = false;
        self.finish(deps, version, true)
    }

    /// Every recorded dependency was verified unchanged; reuse the result.
    pub(crate) fn commit_verified(&mut self, version: Version) -> Committed {
        self.state = if self.error.is_some() { NodeState::Error } else { NodeState::Done };
        self.dirty = DirtyState::Clean;
        self.verified_version = version;
        Committed {
            waiters: self.in_flight.take().map(|f| f.waiters).unwrap_or_default(),
            old_deps: Vec::new(),
            changed: false,
        }
    }

    fn finish(&mut self, deps: Vec<DepGroup>, version: Version, changed: bool) -> Committed {
        self.dirty = DirtyState::Clean;
        self.verified_version = version;
        let old_deps = std::mem::replace(&mut self.direct_deps, deps);
        Committed {
            waiters: self.in_flight.take().map(|f| f.waiters).unwrap_or_default(),
            old_deps,
            changed,
        }
    }

    /// Abandon in-flight work at the end of a pass.
    ///
    /// A node with a previous result falls back to it and stays dirty, so
    /// the next pass looks at it again; a node that never finished forgets
    /// the attempt entirely.
    pub(crate) fn rollback(&mut self) {
        if self.in_flight.take().is_none() {
            return;
        }
        self.state = if self.error.is_some() {
            NodeState::Error
        } else if self.value.is_some() {
            NodeState::Done
        } else {
            NodeState::NotStarted
        };
        if self.state == NodeState::NotStarted {
            self.dirty = DirtyState::Clean;
            self.direct_deps.clear();
        } else if self.dirty == DirtyState::Clean {
            self.dirty = DirtyState::MaybeDirty;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::FunctionTag;
    use smallvec::smallvec;

    const NUM: FunctionTag = FunctionTag::new("num");

    fn key(n: i64) -> Key {
        Key::new(NUM, n)
    }

    fn done(n: i64, value: i64, version: Version) -> NodeEntry {
        let mut node = NodeEntry::new(key(n));
        assert!(node.schedule());
        assert_eq!(node.claim(), Some(Task::Evaluate));
        node.begin_attempt();
        node.commit_value(Value::new(value), vec![smallvec![key(n + 1)]], version);
        node
    }

    #[test]
    fn new_node_is_not_started() {
        let node = NodeEntry::new(key(1));
        assert_eq!(node.state(), NodeState::NotStarted);
        assert!(!node.is_finished());
        assert!(node.value().is_none());
        assert!(node.outcome().is_none());
    }

    #[test]
    fn claim_is_exclusive() {
        let mut node = NodeEntry::new(key(1));
        assert!(node.schedule());
        assert!(!node.schedule());
        assert_eq!(node.claim(), Some(Task::Evaluate));
        assert_eq!(node.claim(), None);
        assert_eq!(node.state(), NodeState::Evaluating);
    }

    #[test]
    fn commit_records_value_and_deps() {
        let node = done(1, 10, 3);
        assert_eq!(node.state(), NodeState::Done);
        assert_eq!(node.value(), Some(&Value::new(10_i64)));
        assert_eq!(node.direct_deps().len(), 1);
        assert_eq!(node.version(), 3);
        assert_eq!(node.verified_version(), 3);
        assert_eq!(node.generation(), 1);
        assert!(!node.is_in_flight());
    }

    #[test]
    fn equal_rebuild_keeps_version() {
        let mut node = done(1, 10, 1);
        assert!(node.mark_dirty(DirtyState::Changed));
        assert!(node.schedule());
        assert_eq!(node.claim(), Some(Task::Evaluate));
        node.begin_attempt();
        let committed = node.commit_value(Value::new(10_i64), Vec::new(), 2);
        assert!(!committed.changed);
        assert_eq!(node.version(), 1);
        assert_eq!(node.verified_version(), 2);

        node.mark_dirty(DirtyState::Changed);
        node.schedule();
        node.claim();
        node.begin_attempt();
        let committed = node.commit_value(Value::new(11_i64), Vec::new(), 3);
        assert!(committed.changed);
        assert_eq!(node.version(), 3);
    }

    #[test]
    fn maybe_dirty_node_checks_deps() {
        let mut node = done(1, 10, 1);
        assert!(node.mark_dirty(DirtyState::MaybeDirty));
        assert!(!node.mark_dirty(DirtyState::MaybeDirty));
        assert!(node.value().is_some());
        assert!(node.outcome().is_none());

        node.schedule();
        assert_eq!(node.claim(), Some(Task::CheckDeps { group: 0 }));
        assert_eq!(node.state(), NodeState::CheckingDeps);

        let committed = node.commit_verified(2);
        assert!(!committed.changed);
        assert_eq!(node.state(), NodeState::Done);
        assert_eq!(node.verified_version(), 2);
        assert_eq!(node.version(), 1);
    }

    #[test]
    fn dirty_escalates_but_does_not_repropagate() {
        let mut node = done(1, 10, 1);
        assert!(node.mark_dirty(DirtyState::MaybeDirty));
        assert!(!node.mark_dirty(DirtyState::Changed));
        assert_eq!(node.dirty_state(), DirtyState::Changed);
        assert!(!node.mark_dirty(DirtyState::MaybeDirty));
        assert_eq!(node.dirty_state(), DirtyState::Changed);
    }

    #[test]
    fn parked_node_wakes_after_last_dependency() {
        let mut node = NodeEntry::new(key(1));
        node.schedule();
        node.claim();
        node.begin_attempt();
        node.park(vec![key(2), key(3)], HashMap::new());
        assert_eq!(node.awaiting().len(), 2);

        assert!(!node.dependency_finished());
        assert!(!node.release_token());
        assert!(node.dependency_finished());
        assert_eq!(node.claim(), Some(Task::Evaluate));
    }

    #[test]
    fn waiter_on_finished_node_is_not_registered() {
        let mut node = done(1, 10, 4);
        match node.add_waiter(&key(9)) {
            Wait::Finished { version } => assert_eq!(version, 4),
            Wait::Registered { .. } => panic!("finished node must not register waiters"),
        }
        assert!(!node.is_in_flight());
    }

    #[test]
    fn waiter_on_idle_node_queues_it() {
        let mut node = NodeEntry::new(key(1));
        assert!(matches!(node.add_waiter(&key(9)), Wait::Registered { newly_queued: true }));
        assert!(matches!(node.add_waiter(&key(8)), Wait::Registered { newly_queued: false }));
        node.claim();
        node.begin_attempt();
        let committed = node.commit_value(Value::new(1_i64), Vec::new(), 1);
        assert_eq!(committed.waiters, vec![key(9), key(8)]);
    }

    #[test]
    fn rollback_restores_previous_result() {
        let mut node = done(1, 10, 1);
        node.mark_dirty(DirtyState::Changed);
        node.schedule();
        node.claim();
        node.begin_attempt();
        node.rollback();
        assert_eq!(node.state(), NodeState::Done);
        assert_eq!(node.dirty_state(), DirtyState::Changed);
        assert!(!node.is_in_flight());

        let mut fresh = NodeEntry::new(key(2));
        fresh.schedule();
        fresh.claim();
        fresh.begin_attempt();
        fresh.rollback();
        assert_eq!(fresh.state(), NodeState::NotStarted);
    }

    #[test]
    fn injected_value_is_kept_when_invalidated() {
        let mut node = NodeEntry::new(key(1));
        assert!(node.inject(Value::new("opt".to_string()), 2).changed);
        assert!(!node.inject(Value::new("opt".to_string()), 3).changed);
        assert_eq!(node.version(), 2);

        node.mark_dirty(DirtyState::Changed);
        node.schedule();
        assert_eq!(node.claim(), Some(Task::KeepInjected));
    }
}
