//! Per-node work.
//!
//! A worker takes one ready key, claims it and moves it as far as it can
//! without blocking: it either commits a result or parks the node on the
//! dependencies it is missing. Whatever became ready along the way is handed
//! back to the driver for dispatch.
//!
//! # Parking
//!
//! Parking has to cope with dependencies that finish while the dependent is
//! still registering itself. The node's pending count starts at one more than
//! the number of dependencies; the extra token is released only after every
//! registration is done. A dependency that is already finished at
//! registration time counts itself down immediately, so whichever side brings
//! the count to zero, and only that side, re-queues the node.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::environment::Environment;
use super::function::FunctionRegistry;
use super::interrupt::InterruptHandle;
use super::listener::{EvaluationListener, NodeOutcome};
use super::result::StatsCounter;
use crate::error::{CycleInfo, EngineError, ErrorInfo, FunctionError};
use crate::graph::{Committed, DepGroup, GraphStore, NodeHandle, Outcome, Task, Version, Wait};
use crate::key::Key;
use crate::value::Value;

/// State shared by every worker of one evaluation pass.
pub(crate) struct Pass {
    pub graph: Arc<GraphStore>,
    pub registry: Arc<FunctionRegistry>,
    pub listener: Option<Arc<dyn EvaluationListener>>,
    pub interrupt: InterruptHandle,
    pub version: Version,
    pub keep_going: bool,
    pub stats: StatsCounter,

    /// Set once no new work may start.
    halted: AtomicBool,
    /// The node whose error halted a pass without `keep_going`.
    failure: Mutex<Option<Key>>,
    /// Engine failure that aborts the pass.
    fatal: Mutex<Option<EngineError>>,
    /// Every key scheduled in this pass, for the final rollback.
    touched: Mutex<Vec<Key>>,
}

impl Pass {
    pub fn new(
        graph: Arc<GraphStore>,
        registry: Arc<FunctionRegistry>,
        listener: Option<Arc<dyn EvaluationListener>>,
        interrupt: InterruptHandle,
        version: Version,
        keep_going: bool,
    ) -> Self {
        Self {
            graph,
            registry,
            listener,
            interrupt,
            version,
            keep_going,
            stats: StatsCounter::default(),
            halted: AtomicBool::new(false),
            failure: Mutex::new(None),
            fatal: Mutex::new(None),
            touched: Mutex::new(Vec::new()),
        }
    }

    /// Whether dispatch of new work has stopped.
    pub fn should_stop(&self) -> bool {
        self.halted.load(Ordering::Acquire) || self.interrupt.is_interrupted()
    }

    /// The failure that halted the pass, if any.
    pub fn failure(&self) -> Option<Key> {
        self.failure.lock().clone()
    }

    pub fn take_fatal(&self) -> Option<EngineError> {
        self.fatal.lock().take()
    }

    pub fn abort(&self, error: EngineError) {
        self.halted.store(true, Ordering::Release);
        let mut fatal = self.fatal.lock();
        if fatal.is_none() {
            *fatal = Some(error);
        }
    }

    /// Queue `root` if it needs work. Returns `true` if it must be dispatched.
    pub fn schedule_root(&self, root: &Key) -> bool {
        let queued = self.graph.get_or_create(root).lock().schedule();
        if queued {
            self.enqueued(root);
        }
        queued
    }

    /// Process one ready key. Returns the keys that became ready.
    pub fn run(&self, key: &Key) -> Vec<Key> {
        if self.should_stop() {
            trace!(%key, "pass stopping, leaving node queued");
            return Vec::new();
        }
        let handle = self.graph.get_or_create(key);
        let task = handle.lock().claim();
        match task {
            Some(Task::Evaluate) => self.evaluate(key, &handle),
            Some(Task::CheckDeps { group }) => self.check_deps(key, &handle, group),
            Some(Task::KeepInjected) => self.verified(key, &handle),
            None => {
                warn!(%key, "dispatched a node that was not queued");
                Vec::new()
            }
        }
    }

    /// Re-verify recorded dependency groups, in order, starting at `start`.
    fn check_deps(&self, key: &Key, handle: &NodeHandle, start: usize) -> Vec<Key> {
        let (groups, verified_at) = {
            let node = handle.lock();
            let groups = node.direct_deps().get(start..).map(<[_]>::to_vec).unwrap_or_default();
            (groups, node.verified_version())
        };

        for (offset, group) in groups.iter().enumerate() {
            let mut unfinished = Vec::new();
            for dep in group {
                let dep_handle = self.graph.get_or_create(dep);
                let dep_node = dep_handle.lock();
                if !dep_node.is_finished() {
                    unfinished.push(dep.clone());
                } else if dep_node.version() > verified_at {
                    drop(dep_node);
                    trace!(%key, %dep, "dependency changed, rebuilding");
                    return self.evaluate(key, handle);
                }
            }
            if !unfinished.is_empty() {
                return self.park(key, handle, unfinished, HashMap::new());
            }
            handle.lock().group_verified(start + offset);
        }
        self.verified(key, handle)
    }

    fn verified(&self, key: &Key, handle: &NodeHandle) -> Vec<Key> {
        let committed = handle.lock().commit_verified(self.version);
        self.stats.verified();
        trace!(%key, "reused cached result");
        self.notify(|listener| listener.evaluated(key, NodeOutcome::Verified));
        self.signal(&committed.waiters)
    }

    /// Run one attempt of the node's function.
    fn evaluate(&self, key: &Key, handle: &NodeHandle) -> Vec<Key> {
        let (generation, memo) = {
            let mut node = handle.lock();
            (node.begin_attempt(), node.take_memo())
        };
        let Some(function) = self.registry.get(key.tag()) else {
            let error = ErrorInfo::direct(key, FunctionError::Unregistered(key.tag()));
            return self.commit_error(key, handle, error, Vec::new());
        };

        self.stats.invoked();
        self.notify(|listener| listener.computing(key, generation));
        trace!(%key, generation, "running function");

        let mut env = Environment::new(key, &self.graph, self.version, &self.interrupt, memo);
        let run = AssertUnwindSafe(|| function.compute(key, &mut env));
        let result = match panic::catch_unwind(run) {
            Ok(result) => result,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!(%key, %message, "node function panicked");
                self.abort(EngineError::FunctionPanicked { key: key.clone(), message });
                return Vec::new();
            }
        };
        let attempt = env.finish();

        if self.interrupt.is_interrupted() {
            trace!(%key, "discarding attempt of interrupted pass");
            return Vec::new();
        }

        if !attempt.missing.is_empty() {
            if result.is_ok() {
                warn!(%key, "function returned a value while dependencies were missing");
            }
            self.stats.restarted();
            self.notify(|listener| listener.restarted(key, &attempt.missing));
            trace!(%key, missing = attempt.missing.len(), "restarting once dependencies are done");
            return self.park(key, handle, attempt.missing, attempt.memo);
        }
        if !attempt.failed.is_empty() {
            let error = ErrorInfo::transitive(&attempt.failed);
            return self.commit_error(key, handle, error, attempt.groups);
        }
        match result {
            Ok(value) => self.commit_value(key, handle, value, attempt.groups),
            Err(error) => {
                let error = ErrorInfo::direct(key, error);
                self.commit_error(key, handle, error, attempt.groups)
            }
        }
    }

    /// Park a claimed node until every key in `awaiting` has finished.
    fn park(
        &self,
        key: &Key,
        handle: &NodeHandle,
        awaiting: Vec<Key>,
        memo: HashMap<Key, Outcome>,
    ) -> Vec<Key> {
        handle.lock().park(awaiting.clone(), memo);

        let mut ready = Vec::new();
        for dep in &awaiting {
            let wait = self.graph.get_or_create(dep).lock().add_waiter(key);
            match wait {
                Wait::Finished { version } => {
                    trace!(%key, %dep, version, "dependency finished during registration");
                    handle.lock().dependency_finished();
                }
                Wait::Registered { newly_queued: true } => {
                    self.enqueued(dep);
                    ready.push(dep.clone());
                }
                Wait::Registered { newly_queued: false } => {}
            }
        }
        if handle.lock().release_token() {
            ready.push(key.clone());
        }
        ready
    }

    fn commit_value(
        &self,
        key: &Key,
        handle: &NodeHandle,
        value: Value,
        deps: Vec<DepGroup>,
    ) -> Vec<Key> {
        let committed = handle.lock().commit_value(value, deps.clone(), self.version);
        let changed = committed.changed;
        self.stats.built(changed);
        trace!(%key, changed, "committed value");
        self.notify(|listener| listener.evaluated(key, NodeOutcome::Built { changed }));
        self.finish(key, committed, &deps)
    }

    fn commit_error(
        &self,
        key: &Key,
        handle: &NodeHandle,
        error: ErrorInfo,
        deps: Vec<DepGroup>,
    ) -> Vec<Key> {
        let kind = error.kind();
        debug!(%key, %error, "committed error");
        let committed = handle.lock().commit_error(error, deps.clone(), self.version);
        self.stats.failed();
        self.notify(|listener| listener.evaluated(key, NodeOutcome::Failed(kind)));
        if !self.keep_going {
            self.halt_on(key);
        }
        self.finish(key, committed, &deps)
    }

    /// Commit every member of `cycle` as a cycle error.
    pub fn commit_cycle(&self, cycle: &[Key]) -> Vec<Key> {
        let info = CycleInfo::new(cycle.to_vec());
        debug!(cycle = %info, "dependency cycle detected");

        let mut ready = Vec::new();
        for member in cycle {
            let Some(handle) = self.graph.get(member) else {
                continue;
            };
            let deps = {
                let node = handle.lock();
                if node.is_finished() {
                    continue;
                }
                let group = node.requested_deps();
                if group.is_empty() {
                    Vec::new()
                } else {
                    vec![group]
                }
            };
            let error = ErrorInfo::cycle(info.clone());
            ready.extend(self.commit_error(member, &handle, error, deps));
        }
        ready.retain(|key| !cycle.contains(key));
        ready
    }

    fn finish(&self, key: &Key, committed: Committed, deps: &[DepGroup]) -> Vec<Key> {
        self.rewire(key, &committed.old_deps, deps);
        self.signal(&committed.waiters)
    }

    /// Move reverse edges from the previous dependencies to the new ones.
    fn rewire(&self, key: &Key, old: &[DepGroup], new: &[DepGroup]) {
        let old: HashSet<&Key> = old.iter().flatten().collect();
        let new: HashSet<&Key> = new.iter().flatten().collect();
        for dep in old.difference(&new) {
            if let Some(dep_handle) = self.graph.get(dep) {
                dep_handle.lock().remove_reverse_dep(key);
            }
        }
        for dep in new.difference(&old) {
            self.graph.get_or_create(dep).lock().add_reverse_dep(key.clone());
        }
    }

    /// Tell `waiters` that a dependency finished; returns those now ready.
    fn signal(&self, waiters: &[Key]) -> Vec<Key> {
        waiters
            .iter()
            .filter(|waiter| {
                self.graph
                    .get(waiter)
                    .is_some_and(|handle| handle.lock().dependency_finished())
            })
            .cloned()
            .collect()
    }

    fn halt_on(&self, key: &Key) {
        self.halted.store(true, Ordering::Release);
        let mut failure = self.failure.lock();
        if failure.is_none() {
            debug!(%key, "halting pass on first error");
            *failure = Some(key.clone());
        }
    }

    fn enqueued(&self, key: &Key) {
        self.touched.lock().push(key.clone());
        trace!(%key, "enqueued");
        self.notify(|listener| listener.enqueued(key));
    }

    fn notify(&self, event: impl FnOnce(&dyn EvaluationListener)) {
        if let Some(listener) = &self.listener {
            event(listener.as_ref());
        }
    }

    /// Roll back every node this pass left in flight. Returns how many.
    pub fn rollback(&self) -> usize {
        let touched = std::mem::take(&mut *self.touched.lock());
        let mut rolled_back = 0;
        for key in touched {
            if let Some(handle) = self.graph.get(&key) {
                let mut node = handle.lock();
                if node.is_in_flight() {
                    node.rollback();
                    rolled_back += 1;
                }
            }
        }
        rolled_back
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Invalidator, NodeState};
    use crate::key::FunctionTag;

    const INPUT: FunctionTag = FunctionTag::new("input");
    const DOUBLE: FunctionTag = FunctionTag::new("double");

    fn pass(graph: &Arc<GraphStore>, keep_going: bool) -> Pass {
        let mut registry = FunctionRegistry::new();
        registry
            .register_fn(DOUBLE, |key, env| {
                let input = Key::new(INPUT, *key.argument::<u32>().unwrap_or(&0));
                let value = env.require(&input)?;
                Ok(Value::new(value.get::<u32>().unwrap_or_default() * 2))
            })
            .unwrap();
        let version = graph.bump_version();
        Pass::new(
            Arc::clone(graph),
            Arc::new(registry),
            None,
            InterruptHandle::new(),
            version,
            keep_going,
        )
    }

    #[test]
    fn missing_dependency_parks_then_resumes() {
        let graph = Arc::new(GraphStore::new());
        let pass = pass(&graph, true);
        let double = Key::new(DOUBLE, 7_u32);
        let input = Key::new(INPUT, 7_u32);

        assert!(pass.schedule_root(&double));
        // `input` has no function and no value yet; it gets scheduled.
        assert_eq!(pass.run(&double), vec![input.clone()]);
        assert_eq!(pass.stats.snapshot().restarts, 1);
        assert_eq!(graph.get(&double).unwrap().lock().state(), NodeState::Evaluating);

        // Running `input` fails it as unregistered, which wakes `double`.
        assert_eq!(pass.run(&input), vec![double.clone()]);
        assert!(pass.run(&double).is_empty());

        let node = graph.get(&double).unwrap().lock().error().cloned().unwrap();
        assert!(node.is_transitive());
        assert_eq!(node.root_causes(), &[input]);
        assert_eq!(pass.rollback(), 0);
    }

    #[test]
    fn finished_dependency_does_not_park() {
        let graph = Arc::new(GraphStore::new());
        let input = Key::new(INPUT, 4_u32);
        Invalidator::new(&graph).inject([(input.clone(), Value::new(21_u32))]);

        let pass = pass(&graph, true);
        let double = Key::new(DOUBLE, 4_u32);
        assert!(pass.schedule_root(&double));
        assert!(pass.run(&double).is_empty());

        let node = graph.get(&double).unwrap();
        assert_eq!(node.lock().value(), Some(&Value::new(42_u32)));
        assert!(graph.get(&input).unwrap().lock().reverse_deps().contains(&double));
    }

    #[test]
    fn error_without_keep_going_halts() {
        let graph = Arc::new(GraphStore::new());
        let pass = pass(&graph, false);
        let orphan = Key::new(INPUT, 1_u32);

        assert!(pass.schedule_root(&orphan));
        pass.run(&orphan);
        assert!(pass.should_stop());
        assert_eq!(pass.failure(), Some(orphan));
    }

    #[test]
    fn rollback_forgets_unfinished_nodes() {
        let graph = Arc::new(GraphStore::new());
        let pass = pass(&graph, true);
        let double = Key::new(DOUBLE, 3_u32);

        pass.schedule_root(&double);
        pass.run(&double);
        assert_eq!(pass.rollback(), 2);
        assert_eq!(graph.get(&double).unwrap().lock().state(), NodeState::NotStarted);
    }

    #[test]
    fn panic_payloads_are_rendered() {
        assert_eq!(panic_message(&"boom"), "boom");
        assert_eq!(panic_message(&"owned".to_string()), "owned");
        assert_eq!(panic_message(&3_u8), "non-string panic payload");
    }
}
