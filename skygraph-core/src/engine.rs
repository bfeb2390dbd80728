//! Engine
//!
//! The engine ties the pieces together: it owns the graph, the function
//! registry and the worker pool, and it is the only entry point that mutates
//! the graph from outside.
//!
//! # Passes
//!
//! Evaluation, invalidation, injection and reset all take the same pass
//! lock, so invalidation always sees a quiescent graph and a pass never sees
//! a half-applied change. Inside a pass, workers only synchronize on the
//! per-node mutexes.
//!
//! # Blocking
//!
//! [`Engine::evaluate`] blocks the calling thread until the pass is done. It
//! drives the pass on the engine's own runtime, so it must not be called from
//! inside an async context.

use std::sync::Arc;

use indexmap::IndexSet;
use parking_lot::Mutex;
use tokio::runtime::{Builder, Runtime};
use tracing::{debug, instrument};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::eval::{
    run_pass, EvaluationListener, EvaluationResult, FunctionRegistry, InterruptHandle, Pass,
};
use crate::graph::{GraphSnapshot, GraphStore, InvalidationSummary, Invalidator};
use crate::key::Key;
use crate::value::Value;

/// Incremental evaluation engine.
pub struct Engine {
    graph: Arc<GraphStore>,
    registry: Arc<FunctionRegistry>,
    listener: Option<Arc<dyn EvaluationListener>>,
    config: EngineConfig,
    runtime: Runtime,
    pass_lock: Mutex<()>,
    /// Handle of the next pass. Replaced once a pass was interrupted.
    interrupt: Mutex<InterruptHandle>,
}

impl Engine {
    /// Create an engine with the default configuration.
    pub fn new(registry: FunctionRegistry) -> Result<Self, EngineError> {
        Self::with_config(registry, EngineConfig::default())
    }

    /// Create an engine with an explicit configuration.
    pub fn with_config(
        registry: FunctionRegistry,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(config.effective_worker_threads())
            .thread_name(config.thread_name.clone())
            .build()
            .map_err(EngineError::WorkerPool)?;
        debug!(
            worker_threads = config.effective_worker_threads(),
            functions = registry.len(),
            "engine started"
        );

        Ok(Self {
            graph: Arc::new(GraphStore::new()),
            registry: Arc::new(registry),
            listener: None,
            config,
            runtime,
            pass_lock: Mutex::new(()),
            interrupt: Mutex::new(InterruptHandle::new()),
        })
    }

    /// Report progress to `listener`.
    pub fn with_listener(mut self, listener: Arc<dyn EvaluationListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &FunctionRegistry {
        &self.registry
    }

    /// Direct access to the graph, mostly for inspection.
    pub fn graph(&self) -> &GraphStore {
        &self.graph
    }

    /// Evaluate `roots`, reusing every cached result that is still valid.
    ///
    /// With `keep_going` off, the first failing node stops dispatch of new
    /// work; roots that were not affected by it may be missing from the
    /// result. With `keep_going` on, every root reports its own outcome.
    ///
    /// Per-node failures are reported in the result. `Err` is reserved for
    /// failures of the engine itself.
    #[instrument(
        level = "debug",
        skip_all,
        fields(keep_going = keep_going, roots = tracing::field::Empty)
    )]
    pub fn evaluate<I>(&self, roots: I, keep_going: bool) -> Result<EvaluationResult, EngineError>
    where
        I: IntoIterator<Item = Key>,
    {
        let roots: Vec<Key> = roots.into_iter().collect::<IndexSet<_>>().into_iter().collect();
        tracing::Span::current().record("roots", roots.len());

        let _pass = self.pass_lock.lock();
        let interrupt = self.interrupt.lock().clone();
        let version = self.graph.bump_version();
        debug!(version, "starting pass");

        let pass = Arc::new(Pass::new(
            Arc::clone(&self.graph),
            Arc::clone(&self.registry),
            self.listener.clone(),
            interrupt.clone(),
            version,
            keep_going,
        ));
        let result = run_pass(&self.runtime, pass, &roots);

        if interrupt.is_interrupted() {
            debug!(version, "pass interrupted");
            *self.interrupt.lock() = InterruptHandle::new();
        }
        result
    }

    /// Handle that interrupts the running (or next) pass.
    ///
    /// Unfinished roots of an interrupted pass report
    /// [`ErrorKind::Interrupted`](crate::ErrorKind::Interrupted). The pass
    /// after it runs normally; handles obtained before the interruption no
    /// longer have any effect.
    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.lock().clone()
    }

    /// Report `changed` keys as modified since the last pass.
    pub fn invalidate<I>(&self, changed: I) -> InvalidationSummary
    where
        I: IntoIterator<Item = Key>,
    {
        let _pass = self.pass_lock.lock();
        self.invalidator().invalidate(changed)
    }

    /// Set precomputed values for keys that have no function.
    pub fn inject<I>(&self, values: I) -> InvalidationSummary
    where
        I: IntoIterator<Item = (Key, Value)>,
    {
        let _pass = self.pass_lock.lock();
        self.invalidator().inject(values)
    }

    /// Drop every node and start over at version zero.
    pub fn reset(&self) {
        let _pass = self.pass_lock.lock();
        debug!(nodes = self.graph.len(), "resetting graph");
        self.graph.clear();
    }

    /// Capture the whole graph for debugging.
    pub fn snapshot(&self) -> GraphSnapshot {
        let _pass = self.pass_lock.lock();
        GraphSnapshot::capture(&self.graph)
    }

    fn invalidator(&self) -> Invalidator<'_> {
        let invalidator = Invalidator::new(&self.graph);
        match &self.listener {
            Some(listener) => invalidator.with_listener(listener.as_ref()),
            None => invalidator,
        }
    }
}
