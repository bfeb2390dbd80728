//! Evaluation results and statistics.

use std::sync::atomic::{AtomicUsize, Ordering};

use indexmap::IndexMap;
use serde::Serialize;

use crate::error::ErrorInfo;
use crate::graph::{Outcome, Version};
use crate::key::Key;
use crate::value::Value;

/// Counters for one evaluation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EvaluationStats {
    /// Function attempts started, restarts included.
    pub invocations: usize,
    /// Attempts abandoned on missing dependencies.
    pub restarts: usize,
    /// Nodes that committed a computed value.
    pub built: usize,
    /// Built nodes whose value equaled the previous one.
    pub unchanged: usize,
    /// Dirty nodes reused without running their function.
    pub verified: usize,
    /// Nodes that committed an error.
    pub errors: usize,
}

/// Lock-free counters shared by the workers of a pass.
#[derive(Debug, Default)]
pub(crate) struct StatsCounter {
    invocations: AtomicUsize,
    restarts: AtomicUsize,
    built: AtomicUsize,
    unchanged: AtomicUsize,
    verified: AtomicUsize,
    errors: AtomicUsize,
}

impl StatsCounter {
    pub fn invoked(&self) {
        self.invocations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn restarted(&self) {
        self.restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn built(&self, changed: bool) {
        self.built.fetch_add(1, Ordering::Relaxed);
        if !changed {
            self.unchanged.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn verified(&self) {
        self.verified.fetch_add(1, Ordering::Relaxed);
    }

    pub fn failed(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> EvaluationStats {
        EvaluationStats {
            invocations: self.invocations.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
            built: self.built.load(Ordering::Relaxed),
            unchanged: self.unchanged.load(Ordering::Relaxed),
            verified: self.verified.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Outcome of [`Engine::evaluate`](crate::Engine::evaluate).
///
/// Roots are reported in the order they were requested. With `keep_going`
/// off, roots that were cut short by another root's failure are absent.
#[derive(Debug, Clone)]
pub struct EvaluationResult {
    roots: IndexMap<Key, Outcome>,
    errors: Vec<ErrorInfo>,
    stats: EvaluationStats,
    version: Version,
}

impl EvaluationResult {
    pub(crate) fn new(
        roots: IndexMap<Key, Outcome>,
        errors: Vec<ErrorInfo>,
        stats: EvaluationStats,
        version: Version,
    ) -> Self {
        Self {
            roots,
            errors,
            stats,
            version,
        }
    }

    /// The outcome of `root`, if it was reported.
    pub fn get(&self, root: &Key) -> Option<&Outcome> {
        self.roots.get(root)
    }

    /// The value of `root`, if it succeeded.
    pub fn value(&self, root: &Key) -> Option<&Value> {
        self.get(root).and_then(|outcome| outcome.as_ref().ok())
    }

    /// The error of `root`, if it failed.
    pub fn error(&self, root: &Key) -> Option<&ErrorInfo> {
        self.get(root).and_then(|outcome| outcome.as_ref().err())
    }

    /// Every reported root with its outcome.
    pub fn roots(&self) -> impl Iterator<Item = (&Key, &Outcome)> {
        self.roots.iter()
    }

    /// Failures, in root order.
    pub fn errors(&self) -> &[ErrorInfo] {
        &self.errors
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn stats(&self) -> &EvaluationStats {
        &self.stats
    }

    /// The version the pass ran at.
    pub fn version(&self) -> Version {
        self.version
    }
}
