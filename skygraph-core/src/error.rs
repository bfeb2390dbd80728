//! Error Types
//!
//! Failures come in two very different flavors:
//!
//! - Per-node failures are *data*. A function that fails, a dependency that
//!   failed, a dependency cycle or an interrupted pass all end up as an
//!   [`ErrorInfo`] stored in the node and reported in the evaluation result.
//! - Engine failures ([`EngineError`]) abort an evaluation call outright. They
//!   indicate bugs (a panicking function, a stalled scheduler) rather than
//!   normal error flow.
//!
//! Functions themselves return [`FunctionError`], which also carries the
//! "dependencies not ready" signal used by the restart protocol.

use std::error::Error as StdError;
use std::fmt::{self, Display};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use crate::key::{FunctionTag, Key};

/// Shared, type-erased failure cause.
pub type Exception = Arc<dyn StdError + Send + Sync>;

/// Error returned from a node function body.
#[derive(Debug, Clone, Error)]
pub enum FunctionError {
    /// Some requested dependency is not available yet.
    ///
    /// The evaluator schedules the missing dependencies and runs the function
    /// again from the beginning once they are done.
    #[error("dependencies are not ready")]
    MissingDeps,

    /// No function is registered for the key's tag.
    #[error("no function registered for `{0}`")]
    Unregistered(FunctionTag),

    /// The computation itself failed.
    #[error(transparent)]
    Failed(Exception),
}

#[derive(Debug, Error)]
#[error("{0}")]
struct Message(String);

impl FunctionError {
    /// Wrap an arbitrary error as a computation failure.
    pub fn failed<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Failed(Arc::new(error))
    }

    /// Build a computation failure from a message.
    pub fn message(message: impl Into<String>) -> Self {
        Self::failed(Message(message.into()))
    }

    fn into_exception(self) -> Exception {
        match self {
            Self::Failed(exception) => exception,
            other => Arc::new(other),
        }
    }
}

/// Classification of a node failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    /// The node's own function failed.
    Direct,
    /// A dependency failed and the function did not tolerate it.
    Transitive,
    /// The node is part of a dependency cycle.
    Cycle,
    /// The evaluation was cancelled before the node finished.
    Interrupted,
}

/// An ordered dependency cycle.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CycleInfo {
    cycle: Vec<Key>,
}

impl CycleInfo {
    pub(crate) fn new(cycle: Vec<Key>) -> Self {
        Self { cycle }
    }

    /// Keys on the cycle, each depending on the next and the last on the first.
    pub fn cycle(&self) -> &[Key] {
        &self.cycle
    }
}

impl Display for CycleInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for key in &self.cycle {
            write!(f, "{key} -> ")?;
        }
        match self.cycle.first() {
            Some(first) => write!(f, "{first}"),
            None => Ok(()),
        }
    }
}

/// Failure recorded for a node.
#[derive(Debug, Clone)]
pub struct ErrorInfo {
    kind: ErrorKind,
    root_causes: Vec<Key>,
    exception: Option<Exception>,
    cycles: Vec<CycleInfo>,
}

impl ErrorInfo {
    /// The node's own function failed.
    pub(crate) fn direct(key: &Key, error: FunctionError) -> Self {
        Self {
            kind: ErrorKind::Direct,
            root_causes: vec![key.clone()],
            exception: Some(error.into_exception()),
            cycles: Vec::new(),
        }
    }

    /// The node sits on `cycle`.
    pub(crate) fn cycle(cycle: CycleInfo) -> Self {
        Self {
            kind: ErrorKind::Cycle,
            root_causes: cycle.cycle().to_vec(),
            exception: None,
            cycles: vec![cycle],
        }
    }

    /// The node depended on the failures in `causes`.
    pub(crate) fn transitive<'a>(causes: impl IntoIterator<Item = &'a ErrorInfo>) -> Self {
        let mut info = Self {
            kind: ErrorKind::Transitive,
            root_causes: Vec::new(),
            exception: None,
            cycles: Vec::new(),
        };
        for cause in causes {
            for key in &cause.root_causes {
                if !info.root_causes.contains(key) {
                    info.root_causes.push(key.clone());
                }
            }
            for cycle in &cause.cycles {
                if !info.cycles.contains(cycle) {
                    info.cycles.push(cycle.clone());
                }
            }
            if info.exception.is_none() {
                info.exception.clone_from(&cause.exception);
            }
        }
        info
    }

    pub(crate) fn interrupted() -> Self {
        Self {
            kind: ErrorKind::Interrupted,
            root_causes: Vec::new(),
            exception: None,
            cycles: Vec::new(),
        }
    }

    /// How the failure came about.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Keys whose own failure ultimately caused this error.
    pub fn root_causes(&self) -> &[Key] {
        &self.root_causes
    }

    /// The underlying error, if a function produced one.
    pub fn exception(&self) -> Option<&Exception> {
        self.exception.as_ref()
    }

    /// Cycles involved in this failure.
    pub fn cycles(&self) -> &[CycleInfo] {
        &self.cycles
    }

    pub fn is_transitive(&self) -> bool {
        self.kind == ErrorKind::Transitive
    }
}

impl Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ErrorKind::Direct | ErrorKind::Transitive => {
                let origin = match self.kind {
                    ErrorKind::Direct => "failed",
                    _ => "dependency failed",
                };
                write!(f, "{origin}")?;
                if let Some(key) = self.root_causes.first() {
                    write!(f, " at {key}")?;
                }
                if let Some(exception) = &self.exception {
                    write!(f, ": {exception}")?;
                }
                for cycle in &self.cycles {
                    write!(f, " (cycle: {cycle})")?;
                }
                Ok(())
            }
            ErrorKind::Cycle => match self.cycles.first() {
                Some(cycle) => write!(f, "dependency cycle: {cycle}"),
                None => f.write_str("dependency cycle"),
            },
            ErrorKind::Interrupted => f.write_str("evaluation interrupted"),
        }
    }
}

/// A failure of the engine itself.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A node function panicked.
    #[error("function for `{key}` panicked: {message}")]
    FunctionPanicked { key: Key, message: String },

    /// The worker pool drained with unfinished roots and no cycle to blame.
    #[error("evaluation stalled with {} unfinished keys", .keys.len())]
    Stalled { keys: Vec<Key> },

    /// The worker pool could not be started.
    #[error("failed to start worker pool")]
    WorkerPool(#[source] std::io::Error),
}

/// Errors raised while building a [`FunctionRegistry`](crate::FunctionRegistry).
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("a function is already registered for `{0}`")]
    DuplicateFunction(FunctionTag),
}
