//! Parallel Evaluation
//!
//! This module turns root keys into results. It runs node functions on a
//! worker pool, discovers dependencies as the functions request them, and
//! reuses cached results wherever the graph proves them still valid.
//!
//! # Protocol
//!
//! 1. Roots that are not finished are queued.
//! 2. A worker claims a queued node. A node that was only maybe-dirty first
//!    re-verifies its recorded dependency groups; if none changed, its cached
//!    result is kept and the function never runs.
//! 3. Otherwise the function runs against an [`Environment`]. If it asks for
//!    dependencies that are not finished, the attempt is abandoned, the node
//!    parks on them, and they are queued.
//! 4. When the last awaited dependency finishes, the node is queued again and
//!    its function restarts from the beginning.
//! 5. A rebuilt value equal to the previous one keeps the old version, so
//!    dependents re-verifying against it see no change.
//!
//! Nodes never hold a worker while waiting, so a pass cannot deadlock on the
//! pool. It can only stall on a dependency cycle, which the driver detects
//! once nothing else is runnable.

mod cycle;
mod environment;
mod evaluator;
mod function;
mod interrupt;
mod listener;
mod result;
mod worker;

pub use environment::Environment;
pub use function::{FunctionRegistry, NodeFunction};
pub use interrupt::InterruptHandle;
pub use listener::{EvaluationListener, Event, EventRecorder, NodeOutcome};
pub use result::{EvaluationResult, EvaluationStats};

pub(crate) use evaluator::run_pass;
pub(crate) use worker::Pass;
