//! Evaluation Graph
//!
//! This module holds the persistent side of the engine: the node entries, the
//! store mapping keys to entries, and the invalidator that marks entries dirty
//! between passes.
//!
//! # Overview
//!
//! The graph is a directed graph where:
//!
//! - Nodes are keyed computations, each with a cached result
//! - Edges are dependencies discovered while the computation ran: if A read
//!   B, A records B in its direct dependencies and B records A in its reverse
//!   dependencies
//!
//! When an input changes, the invalidator walks reverse edges to find every
//! node that might be affected and marks it dirty. The evaluator then decides
//! which dirty nodes actually need to recompute.
//!
//! # Design Decisions
//!
//! 1. The store is a sharded concurrent map rather than one big lock, so
//!    workers creating and reading unrelated nodes do not contend.
//!
//! 2. Each node has its own mutex. A state transition holds exactly one of
//!    them.
//!
//! 3. Reverse dependencies are stored as keys, never as handles. They are an
//!    index used for invalidation and do not keep dependents alive.

mod invalidator;
mod node;
mod snapshot;
mod store;

pub use invalidator::{InvalidationSummary, Invalidator};
pub use node::{DepGroup, DirtyState, NodeEntry, NodeState, Outcome, Version};
pub use snapshot::{GraphSnapshot, NodeSnapshot};
pub use store::{GraphStore, NodeHandle};

pub(crate) use node::{Committed, Task, Wait};
