//! Skygraph Core
//!
//! This crate provides an incremental, memoizing evaluation engine. Work is
//! described as *functions* over *keys*; each function computes the value of
//! its key and may read the values of other keys while it runs. The engine:
//!
//! - evaluates requested keys in parallel on a fixed worker pool
//! - records the dependencies each function actually read
//! - caches every result, and after a change recomputes only what the change
//!   can reach
//! - stops propagating a change as soon as a rebuilt value turns out equal to
//!   the old one
//! - reports dependency cycles and failed dependencies as data instead of
//!   aborting
//!
//! # Architecture
//!
//! - `key`, `value`: type-erased identifiers and results
//! - `graph`: node entries, the concurrent store and invalidation
//! - `eval`: the environment, function registry and the parallel evaluator
//! - `engine`: the façade owning all of the above
//!
//! # Example
//!
//! ```rust
//! use skygraph_core::{Engine, FunctionRegistry, FunctionTag, Key, Value};
//!
//! const INPUT: FunctionTag = FunctionTag::new("input");
//! const SQUARE: FunctionTag = FunctionTag::new("square");
//!
//! let mut registry = FunctionRegistry::new();
//! registry
//!     .register_fn(SQUARE, |key, env| {
//!         let input = Key::new(INPUT, key.argument::<&str>().copied().unwrap_or_default());
//!         let n = env.require(&input)?.get::<i64>().unwrap_or_default();
//!         Ok(Value::new(n * n))
//!     })
//!     .unwrap();
//!
//! let engine = Engine::new(registry).unwrap();
//! let x = Key::new(INPUT, "x");
//! let square = Key::new(SQUARE, "x");
//!
//! engine.inject([(x.clone(), Value::new(3_i64))]);
//! let result = engine.evaluate([square.clone()], false).unwrap();
//! assert_eq!(result.value(&square), Some(&Value::new(9_i64)));
//!
//! engine.inject([(x, Value::new(4_i64))]);
//! let result = engine.evaluate([square.clone()], false).unwrap();
//! assert_eq!(result.value(&square), Some(&Value::new(16_i64)));
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod eval;
pub mod graph;
pub mod key;
pub mod value;

pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{
    CycleInfo, EngineError, ErrorInfo, ErrorKind, Exception, FunctionError, RegistryError,
};
pub use eval::{
    Environment, EvaluationListener, EvaluationResult, EvaluationStats, EventRecorder,
    FunctionRegistry, InterruptHandle, NodeFunction, NodeOutcome,
};
pub use graph::{DirtyState, GraphSnapshot, InvalidationSummary, NodeState};
pub use key::{Argument, FunctionTag, Key};
pub use value::Value;
