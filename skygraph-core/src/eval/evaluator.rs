//! Evaluation driver.
//!
//! The driver owns the ready queue. It dispatches ready keys onto the worker
//! pool, collects the keys each finished task reports as newly ready, and
//! steps in when the pool drains:
//!
//! - all roots finished: the pass is over;
//! - roots unfinished: every remaining node is parked, so something waits on
//!   itself. The driver looks for cycles, fails their members, and carries
//!   on with the dependents this wakes up.
//!
//! Whatever is still in flight when the pass ends (halted, interrupted or
//! aborted) is rolled back, so the graph never keeps half-finished work.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use indexmap::IndexMap;
use tokio::runtime::Runtime;
use tokio::task::JoinSet;
use tracing::{debug, error};

use super::cycle::find_cycles;
use super::result::EvaluationResult;
use super::worker::Pass;
use crate::error::{EngineError, ErrorInfo};
use crate::graph::GraphStore;
use crate::key::Key;

/// Run one pass over `roots` to completion.
pub(crate) fn run_pass(
    runtime: &Runtime,
    pass: Arc<Pass>,
    roots: &[Key],
) -> Result<EvaluationResult, EngineError> {
    let drained = runtime.block_on(drive(Arc::clone(&pass), roots));
    let outcome = drained.and_then(|()| match pass.take_fatal() {
        Some(fatal) => Err(fatal),
        None => Ok(collect(&pass, roots)),
    });

    let rolled_back = pass.rollback();
    if rolled_back > 0 {
        debug!(rolled_back, "rolled back unfinished nodes");
    }
    outcome
}

async fn drive(pass: Arc<Pass>, roots: &[Key]) -> Result<(), EngineError> {
    let mut ready: VecDeque<Key> = roots
        .iter()
        .filter(|root| pass.schedule_root(root))
        .cloned()
        .collect();
    let mut tasks = JoinSet::new();

    loop {
        if !pass.should_stop() {
            while let Some(key) = ready.pop_front() {
                let worker = Arc::clone(&pass);
                tasks.spawn(async move { worker.run(&key) });
            }
        }

        match tasks.join_next().await {
            Some(Ok(newly_ready)) => ready.extend(newly_ready),
            Some(Err(join_error)) => {
                error!(%join_error, "evaluation task failed");
            }
            None => {
                if pass.should_stop() {
                    break;
                }
                if !ready.is_empty() {
                    continue;
                }
                let stuck: Vec<Key> = roots
                    .iter()
                    .filter(|root| !is_finished(&pass.graph, root))
                    .cloned()
                    .collect();
                if stuck.is_empty() {
                    break;
                }
                let cycles = find_cycles(&pass.graph, &stuck);
                if cycles.is_empty() {
                    error!(stuck = stuck.len(), "worker pool drained with unfinished roots");
                    return Err(EngineError::Stalled { keys: stuck });
                }
                for cycle in &cycles {
                    ready.extend(pass.commit_cycle(cycle));
                }
            }
        }
    }
    Ok(())
}

/// Gather root outcomes. Must run before the rollback, while waiting edges
/// of unfinished nodes are still recorded.
fn collect(pass: &Pass, roots: &[Key]) -> EvaluationResult {
    let graph = &pass.graph;
    let interrupted = pass.interrupt.is_interrupted();
    let failure = pass.failure().and_then(|key| {
        let error = graph.get(&key)?.lock().error().cloned()?;
        Some((key, error))
    });

    let mut outcomes = IndexMap::new();
    let mut errors = Vec::new();
    for root in roots {
        let outcome = match graph.get(root).and_then(|handle| handle.lock().outcome()) {
            Some(outcome) => outcome,
            None if interrupted => Err(ErrorInfo::interrupted()),
            None => match &failure {
                Some((failed, error)) if waits_on(graph, root, failed) => {
                    Err(ErrorInfo::transitive([error]))
                }
                // Cut short by another root's failure.
                _ => continue,
            },
        };
        if let Err(error) = &outcome {
            errors.push(error.clone());
        }
        outcomes.insert(root.clone(), outcome);
    }
    if !pass.keep_going {
        errors.truncate(1);
    }

    let stats = pass.stats.snapshot();
    debug!(
        roots = outcomes.len(),
        errors = errors.len(),
        invocations = stats.invocations,
        restarts = stats.restarts,
        verified = stats.verified,
        "pass finished"
    );
    EvaluationResult::new(outcomes, errors, stats, pass.version)
}

fn is_finished(graph: &GraphStore, key: &Key) -> bool {
    graph.get(key).is_some_and(|handle| handle.lock().is_finished())
}

/// Whether `root` transitively waits on `target`.
fn waits_on(graph: &GraphStore, root: &Key, target: &Key) -> bool {
    let mut seen = HashSet::new();
    let mut stack = vec![root.clone()];
    while let Some(key) = stack.pop() {
        if &key == target {
            return true;
        }
        if !seen.insert(key.clone()) {
            continue;
        }
        if let Some(handle) = graph.get(&key) {
            stack.extend(handle.lock().awaiting().iter().cloned());
        }
    }
    false
}
