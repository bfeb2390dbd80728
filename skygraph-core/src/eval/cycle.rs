//! Cycle detection.
//!
//! Runs only when the worker pool has drained while roots are unfinished. At
//! that point every unfinished node is parked, and the "waits on" relation
//! between them is exactly the set of edges the stuck nodes requested. Any
//! stuck root must reach a cycle along those edges.

use std::collections::{HashMap, HashSet};

use crate::graph::GraphStore;
use crate::key::Key;

/// Find cycles reachable from `roots` along waiting edges.
///
/// Roots are walked in order, and waiting edges in the order the node
/// requested them. Each reported cycle starts at the first of its members the
/// walk reached. Cycles sharing a node with an earlier report are skipped:
/// their remaining members wait on a failed node and fail transitively.
pub(crate) fn find_cycles(graph: &GraphStore, roots: &[Key]) -> Vec<Vec<Key>> {
    let mut cycles: Vec<Vec<Key>> = Vec::new();
    let mut claimed: HashSet<Key> = HashSet::new();
    let mut explored: HashSet<Key> = HashSet::new();

    for root in roots {
        if explored.contains(root) {
            continue;
        }
        // (key, its waiting edges, next edge to follow)
        let mut stack: Vec<(Key, Vec<Key>, usize)> = Vec::new();
        let mut on_path: HashMap<Key, usize> = HashMap::new();

        if let Some(edges) = waiting_edges(graph, root) {
            on_path.insert(root.clone(), 0);
            stack.push((root.clone(), edges, 0));
        }

        while let Some((_, edges, next)) = stack.last_mut() {
            let Some(child) = edges.get(*next).cloned() else {
                if let Some((key, _, _)) = stack.pop() {
                    on_path.remove(&key);
                    explored.insert(key);
                }
                continue;
            };
            *next += 1;

            if let Some(&start) = on_path.get(&child) {
                let cycle: Vec<Key> =
                    stack[start..].iter().map(|(key, _, _)| key.clone()).collect();
                if cycle.iter().all(|key| !claimed.contains(key)) {
                    claimed.extend(cycle.iter().cloned());
                    cycles.push(cycle);
                }
                continue;
            }
            if explored.contains(&child) {
                continue;
            }
            if let Some(edges) = waiting_edges(graph, &child) {
                on_path.insert(child.clone(), stack.len());
                stack.push((child, edges, 0));
            } else {
                explored.insert(child);
            }
        }
    }
    cycles
}

/// Waiting edges of an unfinished node; `None` for finished or unknown keys.
fn waiting_edges(graph: &GraphStore, key: &Key) -> Option<Vec<Key>> {
    let handle = graph.get(key)?;
    let node = handle.lock();
    if node.is_finished() {
        return None;
    }
    Some(node.awaiting().to_vec())
}
