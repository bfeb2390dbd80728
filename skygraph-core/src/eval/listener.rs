//! Progress listeners.
//!
//! An [`EvaluationListener`] observes what the engine does without being able
//! to influence it. Every method has an empty default so implementors only
//! override what they care about. Listeners are called from worker threads
//! and must not block.

use parking_lot::Mutex;

use crate::error::ErrorKind;
use crate::graph::DirtyState;
use crate::key::Key;

/// How a node finished in a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeOutcome {
    /// The function ran and committed a value. `changed` is false when the
    /// value equals the previously cached one.
    Built { changed: bool },
    /// The recorded dependencies were unchanged; the cached result was reused
    /// without running the function.
    Verified,
    /// The node committed an error.
    Failed(ErrorKind),
}

/// Observer of evaluation progress.
pub trait EvaluationListener: Send + Sync {
    /// A node was put into the ready queue.
    fn enqueued(&self, _key: &Key) {}

    /// A function attempt is about to run.
    fn computing(&self, _key: &Key, _generation: u32) {}

    /// A function attempt was abandoned because `missing` were not ready.
    fn restarted(&self, _key: &Key, _missing: &[Key]) {}

    /// A node finished.
    fn evaluated(&self, _key: &Key, _outcome: NodeOutcome) {}

    /// A node was marked dirty.
    fn invalidated(&self, _key: &Key, _dirty: DirtyState) {}
}

/// A recorded listener callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Enqueued(Key),
    Computing(Key, u32),
    Restarted(Key, Vec<Key>),
    Evaluated(Key, NodeOutcome),
    Invalidated(Key, DirtyState),
}

/// Listener that keeps every callback in memory, in arrival order.
#[derive(Debug, Default)]
pub struct EventRecorder {
    events: Mutex<Vec<Event>>,
}

impl EventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// All events recorded so far.
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// Drop all recorded events.
    pub fn clear(&self) {
        self.events.lock().clear();
    }

    /// How many times a function attempt started for `key`.
    pub fn computations(&self, key: &Key) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|event| matches!(event, Event::Computing(k, _) if k == key))
            .count()
    }

    /// The outcomes recorded for `key`, in order.
    pub fn outcomes(&self, key: &Key) -> Vec<NodeOutcome> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                Event::Evaluated(k, outcome) if k == key => Some(*outcome),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: Event) {
        self.events.lock().push(event);
    }
}

impl EvaluationListener for EventRecorder {
    fn enqueued(&self, key: &Key) {
        self.push(Event::Enqueued(key.clone()));
    }

    fn computing(&self, key: &Key, generation: u32) {
        self.push(Event::Computing(key.clone(), generation));
    }

    fn restarted(&self, key: &Key, missing: &[Key]) {
        self.push(Event::Restarted(key.clone(), missing.to_vec()));
    }

    fn evaluated(&self, key: &Key, outcome: NodeOutcome) {
        self.push(Event::Evaluated(key.clone(), outcome));
    }

    fn invalidated(&self, key: &Key, dirty: DirtyState) {
        self.push(Event::Invalidated(key.clone(), dirty));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::FunctionTag;

    const NODE: FunctionTag = FunctionTag::new("node");

    #[test]
    fn recorder_counts_per_key() {
        let recorder = EventRecorder::new();
        let a = Key::new(NODE, 'a');
        let b = Key::new(NODE, 'b');

        recorder.computing(&a, 1);
        recorder.restarted(&a, &[b.clone()]);
        recorder.computing(&b, 1);
        recorder.computing(&a, 2);
        recorder.evaluated(&a, NodeOutcome::Built { changed: true });

        assert_eq!(recorder.computations(&a), 2);
        assert_eq!(recorder.computations(&b), 1);
        assert_eq!(recorder.outcomes(&a), vec![NodeOutcome::Built { changed: true }]);
        assert!(recorder.outcomes(&b).is_empty());

        recorder.clear();
        assert!(recorder.events().is_empty());
    }
}
