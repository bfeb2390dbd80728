//! Failure Handling Tests
//!
//! Errors, dependency cycles, `keep_going`, cancellation and panics.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use skygraph_core::{
    Engine, EngineConfig, EngineError, ErrorKind, EventRecorder, FunctionError, FunctionRegistry,
    FunctionTag, InterruptHandle, Key, NodeState, Value,
};
use tracing_test::traced_test;

const STEP: FunctionTag = FunctionTag::new("step");
const OK: FunctionTag = FunctionTag::new("ok");
const FAIL: FunctionTag = FunctionTag::new("fail");
const CHAIN: FunctionTag = FunctionTag::new("chain");
const RESCUE: FunctionTag = FunctionTag::new("rescue");
const GATHER: FunctionTag = FunctionTag::new("gather");
const TRIGGER: FunctionTag = FunctionTag::new("trigger");
const PANIC: FunctionTag = FunctionTag::new("panic");

fn step(name: &'static str) -> Key {
    Key::new(STEP, name)
}

/// Registry where `step(x)` reads `step(edges[x])`, plus a few fixed helpers:
///
/// - `ok(n)` returns `n`
/// - `fail(_)` fails directly
/// - `chain(k)` returns the value of `k`
fn registry(edges: &[(&'static str, &'static str)]) -> FunctionRegistry {
    let edges: HashMap<&'static str, &'static str> = edges.iter().copied().collect();
    let mut registry = FunctionRegistry::new();
    registry
        .register_fn(STEP, move |key, env| {
            let name = *key.argument::<&'static str>().unwrap_or(&"");
            match edges.get(name) {
                Some(&next) => env.require(&step(next)),
                None => Ok(Value::new(name)),
            }
        })
        .unwrap()
        .register_fn(OK, |key, _env| {
            Ok(Value::new(key.argument::<u32>().copied().unwrap_or_default()))
        })
        .unwrap()
        .register_fn(FAIL, |key, _env| Err(FunctionError::message(format!("{key} is broken"))))
        .unwrap()
        .register_fn(CHAIN, |key, env| {
            let target = key
                .argument::<Key>()
                .cloned()
                .ok_or_else(|| FunctionError::message("bad key"))?;
            env.require(&target)
        })
        .unwrap();
    registry
}

fn engine(registry: FunctionRegistry, worker_threads: usize) -> (Engine, Arc<EventRecorder>) {
    let recorder = Arc::new(EventRecorder::new());
    let config = EngineConfig::default().with_worker_threads(worker_threads);
    let engine = Engine::with_config(registry, config)
        .unwrap()
        .with_listener(recorder.clone());
    (engine, recorder)
}

/// Test that every member of a cycle fails with the same ordered cycle and
/// that unrelated roots are unaffected.
#[test]
#[traced_test]
fn cycle_members_fail_with_cycle() {
    let (engine, _) = engine(registry(&[("a", "b"), ("b", "c"), ("c", "a")]), 4);
    let (a, b, c) = (step("a"), step("b"), step("c"));
    let free = Key::new(OK, 7_u32);

    let result = engine.evaluate([a.clone(), b.clone(), c.clone(), free.clone()], true).unwrap();

    for key in [&a, &b, &c] {
        let error = result.error(key).unwrap();
        assert_eq!(error.kind(), ErrorKind::Cycle);
        assert_eq!(error.cycles().len(), 1);
        assert_eq!(error.cycles()[0].cycle(), &[a.clone(), b.clone(), c.clone()]);
    }
    assert_eq!(result.value(&free), Some(&Value::new(7_u32)));
    assert_eq!(result.errors().len(), 3);
    assert_eq!(engine.graph().get(&a).unwrap().lock().state(), NodeState::Error);
}

/// Test that a node reading a cycle fails transitively with the cycle, and
/// that the cycle starts at the first member reached from the root.
#[test]
fn dependents_of_a_cycle_carry_it() {
    let (engine, _) = engine(registry(&[("x", "a"), ("a", "b"), ("b", "a")]), 2);
    let x = step("x");

    let result = engine.evaluate([x.clone()], true).unwrap();
    let error = result.error(&x).unwrap();
    assert_eq!(error.kind(), ErrorKind::Transitive);
    assert_eq!(error.cycles()[0].cycle(), &[step("a"), step("b")]);
    assert_eq!(error.root_causes(), &[step("a"), step("b")]);
}

/// Test that a key reading itself is a one-element cycle.
#[test]
fn self_dependency_is_a_cycle() {
    let (engine, _) = engine(registry(&[("me", "me")]), 1);
    let me = step("me");

    let result = engine.evaluate([me.clone()], false).unwrap();
    let error = result.error(&me).unwrap();
    assert_eq!(error.kind(), ErrorKind::Cycle);
    assert_eq!(error.cycles()[0].cycle(), &[me]);
}

/// Test that a cached error is rebuilt once the cycle is broken.
#[test]
fn cycle_error_is_not_sticky() {
    let mut registry = FunctionRegistry::new();
    registry
        .register_fn(STEP, |key, env| {
            let name = *key.argument::<&'static str>().unwrap_or(&"");
            let follow = env
                .require(&Key::new(OK, 0_u32))
                .map(|flag| flag.get::<bool>().unwrap_or(true))?;
            match (name, follow) {
                ("a", true) => env.require(&step("b")),
                ("b", _) => env.require(&step("a")),
                _ => Ok(Value::new(name)),
            }
        })
        .unwrap();
    let (engine, _) = engine(registry, 2);
    let a = step("a");

    engine.inject([(Key::new(OK, 0_u32), Value::new(true))]);
    let first = engine.evaluate([a.clone()], true).unwrap();
    assert_eq!(first.error(&a).map(|e| e.kind()), Some(ErrorKind::Cycle));

    engine.inject([(Key::new(OK, 0_u32), Value::new(false))]);
    let second = engine.evaluate([a.clone()], true).unwrap();
    assert_eq!(second.value(&a), Some(&Value::new("a")));
}

/// Test that with `keep_going` every root reports its own status.
#[test]
fn keep_going_reports_each_root() {
    let (engine, _) = engine(registry(&[]), 4);
    let bad = Key::new(FAIL, 1_u32);
    let via_bad = Key::new(CHAIN, bad.clone());
    let good = Key::new(OK, 5_u32);

    let result = engine.evaluate([bad.clone(), via_bad.clone(), good.clone()], true).unwrap();

    let direct = result.error(&bad).unwrap();
    assert_eq!(direct.kind(), ErrorKind::Direct);
    assert_eq!(direct.exception().map(ToString::to_string), Some(format!("{bad} is broken")));

    let transitive = result.error(&via_bad).unwrap();
    assert!(transitive.is_transitive());
    assert_eq!(transitive.root_causes(), &[bad.clone()]);

    assert_eq!(result.value(&good), Some(&Value::new(5_u32)));
    assert_eq!(result.errors().len(), 2);
}

/// Test that without `keep_going` a finished root is still reported and the
/// result carries a single error.
#[test]
fn fail_fast_preserves_finished_roots() {
    let (engine, _) = engine(registry(&[]), 4);
    let bad = Key::new(FAIL, 2_u32);
    let good = Key::new(OK, 9_u32);

    engine.evaluate([good.clone()], false).unwrap();
    let result = engine.evaluate([bad.clone(), good.clone()], false).unwrap();

    assert_eq!(result.error(&bad).map(|e| e.kind()), Some(ErrorKind::Direct));
    assert_eq!(result.value(&good), Some(&Value::new(9_u32)));
    assert_eq!(result.errors().len(), 1);
}

/// Test that without `keep_going` no new work starts after the first error.
#[test]
fn fail_fast_stops_dispatch() {
    // One worker runs the two roots in order.
    let (engine, recorder) = engine(registry(&[]), 1);
    let bad = Key::new(FAIL, 3_u32);
    let later = Key::new(OK, 1_u32);

    let result = engine.evaluate([bad.clone(), later.clone()], false).unwrap();

    assert!(result.error(&bad).is_some());
    assert!(result.get(&later).is_none());
    assert_eq!(recorder.computations(&later), 0);
    assert_eq!(engine.graph().get(&later).unwrap().lock().state(), NodeState::NotStarted);

    // The skipped root evaluates normally afterwards.
    let again = engine.evaluate([later.clone()], false).unwrap();
    assert_eq!(again.value(&later), Some(&Value::new(1_u32)));
}

/// Test that the error of a failing dependency is attributed to the root
/// that was waiting on it.
#[test]
fn fail_fast_bubbles_to_waiting_root() {
    let (engine, _) = engine(registry(&[]), 2);
    let bad = Key::new(FAIL, 4_u32);
    let middle = Key::new(CHAIN, bad.clone());
    let top = Key::new(CHAIN, middle.clone());

    let result = engine.evaluate([top.clone()], false).unwrap();

    let error = result.error(&top).unwrap();
    assert_eq!(error.kind(), ErrorKind::Transitive);
    assert_eq!(error.root_causes(), &[bad]);
    assert_eq!(result.errors().len(), 1);
    // Neither of the unfinished dependents was cached.
    assert_eq!(engine.graph().get(&top).unwrap().lock().state(), NodeState::NotStarted);
}

/// Test that an error requested through the tolerant API is handed to the
/// function, which can still produce a value.
#[test]
fn tolerant_function_recovers() {
    let mut registry = registry(&[]);
    registry
        .register_fn(RESCUE, |key, env| {
            let target = key
                .argument::<Key>()
                .cloned()
                .ok_or_else(|| FunctionError::message("bad key"))?;
            match env.get_value_or_error(&target) {
                None => Err(FunctionError::MissingDeps),
                Some(Ok(value)) => Ok(value),
                Some(Err(error)) => {
                    let causes = error.root_causes().len();
                    Ok(Value::new(format!("recovered from {causes}")))
                }
            }
        })
        .unwrap();
    let (engine, _) = engine(registry, 2);
    let bad = Key::new(FAIL, 5_u32);
    let rescue = Key::new(RESCUE, bad.clone());

    let result = engine.evaluate([rescue.clone()], true).unwrap();
    assert_eq!(
        result.value(&rescue).and_then(Value::get::<String>).as_deref(),
        Some("recovered from 1")
    );
    assert!(!result.has_errors());
}

/// Test that tolerant group reads see values and errors side by side.
#[test]
fn tolerant_group_mixes_values_and_errors() {
    let mut registry = registry(&[]);
    registry
        .register_fn(GATHER, |_key, env| {
            let keys = [Key::new(OK, 1_u32), Key::new(FAIL, 6_u32), Key::new(OK, 2_u32)];
            let outcomes = env.get_values_or_errors(&keys);
            if env.values_missing() {
                return Err(FunctionError::MissingDeps);
            }
            let ok = outcomes
                .values()
                .filter(|outcome| matches!(outcome, Some(Ok(_))))
                .count();
            let failed = outcomes
                .values()
                .filter(|outcome| matches!(outcome, Some(Err(_))))
                .count();
            Ok(Value::new((ok, failed)))
        })
        .unwrap();
    let (engine, _) = engine(registry, 4);
    let gather = Key::new(GATHER, ());

    let result = engine.evaluate([gather.clone()], true).unwrap();
    assert_eq!(result.value(&gather), Some(&Value::new((2_usize, 1_usize))));
}

/// Test that a function without a registration fails directly.
#[test]
fn unregistered_tag_fails_directly() {
    let (engine, _) = engine(registry(&[]), 1);
    let orphan = Key::new(FunctionTag::new("orphan"), 1_u8);

    let result = engine.evaluate([orphan.clone()], true).unwrap();
    let error = result.error(&orphan).unwrap();
    assert_eq!(error.kind(), ErrorKind::Direct);
    assert!(matches!(
        error.exception().and_then(|e| e.downcast_ref::<FunctionError>()),
        Some(FunctionError::Unregistered(_))
    ));
}

/// Test that an interrupted pass reports its roots as interrupted, caches
/// nothing partial, and that the next pass completes.
#[test]
fn interruption_is_clean() {
    let handle: Arc<OnceLock<InterruptHandle>> = Arc::default();
    let slot = Arc::clone(&handle);

    let mut registry = registry(&[]);
    registry
        .register_fn(TRIGGER, move |_key, _env| {
            if let Some(token) = slot.get() {
                token.interrupt();
            }
            Ok(Value::new("fired"))
        })
        .unwrap()
        .register_fn(GATHER, |_key, env| {
            let values = env.require_all([&Key::new(TRIGGER, ()), &Key::new(OK, 3_u32)])?;
            Ok(Value::new(values.len()))
        })
        .unwrap();
    let (engine, _) = engine(registry, 2);
    let _ = handle.set(engine.interrupt_handle());
    let gather = Key::new(GATHER, ());
    let trigger = Key::new(TRIGGER, ());

    let result = engine.evaluate([gather.clone()], true).unwrap();
    assert_eq!(result.error(&gather).map(|e| e.kind()), Some(ErrorKind::Interrupted));
    assert_eq!(engine.graph().get(&gather).unwrap().lock().state(), NodeState::NotStarted);
    assert_eq!(engine.graph().get(&trigger).unwrap().lock().state(), NodeState::NotStarted);

    let result = engine.evaluate([gather.clone()], true).unwrap();
    assert_eq!(result.value(&gather), Some(&Value::new(2_usize)));
}

/// Test that a panicking function aborts the pass with an engine error.
#[test]
fn panic_is_reported() {
    let mut registry = registry(&[]);
    registry
        .register_fn(PANIC, |_key, _env| -> Result<Value, FunctionError> { panic!("kaboom") })
        .unwrap();
    let (engine, _) = engine(registry, 1);
    let key = Key::new(PANIC, ());

    match engine.evaluate([key.clone()], true) {
        Err(EngineError::FunctionPanicked { key: failed, message }) => {
            assert_eq!(failed, key);
            assert_eq!(message, "kaboom");
        }
        other => panic!("expected a panic report, got {other:?}"),
    }
    assert_eq!(engine.graph().get(&key).unwrap().lock().state(), NodeState::NotStarted);
}
