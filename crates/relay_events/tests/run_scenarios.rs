use std::time::{Duration, Instant};

use relay_events::{
    decode, BlockerClass, DerivationEngine, DerivedEvent, EventKind, OperationalStatus, Pacer,
    PacingConfig, RunStore,
};

const T0: u64 = 1_700_000_000_000;

fn at(kind: EventKind, offset_ms: u64, message: &str) -> DerivedEvent {
    DerivedEvent::new(kind, T0 + offset_ms, "scenario", message)
}

fn tool(offset_ms: u64, name: &str) -> DerivedEvent {
    at(EventKind::ToolActivity, offset_ms, "Item started").with_tool(Some(name.to_string()))
}

fn error(offset_ms: u64, message: &str) -> DerivedEvent {
    at(EventKind::Error, offset_ms, message)
}

#[test]
fn repeated_failure_signature_is_a_tool_fail_loop() {
    let mut store = RunStore::default();
    let events = [
        at(EventKind::StepStarted, 0, "Turn started"),
        tool(1_000, "Bash"),
        error(2_000, "same failure"),
        tool(3_000, "Bash"),
        error(4_000, "same failure"),
    ];
    for event in &events {
        store.apply("run-1", event, event.ts);
    }

    let run = store.get("run-1").expect("run exists");
    assert_eq!(run.blocker_class, BlockerClass::ToolFailLoop);
    assert_eq!(run.operational_status, OperationalStatus::Loop);
    assert_eq!(run.failure_streak, 2);
    assert_eq!(run.tool_count, 2);
    assert_eq!(run.error_count, 2);
    assert!(run.blocked_since > 0);
}

#[test]
fn failed_items_from_the_wire_become_a_tool_fail_loop() {
    let engine = DerivationEngine::default();
    let mut store = RunStore::default();
    let wire = [
        r#"{"method":"turn/started","params":{"threadId":"th-1"}}"#,
        r#"{"method":"item/completed","params":{"threadId":"th-1","item":{"status":"failed","text":"same failure"}}}"#,
        r#"{"method":"item/completed","params":{"threadId":"th-1","item":{"status":"failed","text":"same failure"}}}"#,
    ];

    for (offset, payload) in (0u64..).zip(wire) {
        let received_at = T0 + offset * 1_000;
        for raw in decode(payload).expect("valid payload") {
            let derived = engine.derive(&raw, received_at);
            assert!(derived.iter().all(|event| event.kind != EventKind::Success));
            for event in &derived {
                store.apply("th-1", event, received_at);
            }
        }
    }

    let run = store.get("th-1").expect("run exists");
    assert_eq!(run.blocker_class, BlockerClass::ToolFailLoop);
    assert_eq!(run.operational_status, OperationalStatus::Loop);
    assert_eq!(run.failure_streak, 2);
    assert_eq!(run.success_count, 0);
    assert_eq!(run.error_count, 2);
}

#[test]
fn single_error_is_not_a_loop() {
    let mut store = RunStore::default();
    store.apply("run-1", &at(EventKind::StepStarted, 0, "go"), T0);
    store.apply("run-1", &error(1, "same failure"), T0 + 1);
    let run = store.get("run-1").expect("run exists");
    assert_eq!(run.blocker_class, BlockerClass::None);
    assert_eq!(run.operational_status, OperationalStatus::Active);
}

#[test]
fn signatures_outside_the_window_do_not_count() {
    let mut store = RunStore::default();
    store.apply("run-1", &error(0, "same failure"), T0);
    let later = 11 * 60_000;
    store.apply("run-1", &error(later, "same failure"), T0 + later);
    assert_eq!(store.get("run-1").expect("run").blocker_class, BlockerClass::None);
}

#[test]
fn reclassification_is_idempotent() {
    let mut store = RunStore::default();
    store.apply("run-1", &error(0, "same failure"), T0);
    store.apply("run-1", &error(1, "same failure"), T0 + 1);
    let before = store.get("run-1").cloned().expect("run");
    assert!(store.tick(T0 + 1).is_empty());
    assert_eq!(store.get("run-1"), Some(&before));
}

#[test]
fn runs_are_tracked_independently() {
    let mut store = RunStore::default();
    store.apply("run-a", &error(0, "x"), T0);
    store.apply("run-a", &error(1, "x"), T0 + 1);
    store.apply("run-b", &at(EventKind::StepStarted, 1, "go"), T0 + 1);

    assert_eq!(
        store.get("run-a").expect("a").operational_status,
        OperationalStatus::Loop
    );
    assert_eq!(
        store.get("run-b").expect("b").operational_status,
        OperationalStatus::Active
    );
}

#[test]
fn paced_burst_then_critical_then_file_batch() {
    let mut pacer = Pacer::new(PacingConfig::default());
    let t0 = Instant::now();
    let mut emitted = Vec::new();

    emitted.extend(pacer.admit("agent-1", tool(0, "Read"), t0));
    for step in 1..=5u64 {
        let now = t0 + Duration::from_millis(step * 50);
        emitted.extend(pacer.admit("agent-1", tool(step, "Read"), now));
    }
    assert_eq!(emitted.len(), 1);

    let critical = pacer.admit(
        "agent-1",
        error(10, "fatal: disk full"),
        t0 + Duration::from_millis(400),
    );
    assert_eq!(critical.len(), 1);
    assert_eq!(critical[0].event.kind, EventKind::Error);

    for (offset, path) in [(500u64, "a.rs"), (600, "b.rs"), (700, "a.rs")] {
        let event = at(EventKind::FileChanged, offset, "diff").with_file(path);
        assert!(pacer
            .admit("agent-1", event, t0 + Duration::from_millis(offset))
            .is_empty());
    }

    let drained = pacer.drain_due(t0 + Duration::from_secs(5));
    assert_eq!(drained.len(), 1);
    let mut paths = drained[0].event.file_paths.clone();
    paths.sort();
    assert_eq!(paths, vec!["a.rs", "b.rs"]);
}
