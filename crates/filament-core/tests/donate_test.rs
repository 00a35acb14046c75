// Copyright (C) 2025 Filament Cloud Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration tests for hierarchical composition: bud, donate, reap.

mod common;

use std::sync::Arc;

use serde_json::json;

use filament_core::dispatcher::{DispatcherConfig, TickResult};
use filament_core::persistence::{NewStrand, StrandStore};
use filament_core::signal;

use common::{
    ChildProgram, HolderProgram, ObserverProgram, ParentProgram, entries, fixture,
    fixture_with_config, new_log,
};

/// Scan until the strand finishes, bounded so a regression fails instead of
/// hanging. Each pass makes the whole subtree due, standing in for elapsed
/// wall time between polls.
async fn scan_until_finished(
    dispatcher: &filament_core::Dispatcher,
    store: &Arc<filament_core::persistence::MemoryStore>,
    id: filament_core::StrandId,
) {
    for _ in 0..10 {
        if store
            .load_strand(id)
            .await
            .unwrap()
            .is_some_and(|s| s.is_finished())
        {
            return;
        }
        let past = chrono::Utc::now() - chrono::Duration::seconds(1);
        let mut pending = vec![id];
        while let Some(next) = pending.pop() {
            if let Some(mut strand) = store.load_strand(next).await.unwrap() {
                if !strand.is_finished() && !strand.stuck {
                    strand.scheduled_at = past;
                    store.save_strand(&strand).await.unwrap();
                }
            }
            for child in store.children_of(next).await.unwrap() {
                pending.push(child.id);
            }
        }
        dispatcher.scan_once("w1").await.unwrap();
    }
    panic!("strand did not finish within the scan budget");
}

#[tokio::test]
async fn test_bud_donate_reap_collects_all_children() {
    let log = new_log();
    let (store, dispatcher) = fixture(vec![
        Arc::new(ParentProgram { log: log.clone() }),
        Arc::new(ChildProgram { log: log.clone() }),
    ]);

    let parent = store
        .create_strand(NewStrand::root("parent", "start", json!({"children": 3})))
        .await
        .unwrap();

    // Tick 1: parent buds three children and hops to wait.
    dispatcher.tick("w1", parent.id).await.unwrap();
    assert_eq!(store.children_of(parent.id).await.unwrap().len(), 3);

    // The wait handler donates its tick; the two-label children run to
    // completion inside it, then get reaped.
    scan_until_finished(&dispatcher, &store, parent.id).await;

    let done = store.load_strand(parent.id).await.unwrap().unwrap();
    let reaped = done.exit_value.unwrap()["reaped"].as_array().unwrap().len();
    assert_eq!(reaped, 3);

    // Reaping deleted the child records.
    assert!(store.children_of(parent.id).await.unwrap().is_empty());
    assert_eq!(store.strand_count(), 1);

    // Every child ran both of its labels.
    let log = entries(&log);
    assert_eq!(log.iter().filter(|e| *e == "child/start").count(), 3);
    assert_eq!(log.iter().filter(|e| *e == "child/work").count(), 3);
}

#[tokio::test]
async fn test_reap_is_partial_while_children_run() {
    let log = new_log();
    let (store, dispatcher) = fixture(vec![
        Arc::new(ParentProgram { log: log.clone() }),
        Arc::new(ChildProgram { log: log.clone() }),
        Arc::new(HolderProgram { log: log.clone() }),
    ]);

    let parent = store
        .create_strand(NewStrand::root("parent", "wait", json!({"children": 0})))
        .await
        .unwrap();

    // One finished child, one that naps forever on its wait label.
    let quick = store
        .create_strand(NewStrand::child(parent.id, "child", "work", json!({})))
        .await
        .unwrap();
    let slow = store
        .create_strand(NewStrand::child(parent.id, "holder", "wait", json!({})))
        .await
        .unwrap();
    dispatcher.tick("w1", quick.id).await.unwrap();

    // The parent's wait tick reaps the finished child only.
    dispatcher.tick("w1", parent.id).await.unwrap();
    let remaining = store.children_of(parent.id).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, slow.id);

    let waiting = store.load_strand(parent.id).await.unwrap().unwrap();
    assert!(!waiting.is_finished());
    let reaped = &waiting.stack[0].locals["reaped"];
    assert_eq!(reaped.as_array().unwrap().len(), 1);
    assert_eq!(reaped[0], json!({"msg": "done"}));
}

#[tokio::test]
async fn test_donate_runs_children_within_parent_tick() {
    let log = new_log();
    let (store, dispatcher) = fixture(vec![
        Arc::new(ParentProgram { log: log.clone() }),
        Arc::new(ChildProgram { log: log.clone() }),
    ]);

    let parent = store
        .create_strand(NewStrand::root("parent", "wait", json!({"children": 0})))
        .await
        .unwrap();
    store
        .create_strand(NewStrand::child(parent.id, "child", "start", json!({})))
        .await
        .unwrap();

    // A single parent tick: donate drives the child through start and work,
    // then the parent reaps it and completes.
    assert_eq!(
        dispatcher.tick("w1", parent.id).await.unwrap(),
        TickResult::Completed
    );
    assert_eq!(
        entries(&log),
        vec!["parent/wait", "child/start", "child/work"]
    );
}

#[tokio::test]
async fn test_donate_round_bound_stops_restless_children() {
    let log = new_log();
    let config = DispatcherConfig {
        max_donate_rounds: 3,
        ..DispatcherConfig::default()
    };
    let (store, dispatcher) = fixture_with_config(
        vec![
            Arc::new(ObserverProgram),
            Arc::new(HolderProgram { log: log.clone() }),
        ],
        config,
    );

    let parent = store
        .create_strand(NewStrand::root("observer", "watch", json!({})))
        .await
        .unwrap();
    // The holder naps 0 on every tick: always immediately eligible again,
    // so the donate loop can only stop at its round bound.
    let child = store
        .create_strand(NewStrand::child(parent.id, "holder", "wait", json!({})))
        .await
        .unwrap();

    assert_eq!(
        dispatcher.tick("w1", parent.id).await.unwrap(),
        TickResult::Completed
    );

    let done = store.load_strand(parent.id).await.unwrap().unwrap();
    let report = done.exit_value.unwrap();
    assert_eq!(report["rounds"], json!(3));
    assert_eq!(report["ticks"], json!(3));
    assert_eq!(report["settled"], json!(false));

    // One child tick per round, and the child survives the bound.
    assert_eq!(entries(&log).len(), 3);
    assert!(store.load_strand(child.id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_destroy_with_stuck_child_backs_off() {
    let log = new_log();
    let (store, dispatcher) = fixture(vec![
        Arc::new(ParentProgram { log: log.clone() }),
        Arc::new(ChildProgram { log: log.clone() }),
    ]);

    let parent = store
        .create_strand(NewStrand::root("parent", "wait", json!({"children": 0})))
        .await
        .unwrap();
    let child = store
        .create_strand(NewStrand::child(parent.id, "child", "start", json!({})))
        .await
        .unwrap();
    let mut wedged = store.load_strand(child.id).await.unwrap().unwrap();
    wedged.stuck = true;
    wedged.last_error = Some("bootstrap failed repeatedly".to_string());
    store.save_strand(&wedged).await.unwrap();

    store.raise_signal(parent.id, signal::DESTROY).await.unwrap();
    dispatcher.tick("w1", parent.id).await.unwrap();
    assert_eq!(
        store.load_strand(parent.id).await.unwrap().unwrap().label,
        "destroy"
    );

    // The teardown round can make no progress against a stuck child; it
    // must defer with a real interval rather than spin.
    let before = chrono::Utc::now();
    assert_eq!(
        dispatcher.tick("w1", parent.id).await.unwrap(),
        TickResult::Advanced
    );
    let waiting = store.load_strand(parent.id).await.unwrap().unwrap();
    assert_eq!(waiting.label, "destroy");
    assert!(!waiting.is_finished());
    assert!(waiting.scheduled_at >= before + chrono::Duration::seconds(10));

    // Stuck children are not re-signaled, and the strand is not due again.
    assert!(!store.signal_pending(child.id, signal::DESTROY).await.unwrap());
    assert_eq!(dispatcher.scan_once("w1").await.unwrap(), 0);
    assert!(store.load_strand(child.id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_destroy_propagates_to_children() {
    let log = new_log();
    let (store, dispatcher) = fixture(vec![
        Arc::new(ParentProgram { log: log.clone() }),
        Arc::new(ChildProgram { log: log.clone() }),
    ]);

    let parent = store
        .create_strand(NewStrand::root("parent", "wait", json!({"children": 0})))
        .await
        .unwrap();
    let child = store
        .create_strand(NewStrand::child(parent.id, "child", "start", json!({})))
        .await
        .unwrap();
    // Hold the child on a label it would not normally leave this tick.
    let mut held = store.load_strand(child.id).await.unwrap().unwrap();
    held.scheduled_at = held.scheduled_at + chrono::Duration::seconds(3600);
    store.save_strand(&held).await.unwrap();

    store.raise_signal(parent.id, signal::DESTROY).await.unwrap();

    // Tick 1: before_run hops the parent to destroy.
    dispatcher.tick("w1", parent.id).await.unwrap();
    assert_eq!(
        store
            .load_strand(parent.id)
            .await
            .unwrap()
            .unwrap()
            .label,
        "destroy"
    );

    // Tick 2: the destroy handler signals the child. The napping child is
    // not eligible for donate, so the parent naps and retries.
    dispatcher.tick("w1", parent.id).await.unwrap();
    assert!(store.signal_pending(child.id, signal::DESTROY).await.unwrap());

    // Make the child due again; its own before_run diverts it to teardown
    // and the next parent pass reaps it.
    let mut due = store.load_strand(child.id).await.unwrap().unwrap();
    due.scheduled_at = chrono::Utc::now() - chrono::Duration::seconds(1);
    store.save_strand(&due).await.unwrap();

    scan_until_finished(&dispatcher, &store, parent.id).await;

    let done = store.load_strand(parent.id).await.unwrap().unwrap();
    assert_eq!(done.exit_value, Some(json!({"msg": "destroyed"})));
    assert!(store.children_of(parent.id).await.unwrap().is_empty());
    assert!(entries(&log).contains(&"child/destroy".to_string()));
}
