// Copyright (C) 2025 Filament Cloud Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration tests for deadlines, handler failures, and the stuck
//! escalation path.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use filament_core::dispatcher::{DispatcherConfig, TickResult};
use filament_core::persistence::{NewStrand, StrandStore};

use common::{FlakyProgram, SlowpokeProgram, fixture, fixture_with_config};

#[tokio::test]
async fn test_deadline_overrun_marks_stuck() {
    let (store, dispatcher) = fixture(vec![Arc::new(SlowpokeProgram)]);

    let strand = store
        .create_strand(NewStrand::root("slowpoke", "start", json!({})))
        .await
        .unwrap();

    // Tick 1: the handler registers an already-expired deadline on the
    // label it hops to. The deadline is only evaluated at the start of a
    // tick, so this one still commits.
    assert_eq!(
        dispatcher.tick("w1", strand.id).await.unwrap(),
        TickResult::Advanced
    );
    let moved = store.load_strand(strand.id).await.unwrap().unwrap();
    assert_eq!(moved.label, "stall");
    assert_eq!(moved.deadlines.len(), 1);

    // Tick 2: the overrun is detected before the handler runs.
    assert_eq!(
        dispatcher.tick("w1", strand.id).await.unwrap(),
        TickResult::Stuck
    );
    let stuck = store.load_strand(strand.id).await.unwrap().unwrap();
    assert!(stuck.stuck);
    assert!(
        stuck
            .last_error
            .as_deref()
            .unwrap()
            .contains("deadline overrun")
    );
}

#[tokio::test]
async fn test_deadline_satisfied_by_leaving_label_is_pruned() {
    let (store, dispatcher) = fixture(vec![Arc::new(SlowpokeProgram)]);

    let strand = store
        .create_strand(NewStrand::root("slowpoke", "start", json!({})))
        .await
        .unwrap();
    dispatcher.tick("w1", strand.id).await.unwrap();

    // Simulate the strand having already left the watched label: the next
    // tick prunes the satisfied deadline instead of flagging it.
    let mut moved = store.load_strand(strand.id).await.unwrap().unwrap();
    moved.set_label("start");
    store.save_strand(&moved).await.unwrap();

    assert_eq!(
        dispatcher.tick("w1", strand.id).await.unwrap(),
        TickResult::Advanced
    );
    let pruned = store.load_strand(strand.id).await.unwrap().unwrap();
    assert!(!pruned.stuck);
    // Only the freshly re-registered deadline remains.
    assert_eq!(pruned.deadlines.len(), 1);
    assert_eq!(pruned.deadlines[0].label.as_deref(), Some("stall"));
}

#[tokio::test]
async fn test_handler_errors_back_off_then_stick() {
    let config = DispatcherConfig {
        max_consecutive_failures: 3,
        base_backoff: Duration::from_secs(2),
        ..DispatcherConfig::default()
    };
    let (store, dispatcher) = fixture_with_config(vec![Arc::new(FlakyProgram)], config);

    let strand = store
        .create_strand(NewStrand::root("flaky", "start", json!({})))
        .await
        .unwrap();

    // Failures 1 and 2: recorded, rescheduled with doubling backoff.
    for (attempt, expected_backoff) in [(1, 2), (2, 4)] {
        let before = Utc::now();
        assert_eq!(
            dispatcher.tick("w1", strand.id).await.unwrap(),
            TickResult::Errored
        );
        let failed = store.load_strand(strand.id).await.unwrap().unwrap();
        assert_eq!(failed.consecutive_failures, attempt);
        assert!(
            failed
                .last_error
                .as_deref()
                .unwrap()
                .contains("upstream service unavailable")
        );
        assert!(failed.scheduled_at >= before + chrono::Duration::seconds(expected_backoff));
        assert!(!failed.stuck);

        // Not due until the backoff elapses.
        assert_eq!(dispatcher.scan_once("w1").await.unwrap(), 0);

        // Collapse the backoff so the next attempt runs now.
        let mut due = failed;
        due.scheduled_at = Utc::now() - chrono::Duration::seconds(1);
        store.save_strand(&due).await.unwrap();
    }

    // Failure 3 crosses the threshold.
    assert_eq!(
        dispatcher.tick("w1", strand.id).await.unwrap(),
        TickResult::Stuck
    );
    let stuck = store.load_strand(strand.id).await.unwrap().unwrap();
    assert!(stuck.stuck);
    assert_eq!(stuck.consecutive_failures, 3);

    // Stuck is terminal for the dispatcher.
    assert_eq!(
        dispatcher.tick("w1", strand.id).await.unwrap(),
        TickResult::Skipped
    );
}

#[tokio::test]
async fn test_errored_tick_leaves_execution_state_untouched() {
    let (store, dispatcher) = fixture(vec![Arc::new(FlakyProgram)]);

    let strand = store
        .create_strand(NewStrand::root("flaky", "start", json!({"token": 42})))
        .await
        .unwrap();

    dispatcher.tick("w1", strand.id).await.unwrap();

    // Failure bookkeeping changed; label, stack, and locals did not.
    let after = store.load_strand(strand.id).await.unwrap().unwrap();
    assert_eq!(after.label, "start");
    assert_eq!(after.stack.len(), 1);
    assert_eq!(after.stack[0].locals, json!({"token": 42}));
    assert_eq!(after.consecutive_failures, 1);
    assert!(after.lease_owner.is_none());
}
