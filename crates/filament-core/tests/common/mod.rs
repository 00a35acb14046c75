// Copyright (C) 2025 Filament Cloud Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for filament-core integration tests.
//!
//! Provides an in-memory engine fixture plus small test programs exercising
//! every control-flow primitive.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use filament_core::dispatcher::{Dispatcher, DispatcherConfig};
use filament_core::persistence::MemoryStore;
use filament_core::program::{Outcome, Program, ProgramRegistry, TickContext};
use filament_core::signal;

/// Shared log of handler invocations, recorded as "program/label".
pub type CallLog = Arc<Mutex<Vec<String>>>;

pub fn new_log() -> CallLog {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn record(log: &CallLog, program: &str, label: &str) {
    log.lock().unwrap().push(format!("{}/{}", program, label));
}

pub fn entries(log: &CallLog) -> Vec<String> {
    log.lock().unwrap().clone()
}

/// Build a dispatcher over a fresh in-memory store.
pub fn fixture(programs: Vec<Arc<dyn Program>>) -> (Arc<MemoryStore>, Dispatcher) {
    fixture_with_config(programs, DispatcherConfig::default())
}

pub fn fixture_with_config(
    programs: Vec<Arc<dyn Program>>,
    config: DispatcherConfig,
) -> (Arc<MemoryStore>, Dispatcher) {
    let store = Arc::new(MemoryStore::new());
    let mut registry = ProgramRegistry::new();
    for program in programs {
        registry.register(program).expect("test program registers");
    }
    let dispatcher = Dispatcher::new(store.clone(), Arc::new(registry), config);
    (store, dispatcher)
}

// ============================================================================
// Test programs
// ============================================================================

/// Three-step sequence: start -> middle -> finish -> exit.
pub struct SequenceProgram {
    pub log: CallLog,
}

#[async_trait]
impl Program for SequenceProgram {
    fn name(&self) -> &str {
        "sequence"
    }

    fn labels(&self) -> &[&str] {
        &["start", "middle", "finish"]
    }

    async fn run(&self, label: &str, _cx: &mut TickContext<'_>) -> anyhow::Result<Outcome> {
        record(&self.log, "sequence", label);
        match label {
            "start" => Ok(Outcome::hop("middle")),
            "middle" => Ok(Outcome::hop("finish")),
            "finish" => Ok(Outcome::exit(json!({"msg": "done"}))),
            other => anyhow::bail!("unhandled label {other}"),
        }
    }
}

#[derive(Serialize, Deserialize)]
pub struct SnoozeLocals {
    pub seconds: u64,
}

/// Naps forever by the number of seconds in its locals.
pub struct SnoozeProgram;

#[async_trait]
impl Program for SnoozeProgram {
    fn name(&self) -> &str {
        "snooze"
    }

    fn labels(&self) -> &[&str] {
        &["start"]
    }

    async fn run(&self, _label: &str, cx: &mut TickContext<'_>) -> anyhow::Result<Outcome> {
        let locals: SnoozeLocals = cx.locals()?;
        Ok(Outcome::nap(locals.seconds))
    }
}

/// Pushes a callee subroutine, then exits with whatever the callee returned.
pub struct CallerProgram {
    pub log: CallLog,
}

#[async_trait]
impl Program for CallerProgram {
    fn name(&self) -> &str {
        "caller"
    }

    fn labels(&self) -> &[&str] {
        &["start"]
    }

    async fn run(&self, label: &str, cx: &mut TickContext<'_>) -> anyhow::Result<Outcome> {
        record(&self.log, "caller", label);
        match cx.take_retval() {
            Some(retval) => Ok(Outcome::exit(retval)),
            None => Ok(Outcome::push("callee", "run", json!({"input": 7}))),
        }
    }
}

/// One-tick subroutine that exits with a result derived from its locals.
pub struct CalleeProgram {
    pub log: CallLog,
}

#[async_trait]
impl Program for CalleeProgram {
    fn name(&self) -> &str {
        "callee"
    }

    fn labels(&self) -> &[&str] {
        &["run"]
    }

    async fn run(&self, label: &str, cx: &mut TickContext<'_>) -> anyhow::Result<Outcome> {
        record(&self.log, "callee", label);
        let input = cx.strand().top_frame().locals["input"].as_i64().unwrap_or(0);
        Ok(Outcome::exit(json!({"doubled": input * 2})))
    }
}

#[derive(Serialize, Deserialize, Default)]
pub struct ParentLocals {
    pub children: usize,
    #[serde(default)]
    pub reaped: Vec<serde_json::Value>,
}

/// Buds `children` child strands, donates until they settle, reaps them all,
/// and exits with the collected results.
pub struct ParentProgram {
    pub log: CallLog,
}

#[async_trait]
impl Program for ParentProgram {
    fn name(&self) -> &str {
        "parent"
    }

    fn labels(&self) -> &[&str] {
        &["start", "wait", "destroy"]
    }

    fn teardown_label(&self) -> Option<&str> {
        Some("destroy")
    }

    async fn run(&self, label: &str, cx: &mut TickContext<'_>) -> anyhow::Result<Outcome> {
        record(&self.log, "parent", label);
        let mut locals: ParentLocals = cx.locals()?;
        match label {
            "start" => {
                for _ in 0..locals.children {
                    cx.bud("child", "start", json!({})).await?;
                }
                Ok(Outcome::hop("wait"))
            }
            "wait" => {
                cx.donate().await?;
                for reaped in cx.reap().await? {
                    locals.reaped.push(reaped.exit_value);
                }
                cx.set_locals(&locals)?;
                if cx.children().await?.is_empty() {
                    Ok(Outcome::exit(json!({"reaped": locals.reaped})))
                } else if cx.is_leaf().await? {
                    Ok(Outcome::nap(30))
                } else {
                    Ok(Outcome::nap(0))
                }
            }
            "destroy" => {
                for child in cx.children().await? {
                    if child.exit_value.is_none() && !child.stuck {
                        cx.raise_signal(child.id, signal::DESTROY).await?;
                    }
                }
                cx.donate().await?;
                cx.reap().await?;
                if cx.children().await?.is_empty() {
                    Ok(Outcome::exit(json!({"msg": "destroyed"})))
                } else if cx.is_leaf().await? {
                    // Remaining children are stuck or waiting on real time;
                    // poll instead of spinning.
                    Ok(Outcome::nap(30))
                } else {
                    Ok(Outcome::nap(0))
                }
            }
            other => anyhow::bail!("unhandled label {other}"),
        }
    }
}

/// Two-tick child used by [`ParentProgram`].
pub struct ChildProgram {
    pub log: CallLog,
}

#[async_trait]
impl Program for ChildProgram {
    fn name(&self) -> &str {
        "child"
    }

    fn labels(&self) -> &[&str] {
        &["start", "work", "destroy"]
    }

    fn teardown_label(&self) -> Option<&str> {
        Some("destroy")
    }

    async fn run(&self, label: &str, _cx: &mut TickContext<'_>) -> anyhow::Result<Outcome> {
        record(&self.log, "child", label);
        match label {
            "start" => Ok(Outcome::hop("work")),
            "work" => Ok(Outcome::exit(json!({"msg": "done"}))),
            "destroy" => Ok(Outcome::exit(json!({"msg": "aborted"}))),
            other => anyhow::bail!("unhandled label {other}"),
        }
    }
}

/// Long-lived waiter with a teardown label, for destroy-interception tests.
pub struct HolderProgram {
    pub log: CallLog,
}

#[async_trait]
impl Program for HolderProgram {
    fn name(&self) -> &str {
        "holder"
    }

    fn labels(&self) -> &[&str] {
        &["wait", "teardown"]
    }

    fn teardown_label(&self) -> Option<&str> {
        Some("teardown")
    }

    async fn run(&self, label: &str, _cx: &mut TickContext<'_>) -> anyhow::Result<Outcome> {
        record(&self.log, "holder", label);
        match label {
            "wait" => Ok(Outcome::nap(0)),
            "teardown" => Ok(Outcome::exit(json!({"msg": "torn down"}))),
            other => anyhow::bail!("unhandled label {other}"),
        }
    }
}

/// Donates once and exits with the report, exposing what the donate loop
/// did for assertions.
pub struct ObserverProgram;

#[async_trait]
impl Program for ObserverProgram {
    fn name(&self) -> &str {
        "observer"
    }

    fn labels(&self) -> &[&str] {
        &["watch"]
    }

    async fn run(&self, _label: &str, cx: &mut TickContext<'_>) -> anyhow::Result<Outcome> {
        let report = cx.donate().await?;
        Ok(Outcome::exit(json!({
            "rounds": report.rounds,
            "ticks": report.ticks,
            "settled": report.settled,
        })))
    }
}

/// Always fails; exercises backoff and the stuck escalation.
pub struct FlakyProgram;

#[async_trait]
impl Program for FlakyProgram {
    fn name(&self) -> &str {
        "flaky"
    }

    fn labels(&self) -> &[&str] {
        &["start"]
    }

    async fn run(&self, _label: &str, _cx: &mut TickContext<'_>) -> anyhow::Result<Outcome> {
        anyhow::bail!("upstream service unavailable")
    }
}

/// Registers an already-expired deadline on its stall label.
pub struct SlowpokeProgram;

#[async_trait]
impl Program for SlowpokeProgram {
    fn name(&self) -> &str {
        "slowpoke"
    }

    fn labels(&self) -> &[&str] {
        &["start", "stall"]
    }

    async fn run(&self, label: &str, cx: &mut TickContext<'_>) -> anyhow::Result<Outcome> {
        match label {
            "start" => {
                cx.register_deadline(Some("stall"), std::time::Duration::ZERO);
                Ok(Outcome::hop("stall"))
            }
            "stall" => Ok(Outcome::nap(0)),
            other => anyhow::bail!("unhandled label {other}"),
        }
    }
}
