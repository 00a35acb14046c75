// Copyright (C) 2025 Filament Cloud Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Program contract and the control-flow runtime handed to handlers.
//!
//! A [`Program`] is a long-running workflow written against the engine: one
//! handler per label, each returning exactly one [`Outcome`] per tick.
//! Handlers receive a [`TickContext`] with the working strand plus the
//! primitives for composition: `bud` (spawn a child strand), `reap` (collect
//! finished children), `donate` (advance children within the same tick),
//! signal checks, and deadline registration.
//!
//! Programs are registered in a [`ProgramRegistry`]; the registry validates
//! declared labels up front so a hop or push to an undeclared label is caught
//! by the dispatcher instead of silently looping.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::dispatcher::{Dispatcher, DonateReport};
use crate::error::EngineError;
use crate::persistence::NewStrand;
use crate::signal;
use crate::strand::{Strand, StrandId};

/// The outcome a handler reports for one tick. Mutually exclusive; the
/// dispatcher persists it and ends the tick.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Retarget the active frame to a new label. The new label's handler
    /// runs on the next dispatch pass, never on the same tick.
    Hop(String),

    /// Leave the label unchanged and defer eligibility by the given
    /// duration. Zero means "eligible again immediately".
    Nap(Duration),

    /// Append a new frame on top of the stack; it becomes active next tick.
    /// An in-process subroutine call with its own locals and label sequence.
    Push {
        /// Program the new frame executes.
        program: String,
        /// Initial label of the new frame.
        label: String,
        /// Initial locals of the new frame.
        locals: serde_json::Value,
    },

    /// Complete the active frame with a value. Pops back to the frame
    /// beneath when one exists; completes the strand otherwise.
    Exit(serde_json::Value),
}

impl Outcome {
    /// Retarget the active frame to `label`.
    pub fn hop(label: impl Into<String>) -> Self {
        Self::Hop(label.into())
    }

    /// Recheck after `seconds`. `0` pumps the strand without deferral.
    pub fn nap(seconds: u64) -> Self {
        Self::Nap(Duration::from_secs(seconds))
    }

    /// Push a subroutine frame.
    pub fn push(
        program: impl Into<String>,
        label: impl Into<String>,
        locals: serde_json::Value,
    ) -> Self {
        Self::Push {
            program: program.into(),
            label: label.into(),
            locals,
        }
    }

    /// Complete the active frame with `value`.
    pub fn exit(value: serde_json::Value) -> Self {
        Self::Exit(value)
    }
}

/// A collected child result from [`TickContext::reap`].
#[derive(Debug, Clone, PartialEq)]
pub struct Reaped {
    /// The reaped child's identifier (its record is deleted).
    pub id: StrandId,
    /// Program the child ran.
    pub program: String,
    /// The child's exit value.
    pub exit_value: serde_json::Value,
}

/// A workflow implementation: one handler per declared label.
///
/// Handlers read and write only their own top frame's locals plus whatever
/// domain records the program owns; cross-strand communication goes through
/// signals, `bud`, and `reap`.
#[async_trait]
pub trait Program: Send + Sync {
    /// Unique program name used in strand records.
    fn name(&self) -> &str;

    /// Every label this program's handlers answer to. Hops and pushes are
    /// validated against this list.
    fn labels(&self) -> &[&str];

    /// The terminal teardown label, if the program has one. Drives the
    /// default `destroy` interception in [`before_run`](Self::before_run).
    fn teardown_label(&self) -> Option<&str> {
        None
    }

    /// Pre-tick hook, run before the label handler on every tick.
    ///
    /// The default implementation implements cooperative cancellation: when
    /// the `destroy` signal is pending and the strand is not already in the
    /// teardown label, it consumes the signal and forces a hop there -
    /// an at-most-once priority interrupt, pre-empting whatever label the
    /// strand was in.
    ///
    /// While a pushed subroutine frame is active, a pending `destroy`
    /// instead cancels the subroutine frame and is deliberately left
    /// unconsumed: frames unwind one per tick until the root frame is
    /// active, and only there is the signal consumed and the teardown hop
    /// performed, so the strand always exits from its root frame.
    /// Returning `Some(outcome)` skips the handler this tick.
    async fn before_run(&self, cx: &mut TickContext<'_>) -> anyhow::Result<Option<Outcome>> {
        if cx.strand().stack.len() > 1 {
            if cx.signal_pending(signal::DESTROY).await? {
                debug!(strand_id = %cx.strand().id, label = %cx.strand().label,
                       "destroy pending, canceling subroutine frame");
                return Ok(Some(Outcome::exit(serde_json::json!({"canceled": true}))));
            }
            return Ok(None);
        }
        if let Some(teardown) = self.teardown_label()
            && cx.strand().label != teardown
            && cx.check_and_consume(signal::DESTROY).await?
        {
            debug!(strand_id = %cx.strand().id, teardown, "destroy signal intercepted");
            return Ok(Some(Outcome::hop(teardown)));
        }
        Ok(None)
    }

    /// Invoke the handler bound to `label`.
    ///
    /// An `Err` leaves the persisted strand untouched; the dispatcher records
    /// the error and reschedules with backoff.
    async fn run(&self, label: &str, cx: &mut TickContext<'_>) -> anyhow::Result<Outcome>;
}

/// Explicit mapping from program name to implementation.
///
/// Registration validates the declared label set so misconfigured programs
/// fail at startup rather than at dispatch time.
#[derive(Default)]
pub struct ProgramRegistry {
    programs: HashMap<String, Arc<dyn Program>>,
}

impl ProgramRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a program, validating its declared labels.
    pub fn register(&mut self, program: Arc<dyn Program>) -> Result<(), EngineError> {
        let name = program.name().to_string();
        if name.is_empty() {
            return Err(EngineError::ValidationError {
                field: "program".to_string(),
                message: "program name must not be empty".to_string(),
            });
        }
        if program.labels().is_empty() {
            return Err(EngineError::ValidationError {
                field: "labels".to_string(),
                message: format!("program '{}' declares no labels", name),
            });
        }
        if let Some(teardown) = program.teardown_label()
            && !program.labels().contains(&teardown)
        {
            return Err(EngineError::UnknownLabel {
                program: name,
                label: teardown.to_string(),
            });
        }
        if self.programs.contains_key(&name) {
            return Err(EngineError::ValidationError {
                field: "program".to_string(),
                message: format!("program '{}' registered twice", name),
            });
        }
        self.programs.insert(name, program);
        Ok(())
    }

    /// Look up a program by name.
    pub fn get(&self, name: &str) -> Result<&Arc<dyn Program>, EngineError> {
        self.programs
            .get(name)
            .ok_or_else(|| EngineError::ProgramNotFound {
                program: name.to_string(),
            })
    }

    /// Verify that `program` declares `label`.
    pub fn declares(&self, program: &str, label: &str) -> Result<(), EngineError> {
        if self.get(program)?.labels().contains(&label) {
            Ok(())
        } else {
            Err(EngineError::UnknownLabel {
                program: program.to_string(),
                label: label.to_string(),
            })
        }
    }

    /// Registered program names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.programs.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Execution context handed to a handler for one tick.
///
/// Holds the working copy of the strand; mutations are persisted by the
/// dispatcher only when the handler returns `Ok`, so an erroring tick leaves
/// the durable record untouched.
pub struct TickContext<'a> {
    dispatcher: &'a Dispatcher,
    worker: &'a str,
    now: DateTime<Utc>,
    strand: Strand,
}

impl<'a> TickContext<'a> {
    pub(crate) fn new(
        dispatcher: &'a Dispatcher,
        worker: &'a str,
        now: DateTime<Utc>,
        strand: Strand,
    ) -> Self {
        Self {
            dispatcher,
            worker,
            now,
            strand,
        }
    }

    pub(crate) fn into_strand(self) -> Strand {
        self.strand
    }

    /// The working strand.
    pub fn strand(&self) -> &Strand {
        &self.strand
    }

    /// Mutable access to the working strand.
    pub fn strand_mut(&mut self) -> &mut Strand {
        &mut self.strand
    }

    /// The tick's wall-clock time (fixed for the whole tick).
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// Deserialize the active frame's locals into the program's own type.
    pub fn locals<T: DeserializeOwned>(&self) -> Result<T, EngineError> {
        Ok(serde_json::from_value(
            self.strand.top_frame().locals.clone(),
        )?)
    }

    /// Serialize `locals` back into the active frame.
    pub fn set_locals<T: Serialize>(&mut self, locals: &T) -> Result<(), EngineError> {
        self.strand.top_frame_mut().locals = serde_json::to_value(locals)?;
        Ok(())
    }

    /// The exit value of the most recently popped subroutine frame, if any.
    pub fn retval(&self) -> Option<&serde_json::Value> {
        self.strand.top_frame().retval.as_ref()
    }

    /// Take (and clear) the pending subroutine exit value.
    pub fn take_retval(&mut self) -> Option<serde_json::Value> {
        self.strand.top_frame_mut().retval.take()
    }

    /// Record that the strand must have left `label` (or completed, when
    /// `None`) within `within` from now. Overrun marks the strand stuck.
    pub fn register_deadline(&mut self, label: Option<&str>, within: Duration) {
        let within = chrono::Duration::from_std(within)
            .unwrap_or_else(|_| chrono::Duration::seconds(u32::MAX as i64));
        let at = self.now + within;
        self.strand.register_deadline(label, at);
    }

    /// Create and persist a child strand, returning its identifier.
    ///
    /// The child is not advanced here; the dispatcher (or a later
    /// [`donate`](Self::donate)) picks it up.
    pub async fn bud(
        &self,
        program: &str,
        label: &str,
        locals: serde_json::Value,
    ) -> Result<StrandId, EngineError> {
        self.dispatcher.registry().declares(program, label)?;
        let child = self
            .dispatcher
            .store()
            .create_strand(NewStrand::child(self.strand.id, program, label, locals))
            .await?;
        debug!(strand_id = %self.strand.id, child_id = %child.id, program, "budded child strand");
        Ok(child.id)
    }

    /// The caller's direct children.
    pub async fn children(&self) -> Result<Vec<Strand>, EngineError> {
        self.dispatcher.store().children_of(self.strand.id).await
    }

    /// Collect exit values of finished children and delete their records.
    ///
    /// Children still running are left untouched.
    pub async fn reap(&self) -> Result<Vec<Reaped>, EngineError> {
        let mut reaped = Vec::new();
        for child in self.children().await? {
            if let Some(exit_value) = child.exit_value {
                self.dispatcher.store().delete_strand(child.id).await?;
                reaped.push(Reaped {
                    id: child.id,
                    program: child.program,
                    exit_value,
                });
            }
        }
        Ok(reaped)
    }

    /// Whether no descendant has work eligible before the next real time
    /// step. A true result means a donate loop should stop retrying.
    pub async fn is_leaf(&self) -> Result<bool, EngineError> {
        Ok(!self
            .dispatcher
            .store()
            .descendants_with_work(self.strand.id, self.now)
            .await?)
    }

    /// Cooperatively advance eligible children within this tick.
    ///
    /// Runs the dispatch step directly on each eligible child, repeating
    /// until the subtree is a leaf or the configured round bound is reached.
    /// Trades a longer tick for lower latency on hierarchical fan-out.
    pub async fn donate(&self) -> Result<DonateReport, EngineError> {
        self.dispatcher
            .advance_children(self.worker, self.strand.id)
            .await
    }

    /// Check whether a signal is pending without acknowledging it.
    pub async fn signal_pending(&self, name: &str) -> Result<bool, EngineError> {
        self.dispatcher
            .store()
            .signal_pending(self.strand.id, name)
            .await
    }

    /// Acknowledge-and-clear a pending signal, returning whether one was
    /// pending. Raising twice before one consumption observes as once.
    pub async fn check_and_consume(&self, name: &str) -> Result<bool, EngineError> {
        self.dispatcher
            .store()
            .consume_signal(self.strand.id, name)
            .await
    }

    /// Raise a signal on another strand (typically a child, e.g. propagating
    /// `destroy` during teardown).
    pub async fn raise_signal(&self, target: StrandId, name: &str) -> Result<(), EngineError> {
        self.dispatcher.store().raise_signal(target, name).await
    }
}
