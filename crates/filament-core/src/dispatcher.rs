// Copyright (C) 2025 Filament Cloud Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Dispatcher: turns due strands into forward progress, one tick at a time.
//!
//! Each worker loop polls the store for due, unleased strands, takes a
//! time-bounded lease on one, runs the handler bound to its top frame, and
//! persists the outcome. The conditional lease acquisition is the only
//! concurrency-safety mechanism between workers; a crashed worker's orphaned
//! lease expires on its own and another worker resumes the strand.
//!
//! A tick either fully commits its outcome or is treated as not having
//! happened: an unhandled handler error discards the working copy and only
//! records failure bookkeeping against the pristine strand.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::EngineError;
use crate::persistence::StrandStore;
use crate::program::{Outcome, ProgramRegistry, TickContext};
use crate::strand::{Frame, Strand, StrandId};

/// Tuning knobs for the dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// How long an execution lease lives before another worker may take over.
    pub lease_duration: Duration,
    /// How many candidates one scan pass picks up.
    pub batch_size: i64,
    /// Consecutive unhandled failures before a strand is marked stuck.
    pub max_consecutive_failures: i32,
    /// First retry delay after an unhandled handler error; doubles per
    /// consecutive failure.
    pub base_backoff: Duration,
    /// Upper bound on the error backoff.
    pub max_backoff: Duration,
    /// Bound on same-tick child rounds inside a donate call.
    pub max_donate_rounds: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(120),
            batch_size: 16,
            max_consecutive_failures: 10,
            base_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(300),
            max_donate_rounds: 8,
        }
    }
}

impl DispatcherConfig {
    /// Derive dispatcher tuning from the daemon configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            lease_duration: config.lease_duration,
            max_consecutive_failures: config.max_consecutive_failures,
            ..Self::default()
        }
    }
}

/// What one tick did to a strand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickResult {
    /// Handler ran and its outcome was persisted.
    Advanced,
    /// The strand's root frame exited this tick; the strand is complete.
    Completed,
    /// Nothing happened: lease contention, or the strand is finished/stuck.
    Skipped,
    /// Handler error recorded; strand rescheduled with backoff.
    Errored,
    /// Deadline overrun, undeclared label, or repeated failures; the strand
    /// is surfaced for operator attention and not retried.
    Stuck,
}

/// Report of a donate call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DonateReport {
    /// Same-tick rounds performed.
    pub rounds: u32,
    /// Child ticks executed across all rounds.
    pub ticks: usize,
    /// Whether the subtree was a leaf when the loop stopped.
    pub settled: bool,
}

/// Database-backed cooperative scheduler for strands.
///
/// Holds the store and program registry as explicit dependencies; there is
/// no process-wide singleton, so the engine runs against an in-memory store
/// in tests.
pub struct Dispatcher {
    store: Arc<dyn StrandStore>,
    registry: Arc<ProgramRegistry>,
    config: DispatcherConfig,
}

impl Dispatcher {
    /// Create a dispatcher over the given store and registry.
    pub fn new(
        store: Arc<dyn StrandStore>,
        registry: Arc<ProgramRegistry>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            registry,
            config,
        }
    }

    /// The strand store.
    pub fn store(&self) -> &Arc<dyn StrandStore> {
        &self.store
    }

    /// The program registry.
    pub fn registry(&self) -> &Arc<ProgramRegistry> {
        &self.registry
    }

    /// One scan pass for `worker`: pick up due strands and tick each.
    ///
    /// Returns the number of strands that made progress.
    pub async fn scan_once(&self, worker: &str) -> Result<usize, EngineError> {
        let now = Utc::now();
        let due = self.store.due_strands(now, self.config.batch_size).await?;
        let mut progressed = 0;

        for id in due {
            match self.tick(worker, id).await {
                Ok(TickResult::Advanced) | Ok(TickResult::Completed) => progressed += 1,
                Ok(_) => {}
                Err(error) => {
                    // Store-level failure on this strand; others still get
                    // their turn.
                    warn!(strand_id = %id, %error, "tick failed");
                }
            }
        }
        Ok(progressed)
    }

    /// Run one tick of a single strand as `worker`.
    ///
    /// Boxed because donate re-enters the dispatcher for child strands.
    pub fn tick<'a>(
        &'a self,
        worker: &'a str,
        id: StrandId,
    ) -> BoxFuture<'a, Result<TickResult, EngineError>> {
        Box::pin(self.tick_inner(worker, id))
    }

    async fn tick_inner(&self, worker: &str, id: StrandId) -> Result<TickResult, EngineError> {
        let now = Utc::now();
        let until = now + chrono::Duration::from_std(self.config.lease_duration).unwrap_or_else(
            |_| chrono::Duration::seconds(120),
        );

        // 1. Lease acquisition is the sole mutual-exclusion mechanism.
        let Some(mut strand) = self.store.acquire_lease(id, worker, now, until).await? else {
            debug!(strand_id = %id, worker, "lease held elsewhere, skipping");
            return Ok(TickResult::Skipped);
        };

        if strand.is_finished() || strand.stuck {
            self.store.release_lease(id, worker).await?;
            return Ok(TickResult::Skipped);
        }

        // 2. Deadline check before the handler runs; overrun is fatal.
        if let Some(overrun) = expired_deadline(&strand, now) {
            strand.stuck = true;
            strand.last_error = Some(overrun);
            self.store.save_strand(&strand).await?;
            self.store.release_lease(id, worker).await?;
            warn!(strand_id = %id, program = %strand.program, label = %strand.label,
                  "deadline overrun, strand marked stuck");
            return Ok(TickResult::Stuck);
        }
        // A deadline whose target label has been left is satisfied.
        let current_label = strand.label.clone();
        strand
            .deadlines
            .retain(|d| d.label.is_none() || d.label.as_deref() == Some(current_label.as_str()));

        // 3. Resolve the handler; an unregistered program or undeclared
        //    label is a deterministic bug, not a transient failure.
        let program = match self
            .registry
            .get(&strand.program)
            .and_then(|p| {
                self.registry.declares(&strand.program, &strand.label)?;
                Ok(p)
            }) {
            Ok(program) => Arc::clone(program),
            Err(error) => {
                return self.mark_stuck(strand, worker, error.to_string()).await;
            }
        };

        let pristine = strand.clone();
        let label = strand.label.clone();
        let mut cx = TickContext::new(self, worker, now, strand);

        // 4. before_run first (destroy interception), then the label handler.
        let outcome = match program.before_run(&mut cx).await {
            Ok(Some(outcome)) => Ok(outcome),
            Ok(None) => program.run(&label, &mut cx).await,
            Err(error) => Err(error),
        };

        match outcome {
            Ok(outcome) => {
                let strand = cx.into_strand();
                self.apply_outcome(strand, worker, now, outcome).await
            }
            Err(error) => {
                // Working copy discarded; only failure bookkeeping persists.
                drop(cx);
                self.record_failure(pristine, worker, now, format!("{:#}", error))
                    .await
            }
        }
    }

    /// Persist a successful tick outcome and release the lease.
    async fn apply_outcome(
        &self,
        mut strand: Strand,
        worker: &str,
        now: DateTime<Utc>,
        outcome: Outcome,
    ) -> Result<TickResult, EngineError> {
        let mut result = TickResult::Advanced;

        match outcome {
            Outcome::Hop(label) => {
                if let Err(error) = self.registry.declares(&strand.program, &label) {
                    return self.mark_stuck(strand, worker, error.to_string()).await;
                }
                debug!(strand_id = %strand.id, from = %strand.label, to = %label, "hop");
                strand.set_label(&label);
                strand.scheduled_at = now;
            }
            Outcome::Nap(duration) => {
                strand.scheduled_at = now
                    + chrono::Duration::from_std(duration)
                        .unwrap_or_else(|_| chrono::Duration::seconds(u32::MAX as i64));
            }
            Outcome::Push {
                program,
                label,
                locals,
            } => {
                if let Err(error) = self.registry.declares(&program, &label) {
                    return self.mark_stuck(strand, worker, error.to_string()).await;
                }
                debug!(strand_id = %strand.id, program = %program, label = %label, "push frame");
                strand.push_frame(Frame::new(program, label, locals));
                strand.scheduled_at = now;
            }
            Outcome::Exit(value) => {
                if strand.pop_frame(value.clone()).is_some() {
                    // Subroutine return: frame beneath resumes next tick.
                    strand.scheduled_at = now;
                } else {
                    strand.exit_value = Some(value);
                    info!(strand_id = %strand.id, program = %strand.program,
                          root = strand.parent_id.is_none(), "strand completed");
                    result = TickResult::Completed;
                }
            }
        }

        strand.consecutive_failures = 0;
        strand.last_error = None;
        self.store.save_strand(&strand).await?;
        self.store.release_lease(strand.id, worker).await?;
        Ok(result)
    }

    /// Record an unhandled handler error without touching execution state.
    async fn record_failure(
        &self,
        mut strand: Strand,
        worker: &str,
        now: DateTime<Utc>,
        error: String,
    ) -> Result<TickResult, EngineError> {
        strand.consecutive_failures += 1;
        strand.last_error = Some(error.clone());

        let result = if strand.consecutive_failures >= self.config.max_consecutive_failures {
            strand.stuck = true;
            warn!(strand_id = %strand.id, failures = strand.consecutive_failures, %error,
                  "strand exceeded failure threshold, marked stuck");
            TickResult::Stuck
        } else {
            let backoff = self.backoff(strand.consecutive_failures);
            strand.scheduled_at = now
                + chrono::Duration::from_std(backoff)
                    .unwrap_or_else(|_| chrono::Duration::seconds(300));
            warn!(strand_id = %strand.id, failures = strand.consecutive_failures,
                  backoff_secs = backoff.as_secs(), %error, "handler error, rescheduled");
            TickResult::Errored
        };

        self.store.save_strand(&strand).await?;
        self.store.release_lease(strand.id, worker).await?;
        Ok(result)
    }

    async fn mark_stuck(
        &self,
        mut strand: Strand,
        worker: &str,
        error: String,
    ) -> Result<TickResult, EngineError> {
        warn!(strand_id = %strand.id, %error, "strand marked stuck");
        strand.stuck = true;
        strand.last_error = Some(error);
        self.store.save_strand(&strand).await?;
        self.store.release_lease(strand.id, worker).await?;
        Ok(TickResult::Stuck)
    }

    fn backoff(&self, failures: i32) -> Duration {
        let exponent = failures.saturating_sub(1).clamp(0, 16) as u32;
        let delay = self
            .config
            .base_backoff
            .saturating_mul(2u32.saturating_pow(exponent));
        delay.min(self.config.max_backoff)
    }

    /// Cooperatively advance the eligible children of `parent` in-process.
    ///
    /// Runs bounded same-tick rounds; each round ticks every eligible direct
    /// child (a child that donates in turn advances its own subtree). Stops
    /// when the subtree is a leaf, when a round makes no progress, or at the
    /// configured round bound, so fan-out never live-locks a worker.
    pub(crate) async fn advance_children(
        &self,
        worker: &str,
        parent: StrandId,
    ) -> Result<DonateReport, EngineError> {
        let mut rounds = 0;
        let mut ticks = 0;

        while rounds < self.config.max_donate_rounds {
            rounds += 1;
            let now = Utc::now();
            let eligible: Vec<StrandId> = self
                .store
                .children_of(parent)
                .await?
                .into_iter()
                .filter(|child| {
                    !child.is_finished() && !child.stuck && child.scheduled_at <= now
                })
                .map(|child| child.id)
                .collect();

            if eligible.is_empty() {
                break;
            }

            let mut advanced = false;
            for child in eligible {
                match self.tick(worker, child).await? {
                    TickResult::Advanced | TickResult::Completed => {
                        ticks += 1;
                        advanced = true;
                    }
                    _ => {}
                }
            }
            if !advanced {
                break;
            }
            if !self.store.descendants_with_work(parent, Utc::now()).await? {
                break;
            }
        }

        let settled = !self.store.descendants_with_work(parent, Utc::now()).await?;
        debug!(parent_id = %parent, rounds, ticks, settled, "donate finished");
        Ok(DonateReport {
            rounds,
            ticks,
            settled,
        })
    }
}

/// Human-readable description of the first overrun deadline, if any.
fn expired_deadline(strand: &Strand, now: DateTime<Utc>) -> Option<String> {
    strand.deadlines.iter().find_map(|deadline| {
        if now <= deadline.at {
            return None;
        }
        match &deadline.label {
            None if strand.exit_value.is_none() => Some(format!(
                "deadline overrun: strand did not complete by {}",
                deadline.at
            )),
            Some(label) if *label == strand.label => Some(format!(
                "deadline overrun: strand still in label '{}' past {}",
                label, deadline.at
            )),
            _ => None,
        }
    })
}
