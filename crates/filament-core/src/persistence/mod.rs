// Copyright (C) 2025 Filament Cloud Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for filament-core.
//!
//! This module defines the strand store abstraction and backend
//! implementations. All coordination between dispatcher workers happens
//! through this store; there is no in-memory sharing between workers.

pub mod memory;
pub mod postgres;

pub use self::memory::MemoryStore;
pub use self::postgres::PostgresStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::EngineError;
use crate::strand::{Strand, StrandId};

/// Parameters for creating a new strand.
#[derive(Debug, Clone)]
pub struct NewStrand {
    /// Owning strand, or `None` for a root.
    pub parent_id: Option<StrandId>,
    /// Program that owns the strand.
    pub program: String,
    /// Initial label of the root frame.
    pub label: String,
    /// Initial locals of the root frame.
    pub locals: serde_json::Value,
}

impl NewStrand {
    /// Convenience constructor for a root strand.
    pub fn root(
        program: impl Into<String>,
        label: impl Into<String>,
        locals: serde_json::Value,
    ) -> Self {
        Self {
            parent_id: None,
            program: program.into(),
            label: label.into(),
            locals,
        }
    }

    /// Convenience constructor for a child strand.
    pub fn child(
        parent_id: StrandId,
        program: impl Into<String>,
        label: impl Into<String>,
        locals: serde_json::Value,
    ) -> Self {
        Self {
            parent_id: Some(parent_id),
            program: program.into(),
            label: label.into(),
            locals,
        }
    }
}

/// Durable strand store used by the dispatcher and by program contexts.
///
/// The store is the only resource shared across workers. Lease acquisition
/// through [`acquire_lease`](Self::acquire_lease) is the sole locking
/// primitive: it must succeed when the lease is absent, expired, or already
/// held by the requesting worker, and must reject a live lease held by a
/// different worker.
#[allow(missing_docs)]
#[async_trait]
pub trait StrandStore: Send + Sync {
    /// Create and persist a new strand with a single root frame, scheduled
    /// to run immediately.
    async fn create_strand(&self, new: NewStrand) -> Result<Strand, EngineError>;

    async fn load_strand(&self, id: StrandId) -> Result<Option<Strand>, EngineError>;

    /// Persist the mutable execution state of a strand in one atomic write:
    /// program, label, stack, scheduled_at, exit_value, deadlines, and
    /// failure bookkeeping all change together or not at all.
    ///
    /// Lease columns are deliberately not written here; they are owned by
    /// [`acquire_lease`](Self::acquire_lease) / [`release_lease`](Self::release_lease).
    async fn save_strand(&self, strand: &Strand) -> Result<(), EngineError>;

    /// Remove a strand record. Signals attached to it are removed with it.
    async fn delete_strand(&self, id: StrandId) -> Result<(), EngineError>;

    async fn children_of(&self, id: StrandId) -> Result<Vec<Strand>, EngineError>;

    /// IDs of strands eligible to run at `now`: due, not finished, not stuck,
    /// and not under a live lease. Ordered by `scheduled_at`.
    async fn due_strands(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<StrandId>, EngineError>;

    /// Atomically acquire (or re-acquire) the execution lease on a strand.
    ///
    /// Returns the freshly loaded strand on success, `None` when another
    /// worker holds a live lease.
    async fn acquire_lease(
        &self,
        id: StrandId,
        worker: &str,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Option<Strand>, EngineError>;

    /// Release the lease if `worker` still holds it. Releasing a lease that
    /// was already taken over by another worker is a no-op.
    async fn release_lease(&self, id: StrandId, worker: &str) -> Result<(), EngineError>;

    /// Raise a named signal on a strand. Saturating: raising an already
    /// pending signal leaves exactly one pending observation.
    ///
    /// This is the only legitimate external write to a running strand.
    async fn raise_signal(&self, id: StrandId, name: &str) -> Result<(), EngineError>;

    /// Consume a pending signal, returning whether one was pending.
    async fn consume_signal(&self, id: StrandId, name: &str) -> Result<bool, EngineError>;

    /// Check whether a signal is pending without consuming it.
    async fn signal_pending(&self, id: StrandId, name: &str) -> Result<bool, EngineError>;

    /// Whether any descendant of `id` (recursively) has work eligible at
    /// `now`. Used to decide when a `donate` loop should stop.
    async fn descendants_with_work(
        &self,
        id: StrandId,
        now: DateTime<Utc>,
    ) -> Result<bool, EngineError>;

    /// Verify the backing store is reachable.
    async fn health_check(&self) -> Result<bool, EngineError>;
}
