// Copyright (C) 2025 Filament Cloud Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory strand store.
//!
//! Backs the engine in tests and embedded scenarios where no database is
//! available. Implements the same lease and signal semantics as the
//! PostgreSQL backend, including cascading deletes of descendants.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::EngineError;
use crate::strand::{Frame, Strand, StrandId};

use super::{NewStrand, StrandStore};

#[derive(Default)]
struct Inner {
    strands: HashMap<StrandId, Strand>,
    signals: HashSet<(StrandId, String)>,
}

/// In-memory implementation of [`StrandStore`].
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of strands currently held (finished ones included).
    pub fn strand_count(&self) -> usize {
        self.inner.lock().unwrap().strands.len()
    }

    fn eligible(strand: &Strand, now: DateTime<Utc>) -> bool {
        strand.exit_value.is_none() && !strand.stuck && strand.scheduled_at <= now
    }

    fn lease_open(strand: &Strand, worker: &str, now: DateTime<Utc>) -> bool {
        match (&strand.lease_owner, strand.lease_expires_at) {
            (Some(owner), Some(expiry)) => owner == worker || expiry <= now,
            _ => true,
        }
    }

    fn collect_subtree(inner: &Inner, id: StrandId, out: &mut Vec<StrandId>) {
        out.push(id);
        let children: Vec<StrandId> = inner
            .strands
            .values()
            .filter(|s| s.parent_id == Some(id))
            .map(|s| s.id)
            .collect();
        for child in children {
            Self::collect_subtree(inner, child, out);
        }
    }
}

#[async_trait]
impl StrandStore for MemoryStore {
    async fn create_strand(&self, new: NewStrand) -> Result<Strand, EngineError> {
        let now = Utc::now();
        let frame = Frame::new(new.program.clone(), new.label.clone(), new.locals);
        let strand = Strand {
            id: Uuid::new_v4(),
            parent_id: new.parent_id,
            program: new.program,
            label: new.label,
            stack: vec![frame],
            scheduled_at: now,
            lease_owner: None,
            lease_expires_at: None,
            exit_value: None,
            deadlines: Vec::new(),
            consecutive_failures: 0,
            stuck: false,
            last_error: None,
            created_at: now,
        };

        let mut inner = self.inner.lock().unwrap();
        if let Some(parent) = new.parent_id
            && !inner.strands.contains_key(&parent)
        {
            return Err(EngineError::StrandNotFound { strand_id: parent });
        }
        inner.strands.insert(strand.id, strand.clone());
        Ok(strand)
    }

    async fn load_strand(&self, id: StrandId) -> Result<Option<Strand>, EngineError> {
        Ok(self.inner.lock().unwrap().strands.get(&id).cloned())
    }

    async fn save_strand(&self, strand: &Strand) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().unwrap();
        let existing = inner
            .strands
            .get_mut(&strand.id)
            .ok_or(EngineError::StrandNotFound { strand_id: strand.id })?;

        // Everything except the lease columns, which acquire/release own.
        existing.program = strand.program.clone();
        existing.label = strand.label.clone();
        existing.stack = strand.stack.clone();
        existing.scheduled_at = strand.scheduled_at;
        existing.exit_value = strand.exit_value.clone();
        existing.deadlines = strand.deadlines.clone();
        existing.consecutive_failures = strand.consecutive_failures;
        existing.stuck = strand.stuck;
        existing.last_error = strand.last_error.clone();
        Ok(())
    }

    async fn delete_strand(&self, id: StrandId) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().unwrap();
        let mut subtree = Vec::new();
        Self::collect_subtree(&inner, id, &mut subtree);
        for sid in subtree {
            inner.strands.remove(&sid);
            inner.signals.retain(|(target, _)| *target != sid);
        }
        Ok(())
    }

    async fn children_of(&self, id: StrandId) -> Result<Vec<Strand>, EngineError> {
        let inner = self.inner.lock().unwrap();
        let mut children: Vec<Strand> = inner
            .strands
            .values()
            .filter(|s| s.parent_id == Some(id))
            .cloned()
            .collect();
        children.sort_by_key(|s| s.created_at);
        Ok(children)
    }

    async fn due_strands(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<StrandId>, EngineError> {
        let inner = self.inner.lock().unwrap();
        let mut due: Vec<&Strand> = inner
            .strands
            .values()
            .filter(|s| {
                Self::eligible(s, now)
                    && s.lease_expires_at.is_none_or(|expiry| expiry <= now)
            })
            .collect();
        due.sort_by_key(|s| s.scheduled_at);
        Ok(due
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|s| s.id)
            .collect())
    }

    async fn acquire_lease(
        &self,
        id: StrandId,
        worker: &str,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Option<Strand>, EngineError> {
        let mut inner = self.inner.lock().unwrap();
        let strand = inner
            .strands
            .get_mut(&id)
            .ok_or(EngineError::StrandNotFound { strand_id: id })?;

        if !Self::lease_open(strand, worker, now) {
            return Ok(None);
        }
        strand.lease_owner = Some(worker.to_string());
        strand.lease_expires_at = Some(until);
        Ok(Some(strand.clone()))
    }

    async fn release_lease(&self, id: StrandId, worker: &str) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(strand) = inner.strands.get_mut(&id)
            && strand.lease_owner.as_deref() == Some(worker)
        {
            strand.lease_owner = None;
            strand.lease_expires_at = None;
        }
        Ok(())
    }

    async fn raise_signal(&self, id: StrandId, name: &str) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.strands.contains_key(&id) {
            return Err(EngineError::StrandNotFound { strand_id: id });
        }
        inner.signals.insert((id, name.to_string()));
        Ok(())
    }

    async fn consume_signal(&self, id: StrandId, name: &str) -> Result<bool, EngineError> {
        let mut inner = self.inner.lock().unwrap();
        Ok(inner.signals.remove(&(id, name.to_string())))
    }

    async fn signal_pending(&self, id: StrandId, name: &str) -> Result<bool, EngineError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.signals.contains(&(id, name.to_string())))
    }

    async fn descendants_with_work(
        &self,
        id: StrandId,
        now: DateTime<Utc>,
    ) -> Result<bool, EngineError> {
        let inner = self.inner.lock().unwrap();
        let mut subtree = Vec::new();
        Self::collect_subtree(&inner, id, &mut subtree);
        Ok(subtree
            .into_iter()
            .filter(|sid| *sid != id)
            .filter_map(|sid| inner.strands.get(&sid))
            .any(|s| Self::eligible(s, now)))
    }

    async fn health_check(&self) -> Result<bool, EngineError> {
        Ok(true)
    }
}
