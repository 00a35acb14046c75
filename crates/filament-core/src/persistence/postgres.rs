// Copyright (C) 2025 Filament Cloud Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed strand store.
//!
//! Stacks, deadlines, and exit values are stored as JSONB. Lease acquisition
//! is a single conditional UPDATE, which is the engine's only locking
//! primitive across workers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::EngineError;
use crate::strand::{Deadline, Frame, Strand, StrandId};

use super::{NewStrand, StrandStore};

/// Row shape of the `strands` table.
#[derive(Debug, sqlx::FromRow)]
struct StrandRow {
    id: Uuid,
    parent_id: Option<Uuid>,
    program: String,
    label: String,
    stack: serde_json::Value,
    scheduled_at: DateTime<Utc>,
    lease_owner: Option<String>,
    lease_expires_at: Option<DateTime<Utc>>,
    exit_value: Option<serde_json::Value>,
    deadlines: serde_json::Value,
    consecutive_failures: i32,
    stuck: bool,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
}

impl StrandRow {
    fn into_strand(self) -> Result<Strand, EngineError> {
        let stack: Vec<Frame> = serde_json::from_value(self.stack)?;
        let deadlines: Vec<Deadline> = serde_json::from_value(self.deadlines)?;
        Ok(Strand {
            id: self.id,
            parent_id: self.parent_id,
            program: self.program,
            label: self.label,
            stack,
            scheduled_at: self.scheduled_at,
            lease_owner: self.lease_owner,
            lease_expires_at: self.lease_expires_at,
            exit_value: self.exit_value,
            deadlines,
            consecutive_failures: self.consecutive_failures,
            stuck: self.stuck,
            last_error: self.last_error,
            created_at: self.created_at,
        })
    }
}

const STRAND_COLUMNS: &str = "id, parent_id, program, label, stack, scheduled_at, \
     lease_owner, lease_expires_at, exit_value, deadlines, \
     consecutive_failures, stuck, last_error, created_at";

/// PostgreSQL implementation of [`StrandStore`].
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new store from an existing connection pool.
    ///
    /// Callers are expected to have applied the schema beforehand, e.g. via
    /// [`migrations::run_postgres`](crate::migrations::run_postgres).
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StrandStore for PostgresStore {
    async fn create_strand(&self, new: NewStrand) -> Result<Strand, EngineError> {
        let id = Uuid::new_v4();
        let frame = Frame::new(new.program.clone(), new.label.clone(), new.locals);
        let stack = serde_json::to_value(vec![frame])?;

        let row = sqlx::query_as::<_, StrandRow>(&format!(
            r#"
            INSERT INTO strands (id, parent_id, program, label, stack, scheduled_at, deadlines)
            VALUES ($1, $2, $3, $4, $5, now(), '[]'::jsonb)
            RETURNING {STRAND_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(new.parent_id)
        .bind(&new.program)
        .bind(&new.label)
        .bind(&stack)
        .fetch_one(&self.pool)
        .await?;

        row.into_strand()
    }

    async fn load_strand(&self, id: StrandId) -> Result<Option<Strand>, EngineError> {
        let row = sqlx::query_as::<_, StrandRow>(&format!(
            r#"
            SELECT {STRAND_COLUMNS}
            FROM strands
            WHERE id = $1
            "#
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(StrandRow::into_strand).transpose()
    }

    async fn save_strand(&self, strand: &Strand) -> Result<(), EngineError> {
        let stack = serde_json::to_value(&strand.stack)?;
        let deadlines = serde_json::to_value(&strand.deadlines)?;

        let result = sqlx::query(
            r#"
            UPDATE strands
            SET program = $2,
                label = $3,
                stack = $4,
                scheduled_at = $5,
                exit_value = $6,
                deadlines = $7,
                consecutive_failures = $8,
                stuck = $9,
                last_error = $10
            WHERE id = $1
            "#,
        )
        .bind(strand.id)
        .bind(&strand.program)
        .bind(&strand.label)
        .bind(&stack)
        .bind(strand.scheduled_at)
        .bind(&strand.exit_value)
        .bind(&deadlines)
        .bind(strand.consecutive_failures)
        .bind(strand.stuck)
        .bind(&strand.last_error)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::StrandNotFound {
                strand_id: strand.id,
            });
        }
        Ok(())
    }

    async fn delete_strand(&self, id: StrandId) -> Result<(), EngineError> {
        // Descendants and signals go with it via ON DELETE CASCADE
        sqlx::query("DELETE FROM strands WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn children_of(&self, id: StrandId) -> Result<Vec<Strand>, EngineError> {
        let rows = sqlx::query_as::<_, StrandRow>(&format!(
            r#"
            SELECT {STRAND_COLUMNS}
            FROM strands
            WHERE parent_id = $1
            ORDER BY created_at ASC
            "#
        ))
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(StrandRow::into_strand).collect()
    }

    async fn due_strands(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<StrandId>, EngineError> {
        let ids: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT id
            FROM strands
            WHERE scheduled_at <= $1
              AND exit_value IS NULL
              AND NOT stuck
              AND (lease_expires_at IS NULL OR lease_expires_at <= $1)
            ORDER BY scheduled_at ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    async fn acquire_lease(
        &self,
        id: StrandId,
        worker: &str,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Option<Strand>, EngineError> {
        let row = sqlx::query_as::<_, StrandRow>(&format!(
            r#"
            UPDATE strands
            SET lease_owner = $2,
                lease_expires_at = $3
            WHERE id = $1
              AND (lease_expires_at IS NULL
                   OR lease_expires_at <= $4
                   OR lease_owner = $2)
            RETURNING {STRAND_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(worker)
        .bind(until)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        row.map(StrandRow::into_strand).transpose()
    }

    async fn release_lease(&self, id: StrandId, worker: &str) -> Result<(), EngineError> {
        sqlx::query(
            r#"
            UPDATE strands
            SET lease_owner = NULL,
                lease_expires_at = NULL
            WHERE id = $1
              AND lease_owner = $2
            "#,
        )
        .bind(id)
        .bind(worker)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn raise_signal(&self, id: StrandId, name: &str) -> Result<(), EngineError> {
        let result = sqlx::query(
            r#"
            INSERT INTO strand_signals (strand_id, name, created_at)
            SELECT id, $2, now() FROM strands WHERE id = $1
            ON CONFLICT (strand_id, name) DO NOTHING
            "#,
        )
        .bind(id)
        .bind(name)
        .execute(&self.pool)
        .await?;

        // Saturating: zero rows means either "already pending" or "no such
        // strand"; distinguish the latter for the caller.
        if result.rows_affected() == 0 {
            let exists: (bool,) =
                sqlx::query_as("SELECT EXISTS(SELECT 1 FROM strands WHERE id = $1)")
                    .bind(id)
                    .fetch_one(&self.pool)
                    .await?;
            if !exists.0 {
                return Err(EngineError::StrandNotFound { strand_id: id });
            }
        }
        Ok(())
    }

    async fn consume_signal(&self, id: StrandId, name: &str) -> Result<bool, EngineError> {
        let result = sqlx::query(
            r#"
            DELETE FROM strand_signals
            WHERE strand_id = $1 AND name = $2
            "#,
        )
        .bind(id)
        .bind(name)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn signal_pending(&self, id: StrandId, name: &str) -> Result<bool, EngineError> {
        let row: (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM strand_signals
                WHERE strand_id = $1 AND name = $2
            )
            "#,
        )
        .bind(id)
        .bind(name)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.0)
    }

    async fn descendants_with_work(
        &self,
        id: StrandId,
        now: DateTime<Utc>,
    ) -> Result<bool, EngineError> {
        let row: (bool,) = sqlx::query_as(
            r#"
            WITH RECURSIVE descendants AS (
                SELECT id FROM strands WHERE parent_id = $1
                UNION ALL
                SELECT s.id
                FROM strands s
                JOIN descendants d ON s.parent_id = d.id
            )
            SELECT EXISTS(
                SELECT 1
                FROM strands s
                JOIN descendants d ON s.id = d.id
                WHERE s.exit_value IS NULL
                  AND NOT s.stuck
                  AND s.scheduled_at <= $2
            )
            "#,
        )
        .bind(id)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.0)
    }

    async fn health_check(&self) -> Result<bool, EngineError> {
        let row: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await?;
        Ok(row.0 == 1)
    }
}
