// Copyright (C) 2025 Filament Cloud Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Database migrations for filament-core.
//!
//! This module exposes embedded migrations that can be run programmatically.
//! Daemons embedding the engine call these to set up the strand schema.
//!
//! # Example
//!
//! ```ignore
//! use sqlx::PgPool;
//! use filament_core::migrations;
//!
//! let pool = PgPool::connect(&database_url).await?;
//! migrations::run_postgres(&pool).await?;
//! ```

use sqlx::migrate::MigrateError;

/// PostgreSQL migrator with all strand-store migrations embedded.
pub static POSTGRES: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/postgresql");

/// Run PostgreSQL migrations.
///
/// Applies all pending migrations to the database. Safe to call multiple
/// times; already-applied migrations are skipped.
pub async fn run_postgres(pool: &sqlx::PgPool) -> Result<(), MigrateError> {
    POSTGRES.run(pool).await
}
