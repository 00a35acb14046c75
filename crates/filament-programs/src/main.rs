// Copyright (C) 2025 Filament Cloud Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! filamentd - Filament orchestration daemon
//!
//! Runs the dispatcher worker pool over PostgreSQL with the storage-cluster
//! programs registered. Strands are created externally (API handlers, CLI)
//! through the same database; this process only advances them.

use std::sync::Arc;

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info};

use filament_core::config::Config;
use filament_core::dispatcher::DispatcherConfig;
use filament_core::migrations;
use filament_core::persistence::PostgresStore;
use filament_core::runtime::EngineRuntime;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("filament_core=info".parse().unwrap())
                .add_directive("filament_programs=info".parse().unwrap()),
        )
        .init();

    info!("Starting filamentd");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        workers = config.workers,
        lease_secs = config.lease_duration.as_secs(),
        poll_ms = config.poll_interval.as_millis() as u64,
        "Configuration loaded"
    );

    // Connect to database
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;

    // Verify connection
    let row: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&pool).await?;
    info!(result = row.0, "Database health check passed");

    info!("Running database migrations...");
    migrations::run_postgres(&pool).await?;
    info!("Migrations completed");

    // Register programs and start the worker pool
    let store = Arc::new(PostgresStore::new(pool.clone()));
    let registry = Arc::new(filament_programs::registry()?);
    info!(programs = ?registry.names(), "Programs registered");

    let runtime = filament_core::runtime::EngineRuntimeBuilder::new()
        .store(store)
        .registry(registry)
        .workers(config.workers)
        .poll_interval(config.poll_interval)
        .dispatcher_config(DispatcherConfig::from_config(&config))
        .build()?
        .start();

    info!("filamentd initialized successfully");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    shutdown(runtime).await;

    pool.close().await;
    info!("Shutdown complete");

    Ok(())
}

async fn shutdown(runtime: EngineRuntime) {
    if let Err(e) = runtime.shutdown().await {
        error!("Worker shutdown error: {}", e);
    }
}
