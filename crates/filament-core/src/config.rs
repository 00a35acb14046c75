// Copyright (C) 2025 Filament Cloud Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::time::Duration;

/// Filament engine configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL
    pub database_url: String,
    /// Number of dispatcher worker loops
    pub workers: u32,
    /// How long a worker's execution lease on a strand lives
    pub lease_duration: Duration,
    /// How often an idle worker polls for due strands
    pub poll_interval: Duration,
    /// Consecutive unhandled handler failures before a strand is marked stuck
    pub max_consecutive_failures: i32,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `FILAMENT_DATABASE_URL`: PostgreSQL connection string
    ///
    /// Optional (with defaults):
    /// - `FILAMENT_WORKERS`: dispatcher worker count (default: 4)
    /// - `FILAMENT_LEASE_SECONDS`: lease duration (default: 120)
    /// - `FILAMENT_POLL_INTERVAL_MS`: idle poll interval (default: 1000)
    /// - `FILAMENT_MAX_CONSECUTIVE_FAILURES`: stuck threshold (default: 10)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("FILAMENT_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("FILAMENT_DATABASE_URL"))?;

        let workers: u32 = std::env::var("FILAMENT_WORKERS")
            .unwrap_or_else(|_| "4".to_string())
            .parse()
            .map_err(|_| ConfigError::Invalid("FILAMENT_WORKERS", "must be a positive integer"))?;
        if workers == 0 {
            return Err(ConfigError::Invalid(
                "FILAMENT_WORKERS",
                "must be at least 1",
            ));
        }

        let lease_seconds: u64 = std::env::var("FILAMENT_LEASE_SECONDS")
            .unwrap_or_else(|_| "120".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("FILAMENT_LEASE_SECONDS", "must be a positive integer")
            })?;
        if lease_seconds == 0 {
            return Err(ConfigError::Invalid(
                "FILAMENT_LEASE_SECONDS",
                "must be at least 1",
            ));
        }

        let poll_interval_ms: u64 = std::env::var("FILAMENT_POLL_INTERVAL_MS")
            .unwrap_or_else(|_| "1000".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("FILAMENT_POLL_INTERVAL_MS", "must be a positive integer")
            })?;

        let max_consecutive_failures: i32 = std::env::var("FILAMENT_MAX_CONSECUTIVE_FAILURES")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid(
                    "FILAMENT_MAX_CONSECUTIVE_FAILURES",
                    "must be a positive integer",
                )
            })?;
        if max_consecutive_failures <= 0 {
            return Err(ConfigError::Invalid(
                "FILAMENT_MAX_CONSECUTIVE_FAILURES",
                "must be at least 1",
            ));
        }

        Ok(Self {
            database_url,
            workers,
            lease_duration: Duration::from_secs(lease_seconds),
            poll_interval: Duration::from_millis(poll_interval_ms),
            max_consecutive_failures,
        })
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
