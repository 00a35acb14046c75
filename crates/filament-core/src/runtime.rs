// Copyright (C) 2025 Filament Cloud Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable engine runtime.
//!
//! This module provides [`EngineRuntime`] which runs a pool of dispatcher
//! workers inside an existing tokio application. Workers share nothing in
//! memory; all coordination goes through the strand store.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use filament_core::runtime::EngineRuntime;
//! use filament_core::persistence::PostgresStore;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pool = sqlx::PgPool::connect("postgres://...").await?;
//!     let store = Arc::new(PostgresStore::new(pool));
//!
//!     let runtime = EngineRuntime::builder()
//!         .store(store)
//!         .registry(registry)
//!         .workers(8)
//!         .build()?
//!         .start();
//!
//!     // ... run your application ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::dispatcher::{Dispatcher, DispatcherConfig};
use crate::persistence::StrandStore;
use crate::program::ProgramRegistry;

/// Builder for creating an [`EngineRuntime`].
pub struct EngineRuntimeBuilder {
    store: Option<Arc<dyn StrandStore>>,
    registry: Option<Arc<ProgramRegistry>>,
    workers: u32,
    poll_interval: Duration,
    dispatcher_config: DispatcherConfig,
}

impl std::fmt::Debug for EngineRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRuntimeBuilder")
            .field("store", &self.store.as_ref().map(|_| "..."))
            .field("registry", &self.registry.as_ref().map(|_| "..."))
            .field("workers", &self.workers)
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

impl Default for EngineRuntimeBuilder {
    fn default() -> Self {
        Self {
            store: None,
            registry: None,
            workers: 4,
            poll_interval: Duration::from_secs(1),
            dispatcher_config: DispatcherConfig::default(),
        }
    }
}

impl EngineRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the strand store (required).
    pub fn store(mut self, store: Arc<dyn StrandStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the program registry (required).
    pub fn registry(mut self, registry: Arc<ProgramRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Set the number of worker loops. Default: 4.
    pub fn workers(mut self, workers: u32) -> Self {
        self.workers = workers;
        self
    }

    /// Set the idle poll interval. Default: 1s.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the dispatcher tuning (lease duration, backoff, donate bounds).
    pub fn dispatcher_config(mut self, config: DispatcherConfig) -> Self {
        self.dispatcher_config = config;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<EngineRuntimeConfig> {
        let store = self.store.ok_or_else(|| anyhow::anyhow!("store is required"))?;
        let registry = self
            .registry
            .ok_or_else(|| anyhow::anyhow!("registry is required"))?;
        if self.workers == 0 {
            return Err(anyhow::anyhow!("workers must be at least 1"));
        }

        Ok(EngineRuntimeConfig {
            dispatcher: Arc::new(Dispatcher::new(store, registry, self.dispatcher_config)),
            workers: self.workers,
            poll_interval: self.poll_interval,
        })
    }
}

/// Configuration for an [`EngineRuntime`].
pub struct EngineRuntimeConfig {
    dispatcher: Arc<Dispatcher>,
    workers: u32,
    poll_interval: Duration,
}

impl std::fmt::Debug for EngineRuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRuntimeConfig")
            .field("dispatcher", &"...")
            .field("workers", &self.workers)
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

impl EngineRuntimeConfig {
    /// Start the runtime, spawning one task per worker.
    pub fn start(self) -> EngineRuntime {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut worker_handles = Vec::with_capacity(self.workers as usize);

        for index in 0..self.workers {
            let worker_id = format!("worker-{}", index);
            let dispatcher = self.dispatcher.clone();
            let shutdown = shutdown_rx.clone();
            let poll_interval = self.poll_interval;
            worker_handles.push(tokio::spawn(run_worker(
                worker_id,
                dispatcher,
                poll_interval,
                shutdown,
            )));
        }

        info!(workers = self.workers, "EngineRuntime started");

        EngineRuntime {
            dispatcher: self.dispatcher,
            worker_handles,
            shutdown_tx,
        }
    }
}

/// A running engine that can be embedded in an application.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination; in-flight
/// ticks complete before workers exit, and leases released normally.
pub struct EngineRuntime {
    dispatcher: Arc<Dispatcher>,
    worker_handles: Vec<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
}

impl EngineRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> EngineRuntimeBuilder {
        EngineRuntimeBuilder::new()
    }

    /// The shared dispatcher (store and registry access).
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Check if any worker is still running.
    pub fn is_running(&self) -> bool {
        self.worker_handles.iter().any(|h| !h.is_finished())
    }

    /// Gracefully shut down the runtime.
    ///
    /// Signals all workers to stop after their current tick and waits for
    /// them to exit.
    pub async fn shutdown(self) -> Result<()> {
        info!("EngineRuntime shutting down...");
        let _ = self.shutdown_tx.send(true);

        for handle in self.worker_handles {
            match handle.await {
                Ok(()) => {}
                Err(e) => {
                    error!("worker task panicked: {}", e);
                    return Err(anyhow::anyhow!("worker task panicked: {}", e));
                }
            }
        }

        info!("EngineRuntime shutdown complete");
        Ok(())
    }
}

/// One worker loop: scan for due strands, sleep when idle.
async fn run_worker(
    worker_id: String,
    dispatcher: Arc<Dispatcher>,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(worker = %worker_id, "dispatcher worker starting");

    loop {
        tokio::select! {
            biased;

            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!(worker = %worker_id, "dispatcher worker received shutdown signal");
                    break;
                }
            }

            result = dispatcher.scan_once(&worker_id) => {
                match result {
                    Ok(progressed) if progressed > 0 => {
                        // Keep draining while there is work.
                        continue;
                    }
                    Ok(_) => {
                        tokio::select! {
                            biased;
                            _ = shutdown.changed() => {
                                if *shutdown.borrow() {
                                    break;
                                }
                            }
                            _ = tokio::time::sleep(poll_interval) => {}
                        }
                    }
                    Err(error) => {
                        warn!(worker = %worker_id, %error, "scan pass failed");
                        tokio::time::sleep(poll_interval).await;
                    }
                }
            }
        }
    }

    info!(worker = %worker_id, "dispatcher worker stopped");
}
