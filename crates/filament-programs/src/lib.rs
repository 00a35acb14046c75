// Copyright (C) 2025 Filament Cloud Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Storage-cluster orchestration programs for the filament engine.
//!
//! Demonstrates hierarchical composition on real provisioning shapes:
//!
//! ```text
//! cluster ──bud──► pool ──bud──► server ──bud──► install
//! ```
//!
//! Each level buds its children, donates its ticks while they come up, and
//! settles into a long-lived wait label answering operational signals
//! (`checkup`, `reconfigure`, `restart`). Teardown flows the other way: a
//! `destroy` signal on any strand propagates to its children, which are
//! reaped before the parent exits.
//!
//! Programs here log where a real control plane would call out to hosts;
//! the orchestration logic is the part under test.

#![deny(missing_docs)]

/// Top-level storage cluster program.
pub mod cluster;

/// Software-install helper strand.
pub mod install;

/// Storage pool program, one per cluster placement group.
pub mod pool;

/// Storage server program, one per physical machine.
pub mod server;

use std::sync::Arc;

use filament_core::error::EngineError;
use filament_core::program::ProgramRegistry;

pub use cluster::{ClusterParams, KNOWN_LOCATIONS};

/// Build a registry with every orchestration program registered.
pub fn registry() -> Result<ProgramRegistry, EngineError> {
    let mut registry = ProgramRegistry::new();
    registry.register(Arc::new(cluster::ClusterProgram))?;
    registry.register(Arc::new(pool::PoolProgram))?;
    registry.register(Arc::new(server::ServerProgram))?;
    registry.register(Arc::new(install::InstallProgram))?;
    Ok(registry)
}
