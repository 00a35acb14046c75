// Copyright (C) 2025 Filament Cloud Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Software-install helper.
//!
//! The smallest useful program: bud-ed by a server strand, does its work,
//! and exits with a result value for the parent to reap. Kept separate from
//! the server so a failing install retries with its own backoff without
//! disturbing the server's state machine.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use filament_core::error::EngineError;
use filament_core::persistence::{NewStrand, StrandStore};
use filament_core::program::{Outcome, Program, TickContext};
use filament_core::strand::StrandId;

/// Durable locals of an install strand.
#[derive(Debug, Serialize, Deserialize)]
pub struct InstallLocals {
    /// Package to install.
    pub package: String,
}

/// Create an install strand under an existing server strand.
pub async fn assemble(
    store: &dyn StrandStore,
    server_id: StrandId,
    package: &str,
) -> Result<StrandId, EngineError> {
    if package.is_empty() {
        return Err(EngineError::ValidationError {
            field: "package".to_string(),
            message: "package name must not be empty".to_string(),
        });
    }
    if store.load_strand(server_id).await?.is_none() {
        return Err(EngineError::ResourceNotFound {
            resource: "strand".to_string(),
            id: server_id.to_string(),
        });
    }
    let locals = serde_json::to_value(InstallLocals {
        package: package.to_string(),
    })?;
    let strand = store
        .create_strand(NewStrand::child(server_id, "install", "start", locals))
        .await?;
    Ok(strand.id)
}

/// Install helper program.
pub struct InstallProgram;

#[async_trait]
impl Program for InstallProgram {
    fn name(&self) -> &str {
        "install"
    }

    fn labels(&self) -> &[&str] {
        &["start"]
    }

    async fn run(&self, _label: &str, cx: &mut TickContext<'_>) -> anyhow::Result<Outcome> {
        let locals: InstallLocals = cx.locals()?;
        // Package download and verification would happen here.
        info!(strand_id = %cx.strand().id, package = %locals.package, "package installed");
        Ok(Outcome::exit(
            json!({"package": locals.package, "status": "installed"}),
        ))
    }
}
