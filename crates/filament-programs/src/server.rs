// Copyright (C) 2025 Filament Cloud Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Storage server program.
//!
//! One server strand per machine. Bootstraps, installs its software through
//! a bud-ed `install` helper strand, then sits in the `wait` label for the
//! life of the machine, answering `checkup`, `reconfigure`, and `restart`
//! signals. Restart runs as a pushed subroutine (`restart_stop` then
//! `restart_start` on the same strand), so the wait frame resumes exactly
//! where it left off with the subroutine's result.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use filament_core::error::EngineError;
use filament_core::persistence::{NewStrand, StrandStore};
use filament_core::program::{Outcome, Program, TickContext};
use filament_core::signal;
use filament_core::strand::{Strand, StrandId};

/// Durable locals of a server strand.
#[derive(Debug, Serialize, Deserialize)]
pub struct ServerLocals {
    /// Owning cluster name.
    pub cluster: String,
    /// Index of the owning pool within the cluster.
    pub pool_index: u32,
    /// Server index within the pool.
    pub index: u32,
    /// Configuration generation, bumped on each `reconfigure`.
    pub generation: u64,
}

/// Create a server strand under an existing pool strand.
pub async fn assemble(
    store: &dyn StrandStore,
    pool_id: StrandId,
    locals: ServerLocals,
) -> Result<StrandId, EngineError> {
    let Some(parent) = store.load_strand(pool_id).await? else {
        return Err(EngineError::ResourceNotFound {
            resource: "strand".to_string(),
            id: pool_id.to_string(),
        });
    };
    if parent.program != "pool" {
        return Err(EngineError::ValidationError {
            field: "pool_id".to_string(),
            message: format!("parent strand runs '{}', expected 'pool'", parent.program),
        });
    }

    let strand = store
        .create_strand(NewStrand::child(
            pool_id,
            "server",
            "start",
            serde_json::to_value(&locals)?,
        ))
        .await?;
    info!(strand_id = %strand.id, pool_id = %pool_id, index = locals.index, "server assembled");
    Ok(strand.id)
}

/// Whether a restart subroutine is already on the strand's stack.
///
/// The wait handler refuses to launch a second restart while one is active;
/// a `restart` signal raised mid-restart is simply dropped on consumption.
pub fn restart_in_progress(strand: &Strand) -> bool {
    strand
        .stack
        .iter()
        .any(|frame| frame.program == "server" && frame.label.starts_with("restart_"))
}

/// Server lifecycle program.
pub struct ServerProgram;

#[async_trait]
impl Program for ServerProgram {
    fn name(&self) -> &str {
        "server"
    }

    fn labels(&self) -> &[&str] {
        &[
            "start",
            "bootstrap",
            "wait_install",
            "wait",
            "restart_stop",
            "restart_start",
            "destroy",
        ]
    }

    fn teardown_label(&self) -> Option<&str> {
        Some("destroy")
    }

    async fn run(&self, label: &str, cx: &mut TickContext<'_>) -> anyhow::Result<Outcome> {
        match label {
            "start" => {
                let locals: ServerLocals = cx.locals()?;
                info!(strand_id = %cx.strand().id, cluster = %locals.cluster,
                      pool = locals.pool_index, index = locals.index, "server allocated");
                Ok(Outcome::hop("bootstrap"))
            }
            "bootstrap" => {
                // Host imaging and network setup would happen here.
                info!(strand_id = %cx.strand().id, "server bootstrapped");
                cx.bud("install", "start", json!({"package": "filament-storage"}))
                    .await?;
                Ok(Outcome::hop("wait_install"))
            }
            "wait_install" => {
                cx.donate().await?;
                let reaped = cx.reap().await?;
                if let Some(install) = reaped.into_iter().find(|r| r.program == "install") {
                    info!(strand_id = %cx.strand().id, result = %install.exit_value,
                          "server software installed");
                    return Ok(Outcome::hop("wait"));
                }
                if cx.is_leaf().await? {
                    Ok(Outcome::nap(5))
                } else {
                    Ok(Outcome::nap(0))
                }
            }
            "wait" => {
                if let Some(retval) = cx.take_retval() {
                    info!(strand_id = %cx.strand().id, result = %retval, "restart finished");
                }
                if cx.check_and_consume(signal::CHECKUP).await? {
                    let locals: ServerLocals = cx.locals()?;
                    info!(strand_id = %cx.strand().id, generation = locals.generation,
                          "server checkup");
                }
                if cx.check_and_consume(signal::RECONFIGURE).await? {
                    let mut locals: ServerLocals = cx.locals()?;
                    locals.generation += 1;
                    cx.set_locals(&locals)?;
                    info!(strand_id = %cx.strand().id, generation = locals.generation,
                          "server reconfigured");
                }
                if cx.check_and_consume(signal::RESTART).await? {
                    if restart_in_progress(cx.strand()) {
                        info!(strand_id = %cx.strand().id, "restart already running, ignored");
                    } else {
                        return Ok(Outcome::push("server", "restart_stop", json!({})));
                    }
                }
                Ok(Outcome::nap(60))
            }
            "restart_stop" => {
                info!(strand_id = %cx.strand().id, "server services stopped");
                Ok(Outcome::hop("restart_start"))
            }
            "restart_start" => {
                info!(strand_id = %cx.strand().id, "server services started");
                Ok(Outcome::exit(json!({"restarted": true})))
            }
            "destroy" => {
                // The install helper has no teardown of its own; let it run
                // out, then reap whatever finished.
                cx.donate().await?;
                cx.reap().await?;
                let remaining = cx.children().await?;
                if remaining.is_empty() {
                    info!(strand_id = %cx.strand().id, "server released");
                    return Ok(Outcome::exit(json!({"destroyed": true})));
                }
                let blocked = remaining.iter().filter(|c| c.stuck).count();
                if blocked > 0 {
                    warn!(strand_id = %cx.strand().id, blocked,
                          "server teardown blocked by stuck children");
                }
                if cx.is_leaf().await? {
                    Ok(Outcome::nap(30))
                } else {
                    Ok(Outcome::nap(0))
                }
            }
            other => anyhow::bail!("server has no handler for label '{other}'"),
        }
    }
}
