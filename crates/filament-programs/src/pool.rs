// Copyright (C) 2025 Filament Cloud Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Storage pool program.
//!
//! One pool strand per placement group inside a cluster. Buds its server
//! strands, waits until every server is in its long-lived `wait` label, then
//! reports ready by hopping to `ready` where the parent cluster can see it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use filament_core::error::EngineError;
use filament_core::persistence::{NewStrand, StrandStore};
use filament_core::program::{Outcome, Program, TickContext};
use filament_core::signal;
use filament_core::strand::StrandId;

use crate::server::ServerLocals;

/// Durable locals of a pool strand.
#[derive(Debug, Serialize, Deserialize)]
pub struct PoolLocals {
    /// Owning cluster name.
    pub cluster: String,
    /// Placement location, inherited from the cluster.
    pub location: String,
    /// Pool index within the cluster.
    pub index: u32,
    /// Number of servers to bud.
    pub servers: u32,
}

/// Create a pool strand under an existing cluster strand.
///
/// Used when growing a cluster after assembly. The parent reference is
/// checked first; a missing parent is a `ResourceNotFound`, not a validation
/// failure.
pub async fn assemble(
    store: &dyn StrandStore,
    cluster_id: StrandId,
    locals: PoolLocals,
) -> Result<StrandId, EngineError> {
    if locals.servers == 0 || locals.servers > 16 {
        return Err(EngineError::ValidationError {
            field: "servers".to_string(),
            message: "server count must be between 1 and 16".to_string(),
        });
    }
    let Some(parent) = store.load_strand(cluster_id).await? else {
        return Err(EngineError::ResourceNotFound {
            resource: "strand".to_string(),
            id: cluster_id.to_string(),
        });
    };
    if parent.program != "cluster" {
        return Err(EngineError::ValidationError {
            field: "cluster_id".to_string(),
            message: format!("parent strand runs '{}', expected 'cluster'", parent.program),
        });
    }

    let index = locals.index;
    let strand = store
        .create_strand(NewStrand::child(
            cluster_id,
            "pool",
            "start",
            serde_json::to_value(&locals)?,
        ))
        .await?;
    info!(strand_id = %strand.id, cluster_id = %cluster_id, index, "pool assembled");
    Ok(strand.id)
}

/// Pool orchestration program.
pub struct PoolProgram;

#[async_trait]
impl Program for PoolProgram {
    fn name(&self) -> &str {
        "pool"
    }

    fn labels(&self) -> &[&str] {
        &["start", "wait_servers", "ready", "destroy"]
    }

    fn teardown_label(&self) -> Option<&str> {
        Some("destroy")
    }

    async fn run(&self, label: &str, cx: &mut TickContext<'_>) -> anyhow::Result<Outcome> {
        match label {
            "start" => {
                let locals: PoolLocals = cx.locals()?;
                for index in 0..locals.servers {
                    let server = ServerLocals {
                        cluster: locals.cluster.clone(),
                        pool_index: locals.index,
                        index,
                        generation: 0,
                    };
                    cx.bud("server", "start", serde_json::to_value(&server)?)
                        .await?;
                }
                Ok(Outcome::hop("wait_servers"))
            }
            "wait_servers" => {
                cx.donate().await?;
                let children = cx.children().await?;
                if !children.is_empty() && children.iter().all(|c| c.label == "wait") {
                    let locals: PoolLocals = cx.locals()?;
                    info!(strand_id = %cx.strand().id, index = locals.index,
                          servers = children.len(), "pool ready");
                    return Ok(Outcome::hop("ready"));
                }
                if cx.is_leaf().await? {
                    Ok(Outcome::nap(5))
                } else {
                    Ok(Outcome::nap(0))
                }
            }
            "ready" => {
                if cx.check_and_consume(signal::CHECKUP).await? {
                    let locals: PoolLocals = cx.locals()?;
                    info!(strand_id = %cx.strand().id, index = locals.index, "pool checkup");
                }
                Ok(Outcome::nap(60))
            }
            "destroy" => {
                for child in cx.children().await? {
                    if child.exit_value.is_none() && !child.stuck {
                        cx.raise_signal(child.id, signal::DESTROY).await?;
                    }
                }
                cx.donate().await?;
                cx.reap().await?;
                let remaining = cx.children().await?;
                if remaining.is_empty() {
                    return Ok(Outcome::exit(json!({"destroyed": true})));
                }
                let blocked = remaining.iter().filter(|c| c.stuck).count();
                if blocked > 0 {
                    warn!(strand_id = %cx.strand().id, blocked,
                          "pool teardown blocked by stuck children");
                }
                if cx.is_leaf().await? {
                    Ok(Outcome::nap(30))
                } else {
                    Ok(Outcome::nap(0))
                }
            }
            other => anyhow::bail!("pool has no handler for label '{other}'"),
        }
    }
}
