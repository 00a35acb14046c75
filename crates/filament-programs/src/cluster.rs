// Copyright (C) 2025 Filament Cloud Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Top-level storage cluster program.
//!
//! A cluster strand buds one `pool` strand per placement group, donates its
//! ticks until every pool reports ready, then settles into the `ready` wait
//! label for the life of the cluster.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use filament_core::error::EngineError;
use filament_core::persistence::{NewStrand, StrandStore};
use filament_core::program::{Outcome, Program, TickContext};
use filament_core::signal;
use filament_core::strand::StrandId;

use crate::pool::PoolLocals;

/// Locations a cluster may be placed in. A real control plane would read
/// this from an inventory service.
pub const KNOWN_LOCATIONS: &[&str] = &["us-east-a1", "us-west-b2", "eu-north-c1"];

/// Assembly parameters for a new cluster.
#[derive(Debug, Clone)]
pub struct ClusterParams {
    /// Cluster name, a DNS-label-shaped identifier.
    pub name: String,
    /// Placement location; must be in [`KNOWN_LOCATIONS`].
    pub location: String,
    /// Number of storage pools to bud.
    pub pools: u32,
    /// Number of servers per pool.
    pub servers_per_pool: u32,
}

/// Durable locals of a cluster strand.
#[derive(Debug, Serialize, Deserialize)]
pub struct ClusterLocals {
    /// Cluster name.
    pub name: String,
    /// Placement location.
    pub location: String,
    /// Number of pools requested.
    pub pools: u32,
    /// Servers per pool.
    pub servers_per_pool: u32,
}

/// Validate parameters and create the root cluster strand.
///
/// Nothing is persisted when validation fails: malformed input is a
/// `ValidationError`, a location absent from the catalog is a
/// `ResourceNotFound`.
pub async fn assemble(
    store: &dyn StrandStore,
    params: ClusterParams,
) -> Result<StrandId, EngineError> {
    validate_name(&params.name)?;
    if params.pools == 0 || params.pools > 8 {
        return Err(EngineError::ValidationError {
            field: "pools".to_string(),
            message: "pool count must be between 1 and 8".to_string(),
        });
    }
    if params.servers_per_pool == 0 || params.servers_per_pool > 16 {
        return Err(EngineError::ValidationError {
            field: "servers_per_pool".to_string(),
            message: "servers per pool must be between 1 and 16".to_string(),
        });
    }
    if !KNOWN_LOCATIONS.contains(&params.location.as_str()) {
        return Err(EngineError::ResourceNotFound {
            resource: "location".to_string(),
            id: params.location,
        });
    }

    let locals = serde_json::to_value(ClusterLocals {
        name: params.name.clone(),
        location: params.location,
        pools: params.pools,
        servers_per_pool: params.servers_per_pool,
    })?;
    let strand = store
        .create_strand(NewStrand::root("cluster", "start", locals))
        .await?;
    info!(strand_id = %strand.id, name = %params.name, "cluster assembled");
    Ok(strand.id)
}

fn validate_name(name: &str) -> Result<(), EngineError> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-');
    if valid {
        Ok(())
    } else {
        Err(EngineError::ValidationError {
            field: "name".to_string(),
            message: "name must be a lowercase DNS label of at most 63 characters".to_string(),
        })
    }
}

/// Cluster orchestration program.
pub struct ClusterProgram;

#[async_trait]
impl Program for ClusterProgram {
    fn name(&self) -> &str {
        "cluster"
    }

    fn labels(&self) -> &[&str] {
        &["start", "wait_pools", "ready", "destroy"]
    }

    fn teardown_label(&self) -> Option<&str> {
        Some("destroy")
    }

    async fn run(&self, label: &str, cx: &mut TickContext<'_>) -> anyhow::Result<Outcome> {
        match label {
            "start" => {
                let locals: ClusterLocals = cx.locals()?;
                for index in 0..locals.pools {
                    let pool = PoolLocals {
                        cluster: locals.name.clone(),
                        location: locals.location.clone(),
                        index,
                        servers: locals.servers_per_pool,
                    };
                    cx.bud("pool", "start", serde_json::to_value(&pool)?).await?;
                }
                info!(strand_id = %cx.strand().id, pools = locals.pools, "cluster pools budded");
                Ok(Outcome::hop("wait_pools"))
            }
            "wait_pools" => {
                cx.donate().await?;
                let children = cx.children().await?;
                if !children.is_empty() && children.iter().all(|c| c.label == "ready") {
                    info!(strand_id = %cx.strand().id, "all pools ready, cluster up");
                    return Ok(Outcome::hop("ready"));
                }
                if cx.is_leaf().await? {
                    // Pools are waiting on real time (backoff, naps); check
                    // back rather than spin.
                    Ok(Outcome::nap(5))
                } else {
                    Ok(Outcome::nap(0))
                }
            }
            "ready" => {
                if cx.check_and_consume(signal::CHECKUP).await? {
                    let children = cx.children().await?;
                    let degraded = children.iter().filter(|c| c.stuck).count();
                    info!(strand_id = %cx.strand().id, pools = children.len(), degraded,
                          "cluster checkup");
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
                    info!(strand_id = %cx.strand().id, "cluster destroyed");
                    return Ok(Outcome::exit(json!({"destroyed": true})));
                }
                let blocked = remaining.iter().filter(|c| c.stuck).count();
                if blocked > 0 {
                    warn!(strand_id = %cx.strand().id, blocked,
                          "cluster teardown blocked by stuck children");
                }
                if cx.is_leaf().await? {
                    // No child can make progress right now; poll instead of
                    // spinning on the store.
                    Ok(Outcome::nap(30))
                } else {
                    Ok(Outcome::nap(0))
                }
            }
            other => anyhow::bail!("cluster has no handler for label '{other}'"),
        }
    }
}
