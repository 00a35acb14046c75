// Copyright (C) 2025 Filament Cloud Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Filament Core - Persistent Process-Orchestration Engine
//!
//! This crate provides the engine behind the filament control plane: every
//! long-running operation (provisioning a machine, wiring host networking,
//! bringing up a storage cluster) is represented as a durable **strand** and
//! executed incrementally by a pool of dispatcher workers. State is persisted
//! to PostgreSQL so operations survive process restarts, can be resumed by
//! any worker, and can be interrupted from outside through signals.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      External Actors                            │
//! │        (API handlers, CLI, another program's handler)           │
//! └─────────────────────────────────────────────────────────────────┘
//!        │ assemble (create root strand)       │ raise_signal
//!        ▼                                     ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Strand Store                             │
//! │      strands (stack, schedule, lease, deadlines) + signals      │
//! └─────────────────────────────────────────────────────────────────┘
//!        ▲                                     ▲
//!        │ lease / save                        │ poll due
//! ┌──────┴─────────────────────────────────────┴──────────────────┐
//! │                     Dispatcher Workers                        │
//! │   before_run ─► handler(label) ─► hop | nap | push | exit     │
//! │          bud/reap/donate for hierarchical composition         │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Execution model
//!
//! A strand carries a call stack of frames; the top frame's program/label
//! pair names the handler the dispatcher invokes next. A handler runs to
//! completion within one tick and reports exactly one outcome:
//!
//! | Outcome | Effect |
//! |---------|--------|
//! | `hop(label)` | Retarget the frame; new label runs next pass |
//! | `nap(seconds)` | Defer eligibility; `0` pumps immediately |
//! | `push(program, label, locals)` | Subroutine frame, active next tick |
//! | `exit(value)` | Pop with a return value, or complete the strand |
//!
//! Suspension is always structural - a handler that must wait returns `nap`
//! and the worker moves on to other strands. The one exception is `donate`,
//! which synchronously ticks a strand's children inside the parent's tick,
//! bounded by leaf convergence.
//!
//! # Concurrency
//!
//! Workers share nothing in memory. A conditional, time-bounded lease on the
//! strand row is the only locking primitive: at most one worker holds a live
//! lease per strand, the same worker may re-acquire its own lease (donate),
//! and an orphaned lease expires on its own so a crashed worker's strands
//! are resumed without intervention.
//!
//! # Interrupts
//!
//! Cancellation is cooperative. Any actor may raise a named signal on a
//! strand; the `destroy` signal is checked by the `before_run` hook on every
//! tick and forces a hop to the program's teardown label. Other signals
//! (`reconfigure`, `restart`, `checkup`) are consumed inside long-lived wait
//! handlers.
//!
//! # Configuration
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `FILAMENT_DATABASE_URL` | Yes | - | PostgreSQL connection string |
//! | `FILAMENT_WORKERS` | No | `4` | Dispatcher worker count |
//! | `FILAMENT_LEASE_SECONDS` | No | `120` | Execution lease duration |
//! | `FILAMENT_POLL_INTERVAL_MS` | No | `1000` | Idle poll interval |
//! | `FILAMENT_MAX_CONSECUTIVE_FAILURES` | No | `10` | Stuck threshold |
//!
//! # Modules
//!
//! - [`config`]: Engine configuration from environment variables
//! - [`dispatcher`]: Worker tick loop, leases, deadlines, donate
//! - [`error`]: Error types with stable error codes
//! - [`migrations`]: Embedded PostgreSQL schema migrations
//! - [`persistence`]: Strand store trait plus PostgreSQL and in-memory backends
//! - [`program`]: Program contract, registry, and the per-tick context
//! - [`runtime`]: Embeddable worker-pool runtime
//! - [`signal`]: Well-known signal names
//! - [`strand`]: Strand and frame data model

#![deny(missing_docs)]

/// Engine configuration loaded from environment variables.
pub mod config;

/// Dispatcher: leases, ticks, deadlines, and cooperative child advancement.
pub mod dispatcher;

/// Error types for engine operations with stable error codes.
pub mod error;

/// Embedded PostgreSQL schema migrations.
pub mod migrations;

/// Strand store abstraction and backends.
pub mod persistence;

/// Program contract, registry, and tick context.
pub mod program;

/// Embeddable worker-pool runtime.
pub mod runtime;

/// Well-known signal names.
pub mod signal;

/// Strand and frame data model.
pub mod strand;

pub use dispatcher::{Dispatcher, DispatcherConfig, DonateReport, TickResult};
pub use error::EngineError;
pub use persistence::{NewStrand, StrandStore};
pub use program::{Outcome, Program, ProgramRegistry, Reaped, TickContext};
pub use strand::{Deadline, Frame, Strand, StrandId};
