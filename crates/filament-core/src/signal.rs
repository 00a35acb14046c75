// Copyright (C) 2025 Filament Cloud Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Well-known signal names.
//!
//! A signal is a named presence flag on a strand, raised by external actors
//! through [`StrandStore::raise_signal`](crate::persistence::StrandStore::raise_signal)
//! and acknowledged inside handlers via
//! [`TickContext::check_and_consume`](crate::program::TickContext::check_and_consume).
//! Raising a signal twice before it is consumed collapses to a single pending
//! observation; there is no ordering between distinct names.
//!
//! The engine itself only interprets [`DESTROY`] (in the default
//! `before_run` hook); the remaining names are conventions shared by the
//! long-lived "wait" handlers of control-plane programs.

/// Request cooperative teardown. Checked by the default `before_run` hook.
pub const DESTROY: &str = "destroy";

/// Request that a wait handler re-apply its configuration.
pub const RECONFIGURE: &str = "reconfigure";

/// Request a restart subroutine from a wait handler.
pub const RESTART: &str = "restart";

/// Request an immediate health probe from a wait handler.
pub const CHECKUP: &str = "checkup";
