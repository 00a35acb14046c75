// Copyright (C) 2025 Filament Cloud Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Strand and frame data model.
//!
//! A [`Strand`] is the persisted record of one long-running operation. It
//! carries a call stack of [`Frame`]s; the top frame's program/label pair is
//! what the dispatcher executes next. Strands form a tree through
//! `parent_id` - a parent buds children and later reaps their exit values.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier of a strand.
pub type StrandId = Uuid;

/// One call-stack entry within a strand.
///
/// `locals` is opaque to the engine; programs serialize their own typed
/// struct into it and deserialize it back on every tick. `retval` is filled
/// in when a frame pushed on top of this one exits, making the subroutine's
/// result available when this frame resumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Program this frame executes.
    pub program: String,
    /// Current label within the program.
    pub label: String,
    /// Frame-private data, owned by the program.
    #[serde(default)]
    pub locals: serde_json::Value,
    /// Exit value of the most recently popped frame above this one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retval: Option<serde_json::Value>,
}

impl Frame {
    /// Create a frame with the given program, label, and locals.
    pub fn new(
        program: impl Into<String>,
        label: impl Into<String>,
        locals: serde_json::Value,
    ) -> Self {
        Self {
            program: program.into(),
            label: label.into(),
            locals,
            retval: None,
        }
    }
}

/// A registered deadline on a strand.
///
/// The strand must have left `label` (or completed, when `label` is `None`)
/// by `at`. Overrun is a fatal condition: the dispatcher marks the strand
/// stuck instead of invoking its handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deadline {
    /// Label the strand must have left, or `None` for "must have completed".
    pub label: Option<String>,
    /// Absolute time of the deadline.
    pub at: DateTime<Utc>,
}

/// Persisted record of one operation instance.
#[derive(Debug, Clone)]
pub struct Strand {
    /// Unique identifier.
    pub id: StrandId,
    /// Owning strand, or `None` for a root.
    pub parent_id: Option<StrandId>,
    /// Program of the top frame (mirrored for query convenience).
    pub program: String,
    /// Label of the top frame (mirrored for query convenience).
    pub label: String,
    /// Call stack; the last element is the active frame. Never empty.
    pub stack: Vec<Frame>,
    /// Earliest time the dispatcher may run this strand again.
    pub scheduled_at: DateTime<Utc>,
    /// Worker currently holding the execution lease, if any.
    pub lease_owner: Option<String>,
    /// When the current lease expires.
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Final result; set once, only on completion of the root frame.
    pub exit_value: Option<serde_json::Value>,
    /// Outstanding deadlines.
    pub deadlines: Vec<Deadline>,
    /// Consecutive unhandled handler failures since the last successful tick.
    pub consecutive_failures: i32,
    /// Whether the strand has been escalated for operator attention.
    pub stuck: bool,
    /// Most recent error recorded against the strand.
    pub last_error: Option<String>,
    /// When the strand was created.
    pub created_at: DateTime<Utc>,
}

impl Strand {
    /// The active (top) frame.
    ///
    /// # Panics
    ///
    /// Panics if the stack is empty, which violates the strand invariant and
    /// indicates a corrupted record.
    pub fn top_frame(&self) -> &Frame {
        self.stack.last().expect("strand stack must not be empty")
    }

    /// Mutable access to the active frame.
    pub fn top_frame_mut(&mut self) -> &mut Frame {
        self.stack
            .last_mut()
            .expect("strand stack must not be empty")
    }

    /// Push a new frame on top of the stack and mirror its program/label.
    pub fn push_frame(&mut self, frame: Frame) {
        self.program = frame.program.clone();
        self.label = frame.label.clone();
        self.stack.push(frame);
    }

    /// Pop the active frame, handing `retval` to the frame beneath.
    ///
    /// Returns the popped frame, or `None` when the active frame is the sole
    /// frame (in which case the strand itself is completing and the stack is
    /// left untouched).
    pub fn pop_frame(&mut self, retval: serde_json::Value) -> Option<Frame> {
        if self.stack.len() <= 1 {
            return None;
        }
        let popped = self.stack.pop();
        let below = self
            .stack
            .last_mut()
            .expect("stack still has a frame after pop");
        below.retval = Some(retval);
        self.program = below.program.clone();
        self.label = below.label.clone();
        popped
    }

    /// Retarget the active frame to a new label.
    pub fn set_label(&mut self, label: &str) {
        self.label = label.to_string();
        self.top_frame_mut().label = label.to_string();
    }

    /// Record a deadline, replacing any existing deadline with the same target.
    pub fn register_deadline(&mut self, label: Option<&str>, at: DateTime<Utc>) {
        self.deadlines
            .retain(|d| d.label.as_deref() != label);
        self.deadlines.push(Deadline {
            label: label.map(str::to_string),
            at,
        });
    }

    /// Whether the strand has completed (its root frame exited).
    pub fn is_finished(&self) -> bool {
        self.exit_value.is_some()
    }

    /// Whether `worker` holds a live lease on this strand at `now`.
    pub fn leased_by(&self, worker: &str, now: DateTime<Utc>) -> bool {
        self.lease_owner.as_deref() == Some(worker)
            && self.lease_expires_at.is_some_and(|expiry| expiry > now)
    }
}
