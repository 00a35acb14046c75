// Copyright (C) 2025 Filament Cloud Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for filament-core.
//!
//! Provides a unified error type with stable error codes for operator-facing
//! surfaces (status dashboards read codes, not messages).

use std::fmt;

use crate::strand::StrandId;

/// Result type using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

/// Engine errors that can occur during assembly and dispatch.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum EngineError {
    /// Strand was not found in the store.
    StrandNotFound {
        /// The strand ID that was not found.
        strand_id: StrandId,
    },

    /// No program with this name is registered.
    ProgramNotFound {
        /// The program name that was not found.
        program: String,
    },

    /// A label was used that the program does not declare.
    UnknownLabel {
        /// The program the label was resolved against.
        program: String,
        /// The undeclared label.
        label: String,
    },

    /// Assembly input was malformed or semantically invalid.
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Assembly input named a resource that does not exist.
    ResourceNotFound {
        /// The kind of resource (e.g. "location", "strand").
        resource: String,
        /// The identifier that was not found.
        id: String,
    },

    /// Database operation failed.
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl EngineError {
    /// Get the stable error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::StrandNotFound { .. } => "STRAND_NOT_FOUND",
            Self::ProgramNotFound { .. } => "PROGRAM_NOT_FOUND",
            Self::UnknownLabel { .. } => "UNKNOWN_LABEL",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::ResourceNotFound { .. } => "RESOURCE_NOT_FOUND",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
        }
    }

    /// Whether the error is a synchronous assembly failure (validation or
    /// reference) rather than an operational one.
    pub fn is_assembly_failure(&self) -> bool {
        matches!(
            self,
            Self::ValidationError { .. } | Self::ResourceNotFound { .. }
        )
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StrandNotFound { strand_id } => {
                write!(f, "Strand '{}' not found", strand_id)
            }
            Self::ProgramNotFound { program } => {
                write!(f, "Program '{}' is not registered", program)
            }
            Self::UnknownLabel { program, label } => {
                write!(
                    f,
                    "Program '{}' does not declare label '{}'",
                    program, label
                )
            }
            Self::ValidationError { field, message } => {
                write!(f, "Validation error for '{}': {}", field, message)
            }
            Self::ResourceNotFound { resource, id } => {
                write!(f, "{} '{}' not found", resource, id)
            }
            Self::DatabaseError { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
        }
    }
}

impl std::error::Error for EngineError {}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::DatabaseError {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}
