// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for statemachine-core.
//!
//! Every error a processor can return is either recoverable (the loop backs
//! off and keeps running) or fatal (the loop's worker exits and the loop stays
//! inactive until restarted from outside). Lease contention on the direct
//! access path is not an error at all; see [`crate::store::StoreResult`].

use thiserror::Error;

/// Result type using EngineError.
pub type Result<T> = std::result::Result<T, EngineError>;

/// How the process loop reacts to an error escaping a processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Log, wait `retry_in_millis()`, continue.
    Recoverable,
    /// Log and stop the loop.
    Fatal,
}

impl std::fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Recoverable => write!(f, "recoverable"),
            Self::Fatal => write!(f, "fatal"),
        }
    }
}

/// Engine errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// The entity holds a valid lease owned by someone else.
    #[error("Entity '{entity_id}' is leased by '{leased_by}'")]
    AlreadyLeased {
        /// The leased entity.
        entity_id: String,
        /// Current lease owner.
        leased_by: String,
    },

    /// The entity does not exist.
    #[error("Entity '{entity_id}' not found")]
    NotFound {
        /// The missing entity.
        entity_id: String,
    },

    /// A business guard refused deletion.
    #[error("Entity '{entity_id}' cannot be deleted: {reason}")]
    DeletionRefused {
        /// The entity.
        entity_id: String,
        /// Why deletion was refused.
        reason: String,
    },

    /// The entity is in a state that does not allow the operation.
    #[error("Entity '{entity_id}' is in invalid state {state}: {message}")]
    InvalidState {
        /// The entity.
        entity_id: String,
        /// Its current state code.
        state: i32,
        /// What was attempted.
        message: String,
    },

    /// Store operation failed.
    #[error("Store error during '{operation}': {details}")]
    Store {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// Database driver error.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Entity payload could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Unrecoverable fault; stops the process loop that observes it.
    #[error("Fatal error: {0}")]
    Fatal(String),
}

impl EngineError {
    /// Build a [`EngineError::Store`] error.
    pub fn store(operation: impl Into<String>, details: impl ToString) -> Self {
        Self::Store {
            operation: operation.into(),
            details: details.to_string(),
        }
    }

    /// Build a [`EngineError::Fatal`] error.
    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::Fatal(reason.into())
    }

    /// Classify this error for the process loop.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Fatal(_) => ErrorSeverity::Fatal,
            _ => ErrorSeverity::Recoverable,
        }
    }

    /// Shorthand for `severity() == ErrorSeverity::Fatal`.
    pub fn is_fatal(&self) -> bool {
        self.severity() == ErrorSeverity::Fatal
    }
}

impl From<sqlx::migrate::MigrateError> for EngineError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        EngineError::store("migrate", err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_fatal_is_fatal() {
        let recoverable = vec![
            EngineError::AlreadyLeased {
                entity_id: "e-1".to_string(),
                leased_by: "other".to_string(),
            },
            EngineError::NotFound {
                entity_id: "e-1".to_string(),
            },
            EngineError::store("save", "connection reset"),
            EngineError::Database(sqlx::Error::PoolTimedOut),
        ];
        for err in recoverable {
            assert_eq!(err.severity(), ErrorSeverity::Recoverable, "{err}");
            assert!(!err.is_fatal());
        }

        let fatal = EngineError::fatal("out of memory");
        assert_eq!(fatal.severity(), ErrorSeverity::Fatal);
        assert!(fatal.is_fatal());
    }

    #[test]
    fn test_error_display() {
        let err = EngineError::AlreadyLeased {
            entity_id: "tp-1".to_string(),
            leased_by: "connector-b".to_string(),
        };
        assert_eq!(err.to_string(), "Entity 'tp-1' is leased by 'connector-b'");

        let err = EngineError::store("next_not_leased", "disk I/O error");
        assert_eq!(
            err.to_string(),
            "Store error during 'next_not_leased': disk I/O error"
        );

        let err = EngineError::DeletionRefused {
            entity_id: "cn-1".to_string(),
            reason: "agreement exists".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Entity 'cn-1' cannot be deleted: agreement exists"
        );

        assert_eq!(ErrorSeverity::Fatal.to_string(), "fatal");
    }
}
