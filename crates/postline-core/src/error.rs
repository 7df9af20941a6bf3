//! Error types and result handling for persistence operations.
//!
//! Persistence failures are surfaced to the webhook pipeline as server
//! errors; uniqueness conflicts are kept distinct so concurrent duplicate
//! deliveries can be recognised instead of reported as failures.

use thiserror::Error;

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core error type for persistence and domain operations.
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(String),

    /// Entity not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Constraint violation, including duplicate status transitions.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// Invalid input.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl CoreError {
    /// Whether retrying the same operation could succeed.
    ///
    /// Only connectivity-style database failures are transient; conflicts,
    /// missing rows and bad input will fail the same way again.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Database(_))
    }

    /// Whether this error reports a uniqueness conflict.
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::ConstraintViolation(_))
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("requested entity not found".to_string()),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Self::ConstraintViolation(format!("unique constraint violation: {db_err}"))
            },
            sqlx::Error::Database(db_err) if db_err.is_check_violation() => {
                Self::ConstraintViolation(format!("check constraint violation: {db_err}"))
            },
            _ => Self::Database(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidInput(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_database_errors_are_transient() {
        assert!(CoreError::Database("connection reset".into()).is_transient());
        assert!(!CoreError::NotFound("row".into()).is_transient());
        assert!(!CoreError::ConstraintViolation("dup".into()).is_transient());
        assert!(!CoreError::InvalidInput("bad".into()).is_transient());
    }

    #[test]
    fn row_not_found_maps_to_not_found() {
        let err = CoreError::from(sqlx::Error::RowNotFound);
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[test]
    fn conflict_detection() {
        assert!(CoreError::ConstraintViolation("dup".into()).is_conflict());
        assert!(!CoreError::Database("down".into()).is_conflict());
    }
}
