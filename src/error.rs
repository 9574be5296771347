//! Error types for the protected KV store

use thiserror::Error;

/// Result type alias for protected KV store operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur during protected KV store operations
#[derive(Error, Debug)]
pub enum StoreError {
    /// Input failed validation before touching the database
    #[error("Validation error: {0}")]
    Validation(String),

    /// Requested entity does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Entity conflicts with an existing one
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Cryptographic operation failed
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Underlying database error
    #[error("Persistence error: {0}")]
    Persistence(#[from] sqlx::Error),

    /// Operation not permitted in the current entity state
    #[error("State violation: {0}")]
    StateViolation(String),
}

impl StoreError {
    /// Classify a database error raised while inserting an entity.
    ///
    /// Unique-constraint violations become [`StoreError::Conflict`];
    /// foreign-key violations become [`StoreError::NotFound`] since the
    /// referenced row is missing.
    pub(crate) fn from_insert(err: sqlx::Error, what: &str) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.is_unique_violation() {
                return StoreError::Conflict(format!("{what} already exists"));
            }
            if db_err.is_foreign_key_violation() {
                return StoreError::NotFound(format!("{what} references a missing entity"));
            }
        }
        StoreError::Persistence(err)
    }
}
