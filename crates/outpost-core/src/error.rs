//! Error types for outpost.

use thiserror::Error;

use crate::push::PushFkError;

/// Result type alias using outpost's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for outpost operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Rows still violate a foreign key after every degradation cycle
    #[error("Foreign key conflict on {} row(s)", .0.ids.len())]
    Conflict(PushFkError),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// HTTP/network request failed
    #[error("Request error: {0}")]
    Request(String),

    /// Upstream answered with an error
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// One or more pages of a reconciliation sweep failed
    #[error("Reconciliation failed: {}", .0.join("; "))]
    Reconcile(Vec<String>),

    /// The governing operation was cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this wraps a Postgres foreign-key violation.
    pub fn is_foreign_key_violation(&self) -> bool {
        match self {
            Error::Database(sqlx::Error::Database(db)) => db.is_foreign_key_violation(),
            _ => false,
        }
    }

    /// Whether this error belongs to the foreign-key conflict class, either
    /// raw from the database or already collected into [`Error::Conflict`].
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_)) || self.is_foreign_key_violation()
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Request(e.to_string())
    }
}
