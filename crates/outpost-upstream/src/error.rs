//! Errors returned by the upstream client.

use thiserror::Error;

use outpost_core::{Error, PushFkError};

/// Result type alias for upstream calls.
pub type UpstreamResult<T> = std::result::Result<T, UpstreamError>;

#[derive(Error, Debug)]
pub enum UpstreamError {
    /// Transport failure or timeout
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-2xx answer
    #[error("Upstream returned {status}: {body}")]
    Status { status: u16, body: String },

    /// Upstream saved what it could; these keys still violate a foreign key
    #[error("Foreign key conflict on {} row(s)", .0.ids.len())]
    ForeignKey(PushFkError),

    /// A 2xx body that does not match the expected shape
    #[error("Failed to decode upstream response: {0}")]
    Decode(String),

    #[error("Request cancelled")]
    Cancelled,
}

impl UpstreamError {
    /// Label used for the `outcome` metric dimension.
    pub fn outcome(&self) -> &'static str {
        match self {
            UpstreamError::Http(e) if e.is_timeout() => "timeout",
            UpstreamError::Http(_) => "transport_error",
            UpstreamError::Status { .. } => "status_error",
            UpstreamError::ForeignKey(_) => "conflict",
            UpstreamError::Decode(_) => "decode_error",
            UpstreamError::Cancelled => "cancelled",
        }
    }
}

impl From<UpstreamError> for Error {
    fn from(e: UpstreamError) -> Self {
        match e {
            UpstreamError::Http(e) => Error::Request(e.to_string()),
            UpstreamError::Status { status, body } => {
                Error::Upstream(format!("status {status}: {body}"))
            }
            UpstreamError::ForeignKey(fk) => Error::Conflict(fk),
            UpstreamError::Decode(msg) => Error::Serialization(msg),
            UpstreamError::Cancelled => Error::Cancelled,
        }
    }
}
