//! Error types for the query service.

use thiserror::Error;

/// Errors raised while resolving, persisting or authorizing data queries.
#[derive(Error, Debug)]
pub enum QueryError {
    /// A referenced record (app, data query, data source, credential) does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Client error. For OAuth code exchange failures the message is a JSON
    /// string carrying the upstream error body and `status_code`.
    #[error("{0}")]
    BadRequest(String),

    /// Credential lookup or column decryption failed.
    #[error("Credential error: {0}")]
    Credential(String),

    /// Outbound HTTP transport failure.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Persistence layer failure.
    #[error("Storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl QueryError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn credential(msg: impl Into<String>) -> Self {
        Self::Credential(msg.into())
    }

    /// Returns true for the not-found kind.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Result type alias using QueryError.
pub type Result<T> = std::result::Result<T, QueryError>;
