//! Error taxonomy for every remote and local failure.
//!
//! Transport failures are normalized into a closed set of variants so callers
//! can match on the condition they care about (most often [`CouchError::Conflict`]
//! when implementing a reload-and-retry loop) instead of inspecting messages.

use serde_json::Error as SerdeError;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CouchError>;

#[derive(Debug, Error)]
pub enum CouchError {
    /// Remote 404.
    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    /// Remote 409, raised when the supplied revision is not the latest one.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Remote 412. Creating a database that already exists reports this.
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("Request timeout: {0}")]
    RequestTimeout(String),

    #[error("Server broke connection: {0}")]
    ServerBrokeConnection(String),

    /// Catch-all for any other transport or protocol failure.
    #[error("Request failed: {0}")]
    RequestFailed(String),

    /// A view row carries a type marker that no registered constructor handles.
    #[error("{marker} class not found. Maybe this class name has been changed. Or maybe you meant to use the design document's raw_query method to return rows instead of typed objects.")]
    MissingClass { marker: String },

    /// Caller misuse, e.g. deleting a document that was never saved.
    #[error("Invalid argument: {0}")]
    Argument(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl CouchError {
    /// Maps an HTTP status code returned by the database onto the taxonomy.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        match status {
            404 => CouchError::ResourceNotFound(body),
            408 => CouchError::RequestTimeout(body),
            409 => CouchError::Conflict(body),
            412 => CouchError::PreconditionFailed(body),
            _ => CouchError::RequestFailed(format!("HTTP {status}: {body}")),
        }
    }

    pub fn argument(msg: impl Into<String>) -> Self {
        CouchError::Argument(msg.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CouchError::ResourceNotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, CouchError::Conflict(_))
    }

    pub fn is_precondition_failed(&self) -> bool {
        matches!(self, CouchError::PreconditionFailed(_))
    }
}

impl From<SerdeError> for CouchError {
    fn from(err: SerdeError) -> Self {
        CouchError::Serialization(format!("JSON serialization error: {}", err))
    }
}

impl From<reqwest::Error> for CouchError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return CouchError::from_status(status.as_u16(), err.to_string());
        }
        if err.is_timeout() {
            CouchError::RequestTimeout(err.to_string())
        } else if err.is_connect() || err.is_request() || err.is_body() {
            CouchError::ServerBrokeConnection(err.to_string())
        } else if err.is_decode() {
            CouchError::RequestFailed(format!("Invalid response body: {}", err))
        } else {
            CouchError::RequestFailed(err.to_string())
        }
    }
}

impl From<toml::de::Error> for CouchError {
    fn from(err: toml::de::Error) -> Self {
        CouchError::Config(format!("Invalid configuration file: {}", err))
    }
}
