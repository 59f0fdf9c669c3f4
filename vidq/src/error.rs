//! Application-wide error types.

use std::time::Duration;

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    /// The URL was refused at admission (invalid, duplicate, already queued).
    ///
    /// `hidden` marks expected no-ops that front-ends may choose not to surface.
    #[error("{message}")]
    Admission { message: String, hidden: bool },

    #[error("Extraction failed: {0}")]
    Extraction(String),

    #[error("Extraction timed out after {}s", .0.as_secs())]
    ExtractionTimeout(Duration),

    #[error("Too many concurrent extractions, gave up after {}s", .0.as_secs())]
    ConcurrencyTimeout(Duration),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Download process failed: {0}")]
    ProcessFailure(String),

    #[error("Worker pool error: {0}")]
    Pool(#[from] crate::pool::PoolError),

    #[error("Database error: {0}")]
    DatabaseSqlx(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn admission(msg: impl Into<String>) -> Self {
        Self::Admission {
            message: msg.into(),
            hidden: false,
        }
    }

    /// An admission refusal for something that is already known (queued or downloaded).
    pub fn duplicate(msg: impl Into<String>) -> Self {
        Self::Admission {
            message: msg.into(),
            hidden: true,
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn extraction(msg: impl Into<String>) -> Self {
        Self::Extraction(msg.into())
    }

    pub fn process(msg: impl Into<String>) -> Self {
        Self::ProcessFailure(msg.into())
    }

    /// Whether front-ends should suppress notifications for this error.
    pub fn is_hidden(&self) -> bool {
        matches!(self, Self::Admission { hidden: true, .. })
    }
}
