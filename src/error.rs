//! Error types for the sync engine.

use crate::types::PrimaryKey;
use thiserror::Error;

/// Main error type for engine operations.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Visor not found: {0}")]
    VisorNotFound(String),

    #[error("Visor already registered: {0}")]
    VisorExists(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid subscription '{name}': {reason}")]
    InvalidSubscription { name: String, reason: String },

    #[error("Link \"{from}\" not found in results for subscription '{name}'. Check identifiers and order")]
    UnresolvedDependency { name: String, from: String },

    #[error("Link \"{table}\" => \"{target}\" not declared")]
    UnknownLink { table: String, target: String },

    #[error("Row not found: {table}/{key}")]
    NotFound { table: String, key: PrimaryKey },

    #[error("No result from insert into {0}")]
    NoResult(String),

    #[error("Invalid record in {table}: {reason}")]
    InvalidRecord { table: String, reason: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error taxonomy surfaced to callers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Unknown visor or link, malformed request shape.
    Validation,
    /// A `fromSub` reference that was not resolved earlier.
    Dependency,
    /// Mutation target missing or no row produced.
    NotFound,
    /// Backend failure, including transaction aborts.
    Storage,
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::VisorNotFound(_)
            | SyncError::VisorExists(_)
            | SyncError::InvalidRequest(_)
            | SyncError::InvalidSubscription { .. }
            | SyncError::UnknownLink { .. } => ErrorKind::Validation,
            SyncError::UnresolvedDependency { .. } => ErrorKind::Dependency,
            SyncError::NotFound { .. } | SyncError::NoResult(_) => ErrorKind::NotFound,
            SyncError::InvalidRecord { .. }
            | SyncError::Storage(_)
            | SyncError::Transaction(_)
            | SyncError::Serialization(_)
            | SyncError::Io(_) => ErrorKind::Storage,
        }
    }

    /// Whether the error only invalidates one subscription entry rather than
    /// the whole request.
    pub fn is_entry_scoped(&self) -> bool {
        matches!(self.kind(), ErrorKind::Validation | ErrorKind::Dependency)
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(e: rusqlite::Error) -> Self {
        SyncError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, SyncError>;
