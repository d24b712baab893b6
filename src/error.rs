//! Error types for boxdb
//!
//! This module defines all error types used throughout the storage engine.

use std::path::PathBuf;

use thiserror::Error;

/// The main error type for boxdb
#[derive(Error, Debug)]
pub enum Error {
    // ========== Type Errors ==========
    #[error("Type error: property '{property}' expects {expected}, got {found}")]
    TypeMismatch {
        property: String,
        expected: String,
        found: String,
    },

    #[error("Type error: null value not allowed for property '{0}'")]
    NullNotAllowed(String),

    // ========== Schema Errors ==========
    #[error("Schema error: {0}")]
    SchemaMismatch(String),

    #[error("Schema error: invalid schema - {0}")]
    InvalidSchema(String),

    #[error("Schema error: entity type '{0}' not found")]
    EntityTypeNotFound(String),

    #[error("Schema error: property '{property}' not found in entity type '{entity}'")]
    UnknownProperty { entity: String, property: String },

    // ========== Storage Errors ==========
    #[error("Storage error: store is full ({0} pages in use)")]
    StoreFull(u32),

    #[error("Storage error: corrupted page {0}")]
    CorruptPage(u32),

    #[error("Storage error: entity id {0} was never assigned or has been removed")]
    InvalidEntityId(u64),

    #[error("Storage error: entity id space exhausted")]
    IdSpaceExhausted,

    #[error("Storage error: cannot access directory '{path}': {source}")]
    DirectoryUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Storage error: {0}")]
    Serialization(String),

    // ========== Index Errors ==========
    #[error("Index error: duplicate value {value} for unique property '{property}'")]
    DuplicateValue { property: String, value: String },

    // ========== Transaction Errors ==========
    #[error("Transaction error: write conflict, another transaction committed overlapping changes")]
    WriteConflict,

    #[error("Transaction error: this thread already holds an active write transaction")]
    TransactionAlreadyActive,

    #[error("Transaction error: transaction is no longer active")]
    TransactionClosed,

    #[error("Transaction error: read-only transaction cannot write")]
    ReadOnlyTransaction,

    // ========== Query Errors ==========
    #[error("Query error: invalid predicate - {0}")]
    InvalidPredicate(String),

    #[error("Query error: query was cancelled")]
    Cancelled,

    #[error("Query error: expected at most one result, found {0}")]
    NotUnique(usize),

    // ========== Configuration Errors ==========
    #[error("Configuration error: {0}")]
    InvalidConfig(String),

    // ========== I/O Errors ==========
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    // ========== Internal Errors ==========
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether re-running the failed transaction may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::WriteConflict)
    }

    pub(crate) fn type_mismatch(
        property: impl Into<String>,
        expected: impl ToString,
        found: impl ToString,
    ) -> Self {
        Error::TypeMismatch {
            property: property.into(),
            expected: expected.to_string(),
            found: found.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// Result type alias for boxdb operations
pub type Result<T> = std::result::Result<T, Error>;
