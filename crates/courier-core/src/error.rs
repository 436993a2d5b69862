//! Error types for Courier

use thiserror::Error;

/// Coarse error classes the delivery tiers reason about.
///
/// Every [`CourierError`] maps onto exactly one kind. The transport
/// coordinator uses the kind to decide between retrying a tier later
/// and falling through to the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or missing arguments, rejected before any I/O
    Param,
    /// DHT unreachable, socket failure or a bounded wait ran out
    Network,
    /// The tier has nothing to offer (no record, no candidates)
    NotFound,
    /// Garbled frame or record; the offending input was discarded
    Protocol,
}

/// Main error type for Courier operations
#[derive(Error, Debug)]
pub enum CourierError {
    /// Invalid argument supplied by the caller
    #[error("Invalid parameter: {0}")]
    Param(String),

    /// Network-related error (DHT, STUN, TCP)
    #[error("Network error: {0}")]
    Network(String),

    /// A bounded wait elapsed
    #[error("Timed out: {0}")]
    Timeout(String),

    /// No presence, candidate or outbox record exists
    #[error("Not found: {0}")]
    NotFound(String),

    /// Oversized or garbled frame, unparseable record payload
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Operation not valid in the current ICE session state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Signature verification failed or signer mismatch
    #[error("Signature invalid: {0}")]
    SignatureInvalid(String),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Local persistence failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CourierError {
    /// Classify this error into the delivery taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CourierError::Param(_) => ErrorKind::Param,
            CourierError::NotFound(_) => ErrorKind::NotFound,
            CourierError::Protocol(_)
            | CourierError::SignatureInvalid(_)
            | CourierError::Serialization(_) => ErrorKind::Protocol,
            CourierError::Network(_)
            | CourierError::Timeout(_)
            | CourierError::InvalidState(_)
            | CourierError::Storage(_)
            | CourierError::Database(_)
            | CourierError::Transaction(_)
            | CourierError::Table(_)
            | CourierError::StorageOp(_)
            | CourierError::Commit(_)
            | CourierError::Io(_) => ErrorKind::Network,
        }
    }

    /// True if the error means "this tier has nothing to offer".
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

impl From<postcard::Error> for CourierError {
    fn from(e: postcard::Error) -> Self {
        CourierError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for CourierError {
    fn from(e: serde_json::Error) -> Self {
        CourierError::Serialization(e.to_string())
    }
}

/// Result type alias using CourierError
pub type CourierResult<T> = Result<T, CourierError>;
