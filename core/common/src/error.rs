//! Common error types for LanVault.

use thiserror::Error;

/// Top-level error type for LanVault operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Cryptographic API misuse (wrong key length, bad parameters).
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Wrong password or tampered ciphertext.
    ///
    /// Carries no detail so callers cannot tell which check failed.
    #[error("Authentication failed")]
    AuthenticationFailure,

    /// Metadata store operation failed.
    #[error("Database error: {0}")]
    Database(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// TLS identity or handshake setup failed.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Conflict detected.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A human decision was not received in time.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// A human explicitly rejected the request.
    #[error("Rejected: {0}")]
    Rejected(String),

    /// Another request is already awaiting a decision.
    #[error("Busy: {0}")]
    Busy(String),

    /// Session identifier does not match the transfer.
    #[error("Invalid session")]
    InvalidSession,

    /// The vault has no unlocked data key.
    #[error("Vault is locked")]
    Locked,

    /// Allocator, header or metadata inconsistency.
    #[error("Storage corruption: {0}")]
    StorageCorruption(String),
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Database(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
