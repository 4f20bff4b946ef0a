//! Error types for burrowkv
//!
//! Provides a unified error type for all engine operations. Recoverable
//! conditions (absent key, empty range, memory ceiling reached) are reported
//! through return values instead; only exceptional conditions end up here.

use thiserror::Error;

/// Result type alias using BurrowError
pub type Result<T> = std::result::Result<T, BurrowError>;

/// Unified error type for burrowkv operations
#[derive(Debug, Error)]
pub enum BurrowError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Block / Snapshot Errors
    // -------------------------------------------------------------------------
    /// A block payload or snapshot image failed validation. Never recoverable
    /// for the block involved.
    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Compression error: {0}")]
    Compression(String),

    /// The memory ceiling stopped an operation that cannot report failure
    /// through its return value (restore).
    #[error("Memory ceiling reached: {0}")]
    CapacityExceeded(String),

    // -------------------------------------------------------------------------
    // Typed Operation Errors
    // -------------------------------------------------------------------------
    /// The stored value does not have the format the operation expects
    /// (e.g. increment on non-numeric bytes).
    #[error("Operation failed: {0}")]
    OperationFailed(String),

    /// A chain handle refers to a slot that was released or reused.
    #[error("Invalid chain handle: {0}")]
    InvalidHandle(String),

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<bincode::Error> for BurrowError {
    fn from(e: bincode::Error) -> Self {
        BurrowError::Serialization(e.to_string())
    }
}
