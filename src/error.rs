//! Error types for the next-plaid-ann crate.

use thiserror::Error;

/// Result type alias for index operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during index operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid construction parameters (dimension, M, M0, ef_construction).
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The index is full and must be resized before more inserts.
    #[error("Capacity exceeded: index holds at most {capacity} elements")]
    CapacityExceeded { capacity: usize },

    /// The label is already mapped to an element (live or tombstoned).
    #[error("Duplicate label: {0}")]
    DuplicateLabel(u64),

    /// The label is unknown, or is tombstoned where a live element is required.
    #[error("Label not found: {0}")]
    NotFound(u64),

    /// Dimension mismatch between a vector and the index.
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    /// Persisted data is malformed or inconsistent with the receiving index.
    #[error("Corrupt index file: {0}")]
    CorruptFile(String),

    /// A structural invariant of the graph does not hold.
    #[error("Integrity check failed: {0}")]
    Integrity(String),

    /// Invalid argument to a runtime operation.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// IO error while reading or writing a byte stream.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
