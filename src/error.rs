//! Error types for boc_db

use thiserror::Error;

/// Result type alias for boc_db operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in boc_db operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid cell: {0}")]
    InvalidCell(String),

    #[error("Cell write error: {0}")]
    CellWrite(String),

    #[error("Invalid bag of cells: {0}")]
    BocParse(String),

    #[error("Not enough data: need {needed} bytes, got {available}")]
    NotEnoughData { needed: u64, available: u64 },

    #[error("CRC32C mismatch: expected {expected:08x}, found {found:08x}")]
    ChecksumMismatch { expected: u32, found: u32 },

    #[error("Cannot load pruned branch")]
    PrunedBranch,

    #[error("Cannot load virtualized pruned branch")]
    Virtualization,

    #[error("Cell source destroyed: {0}")]
    Destroyed(String),

    #[error("Cell not found: {0}")]
    NotFound(String),

    #[error("Merkle error: {0}")]
    Merkle(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Config error: {0}")]
    Config(String),
}

impl Error {
    /// Whether the failure only means the input was cut short
    pub fn is_truncated(&self) -> bool {
        matches!(self, Error::NotEnoughData { .. })
    }
}

impl Clone for Error {
    fn clone(&self) -> Self {
        match self {
            Error::Io(e) => Error::Io(std::io::Error::new(e.kind(), e.to_string())),
            Error::Serialization(e) => Error::Corruption(e.to_string()),
            Error::Json(e) => Error::Config(e.to_string()),
            Error::InvalidCell(s) => Error::InvalidCell(s.clone()),
            Error::CellWrite(s) => Error::CellWrite(s.clone()),
            Error::BocParse(s) => Error::BocParse(s.clone()),
            Error::NotEnoughData { needed, available } => Error::NotEnoughData {
                needed: *needed,
                available: *available,
            },
            Error::ChecksumMismatch { expected, found } => Error::ChecksumMismatch {
                expected: *expected,
                found: *found,
            },
            Error::PrunedBranch => Error::PrunedBranch,
            Error::Virtualization => Error::Virtualization,
            Error::Destroyed(s) => Error::Destroyed(s.clone()),
            Error::NotFound(s) => Error::NotFound(s.clone()),
            Error::Merkle(s) => Error::Merkle(s.clone()),
            Error::Corruption(s) => Error::Corruption(s.clone()),
            Error::Backend(s) => Error::Backend(s.clone()),
            Error::Config(s) => Error::Config(s.clone()),
        }
    }
}
