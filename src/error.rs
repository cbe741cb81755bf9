//! Error types for the Mojette storage client

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the storage client
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Unknown layout choice (fatal at startup)
    #[error("Invalid layout: {0}")]
    InvalidLayout(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    // =========================================================================
    // Metadata Errors
    // =========================================================================
    /// Referenced file or volume does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Referenced file changed or disappeared under a cached handle
    #[error("Stale handle: {0}")]
    Stale(String),

    // =========================================================================
    // Placement Errors
    // =========================================================================
    /// No cluster can provide `safe` storages with free capacity
    #[error("No space left in volume {volume}")]
    NoSpace { volume: u16 },

    // =========================================================================
    // Transform / Block I/O Errors
    // =========================================================================
    /// Projection buffers or indices do not match the layout geometry
    #[error("Malformed projection input: {0}")]
    MalformedProjection(String),

    /// Byte range that does not fit in a file offset
    #[error("Invalid byte range: {0}")]
    InvalidRange(String),

    /// Not enough fragments could be written or read for a run
    #[error(
        "Insufficient fragments for run at block {first_block}: have {available}, need {required}"
    )]
    InsufficientFragments {
        first_block: u64,
        available: usize,
        required: usize,
    },

    /// A single storage call failed (the slot is skipped by the caller)
    #[error("Storage {host} failed: {reason}")]
    Storage { host: String, reason: String },
}

impl Error {
    /// Whether a cached view of the referenced entry must be dropped
    pub fn is_stale(&self) -> bool {
        matches!(self, Error::NotFound(_) | Error::Stale(_))
    }

    /// Shorthand for a failed storage call
    pub fn storage(host: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Error::Storage {
            host: host.into(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stale_classification() {
        assert!(Error::NotFound("fid".into()).is_stale());
        assert!(Error::Stale("fid".into()).is_stale());
        assert!(!Error::NoSpace { volume: 1 }.is_stale());
        assert!(!Error::storage("node-1", "refused").is_stale());
    }

    #[test]
    fn test_insufficient_fragments_message() {
        let err = Error::InsufficientFragments {
            first_block: 7,
            available: 1,
            required: 2,
        };
        assert_eq!(
            err.to_string(),
            "Insufficient fragments for run at block 7: have 1, need 2"
        );
    }
}
