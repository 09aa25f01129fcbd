//! Error types for HybridKV
//!
//! `NotFound` and `Pending` are ordinary operation results and never
//! appear here.

use crate::types::CheckpointToken;
use thiserror::Error;

/// Common result type for HybridKV operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for HybridKV
#[derive(Debug, Error)]
pub enum Error {
    // Device errors
    #[error("device I/O error: {0}")]
    DeviceIo(#[from] std::io::Error),

    #[error("device error: {0}")]
    Device(String),

    #[error("checksum mismatch at {location}")]
    ChecksumMismatch { location: String },

    // Log and index errors
    #[error("record of {size} bytes does not fit in a {page_size} byte page")]
    RecordTooLarge { size: usize, page_size: usize },

    #[error("hash index capacity exceeded ({slots} slots)")]
    CapacityExceeded { slots: u64 },

    #[error("log address space exhausted")]
    AddressSpaceExhausted,

    // Checkpoint errors
    #[error("checkpoint not found: {0}")]
    CheckpointNotFound(CheckpointToken),

    #[error("no checkpoint available")]
    NoCheckpoint,

    #[error("corrupted checkpoint metadata: {0}")]
    CorruptedMetadata(String),

    #[error("checkpoint {token} failed: {reason}")]
    CheckpointFailed {
        token: CheckpointToken,
        reason: String,
    },

    // Usage errors
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    // Encoding errors
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a device error
    pub fn device(msg: impl Into<String>) -> Self {
        Self::Device(msg.into())
    }

    /// Create an invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create a corrupted metadata error
    pub fn corrupted(msg: impl Into<String>) -> Self {
        Self::CorruptedMetadata(msg.into())
    }

    /// Check if the caller may reasonably retry the operation
    ///
    /// Device errors are surfaced as-is and never retried by the engine.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::CapacityExceeded { .. })
    }

    /// Check if this error indicates on-disk corruption
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::CorruptedMetadata(_) | Self::ChecksumMismatch { .. } | Self::Deserialization(_)
        )
    }

    /// Check if this error came from a storage device
    #[must_use]
    pub fn is_device_error(&self) -> bool {
        matches!(self, Self::DeviceIo(_) | Self::Device(_))
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Self::Deserialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(Error::CapacityExceeded { slots: 8 }.is_retryable());
        assert!(!Error::device("boom").is_retryable());
        assert!(Error::corrupted("bad crc").is_corruption());
        assert!(!Error::NoCheckpoint.is_corruption());
        assert!(Error::device("boom").is_device_error());
        assert!(
            Error::DeviceIo(std::io::Error::other("eio")).is_device_error()
        );
    }

    #[test]
    fn test_error_display() {
        let err = Error::RecordTooLarge {
            size: 9000,
            page_size: 4096,
        };
        assert_eq!(
            err.to_string(),
            "record of 9000 bytes does not fit in a 4096 byte page"
        );
    }
}
