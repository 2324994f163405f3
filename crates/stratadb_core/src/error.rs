//! Error types for StrataDB core.

use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in StrataDB core operations.
///
/// Corruption and invariant failures are fatal: they are never retried or
/// repaired here, and callers are expected to abort the surrounding
/// transaction or refuse to open the store. See [`CoreError::is_fatal`].
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend or arena error.
    #[error("storage error: {0}")]
    Storage(#[from] stratadb_storage::StorageError),

    /// Checksum mismatch on a persisted node, record or block.
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Checksum stored alongside the data.
        expected: u32,
        /// Checksum computed from the data.
        actual: u32,
    },

    /// Persisted bytes are structurally damaged (truncated, bad lengths).
    #[error("corruption: {message}")]
    Corruption {
        /// Description of the corruption.
        message: String,
    },

    /// A structural invariant does not hold.
    #[error("invariant violation: {message}")]
    InvariantViolation {
        /// Which invariant failed.
        message: String,
    },

    /// Operation not permitted in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },

    /// Index key longer than the node format can hold.
    #[error("key too long: {len} bytes, max {max}")]
    KeyTooLong {
        /// Length of the rejected key.
        len: usize,
        /// Maximum supported key length.
        max: usize,
    },

    /// A value does not fit the persisted format.
    #[error("invalid format: {message}")]
    InvalidFormat {
        /// Description of the format issue.
        message: String,
    },
}

impl CoreError {
    /// Creates a corruption error.
    pub fn corruption(message: impl Into<String>) -> Self {
        Self::Corruption {
            message: message.into(),
        }
    }

    /// Creates an invariant violation error.
    pub fn invariant(message: impl Into<String>) -> Self {
        Self::InvariantViolation {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates an invalid format error.
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    /// Returns true for corruption and invariant failures.
    ///
    /// Storage-level corruption (a bad arena header, a read pointing into
    /// the header) counts as fatal too; exhaustion and plain I/O errors do not.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        use stratadb_storage::StorageError;
        match self {
            Self::ChecksumMismatch { .. }
            | Self::Corruption { .. }
            | Self::InvariantViolation { .. } => true,
            Self::Storage(StorageError::Corrupted(_) | StorageError::InvalidHeader(_)) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratadb_storage::StorageError;

    #[test]
    fn fatal_classification() {
        assert!(CoreError::ChecksumMismatch {
            expected: 1,
            actual: 2
        }
        .is_fatal());
        assert!(CoreError::invariant("keys out of order").is_fatal());
        assert!(CoreError::corruption("short node").is_fatal());
        assert!(!CoreError::invalid_operation("read-only overlay").is_fatal());
        assert!(!CoreError::from(StorageError::Exhausted {
            requested: 1,
            capacity: 1
        })
        .is_fatal());
        assert!(CoreError::from(StorageError::Corrupted("x".into())).is_fatal());
        assert!(!CoreError::invalid_format("field too long").is_fatal());
    }

    #[test]
    fn display_includes_hex_checksums() {
        let err = CoreError::ChecksumMismatch {
            expected: 0xdead_beef,
            actual: 0x1,
        };
        assert_eq!(
            err.to_string(),
            "checksum mismatch: expected deadbeef, got 00000001"
        );
    }
}
