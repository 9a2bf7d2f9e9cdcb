//! Error types for the deque core.

use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in deque operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] pbd_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Segment framing is corrupted or invalid.
    #[error("segment corruption: {message}")]
    SegmentCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// Checksum mismatch detected.
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Expected checksum.
        expected: u32,
        /// Actual checksum.
        actual: u32,
    },

    /// The caller broke an ordering or usage rule of the deque.
    #[error("invariant violation: {message}")]
    InvariantViolation {
        /// Description of the violated rule.
        message: String,
    },

    /// An entry exceeds the configured size limits.
    #[error("entry of {size} bytes exceeds limit of {max} bytes")]
    EntryTooLarge {
        /// Size of the rejected entry.
        size: u64,
        /// Applicable limit.
        max: u64,
    },

    /// A seek could not be resolved to a segment.
    #[error("no segment holds entry id {id}")]
    NoSuchOffset {
        /// The requested entry id.
        id: i64,
    },

    /// Directory layout or file version cannot be used.
    #[error("invalid deque format: {message}")]
    InvalidFormat {
        /// Description of the format issue.
        message: String,
    },

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },

    /// The deque has been closed.
    #[error("deque is closed")]
    DequeClosed,

    /// No cursor with this name is open.
    #[error("cursor not found: {name}")]
    CursorNotFound {
        /// Name of the cursor.
        name: String,
    },

    /// Another process holds the deque lock.
    #[error("deque locked: another process has exclusive access")]
    DequeLocked,
}

/// Broad classification of [`CoreError`] values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller bug; never retried.
    Invariant,
    /// I/O failure; callers may retry.
    Io,
    /// On-disk data failed validation.
    Corruption,
    /// Seek target does not exist.
    SeekMiss,
    /// Entry rejected for size.
    SizeLimit,
    /// The deque directory cannot be opened.
    Directory,
    /// Operation not valid in the current state.
    State,
}

impl CoreError {
    /// Creates a segment corruption error.
    pub fn segment_corruption(message: impl Into<String>) -> Self {
        Self::SegmentCorruption {
            message: message.into(),
        }
    }

    /// Creates an invariant violation error.
    pub fn invariant(message: impl Into<String>) -> Self {
        Self::InvariantViolation {
            message: message.into(),
        }
    }

    /// Creates an invalid format error.
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates a cursor not found error.
    pub fn cursor_not_found(name: impl Into<String>) -> Self {
        Self::CursorNotFound { name: name.into() }
    }

    /// Returns the classification of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Storage(_) | Self::Io(_) => ErrorKind::Io,
            Self::SegmentCorruption { .. } | Self::ChecksumMismatch { .. } => {
                ErrorKind::Corruption
            }
            Self::InvariantViolation { .. } | Self::DequeClosed => ErrorKind::Invariant,
            Self::EntryTooLarge { .. } => ErrorKind::SizeLimit,
            Self::NoSuchOffset { .. } => ErrorKind::SeekMiss,
            Self::InvalidFormat { .. } | Self::DequeLocked => ErrorKind::Directory,
            Self::InvalidOperation { .. } | Self::CursorNotFound { .. } => ErrorKind::State,
        }
    }

    /// Returns true if the error describes damaged on-disk data.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        self.kind() == ErrorKind::Corruption
    }
}
