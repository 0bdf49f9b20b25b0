//! # Decode Error Types
//!
//! Errors are split in two tiers. Reported errors (bad source, bad
//! destination, prefetch failures, write failures, cancellation) are expected
//! outcomes a caller can act on. Engine-protocol errors mean the decode engine
//! refused a call or broke its contract; they are returned, never turned into
//! a process exit.

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during a decode session.
#[derive(Error, Debug)]
pub enum DecodeError {
    // ========================================================================
    // Reported Errors
    // ========================================================================
    /// Source path missing, unreadable, or using an unsupported URI scheme.
    #[error("Source is not readable: {0}")]
    SourceUnreadable(String),

    /// Asset name unknown to the configured resolver.
    #[error("Asset not found: {0}")]
    AssetNotFound(String),

    /// Destination could not be opened for writing.
    #[error("Destination is not writable: {0}")]
    DestinationUnwritable(String),

    /// The engine never reported sufficient data within the poll budget.
    #[error("Prefetch timed out after {polls} polls ({waited:?})")]
    PrefetchTimeout { polls: u32, waited: Duration },

    /// The engine reported an open or fetch failure while prefetching or playing.
    #[error("Prefetch failed: {0}")]
    PrefetchFailed(String),

    /// The sink refused a write; output is truncated at `bytes_written`.
    #[error("Sink write failed after {bytes_written} bytes")]
    SinkWriteFailed { bytes_written: u64 },

    #[error("Decode cancelled")]
    Cancelled,

    #[error("Invalid decode configuration: {0}")]
    InvalidConfig(String),

    // ========================================================================
    // Engine-Protocol Errors
    // ========================================================================
    /// An engine call failed.
    #[error("Engine call `{operation}` failed: {reason}")]
    Engine {
        operation: &'static str,
        reason: String,
    },

    /// The engine delivered buffers out of enqueue order.
    #[error("Buffer delivered out of order: expected slot {expected}, got {actual}")]
    BufferOrderViolation { expected: usize, actual: usize },

    /// Internal error (should not occur in normal operation).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DecodeError {
    pub fn engine(operation: &'static str, reason: impl Into<String>) -> Self {
        DecodeError::Engine {
            operation,
            reason: reason.into(),
        }
    }

    /// Returns `true` for reported errors; `false` for engine-protocol and
    /// internal errors.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            DecodeError::Engine { .. }
                | DecodeError::BufferOrderViolation { .. }
                | DecodeError::Internal(_)
        )
    }

    /// Returns `true` if the failure happened before any audio was produced
    /// because of the source or destination.
    pub fn is_io_error(&self) -> bool {
        matches!(
            self,
            DecodeError::SourceUnreadable(_)
                | DecodeError::AssetNotFound(_)
                | DecodeError::DestinationUnwritable(_)
        )
    }

    /// Stable integer status for FFI-style callers. `0` is success and is never
    /// returned here.
    pub fn code(&self) -> i32 {
        match self {
            DecodeError::SourceUnreadable(_) => 1,
            DecodeError::AssetNotFound(_) => 2,
            DecodeError::DestinationUnwritable(_) => 3,
            DecodeError::PrefetchTimeout { .. } => 4,
            DecodeError::PrefetchFailed(_) => 5,
            DecodeError::SinkWriteFailed { .. } => 6,
            DecodeError::Cancelled => 7,
            DecodeError::InvalidConfig(_) => 8,
            DecodeError::Engine { .. } => 20,
            DecodeError::BufferOrderViolation { .. } => 21,
            DecodeError::Internal(_) => 99,
        }
    }
}

/// Result type for decode operations.
pub type Result<T> = std::result::Result<T, DecodeError>;
