//! Error types for the write+flush protocol core.

use std::fmt;

use thiserror::Error;

use crate::transport::CompletionStatus;

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, AofError>;

/// Local resource that ran out when an operation was attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    /// Every message buffer slot is lent out.
    BufferSlots,
    /// The send queue budget is used up.
    SendQueue,
    /// The receive queue budget is used up.
    ReceiveQueue,
    /// The completion queue budget is used up.
    CompletionQueue,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Resource::BufferSlots => "buffer slots",
            Resource::SendQueue => "send queue",
            Resource::ReceiveQueue => "receive queue",
            Resource::CompletionQueue => "completion queue",
        };
        f.write_str(name)
    }
}

/// Coarse error classification exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Local resource pressure. Retry after draining completions.
    Exhausted,
    /// Client demand exceeds the server's advertised capacity.
    CapacityTooSmall,
    /// The transport rejected a posted operation.
    PostFailure,
    /// A completion carried an error status.
    TransportError,
    /// A response named no outstanding request.
    CorrelationMismatch,
    /// No acknowledgment arrived in time.
    Timeout,
    /// The connection went away.
    ConnectionLost,
    /// A buffer slot was released or used by a non-owner.
    SlotOwnership,
    /// The caller handed in an unusable operation.
    InvalidRequest,
    /// Configuration is inconsistent.
    InvalidConfig,
    /// Wire encoding or decoding failed.
    Serialization,
    /// Local I/O failed.
    Io,
}

impl ErrorKind {
    /// Returns true if the caller may retry after draining completions.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Exhausted)
    }
}

/// Error variants for the protocol core.
#[derive(Debug, Error)]
pub enum AofError {
    /// A local resource is exhausted.
    #[error("{resource} exhausted")]
    Exhausted {
        /// Which resource ran out.
        resource: Resource,
    },

    /// Client wants more outstanding durability requests than the server accepts.
    #[error("remote capacity too small: requested {requested} durability messages, server accepts {remote}")]
    CapacityTooSmall {
        /// Durability messages the client wants outstanding.
        requested: u32,
        /// Server-advertised capacity.
        remote: u32,
    },

    /// The transport refused to post an operation.
    #[error("post failed for request {correlation_id}: {reason}")]
    PostFailure {
        /// Request whose post failed.
        correlation_id: u64,
        /// Transport diagnostic.
        reason: String,
    },

    /// A completion reported an error for a request.
    #[error("transport error for request {correlation_id}: {status:?}")]
    TransportError {
        /// Request the completion belongs to.
        correlation_id: u64,
        /// Completion status as reported.
        status: CompletionStatus,
    },

    /// A response arrived for an unknown request.
    #[error("no outstanding request with correlation id {correlation_id}")]
    CorrelationMismatch {
        /// Identifier carried by the response.
        correlation_id: u64,
    },

    /// The acknowledgment did not arrive in time.
    #[error("request {correlation_id} not acknowledged within {timeout_ms}ms")]
    Timeout {
        /// Request that timed out.
        correlation_id: u64,
        /// Configured timeout.
        timeout_ms: u64,
    },

    /// The connection is gone.
    #[error("connection lost: {reason}")]
    ConnectionLost {
        /// Why the connection is considered lost.
        reason: String,
    },

    /// Slot released twice or touched after release.
    #[error("buffer slot {index} is not owned by the caller")]
    SlotOwnership {
        /// Slot index named by the stale handle.
        index: usize,
    },

    /// Operation cannot be executed as described.
    #[error("invalid request: {reason}")]
    InvalidRequest {
        /// What is wrong with it.
        reason: String,
    },

    /// Configuration does not make sense.
    #[error("invalid configuration: {reason}")]
    InvalidConfig {
        /// What is wrong with it.
        reason: String,
    },

    /// Wire encoding or decoding failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Wraps standard I/O errors.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl AofError {
    /// Returns the taxonomy tag for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AofError::Exhausted { .. } => ErrorKind::Exhausted,
            AofError::CapacityTooSmall { .. } => ErrorKind::CapacityTooSmall,
            AofError::PostFailure { .. } => ErrorKind::PostFailure,
            AofError::TransportError { .. } => ErrorKind::TransportError,
            AofError::CorrelationMismatch { .. } => ErrorKind::CorrelationMismatch,
            AofError::Timeout { .. } => ErrorKind::Timeout,
            AofError::ConnectionLost { .. } => ErrorKind::ConnectionLost,
            AofError::SlotOwnership { .. } => ErrorKind::SlotOwnership,
            AofError::InvalidRequest { .. } => ErrorKind::InvalidRequest,
            AofError::InvalidConfig { .. } => ErrorKind::InvalidConfig,
            AofError::Serialization(_) => ErrorKind::Serialization,
            AofError::Io(_) => ErrorKind::Io,
        }
    }

    pub(crate) fn invalid_request(reason: impl Into<String>) -> Self {
        AofError::InvalidRequest {
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_config(reason: impl Into<String>) -> Self {
        AofError::InvalidConfig {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhausted_is_retryable() {
        let err = AofError::Exhausted {
            resource: Resource::BufferSlots,
        };
        assert_eq!(err.kind(), ErrorKind::Exhausted);
        assert!(err.kind().is_retryable());
        assert_eq!(format!("{}", err), "buffer slots exhausted");
    }

    #[test]
    fn test_capacity_too_small_message() {
        let err = AofError::CapacityTooSmall {
            requested: 3,
            remote: 2,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("requested 3"));
        assert!(msg.contains("accepts 2"));
        assert!(!err.kind().is_retryable());
    }

    #[test]
    fn test_transport_error_kind() {
        let err = AofError::TransportError {
            correlation_id: 9,
            status: CompletionStatus::RemoteError,
        };
        assert_eq!(err.kind(), ErrorKind::TransportError);
        assert!(format!("{}", err).contains("request 9"));
    }

    #[test]
    fn test_io_error_from_std() {
        let std_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: AofError = std_err.into();
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn test_helpers_build_expected_variants() {
        assert_eq!(
            AofError::invalid_request("zero length").kind(),
            ErrorKind::InvalidRequest
        );
        assert_eq!(
            AofError::invalid_config("no slots").kind(),
            ErrorKind::InvalidConfig
        );
    }
}
