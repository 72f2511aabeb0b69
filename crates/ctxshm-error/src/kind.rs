//! Error kinds produced by the backend, allocator and lightbeam layers.

use strum_macros::{Display, IntoStaticStr};

/// The kind of error that occurred.
///
/// This enum categorizes errors so callers can match on `ErrorKind` instead
/// of parsing messages. New variants are added as needed; callers should
/// keep a catch-all arm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoStaticStr, Display)]
#[non_exhaustive]
pub enum ErrorKind {
    // =========================================================================
    // General errors
    // =========================================================================
    /// An unexpected error occurred - catch-all for unhandled cases
    Unexpected,

    /// The requested feature or operation is not supported
    Unsupported,

    /// Invalid configuration or parameters
    ConfigInvalid,

    /// Feature or operation not yet implemented
    NotImplemented,

    /// Invalid argument passed to a function
    InvalidArgument,

    /// Assertion or internal invariant failed
    AssertionFailed,

    // =========================================================================
    // Backend errors (region create / attach / destroy)
    // =========================================================================
    /// Failed to create a new memory backend region
    CreationFailed,

    /// Failed to attach to an existing memory backend region
    AttachFailed,

    /// Shared memory is not supported on this platform or configuration
    ShmemNotSupported,

    /// The named backend region could not be found
    BackendNotFound,

    /// The backend region header failed validation (bad magic, size mismatch)
    InvalidHeader,

    // =========================================================================
    // Allocator errors
    // =========================================================================
    /// Allocation request could not be satisfied
    OutOfMemory,

    /// A pointer passed to `Free` does not belong to the allocator, or was
    /// already freed
    InvalidFree,

    /// The allocator identifier does not resolve to a registered allocator
    AllocatorNotFound,

    /// A pointer dereference failed a bounds or backend-ownership check
    InvalidPointer,

    // =========================================================================
    // Lightbeam / transport errors
    // =========================================================================
    /// Failure within a transport (socket, RDMA) send/recv path
    TransportError,

    /// Failed to serialize metadata for the wire
    SerializationFailed,

    /// Failed to deserialize metadata read from the wire
    Deserialization,

    /// Peer closed the connection before the expected data arrived
    ConnectionClosed,

    // =========================================================================
    // IO / resource errors
    // =========================================================================
    /// File not found
    FileNotFound,

    /// Permission denied
    PermissionDenied,

    /// IO operation failed
    IoFailed,

    /// Resource exhausted (file descriptors, address space, ...)
    ResourceExhausted,

    /// Timeout occurred
    Timeout,
}

impl ErrorKind {
    /// Returns the error kind as a static string
    pub fn as_str(&self) -> &'static str {
        (*self).into()
    }

    /// Check if this error kind is retryable by default
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout
                | ErrorKind::ResourceExhausted
                | ErrorKind::IoFailed
                | ErrorKind::TransportError
                | ErrorKind::ConnectionClosed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_display() {
        assert_eq!(ErrorKind::OutOfMemory.to_string(), "OutOfMemory");
        assert_eq!(ErrorKind::InvalidFree.to_string(), "InvalidFree");
    }

    #[test]
    fn test_is_retryable() {
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(ErrorKind::TransportError.is_retryable());
        assert!(!ErrorKind::OutOfMemory.is_retryable());
        assert!(!ErrorKind::InvalidFree.is_retryable());
    }
}
