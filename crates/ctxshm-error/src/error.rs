//! The main Error type for ctxshm.

use crate::{ErrorKind, ErrorStatus};
use std::fmt;

/// Unified error type for all ctxshm operations.
pub struct Error {
    kind: ErrorKind,
    message: String,
    status: ErrorStatus,
    operation: &'static str,
    context: Vec<(&'static str, String)>,
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl Error {
    /// Create a new error with the given kind and message.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let status = if kind.is_retryable() {
            ErrorStatus::Temporary
        } else {
            ErrorStatus::Permanent
        };

        Self {
            kind,
            message: message.into(),
            status,
            operation: "",
            context: Vec::new(),
            source: None,
        }
    }

    /// Get the error kind.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Get the error message
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Get the error status
    pub fn status(&self) -> ErrorStatus {
        self.status
    }

    /// Get the operation that caused this error
    pub fn operation(&self) -> &'static str {
        self.operation
    }

    /// Get the context key-value pairs
    pub fn context(&self) -> &[(&'static str, String)] {
        &self.context
    }

    /// Get the source error (if any).
    pub fn source_ref(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        self.source.as_ref().map(|e| e.as_ref())
    }

    /// Set the error status.
    pub fn with_status(mut self, status: ErrorStatus) -> Self {
        self.status = status;
        self
    }

    /// Mark as temporary (retryable)
    pub fn temporary(mut self) -> Self {
        self.status = ErrorStatus::Temporary;
        self
    }

    /// Mark as permanent (not retryable)
    pub fn permanent(mut self) -> Self {
        self.status = ErrorStatus::Permanent;
        self
    }

    /// Set the operation that caused this error.
    ///
    /// If an operation was already set, the previous one is moved to context
    /// as "called" to preserve the call chain.
    pub fn with_operation(mut self, operation: &'static str) -> Self {
        if !self.operation.is_empty() {
            self.context.push(("called", self.operation.to_string()));
        }
        self.operation = operation;
        self
    }

    /// Add context to the error
    pub fn with_context(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.context.push((key, value.into()));
        self
    }

    /// Set the source error.
    ///
    /// # Panics (debug only)
    /// Panics in debug mode if source was already set.
    pub fn set_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        debug_assert!(self.source.is_none(), "source error already set");
        self.source = Some(Box::new(source));
        self
    }

    /// Mark as persistent after failed retries.
    pub fn persist(mut self) -> Self {
        self.status = self.status.persist();
        self
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        self.status.is_retryable()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}) at {}", self.kind, self.status, self.operation)?;

        if !self.context.is_empty() {
            write!(f, ", context {{ ")?;
            for (i, (key, value)) in self.context.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}: {}", key, value)?;
            }
            write!(f, " }}")?;
        }

        if !self.message.is_empty() {
            write!(f, " => {}", self.message)?;
        }

        Ok(())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} ({}) at {}", self.kind, self.status, self.operation)?;

        if !self.message.is_empty() {
            writeln!(f)?;
            writeln!(f, "    Message: {}", self.message)?;
        }

        if !self.context.is_empty() {
            writeln!(f)?;
            writeln!(f, "    Context:")?;
            for (key, value) in &self.context {
                writeln!(f, "        {}: {}", key, value)?;
            }
        }

        if let Some(source) = &self.source {
            writeln!(f)?;
            writeln!(f, "    Source: {:?}", source)?;
        }

        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::FileNotFound,
            std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
            _ => ErrorKind::IoFailed,
        };
        Error::new(kind, err.to_string())
            .with_operation("io")
            .set_source(err)
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::new(ErrorKind::Unexpected, msg)
    }
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Error::new(ErrorKind::Unexpected, msg)
    }
}

impl Error {
    /// Create an Unexpected error.
    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unexpected, message)
    }

    /// Create an Unsupported error
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unsupported, message)
    }

    /// Create an InvalidArgument error
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, message)
    }

    /// Create a NotImplemented error
    pub fn not_implemented(feature: impl Into<String>) -> Self {
        let feature = feature.into();
        Self::new(
            ErrorKind::NotImplemented,
            format!("'{}' is not implemented", feature),
        )
        .with_context("feature", feature)
    }

    /// Create a CreationFailed error: a backend region could not be created.
    pub fn creation_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CreationFailed, message)
    }

    /// Create an AttachFailed error: a backend region could not be attached.
    pub fn attach_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AttachFailed, message)
    }

    /// Create a ShmemNotSupported error.
    pub fn shmem_not_supported(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ShmemNotSupported, message)
    }

    /// Create a BackendNotFound error.
    pub fn backend_not_found(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::new(
            ErrorKind::BackendNotFound,
            format!("backend '{}' not found", name),
        )
        .with_context("backend", name)
    }

    /// Create an InvalidHeader error.
    pub fn invalid_header(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidHeader, message)
    }

    /// Create an OutOfMemory error.
    pub fn out_of_memory(requested: usize) -> Self {
        Self::new(
            ErrorKind::OutOfMemory,
            format!("failed to allocate {} bytes", requested),
        )
        .with_context("requested_bytes", requested.to_string())
    }

    /// Create an InvalidFree error: `ptr` does not belong to this allocator,
    /// or was already freed.
    pub fn invalid_free(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidFree, message)
    }

    /// Create an AllocatorNotFound error.
    pub fn allocator_not_found(id: impl Into<String>) -> Self {
        let id = id.into();
        Self::new(
            ErrorKind::AllocatorNotFound,
            format!("allocator '{}' not registered", id),
        )
        .with_context("allocator_id", id)
    }

    /// Create an InvalidPointer error.
    pub fn invalid_pointer(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidPointer, message)
    }

    /// Create a TransportError.
    pub fn transport_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TransportError, message).temporary()
    }

    /// Create a SerializationFailed error.
    pub fn serialization_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::SerializationFailed, message)
    }

    /// Create a Deserialization error.
    pub fn deserialization(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Deserialization, message)
    }

    /// Create a ConnectionClosed error.
    pub fn connection_closed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConnectionClosed, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = Error::new(ErrorKind::OutOfMemory, "arena exhausted");
        assert_eq!(err.kind(), ErrorKind::OutOfMemory);
        assert_eq!(err.message(), "arena exhausted");
        assert_eq!(err.status(), ErrorStatus::Permanent);
    }

    #[test]
    fn test_error_with_context() {
        let err = Error::new(ErrorKind::InvalidFree, "double free")
            .with_operation("allocator::free")
            .with_context("offset", "4096")
            .with_context("allocator_id", "0:0:1");

        assert_eq!(err.operation(), "allocator::free");
        assert_eq!(err.context().len(), 2);
        assert_eq!(err.context()[0], ("offset", "4096".to_string()));
    }

    #[test]
    fn test_operation_chaining() {
        let err = Error::new(ErrorKind::TransportError, "send failed")
            .with_operation("transport::send")
            .with_operation("lightbeam::client_send");

        assert_eq!(err.operation(), "lightbeam::client_send");
        assert_eq!(err.context().len(), 1);
        assert_eq!(
            err.context()[0],
            ("called", "transport::send".to_string())
        );
    }

    #[test]
    fn test_temporary_status() {
        let err = Error::new(ErrorKind::Timeout, "recv timed out");
        assert!(err.is_retryable());

        let err = Error::new(ErrorKind::InvalidFree, "bad pointer");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_persist() {
        let err = Error::new(ErrorKind::TransportError, "connection reset").temporary();
        assert!(err.is_retryable());

        let err = err.persist();
        assert!(!err.is_retryable());
        assert_eq!(err.status(), ErrorStatus::Persistent);
    }

    #[test]
    fn test_display() {
        let err = Error::new(ErrorKind::OutOfMemory, "request exceeds arena capacity")
            .with_operation("arena::allocate")
            .with_context("requested_bytes", "8192")
            .with_context("remaining_bytes", "100");

        let display = format!("{}", err);
        assert!(display.contains("OutOfMemory"));
        assert!(display.contains("permanent"));
        assert!(display.contains("arena::allocate"));
        assert!(display.contains("requested_bytes: 8192"));
    }

    #[test]
    fn test_convenience_constructors() {
        let err = Error::out_of_memory(1024);
        assert_eq!(err.kind(), ErrorKind::OutOfMemory);
        assert!(err.context().iter().any(|(k, v)| *k == "requested_bytes" && v == "1024"));

        let err = Error::backend_not_found("ctx_store_0");
        assert_eq!(err.kind(), ErrorKind::BackendNotFound);

        let err = Error::shmem_not_supported("platform lacks POSIX shm");
        assert_eq!(err.kind(), ErrorKind::ShmemNotSupported);
    }

    #[test]
    fn test_set_source() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "region file missing");
        let err = Error::new(ErrorKind::BackendNotFound, "region not found").set_source(io_err);

        assert!(err.source_ref().is_some());
    }
}
