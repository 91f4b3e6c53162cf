//! Storage error types.

use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Storage error type.
///
/// `Clone` so that every caller coalesced onto one in-flight fetch can
/// receive the same error value.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    /// Path has no resolvable object.
    #[error("not found: {0}")]
    NotFound(String),

    /// Operation is invalid for this backend or virtual directory.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// Backend lacks the capability.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Expected a directory.
    #[error("not a folder: {0}")]
    NotAFolder(String),

    /// Path already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Duplicate identity on registration.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Operation observed cancellation.
    #[error("canceled")]
    Canceled,

    /// Operation ran past its deadline.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// Backend credentials were rejected.
    #[error("invalid credentials: {0}")]
    CredentialInvalid(String),

    /// Invalid path.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl StorageError {
    /// Create a NotFound error.
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound(path.into())
    }

    /// Create a NotSupported error.
    pub fn not_supported(what: impl Into<String>) -> Self {
        Self::NotSupported(what.into())
    }

    /// Create a NotImplemented error.
    pub fn not_implemented(what: impl Into<String>) -> Self {
        Self::NotImplemented(what.into())
    }

    /// Create a NotAFolder error.
    pub fn not_a_folder(path: impl Into<String>) -> Self {
        Self::NotAFolder(path.into())
    }

    /// Create an AlreadyExists error.
    pub fn already_exists(path: impl Into<String>) -> Self {
        Self::AlreadyExists(path.into())
    }

    /// Create a Conflict error.
    pub fn conflict(what: impl Into<String>) -> Self {
        Self::Conflict(what.into())
    }

    /// Create an InvalidPath error.
    pub fn invalid_path(path: impl Into<String>) -> Self {
        Self::InvalidPath(path.into())
    }

    /// Create an Other error.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Prefix the message with operation context, keeping the variant.
    ///
    /// Callers can still match on `NotFound` after the error has been
    /// wrapped on its way up through the layers.
    pub fn context(self, ctx: impl std::fmt::Display) -> Self {
        match self {
            Self::NotFound(m) => Self::NotFound(format!("{ctx}: {m}")),
            Self::NotSupported(m) => Self::NotSupported(format!("{ctx}: {m}")),
            Self::NotImplemented(m) => Self::NotImplemented(format!("{ctx}: {m}")),
            Self::NotAFolder(m) => Self::NotAFolder(format!("{ctx}: {m}")),
            Self::AlreadyExists(m) => Self::AlreadyExists(format!("{ctx}: {m}")),
            Self::Conflict(m) => Self::Conflict(format!("{ctx}: {m}")),
            Self::CredentialInvalid(m) => Self::CredentialInvalid(format!("{ctx}: {m}")),
            Self::InvalidPath(m) => Self::InvalidPath(format!("{ctx}: {m}")),
            Self::Other(m) => Self::Other(format!("{ctx}: {m}")),
            Self::Io(e) => Self::Other(format!("{ctx}: {e}")),
            e @ (Self::Canceled | Self::DeadlineExceeded) => e,
        }
    }

    /// Returns true for `NotFound`.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Returns true for `Canceled`.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }
}

impl From<io::Error> for StorageError {
    fn from(e: io::Error) -> Self {
        // Storage errors tunneled through an async reader come back as-is.
        if let Some(inner) = e.get_ref().and_then(|i| i.downcast_ref::<StorageError>()) {
            return inner.clone();
        }
        match e.kind() {
            io::ErrorKind::NotFound => Self::NotFound(e.to_string()),
            io::ErrorKind::AlreadyExists => Self::AlreadyExists(e.to_string()),
            io::ErrorKind::NotADirectory => Self::NotAFolder(e.to_string()),
            _ => Self::Io(Arc::new(e)),
        }
    }
}

/// Convert StorageError to std::io::Error for stream adapters.
impl From<StorageError> for io::Error {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound(msg) => io::Error::new(io::ErrorKind::NotFound, msg),
            StorageError::AlreadyExists(msg) => io::Error::new(io::ErrorKind::AlreadyExists, msg),
            StorageError::NotAFolder(msg) => io::Error::new(io::ErrorKind::NotADirectory, msg),
            StorageError::InvalidPath(msg) => io::Error::new(io::ErrorKind::InvalidInput, msg),
            StorageError::Canceled => io::Error::other(StorageError::Canceled),
            StorageError::DeadlineExceeded => {
                io::Error::new(io::ErrorKind::TimedOut, "deadline exceeded")
            }
            StorageError::Io(e) => io::Error::new(e.kind(), e.to_string()),
            other => io::Error::other(other.to_string()),
        }
    }
}

/// Storage result type.
pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_keeps_variant() {
        let err = StorageError::not_found("/a/b").context("failed get parent list");
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "not found: failed get parent list: /a/b");

        let err = StorageError::Canceled.context("copy");
        assert!(err.is_canceled());
    }

    #[test]
    fn test_io_roundtrip_kinds() {
        let err: StorageError = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert!(err.is_not_found());

        // EINTR is an ordinary I/O error, not a cancellation.
        let err: StorageError = io::Error::new(io::ErrorKind::Interrupted, "eintr").into();
        assert!(matches!(err, StorageError::Io(_)));

        let back: io::Error = StorageError::Canceled.into();
        assert_ne!(back.kind(), io::ErrorKind::Interrupted);
        let err: StorageError = back.into();
        assert!(err.is_canceled());
    }
}
