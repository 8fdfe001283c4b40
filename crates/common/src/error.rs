//! Common error types shared across crates.

use thiserror::Error;

/// Error taxonomy for key-store, server and session operations.
///
/// Every variant is fatal to the running backup or restore, except
/// [`Error::Connectivity`], which the readiness poll retries until its
/// deadline.
#[derive(Debug, Error)]
pub enum Error {
    /// Required configuration is missing or invalid, e.g. an unset
    /// credential reference or an empty bucket name.
    #[error("configuration error: {0}")]
    Config(String),

    /// The unseal-mode selection names no backend, or more than one.
    #[error("unknown unseal mode: {0}")]
    UnknownMode(String),

    /// The target secret, object, or parameter does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The decrypt call failed or returned unusable plaintext.
    #[error("decrypt failed: {0}")]
    Decrypt(String),

    /// A checksum returned alongside decrypted data did not match.
    #[error("integrity check failed: {0}")]
    Integrity(String),

    /// The final persist step of a `set` failed.
    #[error("write failed: {0}")]
    Write(String),

    /// The remote server was unreachable or reported itself unusable.
    #[error("connectivity error: {0}")]
    Connectivity(String),

    /// A bounded wait ran out of time.
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// The server's storage backend cannot take snapshots.
    #[error("backend precondition failed: {0}")]
    BackendPrecondition(String),

    /// An external command exited unsuccessfully.
    #[error("command failed: {0}")]
    Command(String),

    /// An unexpected internal error occurred.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Short machine-readable code, suitable for a log field.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config(_) => "config",
            Error::UnknownMode(_) => "unknown_mode",
            Error::NotFound(_) => "not_found",
            Error::Decrypt(_) => "decrypt",
            Error::Integrity(_) => "integrity",
            Error::Write(_) => "write",
            Error::Connectivity(_) => "connectivity",
            Error::DeadlineExceeded(_) => "deadline_exceeded",
            Error::BackendPrecondition(_) => "backend_precondition",
            Error::Command(_) => "command",
            Error::Internal(_) => "internal",
        }
    }

    /// Returns `true` for errors the readiness poll may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Connectivity(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::NotFound(e.to_string())
        } else {
            Error::Internal(e.to_string())
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(Error::Config("x".into()).kind(), "config");
        assert_eq!(Error::UnknownMode("x".into()).kind(), "unknown_mode");
        assert_eq!(Error::Integrity("x".into()).kind(), "integrity");
        assert_eq!(
            Error::DeadlineExceeded("x".into()).kind(),
            "deadline_exceeded"
        );
    }

    #[test]
    fn only_connectivity_is_retryable() {
        assert!(Error::Connectivity("sealed".into()).is_retryable());
        assert!(!Error::NotFound("x".into()).is_retryable());
        assert!(!Error::DeadlineExceeded("x".into()).is_retryable());
    }

    #[test]
    fn io_not_found_maps_to_not_found() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        assert!(matches!(Error::from(io), Error::NotFound(_)));
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        assert!(matches!(Error::from(io), Error::Internal(_)));
    }

    #[test]
    fn display_includes_message() {
        let e = Error::NotFound("p-root-token in secret ns/keys".into());
        assert!(e.to_string().contains("p-root-token"));
    }
}
