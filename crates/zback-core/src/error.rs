use thiserror::Error;

pub type Result<T> = std::result::Result<T, ZbackError>;

/// Failure classification consulted by the retry policy.
///
/// The upload scheduler, manifest reader and restore downloader all honor
/// this classification identically; backends never run their own retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Worth retrying: network, throttling, 5xx, timeouts.
    Transient,
    /// Retrying cannot help: bad arguments, invalid state, 4xx.
    Permanent,
    /// Authentication or authorization rejection.
    Authz,
    /// The requested object does not exist.
    NotFound,
}

#[derive(Debug, Error)]
pub enum ZbackError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("storage error: {message}")]
    Storage { message: String, transient: bool },

    #[error("access denied: {0}")]
    AuthDenied(String),

    #[error("not found: '{0}'")]
    NotFound(String),

    #[error("integrity failure: {0}")]
    IntegrityFailure(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("decompression error: {0}")]
    Decompression(String),

    #[error("unsupported backend: '{0}'")]
    UnsupportedBackend(String),

    #[error("unsupported manifest version: {0}")]
    UnsupportedVersion(u32),

    /// Planner verdict that no new work is needed. A first-class non-error
    /// outcome; the CLI maps it to its own exit code.
    #[error("nothing to do: destination is already up to date")]
    NoOp,

    #[error("interrupted")]
    Interrupted,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("manifest encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl ZbackError {
    /// Build a transient storage error.
    pub fn transient(message: impl Into<String>) -> Self {
        ZbackError::Storage {
            message: message.into(),
            transient: true,
        }
    }

    /// Build a permanent storage error.
    pub fn permanent(message: impl Into<String>) -> Self {
        ZbackError::Storage {
            message: message.into(),
            transient: false,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            ZbackError::Storage { transient: true, .. } => ErrorClass::Transient,
            ZbackError::Storage { transient: false, .. } => ErrorClass::Permanent,
            // Digest mismatches are retried: the object may have been read
            // through a corrupting path, and a re-download can succeed.
            ZbackError::IntegrityFailure(_) => ErrorClass::Transient,
            ZbackError::AuthDenied(_) => ErrorClass::Authz,
            ZbackError::NotFound(_) => ErrorClass::NotFound,
            ZbackError::Io(e) => {
                if io_error_is_transient(e) {
                    ErrorClass::Transient
                } else {
                    ErrorClass::Permanent
                }
            }
            _ => ErrorClass::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    pub fn is_not_found(&self) -> bool {
        self.class() == ErrorClass::NotFound
    }

    pub fn is_no_op(&self) -> bool {
        matches!(self, ZbackError::NoOp)
    }
}

/// Whether an I/O error is worth retrying.
pub fn io_error_is_transient(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_carry_their_classification() {
        assert_eq!(
            ZbackError::transient("throttled").class(),
            ErrorClass::Transient
        );
        assert_eq!(
            ZbackError::permanent("invalid argument").class(),
            ErrorClass::Permanent
        );
    }

    #[test]
    fn integrity_failures_are_transient() {
        let err = ZbackError::IntegrityFailure("sha256 mismatch".into());
        assert!(err.is_transient());
    }

    #[test]
    fn auth_and_not_found_classes() {
        assert_eq!(
            ZbackError::AuthDenied("403".into()).class(),
            ErrorClass::Authz
        );
        assert_eq!(
            ZbackError::NotFound("key".into()).class(),
            ErrorClass::NotFound
        );
        assert!(ZbackError::NotFound("key".into()).is_not_found());
    }

    #[test]
    fn transient_io_kinds() {
        let retryable = [
            std::io::ErrorKind::ConnectionReset,
            std::io::ErrorKind::ConnectionAborted,
            std::io::ErrorKind::BrokenPipe,
            std::io::ErrorKind::UnexpectedEof,
            std::io::ErrorKind::TimedOut,
        ];
        for kind in retryable {
            let err = ZbackError::Io(std::io::Error::new(kind, "test"));
            assert!(err.is_transient(), "{kind:?} should be transient");
        }
        let err = ZbackError::Io(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "test",
        ));
        assert!(!err.is_transient());
    }

    #[test]
    fn no_op_is_not_transient() {
        assert!(ZbackError::NoOp.is_no_op());
        assert!(!ZbackError::NoOp.is_transient());
    }
}
