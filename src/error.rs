use hyper::StatusCode;
use thiserror::Error;

/// Classification of a backend failure, independent of the storage scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    NotFound,
    Auth,
    Connectivity,
    Protocol,
}

impl std::fmt::Display for StorageErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageErrorKind::NotFound => write!(f, "not found"),
            StorageErrorKind::Auth => write!(f, "authentication failure"),
            StorageErrorKind::Connectivity => write!(f, "connectivity failure"),
            StorageErrorKind::Protocol => write!(f, "protocol error"),
        }
    }
}

#[derive(Error, Debug, Clone)]
#[error("{kind}: {message}")]
pub struct StorageError {
    pub kind: StorageErrorKind,
    pub message: String,
}

impl StorageError {
    pub fn new(kind: StorageErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn not_found(key: &str) -> Self {
        Self::new(StorageErrorKind::NotFound, format!("object '{}' does not exist", key))
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == StorageErrorKind::NotFound
    }

    pub fn from_io(err: &std::io::Error, key: &str) -> Self {
        use std::io::ErrorKind;

        let kind = match err.kind() {
            ErrorKind::NotFound | ErrorKind::NotADirectory => StorageErrorKind::NotFound,
            ErrorKind::PermissionDenied => StorageErrorKind::Auth,
            ErrorKind::TimedOut
            | ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::BrokenPipe => StorageErrorKind::Connectivity,
            _ => StorageErrorKind::Protocol,
        };
        Self::new(kind, format!("{}: {}", key, err))
    }
}

/// Per-request outcome of the serving pipeline.
///
/// Cloneable so a single backend failure can be handed to every request that
/// joined the same in-flight fetch.
#[derive(Error, Debug, Clone)]
pub enum ServeError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Backend error: {0}")]
    Backend(StorageError),

    #[error("Request timed out")]
    Timeout,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServeError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServeError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServeError::Forbidden(_) => StatusCode::FORBIDDEN,
            ServeError::NotFound(_) => StatusCode::NOT_FOUND,
            ServeError::Backend(e) if e.is_not_found() => StatusCode::NOT_FOUND,
            ServeError::Backend(_) => StatusCode::BAD_GATEWAY,
            ServeError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ServeError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            ServeError::NotFound(_) => true,
            ServeError::Backend(e) => e.is_not_found(),
            _ => false,
        }
    }
}

impl From<StorageError> for ServeError {
    fn from(err: StorageError) -> Self {
        if err.is_not_found() {
            ServeError::NotFound(err.message)
        } else {
            ServeError::Backend(err)
        }
    }
}

/// Startup failures. The process refuses to serve when one of these occurs.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON configuration: {0}")]
    Json(#[from] serde_json::Error),

    #[error("URL parsing error: {0}")]
    Url(#[from] url::ParseError),

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Storage backend error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ServeError::BadRequest("x".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(ServeError::Forbidden("x".into()).status(), StatusCode::FORBIDDEN);
        assert_eq!(ServeError::NotFound("x".into()).status(), StatusCode::NOT_FOUND);
        assert_eq!(ServeError::Timeout.status(), StatusCode::GATEWAY_TIMEOUT);

        for kind in [StorageErrorKind::Auth, StorageErrorKind::Connectivity, StorageErrorKind::Protocol] {
            let err = ServeError::Backend(StorageError::new(kind, "boom"));
            assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
        }
    }

    #[test]
    fn test_not_found_storage_error_becomes_not_found() {
        let err: ServeError = StorageError::not_found("a.txt").into();
        assert!(err.is_not_found());
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_io_error_classification() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        assert_eq!(StorageError::from_io(&io, "k").kind, StorageErrorKind::Auth);

        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        assert_eq!(StorageError::from_io(&io, "k").kind, StorageErrorKind::Connectivity);
    }
}
