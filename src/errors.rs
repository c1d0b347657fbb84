//! Error taxonomy for the HTTP surface.
//!
//! Every failure the front-end can report maps to a stable `kind` string and
//! an HTTP status. Teardown failures never travel through here: cleanup is
//! best-effort and only logged.
use std::fmt;
use std::io;

#[derive(Debug)]
pub enum ApiError {
    /// Engine value outside the closed enumeration.
    InvalidEngine(String),
    /// Path is not absolute.
    InvalidPath(String),
    /// Path is absolute but outside every allow-list root.
    PathNotAllowed(String),
    /// Unknown run or warm container id.
    NotFound(String),
    /// Container runtime failure during create/start/attach.
    RuntimeError(String),
    /// Input write to the attach stream failed.
    WriteFailed(String),
    /// Credentials I/O failed; readiness could not be computed.
    ReadinessIndeterminate(String),
}

impl ApiError {
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::InvalidEngine(_) => "invalid-engine",
            ApiError::InvalidPath(_) => "invalid-path",
            ApiError::PathNotAllowed(_) => "path-not-allowed",
            ApiError::NotFound(_) => "not-found",
            ApiError::RuntimeError(_) => "runtime-error",
            ApiError::WriteFailed(_) => "write-failed",
            ApiError::ReadinessIndeterminate(_) => "readiness-indeterminate",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            ApiError::InvalidEngine(_) | ApiError::InvalidPath(_) | ApiError::PathNotAllowed(_) => {
                400
            }
            ApiError::NotFound(_) => 404,
            ApiError::RuntimeError(_) => 502,
            ApiError::WriteFailed(_) => 500,
            ApiError::ReadinessIndeterminate(_) => 500,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ApiError::InvalidEngine(m)
            | ApiError::InvalidPath(m)
            | ApiError::PathNotAllowed(m)
            | ApiError::NotFound(m)
            | ApiError::RuntimeError(m)
            | ApiError::WriteFailed(m)
            | ApiError::ReadinessIndeterminate(m) => m,
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind(), self.message())
    }
}

impl std::error::Error for ApiError {}

impl From<io::Error> for ApiError {
    fn from(e: io::Error) -> Self {
        ApiError::RuntimeError(e.to_string())
    }
}

/// Map an io::Error to a process exit code:
/// - 127 for NotFound (command not found)
/// - 1 for all other errors
pub fn exit_code_for_io_error(e: &io::Error) -> u8 {
    if e.kind() == io::ErrorKind::NotFound {
        127
    } else {
        1
    }
}
