use thiserror::Error;

use crate::protocol::Severity;

// ---

#[derive(Debug, Error)]
pub enum RtcpError {
    // ---
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid request sequence: {0}")]
    Sequence(String),

    #[error("request list too long: {received} bytes received (max {limit})")]
    RequestTooLong { received: usize, limit: usize },

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("cannot allocate {count} x {size} byte buffers")]
    OutOfMemory { count: usize, size: usize },

    #[error("too many concurrent waiters on {0}")]
    QueueFull(&'static str),

    #[error("operation cancelled by session error state")]
    Cancelled,

    #[error("request aborted by {0}")]
    Aborted(&'static str),

    #[error("tape service momentarily interrupted")]
    NoMoreTapes,

    #[error("drive error: {0}")]
    Drive(#[from] DriveError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RtcpError {
    /// Severity this error carries into the session error state.
    /// Authentication and sequencing problems are always FAILED, never retried.
    pub fn severity(&self) -> Severity {
        match self {
            RtcpError::Protocol(_)
            | RtcpError::Sequence(_)
            | RtcpError::RequestTooLong { .. }
            | RtcpError::PermissionDenied(_)
            | RtcpError::InvalidRequest(_)
            | RtcpError::Aborted(_) => Severity::FAILED | Severity::USER_ERROR,
            RtcpError::OutOfMemory { .. } | RtcpError::NoMoreTapes => Severity::RESELECT_SERVICE,
            RtcpError::QueueFull(_) => Severity::FAILED | Severity::SYSTEM_ERROR,
            RtcpError::Cancelled => Severity::NONE,
            RtcpError::Drive(e) => e.severity(),
            RtcpError::Io(_) => Severity::FAILED | Severity::SYSTEM_ERROR,
        }
    }

    /// errno-style code reported to the client
    pub fn code(&self) -> i32 {
        match self {
            RtcpError::Protocol(_) => libc::EPROTO,
            RtcpError::Sequence(_) | RtcpError::InvalidRequest(_) => libc::EINVAL,
            RtcpError::RequestTooLong { .. } => libc::E2BIG,
            RtcpError::PermissionDenied(_) => libc::EACCES,
            RtcpError::OutOfMemory { .. } => libc::ENOMEM,
            RtcpError::QueueFull(_) => libc::EAGAIN,
            RtcpError::Cancelled => libc::EINTR,
            RtcpError::Aborted(_) => libc::ECANCELED,
            RtcpError::NoMoreTapes => libc::EBUSY,
            RtcpError::Drive(e) => e.code(),
            RtcpError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

// ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveErrorKind {
    /// Transient; the whole transfer may be retried locally
    Retryable,
    /// Physical end of volume reached while writing
    EndOfVolume,
    /// End of data reached while reading
    EndOfData,
    Fatal,
}

#[derive(Debug, Error)]
#[error("{kind:?}: {message}")]
pub struct DriveError {
    pub kind: DriveErrorKind,
    pub message: String,
    #[source]
    pub source: Option<std::io::Error>,
}

impl DriveError {
    pub fn new(kind: DriveErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn io(kind: DriveErrorKind, message: impl Into<String>, source: std::io::Error) -> Self {
        Self {
            kind,
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn severity(&self) -> Severity {
        match self.kind {
            DriveErrorKind::Retryable => Severity::LOCAL_RETRY,
            DriveErrorKind::EndOfVolume | DriveErrorKind::EndOfData => Severity::END_OF_DATA,
            DriveErrorKind::Fatal => Severity::FAILED | Severity::SYSTEM_ERROR,
        }
    }

    pub fn code(&self) -> i32 {
        match self.kind {
            DriveErrorKind::Retryable => libc::EAGAIN,
            DriveErrorKind::EndOfVolume => libc::ENOSPC,
            DriveErrorKind::EndOfData => libc::ENODATA,
            DriveErrorKind::Fatal => self
                .source
                .as_ref()
                .and_then(|e| e.raw_os_error())
                .unwrap_or(libc::EIO),
        }
    }
}

// ---

pub type Result<T> = std::result::Result<T, RtcpError>;
