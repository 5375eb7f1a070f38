//! Error types for the lwt runtime.
//!
//! This module defines the status codes and error type returned by the
//! recoverable, fallible operations in the runtime (readiness-event
//! registration, timer setup, thread-pool exhaustion). Invariant
//! violations -- misuse that indicates a programming error rather than an
//! operating condition -- panic directly instead of flowing through here;
//! see the crate-level error handling notes.

use std::fmt;

/// Status codes returned by fallible runtime operations.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Operation completed successfully.
    Ok = 0,

    /// Insufficient memory available.
    NoMemory = 1,

    /// Operation not supported on this platform.
    NotSupported = 2,

    /// Invalid arguments provided.
    InvalidArgs = 3,

    /// Resource not found.
    NotFound = 4,

    /// Resource already exists / already registered.
    AlreadyExists = 5,

    /// Operation would block.
    WouldBlock = 6,

    /// Access denied by the kernel.
    AccessDenied = 7,

    /// I/O error from a kernel facility (epoll, pipe).
    IoError = 8,

    /// Runtime or primitive is in a state that forbids the operation.
    BadState = 9,

    /// Operation timed out.
    TimedOut = 10,

    /// A deadlock cycle was detected.
    Deadlock = 11,

    /// The readiness-event subsystem or an event was closed.
    Closed = 12,

    /// Resource busy (thread pool has no idle worker, etc).
    Busy = 13,

    /// Internal error -- should not happen; logged at error level.
    Internal = 14,
}

impl Status {
    /// Convert a raw status code back into a `Status`.
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            0 => Status::Ok,
            1 => Status::NoMemory,
            2 => Status::NotSupported,
            3 => Status::InvalidArgs,
            4 => Status::NotFound,
            5 => Status::AlreadyExists,
            6 => Status::WouldBlock,
            7 => Status::AccessDenied,
            8 => Status::IoError,
            9 => Status::BadState,
            10 => Status::TimedOut,
            11 => Status::Deadlock,
            12 => Status::Closed,
            13 => Status::Busy,
            _ => Status::Internal,
        }
    }

    /// Convert to a raw status code.
    pub fn into_raw(self) -> i32 {
        self as i32
    }

    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }

    pub fn is_err(self) -> bool {
        self != Status::Ok
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Ok => write!(f, "operation successful"),
            Status::NoMemory => write!(f, "insufficient memory"),
            Status::NotSupported => write!(f, "operation not supported"),
            Status::InvalidArgs => write!(f, "invalid arguments"),
            Status::NotFound => write!(f, "resource not found"),
            Status::AlreadyExists => write!(f, "resource already exists"),
            Status::WouldBlock => write!(f, "operation would block"),
            Status::AccessDenied => write!(f, "access denied"),
            Status::IoError => write!(f, "I/O error"),
            Status::BadState => write!(f, "bad state"),
            Status::TimedOut => write!(f, "operation timed out"),
            Status::Deadlock => write!(f, "deadlock detected"),
            Status::Closed => write!(f, "resource closed"),
            Status::Busy => write!(f, "resource busy"),
            Status::Internal => write!(f, "internal error"),
        }
    }
}

/// Result alias used pervasively by fallible runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type wrapping a [`Status`] with an optional context string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    status: Status,
    context: Option<String>,
}

impl Error {
    pub fn new(status: Status) -> Self {
        Self {
            status,
            context: None,
        }
    }

    pub fn with_context(status: Status, context: impl Into<String>) -> Self {
        Self {
            status,
            context: Some(context.into()),
        }
    }

    pub fn status(&self) -> Status {
        self.status
    }

    /// Constructs an error from the last `errno` set by a failing libc call.
    pub fn from_errno(context: &str) -> Self {
        let raw = std::io::Error::last_os_error();
        let status = match raw.raw_os_error() {
            Some(libc::ENOMEM) => Status::NoMemory,
            Some(libc::EACCES) | Some(libc::EPERM) => Status::AccessDenied,
            Some(libc::EINVAL) => Status::InvalidArgs,
            Some(libc::EEXIST) => Status::AlreadyExists,
            Some(libc::ENOENT) => Status::NotFound,
            _ => Status::IoError,
        };
        Self::with_context(status, format!("{context}: {raw}"))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.context {
            Some(ctx) => write!(f, "{}: {}", self.status, ctx),
            None => write!(f, "{}", self.status),
        }
    }
}

impl std::error::Error for Error {}

impl From<Status> for Error {
    fn from(status: Status) -> Self {
        Self::new(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrips_through_raw() {
        let status = Status::from_raw(0);
        assert_eq!(status, Status::Ok);
        assert!(status.is_ok());
        assert!(!status.is_err());

        let status = Status::from_raw(4);
        assert_eq!(status, Status::NotFound);
        assert!(!status.is_ok());
        assert!(status.is_err());

        assert_eq!(Status::from_raw(999), Status::Internal);
    }

    #[test]
    fn error_carries_optional_context() {
        let err = Error::new(Status::NotFound);
        assert_eq!(err.status(), Status::NotFound);
        assert_eq!(err.to_string(), "resource not found");

        let err = Error::with_context(Status::Busy, "thread pool exhausted");
        assert_eq!(err.to_string(), "resource busy: thread pool exhausted");
    }

    #[test]
    fn from_status_conversion() {
        let err: Error = Status::Deadlock.into();
        assert_eq!(err.status(), Status::Deadlock);
    }
}
