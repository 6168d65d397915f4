//! Tracer error types
//!
//! Administrative operations return these synchronously. The event-logging
//! fast path never surfaces them: a failed reservation is recorded in the
//! buffer's lost-event counter and the event is dropped.

use core::fmt;

/// Result type for tracer operations
pub type TraceResult<T> = Result<T, TraceError>;

/// Errors returned by administrative and reader-side operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceError {
    /// A trace or functor slot with that identity already exists
    AlreadyExists,
    /// No trace with that name
    NotFound,
    /// The trace is active (or otherwise in use) and cannot be changed
    Busy,
    /// The requested transport has not been registered
    NoTransport,
    /// Buffer or thread allocation failed
    NoMemory,
    /// No module is installed in the functor slot the operation needs
    NoModule,
    /// Bad name, sizing or CPU count
    InvalidArgument,
    /// The ring buffer has no room for the event
    NoSpace,
    /// A blocking user-space write gave up waiting for space
    Timeout,
}

impl TraceError {
    /// Short errno-style name used in log output
    pub const fn name(&self) -> &'static str {
        match self {
            TraceError::AlreadyExists => "EEXIST",
            TraceError::NotFound => "ENOENT",
            TraceError::Busy => "EBUSY",
            TraceError::NoTransport => "ENODEV",
            TraceError::NoMemory => "ENOMEM",
            TraceError::NoModule => "ENOSYS",
            TraceError::InvalidArgument => "EINVAL",
            TraceError::NoSpace => "ENOSPC",
            TraceError::Timeout => "ETIMEDOUT",
        }
    }
}

impl fmt::Display for TraceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceError::AlreadyExists => write!(f, "already exists"),
            TraceError::NotFound => write!(f, "trace not found"),
            TraceError::Busy => write!(f, "trace is busy"),
            TraceError::NoTransport => write!(f, "transport not found"),
            TraceError::NoMemory => write!(f, "out of memory"),
            TraceError::NoModule => write!(f, "no module installed"),
            TraceError::InvalidArgument => write!(f, "invalid argument"),
            TraceError::NoSpace => write!(f, "no space left in buffer"),
            TraceError::Timeout => write!(f, "timed out waiting for buffer space"),
        }
    }
}

impl std::error::Error for TraceError {}
