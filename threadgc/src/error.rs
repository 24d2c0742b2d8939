use std::fmt;

use thiserror::Error;

use crate::ThreadId;

/// Recoverable failures surfaced to the runtime embedding the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ThreadError {
    #[error("out of memory")]
    OutOfMemory,
    #[error("thread {0} is already registered")]
    DuplicateRegistration(ThreadId),
    #[error("invalid stack bounds: cold end {cold:#x}, hot end {hot:#x}")]
    InvalidStackBounds { cold: usize, hot: usize },
    #[error("thread {0} is not registered")]
    NotRegistered(ThreadId),
    #[error("thread {0} has not finished")]
    StillRunning(ThreadId),
    #[error("thread {0} still holds a mutator handle")]
    StillInUse(ThreadId),
    #[error("invalid collector configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Failure reported by the OS threading layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{op} failed: {reason}")]
pub struct OsError {
    pub op: OsOp,
    pub reason: String,
}

impl OsError {
    pub fn new(op: OsOp, reason: impl Into<String>) -> Self {
        Self {
            op,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsOp {
    Suspend,
    Resume,
    CaptureContext,
}

impl fmt::Display for OsOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OsOp::Suspend => "suspend",
            OsOp::Resume => "resume",
            OsOp::CaptureContext => "capture_context",
        })
    }
}

/// Aborts the process after an OS primitive failed in a way that leaves
/// the stop-the-world state unrecoverable.
#[cold]
#[inline(never)]
pub fn fatal(op: OsOp, thread: ThreadId, detail: &dyn fmt::Display) -> ! {
    log::error!("fatal: {op} of thread {thread} failed: {detail}");
    eprintln!("threadgc: fatal: {op} of thread {thread} failed: {detail}");
    std::process::abort()
}
