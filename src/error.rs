use std::io;

use thiserror::Error;

/// Errors surfaced by the dispatch core.
///
/// Success is `Ok(())`; every recoverable failure is one of the kinds
/// below. [`Overflow`](DispatchError::Overflow) is the one fatal kind:
/// it is logged and the process aborts instead of the error being
/// returned, because selector fan-out is a fixed design bound.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// A descriptor read, write or close failed. Carries the OS error.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// The target dispatcher is stopping or stopped and no longer
    /// accepts events.
    #[error("dispatcher is not accepting events")]
    Unroutable,

    /// A blocking call was made from the thread it would have to wait
    /// on.
    #[error("call would block the dispatcher's own thread")]
    WouldDeadlock,

    /// More listeners than the selector can poll at once.
    #[error("selector poll capacity exceeded")]
    Overflow,

    /// A removal call matched no pending entry.
    #[error("no matching entry")]
    NotFound,

    /// Malformed argument.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
}

impl DispatchError {
    /// Captures `errno` from the last failed syscall.
    pub(crate) fn last_os_error() -> Self {
        DispatchError::Io(io::Error::last_os_error())
    }
}
