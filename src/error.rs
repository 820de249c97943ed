use std::io;

/// Errors reported by the runtime to callers.
///
/// Most of these map directly onto the error kinds the source project's
/// eventer distinguishes: a collision on `add`, a miss on `remove`, a
/// caller passing the wrong mask to the wrong operation, rlimit exhaustion,
/// and multiplexer-level failure. `WouldBlock` is only ever surfaced via an
/// fd-op's `out_mask`, never as a `Result::Err`, but is kept here so fd-ops
/// implementations have a single error type to report through.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// `add` targeted an fd that already has a registered event.
    #[error("fd {fd} already has a registered event")]
    AlreadyRegistered { fd: i32 },

    /// A `remove`/`remove_fd`/`remove_timed`/`remove_recurrent` found nothing.
    #[error("no event registered for {0}")]
    NotFound(NotFoundKind),

    /// The caller passed an event of the wrong kind to an operation, e.g. a
    /// non-ASYNCH event to a job queue, or a non-TIMER event to the timer
    /// heap.
    #[error("misuse: {0}")]
    Misuse(&'static str),

    /// Raising the open-file rlimit (or otherwise acquiring a required
    /// resource) failed.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    /// The multiplexer itself reported a syscall failure on a specific fd.
    /// The runtime removes the offending event and delivers one EXCEPTION
    /// callback; this variant is what gets logged alongside that.
    #[error("backend failure on fd {fd}: {source}")]
    BackendFailure { fd: i32, #[source] source: io::Error },

    /// An fd operation would block; the operation should be retried once
    /// the interest bits written into `out_mask` become ready. Never
    /// returned from a registry-level `Result`; only used by `FdOps`
    /// implementations as their internal signaling convenience.
    #[error("operation would block")]
    WouldBlock,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum NotFoundKind {
    Fd(i32),
    Timer,
    Recurrent,
}

impl std::fmt::Display for NotFoundKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotFoundKind::Fd(fd) => write!(f, "fd {fd}"),
            NotFoundKind::Timer => write!(f, "timer"),
            NotFoundKind::Recurrent => write!(f, "recurrent event"),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
