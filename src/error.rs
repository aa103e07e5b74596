use crate::types::ThreadId;
use thiserror::Error;

pub type Result<T> = core::result::Result<T, UthreadError>;

/// Caller mistakes. Each is reported on stderr with the
/// `thread library error:` prefix and returned to the caller.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum UthreadError {
    #[error("non-positive quantum: {0}")]
    NonPositiveQuantum(i32),

    #[error("thread library is not initialized")]
    NotInitialized,

    #[error("thread library is already initialized")]
    AlreadyInitialized,

    #[error("no room for another thread ({0} already live)")]
    ThreadLimitReached(usize),

    #[error("no thread with id {0}")]
    UnknownThread(ThreadId),

    #[error("the main thread cannot be blocked")]
    CannotBlockMain,

    #[error("mutex is already held by the calling thread")]
    MutexAlreadyHeld,

    #[error("mutex is not held by the calling thread")]
    MutexNotHeld,
}

/// Report a failed host facility and terminate the process.
///
/// Signal registration, timer installation, mask manipulation and context
/// transfer have no recovery path: their failure means the environment the
/// library was promised does not exist.
pub(crate) fn die(what: &str) -> ! {
    eprintln!("system error: {what}");
    std::process::exit(1);
}

/// Variant of [`die`] for paths the timer handler can reach: one raw
/// write of a fixed message, then immediate exit. No formatting, no
/// buffering, no allocation.
pub(crate) fn die_raw(msg: &'static str) -> ! {
    unsafe {
        libc::write(libc::STDERR_FILENO, msg.as_ptr().cast(), msg.len());
        libc::_exit(1);
    }
}
