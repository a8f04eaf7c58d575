//! The kernel's flat, POSIX-flavoured error code.
//!
//! Every fallible kernel call returns `Result<T, Error>`. There are no
//! exceptions and no hidden allocation failures in the core: constructors
//! that allocate expose the allocation failure through their own factory
//! (see `thread::Builder::spawn`).
use core::fmt;

/// An error returned by a kernel operation.
///
/// Variant names follow the POSIX errno they correspond to, since callers
/// composing these into higher-level APIs generally want exactly that
/// mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// Argument out of range, or a programming-error precondition was
    /// violated (e.g. locking a priority-protect mutex from a thread whose
    /// base priority exceeds the ceiling).
    Einval,
    /// A recursive lock attempt on an error-checking mutex by its own owner.
    Edeadlk,
    /// A non-blocking call found the resource unavailable, a recursive
    /// mutex reached its recursion cap, or a bounded signal queue is full.
    Eagain,
    /// A timed wait expired before the awaited event occurred.
    Etimedout,
    /// `try_lock` observed the mutex already owned.
    Ebusy,
    /// A non-owner attempted to unlock a mutex, or it was already unlocked.
    Eperm,
    /// A signal operation targeted (or was issued from) a thread that has
    /// signal reception disabled.
    Enotsup,
    /// A raw-queue call supplied a buffer whose size doesn't match the
    /// queue's configured element size.
    Emsgsize,
    /// A semaphore `post` would exceed its configured maximum value.
    Eoverflow,
}

impl Error {
    /// A short, lowercase description, in the style of `strerror`.
    pub const fn as_str(self) -> &'static str {
        match self {
            Error::Einval => "invalid argument",
            Error::Edeadlk => "resource deadlock would occur",
            Error::Eagain => "resource temporarily unavailable",
            Error::Etimedout => "timed out",
            Error::Ebusy => "resource busy",
            Error::Eperm => "operation not permitted",
            Error::Enotsup => "operation not supported",
            Error::Emsgsize => "message too long",
            Error::Eoverflow => "value too large",
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The outcome of a blocking wait that isn't a plain success.
///
/// Composed by callers into `Error::Etimedout` / signal-specific results;
/// kept distinct from `Error` because "woken by signal" isn't a failure for
/// every caller (e.g. `this_thread::wait`'s own success path *is* a signal
/// delivery).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnblockReason {
    /// The wait completed normally (the resource became available, a
    /// notification arrived, ...).
    Normal,
    /// The wait's deadline elapsed first.
    TimedOut,
    /// A thread parked in `waiting-for-signal` was unblocked by a matching
    /// signal.
    #[cfg(feature = "signals")]
    UnblockedBySignal,
}
