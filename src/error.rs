//! Error values returned by the threading primitives.

use std::any::Any;
use std::io;

use derive_more::Display;

/// The error type returned by thread, synchronization and thread-specific data operations.
///
/// Each variant corresponds to a POSIX error number, available through [`Error::errno`], so that callers porting code written against
/// `pthread_*` can keep their existing error handling.
#[derive(Debug, Display)]
pub enum Error {
    /// An argument was out of range, e.g. a stack size below [`MIN_STACK_SIZE`](crate::MIN_STACK_SIZE) or a key that was never created.
    #[display("invalid argument")]
    InvalidArgument,
    /// No thread-specific data key or thread slot is free, or a stack could not be allocated.
    #[display("resource temporarily unavailable")]
    ResourceExhausted,
    /// The thread does not exist, has already been joined, or is detached.
    #[display("no such thread")]
    NoSuchThread,
    /// The calling thread does not own the mutex it tried to release.
    #[display("operation not permitted: mutex is not owned by the calling thread")]
    OwnershipViolation,
    /// The operation would never complete, e.g. a thread joining itself or relocking a mutex it already holds.
    #[display("resource deadlock would occur")]
    Deadlock,
    /// The joined thread panicked. Carries the panic payload.
    #[display("thread panicked")]
    Panicked(Box<dyn Any + Send>),
    /// An error reported by the operating system.
    #[display("I/O error: {_0}")]
    Io(io::Error)
}

impl Error {
    /// Gets the POSIX error number equivalent to this error.
    pub fn errno(&self) -> libc::c_int {
        match *self {
            Error::InvalidArgument => libc::EINVAL,
            Error::ResourceExhausted => libc::EAGAIN,
            Error::NoSuchThread => libc::ESRCH,
            Error::OwnershipViolation => libc::EPERM,
            Error::Deadlock => libc::EDEADLK,
            Error::Panicked(_) => libc::ECANCELED,
            Error::Io(ref err) => err.raw_os_error().unwrap_or(libc::EIO)
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            Error::Io(ref err) => Some(err),
            _ => None
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::Io(err)
    }
}

pub type Result<T> = core::result::Result<T, Error>;
