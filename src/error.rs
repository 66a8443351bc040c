//! Error handling.

use core::fmt;

/// Numeric error taxonomy of the filesystem core.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Errno {
    /// Allocation failure. Aborts the current pass.
    OutOfMemory,
    /// Device read failure or an undecodable btree node.
    Io,
    /// Transaction restart. Retried in place by the caller.
    Interrupted,
    /// Consistency damage the caller cannot continue from.
    Invalid,
    /// Missing entry.
    NotFound,
    /// No free buckets left on any device.
    NoSpace,
    /// A long-running pass was asked to stop.
    Shutdown,
    /// The requested repair cannot be performed at this level.
    Unsupported,
}

/// Error with an errno and an optional static message.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Error {
    errno: Errno,
    msg: Option<&'static str>,
}

impl Error {
    pub const fn new(errno: Errno) -> Self {
        Error { errno, msg: None }
    }

    pub const fn with_msg(errno: Errno, msg: &'static str) -> Self {
        Error {
            errno,
            msg: Some(msg),
        }
    }

    pub const fn errno(&self) -> Errno {
        self.errno
    }
}

impl From<Errno> for Error {
    fn from(errno: Errno) -> Self {
        Error::new(errno)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.msg {
            Some(msg) => write!(f, "{:?}: {}", self.errno, msg),
            None => write!(f, "{:?}", self.errno),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Return an `Error` with the given errno and message.
#[macro_export]
macro_rules! return_errno_with_msg {
    ($errno:expr, $msg:expr) => {
        return core::result::Result::Err($crate::error::Error::with_msg($errno, $msg))
    };
}

pub type Result<T> = core::result::Result<T, Error>;
