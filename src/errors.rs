//! Error taxonomy for the store.
//!
//! Four kinds, matching the four ways an operation can fail: an I/O failure
//! from the underlying file, a corrupt on-disk structure, a caller passing a
//! bad argument, or a caller misusing the cursor. A fifth, `RuntimeError`, is
//! reserved for invariant violations detected in memory (path-stack overflow).

use std::fmt;

#[derive(Debug)]
pub enum Error {
    /// Underlying read/write/seek/open failure.
    Io(std::io::Error),
    /// A sanity check on deserialized data failed: bad header, bad node,
    /// free-list cycle, LZO output length mismatch.
    Corrupt(String),
    /// Caller passed an invalid argument (oversized key).
    InvalidArgument(String),
    /// Caller asked for an operation that requires a current key/cursor.
    LogicError(String),
    /// An invariant that should be unreachable in a well-formed tree broke.
    RuntimeError(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "io error: {}", e),
            Error::Corrupt(msg) => write!(f, "corrupt data: {}", msg),
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            Error::LogicError(msg) => write!(f, "logic error: {}", msg),
            Error::RuntimeError(msg) => write!(f, "runtime error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::Io(err)
    }
}

/// Builds an `Error` of the named variant with a formatted message, in the
/// same spirit as the ad-hoc `err!` helper this crate grew up alongside.
#[macro_export]
macro_rules! err {
    ($variant:ident, $($arg:tt)*) => {
        $crate::errors::Error::$variant(format!($($arg)*))
    };
}

pub type Result<T> = std::result::Result<T, Error>;
