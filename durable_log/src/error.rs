//! The error taxonomy for `durable_log`, hand-rolled in the same style as
//! the teacher's `frame_allocator::AllocationError` and `block_io::IoError`
//! rather than pulled in from an error-derive crate the rest of the pack
//! doesn't already depend on.

use std::fmt;

/// Everything that can go wrong while operating a [`crate::DurableLog`].
#[derive(Debug)]
pub enum Error {
    /// Allocation could not make progress right now; retried internally and
    /// not normally expected to escape to a caller of the public API.
    Backpressure,
    /// A partial allocation expired because the page it targeted slid below
    /// `ReadOnlyAddress` before it could be completed. The caller must
    /// discard its pending allocation and start over.
    Restart,
    /// A device read or write failed. Fatal for the affected flush; does
    /// not advance `FlushedUntilAddress`.
    Io(std::io::Error),
    /// Persisting `RecoveryInfo` to the commit store failed. Fatal for the
    /// triggering commit; `CommittedUntilAddress` is left unchanged.
    CommitFailed(std::io::Error),
    /// A scan was requested over a genuinely malformed range (`begin > end`).
    InvalidRange { begin: i64, end: i64 },
    /// The log was misconfigured; returned from `DurableLog::open` before
    /// the allocator is initialized.
    Config(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Backpressure => write!(f, "allocation backpressure, retry"),
            Error::Restart => write!(f, "pending allocation expired, restart the append"),
            Error::Io(e) => write!(f, "device I/O error: {e}"),
            Error::CommitFailed(e) => write!(f, "commit store write failed: {e}"),
            Error::InvalidRange { begin, end } => {
                write!(f, "invalid scan range: begin {begin} > end {end}")
            }
            Error::Config(msg) => write!(f, "invalid log configuration: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) | Error::CommitFailed(e) => Some(e),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
