//! Error types shared by all retag crates.
//!
//! Parsing and writing media containers distinguishes between low-level
//! stream faults, malformed framing, violated invariants in otherwise
//! well-formed bytes, and data that is simply absent. Callers frequently
//! downgrade [`Error::NoData`] to a warning and drop the affected entry
//! while everything else propagates.

use thiserror::Error;

/// Error type used throughout the retag crates.
#[derive(Error, Debug)]
pub enum Error {
    /// Unrecoverable stream fault.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed framing (e.g. an invalid VINT) or invalid child composition.
    #[error("parse error at offset {offset}: {message}")]
    Parse {
        /// Byte offset in the stream where parsing failed.
        offset: u64,
        /// Description of the framing problem.
        message: String,
    },

    /// Violated invariant in otherwise parseable bytes.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// An expected element is absent.
    #[error("no data found: {0}")]
    NoData(String),

    /// A feature this writer does not produce.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Cooperative cancellation.
    #[error("operation aborted")]
    Aborted,
}

impl Error {
    /// Create a parse error at the given stream offset.
    pub fn parse(offset: u64, message: impl Into<String>) -> Self {
        Error::Parse {
            offset,
            message: message.into(),
        }
    }

    /// Create an invalid-data error.
    pub fn invalid_data(message: impl Into<String>) -> Self {
        Error::InvalidData(message.into())
    }

    /// Create a no-data error.
    pub fn no_data(message: impl Into<String>) -> Self {
        Error::NoData(message.into())
    }

    /// Create a not-implemented error.
    pub fn not_implemented(message: impl Into<String>) -> Self {
        Error::NotImplemented(message.into())
    }

    /// Check whether this error is a cooperative abort.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        matches!(self, Error::Aborted)
    }

    /// Check whether this error reports absent data.
    ///
    /// Such errors are often downgraded to a warning by the caller.
    #[must_use]
    pub fn is_no_data(&self) -> bool {
        matches!(self, Error::NoData(_))
    }
}

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::parse(100, "invalid VINT");
        assert_eq!(err.to_string(), "parse error at offset 100: invalid VINT");

        let err = Error::no_data("no Tracks element");
        assert_eq!(err.to_string(), "no data found: no Tracks element");
    }

    #[test]
    fn test_predicates() {
        assert!(Error::Aborted.is_aborted());
        assert!(!Error::Aborted.is_no_data());
        assert!(Error::no_data("x").is_no_data());
        assert!(!Error::invalid_data("x").is_aborted());
    }

    #[test]
    fn test_io_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
