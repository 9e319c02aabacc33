//! Error types and handling.
//!
//! [`Error`] is the error type surfaced by handlers, the per-exchange
//! dispatcher and [`serve`](crate::server::Server::try_serve). Wire-level
//! failures reported by a codec arrive as [`ProtoError`]; invalid server
//! configuration is a [`ConfigError`].
//!
//! Protocol-state violations (consuming a single-shot handle twice through
//! raw plumbing, a request head arriving in the middle of a body, a part
//! stream ending without its `End` part) are not represented here: they are
//! bugs in the core or in an adjacent codec and abort the process with a
//! panic.

use std::convert::Infallible;
use std::error::Error as StdError;
use std::fmt::{self, Display, Formatter};
use std::io::Error as IoError;

use crate::config::ConfigError;
use crate::proto::ProtoError;

/// A boxed error type for dynamic error handling.
pub type BoxedError = Box<dyn StdError + Send + Sync>;

/// The error type used throughout the crate.
///
/// Handler code usually produces the `Other` variant through
/// [`Error::other`]; the remaining variants are produced by the server
/// itself.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// Wire or transport failure reported by the protocol codec.
    Proto(ProtoError),
    /// Invalid server configuration.
    Config(ConfigError),
    /// Standard I/O error.
    Io(IoError),
    /// The server has shut down; its bound address is no longer available.
    ServerClosed,
    /// Any other error type wrapped as a boxed trait object.
    Other(BoxedError),
}

impl Error {
    /// Creates an `Error` from any error type.
    #[inline]
    pub fn other(error: impl Into<BoxedError>) -> Self {
        Self::Other(error.into())
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::Proto(e) => Display::fmt(e, f),
            Self::Config(e) => Display::fmt(e, f),
            Self::Io(e) => Display::fmt(e, f),
            Self::ServerClosed => f.write_str("server closed"),
            Self::Other(e) => Display::fmt(e, f),
        }
    }
}

impl StdError for Error {}

impl From<Infallible> for Error {
    #[inline]
    fn from(infallible: Infallible) -> Self {
        match infallible {}
    }
}
impl From<ProtoError> for Error {
    #[inline]
    fn from(e: ProtoError) -> Self {
        Self::Proto(e)
    }
}
impl From<ConfigError> for Error {
    #[inline]
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}
impl From<IoError> for Error {
    #[inline]
    fn from(e: IoError) -> Self {
        Self::Io(e)
    }
}
impl From<BoxedError> for Error {
    #[inline]
    fn from(e: BoxedError) -> Self {
        Self::Other(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_from() {
        use std::io;

        let err: Error = io::Error::other("oh no!").into();
        assert!(matches!(err, Error::Io(_)));

        let err: Error = ProtoError::Malformed("bad frame".into()).into();
        assert!(matches!(err, Error::Proto(_)));

        let err: Error = ConfigError::CustomVerifierWithoutMtls.into();
        assert!(matches!(err, Error::Config(_)));

        let err = Error::other(io::Error::other("custom error"));
        assert!(matches!(err, Error::Other(_)));
    }

    #[test]
    fn test_error_display() {
        let err: Error = std::io::Error::other("io error").into();
        assert_eq!(format!("{err}"), "io error");

        assert_eq!(format!("{}", Error::ServerClosed), "server closed");

        let err: Error = ProtoError::Malformed("truncated frame".into()).into();
        assert!(format!("{err}").contains("truncated frame"));
    }
}
