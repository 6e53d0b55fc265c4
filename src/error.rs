//! Error types for the multiplexing core.

use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Result type alias for muxwire operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in pipes, the frame codec and the multiplexors.
///
/// The type is `Clone` so an interrupted pipe can hand the same stored error
/// to every reader that asks for it.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Underlying transport I/O failed
    #[error("network error: {0}")]
    Network(#[source] Arc<io::Error>),

    /// Byte stream ended in the middle of a frame
    #[error("unexpected end of stream")]
    UnexpectedEof,

    /// Write on a pipe that was closed
    #[error("pipe closed")]
    ClosedPipe,

    /// Non-blocking write on a pipe whose buffer exceeds its limit
    #[error("buffer full")]
    BufferFull,

    /// Read or write deadline expired
    #[error("i/o timeout")]
    Timeout,

    /// Frame metadata does not fit in the 512 byte limit
    #[error("metadata too large: {0} bytes")]
    MetadataTooLarge(usize),

    /// Malformed frame content
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// Session status byte outside the known set
    #[error("unknown session status: 0x{0:02x}")]
    UnknownStatus(u8),

    /// Network byte outside the known set
    #[error("unknown network: 0x{0:02x}")]
    UnknownNetwork(u8),

    /// Destination cannot be encoded or dialed
    #[error("invalid target: {0}")]
    InvalidTarget(String),

    /// Peer closed the session with the error option set
    #[error("session {0} ended with error by peer")]
    PeerEnded(u16),

    /// The multiplexed connection went away under the session
    #[error("multiplexed connection closed")]
    ConnectionClosed,

    /// The multiplexed connection takes no more sessions right now
    #[error("multiplexed connection is full")]
    Busy,

    /// Session handler reported a failure
    #[error("handler error: {0}")]
    Handler(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            Error::UnexpectedEof
        } else {
            Error::Network(Arc::new(err))
        }
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Network(inner) => io::Error::new(inner.kind(), inner.to_string()),
            Error::UnexpectedEof => io::ErrorKind::UnexpectedEof.into(),
            Error::ClosedPipe => io::ErrorKind::BrokenPipe.into(),
            Error::Timeout => io::ErrorKind::TimedOut.into(),
            other => io::Error::new(io::ErrorKind::Other, other),
        }
    }
}

impl Error {
    /// Create a new invalid frame error
    pub fn invalid_frame(msg: impl Into<String>) -> Self {
        Error::InvalidFrame(msg.into())
    }

    /// Create a new invalid target error
    pub fn invalid_target(msg: impl Into<String>) -> Self {
        Error::InvalidTarget(msg.into())
    }

    /// Create a new handler error
    pub fn handler(msg: impl Into<String>) -> Self {
        Error::Handler(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Check if this error is a deadline expiry
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout)
    }

    /// Check if this error ends the whole multiplexed connection rather
    /// than a single session.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Error::Network(_)
                | Error::UnexpectedEof
                | Error::MetadataTooLarge(_)
                | Error::InvalidFrame(_)
                | Error::UnknownStatus(_)
                | Error::UnknownNetwork(_)
                | Error::ConnectionClosed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::UnknownStatus(0x09);
        assert_eq!(err.to_string(), "unknown session status: 0x09");

        let err = Error::MetadataTooLarge(600);
        assert_eq!(err.to_string(), "metadata too large: 600 bytes");
    }

    #[test]
    fn test_io_conversion() {
        let err: Error = io::Error::from(io::ErrorKind::UnexpectedEof).into();
        assert!(matches!(err, Error::UnexpectedEof));

        let err: Error = io::Error::from(io::ErrorKind::ConnectionReset).into();
        assert!(matches!(err, Error::Network(_)));

        let back: io::Error = Error::Timeout.into();
        assert_eq!(back.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn test_error_classification() {
        assert!(Error::UnknownStatus(7).is_connection_fatal());
        assert!(Error::ConnectionClosed.is_connection_fatal());
        assert!(!Error::PeerEnded(3).is_connection_fatal());
        assert!(!Error::InvalidTarget("x".into()).is_connection_fatal());
        assert!(Error::Timeout.is_timeout());
    }
}
