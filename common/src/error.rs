use std::time::Duration;

use thiserror::Error;

/// Result type alias used across the hashpin crates.
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Failure classes of the pinned session server.
///
/// Each variant maps to one failure domain: `Crypto` is fatal to startup,
/// `Handshake` ends a single inbound request, and the `Stream*` variants are
/// contained to one stream iteration unless the underlying transport error
/// says the whole session is gone (see [`Error::is_session_terminal`]).
#[derive(Debug, Error)]
pub enum Error {
    /// Identity generation failed (RNG, key generation or certificate encoding).
    #[error("crypto failure: {0}")]
    Crypto(String),

    /// The session upgrade did not complete.
    #[error("handshake failure: {0}")]
    Handshake(#[source] TransportError),

    /// Accepting the next inbound stream failed.
    #[error("stream accept failure: {0}")]
    StreamAccept(#[source] TransportError),

    /// Reading from or writing to a stream failed.
    #[error("stream I/O failure: {0}")]
    StreamIo(#[source] TransportError),

    /// Opening an outbound stream failed.
    #[error("stream open failure: {0}")]
    StreamOpen(#[source] TransportError),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error while binding or resolving addresses.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the failure means the owning session can no longer carry streams.
    ///
    /// Loops stop on session-terminal failures and log-and-continue on
    /// everything else.
    pub fn is_session_terminal(&self) -> bool {
        match self {
            Error::Handshake(_) => true,
            Error::StreamAccept(e) | Error::StreamIo(e) | Error::StreamOpen(e) => {
                e.is_session_closed()
            }
            Error::Crypto(_) | Error::Config(_) | Error::Io(_) => false,
        }
    }
}

/// Errors reported by a transport implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The session (or the connection under it) is gone.
    #[error("session closed: {0}")]
    SessionClosed(String),

    /// A single stream failed; the session is still usable.
    #[error("stream error: {0}")]
    Stream(String),

    /// The operation did not complete in time.
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
}

impl TransportError {
    /// Returns true when the error is scoped to the session, not one stream.
    pub fn is_session_closed(&self) -> bool {
        matches!(self, TransportError::SessionClosed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_errors_stay_local() {
        let err = Error::StreamIo(TransportError::Stream("reset by peer".into()));
        assert!(!err.is_session_terminal());

        let err = Error::StreamAccept(TransportError::TimedOut(Duration::from_secs(5)));
        assert!(!err.is_session_terminal());
    }

    #[test]
    fn session_closed_ends_the_loop() {
        let err = Error::StreamOpen(TransportError::SessionClosed("idle timeout".into()));
        assert!(err.is_session_terminal());
        assert_eq!(
            err.to_string(),
            "stream open failure: session closed: idle timeout"
        );
    }
}
