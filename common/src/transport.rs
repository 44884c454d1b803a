//! Session and stream primitives consumed by the server core.
//!
//! The multiplexed secure transport itself lives behind these traits. The
//! QUIC/WebTransport implementation is in [`crate::webtransport`]; an
//! in-process implementation for tests is in `memory` (feature `memory`).

use async_trait::async_trait;
use http::StatusCode;

use crate::error::TransportError;

/// Upper bound for [`Stream::read_to_end`] when the caller does not care.
pub const DEFAULT_READ_TO_END_LIMIT: usize = 64 * 1024;

/// An inbound request asking to be upgraded into a [`Session`].
#[async_trait]
pub trait UpgradeRequest: Send + Sized + 'static {
    /// Session produced by a successful upgrade.
    type Session: Session;

    /// Request path, used for routing.
    fn path(&self) -> &str;

    /// Completes the upgrade handshake.
    ///
    /// When the handshake fails but a response can still be written, the
    /// request is handed back inside [`Rejected`].
    async fn upgrade(self) -> Result<Self::Session, Rejected<Self>>;

    /// Answers the request with a status instead of upgrading it.
    async fn respond(self, status: StatusCode) -> Result<(), TransportError>;
}

/// A failed upgrade.
#[derive(Debug)]
pub struct Rejected<R> {
    /// The original request when it is still able to carry a response.
    pub request: Option<R>,
    /// Why the upgrade failed.
    pub reason:  TransportError,
}

impl<R> Rejected<R> {
    /// A rejection where the request is gone with the failed handshake.
    pub fn dropped(reason: TransportError) -> Self {
        Self {
            request: None,
            reason,
        }
    }
}

/// One peer's multiplexed connection.
///
/// Handles are cheap to clone and every clone refers to the same session.
#[async_trait]
pub trait Session: Clone + Send + Sync + 'static {
    /// Stream type carried by this session.
    type Stream: Stream;

    /// Waits for the peer to open a bidirectional stream.
    async fn accept_stream(&self) -> Result<Self::Stream, TransportError>;

    /// Opens a bidirectional stream towards the peer.
    async fn open_stream(&self) -> Result<Self::Stream, TransportError>;

    /// Resolves once the session has terminated, with the reason.
    async fn closed(&self) -> TransportError;

    /// Closes the session immediately.
    fn close(&self, code: u32, reason: &str);

    /// Human readable peer description for logs.
    fn peer(&self) -> String;
}

/// A single bidirectional byte pipe inside a [`Session`].
#[async_trait]
pub trait Stream: Send + 'static {
    /// Reads once into `buf`. `Ok(0)` means the peer finished its side.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Writes once and returns how many bytes were accepted.
    async fn write(&mut self, buf: &[u8]) -> Result<usize, TransportError>;

    /// Writes all of `buf`.
    async fn write_all(&mut self, buf: &[u8]) -> Result<(), TransportError>;

    /// Finishes the stream. Consumes it: streams are single use.
    fn close(self) -> Result<(), TransportError>;

    /// Reads until the peer finishes, failing past `limit` bytes.
    async fn read_to_end(&mut self, limit: usize) -> Result<Vec<u8>, TransportError> {
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = self.read(&mut buf).await?;
            if n == 0 {
                return Ok(out);
            }
            if out.len() + n > limit {
                return Err(TransportError::Stream(format!(
                    "stream exceeded {limit} bytes"
                )));
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    /// Reads until the peer finishes and returns the byte count.
    async fn drain(&mut self) -> Result<u64, TransportError> {
        let mut total = 0u64;
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            match self.read(&mut buf).await? {
                0 => return Ok(total),
                n => total += n as u64,
            }
        }
    }
}
