//! In-process transport over tokio duplex pipes.
//!
//! A [`MemorySession`] is the server half and a [`MemoryPeer`] the client half
//! of one logical session. Streams are [`tokio::io::DuplexStream`] pairs, so
//! partial reads, EOF on close and broken pipes behave like a real byte
//! stream. [`request`] produces an [`UpgradeRequest`] whose outcome the test
//! observes through a [`PendingResponse`].

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use http::StatusCode;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, DuplexStream},
    sync::{mpsc, oneshot, Mutex},
};
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::{
    error::TransportError,
    transport::{Rejected, Session, Stream, UpgradeRequest},
};

/// Per-stream pipe buffer.
const PIPE_CAPACITY: usize = 64 * 1024;
/// Streams one side may open before the other accepts any.
const BACKLOG: usize = 64;

/// Creates a connected session pair.
pub fn pair() -> (MemorySession, MemoryPeer) {
    let (to_server, from_peer) = mpsc::channel(BACKLOG);
    let (to_peer, from_server) = mpsc::channel(BACKLOG);
    let closed = CancellationToken::new();

    let session = MemorySession {
        incoming: Arc::new(Mutex::new(from_peer)),
        outgoing: to_peer,
        closed:   closed.clone(),
    };
    let peer = MemoryPeer {
        incoming: from_server,
        outgoing: to_server,
        closed:   closed.clone(),
        _guard:   closed.drop_guard(),
    };
    (session, peer)
}

/// Server half of an in-memory session.
#[derive(Clone)]
pub struct MemorySession {
    incoming: Arc<Mutex<mpsc::Receiver<DuplexStream>>>,
    outgoing: mpsc::Sender<DuplexStream>,
    closed:   CancellationToken,
}

impl MemorySession {
    /// Whether either side has closed the session.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl fmt::Debug for MemorySession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemorySession")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Session for MemorySession {
    type Stream = MemoryStream;

    async fn accept_stream(&self) -> Result<MemoryStream, TransportError> {
        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err(gone()),
            io = incoming.recv() => io.map(MemoryStream::new).ok_or_else(gone),
        }
    }

    async fn open_stream(&self) -> Result<MemoryStream, TransportError> {
        if self.closed.is_cancelled() {
            return Err(gone());
        }
        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        self.outgoing.send(remote).await.map_err(|_| gone())?;
        Ok(MemoryStream::new(local))
    }

    async fn closed(&self) -> TransportError {
        self.closed.cancelled().await;
        gone()
    }

    fn close(&self, _code: u32, _reason: &str) {
        self.closed.cancel();
    }

    fn peer(&self) -> String {
        "memory".to_string()
    }
}

/// Client half of an in-memory session. Dropping it closes the session.
pub struct MemoryPeer {
    incoming: mpsc::Receiver<DuplexStream>,
    outgoing: mpsc::Sender<DuplexStream>,
    closed:   CancellationToken,
    _guard:   DropGuard,
}

impl MemoryPeer {
    /// Opens a stream the server will see on `accept_stream`.
    pub async fn open_stream(&self) -> Result<MemoryStream, TransportError> {
        if self.closed.is_cancelled() {
            return Err(gone());
        }
        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        self.outgoing.send(remote).await.map_err(|_| gone())?;
        Ok(MemoryStream::new(local))
    }

    /// Waits for a stream opened by the server.
    pub async fn accept_stream(&mut self) -> Result<MemoryStream, TransportError> {
        tokio::select! {
            _ = self.closed.cancelled() => Err(gone()),
            io = self.incoming.recv() => io.map(MemoryStream::new).ok_or_else(gone),
        }
    }

    /// Returns a server-opened stream if one is already queued.
    pub fn try_accept_stream(&mut self) -> Option<MemoryStream> {
        self.incoming.try_recv().ok().map(MemoryStream::new)
    }

    /// Whether either side has closed the session.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Closes the session from the client side.
    pub fn close(self) {
        self.closed.cancel();
    }
}

/// One end of an in-memory stream. Dropping or closing it signals EOF.
pub struct MemoryStream {
    io: DuplexStream,
}

impl MemoryStream {
    fn new(io: DuplexStream) -> Self {
        Self { io }
    }
}

impl fmt::Debug for MemoryStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStream").finish_non_exhaustive()
    }
}

#[async_trait]
impl Stream for MemoryStream {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        self.io.read(buf).await.map_err(io_error)
    }

    async fn write(&mut self, buf: &[u8]) -> Result<usize, TransportError> {
        self.io.write(buf).await.map_err(io_error)
    }

    async fn write_all(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        self.io.write_all(buf).await.map_err(io_error)
    }

    fn close(self) -> Result<(), TransportError> {
        drop(self.io);
        Ok(())
    }
}

fn gone() -> TransportError {
    TransportError::SessionClosed("memory session closed".to_string())
}

fn io_error(e: std::io::Error) -> TransportError {
    TransportError::Stream(e.to_string())
}

/// What the server did with a [`MemoryRequest`].
#[derive(Debug)]
pub enum Response {
    /// The session was upgraded; the peer half is ready for use.
    Upgraded(MemoryPeer),
    /// The request was answered with a status.
    Status(StatusCode),
}

impl fmt::Debug for MemoryPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryPeer")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Observes the outcome of a [`MemoryRequest`].
pub struct PendingResponse {
    rx: oneshot::Receiver<Response>,
}

impl PendingResponse {
    /// Waits for the server's answer. `None` if the request was dropped
    /// without any answer.
    pub async fn wait(self) -> Option<Response> {
        self.rx.await.ok()
    }
}

/// An upgrade request targeting `path`.
pub fn request(path: &str) -> (MemoryRequest, PendingResponse) {
    build_request(path, false)
}

/// An upgrade request whose handshake fails while the request can still be
/// answered.
pub fn failing_request(path: &str) -> (MemoryRequest, PendingResponse) {
    build_request(path, true)
}

fn build_request(path: &str, fail: bool) -> (MemoryRequest, PendingResponse) {
    let (tx, rx) = oneshot::channel();
    (
        MemoryRequest {
            path: path.to_string(),
            fail,
            reply: tx,
        },
        PendingResponse { rx },
    )
}

/// In-memory [`UpgradeRequest`].
#[derive(Debug)]
pub struct MemoryRequest {
    path:  String,
    fail:  bool,
    reply: oneshot::Sender<Response>,
}

#[async_trait]
impl UpgradeRequest for MemoryRequest {
    type Session = MemorySession;

    fn path(&self) -> &str {
        &self.path
    }

    async fn upgrade(self) -> Result<MemorySession, Rejected<Self>> {
        if self.fail {
            return Err(Rejected {
                reason:  TransportError::Stream("handshake refused".to_string()),
                request: Some(self),
            });
        }
        let (session, peer) = pair();
        self.reply
            .send(Response::Upgraded(peer))
            .map_err(|_| Rejected::dropped(gone()))?;
        Ok(session)
    }

    async fn respond(self, status: StatusCode) -> Result<(), TransportError> {
        self.reply
            .send(Response::Status(status))
            .map_err(|_| TransportError::SessionClosed("requester went away".to_string()))
    }
}
