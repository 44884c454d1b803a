//! WebTransport over QUIC, backed by `quinn` and `web-transport-quinn`.

use std::{fmt, future::Future, net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use http::StatusCode;
use quinn::crypto::rustls::QuicServerConfig;
use rustls::crypto::CryptoProvider;
use web_transport_quinn::ALPN;

use crate::{
    error::{Error, Result, TransportError},
    identity::Identity,
    transport::{Rejected, Session, Stream, UpgradeRequest},
};

/// QUIC transport tuning shared by server and client endpoints.
#[derive(Debug, Clone, Copy)]
pub struct TransportTuning {
    /// Connections without traffic for this long are dropped.
    pub idle_timeout:       Duration,
    /// Keep-alive ping interval, keeps idle sessions open.
    pub keep_alive:         Option<Duration>,
    /// Concurrent bidirectional streams the peer may open.
    pub max_bidi_streams:   u32,
}

impl Default for TransportTuning {
    fn default() -> Self {
        Self {
            idle_timeout:     Duration::from_secs(30),
            keep_alive:       Some(Duration::from_secs(10)),
            max_bidi_streams: 100,
        }
    }
}

impl TransportTuning {
    /// Builds the quinn transport configuration.
    pub fn transport_config(&self) -> Result<quinn::TransportConfig> {
        let mut transport = quinn::TransportConfig::default();
        let idle = quinn::IdleTimeout::try_from(self.idle_timeout)
            .map_err(|e| Error::Config(format!("invalid idle timeout: {e}")))?;
        transport.max_idle_timeout(Some(idle));
        transport.keep_alive_interval(self.keep_alive);
        transport.max_concurrent_bidi_streams(quinn::VarInt::from_u32(self.max_bidi_streams));
        Ok(transport)
    }
}

/// The rustls crypto provider used by every hashpin endpoint.
pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

/// Builds a QUIC server configuration presenting `identity`.
///
/// TLS 1.3 only, ALPN `h3`, no client certificates, 0-RTT disabled.
pub fn server_config(identity: &Identity, tuning: &TransportTuning) -> Result<quinn::ServerConfig> {
    let mut tls = rustls::ServerConfig::builder_with_provider(crypto_provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| Error::Crypto(format!("TLS protocol setup failed: {e}")))?
        .with_no_client_auth()
        .with_single_cert(identity.certificate_chain(), identity.private_key())
        .map_err(|e| Error::Crypto(format!("certificate rejected by TLS stack: {e}")))?;
    tls.alpn_protocols = vec![ALPN.to_vec()];
    tls.max_early_data_size = 0;

    let crypto = QuicServerConfig::try_from(tls)
        .map_err(|e| Error::Crypto(format!("QUIC crypto setup failed: {e}")))?;

    let mut config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
    config.transport_config(Arc::new(tuning.transport_config()?));
    Ok(config)
}

/// Listening endpoint yielding WebTransport session requests.
pub struct QuinnListener {
    endpoint: quinn::Endpoint,
    server:   web_transport_quinn::Server,
}

impl QuinnListener {
    /// Binds a QUIC endpoint on `addr`. Requires a Tokio runtime.
    pub fn bind(addr: SocketAddr, config: quinn::ServerConfig) -> Result<Self> {
        let endpoint = quinn::Endpoint::server(config, addr)?;
        Ok(Self {
            server: web_transport_quinn::Server::new(endpoint.clone()),
            endpoint,
        })
    }

    /// Address the socket is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.endpoint.local_addr().map_err(Error::from)
    }

    /// Waits for the next session request. `None` once the endpoint is closed.
    pub async fn accept(&mut self) -> Option<QuinnRequest> {
        self.server.accept().await.map(QuinnRequest::new)
    }

    /// Closes every connection and stops accepting.
    pub fn close(&self) {
        self.endpoint.close(quinn::VarInt::from_u32(0), b"shutdown");
    }

    /// Waits until all connections are cleanly shut down.
    ///
    /// The returned future owns its own endpoint handle and does not borrow
    /// the listener.
    pub fn wait_idle(&self) -> impl Future<Output = ()> + Send + 'static {
        let endpoint = self.endpoint.clone();
        async move { endpoint.wait_idle().await }
    }
}

/// An HTTP/3 CONNECT request for a WebTransport session.
pub struct QuinnRequest {
    inner: web_transport_quinn::Request,
}

impl QuinnRequest {
    fn new(inner: web_transport_quinn::Request) -> Self {
        Self { inner }
    }
}

impl fmt::Debug for QuinnRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuinnRequest")
            .field("url", &self.inner.url().as_str())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl UpgradeRequest for QuinnRequest {
    type Session = QuinnSession;

    fn path(&self) -> &str {
        self.inner.url().path()
    }

    async fn upgrade(self) -> Result<QuinnSession, Rejected<Self>> {
        // `ok()` consumes the request: once writing the 200 fails the request
        // stream is broken and cannot carry another status.
        self.inner
            .ok()
            .await
            .map(QuinnSession::from)
            .map_err(|e| Rejected::dropped(TransportError::SessionClosed(e.to_string())))
    }

    async fn respond(self, status: StatusCode) -> Result<(), TransportError> {
        self.inner
            .close(status)
            .await
            .map_err(|e| TransportError::SessionClosed(e.to_string()))
    }
}

/// An established WebTransport session.
#[derive(Clone)]
pub struct QuinnSession {
    inner: web_transport_quinn::Session,
}

impl From<web_transport_quinn::Session> for QuinnSession {
    fn from(inner: web_transport_quinn::Session) -> Self {
        Self { inner }
    }
}

impl fmt::Debug for QuinnSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuinnSession")
            .field("peer", &self.peer())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Session for QuinnSession {
    type Stream = QuinnStream;

    async fn accept_stream(&self) -> Result<QuinnStream, TransportError> {
        let mut inner = self.inner.clone();
        let (send, recv) = inner.accept_bi().await.map_err(session_error)?;
        Ok(QuinnStream { send, recv })
    }

    async fn open_stream(&self) -> Result<QuinnStream, TransportError> {
        let mut inner = self.inner.clone();
        let (send, recv) = inner.open_bi().await.map_err(session_error)?;
        Ok(QuinnStream { send, recv })
    }

    async fn closed(&self) -> TransportError {
        let inner = self.inner.clone();
        session_error(inner.closed().await)
    }

    fn close(&self, code: u32, reason: &str) {
        let inner = self.inner.clone();
        inner.close(code, reason.as_bytes());
    }

    fn peer(&self) -> String {
        self.inner.remote_address().to_string()
    }
}

fn session_error(e: web_transport_quinn::SessionError) -> TransportError {
    TransportError::SessionClosed(e.to_string())
}

/// A bidirectional WebTransport stream.
pub struct QuinnStream {
    send: web_transport_quinn::SendStream,
    recv: web_transport_quinn::RecvStream,
}

impl fmt::Debug for QuinnStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuinnStream").finish_non_exhaustive()
    }
}

#[async_trait]
impl Stream for QuinnStream {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        match self.recv.read(buf).await {
            Ok(Some(n)) => Ok(n),
            Ok(None) => Ok(0),
            Err(web_transport_quinn::ReadError::SessionError(e)) => Err(session_error(e)),
            Err(e) => Err(TransportError::Stream(e.to_string())),
        }
    }

    async fn write(&mut self, buf: &[u8]) -> Result<usize, TransportError> {
        self.send.write(buf).await.map_err(write_error)
    }

    async fn write_all(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        self.send.write_all(buf).await.map_err(write_error)
    }

    fn close(mut self) -> Result<(), TransportError> {
        // Dropping `recv` tells the peer we will not read any further.
        self.send
            .finish()
            .map_err(|e| TransportError::Stream(e.to_string()))
    }
}

fn write_error(e: web_transport_quinn::WriteError) -> TransportError {
    match e {
        web_transport_quinn::WriteError::SessionError(e) => session_error(e),
        e => TransportError::Stream(e.to_string()),
    }
}
