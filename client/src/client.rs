use std::{
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use anyhow::{anyhow, bail, Context, Result};
use hashpin_common::{
    config::{DEFAULT_ADDR, DEFAULT_ROUTE, READ_LIMIT},
    error::Error,
    identity::{compute_pinning_hash, PinningHash},
    transport::{Session, Stream, DEFAULT_READ_TO_END_LIMIT},
    webtransport::{crypto_provider, QuinnSession, TransportTuning},
};
use quinn::crypto::rustls::QuicClientConfig;
use rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider},
    pki_types::{CertificateDer, ServerName, UnixTime},
    CertificateError, ClientConfig as RustlsClientConfig, DigitallySignedStruct, SignatureScheme,
};
use url::{Host, Url};
use web_transport_quinn::ALPN;

/// Configuration for the pinned client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Session URL
    pub url:         String,
    /// Accepted server certificate hashes
    pub cert_hashes: Vec<PinningHash>,
    /// Connection timeout
    pub timeout:     Duration,
    /// Enable verbose logging
    pub verbose:     bool,
    /// QUIC tuning
    pub transport:   TransportTuning,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url:         format!("https://{DEFAULT_ADDR}{DEFAULT_ROUTE}"),
            cert_hashes: Vec::new(),
            timeout:     Duration::from_secs(30),
            verbose:     false,
            transport:   TransportTuning::default(),
        }
    }
}

impl ClientConfig {
    /// Creates a client configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the session URL
    pub fn with_url<S: Into<String>>(mut self, url: S) -> Self {
        self.url = url.into();
        self
    }

    /// Add an accepted certificate hash
    pub fn with_cert_hash(mut self, hash: PinningHash) -> Self {
        self.cert_hashes.push(hash);
        self
    }

    /// Replace the accepted certificate hashes
    pub fn with_cert_hashes(mut self, hashes: Vec<PinningHash>) -> Self {
        self.cert_hashes = hashes;
        self
    }

    /// Set the connection timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Enable verbose logging
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Set the QUIC tuning
    pub fn with_transport(mut self, transport: TransportTuning) -> Self {
        self.transport = transport;
        self
    }
}

/// Trusts a server certificate only when its SHA-256 is pinned.
///
/// No chain, name or validity checks are made; handshake signatures are still
/// verified with the provider's algorithms.
#[derive(Debug)]
pub struct PinnedCertVerifier {
    hashes:   Vec<PinningHash>,
    provider: Arc<CryptoProvider>,
}

impl PinnedCertVerifier {
    pub fn new(hashes: Vec<PinningHash>, provider: Arc<CryptoProvider>) -> Self {
        Self { hashes, provider }
    }

    /// Whether `certificate` (DER) hashes to one of the pinned values.
    pub fn is_pinned(&self, certificate: &[u8]) -> bool {
        let hash = compute_pinning_hash(certificate);
        self.hashes.contains(&hash)
    }
}

impl ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if self.is_pinned(end_entity) {
            return Ok(ServerCertVerified::assertion());
        }

        tracing::warn!(
            presented = %compute_pinning_hash(end_entity).to_hex(),
            "server certificate does not match any pinned hash"
        );
        Err(rustls::Error::InvalidCertificate(
            CertificateError::ApplicationVerificationFailure,
        ))
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// A WebTransport client pinned to a set of certificate hashes
pub struct PinnedClient {
    url:      Url,
    quic:     quinn::ClientConfig,
    endpoint: quinn::Endpoint,
    timeout:  Duration,
    verbose:  bool,
}

impl PinnedClient {
    /// Creates a client and binds its local QUIC endpoint.
    ///
    /// Requires a Tokio runtime, even though the function is not async.
    pub fn new(config: ClientConfig) -> Result<Self> {
        if config.cert_hashes.is_empty() {
            bail!("At least one server certificate hash must be pinned");
        }

        let url = Url::parse(&config.url)
            .with_context(|| format!("Invalid session URL: {}", config.url))?;
        if url.scheme() != "https" {
            bail!("Session URL must use https, got {}", url.scheme());
        }

        let provider = crypto_provider();
        let verifier = PinnedCertVerifier::new(config.cert_hashes.clone(), provider.clone());

        let mut tls = RustlsClientConfig::builder_with_provider(provider)
            .with_protocol_versions(&[&rustls::version::TLS13])
            .context("Failed to restrict TLS to 1.3")?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_no_client_auth();
        tls.alpn_protocols = vec![ALPN.to_vec()];

        let crypto =
            QuicClientConfig::try_from(tls).context("Failed to build QUIC client crypto")?;
        let mut quic = quinn::ClientConfig::new(Arc::new(crypto));
        quic.transport_config(Arc::new(config.transport.transport_config()?));

        let bind: SocketAddr = match url.host() {
            Some(Host::Ipv6(_)) => (Ipv6Addr::UNSPECIFIED, 0).into(),
            _ => (Ipv4Addr::UNSPECIFIED, 0).into(),
        };
        let endpoint = quinn::Endpoint::client(bind).context("Failed to bind client endpoint")?;

        if config.verbose {
            tracing::info!(
                url = %url,
                pinned = config.cert_hashes.len(),
                "Client created"
            );
        }

        Ok(Self {
            url,
            quic,
            endpoint,
            timeout: config.timeout,
            verbose: config.verbose,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Opens a WebTransport session to the configured URL.
    pub async fn connect(&self) -> Result<QuinnSession> {
        tokio::time::timeout(self.timeout, self.establish())
            .await
            .map_err(|_| anyhow!("Timed out connecting to {} after {:?}", self.url, self.timeout))?
    }

    async fn establish(&self) -> Result<QuinnSession> {
        let (addr, server_name) = self.resolve().await?;
        if self.verbose {
            tracing::info!(%addr, %server_name, "Connecting to hashpin server");
        }

        let connection = self
            .endpoint
            .connect_with(self.quic.clone(), addr, &server_name)
            .context("Failed to start QUIC connection")?
            .await
            .context("QUIC handshake failed")?;

        let session = web_transport_quinn::Session::connect(connection, &self.url)
            .await
            .context("WebTransport session setup failed")?;

        if self.verbose {
            tracing::info!("✓ Session established");
        }
        Ok(QuinnSession::from(session))
    }

    async fn resolve(&self) -> Result<(SocketAddr, String)> {
        let port = self.url.port_or_known_default().unwrap_or(443);

        match self.url.host() {
            Some(Host::Ipv4(ip)) => Ok(((ip, port).into(), ip.to_string())),
            Some(Host::Ipv6(ip)) => Ok(((ip, port).into(), ip.to_string())),
            Some(Host::Domain(domain)) => {
                let addr = tokio::net::lookup_host((domain, port))
                    .await
                    .with_context(|| format!("Failed to resolve {domain}"))?
                    .next()
                    .ok_or_else(|| anyhow!("No addresses found for {domain}"))?;
                Ok((addr, domain.to_string()))
            }
            None => bail!("Session URL has no host: {}", self.url),
        }
    }

    /// Closes every connection of this client and waits for them to drain.
    pub async fn close(&self) {
        self.endpoint
            .close(quinn::VarInt::from_u32(0), b"client closed");
        self.endpoint.wait_idle().await;
    }
}

/// Sends `message` on a fresh stream and returns what the server echoed.
///
/// The server reads once, so at most [`READ_LIMIT`] bytes come back.
pub async fn say_hello<S: Session>(session: &S, message: &[u8]) -> hashpin_common::Result<Vec<u8>> {
    let mut stream = session.open_stream().await.map_err(Error::StreamOpen)?;
    stream.write_all(message).await.map_err(Error::StreamIo)?;
    let reply = stream
        .read_to_end(READ_LIMIT)
        .await
        .map_err(Error::StreamIo)?;

    if let Err(e) = stream.close() {
        tracing::debug!(error = %e, "closing hello stream failed");
    }
    Ok(reply)
}

/// Accepts `count` server-opened streams and returns their contents in
/// arrival order.
pub async fn receive_payloads<S: Session>(
    session: &S,
    count: usize,
) -> hashpin_common::Result<Vec<Vec<u8>>> {
    let mut payloads = Vec::with_capacity(count);

    for _ in 0..count {
        let mut stream = session.accept_stream().await.map_err(Error::StreamAccept)?;
        let payload = stream
            .read_to_end(DEFAULT_READ_TO_END_LIMIT)
            .await
            .map_err(Error::StreamIo)?;
        tracing::debug!(bytes = payload.len(), "received payload");

        if let Err(e) = stream.close() {
            tracing::debug!(error = %e, "closing payload stream failed");
        }
        payloads.push(payload);
    }

    Ok(payloads)
}

/// Opens one stream and counts the bytes the server sends until it finishes.
pub async fn drain_bulk<S: Session>(session: &S) -> hashpin_common::Result<u64> {
    let mut stream = session.open_stream().await.map_err(Error::StreamOpen)?;
    let bytes = stream.drain().await.map_err(Error::StreamIo)?;

    if let Err(e) = stream.close() {
        tracing::debug!(error = %e, "closing bulk stream failed");
    }
    Ok(bytes)
}
