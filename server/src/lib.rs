//! hashpin server
//!
//! Serves certificate-pinned WebTransport sessions. At startup a short-lived
//! self-signed identity is generated and its SHA-256 hash published; clients
//! trust the server by that hash instead of a CA chain.
//!
//! # Example
//!
//! ```no_run
//! use hashpin_common::ServerConfig;
//! use hashpin_server::HelloServer;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let server = HelloServer::new(ServerConfig::new())?;
//! let listener = server.bind()?;
//! println!("{}", server.pinning_hash());
//! server.serve(listener).await?;
//! # Ok(())
//! # }
//! ```

use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use hashpin_common::{
    bootstrap::ConnectionDetails,
    config::ServerConfig,
    identity::{Identity, PinningHash},
    transport::UpgradeRequest,
    webtransport::{server_config, QuinnListener},
};
use http::StatusCode;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::Instrument;
use uuid::Uuid;

pub mod acceptor;
pub mod engine;

pub use acceptor::{AcceptedSession, SessionAcceptor, SessionState};
pub use engine::{supervise, BulkReport, EchoEngine, SessionHandle};

/// What the endpoint did with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// The path did not match; answered with 404.
    NotFound,
    /// A session was started.
    Started(Uuid),
}

/// Routes inbound requests on the single session path.
///
/// Origins are not checked.
#[derive(Debug, Clone)]
pub struct BootstrapEndpoint {
    route:    Arc<str>,
    acceptor: SessionAcceptor,
    engine:   EchoEngine,
    tracker:  TaskTracker,
}

impl BootstrapEndpoint {
    pub fn new(
        route: &str,
        acceptor: SessionAcceptor,
        engine: EchoEngine,
        tracker: TaskTracker,
    ) -> Self {
        Self {
            route: Arc::from(route),
            acceptor,
            engine,
            tracker,
        }
    }

    pub fn route(&self) -> &str {
        &self.route
    }

    /// Handles one request.
    ///
    /// Unknown paths get `404 Not Found`. Matching requests are upgraded and
    /// their session work is spawned on the tracker; this returns as soon as
    /// the session is running.
    pub async fn on_inbound_request<R: UpgradeRequest>(
        &self,
        request: R,
    ) -> hashpin_common::Result<Dispatch> {
        if request.path() != &*self.route {
            tracing::info!(path = request.path(), "no route, answering 404");
            if let Err(e) = request.respond(StatusCode::NOT_FOUND).await {
                tracing::debug!(error = %e, "could not deliver 404 response");
            }
            return Ok(Dispatch::NotFound);
        }

        let accepted = self.acceptor.upgrade(request).await?;
        let id = accepted.id();
        let span = accepted.span().clone();

        let handle = self.engine.launch(&accepted);
        self.tracker.spawn(supervise(accepted, handle).instrument(span));

        Ok(Dispatch::Started(id))
    }
}

/// The pinned WebTransport server.
///
/// One instance serves one process lifetime: after [`HelloServer::shutdown`]
/// the root scope stays cancelled.
#[derive(Debug)]
pub struct HelloServer {
    config:   ServerConfig,
    identity: Arc<Identity>,
    shutdown: CancellationToken,
    tracker:  TaskTracker,
}

impl HelloServer {
    /// Validates `config` and generates a fresh identity for it.
    pub fn new(config: ServerConfig) -> Result<Self> {
        config.validate().context("Invalid server configuration")?;
        let identity =
            Identity::generate(config.validity).context("Failed to generate server identity")?;
        Self::with_identity(config, identity)
    }

    /// Uses an existing identity instead of generating one.
    pub fn with_identity(config: ServerConfig, identity: Identity) -> Result<Self> {
        config.validate().context("Invalid server configuration")?;

        tracing::info!(
            serial = identity.serial(),
            hash = %identity.pinning_hash().to_hex(),
            "server identity ready"
        );

        Ok(Self {
            config,
            identity: Arc::new(identity),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Hash clients must pin.
    pub fn pinning_hash(&self) -> PinningHash {
        self.identity.pinning_hash()
    }

    /// Root cancellation scope. Cancelling it stops the server.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// The request router sessions are dispatched through.
    pub fn endpoint(&self) -> BootstrapEndpoint {
        BootstrapEndpoint::new(
            &self.config.route,
            SessionAcceptor::new(self.shutdown.clone()),
            EchoEngine::new(self.config.engine.clone()),
            self.tracker.clone(),
        )
    }

    /// Connection details for a server reachable at `addr`.
    pub fn connection_details(&self, addr: SocketAddr) -> ConnectionDetails {
        ConnectionDetails::new(format!("https://{addr}{}", self.config.route), &self.pinning_hash())
    }

    /// Binds the QUIC endpoint. Requires a Tokio runtime.
    pub fn bind(&self) -> Result<QuinnListener> {
        let quic = server_config(&self.identity, &self.config.transport)
            .context("Failed to build QUIC server configuration")?;
        let listener = QuinnListener::bind(self.config.addr, quic)
            .with_context(|| format!("Failed to bind to {}", self.config.addr))?;

        tracing::info!(
            addr = %listener.local_addr()?,
            route = %self.config.route,
            mode = %self.config.engine.mode,
            "hashpin server listening"
        );
        Ok(listener)
    }

    /// Binds and serves until shut down.
    pub async fn run(&self) -> Result<()> {
        let listener = self.bind()?;
        self.serve(listener).await
    }

    /// Accepts requests until the listener closes or the server is shut
    /// down, then waits for every session to finish.
    pub async fn serve(&self, mut listener: QuinnListener) -> Result<()> {
        let endpoint = self.endpoint();

        loop {
            let request = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                request = listener.accept() => request,
            };

            let Some(request) = request else {
                tracing::info!("listener closed");
                break;
            };

            let endpoint = endpoint.clone();
            self.tracker.spawn(async move {
                if let Err(e) = endpoint.on_inbound_request(request).await {
                    tracing::warn!(error = %e, "request failed");
                }
            });
        }

        self.shutdown.cancel();
        listener.close();
        self.tracker.close();
        self.tracker.wait().await;

        let idle = listener.wait_idle();
        drop(listener);
        idle.await;

        tracing::info!("hashpin server stopped");
        Ok(())
    }

    /// Cancels every session and waits for them to be joined.
    pub async fn shutdown(&self) {
        tracing::info!("shutting down hashpin server");
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}
