//! Per-session stream work.
//!
//! In echo mode every session runs two independent loops: one accepts
//! client-opened streams and answers each with a single read (echoed back),
//! the other opens a stream every interval and writes a fixed payload on it.
//! In bulk mode one client stream receives a fixed amount of data as fast as
//! flow control allows.
//!
//! Every suspension point races the session's cancellation scope, so
//! cancelling the scope stops the loops at their next await. Streams in
//! flight at that moment are dropped, not drained.

use std::sync::Arc;

use futures_util::future::join_all;
use hashpin_common::{
    config::{EngineConfig, Mode},
    error::{Error, Result, TransportError},
    transport::{Session, Stream},
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::acceptor::AcceptedSession;

/// Outcome of a completed bulk transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkReport {
    /// Chunks fully written.
    pub chunks: usize,
    /// Bytes fully written.
    pub bytes:  u64,
}

/// Runs the configured stream behaviour on sessions.
#[derive(Debug, Clone)]
pub struct EchoEngine {
    config: Arc<EngineConfig>,
}

impl EchoEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Accepts client streams until the session ends or `token` fires.
    ///
    /// Returns the number of streams served.
    pub async fn run_inbound<S: Session>(&self, session: &S, token: &CancellationToken) -> u64 {
        let mut served = 0;

        loop {
            let accepted = tokio::select! {
                _ = token.cancelled() => break,
                accepted = session.accept_stream() => accepted.map_err(Error::StreamAccept),
            };

            let stream = match accepted {
                Ok(stream) => stream,
                Err(e) if e.is_session_terminal() => {
                    tracing::debug!(error = %e, "inbound loop stopping");
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to accept inbound stream");
                    continue;
                }
            };

            tokio::select! {
                _ = token.cancelled() => break,
                () = self.echo_once(stream) => served += 1,
            }
        }

        served
    }

    /// One read, an optional echo of what was read, then close.
    async fn echo_once<T: Stream>(&self, mut stream: T) {
        let mut buf = vec![0u8; self.config.echo.read_limit];

        match stream.read(&mut buf).await.map_err(Error::StreamIo) {
            Ok(0) => tracing::debug!("inbound stream finished without data"),
            Ok(n) => {
                tracing::info!(bytes = n, data = ?&buf[..n], "read from inbound stream");
                if self.config.echo.echo_reply {
                    if let Err(e) = stream.write_all(&buf[..n]).await.map_err(Error::StreamIo) {
                        tracing::warn!(error = %e, "failed to echo inbound bytes");
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to read inbound stream"),
        }

        if let Err(e) = stream.close() {
            tracing::debug!(error = %e, "closing inbound stream failed");
        }
    }

    /// Opens a stream per interval until the session ends or `token` fires.
    ///
    /// Returns the number of payloads fully written.
    pub async fn run_outbound<S: Session>(&self, session: &S, token: &CancellationToken) -> u64 {
        let mut sent = 0;

        loop {
            let opened = tokio::select! {
                _ = token.cancelled() => break,
                opened = session.open_stream() => opened.map_err(Error::StreamOpen),
            };

            match opened {
                Ok(stream) => {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        delivered = self.send_payload(stream) => {
                            if delivered {
                                sent += 1;
                            }
                        }
                    }
                }
                Err(e) if e.is_session_terminal() => {
                    tracing::debug!(error = %e, "outbound loop stopping");
                    break;
                }
                Err(e) => tracing::warn!(error = %e, "failed to open outbound stream"),
            }

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.config.echo.interval) => {}
            }
        }

        sent
    }

    /// One write of the payload, then close.
    async fn send_payload<T: Stream>(&self, mut stream: T) -> bool {
        let payload = &self.config.echo.payload;

        let delivered = match stream.write(payload).await.map_err(Error::StreamIo) {
            Ok(n) if n == payload.len() => {
                tracing::debug!(bytes = n, "wrote outbound payload");
                true
            }
            Ok(n) => {
                tracing::error!(
                    written = n,
                    expected = payload.len(),
                    "short write on outbound stream"
                );
                false
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to write outbound stream");
                false
            }
        };

        if let Err(e) = stream.close() {
            tracing::debug!(error = %e, "closing outbound stream failed");
        }
        delivered
    }

    /// Waits for one client stream and fills it with zero bytes.
    ///
    /// Fails with [`Error::StreamAccept`] when no stream arrives within the
    /// accept timeout and with [`Error::StreamIo`] when a write fails. Either
    /// way only this transfer ends.
    pub async fn run_bulk<S: Session>(
        &self,
        session: &S,
        token: &CancellationToken,
    ) -> Result<BulkReport> {
        let bulk = &self.config.bulk;

        let accepted = tokio::select! {
            _ = token.cancelled() => return Err(Error::StreamAccept(cancelled())),
            accepted = tokio::time::timeout(bulk.accept_timeout, session.accept_stream()) => accepted,
        };
        let mut stream = accepted
            .map_err(|_| Error::StreamAccept(TransportError::TimedOut(bulk.accept_timeout)))?
            .map_err(Error::StreamAccept)?;

        tracing::info!(
            chunks = bulk.chunk_count,
            chunk_size = bulk.chunk_size,
            "bulk transfer started"
        );

        let chunk = vec![0u8; bulk.chunk_size];
        let mut report = BulkReport::default();
        for _ in 0..bulk.chunk_count {
            tokio::select! {
                _ = token.cancelled() => return Err(Error::StreamIo(cancelled())),
                written = stream.write_all(&chunk) => written.map_err(Error::StreamIo)?,
            }
            report.chunks += 1;
            report.bytes += chunk.len() as u64;
        }

        stream.close().map_err(Error::StreamIo)?;
        Ok(report)
    }

    /// Spawns the tasks of the configured mode for `accepted`.
    ///
    /// Tasks run under the session span and stop when the session scope is
    /// cancelled.
    pub fn launch<S: Session>(&self, accepted: &AcceptedSession<S>) -> SessionHandle {
        let token = accepted.token().clone();
        let span = accepted.span().clone();
        let mut tasks = Vec::with_capacity(2);

        match self.config.mode {
            Mode::Echo => {
                let (engine, session, scope) =
                    (self.clone(), accepted.session().clone(), token.clone());
                tasks.push(tokio::spawn(
                    async move {
                        let served = engine.run_inbound(&session, &scope).await;
                        tracing::debug!(served, "inbound loop finished");
                    }
                    .instrument(span.clone()),
                ));

                let (engine, session, scope) =
                    (self.clone(), accepted.session().clone(), token.clone());
                tasks.push(tokio::spawn(
                    async move {
                        let sent = engine.run_outbound(&session, &scope).await;
                        tracing::debug!(sent, "outbound loop finished");
                    }
                    .instrument(span),
                ));
            }
            Mode::Bulk => {
                let (engine, session, scope) =
                    (self.clone(), accepted.session().clone(), token.clone());
                tasks.push(tokio::spawn(
                    async move {
                        match engine.run_bulk(&session, &scope).await {
                            Ok(report) => tracing::info!(
                                chunks = report.chunks,
                                bytes = report.bytes,
                                "bulk transfer complete"
                            ),
                            Err(e) => tracing::error!(error = %e, "bulk transfer aborted"),
                        }
                    }
                    .instrument(span),
                ));
            }
        }

        SessionHandle { token, tasks }
    }
}

fn cancelled() -> TransportError {
    TransportError::SessionClosed("session cancelled".to_string())
}

/// The running tasks of one session.
#[derive(Debug)]
pub struct SessionHandle {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl SessionHandle {
    /// Asks every task to stop at its next suspension point.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether every task has returned.
    pub fn is_finished(&self) -> bool {
        self.tasks.iter().all(JoinHandle::is_finished)
    }

    /// Waits for every task to return.
    pub async fn join(self) {
        for joined in join_all(self.tasks).await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "session task failed");
            }
        }
    }

    /// Cancels, then joins.
    pub async fn shutdown(self) {
        self.cancel();
        self.join().await;
    }
}

/// Owns a session until it ends.
///
/// Waits for the transport to terminate or the scope to be cancelled, then
/// stops and joins the session's tasks and closes the session.
pub async fn supervise<S: Session>(mut accepted: AcceptedSession<S>, handle: SessionHandle) {
    let session = accepted.session().clone();
    let token = accepted.token().clone();

    tokio::select! {
        reason = session.closed() => tracing::info!(%reason, "session terminated by transport"),
        _ = token.cancelled() => tracing::info!("session scope cancelled"),
    }

    handle.shutdown().await;
    accepted.close();
    tracing::info!("session finished");
}
