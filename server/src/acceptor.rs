//! Turns inbound upgrade requests into sessions with their own cancellation
//! scope.

use hashpin_common::{
    error::{Error, Result},
    transport::{Session, UpgradeRequest},
};
use http::StatusCode;
use tokio_util::sync::CancellationToken;
use tracing::{info_span, Span};
use uuid::Uuid;

/// Lifecycle of an [`AcceptedSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Streams may be accepted and opened.
    Open,
    /// The session was torn down.
    Closed,
}

/// A session that completed its upgrade.
///
/// Owns the session's cancellation scope. The scope is a child of the
/// acceptor's root token, so it outlives the request handler that created it
/// and is cancelled on process shutdown.
#[derive(Debug)]
pub struct AcceptedSession<S> {
    id:      Uuid,
    session: S,
    token:   CancellationToken,
    span:    Span,
    state:   SessionState,
}

impl<S: Session> AcceptedSession<S> {
    /// Unique id, also recorded on the session span.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Transport session handle.
    pub fn session(&self) -> &S {
        &self.session
    }

    /// Cancellation scope of every task working on this session.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Span that session tasks log under.
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Cancels the scope and closes the transport session.
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.token.cancel();
        self.session.close(0, "session closed");
        self.state = SessionState::Closed;
        tracing::debug!(parent: &self.span, "session state -> closed");
    }
}

/// Completes session upgrades.
#[derive(Debug, Clone)]
pub struct SessionAcceptor {
    root: CancellationToken,
}

impl SessionAcceptor {
    /// Creates an acceptor whose sessions are scoped under `root`.
    pub fn new(root: CancellationToken) -> Self {
        Self { root }
    }

    /// The process-wide token every session scope derives from.
    pub fn root(&self) -> &CancellationToken {
        &self.root
    }

    /// Upgrades `request` into a session.
    ///
    /// A failed handshake is answered with `500 Internal Server Error` when
    /// the transport still allows a response, and reported as
    /// [`Error::Handshake`]. There is no retry.
    pub async fn upgrade<R: UpgradeRequest>(
        &self,
        request: R,
    ) -> Result<AcceptedSession<R::Session>> {
        let path = request.path().to_string();

        let session = match request.upgrade().await {
            Ok(session) => session,
            Err(rejected) => {
                tracing::warn!(%path, error = %rejected.reason, "session upgrade failed");
                if let Some(request) = rejected.request {
                    if let Err(e) = request.respond(StatusCode::INTERNAL_SERVER_ERROR).await {
                        tracing::debug!(error = %e, "could not deliver 500 response");
                    }
                }
                return Err(Error::Handshake(rejected.reason));
            }
        };

        let id = Uuid::new_v4();
        let peer = session.peer();
        let span = info_span!("session", %id, %peer);
        tracing::info!(parent: &span, %path, "session accepted");

        Ok(AcceptedSession {
            id,
            session,
            token: self.root.child_token(),
            span,
            state: SessionState::Open,
        })
    }
}

#[cfg(test)]
mod tests {
    use hashpin_common::memory::{self, Response};

    use super::*;

    #[tokio::test]
    async fn upgraded_session_starts_open_under_the_root_scope() {
        let root = CancellationToken::new();
        let acceptor = SessionAcceptor::new(root.clone());
        let (request, pending) = memory::request("/say-hello");

        let accepted = acceptor.upgrade(request).await.unwrap();
        assert_eq!(accepted.state(), SessionState::Open);
        assert!(matches!(pending.wait().await, Some(Response::Upgraded(_))));

        root.cancel();
        assert!(accepted.token().is_cancelled());
    }

    #[tokio::test]
    async fn failed_handshake_answers_500() {
        let acceptor = SessionAcceptor::new(CancellationToken::new());
        let (request, pending) = memory::failing_request("/say-hello");

        let err = acceptor.upgrade(request).await.unwrap_err();
        assert!(matches!(err, Error::Handshake(_)));
        assert!(matches!(
            pending.wait().await,
            Some(Response::Status(StatusCode::INTERNAL_SERVER_ERROR))
        ));
    }

    #[tokio::test]
    async fn closing_cancels_the_scope_and_the_transport() {
        let acceptor = SessionAcceptor::new(CancellationToken::new());
        let (request, pending) = memory::request("/say-hello");
        let mut accepted = acceptor.upgrade(request).await.unwrap();
        let Some(Response::Upgraded(peer)) = pending.wait().await else {
            panic!("expected an upgraded session");
        };

        accepted.close();
        assert_eq!(accepted.state(), SessionState::Closed);
        assert!(accepted.token().is_cancelled());
        assert!(peer.is_closed());
        // Parent scopes are unaffected.
        assert!(!acceptor.root().is_cancelled());
    }
}
