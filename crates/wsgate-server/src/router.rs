//! Upgrade request routing: URI → token → handler → handshake → session.
//!
//! [`ConnectionRouter::route`] performs every check that can reject a request
//! and needs no socket. [`ConnectionRouter::handle_upgrade_request`] answers
//! the HTTP request and, once the connection is upgraded, hands it to
//! [`ConnectionRouter::accept`], which builds the session, calls the
//! handler's `on_connect` and runs the connection worker.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::request::Parts;
use axum::http::{Method, Request};
use axum::response::{IntoResponse, Response};
use dashmap::DashMap;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;
use wsgate_settings::DEFAULT_MAX_OUTBOUND_BYTES;

use crate::connection;
use crate::errors::RouteError;
use crate::handler::{HandlerResolver, Unresolved, WebSocketHandler};
use crate::handshake;
use crate::session::{CallbackFailure, ConnectionSession, SessionInfo, run_guarded};
use crate::shutdown::ShutdownCoordinator;
use crate::tokens::{TokenRegistry, UserId};
use crate::uri::ConnectionUri;

/// An upgrade request that passed every check.
pub struct RoutedRequest {
    /// Parsed path and query.
    pub uri: ConnectionUri,
    /// Authenticated user.
    pub user: UserId,
    /// Handler bound to the path.
    pub handler: Arc<dyn WebSocketHandler>,
    /// `Sec-WebSocket-Accept` value.
    pub accept_key: String,
}

impl std::fmt::Debug for RoutedRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutedRequest")
            .field("path", &self.uri.path())
            .field("user", &self.user)
            .field("handler", &self.handler.name())
            .finish_non_exhaustive()
    }
}

/// Routes upgrade requests to handlers and owns the live connections.
pub struct ConnectionRouter {
    tokens: Arc<TokenRegistry>,
    resolver: Arc<dyn HandlerResolver>,
    max_message_size: usize,
    outbound_limit: usize,
    shutdown: Arc<ShutdownCoordinator>,
    live: DashMap<Uuid, Arc<ConnectionSession>>,
}

impl ConnectionRouter {
    /// Create a router.
    pub fn new(
        tokens: Arc<TokenRegistry>,
        resolver: Arc<dyn HandlerResolver>,
        max_message_size: usize,
        shutdown: Arc<ShutdownCoordinator>,
    ) -> Self {
        Self {
            tokens,
            resolver,
            max_message_size,
            outbound_limit: DEFAULT_MAX_OUTBOUND_BYTES,
            shutdown,
            live: DashMap::new(),
        }
    }

    /// Cap the text bytes each connection may have waiting for its writer.
    #[must_use]
    pub fn with_outbound_limit(mut self, bytes: usize) -> Self {
        self.outbound_limit = bytes;
        self
    }

    /// Token registry used for authentication.
    pub fn tokens(&self) -> &Arc<TokenRegistry> {
        &self.tokens
    }

    /// Shutdown coordinator tracking connection workers.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Number of established connections.
    pub fn connection_count(&self) -> usize {
        self.live.len()
    }

    /// Validate an upgrade request without touching the connection.
    pub fn route(&self, parts: &Parts) -> Result<RoutedRequest, RouteError> {
        if parts.method != Method::GET {
            return Err(RouteError::MethodNotAllowed);
        }
        let uri = ConnectionUri::parse(parts.uri.path(), parts.uri.query())?;
        let token = uri.token().ok_or(RouteError::Auth)?;
        let user = self
            .tokens
            .resolve_user(&uri.tenant, token)
            .ok_or(RouteError::Auth)?;
        let handler = self
            .resolver
            .resolve(&uri.tenant, &uri.handler)
            .map_err(|reason| match reason {
                Unresolved::UnknownTenant => RouteError::UnknownTenant(uri.tenant.clone()),
                Unresolved::UnknownHandler => RouteError::UnknownHandler(uri.path()),
            })?;
        let accept_key = handshake::validate(&parts.headers)?;
        Ok(RoutedRequest {
            uri,
            user,
            handler,
            accept_key,
        })
    }

    /// Answer an HTTP upgrade request.
    ///
    /// On success the response is `101` and the connection is served on a
    /// tracked task once hyper releases the upgraded IO.
    pub async fn handle_upgrade_request(self: Arc<Self>, request: Request<Body>) -> Response {
        let (mut parts, _body) = request.into_parts();
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);

        let routed = match self.route(&parts) {
            Ok(routed) => routed,
            Err(err) => {
                warn!(
                    peer = ?peer,
                    method = %parts.method,
                    path = parts.uri.path(),
                    status = err.status().as_u16(),
                    error = %err,
                    "rejected websocket upgrade"
                );
                return err.into_response();
            }
        };

        let Some(on_upgrade) = parts.extensions.remove::<hyper::upgrade::OnUpgrade>() else {
            warn!(path = parts.uri.path(), "request has no upgradable connection");
            return RouteError::UpgradeUnavailable.into_response();
        };
        let response = match handshake::switching_protocols(&routed.accept_key) {
            Ok(response) => response,
            Err(err) => return err.into_response(),
        };

        let router = Arc::clone(&self);
        let _ = self.shutdown.spawn(async move {
            match on_upgrade.await {
                Ok(upgraded) => router.accept(routed, TokioIo::new(upgraded), peer).await,
                Err(err) => debug!(error = %err, "websocket upgrade failed"),
            }
        });
        response
    }

    /// Serve an upgraded connection until it closes.
    pub async fn accept<S>(&self, routed: RoutedRequest, io: S, peer: Option<SocketAddr>)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let RoutedRequest {
            uri, user, handler, ..
        } = routed;
        let (session, outbound) = ConnectionSession::channel_with_limit(
            SessionInfo {
                tenant: uri.tenant,
                handler_name: uri.handler,
                user,
                parameters: uri.params,
            },
            self.outbound_limit,
        );
        let span = info_span!(
            "connection",
            id = %session.id(),
            tenant = session.tenant(),
            handler = session.handler_name(),
            user = %session.user(),
            peer = ?peer,
        );

        async {
            let _ = self.live.insert(session.id(), Arc::clone(&session));
            info!("websocket connection established");

            match run_guarded(|| handler.on_connect(&session)) {
                Ok(()) => {}
                Err(CallbackFailure::Error(error)) => {
                    warn!(handler_impl = handler.name(), error = ?error, "on_connect failed");
                }
                Err(CallbackFailure::Panic(message)) => {
                    warn!(handler_impl = handler.name(), panic = %message, "on_connect panicked");
                }
            }

            let reason = connection::run(
                io,
                Arc::clone(&session),
                outbound,
                self.max_message_size,
                self.shutdown.token(),
            )
            .await;

            let _ = self.live.remove(&session.id());
            info!(?reason, "websocket connection closed");
        }
        .instrument(span)
        .await;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::http::{HeaderValue, StatusCode, header};
    use futures::{SinkExt, StreamExt};
    use tokio_util::codec::Framed;

    use super::*;
    use crate::frame::{Frame, FrameCodec};
    use crate::handler::HandlerRegistry;

    struct Echo {
        connects: AtomicUsize,
    }

    impl WebSocketHandler for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn on_connect(&self, session: &Arc<ConnectionSession>) -> anyhow::Result<()> {
            let _ = self.connects.fetch_add(1, Ordering::SeqCst);
            session.on_message(|s| {
                s.send(format!("{}:{}", s.user(), s.recv().unwrap_or_default()))?;
                Ok(())
            });
            Ok(())
        }
    }

    struct Failing;

    impl WebSocketHandler for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn on_connect(&self, session: &Arc<ConnectionSession>) -> anyhow::Result<()> {
            session.on_message(|s| {
                s.send("still here")?;
                Ok(())
            });
            anyhow::bail!("setup failed")
        }
    }

    struct Fixture {
        router: Arc<ConnectionRouter>,
        echo: Arc<Echo>,
        token: String,
    }

    fn fixture() -> Fixture {
        fixture_with_outbound_limit(DEFAULT_MAX_OUTBOUND_BYTES)
    }

    fn fixture_with_outbound_limit(outbound_limit: usize) -> Fixture {
        let tokens = Arc::new(TokenRegistry::new());
        let registry = HandlerRegistry::new();
        let echo = Arc::new(Echo {
            connects: AtomicUsize::new(0),
        });
        let _ = registry.register("wiki", "echo", echo.clone());
        let _ = registry.register("wiki", "failing", Arc::new(Failing));
        registry.add_tenant("other");
        let token = tokens
            .get_token("wiki", &UserId::from("alice"))
            .as_str()
            .to_owned();
        let router = Arc::new(ConnectionRouter::new(
            tokens,
            Arc::new(registry),
            1024,
            Arc::new(ShutdownCoordinator::new()),
        )
        .with_outbound_limit(outbound_limit));
        Fixture {
            router,
            echo,
            token,
        }
    }

    fn parts(method: Method, uri: &str, upgrade: bool) -> Parts {
        let mut builder = Request::builder().method(method).uri(uri);
        if upgrade {
            builder = builder
                .header(header::UPGRADE, "websocket")
                .header(header::CONNECTION, "Upgrade")
                .header(header::SEC_WEBSOCKET_VERSION, "13")
                .header(header::SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ==");
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn routes_valid_request() {
        let fx = fixture();
        let uri = format!("/wiki/echo?k={}&room=1", fx.token);
        let routed = fx.router.route(&parts(Method::GET, &uri, true)).unwrap();
        assert_eq!(routed.user.as_str(), "alice");
        assert_eq!(routed.handler.name(), "echo");
        assert_eq!(routed.uri.params.get("room"), Some("1"));
        assert_eq!(routed.accept_key, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn non_get_is_rejected_first() {
        let fx = fixture();
        let err = fx.router.route(&parts(Method::POST, "/bad", true)).unwrap_err();
        assert_eq!(err, RouteError::MethodNotAllowed);
    }

    #[test]
    fn malformed_path_is_parse_error() {
        let fx = fixture();
        let uri = format!("/wiki?k={}", fx.token);
        let err = fx.router.route(&parts(Method::GET, &uri, true)).unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert!(matches!(err, RouteError::Parse(_)));
    }

    #[test]
    fn token_problems_are_forbidden() {
        let fx = fixture();
        let cases = [
            "/wiki/echo".to_string(),
            "/wiki/echo?k=wrong".to_string(),
            format!("/wiki/echo?k={0}&k={0}", fx.token),
            format!("/other/echo?k={}", fx.token),
        ];
        for uri in cases {
            let err = fx.router.route(&parts(Method::GET, &uri, true)).unwrap_err();
            assert_eq!(err, RouteError::Auth, "{uri}");
        }
    }

    #[test]
    fn unknown_handler_is_not_found() {
        let fx = fixture();
        let uri = format!("/wiki/chat?k={}", fx.token);
        let err = fx.router.route(&parts(Method::GET, &uri, true)).unwrap_err();
        assert_eq!(err, RouteError::UnknownHandler("/wiki/chat".into()));
    }

    #[test]
    fn unknown_tenant_is_not_found() {
        let fx = fixture();
        let token = fx
            .router
            .tokens()
            .get_token("ghost", &UserId::from("alice"))
            .as_str()
            .to_owned();
        let uri = format!("/ghost/echo?k={token}");
        let err = fx.router.route(&parts(Method::GET, &uri, true)).unwrap_err();
        assert_eq!(err, RouteError::UnknownTenant("ghost".into()));
    }

    #[test]
    fn plain_get_is_bad_handshake() {
        let fx = fixture();
        let uri = format!("/wiki/echo?k={}", fx.token);
        let err = fx.router.route(&parts(Method::GET, &uri, false)).unwrap_err();
        assert!(matches!(err, RouteError::BadHandshake(_)));
    }

    #[tokio::test]
    async fn rejection_is_logged_without_token() {
        let (logs, _guard) = wsgate_logging::capture_logs();
        let fx = fixture();
        let uri = format!("/other/echo?k={}", fx.token);
        let request = Request::builder()
            .uri(uri.as_str())
            .header(header::UPGRADE, HeaderValue::from_static("websocket"))
            .body(Body::empty())
            .unwrap();
        let response = Arc::clone(&fx.router).handle_upgrade_request(request).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(logs.has_message("rejected websocket upgrade"));
        assert!(!logs.mentions(&fx.token));
    }

    #[tokio::test]
    async fn accepted_connection_reaches_handler() {
        let fx = fixture();
        let uri = format!("/wiki/echo?k={}", fx.token);
        let routed = fx.router.route(&parts(Method::GET, &uri, true)).unwrap();
        let (client_io, server_io) = tokio::io::duplex(4096);
        let router = Arc::clone(&fx.router);
        let task = tokio::spawn(async move { router.accept(routed, server_io, None).await });

        let mut client = Framed::new(client_io, FrameCodec::client(4096));
        client.send(Frame::text("hi")).await.unwrap();
        assert_eq!(
            client.next().await.unwrap().unwrap(),
            Frame::text("alice:hi")
        );
        assert_eq!(fx.echo.connects.load(Ordering::SeqCst), 1);
        assert_eq!(fx.router.connection_count(), 1);

        drop(client);
        task.await.unwrap();
        assert_eq!(fx.router.connection_count(), 0);
    }

    #[tokio::test]
    async fn failing_on_connect_keeps_connection_open() {
        let fx = fixture();
        let uri = format!("/wiki/failing?k={}", fx.token);
        let routed = fx.router.route(&parts(Method::GET, &uri, true)).unwrap();
        let (client_io, server_io) = tokio::io::duplex(4096);
        let router = Arc::clone(&fx.router);
        let _task = tokio::spawn(async move { router.accept(routed, server_io, None).await });

        let mut client = Framed::new(client_io, FrameCodec::client(4096));
        client.send(Frame::text("ping")).await.unwrap();
        assert_eq!(
            client.next().await.unwrap().unwrap(),
            Frame::text("still here")
        );
    }

    #[tokio::test]
    async fn outbound_limit_applies_to_accepted_sessions() {
        let fx = fixture_with_outbound_limit(4);
        let uri = format!("/wiki/echo?k={}", fx.token);
        let routed = fx.router.route(&parts(Method::GET, &uri, true)).unwrap();
        let (client_io, server_io) = tokio::io::duplex(4096);
        let router = Arc::clone(&fx.router);
        let task = tokio::spawn(async move { router.accept(routed, server_io, None).await });

        let mut client = Framed::new(client_io, FrameCodec::client(4096));
        client.send(Frame::text("hello")).await.unwrap();
        let reply = client.next().await.unwrap().unwrap();
        assert_eq!(reply.close_code(), Some(crate::frame::close_code::POLICY_VIOLATION));
        task.await.unwrap();
        assert_eq!(fx.router.connection_count(), 0);
    }
}
