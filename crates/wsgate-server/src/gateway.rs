//! Listener, backend selection and the HTTP surface.
//!
//! Two backends implement [`Gateway`]:
//! - [`PlainGateway`] serves `ws://` through `axum::serve`
//! - [`TlsGateway`] terminates TLS with `tokio-rustls` and drives each
//!   connection with hyper's HTTP/1 server, upgrades enabled
//!
//! Both serve the same axum [`Router`]: `GET /health` plus a fallback that
//! hands every other request to [`ConnectionRouter`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::Router;
use axum::extract::{ConnectInfo, Request, State};
use axum::response::{Json, Response};
use axum::routing::get;
use axum::serve::ListenerExt;
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower::ServiceExt;
use tracing::{debug, info, warn};
use wsgate_settings::GatewaySettings;

use crate::errors::GatewayError;
use crate::router::ConnectionRouter;
use crate::tls;

/// Time a client gets to complete the TLS handshake.
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Time an in-flight HTTP exchange gets to finish once shutdown starts.
const HTTP_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// A bound listener ready to serve.
#[async_trait]
pub trait Gateway: Send {
    /// Address the listener is bound to.
    fn local_addr(&self) -> SocketAddr;

    /// URL scheme clients must use.
    fn scheme(&self) -> &'static str;

    /// Accept connections until `shutdown` is cancelled.
    ///
    /// Returns once the listener is closed. Upgraded connections are tracked
    /// by the router's shutdown coordinator, not here.
    async fn serve(self: Box<Self>, shutdown: CancellationToken) -> Result<(), GatewayError>;
}

/// Shared state of the HTTP surface.
#[derive(Clone)]
pub struct AppState {
    /// Connection router.
    pub router: Arc<ConnectionRouter>,
    /// When the gateway started.
    pub started: Instant,
}

/// `/health` response body.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Always `"ok"` while serving.
    pub status: &'static str,
    /// Seconds since start.
    pub uptime_secs: u64,
    /// Established WebSocket connections.
    pub connections: usize,
    /// Issued tokens.
    pub tokens: usize,
}

/// The axum application shared by both backends.
pub fn app(router: Arc<ConnectionRouter>) -> Router {
    let state = AppState {
        router,
        started: Instant::now(),
    };
    Router::new()
        .route("/health", get(health))
        .fallback(upgrade)
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: state.started.elapsed().as_secs(),
        connections: state.router.connection_count(),
        tokens: state.router.tokens().len(),
    })
}

async fn upgrade(State(state): State<AppState>, request: Request) -> Response {
    Arc::clone(&state.router).handle_upgrade_request(request).await
}

/// Bind the listener described by `settings` and pick the backend.
pub async fn bind(
    settings: &GatewaySettings,
    router: Arc<ConnectionRouter>,
) -> Result<Box<dyn Gateway>, GatewayError> {
    let addr = settings.bind_target();
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|source| GatewayError::Bind { addr, source })?;
    let app = app(router);
    let nodelay = settings.server.tcp_nodelay;

    if settings.tls.enabled {
        let config = tls::server_config(&settings.tls)?;
        Ok(Box::new(TlsGateway::new(
            listener,
            TlsAcceptor::from(config),
            app,
            nodelay,
        )?))
    } else {
        Ok(Box::new(PlainGateway::new(listener, app, nodelay)?))
    }
}

fn set_nodelay(tcp: &TcpStream, enabled: bool) {
    if enabled {
        if let Err(err) = tcp.set_nodelay(true) {
            debug!(error = %err, "failed to set TCP_NODELAY");
        }
    }
}

/// `ws://` backend on `axum::serve`.
pub struct PlainGateway {
    listener: TcpListener,
    app: Router,
    nodelay: bool,
    local_addr: SocketAddr,
}

impl PlainGateway {
    /// Wrap a bound listener.
    pub fn new(listener: TcpListener, app: Router, nodelay: bool) -> Result<Self, GatewayError> {
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            app,
            nodelay,
            local_addr,
        })
    }
}

#[async_trait]
impl Gateway for PlainGateway {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn scheme(&self) -> &'static str {
        "ws"
    }

    async fn serve(self: Box<Self>, shutdown: CancellationToken) -> Result<(), GatewayError> {
        info!(addr = %self.local_addr, "gateway listening (ws)");
        let nodelay = self.nodelay;
        let listener = self.listener.tap_io(move |tcp| set_nodelay(tcp, nodelay));
        axum::serve(
            listener,
            self.app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
        info!("gateway listener stopped");
        Ok(())
    }
}

/// `wss://` backend on `tokio-rustls` and hyper.
pub struct TlsGateway {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    app: Router,
    nodelay: bool,
    local_addr: SocketAddr,
}

impl TlsGateway {
    /// Wrap a bound listener and a TLS acceptor.
    pub fn new(
        listener: TcpListener,
        acceptor: TlsAcceptor,
        app: Router,
        nodelay: bool,
    ) -> Result<Self, GatewayError> {
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            acceptor,
            app,
            nodelay,
            local_addr,
        })
    }
}

#[async_trait]
impl Gateway for TlsGateway {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn scheme(&self) -> &'static str {
        "wss"
    }

    async fn serve(self: Box<Self>, shutdown: CancellationToken) -> Result<(), GatewayError> {
        info!(addr = %self.local_addr, "gateway listening (wss)");
        let handshakes = TaskTracker::new();
        loop {
            let (tcp, peer) = tokio::select! {
                () = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        continue;
                    }
                },
            };
            set_nodelay(&tcp, self.nodelay);
            let _ = handshakes.spawn(serve_tls_connection(
                tcp,
                peer,
                self.acceptor.clone(),
                self.app.clone(),
                shutdown.clone(),
            ));
        }
        let _ = handshakes.close();
        handshakes.wait().await;
        info!("gateway listener stopped");
        Ok(())
    }
}

async fn serve_tls_connection(
    tcp: TcpStream,
    peer: SocketAddr,
    acceptor: TlsAcceptor,
    app: Router,
    shutdown: CancellationToken,
) {
    let handshake = tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(tcp));
    let stream = tokio::select! {
        () = shutdown.cancelled() => {
            debug!(%peer, "tls handshake abandoned on shutdown");
            return;
        }
        result = handshake => match result {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                debug!(%peer, error = %err, "tls handshake failed");
                return;
            }
            Err(_) => {
                debug!(%peer, "tls handshake timed out");
                return;
            }
        },
    };

    let service = app.map_request(move |mut request: Request<Incoming>| {
        let _ = request.extensions_mut().insert(ConnectInfo(peer));
        request
    });
    let connection = hyper::server::conn::http1::Builder::new()
        .serve_connection(TokioIo::new(stream), TowerToHyperService::new(service))
        .with_upgrades();
    tokio::pin!(connection);

    tokio::select! {
        result = connection.as_mut() => {
            if let Err(err) = result {
                debug!(%peer, error = %err, "http connection ended with error");
            }
        }
        () = shutdown.cancelled() => {
            connection.as_mut().graceful_shutdown();
            if tokio::time::timeout(HTTP_DRAIN_TIMEOUT, connection).await.is_err() {
                debug!(%peer, "http connection dropped after drain timeout");
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
