//! # wsgate-server
//!
//! Token-authenticated, multi-tenant WebSocket gateway.
//!
//! Clients connect to `/{tenant}/{handler}?k={token}`. The token is minted
//! by [`TokenRegistry`] for a (tenant, user) pair and must match the tenant
//! in the path. A successful upgrade creates a [`ConnectionSession`] that the
//! [`WebSocketHandler`] registered for the path wires up with callbacks.
//!
//! ## Layers
//!
//! - [`frame`] / [`assembler`]: RFC 6455 frame codec and message reassembly
//! - [`handshake`] / [`uri`]: upgrade request validation
//! - [`router`]: authentication, handler lookup and session lifecycle
//! - [`connection`]: per-connection reader and writer
//! - [`gateway`]: listeners (`ws://` and `wss://`) and `/health`

#![deny(unsafe_code)]

pub mod assembler;
pub mod connection;
pub mod errors;
pub mod frame;
pub mod gateway;
pub mod handler;
pub mod handshake;
pub mod router;
pub mod session;
pub mod shutdown;
pub mod tls;
pub mod tokens;
pub mod uri;

pub use errors::{GatewayError, ProtocolError, RouteError, SessionError, TlsError};
pub use gateway::{Gateway, HealthResponse, PlainGateway, TlsGateway, app, bind};
pub use handler::{HandlerRegistry, HandlerResolver, Unresolved, WebSocketHandler};
pub use router::ConnectionRouter;
pub use session::{ConnectionSession, SessionInfo};
pub use shutdown::ShutdownCoordinator;
pub use tokens::{Token, TokenRegistry, UserId};
pub use uri::{ConnectionUri, QueryParams, TOKEN_PARAM};
