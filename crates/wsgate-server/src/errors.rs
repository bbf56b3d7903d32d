//! Error types for the gateway core.
//!
//! Each failure surface has its own enum:
//! - [`RouteError`]: upgrade request rejected before the 101 response
//! - [`ProtocolError`]: wire-level violation on an established connection
//! - [`SessionError`]: handler-facing failures on a [`ConnectionSession`]
//! - [`TlsError`]: certificate and key material
//! - [`GatewayError`]: listener setup and serving
//!
//! [`ConnectionSession`]: crate::session::ConnectionSession

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::frame::close_code;
use crate::handshake::WEBSOCKET_VERSION;

/// Reasons an upgrade request is refused.
///
/// Response bodies are short and never reveal whether the tenant or the
/// token was wrong for an authentication failure.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    /// Only `GET` may be upgraded.
    #[error("method not allowed")]
    MethodNotAllowed,
    /// Path is not `/{tenant}/{handler}`.
    #[error("malformed connection path: {0}")]
    Parse(String),
    /// Missing, repeated, unknown or other-tenant token.
    #[error("not authorized")]
    Auth,
    /// No tenant with this name.
    #[error("ERROR: no tenant found named [{0}]")]
    UnknownTenant(String),
    /// The tenant exists but has no handler at this path.
    #[error("ERROR: no registered handler for path [{0}]")]
    UnknownHandler(String),
    /// Missing `Upgrade`, `Connection` or `Sec-WebSocket-Key` header.
    #[error("bad websocket handshake: {0}")]
    BadHandshake(&'static str),
    /// `Sec-WebSocket-Version` other than 13.
    #[error("unsupported websocket version")]
    UnsupportedVersion,
    /// The HTTP connection cannot be taken over for WebSocket traffic.
    #[error("connection cannot be upgraded")]
    UpgradeUnavailable,
}

impl RouteError {
    /// HTTP status sent for this rejection.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::Parse(_) | Self::BadHandshake(_) => StatusCode::BAD_REQUEST,
            Self::Auth => StatusCode::FORBIDDEN,
            Self::UnknownTenant(_) | Self::UnknownHandler(_) => StatusCode::NOT_FOUND,
            Self::UnsupportedVersion => StatusCode::UPGRADE_REQUIRED,
            Self::UpgradeUnavailable => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for RouteError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut response = (status, self.to_string()).into_response();
        if matches!(self, Self::UnsupportedVersion) {
            let _ = response.headers_mut().insert(
                header::SEC_WEBSOCKET_VERSION,
                HeaderValue::from_static(WEBSOCKET_VERSION),
            );
        }
        response
    }
}

/// A wire-level violation that terminates one connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Continuation frame with no message in progress.
    #[error("continuation frame without a message in progress")]
    UnexpectedContinuation,
    /// New data frame while a fragmented message is in progress.
    #[error("new message started before the previous one finished")]
    UnfinishedMessage,
    /// Binary data frame.
    #[error("binary frames are not supported")]
    UnsupportedFrame,
    /// Opcode reserved by RFC 6455.
    #[error("reserved opcode {0:#x}")]
    ReservedOpcode(u8),
    /// Message (or a declared frame payload) above the configured limit.
    #[error("message of {size} bytes exceeds the limit of {limit} bytes")]
    MessageTooLarge {
        /// Bytes seen or declared so far.
        size: u64,
        /// Configured `maxMessageSize`.
        limit: usize,
    },
    /// Text payload is not UTF-8.
    #[error("text message is not valid UTF-8")]
    InvalidUtf8,
    /// Client frame without a mask.
    #[error("client frame is not masked")]
    UnmaskedFrame,
    /// Server frame carrying a mask.
    #[error("server frame is masked")]
    MaskedFrame,
    /// RSV1-3 set without a negotiated extension.
    #[error("reserved bits set without a negotiated extension")]
    ReservedBits,
    /// Control frame with FIN clear.
    #[error("control frame is fragmented")]
    FragmentedControl,
    /// Control frame payload above 125 bytes.
    #[error("control frame payload exceeds 125 bytes")]
    ControlTooLarge,
    /// 64-bit payload length with the most significant bit set.
    #[error("frame length {0} has the most significant bit set")]
    InvalidLength(u64),
    /// Close frame carrying a single payload byte.
    #[error("close frame payload of one byte")]
    TruncatedClose,
    /// Close status code that may not appear on the wire.
    #[error("invalid close code {0}")]
    InvalidCloseCode(u16),
    /// Transport failure.
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Status code for the close frame sent to the peer, or `None` when the
    /// transport is gone and no close frame can be sent.
    pub fn close_code(&self) -> Option<u16> {
        match self {
            Self::UnsupportedFrame => Some(close_code::UNSUPPORTED_DATA),
            Self::MessageTooLarge { .. } => Some(close_code::MESSAGE_TOO_BIG),
            Self::InvalidUtf8 => Some(close_code::INVALID_PAYLOAD),
            Self::Io(_) => None,
            Self::UnexpectedContinuation
            | Self::UnfinishedMessage
            | Self::ReservedOpcode(_)
            | Self::UnmaskedFrame
            | Self::MaskedFrame
            | Self::ReservedBits
            | Self::FragmentedControl
            | Self::ControlTooLarge
            | Self::InvalidLength(_)
            | Self::TruncatedClose
            | Self::InvalidCloseCode(_) => Some(close_code::PROTOCOL_ERROR),
        }
    }
}

/// Errors returned to handlers using a session.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    /// The connection has terminated.
    #[error("connection is closed")]
    Closed,
    /// The client is not reading and the outbound queue hit its limit.
    /// The connection is being closed with 1008.
    #[error("outbound queue limit of {limit} bytes exceeded")]
    Backlogged {
        /// Configured per-connection limit.
        limit: usize,
    },
}

/// Errors while preparing TLS material.
#[derive(Debug, Error)]
pub enum TlsError {
    /// Configured certificate or key file does not exist.
    #[error("{kind} file not found: {path}")]
    MissingFile {
        /// `"certificate chain"` or `"private key"`.
        kind: &'static str,
        /// Configured path.
        path: String,
    },
    /// Reading or parsing the certificate chain failed.
    #[error("failed to read certificate chain {path}: {message}")]
    CertRead {
        /// Configured path.
        path: String,
        /// Underlying error.
        message: String,
    },
    /// The certificate file holds no certificates.
    #[error("no certificates found in {0}")]
    NoCertificates(String),
    /// Reading or parsing the private key failed.
    #[error("failed to read private key {path}: {message}")]
    KeyRead {
        /// Configured path.
        path: String,
        /// Underlying error.
        message: String,
    },
    /// TLS enabled with no certificate and generation disabled.
    #[error("tls is enabled but no certificate is configured and autoGenerate is off")]
    NoCertificateConfigured,
    /// Self-signed certificate generation failed.
    #[error("failed to generate self-signed certificate: {0}")]
    Generate(String),
    /// rustls rejected the certificate/key pair.
    #[error("invalid tls configuration: {0}")]
    Config(#[from] rustls::Error),
}

/// Errors at the listener level.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Binding the listening socket failed.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// `host:port` that was requested.
        addr: String,
        /// Underlying error.
        source: std::io::Error,
    },
    /// TLS setup failed.
    #[error(transparent)]
    Tls(#[from] TlsError),
    /// The accept loop or HTTP server failed.
    #[error("server error: {0}")]
    Serve(#[from] std::io::Error),
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
