//! Opening handshake validation and the 101 response.

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, Response, StatusCode, header};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;

use crate::errors::RouteError;

/// The only protocol version the gateway speaks.
pub const WEBSOCKET_VERSION: &str = "13";

/// Check the upgrade headers and compute `Sec-WebSocket-Accept`.
pub fn validate(headers: &HeaderMap) -> Result<String, RouteError> {
    if !header_is(headers, &header::UPGRADE, "websocket") {
        return Err(RouteError::BadHandshake("missing Upgrade: websocket"));
    }
    if !header_has_token(headers, &header::CONNECTION, "upgrade") {
        return Err(RouteError::BadHandshake("missing Connection: upgrade"));
    }
    match headers.get(header::SEC_WEBSOCKET_VERSION) {
        Some(v) if v.as_bytes() == WEBSOCKET_VERSION.as_bytes() => {}
        _ => return Err(RouteError::UnsupportedVersion),
    }
    let key = headers
        .get(header::SEC_WEBSOCKET_KEY)
        .filter(|k| !k.is_empty())
        .ok_or(RouteError::BadHandshake("missing Sec-WebSocket-Key"))?;
    Ok(derive_accept_key(key.as_bytes()))
}

/// `101 Switching Protocols` carrying the accept key.
pub fn switching_protocols(accept_key: &str) -> Result<Response<Body>, RouteError> {
    let accept = HeaderValue::from_str(accept_key)
        .map_err(|_| RouteError::BadHandshake("unrepresentable accept key"))?;
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    let headers = response.headers_mut();
    let _ = headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
    let _ = headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
    let _ = headers.insert(header::SEC_WEBSOCKET_ACCEPT, accept);
    Ok(response)
}

fn header_is(headers: &HeaderMap, name: &header::HeaderName, expected: &str) -> bool {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case(expected))
}

fn header_has_token(headers: &HeaderMap, name: &header::HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn upgrade_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        let _ = headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        let _ = headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
        let _ = headers.insert(header::SEC_WEBSOCKET_VERSION, HeaderValue::from_static("13"));
        let _ = headers.insert(
            header::SEC_WEBSOCKET_KEY,
            HeaderValue::from_static("dGhlIHNhbXBsZSBub25jZQ=="),
        );
        headers
    }

    #[test]
    fn accepts_rfc_sample_key() {
        let accept = validate(&upgrade_headers()).unwrap();
        assert_eq!(accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn connection_header_may_list_several_tokens() {
        let mut headers = upgrade_headers();
        let _ = headers.insert(
            header::CONNECTION,
            HeaderValue::from_static("keep-alive, Upgrade"),
        );
        assert!(validate(&headers).is_ok());
    }

    #[test]
    fn missing_upgrade_is_bad_request() {
        let mut headers = upgrade_headers();
        let _ = headers.remove(header::UPGRADE);
        assert!(matches!(validate(&headers), Err(RouteError::BadHandshake(_))));
    }

    #[test]
    fn missing_key_is_bad_request() {
        let mut headers = upgrade_headers();
        let _ = headers.remove(header::SEC_WEBSOCKET_KEY);
        assert!(matches!(validate(&headers), Err(RouteError::BadHandshake(_))));
    }

    #[test]
    fn other_version_is_upgrade_required() {
        let mut headers = upgrade_headers();
        let _ = headers.insert(header::SEC_WEBSOCKET_VERSION, HeaderValue::from_static("8"));
        assert_eq!(validate(&headers), Err(RouteError::UnsupportedVersion));
        let _ = headers.remove(header::SEC_WEBSOCKET_VERSION);
        assert_eq!(validate(&headers), Err(RouteError::UnsupportedVersion));
    }

    #[test]
    fn switching_protocols_response() {
        let response = switching_protocols("s3pPLMBiTxaQ9kYGzzhZRbK+xOo=").unwrap();
        assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(
            response.headers()[header::SEC_WEBSOCKET_ACCEPT],
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
        assert_eq!(response.headers()[header::UPGRADE], "websocket");
    }
}
