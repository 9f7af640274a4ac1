//! HTTP upgrade negotiation (RFC 6455 §4).

use base64::Engine as _;
use base64::prelude::BASE64_STANDARD;
use rand::RngCore;
use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::http::request::{Method, Request};
use crate::http::response::{Response, StatusCode};

/// Fixed GUID appended to the client key before hashing.
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Header carrying the reason a handshake was refused.
pub const REJECT_REASON_HEADER: &str = "X-WebSocket-Reject-Reason";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("WebSocket upgrade requires GET")]
    MethodNotGet,

    #[error("Not a WebSocket upgrade request")]
    NotUpgrade,

    #[error("Unsupported WebSocket version")]
    UnsupportedVersion,

    #[error("Missing Sec-WebSocket-Key")]
    MissingKey,

    #[error("Invalid Sec-WebSocket-Key")]
    InvalidKey,

    #[error("No WebSocket endpoint at this path")]
    NoRoute,
}

/// `base64(sha1(key + GUID))`.
///
/// # Example
///
/// ```
/// # use lantern::websocket::handshake::compute_accept_key;
/// assert_eq!(
///     compute_accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
///     "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
/// );
/// ```
pub fn compute_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.trim().as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    BASE64_STANDARD.encode(hasher.finalize())
}

/// `Upgrade: websocket` plus a `Connection` header listing `upgrade`.
pub fn is_websocket_request(request: &Request) -> bool {
    let upgrade = request
        .header("upgrade")
        .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("websocket")))
        .unwrap_or(false);
    let connection = request
        .header("connection")
        .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("upgrade")))
        .unwrap_or(false);
    upgrade && connection
}

pub fn validate_websocket_version(request: &Request) -> bool {
    request
        .header("sec-websocket-version")
        .map(|v| v.trim() == "13")
        .unwrap_or(false)
}

/// A key is valid when it base64-decodes to exactly 16 bytes.
pub fn validate_websocket_key(key: &str) -> bool {
    BASE64_STANDARD
        .decode(key.trim())
        .map(|decoded| decoded.len() == 16)
        .unwrap_or(false)
}

/// Checks every upgrade precondition and returns the client key.
pub fn validate_handshake(request: &Request) -> Result<&str, HandshakeError> {
    if request.method != Method::GET {
        return Err(HandshakeError::MethodNotGet);
    }
    if !is_websocket_request(request) {
        return Err(HandshakeError::NotUpgrade);
    }
    if !validate_websocket_version(request) {
        return Err(HandshakeError::UnsupportedVersion);
    }
    let key = request
        .header("sec-websocket-key")
        .ok_or(HandshakeError::MissingKey)?;
    if !validate_websocket_key(key) {
        return Err(HandshakeError::InvalidKey);
    }
    Ok(key)
}

/// `101 Switching Protocols` for a valid upgrade request.
pub fn handshake_response(request: &Request) -> Result<Response, HandshakeError> {
    let key = validate_handshake(request)?;

    let mut response = Response::new(StatusCode::SwitchingProtocols);
    response
        .set_header("Upgrade", "websocket")
        .set_header("Connection", "Upgrade")
        .set_header("Sec-WebSocket-Accept", compute_accept_key(key))
        .remove_header("Content-Length");
    Ok(response)
}

/// `400` refusing an upgrade, with the reason in a header.
pub fn handshake_rejection(reason: &str) -> Response {
    let mut response = Response::new(StatusCode::BadRequest);
    response.set_text("WebSocket handshake failed");
    if !reason.is_empty() {
        response.set_header(REJECT_REASON_HEADER, reason);
    }
    response
}

/// Random client key: 16 bytes, base64 encoded.
pub fn generate_websocket_key() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    BASE64_STANDARD.encode(bytes)
}
