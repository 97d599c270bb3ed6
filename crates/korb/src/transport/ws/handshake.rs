// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! HTTP/1.1 upgrade handshake.
//!
//! The client sends a GET with `Upgrade: websocket` headers and a random
//! base64 key; the server validates them and answers `101 Switching
//! Protocols` with the SHA-1-derived accept token. Anything else is a
//! handshake failure.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha1::{Digest, Sha1};

use crate::transport::TransportError;

/// Fixed GUID appended to the client key before hashing (RFC 6455).
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// WebSocket version this implementation speaks.
pub const WS_VERSION: &str = "13";

/// Compute the `Sec-WebSocket-Accept` token for a client key.
pub fn accept_token(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Generate a random 16-byte base64 client key.
pub fn generate_key() -> String {
    let mut raw = [0u8; 16];
    for b in raw.iter_mut() {
        *b = fastrand::u8(..);
    }
    BASE64.encode(raw)
}

/// Build the client's upgrade request.
pub fn build_upgrade_request(host: &str, resource: &str, key: &str) -> Vec<u8> {
    format!(
        "GET {} HTTP/1.1\r\n\
         Host: {}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {}\r\n\
         Sec-WebSocket-Version: {}\r\n\
         \r\n",
        resource, host, key, WS_VERSION
    )
    .into_bytes()
}

/// Build the server's 101 response for a validated request.
pub fn build_upgrade_response(key: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\
         \r\n",
        accept_token(key)
    )
    .into_bytes()
}

/// Build an error response for a rejected upgrade.
pub fn build_error_response(status: u16, reason: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {} {}\r\nConnection: close\r\n\r\n",
        status, reason
    )
    .into_bytes()
}

// ============================================================================
// Minimal HTTP message scanner
// ============================================================================

/// One parsed HTTP request or response head.
#[derive(Debug, Clone)]
pub struct HttpMessage {
    pub start_line: String,
    pub headers: Vec<(String, String)>,
}

impl HttpMessage {
    /// Incremental parse: `Ok(None)` until the terminating blank line has
    /// arrived; `Ok(Some((message, consumed)))` afterwards.
    pub fn parse(buf: &[u8]) -> Result<Option<(HttpMessage, usize)>, TransportError> {
        let end = match find_header_end(buf) {
            Some(end) => end,
            None => return Ok(None),
        };
        let head = std::str::from_utf8(&buf[..end])
            .map_err(|_| TransportError::WsProtocol("non-ASCII handshake".to_string()))?;

        let mut lines = head.split("\r\n");
        let start_line = lines
            .next()
            .ok_or_else(|| TransportError::WsProtocol("empty handshake".to_string()))?
            .to_string();

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| TransportError::WsProtocol("malformed header line".to_string()))?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        Ok(Some((
            HttpMessage {
                start_line,
                headers,
            },
            end + 4,
        )))
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Whether a comma-separated header contains a token (case-insensitive).
    pub fn header_has_token(&self, name: &str, token: &str) -> bool {
        self.header(name)
            .map(|value| {
                value
                    .split(',')
                    .any(|t| t.trim().eq_ignore_ascii_case(token))
            })
            .unwrap_or(false)
    }
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Validate a client upgrade request; returns the client key.
pub fn validate_upgrade_request(msg: &HttpMessage) -> Result<String, TransportError> {
    let mut parts = msg.start_line.split_whitespace();
    let method = parts.next().unwrap_or("");
    let _resource = parts.next().unwrap_or("");
    let version = parts.next().unwrap_or("");

    if method != "GET" {
        return Err(TransportError::WsProtocol(format!(
            "unexpected method '{}' in upgrade request",
            method
        )));
    }
    if version != "HTTP/1.1" {
        return Err(TransportError::WsProtocol(format!(
            "unsupported HTTP version '{}'",
            version
        )));
    }
    if !msg.header_has_token("Upgrade", "websocket") {
        return Err(TransportError::WsProtocol(
            "missing 'Upgrade: websocket' header".to_string(),
        ));
    }
    if !msg.header_has_token("Connection", "Upgrade") {
        return Err(TransportError::WsProtocol(
            "missing 'Connection: Upgrade' header".to_string(),
        ));
    }
    match msg.header("Sec-WebSocket-Version") {
        Some(v) if v == WS_VERSION => {}
        other => {
            return Err(TransportError::WsProtocol(format!(
                "unsupported WebSocket version {:?}",
                other
            )))
        }
    }
    msg.header("Sec-WebSocket-Key")
        .map(|k| k.to_string())
        .ok_or_else(|| TransportError::WsProtocol("missing Sec-WebSocket-Key".to_string()))
}

/// Validate the server's 101 response against the key we sent.
pub fn validate_upgrade_response(msg: &HttpMessage, key: &str) -> Result<(), TransportError> {
    let mut parts = msg.start_line.split_whitespace();
    let version = parts.next().unwrap_or("");
    let status = parts.next().unwrap_or("");

    if version != "HTTP/1.1" {
        return Err(TransportError::WsProtocol(format!(
            "unsupported HTTP version '{}' in response",
            version
        )));
    }
    if status != "101" {
        return Err(TransportError::WsProtocol(format!(
            "upgrade refused with status {}",
            status
        )));
    }
    if !msg.header_has_token("Upgrade", "websocket") {
        return Err(TransportError::WsProtocol(
            "response missing 'Upgrade: websocket'".to_string(),
        ));
    }
    if !msg.header_has_token("Connection", "Upgrade") {
        return Err(TransportError::WsProtocol(
            "response missing 'Connection: Upgrade'".to_string(),
        ));
    }
    match msg.header("Sec-WebSocket-Accept") {
        Some(token) if token == accept_token(key) => Ok(()),
        _ => Err(TransportError::WsProtocol(
            "invalid Sec-WebSocket-Accept token".to_string(),
        )),
    }
}

// ============================================================================
// Tests
// ============================================================================
