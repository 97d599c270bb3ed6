// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Connection-level error taxonomy.
//!
//! [`ConnectionError`] is the "latched" exception a connection records the
//! first time it enters a closing state; every caller observing the
//! connection afterwards sees the same value. Benign variants describe
//! normal lifecycle (graceful close, shutdown, inactivity) and are kept
//! out of warn-level logs; the rest are genuine failures.
//!
//! [`InvokeError`] is what a two-way caller receives: either the latched
//! connection error, a marshal failure confined to that one reply, or a
//! local cancellation.

use std::fmt;
use std::time::Duration;

use crate::encoding::MarshalError;
use crate::protocol::ProtocolError;

/// The exception latched by a connection when it starts closing.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionError {
    // --- transport-fatal ---
    /// The transport failed or the peer reset the connection.
    ConnectionLost(String),
    /// The transport could not be established.
    ConnectFailed(String),

    // --- protocol-fatal ---
    /// The peer violated the message protocol.
    Protocol(ProtocolError),
    /// The shared message envelope could not be decoded.
    Marshal(MarshalError),

    // --- timeouts ---
    /// Validation did not complete within the connect timeout.
    ConnectTimeout,
    /// Graceful shutdown did not drain within the close timeout.
    CloseTimeout,

    // --- benign lifecycle ---
    /// The application closed the connection gracefully.
    CloseRequested,
    /// The peer sent a close-connection frame.
    ClosedByPeer,
    /// The connection was idle past the inactivity timeout.
    InactivityShutdown { timeout: Duration },
    /// The owning adapter was deactivated.
    AdapterDeactivated,
    /// The runtime is shutting down.
    RuntimeDestroyed,

    // --- liveness ---
    /// The peer sent no bytes for the idle timeout.
    IdleAborted { timeout: Duration },

    // --- other ---
    /// A required capability (e.g. a decompression codec) is missing.
    FeatureNotSupported(String),
    /// The connection was aborted by a fatal cancellation.
    Aborted,
}

impl ConnectionError {
    /// Expected lifecycle closures: latched like any other error but kept
    /// out of warn-level logs.
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            ConnectionError::CloseRequested
                | ConnectionError::ClosedByPeer
                | ConnectionError::InactivityShutdown { .. }
                | ConnectionError::AdapterDeactivated
                | ConnectionError::RuntimeDestroyed
        )
    }

    /// Abort-class failures escalate a per-request cancellation into a
    /// connection close to preserve at-most-once semantics.
    pub fn is_abort(&self) -> bool {
        matches!(
            self,
            ConnectionError::Aborted | ConnectionError::ConnectionLost(_)
        )
    }

    /// Whether a caller may transparently retry a request that failed with
    /// this error.
    ///
    /// A request that was never sent is always safe. A sent request may
    /// only be retried when the operation is idempotent or the error kind
    /// guarantees the peer did not dispatch it; a partially sent two-way
    /// request on an abort-class error is never retried silently.
    pub fn retryable(&self, sent: bool, idempotent: bool) -> bool {
        if !sent {
            return true;
        }
        match self {
            // Establishment failures: the peer never saw the request.
            ConnectionError::ConnectFailed(_) | ConnectionError::ConnectTimeout => true,
            // Graceful closures guarantee the peer finished or dropped the
            // request deliberately; the peer expects a retry elsewhere.
            ConnectionError::CloseRequested
            | ConnectionError::ClosedByPeer
            | ConnectionError::InactivityShutdown { .. }
            | ConnectionError::AdapterDeactivated => true,
            // Anything else on a sent request: only if idempotent.
            _ => idempotent,
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::ConnectionLost(detail) => write!(f, "connection lost: {}", detail),
            ConnectionError::ConnectFailed(detail) => write!(f, "connect failed: {}", detail),
            ConnectionError::Protocol(e) => write!(f, "protocol error: {}", e),
            ConnectionError::Marshal(e) => write!(f, "marshal error: {}", e),
            ConnectionError::ConnectTimeout => write!(f, "connect timed out"),
            ConnectionError::CloseTimeout => write!(f, "close timed out"),
            ConnectionError::CloseRequested => write!(f, "connection closed locally"),
            ConnectionError::ClosedByPeer => write!(f, "connection closed by peer"),
            ConnectionError::InactivityShutdown { timeout } => {
                write!(f, "connection closed after {:?} of inactivity", timeout)
            }
            ConnectionError::AdapterDeactivated => write!(f, "object adapter deactivated"),
            ConnectionError::RuntimeDestroyed => write!(f, "runtime destroyed"),
            ConnectionError::IdleAborted { timeout } => {
                write!(f, "connection aborted: no bytes received for {:?}", timeout)
            }
            ConnectionError::FeatureNotSupported(what) => {
                write!(f, "feature not supported: {}", what)
            }
            ConnectionError::Aborted => write!(f, "invocation aborted"),
        }
    }
}

impl std::error::Error for ConnectionError {}

impl From<ProtocolError> for ConnectionError {
    fn from(e: ProtocolError) -> Self {
        ConnectionError::Protocol(e)
    }
}

impl From<MarshalError> for ConnectionError {
    fn from(e: MarshalError) -> Self {
        ConnectionError::Marshal(e)
    }
}

/// Failure delivered to one two-way caller.
#[derive(Debug, Clone, PartialEq)]
pub enum InvokeError {
    /// The connection failed; carries the latched error and whether the
    /// request had been fully sent when it happened.
    Connection {
        error: ConnectionError,
        sent: bool,
    },
    /// The reply payload for this one request could not be decoded.
    ReplyMarshal(MarshalError),
    /// The caller canceled the request locally.
    Canceled,
}

impl InvokeError {
    /// Whether the caller may transparently retry the invocation.
    pub fn is_retryable(&self, idempotent: bool) -> bool {
        match self {
            InvokeError::Connection { error, sent } => error.retryable(*sent, idempotent),
            InvokeError::ReplyMarshal(_) => false,
            InvokeError::Canceled => false,
        }
    }
}

impl fmt::Display for InvokeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvokeError::Connection { error, .. } => write!(f, "{}", error),
            InvokeError::ReplyMarshal(e) => write!(f, "reply unmarshaling failed: {}", e),
            InvokeError::Canceled => write!(f, "invocation canceled"),
        }
    }
}

impl std::error::Error for InvokeError {}

// ============================================================================
// Tests
// ============================================================================
