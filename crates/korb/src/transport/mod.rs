// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Transceiver abstraction.
//!
//! The connection layer drives transports through the [`Transceiver`]
//! contract: non-blocking probes that either complete or return the
//! [`SocketOp`] readiness mask to wait for. Concrete socket connectors
//! live outside this crate; [`stream::StreamTransceiver`] adapts any
//! non-blocking byte stream, and [`ws::WsTransceiver`] layers WebSocket
//! framing over an inner transceiver while providing the same contract
//! upward.

pub mod stream;
pub mod ws;

pub use stream::{ByteStream, StreamTransceiver};
pub use ws::WsTransceiver;

use std::fmt;

use crate::buffer::Buffer;
use crate::error::ConnectionError;

// ============================================================================
// Readiness operations
// ============================================================================

/// Bitmask of socket operations an I/O probe needs readiness for.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct SocketOp(u8);

impl SocketOp {
    pub const NONE: SocketOp = SocketOp(0);
    pub const READ: SocketOp = SocketOp(1);
    pub const WRITE: SocketOp = SocketOp(2);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    pub fn has_read(self) -> bool {
        self.0 & Self::READ.0 != 0
    }

    pub fn has_write(self) -> bool {
        self.0 & Self::WRITE.0 != 0
    }
}

impl std::ops::BitOr for SocketOp {
    type Output = SocketOp;

    fn bitor(self, rhs: SocketOp) -> SocketOp {
        SocketOp(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for SocketOp {
    fn bitor_assign(&mut self, rhs: SocketOp) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for SocketOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.has_read(), self.has_write()) {
            (false, false) => write!(f, "None"),
            (true, false) => write!(f, "Read"),
            (false, true) => write!(f, "Write"),
            (true, true) => write!(f, "Read|Write"),
        }
    }
}

// ============================================================================
// Endpoint descriptor
// ============================================================================

/// Transport-level endpoint traits the connection needs to know about.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub transport: &'static str,
    /// Datagram endpoints cannot shut down gracefully; transitions toward
    /// Closing collapse straight to Closed.
    pub datagram: bool,
    pub secure: bool,
}

impl Endpoint {
    pub fn tcp() -> Self {
        Self {
            transport: "tcp",
            datagram: false,
            secure: false,
        }
    }

    pub fn ws() -> Self {
        Self {
            transport: "ws",
            datagram: false,
            secure: false,
        }
    }

    pub fn udp() -> Self {
        Self {
            transport: "udp",
            datagram: true,
            secure: false,
        }
    }
}

// ============================================================================
// Transport errors
// ============================================================================

/// Failure reported by a transceiver probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The peer closed or reset the transport.
    ConnectionLost(String),
    /// The transport could not be established.
    ConnectionRefused(String),
    /// Any other I/O failure.
    Io(String),
    /// The peer violated WebSocket framing.
    WsProtocol(String),
    /// The WebSocket close handshake completed with this status code.
    WsClosed(u16),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::ConnectionLost(detail) => write!(f, "connection lost: {}", detail),
            TransportError::ConnectionRefused(detail) => {
                write!(f, "connection refused: {}", detail)
            }
            TransportError::Io(detail) => write!(f, "i/o error: {}", detail),
            TransportError::WsProtocol(detail) => {
                write!(f, "websocket protocol error: {}", detail)
            }
            TransportError::WsClosed(code) => {
                write!(f, "websocket closed with status {}", code)
            }
        }
    }
}

impl std::error::Error for TransportError {}

impl From<TransportError> for ConnectionError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::ConnectionLost(d) => ConnectionError::ConnectionLost(d),
            TransportError::ConnectionRefused(d) => ConnectionError::ConnectFailed(d),
            TransportError::Io(d) => ConnectionError::ConnectionLost(d),
            TransportError::WsProtocol(d) => {
                ConnectionError::ConnectionLost(format!("websocket: {}", d))
            }
            TransportError::WsClosed(_) => ConnectionError::ClosedByPeer,
        }
    }
}

// ============================================================================
// Transceiver contract
// ============================================================================

/// Non-blocking transport probe interface.
///
/// `read` fills the buffer's `[pos, len)` window; `write` drains it. Both
/// return the readiness mask still needed: `NONE` means the operation
/// completed, `READ`/`WRITE` means register and retry when ready.
pub trait Transceiver: Send {
    /// Drive connection establishment (handshakes). Called repeatedly
    /// until it returns `NONE`.
    fn initialize(
        &mut self,
        read_buf: &mut Buffer,
        write_buf: &mut Buffer,
    ) -> Result<SocketOp, TransportError>;

    /// Fill `buf` up to its length. Returns `READ` on would-block.
    fn read(&mut self, buf: &mut Buffer) -> Result<SocketOp, TransportError>;

    /// Drain `buf` to the transport. Returns `WRITE` on would-block.
    fn write(&mut self, buf: &mut Buffer) -> Result<SocketOp, TransportError>;

    /// Begin transport-level graceful shutdown. Returns the operations to
    /// wait for before the shutdown is considered complete.
    fn closing(&mut self, initiator: bool, reason: &ConnectionError) -> SocketOp;

    /// Close the transport.
    fn close(&mut self);

    /// Release remaining transport resources after close.
    fn destroy(&mut self) {}

    /// Human-readable transport description (stable once connected).
    fn description(&self) -> String;

    /// Whether decoded-but-unconsumed data is buffered inside the
    /// transceiver (affects idle-check rescheduling and read loops).
    fn is_waiting_to_be_read(&self) -> bool {
        false
    }

    /// Raw descriptor for reactor registration, when the transport has one.
    #[cfg(unix)]
    fn raw_fd(&self) -> Option<std::os::unix::io::RawFd> {
        None
    }
}

// ============================================================================
// Tests
// ============================================================================
