// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Byte-stream transceiver.
//!
//! [`ByteStream`] abstracts a connected, non-blocking, stream-oriented
//! transport (plain TCP today; anything `Read + Write` in tests).
//! [`StreamTransceiver`] adapts it to the [`Transceiver`] contract with
//! the would-block and partial-write discipline the connection expects.

use std::io::{self, Read, Write};
use std::net::TcpStream;

use crate::buffer::Buffer;
use crate::error::ConnectionError;

use super::{SocketOp, Transceiver, TransportError};

/// Abstraction over connected byte streams.
///
/// Implementations must be non-blocking: reads and writes return
/// `WouldBlock` instead of parking the thread.
pub trait ByteStream: Read + Write + Send {
    /// Shut down the write half (graceful close signal to the peer).
    fn shutdown_write(&mut self) -> io::Result<()>;

    /// Human-readable description of the stream.
    fn description(&self) -> String;

    /// Raw descriptor for reactor registration, when there is one.
    #[cfg(unix)]
    fn raw_fd(&self) -> Option<std::os::unix::io::RawFd> {
        None
    }
}

impl ByteStream for TcpStream {
    fn shutdown_write(&mut self) -> io::Result<()> {
        TcpStream::shutdown(self, std::net::Shutdown::Write)
    }

    fn description(&self) -> String {
        match (self.local_addr(), self.peer_addr()) {
            (Ok(local), Ok(peer)) => format!("tcp local {} <-> remote {}", local, peer),
            _ => "tcp".to_string(),
        }
    }

    #[cfg(unix)]
    fn raw_fd(&self) -> Option<std::os::unix::io::RawFd> {
        use std::os::unix::io::AsRawFd;
        Some(self.as_raw_fd())
    }
}

// ============================================================================
// Stream transceiver
// ============================================================================

/// [`Transceiver`] over any [`ByteStream`].
pub struct StreamTransceiver {
    stream: Box<dyn ByteStream>,
    desc: String,
}

impl StreamTransceiver {
    pub fn new(stream: Box<dyn ByteStream>) -> Self {
        let desc = stream.description();
        Self { stream, desc }
    }

    /// Wrap a connected TCP stream, switching it to non-blocking mode.
    pub fn tcp(stream: TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        Ok(Self::new(Box::new(stream)))
    }
}

impl Transceiver for StreamTransceiver {
    fn initialize(
        &mut self,
        _read_buf: &mut Buffer,
        _write_buf: &mut Buffer,
    ) -> Result<SocketOp, TransportError> {
        // The stream arrives connected; nothing to negotiate.
        Ok(SocketOp::NONE)
    }

    fn read(&mut self, buf: &mut Buffer) -> Result<SocketOp, TransportError> {
        while buf.remaining() > 0 {
            match self.stream.read(buf.unfilled_mut()) {
                Ok(0) => {
                    return Err(TransportError::ConnectionLost(
                        "connection closed by peer".to_string(),
                    ))
                }
                Ok(n) => buf.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(SocketOp::READ),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if is_connection_lost(&e) => {
                    return Err(TransportError::ConnectionLost(e.to_string()))
                }
                Err(e) => return Err(TransportError::Io(e.to_string())),
            }
        }
        Ok(SocketOp::NONE)
    }

    fn write(&mut self, buf: &mut Buffer) -> Result<SocketOp, TransportError> {
        while buf.remaining() > 0 {
            match self.stream.write(buf.unread()) {
                Ok(0) => {
                    return Err(TransportError::ConnectionLost(
                        "wrote zero bytes".to_string(),
                    ))
                }
                Ok(n) => buf.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(SocketOp::WRITE),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if is_connection_lost(&e) => {
                    return Err(TransportError::ConnectionLost(e.to_string()))
                }
                Err(e) => return Err(TransportError::Io(e.to_string())),
            }
        }
        let _ = self.stream.flush();
        Ok(SocketOp::NONE)
    }

    fn closing(&mut self, initiator: bool, _reason: &ConnectionError) -> SocketOp {
        // The initiator half-closes and then waits for the peer's EOF so
        // queued data is not lost; the responder just closes.
        let _ = self.stream.shutdown_write();
        if initiator {
            SocketOp::READ
        } else {
            SocketOp::NONE
        }
    }

    fn close(&mut self) {
        let _ = self.stream.shutdown_write();
    }

    fn description(&self) -> String {
        self.desc.clone()
    }

    #[cfg(unix)]
    fn raw_fd(&self) -> Option<std::os::unix::io::RawFd> {
        self.stream.raw_fd()
    }
}

fn is_connection_lost(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}

// ============================================================================
// Test mock stream
// ============================================================================


// ============================================================================
// Tests
// ============================================================================
