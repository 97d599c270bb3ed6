// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # Korb: compact ORB-style RPC runtime
//!
//! A binary RPC middleware core in pure Rust: the per-connection state
//! machine that multiplexes requests and replies over a framed binary
//! protocol, the wire codec that marshals primitives, tagged members and
//! polymorphic class graphs, and a WebSocket adapter that tunnels the
//! same protocol inside WS frames.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use korb::config::RuntimeConfig;
//! use korb::connection::Connection;
//! use korb::executor::UpcallExecutor;
//! use korb::protocol::request::{Identity, RequestFrameBuilder, RequestHeader};
//! use korb::reactor::Reactor;
//! use korb::transport::{Endpoint, StreamTransceiver};
//!
//! fn main() -> std::io::Result<()> {
//!     let reactor = Reactor::spawn()?;
//!     let executor = Arc::new(UpcallExecutor::new(4)?);
//!
//!     let stream = std::net::TcpStream::connect("127.0.0.1:4061")?;
//!     let conn = Connection::new(
//!         Box::new(StreamTransceiver::tcp(stream)?),
//!         Endpoint::tcp(),
//!         true,
//!         RuntimeConfig::default(),
//!         executor,
//!         None,
//!     );
//!     conn.activate();
//!     conn.start();
//!     reactor.register(&conn)?;
//!     conn.wait_until_validated(Duration::from_secs(10)).unwrap();
//!
//!     let frame = RequestFrameBuilder::new(&RequestHeader::new(
//!         Identity::new("clock", ""),
//!         "now",
//!     ))
//!     .unwrap()
//!     .empty_params()
//!     .finish();
//!
//!     let handle = conn.send_request(frame, false).unwrap();
//!     let reply = handle.wait().unwrap();
//!     println!("reply status: {:?}", reply.status);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +------------------------------------------------------------------+
//! |                       Application Layer                          |
//! |      DispatchPipeline (servers)  |  TwowayHandle (callers)       |
//! +------------------------------------------------------------------+
//! |                      Connection Layer                            |
//! |  state machine | request/reply correlation | send queue | timers |
//! +------------------------------------------------------------------+
//! |                        Wire Codec                                |
//! |  InputStream/OutputStream | encapsulations | tagged | classes    |
//! +------------------------------------------------------------------+
//! |                     Transceiver Layer                            |
//! |      StreamTransceiver (raw)  |  WsTransceiver (WebSocket)       |
//! +------------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`connection::Connection`] | One multiplexed connection over one transport |
//! | [`encoding::InputStream`] / [`encoding::OutputStream`] | Wire codec streams |
//! | [`encoding::ValueGraph`] | Arena of decoded class instances (cycles safe) |
//! | [`transport::Transceiver`] | Non-blocking transport probe contract |
//! | [`transport::WsTransceiver`] | WebSocket framing adapter |
//! | [`reactor::Reactor`] | Shared mio-driven event loop |
//! | [`dispatch::DispatchPipeline`] | Application request handler |

/// Growable byte buffer with cursor; foundation for codec and I/O.
pub mod buffer;
/// Runtime configuration consumed by connections and the reactor.
pub mod config;
/// Connection state machine, pending invocations, registry.
pub mod connection;
/// Dispatch pipeline contract and response synthesis.
pub mod dispatch;
/// Wire codec: streams, encapsulations, tagged members, class graphs.
pub mod encoding;
/// Connection-level error taxonomy.
pub mod error;
/// Upcall executor (application-visible work off the connection lock).
pub mod executor;
/// Binary protocol framing, compression, frame builders.
pub mod protocol;
/// Shared mio-driven event loop.
pub mod reactor;
/// Transceiver contract, stream transceiver, WebSocket adapter.
pub mod transport;

pub use buffer::Buffer;
pub use config::{RuntimeConfig, TraceConfig};
pub use connection::{ConnState, Connection, ConnectionRegistry, TwowayHandle};
pub use dispatch::{DispatchPipeline, IncomingRequest, OutgoingResponse};
pub use error::{ConnectionError, InvokeError};
pub use transport::{Endpoint, SocketOp, Transceiver};
