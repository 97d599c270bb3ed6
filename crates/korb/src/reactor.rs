// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Reactor: the shared I/O event loop.
//!
//! A dedicated thread drains OS readiness events through mio and invokes
//! each connection's [`ready`](crate::connection::Connection::ready)
//! callback with the observed operation mask, re-registering whatever
//! mask the connection asks for next. Connection timers are checked every
//! poll tick; the poll timeout tracks the earliest armed deadline.
//!
//! # Architecture
//!
//! ```text
//! +-----------------------------------------------------------+
//! |                         Reactor                           |
//! |  +-----------------------------------------------------+  |
//! |  |                      mio::Poll                      |  |
//! |  |  - connection sockets (read/write readiness)        |  |
//! |  |  - waker (command channel)                           |  |
//! |  +-----------------------------------------------------+  |
//! |         |                    |                            |
//! |         v                    v                            |
//! |   conn.ready(ops)      conn.check_timers(now)             |
//! +-----------------------------------------------------------+
//! ```

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver, Sender, TryRecvError};
use mio::{Events, Interest, Poll, Token, Waker};

use crate::connection::{ConnState, Connection};
use crate::transport::SocketOp;

const WAKER_TOKEN: Token = Token(0);
const CONN_TOKEN_START: usize = 1;
const MAX_EVENTS: usize = 128;
const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(100);

// ============================================================================
// Commands and handle
// ============================================================================

enum ReactorCommand {
    Register(Arc<Connection>),
    UpdateOps { id: u64, ops: SocketOp },
    Deregister { id: u64 },
    Shutdown,
}

/// Handle for registering connections and stopping the reactor.
pub struct ReactorHandle {
    cmd_tx: Sender<ReactorCommand>,
    waker: Arc<Waker>,
    thread: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
}

impl ReactorHandle {
    /// Hand a connection to the reactor. Installs the readiness hook so
    /// state changes made outside `ready` reach the poll loop.
    pub fn register(&self, conn: &Arc<Connection>) -> io::Result<()> {
        let id = conn.id();
        let tx = self.cmd_tx.clone();
        let waker = self.waker.clone();
        conn.set_readiness_hook(Box::new(move |ops| {
            let _ = tx.send(ReactorCommand::UpdateOps { id, ops });
            let _ = waker.wake();
        }));

        self.cmd_tx
            .send(ReactorCommand::Register(conn.clone()))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "reactor stopped"))?;
        self.waker.wake()
    }

    /// Stop tracking a connection.
    pub fn deregister(&self, id: u64) -> io::Result<()> {
        self.cmd_tx
            .send(ReactorCommand::Deregister { id })
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "reactor stopped"))?;
        self.waker.wake()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Stop the loop and join the thread.
    pub fn shutdown(&mut self) -> io::Result<()> {
        if !self.is_running() {
            return Ok(());
        }
        let _ = self.cmd_tx.send(ReactorCommand::Shutdown);
        let _ = self.waker.wake();
        if let Some(handle) = self.thread.take() {
            handle
                .join()
                .map_err(|_| io::Error::other("reactor thread panicked"))?;
        }
        Ok(())
    }
}

impl Drop for ReactorHandle {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

// ============================================================================
// Reactor
// ============================================================================

struct ConnEntry {
    conn: Arc<Connection>,
    /// Interests currently registered with the poll (None for transports
    /// without a descriptor; those only get timer service).
    registered: Option<SocketOp>,
    #[cfg(unix)]
    fd: Option<std::os::unix::io::RawFd>,
}

/// The poll loop state. Created and consumed by [`Reactor::spawn`].
pub struct Reactor {
    poll: Poll,
    connections: HashMap<Token, ConnEntry>,
    id_to_token: HashMap<u64, Token>,
    next_token: usize,
    cmd_rx: Receiver<ReactorCommand>,
    running: Arc<AtomicBool>,
}

impl Reactor {
    /// Spawn the reactor thread.
    pub fn spawn() -> io::Result<ReactorHandle> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let (cmd_tx, cmd_rx) = unbounded();
        let running = Arc::new(AtomicBool::new(true));

        let reactor = Reactor {
            poll,
            connections: HashMap::new(),
            id_to_token: HashMap::new(),
            next_token: CONN_TOKEN_START,
            cmd_rx,
            running: running.clone(),
        };

        let thread = thread::Builder::new()
            .name("korb-reactor".to_string())
            .spawn(move || reactor.run())?;

        Ok(ReactorHandle {
            cmd_tx,
            waker,
            thread: Some(thread),
            running,
        })
    }

    fn run(mut self) {
        let mut events = Events::with_capacity(MAX_EVENTS);

        while self.running.load(Ordering::Relaxed) {
            let timeout = self.poll_timeout();
            if let Err(e) = self.poll.poll(&mut events, Some(timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                log::error!("[reactor] poll failed: {}", e);
                break;
            }

            for event in events.iter() {
                if event.token() == WAKER_TOKEN {
                    continue; // commands drained below
                }
                let token = event.token();
                let mut ops = SocketOp::NONE;
                if event.is_readable() || event.is_read_closed() {
                    ops |= SocketOp::READ;
                }
                if event.is_writable() || event.is_write_closed() {
                    ops |= SocketOp::WRITE;
                }
                let conn = match self.connections.get(&token) {
                    Some(entry) => entry.conn.clone(),
                    None => continue,
                };
                let next = conn.ready(ops);
                self.reregister(token, next);
            }

            self.drain_commands();
            self.check_timers();
            self.reap_finished();
        }

        // Drop remaining registrations cleanly.
        let tokens: Vec<Token> = self.connections.keys().copied().collect();
        for token in tokens {
            self.remove(token);
        }
        self.running.store(false, Ordering::Relaxed);
    }

    fn poll_timeout(&self) -> Duration {
        let now = Instant::now();
        let mut timeout = DEFAULT_POLL_TIMEOUT;
        for entry in self.connections.values() {
            if let Some(deadline) = entry.conn.next_deadline() {
                let until = deadline.saturating_duration_since(now);
                if until < timeout {
                    timeout = until;
                }
            }
        }
        timeout.max(Duration::from_millis(1))
    }

    fn drain_commands(&mut self) {
        loop {
            match self.cmd_rx.try_recv() {
                Ok(ReactorCommand::Register(conn)) => self.insert(conn),
                Ok(ReactorCommand::UpdateOps { id, ops }) => {
                    if let Some(&token) = self.id_to_token.get(&id) {
                        self.reregister(token, ops);
                    }
                }
                Ok(ReactorCommand::Deregister { id }) => {
                    if let Some(&token) = self.id_to_token.get(&id) {
                        self.remove(token);
                    }
                }
                Ok(ReactorCommand::Shutdown) => {
                    self.running.store(false, Ordering::Relaxed);
                }
                Err(TryRecvError::Empty) => return,
                Err(TryRecvError::Disconnected) => {
                    self.running.store(false, Ordering::Relaxed);
                    return;
                }
            }
        }
    }

    fn insert(&mut self, conn: Arc<Connection>) {
        let token = Token(self.next_token);
        self.next_token += 1;
        let id = conn.id();
        let ops = conn.desired_ops();

        #[cfg(unix)]
        let fd = conn.raw_fd();

        let mut entry = ConnEntry {
            conn,
            registered: None,
            #[cfg(unix)]
            fd,
        };

        #[cfg(unix)]
        if let (Some(fd), Some(interest)) = (entry.fd, interests(ops)) {
            let mut source = mio::unix::SourceFd(&fd);
            match self.poll.registry().register(&mut source, token, interest) {
                Ok(()) => entry.registered = Some(ops),
                Err(e) => log::error!("[reactor] register failed: {}", e),
            }
        }

        self.id_to_token.insert(id, token);
        self.connections.insert(token, entry);
    }

    fn reregister(&mut self, token: Token, ops: SocketOp) {
        #[cfg(unix)]
        if let Some(entry) = self.connections.get_mut(&token) {
            let fd = match entry.fd {
                Some(fd) => fd,
                None => return,
            };
            if entry.registered == Some(ops) {
                return;
            }
            let mut source = mio::unix::SourceFd(&fd);
            let result = match (entry.registered.is_some(), interests(ops)) {
                (true, Some(interest)) => {
                    self.poll.registry().reregister(&mut source, token, interest)
                }
                (true, None) => {
                    let r = self.poll.registry().deregister(&mut source);
                    entry.registered = None;
                    r
                }
                (false, Some(interest)) => {
                    self.poll.registry().register(&mut source, token, interest)
                }
                (false, None) => Ok(()),
            };
            match result {
                Ok(()) => {
                    if !ops.is_none() {
                        entry.registered = Some(ops);
                    }
                }
                Err(e) => log::debug!("[reactor] reregister failed: {}", e),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = (token, ops);
        }
    }

    fn remove(&mut self, token: Token) {
        if let Some(entry) = self.connections.remove(&token) {
            self.id_to_token.remove(&entry.conn.id());
            #[cfg(unix)]
            if let (Some(fd), Some(_)) = (entry.fd, entry.registered) {
                let mut source = mio::unix::SourceFd(&fd);
                let _ = self.poll.registry().deregister(&mut source);
            }
        }
    }

    fn check_timers(&mut self) {
        let now = Instant::now();
        let conns: Vec<(Token, Arc<Connection>)> = self
            .connections
            .iter()
            .map(|(t, e)| (*t, e.conn.clone()))
            .collect();
        for (token, conn) in conns {
            conn.check_timers(now);
            let ops = conn.desired_ops();
            self.reregister(token, ops);
        }
    }

    fn reap_finished(&mut self) {
        let finished: Vec<Token> = self
            .connections
            .iter()
            .filter(|(_, e)| e.conn.state() == ConnState::Finished)
            .map(|(t, _)| *t)
            .collect();
        for token in finished {
            self.remove(token);
        }
    }
}

#[cfg(unix)]
fn interests(ops: SocketOp) -> Option<Interest> {
    match (ops.has_read(), ops.has_write()) {
        (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};
    use std::time::Duration;

    use crate::config::RuntimeConfig;
    use crate::dispatch::{DispatchPipeline, IncomingRequest, OutgoingResponse};
    use crate::executor::UpcallExecutor;
    use crate::protocol::request::{Identity, RequestFrameBuilder, RequestHeader};
    use crate::protocol::ReplyStatus;
    use crate::transport::{Endpoint, StreamTransceiver};

    fn test_config() -> RuntimeConfig {
        RuntimeConfig {
            inactivity_timeout: Duration::ZERO,
            idle_timeout: Duration::ZERO,
            enable_idle_check: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_spawn_and_shutdown() {
        let mut handle = Reactor::spawn().unwrap();
        assert!(handle.is_running());
        handle.shutdown().unwrap();
        assert!(!handle.is_running());
    }

    #[test]
    fn test_end_to_end_over_loopback_tcp() {
        let reactor = Reactor::spawn().unwrap();
        let executor = Arc::new(UpcallExecutor::new(2).unwrap());

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client_stream = TcpStream::connect(addr).unwrap();
        let (server_stream, _) = listener.accept().unwrap();

        let echo: Arc<dyn DispatchPipeline> =
            Arc::new(|req: &IncomingRequest| OutgoingResponse::ok(req.params.clone()));

        let client = Connection::new(
            Box::new(StreamTransceiver::tcp(client_stream).unwrap()),
            Endpoint::tcp(),
            true,
            test_config(),
            executor.clone(),
            None,
        );
        let server = Connection::new(
            Box::new(StreamTransceiver::tcp(server_stream).unwrap()),
            Endpoint::tcp(),
            false,
            test_config(),
            executor,
            Some(echo),
        );

        client.activate();
        server.activate();
        server.start();
        client.start();
        reactor.register(&server).unwrap();
        reactor.register(&client).unwrap();

        client
            .wait_until_validated(Duration::from_secs(2))
            .unwrap();

        let frame = RequestFrameBuilder::new(&RequestHeader::new(Identity::new("echo", ""), "ping"))
            .unwrap()
            .params(|os| {
                os.write_string("hello over tcp")?;
                Ok(())
            })
            .unwrap()
            .finish();

        let handle = client.send_request(frame, false).unwrap();
        let reply = handle
            .wait_timeout(Duration::from_secs(5))
            .expect("reply within deadline")
            .expect("successful reply");
        assert_eq!(reply.status, ReplyStatus::Ok);

        let mut is = crate::encoding::InputStream::new(&reply.body);
        is.start_encapsulation().unwrap();
        assert_eq!(is.read_string().unwrap(), "hello over tcp");

        // Graceful shutdown drives both sides to Finished via the reactor.
        client.close_gracefully();
        server.wait_until_finished();
    }

    #[test]
    fn test_reactor_drives_connect_timeout_for_fdless_transport() {
        use crate::transport::stream::mock::MockStream;

        let reactor = Reactor::spawn().unwrap();
        let executor = Arc::new(UpcallExecutor::new(1).unwrap());
        let mut config = test_config();
        config.connect_timeout = Duration::from_millis(50);

        let (a, _b) = MockStream::pair();
        let client = Connection::new(
            Box::new(StreamTransceiver::new(Box::new(a))),
            Endpoint::tcp(),
            true,
            config,
            executor,
            None,
        );
        client.start();
        reactor.register(&client).unwrap();

        // No validation frame ever arrives; the reactor's timer sweep
        // fires the connect timeout.
        let deadline = Instant::now() + Duration::from_secs(2);
        while client.state() != ConnState::Finished && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(client.state(), ConnState::Finished);
        assert_eq!(
            client.latched_error(),
            Some(crate::error::ConnectionError::ConnectTimeout)
        );
    }
}
