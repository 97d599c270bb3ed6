// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Connection state machine.
//!
//! One [`Connection`] owns one transceiver and multiplexes requests and
//! replies over it. It runs no threads of its own: an external reactor
//! delivers readiness callbacks ([`Connection::ready`]) and timer ticks
//! ([`Connection::check_timers`]); application-visible work is handed to
//! the [`UpcallExecutor`](crate::executor::UpcallExecutor) so it never
//! runs under the connection's internal lock.
//!
//! # State Machine
//!
//! ```text
//!   NotInitialized --> NotValidated --> Holding <--> Active
//!                                          |           |
//!                                          +-----+-----+
//!                                                v
//!                                             Closing --> ClosingPending
//!                                                              |
//!                                                              v
//!                                           Finished <----- Closed
//! ```
//!
//! Transitions are monotonic. Two collapses apply: datagram endpoints
//! jump straight to `Closed` instead of `Closing`, and destruction before
//! validation does the same. The first error observed in any closing
//! state is latched; every later observer sees that same error.

pub mod invocation;
pub mod message;
pub mod registry;
pub mod state;
pub mod timer;

#[cfg(test)]
mod connection_tests;

pub use invocation::{IncomingReply, InvokeResult, SendStatus, TwowayHandle};
pub use registry::ConnectionRegistry;
pub use state::ConnState;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Sender};
use parking_lot::{Condvar, Mutex};

use crate::buffer::Buffer;
use crate::config::RuntimeConfig;
use crate::dispatch::{DispatchPipeline, IncomingRequest, OutgoingResponse};
use crate::encoding::{InputStream, MarshalResult};
use crate::error::{ConnectionError, InvokeError};
use crate::executor::{Upcall, UpcallExecutor};
use crate::protocol::request::{RequestHeader, REQUEST_ID_OFFSET};
use crate::protocol::{
    compress::{compress_frame, decompress_frame},
    CompressFlag, MessageHeader, MessageType, ProtocolError, CLOSE_CONNECTION_FRAME,
    COMPRESS_FLAG_OFFSET, FRAME_SIZE_OFFSET, HEADER_SIZE, VALIDATE_CONNECTION_FRAME,
};
use crate::transport::{Endpoint, SocketOp, Transceiver};

use self::invocation::PendingReply;
use self::message::OutgoingMessage;
use self::timer::{TimerKind, TimerTable};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// Capability traits
// ============================================================================

/// I/O-readiness handler: what the reactor drives.
pub trait ReadyHandler: Send + Sync {
    /// Process readiness for `ops`; returns the next mask to register.
    fn handle_ready(&self, ops: SocketOp) -> SocketOp;
}

/// Cancelable-invocation handler: what proxies/callers drive.
pub trait CancelHandler: Send + Sync {
    /// Cancel a two-way request locally. Delivered as `Canceled` exactly
    /// once if the request was still pending.
    fn cancel_request(&self, request_id: i32);

    /// Fail a two-way request with a transport-level error. Abort-class
    /// errors escalate into a full connection close to preserve
    /// at-most-once semantics.
    fn abort_request(&self, request_id: i32, error: ConnectionError);
}

// ============================================================================
// Statistics
// ============================================================================

/// Per-connection counters.
#[derive(Clone, Debug, Default)]
pub struct ConnectionStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub heartbeats_sent: u64,
    pub requests_dispatched: u64,
    pub replies_received: u64,
    pub send_queue_depth: usize,
}

// ============================================================================
// Core (lock-guarded state)
// ============================================================================

struct Core {
    transceiver: Box<dyn Transceiver>,
    state: ConnState,
    exception: Option<ConnectionError>,

    read_buf: Buffer,
    /// The next read targets a 14-byte header (vs. a frame body).
    read_header: bool,
    cur_header: Option<MessageHeader>,

    /// Server-side validation frame mid-write.
    validate_frame: Option<Buffer>,
    activate_on_validate: bool,

    send_queue: VecDeque<OutgoingMessage>,
    pending: HashMap<i32, PendingReply>,
    next_request_id: i32,

    upcall_count: usize,
    dispatch_count: usize,

    timers: TimerTable,
    last_read_at: Instant,

    /// Readiness the transceiver asked for during graceful shutdown.
    closing_ops: SocketOp,
    shutdown_initiated: bool,

    dispatcher: Option<Arc<dyn DispatchPipeline>>,
    close_callback: Option<Box<dyn FnOnce() + Send>>,
    stats: ConnectionStats,
}

// ============================================================================
// Connection
// ============================================================================

/// One connection over one transport-level socket.
pub struct Connection {
    me: Weak<Connection>,
    core: Mutex<Core>,
    cond: Condvar,
    config: RuntimeConfig,
    endpoint: Endpoint,
    /// We opened this connection (vs. accepted by an adapter).
    initiator: bool,
    executor: Arc<UpcallExecutor>,
    desc: String,
    id: u64,
    /// Reactor hook: called with the new readiness mask after state
    /// changes outside a `ready` callback.
    readiness_hook: Mutex<Option<Box<dyn Fn(SocketOp) + Send + Sync>>>,
    /// Registry hook: runs exactly once when the connection finishes.
    finished_hook: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Connection {
    /// Create a connection over an established transceiver.
    pub fn new(
        transceiver: Box<dyn Transceiver>,
        endpoint: Endpoint,
        initiator: bool,
        config: RuntimeConfig,
        executor: Arc<UpcallExecutor>,
        dispatcher: Option<Arc<dyn DispatchPipeline>>,
    ) -> Arc<Connection> {
        let desc = transceiver.description();
        let mut read_buf = Buffer::new();
        read_buf.resize(HEADER_SIZE);

        Arc::new_cyclic(|me| Connection {
            me: me.clone(),
            core: Mutex::new(Core {
                transceiver,
                state: ConnState::NotInitialized,
                exception: None,
                read_buf,
                read_header: true,
                cur_header: None,
                validate_frame: None,
                activate_on_validate: false,
                send_queue: VecDeque::new(),
                pending: HashMap::new(),
                next_request_id: 1,
                upcall_count: 0,
                dispatch_count: 0,
                timers: TimerTable::new(),
                last_read_at: Instant::now(),
                closing_ops: SocketOp::NONE,
                shutdown_initiated: false,
                dispatcher,
                close_callback: None,
                stats: ConnectionStats::default(),
            }),
            cond: Condvar::new(),
            config,
            endpoint,
            initiator,
            executor,
            desc,
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            readiness_hook: Mutex::new(None),
            finished_hook: Mutex::new(None),
        })
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Human-readable transport description, fixed at creation.
    pub fn description(&self) -> &str {
        &self.desc
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    pub fn state(&self) -> ConnState {
        self.core.lock().state
    }

    /// The latched exception, if any closing state has been entered.
    pub fn latched_error(&self) -> Option<ConnectionError> {
        self.core.lock().exception.clone()
    }

    pub fn stats(&self) -> ConnectionStats {
        let core = self.core.lock();
        let mut stats = core.stats.clone();
        stats.send_queue_depth = core.send_queue.len();
        stats
    }

    /// Set the callback invoked (outside the lock) when the connection
    /// reaches Closed and finalizes.
    pub fn set_close_callback(&self, cb: Box<dyn FnOnce() + Send>) {
        self.core.lock().close_callback = Some(cb);
    }

    /// Reactor hook for readiness changes initiated outside `ready`.
    pub fn set_readiness_hook(&self, hook: Box<dyn Fn(SocketOp) + Send + Sync>) {
        *self.readiness_hook.lock() = Some(hook);
    }

    pub(crate) fn set_finished_hook(&self, hook: Box<dyn FnOnce() + Send>) {
        *self.finished_hook.lock() = Some(hook);
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Begin transceiver initialization and protocol validation.
    ///
    /// Returns the readiness mask to register; call [`ready`](Self::ready)
    /// on each readiness notification until validated.
    pub fn start(&self) -> SocketOp {
        self.with_core(|this, core, upcalls| {
            if !this.config.connect_timeout.is_zero() {
                core.timers.schedule(
                    TimerKind::Connect,
                    Instant::now() + this.config.connect_timeout,
                );
            }
            this.initialize_validate(core, upcalls)
        })
    }

    /// Promote to Active: start reading requests.
    pub fn activate(&self) {
        self.with_core(|this, core, upcalls| {
            if core.state == ConnState::Holding {
                this.set_state(core, ConnState::Active, None, upcalls);
            } else if core.state < ConnState::Holding {
                core.activate_on_validate = true;
            }
        });
        self.notify_readiness();
    }

    /// Demote to Holding: stop reading new requests without closing.
    pub fn hold(&self) {
        self.with_core(|this, core, upcalls| {
            if core.state == ConnState::Active {
                this.set_state(core, ConnState::Holding, None, upcalls);
            }
        });
        self.notify_readiness();
    }

    /// Begin graceful shutdown: drain dispatches, send the close frame,
    /// wait for transport-level shutdown.
    pub fn close_gracefully(&self) {
        self.with_core(|this, core, upcalls| {
            this.set_state(
                core,
                ConnState::Closing,
                Some(ConnectionError::CloseRequested),
                upcalls,
            );
        });
        self.notify_readiness();
    }

    /// Force-close with an explicit error.
    pub fn abort(&self, error: ConnectionError) {
        self.with_core(|this, core, upcalls| {
            this.set_state(core, ConnState::Closed, Some(error), upcalls);
        });
        self.notify_readiness();
    }

    /// Block until validation completes (or fails).
    pub fn wait_until_validated(&self, timeout: Duration) -> Result<(), ConnectionError> {
        let mut core = self.core.lock();
        let deadline = Instant::now() + timeout;
        while core.state <= ConnState::NotValidated && core.exception.is_none() {
            if self.cond.wait_until(&mut core, deadline).timed_out() {
                return Err(ConnectionError::ConnectTimeout);
            }
        }
        match &core.exception {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    /// Block until the connection is Holding (or beyond) with no
    /// dispatches in flight. Used during adapter deactivation.
    pub fn wait_until_holding(&self) {
        let mut core = self.core.lock();
        while core.state < ConnState::Holding || core.dispatch_count > 0 {
            self.cond.wait(&mut core);
        }
    }

    /// Block until finalization completes.
    pub fn wait_until_finished(&self) {
        let mut core = self.core.lock();
        while core.state < ConnState::Finished {
            self.cond.wait(&mut core);
        }
    }

    // ========================================================================
    // Sending
    // ========================================================================

    /// Send a two-way request frame; assigns and patches the request ID.
    pub fn send_request(
        &self,
        mut frame: Buffer,
        compress: bool,
    ) -> Result<TwowayHandle, ConnectionError> {
        let result = self.with_core(|this, core, upcalls| {
            this.check_sendable(core)?;

            let request_id = core.next_request_id;
            // Monotonically increasing; wraps to 1 (0 means "no reply").
            core.next_request_id = match core.next_request_id.checked_add(1) {
                Some(n) => n,
                None => 1,
            };
            frame.patch_i32(REQUEST_ID_OFFSET, request_id);

            let (sink, receiver) = unbounded();
            core.pending.insert(request_id, PendingReply { sink, sent: false });
            core.timers.cancel(TimerKind::Inactivity);

            let msg = OutgoingMessage::new(frame, compress, request_id);
            match this.send_message(core, msg, upcalls) {
                Ok(_) => Ok(TwowayHandle {
                    request_id,
                    receiver,
                }),
                Err(e) => {
                    core.pending.remove(&request_id);
                    Err(e)
                }
            }
        });
        self.notify_readiness();
        result
    }

    /// Send a oneway request or pre-built frame; no reply is expected.
    pub fn send_oneway(
        &self,
        frame: Buffer,
        compress: bool,
    ) -> Result<SendStatus, ConnectionError> {
        self.send_oneway_with_notify(frame, compress, None)
    }

    /// Oneway send with an optional sent-confirmation channel, signaled
    /// once the frame is fully written to the transport.
    pub fn send_oneway_with_notify(
        &self,
        frame: Buffer,
        compress: bool,
        notify: Option<Sender<()>>,
    ) -> Result<SendStatus, ConnectionError> {
        let result = self.with_core(|this, core, upcalls| {
            this.check_sendable(core)?;
            core.timers.cancel(TimerKind::Inactivity);
            let mut msg = OutgoingMessage::new(frame, compress, 0);
            msg.sent_notify = notify;
            this.send_message(core, msg, upcalls)
        });
        self.notify_readiness();
        result
    }

    fn check_sendable(&self, core: &Core) -> Result<(), ConnectionError> {
        if core.state.is_closing() {
            return Err(core
                .exception
                .clone()
                .unwrap_or(ConnectionError::CloseRequested));
        }
        if !core.state.is_validated() {
            return Err(ConnectionError::ConnectFailed(
                "connection not validated".to_string(),
            ));
        }
        Ok(())
    }

    // ========================================================================
    // Reactor entry points
    // ========================================================================

    /// I/O readiness callback. Performs at most one read pass and one
    /// write pass, hands produced upcalls to the executor, and returns
    /// the next readiness mask to register.
    pub fn ready(&self, ops: SocketOp) -> SocketOp {
        self.with_core(|this, core, upcalls| {
            if core.state >= ConnState::Closed {
                return SocketOp::NONE;
            }
            if core.state <= ConnState::NotValidated {
                let op = this.initialize_validate(core, upcalls);
                if core.state <= ConnState::NotValidated || core.state >= ConnState::Closed {
                    return op;
                }
                // Validated on this notification: bytes that arrived
                // behind the handshake must drain in the same pass
                // (readiness is edge-triggered).
            }
            if ops.has_read() && core.state != ConnState::Holding {
                this.read_pass(core, upcalls);
            }
            if ops.has_write() && core.state < ConnState::Closed {
                this.write_pass(core, upcalls);
            }
            this.compute_ops(core)
        })
    }

    /// Fire any due timers. The reactor calls this each poll tick.
    pub fn check_timers(&self, now: Instant) {
        self.with_core(|this, core, upcalls| {
            for (kind, token) in core.timers.due(now) {
                if core.timers.fired(kind, token) {
                    this.timer_fired(core, kind, upcalls);
                }
            }
        });
        self.notify_readiness();
    }

    /// Earliest armed timer deadline, for the reactor's poll timeout.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.core.lock().timers.next_deadline()
    }

    /// Current desired readiness mask.
    pub fn desired_ops(&self) -> SocketOp {
        let core = self.core.lock();
        self.compute_ops(&core)
    }

    /// Raw descriptor of the underlying transport, for reactor
    /// registration. `None` for transports without one (tests).
    #[cfg(unix)]
    pub fn raw_fd(&self) -> Option<std::os::unix::io::RawFd> {
        self.core.lock().transceiver.raw_fd()
    }

    // ========================================================================
    // Internals: locking scaffold
    // ========================================================================

    fn with_core<R>(&self, f: impl FnOnce(&Connection, &mut Core, &mut Vec<Upcall>) -> R) -> R {
        let mut upcalls = Vec::new();
        let result = {
            let mut core = self.core.lock();
            let r = f(self, &mut core, &mut upcalls);
            self.cond.notify_all();
            r
        };
        if !upcalls.is_empty() {
            self.executor.execute_all(upcalls);
        }
        result
    }

    fn notify_readiness(&self) {
        let ops = {
            let core = self.core.lock();
            if core.state >= ConnState::Finished {
                SocketOp::NONE
            } else {
                self.compute_ops(&core)
            }
        };
        if let Some(hook) = self.readiness_hook.lock().as_ref() {
            hook(ops);
        }
    }

    fn compute_ops(&self, core: &Core) -> SocketOp {
        let write_needed = !core.send_queue.is_empty() || core.validate_frame.is_some();
        let write = if write_needed {
            SocketOp::WRITE
        } else {
            SocketOp::NONE
        };
        match core.state {
            ConnState::NotInitialized | ConnState::NotValidated => SocketOp::READ | write,
            ConnState::Active | ConnState::Closing => SocketOp::READ | write,
            ConnState::Holding => write,
            ConnState::ClosingPending => core.closing_ops | write,
            ConnState::Closed | ConnState::Finished => SocketOp::NONE,
        }
    }

    // ========================================================================
    // Internals: state ladder
    // ========================================================================

    fn set_state(
        &self,
        core: &mut Core,
        new_state: ConnState,
        error: Option<ConnectionError>,
        upcalls: &mut Vec<Upcall>,
    ) {
        if let Some(e) = error {
            if core.exception.is_none() {
                if !e.is_benign() && self.config.warn_connections {
                    log::warn!("[{}] connection error: {}", self.desc, e);
                } else {
                    log::debug!("[{}] connection error: {}", self.desc, e);
                }
                core.exception = Some(e);
            }
        }

        let mut target = new_state;
        // Datagram endpoints cannot shut down gracefully, and a close
        // handshake is pointless before the peer ever validated.
        if matches!(target, ConnState::Closing | ConnState::ClosingPending) {
            if self.endpoint.datagram || core.state <= ConnState::NotValidated {
                target = ConnState::Closed;
            }
        }

        let allowed = target > core.state
            || (core.state == ConnState::Holding && target == ConnState::Active);
        if !allowed {
            return;
        }

        if self.config.trace.network >= 2 {
            log::trace!("[{}] state {} -> {}", self.desc, core.state, target);
        }
        core.state = target;

        match target {
            ConnState::Active => {
                self.quiescence_check(core);
            }
            ConnState::Closing => {
                core.timers.cancel(TimerKind::Inactivity);
                if core.upcall_count == 0 && !core.shutdown_initiated {
                    self.initiate_shutdown(core, upcalls);
                }
            }
            ConnState::Closed => {
                core.timers.cancel_all();
                core.transceiver.close();
                if core.upcall_count == 0 {
                    self.finish(core, upcalls);
                }
            }
            _ => {}
        }
    }

    /// Write the close-connection frame; its send completion advances the
    /// state to ClosingPending.
    fn initiate_shutdown(&self, core: &mut Core, upcalls: &mut Vec<Upcall>) {
        debug_assert_eq!(core.state, ConnState::Closing);
        debug_assert_eq!(core.upcall_count, 0);
        core.shutdown_initiated = true;

        let msg = OutgoingMessage::control(&CLOSE_CONNECTION_FRAME);
        // A synchronous send transitions inside send_message; a queued one
        // transitions when the write pass completes it. Failures close.
        let _ = self.send_message(core, msg, upcalls);
    }

    /// Enter ClosingPending: hand graceful shutdown to the transceiver.
    fn enter_closing_pending(&self, core: &mut Core, initiator: bool, upcalls: &mut Vec<Upcall>) {
        if core.state >= ConnState::ClosingPending {
            return;
        }
        core.state = ConnState::ClosingPending;

        let reason = core
            .exception
            .clone()
            .unwrap_or(ConnectionError::CloseRequested);
        let ops = core.transceiver.closing(initiator, &reason);
        core.closing_ops = ops;

        if ops.is_none() {
            self.set_state(core, ConnState::Closed, None, upcalls);
        } else if !self.config.close_timeout.is_zero() {
            core.timers
                .schedule(TimerKind::Close, Instant::now() + self.config.close_timeout);
        }
    }

    /// Finalize: fail leftover work, release buffers, fire callbacks.
    fn finish(&self, core: &mut Core, upcalls: &mut Vec<Upcall>) {
        debug_assert_eq!(core.state, ConnState::Closed);
        debug_assert_eq!(core.upcall_count, 0);

        let error = core
            .exception
            .clone()
            .unwrap_or(ConnectionError::CloseRequested);

        for mut msg in core.send_queue.drain(..) {
            // A reply that raced ahead of its own send still gets
            // delivered; the caller sees exactly one completion.
            if let Some((pending, reply)) = msg.deferred_reply.take() {
                let _ = pending.sink.send(Ok(reply));
            }
        }
        for (_, pending) in core.pending.drain() {
            let _ = pending.sink.send(Err(InvokeError::Connection {
                error: error.clone(),
                sent: pending.sent,
            }));
        }

        core.read_buf.release();
        core.transceiver.destroy();
        core.state = ConnState::Finished;

        if self.config.trace.network >= 1 {
            log::trace!("[{}] closed: {}", self.desc, error);
        }

        if let Some(cb) = core.close_callback.take() {
            upcalls.push(cb);
        }
        if let Some(hook) = self.finished_hook.lock().take() {
            upcalls.push(hook);
        }
    }

    // ========================================================================
    // Internals: validation
    // ========================================================================

    fn initialize_validate(&self, core: &mut Core, upcalls: &mut Vec<Upcall>) -> SocketOp {
        if core.state == ConnState::NotInitialized {
            let mut scratch = Buffer::new();
            let init_result = {
                let Core {
                    transceiver,
                    read_buf,
                    ..
                } = core;
                transceiver.initialize(read_buf, &mut scratch)
            };
            match init_result {
                Ok(op) if !op.is_none() => return op,
                Ok(_) => self.set_state(core, ConnState::NotValidated, None, upcalls),
                Err(e) => {
                    self.set_state(core, ConnState::Closed, Some(e.into()), upcalls);
                    return SocketOp::NONE;
                }
            }
        }

        if core.state == ConnState::NotValidated {
            if !self.endpoint.datagram {
                if !self.initiator {
                    // Server side writes the validation frame.
                    if core.validate_frame.is_none() {
                        core.validate_frame =
                            Some(Buffer::from_vec(VALIDATE_CONNECTION_FRAME.to_vec()));
                    }
                    let write_result = {
                        let Core {
                            transceiver,
                            validate_frame,
                            ..
                        } = core;
                        match validate_frame.as_mut() {
                            Some(buf) => transceiver.write(buf),
                            None => Ok(SocketOp::NONE),
                        }
                    };
                    match write_result {
                        Ok(op) if !op.is_none() => return op,
                        Ok(_) => core.validate_frame = None,
                        Err(e) => {
                            self.set_state(core, ConnState::Closed, Some(e.into()), upcalls);
                            return SocketOp::NONE;
                        }
                    }
                } else {
                    // Client side reads the validation frame.
                    let read_result = {
                        let Core {
                            transceiver,
                            read_buf,
                            ..
                        } = core;
                        transceiver.read(read_buf)
                    };
                    match read_result {
                        Ok(op) if !op.is_none() => return op,
                        Ok(_) => {
                            match MessageHeader::parse(core.read_buf.as_slice()) {
                                Ok(header)
                                    if header.msg_type == MessageType::ValidateConnection
                                        && header.size == HEADER_SIZE => {}
                                Ok(_) => {
                                    self.set_state(
                                        core,
                                        ConnState::Closed,
                                        Some(ProtocolError::BadValidateFrame.into()),
                                        upcalls,
                                    );
                                    return SocketOp::NONE;
                                }
                                Err(e) => {
                                    self.set_state(
                                        core,
                                        ConnState::Closed,
                                        Some(e.into()),
                                        upcalls,
                                    );
                                    return SocketOp::NONE;
                                }
                            }
                            core.last_read_at = Instant::now();
                            core.read_buf.resize(HEADER_SIZE);
                            core.read_buf.set_pos(0);
                            core.read_header = true;
                        }
                        Err(e) => {
                            self.set_state(core, ConnState::Closed, Some(e.into()), upcalls);
                            return SocketOp::NONE;
                        }
                    }
                }
            }

            core.timers.cancel(TimerKind::Connect);
            if self.config.trace.network >= 1 {
                log::trace!("[{}] validated", self.desc);
            }
            let target = if core.activate_on_validate {
                ConnState::Active
            } else {
                ConnState::Holding
            };
            // Connections always pass through Holding conceptually; the
            // factory's pre-registered activation promotes immediately.
            self.set_state(core, ConnState::Holding, None, upcalls);
            if target == ConnState::Active {
                self.set_state(core, ConnState::Active, None, upcalls);
            }
            self.arm_liveness_timers(core);
        }

        self.compute_ops(core)
    }

    fn arm_liveness_timers(&self, core: &mut Core) {
        if self.config.enable_idle_check && !self.config.idle_timeout.is_zero() {
            let now = Instant::now();
            core.timers
                .schedule(TimerKind::Idle, now + self.config.idle_timeout);
            core.timers
                .schedule(TimerKind::Heartbeat, now + self.config.idle_timeout / 2);
        }
    }

    // ========================================================================
    // Internals: reading
    // ========================================================================

    fn read_pass(&self, core: &mut Core, upcalls: &mut Vec<Upcall>) {
        loop {
            if core.state >= ConnState::Closed {
                return;
            }

            let pre_pos = core.read_buf.pos();
            let read_result = {
                let Core {
                    transceiver,
                    read_buf,
                    ..
                } = core;
                transceiver.read(read_buf)
            };
            match read_result {
                Err(e) => {
                    self.set_state(core, ConnState::Closed, Some(e.into()), upcalls);
                    return;
                }
                Ok(op) if !op.is_none() => {
                    if core.read_buf.pos() > pre_pos {
                        core.last_read_at = Instant::now();
                    }
                    if self.endpoint.datagram {
                        // A datagram must contain the whole frame.
                        let err = ProtocolError::TruncatedDatagram {
                            declared: core.read_buf.len(),
                            received: core.read_buf.pos(),
                        };
                        self.set_state(core, ConnState::Closed, Some(err.into()), upcalls);
                    }
                    return;
                }
                Ok(_) => {}
            }
            core.last_read_at = Instant::now();

            if core.read_header {
                let header = match MessageHeader::parse(core.read_buf.as_slice()) {
                    Ok(h) => h,
                    Err(e) => {
                        self.set_state(core, ConnState::Closed, Some(e.into()), upcalls);
                        return;
                    }
                };
                if header.size > self.config.max_frame_size {
                    let err = ProtocolError::FrameTooLarge {
                        size: header.size,
                        max: self.config.max_frame_size,
                    };
                    self.set_state(core, ConnState::Closed, Some(err.into()), upcalls);
                    return;
                }
                core.cur_header = Some(header);
                core.read_header = false;
                core.read_buf.resize(header.size);
                if header.size > HEADER_SIZE {
                    continue; // read the body
                }
            }

            // Frame complete.
            let header = match core.cur_header.take() {
                Some(h) => h,
                None => {
                    let err = ProtocolError::TruncatedHeader { received: 0 };
                    self.set_state(core, ConnState::Closed, Some(err.into()), upcalls);
                    return;
                }
            };
            let frame = core.read_buf.take_vec();
            core.read_buf.resize(HEADER_SIZE);
            core.read_buf.set_pos(0);
            core.read_header = true;
            core.stats.messages_received += 1;
            core.stats.bytes_received += frame.len() as u64;

            self.parse_message(core, header, frame, upcalls);

            if core.state >= ConnState::Closed || core.state == ConnState::Holding {
                return;
            }
            // Readiness is edge-triggered: keep draining until the
            // transceiver reports would-block.
        }
    }

    fn parse_message(
        &self,
        core: &mut Core,
        header: MessageHeader,
        frame: Vec<u8>,
        upcalls: &mut Vec<Upcall>,
    ) {
        let frame = if header.compress == CompressFlag::Compressed {
            match decompress_frame(&frame, self.config.max_frame_size) {
                Ok(f) => f,
                Err(e) => {
                    self.set_state(core, ConnState::Closed, Some(e.into()), upcalls);
                    return;
                }
            }
        } else {
            frame
        };

        if self.config.trace.protocol >= 1 {
            log::trace!(
                "[{}] received {} ({} bytes)",
                self.desc,
                header.msg_type,
                frame.len()
            );
        }
        #[cfg(feature = "trace-frames")]
        log::trace!(
            "[{}] frame hex: {:02x?}",
            self.desc,
            &frame[..frame.len().min(64)]
        );

        match header.msg_type {
            MessageType::ValidateConnection => {
                // Heartbeat: feeds our idle check, nothing else.
            }

            MessageType::CloseConnection => {
                if self.endpoint.datagram {
                    if self.config.warn_connections {
                        log::warn!(
                            "[{}] ignoring close connection message for datagram connection",
                            self.desc
                        );
                    }
                } else if core.state < ConnState::ClosingPending {
                    if core.exception.is_none() {
                        core.exception = Some(ConnectionError::ClosedByPeer);
                    }
                    // Respond, don't re-initiate: our own close frame is
                    // suppressed even if a local close started later.
                    if core.state < ConnState::Closing {
                        core.state = ConnState::Closing;
                    }
                    core.shutdown_initiated = true;
                    core.timers.cancel(TimerKind::Inactivity);
                    self.enter_closing_pending(core, false, upcalls);
                }
            }

            MessageType::Request => {
                if core.state.is_closing() {
                    log::debug!(
                        "[{}] received request during closing (ignored, client will retry)",
                        self.desc
                    );
                } else if frame.len() < HEADER_SIZE + 4 {
                    let err = ProtocolError::IllegalFrameSize(frame.len() as i32);
                    self.set_state(core, ConnState::Closed, Some(err.into()), upcalls);
                } else {
                    self.queue_dispatch(core, frame, false, 1, header.compress, upcalls);
                }
            }

            MessageType::RequestBatch => {
                if core.state.is_closing() {
                    log::debug!(
                        "[{}] received batch request during closing (ignored)",
                        self.desc
                    );
                } else if frame.len() < HEADER_SIZE + 4 {
                    let err = ProtocolError::IllegalFrameSize(frame.len() as i32);
                    self.set_state(core, ConnState::Closed, Some(err.into()), upcalls);
                } else {
                    let count = i32::from_le_bytes([
                        frame[HEADER_SIZE],
                        frame[HEADER_SIZE + 1],
                        frame[HEADER_SIZE + 2],
                        frame[HEADER_SIZE + 3],
                    ]);
                    if count < 0 {
                        let err = ProtocolError::InvalidBatchCount(count);
                        self.set_state(core, ConnState::Closed, Some(err.into()), upcalls);
                    } else if count > 0 {
                        self.queue_dispatch(
                            core,
                            frame,
                            true,
                            count as usize,
                            header.compress,
                            upcalls,
                        );
                    }
                }
            }

            MessageType::Reply => {
                if frame.len() < HEADER_SIZE + 4 {
                    let err = ProtocolError::IllegalFrameSize(frame.len() as i32);
                    self.set_state(core, ConnState::Closed, Some(err.into()), upcalls);
                    return;
                }
                let request_id = i32::from_le_bytes([
                    frame[REQUEST_ID_OFFSET],
                    frame[REQUEST_ID_OFFSET + 1],
                    frame[REQUEST_ID_OFFSET + 2],
                    frame[REQUEST_ID_OFFSET + 3],
                ]);
                match core.pending.remove(&request_id) {
                    Some(pending) => {
                        // A decode failure here is confined to this one
                        // invocation; the envelope was already validated.
                        let result = match crate::protocol::request::parse_reply(&frame) {
                            Ok((_, status, body)) => Ok(IncomingReply {
                                status,
                                body: body.to_vec(),
                            }),
                            Err(e) => Err(InvokeError::ReplyMarshal(e)),
                        };

                        // Race: the reply arrived before our own send of
                        // this request completed. Defer delivery until the
                        // write finishes so "sent" stays ahead of
                        // "completed".
                        let head_is_same_request = core
                            .send_queue
                            .front()
                            .map(|m| m.request_id == request_id)
                            .unwrap_or(false);
                        if head_is_same_request {
                            if let (Some(head), Ok(reply)) =
                                (core.send_queue.front_mut(), result.clone())
                            {
                                head.deferred_reply = Some((pending, reply));
                            } else {
                                let _ = pending.sink.send(result);
                            }
                        } else {
                            core.stats.replies_received += 1;
                            let _ = pending.sink.send(result);
                        }
                        self.quiescence_check(core);
                    }
                    None => {
                        // Canceled or duplicate; nothing is waiting.
                        log::debug!(
                            "[{}] reply for unknown request id {}",
                            self.desc,
                            request_id
                        );
                    }
                }
            }
        }
    }

    fn queue_dispatch(
        &self,
        core: &mut Core,
        frame: Vec<u8>,
        batch: bool,
        count: usize,
        compress: CompressFlag,
        upcalls: &mut Vec<Upcall>,
    ) {
        core.timers.cancel(TimerKind::Inactivity);
        core.dispatch_count += count;
        core.upcall_count += count;
        core.stats.requests_dispatched += count as u64;

        let me = self.me.clone();
        let dispatcher = core.dispatcher.clone();
        let compress = compress != CompressFlag::None;
        upcalls.push(Box::new(move || {
            if let Some(conn) = me.upgrade() {
                conn.run_dispatch(frame, batch, count, compress, dispatcher);
            }
        }));
    }

    /// Executor-side: decode and dispatch `count` requests in their
    /// encoded order, sending replies on this same connection.
    fn run_dispatch(
        &self,
        frame: Vec<u8>,
        batch: bool,
        count: usize,
        compress: bool,
        dispatcher: Option<Arc<dyn DispatchPipeline>>,
    ) {
        let mut done = 0usize;
        let result: MarshalResult<()> = (|| {
            let mut is = InputStream::new(&frame);
            is.skip(HEADER_SIZE)?;
            is.skip(4)?; // request id or batch count
            for _ in 0..count {
                let request_id = if batch {
                    0
                } else {
                    i32::from_le_bytes([
                        frame[REQUEST_ID_OFFSET],
                        frame[REQUEST_ID_OFFSET + 1],
                        frame[REQUEST_ID_OFFSET + 2],
                        frame[REQUEST_ID_OFFSET + 3],
                    ])
                };
                let header = RequestHeader::decode(&mut is)?;
                let params = is.read_encapsulation()?.to_vec();
                let request = IncomingRequest {
                    request_id,
                    header,
                    params,
                    compress,
                };

                let response = match &dispatcher {
                    Some(d) => d.dispatch(&request),
                    None => OutgoingResponse::object_not_exist(&request),
                };
                if request_id != 0 {
                    self.send_response(request_id, response, compress);
                }
                done += 1;
                self.dispatch_completed(1);
            }
            Ok(())
        })();

        if let Err(e) = result {
            // Request header decode failures poison the connection.
            if count > done {
                self.dispatch_completed(count - done);
            }
            self.abort(ConnectionError::Marshal(e));
        }
        self.upcall_completed(count);
    }

    /// Send an encoded dispatch outcome back on this connection.
    pub fn send_response(&self, request_id: i32, response: OutgoingResponse, compress: bool) {
        let frame = match response.into_frame(request_id) {
            Ok(frame) => frame,
            Err(e) => {
                log::error!("[{}] failed to encode reply: {}", self.desc, e);
                return;
            }
        };
        self.with_core(|this, core, upcalls| {
            if core.state >= ConnState::Closed {
                // The peer is gone; the reply has nowhere to go.
                return;
            }
            let msg = OutgoingMessage::new(frame, compress, 0);
            let _ = this.send_message(core, msg, upcalls);
        });
        self.notify_readiness();
    }

    fn dispatch_completed(&self, count: usize) {
        self.with_core(|_, core, _| {
            core.dispatch_count = core.dispatch_count.saturating_sub(count);
        });
    }

    fn upcall_completed(&self, count: usize) {
        self.with_core(|this, core, upcalls| {
            core.upcall_count = core.upcall_count.saturating_sub(count);
            if core.upcall_count == 0 {
                if core.state == ConnState::Closing && !core.shutdown_initiated {
                    this.initiate_shutdown(core, upcalls);
                } else if core.state == ConnState::Closed {
                    this.finish(core, upcalls);
                } else {
                    this.quiescence_check(core);
                }
            }
        });
        self.notify_readiness();
    }

    // ========================================================================
    // Internals: writing
    // ========================================================================

    fn send_message(
        &self,
        core: &mut Core,
        mut msg: OutgoingMessage,
        upcalls: &mut Vec<Upcall>,
    ) -> Result<SendStatus, ConnectionError> {
        debug_assert!(core.state < ConnState::Closed);

        if !core.send_queue.is_empty() {
            core.send_queue.push_back(msg);
            return Ok(SendStatus::Queued);
        }

        self.prepare_message(&mut msg);
        let write_result = {
            let Core { transceiver, .. } = core;
            transceiver.write(&mut msg.stream)
        };
        match write_result {
            Ok(op) if op.is_none() => {
                self.note_sent(core, &mut msg);
                if msg.is_close() {
                    self.enter_closing_pending(core, true, upcalls);
                }
                Ok(SendStatus::Sent)
            }
            Ok(_) => {
                core.send_queue.push_back(msg);
                Ok(SendStatus::Queued)
            }
            Err(e) => {
                let error: ConnectionError = e.into();
                self.set_state(core, ConnState::Closed, Some(error.clone()), upcalls);
                Err(core.exception.clone().unwrap_or(error))
            }
        }
    }

    fn write_pass(&self, core: &mut Core, upcalls: &mut Vec<Upcall>) {
        loop {
            if core.send_queue.is_empty() || core.state >= ConnState::Closed {
                return;
            }
            if let Some(head) = core.send_queue.front_mut() {
                if !head.prepared {
                    self.prepare_message(head);
                }
            }

            let write_result = {
                let Core {
                    transceiver,
                    send_queue,
                    ..
                } = core;
                match send_queue.front_mut() {
                    Some(head) => transceiver.write(&mut head.stream),
                    None => return,
                }
            };

            match write_result {
                Ok(op) if !op.is_none() => return,
                Ok(_) => {
                    let msg = core.send_queue.pop_front();
                    if let Some(mut msg) = msg {
                        self.note_sent(core, &mut msg);
                        if let Some((pending, reply)) = msg.deferred_reply.take() {
                            core.stats.replies_received += 1;
                            let _ = pending.sink.send(Ok(reply));
                        }
                        if msg.is_close() {
                            self.enter_closing_pending(core, true, upcalls);
                            return;
                        }
                    }
                    self.quiescence_check(core);
                }
                Err(e) => {
                    self.set_state(core, ConnState::Closed, Some(e.into()), upcalls);
                    return;
                }
            }
        }
    }

    /// Bookkeeping for a fully written frame.
    fn note_sent(&self, core: &mut Core, msg: &mut OutgoingMessage) {
        core.stats.messages_sent += 1;
        core.stats.bytes_sent += msg.stream.len() as u64;
        if msg.is_heartbeat() {
            core.stats.heartbeats_sent += 1;
        }
        if self.config.trace.protocol >= 1 {
            log::trace!(
                "[{}] sent frame ({} bytes, request id {})",
                self.desc,
                msg.stream.len(),
                msg.request_id
            );
        }
        if let Some(notify) = msg.sent_notify.take() {
            let _ = notify.send(());
        }
        if msg.request_id != 0 {
            if let Some(pending) = core.pending.get_mut(&msg.request_id) {
                pending.sent = true;
            }
        }
    }

    /// Finalize compression and the frame header before the first write.
    fn prepare_message(&self, msg: &mut OutgoingMessage) {
        if msg.compress {
            match compress_frame(
                msg.stream.as_slice(),
                self.config.compress_level,
                self.config.compress_min_size,
            ) {
                Some(mut compressed) => {
                    compressed[COMPRESS_FLAG_OFFSET] = CompressFlag::Compressed as u8;
                    let size = compressed.len() as i32;
                    compressed[FRAME_SIZE_OFFSET..FRAME_SIZE_OFFSET + 4]
                        .copy_from_slice(&size.to_le_bytes());
                    msg.stream = Buffer::from_vec(compressed);
                }
                None => {
                    msg.stream
                        .patch(COMPRESS_FLAG_OFFSET, &[CompressFlag::Negotiated as u8]);
                }
            }
        }
        msg.stream.set_pos(0);
        msg.prepared = true;
    }

    // ========================================================================
    // Internals: timers, heartbeat, inactivity
    // ========================================================================

    fn timer_fired(&self, core: &mut Core, kind: TimerKind, upcalls: &mut Vec<Upcall>) {
        match kind {
            TimerKind::Connect => {
                if core.state <= ConnState::NotValidated {
                    self.set_state(
                        core,
                        ConnState::Closed,
                        Some(ConnectionError::ConnectTimeout),
                        upcalls,
                    );
                }
            }

            TimerKind::Close => {
                if core.state.is_closing() && core.state < ConnState::Closed {
                    log::debug!("[{}] graceful shutdown timed out", self.desc);
                    self.set_state(
                        core,
                        ConnState::Closed,
                        Some(ConnectionError::CloseTimeout),
                        upcalls,
                    );
                }
            }

            TimerKind::Inactivity => {
                // Conditions may have changed since arming; re-verify.
                if core.state == ConnState::Active
                    && core.dispatch_count == 0
                    && core.pending.is_empty()
                    && core.read_header
                {
                    self.set_state(
                        core,
                        ConnState::Closing,
                        Some(ConnectionError::InactivityShutdown {
                            timeout: self.config.inactivity_timeout,
                        }),
                        upcalls,
                    );
                }
            }

            TimerKind::Idle => {
                if core.state.is_validated() {
                    let idle = self.config.idle_timeout;
                    if core.transceiver.is_waiting_to_be_read()
                        || core.last_read_at.elapsed() < idle
                    {
                        core.timers.schedule(TimerKind::Idle, Instant::now() + idle);
                    } else {
                        self.set_state(
                            core,
                            ConnState::Closed,
                            Some(ConnectionError::IdleAborted { timeout: idle }),
                            upcalls,
                        );
                    }
                }
            }

            TimerKind::Heartbeat => {
                if core.state.is_validated() {
                    self.quiescence_check(core);
                    // A write generates a read on the peer, feeding its
                    // idle check. An outstanding write already does that.
                    if core.send_queue.is_empty() && !self.endpoint.datagram {
                        let msg = OutgoingMessage::control(&VALIDATE_CONNECTION_FRAME);
                        let _ = self.send_message(core, msg, upcalls);
                    }
                    core.timers.schedule(
                        TimerKind::Heartbeat,
                        Instant::now() + self.config.idle_timeout / 2,
                    );
                }
            }
        }
    }

    /// Arm the inactivity timer when the connection is fully quiescent:
    /// Active, nothing dispatching, nothing pending, not mid-read, and at
    /// most one queued outgoing message which must be a heartbeat.
    fn quiescence_check(&self, core: &mut Core) {
        if core.state != ConnState::Active
            || core.timers.is_armed(TimerKind::Inactivity)
            || self.config.inactivity_timeout.is_zero()
            || core.dispatch_count != 0
            || !core.pending.is_empty()
            || !core.read_header
        {
            return;
        }
        let queue_quiet = match core.send_queue.front() {
            None => true,
            Some(head) => core.send_queue.len() == 1 && head.is_heartbeat(),
        };
        if queue_quiet {
            core.timers.schedule(
                TimerKind::Inactivity,
                Instant::now() + self.config.inactivity_timeout,
            );
        }
    }
}

// ============================================================================
// Capability trait impls
// ============================================================================

impl ReadyHandler for Connection {
    fn handle_ready(&self, ops: SocketOp) -> SocketOp {
        self.ready(ops)
    }
}

impl CancelHandler for Connection {
    fn cancel_request(&self, request_id: i32) {
        self.with_core(|_, core, _| {
            // Splice the request out of the queue unless its bytes have
            // started flowing (the frame boundary must stay intact).
            if let Some(pos) = core
                .send_queue
                .iter()
                .position(|m| m.request_id == request_id)
            {
                let head_started = pos == 0 && core.send_queue[0].stream.pos() > 0;
                if !head_started {
                    if let Some(mut msg) = core.send_queue.remove(pos) {
                        // A reply that raced ahead of the send wins over
                        // the cancellation: deliver it as the one and
                        // only completion.
                        if let Some((pending, reply)) = msg.deferred_reply.take() {
                            let _ = pending.sink.send(Ok(reply));
                        }
                    }
                }
            }
            if let Some(pending) = core.pending.remove(&request_id) {
                let _ = pending.sink.send(Err(InvokeError::Canceled));
            }
        });
        self.notify_readiness();
    }

    fn abort_request(&self, request_id: i32, error: ConnectionError) {
        let escalate = error.is_abort();
        self.with_core(|this, core, upcalls| {
            if let Some(pending) = core.pending.remove(&request_id) {
                let _ = pending.sink.send(Err(InvokeError::Connection {
                    error: error.clone(),
                    sent: pending.sent,
                }));
            }
            if escalate {
                // A fatal abort on a partially sent request closes the
                // whole connection; retrying silently could duplicate it.
                this.set_state(core, ConnState::Closed, Some(error), upcalls);
            }
        });
        self.notify_readiness();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let core = self.core.lock();
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("desc", &self.desc)
            .field("state", &core.state)
            .field("initiator", &self.initiator)
            .field("pending", &core.pending.len())
            .field("send_queue", &core.send_queue.len())
            .finish()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let core = self.core.get_mut();
        if core.state < ConnState::Finished {
            core.transceiver.close();
            core.transceiver.destroy();
        }
    }
}

