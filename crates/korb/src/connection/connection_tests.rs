// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Scenario tests for the connection state machine: validation, request
//! correlation, backpressure, races, timers, and shutdown paths.

use std::sync::Arc;
use std::thread::sleep;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::buffer::Buffer;
use crate::config::RuntimeConfig;
use crate::dispatch::{DispatchPipeline, IncomingRequest, OutgoingResponse};
use crate::error::{ConnectionError, InvokeError};
use crate::executor::UpcallExecutor;
use crate::protocol::request::{
    BatchRequestBuilder, Identity, ReplyFrameBuilder, RequestFrameBuilder, RequestHeader,
};
use crate::protocol::{MessageType, ProtocolError, ReplyStatus, HEADER_SIZE};
use crate::transport::stream::mock::{MockHandles, MockStream};
use crate::transport::stream::StreamTransceiver;
use crate::transport::{Endpoint, SocketOp};

use super::{CancelHandler, ConnState, Connection, SendStatus};

fn rw() -> SocketOp {
    SocketOp::READ | SocketOp::WRITE
}

// ============================================================================
// Harness
// ============================================================================

fn quiet_config() -> RuntimeConfig {
    RuntimeConfig {
        connect_timeout: Duration::from_secs(5),
        close_timeout: Duration::from_secs(5),
        inactivity_timeout: Duration::ZERO,
        idle_timeout: Duration::ZERO,
        enable_idle_check: false,
        ..Default::default()
    }
}

/// Dispatcher that records operation names and echoes the params back.
#[derive(Default)]
struct EchoPipeline {
    log: Mutex<Vec<String>>,
}

impl EchoPipeline {
    fn operations(&self) -> Vec<String> {
        self.log.lock().clone()
    }
}

impl DispatchPipeline for EchoPipeline {
    fn dispatch(&self, request: &IncomingRequest) -> OutgoingResponse {
        self.log.lock().push(request.header.operation.clone());
        OutgoingResponse::ok(request.params.clone())
    }
}

struct Pair {
    client: Arc<Connection>,
    server: Arc<Connection>,
    client_handles: MockHandles,
    server_handles: MockHandles,
    echo: Arc<EchoPipeline>,
}

/// Build a validated, Active client/server pair over cross-linked mocks.
fn connected_pair(client_config: RuntimeConfig, server_config: RuntimeConfig) -> Pair {
    let (a, b) = MockStream::pair();
    let client_handles = a.handles();
    let server_handles = b.handles();
    let executor = Arc::new(UpcallExecutor::new(1).unwrap());
    let echo = Arc::new(EchoPipeline::default());

    let client = Connection::new(
        Box::new(StreamTransceiver::new(Box::new(a))),
        Endpoint::tcp(),
        true,
        client_config,
        executor.clone(),
        None,
    );
    let server = Connection::new(
        Box::new(StreamTransceiver::new(Box::new(b))),
        Endpoint::tcp(),
        false,
        server_config,
        executor,
        Some(echo.clone() as Arc<dyn DispatchPipeline>),
    );

    client.activate();
    server.activate();
    server.start(); // writes the validation frame
    client.start(); // reads it

    assert_eq!(client.state(), ConnState::Active);
    assert_eq!(server.state(), ConnState::Active);

    Pair {
        client,
        server,
        client_handles,
        server_handles,
        echo,
    }
}

/// Drive both sides through a few readiness rounds, letting executor
/// threads interleave.
fn pump(pair: &Pair) {
    for _ in 0..4 {
        pair.server.ready(rw());
        pair.client.ready(rw());
        sleep(Duration::from_millis(20));
    }
}

fn request_frame(operation: &str) -> Buffer {
    RequestFrameBuilder::new(&RequestHeader::new(Identity::new("widget", ""), operation))
        .unwrap()
        .params(|os| {
            os.write_i32(1234);
            Ok(())
        })
        .unwrap()
        .finish()
}

// ============================================================================
// Validation and lifecycle
// ============================================================================

#[test]
fn test_handshake_promotes_both_sides_to_active() {
    let pair = connected_pair(quiet_config(), quiet_config());
    assert_eq!(pair.client.state(), ConnState::Active);
    assert_eq!(pair.server.state(), ConnState::Active);
    assert!(pair.client.latched_error().is_none());
}

#[test]
fn test_connection_starts_holding_without_activation() {
    let (a, b) = MockStream::pair();
    let executor = Arc::new(UpcallExecutor::new(1).unwrap());
    let client = Connection::new(
        Box::new(StreamTransceiver::new(Box::new(a))),
        Endpoint::tcp(),
        true,
        quiet_config(),
        executor.clone(),
        None,
    );
    let server = Connection::new(
        Box::new(StreamTransceiver::new(Box::new(b))),
        Endpoint::tcp(),
        false,
        quiet_config(),
        executor,
        None,
    );

    server.start();
    client.start();
    assert_eq!(client.state(), ConnState::Holding);
    assert_eq!(server.state(), ConnState::Holding);

    client.activate();
    assert_eq!(client.state(), ConnState::Active);
}

#[test]
fn test_wait_until_validated() {
    let pair = connected_pair(quiet_config(), quiet_config());
    pair.client
        .wait_until_validated(Duration::from_millis(100))
        .unwrap();
}

#[test]
fn test_bad_validate_frame_closes_client() {
    let (a, _b) = MockStream::pair();
    let handles = a.handles();
    let executor = Arc::new(UpcallExecutor::new(1).unwrap());
    let client = Connection::new(
        Box::new(StreamTransceiver::new(Box::new(a))),
        Endpoint::tcp(),
        true,
        quiet_config(),
        executor,
        None,
    );

    // A request frame instead of the validation frame.
    let mut bogus = crate::protocol::VALIDATE_CONNECTION_FRAME;
    bogus[8] = MessageType::Request as u8;
    handles.feed(&bogus);

    client.start();
    assert_eq!(client.state(), ConnState::Finished);
    assert_eq!(
        client.latched_error(),
        Some(ConnectionError::Protocol(ProtocolError::BadValidateFrame))
    );
}

#[test]
fn test_monotonicity_after_close() {
    let pair = connected_pair(quiet_config(), quiet_config());
    pair.client.close_gracefully();
    let closing_state = pair.client.state();
    assert!(closing_state.is_closing());

    // Lifecycle calls cannot regress a closing connection.
    pair.client.activate();
    pair.client.hold();
    assert!(pair.client.state() >= closing_state);
}

// ============================================================================
// Requests and replies
// ============================================================================

#[test]
fn test_twoway_roundtrip_echo() {
    let pair = connected_pair(quiet_config(), quiet_config());

    let handle = pair
        .client
        .send_request(request_frame("ping"), false)
        .unwrap();
    pump(&pair);

    let reply = handle.wait_timeout(Duration::from_secs(2)).unwrap().unwrap();
    assert_eq!(reply.status, ReplyStatus::Ok);

    // The echoed body is the parameter encapsulation.
    let mut is = crate::encoding::InputStream::new(&reply.body);
    is.start_encapsulation().unwrap();
    assert_eq!(is.read_i32().unwrap(), 1234);

    assert_eq!(pair.echo.operations(), vec!["ping".to_string()]);
    assert_eq!(pair.server.stats().requests_dispatched, 1);
}

#[test]
fn test_request_ids_unique_and_nonzero() {
    let pair = connected_pair(quiet_config(), quiet_config());

    let mut seen = std::collections::HashSet::new();
    for _ in 0..50 {
        let handle = pair
            .client
            .send_request(request_frame("op"), false)
            .unwrap();
        assert_ne!(handle.request_id, 0);
        assert!(seen.insert(handle.request_id), "duplicate request id");
    }
}

#[test]
fn test_request_id_wraparound_skips_zero() {
    let pair = connected_pair(quiet_config(), quiet_config());
    pair.client.core.lock().next_request_id = i32::MAX;

    let last = pair
        .client
        .send_request(request_frame("a"), false)
        .unwrap();
    assert_eq!(last.request_id, i32::MAX);

    let wrapped = pair
        .client
        .send_request(request_frame("b"), false)
        .unwrap();
    assert_eq!(wrapped.request_id, 1);
}

#[test]
fn test_oneway_sent_notification() {
    let pair = connected_pair(quiet_config(), quiet_config());

    let (tx, rx) = crossbeam::channel::unbounded();
    let status = pair
        .client
        .send_oneway_with_notify(request_frame("fire"), false, Some(tx))
        .unwrap();
    assert_eq!(status, SendStatus::Sent);
    assert!(rx.try_recv().is_ok());
}

#[test]
fn test_dispatch_without_pipeline_synthesizes_object_not_exist() {
    let (a, b) = MockStream::pair();
    let executor = Arc::new(UpcallExecutor::new(1).unwrap());
    let client = Connection::new(
        Box::new(StreamTransceiver::new(Box::new(a))),
        Endpoint::tcp(),
        true,
        quiet_config(),
        executor.clone(),
        None,
    );
    let server = Connection::new(
        Box::new(StreamTransceiver::new(Box::new(b))),
        Endpoint::tcp(),
        false,
        quiet_config(),
        executor,
        None, // no dispatch pipeline
    );
    client.activate();
    server.activate();
    server.start();
    client.start();

    let handle = client.send_request(request_frame("poke"), false).unwrap();
    for _ in 0..4 {
        server.ready(rw());
        client.ready(rw());
        sleep(Duration::from_millis(20));
    }

    let reply = handle.wait_timeout(Duration::from_secs(2)).unwrap().unwrap();
    assert_eq!(reply.status, ReplyStatus::ObjectNotExist);
}

#[test]
fn test_batch_requests_dispatched_in_encoded_order() {
    let pair = connected_pair(quiet_config(), quiet_config());

    let mut batch = BatchRequestBuilder::new();
    for op in ["first", "second", "third"] {
        batch
            .add_request(&RequestHeader::new(Identity::new("widget", ""), op), |_| {
                Ok(())
            })
            .unwrap();
    }
    pair.client.send_oneway(batch.finish(), false).unwrap();
    pump(&pair);

    assert_eq!(
        pair.echo.operations(),
        vec!["first".to_string(), "second".to_string(), "third".to_string()]
    );
}

#[test]
fn test_compressed_request_roundtrip() {
    let mut config = quiet_config();
    config.compress_min_size = 32;
    let pair = connected_pair(config.clone(), config);

    // Repetitive params compress well below the original size.
    let frame = RequestFrameBuilder::new(&RequestHeader::new(Identity::new("widget", ""), "bulk"))
        .unwrap()
        .params(|os| {
            os.write_byte_seq(&[7u8; 2048])?;
            Ok(())
        })
        .unwrap()
        .finish();

    let handle = pair.client.send_request(frame, true).unwrap();
    pump(&pair);

    let reply = handle.wait_timeout(Duration::from_secs(2)).unwrap().unwrap();
    assert_eq!(reply.status, ReplyStatus::Ok);
    assert_eq!(pair.echo.operations(), vec!["bulk".to_string()]);
}

// ============================================================================
// Backpressure and ordering
// ============================================================================

#[test]
fn test_blocked_writes_queue_fifo() {
    let pair = connected_pair(quiet_config(), quiet_config());
    pair.client_handles.set_block_writes(true);

    for op in ["a", "b", "c"] {
        let status = pair.client.send_oneway(request_frame(op), false).unwrap();
        assert_eq!(status, SendStatus::Queued);
    }
    assert_eq!(pair.client.stats().send_queue_depth, 3);

    pair.client_handles.set_block_writes(false);
    pump(&pair);

    assert_eq!(
        pair.echo.operations(),
        vec!["a".to_string(), "b".to_string(), "c".to_string()]
    );
    assert_eq!(pair.client.stats().send_queue_depth, 0);
}

// ============================================================================
// Reply/send race and cancellation
// ============================================================================

/// Forge a reply frame for a given request ID, as the peer would send it.
fn forged_reply(request_id: i32) -> Vec<u8> {
    ReplyFrameBuilder::new(request_id, ReplyStatus::Ok)
        .empty_params()
        .finish()
        .into_vec()
}

#[test]
fn test_reply_arriving_before_send_completion_is_deferred() {
    let pair = connected_pair(quiet_config(), quiet_config());
    pair.client_handles.set_block_writes(true);

    let handle = pair
        .client
        .send_request(request_frame("slow"), false)
        .unwrap();

    // The "reply" arrives while the request is still queued.
    pair.client_handles.feed(&forged_reply(handle.request_id));
    pair.client.ready(SocketOp::READ);

    // Deferred: not delivered until the send completes.
    assert!(handle.try_wait().is_none());

    pair.client_handles.set_block_writes(false);
    pair.client.ready(SocketOp::WRITE);

    let reply = handle.wait_timeout(Duration::from_secs(1)).unwrap().unwrap();
    assert_eq!(reply.status, ReplyStatus::Ok);
}

#[test]
fn test_reply_before_sent_then_cancel_delivers_reply_once() {
    let pair = connected_pair(quiet_config(), quiet_config());
    pair.client_handles.set_block_writes(true);

    let handle = pair
        .client
        .send_request(request_frame("raced"), false)
        .unwrap();
    pair.client_handles.feed(&forged_reply(handle.request_id));
    pair.client.ready(SocketOp::READ);

    // Cancel in the deferral window: the reply wins; the caller sees
    // exactly one completion and it is the reply.
    pair.client.cancel_request(handle.request_id);

    match handle.wait_timeout(Duration::from_secs(1)).unwrap() {
        Ok(reply) => assert_eq!(reply.status, ReplyStatus::Ok),
        other => panic!("expected the raced reply, got {:?}", other),
    }
    // No second reply ever arrives on the handle.
    assert!(!matches!(handle.try_wait(), Some(Ok(_))));
}

#[test]
fn test_cancel_pending_request_delivers_canceled() {
    let pair = connected_pair(quiet_config(), quiet_config());

    let handle = pair
        .client
        .send_request(request_frame("orphan"), false)
        .unwrap();
    pair.client.cancel_request(handle.request_id);

    assert_eq!(handle.wait(), Err(InvokeError::Canceled));
}

#[test]
fn test_cancel_unsent_request_splices_queue() {
    let pair = connected_pair(quiet_config(), quiet_config());
    pair.client_handles.set_block_writes(true);

    let doomed = pair.client.send_request(request_frame("x"), false).unwrap();
    let kept = pair.client.send_request(request_frame("y"), false).unwrap();
    assert_eq!(pair.client.stats().send_queue_depth, 2);

    pair.client.cancel_request(doomed.request_id);
    assert_eq!(pair.client.stats().send_queue_depth, 1);
    assert_eq!(doomed.wait(), Err(InvokeError::Canceled));

    pair.client_handles.set_block_writes(false);
    pump(&pair);
    assert_eq!(pair.echo.operations(), vec!["y".to_string()]);
    drop(kept);
}

#[test]
fn test_abort_request_with_fatal_error_closes_connection() {
    let pair = connected_pair(quiet_config(), quiet_config());

    let handle = pair
        .client
        .send_request(request_frame("doomed"), false)
        .unwrap();
    pair.client
        .abort_request(handle.request_id, ConnectionError::Aborted);

    match handle.wait() {
        Err(InvokeError::Connection { error, sent }) => {
            assert_eq!(error, ConnectionError::Aborted);
            assert!(sent);
        }
        other => panic!("unexpected completion {:?}", other),
    }
    // Abort-class errors escalate to a full close.
    assert!(pair.client.state().is_terminal());
}

// ============================================================================
// At-most-once
// ============================================================================

#[test]
fn test_transport_death_after_sent_fails_request_exactly_once() {
    let pair = connected_pair(quiet_config(), quiet_config());

    let handle = pair
        .client
        .send_request(request_frame("lost"), false)
        .unwrap();

    // Transport dies after the send was reported; the peer's fate is
    // unknown, so the failure must not be silently retryable.
    pair.server.abort(ConnectionError::Aborted);
    pair.client.ready(SocketOp::READ);

    match handle.wait_timeout(Duration::from_secs(1)).unwrap() {
        Err(InvokeError::Connection { error, sent }) => {
            assert!(sent);
            assert!(matches!(error, ConnectionError::ConnectionLost(_)));
            assert!(!error.retryable(sent, false));
            assert!(error.retryable(sent, true)); // idempotent may retry
        }
        other => panic!("unexpected completion {:?}", other),
    }

    // Exactly once: no further completion is queued on the handle.
    assert!(!matches!(handle.try_wait(), Some(Ok(_))));
}

// ============================================================================
// Graceful shutdown
// ============================================================================

#[test]
fn test_graceful_close_latches_benign_errors_both_sides() {
    let pair = connected_pair(quiet_config(), quiet_config());

    pair.client.close_gracefully();
    pump(&pair);

    assert_eq!(
        pair.client.latched_error(),
        Some(ConnectionError::CloseRequested)
    );
    assert!(pair.client.latched_error().unwrap().is_benign());

    assert_eq!(
        pair.server.latched_error(),
        Some(ConnectionError::ClosedByPeer)
    );
    assert_eq!(pair.server.state(), ConnState::Finished);
    // The responder never emits its own close frame.
    assert_eq!(pair.server.stats().messages_sent, 0);
}

#[test]
fn test_close_frame_sent_exactly_once_in_close_race() {
    let pair = connected_pair(quiet_config(), quiet_config());

    // Both sides initiate simultaneously.
    pair.client.close_gracefully();
    pair.server.close_gracefully();
    pump(&pair);

    // Each side sent exactly one frame: its own close-connection frame.
    // The peer's close, received while already closing, flips to
    // "respond, don't re-initiate" and never emits a second frame.
    assert_eq!(pair.client.stats().messages_sent, 1);
    assert_eq!(pair.server.stats().messages_sent, 1);

    // Local close requests win the latch on both sides.
    assert_eq!(
        pair.client.latched_error(),
        Some(ConnectionError::CloseRequested)
    );
    assert_eq!(
        pair.server.latched_error(),
        Some(ConnectionError::CloseRequested)
    );
}

#[test]
fn test_close_callback_invoked_once_outside_lock() {
    let pair = connected_pair(quiet_config(), quiet_config());

    let fired = Arc::new(Mutex::new(0u32));
    let fired_clone = fired.clone();
    pair.server.set_close_callback(Box::new(move || {
        *fired_clone.lock() += 1;
    }));

    pair.client.close_gracefully();
    pump(&pair);

    assert_eq!(pair.server.state(), ConnState::Finished);
    assert_eq!(*fired.lock(), 1);
}

#[test]
fn test_pending_requests_fail_on_finalization() {
    let pair = connected_pair(quiet_config(), quiet_config());

    // Queue a request the server will never answer.
    pair.client_handles.set_block_writes(true);
    let handle = pair
        .client
        .send_request(request_frame("unanswered"), false)
        .unwrap();

    pair.client.abort(ConnectionError::RuntimeDestroyed);

    match handle.wait_timeout(Duration::from_secs(1)).unwrap() {
        Err(InvokeError::Connection { error, sent }) => {
            assert_eq!(error, ConnectionError::RuntimeDestroyed);
            assert!(!sent);
        }
        other => panic!("unexpected completion {:?}", other),
    }
}

#[test]
fn test_request_received_during_closing_is_dropped() {
    let pair = connected_pair(quiet_config(), quiet_config());

    pair.server.close_gracefully();
    // A request that crossed the close on the wire.
    let frame = request_frame("late");
    pair.server_handles.feed(frame.as_slice());
    pair.server.ready(SocketOp::READ);
    sleep(Duration::from_millis(30));

    assert_eq!(pair.server.stats().requests_dispatched, 0);
    assert!(pair.echo.operations().is_empty());
}

#[test]
fn test_wait_until_finished_unblocks() {
    let pair = connected_pair(quiet_config(), quiet_config());

    let server = pair.server.clone();
    let waiter = std::thread::spawn(move || {
        server.wait_until_finished();
    });

    pair.client.close_gracefully();
    pump(&pair);

    waiter.join().unwrap();
    assert_eq!(pair.server.state(), ConnState::Finished);
}

// ============================================================================
// Framing defenses
// ============================================================================

#[test]
fn test_oversized_frame_rejected() {
    let mut config = quiet_config();
    config.max_frame_size = 64;
    let pair = connected_pair(config.clone(), config);

    // Header declaring a 1 MiB frame.
    let mut bogus = crate::protocol::VALIDATE_CONNECTION_FRAME;
    bogus[10..14].copy_from_slice(&(1024 * 1024i32).to_le_bytes());
    pair.client_handles.feed(&bogus);
    pair.client.ready(SocketOp::READ);

    assert!(matches!(
        pair.client.latched_error(),
        Some(ConnectionError::Protocol(ProtocolError::FrameTooLarge { .. }))
    ));
}

#[test]
fn test_bad_magic_is_protocol_fatal() {
    let pair = connected_pair(quiet_config(), quiet_config());

    let mut bogus = [0u8; HEADER_SIZE];
    bogus[0..4].copy_from_slice(b"XXXX");
    pair.client_handles.feed(&bogus);
    pair.client.ready(SocketOp::READ);

    assert!(matches!(
        pair.client.latched_error(),
        Some(ConnectionError::Protocol(ProtocolError::BadMagic(_)))
    ));
    assert!(pair.client.state().is_terminal());
}

#[test]
fn test_heartbeat_frame_has_no_application_effect() {
    let pair = connected_pair(quiet_config(), quiet_config());

    pair.client_handles
        .feed(&crate::protocol::VALIDATE_CONNECTION_FRAME);
    pair.client.ready(SocketOp::READ);

    assert_eq!(pair.client.state(), ConnState::Active);
    assert_eq!(pair.client.stats().messages_received, 1);
    assert!(pair.client.latched_error().is_none());
}

// ============================================================================
// Timers
// ============================================================================

#[test]
fn test_inactivity_timer_closes_quiet_connection() {
    let mut config = quiet_config();
    config.inactivity_timeout = Duration::from_millis(40);
    let pair = connected_pair(config.clone(), config);

    sleep(Duration::from_millis(80));
    pair.client.check_timers(Instant::now());
    pump(&pair);

    let latched = pair.client.latched_error().unwrap();
    assert!(matches!(
        latched,
        ConnectionError::InactivityShutdown { .. }
    ));
    assert!(latched.is_benign());
}

#[test]
fn test_activity_disarms_inactivity_timer() {
    let mut config = quiet_config();
    config.inactivity_timeout = Duration::from_millis(60);
    let pair = connected_pair(config.clone(), config);

    // Keep a request pending past the inactivity window.
    pair.client_handles.set_block_writes(true);
    let _handle = pair
        .client
        .send_request(request_frame("busy"), false)
        .unwrap();

    sleep(Duration::from_millis(100));
    pair.client.check_timers(Instant::now());

    // A pending invocation means the connection is not inactive.
    assert_eq!(pair.client.state(), ConnState::Active);
}

#[test]
fn test_idle_heartbeat_precedes_peer_inactivity_close() {
    // Client heartbeats at idle/2; the server's inactivity window is
    // wider than the heartbeat period, so it stays open.
    let mut client_config = quiet_config();
    client_config.enable_idle_check = true;
    client_config.idle_timeout = Duration::from_millis(80);

    let server_config = quiet_config();
    let pair = connected_pair(client_config, server_config);

    sleep(Duration::from_millis(60)); // past idle/2 = 40ms
    pair.client.check_timers(Instant::now());
    pair.client.ready(SocketOp::WRITE);

    assert!(pair.client.stats().heartbeats_sent >= 1);

    // The heartbeat reaches the peer as a plain validate frame.
    pair.server.ready(SocketOp::READ);
    assert_eq!(pair.server.state(), ConnState::Active);
    assert!(pair.server.stats().messages_received >= 1);
}

#[test]
fn test_idle_check_aborts_silent_peer() {
    let mut server_config = quiet_config();
    server_config.enable_idle_check = true;
    server_config.idle_timeout = Duration::from_millis(50);

    let pair = connected_pair(quiet_config(), server_config);

    // The client never writes; the server's idle check fires.
    sleep(Duration::from_millis(120));
    pair.server.check_timers(Instant::now());

    assert!(matches!(
        pair.server.latched_error(),
        Some(ConnectionError::IdleAborted { .. })
    ));
}

#[test]
fn test_connect_timeout_fires_before_validation() {
    let (a, _b) = MockStream::pair();
    let executor = Arc::new(UpcallExecutor::new(1).unwrap());
    let mut config = quiet_config();
    config.connect_timeout = Duration::from_millis(30);

    // Client waits for a validation frame that never comes.
    let client = Connection::new(
        Box::new(StreamTransceiver::new(Box::new(a))),
        Endpoint::tcp(),
        true,
        config,
        executor,
        None,
    );
    client.start();
    assert_eq!(client.state(), ConnState::NotValidated);

    sleep(Duration::from_millis(60));
    client.check_timers(Instant::now());

    assert_eq!(
        client.latched_error(),
        Some(ConnectionError::ConnectTimeout)
    );
    assert!(client.state().is_terminal());
}

// ============================================================================
// Holding
// ============================================================================

#[test]
fn test_holding_defers_dispatch_until_activated() {
    let pair = connected_pair(quiet_config(), quiet_config());

    pair.server.hold();
    pair.client.send_oneway(request_frame("held"), false).unwrap();
    pair.server.ready(SocketOp::READ);
    sleep(Duration::from_millis(30));
    assert!(pair.echo.operations().is_empty());

    pair.server.activate();
    pump(&pair);
    assert_eq!(pair.echo.operations(), vec!["held".to_string()]);
}

#[test]
fn test_wait_until_holding_barrier() {
    let pair = connected_pair(quiet_config(), quiet_config());

    let server = pair.server.clone();
    let waiter = std::thread::spawn(move || {
        server.wait_until_holding();
    });

    // Dispatch drains and the connection demotes; the barrier releases.
    pair.server.hold();
    waiter.join().unwrap();
    assert_eq!(pair.server.state(), ConnState::Holding);
}

// ============================================================================
// Datagram collapse
// ============================================================================

#[test]
fn test_datagram_close_collapses_to_closed() {
    let (a, _b) = MockStream::pair();
    let executor = Arc::new(UpcallExecutor::new(1).unwrap());
    let conn = Connection::new(
        Box::new(StreamTransceiver::new(Box::new(a))),
        Endpoint::udp(),
        true,
        quiet_config(),
        executor,
        None,
    );
    conn.activate();
    conn.start();
    assert_eq!(conn.state(), ConnState::Active);

    // Graceful close has no meaning for datagrams: straight to Closed,
    // then Finished (no close frame, no ClosingPending).
    conn.close_gracefully();
    assert_eq!(conn.state(), ConnState::Finished);
    assert_eq!(conn.stats().messages_sent, 0);
}
