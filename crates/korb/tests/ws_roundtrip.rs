// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! End-to-end test: the connection layer running unchanged over the
//! WebSocket adapter, which tunnels the protocol through WS frames over
//! loopback TCP.

use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use korb::config::RuntimeConfig;
use korb::connection::Connection;
use korb::dispatch::{DispatchPipeline, IncomingRequest, OutgoingResponse};
use korb::encoding::{InputStream, OutputStream};
use korb::executor::UpcallExecutor;
use korb::protocol::request::{Identity, RequestFrameBuilder, RequestHeader};
use korb::protocol::ReplyStatus;
use korb::reactor::Reactor;
use korb::transport::{Endpoint, StreamTransceiver, WsTransceiver};

fn config() -> RuntimeConfig {
    RuntimeConfig {
        inactivity_timeout: Duration::ZERO,
        idle_timeout: Duration::ZERO,
        enable_idle_check: false,
        ..Default::default()
    }
}

struct Doubler;

impl DispatchPipeline for Doubler {
    fn dispatch(&self, request: &IncomingRequest) -> OutgoingResponse {
        let mut is = InputStream::new(&request.params);
        let value = (|| {
            is.start_encapsulation()?;
            let v = is.read_i64()?;
            is.end_encapsulation()?;
            Ok::<_, korb::encoding::MarshalError>(v)
        })();

        match value {
            Ok(v) => {
                let mut os = OutputStream::new();
                os.start_encapsulation().unwrap();
                os.write_i64(v * 2);
                os.end_encapsulation().unwrap();
                OutgoingResponse::ok(os.into_vec())
            }
            Err(_) => OutgoingResponse::unknown_local_exception("bad params"),
        }
    }
}

#[test]
fn websocket_tunnel_carries_request_reply() {
    let reactor = Reactor::spawn().unwrap();
    let executor = Arc::new(UpcallExecutor::new(2).unwrap());

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let client_stream = TcpStream::connect(addr).unwrap();
    let (server_stream, _) = listener.accept().unwrap();

    let client_ws = WsTransceiver::client(
        Box::new(StreamTransceiver::tcp(client_stream).unwrap()),
        &addr.to_string(),
        "/",
    );
    let server_ws = WsTransceiver::server(Box::new(StreamTransceiver::tcp(server_stream).unwrap()));

    let client = Connection::new(
        Box::new(client_ws),
        Endpoint::ws(),
        true,
        config(),
        executor.clone(),
        None,
    );
    let server = Connection::new(
        Box::new(server_ws),
        Endpoint::ws(),
        false,
        config(),
        executor,
        Some(Arc::new(Doubler)),
    );

    client.activate();
    server.activate();
    // The WS upgrade and the protocol validation both run inside start/
    // ready; the reactor drives whichever side is waiting.
    server.start();
    client.start();
    reactor.register(&server).unwrap();
    reactor.register(&client).unwrap();

    client
        .wait_until_validated(Duration::from_secs(5))
        .unwrap();

    let frame = RequestFrameBuilder::new(&RequestHeader::new(Identity::new("math", ""), "double"))
        .unwrap()
        .params(|os| {
            os.write_i64(21);
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

    let mut is = InputStream::new(&reply.body);
    is.start_encapsulation().unwrap();
    assert_eq!(is.read_i64().unwrap(), 42);

    client.close_gracefully();
    server.wait_until_finished();
}
