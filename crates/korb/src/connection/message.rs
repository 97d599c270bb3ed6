// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Queued outgoing protocol frames.

use crossbeam::channel::Sender;

use crate::buffer::Buffer;
use crate::protocol::MessageType;

use super::invocation::{IncomingReply, PendingReply};

/// One protocol frame queued for transmission.
///
/// The head of the connection's queue is the only message ever partially
/// written to the transport. Ownership stays with the queue until the
/// frame is fully sent or the connection fails.
#[derive(Debug)]
pub(crate) struct OutgoingMessage {
    /// Complete frame bytes; the cursor tracks the unsent window.
    pub stream: Buffer,

    /// Compression requested for this frame.
    pub compress: bool,

    /// Correlated request ID; 0 when no reply is expected.
    pub request_id: i32,

    /// Compression and the size field have been finalized.
    pub prepared: bool,

    /// Signaled once the frame is fully written to the transport.
    pub sent_notify: Option<Sender<()>>,

    /// Reply that arrived before this request's send completed; delivered
    /// when the write finishes (or at finalization).
    pub deferred_reply: Option<(PendingReply, IncomingReply)>,
}

impl OutgoingMessage {
    pub fn new(stream: Buffer, compress: bool, request_id: i32) -> Self {
        Self {
            stream,
            compress,
            request_id,
            prepared: false,
            sent_notify: None,
            deferred_reply: None,
        }
    }

    /// Control frame (heartbeat, close): never compressed, no reply.
    pub fn control(frame: &[u8]) -> Self {
        Self::new(Buffer::from_vec(frame.to_vec()), false, 0)
    }

    fn type_byte(&self) -> Option<u8> {
        self.stream.as_slice().get(8).copied()
    }

    /// Heartbeats are bare ValidateConnection frames; the inactivity
    /// check treats a queued heartbeat as "nothing in flight".
    pub fn is_heartbeat(&self) -> bool {
        self.type_byte() == Some(MessageType::ValidateConnection as u8)
    }

    pub fn is_close(&self) -> bool {
        self.type_byte() == Some(MessageType::CloseConnection as u8)
    }
}

// ============================================================================
// Tests
// ============================================================================
