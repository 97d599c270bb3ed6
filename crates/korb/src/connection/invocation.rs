// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Pending two-way invocations and caller-facing handles.

use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};

use crate::error::InvokeError;
use crate::protocol::ReplyStatus;

/// A reply delivered to one two-way caller.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingReply {
    pub status: ReplyStatus,
    /// Body bytes following the status byte (result encapsulation,
    /// not-exist detail, or message string, depending on the status).
    pub body: Vec<u8>,
}

/// Completion delivered to a two-way caller: the reply, or why there
/// will never be one. Delivered exactly once.
pub type InvokeResult = Result<IncomingReply, InvokeError>;

/// Connection-side record of a pending two-way request.
#[derive(Debug)]
pub(crate) struct PendingReply {
    pub sink: Sender<InvokeResult>,
    /// The request frame has been fully written to the transport.
    pub sent: bool,
}

/// Outcome of a send attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendStatus {
    /// Written synchronously without blocking.
    Sent,
    /// Queued behind earlier traffic; sent when the transport drains.
    Queued,
}

/// Caller-side handle for one two-way invocation.
#[derive(Debug)]
pub struct TwowayHandle {
    pub request_id: i32,
    pub(crate) receiver: Receiver<InvokeResult>,
}

impl TwowayHandle {
    /// Block until the invocation completes.
    pub fn wait(&self) -> InvokeResult {
        match self.receiver.recv() {
            Ok(result) => result,
            // The connection finalized without delivering: treat as canceled.
            Err(_) => Err(InvokeError::Canceled),
        }
    }

    /// Block up to `timeout` for the invocation to complete.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<InvokeResult> {
        match self.receiver.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(InvokeError::Canceled)),
        }
    }

    /// Poll without blocking.
    pub fn try_wait(&self) -> Option<InvokeResult> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(InvokeError::Canceled)),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
