// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Dispatch pipeline contract.
//!
//! The connection decodes a request and hands it to a [`DispatchPipeline`]
//! on an executor thread, outside the connection lock. Whatever the
//! pipeline returns is encoded as a reply on the same connection; dispatch
//! failures become error replies and never close the connection.

use crate::buffer::Buffer;
use crate::encoding::MarshalResult;
use crate::protocol::request::{ReplyFrameBuilder, RequestHeader};
use crate::protocol::ReplyStatus;

/// One decoded incoming request, ready for application dispatch.
#[derive(Debug)]
pub struct IncomingRequest {
    /// Correlated request ID; 0 for oneway (no reply is sent).
    pub request_id: i32,
    pub header: RequestHeader,
    /// The parameter encapsulation, verbatim.
    pub params: Vec<u8>,
    /// Whether the reply should be flagged compressible.
    pub compress: bool,
}

/// Application-side request handler.
///
/// Implementations must be callable from multiple executor threads.
pub trait DispatchPipeline: Send + Sync {
    fn dispatch(&self, request: &IncomingRequest) -> OutgoingResponse;
}

impl<F> DispatchPipeline for F
where
    F: Fn(&IncomingRequest) -> OutgoingResponse + Send + Sync,
{
    fn dispatch(&self, request: &IncomingRequest) -> OutgoingResponse {
        self(request)
    }
}

/// The encoded outcome of one dispatch.
#[derive(Debug)]
pub struct OutgoingResponse {
    pub status: ReplyStatus,
    body: ResponseBody,
}

#[derive(Debug)]
enum ResponseBody {
    /// A pre-encoded result or user-exception encapsulation.
    Encaps(Vec<u8>),
    /// Empty result encapsulation.
    Empty,
    /// Identity/facet/operation detail for not-exist statuses.
    NotExist {
        header: RequestHeader,
    },
    /// Plain message for unknown-exception statuses.
    Message(String),
}

impl OutgoingResponse {
    /// Successful dispatch with an empty result.
    pub fn ok_empty() -> Self {
        Self {
            status: ReplyStatus::Ok,
            body: ResponseBody::Empty,
        }
    }

    /// Successful dispatch with a pre-encoded result encapsulation.
    pub fn ok(encaps: Vec<u8>) -> Self {
        Self {
            status: ReplyStatus::Ok,
            body: ResponseBody::Encaps(encaps),
        }
    }

    /// Declared user exception, pre-encoded.
    pub fn user_exception(encaps: Vec<u8>) -> Self {
        Self {
            status: ReplyStatus::UserException,
            body: ResponseBody::Encaps(encaps),
        }
    }

    /// No servant with the request's identity.
    pub fn object_not_exist(request: &IncomingRequest) -> Self {
        Self {
            status: ReplyStatus::ObjectNotExist,
            body: ResponseBody::NotExist {
                header: request.header.clone(),
            },
        }
    }

    /// Servant exists but lacks the requested operation.
    pub fn operation_not_exist(request: &IncomingRequest) -> Self {
        Self {
            status: ReplyStatus::OperationNotExist,
            body: ResponseBody::NotExist {
                header: request.header.clone(),
            },
        }
    }

    /// Dispatch failed with a local runtime error.
    pub fn unknown_local_exception(message: &str) -> Self {
        Self {
            status: ReplyStatus::UnknownLocalException,
            body: ResponseBody::Message(message.to_string()),
        }
    }

    /// Dispatch failed with an unclassifiable error.
    pub fn unknown_exception(message: &str) -> Self {
        Self {
            status: ReplyStatus::UnknownException,
            body: ResponseBody::Message(message.to_string()),
        }
    }

    /// Encode the complete reply frame for `request_id`.
    pub fn into_frame(self, request_id: i32) -> MarshalResult<Buffer> {
        let builder = ReplyFrameBuilder::new(request_id, self.status);
        let builder = match self.body {
            ResponseBody::Empty => builder.empty_params(),
            ResponseBody::Encaps(encaps) => builder.params(|os| os.write_encapsulation(&encaps))?,
            ResponseBody::NotExist { header } => {
                builder.not_exist_detail(&header.identity, &header.facet, &header.operation)?
            }
            ResponseBody::Message(message) => builder.message(&message)?,
        };
        Ok(builder.finish())
    }
}

// ============================================================================
// Tests
// ============================================================================
