// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Request and reply frame builders.
//!
//! Builders write the fixed message header with a zero size field, the
//! request ID slot, the request header (identity, facet, operation, mode,
//! context) and the parameter encapsulation; `finish` patches the size.
//! The request ID itself is assigned and patched by the connection at
//! send time ([`REQUEST_ID_OFFSET`]).

use crate::buffer::Buffer;
use crate::encoding::value::ValueGraph;
use crate::encoding::{ClassFormat, InputStream, MarshalError, MarshalResult, OutputStream};

use super::{MessageType, FRAME_SIZE_OFFSET, HEADER_SIZE};

/// Offset of the 4-byte request ID in a request or reply frame.
pub const REQUEST_ID_OFFSET: usize = HEADER_SIZE;

// ============================================================================
// Identity / operation mode / request header
// ============================================================================

/// Target object identity.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Identity {
    pub name: String,
    pub category: String,
}

impl Identity {
    pub fn new(name: &str, category: &str) -> Self {
        Self {
            name: name.to_string(),
            category: category.to_string(),
        }
    }

    pub fn encode(&self, ostr: &mut OutputStream<'_>) -> MarshalResult<()> {
        ostr.write_string(&self.name)?;
        ostr.write_string(&self.category)
    }

    pub fn decode(istr: &mut InputStream<'_>) -> MarshalResult<Identity> {
        Ok(Identity {
            name: istr.read_string()?,
            category: istr.read_string()?,
        })
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.category.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.category, self.name)
        }
    }
}

/// Invocation mode; idempotent operations widen retry eligibility.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OperationMode {
    #[default]
    Normal,
    Idempotent,
}

impl OperationMode {
    pub fn to_u8(self) -> u8 {
        match self {
            OperationMode::Normal => 0,
            OperationMode::Idempotent => 2,
        }
    }

    pub fn from_u8(v: u8) -> MarshalResult<OperationMode> {
        match v {
            0 => Ok(OperationMode::Normal),
            // 1 is the legacy "nonmutating" mode, folded into idempotent.
            1 | 2 => Ok(OperationMode::Idempotent),
            _ => Err(MarshalError::InvalidEnum { value: v as i64 }),
        }
    }
}

/// Decoded request header (everything between the request ID and the
/// parameter encapsulation).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RequestHeader {
    pub identity: Identity,
    /// At most one facet name; empty means the default facet.
    pub facet: String,
    pub operation: String,
    pub mode: OperationMode,
    pub context: Vec<(String, String)>,
}

impl RequestHeader {
    pub fn new(identity: Identity, operation: &str) -> Self {
        Self {
            identity,
            facet: String::new(),
            operation: operation.to_string(),
            mode: OperationMode::Normal,
            context: Vec::new(),
        }
    }

    pub fn encode(&self, ostr: &mut OutputStream<'_>) -> MarshalResult<()> {
        self.identity.encode(ostr)?;
        if self.facet.is_empty() {
            ostr.write_size(0)?;
        } else {
            ostr.write_size(1)?;
            ostr.write_string(&self.facet)?;
        }
        ostr.write_string(&self.operation)?;
        ostr.write_u8(self.mode.to_u8());
        ostr.write_dictionary(&self.context)
    }

    pub fn decode(istr: &mut InputStream<'_>) -> MarshalResult<RequestHeader> {
        let identity = Identity::decode(istr)?;
        let facet_count = istr.read_and_check_seq_size(1)?;
        let facet = match facet_count {
            0 => String::new(),
            1 => istr.read_string()?,
            _ => {
                return Err(MarshalError::InvalidSlice {
                    reason: "facet sequence longer than one element",
                })
            }
        };
        let operation = istr.read_string()?;
        let mode = OperationMode::from_u8(istr.read_u8()?)?;
        let context = istr.read_dictionary()?;
        Ok(RequestHeader {
            identity,
            facet,
            operation,
            mode,
            context,
        })
    }
}

// ============================================================================
// Request frame builder
// ============================================================================

/// Builds one outgoing request frame.
#[derive(Debug)]
pub struct RequestFrameBuilder<'g> {
    os: OutputStream<'g>,
}

impl<'g> RequestFrameBuilder<'g> {
    /// Start a request frame for plain (class-free) parameters.
    pub fn new(header: &RequestHeader) -> MarshalResult<Self> {
        Self::build(OutputStream::new(), header)
    }

    /// Start a request frame whose parameters marshal class graphs.
    pub fn with_graph(
        header: &RequestHeader,
        format: ClassFormat,
        graph: &'g ValueGraph,
    ) -> MarshalResult<Self> {
        let os = OutputStream::with_graph(crate::encoding::ENCODING_1_1, format, graph);
        Self::build(os, header)
    }

    fn build(mut os: OutputStream<'g>, header: &RequestHeader) -> MarshalResult<Self> {
        write_header_placeholder(&mut os, MessageType::Request);
        os.write_i32(0); // request ID, patched by the connection
        header.encode(&mut os)?;
        Ok(Self { os })
    }

    /// Write the parameter encapsulation.
    pub fn params<F>(mut self, f: F) -> MarshalResult<Self>
    where
        F: FnOnce(&mut OutputStream<'g>) -> MarshalResult<()>,
    {
        self.os.start_encapsulation()?;
        f(&mut self.os)?;
        self.os.end_encapsulation()?;
        Ok(self)
    }

    /// Write an empty parameter encapsulation.
    pub fn empty_params(mut self) -> Self {
        self.os.write_empty_encapsulation();
        self
    }

    /// Patch the frame size and hand the bytes over.
    pub fn finish(mut self) -> Buffer {
        let size = self.os.size() as i32;
        self.os.patch_i32(FRAME_SIZE_OFFSET, size);
        self.os.into_buffer()
    }
}

/// Builds one batch frame carrying N consecutive oneway request bodies.
#[derive(Debug)]
pub struct BatchRequestBuilder<'g> {
    os: OutputStream<'g>,
    count: i32,
}

impl<'g> BatchRequestBuilder<'g> {
    pub fn new() -> Self {
        let mut os = OutputStream::new();
        write_header_placeholder(&mut os, MessageType::RequestBatch);
        os.write_i32(0); // request count, patched in finish
        Self { os, count: 0 }
    }

    /// Number of requests queued so far.
    pub fn count(&self) -> i32 {
        self.count
    }

    /// Append one request body (header + parameter encapsulation).
    pub fn add_request<F>(&mut self, header: &RequestHeader, params: F) -> MarshalResult<()>
    where
        F: FnOnce(&mut OutputStream<'g>) -> MarshalResult<()>,
    {
        header.encode(&mut self.os)?;
        self.os.start_encapsulation()?;
        params(&mut self.os)?;
        self.os.end_encapsulation()?;
        self.count += 1;
        Ok(())
    }

    /// Patch the request count and frame size and hand the bytes over.
    pub fn finish(mut self) -> Buffer {
        self.os.patch_i32(HEADER_SIZE, self.count);
        let size = self.os.size() as i32;
        self.os.patch_i32(FRAME_SIZE_OFFSET, size);
        self.os.into_buffer()
    }
}

impl Default for BatchRequestBuilder<'_> {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Replies
// ============================================================================

/// Reply status byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplyStatus {
    /// Success; body is the result encapsulation.
    Ok = 0,
    /// Declared user exception; body is an exception encapsulation.
    UserException = 1,
    /// No object with the requested identity.
    ObjectNotExist = 2,
    /// Object exists but has no such facet.
    FacetNotExist = 3,
    /// Object exists but has no such operation.
    OperationNotExist = 4,
    /// Dispatch failed with a local runtime error.
    UnknownLocalException = 5,
    /// Dispatch failed with an undeclared user exception.
    UnknownUserException = 6,
    /// Dispatch failed with an unclassifiable error.
    UnknownException = 7,
}

impl ReplyStatus {
    pub fn from_u8(v: u8) -> Option<ReplyStatus> {
        match v {
            0 => Some(ReplyStatus::Ok),
            1 => Some(ReplyStatus::UserException),
            2 => Some(ReplyStatus::ObjectNotExist),
            3 => Some(ReplyStatus::FacetNotExist),
            4 => Some(ReplyStatus::OperationNotExist),
            5 => Some(ReplyStatus::UnknownLocalException),
            6 => Some(ReplyStatus::UnknownUserException),
            7 => Some(ReplyStatus::UnknownException),
            _ => None,
        }
    }

    /// Statuses whose body carries identity + facet + operation.
    pub fn is_not_exist(self) -> bool {
        matches!(
            self,
            ReplyStatus::ObjectNotExist
                | ReplyStatus::FacetNotExist
                | ReplyStatus::OperationNotExist
        )
    }

    /// Statuses whose body carries a plain message string.
    pub fn is_unknown(self) -> bool {
        matches!(
            self,
            ReplyStatus::UnknownLocalException
                | ReplyStatus::UnknownUserException
                | ReplyStatus::UnknownException
        )
    }
}

/// Builds one outgoing reply frame.
#[derive(Debug)]
pub struct ReplyFrameBuilder<'g> {
    os: OutputStream<'g>,
}

impl<'g> ReplyFrameBuilder<'g> {
    pub fn new(request_id: i32, status: ReplyStatus) -> Self {
        let mut os = OutputStream::new();
        write_header_placeholder(&mut os, MessageType::Reply);
        os.write_i32(request_id);
        os.write_u8(status as u8);
        Self { os }
    }

    pub fn with_graph(
        request_id: i32,
        status: ReplyStatus,
        format: ClassFormat,
        graph: &'g ValueGraph,
    ) -> Self {
        let mut os = OutputStream::with_graph(crate::encoding::ENCODING_1_1, format, graph);
        write_header_placeholder(&mut os, MessageType::Reply);
        os.write_i32(request_id);
        os.write_u8(status as u8);
        Self { os }
    }

    /// Write the result (or user exception) encapsulation.
    pub fn params<F>(mut self, f: F) -> MarshalResult<Self>
    where
        F: FnOnce(&mut OutputStream<'g>) -> MarshalResult<()>,
    {
        self.os.start_encapsulation()?;
        f(&mut self.os)?;
        self.os.end_encapsulation()?;
        Ok(self)
    }

    /// Write an empty result encapsulation.
    pub fn empty_params(mut self) -> Self {
        self.os.write_empty_encapsulation();
        self
    }

    /// Write the identity/facet/operation detail of a not-exist reply.
    pub fn not_exist_detail(
        mut self,
        identity: &Identity,
        facet: &str,
        operation: &str,
    ) -> MarshalResult<Self> {
        identity.encode(&mut self.os)?;
        if facet.is_empty() {
            self.os.write_size(0)?;
        } else {
            self.os.write_size(1)?;
            self.os.write_string(facet)?;
        }
        self.os.write_string(operation)?;
        Ok(self)
    }

    /// Write the message string of an unknown-exception reply.
    pub fn message(mut self, message: &str) -> MarshalResult<Self> {
        self.os.write_string(message)?;
        Ok(self)
    }

    /// Patch the frame size and hand the bytes over.
    pub fn finish(mut self) -> Buffer {
        let size = self.os.size() as i32;
        self.os.patch_i32(FRAME_SIZE_OFFSET, size);
        self.os.into_buffer()
    }
}

/// Split a complete reply frame into request ID, status and body bytes.
///
/// The header is assumed already validated by the connection's framing
/// layer; errors here are confined to the one pending invocation.
pub fn parse_reply(frame: &[u8]) -> MarshalResult<(i32, ReplyStatus, &[u8])> {
    if frame.len() < HEADER_SIZE + 5 {
        return Err(MarshalError::OutOfBounds {
            pos: frame.len(),
            needed: HEADER_SIZE + 5 - frame.len(),
        });
    }
    let request_id = i32::from_le_bytes([
        frame[REQUEST_ID_OFFSET],
        frame[REQUEST_ID_OFFSET + 1],
        frame[REQUEST_ID_OFFSET + 2],
        frame[REQUEST_ID_OFFSET + 3],
    ]);
    let status_byte = frame[HEADER_SIZE + 4];
    let status = ReplyStatus::from_u8(status_byte).ok_or(MarshalError::InvalidEnum {
        value: status_byte as i64,
    })?;
    Ok((request_id, status, &frame[HEADER_SIZE + 5..]))
}

fn write_header_placeholder(os: &mut OutputStream<'_>, msg_type: MessageType) {
    os.write_blob(&super::MAGIC);
    os.write_u8(super::PROTOCOL_1_0.major);
    os.write_u8(super::PROTOCOL_1_0.minor);
    os.write_u8(super::HEADER_ENCODING.0);
    os.write_u8(super::HEADER_ENCODING.1);
    os.write_u8(msg_type as u8);
    os.write_u8(super::CompressFlag::None as u8);
    os.write_i32(0); // size, patched in finish
}

// ============================================================================
// Tests
// ============================================================================
