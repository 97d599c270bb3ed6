// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Write side of the wire codec.
//!
//! [`OutputStream`] appends little-endian primitives, size-prefixed
//! sequences and strings, tagged members, and class/exception graphs to a
//! growable [`Buffer`]. Encapsulation sizes and slice headers are written
//! as placeholders and patched when the enclosing scope ends.
//!
//! Reference identity is preserved across the wire through a marshaled-
//! instance map keyed by [`ValueHandle`]: an instance mentioned twice is
//! encoded once and back-referenced afterwards. In the sliced format,
//! instances referenced from within a slice are deferred into that slice's
//! indirection table and emitted after the slice's fixed members.

use std::collections::HashMap;

use crate::buffer::Buffer;

use super::value::{SliceData, SliceTypeId, ValueGraph, ValueHandle};
use super::{
    ClassFormat, EncodingVersion, MarshalError, MarshalResult, TagFormat, ENCODING_1_1,
    FLAG_HAS_INDIRECTION_TABLE, FLAG_HAS_OPTIONAL_MEMBERS, FLAG_HAS_SLICE_SIZE,
    FLAG_HAS_TYPE_ID_COMPACT, FLAG_HAS_TYPE_ID_INDEX, FLAG_HAS_TYPE_ID_STRING, FLAG_IS_LAST_SLICE,
    TAGGED_END_MARKER,
};

// ============================================================================
// Encapsulation / slice write state
// ============================================================================

#[derive(Debug)]
struct MainEncaps {
    /// Offset of the 4-byte size field.
    start: usize,
    prev_encoding: EncodingVersion,
    /// Type-ID string -> 1-based wire index, scoped to this encapsulation.
    type_ids: HashMap<String, usize>,
    /// Instance handle -> wire back-reference index.
    marshaled: HashMap<ValueHandle, usize>,
    /// Instances marshaled so far (drives back-reference numbering).
    instance_count: usize,
}

#[derive(Debug)]
struct EndpointEncaps {
    start: usize,
    prev_encoding: EncodingVersion,
}

#[derive(Debug)]
struct SliceCtx {
    flags_pos: usize,
    size_pos: Option<usize>,
    flags: u8,
    /// Deferred instances cited by this slice (sliced format only).
    indirection: Vec<ValueHandle>,
    indirection_index: HashMap<ValueHandle, usize>,
}

// ============================================================================
// OutputStream
// ============================================================================

/// Write-side marshaling stream.
///
/// The optional graph reference resolves [`ValueHandle`] members written
/// via [`write_value`](Self::write_value); streams that never marshal
/// classes do not need one.
#[derive(Debug)]
pub struct OutputStream<'g> {
    buf: Buffer,
    encoding: EncodingVersion,
    default_encoding: EncodingVersion,
    format: ClassFormat,
    graph: Option<&'g ValueGraph>,
    main: Option<MainEncaps>,
    endpoint: Option<EndpointEncaps>,
    slices: Vec<SliceCtx>,
}

impl<'g> OutputStream<'g> {
    /// Create a stream with the current default encoding and compact format.
    pub fn new() -> Self {
        Self::with_encoding(ENCODING_1_1)
    }

    /// Create a stream with an explicit default encoding.
    pub fn with_encoding(encoding: EncodingVersion) -> Self {
        Self {
            buf: Buffer::new(),
            encoding,
            default_encoding: encoding,
            format: ClassFormat::default(),
            graph: None,
            main: None,
            endpoint: None,
            slices: Vec::new(),
        }
    }

    /// Create a stream able to marshal class graphs.
    pub fn with_graph(encoding: EncodingVersion, format: ClassFormat, graph: &'g ValueGraph) -> Self {
        let mut os = Self::with_encoding(encoding);
        os.format = format;
        os.graph = Some(graph);
        os
    }

    /// Set the class format for subsequently written instances.
    pub fn set_format(&mut self, format: ClassFormat) {
        self.format = format;
    }

    /// Current length of the encoded data.
    pub fn size(&self) -> usize {
        self.buf.len()
    }

    /// Current write position (same as [`size`](Self::size)).
    pub fn pos(&self) -> usize {
        self.buf.len()
    }

    /// Encoding in force for the innermost active encapsulation.
    pub fn encoding(&self) -> EncodingVersion {
        self.encoding
    }

    /// View of the encoded bytes.
    pub fn as_slice(&self) -> &[u8] {
        self.buf.as_slice()
    }

    /// Consume the stream, returning the backing buffer.
    pub fn into_buffer(self) -> Buffer {
        self.buf
    }

    /// Consume the stream, returning the encoded bytes.
    pub fn into_vec(self) -> Vec<u8> {
        self.buf.into_vec()
    }

    // ========================================================================
    // Primitives
    // ========================================================================

    pub fn write_u8(&mut self, v: u8) {
        self.buf.append(&[v]);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.write_u8(v as u8);
    }

    pub fn write_i16(&mut self, v: i16) {
        self.buf.append(&v.to_le_bytes());
    }

    pub fn write_i32(&mut self, v: i32) {
        self.buf.append(&v.to_le_bytes());
    }

    pub fn write_i64(&mut self, v: i64) {
        self.buf.append(&v.to_le_bytes());
    }

    pub fn write_f32(&mut self, v: f32) {
        self.buf.append(&v.to_le_bytes());
    }

    pub fn write_f64(&mut self, v: f64) {
        self.buf.append(&v.to_le_bytes());
    }

    /// Append raw bytes without a length prefix.
    pub fn write_blob(&mut self, bytes: &[u8]) {
        self.buf.append(bytes);
    }

    /// Overwrite a little-endian i32 at an absolute offset.
    pub fn patch_i32(&mut self, offset: usize, v: i32) {
        self.buf.patch_i32(offset, v);
    }

    /// Write a size: one byte below 255, otherwise `255` + i32.
    pub fn write_size(&mut self, size: usize) -> MarshalResult<()> {
        if size < 255 {
            self.write_u8(size as u8);
        } else if size <= i32::MAX as usize {
            self.write_u8(255);
            self.write_i32(size as i32);
        } else {
            return Err(MarshalError::InvalidSize { size: size as i64 });
        }
        Ok(())
    }

    /// Write a length-prefixed UTF-8 string.
    pub fn write_string(&mut self, s: &str) -> MarshalResult<()> {
        self.write_size(s.len())?;
        self.write_blob(s.as_bytes());
        Ok(())
    }

    pub fn write_string_seq(&mut self, seq: &[String]) -> MarshalResult<()> {
        self.write_size(seq.len())?;
        for s in seq {
            self.write_string(s)?;
        }
        Ok(())
    }

    /// Write a size-prefixed byte sequence.
    pub fn write_byte_seq(&mut self, bytes: &[u8]) -> MarshalResult<()> {
        self.write_size(bytes.len())?;
        self.write_blob(bytes);
        Ok(())
    }

    pub fn write_i32_seq(&mut self, seq: &[i32]) -> MarshalResult<()> {
        self.write_size(seq.len())?;
        for v in seq {
            self.write_i32(*v);
        }
        Ok(())
    }

    /// Write a string-to-string dictionary (context style).
    pub fn write_dictionary(&mut self, entries: &[(String, String)]) -> MarshalResult<()> {
        self.write_size(entries.len())?;
        for (k, v) in entries {
            self.write_string(k)?;
            self.write_string(v)?;
        }
        Ok(())
    }

    // ========================================================================
    // Tagged members
    // ========================================================================

    /// Write a tag byte for an optional member about to be written.
    ///
    /// Returns `Ok(false)` when the active encoding cannot carry tagged
    /// members (the member is simply not written, matching the legacy
    /// encoding's semantics).
    pub fn write_tag(&mut self, tag: i32, format: TagFormat) -> MarshalResult<bool> {
        if self.endpoint.is_some() {
            return Err(MarshalError::EncodingFeature {
                feature: "tagged members in an endpoint encapsulation",
            });
        }
        if self.encoding.is_1_0() {
            return Ok(false);
        }
        if let Some(ctx) = self.slices.last_mut() {
            ctx.flags |= FLAG_HAS_OPTIONAL_MEMBERS;
        }
        let v = format as u8;
        if tag < 30 {
            self.write_u8(v | ((tag as u8) << 3));
        } else {
            self.write_u8(v | 0xF0);
            self.write_size(tag as usize)?;
        }
        Ok(true)
    }

    pub fn write_tagged_i32(&mut self, tag: i32, v: Option<i32>) -> MarshalResult<()> {
        if let Some(v) = v {
            if self.write_tag(tag, TagFormat::F4)? {
                self.write_i32(v);
            }
        }
        Ok(())
    }

    pub fn write_tagged_string(&mut self, tag: i32, v: Option<&str>) -> MarshalResult<()> {
        if let Some(s) = v {
            if self.write_tag(tag, TagFormat::VSize)? {
                self.write_string(s)?;
            }
        }
        Ok(())
    }

    /// Terminate a run of tagged members inside a slice-less scope.
    pub fn write_tagged_end_marker(&mut self) {
        self.write_u8(TAGGED_END_MARKER);
    }

    // ========================================================================
    // Encapsulations
    // ========================================================================

    /// Begin the main encapsulation (tagged members, classes, exceptions).
    pub fn start_encapsulation(&mut self) -> MarshalResult<()> {
        self.start_encapsulation_with(self.default_encoding, self.format)
    }

    /// Begin the main encapsulation with an explicit encoding and format.
    pub fn start_encapsulation_with(
        &mut self,
        encoding: EncodingVersion,
        format: ClassFormat,
    ) -> MarshalResult<()> {
        if self.main.is_some() {
            return Err(MarshalError::InvalidSlice {
                reason: "main encapsulation already active",
            });
        }
        let start = self.buf.len();
        self.write_i32(0); // size placeholder
        self.write_u8(encoding.major);
        self.write_u8(encoding.minor);
        self.main = Some(MainEncaps {
            start,
            prev_encoding: self.encoding,
            type_ids: HashMap::new(),
            marshaled: HashMap::new(),
            instance_count: 0,
        });
        self.encoding = encoding;
        self.format = format;
        Ok(())
    }

    /// End the main encapsulation, patching its size.
    pub fn end_encapsulation(&mut self) -> MarshalResult<()> {
        let encaps = self.main.take().ok_or(MarshalError::NoMainEncapsulation)?;
        debug_assert!(self.slices.is_empty());
        let size = (self.buf.len() - encaps.start) as i32;
        self.buf.patch_i32(encaps.start, size);
        self.encoding = encaps.prev_encoding;
        Ok(())
    }

    /// Begin a lightweight endpoint encapsulation (primitives only).
    pub fn start_endpoint_encapsulation(&mut self) -> MarshalResult<()> {
        if self.endpoint.is_some() {
            return Err(MarshalError::InvalidSlice {
                reason: "endpoint encapsulation already active",
            });
        }
        let start = self.buf.len();
        self.write_i32(0);
        self.write_u8(self.default_encoding.major);
        self.write_u8(self.default_encoding.minor);
        self.endpoint = Some(EndpointEncaps {
            start,
            prev_encoding: self.encoding,
        });
        self.encoding = self.default_encoding;
        Ok(())
    }

    pub fn end_endpoint_encapsulation(&mut self) -> MarshalResult<()> {
        let encaps = self.endpoint.take().ok_or(MarshalError::InvalidSlice {
            reason: "no endpoint encapsulation active",
        })?;
        let size = (self.buf.len() - encaps.start) as i32;
        self.buf.patch_i32(encaps.start, size);
        self.encoding = encaps.prev_encoding;
        Ok(())
    }

    /// Write an empty encapsulation (size header + version, no payload).
    pub fn write_empty_encapsulation(&mut self) {
        self.write_i32(6);
        self.write_u8(self.default_encoding.major);
        self.write_u8(self.default_encoding.minor);
    }

    /// Copy a pre-encoded encapsulation verbatim (header included).
    ///
    /// Used when forwarding a payload unchanged into a new outer frame.
    pub fn write_encapsulation(&mut self, encaps: &[u8]) -> MarshalResult<()> {
        if encaps.len() < 6 {
            return Err(MarshalError::InvalidEncapsulation {
                size: encaps.len() as i64,
            });
        }
        self.write_blob(encaps);
        Ok(())
    }

    // ========================================================================
    // Classes and exceptions
    // ========================================================================

    fn require_class_context(&self) -> MarshalResult<()> {
        if self.endpoint.is_some() {
            return Err(MarshalError::EncodingFeature {
                feature: "classes in an endpoint encapsulation",
            });
        }
        if self.main.is_none() {
            return Err(MarshalError::NoMainEncapsulation);
        }
        if self.encoding.is_1_0() {
            return Err(MarshalError::EncodingFeature {
                feature: "class graphs in the 1.0 encoding",
            });
        }
        Ok(())
    }

    /// Write a class instance reference (or null).
    ///
    /// In the sliced format, a reference written from inside a slice is
    /// deferred into that slice's indirection table.
    pub fn write_value(&mut self, handle: Option<ValueHandle>) -> MarshalResult<()> {
        self.require_class_context()?;
        let handle = match handle {
            None => return self.write_size(0),
            Some(h) => h,
        };
        let graph = self.graph.ok_or(MarshalError::InvalidSlice {
            reason: "stream has no value graph",
        })?;
        if !graph.contains(handle) {
            return Err(MarshalError::InvalidInstanceIndex {
                index: handle.index() as i64,
            });
        }

        if self.format == ClassFormat::Sliced && !self.slices.is_empty() {
            // Defer into the current slice's indirection table; the wire
            // carries the 1-based table position.
            let table_index = {
                let ctx = self.slices.last_mut().ok_or(MarshalError::InvalidSlice {
                    reason: "no active slice",
                })?;
                match ctx.indirection_index.get(&handle) {
                    Some(&idx) => idx,
                    None => {
                        ctx.indirection.push(handle);
                        let idx = ctx.indirection.len();
                        ctx.indirection_index.insert(handle, idx);
                        idx
                    }
                }
            };
            return self.write_size(table_index);
        }

        self.write_instance(handle)
    }

    /// Write a tagged class reference.
    pub fn write_tagged_value(&mut self, tag: i32, v: Option<ValueHandle>) -> MarshalResult<()> {
        if v.is_some() && self.write_tag(tag, TagFormat::Class)? {
            self.write_value(v)?;
        }
        Ok(())
    }

    /// Marshal an instance inline or as a back-reference.
    fn write_instance(&mut self, handle: ValueHandle) -> MarshalResult<()> {
        {
            let main = self.main.as_mut().ok_or(MarshalError::NoMainEncapsulation)?;
            if let Some(&idx) = main.marshaled.get(&handle) {
                return self.write_size(idx);
            }
            // Register before marshaling members so cycles back-reference us.
            main.instance_count += 1;
            let wire_index = main.instance_count + 1;
            main.marshaled.insert(handle, wire_index);
        }
        self.write_size(1)?;

        let graph = self.graph.ok_or(MarshalError::InvalidSlice {
            reason: "stream has no value graph",
        })?;
        let instance = graph.instance(handle);
        let preserved = instance.sliced.as_ref();
        let value = instance.value.as_deref();

        if value.is_none() && preserved.is_none() {
            return Err(MarshalError::InvalidSlice {
                reason: "instance has neither value nor preserved slices",
            });
        }

        if let Some(sliced) = preserved {
            let n = sliced.slices.len();
            for (i, slice) in sliced.slices.iter().enumerate() {
                let force_last = value.is_none() && i + 1 == n;
                self.write_preserved_slice(slice, force_last)?;
            }
        }
        if let Some(v) = value {
            v.marshal(self)?;
        }
        Ok(())
    }

    /// Re-emit a preserved (opaque) slice, rebuilding its indirection table.
    fn write_preserved_slice(&mut self, slice: &SliceData, force_last: bool) -> MarshalResult<()> {
        let mut flags = FLAG_HAS_SLICE_SIZE;
        if slice.has_tagged_members {
            flags |= FLAG_HAS_OPTIONAL_MEMBERS;
        }
        if !slice.instances.is_empty() {
            flags |= FLAG_HAS_INDIRECTION_TABLE;
        }
        if force_last || slice.is_last {
            flags |= FLAG_IS_LAST_SLICE;
        }

        match &slice.type_id {
            SliceTypeId::Compact(id) => {
                flags |= FLAG_HAS_TYPE_ID_COMPACT;
                self.write_u8(flags);
                self.write_size(*id as usize)?;
            }
            SliceTypeId::Str(type_id) => {
                let indexed = self
                    .main
                    .as_ref()
                    .and_then(|m| m.type_ids.get(type_id).copied());
                match indexed {
                    Some(idx) => {
                        flags |= FLAG_HAS_TYPE_ID_INDEX;
                        self.write_u8(flags);
                        self.write_size(idx)?;
                    }
                    None => {
                        flags |= FLAG_HAS_TYPE_ID_STRING;
                        self.write_u8(flags);
                        if let Some(main) = self.main.as_mut() {
                            let idx = main.type_ids.len() + 1;
                            main.type_ids.insert(type_id.clone(), idx);
                        }
                        self.write_string(type_id)?;
                    }
                }
            }
        }

        self.write_i32(slice.bytes.len() as i32 + 4);
        self.write_blob(&slice.bytes);

        if !slice.instances.is_empty() {
            self.write_size(slice.instances.len())?;
            for &h in &slice.instances {
                self.write_instance(h)?;
            }
        }
        Ok(())
    }

    /// Begin one slice of an instance or exception.
    ///
    /// `last` marks the least-derived slice.
    pub fn start_slice(
        &mut self,
        type_id: &str,
        compact_id: Option<i32>,
        last: bool,
    ) -> MarshalResult<()> {
        self.require_class_context()?;
        let flags_pos = self.buf.len();
        self.write_u8(0); // flags placeholder
        let mut flags = 0u8;
        if last {
            flags |= FLAG_IS_LAST_SLICE;
        }

        match compact_id {
            Some(id) => {
                flags |= FLAG_HAS_TYPE_ID_COMPACT;
                self.write_size(id as usize)?;
            }
            None => {
                let indexed = self
                    .main
                    .as_ref()
                    .and_then(|m| m.type_ids.get(type_id).copied());
                match indexed {
                    Some(idx) => {
                        flags |= FLAG_HAS_TYPE_ID_INDEX;
                        self.write_size(idx)?;
                    }
                    None => {
                        flags |= FLAG_HAS_TYPE_ID_STRING;
                        if let Some(main) = self.main.as_mut() {
                            let idx = main.type_ids.len() + 1;
                            main.type_ids.insert(type_id.to_string(), idx);
                        }
                        self.write_string(type_id)?;
                    }
                }
            }
        }

        let size_pos = if self.format == ClassFormat::Sliced {
            flags |= FLAG_HAS_SLICE_SIZE;
            let p = self.buf.len();
            self.write_i32(0);
            Some(p)
        } else {
            None
        };

        self.slices.push(SliceCtx {
            flags_pos,
            size_pos,
            flags,
            indirection: Vec::new(),
            indirection_index: HashMap::new(),
        });
        Ok(())
    }

    /// End the current slice: terminate tagged members, patch the slice
    /// size, emit the indirection table, and patch the flags byte.
    pub fn end_slice(&mut self) -> MarshalResult<()> {
        let mut ctx = self.slices.pop().ok_or(MarshalError::InvalidSlice {
            reason: "end_slice without start_slice",
        })?;

        if ctx.flags & FLAG_HAS_OPTIONAL_MEMBERS != 0 {
            self.write_u8(TAGGED_END_MARKER);
        }
        if let Some(size_pos) = ctx.size_pos {
            let size = (self.buf.len() - size_pos) as i32;
            self.buf.patch_i32(size_pos, size);
        }
        if !ctx.indirection.is_empty() {
            ctx.flags |= FLAG_HAS_INDIRECTION_TABLE;
            let table = std::mem::take(&mut ctx.indirection);
            // The table's own instances may nest new slices; keep the flags
            // patch for after they are written.
            self.write_size(table.len())?;
            for h in table {
                self.write_instance(h)?;
            }
        }
        self.buf.patch(ctx.flags_pos, &[ctx.flags]);
        Ok(())
    }

    /// Write a user exception as its chain of slices.
    pub fn write_exception(&mut self, ex: &dyn super::value::UserException) -> MarshalResult<()> {
        self.require_class_context()?;
        ex.marshal(self)
    }
}

impl Default for OutputStream<'_> {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================
