// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Read side of the wire codec.
//!
//! [`InputStream`] decodes little-endian primitives, size-prefixed
//! sequences and strings, tagged members, and class/exception graphs from
//! a borrowed byte slice. Every read is bounds-checked against the current
//! encapsulation limit; a declared sequence is sanity-checked against the
//! bytes actually available before anything is allocated.
//!
//! Class instances decode into the stream's [`ValueGraph`]. Unknown type
//! IDs are sliced off: their raw bytes and indirection-table contents are
//! preserved so the instance can be forwarded without data loss.

use crate::buffer::Buffer;

use super::value::{
    SliceData, SliceTypeId, SlicedData, UserException, ValueFactoryRegistry, ValueGraph,
    ValueHandle,
};
use super::{
    EncodingVersion, MarshalError, MarshalResult, TagFormat, ENCODING_1_1,
    FLAG_HAS_INDIRECTION_TABLE, FLAG_HAS_OPTIONAL_MEMBERS, FLAG_HAS_SLICE_SIZE,
    FLAG_HAS_TYPE_ID_COMPACT, FLAG_HAS_TYPE_ID_INDEX, FLAG_HAS_TYPE_ID_STRING, FLAG_IS_LAST_SLICE,
    TAGGED_END_MARKER,
};

/// Default cap on class-graph nesting depth.
pub const DEFAULT_MAX_GRAPH_DEPTH: usize = 100;

// ============================================================================
// Decode state
// ============================================================================

#[derive(Debug)]
struct MainEncaps {
    end: usize,
    prev_encoding: EncodingVersion,
    prev_limit: usize,
    type_ids: Vec<String>,
    /// Read-side instance table: wire back-reference `n` resolves to
    /// `instances[n - 2]`.
    instances: Vec<ValueHandle>,
    /// One context per instance or exception currently being decoded.
    stack: Vec<InstanceCtx>,
}

#[derive(Debug)]
struct EndpointEncaps {
    end: usize,
    prev_encoding: EncodingVersion,
    prev_limit: usize,
}

#[derive(Debug, Default)]
struct InstanceCtx {
    /// The next `start_slice` call finds its header already consumed
    /// (the stream read it to probe for a factory).
    skip_first: bool,
    slice: Option<SliceInfo>,
}

#[derive(Debug, Clone)]
struct SliceInfo {
    flags: u8,
    type_id: SliceTypeId,
    /// End of the slice's member data, when the slice carries a size.
    data_end: Option<usize>,
    /// Position just past the indirection table, when one was pre-read.
    resume_pos: Option<usize>,
    /// Pre-read indirection table.
    indirection: Vec<ValueHandle>,
}

// ============================================================================
// InputStream
// ============================================================================

/// Read-side marshaling stream over a borrowed byte slice.
pub struct InputStream<'a> {
    buf: &'a [u8],
    pos: usize,
    limit: usize,
    encoding: EncodingVersion,
    default_encoding: EncodingVersion,
    main: Option<MainEncaps>,
    endpoint: Option<EndpointEncaps>,
    /// Running total of declared minimum sequence bytes; may never exceed
    /// the buffer length (hostile-size defense).
    min_total_seq_size: usize,
    factories: Option<&'a ValueFactoryRegistry>,
    graph: ValueGraph,
    max_depth: usize,
    depth: usize,
}

impl<'a> InputStream<'a> {
    /// Create a stream over `buf` with the current default encoding.
    pub fn new(buf: &'a [u8]) -> Self {
        Self::with_encoding(buf, ENCODING_1_1)
    }

    /// Create a stream with an explicit default encoding.
    pub fn with_encoding(buf: &'a [u8], encoding: EncodingVersion) -> Self {
        Self {
            buf,
            pos: 0,
            limit: buf.len(),
            encoding,
            default_encoding: encoding,
            main: None,
            endpoint: None,
            min_total_seq_size: 0,
            factories: None,
            graph: ValueGraph::new(),
            max_depth: DEFAULT_MAX_GRAPH_DEPTH,
            depth: 0,
        }
    }

    /// Create a stream over a [`Buffer`]'s contents.
    pub fn from_buffer(buf: &'a Buffer) -> Self {
        Self::new(buf.as_slice())
    }

    /// Attach the factory registry used to instantiate decoded classes.
    pub fn set_factories(&mut self, factories: &'a ValueFactoryRegistry) {
        self.factories = Some(factories);
    }

    /// Override the class-graph depth cap.
    pub fn set_max_depth(&mut self, max_depth: usize) {
        self.max_depth = max_depth;
    }

    /// Current cursor position.
    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Bytes left before the current encapsulation (or buffer) boundary.
    pub fn remaining(&self) -> usize {
        self.limit - self.pos
    }

    /// Encoding in force for the innermost active encapsulation.
    pub fn encoding(&self) -> EncodingVersion {
        self.encoding
    }

    /// Borrow the decoded instance graph.
    pub fn graph(&self) -> &ValueGraph {
        &self.graph
    }

    /// Mutably borrow the decoded instance graph.
    pub fn graph_mut(&mut self) -> &mut ValueGraph {
        &mut self.graph
    }

    /// Consume the stream, returning the decoded instance graph.
    pub fn into_graph(self) -> ValueGraph {
        self.graph
    }

    fn check(&self, n: usize) -> MarshalResult<()> {
        if self.pos + n > self.limit {
            return Err(MarshalError::OutOfBounds {
                pos: self.pos,
                needed: self.pos + n - self.limit,
            });
        }
        Ok(())
    }

    // ========================================================================
    // Primitives
    // ========================================================================

    pub fn read_u8(&mut self) -> MarshalResult<u8> {
        self.check(1)?;
        let v = self.buf[self.pos];
        self.pos += 1;
        Ok(v)
    }

    pub fn read_bool(&mut self) -> MarshalResult<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_i16(&mut self) -> MarshalResult<i16> {
        self.check(2)?;
        let mut b = [0u8; 2];
        b.copy_from_slice(&self.buf[self.pos..self.pos + 2]);
        self.pos += 2;
        Ok(i16::from_le_bytes(b))
    }

    pub fn read_i32(&mut self) -> MarshalResult<i32> {
        self.check(4)?;
        let mut b = [0u8; 4];
        b.copy_from_slice(&self.buf[self.pos..self.pos + 4]);
        self.pos += 4;
        Ok(i32::from_le_bytes(b))
    }

    pub fn read_i64(&mut self) -> MarshalResult<i64> {
        self.check(8)?;
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.buf[self.pos..self.pos + 8]);
        self.pos += 8;
        Ok(i64::from_le_bytes(b))
    }

    pub fn read_f32(&mut self) -> MarshalResult<f32> {
        Ok(f32::from_bits(self.read_i32()? as u32))
    }

    pub fn read_f64(&mut self) -> MarshalResult<f64> {
        Ok(f64::from_bits(self.read_i64()? as u64))
    }

    /// Read `n` raw bytes without a length prefix.
    pub fn read_blob(&mut self, n: usize) -> MarshalResult<&'a [u8]> {
        self.check(n)?;
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Advance the cursor by `n` bytes.
    pub fn skip(&mut self, n: usize) -> MarshalResult<()> {
        self.check(n)?;
        self.pos += n;
        Ok(())
    }

    /// Read a size: one byte below 255, otherwise `255` + i32.
    pub fn read_size(&mut self) -> MarshalResult<usize> {
        let b = self.read_u8()?;
        if b < 255 {
            return Ok(b as usize);
        }
        let v = self.read_i32()?;
        if v < 0 {
            return Err(MarshalError::InvalidSize { size: v as i64 });
        }
        Ok(v as usize)
    }

    /// Skip over a size field.
    pub fn skip_size(&mut self) -> MarshalResult<()> {
        if self.read_u8()? == 255 {
            self.skip(4)?;
        }
        Ok(())
    }

    /// Read a sequence size and verify the declared element count can
    /// possibly fit in the remaining bytes.
    ///
    /// The per-stream running total bounds the sum of all declared
    /// sequences, so nested hostile sizes cannot multiply past the buffer.
    pub fn read_and_check_seq_size(&mut self, min_element_size: usize) -> MarshalResult<usize> {
        let sz = self.read_size()?;
        if sz == 0 {
            return Ok(0);
        }
        self.min_total_seq_size = self
            .min_total_seq_size
            .saturating_add(sz.saturating_mul(min_element_size));
        if self.min_total_seq_size > self.buf.len() {
            return Err(MarshalError::SequenceSanity {
                declared: sz,
                min_element_size,
                available: self.limit - self.pos,
            });
        }
        Ok(sz)
    }

    /// Read a length-prefixed, strictly validated UTF-8 string.
    pub fn read_string(&mut self) -> MarshalResult<String> {
        let len = self.read_and_check_seq_size(1)?;
        let start = self.pos;
        let bytes = self.read_blob(len)?;
        match std::str::from_utf8(bytes) {
            Ok(s) => Ok(s.to_string()),
            Err(_) => Err(MarshalError::InvalidUtf8 { pos: start }),
        }
    }

    pub fn read_string_seq(&mut self) -> MarshalResult<Vec<String>> {
        let n = self.read_and_check_seq_size(1)?;
        let mut seq = Vec::with_capacity(n);
        for _ in 0..n {
            seq.push(self.read_string()?);
        }
        Ok(seq)
    }

    /// Read a size-prefixed byte sequence.
    pub fn read_byte_seq(&mut self) -> MarshalResult<&'a [u8]> {
        let n = self.read_and_check_seq_size(1)?;
        self.read_blob(n)
    }

    pub fn read_i32_seq(&mut self) -> MarshalResult<Vec<i32>> {
        let n = self.read_and_check_seq_size(4)?;
        let mut seq = Vec::with_capacity(n);
        for _ in 0..n {
            seq.push(self.read_i32()?);
        }
        Ok(seq)
    }

    /// Read a string-to-string dictionary (context style).
    pub fn read_dictionary(&mut self) -> MarshalResult<Vec<(String, String)>> {
        let n = self.read_and_check_seq_size(2)?;
        let mut entries = Vec::with_capacity(n);
        for _ in 0..n {
            let k = self.read_string()?;
            let v = self.read_string()?;
            entries.push((k, v));
        }
        Ok(entries)
    }

    // ========================================================================
    // Encapsulations
    // ========================================================================

    fn read_encaps_header(&mut self) -> MarshalResult<(EncodingVersion, usize)> {
        let start = self.pos;
        let sz = self.read_i32()?;
        if sz < 6 {
            return Err(MarshalError::InvalidEncapsulation { size: sz as i64 });
        }
        let end = start + sz as usize;
        if end > self.limit {
            return Err(MarshalError::OutOfBounds {
                pos: start,
                needed: end - self.limit,
            });
        }
        let major = self.read_u8()?;
        let minor = self.read_u8()?;
        let version = EncodingVersion { major, minor };
        if !version.is_supported() {
            return Err(MarshalError::UnsupportedEncoding(version));
        }
        Ok((version, end))
    }

    /// Begin decoding the main encapsulation.
    pub fn start_encapsulation(&mut self) -> MarshalResult<EncodingVersion> {
        if self.main.is_some() {
            return Err(MarshalError::InvalidSlice {
                reason: "main encapsulation already active",
            });
        }
        let (version, end) = self.read_encaps_header()?;
        self.main = Some(MainEncaps {
            end,
            prev_encoding: self.encoding,
            prev_limit: self.limit,
            type_ids: Vec::new(),
            instances: Vec::new(),
            stack: Vec::new(),
        });
        self.limit = end;
        self.encoding = version;
        Ok(version)
    }

    /// End the main encapsulation, asserting the exact boundary.
    ///
    /// Unread trailing tagged members are skipped first (a newer sender may
    /// have appended members this reader does not know).
    pub fn end_encapsulation(&mut self) -> MarshalResult<()> {
        let end = self
            .main
            .as_ref()
            .ok_or(MarshalError::NoMainEncapsulation)?
            .end;
        if self.pos < end && !self.encoding.is_1_0() {
            // Tagged members are skippable; class-typed ones still need the
            // encapsulation state, so it is cleared only afterwards.
            self.skip_tagged_run(end)?;
        }
        let encaps = self.main.take().ok_or(MarshalError::NoMainEncapsulation)?;
        if self.pos != encaps.end {
            return Err(MarshalError::EncapsulationBoundary {
                expected: encaps.end,
                actual: self.pos,
            });
        }
        self.limit = encaps.prev_limit;
        self.encoding = encaps.prev_encoding;
        Ok(())
    }

    /// Read a whole encapsulation as raw bytes (header included), without
    /// decoding its contents. Used for forwarding payloads unchanged.
    pub fn read_encapsulation(&mut self) -> MarshalResult<&'a [u8]> {
        let start = self.pos;
        let (_, end) = self.read_encaps_header()?;
        self.pos = end;
        Ok(&self.buf[start..end])
    }

    /// Begin a lightweight endpoint encapsulation (primitives only).
    pub fn start_endpoint_encapsulation(&mut self) -> MarshalResult<EncodingVersion> {
        if self.endpoint.is_some() {
            return Err(MarshalError::InvalidSlice {
                reason: "endpoint encapsulation already active",
            });
        }
        let (version, end) = self.read_encaps_header()?;
        self.endpoint = Some(EndpointEncaps {
            end,
            prev_encoding: self.encoding,
            prev_limit: self.limit,
        });
        self.limit = end;
        self.encoding = version;
        Ok(version)
    }

    pub fn end_endpoint_encapsulation(&mut self) -> MarshalResult<()> {
        let encaps = self.endpoint.take().ok_or(MarshalError::InvalidSlice {
            reason: "no endpoint encapsulation active",
        })?;
        if self.pos != encaps.end {
            return Err(MarshalError::EncapsulationBoundary {
                expected: encaps.end,
                actual: self.pos,
            });
        }
        self.limit = encaps.prev_limit;
        self.encoding = encaps.prev_encoding;
        Ok(())
    }

    // ========================================================================
    // Tagged members
    // ========================================================================

    /// Probe for a tagged member.
    ///
    /// Returns `Ok(true)` with the cursor on the member data when `tag` is
    /// present with `expected` format. A member with a higher tag rewinds
    /// the cursor (absent); lower tags are skipped by their format width.
    pub fn read_tag(&mut self, tag: i32, expected: TagFormat) -> MarshalResult<bool> {
        if self.endpoint.is_some() {
            return Err(MarshalError::EncodingFeature {
                feature: "tagged members in an endpoint encapsulation",
            });
        }
        if self.encoding.is_1_0() {
            return Ok(false);
        }
        // Inside a slice, members exist only if the slice says so.
        if let Some(flags) = self.current_slice_flags() {
            if flags & FLAG_HAS_OPTIONAL_MEMBERS == 0 {
                return Ok(false);
            }
        }

        loop {
            if self.pos >= self.limit {
                return Ok(false);
            }
            let save = self.pos;
            let v = self.read_u8()?;
            if v == TAGGED_END_MARKER {
                self.pos = save;
                return Ok(false);
            }
            let format = TagFormat::from_u8(v);
            let mut t = (v >> 3) as i32;
            if t == 30 {
                t = self.read_size()? as i32;
            }
            if t > tag {
                self.pos = save;
                return Ok(false);
            }
            if t < tag {
                self.skip_tagged(format)?;
                continue;
            }
            if format != expected {
                return Err(MarshalError::TagFormatMismatch {
                    tag,
                    expected,
                    actual: format,
                });
            }
            return Ok(true);
        }
    }

    pub fn read_tagged_i32(&mut self, tag: i32) -> MarshalResult<Option<i32>> {
        if self.read_tag(tag, TagFormat::F4)? {
            Ok(Some(self.read_i32()?))
        } else {
            Ok(None)
        }
    }

    pub fn read_tagged_string(&mut self, tag: i32) -> MarshalResult<Option<String>> {
        if self.read_tag(tag, TagFormat::VSize)? {
            Ok(Some(self.read_string()?))
        } else {
            Ok(None)
        }
    }

    /// Skip one tagged member's data by its format.
    fn skip_tagged(&mut self, format: TagFormat) -> MarshalResult<()> {
        match format {
            TagFormat::F1 => self.skip(1),
            TagFormat::F2 => self.skip(2),
            TagFormat::F4 => self.skip(4),
            TagFormat::F8 => self.skip(8),
            TagFormat::Size => self.skip_size(),
            TagFormat::VSize => {
                let n = self.read_size()?;
                self.skip(n)
            }
            TagFormat::FSize => {
                let n = self.read_i32()?;
                if n < 0 {
                    return Err(MarshalError::InvalidSize { size: n as i64 });
                }
                self.skip(n as usize)
            }
            TagFormat::Class => {
                self.read_value()?;
                Ok(())
            }
        }
    }

    /// Skip tagged members up to the end marker or `end`.
    fn skip_tagged_run(&mut self, end: usize) -> MarshalResult<()> {
        while self.pos < end {
            let v = self.read_u8()?;
            if v == TAGGED_END_MARKER {
                return Ok(());
            }
            let format = TagFormat::from_u8(v);
            if (v >> 3) == 30 {
                self.skip_size()?;
            }
            self.skip_tagged(format)?;
        }
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

    fn current_slice_flags(&self) -> Option<u8> {
        self.main
            .as_ref()
            .and_then(|m| m.stack.last())
            .and_then(|ctx| ctx.slice.as_ref())
            .map(|s| s.flags)
    }

    /// Read a class instance reference (or null).
    pub fn read_value(&mut self) -> MarshalResult<Option<ValueHandle>> {
        self.require_class_context()?;

        // Inside a slice that carries an indirection table, member
        // references are 1-based positions into that table.
        let table_ref = self
            .current_slice_flags()
            .map(|f| f & FLAG_HAS_INDIRECTION_TABLE != 0)
            .unwrap_or(false);
        if table_ref {
            let idx = self.read_size()?;
            if idx == 0 {
                return Ok(None);
            }
            let main = self.main.as_ref().ok_or(MarshalError::NoMainEncapsulation)?;
            let table = main
                .stack
                .last()
                .and_then(|ctx| ctx.slice.as_ref())
                .map(|s| &s.indirection)
                .ok_or(MarshalError::InvalidSlice {
                    reason: "no active slice",
                })?;
            return table
                .get(idx - 1)
                .copied()
                .map(Some)
                .ok_or(MarshalError::InvalidIndirection { index: idx as i64 });
        }

        self.read_instance_ref()
    }

    /// Read a tagged class reference.
    pub fn read_tagged_value(&mut self) -> MarshalResult<Option<ValueHandle>> {
        // Tag scanning happens in the caller via read_tag; this is the
        // member-data read.
        self.read_value()
    }

    fn read_instance_ref(&mut self) -> MarshalResult<Option<ValueHandle>> {
        let idx = self.read_size()?;
        if idx == 0 {
            return Ok(None);
        }
        if idx == 1 {
            return self.read_instance_inline().map(Some);
        }
        let main = self.main.as_ref().ok_or(MarshalError::NoMainEncapsulation)?;
        main.instances
            .get(idx - 2)
            .copied()
            .map(Some)
            .ok_or(MarshalError::InvalidInstanceIndex { index: idx as i64 })
    }

    /// Decode an instance marshaled inline at the cursor.
    fn read_instance_inline(&mut self) -> MarshalResult<ValueHandle> {
        if self.depth >= self.max_depth {
            return Err(MarshalError::DepthExceeded {
                max: self.max_depth,
            });
        }
        self.depth += 1;

        // Reserve the arena slot and publish it in the instance table
        // before members decode, so cycles back-reference correctly.
        let handle = self.graph.reserve();
        {
            let main = self.main.as_mut().ok_or(MarshalError::NoMainEncapsulation)?;
            main.instances.push(handle);
            main.stack.push(InstanceCtx::default());
        }

        let result = self.read_instance_slices(handle);

        if let Some(main) = self.main.as_mut() {
            main.stack.pop();
        }
        self.depth -= 1;
        result.map(|_| handle)
    }

    fn read_instance_slices(&mut self, handle: ValueHandle) -> MarshalResult<()> {
        let mut preserved: Vec<SliceData> = Vec::new();
        self.read_slice_header()?;

        loop {
            let type_id = self
                .current_slice_type_id()
                .ok_or(MarshalError::InvalidSlice {
                    reason: "slice has no type ID",
                })?;

            let factory = self.factories.and_then(|reg| match &type_id {
                SliceTypeId::Str(s) => reg.find_value(s),
                SliceTypeId::Compact(id) => reg.find_compact_value(*id),
            });

            if let Some(factory) = factory {
                if let Some(ctx) = self.main.as_mut().and_then(|m| m.stack.last_mut()) {
                    ctx.skip_first = true;
                }
                let mut value = factory();
                value.unmarshal(self)?;
                if !preserved.is_empty() {
                    self.graph.set_sliced(handle, SlicedData { slices: preserved });
                }
                self.graph.set_value(handle, value);
                return Ok(());
            }

            log::trace!("no factory for type ID '{}', slicing", type_id);
            let slice = self.skip_slice()?;
            let last = slice.is_last;
            preserved.push(slice);
            if last {
                self.graph.set_sliced(handle, SlicedData { slices: preserved });
                return Ok(());
            }
            self.read_slice_header()?;
        }
    }

    fn current_slice_type_id(&self) -> Option<SliceTypeId> {
        self.main
            .as_ref()
            .and_then(|m| m.stack.last())
            .and_then(|ctx| ctx.slice.as_ref())
            .map(|s| s.type_id.clone())
    }

    /// Read one slice header into the current instance context, pre-reading
    /// the indirection table when the slice carries one.
    fn read_slice_header(&mut self) -> MarshalResult<()> {
        let flags = self.read_u8()?;

        let type_id = match flags & FLAG_HAS_TYPE_ID_COMPACT {
            FLAG_HAS_TYPE_ID_COMPACT => SliceTypeId::Compact(self.read_size()? as i32),
            FLAG_HAS_TYPE_ID_INDEX => {
                let idx = self.read_size()?;
                let main = self.main.as_ref().ok_or(MarshalError::NoMainEncapsulation)?;
                let s = main
                    .type_ids
                    .get(idx.wrapping_sub(1))
                    .cloned()
                    .ok_or(MarshalError::InvalidTypeIdIndex { index: idx as i64 })?;
                SliceTypeId::Str(s)
            }
            FLAG_HAS_TYPE_ID_STRING => {
                let s = self.read_string()?;
                if let Some(main) = self.main.as_mut() {
                    main.type_ids.push(s.clone());
                }
                SliceTypeId::Str(s)
            }
            _ => {
                return Err(MarshalError::InvalidSlice {
                    reason: "slice header has no type ID",
                })
            }
        };

        let data_end = if flags & FLAG_HAS_SLICE_SIZE != 0 {
            let sz = self.read_i32()?;
            if sz < 4 {
                return Err(MarshalError::InvalidSlice {
                    reason: "slice size below header size",
                });
            }
            let end = self.pos + sz as usize - 4;
            if end > self.limit {
                return Err(MarshalError::OutOfBounds {
                    pos: self.pos,
                    needed: end - self.limit,
                });
            }
            Some(end)
        } else {
            None
        };

        let (indirection, resume_pos) = if flags & FLAG_HAS_INDIRECTION_TABLE != 0 {
            let end = data_end.ok_or(MarshalError::InvalidSlice {
                reason: "indirection table without slice size",
            })?;
            let save = self.pos;
            self.pos = end;
            let table = self.read_indirection_table()?;
            let resume = self.pos;
            self.pos = save;
            (table, Some(resume))
        } else {
            (Vec::new(), None)
        };

        let info = SliceInfo {
            flags,
            type_id,
            data_end,
            resume_pos,
            indirection,
        };
        let ctx = self
            .main
            .as_mut()
            .and_then(|m| m.stack.last_mut())
            .ok_or(MarshalError::InvalidSlice {
                reason: "slice header outside an instance",
            })?;
        ctx.slice = Some(info);
        Ok(())
    }

    /// Read an indirection table: a count followed by that many instance
    /// references (inline or back-references).
    ///
    /// The table is read only after the owning instance is already in the
    /// instance table, so self-referential cycles resolve.
    fn read_indirection_table(&mut self) -> MarshalResult<Vec<ValueHandle>> {
        let count = self.read_and_check_seq_size(1)?;
        let mut table = Vec::with_capacity(count);
        for _ in 0..count {
            match self.read_instance_ref()? {
                Some(h) => table.push(h),
                None => return Err(MarshalError::InvalidIndirection { index: 0 }),
            }
        }
        Ok(table)
    }

    /// Skip the current slice, preserving its bytes and indirection table.
    fn skip_slice(&mut self) -> MarshalResult<SliceData> {
        let info = self
            .main
            .as_mut()
            .and_then(|m| m.stack.last_mut())
            .and_then(|ctx| ctx.slice.take())
            .ok_or(MarshalError::InvalidSlice {
                reason: "no active slice",
            })?;

        let data_end = match info.data_end {
            Some(end) => end,
            None => {
                return Err(MarshalError::NoFactory {
                    type_id: info.type_id.to_string(),
                })
            }
        };

        let bytes = self.buf[self.pos..data_end].to_vec();
        self.pos = info.resume_pos.unwrap_or(data_end);

        Ok(SliceData {
            type_id: info.type_id,
            bytes,
            instances: info.indirection,
            has_tagged_members: info.flags & FLAG_HAS_OPTIONAL_MEMBERS != 0,
            is_last: info.flags & FLAG_IS_LAST_SLICE != 0,
        })
    }

    /// Begin reading one slice of an instance or exception.
    ///
    /// The first call after the stream instantiated the value finds its
    /// header already consumed.
    pub fn start_slice(&mut self) -> MarshalResult<()> {
        let ctx = self
            .main
            .as_mut()
            .and_then(|m| m.stack.last_mut())
            .ok_or(MarshalError::InvalidSlice {
                reason: "start_slice outside an instance",
            })?;
        if ctx.skip_first {
            ctx.skip_first = false;
            return Ok(());
        }
        self.read_slice_header()
    }

    /// Finish reading the current slice: consume trailing tagged members
    /// and step over the indirection table.
    pub fn end_slice(&mut self) -> MarshalResult<()> {
        let info = self
            .main
            .as_ref()
            .and_then(|m| m.stack.last())
            .and_then(|ctx| ctx.slice.clone())
            .ok_or(MarshalError::InvalidSlice {
                reason: "end_slice without start_slice",
            })?;

        if info.flags & FLAG_HAS_OPTIONAL_MEMBERS != 0 {
            let end = info.data_end.unwrap_or(self.limit);
            self.skip_tagged_run(end)?;
        }
        if let Some(resume) = info.resume_pos {
            self.pos = resume;
        } else if let Some(end) = info.data_end {
            if self.pos > end {
                return Err(MarshalError::InvalidSlice {
                    reason: "slice read past its declared size",
                });
            }
            // A newer sender may have appended members we do not know.
            self.pos = end;
        }
        Ok(())
    }

    /// Decode a user exception from the cursor.
    ///
    /// Unknown most-derived slices are sliced off until a registered type
    /// is found; if no slice is known the most-derived type ID is reported.
    pub fn read_exception(&mut self) -> MarshalResult<Box<dyn UserException>> {
        self.require_class_context()?;
        self.main
            .as_mut()
            .ok_or(MarshalError::NoMainEncapsulation)?
            .stack
            .push(InstanceCtx::default());

        let result = self.read_exception_slices();

        if let Some(main) = self.main.as_mut() {
            main.stack.pop();
        }
        result
    }

    fn read_exception_slices(&mut self) -> MarshalResult<Box<dyn UserException>> {
        self.read_slice_header()?;
        let mut most_derived: Option<String> = None;

        loop {
            let type_id = self
                .current_slice_type_id()
                .ok_or(MarshalError::InvalidSlice {
                    reason: "slice has no type ID",
                })?;
            let id_str = type_id.to_string();
            if most_derived.is_none() {
                most_derived = Some(id_str.clone());
            }

            let factory = match &type_id {
                SliceTypeId::Str(s) => self.factories.and_then(|reg| reg.find_exception(s)),
                SliceTypeId::Compact(_) => None,
            };

            if let Some(factory) = factory {
                if let Some(ctx) = self.main.as_mut().and_then(|m| m.stack.last_mut()) {
                    ctx.skip_first = true;
                }
                let mut ex = factory();
                ex.unmarshal(self)?;
                return Ok(ex);
            }

            let slice = self.skip_slice()?;
            if slice.is_last {
                return Err(MarshalError::UnknownUserException {
                    type_id: most_derived.unwrap_or(id_str),
                });
            }
            self.read_slice_header()?;
        }
    }
}

impl std::fmt::Debug for InputStream<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputStream")
            .field("pos", &self.pos)
            .field("limit", &self.limit)
            .field("encoding", &self.encoding)
            .field("instances", &self.graph.len())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
