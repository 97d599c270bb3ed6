// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Class and exception instances, the decoded-instance arena, and the
//! factory registry.
//!
//! Decoded object graphs live in a [`ValueGraph`]: a flat arena of
//! instances addressed by [`ValueHandle`]. Class-typed members store
//! handles instead of pointers, so cyclic graphs and forward references
//! need no shared ownership. Wire-level reference identity maps to handle
//! equality.
//!
//! Factories are an explicit registry keyed by type ID (and optional
//! compact numeric ID). A type with no registered factory decodes into an
//! opaque instance that preserves its slices for re-transmission.

use std::any::Any;
use std::fmt;

use dashmap::DashMap;

use super::input::InputStream;
use super::output::OutputStream;
use super::MarshalResult;

// ============================================================================
// Traits
// ============================================================================

/// A class instance that can be marshaled as one or more slices.
///
/// Implementations write and read their slices most-derived first using
/// [`OutputStream::start_slice`] / [`InputStream::start_slice`] and the
/// matching `end_slice` calls.
pub trait Value: fmt::Debug + Send {
    /// Type ID of the most-derived slice, e.g. `"::demo::Node"`.
    fn type_id(&self) -> &'static str;

    /// Optional compact numeric type ID for the most-derived slice.
    fn compact_id(&self) -> Option<i32> {
        None
    }

    /// Write all slices of this instance. Class-typed members are written
    /// as handles via [`OutputStream::write_value`]; the stream resolves
    /// them against the graph it was constructed with.
    fn marshal(&self, ostr: &mut OutputStream<'_>) -> MarshalResult<()>;

    /// Read all slices of this instance. The first slice header has
    /// already been consumed by the stream.
    fn unmarshal(&mut self, istr: &mut InputStream<'_>) -> MarshalResult<()>;

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// A user exception marshaled as one or more slices, most-derived first.
pub trait UserException: fmt::Debug + Send {
    /// Type ID of the most-derived slice.
    fn type_id(&self) -> &'static str;

    /// Write all slices of this exception.
    fn marshal(&self, ostr: &mut OutputStream<'_>) -> MarshalResult<()>;

    /// Read all slices of this exception. The first slice header has
    /// already been consumed by the stream.
    fn unmarshal(&mut self, istr: &mut InputStream<'_>) -> MarshalResult<()>;

    fn as_any(&self) -> &dyn Any;
}

/// Creates an empty instance for a type ID, ready for `unmarshal`.
pub type ValueFactory = fn() -> Box<dyn Value>;

/// Creates an empty user exception for a type ID, ready for `unmarshal`.
pub type ExceptionFactory = fn() -> Box<dyn UserException>;

// ============================================================================
// Preserved slices
// ============================================================================

/// Type ID of one slice, as it appeared on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SliceTypeId {
    /// Literal string type ID.
    Str(String),
    /// Compact numeric type ID.
    Compact(i32),
}

impl fmt::Display for SliceTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SliceTypeId::Str(s) => write!(f, "{}", s),
            SliceTypeId::Compact(id) => write!(f, "{}", id),
        }
    }
}

/// One preserved slice of an unknown (or partially known) type.
#[derive(Clone, Debug)]
pub struct SliceData {
    /// Type ID of this slice.
    pub type_id: SliceTypeId,
    /// Raw member bytes, excluding the slice header and indirection table.
    pub bytes: Vec<u8>,
    /// Instances referenced by this slice's indirection table, in order.
    pub instances: Vec<ValueHandle>,
    /// Slice carried tagged members (terminated by the end marker).
    pub has_tagged_members: bool,
    /// This was the least-derived slice of the instance.
    pub is_last: bool,
}

/// All preserved slices of one instance, most-derived first.
#[derive(Clone, Debug, Default)]
pub struct SlicedData {
    pub slices: Vec<SliceData>,
}

// ============================================================================
// Instance arena
// ============================================================================

/// Handle to one instance in a [`ValueGraph`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueHandle(pub(crate) u32);

impl ValueHandle {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// One entry in the arena: a concrete value, preserved slices, or both.
///
/// A fully unknown type has `value: None` and `sliced: Some`. A known type
/// that arrived with unknown derived slices keeps those in `sliced`.
#[derive(Debug, Default)]
pub struct Instance {
    pub value: Option<Box<dyn Value>>,
    pub sliced: Option<SlicedData>,
}

/// Arena of class instances produced by decoding or assembled for encoding.
#[derive(Debug, Default)]
pub struct ValueGraph {
    instances: Vec<Instance>,
}

impl ValueGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of instances in the graph.
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Add a concrete value, returning its handle.
    pub fn add(&mut self, value: Box<dyn Value>) -> ValueHandle {
        self.instances.push(Instance {
            value: Some(value),
            sliced: None,
        });
        ValueHandle(self.instances.len() as u32 - 1)
    }

    /// Reserve an empty slot; the decoder fills it in afterwards. The slot
    /// is created before members decode so self-referential cycles resolve.
    pub(crate) fn reserve(&mut self) -> ValueHandle {
        self.instances.push(Instance::default());
        ValueHandle(self.instances.len() as u32 - 1)
    }

    pub(crate) fn set_value(&mut self, handle: ValueHandle, value: Box<dyn Value>) {
        self.instances[handle.index()].value = Some(value);
    }

    pub(crate) fn set_sliced(&mut self, handle: ValueHandle, sliced: SlicedData) {
        self.instances[handle.index()].sliced = Some(sliced);
    }

    /// Borrow an instance entry.
    pub fn instance(&self, handle: ValueHandle) -> &Instance {
        &self.instances[handle.index()]
    }

    /// Mutably borrow an instance entry.
    pub fn instance_mut(&mut self, handle: ValueHandle) -> &mut Instance {
        &mut self.instances[handle.index()]
    }

    /// Downcast an instance's value to a concrete type.
    pub fn get<T: Value + 'static>(&self, handle: ValueHandle) -> Option<&T> {
        self.instances[handle.index()]
            .value
            .as_ref()
            .and_then(|v| v.as_any().downcast_ref::<T>())
    }

    /// Mutable downcast of an instance's value.
    pub fn get_mut<T: Value + 'static>(&mut self, handle: ValueHandle) -> Option<&mut T> {
        self.instances[handle.index()]
            .value
            .as_mut()
            .and_then(|v| v.as_any_mut().downcast_mut::<T>())
    }

    /// Preserved slices of an instance, if any survived decoding.
    pub fn sliced_data(&self, handle: ValueHandle) -> Option<&SlicedData> {
        self.instances[handle.index()].sliced.as_ref()
    }

    pub(crate) fn contains(&self, handle: ValueHandle) -> bool {
        handle.index() < self.instances.len()
    }
}

// ============================================================================
// Factory registry
// ============================================================================

/// Explicit mapping from type IDs to instance factories.
///
/// Populated at startup; lookups are lock-free reads. There is no runtime
/// type discovery: a type ID with no entry decodes as preserved slices.
#[derive(Default)]
pub struct ValueFactoryRegistry {
    values: DashMap<String, ValueFactory>,
    compact: DashMap<i32, ValueFactory>,
    exceptions: DashMap<String, ExceptionFactory>,
}

impl ValueFactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a class factory under its string type ID.
    pub fn register_value(&self, type_id: &str, factory: ValueFactory) {
        self.values.insert(type_id.to_string(), factory);
    }

    /// Register a class factory under a compact numeric type ID.
    pub fn register_compact_value(&self, compact_id: i32, factory: ValueFactory) {
        self.compact.insert(compact_id, factory);
    }

    /// Register an exception factory under its string type ID.
    pub fn register_exception(&self, type_id: &str, factory: ExceptionFactory) {
        self.exceptions.insert(type_id.to_string(), factory);
    }

    pub fn find_value(&self, type_id: &str) -> Option<ValueFactory> {
        self.values.get(type_id).map(|f| *f)
    }

    pub fn find_compact_value(&self, compact_id: i32) -> Option<ValueFactory> {
        self.compact.get(&compact_id).map(|f| *f)
    }

    pub fn find_exception(&self, type_id: &str) -> Option<ExceptionFactory> {
        self.exceptions.get(type_id).map(|f| *f)
    }
}

impl fmt::Debug for ValueFactoryRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueFactoryRegistry")
            .field("values", &self.values.len())
            .field("compact", &self.compact.len())
            .field("exceptions", &self.exceptions.len())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct Leaf {
        n: i32,
    }

    impl Value for Leaf {
        fn type_id(&self) -> &'static str {
            "::test::Leaf"
        }

        fn marshal(&self, ostr: &mut OutputStream<'_>) -> MarshalResult<()> {
            ostr.start_slice(Value::type_id(self), None, true)?;
            ostr.write_i32(self.n);
            ostr.end_slice()
        }

        fn unmarshal(&mut self, istr: &mut InputStream<'_>) -> MarshalResult<()> {
            istr.start_slice()?;
            self.n = istr.read_i32()?;
            istr.end_slice()?;
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    #[test]
    fn test_graph_add_and_downcast() {
        let mut graph = ValueGraph::new();
        let h = graph.add(Box::new(Leaf { n: 7 }));

        assert_eq!(graph.len(), 1);
        assert_eq!(graph.get::<Leaf>(h).unwrap().n, 7);

        graph.get_mut::<Leaf>(h).unwrap().n = 9;
        assert_eq!(graph.get::<Leaf>(h).unwrap().n, 9);
    }

    #[test]
    fn test_graph_reserve_then_fill() {
        let mut graph = ValueGraph::new();
        let h = graph.reserve();
        assert!(graph.instance(h).value.is_none());

        graph.set_value(h, Box::new(Leaf { n: 1 }));
        assert_eq!(graph.get::<Leaf>(h).unwrap().n, 1);
    }

    #[test]
    fn test_registry_lookup() {
        let registry = ValueFactoryRegistry::new();
        registry.register_value("::test::Leaf", || Box::new(Leaf::default()));
        registry.register_compact_value(12, || Box::new(Leaf::default()));

        assert!(registry.find_value("::test::Leaf").is_some());
        assert!(registry.find_value("::test::Missing").is_none());
        assert!(registry.find_compact_value(12).is_some());
        assert!(registry.find_compact_value(13).is_none());

        let v = registry.find_value("::test::Leaf").unwrap()();
        assert_eq!(Value::type_id(v.as_ref()), "::test::Leaf");
    }
}
