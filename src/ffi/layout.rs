//! Struct Layout Engine
//!
//! Computes C field offsets, size and alignment for structs described at run
//! time, in natural or packed mode.

use std::sync::Arc;

use super::error::{FfiError, FfiResult};
use super::types::{next_type_id, TypeDescriptor};
use super::value::{NativeBuffer, Value};

/// A laid-out struct field
#[derive(Debug, Clone)]
pub struct FieldDescriptor {
    /// Field name, unique within its struct
    pub name: String,
    /// Field type (the element type for inline arrays)
    pub ty: TypeDescriptor,
    /// Byte offset from the start of the struct
    pub offset: usize,
    /// Element count for inline arrays
    pub fixed_length: Option<usize>,
}

impl FieldDescriptor {
    /// Number of element slots this field occupies
    pub fn slots(&self) -> usize {
        self.fixed_length.unwrap_or(1)
    }

    /// Total bytes covered by the field
    pub fn size(&self) -> usize {
        self.ty.native_size() * self.slots()
    }
}

/// Immutable layout of a struct
#[derive(Debug)]
pub struct StructDescriptor {
    id: u64,
    name: Option<String>,
    fields: Vec<FieldDescriptor>,
    size: usize,
    alignment: usize,
    packed: bool,
}

struct PendingField {
    name: String,
    ty: TypeDescriptor,
    fixed_length: Option<usize>,
}

impl StructDescriptor {
    fn compute(name: Option<String>, pending: &[PendingField], packed: bool) -> Self {
        let mut alignment = 0usize;
        for field in pending {
            let align = field.ty.native_alignment().max(1);
            alignment = if packed {
                if alignment == 0 {
                    align
                } else {
                    alignment.min(align)
                }
            } else {
                alignment.max(align)
            };
        }
        let alignment = alignment.max(1);

        let mut size = 0usize;
        let mut fields = Vec::with_capacity(pending.len());
        for field in pending {
            let elem_size = field.ty.native_size();
            let elem_align = field.ty.native_alignment().max(1);
            let pad = |at: usize| {
                if packed {
                    0
                } else {
                    (elem_align - at % elem_align) % elem_align
                }
            };

            // arrays are laid out slot by slot, the first slot fixes the offset
            let offset = size + pad(size);
            size = offset;
            for slot in 0..field.fixed_length.unwrap_or(1) {
                if slot > 0 {
                    size += pad(size);
                }
                size += elem_size;
            }

            fields.push(FieldDescriptor {
                name: field.name.clone(),
                ty: field.ty.clone(),
                offset,
                fixed_length: field.fixed_length,
            });
        }

        if !packed {
            let left = size % alignment;
            if left > 0 {
                size += alignment - left;
            }
        }

        Self {
            id: next_type_id(),
            name,
            fields,
            size,
            alignment,
            packed,
        }
    }

    /// Process-unique id of this layout
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    /// Look up a field by name
    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    pub fn is_packed(&self) -> bool {
        self.packed
    }

    /// Whether every element slot sits at its type's natural alignment and
    /// the size needs no tail padding. A packed layout with this property is
    /// byte-for-byte the unpacked one.
    pub fn is_naturally_aligned(&self) -> bool {
        let mut widest = 1;
        let slots_aligned = self.fields.iter().all(|field| {
            let align = field.ty.native_alignment().max(1);
            let stride = field.ty.native_size();
            widest = widest.max(align);
            (0..field.slots()).all(|slot| (field.offset + slot * stride) % align == 0)
        });
        slots_aligned && self.size % widest == 0
    }

    fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("struct#{}", self.id))
    }
}

/// A struct definition under construction
///
/// Fields may be added until the first instance is created; after that the
/// layout is frozen. Taking a `descriptor()` does not freeze it.
pub struct StructDef {
    name: Option<String>,
    packed: bool,
    pending: Vec<PendingField>,
    current: Arc<StructDescriptor>,
    frozen: bool,
}

impl StructDef {
    /// Start a naturally aligned struct
    pub fn new(name: Option<&str>) -> Self {
        Self::with_packing(name, false)
    }

    /// Start a packed struct
    pub fn packed(name: Option<&str>) -> Self {
        Self::with_packing(name, true)
    }

    fn with_packing(name: Option<&str>, packed: bool) -> Self {
        let name = name.map(str::to_string);
        Self {
            current: Arc::new(StructDescriptor::compute(name.clone(), &[], packed)),
            name,
            packed,
            pending: Vec::new(),
            frozen: false,
        }
    }

    /// Append a field
    pub fn add_field(&mut self, name: &str, ty: TypeDescriptor) -> FfiResult<&mut Self> {
        self.push(name, ty, None)
    }

    /// Append an inline array of `len` elements
    pub fn add_array_field(
        &mut self,
        name: &str,
        element: TypeDescriptor,
        len: usize,
    ) -> FfiResult<&mut Self> {
        self.push(name, element, Some(len))
    }

    fn push(
        &mut self,
        name: &str,
        ty: TypeDescriptor,
        fixed_length: Option<usize>,
    ) -> FfiResult<&mut Self> {
        if self.frozen {
            return Err(FfiError::LayoutFrozen(self.current.display_name()));
        }
        if self.pending.iter().any(|f| f.name == name) {
            return Err(FfiError::FieldRedefinition {
                name: self.current.display_name(),
                field: name.to_string(),
            });
        }
        self.pending.push(PendingField {
            name: name.to_string(),
            ty,
            fixed_length,
        });
        self.current = Arc::new(StructDescriptor::compute(
            self.name.clone(),
            &self.pending,
            self.packed,
        ));
        Ok(self)
    }

    /// Current layout. Adding a field produces a new layout with a new id.
    pub fn descriptor(&self) -> Arc<StructDescriptor> {
        Arc::clone(&self.current)
    }

    /// Current layout as a by-value type descriptor
    pub fn type_descriptor(&self) -> TypeDescriptor {
        TypeDescriptor::structure(self.descriptor())
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Materialize a zeroed instance, freezing the definition
    pub fn instance(&mut self) -> StructValue {
        self.frozen = true;
        StructValue::zeroed(self.descriptor())
    }
}

/// A materialized struct backed by native memory
///
/// Clones share the same storage, so a struct passed by pointer observes
/// writes made by native code.
#[derive(Debug, Clone)]
pub struct StructValue {
    desc: Arc<StructDescriptor>,
    storage: NativeBuffer,
}

impl StructValue {
    pub fn zeroed(desc: Arc<StructDescriptor>) -> Self {
        let storage = NativeBuffer::new(desc.size());
        Self { desc, storage }
    }

    /// Copy raw bytes into a new instance. Extra bytes are ignored.
    pub fn from_bytes(desc: Arc<StructDescriptor>, bytes: &[u8]) -> Self {
        let value = Self::zeroed(desc);
        let len = value.desc.size().min(bytes.len());
        value.storage.write_bytes(0, &bytes[..len]);
        value
    }

    pub fn descriptor(&self) -> &Arc<StructDescriptor> {
        &self.desc
    }

    /// Address of the first byte
    pub fn address(&self) -> usize {
        self.storage.address()
    }

    pub(crate) fn storage(&self) -> &NativeBuffer {
        &self.storage
    }

    /// Snapshot of the struct bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = self.storage.to_vec();
        bytes.truncate(self.desc.size());
        bytes
    }

    fn field(&self, name: &str) -> FfiResult<&FieldDescriptor> {
        self.desc.field(name).ok_or_else(|| FfiError::UnknownField {
            name: self.desc.display_name(),
            field: name.to_string(),
        })
    }

    fn slot_offset(&self, field: &FieldDescriptor, index: usize) -> FfiResult<usize> {
        if index >= field.slots() {
            return Err(FfiError::UnknownField {
                name: self.desc.display_name(),
                field: format!("{}[{}]", field.name, index),
            });
        }
        Ok(field.offset + index * field.ty.native_size())
    }

    /// Read a field
    pub fn get(&self, name: &str) -> FfiResult<Value> {
        self.get_index(name, 0)
    }

    /// Read one element of an inline array field
    pub fn get_index(&self, name: &str, index: usize) -> FfiResult<Value> {
        let field = self.field(name)?;
        let offset = self.slot_offset(field, index)?;
        self.storage.read(&field.ty, offset)
    }

    /// Write a field
    pub fn set(&self, name: &str, value: impl Into<Value>) -> FfiResult<()> {
        self.set_index(name, 0, value)
    }

    /// Write one element of an inline array field
    pub fn set_index(&self, name: &str, index: usize, value: impl Into<Value>) -> FfiResult<()> {
        let field = self.field(name)?;
        let offset = self.slot_offset(field, index)?;
        self.storage.write(&field.ty, offset, &value.into())
    }
}
