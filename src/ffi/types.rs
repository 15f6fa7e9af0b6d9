//! FFI Type System
//!
//! Immutable descriptors for native types. A descriptor carries the size and
//! alignment of the value it names plus an indirection level: `1` is the value
//! itself, `2` a pointer to it, and so on. Pointer and dereferenced variants
//! are derived as new values; nothing is mutated in place.

use std::fmt;
use std::mem::{align_of, size_of};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use once_cell::sync::OnceCell;

use super::callback::{Callback, HostHandle};
use super::cif::{Abi, CallDescriptor};
use super::dispatch::ForeignFunction;
use super::error::{FfiError, FfiResult};
use super::layout::StructDescriptor;
use super::value::Value;

/// Platform pointer width in bytes
pub const POINTER_SIZE: usize = size_of::<usize>();

/// Platform pointer alignment in bytes
pub const POINTER_ALIGN: usize = align_of::<usize>();

static NEXT_TYPE_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique id for an aggregate or function type
pub(crate) fn next_type_id() -> u64 {
    NEXT_TYPE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Primitive value types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Primitive {
    /// No value
    Void,
    /// C `bool`
    Bool,
    /// 8-bit signed integer
    Int8,
    /// 8-bit unsigned integer
    UInt8,
    /// 16-bit signed integer
    Int16,
    /// 16-bit unsigned integer
    UInt16,
    /// 32-bit signed integer
    Int32,
    /// 32-bit unsigned integer
    UInt32,
    /// 64-bit signed integer
    Int64,
    /// 64-bit unsigned integer
    UInt64,
    /// 32-bit floating point
    Float,
    /// 64-bit floating point
    Double,
    /// Platform `size_t`
    SizeT,
    /// Platform `ssize_t`
    SSizeT,
    /// Null-terminated C string (`char *`)
    CString,
}

impl Primitive {
    /// All primitives, in registration order
    pub const ALL: [Primitive; 15] = [
        Primitive::Void,
        Primitive::Bool,
        Primitive::Int8,
        Primitive::UInt8,
        Primitive::Int16,
        Primitive::UInt16,
        Primitive::Int32,
        Primitive::UInt32,
        Primitive::Int64,
        Primitive::UInt64,
        Primitive::Float,
        Primitive::Double,
        Primitive::SizeT,
        Primitive::SSizeT,
        Primitive::CString,
    ];

    /// Size in bytes of a value of this type
    pub fn size(&self) -> usize {
        match self {
            Primitive::Void => 0,
            Primitive::Bool | Primitive::Int8 | Primitive::UInt8 => 1,
            Primitive::Int16 | Primitive::UInt16 => 2,
            Primitive::Int32 | Primitive::UInt32 | Primitive::Float => 4,
            Primitive::Int64 | Primitive::UInt64 | Primitive::Double => 8,
            Primitive::SizeT | Primitive::SSizeT | Primitive::CString => POINTER_SIZE,
        }
    }

    /// Natural alignment in bytes
    pub fn alignment(&self) -> usize {
        match self {
            Primitive::Void => 1,
            Primitive::Bool | Primitive::Int8 | Primitive::UInt8 => 1,
            Primitive::Int16 | Primitive::UInt16 => align_of::<u16>(),
            Primitive::Int32 | Primitive::UInt32 => align_of::<u32>(),
            Primitive::Float => align_of::<f32>(),
            Primitive::Int64 | Primitive::UInt64 => align_of::<u64>(),
            Primitive::Double => align_of::<f64>(),
            Primitive::SizeT | Primitive::SSizeT | Primitive::CString => POINTER_ALIGN,
        }
    }

    /// Canonical registry name
    pub fn name(&self) -> &'static str {
        match self {
            Primitive::Void => "void",
            Primitive::Bool => "bool",
            Primitive::Int8 => "int8",
            Primitive::UInt8 => "uint8",
            Primitive::Int16 => "int16",
            Primitive::UInt16 => "uint16",
            Primitive::Int32 => "int32",
            Primitive::UInt32 => "uint32",
            Primitive::Int64 => "int64",
            Primitive::UInt64 => "uint64",
            Primitive::Float => "float",
            Primitive::Double => "double",
            Primitive::SizeT => "size_t",
            Primitive::SSizeT => "ssize_t",
            Primitive::CString => "CString",
        }
    }

    /// Check if this is an integer type (bool excluded)
    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            Primitive::Int8
                | Primitive::UInt8
                | Primitive::Int16
                | Primitive::UInt16
                | Primitive::Int32
                | Primitive::UInt32
                | Primitive::Int64
                | Primitive::UInt64
                | Primitive::SizeT
                | Primitive::SSizeT
        )
    }

    /// Check if this is a signed integer type
    pub fn is_signed(&self) -> bool {
        matches!(
            self,
            Primitive::Int8
                | Primitive::Int16
                | Primitive::Int32
                | Primitive::Int64
                | Primitive::SSizeT
        )
    }

    /// Check if this is a floating point type
    pub fn is_float(&self) -> bool {
        matches!(self, Primitive::Float | Primitive::Double)
    }

    /// Signed integer primitive of the given byte width
    pub(crate) fn signed_of(size: usize) -> Primitive {
        match size {
            1 => Primitive::Int8,
            2 => Primitive::Int16,
            4 => Primitive::Int32,
            _ => Primitive::Int64,
        }
    }

    /// Unsigned integer primitive of the given byte width
    pub(crate) fn unsigned_of(size: usize) -> Primitive {
        match size {
            1 => Primitive::UInt8,
            2 => Primitive::UInt16,
            4 => Primitive::UInt32,
            _ => Primitive::UInt64,
        }
    }
}

impl fmt::Display for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Signature of a native function used as a value (a function pointer)
///
/// Reading a value of this type yields a callable `ForeignFunction`; a host
/// closure becomes a value of this type through `to_callback`.
#[derive(Debug)]
pub struct FunctionType {
    id: u64,
    /// Return type
    pub return_type: TypeDescriptor,
    /// Parameter types
    pub params: Vec<TypeDescriptor>,
    /// Calling convention
    pub abi: Abi,
    /// Call interface, prepared on first use
    cif: OnceCell<Arc<CallDescriptor>>,
}

impl FunctionType {
    pub fn new(return_type: TypeDescriptor, params: Vec<TypeDescriptor>, abi: Abi) -> Self {
        Self {
            id: next_type_id(),
            return_type,
            params,
            abi,
            cif: OnceCell::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Call interface for this signature, shared by every function bound to it
    pub fn call_descriptor(&self) -> FfiResult<Arc<CallDescriptor>> {
        self.cif
            .get_or_try_init(|| {
                CallDescriptor::new(self.return_type.clone(), self.params.clone(), self.abi)
                    .map(Arc::new)
            })
            .cloned()
    }

    /// Bind a native function pointer of this signature
    pub fn to_function(&self, name: impl Into<String>, addr: usize) -> FfiResult<ForeignFunction> {
        ForeignFunction::new(name, addr, self.call_descriptor()?)
    }

    /// Wrap a host closure as a native function pointer of this signature
    pub fn to_callback<F>(
        self: &Arc<Self>,
        name: impl Into<String>,
        host: HostHandle,
        host_fn: F,
    ) -> FfiResult<Callback>
    where
        F: Fn(&[Value]) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        Callback::with_type(name, Arc::clone(self), host, host_fn)
    }
}

/// What a descriptor describes at indirection 1
#[derive(Debug, Clone)]
pub enum TypeKind {
    Primitive(Primitive),
    /// Opaque address
    Pointer,
    Struct(Arc<StructDescriptor>),
    Function(Arc<FunctionType>),
}

/// Structural identity of a type kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KindKey {
    Primitive(Primitive),
    Pointer,
    Struct(u64),
    Function(u64),
}

/// Structural identity of a descriptor, used for hashing and caching
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeKey {
    pub kind: KindKey,
    pub indirection: u32,
}

/// An immutable native type description
#[derive(Debug, Clone)]
pub struct TypeDescriptor {
    size: usize,
    alignment: usize,
    indirection: u32,
    kind: TypeKind,
    name: Option<String>,
}

impl TypeDescriptor {
    /// Descriptor for a primitive value type
    pub fn primitive(prim: Primitive) -> Self {
        Self {
            size: prim.size(),
            alignment: prim.alignment(),
            indirection: 1,
            kind: TypeKind::Primitive(prim),
            name: Some(prim.name().to_string()),
        }
    }

    /// `void`
    pub fn void() -> Self {
        Self::primitive(Primitive::Void)
    }

    /// An opaque pointer-sized address
    pub fn pointer() -> Self {
        Self {
            size: POINTER_SIZE,
            alignment: POINTER_ALIGN,
            indirection: 1,
            kind: TypeKind::Pointer,
            name: Some("pointer".to_string()),
        }
    }

    /// A struct passed by value
    pub fn structure(desc: Arc<StructDescriptor>) -> Self {
        Self {
            size: desc.size(),
            alignment: desc.alignment(),
            indirection: 1,
            name: desc.name().map(str::to_string),
            kind: TypeKind::Struct(desc),
        }
    }

    /// A function pointer with a known signature
    pub fn function(func: Arc<FunctionType>) -> Self {
        Self {
            size: POINTER_SIZE,
            alignment: POINTER_ALIGN,
            indirection: 1,
            kind: TypeKind::Function(func),
            name: None,
        }
    }

    /// Copy of this descriptor carrying a different name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Size of the value at indirection 1
    pub fn size(&self) -> usize {
        self.size
    }

    /// Alignment of the value at indirection 1
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    pub fn indirection(&self) -> u32 {
        self.indirection
    }

    pub fn kind(&self) -> &TypeKind {
        &self.kind
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Primitive kind, if this is a primitive value type
    pub fn as_primitive(&self) -> Option<Primitive> {
        match (&self.kind, self.indirection) {
            (TypeKind::Primitive(p), 1) => Some(*p),
            _ => None,
        }
    }

    /// Struct layout, if this is a struct value type
    pub fn as_struct(&self) -> Option<&Arc<StructDescriptor>> {
        match (&self.kind, self.indirection) {
            (TypeKind::Struct(s), 1) => Some(s),
            _ => None,
        }
    }

    /// Signature, if this is a function pointer type
    pub fn as_function(&self) -> Option<&Arc<FunctionType>> {
        match (&self.kind, self.indirection) {
            (TypeKind::Function(f), 1) => Some(f),
            _ => None,
        }
    }

    /// `void` at indirection 1
    pub fn is_void(&self) -> bool {
        self.as_primitive() == Some(Primitive::Void)
    }

    /// Whether values of this type travel as an address
    pub fn is_reference(&self) -> bool {
        self.indirection > 1 || matches!(self.kind, TypeKind::Pointer | TypeKind::Function(_))
    }

    /// Bytes this type occupies in a struct or argument slot
    pub fn native_size(&self) -> usize {
        if self.indirection > 1 {
            POINTER_SIZE
        } else {
            self.size
        }
    }

    /// Alignment this type requires in a struct or argument slot
    pub fn native_alignment(&self) -> usize {
        if self.indirection > 1 {
            POINTER_ALIGN
        } else {
            self.alignment
        }
    }

    /// Pointer to this type
    pub fn ref_type(&self) -> Self {
        let mut rtn = self.clone();
        rtn.indirection += 1;
        rtn.name = self.name.as_ref().map(|n| format!("{}*", n));
        rtn
    }

    /// The type this pointer points to
    pub fn deref_type(&self) -> FfiResult<Self> {
        if self.indirection == 1 {
            return Err(FfiError::Indirection(self.to_string()));
        }
        let mut rtn = self.clone();
        rtn.indirection -= 1;
        rtn.name = self
            .name
            .as_ref()
            .and_then(|n| n.strip_suffix('*').map(str::to_string));
        Ok(rtn)
    }

    /// Structural identity
    pub fn key(&self) -> TypeKey {
        let kind = match &self.kind {
            TypeKind::Primitive(p) => KindKey::Primitive(*p),
            TypeKind::Pointer => KindKey::Pointer,
            TypeKind::Struct(s) => KindKey::Struct(s.id()),
            TypeKind::Function(f) => KindKey::Function(f.id()),
        };
        TypeKey {
            kind,
            indirection: self.indirection,
        }
    }
}

impl PartialEq for TypeDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key() && self.size == other.size && self.alignment == other.alignment
    }
}

impl Eq for TypeDescriptor {}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = &self.name {
            return f.write_str(name);
        }
        match &self.kind {
            TypeKind::Primitive(p) => write!(f, "{}", p)?,
            TypeKind::Pointer => write!(f, "pointer")?,
            TypeKind::Struct(s) => write!(f, "struct#{}", s.id())?,
            TypeKind::Function(func) => {
                write!(f, "{} (*)(", func.return_type)?;
                for (i, param) in func.params.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", param)?;
                }
                write!(f, ")")?;
            }
        }
        for _ in 1..self.indirection {
            write!(f, "*")?;
        }
        Ok(())
    }
}

/// Anything that can be coerced into a descriptor by a registry
#[derive(Debug, Clone)]
pub enum TypeSpec {
    Name(String),
    Descriptor(TypeDescriptor),
}

impl From<&str> for TypeSpec {
    fn from(s: &str) -> Self {
        TypeSpec::Name(s.to_string())
    }
}

impl From<String> for TypeSpec {
    fn from(s: String) -> Self {
        TypeSpec::Name(s)
    }
}

impl From<TypeDescriptor> for TypeSpec {
    fn from(t: TypeDescriptor) -> Self {
        TypeSpec::Descriptor(t)
    }
}

impl From<&TypeDescriptor> for TypeSpec {
    fn from(t: &TypeDescriptor) -> Self {
        TypeSpec::Descriptor(t.clone())
    }
}

impl From<Primitive> for TypeSpec {
    fn from(p: Primitive) -> Self {
        TypeSpec::Descriptor(TypeDescriptor::primitive(p))
    }
}
