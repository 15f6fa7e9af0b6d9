//! Host values and their native encodings
//!
//! `Value` is what callers hand to the dispatcher and get back from it.
//! `NativeBuffer` is host-owned memory with a fixed address that may be passed
//! to native code by pointer; every frame or struct that hands its address
//! across the boundary holds a reference to it until it is done.

use std::alloc::{self, Layout};
use std::collections::BTreeMap;
use std::ffi::{CStr, CString};
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::Mutex;

use super::dispatch::ForeignFunction;
use super::error::{FfiError, FfiResult};
use super::layout::StructValue;
use super::types::{Primitive, TypeDescriptor, TypeKind, POINTER_SIZE};

/// Alignment of every native buffer allocation
const BUFFER_ALIGN: usize = 16;

/// A value on the host side of the boundary
#[derive(Debug, Clone)]
pub enum Value {
    /// Result of a `void` function
    Void,
    /// Null pointer
    Null,
    Bool(bool),
    /// Any signed integer
    Int(i64),
    /// Any unsigned integer
    UInt(u64),
    /// `float` or `double`
    Float(f64),
    /// Raw address
    Pointer(usize),
    /// Text, passed as a temporary `char *`
    String(String),
    /// Host memory, passed by address
    Buffer(NativeBuffer),
    /// Struct instance, passed by value or by address
    Struct(StructValue),
    /// Native function pointer read through a function type
    Function(ForeignFunction),
}

impl Value {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::UInt(v) => i64::try_from(*v).ok(),
            Value::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::UInt(v) => Some(*v),
            Value::Int(v) => u64::try_from(*v).ok(),
            Value::Bool(b) => Some(*b as u64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            Value::UInt(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Int(v) => Some(*v != 0),
            Value::UInt(v) => Some(*v != 0),
            _ => None,
        }
    }

    /// Address carried by this value, if any. `Null` is address 0.
    pub fn as_pointer(&self) -> Option<usize> {
        match self {
            Value::Null => Some(0),
            Value::Pointer(p) => Some(*p),
            Value::Buffer(b) => Some(b.address()),
            Value::Struct(s) => Some(s.address()),
            Value::Function(f) => Some(f.address()),
            _ => None,
        }
    }

    /// Callable function, if this value was read through a function type
    pub fn as_function(&self) -> Option<&ForeignFunction> {
        match self {
            Value::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null | Value::Pointer(0))
    }

    fn kind_name(&self) -> &'static str {
        match self {
            Value::Void => "void",
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::UInt(_) => "uint",
            Value::Float(_) => "float",
            Value::Pointer(_) => "pointer",
            Value::String(_) => "string",
            Value::Buffer(_) => "buffer",
            Value::Struct(_) => "struct",
            Value::Function(_) => "function",
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Void, Value::Void) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::UInt(a), Value::UInt(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Pointer(a), Value::Pointer(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Buffer(a), Value::Buffer(b)) => a.address() == b.address(),
            (Value::Struct(a), Value::Struct(b)) => a.address() == b.address(),
            (Value::Function(a), Value::Function(b)) => a.address() == b.address(),
            _ => false,
        }
    }
}

macro_rules! value_from {
    ($variant:ident, $cast:ty, $($t:ty),+) => {
        $(impl From<$t> for Value {
            fn from(v: $t) -> Self {
                Value::$variant(v as $cast)
            }
        })+
    };
}

value_from!(Int, i64, i8, i16, i32, i64, isize);
value_from!(UInt, u64, u8, u16, u32, u64, usize);
value_from!(Float, f64, f32, f64);

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<NativeBuffer> for Value {
    fn from(v: NativeBuffer) -> Self {
        Value::Buffer(v)
    }
}

impl From<StructValue> for Value {
    fn from(v: StructValue) -> Self {
        Value::Struct(v)
    }
}

impl From<ForeignFunction> for Value {
    fn from(v: ForeignFunction) -> Self {
        Value::Function(v)
    }
}

/// Host allocations that must outlive a native use of their address
#[derive(Debug, Default, Clone)]
pub(crate) struct KeepAlive {
    strings: Vec<Arc<CString>>,
    buffers: Vec<NativeBuffer>,
}

impl KeepAlive {
    fn is_empty(&self) -> bool {
        self.strings.is_empty() && self.buffers.is_empty()
    }
}

struct BufferInner {
    ptr: NonNull<u8>,
    len: usize,
    layout: Layout,
    ty: Option<TypeDescriptor>,
    /// What the value written at each offset references
    keep: Mutex<BTreeMap<usize, KeepAlive>>,
}

impl Drop for BufferInner {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

// Safety: the allocation is owned by the buffer and only reached through it.
// Concurrent native writes are the caller's responsibility, as in C.
unsafe impl Send for BufferInner {}
unsafe impl Sync for BufferInner {}

/// Reference-counted host memory with a stable address
#[derive(Clone)]
pub struct NativeBuffer {
    inner: Arc<BufferInner>,
}

impl NativeBuffer {
    /// Allocate `len` zeroed bytes
    pub fn new(len: usize) -> Self {
        Self::allocate(len, None)
    }

    fn allocate(len: usize, ty: Option<TypeDescriptor>) -> Self {
        let layout = Layout::from_size_align(len.max(1), BUFFER_ALIGN)
            .unwrap_or_else(|_| Layout::new::<u128>());
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = match NonNull::new(raw) {
            Some(ptr) => ptr,
            None => alloc::handle_alloc_error(layout),
        };
        Self {
            inner: Arc::new(BufferInner {
                ptr,
                len,
                layout,
                ty,
                keep: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    /// Copy `bytes` into a new buffer
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let buf = Self::new(bytes.len());
        buf.write_bytes(0, bytes);
        buf
    }

    /// Copy `s` into a new null-terminated buffer
    pub fn with_str(s: &str) -> Self {
        let buf = Self::new(s.len() + 1);
        buf.write_bytes(0, s.as_bytes());
        buf
    }

    /// Zeroed storage for one value of `ty`
    pub fn typed(ty: &TypeDescriptor) -> Self {
        Self::allocate(ty.native_size(), Some(ty.clone()))
    }

    /// Storage for one value of `ty`, initialized with `value`
    pub fn alloc(ty: &TypeDescriptor, value: &Value) -> FfiResult<Self> {
        let buf = Self::typed(ty);
        buf.write(ty, 0, value)?;
        Ok(buf)
    }

    /// Address of the first byte
    pub fn address(&self) -> usize {
        self.inner.ptr.as_ptr() as usize
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.inner.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.inner.len
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    /// Type the buffer was allocated for, if any
    pub fn ty(&self) -> Option<&TypeDescriptor> {
        self.inner.ty.as_ref()
    }

    /// Live references to this allocation, including in-flight calls
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Snapshot of the contents
    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes().to_vec()
    }

    fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.inner.ptr.as_ptr(), self.inner.len) }
    }

    #[allow(clippy::mut_from_ref)]
    fn bytes_mut(&self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.inner.ptr.as_ptr(), self.inner.len) }
    }

    pub(crate) fn write_bytes(&self, offset: usize, src: &[u8]) {
        let end = (offset + src.len()).min(self.inner.len);
        if offset < end {
            self.bytes_mut()[offset..end].copy_from_slice(&src[..end - offset]);
        }
    }

    fn range(&self, ty: &TypeDescriptor, offset: usize) -> FfiResult<std::ops::Range<usize>> {
        let end = offset + ty.native_size();
        if end > self.inner.len {
            return Err(FfiError::Decode(format!(
                "{} at offset {} overruns a {} byte buffer",
                ty, offset, self.inner.len
            )));
        }
        Ok(offset..end)
    }

    /// Read a value of the buffer's own type
    pub fn deref(&self) -> FfiResult<Value> {
        let ty = self
            .inner
            .ty
            .clone()
            .ok_or_else(|| FfiError::Decode("untyped buffer".to_string()))?;
        self.read(&ty, 0)
    }

    /// Decode a value of `ty` at `offset`
    pub fn read(&self, ty: &TypeDescriptor, offset: usize) -> FfiResult<Value> {
        let range = self.range(ty, offset)?;
        decode(ty, &self.bytes()[range])
    }

    /// Encode `value` as `ty` at `offset`
    ///
    /// Whatever the overwritten bytes referenced is released; whatever the
    /// new value references is held until it is overwritten in turn.
    pub fn write(&self, ty: &TypeDescriptor, offset: usize, value: &Value) -> FfiResult<()> {
        let range = self.range(ty, offset)?;
        let mut keep = KeepAlive::default();
        encode(ty, value, &mut self.bytes_mut()[range.clone()], &mut keep)
            .map_err(|reason| FfiError::marshal(0, reason))?;

        let mut held = self.inner.keep.lock();
        let stale: Vec<usize> = held.range(range).map(|(&at, _)| at).collect();
        for at in stale {
            held.remove(&at);
        }
        if !keep.is_empty() {
            held.insert(offset, keep);
        }
        Ok(())
    }
}

impl fmt::Debug for NativeBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeBuffer")
            .field("address", &format_args!("{:#x}", self.address()))
            .field("len", &self.inner.len)
            .field("ty", &self.inner.ty.as_ref().map(|t| t.to_string()))
            .finish()
    }
}

/// Copy `len` bytes starting at a native address
///
/// # Safety
///
/// `addr` must be valid for reads of `len` bytes.
pub unsafe fn read_bytes(addr: usize, len: usize) -> Vec<u8> {
    if addr == 0 || len == 0 {
        return Vec::new();
    }
    std::slice::from_raw_parts(addr as *const u8, len).to_vec()
}

/// Read a null-terminated string at a native address
///
/// # Safety
///
/// `addr` must point at a valid null-terminated string.
pub unsafe fn read_cstring(addr: usize) -> Option<String> {
    if addr == 0 {
        return None;
    }
    Some(
        CStr::from_ptr(addr as *const libc::c_char)
            .to_string_lossy()
            .into_owned(),
    )
}

/// Decode a value of `ty` stored at a native address
///
/// # Safety
///
/// `addr` must be valid for reads of `ty.native_size()` bytes.
pub unsafe fn read_value(addr: usize, ty: &TypeDescriptor) -> FfiResult<Value> {
    if addr == 0 {
        return Err(FfiError::Decode(format!("{} at null address", ty)));
    }
    let bytes = std::slice::from_raw_parts(addr as *const u8, ty.native_size());
    decode(ty, bytes)
}

/// Encode `value` as `ty` into a native address
///
/// # Safety
///
/// `addr` must be valid for writes of `ty.native_size()` bytes, and any
/// string or buffer referenced by `value` must outlive native use of it.
pub unsafe fn write_value(addr: usize, ty: &TypeDescriptor, value: &Value) -> FfiResult<()> {
    if addr == 0 {
        return Err(FfiError::Decode(format!("{} at null address", ty)));
    }
    let bytes = std::slice::from_raw_parts_mut(addr as *mut u8, ty.native_size());
    let mut keep = KeepAlive::default();
    encode(ty, value, bytes, &mut keep).map_err(|reason| FfiError::marshal(0, reason))?;
    // the caller owns the lifetime of anything referenced
    std::mem::forget(keep);
    Ok(())
}

fn int_bounds(prim: Primitive) -> (i128, i128) {
    let bits = prim.size() as u32 * 8;
    if prim.is_signed() {
        (-(1i128 << (bits - 1)), (1i128 << (bits - 1)) - 1)
    } else {
        (0, (1i128 << bits) - 1)
    }
}

fn write_uint(dst: &mut [u8], v: u64) {
    match dst.len() {
        1 => dst.copy_from_slice(&(v as u8).to_ne_bytes()),
        2 => dst.copy_from_slice(&(v as u16).to_ne_bytes()),
        4 => dst.copy_from_slice(&(v as u32).to_ne_bytes()),
        _ => dst.copy_from_slice(&v.to_ne_bytes()),
    }
}

fn read_uint(src: &[u8]) -> u64 {
    match src.len() {
        1 => src[0] as u64,
        2 => u16::from_ne_bytes([src[0], src[1]]) as u64,
        4 => u32::from_ne_bytes([src[0], src[1], src[2], src[3]]) as u64,
        _ => {
            let mut word = [0u8; 8];
            word.copy_from_slice(&src[..8]);
            u64::from_ne_bytes(word)
        }
    }
}

fn sign_extend(raw: u64, size: usize) -> i64 {
    let shift = 64 - size as u32 * 8;
    ((raw << shift) as i64) >> shift
}

/// Integer value from a register-width word holding a narrower integer
pub(crate) fn int_from_word(prim: Primitive, word: u64) -> Value {
    let size = prim.size();
    let raw = if size >= 8 {
        word
    } else {
        word & ((1u64 << (size * 8)) - 1)
    };
    match prim {
        Primitive::Bool => Value::Bool(raw != 0),
        p if p.is_signed() => Value::Int(sign_extend(raw, size)),
        _ => Value::UInt(raw),
    }
}

/// Address a value travels as, registering anything that must stay alive
fn pointer_of(value: &Value, keep: &mut KeepAlive) -> Result<usize, String> {
    match value {
        Value::Null => Ok(0),
        Value::Pointer(p) => Ok(*p),
        Value::Function(f) => Ok(f.address()),
        Value::Buffer(b) => {
            keep.buffers.push(b.clone());
            Ok(b.address())
        }
        Value::Struct(s) => {
            keep.buffers.push(s.storage().clone());
            Ok(s.address())
        }
        Value::String(s) => {
            let c = CString::new(s.as_bytes())
                .map_err(|_| "string contains an interior NUL byte".to_string())?;
            let c = Arc::new(c);
            let addr = c.as_ptr() as usize;
            keep.strings.push(c);
            Ok(addr)
        }
        other => Err(format!("expected a pointer, got {}", other.kind_name())),
    }
}

/// Encode `value` as `ty` into `dst` (exactly `ty.native_size()` bytes)
pub(crate) fn encode(
    ty: &TypeDescriptor,
    value: &Value,
    dst: &mut [u8],
    keep: &mut KeepAlive,
) -> Result<(), String> {
    if ty.is_reference() {
        let addr = pointer_of(value, keep)?;
        dst.copy_from_slice(&addr.to_ne_bytes());
        return Ok(());
    }

    match ty.kind() {
        TypeKind::Struct(desc) => match value {
            Value::Struct(s) if s.descriptor().id() == desc.id() => {
                dst.copy_from_slice(&s.to_bytes()[..dst.len()]);
                Ok(())
            }
            Value::Struct(_) => Err(format!("struct layout mismatch for {}", ty)),
            other => Err(format!("expected {}, got {}", ty, other.kind_name())),
        },
        TypeKind::Primitive(prim) => match prim {
            Primitive::Void => Err("cannot encode void".to_string()),
            Primitive::CString => {
                let addr = pointer_of(value, keep)?;
                dst.copy_from_slice(&addr.to_ne_bytes());
                Ok(())
            }
            Primitive::Bool => {
                let b = value
                    .as_bool()
                    .ok_or_else(|| format!("expected bool, got {}", value.kind_name()))?;
                dst[0] = b as u8;
                Ok(())
            }
            Primitive::Float => {
                let v = value
                    .as_f64()
                    .ok_or_else(|| format!("expected number, got {}", value.kind_name()))?;
                dst.copy_from_slice(&(v as f32).to_ne_bytes());
                Ok(())
            }
            Primitive::Double => {
                let v = value
                    .as_f64()
                    .ok_or_else(|| format!("expected number, got {}", value.kind_name()))?;
                dst.copy_from_slice(&v.to_ne_bytes());
                Ok(())
            }
            int => {
                let v: i128 = match value {
                    Value::Int(v) => *v as i128,
                    Value::UInt(v) => *v as i128,
                    Value::Bool(b) => *b as i128,
                    other => {
                        return Err(format!("expected integer, got {}", other.kind_name()))
                    }
                };
                let (min, max) = int_bounds(*int);
                if v < min || v > max {
                    return Err(format!("{} is out of range for {}", v, int));
                }
                write_uint(dst, v as u64);
                Ok(())
            }
        },
        // reference kinds are handled above
        TypeKind::Pointer | TypeKind::Function(_) => unreachable!(),
    }
}

/// Decode a value of `ty` from `src` (at least `ty.native_size()` bytes)
pub(crate) fn decode(ty: &TypeDescriptor, src: &[u8]) -> FfiResult<Value> {
    if src.len() < ty.native_size() {
        return Err(FfiError::Decode(format!(
            "{} needs {} bytes, have {}",
            ty,
            ty.native_size(),
            src.len()
        )));
    }

    if let Some(func) = ty.as_function() {
        let addr = read_uint(&src[..POINTER_SIZE]) as usize;
        if addr == 0 {
            return Ok(Value::Null);
        }
        return func.to_function(ty.to_string(), addr).map(Value::Function);
    }

    if ty.is_reference() {
        let addr = read_uint(&src[..POINTER_SIZE]) as usize;
        return Ok(if addr == 0 {
            Value::Null
        } else {
            Value::Pointer(addr)
        });
    }

    match ty.kind() {
        TypeKind::Struct(desc) => Ok(Value::Struct(StructValue::from_bytes(
            Arc::clone(desc),
            &src[..desc.size()],
        ))),
        TypeKind::Primitive(prim) => {
            let size = prim.size();
            Ok(match prim {
                Primitive::Void => Value::Void,
                Primitive::CString => {
                    let addr = read_uint(&src[..POINTER_SIZE]) as usize;
                    match unsafe { read_cstring(addr) } {
                        Some(s) => Value::String(s),
                        None => Value::Null,
                    }
                }
                Primitive::Float => {
                    let mut b = [0u8; 4];
                    b.copy_from_slice(&src[..4]);
                    Value::Float(f32::from_ne_bytes(b) as f64)
                }
                Primitive::Double => {
                    let mut b = [0u8; 8];
                    b.copy_from_slice(&src[..8]);
                    Value::Float(f64::from_ne_bytes(b))
                }
                int => int_from_word(*int, read_uint(&src[..size])),
            })
        }
        TypeKind::Pointer | TypeKind::Function(_) => unreachable!(),
    }
}
