//! Call Interface Builder
//!
//! Turns a return type and ordered argument types into a prepared libffi
//! `ffi_cif`. A `CallDescriptor` owns the cif together with every `ffi_type`
//! it points at, so it can be shared freely once built.

use std::fmt;
use std::os::raw::c_uint;
use std::ptr::{self, addr_of_mut};

use libffi::raw;
use tracing::debug;

use super::error::{FfiError, FfiResult, PrepFailure};
use super::types::{Primitive, TypeDescriptor, TypeKind, POINTER_SIZE};

/// A native calling convention
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Abi(pub raw::ffi_abi);

impl Abi {
    /// The platform default calling convention
    pub const DEFAULT: Abi = Abi(raw::ffi_abi_FFI_DEFAULT_ABI);

    /// Wrap a raw libffi ABI value without validation
    pub fn from_raw(value: raw::ffi_abi) -> Self {
        Abi(value)
    }

    pub fn raw(&self) -> raw::ffi_abi {
        self.0
    }
}

impl Default for Abi {
    fn default() -> Self {
        Abi::DEFAULT
    }
}

/// An aggregate `ffi_type` and the element list it points into
struct OwnedType {
    ty: Box<raw::ffi_type>,
    _elements: Vec<*mut raw::ffi_type>,
}

fn primitive_type(prim: Primitive) -> *mut raw::ffi_type {
    unsafe {
        match prim {
            Primitive::Void => addr_of_mut!(raw::ffi_type_void),
            Primitive::Bool | Primitive::UInt8 => addr_of_mut!(raw::ffi_type_uint8),
            Primitive::Int8 => addr_of_mut!(raw::ffi_type_sint8),
            Primitive::UInt16 => addr_of_mut!(raw::ffi_type_uint16),
            Primitive::Int16 => addr_of_mut!(raw::ffi_type_sint16),
            Primitive::UInt32 => addr_of_mut!(raw::ffi_type_uint32),
            Primitive::Int32 => addr_of_mut!(raw::ffi_type_sint32),
            Primitive::UInt64 => addr_of_mut!(raw::ffi_type_uint64),
            Primitive::Int64 => addr_of_mut!(raw::ffi_type_sint64),
            Primitive::Float => addr_of_mut!(raw::ffi_type_float),
            Primitive::Double => addr_of_mut!(raw::ffi_type_double),
            Primitive::CString => addr_of_mut!(raw::ffi_type_pointer),
            Primitive::SizeT if POINTER_SIZE == 8 => addr_of_mut!(raw::ffi_type_uint64),
            Primitive::SizeT => addr_of_mut!(raw::ffi_type_uint32),
            Primitive::SSizeT if POINTER_SIZE == 8 => addr_of_mut!(raw::ffi_type_sint64),
            Primitive::SSizeT => addr_of_mut!(raw::ffi_type_sint32),
        }
    }
}

/// `ffi_prep_cif` status for an unrepresentable type
const FFI_BAD_TYPEDEF: u32 = 1;

/// Build (or borrow) the libffi type for `ty`, keeping aggregates in `owned`
fn ffi_type_for(ty: &TypeDescriptor, owned: &mut Vec<OwnedType>) -> FfiResult<*mut raw::ffi_type> {
    if ty.is_reference() {
        return Ok(unsafe { addr_of_mut!(raw::ffi_type_pointer) });
    }
    match ty.kind() {
        TypeKind::Primitive(prim) => Ok(primitive_type(*prim)),
        TypeKind::Struct(desc) => {
            // libffi has no packed aggregates. A packed struct laid out exactly
            // like its unpacked form is described as that; any other packed
            // struct cannot be passed by value.
            if desc.is_packed() && !desc.is_naturally_aligned() {
                debug!(ty = %ty, "packed struct with misaligned fields passed by value");
                return Err(FfiError::AbiPreparation {
                    status: FFI_BAD_TYPEDEF,
                    reason: PrepFailure::BadTypedef,
                });
            }

            let mut elements: Vec<*mut raw::ffi_type> = Vec::new();
            for field in desc.fields() {
                let element = ffi_type_for(&field.ty, owned)?;
                elements.extend(std::iter::repeat(element).take(field.slots()));
            }
            elements.push(ptr::null_mut());

            // size and alignment are left zero for ffi_prep_cif to compute
            let mut aggregate: Box<raw::ffi_type> = Box::new(unsafe { std::mem::zeroed() });
            aggregate.type_ = raw::FFI_TYPE_STRUCT as _;
            aggregate.elements = elements.as_mut_ptr();
            let ptr: *mut raw::ffi_type = &mut *aggregate;
            owned.push(OwnedType {
                ty: aggregate,
                _elements: elements,
            });
            Ok(ptr)
        }
        TypeKind::Pointer | TypeKind::Function(_) => Ok(unsafe { addr_of_mut!(raw::ffi_type_pointer) }),
    }
}

/// A prepared call interface
pub struct CallDescriptor {
    cif: Box<raw::ffi_cif>,
    _arg_ptrs: Vec<*mut raw::ffi_type>,
    _owned: Vec<OwnedType>,
    return_type: TypeDescriptor,
    arg_types: Vec<TypeDescriptor>,
    abi: Abi,
    fixed_args: Option<usize>,
}

// Safety: the cif and its types are written once by ffi_prep_cif and only
// read afterwards, by ffi_call and by closures.
unsafe impl Send for CallDescriptor {}
unsafe impl Sync for CallDescriptor {}

impl CallDescriptor {
    /// Prepare a fixed-arity call interface
    pub fn new(
        return_type: TypeDescriptor,
        arg_types: Vec<TypeDescriptor>,
        abi: Abi,
    ) -> FfiResult<Self> {
        Self::prepare(return_type, arg_types, abi, None)
    }

    /// Prepare a variadic call interface whose first `fixed_args` are named
    pub fn variadic(
        return_type: TypeDescriptor,
        arg_types: Vec<TypeDescriptor>,
        fixed_args: usize,
        abi: Abi,
    ) -> FfiResult<Self> {
        if fixed_args < 1 || arg_types.len() < fixed_args {
            return Err(FfiError::InvalidArity {
                fixed: fixed_args,
                total: arg_types.len(),
            });
        }
        Self::prepare(return_type, arg_types, abi, Some(fixed_args))
    }

    fn prepare(
        return_type: TypeDescriptor,
        arg_types: Vec<TypeDescriptor>,
        abi: Abi,
        fixed_args: Option<usize>,
    ) -> FfiResult<Self> {
        let mut owned = Vec::new();
        let rtype = ffi_type_for(&return_type, &mut owned)?;
        let mut arg_ptrs = arg_types
            .iter()
            .map(|ty| ffi_type_for(ty, &mut owned))
            .collect::<FfiResult<Vec<*mut raw::ffi_type>>>()?;
        let atypes = if arg_ptrs.is_empty() {
            ptr::null_mut()
        } else {
            arg_ptrs.as_mut_ptr()
        };

        let mut cif: Box<raw::ffi_cif> = Box::new(unsafe { std::mem::zeroed() });
        let nargs = arg_types.len() as c_uint;
        let status = unsafe {
            match fixed_args {
                None => raw::ffi_prep_cif(&mut *cif, abi.0, nargs, rtype, atypes),
                Some(fixed) => raw::ffi_prep_cif_var(
                    &mut *cif,
                    abi.0,
                    fixed as c_uint,
                    nargs,
                    rtype,
                    atypes,
                ),
            }
        } as u32;

        if status != 0 {
            let reason = PrepFailure::from_status(status);
            debug!(status, %reason, ret = %return_type, nargs, "ffi_prep_cif rejected signature");
            return Err(FfiError::AbiPreparation { status, reason });
        }

        debug!(ret = %return_type, nargs, variadic = fixed_args.is_some(), "prepared call interface");
        Ok(Self {
            cif,
            _arg_ptrs: arg_ptrs,
            _owned: owned,
            return_type,
            arg_types,
            abi,
            fixed_args,
        })
    }

    pub fn return_type(&self) -> &TypeDescriptor {
        &self.return_type
    }

    pub fn arg_types(&self) -> &[TypeDescriptor] {
        &self.arg_types
    }

    pub fn abi(&self) -> Abi {
        self.abi
    }

    /// Named argument count of a variadic interface
    pub fn fixed_args(&self) -> Option<usize> {
        self.fixed_args
    }

    pub fn is_variadic(&self) -> bool {
        self.fixed_args.is_some()
    }

    pub(crate) fn as_raw_ptr(&self) -> *mut raw::ffi_cif {
        &*self.cif as *const raw::ffi_cif as *mut raw::ffi_cif
    }
}

impl fmt::Debug for CallDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallDescriptor")
            .field("return_type", &self.return_type.to_string())
            .field(
                "arg_types",
                &self.arg_types.iter().map(|t| t.to_string()).collect::<Vec<_>>(),
            )
            .field("abi", &self.abi)
            .field("fixed_args", &self.fixed_args)
            .finish()
    }
}

impl fmt::Display for CallDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (", self.return_type)?;
        for (i, arg) in self.arg_types.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            if Some(i) == self.fixed_args {
                write!(f, "... ")?;
            }
            write!(f, "{}", arg)?;
        }
        write!(f, ")")
    }
}
