//! Dynamic FFI runtime
//!
//! Describes native types, struct layouts and function signatures at run
//! time and calls native functions through them, in both directions.
//!
//! # Architecture
//!
//! ```text
//! BindingSpec (symbol + type specs)
//!       │
//!       ▼
//! TypeRegistry::coerce ──► StructDef layouts
//!       │
//!       ▼
//! CallDescriptor (ffi_prep_cif / ffi_prep_cif_var)
//!       │                     ▲
//!       ▼                     │ VariadicCache (per vararg type set)
//! DynamicLibrary::get (libloading, linker-script redirects)
//!       │
//!       ▼
//! ForeignFunction::call ─── sync on the caller / async on the WorkerPool
//!
//! native ──► Callback trampoline ──► HostLoop ──► host closure
//! ```
//!
//! Function pointer types (`FfiContext::function_type`) sit between the two
//! directions: a pointer read through one decodes to a callable
//! `ForeignFunction`, and `FunctionType::to_callback` produces one from a
//! host closure. `errno()` reports what the last native call left behind.
//!
//! # Example
//!
//! ```ignore
//! let ctx = FfiContext::new()?;
//! let libc = ctx.open_self()?;
//! let abs = ctx.function(&libc, "abs", "int", ["int"])?;
//! assert_eq!(abs.call(&[Value::from(-5)])?, Value::Int(5));
//! ```

mod binding;
mod callback;
mod cif;
mod context;
mod dispatch;
mod error;
mod layout;
mod loader;
mod registry;
mod types;
mod value;
mod variadic;

pub use binding::{BindOptions, Binding, BindingSpec, Library};
pub use callback::{Callback, HostFn, HostHandle, HostLoop, Invocation};
pub use cif::{Abi, CallDescriptor};
pub use context::FfiContext;
pub use dispatch::{errno, AsyncFunction, CallFrame, Completion, ForeignFunction, WorkerPool};
pub use error::{FfiError, FfiResult, PrepFailure};
pub use layout::{FieldDescriptor, StructDef, StructDescriptor, StructValue};
pub use loader::{
    library_filename, parse_linker_script, redirect_target, DynamicLibrary, LibraryLoader,
    OpenMode, MAX_REDIRECTS,
};
pub use registry::{TypeId, TypeRegistry};
pub use types::{
    FunctionType, Primitive, TypeDescriptor, TypeKind, TypeSpec, POINTER_ALIGN, POINTER_SIZE,
};
pub use value::{read_bytes, read_cstring, read_value, write_value, NativeBuffer, Value};
pub use variadic::{VariadicCache, VariadicFunction, VariadicKey, DEFAULT_CAPACITY};

#[cfg(test)]
mod tests;
