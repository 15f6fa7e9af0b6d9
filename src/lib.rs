//! dynffi - Dynamic Foreign Function Runtime
//!
//! Describe native data layouts and function signatures at run time, load
//! native modules and call into them without compile-time bindings. Native
//! code can call back into host closures through generated trampolines.
//!
//! # Features
//!
//! - **Type algebra**: primitive, pointer, struct and function types with
//!   explicit indirection levels and a name-based coercion grammar
//! - **Struct layouts**: C field offsets, natural or packed, inline arrays
//! - **Call interfaces**: libffi CIFs for fixed and variadic signatures
//! - **Dispatch**: synchronous calls or async calls on a worker pool
//! - **Callbacks**: libffi closures that run host closures on the host thread
//! - **Library loading**: libloading with linker-script redirection
//!
//! # Example
//!
//! ```no_run
//! use dynffi::ffi::{FfiContext, Value};
//!
//! let ctx = FfiContext::new().unwrap();
//! let libc = ctx.open_self().unwrap();
//! let strlen = ctx.function(&libc, "strlen", "size_t", ["CString"]).unwrap();
//! assert_eq!(strlen.call(&[Value::from("hello")]).unwrap(), Value::UInt(5));
//! ```

#![allow(missing_docs)]

pub mod config;
pub mod ffi;
pub mod keylite;

pub use config::{ConfigError, DynffiConfig};
pub use ffi::{FfiContext, FfiError, FfiResult, StructDef, TypeDescriptor, Value};
