//! Binding surface
//!
//! Declarative function tables: a list of `BindingSpec`s is resolved against
//! one library into a `Library` of callable bindings.

use std::collections::HashMap;
use std::sync::Arc;

use super::cif::Abi;
use super::dispatch::{AsyncFunction, Completion, ForeignFunction};
use super::error::{FfiError, FfiResult};
use super::loader::DynamicLibrary;
use super::types::TypeSpec;
use super::value::Value;
use super::variadic::VariadicFunction;

/// Per-binding options
#[derive(Debug, Clone, Default)]
pub struct BindOptions {
    /// Calling convention; the context default when `None`
    pub abi: Option<Abi>,
    /// Calls run on the worker pool
    pub is_async: bool,
    /// The function takes `...` after its named parameters
    pub varargs: bool,
}

/// One function to bind: symbol name and signature
#[derive(Debug, Clone)]
pub struct BindingSpec {
    pub symbol: String,
    pub ret: TypeSpec,
    pub args: Vec<TypeSpec>,
    pub options: BindOptions,
}

impl BindingSpec {
    pub fn new<R, I, S>(symbol: impl Into<String>, ret: R, args: I) -> Self
    where
        R: Into<TypeSpec>,
        I: IntoIterator<Item = S>,
        S: Into<TypeSpec>,
    {
        Self {
            symbol: symbol.into(),
            ret: ret.into(),
            args: args.into_iter().map(Into::into).collect(),
            options: BindOptions::default(),
        }
    }

    pub fn with_abi(mut self, abi: Abi) -> Self {
        self.options.abi = Some(abi);
        self
    }

    pub fn asynchronous(mut self) -> Self {
        self.options.is_async = true;
        self
    }

    /// Mark the function variadic; `args` are then the named parameters
    pub fn variadic(mut self) -> Self {
        self.options.varargs = true;
        self
    }
}

/// A bound function in one of its three calling forms
#[derive(Clone)]
pub enum Binding {
    Sync(ForeignFunction),
    Async(AsyncFunction),
    Variadic(VariadicFunction),
}

impl Binding {
    pub fn name(&self) -> &str {
        match self {
            Binding::Sync(f) => f.name(),
            Binding::Async(f) => f.function().name(),
            Binding::Variadic(f) => f.name(),
        }
    }

    pub fn address(&self) -> usize {
        match self {
            Binding::Sync(f) => f.address(),
            Binding::Async(f) => f.function().address(),
            Binding::Variadic(f) => f.address(),
        }
    }
}

/// A loaded library together with its bound functions
pub struct Library {
    handle: Arc<DynamicLibrary>,
    bindings: HashMap<String, Binding>,
}

impl Library {
    pub(crate) fn new(handle: Arc<DynamicLibrary>, bindings: HashMap<String, Binding>) -> Self {
        Self { handle, bindings }
    }

    pub fn handle(&self) -> &Arc<DynamicLibrary> {
        &self.handle
    }

    /// Look up a binding by symbol name
    pub fn get(&self, symbol: &str) -> FfiResult<&Binding> {
        self.bindings
            .get(symbol)
            .ok_or_else(|| FfiError::UnknownBinding(symbol.to_string()))
    }

    /// A synchronous binding
    pub fn function(&self, symbol: &str) -> FfiResult<&ForeignFunction> {
        match self.get(symbol)? {
            Binding::Sync(f) => Ok(f),
            Binding::Async(f) => Ok(f.function()),
            Binding::Variadic(_) => Err(FfiError::Dispatch(format!(
                "`{}` is variadic, use `variadic()`",
                symbol
            ))),
        }
    }

    /// A variadic binding
    pub fn variadic(&self, symbol: &str) -> FfiResult<&VariadicFunction> {
        match self.get(symbol)? {
            Binding::Variadic(f) => Ok(f),
            _ => Err(FfiError::Dispatch(format!("`{}` is not variadic", symbol))),
        }
    }

    /// Call a fixed-arity binding on the current thread
    pub fn call(&self, symbol: &str, args: &[Value]) -> FfiResult<Value> {
        self.function(symbol)?.call(args)
    }

    /// Call an async binding on the worker pool
    pub fn call_async(&self, symbol: &str, args: &[Value]) -> FfiResult<Completion> {
        match self.get(symbol)? {
            Binding::Async(f) => Ok(f.call(args)),
            _ => Err(FfiError::Dispatch(format!("`{}` is not async", symbol))),
        }
    }

    /// Bound symbol names, sorted
    pub fn symbols(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.bindings.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}
