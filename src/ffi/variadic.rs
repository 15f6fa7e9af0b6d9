//! Variadic Dispatch Cache
//!
//! A variadic function needs a call interface per combination of supplied
//! argument types. Interfaces are built on first use and reused afterwards.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::cif::{Abi, CallDescriptor};
use super::dispatch::ForeignFunction;
use super::error::FfiResult;
use super::registry::{TypeId, TypeRegistry};
use super::types::{TypeDescriptor, TypeSpec};
use super::value::Value;

/// Default number of cached interfaces
pub const DEFAULT_CAPACITY: usize = 1024;

/// Cache key: every type identity of a specialization plus its ABI
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VariadicKey {
    pub return_type: TypeId,
    pub fixed: Vec<TypeId>,
    pub varargs: Vec<TypeId>,
    pub abi: Abi,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<VariadicKey, Arc<CallDescriptor>>,
    /// Insertion order, oldest first
    order: VecDeque<VariadicKey>,
}

/// Shared cache of prepared variadic interfaces
///
/// Bounded with FIFO eviction; a capacity of 0 means unbounded. An evicted
/// interface stays alive as long as a specialized function holds it.
pub struct VariadicCache {
    inner: Mutex<CacheInner>,
    capacity: usize,
    builds: AtomicU64,
}

impl VariadicCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            capacity,
            builds: AtomicU64::new(0),
        }
    }

    /// Return the cached interface for `key`, building it with `build` on a miss
    pub fn get_or_build<F>(&self, key: VariadicKey, build: F) -> FfiResult<Arc<CallDescriptor>>
    where
        F: FnOnce() -> FfiResult<CallDescriptor>,
    {
        let mut inner = self.inner.lock();
        if let Some(cif) = inner.entries.get(&key) {
            return Ok(Arc::clone(cif));
        }

        let cif = Arc::new(build()?);
        self.builds.fetch_add(1, Ordering::Relaxed);
        debug!(signature = %cif, cached = inner.entries.len() + 1, "variadic cache miss");

        if self.capacity > 0 {
            while inner.entries.len() >= self.capacity {
                match inner.order.pop_front() {
                    Some(oldest) => {
                        inner.entries.remove(&oldest);
                    }
                    None => break,
                }
            }
        }
        inner.order.push_back(key.clone());
        inner.entries.insert(key, Arc::clone(&cif));
        Ok(cif)
    }

    /// Interfaces built so far (misses)
    pub fn builds(&self) -> u64 {
        self.builds.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.order.clear();
    }
}

impl Default for VariadicCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// A variadic native function, specialized per call
#[derive(Clone)]
pub struct VariadicFunction {
    name: String,
    code: usize,
    return_type: TypeDescriptor,
    fixed: Vec<TypeDescriptor>,
    abi: Abi,
    registry: Arc<TypeRegistry>,
    cache: Arc<VariadicCache>,
}

impl VariadicFunction {
    pub fn new(
        name: impl Into<String>,
        code: usize,
        return_type: TypeDescriptor,
        fixed: Vec<TypeDescriptor>,
        abi: Abi,
        registry: Arc<TypeRegistry>,
        cache: Arc<VariadicCache>,
    ) -> Self {
        Self {
            name: name.into(),
            code,
            return_type,
            fixed,
            abi,
            registry,
            cache,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> usize {
        self.code
    }

    /// Named parameter types
    pub fn fixed_types(&self) -> &[TypeDescriptor] {
        &self.fixed
    }

    /// Bind the function to one set of variadic argument types
    pub fn specialize<I, S>(&self, varargs: I) -> FfiResult<ForeignFunction>
    where
        I: IntoIterator<Item = S>,
        S: Into<TypeSpec>,
    {
        let varargs = self.registry.coerce_all(varargs)?;
        let key = VariadicKey {
            return_type: self.registry.identity(&self.return_type),
            fixed: self.fixed.iter().map(|t| self.registry.identity(t)).collect(),
            varargs: varargs.iter().map(|t| self.registry.identity(t)).collect(),
            abi: self.abi,
        };

        let cif = self.cache.get_or_build(key, || {
            let mut all = self.fixed.clone();
            all.extend(varargs.iter().cloned());
            CallDescriptor::variadic(self.return_type.clone(), all, self.fixed.len(), self.abi)
        })?;
        ForeignFunction::new(self.name.clone(), self.code, cif)
    }

    /// Specialize for `varargs` and call with `args` (fixed then variadic)
    pub fn call<I, S>(&self, varargs: I, args: &[Value]) -> FfiResult<Value>
    where
        I: IntoIterator<Item = S>,
        S: Into<TypeSpec>,
    {
        self.specialize(varargs)?.call(args)
    }
}
