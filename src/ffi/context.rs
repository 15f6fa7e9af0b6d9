//! Runtime context
//!
//! `FfiContext` ties the pieces together: the type registry, the variadic
//! cache, the worker pool, the host loop for callbacks and every library
//! opened through it. Dropping or closing the context releases them.
//!
//! The context owns the `HostLoop`, so it lives on the host thread.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::binding::{Binding, BindingSpec, Library};
use super::callback::{Callback, HostLoop};
use super::cif::{Abi, CallDescriptor};
use super::dispatch::{AsyncFunction, ForeignFunction, WorkerPool};
use super::error::FfiResult;
use super::loader::{DynamicLibrary, LibraryLoader};
use super::registry::TypeRegistry;
use super::types::{TypeDescriptor, TypeSpec};
use super::value::Value;
use super::variadic::{VariadicCache, VariadicFunction};
use crate::config::DynffiConfig;

pub struct FfiContext {
    config: DynffiConfig,
    registry: Arc<TypeRegistry>,
    variadic: Arc<VariadicCache>,
    pool: Arc<WorkerPool>,
    host: HostLoop,
    loader: LibraryLoader,
    libraries: Mutex<Vec<Arc<DynamicLibrary>>>,
}

impl FfiContext {
    /// Context with default configuration
    pub fn new() -> FfiResult<Self> {
        Self::with_config(DynffiConfig::default())
    }

    pub fn with_config(config: DynffiConfig) -> FfiResult<Self> {
        let pool = WorkerPool::new(config.dispatch.workers)?;
        let loader = LibraryLoader::with_paths(
            &config.loader.search_paths,
            config.loader.open_mode(),
        );
        debug!(
            workers = pool.size(),
            variadic_capacity = config.variadic.capacity,
            "ffi context ready"
        );
        Ok(Self {
            registry: Arc::new(TypeRegistry::new()),
            variadic: Arc::new(VariadicCache::new(config.variadic.capacity)),
            pool: Arc::new(pool),
            host: HostLoop::new(),
            loader,
            libraries: Mutex::new(Vec::new()),
            config,
        })
    }

    pub fn config(&self) -> &DynffiConfig {
        &self.config
    }

    /// Calling convention used when none is given
    pub fn default_abi(&self) -> Abi {
        self.config.abi.abi()
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    pub fn host(&self) -> &HostLoop {
        &self.host
    }

    pub fn variadic_cache(&self) -> &Arc<VariadicCache> {
        &self.variadic
    }

    pub fn worker_pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    // Types

    pub fn coerce(&self, spec: impl Into<TypeSpec>) -> FfiResult<TypeDescriptor> {
        self.registry.coerce(spec)
    }

    pub fn ref_type(&self, spec: impl Into<TypeSpec>) -> FfiResult<TypeDescriptor> {
        self.registry.ref_type(spec)
    }

    pub fn deref_type(&self, spec: impl Into<TypeSpec>) -> FfiResult<TypeDescriptor> {
        self.registry.deref_type(spec)
    }

    /// Function pointer type. Values read through it are callable, and
    /// `FunctionType::to_callback` turns a closure into one.
    pub fn function_type<R, I, S>(
        &self,
        ret: R,
        args: I,
        abi: Option<Abi>,
    ) -> FfiResult<TypeDescriptor>
    where
        R: Into<TypeSpec>,
        I: IntoIterator<Item = S>,
        S: Into<TypeSpec>,
    {
        self.registry
            .function_type(ret, args, abi.unwrap_or_else(|| self.default_abi()))
    }

    /// Register a named type (usually a struct) for use in type specs
    pub fn register(&self, name: &str, ty: TypeDescriptor) -> TypeDescriptor {
        self.registry.register(name, ty)
    }

    // Call interfaces

    pub fn build_cif<R, I, S>(&self, ret: R, args: I, abi: Option<Abi>) -> FfiResult<CallDescriptor>
    where
        R: Into<TypeSpec>,
        I: IntoIterator<Item = S>,
        S: Into<TypeSpec>,
    {
        let ret = self.registry.coerce(ret)?;
        let args = self.registry.coerce_all(args)?;
        CallDescriptor::new(ret, args, abi.unwrap_or_else(|| self.default_abi()))
    }

    pub fn build_variadic_cif<R, I, S>(
        &self,
        ret: R,
        args: I,
        fixed: usize,
        abi: Option<Abi>,
    ) -> FfiResult<CallDescriptor>
    where
        R: Into<TypeSpec>,
        I: IntoIterator<Item = S>,
        S: Into<TypeSpec>,
    {
        let ret = self.registry.coerce(ret)?;
        let args = self.registry.coerce_all(args)?;
        CallDescriptor::variadic(ret, args, fixed, abi.unwrap_or_else(|| self.default_abi()))
    }

    // Libraries

    fn track(&self, library: DynamicLibrary) -> Arc<DynamicLibrary> {
        let library = Arc::new(library);
        self.libraries.lock().push(Arc::clone(&library));
        library
    }

    /// Open a library by path or short name
    pub fn open(&self, name: impl AsRef<Path>) -> FfiResult<Arc<DynamicLibrary>> {
        let name = name.as_ref().to_string_lossy();
        let library = self.loader.open(&name)?;
        Ok(self.track(library))
    }

    /// Handle on the running program, for symbols such as libc's
    pub fn open_self(&self) -> FfiResult<Arc<DynamicLibrary>> {
        let library = DynamicLibrary::open_self()?;
        Ok(self.track(library))
    }

    /// Resolve `symbol` in `library` and bind it to a signature
    pub fn function<R, I, S>(
        &self,
        library: &DynamicLibrary,
        symbol: &str,
        ret: R,
        args: I,
    ) -> FfiResult<ForeignFunction>
    where
        R: Into<TypeSpec>,
        I: IntoIterator<Item = S>,
        S: Into<TypeSpec>,
    {
        let cif = self.build_cif(ret, args, None)?;
        let code = library.get(symbol)?;
        ForeignFunction::new(symbol, code, Arc::new(cif))
    }

    /// Bind one spec against an open library
    pub fn bind_spec(&self, library: &DynamicLibrary, spec: &BindingSpec) -> FfiResult<Binding> {
        let abi = spec.options.abi.unwrap_or_else(|| self.default_abi());
        let ret = self.registry.coerce(spec.ret.clone())?;
        let args = self.registry.coerce_all(spec.args.iter().cloned())?;

        if spec.options.varargs {
            let code = library.get(&spec.symbol)?;
            return Ok(Binding::Variadic(VariadicFunction::new(
                spec.symbol.clone(),
                code,
                ret,
                args,
                abi,
                Arc::clone(&self.registry),
                Arc::clone(&self.variadic),
            )));
        }

        let cif = Arc::new(CallDescriptor::new(ret, args, abi)?);
        let code = library.get(&spec.symbol)?;
        let function = ForeignFunction::new(spec.symbol.clone(), code, cif)?;
        Ok(if spec.options.is_async {
            Binding::Async(AsyncFunction::new(function, Arc::clone(&self.pool)))
        } else {
            Binding::Sync(function)
        })
    }

    /// Open `path` and bind every spec. The first failure aborts the bind.
    pub fn bind(&self, path: impl AsRef<Path>, specs: &[BindingSpec]) -> FfiResult<Library> {
        let handle = self.open(path)?;
        let mut bindings = HashMap::with_capacity(specs.len());
        for spec in specs {
            let binding = self.bind_spec(&handle, spec)?;
            bindings.insert(spec.symbol.clone(), binding);
        }
        info!(path = %handle.path().display(), count = bindings.len(), "bound library");
        Ok(Library::new(handle, bindings))
    }

    // Callbacks

    /// Create a native-callable function pointer running `f` on this
    /// context's host thread
    pub fn callback<R, I, S, F>(
        &self,
        name: &str,
        ret: R,
        args: I,
        f: F,
        abi: Option<Abi>,
    ) -> FfiResult<Callback>
    where
        R: Into<TypeSpec>,
        I: IntoIterator<Item = S>,
        S: Into<TypeSpec>,
        F: Fn(&[Value]) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        let ret = self.registry.coerce(ret)?;
        let args = self.registry.coerce_all(args)?;
        Callback::new(
            name,
            ret,
            args,
            abi.unwrap_or_else(|| self.default_abi()),
            self.host.handle(),
            f,
        )
    }

    /// Release every library opened through this context. Functions bound
    /// from them must not be called afterwards.
    pub fn close(self) {
        self.close_libraries();
    }

    fn close_libraries(&self) {
        for library in self.libraries.lock().drain(..) {
            if let Err(err) = library.close() {
                warn!(error = %err, "failed to close library");
            }
        }
    }
}

impl Drop for FfiContext {
    fn drop(&mut self) {
        self.close_libraries();
        let errors = self.host.take_errors();
        if !errors.is_empty() {
            warn!(count = errors.len(), "dropping unread callback errors");
        }
    }
}
