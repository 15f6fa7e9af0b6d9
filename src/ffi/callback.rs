//! Callback Trampoline
//!
//! Native code calls host functions through libffi closures. Every closure
//! jumps into one generic trampoline that decodes the native arguments, runs
//! the host function on the host thread and encodes its result.
//!
//! The host thread is whichever thread owns the `HostLoop`. An entry on that
//! thread runs in place. An entry from any other thread is posted to the
//! loop's mailbox and the native thread blocks until the host thread has run
//! it (see `HostLoop::turn`, `HostLoop::run_pending` and
//! `Completion::wait_on`).
//!
//! Host failures never unwind into native frames. Errors and panics are
//! queued on the loop's deferred error queue and the native caller sees a
//! zeroed result.

use std::ffi::c_void;
use std::marker::PhantomData;
use std::mem::size_of;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use libffi::raw;
use parking_lot::Mutex;
use tracing::{trace, warn};

use super::cif::{Abi, CallDescriptor};
use super::dispatch::is_widened;
use super::error::{FfiError, FfiResult, PrepFailure};
use super::types::{FunctionType, TypeDescriptor, POINTER_SIZE};
use super::value::{self, KeepAlive, Value};

/// Host function bound to a callback
pub type HostFn = dyn Fn(&[Value]) -> anyhow::Result<Value> + Send + Sync;

/// A callback entry waiting to run on the host thread
pub struct Invocation {
    name: String,
    job: Box<dyn FnOnce() + Send>,
}

impl Invocation {
    /// Name of the callback being entered
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Mailbox of the thread that runs host callbacks
///
/// Not `Send`: the loop stays on the thread that created it.
pub struct HostLoop {
    handle: HostHandle,
    invocations: Receiver<Invocation>,
    errors: Receiver<FfiError>,
    _not_send: PhantomData<*const ()>,
}

impl HostLoop {
    /// Create a loop owned by the current thread
    pub fn new() -> Self {
        let (tx, invocations) = unbounded();
        let (errors_tx, errors) = unbounded();
        Self {
            handle: HostHandle {
                thread: thread::current().id(),
                tx,
                errors: errors_tx,
            },
            invocations,
            errors,
            _not_send: PhantomData,
        }
    }

    /// Sendable handle callbacks use to reach this loop
    pub fn handle(&self) -> HostHandle {
        self.handle.clone()
    }

    pub(crate) fn invocations(&self) -> &Receiver<Invocation> {
        &self.invocations
    }

    pub(crate) fn run(&self, invocation: Invocation) {
        trace!(callback = %invocation.name, "running posted callback");
        (invocation.job)();
    }

    /// Run every callback already posted. Returns how many ran.
    pub fn run_pending(&self) -> usize {
        let mut count = 0;
        while let Ok(invocation) = self.invocations.try_recv() {
            self.run(invocation);
            count += 1;
        }
        count
    }

    /// Wait up to `timeout` for one posted callback and run it
    pub fn turn(&self, timeout: Duration) -> bool {
        match self.invocations.recv_timeout(timeout) {
            Ok(invocation) => {
                self.run(invocation);
                true
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => false,
        }
    }

    /// Drain the deferred error queue
    pub fn take_errors(&self) -> Vec<FfiError> {
        self.errors.try_iter().collect()
    }
}

impl Default for HostLoop {
    fn default() -> Self {
        Self::new()
    }
}

/// Cloneable, sendable reference to a `HostLoop`
#[derive(Clone)]
pub struct HostHandle {
    thread: ThreadId,
    tx: Sender<Invocation>,
    errors: Sender<FfiError>,
}

impl HostHandle {
    /// Whether the current thread owns the loop
    pub fn is_host_thread(&self) -> bool {
        thread::current().id() == self.thread
    }

    fn defer(&self, err: FfiError) {
        warn!(error = %err, "callback failed, result zeroed");
        if self.errors.send(err).is_err() {
            warn!("host loop is gone, dropping callback error");
        }
    }
}

struct CallbackCore {
    name: String,
    cif: Arc<CallDescriptor>,
    host_fn: Box<HostFn>,
    host: HostHandle,
    /// Strings or buffers referenced by the most recent returned pointer
    last_return: Mutex<KeepAlive>,
}

impl CallbackCore {
    fn run_host_fn(&self, args: &[Value]) -> FfiResult<Value> {
        match catch_unwind(AssertUnwindSafe(|| (self.host_fn)(args))) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(FfiError::Callback(format!("{}: {:#}", self.name, err))),
            Err(panic) => {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "panic".to_string());
                Err(FfiError::Callback(format!("{} panicked: {}", self.name, msg)))
            }
        }
    }

    /// Run the host function on the host thread, wherever we were entered
    fn enter(self: &Arc<Self>, args: Vec<Value>) -> FfiResult<Value> {
        if self.host.is_host_thread() {
            return self.run_host_fn(&args);
        }

        let (reply_tx, reply_rx) = bounded(1);
        let core = Arc::clone(self);
        let invocation = Invocation {
            name: self.name.clone(),
            job: Box::new(move || {
                let _ = reply_tx.send(core.run_host_fn(&args));
            }),
        };
        self.host
            .tx
            .send(invocation)
            .map_err(|_| FfiError::Callback(format!("{}: host loop is gone", self.name)))?;
        reply_rx.recv().unwrap_or_else(|_| {
            Err(FfiError::Callback(format!(
                "{}: host loop dropped the call",
                self.name
            )))
        })
    }
}

/// Bytes the trampoline may write into libffi's result buffer
fn result_size(ty: &TypeDescriptor) -> usize {
    if ty.is_void() {
        0
    } else if is_widened(ty) {
        POINTER_SIZE
    } else {
        ty.native_size()
    }
}

unsafe fn decode_args(cif: &CallDescriptor, args: *mut *mut c_void) -> FfiResult<Vec<Value>> {
    let types = cif.arg_types();
    let mut values = Vec::with_capacity(types.len());
    for (i, ty) in types.iter().enumerate() {
        let src = *args.add(i) as *const u8;
        let bytes = std::slice::from_raw_parts(src, ty.native_size());
        values.push(value::decode(ty, bytes)?);
    }
    Ok(values)
}

/// Encode a host result into libffi's result buffer
fn encode_result(
    ty: &TypeDescriptor,
    result: &Value,
    dst: &mut [u8],
    keep: &mut KeepAlive,
) -> Result<(), String> {
    let prim = match (is_widened(ty), ty.as_primitive()) {
        (true, Some(prim)) => prim,
        _ => return value::encode(ty, result, dst, keep),
    };

    // range-check at the declared width, then widen to a full register
    let mut narrow = [0u8; 8];
    value::encode(ty, result, &mut narrow[..prim.size()], keep)?;
    let word = match value::decode(ty, &narrow[..prim.size()]).map_err(|e| e.to_string())? {
        Value::Int(v) => v as usize,
        Value::UInt(v) => v as usize,
        Value::Bool(b) => b as usize,
        other => return Err(format!("unexpected {:?} for {}", other, ty)),
    };
    dst.copy_from_slice(&word.to_ne_bytes());
    Ok(())
}

unsafe extern "C" fn trampoline(
    _cif: *mut raw::ffi_cif,
    ret: *mut c_void,
    args: *mut *mut c_void,
    userdata: *mut c_void,
) {
    let core = &*(userdata as *const CallbackCore);
    let ret_ty = core.cif.return_type();
    let size = result_size(ret_ty);
    let dst: &mut [u8] = if size == 0 || ret.is_null() {
        &mut []
    } else {
        std::slice::from_raw_parts_mut(ret as *mut u8, size)
    };

    // Arc handle borrowed from the closure's userdata without taking ownership
    Arc::increment_strong_count(userdata as *const CallbackCore);
    let core_arc = Arc::from_raw(userdata as *const CallbackCore);

    let outcome = catch_unwind(AssertUnwindSafe(|| -> FfiResult<()> {
        let values = decode_args(&core.cif, args)?;
        let result = core_arc.enter(values)?;
        if size == 0 {
            return Ok(());
        }
        let mut keep = KeepAlive::default();
        encode_result(ret_ty, &result, dst, &mut keep)
            .map_err(|reason| FfiError::Callback(format!("{}: bad result: {}", core.name, reason)))?;
        *core.last_return.lock() = keep;
        Ok(())
    }));

    let err = match outcome {
        Ok(Ok(())) => return,
        Ok(Err(err)) => err,
        Err(_) => FfiError::Callback(format!("{}: trampoline panicked", core.name)),
    };
    if size > 0 && !ret.is_null() {
        ptr::write_bytes(ret as *mut u8, 0, size);
    }
    core.host.defer(err);
}

/// A native-callable function pointer bound to a host function
///
/// The code address stays valid until the callback is dropped.
pub struct Callback {
    closure: *mut raw::ffi_closure,
    code: usize,
    userdata: *const CallbackCore,
    core: Arc<CallbackCore>,
    ty: TypeDescriptor,
}

// Safety: the closure is immutable after preparation and the core it
// dispatches into is Send + Sync.
unsafe impl Send for Callback {}
unsafe impl Sync for Callback {}

impl Callback {
    /// Create a callback with the given native signature
    pub fn new<F>(
        name: impl Into<String>,
        return_type: TypeDescriptor,
        arg_types: Vec<TypeDescriptor>,
        abi: Abi,
        host: HostHandle,
        host_fn: F,
    ) -> FfiResult<Self>
    where
        F: Fn(&[Value]) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        let func = Arc::new(FunctionType::new(return_type, arg_types, abi));
        Self::with_type(name, func, host, host_fn)
    }

    /// Create a callback for an existing function pointer type
    pub fn with_type<F>(
        name: impl Into<String>,
        func: Arc<FunctionType>,
        host: HostHandle,
        host_fn: F,
    ) -> FfiResult<Self>
    where
        F: Fn(&[Value]) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        let cif = func.call_descriptor()?;
        let ty = TypeDescriptor::function(func);
        let core = Arc::new(CallbackCore {
            name: name.into(),
            cif,
            host_fn: Box::new(host_fn),
            host,
            last_return: Mutex::new(KeepAlive::default()),
        });

        let mut code: *mut c_void = ptr::null_mut();
        let closure = unsafe {
            raw::ffi_closure_alloc(size_of::<raw::ffi_closure>(), &mut code)
        } as *mut raw::ffi_closure;
        if closure.is_null() {
            return Err(FfiError::Callback("ffi_closure_alloc failed".to_string()));
        }

        let userdata = Arc::into_raw(Arc::clone(&core));
        let status = unsafe {
            raw::ffi_prep_closure_loc(
                closure,
                core.cif.as_raw_ptr(),
                Some(trampoline),
                userdata as *mut c_void,
                code,
            )
        } as u32;
        if status != 0 {
            unsafe {
                raw::ffi_closure_free(closure as *mut c_void);
                drop(Arc::from_raw(userdata));
            }
            return Err(FfiError::AbiPreparation {
                status,
                reason: PrepFailure::from_status(status),
            });
        }

        trace!(callback = %core.name, signature = %core.cif, "closure prepared");
        Ok(Self {
            closure,
            code: code as usize,
            userdata,
            core,
            ty,
        })
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Executable address native code calls
    pub fn address(&self) -> usize {
        self.code
    }

    /// The callback as a pointer argument
    pub fn as_value(&self) -> Value {
        Value::Pointer(self.code)
    }

    pub fn descriptor(&self) -> &Arc<CallDescriptor> {
        &self.core.cif
    }

    /// Function-pointer type of this callback
    pub fn type_descriptor(&self) -> &TypeDescriptor {
        &self.ty
    }
}

impl From<&Callback> for Value {
    fn from(cb: &Callback) -> Self {
        cb.as_value()
    }
}

impl Drop for Callback {
    fn drop(&mut self) {
        unsafe {
            raw::ffi_closure_free(self.closure as *mut c_void);
            drop(Arc::from_raw(self.userdata));
        }
    }
}
