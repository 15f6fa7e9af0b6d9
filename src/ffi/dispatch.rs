//! Dispatcher
//!
//! Marshals host values into a call frame, invokes a native function through
//! a prepared call interface and decodes the result. Asynchronous calls are
//! marshalled on the caller's thread and executed by a worker pool; the
//! outcome arrives exactly once through a `Completion`.
//!
//! The C `errno` is sampled right after every native call and kept per
//! thread; read it with [`errno`]. A completion carries the worker's value
//! back to the thread that waits on it.

use std::cell::Cell;
use std::ffi::c_void;
use std::fmt;
use std::mem::size_of;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};
use libffi::raw;
use tracing::{trace, warn};

use super::callback::HostLoop;
use super::cif::CallDescriptor;
use super::error::{FfiError, FfiResult};
use super::types::{TypeDescriptor, POINTER_SIZE};
use super::value::{self, KeepAlive, Value};

/// Minimum result buffer: libffi widens small integer returns to a register
const MIN_RESULT_SIZE: usize = size_of::<u64>();

thread_local! {
    static LAST_ERRNO: Cell<i32> = const { Cell::new(0) };
}

/// `errno` as left by the last native call made (or waited on) by this thread
pub fn errno() -> i32 {
    LAST_ERRNO.with(Cell::get)
}

fn set_errno(value: i32) {
    LAST_ERRNO.with(|cell| cell.set(value));
}

/// Per-invocation argument storage
pub struct CallFrame {
    cif: Arc<CallDescriptor>,
    /// One 8-byte aligned slot per argument
    slots: Vec<Box<[u64]>>,
    arg_ptrs: Vec<*mut c_void>,
    result: Box<[u64]>,
    /// Strings and buffers whose addresses were written into `slots`
    _keep: KeepAlive,
}

// Safety: the raw pointers point into `slots` and `_keep`, which move with
// the frame.
unsafe impl Send for CallFrame {}

impl CallFrame {
    /// Encode `args` for `cif`. Fails before any native call is made.
    pub fn marshal(cif: Arc<CallDescriptor>, args: &[Value]) -> FfiResult<Self> {
        let types = cif.arg_types();
        if args.len() != types.len() {
            return Err(FfiError::ArgumentCount {
                expected: types.len(),
                got: args.len(),
            });
        }

        let mut keep = KeepAlive::default();
        let mut slots = Vec::with_capacity(args.len());
        for (index, (ty, arg)) in types.iter().zip(args).enumerate() {
            let size = ty.native_size();
            let mut slot = vec![0u64; size.div_ceil(8).max(1)].into_boxed_slice();
            let bytes =
                unsafe { std::slice::from_raw_parts_mut(slot.as_mut_ptr() as *mut u8, size) };
            value::encode(ty, arg, bytes, &mut keep)
                .map_err(|reason| FfiError::marshal(index, reason))?;
            slots.push(slot);
        }

        let arg_ptrs = slots
            .iter_mut()
            .map(|slot| slot.as_mut_ptr() as *mut c_void)
            .collect();
        let result_size = cif.return_type().native_size().max(MIN_RESULT_SIZE);
        let result = vec![0u64; result_size.div_ceil(8)].into_boxed_slice();

        Ok(Self {
            cif,
            slots,
            arg_ptrs,
            result,
            _keep: keep,
        })
    }

    /// Number of marshalled arguments
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Call `code` and decode its result, consuming the frame
    ///
    /// # Safety
    ///
    /// `code` must be a function whose native signature matches the frame's
    /// call descriptor.
    pub unsafe fn invoke(mut self, code: usize) -> FfiResult<Value> {
        let func: unsafe extern "C" fn() = std::mem::transmute(code);
        let avalue = if self.arg_ptrs.is_empty() {
            std::ptr::null_mut()
        } else {
            self.arg_ptrs.as_mut_ptr()
        };
        raw::ffi_call(
            self.cif.as_raw_ptr(),
            Some(func),
            self.result.as_mut_ptr() as *mut c_void,
            avalue,
        );
        set_errno(std::io::Error::last_os_error().raw_os_error().unwrap_or(0));
        let bytes = std::slice::from_raw_parts(
            self.result.as_ptr() as *const u8,
            self.result.len() * size_of::<u64>(),
        );
        decode_return(self.cif.return_type(), bytes)
    }
}

/// Whether libffi hands back `ty` widened to a full register
pub(crate) fn is_widened(ty: &TypeDescriptor) -> bool {
    ty.as_primitive()
        .map(|p| (p.is_integer() || p == super::types::Primitive::Bool) && p.size() < POINTER_SIZE)
        .unwrap_or(false)
}

/// Decode a result buffer filled by `ffi_call`
pub(crate) fn decode_return(ty: &TypeDescriptor, bytes: &[u8]) -> FfiResult<Value> {
    if let (true, Some(prim)) = (is_widened(ty), ty.as_primitive()) {
        let mut word = [0u8; POINTER_SIZE];
        word.copy_from_slice(&bytes[..POINTER_SIZE]);
        return Ok(value::int_from_word(prim, usize::from_ne_bytes(word) as u64));
    }
    value::decode(ty, bytes)
}

/// A resolved native function bound to its call interface
#[derive(Clone)]
pub struct ForeignFunction {
    name: String,
    code: usize,
    cif: Arc<CallDescriptor>,
}

impl ForeignFunction {
    /// Bind an address to a call interface
    ///
    /// The address must be a function matching `cif`; this cannot be checked.
    pub fn new(name: impl Into<String>, code: usize, cif: Arc<CallDescriptor>) -> FfiResult<Self> {
        let name = name.into();
        if code == 0 {
            return Err(FfiError::Dispatch(format!("`{}` has a null address", name)));
        }
        Ok(Self { name, code, cif })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> usize {
        self.code
    }

    pub fn descriptor(&self) -> &Arc<CallDescriptor> {
        &self.cif
    }

    /// Call synchronously on the current thread
    pub fn call(&self, args: &[Value]) -> FfiResult<Value> {
        let frame = CallFrame::marshal(Arc::clone(&self.cif), args)?;
        trace!(function = %self.name, nargs = args.len(), "native call");
        unsafe { frame.invoke(self.code) }
    }

    /// Marshal now, run on `pool`, deliver the outcome through the completion
    pub fn call_async(&self, args: &[Value], pool: &WorkerPool) -> Completion {
        let (tx, rx) = bounded(1);
        match CallFrame::marshal(Arc::clone(&self.cif), args) {
            Err(err) => {
                let _ = tx.send(Outcome {
                    result: Err(err),
                    errno: None,
                });
            }
            Ok(frame) => {
                let code = self.code;
                let name = self.name.clone();
                pool.submit(Box::new(move || {
                    trace!(function = %name, "async native call");
                    let result = unsafe { frame.invoke(code) };
                    let _ = tx.send(Outcome {
                        result,
                        errno: Some(errno()),
                    });
                }));
            }
        }
        Completion { rx }
    }
}

impl fmt::Debug for ForeignFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForeignFunction")
            .field("name", &self.name)
            .field("address", &format_args!("{:#x}", self.code))
            .field("signature", &self.cif.to_string())
            .finish()
    }
}

/// A foreign function whose calls always run on the worker pool
#[derive(Clone)]
pub struct AsyncFunction {
    function: ForeignFunction,
    pool: Arc<WorkerPool>,
}

impl AsyncFunction {
    pub fn new(function: ForeignFunction, pool: Arc<WorkerPool>) -> Self {
        Self { function, pool }
    }

    pub fn function(&self) -> &ForeignFunction {
        &self.function
    }

    /// Start a call
    pub fn call(&self, args: &[Value]) -> Completion {
        self.function.call_async(args, &self.pool)
    }
}

struct Outcome {
    result: FfiResult<Value>,
    /// `None` when marshalling failed and nothing was called
    errno: Option<i32>,
}

/// Single-shot delivery of an asynchronous call's outcome
///
/// Taking the outcome also sets this thread's [`errno`] to the value the
/// worker observed after the call.
pub struct Completion {
    rx: Receiver<Outcome>,
}

impl Completion {
    fn dropped() -> FfiError {
        FfiError::Dispatch("the call was dropped before completing".to_string())
    }

    fn deliver(outcome: Result<Outcome, crossbeam_channel::RecvError>) -> FfiResult<Value> {
        match outcome {
            Ok(Outcome { result, errno }) => {
                if let Some(errno) = errno {
                    set_errno(errno);
                }
                result
            }
            Err(_) => Err(Self::dropped()),
        }
    }

    /// Block until the call finishes
    pub fn wait(self) -> FfiResult<Value> {
        Self::deliver(self.rx.recv())
    }

    /// Take the outcome if it has arrived
    pub fn try_wait(&self) -> Option<FfiResult<Value>> {
        self.rx.try_recv().ok().map(|outcome| Self::deliver(Ok(outcome)))
    }

    /// Block until the call finishes, running callbacks handed to `host`
    /// in the meantime. Use this when the native call may call back.
    pub fn wait_on(self, host: &HostLoop) -> FfiResult<Value> {
        loop {
            select! {
                recv(self.rx) -> outcome => {
                    return Self::deliver(outcome);
                }
                recv(host.invocations()) -> invocation => {
                    if let Ok(invocation) = invocation {
                        host.run(invocation);
                    }
                }
            }
        }
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Background threads that execute prepared native calls
pub struct WorkerPool {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `size` workers (at least one)
    pub fn new(size: usize) -> FfiResult<Self> {
        let (sender, receiver) = unbounded::<Job>();
        let mut workers = Vec::with_capacity(size.max(1));
        for id in 0..size.max(1) {
            let jobs = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("dynffi-worker-{}", id))
                .spawn(move || {
                    while let Ok(job) = jobs.recv() {
                        job();
                    }
                })
                .map_err(|e| FfiError::Dispatch(format!("failed to spawn worker: {}", e)))?;
            workers.push(handle);
        }
        Ok(Self {
            sender: Some(sender),
            workers,
        })
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Queue a job. A job that cannot be queued is dropped, which closes any
    /// completion it would have fed.
    pub fn submit(&self, job: Job) {
        match &self.sender {
            Some(sender) => {
                if sender.send(job).is_err() {
                    warn!("worker pool is gone, dropping native call");
                }
            }
            None => warn!("worker pool is shut down, dropping native call"),
        }
    }

    /// Stop accepting jobs and wait for queued ones to finish
    pub fn shutdown(&mut self) {
        self.sender.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
