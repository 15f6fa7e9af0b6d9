//! FFI error taxonomy

use thiserror::Error;

/// Why `ffi_prep_cif` rejected a signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepFailure {
    /// A type definition was malformed or unsupported (`FFI_BAD_TYPEDEF`)
    BadTypedef,
    /// The ABI value is not supported on this platform (`FFI_BAD_ABI`)
    BadAbi,
    /// Any other non-zero status
    Other,
}

impl PrepFailure {
    /// Classify a raw libffi status code
    pub fn from_status(status: u32) -> Self {
        match status {
            1 => PrepFailure::BadTypedef,
            2 => PrepFailure::BadAbi,
            _ => PrepFailure::Other,
        }
    }
}

impl std::fmt::Display for PrepFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PrepFailure::BadTypedef => write!(f, "bad type definition"),
            PrepFailure::BadAbi => write!(f, "unsupported ABI"),
            PrepFailure::Other => write!(f, "preparation failed"),
        }
    }
}

/// Errors produced by the FFI runtime
#[derive(Debug, Clone, Error)]
pub enum FfiError {
    #[error("could not determine a type from {0:?}")]
    TypeResolution(String),

    #[error("cannot dereference value type `{0}`")]
    Indirection(String),

    #[error("field `{field}` is already defined on struct `{name}`")]
    FieldRedefinition { name: String, field: String },

    #[error("struct `{0}` is frozen: an instance has already been created")]
    LayoutFrozen(String),

    #[error("struct `{name}` has no field `{field}`")]
    UnknownField { name: String, field: String },

    #[error("ffi_prep_cif failed: {reason} (status {status})")]
    AbiPreparation { status: u32, reason: PrepFailure },

    #[error("invalid variadic arity: {fixed} fixed of {total} arguments")]
    InvalidArity { fixed: usize, total: usize },

    #[error("expected {expected} arguments, got {got}")]
    ArgumentCount { expected: usize, got: usize },

    #[error("cannot marshal argument {index}: {reason}")]
    Marshal { index: usize, reason: String },

    #[error("cannot decode {0}")]
    Decode(String),

    #[error("symbol `{symbol}` not found in {library}: {reason}")]
    SymbolNotFound {
        library: String,
        symbol: String,
        reason: String,
    },

    #[error("failed to load library {path}: {reason}")]
    LibraryLoad { path: String, reason: String },

    #[error("no binding named `{0}`")]
    UnknownBinding(String),

    #[error("callback failed: {0}")]
    Callback(String),

    #[error("dispatch failed: {0}")]
    Dispatch(String),
}

impl FfiError {
    pub(crate) fn marshal(index: usize, reason: impl Into<String>) -> Self {
        FfiError::Marshal {
            index,
            reason: reason.into(),
        }
    }
}

/// Result type for FFI operations
pub type FfiResult<T> = Result<T, FfiError>;
