//! Keylite binding table
//!
//! Symbol table of the `keylite_kv` native key-value store, expressed as
//! binding specs for `FfiContext::bind`. Handles, iterators, keys and values
//! travel as pointers; every function except the destructors returns a
//! status code.

use std::fmt;

use crate::ffi::{BindingSpec, Value};

/// Short library name, resolved through the loader's search path
pub const LIBRARY_NAME: &str = "keylite_kv";

/// Status codes returned by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyliteStatus {
    Ok,
    /// A required pointer was null
    ErrNull,
    ErrIo,
    /// A string key or value was not valid UTF-8
    ErrUtf8,
    ErrOther,
}

impl KeyliteStatus {
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => KeyliteStatus::Ok,
            1 => KeyliteStatus::ErrNull,
            2 => KeyliteStatus::ErrIo,
            3 => KeyliteStatus::ErrUtf8,
            _ => KeyliteStatus::ErrOther,
        }
    }

    /// Status carried by a call result, `ErrOther` if it is not an integer
    pub fn from_value(value: &Value) -> Self {
        value
            .as_i64()
            .map(Self::from_code)
            .unwrap_or(KeyliteStatus::ErrOther)
    }

    pub fn code(&self) -> i32 {
        match self {
            KeyliteStatus::Ok => 0,
            KeyliteStatus::ErrNull => 1,
            KeyliteStatus::ErrIo => 2,
            KeyliteStatus::ErrUtf8 => 3,
            KeyliteStatus::ErrOther => 4,
        }
    }

    pub fn is_ok(&self) -> bool {
        *self == KeyliteStatus::Ok
    }

    /// `Ok(())` for success, the status otherwise
    pub fn check(value: &Value) -> Result<(), KeyliteStatus> {
        match Self::from_value(value) {
            KeyliteStatus::Ok => Ok(()),
            status => Err(status),
        }
    }
}

impl fmt::Display for KeyliteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            KeyliteStatus::Ok => "ok",
            KeyliteStatus::ErrNull => "null pointer",
            KeyliteStatus::ErrIo => "I/O error",
            KeyliteStatus::ErrUtf8 => "invalid UTF-8",
            KeyliteStatus::ErrOther => "error",
        };
        write!(f, "{} ({})", msg, self.code())
    }
}

impl std::error::Error for KeyliteStatus {}

/// Every exported function of the store
pub fn binding_specs() -> Vec<BindingSpec> {
    vec![
        // lifecycle
        BindingSpec::new("keylite_open", "int", ["string", "void**"]),
        BindingSpec::new("keylite_close", "void", ["void*"]),
        // byte keys and values
        BindingSpec::new(
            "keylite_put",
            "int",
            ["void*", "uchar*", "size_t", "uchar*", "size_t"],
        ),
        BindingSpec::new(
            "keylite_get",
            "int",
            ["void*", "uchar*", "size_t", "uchar**", "size_t*"],
        ),
        BindingSpec::new("keylite_del", "int", ["void*", "uchar*", "size_t"]),
        BindingSpec::new("keylite_free_value", "void", ["uchar*", "size_t"]),
        // string keys and values
        BindingSpec::new("keylite_put_str", "int", ["void*", "string", "string"]),
        BindingSpec::new("keylite_get_str", "int", ["void*", "string", "char**"]),
        BindingSpec::new("keylite_del_str", "int", ["void*", "string"]),
        BindingSpec::new("keylite_free_str", "void", ["char*"]),
        // range scans
        BindingSpec::new(
            "keylite_scan",
            "int",
            ["void*", "uchar*", "size_t", "uchar*", "size_t", "void**"],
        ),
        BindingSpec::new(
            "keylite_scan_str",
            "int",
            ["void*", "string", "string", "void**"],
        ),
        BindingSpec::new(
            "keylite_iter_next",
            "int",
            ["void*", "uchar**", "size_t*", "uchar**", "size_t*"],
        ),
        BindingSpec::new("keylite_iter_free", "void", ["void*"]),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffi::FfiContext;

    #[test]
    fn test_status_codes() {
        assert_eq!(KeyliteStatus::from_code(0), KeyliteStatus::Ok);
        assert_eq!(KeyliteStatus::from_code(3), KeyliteStatus::ErrUtf8);
        assert_eq!(KeyliteStatus::from_code(99), KeyliteStatus::ErrOther);
        assert!(KeyliteStatus::check(&Value::Int(0)).is_ok());
        assert_eq!(
            KeyliteStatus::check(&Value::Int(2)),
            Err(KeyliteStatus::ErrIo)
        );
        assert_eq!(KeyliteStatus::from_value(&Value::Void), KeyliteStatus::ErrOther);
    }

    #[test]
    fn test_specs_resolve() {
        let ctx = FfiContext::new().unwrap();
        let specs = binding_specs();
        assert_eq!(specs.len(), 14);
        for spec in &specs {
            let cif = ctx
                .build_cif(spec.ret.clone(), spec.args.iter().cloned(), None)
                .unwrap();
            assert_eq!(cif.arg_types().len(), spec.args.len());
        }
    }
}
