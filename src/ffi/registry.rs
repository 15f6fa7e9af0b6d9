//! Type Registry
//!
//! Name table for type coercion plus process-stable type identities.

use std::collections::HashMap;
use std::mem::size_of;
use std::os::raw::{c_char, c_int, c_long, c_longlong, c_short};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::cif::Abi;
use super::error::{FfiError, FfiResult};
use super::types::{FunctionType, Primitive, TypeDescriptor, TypeKey, TypeSpec};

/// Identity assigned to a type the first time a registry sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(pub u32);

/// Registry of named types
pub struct TypeRegistry {
    /// Registered names (canonical, aliases, and user types)
    names: RwLock<HashMap<String, TypeDescriptor>>,
    /// Structural key -> identity
    identities: Mutex<HashMap<TypeKey, TypeId>>,
}

impl TypeRegistry {
    /// Create a registry pre-populated with the primitive names and C aliases
    pub fn new() -> Self {
        let mut names = HashMap::new();
        for prim in Primitive::ALL {
            names.insert(prim.name().to_string(), TypeDescriptor::primitive(prim));
        }
        names.insert("cstring".to_string(), TypeDescriptor::primitive(Primitive::CString));
        names.insert("ptr".to_string(), TypeDescriptor::pointer());

        let char_prim = if c_char::MIN == 0 {
            Primitive::UInt8
        } else {
            Primitive::Int8
        };
        let aliases = [
            ("char", char_prim),
            ("uchar", Primitive::UInt8),
            ("byte", Primitive::UInt8),
            ("short", Primitive::signed_of(size_of::<c_short>())),
            ("ushort", Primitive::unsigned_of(size_of::<c_short>())),
            ("int", Primitive::signed_of(size_of::<c_int>())),
            ("uint", Primitive::unsigned_of(size_of::<c_int>())),
            ("long", Primitive::signed_of(size_of::<c_long>())),
            ("ulong", Primitive::unsigned_of(size_of::<c_long>())),
            ("longlong", Primitive::signed_of(size_of::<c_longlong>())),
            ("ulonglong", Primitive::unsigned_of(size_of::<c_longlong>())),
        ];
        for (alias, prim) in aliases {
            names.insert(
                alias.to_string(),
                TypeDescriptor::primitive(prim).with_name(alias),
            );
        }

        Self {
            names: RwLock::new(names),
            identities: Mutex::new(HashMap::new()),
        }
    }

    /// Register a named type. Replaces an existing registration.
    pub fn register(&self, name: impl Into<String>, ty: TypeDescriptor) -> TypeDescriptor {
        let name = name.into();
        let ty = ty.with_name(name.clone());
        self.names.write().insert(name, ty.clone());
        ty
    }

    /// Look up a registered name without any parsing
    pub fn get(&self, name: &str) -> Option<TypeDescriptor> {
        self.names.read().get(name).cloned()
    }

    /// All registered names
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.names.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Canonicalize a type spec into a descriptor
    pub fn coerce(&self, spec: impl Into<TypeSpec>) -> FfiResult<TypeDescriptor> {
        match spec.into() {
            TypeSpec::Descriptor(ty) => Ok(ty),
            TypeSpec::Name(name) => self.resolve_name(&name),
        }
    }

    /// Coerce every spec in order
    pub fn coerce_all<I, S>(&self, specs: I) -> FfiResult<Vec<TypeDescriptor>>
    where
        I: IntoIterator<Item = S>,
        S: Into<TypeSpec>,
    {
        specs.into_iter().map(|s| self.coerce(s)).collect()
    }

    fn resolve_name(&self, raw: &str) -> FfiResult<TypeDescriptor> {
        let names = self.names.read();
        if let Some(ty) = names.get(raw) {
            return Ok(ty.clone());
        }

        let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
        match compact.to_lowercase().as_str() {
            // legacy spelling for `void *`
            "pointer" => return Ok(TypeDescriptor::void().ref_type()),
            "string" => return Ok(TypeDescriptor::primitive(Primitive::CString)),
            _ => {}
        }

        let base = compact.trim_end_matches('*');
        let stars = compact.len() - base.len();
        if base.is_empty() || base.contains('*') {
            return Err(FfiError::TypeResolution(raw.to_string()));
        }

        let mut ty = names
            .get(base)
            .or_else(|| names.get(&base.to_lowercase()))
            .cloned()
            .ok_or_else(|| FfiError::TypeResolution(raw.to_string()))?;
        for _ in 0..stars {
            ty = ty.ref_type();
        }
        Ok(ty)
    }

    /// Pointer to `ty`
    pub fn ref_type(&self, ty: impl Into<TypeSpec>) -> FfiResult<TypeDescriptor> {
        Ok(self.coerce(ty)?.ref_type())
    }

    /// Pointee of `ty`
    pub fn deref_type(&self, ty: impl Into<TypeSpec>) -> FfiResult<TypeDescriptor> {
        self.coerce(ty)?.deref_type()
    }

    /// Function pointer type with the given signature
    pub fn function_type<R, I, S>(&self, ret: R, args: I, abi: Abi) -> FfiResult<TypeDescriptor>
    where
        R: Into<TypeSpec>,
        I: IntoIterator<Item = S>,
        S: Into<TypeSpec>,
    {
        let ret = self.coerce(ret)?;
        let params = self.coerce_all(args)?;
        Ok(TypeDescriptor::function(Arc::new(FunctionType::new(ret, params, abi))))
    }

    /// Stable identity for a type, assigned on first sight
    pub fn identity(&self, ty: &TypeDescriptor) -> TypeId {
        let mut ids = self.identities.lock();
        let next = TypeId(ids.len() as u32 + 1);
        *ids.entry(ty.key()).or_insert(next)
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
