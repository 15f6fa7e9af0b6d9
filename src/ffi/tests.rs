//! FFI Module Tests

use std::ffi::CStr;
use std::os::raw::c_char;
use std::sync::Arc;
use std::time::Duration;

use super::dispatch::decode_return;
use super::*;

fn ctx() -> FfiContext {
    FfiContext::new().expect("context")
}

fn ty(name: &str) -> TypeDescriptor {
    TypeRegistry::new().coerce(name).unwrap()
}

// =============================================================================
// Native fixtures
// =============================================================================

#[repr(C)]
#[derive(Clone, Copy)]
struct Point {
    x: i32,
    y: i32,
}

extern "C" fn add_i32(a: i32, b: i32) -> i32 {
    a + b
}

extern "C" fn negate_i8(v: i8) -> i8 {
    -v
}

extern "C" fn scale(v: f64, k: f32) -> f64 {
    v * k as f64
}

extern "C" fn c_len(s: *const c_char) -> usize {
    unsafe { CStr::from_ptr(s) }.to_bytes().len()
}

extern "C" fn sum_point(p: Point) -> i32 {
    p.x + p.y
}

extern "C" fn make_point(x: i32, y: i32) -> Point {
    Point { x, y }
}

extern "C" fn bump_point(p: *mut Point) {
    unsafe {
        (*p).x += 1;
        (*p).y += 1;
    }
}

extern "C" fn apply(cb: extern "C" fn(i32) -> i32, v: i32) -> i32 {
    cb(v)
}

extern "C" fn apply_on_thread(cb: extern "C" fn(i32) -> i32, v: i32) -> i32 {
    std::thread::spawn(move || cb(v)).join().unwrap_or(-1)
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct PackedPair {
    x: f32,
    y: f32,
}

extern "C" fn sum_packed_pair(p: PackedPair) -> f64 {
    let (x, y) = (p.x, p.y);
    (x + y) as f64
}

extern "C" fn triple(v: i32) -> i32 {
    v * 3
}

extern "C" fn pick_triple() -> extern "C" fn(i32) -> i32 {
    triple
}

fn bind(ctx: &FfiContext, name: &str, code: usize, ret: &str, args: &[&str]) -> ForeignFunction {
    let cif = ctx.build_cif(ret, args.iter().copied(), None).unwrap();
    ForeignFunction::new(name, code, Arc::new(cif)).unwrap()
}

// =============================================================================
// Types and registry
// =============================================================================

#[test]
fn test_primitive_sizes() {
    assert_eq!(Primitive::Int8.size(), 1);
    assert_eq!(Primitive::UInt16.size(), 2);
    assert_eq!(Primitive::Float.size(), 4);
    assert_eq!(Primitive::Double.size(), 8);
    assert_eq!(Primitive::SizeT.size(), POINTER_SIZE);
    assert_eq!(Primitive::CString.size(), POINTER_SIZE);
    assert_eq!(Primitive::Void.size(), 0);
}

#[test]
fn test_ref_and_deref() {
    let int32 = ty("int32");
    let ptr = int32.ref_type();
    assert_eq!(ptr.indirection(), 2);
    assert_eq!(ptr.name(), Some("int32*"));
    assert_eq!(ptr.size(), 4);
    assert_eq!(ptr.native_size(), POINTER_SIZE);
    assert!(ptr.is_reference());

    let back = ptr.deref_type().unwrap();
    assert_eq!(back, int32);
    assert_eq!(back.name(), Some("int32"));

    assert!(matches!(int32.deref_type(), Err(FfiError::Indirection(_))));
}

#[test]
fn test_coerce_grammar() {
    let registry = TypeRegistry::new();

    let t = registry.coerce("uint8 * *").unwrap();
    assert_eq!(t.indirection(), 3);
    assert_eq!(t.as_primitive(), None);
    assert_eq!(t.deref_type().unwrap().deref_type().unwrap(), ty("uint8"));

    let p = registry.coerce("pointer").unwrap();
    assert!(p.deref_type().unwrap().is_void());

    let s = registry.coerce("string").unwrap();
    assert_eq!(s.as_primitive(), Some(Primitive::CString));

    // base lookup falls back to lowercase
    assert_eq!(registry.coerce("Int32*").unwrap(), ty("int32").ref_type());

    assert_eq!(registry.coerce("int").unwrap().size(), 4);
    assert_eq!(registry.coerce(Primitive::Double).unwrap(), ty("double"));

    assert!(matches!(
        registry.coerce("nonsense"),
        Err(FfiError::TypeResolution(_))
    ));
    assert!(matches!(registry.coerce("*"), Err(FfiError::TypeResolution(_))));
    assert!(matches!(
        registry.coerce("int*x"),
        Err(FfiError::TypeResolution(_))
    ));
}

#[test]
fn test_register_named_struct() {
    let registry = TypeRegistry::new();
    let mut def = StructDef::new(Some("point"));
    def.add_field("x", ty("int32")).unwrap();
    def.add_field("y", ty("int32")).unwrap();
    registry.register("point", def.type_descriptor());

    let by_ptr = registry.coerce("point*").unwrap();
    assert_eq!(by_ptr.indirection(), 2);
    assert!(by_ptr.deref_type().unwrap().as_struct().is_some());
}

#[test]
fn test_identity_is_stable() {
    let registry = TypeRegistry::new();
    let a = registry.identity(&ty("int32"));
    let b = registry.identity(&ty("int32"));
    let c = registry.identity(&ty("int32").ref_type());
    assert_eq!(a, b);
    assert_ne!(a, c);
}

// =============================================================================
// Struct layout
// =============================================================================

#[test]
fn test_layout_natural() {
    let mut def = StructDef::new(None);
    def.add_field("a", ty("int32")).unwrap();
    def.add_field("b", ty("int8")).unwrap();
    def.add_field("c", ty("int32")).unwrap();

    let desc = def.descriptor();
    let offsets: Vec<usize> = desc.fields().iter().map(|f| f.offset).collect();
    assert_eq!(offsets, vec![0, 4, 8]);
    assert_eq!(desc.size(), 12);
    assert_eq!(desc.alignment(), 4);
}

#[test]
fn test_layout_tail_padding() {
    let mut def = StructDef::new(None);
    def.add_field("d", ty("double")).unwrap();
    def.add_field("c", ty("int8")).unwrap();

    let desc = def.descriptor();
    assert_eq!(desc.field("c").unwrap().offset, 8);
    assert_eq!(desc.size(), 16);
    assert_eq!(desc.alignment(), 8);
}

#[cfg(target_pointer_width = "64")]
#[test]
fn test_layout_pointer_field() {
    let mut def = StructDef::new(None);
    def.add_field("tag", ty("int8")).unwrap();
    // pointer alignment, not int16 alignment
    def.add_field("next", ty("int16").ref_type()).unwrap();

    let desc = def.descriptor();
    assert_eq!(desc.field("next").unwrap().offset, 8);
    assert_eq!(desc.size(), 16);
    assert_eq!(desc.alignment(), 8);
}

#[test]
fn test_layout_packed() {
    let mut def = StructDef::packed(None);
    def.add_field("a", ty("int8")).unwrap();
    def.add_field("b", ty("int32")).unwrap();
    def.add_field("c", ty("int16")).unwrap();

    let desc = def.descriptor();
    let offsets: Vec<usize> = desc.fields().iter().map(|f| f.offset).collect();
    assert_eq!(offsets, vec![0, 1, 5]);
    assert_eq!(desc.size(), 7);
    assert_eq!(desc.alignment(), 1);
    assert!(desc.is_packed());
}

#[test]
fn test_layout_packed_alignment_is_min() {
    let mut def = StructDef::packed(None);
    def.add_field("a", ty("int32")).unwrap();
    def.add_field("b", ty("int16")).unwrap();
    assert_eq!(def.descriptor().alignment(), 2);
    assert_eq!(def.descriptor().size(), 6);
}

#[test]
fn test_layout_array_field() {
    let mut def = StructDef::new(None);
    def.add_field("tag", ty("int8")).unwrap();
    def.add_array_field("vals", ty("int16"), 3).unwrap();
    def.add_field("end", ty("int8")).unwrap();

    let desc = def.descriptor();
    let vals = desc.field("vals").unwrap();
    assert_eq!(vals.offset, 2);
    assert_eq!(vals.slots(), 3);
    assert_eq!(vals.size(), 6);
    assert_eq!(desc.field("end").unwrap().offset, 8);
    assert_eq!(desc.size(), 10);
}

#[test]
fn test_layout_empty() {
    let def = StructDef::new(Some("empty"));
    assert_eq!(def.descriptor().size(), 0);
    assert_eq!(def.descriptor().alignment(), 1);
}

#[test]
fn test_layout_invariants() {
    let mut def = StructDef::new(None);
    for (name, t) in [("a", "int8"), ("b", "double"), ("c", "int16"), ("d", "float")] {
        def.add_field(name, ty(t)).unwrap();
    }
    let desc = def.descriptor();
    for field in desc.fields() {
        assert_eq!(field.offset % field.ty.native_alignment(), 0);
        assert!(field.offset + field.size() <= desc.size());
    }
    assert_eq!(desc.size() % desc.alignment(), 0);
}

#[test]
fn test_field_redefinition() {
    let mut def = StructDef::new(Some("s"));
    def.add_field("a", ty("int32")).unwrap();
    let err = def.add_field("a", ty("int8")).err().unwrap();
    assert!(matches!(err, FfiError::FieldRedefinition { ref field, .. } if field == "a"));
}

#[test]
fn test_layout_frozen_after_instance() {
    let mut def = StructDef::new(Some("s"));
    def.add_field("a", ty("int32")).unwrap();
    let _snapshot = def.descriptor();
    assert!(!def.is_frozen());
    let _instance = def.instance();
    assert!(def.is_frozen());
    assert!(matches!(
        def.add_field("b", ty("int32")).err(),
        Some(FfiError::LayoutFrozen(_))
    ));
}

#[test]
fn test_new_field_gives_new_layout() {
    let mut def = StructDef::new(None);
    def.add_field("a", ty("int32")).unwrap();
    let before = def.descriptor();
    def.add_field("b", ty("int32")).unwrap();
    assert_ne!(before.id(), def.descriptor().id());
    assert_eq!(before.fields().len(), 1);
}

#[test]
fn test_struct_value_fields() {
    let mut def = StructDef::new(None);
    def.add_field("x", ty("int32")).unwrap();
    def.add_array_field("tail", ty("uint8"), 4).unwrap();
    let value = def.instance();

    value.set("x", -7).unwrap();
    value.set_index("tail", 3, 200u8).unwrap();
    assert_eq!(value.get("x").unwrap(), Value::Int(-7));
    assert_eq!(value.get_index("tail", 3).unwrap(), Value::UInt(200));
    assert_eq!(value.get_index("tail", 0).unwrap(), Value::UInt(0));

    assert!(matches!(value.get("nope"), Err(FfiError::UnknownField { .. })));
    assert!(matches!(
        value.get_index("tail", 4),
        Err(FfiError::UnknownField { .. })
    ));
    assert!(matches!(value.set("x", 1u64 << 40), Err(FfiError::Marshal { .. })));
}

// =============================================================================
// Buffers and values
// =============================================================================

#[test]
fn test_buffer_alloc_and_deref() {
    let int64 = ty("int64");
    let buf = NativeBuffer::alloc(&int64, &Value::Int(-42)).unwrap();
    assert_eq!(buf.len(), 8);
    assert_eq!(buf.deref().unwrap(), Value::Int(-42));
    assert_eq!(unsafe { read_value(buf.address(), &int64) }.unwrap(), Value::Int(-42));

    unsafe { write_value(buf.address(), &int64, &Value::Int(9)) }.unwrap();
    assert_eq!(buf.deref().unwrap(), Value::Int(9));
}

#[test]
fn test_buffer_read_out_of_bounds() {
    let buf = NativeBuffer::new(2);
    assert!(matches!(buf.read(&ty("int32"), 0), Err(FfiError::Decode(_))));
}

#[test]
fn test_buffer_with_str() {
    let buf = NativeBuffer::with_str("hey");
    assert_eq!(unsafe { read_cstring(buf.address()) }, Some("hey".to_string()));
    assert_eq!(unsafe { read_cstring(0) }, None);
}

#[test]
fn test_field_overwrite_releases_reference() {
    let mut def = StructDef::new(None);
    def.add_field("data", ty("pointer")).unwrap();
    def.add_field("label", ty("CString")).unwrap();
    let value = def.instance();

    let target = NativeBuffer::new(16);
    for _ in 0..100 {
        value.set("data", Value::from(target.clone())).unwrap();
    }
    assert_eq!(target.ref_count(), 2);
    value.set("data", Value::Null).unwrap();
    assert_eq!(target.ref_count(), 1);

    let other = NativeBuffer::new(16);
    value.set("data", Value::from(target.clone())).unwrap();
    value.set("data", Value::from(other.clone())).unwrap();
    assert_eq!(target.ref_count(), 1);
    assert_eq!(other.ref_count(), 2);

    value.set("label", "first").unwrap();
    value.set("label", "second").unwrap();
    assert_eq!(value.get("label").unwrap(), Value::String("second".to_string()));

    drop(value);
    assert_eq!(other.ref_count(), 1);
}

#[test]
fn test_widened_return_decoding() {
    let word = (-3i64 as u64).to_ne_bytes();
    assert_eq!(decode_return(&ty("int8"), &word).unwrap(), Value::Int(-3));
    assert_eq!(decode_return(&ty("uint16"), &word).unwrap(), Value::UInt(0xfffd));
    assert_eq!(
        decode_return(&ty("bool"), &1u64.to_ne_bytes()).unwrap(),
        Value::Bool(true)
    );
}

// =============================================================================
// Call interfaces
// =============================================================================

#[test]
fn test_cif_display() {
    let ctx = ctx();
    let cif = ctx.build_cif("int32", ["CString", "double"], None).unwrap();
    assert_eq!(cif.to_string(), "int32 (CString, double)");
    assert_eq!(cif.arg_types().len(), 2);
    assert_eq!(cif.abi(), Abi::DEFAULT);
    assert!(!cif.is_variadic());
}

#[test]
fn test_cif_bad_typedef() {
    let empty = StructDef::new(Some("empty")).type_descriptor();
    let err = CallDescriptor::new(TypeDescriptor::void(), vec![empty], Abi::DEFAULT).unwrap_err();
    assert!(matches!(
        err,
        FfiError::AbiPreparation {
            status: 1,
            reason: PrepFailure::BadTypedef
        }
    ));
}

#[test]
fn test_cif_misaligned_packed_by_value() {
    let mut def = StructDef::packed(None);
    def.add_field("tag", ty("int8")).unwrap();
    def.add_field("value", ty("int32")).unwrap();
    let packed = def.type_descriptor();
    assert!(!def.descriptor().is_naturally_aligned());

    let err = CallDescriptor::new(TypeDescriptor::void(), vec![packed.clone()], Abi::DEFAULT)
        .unwrap_err();
    assert!(matches!(
        err,
        FfiError::AbiPreparation {
            status: 1,
            reason: PrepFailure::BadTypedef
        }
    ));

    let mut tail = StructDef::packed(None);
    tail.add_field("value", ty("int32")).unwrap();
    tail.add_field("tag", ty("int8")).unwrap();
    assert!(!tail.descriptor().is_naturally_aligned());
    assert!(CallDescriptor::new(tail.type_descriptor(), vec![], Abi::DEFAULT).is_err());

    // by pointer it is just an address
    assert!(CallDescriptor::new(TypeDescriptor::void(), vec![packed.ref_type()], Abi::DEFAULT).is_ok());
}

#[test]
fn test_cif_bad_abi() {
    let err = CallDescriptor::new(ty("int32"), vec![ty("int32")], Abi::from_raw(999)).unwrap_err();
    assert!(matches!(
        err,
        FfiError::AbiPreparation {
            status: 2,
            reason: PrepFailure::BadAbi
        }
    ));
}

#[test]
fn test_variadic_arity() {
    let cs = ty("CString");
    assert!(matches!(
        CallDescriptor::variadic(ty("int32"), vec![cs.clone()], 0, Abi::DEFAULT),
        Err(FfiError::InvalidArity { fixed: 0, total: 1 })
    ));
    assert!(matches!(
        CallDescriptor::variadic(ty("int32"), vec![cs.clone()], 2, Abi::DEFAULT),
        Err(FfiError::InvalidArity { fixed: 2, total: 1 })
    ));
    let cif = CallDescriptor::variadic(ty("int32"), vec![cs, ty("int32")], 1, Abi::DEFAULT).unwrap();
    assert_eq!(cif.fixed_args(), Some(1));
    assert_eq!(cif.to_string(), "int32 (CString, ... int32)");
}

// =============================================================================
// Dispatch
// =============================================================================

#[test]
fn test_call_integers() {
    let ctx = ctx();
    let add = bind(&ctx, "add_i32", add_i32 as usize, "int32", &["int32", "int32"]);
    assert_eq!(add.call(&[Value::from(2), Value::from(40)]).unwrap(), Value::Int(42));

    let neg = bind(&ctx, "negate_i8", negate_i8 as usize, "int8", &["int8"]);
    assert_eq!(neg.call(&[Value::from(5)]).unwrap(), Value::Int(-5));
}

#[test]
fn test_call_floats() {
    let ctx = ctx();
    let f = bind(&ctx, "scale", scale as usize, "double", &["double", "float"]);
    assert_eq!(f.call(&[Value::from(1.5), Value::from(2.0f32)]).unwrap(), Value::Float(3.0));
}

#[test]
fn test_call_string_argument() {
    let ctx = ctx();
    let f = bind(&ctx, "c_len", c_len as usize, "size_t", &["CString"]);
    assert_eq!(f.call(&[Value::from("hello")]).unwrap(), Value::UInt(5));
}

#[test]
fn test_call_struct_by_value() {
    let ctx = ctx();
    let mut def = StructDef::new(Some("Point"));
    def.add_field("x", ty("int32")).unwrap();
    def.add_field("y", ty("int32")).unwrap();
    let point = ctx.register("Point", def.type_descriptor());

    let p = def.instance();
    p.set("x", 3).unwrap();
    p.set("y", 4).unwrap();

    let sum = bind(&ctx, "sum_point", sum_point as usize, "int32", &["Point"]);
    assert_eq!(sum.call(&[Value::from(p.clone())]).unwrap(), Value::Int(7));

    let make = bind(&ctx, "make_point", make_point as usize, "Point", &["int32", "int32"]);
    match make.call(&[Value::from(10), Value::from(-2)]).unwrap() {
        Value::Struct(s) => {
            assert_eq!(s.descriptor().id(), point.as_struct().unwrap().id());
            assert_eq!(s.get("x").unwrap(), Value::Int(10));
            assert_eq!(s.get("y").unwrap(), Value::Int(-2));
        }
        other => panic!("expected struct, got {:?}", other),
    }

    // by pointer: native writes are visible through the instance
    let bump = bind(&ctx, "bump_point", bump_point as usize, "void", &["Point*"]);
    assert_eq!(bump.call(&[Value::from(p.clone())]).unwrap(), Value::Void);
    assert_eq!(p.get("x").unwrap(), Value::Int(4));
}

#[test]
fn test_call_packed_float_pair_by_value() {
    let ctx = ctx();
    let mut def = StructDef::packed(Some("PackedPair"));
    def.add_field("x", ty("float")).unwrap();
    def.add_field("y", ty("float")).unwrap();
    assert!(def.descriptor().is_naturally_aligned());
    ctx.register("PackedPair", def.type_descriptor());

    let pair = def.instance();
    pair.set("x", 1.5f32).unwrap();
    pair.set("y", 2.0f32).unwrap();

    let sum = bind(&ctx, "sum_packed_pair", sum_packed_pair as usize, "double", &["PackedPair"]);
    assert_eq!(sum.call(&[Value::from(pair)]).unwrap(), Value::Float(3.5));
}

#[test]
fn test_errno_after_call() {
    let ctx = ctx();
    let close = bind(&ctx, "close", libc::close as usize, "int", &["int"]);
    assert_eq!(close.call(&[Value::from(-1)]).unwrap(), Value::Int(-1));
    assert_eq!(errno(), libc::EBADF);
}

#[test]
fn test_errno_delivered_by_completion() {
    let ctx = ctx();
    let chdir = bind(&ctx, "chdir", libc::chdir as usize, "int", &["CString"]);
    assert_eq!(chdir.call(&[Value::from("")]).unwrap(), Value::Int(-1));
    assert_eq!(errno(), libc::ENOENT);

    let close = bind(&ctx, "close", libc::close as usize, "int", &["int"]);
    let completion = close.call_async(&[Value::from(-1)], ctx.worker_pool());
    assert_eq!(completion.wait().unwrap(), Value::Int(-1));
    assert_eq!(errno(), libc::EBADF);
}

#[test]
fn test_marshal_error_has_index() {
    let ctx = ctx();
    let cif = Arc::new(ctx.build_cif("int32", ["int32", "int8"], None).unwrap());
    let err = CallFrame::marshal(Arc::clone(&cif), &[Value::from(1), Value::from(300)])
        .err()
        .unwrap();
    assert!(matches!(err, FfiError::Marshal { index: 1, .. }));

    let err = CallFrame::marshal(Arc::clone(&cif), &[Value::from("x"), Value::from(1)])
        .err()
        .unwrap();
    assert!(matches!(err, FfiError::Marshal { index: 0, .. }));

    let err = CallFrame::marshal(cif, &[Value::from(1)]).err().unwrap();
    assert!(matches!(err, FfiError::ArgumentCount { expected: 2, got: 1 }));
}

#[test]
fn test_null_address_rejected() {
    let ctx = ctx();
    let cif = Arc::new(ctx.build_cif("void", Vec::<&str>::new(), None).unwrap());
    assert!(matches!(
        ForeignFunction::new("nothing", 0, cif),
        Err(FfiError::Dispatch(_))
    ));
}

#[test]
fn test_buffer_held_during_async_call() {
    let ctx = ctx();
    let f = bind(&ctx, "c_len", c_len as usize, "size_t", &["pointer"]);
    let buf = NativeBuffer::with_str("held");
    let completion = f.call_async(&[Value::from(buf.clone())], ctx.worker_pool());
    assert_eq!(completion.wait().unwrap(), Value::UInt(4));
    // the frame released its reference when the call finished
    assert_eq!(buf.ref_count(), 1);
}

#[test]
fn test_async_marshal_error_via_completion() {
    let ctx = ctx();
    let f = AsyncFunction::new(
        bind(&ctx, "add_i32", add_i32 as usize, "int32", &["int32", "int32"]),
        Arc::clone(ctx.worker_pool()),
    );
    let completion = f.call(&[Value::from("x"), Value::from(1)]);
    assert!(matches!(completion.wait(), Err(FfiError::Marshal { index: 0, .. })));
}

#[test]
fn test_async_calls_complete_once() {
    let ctx = ctx();
    let f = AsyncFunction::new(
        bind(&ctx, "add_i32", add_i32 as usize, "int32", &["int32", "int32"]),
        Arc::clone(ctx.worker_pool()),
    );
    let completions: Vec<Completion> = (0..32).map(|i| f.call(&[Value::from(i), Value::from(1)])).collect();
    for (i, c) in completions.into_iter().enumerate() {
        assert_eq!(c.wait().unwrap(), Value::Int(i as i64 + 1));
    }
}

// =============================================================================
// Callbacks
// =============================================================================

fn doubler(ctx: &FfiContext) -> Callback {
    ctx.callback(
        "double",
        "int32",
        ["int32"],
        |args| {
            let v = args[0].as_i64().ok_or_else(|| anyhow::anyhow!("not an int"))?;
            Ok(Value::Int(v * 2))
        },
        None,
    )
    .unwrap()
}

#[test]
fn test_callback_on_host_thread() {
    let ctx = ctx();
    let cb = doubler(&ctx);
    let f = bind(&ctx, "apply", apply as usize, "int32", &["pointer", "int32"]);
    assert_eq!(f.call(&[cb.as_value(), Value::from(21)]).unwrap(), Value::Int(42));
    assert!(ctx.host().take_errors().is_empty());
    assert!(cb.type_descriptor().is_reference());
}

#[test]
fn test_callback_from_other_thread() {
    let ctx = ctx();
    let cb = doubler(&ctx);
    let f = bind(&ctx, "apply_on_thread", apply_on_thread as usize, "int32", &["pointer", "int32"]);

    let completion = f.call_async(&[cb.as_value(), Value::from(8)], ctx.worker_pool());
    assert_eq!(completion.wait_on(ctx.host()).unwrap(), Value::Int(16));
}

#[test]
fn test_callback_posted_to_host_loop() {
    let ctx = ctx();
    let cb = doubler(&ctx);
    let code = cb.address();

    let native = std::thread::spawn(move || {
        let f: extern "C" fn(i32) -> i32 = unsafe { std::mem::transmute(code) };
        f(5)
    });
    while !native.is_finished() {
        ctx.host().turn(Duration::from_millis(10));
    }
    assert_eq!(native.join().unwrap(), 10);
}

#[test]
fn test_callback_error_is_deferred() {
    let ctx = ctx();
    let cb = ctx
        .callback("fails", "int32", ["int32"], |_| anyhow::bail!("boom"), None)
        .unwrap();
    let f = bind(&ctx, "apply", apply as usize, "int32", &["pointer", "int32"]);

    assert_eq!(f.call(&[cb.as_value(), Value::from(1)]).unwrap(), Value::Int(0));
    let errors = ctx.host().take_errors();
    assert_eq!(errors.len(), 1);
    assert!(matches!(&errors[0], FfiError::Callback(msg) if msg.contains("boom")));
}

#[test]
fn test_callback_panic_is_contained() {
    let ctx = ctx();
    let cb = ctx
        .callback("panics", "int32", ["int32"], |_| panic!("host panic"), None)
        .unwrap();
    let f = bind(&ctx, "apply", apply as usize, "int32", &["pointer", "int32"]);

    assert_eq!(f.call(&[cb.as_value(), Value::from(1)]).unwrap(), Value::Int(0));
    let errors = ctx.host().take_errors();
    assert!(matches!(&errors[..], [FfiError::Callback(msg)] if msg.contains("host panic")));
}

#[test]
fn test_callback_bad_result_is_deferred() {
    let ctx = ctx();
    let cb = ctx
        .callback("wide", "int8", ["int32"], |_| Ok(Value::Int(1000)), None)
        .unwrap();
    let f: extern "C" fn(i32) -> i8 = unsafe { std::mem::transmute(cb.address()) };
    assert_eq!(f(1), 0);
    assert_eq!(ctx.host().take_errors().len(), 1);
}

// =============================================================================
// Function types
// =============================================================================

#[test]
fn test_function_pointer_field_is_callable() {
    let ctx = ctx();
    let op = ctx.function_type("int32", ["int32"], None).unwrap();
    assert_eq!(op.native_size(), POINTER_SIZE);
    assert!(op.as_function().is_some());

    let mut def = StructDef::new(Some("Ops"));
    def.add_field("apply", op.clone()).unwrap();
    let ops = def.instance();
    assert_eq!(ops.get("apply").unwrap(), Value::Null);

    ops.set("apply", Value::Pointer(triple as usize)).unwrap();
    match ops.get("apply").unwrap() {
        Value::Function(f) => {
            assert_eq!(f.address(), triple as usize);
            assert_eq!(f.call(&[Value::from(5)]).unwrap(), Value::Int(15));
        }
        other => panic!("expected function, got {:?}", other),
    }
}

#[test]
fn test_function_typed_return() {
    let ctx = ctx();
    let op = ctx.function_type("int32", ["int32"], None).unwrap();
    let cif = ctx.build_cif(op, Vec::<&str>::new(), None).unwrap();
    let pick = ForeignFunction::new("pick_triple", pick_triple as usize, Arc::new(cif)).unwrap();

    let value = pick.call(&[]).unwrap();
    let f = value.as_function().unwrap();
    assert_eq!(f.call(&[Value::from(-4)]).unwrap(), Value::Int(-12));
}

#[test]
fn test_function_type_to_callback() {
    let ctx = ctx();
    let op = ctx.function_type("int32", ["int32"], None).unwrap();
    let cb = op
        .as_function()
        .unwrap()
        .to_callback("inc", ctx.host().handle(), |args| {
            let v = args[0].as_i64().ok_or_else(|| anyhow::anyhow!("not an int"))?;
            Ok(Value::Int(v + 1))
        })
        .unwrap();
    assert_eq!(cb.type_descriptor(), &op);

    let mut def = StructDef::new(None);
    def.add_field("hook", op.clone()).unwrap();
    let holder = def.instance();
    holder.set("hook", &cb).unwrap();
    let hook = holder.get("hook").unwrap();
    assert_eq!(hook.as_pointer(), Some(cb.address()));
    assert_eq!(hook.as_function().unwrap().call(&[Value::from(41)]).unwrap(), Value::Int(42));

    let cif = ctx.build_cif("int32", vec![op.clone(), ty("int32")], None).unwrap();
    let f = ForeignFunction::new("apply", apply as usize, Arc::new(cif)).unwrap();
    assert_eq!(f.call(&[Value::from(&cb), Value::from(9)]).unwrap(), Value::Int(10));
    assert!(ctx.host().take_errors().is_empty());
}

// =============================================================================
// Variadic cache
// =============================================================================

#[test]
fn test_variadic_cache_counts_builds() {
    let ctx = ctx();
    let snprintf = VariadicFunction::new(
        "snprintf",
        libc::snprintf as usize,
        ty("int32"),
        vec![ty("pointer"), ty("size_t"), ty("CString")],
        Abi::DEFAULT,
        Arc::clone(ctx.registry()),
        Arc::clone(ctx.variadic_cache()),
    );

    let buf = NativeBuffer::new(32);
    let args = |n: i32| {
        vec![
            Value::from(buf.clone()),
            Value::from(32usize),
            Value::from("n=%d"),
            Value::from(n),
        ]
    };
    assert_eq!(snprintf.call(["int32"], &args(7)).unwrap(), Value::Int(3));
    assert_eq!(unsafe { read_cstring(buf.address()) }.unwrap(), "n=7");
    assert_eq!(snprintf.call(["int32"], &args(12)).unwrap(), Value::Int(4));
    assert_eq!(ctx.variadic_cache().builds(), 1);

    let out = snprintf
        .call(
            ["double"],
            &[
                Value::from(buf.clone()),
                Value::from(32usize),
                Value::from("%.1f"),
                Value::from(2.5),
            ],
        )
        .unwrap();
    assert_eq!(out, Value::Int(3));
    assert_eq!(unsafe { read_cstring(buf.address()) }.unwrap(), "2.5");
    assert_eq!(ctx.variadic_cache().builds(), 2);
    assert_eq!(ctx.variadic_cache().len(), 2);
}

#[test]
fn test_variadic_cache_fifo_eviction() {
    let registry = TypeRegistry::new();
    let cache = VariadicCache::new(2);
    let key = |ids: &[&str]| VariadicKey {
        return_type: registry.identity(&ty("int32")),
        fixed: vec![registry.identity(&ty("CString"))],
        varargs: ids.iter().map(|t| registry.identity(&ty(t))).collect(),
        abi: Abi::DEFAULT,
    };
    let build = |vararg: &str| {
        let vararg = ty(vararg);
        move || CallDescriptor::variadic(ty("int32"), vec![ty("CString"), vararg], 1, Abi::DEFAULT)
    };

    let first = cache.get_or_build(key(&["int32"]), build("int32")).unwrap();
    cache.get_or_build(key(&["int64"]), build("int64")).unwrap();
    cache.get_or_build(key(&["double"]), build("double")).unwrap();
    assert_eq!(cache.len(), 2);
    assert_eq!(cache.builds(), 3);

    // oldest entry was evicted but the caller's handle is still valid
    assert_eq!(first.arg_types().len(), 2);
    cache.get_or_build(key(&["int32"]), build("int32")).unwrap();
    assert_eq!(cache.builds(), 4);

    cache.clear();
    assert!(cache.is_empty());
}

// =============================================================================
// Loader helpers
// =============================================================================

#[test]
fn test_parse_linker_script() {
    let script = "/* GNU ld script */\nOUTPUT_FORMAT(elf64-x86-64)\nGROUP ( /lib/x86_64-linux-gnu/libc.so.6 /usr/lib/x86_64-linux-gnu/libc_nonshared.a )\n";
    assert_eq!(
        parse_linker_script(script),
        Some(std::path::PathBuf::from("/lib/x86_64-linux-gnu/libc.so.6"))
    );
    assert_eq!(parse_linker_script("INPUT(libfoo.so)"), None);
}

#[test]
fn test_redirect_target_requires_so_prefix() {
    assert_eq!(redirect_target("cannot open shared object file"), None);
    assert_eq!(redirect_target("/nonexistent/libx.so: invalid ELF header"), None);
}

#[cfg(not(any(target_os = "macos", windows)))]
#[test]
fn test_library_filename() {
    assert_eq!(library_filename("keylite_kv"), "libkeylite_kv.so");
    assert_eq!(library_filename("libc.so.6"), "libc.so.6");
}

#[test]
fn test_ffi_error_display() {
    let err = FfiError::ArgumentCount {
        expected: 2,
        got: 3,
    };
    assert!(err.to_string().contains('2'));
    assert!(err.to_string().contains('3'));

    let err = FfiError::AbiPreparation {
        status: 2,
        reason: PrepFailure::BadAbi,
    };
    assert!(err.to_string().contains("unsupported ABI"));
}
