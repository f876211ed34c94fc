//! Executes compiled stubs through IC chains.

use std::cell::Cell;

use cacheir::gc::NoBarrier;
use cacheir::runtime::{
    ARRAY_CLASS, ClassKind, FUNCTION_CLASS, JSString, NativeObject, ObjectElements, ObjectGroup,
    PLAIN_OBJECT_CLASS, Shape, dynamic_slot_offset, fixed_slot_offset,
};
use cacheir::stub::ICStubHeader;
use cacheir::{
    AttachDecision, CacheIRWriter, CacheKind, ICEntry, ICStubEngine, JitOptions, StubCodeCache,
    Value, attach_stub,
};

thread_local! {
    static FALLBACK_INPUTS: Cell<Option<(u64, u64)>> = const { Cell::new(None) };
}

const FALLBACK_RESULT: Value = Value::magic(0xfa11);

unsafe extern "C" fn fallback(a: u64, b: u64, _stub: *const ICStubHeader) -> u64 {
    FALLBACK_INPUTS.with(|c| c.set(Some((a, b))));
    FALLBACK_RESULT.bits()
}

#[derive(Debug, PartialEq)]
enum Outcome {
    Stub(Value),
    Fallback(Value, Value),
}

struct Site {
    cache: StubCodeCache,
    entry: ICEntry,
    engine: ICStubEngine,
}

impl Site {
    fn new() -> Self {
        Self::with_engine(ICStubEngine::Baseline)
    }

    fn with_engine(engine: ICStubEngine) -> Self {
        Site {
            cache: StubCodeCache::new(),
            entry: ICEntry::new(fallback),
            engine,
        }
    }

    fn attach(&mut self, writer: &CacheIRWriter) -> AttachDecision {
        attach_stub(
            &self.cache,
            &mut self.entry,
            writer,
            self.engine,
            &JitOptions::default(),
            &NoBarrier,
        )
        .unwrap()
    }

    fn call(&self, a: Value, b: Value) -> Outcome {
        FALLBACK_INPUTS.with(|c| c.set(None));
        let result = unsafe { self.entry.call(a, b) };
        match FALLBACK_INPUTS.with(|c| c.take()) {
            Some((a, b)) => {
                assert_eq!(result, FALLBACK_RESULT);
                Outcome::Fallback(Value::from_bits(a), Value::from_bits(b))
            }
            None => Outcome::Stub(result),
        }
    }
}

#[repr(C)]
struct Object {
    header: NativeObject,
    fixed: [Value; 2],
}

impl Object {
    fn new(group: &ObjectGroup, shape: &Shape, fixed: [Value; 2]) -> Box<Object> {
        Box::new(Object {
            header: NativeObject {
                group,
                shape,
                slots: core::ptr::null_mut(),
                elements: core::ptr::null_mut(),
            },
            fixed,
        })
    }

    fn value(&self) -> Value {
        Value::from_object(&self.header)
    }
}

fn shape(id: u32) -> Box<Shape> {
    Box::new(Shape {
        id,
        num_fixed_slots: 2,
    })
}

fn plain_group() -> Box<ObjectGroup> {
    Box::new(ObjectGroup {
        clasp: &PLAIN_OBJECT_CLASS,
        proto: core::ptr::null(),
    })
}

fn shaped_slot_load(shape: &Shape, slot: u32) -> CacheIRWriter {
    let mut w = CacheIRWriter::new(CacheKind::GetProp);
    let obj = w.guard_is_object(w.input_operand(0));
    w.guard_shape(obj, shape);
    w.load_fixed_slot_result(obj, fixed_slot_offset(slot));
    w.return_from_ic();
    w
}

#[test]
fn shape_guard_hit_and_miss() {
    let group = plain_group();
    let (s1, s2) = (shape(1), shape(2));
    let a = Object::new(&group, &s1, [Value::from_int32(10), Value::from_int32(11)]);
    let b = Object::new(&group, &s2, [Value::from_int32(20), Value::from_int32(21)]);

    let mut site = Site::new();
    site.attach(&shaped_slot_load(&s1, 1));

    assert_eq!(site.call(a.value(), Value::undefined()), Outcome::Stub(Value::from_int32(11)));
    assert_eq!(
        site.call(b.value(), Value::undefined()),
        Outcome::Fallback(b.value(), Value::undefined())
    );
    let not_object = Value::from_double(2.5);
    assert_eq!(
        site.call(not_object, Value::undefined()),
        Outcome::Fallback(not_object, Value::undefined())
    );
}

#[test]
fn failing_stub_falls_through_to_the_next_one() {
    let group = plain_group();
    let (s1, s2) = (shape(1), shape(2));
    let b = Object::new(&group, &s2, [Value::from_bool(false), Value::from_int32(21)]);

    let mut site = Site::new();
    assert_eq!(site.attach(&shaped_slot_load(&s1, 0)), AttachDecision::Attached);
    assert_eq!(site.attach(&shaped_slot_load(&s2, 0)), AttachDecision::Attached);
    assert_eq!(site.cache.len(), 1);

    assert_eq!(site.call(b.value(), Value::undefined()), Outcome::Stub(Value::from_bool(false)));
}

#[test]
fn duplicate_stubs_are_not_attached() {
    let s1 = shape(1);
    let mut site = Site::new();
    assert_eq!(site.attach(&shaped_slot_load(&s1, 0)), AttachDecision::Attached);
    assert_eq!(site.attach(&shaped_slot_load(&s1, 0)), AttachDecision::Duplicate);
    assert_eq!(site.entry.num_optimized_stubs(), 1);
}

fn int32_arith(sub: bool) -> CacheIRWriter {
    let mut w = CacheIRWriter::new(CacheKind::BinaryArith);
    let lhs = w.guard_is_int32(w.input_operand(0));
    let rhs = w.guard_is_int32(w.input_operand(1));
    if sub {
        w.int32_sub_result(lhs, rhs);
    } else {
        w.int32_add_result(lhs, rhs);
    }
    w.return_from_ic();
    w
}

#[test]
fn int32_add_and_overflow() {
    let mut site = Site::new();
    site.attach(&int32_arith(false));

    let (a, b) = (Value::from_int32(40), Value::from_int32(2));
    assert_eq!(site.call(a, b), Outcome::Stub(Value::from_int32(42)));
    let neg = Value::from_int32(-7);
    assert_eq!(site.call(neg, b), Outcome::Stub(Value::from_int32(-5)));

    // Inputs were unboxed in place; the fallback must see them boxed again.
    let max = Value::from_int32(i32::MAX);
    assert_eq!(site.call(max, b), Outcome::Fallback(max, b));

    let d = Value::from_double(1.5);
    assert_eq!(site.call(a, d), Outcome::Fallback(a, d));
}

#[test]
fn int32_sub_on_ion_registers() {
    let mut site = Site::with_engine(ICStubEngine::IonSharedIC);
    site.attach(&int32_arith(true));

    let (a, b) = (Value::from_int32(5), Value::from_int32(8));
    assert_eq!(site.call(a, b), Outcome::Stub(Value::from_int32(-3)));
    let min = Value::from_int32(i32::MIN);
    assert_eq!(site.call(min, Value::from_int32(1)), Outcome::Fallback(min, Value::from_int32(1)));
}

#[repr(C)]
struct ArrayStorage {
    header: ObjectElements,
    values: [Value; 3],
}

fn array_length_stub() -> CacheIRWriter {
    let mut w = CacheIRWriter::new(CacheKind::GetProp);
    let val = w.input_operand(0);
    w.guard_is_object(val);
    let obj = w.guard_is_array(val);
    w.load_int32_array_length_result(obj);
    w.return_from_ic();
    w
}

#[test]
fn array_length() {
    let array_group = Box::new(ObjectGroup {
        clasp: &ARRAY_CLASS,
        proto: core::ptr::null(),
    });
    let s = shape(7);
    let mut storage = Box::new(ArrayStorage {
        header: ObjectElements {
            flags: 0,
            initialized_length: 3,
            capacity: 3,
            length: 3,
        },
        values: [Value::undefined(); 3],
    });
    let mut array = Object::new(&array_group, &s, [Value::undefined(); 2]);
    array.header.elements = storage.values.as_mut_ptr();

    let mut site = Site::new();
    site.attach(&array_length_stub());
    assert_eq!(site.call(array.value(), Value::undefined()), Outcome::Stub(Value::from_int32(3)));

    storage.header.length = u32::MAX;
    assert_eq!(
        site.call(array.value(), Value::undefined()),
        Outcome::Fallback(array.value(), Value::undefined())
    );

    let plain_group = plain_group();
    let plain = Object::new(&plain_group, &s, [Value::undefined(); 2]);
    assert_eq!(
        site.call(plain.value(), Value::undefined()),
        Outcome::Fallback(plain.value(), Value::undefined())
    );
}

#[test]
fn dynamic_slots_and_string_length() {
    let group = plain_group();
    let s = shape(3);
    let mut slots = [Value::from_int32(100), Value::from_bool(true)];
    let mut obj = Object::new(&group, &s, [Value::undefined(); 2]);
    obj.header.slots = slots.as_mut_ptr();

    let mut w = CacheIRWriter::new(CacheKind::GetProp);
    let o = w.guard_is_object(w.input_operand(0));
    w.guard_shape(o, &*s);
    w.load_dynamic_slot_result(o, dynamic_slot_offset(1));
    w.return_from_ic();
    let mut site = Site::new();
    site.attach(&w);
    assert_eq!(site.call(obj.value(), Value::undefined()), Outcome::Stub(Value::from_bool(true)));

    let text = Box::new(JSString {
        flags: 0,
        length: 5,
        chars: b"hello".as_ptr(),
    });
    let mut w = CacheIRWriter::new(CacheKind::GetProp);
    let str_id = w.guard_is_string(w.input_operand(0));
    w.load_string_length_result(str_id);
    w.return_from_ic();
    let mut site = Site::new();
    site.attach(&w);
    let value = Value::from_string(&*text);
    assert_eq!(site.call(value, Value::undefined()), Outcome::Stub(Value::from_int32(5)));
}

#[test]
fn prototype_chain_load() {
    let proto_shape = shape(9);
    let proto_group = plain_group();
    let proto = Object::new(&proto_group, &proto_shape, [Value::from_int32(77), Value::undefined()]);
    let fun_group = Box::new(ObjectGroup {
        clasp: &FUNCTION_CLASS,
        proto: &proto.header,
    });
    let s = shape(1);
    let fun = Object::new(&fun_group, &s, [Value::undefined(); 2]);

    let mut w = CacheIRWriter::new(CacheKind::GetProp);
    let obj = w.guard_is_object(w.input_operand(0));
    w.guard_class(obj, ClassKind::Function);
    let holder = w.load_proto(obj);
    w.guard_shape(holder, &*proto_shape);
    w.load_fixed_slot_result(holder, fixed_slot_offset(0));
    w.return_from_ic();

    let mut site = Site::new();
    site.attach(&w);
    assert_eq!(site.call(fun.value(), Value::undefined()), Outcome::Stub(Value::from_int32(77)));
    assert_eq!(
        site.call(proto.value(), Value::undefined()),
        Outcome::Fallback(proto.value(), Value::undefined())
    );
}

/// Enough live objects to push both inputs to the stack before they are
/// guarded.
fn spilling_stub(objects: &[Box<Object>]) -> CacheIRWriter {
    let mut w = CacheIRWriter::new(CacheKind::BinaryArith);
    let loaded: Vec<_> = objects.iter().map(|o| w.load_object(&o.header)).collect();
    let lhs = w.guard_is_int32(w.input_operand(0));
    let rhs = w.guard_is_int32(w.input_operand(1));
    for (id, o) in loaded.iter().zip(objects) {
        w.guard_specific_object(*id, &o.header);
    }
    w.int32_add_result(lhs, rhs);
    w.return_from_ic();
    w
}

#[test]
fn spilled_inputs_are_restored_for_the_fallback() {
    let group = plain_group();
    let s = shape(1);
    let objects: Vec<_> = (0..7)
        .map(|_| Object::new(&group, &s, [Value::undefined(); 2]))
        .collect();

    let w = spilling_stub(&objects);
    let inputs = cacheir::StubInputs::registers(2);
    let compiled =
        cacheir::compile_cache_ir(&w, ICStubEngine::Baseline, &inputs, &JitOptions::default()).unwrap();
    assert!(compiled.stack_bytes() >= 16);

    let mut site = Site::new();
    site.attach(&w);
    let (a, b) = (Value::from_int32(3), Value::from_int32(4));
    assert_eq!(site.call(a, b), Outcome::Stub(Value::from_int32(7)));

    let d = Value::from_double(-0.5);
    assert_eq!(site.call(a, d), Outcome::Fallback(a, d));
    assert_eq!(site.call(d, b), Outcome::Fallback(d, b));
}
