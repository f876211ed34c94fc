//! NaN-boxed values as seen by generated stubs.
//!
//! A `Value` is one 64-bit word. Doubles are stored as their raw IEEE bits;
//! every other type lives above `JSVAL_SHIFTED_TAG_MAX_DOUBLE` with a 17-bit
//! tag in the high bits and a 47-bit payload below it.

use core::fmt;

use crate::runtime::{JSString, NativeObject, Symbol};

pub const JSVAL_TAG_SHIFT: u32 = 47;
pub const JSVAL_PAYLOAD_MASK: u64 = (1 << JSVAL_TAG_SHIFT) - 1;

/// Highest tag that still denotes a double.
pub const JSVAL_TAG_MAX_DOUBLE: u32 = 0x1FFF0;
pub const JSVAL_SHIFTED_TAG_MAX_DOUBLE: u64 = (JSVAL_TAG_MAX_DOUBLE as u64) << JSVAL_TAG_SHIFT;

/// The type of a value's payload.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    Double = 0x00,
    Int32 = 0x01,
    Boolean = 0x02,
    Undefined = 0x03,
    Null = 0x04,
    Magic = 0x05,
    String = 0x06,
    Symbol = 0x07,
    PrivateGCThing = 0x08,
    Object = 0x0c,
}

impl ValueType {
    /// Unshifted tag for this type. Doubles have no tag of their own; the
    /// returned value is the upper bound of the double range.
    pub const fn tag(self) -> u32 {
        JSVAL_TAG_MAX_DOUBLE | self as u32
    }

    /// The tag already shifted into boxing position.
    pub const fn shifted_tag(self) -> u64 {
        (self.tag() as u64) << JSVAL_TAG_SHIFT
    }

    /// Whether the unboxed payload is a GC pointer.
    pub const fn is_gc_thing(self) -> bool {
        matches!(
            self,
            ValueType::String | ValueType::Symbol | ValueType::Object | ValueType::PrivateGCThing
        )
    }

    /// Whether the payload is a pointer (unboxed by clearing the tag bits).
    pub const fn is_pointer(self) -> bool {
        self.is_gc_thing()
    }

    fn from_tag_bits(bits: u32) -> Option<ValueType> {
        Some(match bits {
            0x01 => ValueType::Int32,
            0x02 => ValueType::Boolean,
            0x03 => ValueType::Undefined,
            0x04 => ValueType::Null,
            0x05 => ValueType::Magic,
            0x06 => ValueType::String,
            0x07 => ValueType::Symbol,
            0x08 => ValueType::PrivateGCThing,
            0x0c => ValueType::Object,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            ValueType::Double => "Double",
            ValueType::Int32 => "Int32",
            ValueType::Boolean => "Boolean",
            ValueType::Undefined => "Undefined",
            ValueType::Null => "Null",
            ValueType::Magic => "Magic",
            ValueType::String => "String",
            ValueType::Symbol => "Symbol",
            ValueType::PrivateGCThing => "PrivateGCThing",
            ValueType::Object => "Object",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A boxed value.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Value(u64);

impl Value {
    pub const fn from_bits(bits: u64) -> Self {
        Value(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    const fn boxed(ty: ValueType, payload: u64) -> Self {
        Value(ty.shifted_tag() | payload)
    }

    pub const fn undefined() -> Self {
        Self::boxed(ValueType::Undefined, 0)
    }

    pub const fn null() -> Self {
        Self::boxed(ValueType::Null, 0)
    }

    pub const fn from_int32(i: i32) -> Self {
        Self::boxed(ValueType::Int32, i as u32 as u64)
    }

    pub const fn from_bool(b: bool) -> Self {
        Self::boxed(ValueType::Boolean, b as u64)
    }

    pub const fn magic(why: u32) -> Self {
        Self::boxed(ValueType::Magic, why as u64)
    }

    /// Box a double. NaNs are canonicalized so they can never alias a tag.
    pub fn from_double(d: f64) -> Self {
        if d.is_nan() {
            Value(0x7FF8_0000_0000_0000)
        } else {
            Value(d.to_bits())
        }
    }

    pub fn from_object(obj: *const NativeObject) -> Self {
        Self::from_gc_pointer(ValueType::Object, obj as u64)
    }

    pub fn from_string(s: *const JSString) -> Self {
        Self::from_gc_pointer(ValueType::String, s as u64)
    }

    pub fn from_symbol(sym: *const Symbol) -> Self {
        Self::from_gc_pointer(ValueType::Symbol, sym as u64)
    }

    fn from_gc_pointer(ty: ValueType, addr: u64) -> Self {
        debug_assert!(
            addr & !JSVAL_PAYLOAD_MASK == 0,
            "pointer {addr:#x} does not fit in a {ty} payload"
        );
        Self::boxed(ty, addr)
    }

    /// The unshifted 17-bit tag.
    pub const fn tag(self) -> u32 {
        (self.0 >> JSVAL_TAG_SHIFT) as u32
    }

    pub const fn payload(self) -> u64 {
        self.0 & JSVAL_PAYLOAD_MASK
    }

    pub fn value_type(self) -> ValueType {
        if self.is_double() {
            return ValueType::Double;
        }
        ValueType::from_tag_bits(self.tag() & !JSVAL_TAG_MAX_DOUBLE).unwrap_or(ValueType::Magic)
    }

    pub const fn is_double(self) -> bool {
        self.tag() <= JSVAL_TAG_MAX_DOUBLE
    }

    pub const fn is_number(self) -> bool {
        self.tag() <= ValueType::Int32.tag()
    }

    pub const fn is_int32(self) -> bool {
        self.tag() == ValueType::Int32.tag()
    }

    pub const fn is_boolean(self) -> bool {
        self.tag() == ValueType::Boolean.tag()
    }

    pub const fn is_undefined(self) -> bool {
        self.0 == Self::undefined().0
    }

    pub const fn is_object(self) -> bool {
        self.tag() == ValueType::Object.tag()
    }

    pub const fn is_string(self) -> bool {
        self.tag() == ValueType::String.tag()
    }

    pub const fn is_symbol(self) -> bool {
        self.tag() == ValueType::Symbol.tag()
    }

    pub fn is_gc_thing(self) -> bool {
        !self.is_double() && self.value_type().is_gc_thing()
    }

    pub const fn to_int32(self) -> i32 {
        self.0 as u32 as i32
    }

    pub const fn to_bool(self) -> bool {
        self.0 & 1 != 0
    }

    pub fn to_double(self) -> f64 {
        f64::from_bits(self.0)
    }

    pub fn to_object(self) -> *const NativeObject {
        debug_assert!(self.is_object());
        self.payload() as *const NativeObject
    }

    pub fn to_string_ptr(self) -> *const JSString {
        debug_assert!(self.is_string());
        self.payload() as *const JSString
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.value_type() {
            ValueType::Double => write!(f, "Double({})", self.to_double()),
            ValueType::Int32 => write!(f, "Int32({})", self.to_int32()),
            ValueType::Boolean => write!(f, "Boolean({})", self.to_bool()),
            ValueType::Undefined => f.write_str("Undefined"),
            ValueType::Null => f.write_str("Null"),
            ty => write!(f, "{ty}({:#x})", self.payload()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int32_and_double_are_numbers() {
        assert!(Value::from_int32(-7).is_number());
        assert!(Value::from_double(1.5).is_number());
        assert!(!Value::undefined().is_number());
        assert_eq!(Value::from_int32(-7).to_int32(), -7);
        assert_eq!(Value::from_int32(-7).value_type(), ValueType::Int32);
    }

    #[test]
    fn negative_nan_is_canonicalized() {
        let v = Value::from_double(f64::from_bits(0xFFFF_FFFF_FFFF_FFFF));
        assert!(v.is_double());
        assert!(v.to_double().is_nan());
    }

    #[test]
    fn object_tag_sits_above_every_primitive_tag() {
        for ty in [
            ValueType::Int32,
            ValueType::Boolean,
            ValueType::Undefined,
            ValueType::Null,
            ValueType::String,
            ValueType::Symbol,
        ] {
            assert!(ty.tag() < ValueType::Object.tag(), "{ty}");
        }
    }

    #[test]
    fn pointer_payloads_round_trip() {
        let fake = 0x0000_1234_5678_9ab8u64 as *const NativeObject;
        let v = Value::from_object(fake);
        assert!(v.is_object());
        assert!(v.is_gc_thing());
        assert_eq!(v.to_object(), fake);
    }
}
