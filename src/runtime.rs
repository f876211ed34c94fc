//! In-memory object model read by generated stubs.
//!
//! All layouts are `#[repr(C)]` so field offsets are stable and can be baked
//! into machine code. The garbage collector that owns these objects lives
//! outside this crate; stubs only ever read them.

use core::fmt;

use crate::value::Value;

/// A class descriptor. Stubs compare class pointers, never contents.
#[repr(C)]
pub struct Class {
    pub name: &'static str,
}

pub static ARRAY_CLASS: Class = Class { name: "Array" };
pub static PLAIN_OBJECT_CLASS: Class = Class { name: "Object" };
pub static FUNCTION_CLASS: Class = Class { name: "Function" };

/// Classes a `GuardClass` instruction can test for.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClassKind {
    Array = 0,
    PlainObject = 1,
    Function = 2,
}

impl ClassKind {
    pub fn from_u8(byte: u8) -> Option<ClassKind> {
        Some(match byte {
            0 => ClassKind::Array,
            1 => ClassKind::PlainObject,
            2 => ClassKind::Function,
            _ => return None,
        })
    }

    pub fn from_name(name: &str) -> Option<ClassKind> {
        [ClassKind::Array, ClassKind::PlainObject, ClassKind::Function]
            .into_iter()
            .find(|k| k.name() == name)
    }

    pub fn class(self) -> &'static Class {
        match self {
            ClassKind::Array => &ARRAY_CLASS,
            ClassKind::PlainObject => &PLAIN_OBJECT_CLASS,
            ClassKind::Function => &FUNCTION_CLASS,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ClassKind::Array => "Array",
            ClassKind::PlainObject => "PlainObject",
            ClassKind::Function => "Function",
        }
    }
}

impl fmt::Display for ClassKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Type information shared by objects with the same class and prototype.
#[repr(C)]
pub struct ObjectGroup {
    pub clasp: *const Class,
    pub proto: *const NativeObject,
}

/// Property layout descriptor. Two objects with the same shape pointer have
/// their properties in the same slots.
#[repr(C)]
pub struct Shape {
    pub id: u32,
    pub num_fixed_slots: u32,
}

/// Object header. Fixed slots follow the header directly in memory.
#[repr(C)]
pub struct NativeObject {
    pub group: *const ObjectGroup,
    pub shape: *const Shape,
    /// Out-of-line slot storage.
    pub slots: *mut Value,
    /// Points just past an [`ObjectElements`] header.
    pub elements: *mut Value,
}

/// Header stored immediately before an object's element storage.
#[repr(C)]
pub struct ObjectElements {
    pub flags: u32,
    pub initialized_length: u32,
    pub capacity: u32,
    pub length: u32,
}

#[repr(C)]
pub struct JSString {
    pub flags: u32,
    pub length: u32,
    pub chars: *const u8,
}

#[repr(C)]
pub struct Symbol {
    pub code: u32,
    pub description: *const JSString,
}

/// A property key word. Atoms are stored untagged, symbols with
/// `SYMBOL_TAG` in the low bits, and integers as `(i << 1) | 1`.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PropertyKey(u64);

impl PropertyKey {
    const TYPE_MASK: u64 = 0x7;
    const INT_TAG: u64 = 0x1;
    const SYMBOL_TAG: u64 = 0x4;

    pub fn from_atom(atom: *const JSString) -> Self {
        debug_assert!(atom as u64 & Self::TYPE_MASK == 0);
        PropertyKey(atom as u64)
    }

    pub fn from_symbol(sym: *const Symbol) -> Self {
        debug_assert!(sym as u64 & Self::TYPE_MASK == 0);
        PropertyKey(sym as u64 | Self::SYMBOL_TAG)
    }

    pub fn from_int(i: u32) -> Self {
        PropertyKey(((i as u64) << 1) | Self::INT_TAG)
    }

    pub const fn from_bits(bits: u64) -> Self {
        PropertyKey(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub fn is_atom(self) -> bool {
        self.0 & Self::TYPE_MASK == 0 && self.0 != 0
    }

    pub fn is_symbol(self) -> bool {
        self.0 & Self::TYPE_MASK == Self::SYMBOL_TAG
    }

    pub fn is_int(self) -> bool {
        self.0 & Self::INT_TAG != 0
    }

    /// Whether the key refers to a GC thing that tracing must visit.
    pub fn is_gc_thing(self) -> bool {
        self.is_atom() || self.is_symbol()
    }
}

impl fmt::Debug for PropertyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_int() {
            write!(f, "PropertyKey(int {})", self.0 >> 1)
        } else if self.is_symbol() {
            write!(f, "PropertyKey(symbol {:#x})", self.0 & !Self::TYPE_MASK)
        } else {
            write!(f, "PropertyKey(atom {:#x})", self.0)
        }
    }
}

// Field offset constants for use from JIT code.
pub const OBJECT_GROUP_OFFSET: i32 = core::mem::offset_of!(NativeObject, group) as i32;
pub const OBJECT_SHAPE_OFFSET: i32 = core::mem::offset_of!(NativeObject, shape) as i32;
pub const OBJECT_SLOTS_OFFSET: i32 = core::mem::offset_of!(NativeObject, slots) as i32;
pub const OBJECT_ELEMENTS_OFFSET: i32 = core::mem::offset_of!(NativeObject, elements) as i32;
pub const OBJECT_FIXED_SLOTS_OFFSET: u32 = core::mem::size_of::<NativeObject>() as u32;
pub const GROUP_CLASP_OFFSET: i32 = core::mem::offset_of!(ObjectGroup, clasp) as i32;
pub const GROUP_PROTO_OFFSET: i32 = core::mem::offset_of!(ObjectGroup, proto) as i32;
pub const STRING_LENGTH_OFFSET: i32 = core::mem::offset_of!(JSString, length) as i32;
/// Offset of `ObjectElements::length` relative to the elements pointer.
pub const ELEMENTS_LENGTH_OFFSET: i32 = core::mem::offset_of!(ObjectElements, length) as i32
    - core::mem::size_of::<ObjectElements>() as i32;

/// Byte offset of fixed slot `index` from the start of the object.
pub const fn fixed_slot_offset(index: u32) -> u32 {
    OBJECT_FIXED_SLOTS_OFFSET + index * core::mem::size_of::<Value>() as u32
}

/// Byte offset of dynamic slot `index` from the start of the slots array.
pub const fn dynamic_slot_offset(index: u32) -> u32 {
    index * core::mem::size_of::<Value>() as u32
}
