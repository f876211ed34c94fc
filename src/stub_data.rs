//! Stub fields and the packed data block trailing every stub.
//!
//! A CacheIR program captures its constants (shapes, slot offsets, values...)
//! as an ordered list of stub fields. The machine code never embeds them;
//! it loads them from the stub's trailing data, so every stub compiled from
//! the same CacheIR bytes can share one piece of code and one
//! [`CacheIRStubInfo`]. The field order and types are the only layout
//! contract between the writer, the stub memory and the garbage collector.

use core::fmt;

use crate::cacheir::{CacheIRWriter, CacheKind};
use crate::error::CompileError;
use crate::gc::{Tracer, WriteBarrier};
use crate::runtime::{JSString, NativeObject, ObjectGroup, PropertyKey, Shape, Symbol};
use crate::stub::ICStubEngine;
use crate::value::Value;

// ─── Field types ────────────────────────────────────────────────────────────

/// Type of a stub field, stored as one byte in [`CacheIRStubInfo`].
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StubFieldType {
    RawWord = 0,
    RawInt64 = 1,
    Shape = 2,
    JSObject = 3,
    ObjectGroup = 4,
    Symbol = 5,
    String = 6,
    Id = 7,
    Value = 8,
    /// Terminates the field-type list.
    Limit = 9,
}

impl StubFieldType {
    const ALL: [StubFieldType; 10] = [
        StubFieldType::RawWord,
        StubFieldType::RawInt64,
        StubFieldType::Shape,
        StubFieldType::JSObject,
        StubFieldType::ObjectGroup,
        StubFieldType::Symbol,
        StubFieldType::String,
        StubFieldType::Id,
        StubFieldType::Value,
        StubFieldType::Limit,
    ];

    pub fn from_u8(byte: u8) -> Option<StubFieldType> {
        Self::ALL.get(byte as usize).copied()
    }

    pub fn from_name(name: &str) -> Option<StubFieldType> {
        Self::ALL.iter().copied().find(|ty| ty.name() == name)
    }

    /// Bytes the field occupies in stub data.
    pub const fn size_in_bytes(self) -> usize {
        match self {
            StubFieldType::RawInt64 | StubFieldType::Value => core::mem::size_of::<u64>(),
            StubFieldType::RawWord
            | StubFieldType::Shape
            | StubFieldType::JSObject
            | StubFieldType::ObjectGroup
            | StubFieldType::Symbol
            | StubFieldType::String
            | StubFieldType::Id => core::mem::size_of::<usize>(),
            StubFieldType::Limit => panic!("Limit has no size"),
        }
    }

    /// Whether the field holds (or may hold) a GC pointer.
    pub const fn is_gc_type(self) -> bool {
        !matches!(
            self,
            StubFieldType::RawWord | StubFieldType::RawInt64 | StubFieldType::Limit
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            StubFieldType::RawWord => "RawWord",
            StubFieldType::RawInt64 => "RawInt64",
            StubFieldType::Shape => "Shape",
            StubFieldType::JSObject => "JSObject",
            StubFieldType::ObjectGroup => "ObjectGroup",
            StubFieldType::Symbol => "Symbol",
            StubFieldType::String => "String",
            StubFieldType::Id => "Id",
            StubFieldType::Value => "Value",
            StubFieldType::Limit => "Limit",
        }
    }
}

impl fmt::Display for StubFieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One captured constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StubField {
    RawWord(u64),
    RawInt64(u64),
    Shape(*const Shape),
    JSObject(*const NativeObject),
    ObjectGroup(*const ObjectGroup),
    Symbol(*const Symbol),
    String(*const JSString),
    Id(PropertyKey),
    Value(Value),
}

impl StubField {
    pub fn ty(&self) -> StubFieldType {
        match self {
            StubField::RawWord(_) => StubFieldType::RawWord,
            StubField::RawInt64(_) => StubFieldType::RawInt64,
            StubField::Shape(_) => StubFieldType::Shape,
            StubField::JSObject(_) => StubFieldType::JSObject,
            StubField::ObjectGroup(_) => StubFieldType::ObjectGroup,
            StubField::Symbol(_) => StubFieldType::Symbol,
            StubField::String(_) => StubFieldType::String,
            StubField::Id(_) => StubFieldType::Id,
            StubField::Value(_) => StubFieldType::Value,
        }
    }

    /// The bits written into stub data.
    pub fn word(&self) -> u64 {
        match *self {
            StubField::RawWord(w) | StubField::RawInt64(w) => w,
            StubField::Shape(p) => p as u64,
            StubField::JSObject(p) => p as u64,
            StubField::ObjectGroup(p) => p as u64,
            StubField::Symbol(p) => p as u64,
            StubField::String(p) => p as u64,
            StubField::Id(id) => id.bits(),
            StubField::Value(v) => v.bits(),
        }
    }

    /// Rebuild a field from its type and raw bits.
    pub fn from_word(ty: StubFieldType, word: u64) -> Option<StubField> {
        Some(match ty {
            StubFieldType::RawWord => StubField::RawWord(word),
            StubFieldType::RawInt64 => StubField::RawInt64(word),
            StubFieldType::Shape => StubField::Shape(word as *const Shape),
            StubFieldType::JSObject => StubField::JSObject(word as *const NativeObject),
            StubFieldType::ObjectGroup => StubField::ObjectGroup(word as *const ObjectGroup),
            StubFieldType::Symbol => StubField::Symbol(word as *const Symbol),
            StubFieldType::String => StubField::String(word as *const JSString),
            StubFieldType::Id => StubField::Id(PropertyKey::from_bits(word)),
            StubFieldType::Value => StubField::Value(Value::from_bits(word)),
            StubFieldType::Limit => return None,
        })
    }

    pub fn size_in_bytes(&self) -> usize {
        self.ty().size_in_bytes()
    }
}

fn read_word(bytes: &[u8], offset: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_ne_bytes(buf)
}

fn write_word(bytes: &mut [u8], offset: usize, word: u64) {
    bytes[offset..offset + 8].copy_from_slice(&word.to_ne_bytes());
}

/// Store a GC-typed field and run the post barrier for it.
fn init_gc_field(
    bytes: &mut [u8],
    offset: usize,
    ty: StubFieldType,
    word: u64,
    barrier: &dyn WriteBarrier,
) {
    write_word(bytes, offset, word);
    let slot = bytes[offset..].as_mut_ptr() as *mut u64;
    barrier.post_barrier(ty, slot, word);
}

// ─── Stub info ──────────────────────────────────────────────────────────────

/// Immutable description shared by every stub compiled from identical
/// CacheIR bytes: the bytes themselves, the field types and where stub data
/// begins inside a stub.
pub struct CacheIRStubInfo {
    kind: CacheKind,
    engine: ICStubEngine,
    makes_gc_calls: bool,
    stub_data_offset: u32,
    code_length: u32,
    /// CacheIR code, then one type byte per field, then `Limit`.
    data: Box<[u8]>,
}

impl CacheIRStubInfo {
    /// Build the info block for `writer`'s program in one allocation.
    ///
    /// Allocation failure is reported rather than aborting so the caller can
    /// leave the IC site uncached.
    pub fn new(
        kind: CacheKind,
        engine: ICStubEngine,
        makes_gc_calls: bool,
        stub_data_offset: u32,
        writer: &CacheIRWriter,
    ) -> Result<CacheIRStubInfo, CompileError> {
        let code = writer.code();
        let num_fields = writer.num_stub_fields();
        // +1 for the Limit terminator.
        let bytes_needed = code.len() + num_fields + 1;

        let mut data = Vec::new();
        data.try_reserve_exact(bytes_needed)
            .map_err(|_| CompileError::StubInfoAlloc {
                bytes: core::mem::size_of::<CacheIRStubInfo>() + bytes_needed,
            })?;
        data.extend_from_slice(code);
        data.extend(writer.stub_fields().iter().map(|f| f.ty() as u8));
        data.push(StubFieldType::Limit as u8);

        Ok(CacheIRStubInfo {
            kind,
            engine,
            makes_gc_calls,
            stub_data_offset,
            code_length: code.len() as u32,
            data: data.into_boxed_slice(),
        })
    }

    pub fn kind(&self) -> CacheKind {
        self.kind
    }

    pub fn engine(&self) -> ICStubEngine {
        self.engine
    }

    pub fn makes_gc_calls(&self) -> bool {
        self.makes_gc_calls
    }

    pub fn stub_data_offset(&self) -> u32 {
        self.stub_data_offset
    }

    pub fn code(&self) -> &[u8] {
        &self.data[..self.code_length as usize]
    }

    pub fn code_length(&self) -> usize {
        self.code_length as usize
    }

    /// Type of field `index`; `Limit` one past the last field.
    pub fn field_type(&self, index: usize) -> StubFieldType {
        let byte = self.data[self.code_length as usize + index];
        StubFieldType::ALL[byte as usize]
    }

    /// Field types up to (not including) the terminator.
    pub fn field_types(&self) -> impl Iterator<Item = StubFieldType> + '_ {
        self.data[self.code_length as usize..]
            .iter()
            .map(|&b| StubFieldType::ALL[b as usize])
            .take_while(|&ty| ty != StubFieldType::Limit)
    }

    pub fn num_stub_fields(&self) -> usize {
        self.field_types().count()
    }

    pub fn stub_data_size(&self) -> usize {
        let mut field = 0;
        let mut size = 0;
        loop {
            let ty = self.field_type(field);
            if ty == StubFieldType::Limit {
                return size;
            }
            size += ty.size_in_bytes();
            field += 1;
        }
    }

    /// Byte offset of field `index` within stub data.
    pub fn field_offset(&self, index: usize) -> usize {
        self.field_types().take(index).map(|ty| ty.size_in_bytes()).sum()
    }

    /// Copy every field from one stub's data to another's. GC-typed fields
    /// are initialized through `barrier`; raw fields are plain copies.
    pub fn copy_stub_data(&self, src: &[u8], dest: &mut [u8], barrier: &dyn WriteBarrier) {
        let mut offset = 0;
        for ty in self.field_types() {
            let word = read_word(src, offset);
            if ty.is_gc_type() {
                init_gc_field(dest, offset, ty, word, barrier);
            } else {
                write_word(dest, offset, word);
            }
            offset += ty.size_in_bytes();
        }
    }

    /// Read field `index` back out of stub data.
    pub fn stub_field(&self, data: &[u8], index: usize) -> Option<StubField> {
        let ty = self.field_type(index);
        StubField::from_word(ty, read_word(data, self.field_offset(index)))
    }

    /// Visit every GC pointer held in stub data. The tracer may update the
    /// field in place. `Id` and `Value` fields are only visited when they
    /// currently hold a GC thing, so integer keys and primitives are skipped.
    pub fn trace_stub_data(&self, data: &mut [u8], tracer: &mut dyn Tracer) {
        let mut offset = 0;
        for ty in self.field_types() {
            if ty.is_gc_type() {
                let mut word = read_word(data, offset);
                let holds_gc_thing = match ty {
                    StubFieldType::Id => PropertyKey::from_bits(word).is_gc_thing(),
                    StubFieldType::Value => Value::from_bits(word).is_gc_thing(),
                    _ => true,
                };
                if holds_gc_thing {
                    tracer.trace_edge(ty, &mut word);
                    write_word(data, offset, word);
                }
            }
            offset += ty.size_in_bytes();
        }
    }
}

impl fmt::Debug for CacheIRStubInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheIRStubInfo")
            .field("kind", &self.kind)
            .field("engine", &self.engine)
            .field("code_length", &self.code_length)
            .field("fields", &self.field_types().collect::<Vec<_>>())
            .finish()
    }
}

// ─── Writer-side serialization ──────────────────────────────────────────────

impl CacheIRWriter {
    /// Total bytes of stub data this program's fields need.
    pub fn stub_data_size(&self) -> usize {
        self.stub_fields().iter().map(|f| f.size_in_bytes()).sum()
    }

    /// Serialize the pending fields into fresh stub memory.
    pub fn copy_stub_data(&self, dest: &mut [u8], barrier: &dyn WriteBarrier) {
        assert!(dest.len() >= self.stub_data_size(), "stub data too small");
        let mut offset = 0;
        for field in self.stub_fields() {
            let ty = field.ty();
            if ty.is_gc_type() {
                init_gc_field(dest, offset, ty, field.word(), barrier);
            } else {
                write_word(dest, offset, field.word());
            }
            offset += ty.size_in_bytes();
        }
    }

    /// Whether `stub_data` holds exactly the fields this writer would write.
    pub fn stub_data_equals(&self, stub_data: &[u8]) -> bool {
        if stub_data.len() < self.stub_data_size() {
            return false;
        }
        let mut offset = 0;
        for field in self.stub_fields() {
            if read_word(stub_data, offset) != field.word() {
                return false;
            }
            offset += field.size_in_bytes();
        }
        true
    }
}
