//! CacheIR: the linear bytecode an inline-cache stub is compiled from.
//!
//! A program is a sequence of `[op][args...]` records. Operand ids and
//! stub-field indices are one byte each, int32 immediates four bytes
//! little-endian. Constants never appear inline; they are appended to the
//! writer's stub-field list and referenced by index, so two programs that
//! differ only in their constants have identical bytes.

use core::fmt;

use crate::error::CompileError;
use crate::runtime::{ClassKind, JSString, NativeObject, ObjectGroup, PropertyKey, Shape, Symbol};
use crate::stub_data::{StubField, StubFieldType};
use crate::value::{Value, ValueType};

// ─── Operand ids ────────────────────────────────────────────────────────────

/// Index of a CacheIR operand. Inputs come first, then every defined value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperandId(pub u16);

impl OperandId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for OperandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// An operand of any type, still boxed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ValOperandId(pub OperandId);

/// An operand known to be an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjOperandId(pub OperandId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StringOperandId(pub OperandId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SymbolOperandId(pub OperandId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Int32OperandId(pub OperandId);

/// An operand id paired with the payload type its uses expect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypedOperandId {
    pub id: OperandId,
    pub ty: ValueType,
}

macro_rules! typed_operand {
    ($($name:ident => $ty:ident),* $(,)?) => {
        $(
            impl From<$name> for TypedOperandId {
                fn from(op: $name) -> TypedOperandId {
                    TypedOperandId { id: op.0, ty: ValueType::$ty }
                }
            }
        )*
    };
}

typed_operand! {
    ObjOperandId => Object,
    StringOperandId => String,
    SymbolOperandId => Symbol,
    Int32OperandId => Int32,
}

// ─── Cache kinds ────────────────────────────────────────────────────────────

/// The kind of IC site a program is written for. Determines the inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKind {
    GetProp,
    GetElem,
    GetName,
    SetProp,
    In,
    HasOwn,
    TypeOf,
    BinaryArith,
    Compare,
}

impl CacheKind {
    pub const ALL: &'static [CacheKind] = &[
        CacheKind::GetProp,
        CacheKind::GetElem,
        CacheKind::GetName,
        CacheKind::SetProp,
        CacheKind::In,
        CacheKind::HasOwn,
        CacheKind::TypeOf,
        CacheKind::BinaryArith,
        CacheKind::Compare,
    ];

    pub fn num_inputs(self) -> usize {
        match self {
            CacheKind::GetProp | CacheKind::GetName | CacheKind::TypeOf => 1,
            CacheKind::GetElem
            | CacheKind::SetProp
            | CacheKind::In
            | CacheKind::HasOwn
            | CacheKind::BinaryArith
            | CacheKind::Compare => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CacheKind::GetProp => "GetProp",
            CacheKind::GetElem => "GetElem",
            CacheKind::GetName => "GetName",
            CacheKind::SetProp => "SetProp",
            CacheKind::In => "In",
            CacheKind::HasOwn => "HasOwn",
            CacheKind::TypeOf => "TypeOf",
            CacheKind::BinaryArith => "BinaryArith",
            CacheKind::Compare => "Compare",
        }
    }

    pub fn from_name(name: &str) -> Option<CacheKind> {
        Self::ALL.iter().copied().find(|k| k.name() == name)
    }
}

impl fmt::Display for CacheKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ─── Opcode table ───────────────────────────────────────────────────────────

/// Argument kinds in an opcode's schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    /// An operand the instruction reads.
    Use,
    /// An operand the instruction defines. Allocated by the writer.
    Def,
    /// A byte holding a [`ClassKind`].
    Class,
    /// A byte holding 0 or 1.
    Bool,
    /// A four-byte little-endian immediate.
    Int32,
    /// Index of a stub field of the given type.
    Field(StubFieldType),
}

const USE: ArgKind = ArgKind::Use;
const DEF: ArgKind = ArgKind::Def;
const CLASS: ArgKind = ArgKind::Class;
const BOOL: ArgKind = ArgKind::Bool;
const INT32: ArgKind = ArgKind::Int32;
const RAW_WORD: ArgKind = ArgKind::Field(StubFieldType::RawWord);
const RAW_INT64: ArgKind = ArgKind::Field(StubFieldType::RawInt64);
const SHAPE: ArgKind = ArgKind::Field(StubFieldType::Shape);
const OBJECT: ArgKind = ArgKind::Field(StubFieldType::JSObject);
const GROUP: ArgKind = ArgKind::Field(StubFieldType::ObjectGroup);
const SYMBOL: ArgKind = ArgKind::Field(StubFieldType::Symbol);
const STRING: ArgKind = ArgKind::Field(StubFieldType::String);
const ID: ArgKind = ArgKind::Field(StubFieldType::Id);
const VALUE: ArgKind = ArgKind::Field(StubFieldType::Value);

macro_rules! cache_ops {
    ($($name:ident => [$($arg:ident),*]),* $(,)?) => {
        /// A CacheIR opcode.
        #[repr(u8)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum CacheOp {
            $($name),*
        }

        impl CacheOp {
            pub const ALL: &'static [CacheOp] = &[$(CacheOp::$name),*];

            pub fn name(self) -> &'static str {
                match self {
                    $(CacheOp::$name => stringify!($name)),*
                }
            }

            /// Argument schema, in encoding order.
            pub fn args(self) -> &'static [ArgKind] {
                match self {
                    $(CacheOp::$name => &[$($arg),*]),*
                }
            }
        }
    };
}

cache_ops! {
    GuardIsObject => [USE],
    GuardIsString => [USE],
    GuardIsSymbol => [USE],
    GuardIsInt32 => [USE],
    GuardIsNumber => [USE],
    GuardIsArray => [USE],
    GuardShape => [USE, SHAPE],
    GuardGroup => [USE, GROUP],
    GuardClass => [USE, CLASS],
    GuardSpecificObject => [USE, OBJECT],
    GuardSpecificAtom => [USE, STRING],
    GuardSpecificSymbol => [USE, SYMBOL],
    GuardSpecificId => [USE, ID],

    LoadObject => [DEF, OBJECT],
    LoadProto => [USE, DEF],
    LoadFixedSlot => [USE, RAW_WORD, DEF],
    LoadDynamicSlot => [USE, RAW_WORD, DEF],
    LoadInt32Constant => [DEF, INT32],

    LoadFixedSlotResult => [USE, RAW_WORD],
    LoadDynamicSlotResult => [USE, RAW_WORD],
    LoadInt32ArrayLengthResult => [USE],
    LoadStringLengthResult => [USE],
    LoadUndefinedResult => [],
    LoadBooleanResult => [BOOL],
    LoadValueResult => [VALUE],
    LoadDoubleResult => [RAW_INT64],
    LoadOperandResult => [USE],
    Int32AddResult => [USE, USE],
    Int32SubResult => [USE, USE],

    ReturnFromIC => [],
}

impl CacheOp {
    pub fn from_u8(byte: u8) -> Option<CacheOp> {
        Self::ALL.get(byte as usize).copied()
    }

    pub fn from_name(name: &str) -> Option<CacheOp> {
        Self::ALL.iter().copied().find(|op| op.name() == name)
    }

    /// Whether the op writes the IC's result.
    pub fn is_result(self) -> bool {
        matches!(
            self,
            CacheOp::LoadFixedSlotResult
                | CacheOp::LoadDynamicSlotResult
                | CacheOp::LoadInt32ArrayLengthResult
                | CacheOp::LoadStringLengthResult
                | CacheOp::LoadUndefinedResult
                | CacheOp::LoadBooleanResult
                | CacheOp::LoadValueResult
                | CacheOp::LoadDoubleResult
                | CacheOp::LoadOperandResult
                | CacheOp::Int32AddResult
                | CacheOp::Int32SubResult
        )
    }

    /// Number of operands the op defines (zero or one).
    pub fn num_defs(self) -> usize {
        self.args().iter().filter(|&&a| a == ArgKind::Def).count()
    }
}

impl fmt::Display for CacheOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One explicit argument passed to [`CacheIRWriter::emit`]. Defined operands
/// are not passed; the writer allocates them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CacheIRArg {
    Operand(OperandId),
    Class(ClassKind),
    Bool(bool),
    Int32(i32),
    Field(StubField),
}

/// Check `args` against `op`'s schema, ignoring `Def` slots.
pub fn check_args(op: CacheOp, args: &[CacheIRArg]) -> Result<(), String> {
    let schema: Vec<ArgKind> = op.args().iter().copied().filter(|&a| a != ArgKind::Def).collect();
    if schema.len() != args.len() {
        return Err(format!(
            "{op} takes {} argument(s), got {}",
            schema.len(),
            args.len()
        ));
    }
    for (i, (kind, arg)) in schema.iter().zip(args).enumerate() {
        let ok = match (kind, arg) {
            (ArgKind::Use, CacheIRArg::Operand(_)) => true,
            (ArgKind::Class, CacheIRArg::Class(_)) => true,
            (ArgKind::Bool, CacheIRArg::Bool(_)) => true,
            (ArgKind::Int32, CacheIRArg::Int32(_)) => true,
            (ArgKind::Field(ty), CacheIRArg::Field(field)) => field.ty() == *ty,
            _ => false,
        };
        if !ok {
            return Err(format!("{op} argument {i}: expected {kind:?}, got {arg:?}"));
        }
    }
    Ok(())
}

// ─── Writer ─────────────────────────────────────────────────────────────────

/// Builds a CacheIR program and its stub fields.
#[derive(Clone)]
pub struct CacheIRWriter {
    kind: CacheKind,
    code: Vec<u8>,
    num_inputs: u16,
    /// Last instruction index that uses each operand, by operand id.
    operand_last_used: Vec<u32>,
    stub_fields: Vec<StubField>,
    num_instructions: u32,
}

impl CacheIRWriter {
    pub fn new(kind: CacheKind) -> Self {
        let num_inputs = kind.num_inputs() as u16;
        CacheIRWriter {
            kind,
            code: Vec::new(),
            num_inputs,
            operand_last_used: vec![0; num_inputs as usize],
            stub_fields: Vec::new(),
            num_instructions: 0,
        }
    }

    pub fn kind(&self) -> CacheKind {
        self.kind
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn code_length(&self) -> usize {
        self.code.len()
    }

    pub fn num_input_operands(&self) -> usize {
        self.num_inputs as usize
    }

    pub fn num_operand_ids(&self) -> usize {
        self.operand_last_used.len()
    }

    pub fn num_instructions(&self) -> u32 {
        self.num_instructions
    }

    pub fn input_operand(&self, index: usize) -> ValOperandId {
        assert!(index < self.num_inputs as usize, "no input {index} for {}", self.kind);
        ValOperandId(OperandId(index as u16))
    }

    pub fn operand_last_used(&self, id: OperandId) -> u32 {
        self.operand_last_used[id.index()]
    }

    /// Whether `id` has no uses at or after instruction `current`.
    pub fn operand_is_dead(&self, id: OperandId, current: u32) -> bool {
        current > self.operand_last_used[id.index()]
    }

    pub fn stub_fields(&self) -> &[StubField] {
        &self.stub_fields
    }

    pub fn num_stub_fields(&self) -> usize {
        self.stub_fields.len()
    }

    pub fn stub_field_type(&self, index: usize) -> StubFieldType {
        self.stub_fields[index].ty()
    }

    /// Append a field and return its index.
    pub fn add_stub_field(&mut self, field: StubField) -> usize {
        self.stub_fields.push(field);
        self.stub_fields.len() - 1
    }

    fn write_op(&mut self, op: CacheOp) {
        self.code.push(op as u8);
    }

    fn write_operand(&mut self, id: OperandId) {
        assert!(id.0 <= u8::MAX as u16, "operand id {id} does not fit in a byte");
        self.code.push(id.0 as u8);
        self.operand_last_used[id.index()] = self.num_instructions;
    }

    fn new_operand(&mut self) -> OperandId {
        let id = OperandId(self.operand_last_used.len() as u16);
        self.operand_last_used.push(self.num_instructions);
        assert!(id.0 <= u8::MAX as u16, "operand id {id} does not fit in a byte");
        self.code.push(id.0 as u8);
        id
    }

    fn write_field(&mut self, field: StubField) {
        let index = self.add_stub_field(field);
        assert!(index <= u8::MAX as usize, "stub field #{index} does not fit in a byte");
        self.code.push(index as u8);
    }

    /// Emit `op` with its explicit arguments. Returns the defined operand,
    /// if the op defines one.
    ///
    /// Panics if `args` does not match the op's schema; use [`check_args`]
    /// first when the arguments come from untrusted input.
    pub fn emit(&mut self, op: CacheOp, args: &[CacheIRArg]) -> Option<OperandId> {
        if let Err(msg) = check_args(op, args) {
            panic!("{msg}");
        }
        self.write_op(op);
        let mut defined = None;
        let mut args = args.iter();
        for kind in op.args() {
            if *kind == ArgKind::Def {
                defined = Some(self.new_operand());
                continue;
            }
            match args.next() {
                Some(CacheIRArg::Operand(id)) => self.write_operand(*id),
                Some(CacheIRArg::Class(class)) => self.code.push(*class as u8),
                Some(CacheIRArg::Bool(b)) => self.code.push(*b as u8),
                Some(CacheIRArg::Int32(imm)) => self.code.extend_from_slice(&imm.to_le_bytes()),
                Some(CacheIRArg::Field(field)) => self.write_field(*field),
                None => unreachable!("argument count checked above"),
            }
        }
        self.num_instructions += 1;
        defined
    }

    fn emit_def(&mut self, op: CacheOp, args: &[CacheIRArg]) -> OperandId {
        match self.emit(op, args) {
            Some(id) => id,
            None => unreachable!("{op} defines an operand"),
        }
    }

    // ─── Guards ─────────────────────────────────────────────────────────

    pub fn guard_is_object(&mut self, val: ValOperandId) -> ObjOperandId {
        self.emit(CacheOp::GuardIsObject, &[CacheIRArg::Operand(val.0)]);
        ObjOperandId(val.0)
    }

    pub fn guard_is_string(&mut self, val: ValOperandId) -> StringOperandId {
        self.emit(CacheOp::GuardIsString, &[CacheIRArg::Operand(val.0)]);
        StringOperandId(val.0)
    }

    pub fn guard_is_symbol(&mut self, val: ValOperandId) -> SymbolOperandId {
        self.emit(CacheOp::GuardIsSymbol, &[CacheIRArg::Operand(val.0)]);
        SymbolOperandId(val.0)
    }

    pub fn guard_is_int32(&mut self, val: ValOperandId) -> Int32OperandId {
        self.emit(CacheOp::GuardIsInt32, &[CacheIRArg::Operand(val.0)]);
        Int32OperandId(val.0)
    }

    pub fn guard_is_number(&mut self, val: ValOperandId) {
        self.emit(CacheOp::GuardIsNumber, &[CacheIRArg::Operand(val.0)]);
    }

    /// Guard that `val` is an array object without unboxing it.
    pub fn guard_is_array(&mut self, val: ValOperandId) -> ObjOperandId {
        self.emit(CacheOp::GuardIsArray, &[CacheIRArg::Operand(val.0)]);
        ObjOperandId(val.0)
    }

    pub fn guard_shape(&mut self, obj: ObjOperandId, shape: *const Shape) {
        self.emit(
            CacheOp::GuardShape,
            &[CacheIRArg::Operand(obj.0), CacheIRArg::Field(StubField::Shape(shape))],
        );
    }

    pub fn guard_group(&mut self, obj: ObjOperandId, group: *const ObjectGroup) {
        self.emit(
            CacheOp::GuardGroup,
            &[
                CacheIRArg::Operand(obj.0),
                CacheIRArg::Field(StubField::ObjectGroup(group)),
            ],
        );
    }

    pub fn guard_class(&mut self, obj: ObjOperandId, class: ClassKind) {
        self.emit(
            CacheOp::GuardClass,
            &[CacheIRArg::Operand(obj.0), CacheIRArg::Class(class)],
        );
    }

    pub fn guard_specific_object(&mut self, obj: ObjOperandId, expected: *const NativeObject) {
        self.emit(
            CacheOp::GuardSpecificObject,
            &[
                CacheIRArg::Operand(obj.0),
                CacheIRArg::Field(StubField::JSObject(expected)),
            ],
        );
    }

    pub fn guard_specific_atom(&mut self, str: StringOperandId, atom: *const JSString) {
        self.emit(
            CacheOp::GuardSpecificAtom,
            &[CacheIRArg::Operand(str.0), CacheIRArg::Field(StubField::String(atom))],
        );
    }

    pub fn guard_specific_symbol(&mut self, sym: SymbolOperandId, expected: *const Symbol) {
        self.emit(
            CacheOp::GuardSpecificSymbol,
            &[CacheIRArg::Operand(sym.0), CacheIRArg::Field(StubField::Symbol(expected))],
        );
    }

    /// Guard that a string operand is the atom `id` names.
    pub fn guard_specific_id(&mut self, str: StringOperandId, id: PropertyKey) {
        self.emit(
            CacheOp::GuardSpecificId,
            &[CacheIRArg::Operand(str.0), CacheIRArg::Field(StubField::Id(id))],
        );
    }

    // ─── Definitions ────────────────────────────────────────────────────

    pub fn load_object(&mut self, obj: *const NativeObject) -> ObjOperandId {
        ObjOperandId(self.emit_def(
            CacheOp::LoadObject,
            &[CacheIRArg::Field(StubField::JSObject(obj))],
        ))
    }

    pub fn load_proto(&mut self, obj: ObjOperandId) -> ObjOperandId {
        ObjOperandId(self.emit_def(CacheOp::LoadProto, &[CacheIRArg::Operand(obj.0)]))
    }

    /// Load the value at byte `offset` from the start of `obj`.
    pub fn load_fixed_slot(&mut self, obj: ObjOperandId, offset: u32) -> ValOperandId {
        ValOperandId(self.emit_def(
            CacheOp::LoadFixedSlot,
            &[
                CacheIRArg::Operand(obj.0),
                CacheIRArg::Field(StubField::RawWord(offset as u64)),
            ],
        ))
    }

    /// Load the value at byte `offset` into `obj`'s slots array.
    pub fn load_dynamic_slot(&mut self, obj: ObjOperandId, offset: u32) -> ValOperandId {
        ValOperandId(self.emit_def(
            CacheOp::LoadDynamicSlot,
            &[
                CacheIRArg::Operand(obj.0),
                CacheIRArg::Field(StubField::RawWord(offset as u64)),
            ],
        ))
    }

    pub fn load_int32_constant(&mut self, value: i32) -> Int32OperandId {
        Int32OperandId(self.emit_def(CacheOp::LoadInt32Constant, &[CacheIRArg::Int32(value)]))
    }

    // ─── Results ────────────────────────────────────────────────────────

    pub fn load_fixed_slot_result(&mut self, obj: ObjOperandId, offset: u32) {
        self.emit(
            CacheOp::LoadFixedSlotResult,
            &[
                CacheIRArg::Operand(obj.0),
                CacheIRArg::Field(StubField::RawWord(offset as u64)),
            ],
        );
    }

    pub fn load_dynamic_slot_result(&mut self, obj: ObjOperandId, offset: u32) {
        self.emit(
            CacheOp::LoadDynamicSlotResult,
            &[
                CacheIRArg::Operand(obj.0),
                CacheIRArg::Field(StubField::RawWord(offset as u64)),
            ],
        );
    }

    pub fn load_int32_array_length_result(&mut self, obj: ObjOperandId) {
        self.emit(CacheOp::LoadInt32ArrayLengthResult, &[CacheIRArg::Operand(obj.0)]);
    }

    pub fn load_string_length_result(&mut self, str: StringOperandId) {
        self.emit(CacheOp::LoadStringLengthResult, &[CacheIRArg::Operand(str.0)]);
    }

    pub fn load_undefined_result(&mut self) {
        self.emit(CacheOp::LoadUndefinedResult, &[]);
    }

    pub fn load_boolean_result(&mut self, b: bool) {
        self.emit(CacheOp::LoadBooleanResult, &[CacheIRArg::Bool(b)]);
    }

    pub fn load_value_result(&mut self, value: Value) {
        self.emit(
            CacheOp::LoadValueResult,
            &[CacheIRArg::Field(StubField::Value(value))],
        );
    }

    pub fn load_double_result(&mut self, d: f64) {
        self.emit(
            CacheOp::LoadDoubleResult,
            &[CacheIRArg::Field(StubField::RawInt64(
                Value::from_double(d).bits(),
            ))],
        );
    }

    pub fn load_operand_result(&mut self, val: ValOperandId) {
        self.emit(CacheOp::LoadOperandResult, &[CacheIRArg::Operand(val.0)]);
    }

    pub fn int32_add_result(&mut self, lhs: Int32OperandId, rhs: Int32OperandId) {
        self.emit(
            CacheOp::Int32AddResult,
            &[CacheIRArg::Operand(lhs.0), CacheIRArg::Operand(rhs.0)],
        );
    }

    pub fn int32_sub_result(&mut self, lhs: Int32OperandId, rhs: Int32OperandId) {
        self.emit(
            CacheOp::Int32SubResult,
            &[CacheIRArg::Operand(lhs.0), CacheIRArg::Operand(rhs.0)],
        );
    }

    pub fn return_from_ic(&mut self) {
        self.emit(CacheOp::ReturnFromIC, &[]);
    }
}

impl fmt::Debug for CacheIRWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Renders the listing accepted by [`crate::cacheir_parse::parse_cacheir`].
impl fmt::Display for CacheIRWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.kind)?;
        for i in 0..self.num_inputs {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", OperandId(i))?;
        }
        writeln!(f, ")")?;

        let mut reader = CacheIRReader::new(&self.code);
        while reader.more() {
            let op = reader.read_op().map_err(|_| fmt::Error)?;
            let mut defs = Vec::new();
            let mut rest = Vec::new();
            for kind in op.args() {
                match kind {
                    ArgKind::Def => defs.push(reader.operand_id().map_err(|_| fmt::Error)?.to_string()),
                    ArgKind::Use => rest.push(reader.operand_id().map_err(|_| fmt::Error)?.to_string()),
                    ArgKind::Class => rest.push(reader.class_kind().map_err(|_| fmt::Error)?.to_string()),
                    ArgKind::Bool => rest.push(reader.read_bool().map_err(|_| fmt::Error)?.to_string()),
                    ArgKind::Int32 => rest.push(reader.read_i32().map_err(|_| fmt::Error)?.to_string()),
                    ArgKind::Field(_) => {
                        rest.push(format!("#{}", reader.stub_field_index().map_err(|_| fmt::Error)?))
                    }
                }
            }
            f.write_str("  ")?;
            if !defs.is_empty() {
                write!(f, "{} = ", defs.join(", "))?;
            }
            f.write_str(op.name())?;
            if !rest.is_empty() {
                write!(f, " {}", rest.join(", "))?;
            }
            writeln!(f)?;
        }

        if !self.stub_fields.is_empty() {
            writeln!(f, "fields:")?;
            for (i, field) in self.stub_fields.iter().enumerate() {
                writeln!(f, "  #{i} {} {:#x}", field.ty(), field.word())?;
            }
        }
        Ok(())
    }
}

// ─── Reader ─────────────────────────────────────────────────────────────────

/// Cursor over CacheIR bytes. Never mutates the program.
pub struct CacheIRReader<'a> {
    code: &'a [u8],
    pos: usize,
}

impl<'a> CacheIRReader<'a> {
    pub fn new(code: &'a [u8]) -> Self {
        CacheIRReader { code, pos: 0 }
    }

    pub fn more(&self) -> bool {
        self.pos < self.code.len()
    }

    pub fn offset(&self) -> usize {
        self.pos
    }

    fn malformed(&self, reason: &'static str) -> CompileError {
        CompileError::MalformedIr {
            offset: self.pos,
            reason,
        }
    }

    pub fn read_byte(&mut self) -> Result<u8, CompileError> {
        let byte = *self
            .code
            .get(self.pos)
            .ok_or_else(|| self.malformed("unexpected end of code"))?;
        self.pos += 1;
        Ok(byte)
    }

    pub fn read_op(&mut self) -> Result<CacheOp, CompileError> {
        let byte = self.read_byte()?;
        CacheOp::from_u8(byte).ok_or(CompileError::MalformedIr {
            offset: self.pos - 1,
            reason: "unknown opcode",
        })
    }

    pub fn operand_id(&mut self) -> Result<OperandId, CompileError> {
        Ok(OperandId(self.read_byte()? as u16))
    }

    pub fn val_operand_id(&mut self) -> Result<ValOperandId, CompileError> {
        Ok(ValOperandId(self.operand_id()?))
    }

    pub fn obj_operand_id(&mut self) -> Result<ObjOperandId, CompileError> {
        Ok(ObjOperandId(self.operand_id()?))
    }

    pub fn string_operand_id(&mut self) -> Result<StringOperandId, CompileError> {
        Ok(StringOperandId(self.operand_id()?))
    }

    pub fn symbol_operand_id(&mut self) -> Result<SymbolOperandId, CompileError> {
        Ok(SymbolOperandId(self.operand_id()?))
    }

    pub fn int32_operand_id(&mut self) -> Result<Int32OperandId, CompileError> {
        Ok(Int32OperandId(self.operand_id()?))
    }

    pub fn typed_operand_id(&mut self, ty: ValueType) -> Result<TypedOperandId, CompileError> {
        Ok(TypedOperandId {
            id: self.operand_id()?,
            ty,
        })
    }

    pub fn stub_field_index(&mut self) -> Result<usize, CompileError> {
        Ok(self.read_byte()? as usize)
    }

    pub fn read_bool(&mut self) -> Result<bool, CompileError> {
        match self.read_byte()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(CompileError::MalformedIr {
                offset: self.pos - 1,
                reason: "boolean byte out of range",
            }),
        }
    }

    pub fn read_i32(&mut self) -> Result<i32, CompileError> {
        let bytes = self
            .code
            .get(self.pos..self.pos + 4)
            .ok_or_else(|| self.malformed("truncated int32 immediate"))?;
        let mut buf = [0u8; 4];
        buf.copy_from_slice(bytes);
        self.pos += 4;
        Ok(i32::from_le_bytes(buf))
    }

    pub fn class_kind(&mut self) -> Result<ClassKind, CompileError> {
        let byte = self.read_byte()?;
        ClassKind::from_u8(byte).ok_or(CompileError::MalformedIr {
            offset: self.pos - 1,
            reason: "unknown class kind",
        })
    }
}
