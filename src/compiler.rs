//! CacheIR → x86-64 stub compiler.
//!
//! One forward pass over the program. Every instruction reads its operands
//! through the register allocator, and every guard branches to a failure
//! path that restores the inputs and falls through to the next stub.
//! Failure paths are emitted after the main body, once all of them are
//! known.

use dynasmrt::{AssemblyOffset, DynamicLabel, ExecutableBuffer};
use smallvec::SmallVec;
use tracing::debug;

use crate::arch::{Condition, EmitCtx, INPUT_REGS, OUTPUT_REG, Register, STUB_REG, ValueOperand};
use crate::cacheir::{
    CacheIRReader, CacheIRWriter, CacheOp, Int32OperandId, ObjOperandId, OperandId,
    StringOperandId, SymbolOperandId, TypedOperandId, ValOperandId,
};
use crate::error::CompileError;
use crate::failure::{FailurePath, FailurePaths, emit_failure_path};
use crate::options::JitOptions;
use crate::regalloc::{CacheRegisterAllocator, OperandLocation};
use crate::runtime::{
    ARRAY_CLASS, ClassKind, ELEMENTS_LENGTH_OFFSET, GROUP_CLASP_OFFSET, GROUP_PROTO_OFFSET,
    OBJECT_ELEMENTS_OFFSET, OBJECT_GROUP_OFFSET, OBJECT_SHAPE_OFFSET, OBJECT_SLOTS_OFFSET,
    STRING_LENGTH_OFFSET,
};
use crate::stub::{ICStubEngine, STUB_DATA_OFFSET};
use crate::stub_data::StubFieldType;
use crate::value::{Value, ValueType};

/// Finalized machine code for one stub.
pub struct JitCode {
    buf: ExecutableBuffer,
    entry: AssemblyOffset,
}

impl JitCode {
    /// The raw executable code buffer.
    pub fn code(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn entry_ptr(&self) -> *const u8 {
        self.buf.ptr(self.entry)
    }
}

impl core::fmt::Debug for JitCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JitCode")
            .field("len", &self.buf.len())
            .field("entry", &self.entry.0)
            .finish()
    }
}

/// Where a stub's inputs arrive.
#[derive(Debug, Clone, PartialEq)]
pub struct StubInputs {
    locations: SmallVec<[OperandLocation; 2]>,
}

impl StubInputs {
    /// Every input boxed in its argument register.
    pub fn registers(num_inputs: usize) -> Self {
        assert!(num_inputs <= INPUT_REGS.len(), "at most two stub inputs");
        StubInputs {
            locations: INPUT_REGS[..num_inputs]
                .iter()
                .map(|&reg| OperandLocation::ValueReg {
                    reg: ValueOperand(reg),
                })
                .collect(),
        }
    }

    /// Input `index` is the compile-time constant `value`.
    pub fn with_constant(mut self, index: usize, value: Value) -> Self {
        self.locations[index] = OperandLocation::Constant { value };
        self
    }

    pub fn locations(&self) -> &[OperandLocation] {
        &self.locations
    }
}

/// The result of compiling one CacheIR program.
pub struct StubCode {
    pub code: JitCode,
    failure_paths: Vec<FailurePath>,
    stack_bytes: u32,
}

impl StubCode {
    pub fn num_failure_paths(&self) -> usize {
        self.failure_paths.len()
    }

    /// Peak bytes of spilled operands.
    pub fn stack_bytes(&self) -> u32 {
        self.stack_bytes
    }

    pub fn failure_paths(&self) -> &[FailurePath] {
        &self.failure_paths
    }

    /// One line per failure path: stack depth and where each input is.
    pub fn dump_failure_paths(&self) -> String {
        let mut out = String::new();
        for (i, path) in self.failure_paths.iter().enumerate() {
            let inputs: Vec<String> = path
                .inputs()
                .iter()
                .enumerate()
                .map(|(n, loc)| format!("%{n}={loc}"))
                .collect();
            out.push_str(&format!(
                "failure {i}: pushed={} {}\n",
                path.stack_pushed(),
                inputs.join(" ")
            ));
        }
        out
    }
}

/// Compile `writer`'s program for `engine`.
pub fn compile_cache_ir(
    writer: &CacheIRWriter,
    engine: ICStubEngine,
    inputs: &StubInputs,
    options: &JitOptions,
) -> Result<StubCode, CompileError> {
    assert_eq!(
        inputs.locations().len(),
        writer.num_input_operands(),
        "{} takes {} inputs",
        writer.kind(),
        writer.num_input_operands()
    );

    let mut compiler = CacheIRCompiler::new(writer, engine, inputs, options)?;
    compiler.emit_body()?;
    let stack_bytes = compiler.allocator.max_stack_pushed();
    let (masm, failure_paths) = compiler.emit_failure_paths();
    let entry = masm.entry;
    let buf = masm.finalize()?;
    let code = JitCode { buf, entry };

    debug!(
        target: "cacheir::compiler",
        kind = %writer.kind(),
        engine = ?engine,
        bytes = code.len(),
        failure_paths = failure_paths.len(),
        stack_bytes,
        "compiled stub"
    );
    Ok(StubCode {
        code,
        failure_paths,
        stack_bytes,
    })
}

struct CacheIRCompiler<'w> {
    masm: EmitCtx,
    allocator: CacheRegisterAllocator<'w>,
    failures: FailurePaths,
    writer: &'w CacheIRWriter,
    /// Displacement from the stub register of each stub field.
    field_displacements: Vec<i32>,
}

impl<'w> CacheIRCompiler<'w> {
    fn new(
        writer: &'w CacheIRWriter,
        engine: ICStubEngine,
        inputs: &StubInputs,
        options: &JitOptions,
    ) -> Result<Self, CompileError> {
        let mut allocator = CacheRegisterAllocator::new(writer, engine);
        for (i, loc) in inputs.locations().iter().enumerate() {
            allocator.init_input_location(i, *loc);
        }

        let mut field_displacements = Vec::with_capacity(writer.num_stub_fields());
        let mut offset = STUB_DATA_OFFSET as usize;
        for field in writer.stub_fields() {
            field_displacements.push(offset as i32);
            offset += field.size_in_bytes();
        }

        Ok(CacheIRCompiler {
            masm: EmitCtx::new()?,
            allocator,
            failures: FailurePaths::new(options.share_failure_paths),
            writer,
            field_displacements,
        })
    }

    fn emit_body(&mut self) -> Result<(), CompileError> {
        let code = self.writer.code();
        let mut reader = CacheIRReader::new(code);
        let mut returned = false;
        let mut has_result = false;
        while reader.more() {
            if returned {
                return Err(CompileError::MalformedIr {
                    offset: reader.offset(),
                    reason: "instructions after ReturnFromIC",
                });
            }
            let op_offset = reader.offset();
            let op = reader.read_op()?;
            if op.is_result() {
                // The output register is only free once per stub.
                if has_result {
                    return Err(CompileError::MalformedIr {
                        offset: op_offset,
                        reason: "more than one result",
                    });
                }
                has_result = true;
            }
            returned = op == CacheOp::ReturnFromIC;
            self.emit_op(op, &mut reader)?;
            self.allocator.next_op();
        }
        if !returned {
            return Err(CompileError::MalformedIr {
                offset: code.len(),
                reason: "program does not end in ReturnFromIC",
            });
        }
        Ok(())
    }

    fn emit_failure_paths(mut self) -> (EmitCtx, Vec<FailurePath>) {
        let failures = std::mem::take(&mut self.failures);
        let orig: SmallVec<[OperandLocation; 2]> =
            SmallVec::from_slice(self.allocator.orig_input_locations());
        let mut paths = Vec::with_capacity(failures.len());
        for path in failures.iter() {
            let left = emit_failure_path(&mut self.masm, &orig, path);
            self.allocator.set_stack_pushed(left);
            self.allocator.discard_stack(&mut self.masm);
            self.masm.jump_to_next_stub();
            paths.push(path.clone());
        }
        (self.masm, paths)
    }

    fn emit_op(&mut self, op: CacheOp, reader: &mut CacheIRReader<'_>) -> Result<(), CompileError> {
        match op {
            CacheOp::GuardIsObject => self.emit_guard_type(reader, ValueType::Object),
            CacheOp::GuardIsString => self.emit_guard_type(reader, ValueType::String),
            CacheOp::GuardIsSymbol => self.emit_guard_type(reader, ValueType::Symbol),
            CacheOp::GuardIsInt32 => self.emit_guard_type(reader, ValueType::Int32),
            CacheOp::GuardIsNumber => self.emit_guard_is_number(reader),
            CacheOp::GuardIsArray => self.emit_guard_is_array(reader),
            CacheOp::GuardShape => self.emit_guard_header_field(reader, StubFieldType::Shape, OBJECT_SHAPE_OFFSET),
            CacheOp::GuardGroup => {
                self.emit_guard_header_field(reader, StubFieldType::ObjectGroup, OBJECT_GROUP_OFFSET)
            }
            CacheOp::GuardClass => self.emit_guard_class(reader),
            CacheOp::GuardSpecificObject => {
                let obj = self.obj_operand(reader)?;
                self.emit_guard_specific(reader, obj.0, ValueType::Object, StubFieldType::JSObject)
            }
            CacheOp::GuardSpecificAtom => {
                let string = self.string_operand(reader)?;
                self.emit_guard_specific(reader, string.0, ValueType::String, StubFieldType::String)
            }
            CacheOp::GuardSpecificSymbol => {
                let sym = self.symbol_operand(reader)?;
                self.emit_guard_specific(reader, sym.0, ValueType::Symbol, StubFieldType::Symbol)
            }
            CacheOp::GuardSpecificId => {
                let string = self.string_operand(reader)?;
                self.emit_guard_specific(reader, string.0, ValueType::String, StubFieldType::Id)
            }
            CacheOp::LoadObject => self.emit_load_object(reader),
            CacheOp::LoadProto => self.emit_load_proto(reader),
            CacheOp::LoadFixedSlot => self.emit_load_slot(reader, false),
            CacheOp::LoadDynamicSlot => self.emit_load_slot(reader, true),
            CacheOp::LoadInt32Constant => self.emit_load_int32_constant(reader),
            CacheOp::LoadFixedSlotResult => self.emit_load_slot_result(reader, false),
            CacheOp::LoadDynamicSlotResult => self.emit_load_slot_result(reader, true),
            CacheOp::LoadInt32ArrayLengthResult => self.emit_load_int32_array_length_result(reader),
            CacheOp::LoadStringLengthResult => self.emit_load_string_length_result(reader),
            CacheOp::LoadUndefinedResult => {
                self.emit_load_constant_result(Value::undefined());
                Ok(())
            }
            CacheOp::LoadBooleanResult => {
                let b = reader.read_bool()?;
                self.emit_load_constant_result(Value::from_bool(b));
                Ok(())
            }
            CacheOp::LoadValueResult => self.emit_load_field_result(reader, StubFieldType::Value),
            CacheOp::LoadDoubleResult => self.emit_load_field_result(reader, StubFieldType::RawInt64),
            CacheOp::LoadOperandResult => self.emit_load_operand_result(reader),
            CacheOp::Int32AddResult => self.emit_int32_arith_result(reader, false),
            CacheOp::Int32SubResult => self.emit_int32_arith_result(reader, true),
            CacheOp::ReturnFromIC => {
                self.allocator.discard_stack(&mut self.masm);
                self.masm.ret();
                Ok(())
            }
        }
    }

    // ─── Operand decoding ───────────────────────────────────────────────

    fn operand(&self, reader: &mut CacheIRReader<'_>) -> Result<OperandId, CompileError> {
        let at = reader.offset();
        let id = reader.operand_id()?;
        if id.index() >= self.writer.num_operand_ids() {
            return Err(CompileError::MalformedIr {
                offset: at,
                reason: "operand id out of range",
            });
        }
        Ok(id)
    }

    fn val_operand(&self, reader: &mut CacheIRReader<'_>) -> Result<ValOperandId, CompileError> {
        Ok(ValOperandId(self.operand(reader)?))
    }

    fn obj_operand(&self, reader: &mut CacheIRReader<'_>) -> Result<ObjOperandId, CompileError> {
        Ok(ObjOperandId(self.operand(reader)?))
    }

    fn string_operand(&self, reader: &mut CacheIRReader<'_>) -> Result<StringOperandId, CompileError> {
        Ok(StringOperandId(self.operand(reader)?))
    }

    fn symbol_operand(&self, reader: &mut CacheIRReader<'_>) -> Result<SymbolOperandId, CompileError> {
        Ok(SymbolOperandId(self.operand(reader)?))
    }

    fn int32_operand(&self, reader: &mut CacheIRReader<'_>) -> Result<Int32OperandId, CompileError> {
        Ok(Int32OperandId(self.operand(reader)?))
    }

    /// An operand this instruction defines. Must be fresh.
    fn def_operand(&self, reader: &mut CacheIRReader<'_>) -> Result<OperandId, CompileError> {
        let at = reader.offset();
        let id = self.operand(reader)?;
        if id.index() < self.writer.num_input_operands()
            || self.allocator.operand_location(id) != OperandLocation::Uninitialized
        {
            return Err(CompileError::MalformedIr {
                offset: at,
                reason: "operand defined twice",
            });
        }
        Ok(id)
    }

    /// Displacement of a stub field from the stub register.
    fn field(&self, reader: &mut CacheIRReader<'_>, expected: StubFieldType) -> Result<i32, CompileError> {
        let at = reader.offset();
        let index = reader.stub_field_index()?;
        if index >= self.writer.num_stub_fields() {
            return Err(CompileError::MalformedIr {
                offset: at,
                reason: "stub field index out of range",
            });
        }
        if self.writer.stub_field_type(index) != expected {
            return Err(CompileError::MalformedIr {
                offset: at,
                reason: "stub field has the wrong type",
            });
        }
        Ok(self.field_displacements[index])
    }

    fn add_failure_path(&mut self) -> DynamicLabel {
        self.failures.add(&mut self.masm, &self.allocator)
    }

    // ─── Guards ─────────────────────────────────────────────────────────

    fn emit_guard_type(&mut self, reader: &mut CacheIRReader<'_>, ty: ValueType) -> Result<(), CompileError> {
        let val = self.val_operand(reader)?;
        match self.allocator.known_type(val.0) {
            Some(known) if known == ty => return Ok(()),
            Some(_) => {
                let failure = self.add_failure_path();
                self.masm.jump(failure);
                return Ok(());
            }
            None => {}
        }
        let reg = self.allocator.use_value_register(&mut self.masm, val)?;
        let failure = self.add_failure_path();
        self.masm.branch_test_type(Condition::NotEqual, reg, ty, failure);
        Ok(())
    }

    fn emit_guard_is_number(&mut self, reader: &mut CacheIRReader<'_>) -> Result<(), CompileError> {
        let val = self.val_operand(reader)?;
        match self.allocator.known_type(val.0) {
            Some(ValueType::Int32 | ValueType::Double) => return Ok(()),
            Some(_) => {
                let failure = self.add_failure_path();
                self.masm.jump(failure);
                return Ok(());
            }
            None => {}
        }
        let reg = self.allocator.use_value_register(&mut self.masm, val)?;
        let failure = self.add_failure_path();
        self.masm.branch_test_number(Condition::NotEqual, reg, failure);
        Ok(())
    }

    /// Checks the tag and the class without unboxing the operand, so a
    /// preceding `GuardIsObject` on the same value can share its failure path.
    fn emit_guard_is_array(&mut self, reader: &mut CacheIRReader<'_>) -> Result<(), CompileError> {
        let val = self.val_operand(reader)?;
        let known = self.allocator.known_type(val.0);
        if known.is_some_and(|ty| ty != ValueType::Object) {
            let failure = self.add_failure_path();
            self.masm.jump(failure);
            return Ok(());
        }

        let scratch;
        let failure;
        if known == Some(ValueType::Object) {
            let obj = self.allocator.use_register(&mut self.masm, ObjOperandId(val.0).into())?;
            scratch = self.allocator.allocate_register(&mut self.masm)?;
            failure = self.add_failure_path();
            self.masm.load_ptr(scratch, obj, OBJECT_GROUP_OFFSET);
        } else {
            let reg = self.allocator.use_value_register(&mut self.masm, val)?;
            scratch = self.allocator.allocate_register(&mut self.masm)?;
            failure = self.add_failure_path();
            self.masm.branch_test_type(Condition::NotEqual, reg, ValueType::Object, failure);
            self.masm.unbox(reg, scratch, ValueType::Object);
            self.masm.load_ptr(scratch, scratch, OBJECT_GROUP_OFFSET);
        }
        self.masm.load_ptr(scratch, scratch, GROUP_CLASP_OFFSET);
        self.masm.branch_ptr_imm(
            Condition::NotEqual,
            scratch,
            &ARRAY_CLASS as *const _ as u64,
            failure,
        );
        self.allocator.release_register(scratch);
        Ok(())
    }

    /// Compare a pointer in the object header with a stub field.
    fn emit_guard_header_field(
        &mut self,
        reader: &mut CacheIRReader<'_>,
        field_ty: StubFieldType,
        header_offset: i32,
    ) -> Result<(), CompileError> {
        let obj = self.obj_operand(reader)?;
        let field = self.field(reader, field_ty)?;
        let obj = self.allocator.use_register(&mut self.masm, obj.into())?;
        let scratch = self.allocator.allocate_register(&mut self.masm)?;
        let failure = self.add_failure_path();
        self.masm.load_ptr(scratch, STUB_REG, field);
        self.masm.branch_ptr_mem(Condition::NotEqual, obj, header_offset, scratch, failure);
        self.allocator.release_register(scratch);
        Ok(())
    }

    fn emit_guard_class(&mut self, reader: &mut CacheIRReader<'_>) -> Result<(), CompileError> {
        let obj = self.obj_operand(reader)?;
        let class: ClassKind = reader.class_kind()?;
        let obj = self.allocator.use_register(&mut self.masm, obj.into())?;
        let scratch = self.allocator.allocate_register(&mut self.masm)?;
        let failure = self.add_failure_path();
        self.masm.load_ptr(scratch, obj, OBJECT_GROUP_OFFSET);
        self.masm.load_ptr(scratch, scratch, GROUP_CLASP_OFFSET);
        self.masm.branch_ptr_imm(
            Condition::NotEqual,
            scratch,
            class.class() as *const _ as u64,
            failure,
        );
        self.allocator.release_register(scratch);
        Ok(())
    }

    /// Pointer identity against a stub field. Atoms and symbols are unique,
    /// so identity is equality.
    fn emit_guard_specific(
        &mut self,
        reader: &mut CacheIRReader<'_>,
        id: OperandId,
        ty: ValueType,
        field_ty: StubFieldType,
    ) -> Result<(), CompileError> {
        let field = self.field(reader, field_ty)?;
        let reg = self
            .allocator
            .use_register(&mut self.masm, TypedOperandId { id, ty })?;
        let scratch = self.allocator.allocate_register(&mut self.masm)?;
        let failure = self.add_failure_path();
        self.masm.load_ptr(scratch, STUB_REG, field);
        self.masm.branch_ptr(Condition::NotEqual, reg, scratch, failure);
        self.allocator.release_register(scratch);
        Ok(())
    }

    // ─── Definitions ────────────────────────────────────────────────────

    fn emit_load_object(&mut self, reader: &mut CacheIRReader<'_>) -> Result<(), CompileError> {
        let result = ObjOperandId(self.def_operand(reader)?);
        let field = self.field(reader, StubFieldType::JSObject)?;
        let reg = self.allocator.define_register(&mut self.masm, result.into())?;
        self.masm.load_ptr(reg, STUB_REG, field);
        Ok(())
    }

    fn emit_load_proto(&mut self, reader: &mut CacheIRReader<'_>) -> Result<(), CompileError> {
        let obj = self.obj_operand(reader)?;
        let result = ObjOperandId(self.def_operand(reader)?);
        let obj = self.allocator.use_register(&mut self.masm, obj.into())?;
        let reg = self.allocator.define_register(&mut self.masm, result.into())?;
        self.masm.load_ptr(reg, obj, OBJECT_GROUP_OFFSET);
        self.masm.load_ptr(reg, reg, GROUP_PROTO_OFFSET);
        Ok(())
    }

    fn emit_load_slot(&mut self, reader: &mut CacheIRReader<'_>, dynamic: bool) -> Result<(), CompileError> {
        let obj = self.obj_operand(reader)?;
        let field = self.field(reader, StubFieldType::RawWord)?;
        let result = ValOperandId(self.def_operand(reader)?);
        let obj = self.allocator.use_register(&mut self.masm, obj.into())?;
        let scratch = self.allocator.allocate_register(&mut self.masm)?;
        let out = self.allocator.define_value_register(&mut self.masm, result)?;
        self.load_slot(out.reg(), obj, scratch, field, dynamic);
        self.allocator.release_register(scratch);
        Ok(())
    }

    fn load_slot(&mut self, dest: Register, obj: Register, scratch: Register, field: i32, dynamic: bool) {
        self.masm.load_ptr(scratch, STUB_REG, field);
        if dynamic {
            self.masm.load_ptr(dest, obj, OBJECT_SLOTS_OFFSET);
            self.masm.load_ptr_indexed(dest, dest, scratch);
        } else {
            self.masm.load_ptr_indexed(dest, obj, scratch);
        }
    }

    /// Constants need no register until used.
    fn emit_load_int32_constant(&mut self, reader: &mut CacheIRReader<'_>) -> Result<(), CompileError> {
        let result = self.def_operand(reader)?;
        let value = reader.read_i32()?;
        self.allocator.set_operand_location(
            result,
            OperandLocation::Constant {
                value: Value::from_int32(value),
            },
        );
        Ok(())
    }

    // ─── Results ────────────────────────────────────────────────────────

    fn emit_load_slot_result(&mut self, reader: &mut CacheIRReader<'_>, dynamic: bool) -> Result<(), CompileError> {
        let obj = self.obj_operand(reader)?;
        let field = self.field(reader, StubFieldType::RawWord)?;
        self.allocator.allocate_fixed_register(&mut self.masm, OUTPUT_REG);
        let obj = self.allocator.use_register(&mut self.masm, obj.into())?;
        let scratch = self.allocator.allocate_register(&mut self.masm)?;
        self.load_slot(OUTPUT_REG, obj, scratch, field, dynamic);
        self.allocator.release_register(scratch);
        Ok(())
    }

    fn emit_load_int32_array_length_result(&mut self, reader: &mut CacheIRReader<'_>) -> Result<(), CompileError> {
        let obj = self.obj_operand(reader)?;
        self.allocator.allocate_fixed_register(&mut self.masm, OUTPUT_REG);
        let obj = self.allocator.use_register(&mut self.masm, obj.into())?;
        let scratch = self.allocator.allocate_register(&mut self.masm)?;
        let failure = self.add_failure_path();
        self.masm.load_ptr(scratch, obj, OBJECT_ELEMENTS_OFFSET);
        self.masm.load32(OUTPUT_REG, scratch, ELEMENTS_LENGTH_OFFSET);
        // Lengths above i32::MAX do not fit an int32 result.
        self.masm.branch_test32_signed(OUTPUT_REG, failure);
        self.masm.tag_value(ValueType::Int32, OUTPUT_REG, ValueOperand(OUTPUT_REG));
        self.allocator.release_register(scratch);
        Ok(())
    }

    fn emit_load_string_length_result(&mut self, reader: &mut CacheIRReader<'_>) -> Result<(), CompileError> {
        let string = self.string_operand(reader)?;
        self.allocator.allocate_fixed_register(&mut self.masm, OUTPUT_REG);
        let string = self.allocator.use_register(&mut self.masm, string.into())?;
        self.masm.load32(OUTPUT_REG, string, STRING_LENGTH_OFFSET);
        self.masm.tag_value(ValueType::Int32, OUTPUT_REG, ValueOperand(OUTPUT_REG));
        Ok(())
    }

    fn emit_load_constant_result(&mut self, value: Value) {
        self.allocator.allocate_fixed_register(&mut self.masm, OUTPUT_REG);
        self.masm.move_imm64(OUTPUT_REG, value.bits());
    }

    fn emit_load_field_result(&mut self, reader: &mut CacheIRReader<'_>, ty: StubFieldType) -> Result<(), CompileError> {
        let field = self.field(reader, ty)?;
        self.allocator.allocate_fixed_register(&mut self.masm, OUTPUT_REG);
        self.masm.load_ptr(OUTPUT_REG, STUB_REG, field);
        Ok(())
    }

    fn emit_load_operand_result(&mut self, reader: &mut CacheIRReader<'_>) -> Result<(), CompileError> {
        let val = self.val_operand(reader)?;
        self.allocator.allocate_fixed_register(&mut self.masm, OUTPUT_REG);
        let reg = self.allocator.use_value_register(&mut self.masm, val)?;
        self.masm.move_value(ValueOperand(OUTPUT_REG), reg);
        Ok(())
    }

    fn emit_int32_arith_result(&mut self, reader: &mut CacheIRReader<'_>, sub: bool) -> Result<(), CompileError> {
        let lhs = self.int32_operand(reader)?;
        let rhs = self.int32_operand(reader)?;
        self.allocator.allocate_fixed_register(&mut self.masm, OUTPUT_REG);
        let lhs = self.allocator.use_register(&mut self.masm, lhs.into())?;
        let rhs = self.allocator.use_register(&mut self.masm, rhs.into())?;
        let failure = self.add_failure_path();
        self.masm.mov(OUTPUT_REG, lhs);
        if sub {
            self.masm.sub32_overflow(OUTPUT_REG, rhs, failure);
        } else {
            self.masm.add32_overflow(OUTPUT_REG, rhs, failure);
        }
        self.masm.tag_value(ValueType::Int32, OUTPUT_REG, ValueOperand(OUTPUT_REG));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cacheir::CacheKind;
    use crate::runtime::Shape;

    fn compile(writer: &CacheIRWriter) -> StubCode {
        let inputs = StubInputs::registers(writer.num_input_operands());
        compile_cache_ir(writer, ICStubEngine::Baseline, &inputs, &JitOptions::default()).unwrap()
    }

    #[test]
    fn object_then_array_guard_share_one_failure_path() {
        let mut w = CacheIRWriter::new(CacheKind::GetProp);
        let val = w.input_operand(0);
        w.guard_is_object(val);
        let obj = w.guard_is_array(val);
        w.load_int32_array_length_result(obj);
        w.return_from_ic();

        let stub = compile(&w);
        // The length op unboxes the input, so its overflow check needs a
        // second path.
        insta::assert_snapshot!(stub.dump_failure_paths(), @r"
        failure 0: pushed=0 %0=rdi:value
        failure 1: pushed=0 %0=rdi:Object
        ");
    }

    #[test]
    fn disabling_sharing_gives_every_guard_a_path() {
        let mut w = CacheIRWriter::new(CacheKind::GetProp);
        let val = w.input_operand(0);
        w.guard_is_object(val);
        w.guard_is_array(val);
        w.load_undefined_result();
        w.return_from_ic();

        let options = JitOptions {
            share_failure_paths: false,
            ..JitOptions::default()
        };
        let stub = compile_cache_ir(&w, ICStubEngine::Baseline, &StubInputs::registers(1), &options).unwrap();
        assert_eq!(stub.num_failure_paths(), 2);
    }

    #[test]
    fn known_constant_input_eliminates_the_guard() {
        let build = || {
            let mut w = CacheIRWriter::new(CacheKind::BinaryArith);
            let lhs = w.guard_is_int32(w.input_operand(0));
            let rhs = w.guard_is_int32(w.input_operand(1));
            w.int32_add_result(lhs, rhs);
            w.return_from_ic();
            w
        };
        let w = build();
        let dynamic = compile(&w);
        let inputs = StubInputs::registers(2).with_constant(0, Value::from_int32(4));
        let constant = compile_cache_ir(&w, ICStubEngine::Baseline, &inputs, &JitOptions::default()).unwrap();
        assert!(constant.code.len() < dynamic.code.len());
        // The remaining guard on input 1 and the overflow check.
        assert_eq!(constant.num_failure_paths(), 2);
    }

    #[test]
    fn program_must_end_in_return() {
        let mut w = CacheIRWriter::new(CacheKind::GetProp);
        w.guard_is_object(w.input_operand(0));
        let err = compile_cache_ir(&w, ICStubEngine::Baseline, &StubInputs::registers(1), &JitOptions::default())
            .err()
            .unwrap();
        assert!(matches!(
            err,
            CompileError::MalformedIr {
                reason: "program does not end in ReturnFromIC",
                ..
            }
        ));
    }

    #[test]
    fn code_after_return_is_malformed() {
        let mut w = CacheIRWriter::new(CacheKind::GetProp);
        w.return_from_ic();
        w.load_undefined_result();
        let err = compile_cache_ir(&w, ICStubEngine::Baseline, &StubInputs::registers(1), &JitOptions::default())
            .err()
            .unwrap();
        assert!(matches!(err, CompileError::MalformedIr { offset: 1, .. }));
    }

    #[test]
    fn second_result_is_malformed() {
        let mut w = CacheIRWriter::new(CacheKind::GetProp);
        w.load_undefined_result();
        w.load_undefined_result();
        w.return_from_ic();
        let err = compile_cache_ir(&w, ICStubEngine::Baseline, &StubInputs::registers(1), &JitOptions::default())
            .err()
            .unwrap();
        assert!(matches!(
            err,
            CompileError::MalformedIr {
                offset: 1,
                reason: "more than one result",
            }
        ));
    }

    #[test]
    fn every_shape_guard_has_its_field_loaded_from_stub_data() {
        let mut w = CacheIRWriter::new(CacheKind::GetProp);
        let obj = w.guard_is_object(w.input_operand(0));
        w.guard_shape(obj, 0x1000 as *const Shape);
        w.load_fixed_slot_result(obj, 32);
        w.return_from_ic();
        let stub = compile(&w);
        // Unboxing changes the snapshot; the shape guard gets its own path.
        assert_eq!(stub.num_failure_paths(), 2);
        assert_eq!(stub.stack_bytes(), 0);
    }
}
