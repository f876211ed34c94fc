//! On-the-fly register allocation for CacheIR operands.
//!
//! Stubs are straight-line code, so allocation is a single forward pass in
//! instruction order. Each operand has exactly one current location. When no
//! register is free, dead operands are reclaimed first, then one operand not
//! used by the current instruction is pushed onto the native stack.
//! Inputs are never reclaimed: every failure path must be able to restore
//! them.

use core::fmt;

use smallvec::SmallVec;
use tracing::trace;

use crate::arch::{EmitCtx, Register, RegisterSet, ValueOperand, allocatable_regs};
use crate::cacheir::{CacheIRWriter, OperandId, TypedOperandId, ValOperandId};
use crate::error::CompileError;
use crate::stub::ICStubEngine;
use crate::value::{Value, ValueType};

/// Where an operand's value currently lives.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum OperandLocation {
    Uninitialized,
    /// Unboxed payload of a known type.
    PayloadReg { reg: Register, ty: ValueType },
    /// Boxed value.
    ValueReg { reg: ValueOperand },
    /// Unboxed payload spilled to the stack. `offset` is the value of
    /// `stack_pushed` right after the push.
    PayloadStack { offset: u32, ty: ValueType },
    ValueStack { offset: u32 },
    Constant { value: Value },
}

impl OperandLocation {
    /// The register this location occupies, if any.
    pub fn register(&self) -> Option<Register> {
        match *self {
            OperandLocation::PayloadReg { reg, .. } => Some(reg),
            OperandLocation::ValueReg { reg } => Some(reg.reg()),
            _ => None,
        }
    }

    pub fn is_on_stack(&self) -> bool {
        matches!(
            self,
            OperandLocation::PayloadStack { .. } | OperandLocation::ValueStack { .. }
        )
    }
}

impl fmt::Display for OperandLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperandLocation::Uninitialized => f.write_str("uninitialized"),
            OperandLocation::PayloadReg { reg, ty } => write!(f, "{reg}:{ty}"),
            OperandLocation::ValueReg { reg } => write!(f, "{reg}:value"),
            OperandLocation::PayloadStack { offset, ty } => write!(f, "stack[{offset}]:{ty}"),
            OperandLocation::ValueStack { offset } => write!(f, "stack[{offset}]:value"),
            OperandLocation::Constant { value } => write!(f, "const {value}"),
        }
    }
}

pub struct CacheRegisterAllocator<'w> {
    writer: &'w CacheIRWriter,
    orig_input_locations: SmallVec<[OperandLocation; 2]>,
    operand_locations: Vec<OperandLocation>,
    /// Every register this engine may hand out.
    allocatable_regs: RegisterSet,
    /// Registers currently free.
    available_regs: RegisterSet,
    /// Registers used by the instruction being compiled. Never spilled.
    current_op_regs: RegisterSet,
    stack_pushed: u32,
    max_stack_pushed: u32,
    current_instruction: u32,
}

impl<'w> CacheRegisterAllocator<'w> {
    pub fn new(writer: &'w CacheIRWriter, engine: ICStubEngine) -> Self {
        let allocatable_regs = allocatable_regs(engine);
        CacheRegisterAllocator {
            writer,
            orig_input_locations: SmallVec::from_elem(
                OperandLocation::Uninitialized,
                writer.num_input_operands(),
            ),
            operand_locations: vec![OperandLocation::Uninitialized; writer.num_operand_ids()],
            allocatable_regs,
            available_regs: allocatable_regs,
            current_op_regs: RegisterSet::empty(),
            stack_pushed: 0,
            max_stack_pushed: 0,
            current_instruction: 0,
        }
    }

    /// Record where input `index` arrives. Must be called for every input
    /// before the first instruction.
    pub fn init_input_location(&mut self, index: usize, loc: OperandLocation) {
        assert!(
            matches!(
                loc,
                OperandLocation::ValueReg { .. } | OperandLocation::Constant { .. }
            ),
            "input {index} must arrive boxed in a register or as a constant, not {loc}"
        );
        if let Some(reg) = loc.register() {
            self.available_regs.take(reg);
        }
        self.orig_input_locations[index] = loc;
        self.operand_locations[index] = loc;
    }

    pub fn num_inputs(&self) -> usize {
        self.orig_input_locations.len()
    }

    pub fn orig_input_location(&self, index: usize) -> OperandLocation {
        self.orig_input_locations[index]
    }

    pub fn orig_input_locations(&self) -> &[OperandLocation] {
        &self.orig_input_locations
    }

    /// Current locations of the inputs, in input order.
    pub fn input_locations(&self) -> &[OperandLocation] {
        &self.operand_locations[..self.num_inputs()]
    }

    pub fn operand_location(&self, id: OperandId) -> OperandLocation {
        self.operand_locations[id.index()]
    }

    pub fn set_operand_location(&mut self, id: OperandId, loc: OperandLocation) {
        self.operand_locations[id.index()] = loc;
    }

    pub fn stack_pushed(&self) -> u32 {
        self.stack_pushed
    }

    /// Used after a failure path has been emitted, to put back the state the
    /// fall-through path expects.
    pub fn set_stack_pushed(&mut self, pushed: u32) {
        self.stack_pushed = pushed;
    }

    /// Peak number of bytes this stub pushed.
    pub fn max_stack_pushed(&self) -> u32 {
        self.max_stack_pushed
    }

    pub fn current_instruction(&self) -> u32 {
        self.current_instruction
    }

    pub fn available_regs(&self) -> RegisterSet {
        self.available_regs
    }

    /// Move to the next instruction. Registers reserved by the previous one
    /// become spillable again.
    pub fn next_op(&mut self) {
        self.current_op_regs = RegisterSet::empty();
        self.current_instruction += 1;
    }

    fn is_dead(&self, index: usize) -> bool {
        index >= self.num_inputs()
            && self
                .writer
                .operand_is_dead(OperandId(index as u16), self.current_instruction)
    }

    /// Statically known payload type of `id`, if any.
    pub fn known_type(&self, id: OperandId) -> Option<ValueType> {
        match self.operand_locations[id.index()] {
            OperandLocation::PayloadReg { ty, .. } | OperandLocation::PayloadStack { ty, .. } => {
                Some(ty)
            }
            OperandLocation::Constant { value } => Some(value.value_type()),
            OperandLocation::Uninitialized
            | OperandLocation::ValueReg { .. }
            | OperandLocation::ValueStack { .. } => None,
        }
    }

    fn free_dead_operand_registers(&mut self) {
        for index in self.num_inputs()..self.operand_locations.len() {
            if !self.is_dead(index) {
                continue;
            }
            let loc = self.operand_locations[index];
            if loc == OperandLocation::Uninitialized {
                continue;
            }
            if let Some(reg) = loc.register() {
                self.available_regs.add(reg);
            }
            // Stack slots of dead operands stay pushed until `discard_stack`.
            self.operand_locations[index] = OperandLocation::Uninitialized;
            trace!(target: "cacheir::regalloc", operand = index, loc = %loc, "reclaimed dead operand");
        }
    }

    fn push_register(&mut self, masm: &mut EmitCtx, reg: Register) {
        masm.push(reg);
        self.stack_pushed += 8;
        self.max_stack_pushed = self.max_stack_pushed.max(self.stack_pushed);
    }

    /// Push operand `index` to the stack and free its register.
    fn spill_operand(&mut self, masm: &mut EmitCtx, index: usize) {
        let loc = self.operand_locations[index];
        let (reg, spilled) = match loc {
            OperandLocation::PayloadReg { reg, ty } => {
                self.push_register(masm, reg);
                (reg, OperandLocation::PayloadStack { offset: self.stack_pushed, ty })
            }
            OperandLocation::ValueReg { reg } => {
                self.push_register(masm, reg.reg());
                (reg.reg(), OperandLocation::ValueStack { offset: self.stack_pushed })
            }
            other => panic!("operand {index} is not in a register ({other})"),
        };
        trace!(
            target: "cacheir::regalloc",
            operand = index,
            reg = %reg,
            to = %spilled,
            instruction = self.current_instruction,
            "spilled operand"
        );
        self.operand_locations[index] = spilled;
        if self.allocatable_regs.contains(reg) {
            self.available_regs.add(reg);
        }
    }

    /// Spill the first register operand the current instruction does not use.
    fn spill_one(&mut self, masm: &mut EmitCtx) -> bool {
        let victim = self.operand_locations.iter().position(|loc| {
            loc.register()
                .is_some_and(|reg| !self.current_op_regs.contains(reg))
        });
        match victim {
            Some(index) => {
                self.spill_operand(masm, index);
                true
            }
            None => false,
        }
    }

    /// Get a free register for the current instruction, reclaiming dead
    /// operands or spilling a live one if needed.
    pub fn allocate_register(&mut self, masm: &mut EmitCtx) -> Result<Register, CompileError> {
        if self.available_regs.is_empty() {
            self.free_dead_operand_registers();
        }
        if self.available_regs.is_empty() {
            self.spill_one(masm);
        }
        let reg = self
            .available_regs
            .take_any()
            .ok_or(CompileError::OutOfRegisters {
                instruction: self.current_instruction,
            })?;
        self.current_op_regs.add(reg);
        Ok(reg)
    }

    /// Claim `reg` for the current instruction, evicting whatever is in it.
    pub fn allocate_fixed_register(&mut self, masm: &mut EmitCtx, reg: Register) {
        if !self.available_regs.contains(reg) {
            self.free_dead_operand_registers();
        }
        if !self.available_regs.contains(reg) {
            assert!(
                !self.current_op_regs.contains(reg),
                "{reg} is already used by instruction {}",
                self.current_instruction
            );
            let occupant = self
                .operand_locations
                .iter()
                .position(|loc| loc.register() == Some(reg));
            match occupant {
                Some(index) => self.spill_operand(masm, index),
                None => panic!("{reg} is neither free nor held by an operand"),
            }
        }
        self.available_regs.take(reg);
        self.current_op_regs.add(reg);
    }

    /// Return a scratch register obtained from `allocate_register`.
    pub fn release_register(&mut self, reg: Register) {
        debug_assert!(!self.available_regs.contains(reg));
        self.available_regs.add(reg);
    }

    /// Pop or load a spilled operand. Pops when it is on top of the stack.
    fn reload(&mut self, masm: &mut EmitCtx, dest: Register, offset: u32) {
        if offset == self.stack_pushed {
            masm.pop(dest);
            self.stack_pushed -= 8;
        } else {
            masm.load_from_stack(dest, self.stack_pushed - offset);
        }
    }

    /// Materialize `val` as a boxed value in a register.
    pub fn use_value_register(
        &mut self,
        masm: &mut EmitCtx,
        val: ValOperandId,
    ) -> Result<ValueOperand, CompileError> {
        let index = val.0.index();
        Ok(match self.operand_locations[index] {
            OperandLocation::ValueReg { reg } => {
                self.current_op_regs.add(reg.reg());
                reg
            }
            OperandLocation::ValueStack { offset } => {
                let reg = self.allocate_register(masm)?;
                self.reload(masm, reg, offset);
                self.operand_locations[index] = OperandLocation::ValueReg { reg: ValueOperand(reg) };
                ValueOperand(reg)
            }
            OperandLocation::PayloadReg { reg, ty } => {
                masm.tag_value(ty, reg, ValueOperand(reg));
                self.current_op_regs.add(reg);
                self.operand_locations[index] = OperandLocation::ValueReg { reg: ValueOperand(reg) };
                ValueOperand(reg)
            }
            OperandLocation::PayloadStack { offset, ty } => {
                let reg = self.allocate_register(masm)?;
                self.reload(masm, reg, offset);
                masm.tag_value(ty, reg, ValueOperand(reg));
                self.operand_locations[index] = OperandLocation::ValueReg { reg: ValueOperand(reg) };
                ValueOperand(reg)
            }
            OperandLocation::Constant { value } => {
                let reg = self.allocate_register(masm)?;
                masm.move_imm64(reg, value.bits());
                self.operand_locations[index] = OperandLocation::ValueReg { reg: ValueOperand(reg) };
                ValueOperand(reg)
            }
            OperandLocation::Uninitialized => panic!("use of uninitialized operand %{index}"),
        })
    }

    /// Materialize `typed` as an unboxed payload in a register. A boxed value
    /// is unboxed in place.
    pub fn use_register(
        &mut self,
        masm: &mut EmitCtx,
        typed: TypedOperandId,
    ) -> Result<Register, CompileError> {
        let index = typed.id.index();
        Ok(match self.operand_locations[index] {
            OperandLocation::PayloadReg { reg, ty } => {
                if ty != typed.ty {
                    // Only reachable behind a guard that always fails.
                    masm.tag_value(ty, reg, ValueOperand(reg));
                    masm.unbox(ValueOperand(reg), reg, typed.ty);
                    self.operand_locations[index] = OperandLocation::PayloadReg { reg, ty: typed.ty };
                }
                self.current_op_regs.add(reg);
                reg
            }
            OperandLocation::ValueReg { reg } => {
                masm.unbox(reg, reg.reg(), typed.ty);
                self.current_op_regs.add(reg.reg());
                self.operand_locations[index] = OperandLocation::PayloadReg {
                    reg: reg.reg(),
                    ty: typed.ty,
                };
                reg.reg()
            }
            OperandLocation::PayloadStack { offset, ty } => {
                let reg = self.allocate_register(masm)?;
                self.reload(masm, reg, offset);
                if ty != typed.ty {
                    masm.tag_value(ty, reg, ValueOperand(reg));
                    masm.unbox(ValueOperand(reg), reg, typed.ty);
                }
                self.operand_locations[index] = OperandLocation::PayloadReg { reg, ty: typed.ty };
                reg
            }
            OperandLocation::ValueStack { offset } => {
                let reg = self.allocate_register(masm)?;
                self.reload(masm, reg, offset);
                masm.unbox(ValueOperand(reg), reg, typed.ty);
                self.operand_locations[index] = OperandLocation::PayloadReg { reg, ty: typed.ty };
                reg
            }
            OperandLocation::Constant { value } => {
                let reg = self.allocate_register(masm)?;
                let payload = match typed.ty {
                    ValueType::Int32 | ValueType::Boolean => value.payload() & 0xffff_ffff,
                    _ => value.payload(),
                };
                masm.move_imm64(reg, payload);
                self.operand_locations[index] = OperandLocation::PayloadReg { reg, ty: typed.ty };
                reg
            }
            OperandLocation::Uninitialized => panic!("use of uninitialized operand %{index}"),
        })
    }

    /// Allocate a register for an operand the current instruction defines.
    pub fn define_register(
        &mut self,
        masm: &mut EmitCtx,
        typed: TypedOperandId,
    ) -> Result<Register, CompileError> {
        let index = typed.id.index();
        assert_eq!(
            self.operand_locations[index],
            OperandLocation::Uninitialized,
            "operand %{index} defined twice"
        );
        let reg = self.allocate_register(masm)?;
        self.operand_locations[index] = OperandLocation::PayloadReg { reg, ty: typed.ty };
        Ok(reg)
    }

    pub fn define_value_register(
        &mut self,
        masm: &mut EmitCtx,
        val: ValOperandId,
    ) -> Result<ValueOperand, CompileError> {
        let index = val.0.index();
        assert_eq!(
            self.operand_locations[index],
            OperandLocation::Uninitialized,
            "operand %{index} defined twice"
        );
        let reg = ValueOperand(self.allocate_register(masm)?);
        self.operand_locations[index] = OperandLocation::ValueReg { reg };
        Ok(reg)
    }

    /// Drop everything this stub pushed. Every operand becomes
    /// `Uninitialized`; only valid once no operand is needed any more.
    pub fn discard_stack(&mut self, masm: &mut EmitCtx) {
        for loc in &mut self.operand_locations {
            *loc = OperandLocation::Uninitialized;
        }
        if self.stack_pushed > 0 {
            masm.add_to_stack_ptr(self.stack_pushed);
            self.stack_pushed = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{RAX, RDI, RSI};
    use crate::cacheir::{CacheKind, Int32OperandId};

    fn allocator_for(writer: &CacheIRWriter) -> CacheRegisterAllocator<'_> {
        let mut alloc = CacheRegisterAllocator::new(writer, ICStubEngine::Baseline);
        alloc.init_input_location(0, OperandLocation::ValueReg { reg: ValueOperand(RDI) });
        alloc
    }

    /// Seven int32 constants, all used by the result ops at the end.
    fn seven_live_constants() -> (CacheIRWriter, Vec<Int32OperandId>) {
        let mut w = CacheIRWriter::new(CacheKind::GetProp);
        let ids: Vec<_> = (0..7).map(|i| w.load_int32_constant(i)).collect();
        for pair in ids.chunks(2) {
            w.int32_add_result(pair[0], *pair.last().unwrap_or(&pair[0]));
        }
        w.load_operand_result(w.input_operand(0));
        w.return_from_ic();
        (w, ids)
    }

    #[test]
    fn inputs_hold_their_registers() {
        let w = CacheIRWriter::new(CacheKind::GetProp);
        let alloc = allocator_for(&w);
        assert!(!alloc.available_regs().contains(RDI));
        assert!(alloc.available_regs().contains(RSI));
        assert_eq!(alloc.available_regs().len(), 6);
    }

    #[test]
    fn used_operands_are_never_uninitialized() {
        let w = CacheIRWriter::new(CacheKind::GetProp);
        let mut masm = EmitCtx::new().unwrap();
        let mut alloc = allocator_for(&w);
        let val = w.input_operand(0);
        let reg = alloc.use_value_register(&mut masm, val).unwrap();
        assert_eq!(reg, ValueOperand(RDI));
        assert_ne!(alloc.operand_location(val.0), OperandLocation::Uninitialized);
    }

    #[test]
    fn allocation_skips_registers_of_the_current_op() {
        let w = CacheIRWriter::new(CacheKind::GetProp);
        let mut masm = EmitCtx::new().unwrap();
        let mut alloc = allocator_for(&w);
        let input = alloc.use_value_register(&mut masm, w.input_operand(0)).unwrap();
        let mut seen = RegisterSet::empty();
        while let Ok(reg) = alloc.allocate_register(&mut masm) {
            assert_ne!(reg, input.reg());
            assert!(!seen.contains(reg), "{reg} handed out twice");
            seen.add(reg);
        }
        assert_eq!(seen.len(), 6);
    }

    #[test]
    fn one_register_too_many_spills_instead_of_failing() {
        let (w, ids) = seven_live_constants();
        let mut masm = EmitCtx::new().unwrap();
        let mut alloc = allocator_for(&w);

        for (i, id) in ids.iter().enumerate() {
            if i > 0 {
                alloc.next_op();
            }
            alloc.define_register(&mut masm, (*id).into()).unwrap();
        }

        // The first register operand found is the input.
        assert_eq!(alloc.stack_pushed(), 8);
        assert_eq!(
            alloc.operand_location(OperandId(0)),
            OperandLocation::ValueStack { offset: 8 }
        );
        assert_eq!(
            alloc.operand_location(ids[6].0),
            OperandLocation::PayloadReg { reg: RDI, ty: ValueType::Int32 }
        );
        assert_eq!(alloc.max_stack_pushed(), 8);
    }

    #[test]
    fn exhausting_one_instruction_is_an_error() {
        let (w, ids) = seven_live_constants();
        let mut masm = EmitCtx::new().unwrap();
        let mut alloc = allocator_for(&w);

        // Six free registers plus the spilled input.
        for _ in 0..7 {
            alloc.allocate_register(&mut masm).unwrap();
        }
        let err = alloc.define_register(&mut masm, ids[0].into()).unwrap_err();
        assert!(matches!(err, CompileError::OutOfRegisters { instruction: 0 }));
    }

    #[test]
    fn dead_operands_are_reclaimed_before_spilling() {
        let mut w = CacheIRWriter::new(CacheKind::GetProp);
        let tmp = w.load_int32_constant(1); // 0
        w.int32_add_result(tmp, tmp); // 1
        w.return_from_ic(); // 2

        let mut masm = EmitCtx::new().unwrap();
        let mut alloc = allocator_for(&w);
        let reg = alloc.define_register(&mut masm, tmp.into()).unwrap();
        alloc.next_op();
        alloc.next_op();
        for _ in 0..5 {
            alloc.allocate_register(&mut masm).unwrap();
        }
        // Only `tmp`'s register is left to reclaim.
        assert_eq!(alloc.allocate_register(&mut masm).unwrap(), reg);
        assert_eq!(alloc.stack_pushed(), 0);
        assert_eq!(alloc.operand_location(tmp.0), OperandLocation::Uninitialized);
    }

    #[test]
    fn reclaim_forgets_dead_constants_and_stack_slots() {
        let mut w = CacheIRWriter::new(CacheKind::GetProp);
        let konst = w.load_int32_constant(1); // 0
        let spilled = w.load_int32_constant(2); // 1
        let held = w.load_int32_constant(3); // 2
        w.int32_add_result(konst, spilled); // 3
        w.int32_add_result(held, held); // 4
        w.return_from_ic(); // 5

        let mut masm = EmitCtx::new().unwrap();
        let mut alloc = allocator_for(&w);
        alloc.set_operand_location(konst.0, OperandLocation::Constant { value: Value::from_int32(1) });
        alloc.set_operand_location(
            spilled.0,
            OperandLocation::PayloadStack { offset: 8, ty: ValueType::Int32 },
        );
        alloc.next_op();
        alloc.next_op();
        let reg = alloc.define_register(&mut masm, held.into()).unwrap();
        for _ in 0..3 {
            alloc.next_op();
        }

        for _ in 0..5 {
            alloc.allocate_register(&mut masm).unwrap();
        }
        assert_eq!(alloc.allocate_register(&mut masm).unwrap(), reg);
        for id in [konst.0, spilled.0, held.0] {
            assert_eq!(alloc.operand_location(id), OperandLocation::Uninitialized);
        }
    }

    #[test]
    fn fixed_register_evicts_its_occupant() {
        let (w, ids) = seven_live_constants();
        let mut masm = EmitCtx::new().unwrap();
        let mut alloc = allocator_for(&w);

        // Hand out registers from the top until rax is taken.
        let mut owner = None;
        for id in &ids[..6] {
            let reg = alloc.define_register(&mut masm, (*id).into()).unwrap();
            alloc.next_op();
            if reg == RAX {
                owner = Some(*id);
            }
        }
        let owner = owner.unwrap();
        alloc.allocate_fixed_register(&mut masm, RAX);
        assert!(matches!(
            alloc.operand_location(owner.0),
            OperandLocation::PayloadStack { ty: ValueType::Int32, .. }
        ));
    }

    #[test]
    fn boxed_values_unbox_in_place_and_rebox_on_demand() {
        let mut w = CacheIRWriter::new(CacheKind::GetProp);
        let obj = w.guard_is_object(w.input_operand(0));
        w.load_operand_result(w.input_operand(0));
        w.return_from_ic();

        let mut masm = EmitCtx::new().unwrap();
        let mut alloc = allocator_for(&w);
        let reg = alloc.use_register(&mut masm, obj.into()).unwrap();
        assert_eq!(reg, RDI);
        assert_eq!(alloc.known_type(obj.0), Some(ValueType::Object));

        alloc.next_op();
        let val = alloc.use_value_register(&mut masm, w.input_operand(0)).unwrap();
        assert_eq!(val, ValueOperand(RDI));
        assert_eq!(alloc.known_type(obj.0), None);
    }

    #[test]
    fn constants_know_their_type() {
        let w = CacheIRWriter::new(CacheKind::GetProp);
        let mut alloc = CacheRegisterAllocator::new(&w, ICStubEngine::IonSharedIC);
        alloc.init_input_location(
            0,
            OperandLocation::Constant { value: Value::from_int32(5) },
        );
        assert_eq!(alloc.known_type(OperandId(0)), Some(ValueType::Int32));
        assert_eq!(alloc.available_regs().len(), 4);
    }

    #[test]
    fn discard_stack_forgets_every_location() {
        let (w, ids) = seven_live_constants();
        let mut masm = EmitCtx::new().unwrap();
        let mut alloc = allocator_for(&w);
        for (i, id) in ids.iter().enumerate() {
            if i > 0 {
                alloc.next_op();
            }
            alloc.define_register(&mut masm, (*id).into()).unwrap();
        }
        alloc.discard_stack(&mut masm);
        assert_eq!(alloc.stack_pushed(), 0);
        for i in 0..w.num_operand_ids() {
            assert_eq!(
                alloc.operand_location(OperandId(i as u16)),
                OperandLocation::Uninitialized
            );
        }
    }
}
