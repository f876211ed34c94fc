use core::fmt;

use dynasmrt::{AssemblyOffset, DynamicLabel, DynasmApi, DynasmLabelApi, ExecutableBuffer, dynasm};

use crate::error::CompileError;
use crate::stub::{ICStubEngine, STUB_CODE_OFFSET, STUB_NEXT_OFFSET};
use crate::value::{JSVAL_TAG_MAX_DOUBLE, JSVAL_TAG_SHIFT, ValueType};

pub type Assembler = dynasmrt::x64::Assembler;

// ─── Registers ──────────────────────────────────────────────────────────────

/// A general-purpose register, by hardware encoding.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Register(u8);

pub const RAX: Register = Register(0);
pub const RCX: Register = Register(1);
pub const RDX: Register = Register(2);
pub const RBX: Register = Register(3);
pub const RSP: Register = Register(4);
pub const RBP: Register = Register(5);
pub const RSI: Register = Register(6);
pub const RDI: Register = Register(7);
pub const R8: Register = Register(8);
pub const R9: Register = Register(9);
pub const R10: Register = Register(10);
pub const R11: Register = Register(11);
pub const R12: Register = Register(12);
pub const R13: Register = Register(13);
pub const R14: Register = Register(14);
pub const R15: Register = Register(15);

// Register roles inside a stub (System V AMD64):
//   rdi, rsi = IC inputs
//   rdx      = current stub (ICStubHeader*)
//   rax      = result
//   r11      = emitter scratch, never handed out by the allocator
//
// Stubs never call, so only caller-saved registers are used.

/// Holds the `ICStubHeader` of the stub currently executing.
pub const STUB_REG: Register = RDX;
/// Result register of every stub.
pub const OUTPUT_REG: Register = RAX;
/// Registers the IC inputs arrive in.
pub const INPUT_REGS: [Register; 2] = [RDI, RSI];
const SCRATCH: u8 = 11;

impl Register {
    pub const fn code(self) -> u8 {
        self.0
    }

    pub fn name(self) -> &'static str {
        const NAMES: [&str; 16] = [
            "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11",
            "r12", "r13", "r14", "r15",
        ];
        NAMES[self.0 as usize]
    }
}

impl fmt::Debug for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Register(s) holding one boxed value. A single GPR on punbox64.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ValueOperand(pub Register);

impl ValueOperand {
    pub fn reg(self) -> Register {
        self.0
    }
}

impl fmt::Display for ValueOperand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A set of general-purpose registers.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct RegisterSet(u16);

impl RegisterSet {
    pub const fn empty() -> Self {
        RegisterSet(0)
    }

    pub fn from_regs(regs: &[Register]) -> Self {
        let mut set = RegisterSet::empty();
        for &reg in regs {
            set.add(reg);
        }
        set
    }

    pub fn contains(&self, reg: Register) -> bool {
        self.0 & (1 << reg.0) != 0
    }

    pub fn add(&mut self, reg: Register) {
        self.0 |= 1 << reg.0;
    }

    pub fn take(&mut self, reg: Register) {
        self.0 &= !(1 << reg.0);
    }

    /// Remove and return the highest-numbered register.
    pub fn take_any(&mut self) -> Option<Register> {
        if self.0 == 0 {
            return None;
        }
        let reg = Register(15 - self.0.leading_zeros() as u8);
        self.take(reg);
        Some(reg)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn iter(&self) -> impl Iterator<Item = Register> + '_ {
        (0..16u8).map(Register).filter(|r| self.contains(*r))
    }
}

impl fmt::Debug for RegisterSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Registers the allocator may hand out for `engine`, before inputs are
/// removed.
pub fn allocatable_regs(engine: ICStubEngine) -> RegisterSet {
    match engine {
        ICStubEngine::Baseline => RegisterSet::from_regs(&[RAX, RCX, RSI, RDI, R8, R9, R10]),
        ICStubEngine::IonSharedIC => RegisterSet::from_regs(&[RAX, RCX, RSI, RDI]),
    }
}

/// Branch conditions.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Condition {
    Equal,
    NotEqual,
    Above,
    BelowOrEqual,
    Overflow,
    Signed,
}

// ─── Emitter ────────────────────────────────────────────────────────────────

/// Emission context for one stub.
pub struct EmitCtx {
    pub ops: Assembler,
    pub entry: AssemblyOffset,
}

impl EmitCtx {
    /// Create a new EmitCtx. Does not emit any code.
    pub fn new() -> Result<Self, CompileError> {
        let ops = Assembler::new()?;
        let entry = ops.offset();
        Ok(EmitCtx { ops, entry })
    }

    pub fn offset(&self) -> AssemblyOffset {
        self.ops.offset()
    }

    /// Allocate a new dynamic label.
    pub fn new_label(&mut self) -> DynamicLabel {
        self.ops.new_dynamic_label()
    }

    /// Bind a dynamic label at the current position.
    pub fn bind_label(&mut self, label: DynamicLabel) {
        dynasm!(self.ops
            ; .arch x64
            ; =>label
        );
    }

    /// Emit an unconditional branch to the given label.
    pub fn jump(&mut self, label: DynamicLabel) {
        dynasm!(self.ops
            ; .arch x64
            ; jmp =>label
        );
    }

    /// Branch on flags already set by the previous instruction.
    pub fn jcc(&mut self, cond: Condition, label: DynamicLabel) {
        match cond {
            Condition::Equal => dynasm!(self.ops ; .arch x64 ; je =>label),
            Condition::NotEqual => dynasm!(self.ops ; .arch x64 ; jne =>label),
            Condition::Above => dynasm!(self.ops ; .arch x64 ; ja =>label),
            Condition::BelowOrEqual => dynasm!(self.ops ; .arch x64 ; jbe =>label),
            Condition::Overflow => dynasm!(self.ops ; .arch x64 ; jo =>label),
            Condition::Signed => dynasm!(self.ops ; .arch x64 ; js =>label),
        }
    }

    pub fn ret(&mut self) {
        dynasm!(self.ops
            ; .arch x64
            ; ret
        );
    }

    // ─── Stack ──────────────────────────────────────────────────────────

    pub fn push(&mut self, reg: Register) {
        dynasm!(self.ops
            ; .arch x64
            ; push Rq(reg.code())
        );
    }

    pub fn pop(&mut self, reg: Register) {
        dynasm!(self.ops
            ; .arch x64
            ; pop Rq(reg.code())
        );
    }

    /// `mov dest, [rsp + offset]`.
    pub fn load_from_stack(&mut self, dest: Register, offset: u32) {
        dynasm!(self.ops
            ; .arch x64
            ; mov Rq(dest.code()), [rsp + offset as i32]
        );
    }

    /// Drop `bytes` of stack.
    pub fn add_to_stack_ptr(&mut self, bytes: u32) {
        dynasm!(self.ops
            ; .arch x64
            ; add rsp, bytes as i32
        );
    }

    // ─── Moves ──────────────────────────────────────────────────────────

    /// Register-to-register move; nothing is emitted when `dest == src`.
    pub fn mov(&mut self, dest: Register, src: Register) {
        if dest == src {
            return;
        }
        dynasm!(self.ops
            ; .arch x64
            ; mov Rq(dest.code()), Rq(src.code())
        );
    }

    pub fn move_value(&mut self, dest: ValueOperand, src: ValueOperand) {
        self.mov(dest.reg(), src.reg());
    }

    pub fn move_imm64(&mut self, dest: Register, imm: u64) {
        dynasm!(self.ops
            ; .arch x64
            ; mov Rq(dest.code()), QWORD imm as i64
        );
    }

    /// `mov dest, [base + offset]`.
    pub fn load_ptr(&mut self, dest: Register, base: Register, offset: i32) {
        dynasm!(self.ops
            ; .arch x64
            ; mov Rq(dest.code()), [Rq(base.code()) + offset]
        );
    }

    /// `mov dest, [base + index]`.
    pub fn load_ptr_indexed(&mut self, dest: Register, base: Register, index: Register) {
        dynasm!(self.ops
            ; .arch x64
            ; mov Rq(dest.code()), [Rq(base.code()) + Rq(index.code())]
        );
    }

    /// Zero-extending 32-bit load.
    pub fn load32(&mut self, dest: Register, base: Register, offset: i32) {
        dynasm!(self.ops
            ; .arch x64
            ; mov Rd(dest.code()), DWORD [Rq(base.code()) + offset]
        );
    }

    // ─── Boxing ─────────────────────────────────────────────────────────

    /// Extract the payload of a value known to be of type `ty`.
    pub fn unbox(&mut self, src: ValueOperand, dest: Register, ty: ValueType) {
        if ty.is_pointer() {
            let shift = 64 - JSVAL_TAG_SHIFT as i8;
            self.mov(dest, src.reg());
            dynasm!(self.ops
                ; .arch x64
                ; shl Rq(dest.code()), shift
                ; shr Rq(dest.code()), shift
            );
        } else {
            match ty {
                ValueType::Int32 | ValueType::Boolean => {
                    dynasm!(self.ops
                        ; .arch x64
                        ; mov Rd(dest.code()), Rd(src.reg().code())
                    );
                }
                other => panic!("cannot unbox a {other} into a payload register"),
            }
        }
    }

    /// Load a boxed value spilled at `[rsp + offset]` and unbox it.
    pub fn unbox_from_stack(&mut self, offset: u32, dest: Register, ty: ValueType) {
        self.load_from_stack(dest, offset);
        self.unbox(ValueOperand(dest), dest, ty);
    }

    /// Box `payload` of type `ty` into `dest`.
    pub fn tag_value(&mut self, ty: ValueType, payload: Register, dest: ValueOperand) {
        let tag = ty.shifted_tag() as i64;
        match ty {
            ValueType::Int32 | ValueType::Boolean => {
                dynasm!(self.ops
                    ; .arch x64
                    ; mov Rd(dest.reg().code()), Rd(payload.code())
                );
            }
            _ if ty.is_pointer() => self.mov(dest.reg(), payload),
            other => panic!("cannot box a {other} payload"),
        }
        dynasm!(self.ops
            ; .arch x64
            ; mov Rq(SCRATCH), QWORD tag
            ; or Rq(dest.reg().code()), Rq(SCRATCH)
        );
    }

    /// Put the 17-bit tag of `value` in the scratch register.
    fn split_tag(&mut self, value: Register) {
        dynasm!(self.ops
            ; .arch x64
            ; mov Rq(SCRATCH), Rq(value.code())
            ; shr Rq(SCRATCH), JSVAL_TAG_SHIFT as i8
        );
    }

    /// Branch if the tag of `value` is (`Equal`) or is not (`NotEqual`) `ty`.
    pub fn branch_test_type(&mut self, cond: Condition, value: ValueOperand, ty: ValueType, label: DynamicLabel) {
        assert!(matches!(cond, Condition::Equal | Condition::NotEqual));
        self.split_tag(value.reg());
        dynasm!(self.ops
            ; .arch x64
            ; cmp Rd(SCRATCH), ty.tag() as i32
        );
        self.jcc(cond, label);
    }

    /// Branch if `value` is (`Equal`) or is not (`NotEqual`) a double.
    pub fn branch_test_double(&mut self, cond: Condition, value: ValueOperand, label: DynamicLabel) {
        self.branch_tag_at_most(cond, value, JSVAL_TAG_MAX_DOUBLE, label);
    }

    /// Branch if `value` is (`Equal`) or is not (`NotEqual`) a double or int32.
    pub fn branch_test_number(&mut self, cond: Condition, value: ValueOperand, label: DynamicLabel) {
        self.branch_tag_at_most(cond, value, ValueType::Int32.tag(), label);
    }

    fn branch_tag_at_most(&mut self, cond: Condition, value: ValueOperand, max_tag: u32, label: DynamicLabel) {
        let cond = match cond {
            Condition::Equal => Condition::BelowOrEqual,
            Condition::NotEqual => Condition::Above,
            other => panic!("tag range test does not take {other:?}"),
        };
        self.split_tag(value.reg());
        dynasm!(self.ops
            ; .arch x64
            ; cmp Rd(SCRATCH), max_tag as i32
        );
        self.jcc(cond, label);
    }

    // ─── Comparisons ────────────────────────────────────────────────────

    pub fn branch_ptr(&mut self, cond: Condition, lhs: Register, rhs: Register, label: DynamicLabel) {
        dynasm!(self.ops
            ; .arch x64
            ; cmp Rq(lhs.code()), Rq(rhs.code())
        );
        self.jcc(cond, label);
    }

    /// Compare `[base + offset]` with `rhs`.
    pub fn branch_ptr_mem(&mut self, cond: Condition, base: Register, offset: i32, rhs: Register, label: DynamicLabel) {
        dynasm!(self.ops
            ; .arch x64
            ; cmp QWORD [Rq(base.code()) + offset], Rq(rhs.code())
        );
        self.jcc(cond, label);
    }

    /// Compare `lhs` with a 64-bit immediate.
    pub fn branch_ptr_imm(&mut self, cond: Condition, lhs: Register, imm: u64, label: DynamicLabel) {
        dynasm!(self.ops
            ; .arch x64
            ; mov Rq(SCRATCH), QWORD imm as i64
            ; cmp Rq(lhs.code()), Rq(SCRATCH)
        );
        self.jcc(cond, label);
    }

    /// Branch if the low 32 bits of `reg` are negative.
    pub fn branch_test32_signed(&mut self, reg: Register, label: DynamicLabel) {
        dynasm!(self.ops
            ; .arch x64
            ; test Rd(reg.code()), Rd(reg.code())
        );
        self.jcc(Condition::Signed, label);
    }

    /// 32-bit `dest += src`, branching on signed overflow.
    pub fn add32_overflow(&mut self, dest: Register, src: Register, label: DynamicLabel) {
        dynasm!(self.ops
            ; .arch x64
            ; add Rd(dest.code()), Rd(src.code())
        );
        self.jcc(Condition::Overflow, label);
    }

    /// 32-bit `dest -= src`, branching on signed overflow.
    pub fn sub32_overflow(&mut self, dest: Register, src: Register, label: DynamicLabel) {
        dynasm!(self.ops
            ; .arch x64
            ; sub Rd(dest.code()), Rd(src.code())
        );
        self.jcc(Condition::Overflow, label);
    }

    // ─── Stub chain ─────────────────────────────────────────────────────

    /// Tail-jump into the next stub: `stub = stub->next; jmp stub->code`.
    pub fn jump_to_next_stub(&mut self) {
        dynasm!(self.ops
            ; .arch x64
            ; mov rdx, [rdx + STUB_NEXT_OFFSET]
            ; jmp QWORD [rdx + STUB_CODE_OFFSET]
        );
    }

    /// Commit and finalize the assembler, returning the executable buffer.
    pub fn finalize(mut self) -> Result<ExecutableBuffer, CompileError> {
        self.ops
            .commit()
            .map_err(|e| CompileError::Assembler(e.to_string()))?;
        self.ops
            .finalize()
            .map_err(|_| CompileError::Assembler("failed to finalize assembly".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_any_prefers_the_highest_register() {
        let mut set = allocatable_regs(ICStubEngine::Baseline);
        assert_eq!(set.len(), 7);
        assert_eq!(set.take_any(), Some(R10));
        assert_eq!(set.take_any(), Some(R9));
        set.take(RDI);
        assert!(!set.contains(RDI));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![RAX, RCX, RSI, R8]);
    }

    #[test]
    fn stub_and_scratch_registers_are_never_allocatable() {
        for engine in [ICStubEngine::Baseline, ICStubEngine::IonSharedIC] {
            let set = allocatable_regs(engine);
            assert!(!set.contains(STUB_REG));
            assert!(!set.contains(R11));
            assert!(!set.contains(RSP));
        }
    }
}
