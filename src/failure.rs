//! Failure paths: the code a failing guard jumps to.
//!
//! A failure path puts every input back where the stub received it, drops
//! whatever the stub pushed, and tail-jumps to the next stub in the chain.
//! Two guards can share a path when the input locations and the stack depth
//! they would restore from are identical.

use dynasmrt::DynamicLabel;
use smallvec::SmallVec;
use tracing::trace;

use crate::arch::{EmitCtx, ValueOperand};
use crate::regalloc::{CacheRegisterAllocator, OperandLocation};

/// Snapshot of the allocator state at a guard.
#[derive(Debug, Clone)]
pub struct FailurePath {
    inputs: SmallVec<[OperandLocation; 2]>,
    stack_pushed: u32,
    label: DynamicLabel,
}

impl FailurePath {
    pub fn new(inputs: &[OperandLocation], stack_pushed: u32, label: DynamicLabel) -> Self {
        FailurePath {
            inputs: SmallVec::from_slice(inputs),
            stack_pushed,
            label,
        }
    }

    pub fn inputs(&self) -> &[OperandLocation] {
        &self.inputs
    }

    pub fn stack_pushed(&self) -> u32 {
        self.stack_pushed
    }

    pub fn label(&self) -> DynamicLabel {
        self.label
    }

    /// Whether one emitted path can serve both snapshots.
    pub fn can_share(&self, other: &FailurePath) -> bool {
        self.can_share_state(&other.inputs, other.stack_pushed)
    }

    fn can_share_state(&self, inputs: &[OperandLocation], stack_pushed: u32) -> bool {
        self.stack_pushed == stack_pushed && self.inputs.as_slice() == inputs
    }
}

/// All failure paths of one stub, in the order guards requested them.
#[derive(Debug, Default)]
pub struct FailurePaths {
    paths: Vec<FailurePath>,
    share: bool,
}

impl FailurePaths {
    pub fn new(share: bool) -> Self {
        FailurePaths {
            paths: Vec::new(),
            share,
        }
    }

    /// Get the label a guard should branch to from the allocator's current
    /// state. Only the most recent path is considered for reuse.
    pub fn add(&mut self, masm: &mut EmitCtx, allocator: &CacheRegisterAllocator<'_>) -> DynamicLabel {
        let inputs = allocator.input_locations();
        let stack_pushed = allocator.stack_pushed();
        if self.share {
            if let Some(last) = self.paths.last() {
                if last.can_share_state(inputs, stack_pushed) {
                    return last.label;
                }
            }
        }
        let label = masm.new_label();
        self.paths.push(FailurePath::new(inputs, stack_pushed, label));
        label
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FailurePath> {
        self.paths.iter()
    }
}

/// Emit the restore sequence for `failure` at the current position and
/// return how many bytes are still pushed afterwards. The caller discards
/// them and leaves the stub.
///
/// Inputs are restored in order. Before writing input `i`'s original
/// register, any later input still living in it is pushed, which breaks
/// register cycles such as two swapped inputs.
pub fn emit_failure_path(
    masm: &mut EmitCtx,
    orig_inputs: &[OperandLocation],
    failure: &FailurePath,
) -> u32 {
    masm.bind_label(failure.label);
    trace!(
        target: "cacheir::failure",
        stack_pushed = failure.stack_pushed,
        inputs = ?failure.inputs,
        "emitting failure path"
    );

    let mut inputs = failure.inputs.clone();
    let mut stack_pushed = failure.stack_pushed;

    for i in 0..inputs.len() {
        let dest = match orig_inputs[i] {
            OperandLocation::ValueReg { reg } => reg,
            OperandLocation::Constant { .. } => continue,
            other => panic!("input {i} cannot originate in {other}"),
        };

        for j in i + 1..inputs.len() {
            if inputs[j].register() != Some(dest.reg()) {
                continue;
            }
            masm.push(dest.reg());
            stack_pushed += 8;
            inputs[j] = match inputs[j] {
                OperandLocation::PayloadReg { ty, .. } => OperandLocation::PayloadStack {
                    offset: stack_pushed,
                    ty,
                },
                _ => OperandLocation::ValueStack {
                    offset: stack_pushed,
                },
            };
        }

        match inputs[i] {
            OperandLocation::ValueReg { reg } => masm.move_value(dest, reg),
            OperandLocation::PayloadReg { reg, ty } => masm.tag_value(ty, reg, dest),
            OperandLocation::ValueStack { offset } => {
                stack_pushed = reload(masm, dest, offset, stack_pushed);
            }
            OperandLocation::PayloadStack { offset, ty } => {
                stack_pushed = reload(masm, dest, offset, stack_pushed);
                masm.tag_value(ty, dest.reg(), dest);
            }
            OperandLocation::Constant { value } => masm.move_imm64(dest.reg(), value.bits()),
            OperandLocation::Uninitialized => panic!("input {i} is uninitialized at a guard"),
        }
    }

    stack_pushed
}

fn reload(masm: &mut EmitCtx, dest: ValueOperand, offset: u32, stack_pushed: u32) -> u32 {
    if offset == stack_pushed {
        masm.pop(dest.reg());
        stack_pushed - 8
    } else {
        masm.load_from_stack(dest.reg(), stack_pushed - offset);
        stack_pushed
    }
}
