//! Stack-machine bytecode front end.
//!
//! Walks a [`StackFunction`]'s ops and drives a simulated [`OperandStack`]
//! per instruction: operands are popped as IR value handles, combined into a
//! new IR node, and the result pushed back. Control flow forks the stack
//! state (`Clone`) at branches and reconciles it at joins (`merge_into`), so
//! downstream code observes one consistent set of storage slots regardless
//! of which predecessor path executed. Loop back-edges merge into the entry
//! state recorded when the header block was first reached.
//!
//! Compiled functions have the signature
//! `extern "C" fn(stack_base: *mut i64, arg: i64) -> i64`: `stack_base` is
//! the bottom of the real VM operand stack (used by [`Op::Sync`]) and `arg`
//! is a single caller-supplied value exposed through [`Op::PushArg`].

use cranelift_codegen::ir::condcodes::IntCC;
use cranelift_codegen::ir::{Block, InstBuilder, types};
use cranelift_frontend::FunctionBuilder;

use crate::compiler::JitError;
use crate::register::VmRegister;
use crate::stack::{OperandStack, StackLayout};
use crate::state::VmState;

/// One stack-machine bytecode instruction.
///
/// Branch offsets are relative to the branching instruction's pc.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// Push an immediate constant.
    PushConst(i64),
    /// Push the caller-supplied argument.
    PushArg,
    /// Push the value of a local variable.
    LoadLocal(u16),
    /// Pop the top of the stack into a local variable.
    StoreLocal(u16),
    /// Pop two values, push their sum.
    Add,
    /// Pop two values, push their difference (lower minus top).
    Sub,
    /// Pop two values, push their product.
    Mul,
    /// Duplicate the top of the stack.
    Dup,
    /// Push a copy of the value `n` elements below the top.
    Pick(u32),
    /// Discard `n` values from the top of the stack.
    Drop(u32),
    /// Unconditional relative jump.
    Jump(i32),
    /// Pop a value; jump if it is zero, otherwise fall through.
    BranchIfZero(i32),
    /// Commit the simulated operand stack to real VM stack memory.
    Sync,
    /// Pop the top of the stack and return it.
    Return,
}

/// A bytecode function: a flat op stream plus its frame requirements.
#[derive(Debug, Clone)]
pub struct StackFunction {
    /// Display name, used for JIT symbol naming and logging.
    pub name: String,
    /// Number of local variable slots.
    pub local_count: u16,
    /// Initial size hint for the simulated operand stack.
    pub stack_hint: u32,
    /// The instruction stream.
    pub ops: Vec<Op>,
}

impl StackFunction {
    /// Start building a function.
    pub fn builder() -> StackFunctionBuilder {
        StackFunctionBuilder::default()
    }
}

/// Builder for [`StackFunction`].
#[derive(Debug, Default)]
pub struct StackFunctionBuilder {
    name: String,
    local_count: u16,
    stack_hint: u32,
    ops: Vec<Op>,
}

impl StackFunctionBuilder {
    /// Set the display name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the number of local variable slots.
    pub fn local_count(mut self, count: u16) -> Self {
        self.local_count = count;
        self
    }

    /// Set the operand stack size hint.
    pub fn stack_hint(mut self, hint: u32) -> Self {
        self.stack_hint = hint;
        self
    }

    /// Append one instruction.
    pub fn op(mut self, op: Op) -> Self {
        self.ops.push(op);
        self
    }

    /// Finish the function.
    pub fn build(self) -> StackFunction {
        StackFunction {
            name: self.name,
            local_count: self.local_count,
            stack_hint: self.stack_hint,
            ops: self.ops,
        }
    }
}

fn jump_target(pc: usize, offset: i32, op_count: usize) -> Result<usize, JitError> {
    let target = pc as i64 + i64::from(offset);
    if !(0..op_count as i64).contains(&target) {
        return Err(JitError::InvalidJumpTarget {
            pc,
            offset,
            op_count,
        });
    }
    Ok(target as usize)
}

/// Validate branch targets and local indices, and mark block leaders.
fn analyze(function: &StackFunction) -> Result<Vec<bool>, JitError> {
    let op_count = function.ops.len();
    let mut leaders = vec![false; op_count];
    if op_count > 0 {
        leaders[0] = true;
    }
    for (pc, op) in function.ops.iter().enumerate() {
        match *op {
            Op::Jump(offset) | Op::BranchIfZero(offset) => {
                let target = jump_target(pc, offset, op_count)?;
                leaders[target] = true;
                if pc + 1 < op_count {
                    leaders[pc + 1] = true;
                }
            }
            Op::Return => {
                if pc + 1 < op_count {
                    leaders[pc + 1] = true;
                }
            }
            Op::LoadLocal(index) | Op::StoreLocal(index) => {
                if index >= function.local_count {
                    return Err(JitError::InvalidLocal {
                        pc,
                        index,
                        local_count: function.local_count,
                    });
                }
            }
            _ => {}
        }
    }
    Ok(leaders)
}

/// Record an edge from `from_pc` into the block starting at `target`.
///
/// The first edge into a block donates a copy of its operand stack as the
/// block's entry state; every later edge merges into that resident state by
/// emitting corrective stores in the *predecessor* block. Returns the target
/// block, creating it on the first edge.
fn flow_into(
    builder: &mut FunctionBuilder<'_>,
    blocks: &mut [Option<Block>],
    entry_states: &mut [Option<OperandStack>],
    from_pc: usize,
    target: usize,
    stack: &OperandStack,
) -> Result<Block, JitError> {
    let block = match blocks[target] {
        Some(block) => block,
        None => {
            if target <= from_pc {
                // A back-edge into code the linear scan already passed over
                // as unreachable: there is no block to land in.
                return Err(JitError::UnreachableJumpTarget {
                    pc: from_pc,
                    target,
                });
            }
            let block = builder.create_block();
            blocks[target] = Some(block);
            block
        }
    };
    if let Some(resident) = &mut entry_states[target] {
        tracing::trace!(
            from_pc,
            target,
            depth = stack.depth(),
            "merging operand stack into resident block state"
        );
        stack.merge_into(resident, builder);
    } else {
        entry_states[target] = Some(stack.clone());
    }
    Ok(block)
}

/// Translate a bytecode function into Cranelift IR.
///
/// Emits the whole function body into `builder`, including the entry block
/// (frame setup: argument register, locals, stack-top pointer) and a final
/// `seal_all_blocks`. Falling off the end of the op stream returns 0.
pub fn translate_function(
    builder: &mut FunctionBuilder<'_>,
    function: &StackFunction,
    layout: StackLayout,
) -> Result<(), JitError> {
    let op_count = function.ops.len();
    let leaders = analyze(function)?;

    let entry = builder.create_block();
    builder.append_block_params_for_function_params(entry);
    builder.switch_to_block(entry);
    let params = builder.block_params(entry);
    let (stack_base, arg) = (params[0], params[1]);

    let arg_register = VmRegister::with_initial_value(builder, types::I64, arg);
    let zero = builder.ins().iconst(types::I64, 0);
    let mut locals = Vec::with_capacity(function.local_count as usize);
    for _ in 0..function.local_count {
        locals.push(VmRegister::with_initial_value(builder, types::I64, zero));
    }

    let element_bytes = i64::from(types::I64.bytes());
    let direction = if layout.grows_up { 1 } else { -1 };
    let initial_top = builder.ins().iadd_imm(
        stack_base,
        direction * i64::from(layout.starting_offset) * element_bytes,
    );
    let stack_top = VmRegister::with_initial_value(builder, types::I64, initial_top);
    let initial_stack =
        OperandStack::with_layout(builder, function.stack_hint, types::I64, stack_top, layout);

    if op_count == 0 {
        builder.ins().return_(&[zero]);
        builder.seal_all_blocks();
        return Ok(());
    }

    let mut blocks: Vec<Option<Block>> = vec![None; op_count];
    let mut entry_states: Vec<Option<OperandStack>> = vec![None; op_count];
    let mut exit_block: Option<Block> = None;

    let first = builder.create_block();
    blocks[0] = Some(first);
    entry_states[0] = Some(initial_stack);
    builder.ins().jump(first, &[]);

    let mut current: Option<OperandStack> = None;
    for (pc, op) in function.ops.iter().enumerate() {
        if leaders[pc] {
            // Close a falling-through predecessor with an explicit edge.
            if let Some(stack) = current.take() {
                let block =
                    flow_into(builder, &mut blocks, &mut entry_states, pc - 1, pc, &stack)?;
                builder.ins().jump(block, &[]);
            }
            match blocks[pc] {
                Some(block) => {
                    builder.switch_to_block(block);
                    let resident = entry_states[pc]
                        .as_ref()
                        .expect("a created block has a recorded entry state");
                    let mut stack = resident.clone();
                    stack.reload(builder);
                    current = Some(stack);
                }
                // No edge ever reached this leader; skip until one does.
                None => current = None,
            }
        }
        let Some(mut stack) = current.take() else {
            continue;
        };

        match *op {
            Op::PushConst(constant) => {
                let value = builder.ins().iconst(types::I64, constant);
                stack.push(builder, value);
            }
            Op::PushArg => {
                let value = arg_register.read(builder);
                stack.push(builder, value);
            }
            Op::LoadLocal(index) => {
                let value = locals[index as usize].read(builder);
                stack.push(builder, value);
            }
            Op::StoreLocal(index) => {
                let value = stack.pop(builder);
                locals[index as usize].write(builder, value);
            }
            Op::Add => {
                let rhs = stack.pop(builder);
                let lhs = stack.pop(builder);
                let value = builder.ins().iadd(lhs, rhs);
                stack.push(builder, value);
            }
            Op::Sub => {
                let rhs = stack.pop(builder);
                let lhs = stack.pop(builder);
                let value = builder.ins().isub(lhs, rhs);
                stack.push(builder, value);
            }
            Op::Mul => {
                let rhs = stack.pop(builder);
                let lhs = stack.pop(builder);
                let value = builder.ins().imul(lhs, rhs);
                stack.push(builder, value);
            }
            Op::Dup => stack.dup(builder),
            Op::Pick(depth) => {
                let value = stack.pick(depth as usize);
                stack.push(builder, value);
            }
            Op::Drop(count) => stack.discard(builder, count as usize),
            Op::Sync => stack.commit(builder),
            Op::Jump(offset) => {
                let target = jump_target(pc, offset, op_count)?;
                let block =
                    flow_into(builder, &mut blocks, &mut entry_states, pc, target, &stack)?;
                builder.ins().jump(block, &[]);
                continue;
            }
            Op::BranchIfZero(offset) => {
                let target = jump_target(pc, offset, op_count)?;
                let condition = stack.pop(builder);
                let taken =
                    flow_into(builder, &mut blocks, &mut entry_states, pc, target, &stack)?;
                let fall_pc = pc + 1;
                let fallthrough = if fall_pc < op_count {
                    flow_into(builder, &mut blocks, &mut entry_states, pc, fall_pc, &stack)?
                } else {
                    *exit_block.get_or_insert_with(|| builder.create_block())
                };
                let is_zero = builder.ins().icmp_imm(IntCC::Equal, condition, 0);
                builder.ins().brif(is_zero, taken, &[], fallthrough, &[]);
                continue;
            }
            Op::Return => {
                let value = stack.pop(builder);
                builder.ins().return_(&[value]);
                continue;
            }
        }
        current = Some(stack);
    }

    // Falling off the end of the op stream returns 0, as does the shared
    // exit block used by a conditional branch at the last pc.
    if current.is_some() {
        let fallthrough_zero = builder.ins().iconst(types::I64, 0);
        builder.ins().return_(&[fallthrough_zero]);
    }
    if let Some(block) = exit_block {
        builder.switch_to_block(block);
        let exit_zero = builder.ins().iconst(types::I64, 0);
        builder.ins().return_(&[exit_zero]);
    }

    builder.seal_all_blocks();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cranelift_codegen::ir::{AbiParam, Function, Signature, UserFuncName};
    use cranelift_codegen::isa::CallConv;
    use cranelift_frontend::FunctionBuilderContext;

    fn translate(function: &StackFunction) -> Result<(), JitError> {
        let mut signature = Signature::new(CallConv::Fast);
        signature.params.push(AbiParam::new(types::I64));
        signature.params.push(AbiParam::new(types::I64));
        signature.returns.push(AbiParam::new(types::I64));
        let mut func = Function::with_name_signature(UserFuncName::user(0, 0), signature);
        let mut ctx = FunctionBuilderContext::new();
        let mut builder = FunctionBuilder::new(&mut func, &mut ctx);
        let result = translate_function(&mut builder, function, StackLayout::default());
        if result.is_ok() {
            builder.finalize();
        }
        result
    }

    #[test]
    fn empty_function_translates() {
        let function = StackFunction::builder().name("empty").build();
        translate(&function).expect("empty function should translate");
    }

    #[test]
    fn straight_line_stack_ops_translate() {
        let function = StackFunction::builder()
            .name("straight_line")
            .op(Op::PushConst(5))
            .op(Op::PushConst(7))
            .op(Op::Dup)
            .op(Op::Pick(2))
            .op(Op::Add)
            .op(Op::Drop(1))
            .op(Op::Sync)
            .op(Op::Return)
            .build();
        translate(&function).expect("straight-line ops should translate");
    }

    #[test]
    fn out_of_range_jump_is_reported() {
        let function = StackFunction::builder()
            .name("bad_jump")
            .op(Op::Jump(7))
            .build();
        let err = translate(&function).expect_err("out-of-range jump should fail");
        match err {
            JitError::InvalidJumpTarget { pc, offset, op_count } => {
                assert_eq!(pc, 0);
                assert_eq!(offset, 7);
                assert_eq!(op_count, 1);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn out_of_range_local_is_reported() {
        let function = StackFunction::builder()
            .name("bad_local")
            .local_count(1)
            .op(Op::PushConst(1))
            .op(Op::StoreLocal(3))
            .build();
        let err = translate(&function).expect_err("out-of-range local should fail");
        match err {
            JitError::InvalidLocal { pc, index, local_count } => {
                assert_eq!(pc, 1);
                assert_eq!(index, 3);
                assert_eq!(local_count, 1);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn back_edge_into_unreachable_code_is_reported() {
        // pc 0 jumps over pc 1, which is therefore never translated; the
        // branch at pc 3 then tries to land on it.
        let function = StackFunction::builder()
            .name("unreachable_target")
            .op(Op::Jump(2))
            .op(Op::PushConst(9))
            .op(Op::PushConst(1))
            .op(Op::BranchIfZero(-2))
            .build();
        let err = translate(&function).expect_err("back-edge into unreachable code should fail");
        match err {
            JitError::UnreachableJumpTarget { pc, target } => {
                assert_eq!(pc, 3);
                assert_eq!(target, 1);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    #[should_panic(expected = "different depth")]
    fn merge_of_mismatched_depths_is_fatal() {
        // The taken edge reaches the join with depth 0; the fallthrough path
        // pushes twice before jumping to the same join.
        let function = StackFunction::builder()
            .name("depth_mismatch")
            .op(Op::PushConst(0))
            .op(Op::BranchIfZero(4))
            .op(Op::PushConst(1))
            .op(Op::PushConst(2))
            .op(Op::Jump(1))
            .op(Op::Return)
            .build();
        let _ = translate(&function);
    }

    #[test]
    fn code_after_return_is_skipped() {
        let function = StackFunction::builder()
            .name("dead_tail")
            .op(Op::PushConst(1))
            .op(Op::Return)
            .op(Op::PushConst(2))
            .op(Op::Add)
            .build();
        translate(&function).expect("dead tail should be skipped, not translated");
    }
}
