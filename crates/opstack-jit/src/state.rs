//! The protocol simulated virtual machine state obeys across control flow.
//!
//! Anything the compiler simulates on behalf of the virtual machine — the
//! operand stack, individual registers, custom structures — must know how to
//! behave when builder control flow forks, joins, or leaves the compiled
//! region:
//!
//! ```text
//! fork (branch, loop header)   make_copy  — independently mutable clone
//! join (merge point)           merge_into — rewrite self's values into the
//!                                           resident state's storage slots
//! exit (call-out, return)      commit     — flush simulated values to real
//!                                           VM memory
//! re-entry (after call-out,
//! block adoption)              reload     — re-derive usable value handles
//! ```
//!
//! States are used polymorphically by front ends that track heterogeneous
//! state per block, hence the trait objects and `Any`-based downcasting in
//! [`merge_into`](VmState::merge_into).

use std::any::Any;

use cranelift_frontend::FunctionBuilder;

/// Contract for a piece of simulated virtual machine state.
pub trait VmState {
    /// Emit IR that materializes the simulated state into real VM storage.
    ///
    /// Called once per exit point of the compiled region, so that a fallback
    /// path (interpreter call-out, deoptimization) observes a correct frame.
    fn commit(&mut self, builder: &mut FunctionBuilder<'_>);

    /// Re-establish the simulation after control returns from outside the
    /// compiled region, or when this state is adopted by a new block.
    ///
    /// Default is a no-op; concrete states override it when their value
    /// handles cannot be consumed as-is.
    fn reload(&mut self, builder: &mut FunctionBuilder<'_>) {
        let _ = builder;
    }

    /// Produce an independently mutable copy of this state.
    ///
    /// Mutating the copy's logical contents must never perturb the original.
    /// Unchanged elements keep their identity.
    fn make_copy(&self) -> Box<dyn VmState>;

    /// Emit IR into `builder` making self's current values visible through
    /// `other`'s storage slots.
    ///
    /// `other` is the state already established at a merge point; code
    /// emitted after that point was generated against `other`'s slots, so
    /// every incoming edge stores its own values into those same slots.
    /// Merging states of different concrete kinds is a fatal error.
    fn merge_into(&self, other: &mut dyn VmState, builder: &mut FunctionBuilder<'_>);

    /// Downcast support for [`merge_into`](Self::merge_into).
    fn as_any(&self) -> &dyn Any;

    /// Mutable downcast support for [`merge_into`](Self::merge_into).
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::register::VmRegister;
    use crate::stack::OperandStack;
    use cranelift_codegen::ir::{AbiParam, Function, InstBuilder, Signature, UserFuncName, types};
    use cranelift_codegen::isa::CallConv;
    use cranelift_frontend::FunctionBuilderContext;

    fn with_builder<R>(body: impl FnOnce(&mut FunctionBuilder<'_>) -> R) -> R {
        let mut signature = Signature::new(CallConv::Fast);
        signature.returns.push(AbiParam::new(types::I64));
        let mut func = Function::with_name_signature(UserFuncName::user(0, 0), signature);
        let mut ctx = FunctionBuilderContext::new();
        let mut builder = FunctionBuilder::new(&mut func, &mut ctx);
        let block = builder.create_block();
        builder.switch_to_block(block);

        let result = body(&mut builder);

        let zero = builder.ins().iconst(types::I64, 0);
        builder.ins().return_(&[zero]);
        builder.seal_all_blocks();
        builder.finalize();
        result
    }

    #[test]
    fn heterogeneous_states_commit_through_the_protocol() {
        with_builder(|builder| {
            let top_init = builder.ins().iconst(types::I64, 0);
            let stack_top = VmRegister::with_initial_value(builder, types::I64, top_init);
            let mut stack = OperandStack::new(builder, 4, types::I64, stack_top);
            let value = builder.ins().iconst(types::I64, 9);
            stack.push(builder, value);

            let mut states: Vec<Box<dyn VmState>> = vec![Box::new(stack), Box::new(stack_top)];
            for state in &mut states {
                state.commit(builder);
                state.reload(builder);
            }
        });
    }

    #[test]
    fn make_copy_through_the_protocol_is_independent() {
        with_builder(|builder| {
            let top_init = builder.ins().iconst(types::I64, 0);
            let stack_top = VmRegister::with_initial_value(builder, types::I64, top_init);
            let mut stack = OperandStack::new(builder, 2, types::I64, stack_top);
            let value = builder.ins().iconst(types::I64, 3);
            stack.push(builder, value);

            let mut copy = VmState::make_copy(&stack);
            let copied = copy
                .as_any_mut()
                .downcast_mut::<OperandStack>()
                .expect("copy of an operand stack should be an operand stack");
            let extra = builder.ins().iconst(types::I64, 4);
            copied.push(builder, extra);

            assert_eq!(stack.depth(), 1);
            assert_eq!(copied.depth(), 2);
        });
    }

    #[test]
    fn merging_a_stack_into_a_register_is_fatal() {
        with_builder(|builder| {
            let top_init = builder.ins().iconst(types::I64, 0);
            let stack_top = VmRegister::with_initial_value(builder, types::I64, top_init);
            let stack = OperandStack::new(builder, 2, types::I64, stack_top);

            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                let mut register: Box<dyn VmState> = Box::new(stack_top);
                stack.merge_into(register.as_mut(), builder);
            }));
            assert!(outcome.is_err(), "cross-kind merge should panic");
        });
    }
}
