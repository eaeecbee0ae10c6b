//! Persistent scalar virtual machine registers.

use cranelift_codegen::ir::{StackSlotData, StackSlotKind, Type, Value};
use cranelift_codegen::ir::{InstBuilder, StackSlot};
use cranelift_frontend::FunctionBuilder;

use crate::state::VmState;

/// One scalar slot of persistent virtual machine state.
///
/// A `VmRegister` models a piece of VM state (interpreter frame pointer,
/// stack-top pointer, …) that must keep a consistent value across builder
/// blocks without being an IR value itself. It is backed by an explicit
/// stack slot; [`read`](Self::read) and [`write`](Self::write) emit load and
/// store nodes against that slot, so every block observing the register goes
/// through the same storage.
///
/// Copying a `VmRegister` (it is `Copy`) produces a distinct handle that
/// shares the backing slot, which is exactly what forked builder paths need:
/// reads and writes on either copy stay visible to the other.
#[derive(Debug, Clone, Copy)]
pub struct VmRegister {
    slot: StackSlot,
    ty: Type,
}

impl VmRegister {
    /// Allocate a register of type `ty` with an undefined initial value.
    pub fn new(builder: &mut FunctionBuilder<'_>, ty: Type) -> Self {
        let slot = builder.create_sized_stack_slot(StackSlotData::new(
            StackSlotKind::ExplicitSlot,
            ty.bytes(),
            8,
        ));
        Self { slot, ty }
    }

    /// Allocate a register and store `initial` into its backing slot.
    pub fn with_initial_value(
        builder: &mut FunctionBuilder<'_>,
        ty: Type,
        initial: Value,
    ) -> Self {
        let register = Self::new(builder, ty);
        register.write(builder, initial);
        register
    }

    /// The IR type this register holds.
    pub fn ty(&self) -> Type {
        self.ty
    }

    /// Emit a load of the register's current value.
    pub fn read(&self, builder: &mut FunctionBuilder<'_>) -> Value {
        builder.ins().stack_load(self.ty, self.slot, 0)
    }

    /// Emit a store of `value` into the register's backing slot.
    pub fn write(&self, builder: &mut FunctionBuilder<'_>, value: Value) {
        debug_assert_eq!(
            builder.func.dfg.value_type(value),
            self.ty,
            "register write with mismatched value type"
        );
        builder.ins().stack_store(value, self.slot, 0);
    }

    /// Emit a load/add/store sequence adding `delta` (bytes for pointer
    /// registers) to the register. A zero delta emits nothing.
    pub fn adjust(&self, builder: &mut FunctionBuilder<'_>, delta: i64) {
        if delta == 0 {
            return;
        }
        let old = self.read(builder);
        let new = builder.ins().iadd_imm(old, delta);
        builder.ins().stack_store(new, self.slot, 0);
    }

    pub(crate) fn backing_slot(&self) -> StackSlot {
        self.slot
    }
}

impl VmState for VmRegister {
    // Writes go through the backing slot immediately, so the register is
    // already visible to the real VM at any exit point.
    fn commit(&mut self, _builder: &mut FunctionBuilder<'_>) {}

    fn make_copy(&self) -> Box<dyn VmState> {
        Box::new(*self)
    }

    fn merge_into(&self, other: &mut dyn VmState, _builder: &mut FunctionBuilder<'_>) {
        let other = other
            .as_any_mut()
            .downcast_mut::<VmRegister>()
            .expect("a vm register can only merge into another vm register");
        assert_eq!(
            self.slot, other.slot,
            "merged vm registers must share a backing slot"
        );
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}
