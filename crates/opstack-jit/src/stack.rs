//! The simulated bytecode operand stack.
//!
//! Bytecode virtual machines keep intermediate expression values on an
//! operand stack. The JIT simulates that stack, but what is pushed and
//! popped are IR value handles: each bytecode handler pops the handles for
//! its operands, combines them into a new IR node, and pushes the result
//! back for later bytecodes to consume. The simulated stack is *not* part of
//! the compiled method's frame, so its state must be modeled at every
//! program point — one [`OperandStack`] per builder path, forked with
//! `Clone` at branches and reconciled with
//! [`merge_into`](crate::state::VmState::merge_into) at joins.
//!
//! Each depth index owns a backing stack slot. `push` stores through to the
//! slot as well as caching the value handle, so a state crossing a block
//! boundary can re-derive usable handles from the slots
//! ([`reload`](crate::state::VmState::reload)) and an incoming merge edge
//! can overwrite the slots the resident state's downstream code reads
//! (`merge_into`). [`commit`](crate::state::VmState::commit) walks the live
//! slots bottom-up and writes each value to the real VM operand stack, whose
//! address layout is described by [`StackLayout`].

use cranelift_codegen::ir::{InstBuilder, MemFlags, StackSlot, StackSlotData, StackSlotKind};
use cranelift_codegen::ir::{Type, Value};
use cranelift_frontend::FunctionBuilder;

use crate::register::VmRegister;
use crate::state::VmState;

/// How a concrete virtual machine lays out its real operand stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackLayout {
    /// `true` if the real stack grows towards larger addresses.
    pub grows_up: bool,
    /// Difference, in elements, between the initial stack pointer and the
    /// bottom-of-stack slot.
    ///
    /// A VM that pushes by bumping the pointer and then storing starts with
    /// the pointer one element before the bottom slot (`-1`). A VM that
    /// stores first and bumps afterwards starts with the pointer on the
    /// bottom slot itself (`0`). Other values would be highly unusual.
    pub starting_offset: i32,
}

impl Default for StackLayout {
    fn default() -> Self {
        Self {
            grows_up: true,
            starting_offset: -1,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct StackCell {
    slot: StackSlot,
    /// Live value handle for cells below the logical top, `None` above it.
    value: Option<Value>,
}

/// Simulated operand stack of IR value handles.
///
/// Cloning an `OperandStack` is the fork operation: the clone has its own
/// cell storage and may be pushed and popped freely without perturbing the
/// original, while unchanged cells keep both their value identity and their
/// backing slot identity (which is what makes merge reconciliation cheap for
/// common fork lineages).
#[derive(Debug, Clone)]
pub struct OperandStack {
    element_type: Type,
    layout: StackLayout,
    stack_top: VmRegister,
    cells: Vec<StackCell>,
    top: usize,
}

impl OperandStack {
    /// Create a stack with the default [`StackLayout`].
    ///
    /// `size_hint` sizes the initial backing storage (minimum 1); the stack
    /// grows on demand. `stack_top` is a previously initialized register
    /// mirroring the real VM's stack-top pointer; every push and pop updates
    /// it by one element in the configured growth direction.
    pub fn new(
        builder: &mut FunctionBuilder<'_>,
        size_hint: u32,
        element_type: Type,
        stack_top: VmRegister,
    ) -> Self {
        Self::with_layout(builder, size_hint, element_type, stack_top, StackLayout::default())
    }

    /// Create a stack with an explicit [`StackLayout`].
    pub fn with_layout(
        builder: &mut FunctionBuilder<'_>,
        size_hint: u32,
        element_type: Type,
        stack_top: VmRegister,
        layout: StackLayout,
    ) -> Self {
        let mut stack = Self {
            element_type,
            layout,
            stack_top,
            cells: Vec::new(),
            top: 0,
        };
        stack.grow(builder, size_hint.max(1) as usize);
        stack
    }

    /// Current logical depth.
    pub fn depth(&self) -> usize {
        self.top
    }

    /// Current allocated capacity. Never shrinks.
    pub fn capacity(&self) -> usize {
        self.cells.len()
    }

    /// The semantic type of the stack's elements.
    pub fn element_type(&self) -> Type {
        self.element_type
    }

    /// The layout this stack was configured with.
    pub fn layout(&self) -> StackLayout {
        self.layout
    }

    /// The register mirroring the real VM's stack-top pointer.
    ///
    /// Exposed so a front end can capture or rewrite the pointer outside of
    /// push/pop, e.g. for a deoptimization snapshot.
    pub fn stack_top_register(&self) -> &VmRegister {
        &self.stack_top
    }

    /// Push `value` onto the simulated stack.
    ///
    /// Grows the backing storage if it is full, stores the value through to
    /// the backing slot for the new top, and bumps the stack-top register by
    /// one element.
    ///
    /// # Panics
    ///
    /// If `value`'s type does not match the element type.
    pub fn push(&mut self, builder: &mut FunctionBuilder<'_>, value: Value) {
        let ty = builder.func.dfg.value_type(value);
        assert_eq!(
            ty, self.element_type,
            "pushed a {ty} value onto a {} operand stack",
            self.element_type
        );
        if self.top == self.cells.len() {
            self.grow(builder, 1);
        }
        let cell = &mut self.cells[self.top];
        cell.value = Some(value);
        let slot = cell.slot;
        builder.ins().stack_store(value, slot, 0);
        self.top += 1;
        self.adjust_stack_top(builder, 1);
    }

    /// Pop and return the value on top of the simulated stack.
    ///
    /// # Panics
    ///
    /// If the stack is empty. An empty pop means the bytecode stream is
    /// malformed or the front end is buggy; continuing would generate
    /// incorrect code.
    pub fn pop(&mut self, builder: &mut FunctionBuilder<'_>) -> Value {
        assert!(self.top > 0, "popped an empty operand stack");
        self.top -= 1;
        let value = self.cells[self.top]
            .value
            .take()
            .expect("live operand stack cell holds a value");
        self.adjust_stack_top(builder, -1);
        value
    }

    /// The value on top of the stack, without mutating it.
    pub fn top(&self) -> Value {
        self.pick(0)
    }

    /// The value `depth` elements below the top. `pick(0)` is [`top`](Self::top).
    ///
    /// # Panics
    ///
    /// If `depth` is not below the logical depth.
    pub fn pick(&self, depth: usize) -> Value {
        assert!(
            depth < self.top,
            "picked depth {depth} on an operand stack of depth {}",
            self.top
        );
        self.cells[self.top - 1 - depth]
            .value
            .expect("live operand stack cell holds a value")
    }

    /// Discard `count` values from the top of the stack.
    ///
    /// The stack-top register is updated once for the aggregate change, not
    /// once per element.
    ///
    /// # Panics
    ///
    /// If `count` exceeds the logical depth.
    pub fn discard(&mut self, builder: &mut FunctionBuilder<'_>, count: usize) {
        assert!(
            count <= self.top,
            "discarded {count} values from an operand stack of depth {}",
            self.top
        );
        for cell in &mut self.cells[self.top - count..self.top] {
            cell.value = None;
        }
        self.top -= count;
        self.adjust_stack_top(builder, -(count as i64));
    }

    /// Duplicate the value on top of the stack.
    pub fn dup(&mut self, builder: &mut FunctionBuilder<'_>) {
        let value = self.top();
        self.push(builder, value);
    }

    /// Grow the backing storage by at least `requested` cells: the new
    /// capacity is the old capacity doubled or extended by `requested`,
    /// whichever is larger. Existing cells are untouched.
    fn grow(&mut self, builder: &mut FunctionBuilder<'_>, requested: usize) {
        let target = (self.cells.len() * 2)
            .max(self.cells.len() + requested)
            .max(1);
        while self.cells.len() < target {
            let slot = builder.create_sized_stack_slot(StackSlotData::new(
                StackSlotKind::ExplicitSlot,
                self.element_type.bytes(),
                8,
            ));
            self.cells.push(StackCell { slot, value: None });
        }
    }

    /// Move the stack-top register by `delta` elements, scaled to bytes and
    /// signed by the growth direction.
    fn adjust_stack_top(&mut self, builder: &mut FunctionBuilder<'_>, delta: i64) {
        let element_bytes = i64::from(self.element_type.bytes());
        let direction = if self.layout.grows_up { 1 } else { -1 };
        self.stack_top.adjust(builder, delta * direction * element_bytes);
    }

    /// Byte offset of slot `index` relative to the current stack-top
    /// pointer: `(index - top - starting_offset)` elements, in the growth
    /// direction.
    fn vm_slot_offset(&self, index: usize) -> i32 {
        let elements =
            index as i64 - self.top as i64 - i64::from(self.layout.starting_offset);
        let bytes = elements * i64::from(self.element_type.bytes());
        (if self.layout.grows_up { bytes } else { -bytes }) as i32
    }
}

impl VmState for OperandStack {
    /// Store every live simulated value to the real VM operand stack,
    /// bottom-up, recreating the interpreter's stack memory so a fallback
    /// path observes a correct frame.
    fn commit(&mut self, builder: &mut FunctionBuilder<'_>) {
        let stack_pointer = self.stack_top.read(builder);
        for index in 0..self.top {
            let value = self.cells[index]
                .value
                .expect("live operand stack cell holds a value");
            let offset = self.vm_slot_offset(index);
            builder
                .ins()
                .store(MemFlags::trusted(), value, stack_pointer, offset);
        }
    }

    /// Re-derive every live value handle by loading from its backing slot.
    ///
    /// A value handle is only usable in blocks its defining instruction
    /// dominates, so a state adopted by a new block must refresh its handles
    /// before code there consumes them. The same hook re-establishes the
    /// simulation after an external call-out, under the convention that the
    /// callee's handler stored any changed values back through the slots.
    fn reload(&mut self, builder: &mut FunctionBuilder<'_>) {
        for cell in &mut self.cells[..self.top] {
            let value = builder.ins().stack_load(self.element_type, cell.slot, 0);
            cell.value = Some(value);
        }
    }

    fn make_copy(&self) -> Box<dyn VmState> {
        Box::new(self.clone())
    }

    /// Store self's values into `other`'s backing slots, index by index.
    ///
    /// `other` is the state resident at the merge point; operations emitted
    /// below the merge read `other`'s slots, so after every incoming edge
    /// has merged, those reads observe the correct value regardless of which
    /// path executed. Indices whose backing slot is shared (common fork
    /// lineage) are skipped — `push` already materialized the value there.
    ///
    /// # Panics
    ///
    /// If the two stacks differ in logical depth or element type. A depth
    /// mismatch at a merge point can only arise from malformed bytecode and
    /// is not recoverable.
    fn merge_into(&self, other: &mut dyn VmState, builder: &mut FunctionBuilder<'_>) {
        let other = other
            .as_any_mut()
            .downcast_mut::<OperandStack>()
            .expect("an operand stack can only merge into another operand stack");
        assert_eq!(
            self.top, other.top,
            "merged operand stacks of different depth ({} vs {})",
            self.top, other.top
        );
        assert_eq!(
            self.element_type, other.element_type,
            "merged operand stacks of different element type"
        );
        for index in 0..self.top {
            let source = &self.cells[index];
            let destination = other.cells[index].slot;
            if source.slot == destination {
                continue;
            }
            let value = source
                .value
                .expect("live operand stack cell holds a value");
            builder.ins().stack_store(value, destination, 0);
        }
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}
