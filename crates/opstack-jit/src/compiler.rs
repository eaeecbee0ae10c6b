//! Baseline JIT compiler wrapper around Cranelift.

use cranelift_codegen::ir::{AbiParam, UserFuncName, types};
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{Linkage, Module, ModuleError, default_libcall_names};

use crate::frontend::{StackFunction, translate_function};
use crate::stack::StackLayout;

/// Result of compiling a bytecode function to native code.
#[derive(Debug, Clone, Copy)]
pub struct JitCompileArtifact {
    /// Entry pointer for compiled native code.
    pub code_ptr: *const u8,
}

/// Errors produced by the baseline JIT compiler.
#[derive(Debug, thiserror::Error)]
pub enum JitError {
    /// Cranelift module-level error.
    #[error("cranelift module error: {0}")]
    Module(Box<ModuleError>),

    /// Failed to create the JIT builder.
    #[error("jit builder initialization failed: {0}")]
    Builder(String),

    /// Jump target is outside the function bounds.
    #[error("invalid jump target from pc {pc} with offset {offset} (len={op_count})")]
    InvalidJumpTarget {
        /// Pc of the branching instruction.
        pc: usize,
        /// Relative offset it carried.
        offset: i32,
        /// Number of ops in the function.
        op_count: usize,
    },

    /// Local variable index is outside the function's frame.
    #[error("invalid local index {index} at pc {pc} (local_count={local_count})")]
    InvalidLocal {
        /// Pc of the offending instruction.
        pc: usize,
        /// The out-of-range index.
        index: u16,
        /// Number of locals the function declared.
        local_count: u16,
    },

    /// A branch lands on code the linear scan already passed over as
    /// unreachable, so no block exists to land in.
    #[error("jump at pc {pc} targets unreachable code at pc {target}")]
    UnreachableJumpTarget {
        /// Pc of the branching instruction.
        pc: usize,
        /// The unreachable target pc.
        target: usize,
    },
}

impl From<ModuleError> for JitError {
    fn from(value: ModuleError) -> Self {
        Self::Module(Box::new(value))
    }
}

/// Minimal Cranelift-backed JIT compiler for [`StackFunction`]s.
pub struct JitCompiler {
    module: JITModule,
    function_builder_ctx: FunctionBuilderContext,
    context: cranelift_codegen::Context,
    next_function_id: u64,
}

impl JitCompiler {
    /// Create a new baseline JIT compiler instance.
    pub fn new() -> Result<Self, JitError> {
        let builder = JITBuilder::new(default_libcall_names())
            .map_err(|e| JitError::Builder(e.to_string()))?;
        let module = JITModule::new(builder);
        Ok(Self {
            module,
            function_builder_ctx: FunctionBuilderContext::new(),
            context: cranelift_codegen::Context::new(),
            next_function_id: 0,
        })
    }

    /// Compile a bytecode function into native code, assuming the default
    /// operand stack layout (grows up, pointer starts one element below the
    /// bottom slot).
    pub fn compile_function(
        &mut self,
        function: &StackFunction,
    ) -> Result<JitCompileArtifact, JitError> {
        self.compile_function_with_layout(function, StackLayout::default())
    }

    /// Compile a bytecode function with an explicit real-stack layout.
    pub fn compile_function_with_layout(
        &mut self,
        function: &StackFunction,
        layout: StackLayout,
    ) -> Result<JitCompileArtifact, JitError> {
        tracing::debug!(
            function = %function.name,
            ops = function.ops.len(),
            "compiling stack function to native code"
        );

        let mut signature = self.module.make_signature();
        // Signature: (stack_base: I64, arg: I64) -> I64
        signature.params.push(AbiParam::new(types::I64));
        signature.params.push(AbiParam::new(types::I64));
        signature.returns.push(AbiParam::new(types::I64));

        let name = format!("opstack_jit_{}_{}", function.name, self.next_function_id);
        self.next_function_id = self.next_function_id.saturating_add(1);

        let func_id = self
            .module
            .declare_function(&name, Linkage::Local, &signature)?;

        self.context.func = cranelift_codegen::ir::Function::with_name_signature(
            UserFuncName::user(0, func_id.as_u32()),
            signature,
        );

        {
            let mut builder =
                FunctionBuilder::new(&mut self.context.func, &mut self.function_builder_ctx);
            if let Err(err) = translate_function(&mut builder, function, layout) {
                // A translation error can leave the builder context holding
                // partially constructed blocks; it must not leak into the
                // next compilation.
                drop(builder);
                self.function_builder_ctx = FunctionBuilderContext::new();
                self.module.clear_context(&mut self.context);
                return Err(err);
            }
            builder.finalize();
        }

        self.module.define_function(func_id, &mut self.context)?;
        self.module.clear_context(&mut self.context);
        self.module.finalize_definitions()?;

        let code_ptr = self.module.get_finalized_function(func_id);
        Ok(JitCompileArtifact { code_ptr })
    }

    /// Execute a compiled artifact against a VM stack buffer, passing its
    /// base address as the real stack bottom.
    ///
    /// This is intended for translator unit tests with the default
    /// (upward-growing) layout.
    pub fn execute_compiled_i64(
        &self,
        artifact: JitCompileArtifact,
        vm_stack: &mut [i64],
        arg: i64,
    ) -> i64 {
        self.execute_compiled_i64_at(artifact, vm_stack.as_mut_ptr(), arg)
    }

    /// Execute a compiled artifact with an explicit stack base pointer, for
    /// layouts whose stack grows toward lower addresses.
    pub fn execute_compiled_i64_at(
        &self,
        artifact: JitCompileArtifact,
        stack_base: *mut i64,
        arg: i64,
    ) -> i64 {
        let func: extern "C" fn(*mut i64, i64) -> i64 = unsafe {
            // SAFETY: Artifacts are produced by this compiler with signature
            // `(*mut i64, i64) -> i64`.
            std::mem::transmute(artifact.code_ptr)
        };
        func(stack_base, arg)
    }
}
