//! # opstack-jit
//!
//! Simulated operand-stack modeling for a Cranelift-backed baseline JIT.
//!
//! Stack-machine bytecode mutates a positional operand stack destructively;
//! Cranelift IR is a value-based dataflow graph with no notion of stack
//! slots. This crate bridges the two: an [`OperandStack`] replays bytecode
//! stack effects over IR value handles while the front end walks the
//! instruction stream, forks the simulated state at branches, and reconciles
//! divergent states at control-flow joins by emitting corrective stores.
//!
//! The pieces, bottom up:
//!
//! - [`VmRegister`] — one scalar, pointer-sized slot of persistent virtual
//!   machine state (e.g. the real stack-top pointer), backed by an explicit
//!   stack slot so it survives block boundaries.
//! - [`VmState`] — the protocol any simulated VM state obeys when builder
//!   control flow forks, joins, or is committed back to real VM memory.
//! - [`OperandStack`] — the centerpiece: a growable sequence of IR value
//!   handles with push/pop/pick/discard/dup, fork via `Clone`, and
//!   merge-time reconciliation.
//! - [`frontend`] — a small stack-machine bytecode format and the translator
//!   that drives the operand stack per instruction.
//! - [`JitCompiler`] — compiles translated functions to callable native code.

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod compiler;
pub mod frontend;
pub mod register;
pub mod stack;
pub mod state;

pub use compiler::{JitCompileArtifact, JitCompiler, JitError};
pub use frontend::{Op, StackFunction};
pub use register::VmRegister;
pub use stack::{OperandStack, StackLayout};
pub use state::VmState;
