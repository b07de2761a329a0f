//! x86-64 code generation.
//!
//! This module contains all x86-64 specific code:
//! - Registers, register sets and the System V calling convention
//! - The typed instruction buffer and its NASM rendering
//! - The allocator context with its call, return and merge sequences
//! - Per-instruction lowering of IR scopes

pub mod asm;
pub mod calling_convention;
pub mod calls;
pub mod context;
pub mod lower;
pub mod merge;
pub mod register_file;

pub use asm::{AluOp, Asm, AsmInst, Label, Operand};
pub use calls::CallArg;
pub use context::{Context, Location};
pub use register_file::{Occupant, Recency, Reg, RegSet};
