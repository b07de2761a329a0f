//! mlc - IR lowering and x86-64 code generation for a small ML-style language.
//!
//! The backend takes a scope-structured, reference-counted IR and produces
//! NASM assembly. Every value gets exactly one release point per control
//! path, and a simulated machine state drives register and stack allocation
//! while instructions are emitted.
//!
//! # Primary Usage
//!
//! ```no_run
//! use bumpalo::Bump;
//! use mlc::core::CompilationSession;
//! use mlc::ir::Module;
//!
//! let arena = Bump::new();
//! let session = CompilationSession::new(&arena);
//!
//! let mut module = Module::parse("fn f(x, y) { z = add(x, y); return z; }")?;
//! let assembly = module.compile(&session)?;
//! # Ok::<(), mlc::core::CompileError>(())
//! ```
//!
//! # Architecture
//!
//! - [`ir`] - IR data model, builder, text parser and printer
//! - [`analysis`] - Destroy scheduling and destroy-class inference
//! - [`x64`] - Allocator context, calling sequences and lowering
//! - [`core`] - Session, options and errors
//! - [`abi`] - Heap object layout and runtime entry points

pub mod abi;
pub mod analysis;
pub mod compile;
pub mod core;
pub mod ir;
pub mod x64;

pub use compile::AssemblyModule;
pub use core::{CodegenOptions, CompilationSession, CompileError, CompileResult, SessionStats};
pub use ir::{DestroyClass, Function, Module, Var};
