// This module groups the infrastructure shared by every stage of the backend: the
// compilation session (arena-interned symbol names, codegen options, the module's static
// data and extern accumulators, statistics) and the single error type of the pipeline.

//! Core infrastructure.
//!
//! ## Session Management (`session`)
//! - Arena-based string interning using `bumpalo`
//! - Codegen options and compilation statistics
//!
//! ## Errors (`error`)
//! - `CompileError` and the `CompileResult` alias

pub mod error;
pub mod session;

pub use error::{CompileError, CompileResult};
pub use session::{CodegenOptions, CompilationSession, SessionStats};
