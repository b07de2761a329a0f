// This module defines the error types for the mlc backend using the thiserror crate.
// CompileError is the single error enum of the pipeline: text IR parse failures, IR that
// breaks a structural rule (a compare not followed by its ternary, an unknown value), a
// destroy class narrowed to the empty set, the unsupported stack-shape mismatch at a branch
// merge, functions with more parameters than argument registers, and I/O failures of the
// driver. Each variant carries the context needed to find the offending IR. Allocator
// invariant violations are not represented here: they are internal bugs and panic.
// CompileResult<T> is the usual alias for Result<T, CompileError>.

//! Error types for the mlc backend.

use crate::ir::{DestroyClass, Var};
use thiserror::Error;

/// Main error type for lowering and code generation.
#[derive(Error, Debug)]
pub enum CompileError {
    #[error("parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("malformed IR in {function}: {reason}")]
    MalformedIr { function: String, reason: String },

    #[error("destroy class conflict for {var}: {current:?} cannot narrow to {allowed:?}")]
    DestroyClassConflict {
        var: Var,
        current: DestroyClass,
        allowed: DestroyClass,
    },

    #[error("unsupported branch merge in {function}: {reason}")]
    UnsupportedMerge { function: String, reason: String },

    #[error("function {function} takes {count} parameters, at most 2 are supported")]
    TooManyParams { function: String, count: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CompileError {
    pub(crate) fn malformed(function: &str, reason: impl Into<String>) -> Self {
        Self::MalformedIr {
            function: function.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for compile operations.
pub type CompileResult<T> = Result<T, CompileError>;
