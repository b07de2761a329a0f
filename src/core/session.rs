// This module provides the compilation session shared by every function of a module. The
// session owns a reference to a bumpalo arena in which global symbol names are interned, so
// the allocator's virtual Global locations can hold plain &'arena str slices without cloning.
// It carries the CodegenOptions that steer emission (tail calls, the allocator's consistency
// checking, constant folding), accumulates the static data objects and external symbols the
// module driver renders after the function sections, and gathers SessionStats: functions,
// lowered instructions, spills, runtime calls, folded constants, branches eliminated at
// compile time, tail calls and branch merges. All mutable state sits behind RefCell so the
// lowering code can record through a shared borrow.

//! Arena-based compilation session.

use bumpalo::Bump;
use hashbrown::{HashMap, HashSet};
use std::cell::RefCell;
use std::fmt;

use crate::abi::StaticObject;

/// Knobs of the code generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodegenOptions {
    /// Turn a final `apply` into `jmp apply_fn`.
    pub tail_calls: bool,
    /// Run `Context::assert_consistency` after every allocator mutation.
    pub check_consistency: bool,
    /// Evaluate arithmetic and comparisons on two constants at compile time.
    pub fold_constants: bool,
}

impl Default for CodegenOptions {
    fn default() -> Self {
        Self {
            tail_calls: true,
            check_consistency: cfg!(debug_assertions),
            fold_constants: true,
        }
    }
}

pub struct CompilationSession<'arena> {
    arena: &'arena Bump,
    options: CodegenOptions,
    stats: RefCell<SessionStats>,
    interned_strings: RefCell<HashMap<String, &'arena str>>,
    statics: RefCell<Vec<StaticObject>>,
    /// Symbols referenced through `Global` that are not defined in the module.
    externs: RefCell<HashSet<&'arena str>>,
}

impl<'arena> CompilationSession<'arena> {
    pub fn new(arena: &'arena Bump) -> Self {
        Self::with_options(arena, CodegenOptions::default())
    }

    pub fn with_options(arena: &'arena Bump, options: CodegenOptions) -> Self {
        Self {
            arena,
            options,
            stats: RefCell::new(SessionStats::default()),
            interned_strings: RefCell::new(HashMap::new()),
            statics: RefCell::new(Vec::new()),
            externs: RefCell::new(HashSet::new()),
        }
    }

    pub fn arena(&self) -> &'arena Bump {
        self.arena
    }

    pub fn options(&self) -> &CodegenOptions {
        &self.options
    }

    /// Intern a string in the arena.
    pub fn intern_str(&self, s: &str) -> &'arena str {
        let mut strings = self.interned_strings.borrow_mut();
        if let Some(&interned) = strings.get(s) {
            return interned;
        }

        let interned = self.arena.alloc_str(s);
        strings.insert(s.to_string(), interned);
        interned
    }

    /// Adds a static object to the module's data section.
    pub fn add_static(&self, object: StaticObject) {
        let mut statics = self.statics.borrow_mut();
        if statics.iter().all(|o| o.name != object.name) {
            statics.push(object);
        }
    }

    pub fn statics(&self) -> Vec<StaticObject> {
        self.statics.borrow().clone()
    }

    /// Records a symbol the generated code refers to.
    pub fn reference_symbol(&self, symbol: &str) {
        let symbol = self.intern_str(symbol);
        self.externs.borrow_mut().insert(symbol);
    }

    /// Referenced symbols in sorted order.
    pub fn referenced_symbols(&self) -> Vec<&'arena str> {
        let mut symbols: Vec<_> = self.externs.borrow().iter().copied().collect();
        symbols.sort_unstable();
        symbols
    }

    pub fn record_function_compiled(&self, name: &str, asm_lines: usize) {
        let mut stats = self.stats.borrow_mut();
        stats.functions_compiled += 1;
        stats.asm_lines += asm_lines;

        if stats.largest_function_lines < asm_lines {
            stats.largest_function_lines = asm_lines;
            stats.largest_function_name = name.to_string();
        }
    }

    pub fn record_instruction_lowered(&self, kind: &str) {
        let mut stats = self.stats.borrow_mut();
        stats.instructions_lowered += 1;
        *stats.instruction_counts.entry(kind.to_string()).or_insert(0) += 1;
    }

    pub fn record_spills(&self, count: usize) {
        self.stats.borrow_mut().spills_generated += count;
    }

    pub fn record_runtime_call(&self, symbol: &str) {
        self.stats.borrow_mut().runtime_calls += 1;
        log::trace!("runtime call to {symbol}");
    }

    pub fn record_constant_folded(&self) {
        self.stats.borrow_mut().constants_folded += 1;
    }

    pub fn record_branch_eliminated(&self) {
        self.stats.borrow_mut().branches_eliminated += 1;
    }

    pub fn record_tail_call(&self) {
        self.stats.borrow_mut().tail_calls += 1;
    }

    pub fn record_merge(&self) {
        self.stats.borrow_mut().merges += 1;
    }

    pub fn stats(&self) -> SessionStats {
        self.stats.borrow().clone()
    }
}

/// Compilation session statistics.
#[derive(Debug, Default, Clone)]
pub struct SessionStats {
    pub functions_compiled: usize,

    /// Lines of assembly emitted for function bodies.
    pub asm_lines: usize,

    pub instructions_lowered: usize,

    /// Count of each instruction kind lowered.
    pub instruction_counts: std::collections::HashMap<String, usize>,

    pub largest_function_lines: usize,
    pub largest_function_name: String,

    /// Values moved from a register to the stack.
    pub spills_generated: usize,

    /// Calls to `malloc`, `increment_value`, `decrement_value` and `apply_fn`.
    pub runtime_calls: usize,

    pub constants_folded: usize,

    /// Ternaries whose comparison was decided at compile time.
    pub branches_eliminated: usize,

    pub tail_calls: usize,
    pub merges: usize,
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Compilation Session Statistics:")?;
        writeln!(f, "  Functions compiled: {}", self.functions_compiled)?;
        writeln!(f, "  Instructions lowered: {}", self.instructions_lowered)?;
        writeln!(f, "  Assembly lines: {}", self.asm_lines)?;
        writeln!(f, "  Spills generated: {}", self.spills_generated)?;
        writeln!(f, "  Runtime calls: {}", self.runtime_calls)?;
        writeln!(f, "  Constants folded: {}", self.constants_folded)?;
        writeln!(f, "  Branches eliminated: {}", self.branches_eliminated)?;
        writeln!(f, "  Tail calls: {}", self.tail_calls)?;
        writeln!(f, "  Branch merges: {}", self.merges)?;

        if !self.largest_function_name.is_empty() {
            writeln!(
                f,
                "  Largest function: {} ({} lines)",
                self.largest_function_name, self.largest_function_lines
            )?;
        }

        if !self.instruction_counts.is_empty() {
            writeln!(f, "  Instruction breakdown:")?;
            let mut sorted: Vec<_> = self.instruction_counts.iter().collect();
            sorted.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));

            for (kind, count) in sorted {
                writeln!(f, "    {}: {}", kind, count)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::{BlockTag, StaticWord};

    #[test]
    fn test_compilation_session_creation() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);

        let stats = session.stats();
        assert_eq!(stats.functions_compiled, 0);
        assert_eq!(stats.instructions_lowered, 0);
        assert!(session.options().tail_calls);
    }

    #[test]
    fn test_string_interning() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);

        let s1 = session.intern_str("hello");
        let s2 = session.intern_str("hello");
        let s3 = session.intern_str("world");

        assert_eq!(s1.as_ptr(), s2.as_ptr());
        assert_ne!(s1.as_ptr(), s3.as_ptr());
    }

    #[test]
    fn test_referenced_symbols_sorted_and_unique() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);

        session.reference_symbol("malloc");
        session.reference_symbol("apply_fn");
        session.reference_symbol("malloc");

        assert_eq!(session.referenced_symbols(), vec!["apply_fn", "malloc"]);
    }

    #[test]
    fn test_statics_deduplicated_by_name() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let object = StaticObject {
            name: "unit".to_string(),
            tag: BlockTag::Tuple,
            fields: vec![StaticWord::Scalar(1)],
        };

        session.add_static(object.clone());
        session.add_static(object);
        assert_eq!(session.statics().len(), 1);
    }

    #[test]
    fn test_statistics_display() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);

        session.record_function_compiled("fact", 12);
        session.record_instruction_lowered("binary");
        session.record_instruction_lowered("apply");
        session.record_instruction_lowered("binary");
        session.record_spills(1);
        session.record_runtime_call("apply_fn");

        let stats = session.stats();
        assert_eq!(stats.instruction_counts["binary"], 2);
        assert_eq!(stats.runtime_calls, 1);

        let output = format!("{}", stats);
        assert!(output.contains("Functions compiled: 1"));
        assert!(output.contains("Instructions lowered: 3"));
        assert!(output.contains("Spills generated: 1"));
        assert!(output.contains("fact (12 lines)"));
    }
}
