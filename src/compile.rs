// This module is the driver of the backend. Function::compile runs the two ownership
// analyses on a function, seeds a Context with the parameters in the argument registers,
// lowers the body and hands back the instruction buffer. Module::compile does this for
// every function and assembles a complete NASM translation unit: a header, extern
// declarations for the runtime entry points and for every referenced symbol the module does
// not define itself, a text section with one global label per function, and a data section
// holding the module's static objects. Statistics for each function go to the session.

//! Function and module compilation drivers.

use std::fmt;

use hashbrown::HashSet;

use crate::abi::{StaticObject, StaticWord, RUNTIME_SYMBOLS};
use crate::analysis;
use crate::core::{CompilationSession, CompileError, CompileResult};
use crate::ir::{Function, Module};
use crate::x64::calling_convention::ARG_REGS;
use crate::x64::lower::FunctionLowering;
use crate::x64::{Asm, Context};

impl Function {
    /// Analyses and lowers this function.
    ///
    /// The destroy schedule and destroy classes are written back into the
    /// function, so printing it afterwards shows what the emitter used.
    pub fn compile<'a>(&mut self, session: &CompilationSession<'a>) -> CompileResult<Asm<'a>> {
        if self.params.len() > ARG_REGS.len() {
            return Err(CompileError::TooManyParams {
                function: self.name.clone(),
                count: self.params.len(),
            });
        }

        log::debug!("compiling {}", self.name);
        analysis::analyze(self)?;

        let mut ctx = Context::new(&self.params, session.options().check_consistency);
        FunctionLowering::new(session, self).lower_body(&mut ctx)?;

        let asm = ctx.take_asm();
        session.record_spills(ctx.spills);
        session.record_function_compiled(&self.name, asm.len());
        log::debug!(
            "compiled {}: {} instructions, {} spills",
            self.name,
            asm.len(),
            ctx.spills
        );
        Ok(asm)
    }
}

/// A compiled module, rendered as NASM source by `Display`.
#[derive(Debug)]
pub struct AssemblyModule<'a> {
    pub externs: Vec<&'a str>,
    pub functions: Vec<(String, Asm<'a>)>,
    pub statics: Vec<StaticObject>,
}

impl fmt::Display for AssemblyModule<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "; generated by mlc")?;
        writeln!(f, "default rel")?;
        writeln!(f)?;
        for symbol in &self.externs {
            writeln!(f, "extern {symbol}")?;
        }
        writeln!(f)?;

        writeln!(f, "section .text")?;
        for (name, asm) in &self.functions {
            writeln!(f)?;
            writeln!(f, "global {name}")?;
            writeln!(f, "{name}:")?;
            write!(f, "{asm}")?;
        }

        if !self.statics.is_empty() {
            writeln!(f)?;
            writeln!(f, "section .data")?;
            for object in &self.statics {
                write!(f, "{object}")?;
            }
        }
        Ok(())
    }
}

impl Module {
    /// Compiles every function and collects what the assembler needs.
    pub fn lower<'a>(&mut self, session: &CompilationSession<'a>) -> CompileResult<AssemblyModule<'a>> {
        for object in &self.statics {
            session.add_static(object.clone());
        }

        let mut functions = Vec::with_capacity(self.functions.len());
        for func in &mut self.functions {
            let asm = func.compile(session)?;
            functions.push((func.name.clone(), asm));
        }

        let statics = session.statics();
        for object in &statics {
            for word in &object.fields {
                if let StaticWord::Symbol(symbol) = word {
                    session.reference_symbol(symbol);
                }
            }
        }

        let externs = {
            let defined: HashSet<&str> = self
                .functions
                .iter()
                .map(|f| f.name.as_str())
                .chain(statics.iter().map(|o| o.name.as_str()))
                .collect();
            let mut externs: Vec<&'a str> = RUNTIME_SYMBOLS.to_vec();
            for symbol in session.referenced_symbols() {
                if !defined.contains(symbol) && !externs.contains(&symbol) {
                    externs.push(symbol);
                }
            }
            externs
        };

        Ok(AssemblyModule {
            externs,
            functions,
            statics,
        })
    }

    /// Compiles the module to NASM source text.
    pub fn compile(&mut self, session: &CompilationSession<'_>) -> CompileResult<String> {
        Ok(self.lower(session)?.to_string())
    }
}

#[cfg(test)]
mod tests {
    use bumpalo::Bump;

    use super::*;

    #[test]
    fn test_too_many_params() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut module = Module::parse("fn f(a, b, c) { return a; }").unwrap();
        let err = module.compile(&session).unwrap_err();
        assert!(matches!(err, CompileError::TooManyParams { count: 3, .. }));
    }

    #[test]
    fn test_module_layout() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut module = Module::parse(
            "static nil : 51 { };\nstatic box : tuple { 3, @nil, @outside };\nfn f() { g = @box; h = @elsewhere; return g; }\nfn id(x) { return x; }",
        )
        .unwrap();
        let text = module.compile(&session).unwrap();

        assert!(text.starts_with("; generated by mlc\ndefault rel\n"));
        for symbol in RUNTIME_SYMBOLS {
            assert!(text.contains(&format!("extern {symbol}\n")));
        }
        assert!(text.contains("extern elsewhere\n"));
        assert!(text.contains("extern outside\n"));
        assert!(!text.contains("extern box\n"));
        assert!(!text.contains("extern nil\n"));
        assert!(text.contains("global f\nf:\n    lea rax, [rel box]\n    ret\n"));
        assert!(text.contains("global id\nid:\n    mov rax, rdi\n    ret\n"));
        assert!(text.contains("section .data\n"));
        assert!(text.contains("box:\n    dq 0\n"));

        let stats = session.stats();
        assert_eq!(stats.functions_compiled, 2);
        assert_eq!(stats.largest_function_name, "f");
    }

    #[test]
    fn test_lower_skips_defined_symbols_in_externs() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut module = Module::parse(
            "static nil : 51 { };\nfn f() { g = @nil; h = @id; k = @outside; return k; }\nfn id(x) { return x; }",
        )
        .unwrap();
        let lowered = module.lower(&session).unwrap();

        assert_eq!(&lowered.externs[..RUNTIME_SYMBOLS.len()], RUNTIME_SYMBOLS);
        assert_eq!(&lowered.externs[RUNTIME_SYMBOLS.len()..], ["outside"]);
        assert_eq!(lowered.functions.len(), 2);
        assert_eq!(lowered.statics.len(), 1);
        assert_eq!(lowered.statics[0].name, "nil");
    }
}
