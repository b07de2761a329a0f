//! Textual rendering of IR functions in the parser's syntax.

use std::fmt::{self, Write as _};

use super::{Cond, Function, Instruction, Module, Rhs, Scope};

/// Renders a function, optionally annotated with analysis results.
pub struct Printer<'f> {
    func: &'f Function,
    show_destroys: bool,
    show_classes: bool,
}

impl<'f> Printer<'f> {
    pub fn new(func: &'f Function) -> Self {
        Self {
            func,
            show_destroys: false,
            show_classes: false,
        }
    }

    /// Emit `// destroy` comments from the release schedule.
    pub fn with_destroys(mut self) -> Self {
        self.show_destroys = true;
        self
    }

    /// Emit a trailing comment listing every value's destroy class.
    pub fn with_classes(mut self) -> Self {
        self.show_classes = true;
        self
    }

    fn names(&self, vars: &[super::Var]) -> String {
        vars.iter()
            .map(|&v| self.func.var_name(v))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn write_scope(&self, out: &mut String, scope: &Scope, depth: usize) -> fmt::Result {
        let indent = "    ".repeat(depth);
        let name = |v| self.func.var_name(v);
        let mut cond: Option<Cond> = None;

        for (i, inst) in scope.instructions.iter().enumerate() {
            if self.show_destroys {
                if let Some(vars) = scope.destroys.get(i).filter(|d| !d.is_empty()) {
                    writeln!(out, "{indent}// destroy {}", self.names(vars))?;
                }
            }
            match inst {
                Instruction::Compare { lhs, rhs, cond: c } => {
                    cond = Some(*c);
                    writeln!(out, "{indent}cmp({}, {});", name(*lhs), name(*rhs))?;
                }
                Instruction::WriteUninitializedMemory { base, offset, src } => {
                    writeln!(out, "{indent}{}[{offset}] := {};", name(*base), name(*src))?;
                }
                Instruction::Assign { dst, rhs } => {
                    write!(out, "{indent}{} = ", name(*dst))?;
                    match rhs {
                        Rhs::Constant(value) => writeln!(out, "{value};")?,
                        Rhs::Global(symbol) => writeln!(out, "@{symbol};")?,
                        Rhs::Copy(src) => writeln!(out, "{};", name(*src))?,
                        Rhs::Load { base, offset } => writeln!(out, "{}[{offset}];", name(*base))?,
                        Rhs::Alloc { words } => writeln!(out, "alloc {words};")?,
                        Rhs::Apply { func, arg } => {
                            writeln!(out, "apply({}, {});", name(*func), name(*arg))?
                        }
                        Rhs::Unary { op, operand } => {
                            writeln!(out, "{} {};", op.name(), name(*operand))?
                        }
                        Rhs::Binary { op, lhs, rhs } => {
                            writeln!(out, "{}({}, {});", op.name(), name(*lhs), name(*rhs))?
                        }
                        Rhs::Ternary { taken, not_taken } => {
                            let mnemonic = cond.take().map_or("?", Cond::mnemonic);
                            writeln!(out, "if ({mnemonic}) {{")?;
                            self.write_scope(out, taken, depth + 1)?;
                            writeln!(out, "{indent}}} else {{")?;
                            self.write_scope(out, not_taken, depth + 1)?;
                            writeln!(out, "{indent}}};")?;
                        }
                    }
                }
            }
        }

        if self.show_destroys {
            if let Some(vars) = scope.destroys.last().filter(|d| !d.is_empty()) {
                writeln!(out, "{indent}// destroy {}", self.names(vars))?;
            }
            if !scope.moves_ret {
                writeln!(out, "{indent}// copy out")?;
            }
        }
        writeln!(out, "{indent}return {};", name(scope.ret))
    }
}

impl fmt::Display for Printer<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        let params = self.names(&self.func.params);
        writeln!(out, "fn {}({params}) {{", self.func.name)?;
        self.write_scope(&mut out, &self.func.body, 1)?;
        writeln!(out, "}}")?;
        if self.show_classes {
            for index in 0..self.func.var_count() {
                let var = super::Var(index as u32);
                writeln!(
                    out,
                    "// class {}: {}",
                    self.func.var_name(var),
                    self.func.class(var).name()
                )?;
            }
        }
        f.write_str(&out)
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&Printer::new(self), f)
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for object in &self.statics {
            let fields = object
                .fields
                .iter()
                .map(|w| match w {
                    crate::abi::StaticWord::Scalar(v) => v.to_string(),
                    crate::abi::StaticWord::Symbol(s) => format!("@{s}"),
                })
                .collect::<Vec<_>>()
                .join(", ");
            writeln!(f, "static {} : {} {{ {fields} }};", object.name, object.tag.raw())?;
        }
        for func in &self.functions {
            write!(f, "{func}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::ir::parser::parse_module;

    #[test]
    fn test_print_parses_back() {
        let text = "fn f(a, b) {\n    cmp(a, b);\n    r = if (jle) {\n        x = add(a, b);\n        return x;\n    } else {\n        return a;\n    };\n    return r;\n}\n";
        let module = parse_module(text).unwrap();
        let printed = module.functions[0].to_string();
        assert_eq!(printed, text);
        assert_eq!(parse_module(&printed).unwrap(), module);
    }
}
