//! Parser for the textual IR used by tests and the command line driver.
//!
//! ```text
//! // line comments
//! static unit : tuple { };
//! fn f(a, b) {
//!     c = add(a, 1);
//!     p = alloc 3;
//!     p[2] := c;
//!     cmp(a, b);
//!     r = if (jz) { return p; } else { x = p[2]; return x; };
//!     return r;
//! }
//! ```
//!
//! Integer literals are accepted wherever a value is read and become fresh
//! constants.

use hashbrown::HashMap;

use super::builder::FunctionBuilder;
use super::{BinaryOp, Cond, Module, Rhs, Scope, UnaryOp, Var};
use crate::abi::{BlockTag, StaticObject, StaticWord};
use crate::core::{CompileError, CompileResult};

pub fn parse_module(text: &str) -> CompileResult<Module> {
    Parser::new(text).parse()
}

struct Parser<'a> {
    text: &'a str,
    pos: usize,
    module: Module,
}

/// Per-function parsing state.
struct FunctionState<'a> {
    builder: FunctionBuilder,
    /// Visible names, innermost scope last.
    scopes: Vec<HashMap<&'a str, Var>>,
}

impl<'a> FunctionState<'a> {
    fn lookup(&self, name: &str) -> Option<Var> {
        self.scopes.iter().rev().find_map(|s| s.get(name).copied())
    }

    fn define(&mut self, name: &'a str) -> Option<Var> {
        if self.lookup(name).is_some() {
            return None;
        }
        let var = self.builder.new_var(Some(name));
        self.scopes.last_mut()?.insert(name, var);
        Some(var)
    }
}

enum Operand<'a> {
    Name(&'a str),
    Int(i64),
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            text,
            pos: 0,
            module: Module::default(),
        }
    }

    fn parse(mut self) -> CompileResult<Module> {
        self.skip_whitespace();
        while !self.is_eof() {
            match self.read_identifier()? {
                "fn" => self.parse_function()?,
                "static" => self.parse_static()?,
                other => return Err(self.error(format!("expected 'fn' or 'static', found '{other}'"))),
            }
            self.skip_whitespace();
        }
        Ok(self.module)
    }

    fn error(&self, message: impl Into<String>) -> CompileError {
        let line = self.text[..self.pos.min(self.text.len())]
            .bytes()
            .filter(|&b| b == b'\n')
            .count()
            + 1;
        CompileError::Parse {
            line,
            message: message.into(),
        }
    }

    fn is_eof(&self) -> bool {
        self.pos >= self.text.len()
    }

    fn current_char(&self) -> Option<char> {
        self.text[self.pos..].chars().next()
    }

    fn advance(&mut self) {
        if let Some(ch) = self.current_char() {
            self.pos += ch.len_utf8();
        }
    }

    fn skip_whitespace(&mut self) {
        loop {
            let rest = &self.text[self.pos..];
            if rest.starts_with("//") {
                let end = rest.find('\n').map_or(rest.len(), |i| i + 1);
                self.pos += end;
            } else if let Some(ch) = self.current_char().filter(|c| c.is_whitespace()) {
                self.pos += ch.len_utf8();
            } else {
                break;
            }
        }
    }

    fn try_read(&mut self, token: &str) -> bool {
        self.skip_whitespace();
        if self.text[self.pos..].starts_with(token) {
            self.pos += token.len();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &str) -> CompileResult<()> {
        if !self.try_read(token) {
            let found = self.current_char().map_or("end of input".to_string(), |c| format!("'{c}'"));
            return Err(self.error(format!("expected '{token}' but found {found}")));
        }
        Ok(())
    }

    fn peek_identifier(&mut self) -> Option<&'a str> {
        let saved = self.pos;
        let ident = self.read_identifier().ok();
        self.pos = saved;
        ident
    }

    fn read_identifier(&mut self) -> CompileResult<&'a str> {
        self.skip_whitespace();
        let start = self.pos;
        match self.current_char() {
            Some(ch) if ch.is_alphabetic() || ch == '_' => {}
            Some(ch) => return Err(self.error(format!("expected identifier but found '{ch}'"))),
            None => return Err(self.error("expected identifier but found end of input")),
        }
        while let Some(ch) = self.current_char() {
            if ch.is_alphanumeric() || ch == '_' || ch == '.' {
                self.advance();
            } else {
                break;
            }
        }
        Ok(&self.text[start..self.pos])
    }

    fn peek_number(&mut self) -> bool {
        self.skip_whitespace();
        let mut chars = self.text[self.pos..].chars();
        match chars.next() {
            Some('-') => chars.next().is_some_and(|c| c.is_ascii_digit()),
            Some(c) => c.is_ascii_digit(),
            None => false,
        }
    }

    fn read_number(&mut self) -> CompileResult<i64> {
        self.skip_whitespace();
        let start = self.pos;
        if self.current_char() == Some('-') {
            self.advance();
        }
        let hex = self.text[self.pos..].starts_with("0x");
        if hex {
            self.pos += 2;
        }
        let digits = self.pos;
        while let Some(ch) = self.current_char() {
            if ch.is_ascii_hexdigit() && (hex || ch.is_ascii_digit()) {
                self.advance();
            } else {
                break;
            }
        }
        if digits == self.pos {
            return Err(self.error("expected number"));
        }
        let negative = self.text[start..].starts_with('-');
        let magnitude = if hex {
            i64::from_str_radix(&self.text[digits..self.pos], 16)
        } else {
            self.text[digits..self.pos].parse::<i64>()
        }
        .map_err(|e| self.error(format!("failed to parse number: {e}")))?;
        Ok(if negative { -magnitude } else { magnitude })
    }

    fn read_offset(&mut self) -> CompileResult<u32> {
        let value = self.read_number()?;
        u32::try_from(value).map_err(|_| self.error(format!("invalid word offset {value}")))
    }

    fn parse_static(&mut self) -> CompileResult<()> {
        let name = self.read_identifier()?;
        self.expect(":")?;
        let tag = if self.peek_number() {
            let raw = self.read_number()?;
            u32::try_from(raw)
                .ok()
                .and_then(BlockTag::from_raw)
                .ok_or_else(|| self.error(format!("invalid block tag {raw}")))?
        } else {
            match self.read_identifier()? {
                "tuple" => BlockTag::Tuple,
                "closure" => BlockTag::Closure,
                "partial" => BlockTag::PartialApplication,
                "string" => BlockTag::String,
                other => return Err(self.error(format!("unknown block tag '{other}'"))),
            }
        };
        self.expect("{")?;
        let mut fields = Vec::new();
        while !self.try_read("}") {
            if self.try_read("@") {
                fields.push(StaticWord::Symbol(self.read_identifier()?.to_string()));
            } else {
                fields.push(StaticWord::Scalar(self.read_number()?));
            }
            if !self.try_read(",") && !self.text[self.pos..].trim_start().starts_with('}') {
                return Err(self.error("expected ',' or '}' in static object"));
            }
        }
        self.try_read(";");
        self.module.statics.push(StaticObject {
            name: name.to_string(),
            tag,
            fields,
        });
        Ok(())
    }

    fn parse_function(&mut self) -> CompileResult<()> {
        let name = self.read_identifier()?;
        if self.module.function(name).is_some() {
            return Err(self.error(format!("duplicate function definition: '{name}'")));
        }
        let mut state = FunctionState {
            builder: FunctionBuilder::new(name),
            scopes: vec![HashMap::new()],
        };

        self.expect("(")?;
        while !self.try_read(")") {
            let param = self.read_identifier()?;
            if state.lookup(param).is_some() {
                return Err(self.error(format!("duplicate parameter '{param}'")));
            }
            let var = state.builder.param(param);
            if let Some(scope) = state.scopes.last_mut() {
                scope.insert(param, var);
            }
            if !self.try_read(",") && !self.text[self.pos..].trim_start().starts_with(')') {
                return Err(self.error("expected ',' or ')' in parameter list"));
            }
        }

        self.expect("{")?;
        let ret = self.parse_statements(&mut state)?;
        self.module.functions.push(state.builder.finish(ret));
        Ok(())
    }

    /// Parses statements up to and including `return v; }`.
    fn parse_statements(&mut self, state: &mut FunctionState<'a>) -> CompileResult<Var> {
        loop {
            let ident = self.read_identifier()?;
            match ident {
                "return" => {
                    let operand = self.read_operand()?;
                    let ret = self.materialize(state, operand)?;
                    self.expect(";")?;
                    self.expect("}")?;
                    return Ok(ret);
                }
                "cmp" => self.parse_branch(state)?,
                name => {
                    if self.try_read("[") {
                        let offset = self.read_offset()?;
                        self.expect("]")?;
                        self.expect(":=")?;
                        let base = self.resolve(state, name)?;
                        let operand = self.read_operand()?;
                        let src = self.materialize(state, operand)?;
                        state.builder.write(base, offset, src);
                    } else {
                        self.expect("=")?;
                        if self.peek_identifier() == Some("if") {
                            return Err(self.error("'if' must directly follow a 'cmp'"));
                        }
                        let rhs = self.parse_rhs(state)?;
                        let dst = state
                            .define(name)
                            .ok_or_else(|| self.error(format!("value '{name}' redefined")))?;
                        state.builder.assign_to(dst, rhs);
                    }
                    self.expect(";")?;
                }
            }
        }
    }

    /// `cmp(a, b); dst = if (cond) { .. } else { .. };`
    fn parse_branch(&mut self, state: &mut FunctionState<'a>) -> CompileResult<()> {
        self.expect("(")?;
        let lhs = self.read_operand()?;
        let lhs = self.materialize(state, lhs)?;
        self.expect(",")?;
        let rhs = self.read_operand()?;
        let rhs = self.materialize(state, rhs)?;
        self.expect(")")?;
        self.expect(";")?;

        let dst_name = self.read_identifier()?;
        self.expect("=")?;
        if self.read_identifier()? != "if" {
            return Err(self.error("'cmp' must be followed by a conditional assignment"));
        }
        self.expect("(")?;
        let cond_name = self.read_identifier()?;
        let cond = Cond::from_mnemonic(cond_name)
            .ok_or_else(|| self.error(format!("unknown condition '{cond_name}'")))?;
        self.expect(")")?;

        let taken = self.parse_arm(state)?;
        if self.read_identifier()? != "else" {
            return Err(self.error("expected 'else'"));
        }
        let not_taken = self.parse_arm(state)?;
        self.expect(";")?;

        let dst = state
            .define(dst_name)
            .ok_or_else(|| self.error(format!("value '{dst_name}' redefined")))?;
        state
            .builder
            .ternary_to(dst, lhs, rhs, cond, taken, not_taken);
        Ok(())
    }

    fn parse_arm(&mut self, state: &mut FunctionState<'a>) -> CompileResult<Scope> {
        self.expect("{")?;
        state.builder.begin_scope();
        state.scopes.push(HashMap::new());
        let ret = self.parse_statements(state);
        state.scopes.pop();
        let ret = ret?;
        Ok(state.builder.end_scope(ret))
    }

    fn parse_rhs(&mut self, state: &mut FunctionState<'a>) -> CompileResult<Rhs> {
        self.skip_whitespace();
        if self.peek_number() {
            return Ok(Rhs::Constant(self.read_number()?));
        }
        if self.try_read("@") {
            return Ok(Rhs::Global(self.read_identifier()?.to_string()));
        }

        let ident = self.read_identifier()?;
        match ident {
            "alloc" => {
                let words = self.read_offset()?;
                Ok(Rhs::Alloc { words })
            }
            "apply" => {
                let (func, arg) = self.parse_pair(state)?;
                Ok(Rhs::Apply { func, arg })
            }
            "neg" | "not" => {
                let op = if ident == "neg" { UnaryOp::Neg } else { UnaryOp::Not };
                let operand = self.read_operand()?;
                let operand = self.materialize(state, operand)?;
                Ok(Rhs::Unary { op, operand })
            }
            name => {
                if let Some(op) = BinaryOp::from_name(name) {
                    let saved = self.pos;
                    if self.try_read("(") {
                        self.pos = saved;
                        let (lhs, rhs) = self.parse_pair(state)?;
                        return Ok(Rhs::Binary { op, lhs, rhs });
                    }
                }
                let var = self.resolve(state, name)?;
                if self.try_read("[") {
                    let offset = self.read_offset()?;
                    self.expect("]")?;
                    Ok(Rhs::Load { base: var, offset })
                } else {
                    Ok(Rhs::Copy(var))
                }
            }
        }
    }

    fn parse_pair(&mut self, state: &mut FunctionState<'a>) -> CompileResult<(Var, Var)> {
        self.expect("(")?;
        let a = self.read_operand()?;
        let a = self.materialize(state, a)?;
        self.expect(",")?;
        let b = self.read_operand()?;
        let b = self.materialize(state, b)?;
        self.expect(")")?;
        Ok((a, b))
    }

    fn read_operand(&mut self) -> CompileResult<Operand<'a>> {
        if self.peek_number() {
            Ok(Operand::Int(self.read_number()?))
        } else {
            Ok(Operand::Name(self.read_identifier()?))
        }
    }

    fn materialize(&mut self, state: &mut FunctionState<'a>, operand: Operand<'a>) -> CompileResult<Var> {
        match operand {
            Operand::Name(name) => self.resolve(state, name),
            Operand::Int(value) => Ok(state.builder.constant(value)),
        }
    }

    fn resolve(&self, state: &FunctionState<'a>, name: &str) -> CompileResult<Var> {
        state
            .lookup(name)
            .ok_or_else(|| self.error(format!("unknown value '{name}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Instruction;

    #[test]
    fn test_parse_straight_line() {
        let module = parse_module(
            "fn f(x, y) {\n  z = add(x, y);\n  w = z[2];\n  return w;\n}\n",
        )
        .unwrap();
        let func = &module.functions[0];
        assert_eq!(func.name, "f");
        assert_eq!(func.params, vec![Var(0), Var(1)]);
        assert_eq!(func.body.len(), 2);
        assert_eq!(
            func.body.instructions[1],
            Instruction::Assign {
                dst: Var(3),
                rhs: Rhs::Load {
                    base: Var(2),
                    offset: 2
                }
            }
        );
        assert_eq!(func.body.ret, Var(3));
    }

    #[test]
    fn test_parse_branch_with_literal_returns() {
        let module = parse_module(
            "fn g(a, b) {\n  cmp(a, b);\n  r = if (jz) { return 1; } else { return 2; };\n  return r;\n}",
        )
        .unwrap();
        let body = &module.functions[0].body;
        assert!(matches!(
            body.instructions[0],
            Instruction::Compare { cond: Cond::Jz, .. }
        ));
        match &body.instructions[1] {
            Instruction::Assign {
                rhs: Rhs::Ternary { taken, not_taken },
                ..
            } => {
                assert_eq!(taken.instructions, vec![Instruction::Assign {
                    dst: taken.ret,
                    rhs: Rhs::Constant(1)
                }]);
                assert_eq!(not_taken.len(), 1);
            }
            other => panic!("expected ternary, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_static_and_global() {
        let module = parse_module(
            "static nil : 51 { };\nstatic pair : tuple { 3, @nil };\nfn h() { g = @pair; return g; }",
        )
        .unwrap();
        assert_eq!(module.statics.len(), 2);
        assert_eq!(module.statics[1].fields[1], StaticWord::Symbol("nil".into()));
        assert_eq!(
            module.functions[0].body.instructions[0],
            Instruction::Assign {
                dst: Var(0),
                rhs: Rhs::Global("pair".into())
            }
        );
    }

    #[test]
    fn test_parse_errors() {
        let err = parse_module("fn f(x) {\n  y = z;\n  return y;\n}").unwrap_err();
        assert!(matches!(err, CompileError::Parse { line: 2, .. }), "{err}");

        let err = parse_module("fn f(x) { y = x; y = x; return y; }").unwrap_err();
        assert!(err.to_string().contains("redefined"));

        let err = parse_module("fn f(x) { r = if (jz) { return x; } else { return x; }; return r; }")
            .unwrap_err();
        assert!(err.to_string().contains("cmp"));
    }
}
