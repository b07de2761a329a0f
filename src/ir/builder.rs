//! Incremental construction of IR functions.
//!
//! The AST lowering and the text parser both go through [`FunctionBuilder`],
//! which hands out fresh [`Var`]s and keeps a stack of open scopes so that
//! ternary arms can be built in place.

use super::{BinaryOp, Cond, DestroyClass, Function, Instruction, Rhs, Scope, UnaryOp, Var};
use crate::abi::{self, BlockTag};

pub struct FunctionBuilder {
    name: String,
    params: Vec<Var>,
    names: Vec<Option<String>>,
    open: Vec<Vec<Instruction>>,
}

impl FunctionBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            names: Vec::new(),
            open: vec![Vec::new()],
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fresh value with an optional source name.
    pub fn new_var(&mut self, name: Option<&str>) -> Var {
        let var = Var(self.names.len() as u32);
        self.names.push(name.map(str::to_string));
        var
    }

    pub fn param(&mut self, name: &str) -> Var {
        let var = self.new_var(Some(name));
        self.params.push(var);
        var
    }

    pub fn push(&mut self, instruction: Instruction) {
        if let Some(scope) = self.open.last_mut() {
            scope.push(instruction);
        }
    }

    /// Emits `dst = rhs` into the innermost open scope.
    pub fn assign_to(&mut self, dst: Var, rhs: Rhs) -> Var {
        self.push(Instruction::Assign { dst, rhs });
        dst
    }

    pub fn assign(&mut self, rhs: Rhs) -> Var {
        let dst = self.new_var(None);
        self.assign_to(dst, rhs)
    }

    pub fn constant(&mut self, value: i64) -> Var {
        self.assign(Rhs::Constant(value))
    }

    pub fn global(&mut self, symbol: &str) -> Var {
        self.assign(Rhs::Global(symbol.to_string()))
    }

    pub fn copy(&mut self, src: Var) -> Var {
        self.assign(Rhs::Copy(src))
    }

    pub fn load(&mut self, base: Var, offset: u32) -> Var {
        self.assign(Rhs::Load { base, offset })
    }

    pub fn alloc(&mut self, words: u32) -> Var {
        self.assign(Rhs::Alloc { words })
    }

    pub fn write(&mut self, base: Var, offset: u32, src: Var) {
        self.push(Instruction::WriteUninitializedMemory { base, offset, src });
    }

    pub fn apply(&mut self, func: Var, arg: Var) -> Var {
        self.assign(Rhs::Apply { func, arg })
    }

    pub fn unary(&mut self, op: UnaryOp, operand: Var) -> Var {
        self.assign(Rhs::Unary { op, operand })
    }

    pub fn binary(&mut self, op: BinaryOp, lhs: Var, rhs: Var) -> Var {
        self.assign(Rhs::Binary { op, lhs, rhs })
    }

    /// Allocates a block with a full header and initialises its payload.
    ///
    /// The refcount starts at one reference; the destructor closure, when
    /// present, becomes the last word.
    pub fn alloc_object(&mut self, tag: BlockTag, fields: &[Var], destructor: Option<Var>) -> Var {
        let size = fields.len() as u32;
        let block = self.alloc(abi::block_words(size, destructor.is_some()));
        let refcount = self.constant(abi::INITIAL_REFCOUNT);
        self.write(block, abi::REFCOUNT_WORD, refcount);
        let header = self.constant(abi::tag_size_d(tag.raw(), size, destructor.is_some()));
        self.write(block, abi::TAG_SIZE_WORD, header);
        for (i, &field) in fields.iter().enumerate() {
            self.write(block, abi::PAYLOAD_WORD + i as u32, field);
        }
        if let Some(destructor) = destructor {
            self.write(block, abi::PAYLOAD_WORD + size, destructor);
        }
        block
    }

    /// Starts collecting instructions for a ternary arm.
    pub fn begin_scope(&mut self) {
        self.open.push(Vec::new());
    }

    /// Closes the innermost scope opened by [`begin_scope`](Self::begin_scope).
    pub fn end_scope(&mut self, ret: Var) -> Scope {
        let instructions = if self.open.len() > 1 {
            self.open.pop().unwrap_or_default()
        } else {
            Vec::new()
        };
        Scope::new(instructions, ret)
    }

    /// Emits the compare/ternary pair `cmp(lhs, rhs); dst = if (cond) ...`.
    pub fn ternary_to(
        &mut self,
        dst: Var,
        lhs: Var,
        rhs: Var,
        cond: Cond,
        taken: Scope,
        not_taken: Scope,
    ) -> Var {
        self.push(Instruction::Compare { lhs, rhs, cond });
        self.assign_to(
            dst,
            Rhs::Ternary {
                taken: Box::new(taken),
                not_taken: Box::new(not_taken),
            },
        )
    }

    /// Builds both arms with closures returning each arm's result.
    pub fn branch(
        &mut self,
        lhs: Var,
        rhs: Var,
        cond: Cond,
        taken: impl FnOnce(&mut Self) -> Var,
        not_taken: impl FnOnce(&mut Self) -> Var,
    ) -> Var {
        self.begin_scope();
        let taken_ret = taken(self);
        let taken = self.end_scope(taken_ret);
        self.begin_scope();
        let not_taken_ret = not_taken(self);
        let not_taken = self.end_scope(not_taken_ret);
        let dst = self.new_var(None);
        self.ternary_to(dst, lhs, rhs, cond, taken, not_taken)
    }

    pub fn finish(mut self, ret: Var) -> Function {
        self.open.truncate(1);
        let instructions = self.open.pop().unwrap_or_default();
        let count = self.names.len();
        Function {
            name: self.name,
            params: self.params,
            body: Scope::new(instructions, ret),
            classes: vec![DestroyClass::VALUE; count],
            names: self.names,
        }
    }
}
