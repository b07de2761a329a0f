// This module lowers the scopes of one function into x86-64 instructions against a Context.
// Lowering walks the scope tree recursively and threads one context through the sibling
// instructions of a scope. Before each instruction the values whose release point it is
// (and that it does not consume as an operand) are released: a decrement_value call for
// classes that may be refcounted, plain forgetting otherwise. The instruction is lowered,
// operands whose last use it was are released if the lowering did not already consume them,
// and trailing free stack slots are popped. Constants and globals only get virtual
// locations. Arithmetic folds constant operands and otherwise reuses a dying operand's
// register as the destination. A compare is remembered and emitted by the ternary that
// follows it, unless both operands are constants, in which case the outcome is memoised and
// the ternary compiles only the winning arm. Otherwise each arm is compiled against its own
// fork of the context, the two resulting states are merged, and the buffers are spliced
// with labels. In return position an apply becomes a tail jump to apply_fn and a ternary
// compiles each arm as a returning scope, which needs no merge.

//! Per-instruction lowering of a function body.

use super::asm::{AluOp, Label, Operand};
use super::calling_convention::{ALLOCATABLE, ARG_REGS, RESULT_REG};
use super::calls::CallArg;
use super::context::{Context, Location};
use super::register_file::{Reg, RegSet};
use crate::abi::{APPLY_FN, DECREMENT_VALUE, INCREMENT_VALUE, MALLOC, WORD_SIZE};
use crate::core::{CompilationSession, CompileError, CompileResult};
use crate::ir::{BinaryOp, Cond, Function, Instruction, Rhs, Scope, UnaryOp, Var};

/// What happens to a scope's returned value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScopeExit {
    /// The function returns it.
    Return,
    /// It becomes the given value of the enclosing scope.
    Bind(Var),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    /// The instruction emitted the function's return sequence.
    Returned,
}

pub(crate) struct FunctionLowering<'s, 'a> {
    session: &'s CompilationSession<'a>,
    func: &'s Function,
    next_label: u32,
    next_temp: u32,
    /// Compare waiting for its ternary.
    pending_cmp: Option<(Var, Var, Cond)>,
    /// Outcome of the pending compare when it was decided at compile time.
    last_cmp: Option<bool>,
}

fn imm32(loc: Location<'_>) -> Option<i32> {
    match loc {
        Location::Const(value) => i32::try_from(value).ok(),
        _ => None,
    }
}

fn excluding(reg: Option<Reg>) -> RegSet {
    reg.map(RegSet::single).unwrap_or(RegSet::EMPTY)
}

fn alu_op(op: BinaryOp) -> AluOp {
    match op {
        BinaryOp::Add => AluOp::Add,
        BinaryOp::Sub => AluOp::Sub,
        BinaryOp::And => AluOp::And,
        BinaryOp::Or => AluOp::Or,
        BinaryOp::Xor => AluOp::Xor,
        BinaryOp::Mul => unreachable!("mul is lowered with imul"),
    }
}

impl<'s, 'a> FunctionLowering<'s, 'a> {
    pub(crate) fn new(session: &'s CompilationSession<'a>, func: &'s Function) -> Self {
        Self {
            session,
            func,
            next_label: 0,
            next_temp: func.var_count() as u32,
            pending_cmp: None,
            last_cmp: None,
        }
    }

    /// Lowers the whole body, ending with the return sequence.
    pub(crate) fn lower_body(&mut self, ctx: &mut Context<'a>) -> CompileResult<()> {
        let func = self.func;
        self.compile_scope(ctx, &func.body, ScopeExit::Return)
    }

    fn new_label(&mut self) -> Label {
        let label = Label(self.next_label);
        self.next_label += 1;
        label
    }

    fn new_temp(&mut self) -> Var {
        let var = Var(self.next_temp);
        self.next_temp += 1;
        var
    }

    fn malformed(&self, reason: String) -> CompileError {
        CompileError::malformed(&self.func.name, reason)
    }

    fn compile_scope(
        &mut self,
        ctx: &mut Context<'a>,
        scope: &'s Scope,
        exit: ScopeExit,
    ) -> CompileResult<()> {
        let last = scope.instructions.len().checked_sub(1);

        for (i, inst) in scope.instructions.iter().enumerate() {
            let dying = &scope.destroys[i];
            let operands: Vec<Var> = inst.operands().collect();

            for &var in dying.iter().filter(|v| !operands.contains(v)) {
                self.release(ctx, var);
            }
            if let Some(var) = operands.iter().find(|v| !ctx.is_mapped(**v)) {
                return Err(self.malformed(format!("{var} is used at {i} without a location")));
            }

            let kind = match inst {
                Instruction::Assign { rhs, .. } => rhs.kind(),
                Instruction::WriteUninitializedMemory { .. } => "write",
                Instruction::Compare { .. } => "compare",
            };
            log::trace!("{}: lowering {kind} at {i}", self.func.name);
            self.session.record_instruction_lowered(kind);

            match inst {
                Instruction::Assign { dst, rhs } => {
                    let returns = exit == ScopeExit::Return
                        && Some(i) == last
                        && *dst == scope.ret
                        && scope.moves_ret;
                    if self.lower_assign(ctx, scope, dying, *dst, rhs, returns)? == Flow::Returned {
                        return Ok(());
                    }
                }
                Instruction::WriteUninitializedMemory { base, offset, src } => {
                    self.lower_write(ctx, dying, *base, *offset, *src);
                }
                Instruction::Compare { lhs, rhs, cond } => self.lower_compare(ctx, *lhs, *rhs, *cond),
            }

            for &var in dying.iter().filter(|v| operands.contains(v)) {
                self.release(ctx, var);
            }
            ctx.compress_stack();
        }

        for &var in &scope.destroys[scope.len()] {
            self.release(ctx, var);
        }
        if !ctx.is_mapped(scope.ret) {
            return Err(self.malformed(format!("returned value {} has no location", scope.ret)));
        }

        match exit {
            ScopeExit::Return => {
                ctx.return_clean(&[(scope.ret, RESULT_REG)]);
                ctx.asm.ret();
            }
            ScopeExit::Bind(dst) if scope.moves_ret => ctx.rename(scope.ret, dst),
            ScopeExit::Bind(dst) => self.copy_value(ctx, scope.ret, dst),
        }
        Ok(())
    }

    /// Ends the caller's ownership of `var`.
    fn release(&self, ctx: &mut Context<'a>, var: Var) {
        if !ctx.is_mapped(var) {
            return;
        }
        if self.func.class(var).may_need_release() {
            ctx.call_clean(DECREMENT_VALUE, &[CallArg::Owned(var)], None);
            self.session.record_runtime_call(DECREMENT_VALUE);
        } else {
            ctx.unmap(var);
        }
    }

    fn lower_assign(
        &mut self,
        ctx: &mut Context<'a>,
        scope: &'s Scope,
        dying: &[Var],
        dst: Var,
        rhs: &'s Rhs,
        returns: bool,
    ) -> CompileResult<Flow> {
        match rhs {
            Rhs::Constant(value) => ctx.declare_const(dst, *value),
            Rhs::Global(name) => {
                let symbol = self.session.intern_str(name);
                self.session.reference_symbol(name);
                ctx.declare_global(dst, symbol);
            }
            Rhs::Copy(src) => {
                if dying.contains(src) {
                    ctx.rename(*src, dst);
                } else {
                    self.copy_value(ctx, *src, dst);
                }
            }
            Rhs::Load { base, offset } => self.lower_load(ctx, dying, dst, *base, *offset),
            Rhs::Alloc { words } => {
                let bytes = i64::from(*words) * i64::from(WORD_SIZE);
                ctx.call_clean(MALLOC, &[CallArg::Imm(bytes)], Some(dst));
                self.session.record_runtime_call(MALLOC);
            }
            Rhs::Apply { func, arg } => {
                let tail = returns && self.session.options().tail_calls;
                return Ok(self.lower_apply(ctx, scope, dying, dst, *func, *arg, tail));
            }
            Rhs::Ternary { taken, not_taken } => {
                return self.lower_ternary(ctx, scope, dst, taken, not_taken, returns);
            }
            Rhs::Unary { op, operand } => self.lower_unary(ctx, dying, dst, *op, *operand),
            Rhs::Binary { op, lhs, rhs } => self.lower_binary(ctx, dying, dst, *op, *lhs, *rhs),
        }
        Ok(Flow::Continue)
    }

    /// Binds `dst` to a second reference to the live value `src`.
    fn copy_value(&self, ctx: &mut Context<'a>, src: Var, dst: Var) {
        if self.func.class(src).may_need_release() {
            ctx.call_copy(src, dst);
            self.session.record_runtime_call(INCREMENT_VALUE);
        } else if ctx.loc(src).is_virtual() {
            ctx.alias_virtual(dst, src);
        } else {
            let reg = ctx.free_reg(ALLOCATABLE, excluding(ctx.reg_of(src)));
            let loc = ctx.loc(src);
            ctx.emit_load(reg, loc);
            ctx.bind_reg(dst, reg);
        }
    }

    fn copy_to_temp(&mut self, ctx: &mut Context<'a>, src: Var) -> Var {
        let tmp = self.new_temp();
        self.copy_value(ctx, src, tmp);
        tmp
    }

    fn lower_load(&self, ctx: &mut Context<'a>, dying: &[Var], dst: Var, base: Var, offset: u32) {
        let rb = ctx.make_reg(base, RegSet::EMPTY);
        let src = Operand::Mem {
            base: rb,
            disp: (offset * WORD_SIZE) as i32,
        };
        if dying.contains(&base) && !self.func.class(base).may_need_release() {
            ctx.asm.mov(Operand::Reg(rb), src);
            ctx.unmap(base);
            ctx.bind_reg(dst, rb);
        } else {
            let rd = ctx.free_reg(ALLOCATABLE, RegSet::single(rb));
            ctx.asm.mov(Operand::Reg(rd), src);
            ctx.bind_reg(dst, rd);
        }

        if self.func.class(dst).may_need_release() {
            ctx.call_clean(INCREMENT_VALUE, &[CallArg::Owned(dst)], Some(dst));
            self.session.record_runtime_call(INCREMENT_VALUE);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn lower_apply(
        &mut self,
        ctx: &mut Context<'a>,
        scope: &'s Scope,
        dying: &[Var],
        dst: Var,
        func: Var,
        arg: Var,
        tail: bool,
    ) -> Flow {
        let callee = if dying.contains(&func) {
            func
        } else {
            self.copy_to_temp(ctx, func)
        };
        let argument = if dying.contains(&arg) && arg != func {
            arg
        } else {
            self.copy_to_temp(ctx, arg)
        };

        self.session.record_runtime_call(APPLY_FN);
        if tail {
            for &var in &scope.destroys[scope.len()] {
                self.release(ctx, var);
            }
            ctx.return_clean(&[(callee, ARG_REGS[0]), (argument, ARG_REGS[1])]);
            ctx.asm.jmp_symbol(APPLY_FN);
            self.session.record_tail_call();
            log::debug!("{}: tail call through {APPLY_FN}", self.func.name);
            return Flow::Returned;
        }

        ctx.call_clean(
            APPLY_FN,
            &[CallArg::Owned(callee), CallArg::Owned(argument)],
            Some(dst),
        );
        Flow::Continue
    }

    fn lower_write(&mut self, ctx: &mut Context<'a>, dying: &[Var], base: Var, offset: u32, src: Var) {
        let dst = |rb: Reg| Operand::Mem {
            base: rb,
            disp: (offset * WORD_SIZE) as i32,
        };
        let consumed = dying.contains(&src);

        if let Some(imm) = imm32(ctx.loc(src)) {
            let rb = ctx.make_reg(base, RegSet::EMPTY);
            ctx.asm.mov(dst(rb), Operand::Imm(i64::from(imm)));
            if consumed {
                ctx.unmap(src);
            }
            return;
        }

        // The block takes over a reference; a source that stays live needs
        // one of its own.
        let value = if !consumed && self.func.class(src).may_need_release() {
            let tmp = self.new_temp();
            ctx.call_copy(src, tmp);
            self.session.record_runtime_call(INCREMENT_VALUE);
            tmp
        } else {
            src
        };

        let rb = ctx.make_reg(base, excluding(ctx.reg_of(value)));
        let rs = ctx.make_reg(value, RegSet::single(rb));
        ctx.asm.mov(dst(rb), Operand::Reg(rs));
        if consumed || value != src {
            ctx.unmap(value);
        }
    }

    fn lower_compare(&mut self, ctx: &Context<'a>, lhs: Var, rhs: Var, cond: Cond) {
        self.pending_cmp = Some((lhs, rhs, cond));
        self.last_cmp = None;
        if !self.session.options().fold_constants {
            return;
        }
        if let (Location::Const(a), Location::Const(b)) = (ctx.loc(lhs), ctx.loc(rhs)) {
            self.last_cmp = Some(cond.evaluate(a, b));
            self.session.record_constant_folded();
        }
    }

    /// Emits `cmp` for the pending compare and returns the condition under
    /// which the taken arm runs.
    fn emit_compare(&self, ctx: &mut Context<'a>, lhs: Var, rhs: Var, cond: Cond) -> Cond {
        let (mut a, mut b, mut cond) = (lhs, rhs, cond);
        let is_const = |ctx: &Context<'a>, var| matches!(ctx.loc(var), Location::Const(_));
        if is_const(ctx, a) && !is_const(ctx, b) {
            std::mem::swap(&mut a, &mut b);
            cond = cond.swapped();
        }

        if a == b {
            ctx.make_reg(a, RegSet::EMPTY);
        } else {
            ctx.make_both_non_mem(a, b);
        }
        ctx.devirtualize(a, excluding(ctx.reg_of(b)));
        if ctx.loc(b).is_virtual() && imm32(ctx.loc(b)).is_none() {
            let exclude = excluding(ctx.reg_of(a));
            ctx.make_reg(b, exclude);
        }

        let lhs_op = ctx.operand(ctx.loc(a));
        let rhs_op = ctx.operand(ctx.loc(b));
        ctx.asm.cmp(lhs_op, rhs_op);
        cond
    }

    fn lower_ternary(
        &mut self,
        ctx: &mut Context<'a>,
        scope: &'s Scope,
        dst: Var,
        taken: &'s Scope,
        not_taken: &'s Scope,
        returns: bool,
    ) -> CompileResult<Flow> {
        let Some((lhs, rhs, cond)) = self.pending_cmp.take() else {
            return Err(self.malformed(format!("ternary defining {dst} has no compare")));
        };
        let exit = if returns {
            for &var in &scope.destroys[scope.len()] {
                self.release(ctx, var);
            }
            ScopeExit::Return
        } else {
            ScopeExit::Bind(dst)
        };
        let flow = if returns { Flow::Returned } else { Flow::Continue };

        if let Some(outcome) = self.last_cmp.take() {
            log::debug!(
                "{}: branch for {dst} decided at compile time ({})",
                self.func.name,
                if outcome { "taken" } else { "not taken" }
            );
            self.session.record_branch_eliminated();
            let arm = if outcome { taken } else { not_taken };
            self.compile_scope(ctx, arm, exit)?;
            return Ok(flow);
        }

        let jump = self.emit_compare(ctx, lhs, rhs, cond);
        let else_label = self.new_label();

        let mut taken_ctx = ctx.fork();
        let mut other_ctx = ctx.fork();
        self.compile_scope(&mut taken_ctx, taken, exit)?;
        self.compile_scope(&mut other_ctx, not_taken, exit)?;
        if !returns {
            taken_ctx.merge(&mut other_ctx, &self.func.name)?;
            self.session.record_merge();
        }

        let mut taken_asm = taken_ctx.take_asm();
        let mut other_asm = other_ctx.take_asm();
        let spills = ctx.spills + taken_ctx.spills + other_ctx.spills;

        if returns {
            ctx.asm.jcc(jump.inverse(), else_label);
            ctx.asm.append(&mut taken_asm);
            ctx.asm.label(else_label);
            ctx.asm.append(&mut other_asm);
            ctx.spills = spills;
            return Ok(flow);
        }

        if taken_asm.is_empty() {
            // The taken arm jumps straight to the join.
            ctx.asm.jcc(jump, else_label);
            ctx.asm.append(&mut other_asm);
            ctx.asm.label(else_label);
        } else {
            let end_label = self.new_label();
            ctx.asm.jcc(jump.inverse(), else_label);
            ctx.asm.append(&mut taken_asm);
            ctx.asm.jmp(end_label);
            ctx.asm.label(else_label);
            ctx.asm.append(&mut other_asm);
            ctx.asm.label(end_label);
        }

        let asm = ctx.take_asm();
        *ctx = taken_ctx;
        ctx.asm = asm;
        ctx.spills = spills;
        Ok(flow)
    }

    fn lower_unary(&self, ctx: &mut Context<'a>, dying: &[Var], dst: Var, op: UnaryOp, operand: Var) {
        if self.session.options().fold_constants {
            if let Location::Const(value) = ctx.loc(operand) {
                ctx.declare_const(dst, op.fold(value));
                self.session.record_constant_folded();
                return;
            }
        }

        if dying.contains(&operand) {
            let reg = ctx.make_reg(operand, RegSet::EMPTY);
            ctx.asm.unary(op, Operand::Reg(reg));
            ctx.rename(operand, dst);
        } else {
            let reg = ctx.free_reg(ALLOCATABLE, excluding(ctx.reg_of(operand)));
            let loc = ctx.loc(operand);
            ctx.emit_load(reg, loc);
            ctx.asm.unary(op, Operand::Reg(reg));
            ctx.bind_reg(dst, reg);
        }
    }

    fn lower_binary(
        &self,
        ctx: &mut Context<'a>,
        dying: &[Var],
        dst: Var,
        op: BinaryOp,
        lhs: Var,
        rhs: Var,
    ) {
        if self.session.options().fold_constants {
            if let (Location::Const(a), Location::Const(b)) = (ctx.loc(lhs), ctx.loc(rhs)) {
                ctx.declare_const(dst, op.fold(a, b));
                self.session.record_constant_folded();
                return;
            }
        }

        let (mut lhs, mut rhs) = (lhs, rhs);
        if op.is_commutative() && lhs != rhs {
            let lhs_const = matches!(ctx.loc(lhs), Location::Const(_));
            let rhs_const = matches!(ctx.loc(rhs), Location::Const(_));
            let reuse_rhs =
                dying.contains(&rhs) && !dying.contains(&lhs) && !ctx.loc(rhs).is_virtual();
            let swap = if lhs_const != rhs_const { lhs_const } else { reuse_rhs };
            if swap {
                std::mem::swap(&mut lhs, &mut rhs);
            }
        }

        let reuse = dying.contains(&lhs);
        let rd = if reuse {
            ctx.make_reg(lhs, excluding(ctx.reg_of(rhs)))
        } else {
            let exclude = excluding(ctx.reg_of(lhs)).union(excluding(ctx.reg_of(rhs)));
            let rd = ctx.free_reg(ALLOCATABLE, exclude);
            let loc = ctx.loc(lhs);
            ctx.emit_load(rd, loc);
            rd
        };

        let imm = imm32(ctx.loc(rhs));
        let src = match (imm, ctx.loc(rhs)) {
            (Some(imm), _) => Operand::Imm(i64::from(imm)),
            (None, loc) if loc.is_virtual() => Operand::Reg(ctx.make_reg(rhs, RegSet::single(rd))),
            (None, loc) => ctx.operand(loc),
        };

        match (op, imm) {
            (BinaryOp::Mul, Some(imm)) => ctx.asm.imul(rd, Operand::Reg(rd), Some(imm)),
            (BinaryOp::Mul, None) => ctx.asm.imul(rd, src, None),
            _ => ctx.asm.alu(alu_op(op), Operand::Reg(rd), src),
        }

        if reuse {
            ctx.rename(lhs, dst);
        } else {
            ctx.bind_reg(dst, rd);
        }
    }
}
