// This module emits the three boundary crossings a function body makes: calls into the
// runtime or another function, the copying call that takes an extra reference to a boxed
// value, and the epilogue. A clean call moves every live occupant out of the caller-saved
// registers (into a free callee-saved register when there is one, the stack otherwise),
// routes owned arguments into RDI/RSI and stops tracking them (the callee consumes them),
// writes immediate arguments, pads the stack to 16 bytes around the call and binds the
// result to RAX. The epilogue first lifts outputs out of callee-saved registers and stack
// slots, then restores each callee-saved register from wherever its entry-time content
// ended up (popping it when it sits on top of the stack, moving it otherwise and breaking
// cycles through a spare caller-saved register), releases what is left of the stack and
// finally routes the outputs into their registers.

//! Calls, copies and the epilogue.

use super::calling_convention::{
    stack_aligned, ARG_REGS, CALLEE_SAVED, CALLER_SAVED, RESULT_REG,
};
use super::context::{Context, Location};
use super::register_file::{Occupant, Reg, RegSet};
use crate::abi::INCREMENT_VALUE;
use crate::ir::Var;

/// Argument of a clean call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallArg {
    /// Ownership passes to the callee; the value is no longer tracked.
    Owned(Var),
    Imm(i64),
}

impl<'a> Context<'a> {
    /// Emits `call symbol` with the stack 16-byte aligned. Caller-saved
    /// registers must already be empty apart from arguments.
    fn emit_call(&mut self, symbol: &'a str) {
        let pad = !stack_aligned(self.stack.len());
        if pad {
            self.asm.reserve_stack(1);
        }
        self.asm.call(symbol);
        if pad {
            self.asm.release_stack(1);
        }
    }

    /// Clean call: spill caller-saved registers, pass `args` and bind the
    /// result to `result`.
    pub fn call_clean(&mut self, symbol: &'a str, args: &[CallArg], result: Option<Var>) {
        assert!(args.len() <= ARG_REGS.len(), "{symbol} called with {} arguments", args.len());
        let owned: Vec<(Var, Reg)> = args
            .iter()
            .zip(ARG_REGS)
            .filter_map(|(arg, reg)| match *arg {
                CallArg::Owned(var) => Some((var, reg)),
                CallArg::Imm(_) => None,
            })
            .collect();
        let keep: RegSet = owned.iter().filter_map(|&(var, _)| self.reg_of(var)).collect();

        self.evict_caller_saved(keep);
        self.route(&owned);
        for (arg, reg) in args.iter().zip(ARG_REGS) {
            if let CallArg::Imm(value) = *arg {
                self.relocate(reg, RegSet::EMPTY);
                self.asm.mov_reg_imm(reg, value);
            }
        }
        for &(var, _) in &owned {
            self.unmap(var);
        }

        self.emit_call(symbol);
        self.call_happened(result);
    }

    /// Records the effect of a call that just returned: caller-saved
    /// registers are garbage and `result` lives in RAX.
    pub fn call_happened(&mut self, result: Option<Var>) {
        assert!(
            CALLER_SAVED.iter().all(|reg| self.regs[reg.index()].is_none()),
            "caller-saved register live across a call"
        );
        if let Some(var) = result {
            self.bind_reg(var, RESULT_REG);
        }
        self.check();
    }

    /// Binds `dst` to a new reference to `src` obtained from the runtime.
    /// `src` stays live.
    pub fn call_copy(&mut self, src: Var, dst: Var) {
        self.evict_caller_saved(RegSet::EMPTY);
        let loc = self.loc(src);
        self.emit_load(ARG_REGS[0], loc);
        self.emit_call(INCREMENT_VALUE);
        self.call_happened(Some(dst));
    }

    /// Epilogue: restores every callee-saved register, empties the stack
    /// and leaves each output in its register. Emits no `ret`.
    pub fn return_clean(&mut self, outputs: &[(Var, Reg)]) {
        let targets: RegSet = outputs.iter().map(|&(_, reg)| reg).collect();
        let output_vars: Vec<Var> = outputs.iter().map(|&(var, _)| var).collect();
        let leftovers: Vec<Var> = self
            .mapped_values()
            .into_iter()
            .filter(|var| !output_vars.contains(var) && !self.loc(*var).is_virtual())
            .collect();
        assert!(leftovers.is_empty(), "values {leftovers:?} still live at return");

        for &(var, target) in outputs {
            let loc = self.loc(var);
            let stuck = match loc {
                Location::Reg(reg) => !CALLER_SAVED.contains(reg),
                Location::Stack(_) => true,
                Location::Const(_) | Location::Global(_) => false,
            };
            if !stuck {
                continue;
            }
            let dst = if self.regs[target.index()].is_none() {
                target
            } else {
                let busy: RegSet = outputs.iter().filter_map(|&(v, _)| self.reg_of(v)).collect();
                self.free_reg(CALLER_SAVED, targets.union(busy))
            };
            let loc = self.loc(var);
            self.emit_load(dst, loc);
            self.place(Occupant::Value(var), Location::Reg(dst));
        }

        let busy: RegSet = outputs
            .iter()
            .filter_map(|&(var, _)| self.reg_of(var))
            .collect::<RegSet>()
            .union(targets);
        self.restore_callee_saved(busy);

        debug_assert!(self.stack.iter().all(Option::is_none));
        let slots = self.stack.len();
        self.stack.clear();
        self.asm.release_stack(slots);

        self.route(outputs);
        self.check();
    }

    fn restore_callee_saved(&mut self, busy: RegSet) {
        // Entry-time contents on top of the stack go back with a pop.
        loop {
            self.compress_stack();
            match self.stack.last().copied().flatten() {
                Some(Occupant::Saved(reg)) if self.regs[reg.index()].is_none() => {
                    self.asm.pop_reg(reg);
                    self.place(Occupant::Saved(reg), Location::Reg(reg));
                    self.stack.pop();
                }
                _ => break,
            }
        }

        loop {
            let misplaced: Vec<Reg> = CALLEE_SAVED
                .iter()
                .filter(|reg| self.saved[reg.index()] != Some(Location::Reg(*reg)))
                .collect();
            if misplaced.is_empty() {
                break;
            }

            let mut progressed = false;
            for &reg in &misplaced {
                if self.regs[reg.index()].is_some() {
                    continue;
                }
                let Some(home) = self.saved[reg.index()] else {
                    panic!("entry content of {reg} was lost");
                };
                self.emit_load(reg, home);
                self.place(Occupant::Saved(reg), Location::Reg(reg));
                progressed = true;
            }

            if !progressed {
                // Every misplaced register holds another register's entry
                // content: park one of them in a spare register.
                let blocked = misplaced[0];
                let spare = CALLER_SAVED
                    .difference(busy)
                    .iter()
                    .find(|r| self.regs[r.index()].is_none());
                let Some(spare) = spare else {
                    panic!("no spare register to break a restore cycle");
                };
                let Some(occ) = self.regs[blocked.index()] else {
                    unreachable!("{blocked} was checked to be occupied");
                };
                self.asm.mov_reg_reg(spare, blocked);
                self.place(occ, Location::Reg(spare));
            }
        }
        self.check();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::{DECREMENT_VALUE, MALLOC};

    fn rendered(ctx: &Context<'_>) -> Vec<String> {
        ctx.asm().insts().iter().map(ToString::to_string).collect()
    }

    fn assert_clean_exit(ctx: &Context<'_>) {
        for reg in CALLEE_SAVED.iter() {
            assert_eq!(ctx.saved_home(reg), Some(Location::Reg(reg)));
        }
        assert!(ctx.stack_slots().is_empty());
    }

    #[test]
    fn test_call_clean_passes_owned_argument() {
        let mut ctx = Context::new(&[Var(0), Var(1)], true);
        ctx.call_clean(DECREMENT_VALUE, &[CallArg::Owned(Var(1))], None);
        assert!(!ctx.is_mapped(Var(1)));
        // v0 survives the call outside caller-saved registers.
        assert!(!ctx.reg_of(Var(0)).is_some_and(|r| CALLER_SAVED.contains(r)));
        let asm = rendered(&ctx);
        assert!(asm.contains(&"call decrement_value".to_string()));
        assert!(asm.contains(&"mov rdi, rsi".to_string()));
    }

    #[test]
    fn test_call_clean_aligns_stack() {
        let mut ctx = Context::new(&[], true);
        ctx.call_clean(MALLOC, &[CallArg::Imm(24)], Some(Var(0)));
        assert_eq!(
            rendered(&ctx),
            vec!["mov rdi, 24", "sub rsp, 8", "call malloc", "add rsp, 8"]
        );
        assert_eq!(ctx.reg_of(Var(0)), Some(Reg::Rax));

        // One spilled slot already aligns the stack.
        let mut ctx = Context::new(&[Var(0)], true);
        ctx.move_to_stack(Reg::Rdi);
        ctx.call_clean(MALLOC, &[CallArg::Imm(8)], Some(Var(1)));
        assert!(!rendered(&ctx).contains(&"sub rsp, 8".to_string()));
    }

    #[test]
    fn test_call_copy_keeps_source() {
        let mut ctx = Context::new(&[Var(0)], true);
        ctx.call_copy(Var(0), Var(1));
        assert!(ctx.is_mapped(Var(0)));
        assert_eq!(ctx.reg_of(Var(1)), Some(Reg::Rax));
        assert!(rendered(&ctx).contains(&"call increment_value".to_string()));
    }

    #[test]
    fn test_return_clean_restores_spilled_callee_saved() {
        let mut ctx = Context::new(&[Var(0)], true);
        ctx.move_to_stack(Reg::Rbx);
        ctx.move_to_stack(Reg::R12);
        ctx.bind_reg(Var(1), Reg::Rbx);
        ctx.unmap(Var(0));
        ctx.return_clean(&[(Var(1), Reg::Rax)]);

        assert_clean_exit(&ctx);
        assert_eq!(ctx.reg_of(Var(1)), Some(Reg::Rax));
        let asm = rendered(&ctx);
        let tail: Vec<&str> = asm.iter().rev().take(3).rev().map(String::as_str).collect();
        assert_eq!(tail, vec!["mov rax, rbx", "pop r12", "pop rbx"]);
    }

    #[test]
    fn test_return_clean_breaks_register_cycles() {
        let mut ctx = Context::new(&[], true);
        ctx.swap_regs(Reg::Rbx, Reg::Rbp);
        ctx.declare_const(Var(0), 3);
        ctx.return_clean(&[(Var(0), Reg::Rax)]);

        assert_clean_exit(&ctx);
        assert_eq!(ctx.reg_of(Var(0)), Some(Reg::Rax));
        assert_eq!(rendered(&ctx).last().map(String::as_str), Some("mov rax, 3"));
    }

    #[test]
    #[should_panic(expected = "still live at return")]
    fn test_return_clean_rejects_leftover_values() {
        let mut ctx = Context::new(&[Var(0), Var(1)], true);
        ctx.return_clean(&[(Var(0), Reg::Rax)]);
    }
}
