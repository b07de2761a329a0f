// This module reconciles the machine states at the end of the two arms of a conditional.
// Both arms must leave the same occupants live; the task is to make their locations agree
// so one continuation serves both. Locations that differ in kind are fixed first: a value
// virtual on one side and concrete (or differently virtual) on the other is materialised,
// and an occupant on the stack in one arm but in a register in the other is loaded into a
// register, preferring the register the other arm uses. After compressing both stacks the
// stack layouts must match exactly; if they do not the merge gives up with
// UnsupportedMerge. Registers are then reconciled by replaying the taken arm's register
// assignment on the not-taken arm as a parallel move, after which both states (and their
// recency orders) are identical.

//! Joining the states of two branch arms.

use super::context::{Context, Location};
use super::register_file::{Occupant, Reg, RegSet};
use crate::core::{CompileError, CompileResult};

impl<'a> Context<'a> {
    /// Emits moves into `self` and `other` so both end in `self`'s state.
    /// `other` is left identical to `self`.
    pub fn merge(&mut self, other: &mut Context<'a>, function: &str) -> CompileResult<()> {
        let values = self.mapped_values();
        assert_eq!(
            values,
            other.mapped_values(),
            "arms of a conditional in {function} end with different live values"
        );

        for &var in &values {
            let (a, b) = (self.loc(var), other.loc(var));
            if a == b {
                continue;
            }
            match (a.is_virtual(), b.is_virtual()) {
                (true, true) => {
                    let reg = self.make_reg(var, RegSet::EMPTY);
                    other.occupant_to_reg(Occupant::Value(var), Some(reg), RegSet::EMPTY);
                }
                (true, false) => {
                    let preferred = other.reg_of(var);
                    self.occupant_to_reg(Occupant::Value(var), preferred, RegSet::EMPTY);
                }
                (false, true) => {
                    let preferred = self.reg_of(var);
                    other.occupant_to_reg(Occupant::Value(var), preferred, RegSet::EMPTY);
                }
                (false, false) => {}
            }
        }

        let occupants: Vec<Occupant> = values
            .iter()
            .map(|&var| Occupant::Value(var))
            .chain(
                Reg::ALL
                    .into_iter()
                    .filter(|reg| self.saved[reg.index()].is_some())
                    .map(Occupant::Saved),
            )
            .collect();
        for occ in occupants {
            match (self.home(occ), other.home(occ)) {
                (Some(Location::Stack(_)), Some(Location::Reg(reg))) => {
                    self.occupant_to_reg(occ, Some(reg), RegSet::EMPTY);
                }
                (Some(Location::Reg(reg)), Some(Location::Stack(_))) => {
                    other.occupant_to_reg(occ, Some(reg), RegSet::EMPTY);
                }
                _ => {}
            }
        }

        self.compress_stack();
        other.compress_stack();
        if self.stack != other.stack {
            return Err(CompileError::UnsupportedMerge {
                function: function.to_string(),
                reason: format!(
                    "stack layouts differ: {:?} vs {:?}",
                    self.stack, other.stack
                ),
            });
        }

        let moves: Vec<(Occupant, Reg)> = Reg::ALL
            .into_iter()
            .filter_map(|reg| self.regs[reg.index()].map(|occ| (occ, reg)))
            .collect();
        other.route_occupants(&moves, RegSet::EMPTY);
        other.recency = self.recency.clone();

        debug_assert_eq!(self.regs, other.regs);
        debug_assert_eq!(self.locations, other.locations);
        log::trace!("merged arms of {function} with {} register occupants", moves.len());
        other.check();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Var;

    fn same_state(a: &Context<'_>, b: &Context<'_>) {
        for var in a.mapped_values() {
            assert_eq!(a.location(var), b.location(var), "{var}");
        }
        for reg in Reg::ALL {
            assert_eq!(a.reg_occupant(reg), b.reg_occupant(reg), "{reg}");
            assert_eq!(a.saved_home(reg), b.saved_home(reg), "saved {reg}");
        }
        assert_eq!(a.stack_slots(), b.stack_slots());
    }

    #[test]
    fn test_merge_reconciles_registers() {
        let base = Context::new(&[Var(0), Var(1)], true);
        let mut taken = base.fork();
        let mut other = base.fork();
        other.route(&[(Var(0), Reg::Rsi), (Var(1), Reg::Rdi)]);

        taken.merge(&mut other, "f").unwrap();
        same_state(&taken, &other);
        assert!(taken.asm().is_empty());
        assert_eq!(other.asm().len(), 2);
    }

    #[test]
    fn test_merge_materialises_differing_constants() {
        let base = Context::new(&[], true);
        let mut taken = base.fork();
        let mut other = base.fork();
        taken.declare_const(Var(0), 1);
        other.declare_const(Var(0), 0);

        taken.merge(&mut other, "f").unwrap();
        same_state(&taken, &other);
        let reg = taken.reg_of(Var(0)).unwrap();
        assert_eq!(taken.asm().insts()[0].to_string(), format!("mov {reg}, 1"));
        assert_eq!(other.asm().insts()[0].to_string(), format!("mov {reg}, 0"));
    }

    #[test]
    fn test_merge_loads_stack_side_into_register() {
        let base = Context::new(&[Var(0)], true);
        let mut taken = base.fork();
        let mut other = base.fork();
        other.move_to_stack(Reg::Rdi);

        taken.merge(&mut other, "f").unwrap();
        same_state(&taken, &other);
        assert_eq!(other.reg_of(Var(0)), Some(Reg::Rdi));
    }

    #[test]
    fn test_merge_rejects_diverging_stacks() {
        let base = Context::new(&[Var(0), Var(1)], true);
        let mut taken = base.fork();
        let mut other = base.fork();
        taken.move_to_stack(Reg::Rdi);
        taken.move_to_stack(Reg::Rsi);
        other.move_to_stack(Reg::Rsi);
        other.move_to_stack(Reg::Rdi);
        // Both arms keep both values on the stack, in opposite slots.
        let err = taken.merge(&mut other, "f").unwrap_err();
        assert!(matches!(err, CompileError::UnsupportedMerge { .. }));
    }
}
