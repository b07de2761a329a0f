// This module implements destroy scheduling: it decides, for every value of a function,
// the single point on each control path at which its reference stops being owned. The pass
// never builds live ranges. A forward sweep collects the scope's candidates (values live on
// entry plus every destination assigned in the scope, minus the returned value whose
// ownership moves out), then a backward sweep records each candidate at its last use, or
// right after its definition when it is never used. Compare operands are released at the
// start of both ternary arms because the comparison is emitted together with the branch.
// Ternary arms are scheduled recursively against a snapshot of the candidates; whatever one
// arm consumes and the other does not is pushed onto the other arm's first slot, so both
// arms leave the enclosing scope with the same residual set. A scope whose returned value
// is still needed by its enclosing scope is marked copy-out.

//! Release-point scheduling for IR values.

use hashbrown::HashSet;

use crate::core::{CompileError, CompileResult};
use crate::ir::{Function, Instruction, Rhs, Scope, Var};

/// Populates the `destroys` tables of every scope in `func`.
///
/// Parameters the body never consumes are released before its first
/// instruction.
pub fn schedule_destroys(func: &mut Function) -> CompileResult<()> {
    let entry: HashSet<Var> = func.params.iter().copied().collect();
    let residual = schedule_scope(&func.name, &mut func.body, entry)?;

    let first = &mut func.body.destroys[0];
    first.extend(residual);
    first.sort_unstable();
    first.dedup();

    log::debug!(
        "scheduled destroys for {}: {} release points",
        func.name,
        count_release_points(&func.body)
    );
    Ok(())
}

/// Schedules `scope` given the values it may consume and returns those it
/// leaves alive.
pub(crate) fn schedule_scope(
    function: &str,
    scope: &mut Scope,
    entry: HashSet<Var>,
) -> CompileResult<HashSet<Var>> {
    scope.reset_destroys();

    let mut to_destroy = entry;
    to_destroy.extend(scope.instructions.iter().filter_map(Instruction::dst));
    scope.moves_ret = to_destroy.remove(&scope.ret);

    let Scope {
        instructions,
        destroys,
        ..
    } = scope;

    for i in (0..instructions.len()).rev() {
        let preceded_by_compare =
            i > 0 && matches!(instructions[i - 1], Instruction::Compare { .. });
        let (head, tail) = instructions.split_at_mut(i + 1);
        let inst = &mut head[i];

        if let Instruction::Compare { lhs, rhs, .. } = inst {
            let Some(Instruction::Assign {
                rhs: Rhs::Ternary { taken, not_taken },
                ..
            }) = tail.first_mut()
            else {
                return Err(CompileError::malformed(
                    function,
                    format!("compare at {i} is not followed by a ternary"),
                ));
            };
            for var in [*lhs, *rhs] {
                if to_destroy.remove(&var) {
                    push_sorted(&mut taken.destroys[0], var);
                    push_sorted(&mut not_taken.destroys[0], var);
                }
            }
            continue;
        }

        if let Some(dst) = inst.dst() {
            if to_destroy.remove(&dst) {
                log::trace!("{function}: {dst} is dead on definition");
                destroys[i + 1].push(dst);
            }
        }

        if let Instruction::Assign {
            rhs: Rhs::Ternary { taken, not_taken },
            ..
        } = inst
        {
            if !preceded_by_compare {
                return Err(CompileError::malformed(
                    function,
                    format!("ternary at {i} has no compare"),
                ));
            }
            schedule_branches(function, taken, not_taken, &mut to_destroy)?;
            continue;
        }

        for var in inst.operands() {
            if to_destroy.remove(&var) {
                destroys[i].push(var);
            }
        }
    }

    for slot in destroys.iter_mut() {
        slot.sort_unstable();
    }
    Ok(to_destroy)
}

/// Schedules both arms of a ternary and equalises what they consume.
fn schedule_branches(
    function: &str,
    taken: &mut Scope,
    not_taken: &mut Scope,
    to_destroy: &mut HashSet<Var>,
) -> CompileResult<()> {
    let taken_left = schedule_scope(function, taken, to_destroy.clone())?;
    let not_taken_left = schedule_scope(function, not_taken, to_destroy.clone())?;

    let taken_consumed: HashSet<Var> = to_destroy.difference(&taken_left).copied().collect();
    let not_taken_consumed: HashSet<Var> =
        to_destroy.difference(&not_taken_left).copied().collect();

    for &var in taken_consumed.difference(&not_taken_consumed) {
        push_sorted(&mut not_taken.destroys[0], var);
    }
    for &var in not_taken_consumed.difference(&taken_consumed) {
        push_sorted(&mut taken.destroys[0], var);
    }

    to_destroy.retain(|v| !taken_consumed.contains(v) && !not_taken_consumed.contains(v));
    Ok(())
}

fn push_sorted(slot: &mut Vec<Var>, var: Var) {
    if let Err(pos) = slot.binary_search(&var) {
        slot.insert(pos, var);
    }
}

fn count_release_points(scope: &Scope) -> usize {
    let nested: usize = scope
        .instructions
        .iter()
        .map(|inst| match inst {
            Instruction::Assign {
                rhs: Rhs::Ternary { taken, not_taken },
                ..
            } => count_release_points(taken) + count_release_points(not_taken),
            _ => 0,
        })
        .sum();
    scope.destroys.iter().map(Vec::len).sum::<usize>() + nested
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Module;

    fn scheduled(text: &str) -> Function {
        let mut module = Module::parse(text).unwrap();
        let mut func = module.functions.remove(0);
        schedule_destroys(&mut func).unwrap();
        func
    }

    fn arms(scope: &Scope, index: usize) -> (&Scope, &Scope) {
        match &scope.instructions[index] {
            Instruction::Assign {
                rhs: Rhs::Ternary { taken, not_taken },
                ..
            } => (taken, not_taken),
            other => panic!("expected ternary, got {other:?}"),
        }
    }

    #[test]
    fn test_last_use_is_recorded() {
        let func = scheduled("fn f(x, y) { z = add(x, y); w = add(z, x); return w; }");
        let (x, y, z) = (Var(0), Var(1), Var(2));
        assert_eq!(func.body.destroys[0], vec![y]);
        assert_eq!(func.body.destroys[1], vec![x, z]);
        assert!(func.body.destroys[2].is_empty());
        assert!(func.body.moves_ret);
    }

    #[test]
    fn test_dead_definition_released_after() {
        let func = scheduled("fn f(x) { p = alloc 2; return x; }");
        assert_eq!(func.body.destroys[1], vec![Var(1)]);
        assert!(func.body.destroys[0].is_empty());
    }

    #[test]
    fn test_unused_param_released_on_entry() {
        let func = scheduled("fn f(x, y) { return x; }");
        assert_eq!(func.body.destroys[0], vec![Var(1)]);
    }

    #[test]
    fn test_compare_operands_move_into_arms() {
        let func = scheduled(
            "fn f(a, b) { cmp(a, b); r = if (jz) { return 1; } else { return 2; }; return r; }",
        );
        assert!(func.body.destroys[0].is_empty());
        assert!(func.body.destroys[1].is_empty());
        let (taken, not_taken) = arms(&func.body, 1);
        assert_eq!(taken.destroys[0], vec![Var(0), Var(1)]);
        assert_eq!(not_taken.destroys[0], vec![Var(0), Var(1)]);
    }

    #[test]
    fn test_value_used_in_one_arm_released_in_other() {
        let func = scheduled(
            "fn f(c, n) {
                cmp(n, 0);
                r = if (jz) { x = add(c, 1); return x; } else { return n; };
                return r;
            }",
        );
        // The literal operands become v2 (compare) and v3 (taken arm).
        let (c, n, zero, one) = (Var(0), Var(1), Var(2), Var(3));
        let (taken, not_taken) = arms(&func.body, 2);
        assert_eq!(not_taken.destroys[0], vec![c, zero]);
        assert!(not_taken.moves_ret);
        assert_eq!(taken.destroys[0], vec![n, zero]);
        assert_eq!(taken.destroys[1], vec![c, one]);
    }

    #[test]
    fn test_arm_returning_live_value_copies_out() {
        let func = scheduled(
            "fn f(a, b) { cmp(b, 0); r = if (jz) { return a; } else { return b; }; s = add(r, a); return s; }",
        );
        let (taken, not_taken) = arms(&func.body, 2);
        assert!(!taken.moves_ret);
        assert!(not_taken.moves_ret);
        assert_eq!(taken.destroys[0], vec![Var(1), Var(2)]);
        assert_eq!(func.body.destroys[3], vec![Var(0), Var(3)]);
    }

    #[test]
    fn test_compare_without_ternary_is_malformed() {
        let mut func = scheduled("fn f(a) { return a; }");
        func.body = Scope::new(
            vec![Instruction::Compare {
                lhs: Var(0),
                rhs: Var(0),
                cond: crate::ir::Cond::Jz,
            }],
            Var(0),
        );
        let err = schedule_destroys(&mut func).unwrap_err();
        assert!(matches!(err, CompileError::MalformedIr { .. }));
    }
}
