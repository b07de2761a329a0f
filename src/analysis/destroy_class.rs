// This module implements the destroy-class fixpoint. Every value starts out as VALUE (any
// category) and is only ever intersected with narrower sets: constants and arithmetic
// results become TRIVIAL, global references GLOBAL, fresh allocations NON_TRIVIAL, copies
// inherit from their source and a ternary's destination is bounded by the union of its two
// arms' returned classes. Arithmetic operands are narrowed to TRIVIAL as well since well
// typed code only does arithmetic on scalars, which lets the emitter reuse their registers
// without a release call. Loads and applications tell nothing about their result. The pass
// is repeated over the whole function until a round changes nothing; an intersection that
// becomes empty means the value was produced in two incompatible ways and is reported as a
// DestroyClassConflict.

//! Destroy-class narrowing.

use crate::core::{CompileError, CompileResult};
use crate::ir::{DestroyClass, Function, Instruction, Rhs, Scope, Var};

/// Narrows every value's class until nothing changes and returns the
/// number of rounds it took.
pub fn infer_destroy_classes(func: &mut Function) -> CompileResult<usize> {
    let needed = max_var(&func.body)
        .into_iter()
        .chain(func.params.iter().copied())
        .map(|v| v.index() + 1)
        .max()
        .unwrap_or(0);
    if func.classes.len() < needed {
        func.classes.resize(needed, DestroyClass::VALUE);
    }

    let mut rounds = 0;
    loop {
        rounds += 1;
        let changed = narrow_scope(&func.body, &mut func.classes)?;
        if !changed {
            break;
        }
    }

    log::debug!("destroy classes of {} stable after {rounds} rounds", func.name);
    Ok(rounds)
}

fn narrow(classes: &mut [DestroyClass], var: Var, allowed: DestroyClass) -> CompileResult<bool> {
    let current = classes[var.index()];
    let next = current & allowed;
    if next.is_empty() {
        return Err(CompileError::DestroyClassConflict {
            var,
            current,
            allowed,
        });
    }
    classes[var.index()] = next;
    Ok(next != current)
}

fn narrow_scope(scope: &Scope, classes: &mut [DestroyClass]) -> CompileResult<bool> {
    let mut changed = false;
    for inst in &scope.instructions {
        let Instruction::Assign { dst, rhs } = inst else {
            continue;
        };
        let dst = *dst;
        match rhs {
            Rhs::Constant(_) => changed |= narrow(classes, dst, DestroyClass::TRIVIAL)?,
            Rhs::Global(_) => changed |= narrow(classes, dst, DestroyClass::GLOBAL)?,
            Rhs::Alloc { .. } => changed |= narrow(classes, dst, DestroyClass::NON_TRIVIAL)?,
            Rhs::Copy(src) => {
                let source = classes[src.index()];
                changed |= narrow(classes, dst, source)?;
            }
            Rhs::Unary { operand, .. } => {
                changed |= narrow(classes, *operand, DestroyClass::TRIVIAL)?;
                changed |= narrow(classes, dst, DestroyClass::TRIVIAL)?;
            }
            Rhs::Binary { lhs, rhs, .. } => {
                changed |= narrow(classes, *lhs, DestroyClass::TRIVIAL)?;
                changed |= narrow(classes, *rhs, DestroyClass::TRIVIAL)?;
                changed |= narrow(classes, dst, DestroyClass::TRIVIAL)?;
            }
            Rhs::Ternary { taken, not_taken } => {
                changed |= narrow_scope(taken, classes)?;
                changed |= narrow_scope(not_taken, classes)?;
                let union = classes[taken.ret.index()] | classes[not_taken.ret.index()];
                changed |= narrow(classes, dst, union)?;
            }
            Rhs::Load { .. } | Rhs::Apply { .. } => {}
        }
    }
    Ok(changed)
}

fn max_var(scope: &Scope) -> Option<Var> {
    let mut max = Some(scope.ret);
    for inst in &scope.instructions {
        let nested = match inst {
            Instruction::Assign {
                rhs: Rhs::Ternary { taken, not_taken },
                ..
            } => max_var(taken).max(max_var(not_taken)),
            _ => None,
        };
        max = max
            .max(nested)
            .max(inst.dst())
            .max(inst.operands().max());
    }
    max
}
