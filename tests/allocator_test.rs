//! Machine-state invariants of the allocator context under pressure.

use mlc::x64::calling_convention::{ALLOCATABLE, CALLEE_SAVED, CALLER_SAVED};
use mlc::x64::{CallArg, Context, Location, Occupant, Reg, RegSet};
use mlc::{CompileError, Var};

/// Every mapped value is found where its location says, and every cell
/// holding a value points back at it.
fn assert_round_trip(ctx: &Context<'_>) {
    for var in ctx.mapped_values() {
        let occ = Some(Occupant::Value(var));
        match ctx.location(var) {
            Some(Location::Reg(reg)) => assert_eq!(ctx.reg_occupant(reg), occ, "{var}"),
            Some(Location::Stack(slot)) => assert_eq!(ctx.stack_slots()[slot], occ, "{var}"),
            Some(_) => {
                assert!(Reg::ALL.iter().all(|r| ctx.reg_occupant(*r) != occ));
                assert!(!ctx.stack_slots().contains(&occ));
            }
            None => unreachable!("{var} listed as mapped"),
        }
    }
    for reg in Reg::ALL {
        if let Some(Occupant::Value(var)) = ctx.reg_occupant(reg) {
            assert_eq!(ctx.location(var), Some(Location::Reg(reg)));
        }
    }
    for (slot, occ) in ctx.stack_slots().iter().enumerate() {
        if let Some(Occupant::Value(var)) = occ {
            assert_eq!(ctx.location(*var), Some(Location::Stack(slot)));
        }
    }
    ctx.assert_consistency();
}

/// Context with both parameters and `extra` materialised constants, more
/// than fit in registers.
fn crowded(extra: u32) -> Context<'static> {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut ctx = Context::new(&[Var(0), Var(1)], true);
    for i in 2..2 + extra {
        ctx.declare_const(Var(i), i64::from(i));
        ctx.make_reg(Var(i), RegSet::EMPTY);
        assert_round_trip(&ctx);
    }
    ctx
}

#[test]
fn test_round_trip_under_register_pressure() {
    let mut ctx = crowded(20);
    assert!(!ctx.stack_slots().is_empty());
    assert_eq!(ctx.mapped_values().len(), 22);

    for i in (2..22).step_by(3) {
        ctx.unmap(Var(i));
        assert_round_trip(&ctx);
    }
    ctx.compress_stack();
    assert_round_trip(&ctx);
    assert!(ctx.stack_slots().last().is_some_and(Option::is_some));

    ctx.route(&[(Var(3), Reg::Rdi), (Var(4), Reg::Rsi)]);
    assert_round_trip(&ctx);
    assert_eq!(ctx.location(Var(3)), Some(Location::Reg(Reg::Rdi)));
    assert_eq!(ctx.location(Var(4)), Some(Location::Reg(Reg::Rsi)));

    ctx.evict_caller_saved(RegSet::EMPTY);
    assert_round_trip(&ctx);
    for reg in CALLER_SAVED.iter() {
        assert_eq!(ctx.reg_occupant(reg), None, "{reg} still occupied");
    }
}

#[test]
fn test_spilled_callee_saved_content_is_restored_on_return() {
    let mut ctx = crowded(20);
    // Entry-time contents of some callee-saved registers are now on the stack.
    assert!(CALLEE_SAVED
        .iter()
        .any(|reg| matches!(ctx.saved_home(reg), Some(Location::Stack(_)))));

    let keep = Var(7);
    for var in ctx.mapped_values() {
        if var != keep {
            ctx.unmap(var);
        }
    }
    ctx.return_clean(&[(keep, Reg::Rax)]);
    assert_round_trip(&ctx);

    assert!(ctx.stack_slots().is_empty());
    assert_eq!(ctx.location(keep), Some(Location::Reg(Reg::Rax)));
    for reg in CALLEE_SAVED.iter() {
        assert_eq!(ctx.saved_home(reg), Some(Location::Reg(reg)));
        assert_eq!(ctx.reg_occupant(reg), Some(Occupant::Saved(reg)));
    }
    for reg in CALLER_SAVED.difference(RegSet::single(Reg::Rax)).iter() {
        assert_eq!(ctx.reg_occupant(reg), None);
    }
}

#[test]
fn test_return_leaves_virtual_output_in_place() {
    let mut ctx = Context::new(&[], true);
    ctx.declare_const(Var(0), -1);
    ctx.return_clean(&[(Var(0), Reg::Rax)]);
    let asm: Vec<String> = ctx.asm().insts().iter().map(ToString::to_string).collect();
    assert_eq!(asm, ["mov rax, -1"]);
}

#[test]
fn test_call_empties_caller_saved_registers() {
    let mut ctx = crowded(6);
    ctx.call_clean("f", &[CallArg::Owned(Var(0)), CallArg::Imm(3)], Some(Var(30)));
    assert_round_trip(&ctx);

    assert!(!ctx.is_mapped(Var(0)));
    assert_eq!(ctx.location(Var(30)), Some(Location::Reg(Reg::Rax)));
    for reg in CALLER_SAVED.difference(RegSet::single(Reg::Rax)).iter() {
        assert_eq!(ctx.reg_occupant(reg), None);
    }
    for var in 1..8 {
        assert!(ctx.is_mapped(Var(var)), "v{var} lost across the call");
    }
}

#[test]
fn test_free_reg_prefers_free_over_spill() {
    let mut ctx = Context::new(&[Var(0)], true);
    let reg = ctx.free_reg(ALLOCATABLE, RegSet::EMPTY);
    assert_eq!(ctx.reg_occupant(reg), None);
    assert!(ctx.asm().is_empty());
    assert!(ctx.stack_slots().is_empty());
}

#[test]
fn test_merged_arms_agree_everywhere() {
    let base = crowded(4);
    let mut taken = base.fork();
    let mut other = base.fork();
    other.route(&[(Var(2), Reg::Rdi), (Var(0), Reg::Rcx)]);
    taken.unmap(Var(5));
    other.unmap(Var(5));

    taken.merge(&mut other, "f").unwrap();
    assert_round_trip(&taken);
    assert_round_trip(&other);
    for var in taken.mapped_values() {
        assert_eq!(taken.location(var), other.location(var), "{var}");
    }
    for reg in Reg::ALL {
        assert_eq!(taken.reg_occupant(reg), other.reg_occupant(reg));
    }
    assert_eq!(taken.stack_slots(), other.stack_slots());
}

#[test]
fn test_merge_gives_up_on_reordered_stacks() {
    let base = Context::new(&[Var(0), Var(1)], true);
    let mut taken = base.fork();
    let mut other = base.fork();
    taken.move_to_stack(Reg::Rdi);
    taken.move_to_stack(Reg::Rsi);
    other.move_to_stack(Reg::Rsi);
    other.move_to_stack(Reg::Rdi);

    let err = taken.merge(&mut other, "g").unwrap_err();
    match err {
        CompileError::UnsupportedMerge { function, .. } => assert_eq!(function, "g"),
        other => panic!("unexpected error {other}"),
    }
}
