// This module implements the simulated machine the emitter lowers against. A Context maps
// every live value to a location: a virtual one (a constant or the address of a global,
// known without any code) or a concrete one (a register or a stack slot). The register
// table and the stack table store the occupant of each cell directly, and each callee-saved
// register's entry-time content is an occupant of its own (a saved marker) with exactly one
// home until the epilogue restores it. The value map, the marker homes and the two tables
// are kept as mutual inverses; assert_consistency checks this after every mutation when
// the session asks for it. Stack slot k lives at [rsp + 8 * (len - 1 - k)], so slot 0 is
// the deepest. Registers are handed out least recently used first: a free one when the
// requested view has one, otherwise the occupant of the oldest is spilled to the first free
// stack slot or pushed. Every emitting operation appends to the context's own Asm buffer;
// fork() gives a branch arm an identical machine with an empty buffer.

//! The register and stack allocator state.

use hashbrown::HashMap;

use super::asm::{Asm, Operand};
use super::calling_convention::{ALLOCATABLE, ARG_REGS, CALLEE_SAVED, CALLER_SAVED};
use super::register_file::{Occupant, Recency, Reg, RegSet, NUM_REGS};
use crate::ir::Var;

/// Where a value currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Location<'a> {
    Const(i64),
    /// Address of a symbol, materialised with `lea`.
    Global(&'a str),
    Stack(usize),
    Reg(Reg),
}

impl Location<'_> {
    /// Constants and global addresses occupy no cell.
    pub fn is_virtual(self) -> bool {
        matches!(self, Location::Const(_) | Location::Global(_))
    }
}

#[derive(Debug, Clone)]
pub struct Context<'a> {
    pub(super) locations: HashMap<Var, Location<'a>>,
    /// Home of each callee-saved register's entry-time content.
    pub(super) saved: [Option<Location<'a>>; NUM_REGS],
    pub(super) regs: [Option<Occupant>; NUM_REGS],
    pub(super) stack: Vec<Option<Occupant>>,
    pub(super) recency: Recency,
    pub(crate) asm: Asm<'a>,
    /// Register-to-stack moves emitted into `asm`.
    pub(crate) spills: usize,
    check_consistency: bool,
}

impl<'a> Context<'a> {
    /// Machine state on function entry with `params` in the argument
    /// registers.
    pub fn new(params: &[Var], check_consistency: bool) -> Self {
        let mut ctx = Self {
            locations: HashMap::new(),
            saved: [None; NUM_REGS],
            regs: [None; NUM_REGS],
            stack: Vec::new(),
            recency: Recency::new(ALLOCATABLE),
            asm: Asm::new(),
            spills: 0,
            check_consistency,
        };
        for reg in CALLEE_SAVED.iter() {
            ctx.place(Occupant::Saved(reg), Location::Reg(reg));
        }
        for (&param, &reg) in params.iter().zip(ARG_REGS.iter()) {
            ctx.place(Occupant::Value(param), Location::Reg(reg));
        }
        ctx.check();
        ctx
    }

    /// Copy of the machine state with an empty instruction buffer.
    pub fn fork(&self) -> Self {
        let mut ctx = self.clone();
        ctx.asm = Asm::new();
        ctx.spills = 0;
        ctx
    }

    pub fn asm(&self) -> &Asm<'a> {
        &self.asm
    }

    pub fn take_asm(&mut self) -> Asm<'a> {
        std::mem::take(&mut self.asm)
    }

    pub fn location(&self, var: Var) -> Option<Location<'a>> {
        self.locations.get(&var).copied()
    }

    pub fn is_mapped(&self, var: Var) -> bool {
        self.locations.contains_key(&var)
    }

    /// Location of a value the caller knows to be live.
    pub(crate) fn loc(&self, var: Var) -> Location<'a> {
        match self.locations.get(&var) {
            Some(&loc) => loc,
            None => panic!("{var} has no location"),
        }
    }

    pub fn reg_occupant(&self, reg: Reg) -> Option<Occupant> {
        self.regs[reg.index()]
    }

    pub fn stack_slots(&self) -> &[Option<Occupant>] {
        &self.stack
    }

    pub fn saved_home(&self, reg: Reg) -> Option<Location<'a>> {
        self.saved[reg.index()]
    }

    /// Live values in id order.
    pub fn mapped_values(&self) -> Vec<Var> {
        let mut vars: Vec<Var> = self.locations.keys().copied().collect();
        vars.sort_unstable();
        vars
    }

    /// Register holding `var`, if any.
    pub fn reg_of(&self, var: Var) -> Option<Reg> {
        match self.location(var) {
            Some(Location::Reg(reg)) => Some(reg),
            _ => None,
        }
    }

    pub(super) fn home(&self, occ: Occupant) -> Option<Location<'a>> {
        match occ {
            Occupant::Saved(reg) => self.saved[reg.index()],
            Occupant::Value(var) => self.location(var),
        }
    }

    fn set_home(&mut self, occ: Occupant, loc: Option<Location<'a>>) {
        match (occ, loc) {
            (Occupant::Saved(reg), loc) => self.saved[reg.index()] = loc,
            (Occupant::Value(var), Some(loc)) => {
                self.locations.insert(var, loc);
            }
            (Occupant::Value(var), None) => {
                self.locations.remove(&var);
            }
        }
    }

    pub(super) fn cell(&self, loc: Location<'a>) -> Option<Occupant> {
        match loc {
            Location::Reg(reg) => self.regs[reg.index()],
            Location::Stack(slot) => self.stack.get(slot).copied().flatten(),
            Location::Const(_) | Location::Global(_) => None,
        }
    }

    fn set_cell(&mut self, loc: Location<'a>, occ: Option<Occupant>) {
        match loc {
            Location::Reg(reg) => self.regs[reg.index()] = occ,
            Location::Stack(slot) => self.stack[slot] = occ,
            Location::Const(_) | Location::Global(_) => {}
        }
    }

    /// Records `occ` at `loc`, vacating its previous cell.
    pub(super) fn place(&mut self, occ: Occupant, loc: Location<'a>) {
        if let Some(old) = self.home(occ) {
            if self.cell(old) == Some(occ) {
                self.set_cell(old, None);
            }
        }
        debug_assert!(self.cell(loc).is_none(), "{occ} placed into occupied {loc:?}");
        self.set_cell(loc, Some(occ));
        self.set_home(occ, Some(loc));
        if let Location::Reg(reg) = loc {
            self.recency.touch(reg);
        }
    }

    fn vacate(&mut self, occ: Occupant) {
        if let Some(old) = self.home(occ) {
            if self.cell(old) == Some(occ) {
                self.set_cell(old, None);
            }
        }
        self.set_home(occ, None);
    }

    pub(super) fn check(&self) {
        if self.check_consistency {
            self.assert_consistency();
        }
    }

    /// Panics unless the location map, marker homes and cell tables are
    /// mutual inverses.
    pub fn assert_consistency(&self) {
        for (&var, &loc) in &self.locations {
            if !loc.is_virtual() {
                assert_eq!(
                    self.cell(loc),
                    Some(Occupant::Value(var)),
                    "{var} maps to {loc:?} which holds something else"
                );
            }
        }
        for reg in Reg::ALL {
            if let Some(occ) = self.regs[reg.index()] {
                assert_eq!(
                    self.home(occ),
                    Some(Location::Reg(reg)),
                    "{reg} holds {occ} which lives elsewhere"
                );
            }
            let home = self.saved[reg.index()];
            if CALLEE_SAVED.contains(reg) {
                let Some(home) = home else {
                    panic!("entry content of {reg} was lost");
                };
                assert_eq!(self.cell(home), Some(Occupant::Saved(reg)));
            } else {
                assert!(home.is_none(), "{reg} is not callee-saved");
            }
        }
        assert!(self.regs[Reg::Rsp.index()].is_none(), "rsp is allocated");
        for (slot, cell) in self.stack.iter().enumerate() {
            if let Some(occ) = cell {
                assert_eq!(
                    self.home(*occ),
                    Some(Location::Stack(slot)),
                    "stack slot {slot} holds {occ} which lives elsewhere"
                );
            }
        }
    }

    pub(crate) fn slot_operand(&self, slot: usize) -> Operand {
        let depth = self.stack.len() - 1 - slot;
        Operand::Mem {
            base: Reg::Rsp,
            disp: (8 * depth) as i32,
        }
    }

    /// Instruction operand for a concrete location or a constant.
    pub(crate) fn operand(&self, loc: Location<'a>) -> Operand {
        match loc {
            Location::Reg(reg) => Operand::Reg(reg),
            Location::Stack(slot) => self.slot_operand(slot),
            Location::Const(value) => Operand::Imm(value),
            Location::Global(symbol) => panic!("address of {symbol} used without materialising it"),
        }
    }

    /// Emits the load of `loc` into `dst` without touching the tables.
    pub(crate) fn emit_load(&mut self, dst: Reg, loc: Location<'a>) {
        match loc {
            Location::Const(value) => self.asm.mov_reg_imm(dst, value),
            Location::Global(symbol) => self.asm.lea(dst, symbol),
            Location::Reg(_) | Location::Stack(_) => {
                let src = self.operand(loc);
                self.asm.mov(Operand::Reg(dst), src);
            }
        }
    }

    pub fn declare_const(&mut self, var: Var, value: i64) {
        self.locations.insert(var, Location::Const(value));
    }

    pub fn declare_global(&mut self, var: Var, symbol: &'a str) {
        self.locations.insert(var, Location::Global(symbol));
    }

    /// Gives `dst` the same virtual location as `src`.
    pub fn alias_virtual(&mut self, dst: Var, src: Var) {
        let loc = self.loc(src);
        debug_assert!(loc.is_virtual());
        self.locations.insert(dst, loc);
    }

    pub fn bind_reg(&mut self, var: Var, reg: Reg) {
        self.place(Occupant::Value(var), Location::Reg(reg));
        self.check();
    }

    /// Transfers `from`'s location to `to` without emitting code.
    pub fn rename(&mut self, from: Var, to: Var) {
        let loc = self.loc(from);
        self.locations.remove(&from);
        self.locations.insert(to, loc);
        if !loc.is_virtual() {
            self.set_cell(loc, Some(Occupant::Value(to)));
        }
        self.check();
    }

    /// Forgets a value; its cell becomes free.
    pub fn unmap(&mut self, var: Var) {
        self.vacate(Occupant::Value(var));
        self.check();
    }

    /// Returns a free register of `view`, spilling the least recently used
    /// one if none is free.
    pub fn free_reg(&mut self, view: RegSet, exclude: RegSet) -> Reg {
        let candidates = view.intersect(ALLOCATABLE).difference(exclude);
        let free = self
            .recency
            .iter_view(candidates)
            .find(|r| self.regs[r.index()].is_none());
        let reg = match free {
            Some(reg) => reg,
            None => {
                let Some(victim) = self.recency.least_recent(candidates) else {
                    panic!("no register left outside {exclude:?}");
                };
                self.move_to_stack(victim);
                victim
            }
        };
        self.recency.touch(reg);
        reg
    }

    /// Spills the occupant of `reg` into the first free slot, or pushes it.
    pub fn move_to_stack(&mut self, reg: Reg) {
        let Some(occ) = self.regs[reg.index()] else {
            return;
        };
        match self.stack.iter().position(Option::is_none) {
            Some(slot) => {
                let dst = self.slot_operand(slot);
                self.asm.mov(dst, Operand::Reg(reg));
                self.place(occ, Location::Stack(slot));
            }
            None => {
                self.asm.push_reg(reg);
                self.stack.push(None);
                self.place(occ, Location::Stack(self.stack.len() - 1));
            }
        }
        self.spills += 1;
        log::trace!("spilled {occ} from {reg}");
        self.check();
    }

    /// Pops free slots off the top of the stack.
    pub fn compress_stack(&mut self) {
        let mut released = 0;
        while let Some(None) = self.stack.last() {
            self.stack.pop();
            released += 1;
        }
        self.asm.release_stack(released);
    }

    /// Brings `occ` into a register, `preferred` if it is free.
    pub(super) fn occupant_to_reg(
        &mut self,
        occ: Occupant,
        preferred: Option<Reg>,
        exclude: RegSet,
    ) -> Reg {
        let Some(loc) = self.home(occ) else {
            panic!("{occ} has no location");
        };
        if let Location::Reg(reg) = loc {
            self.recency.touch(reg);
            return reg;
        }
        let preferred = preferred
            .filter(|r| self.regs[r.index()].is_none() && !exclude.contains(*r) && ALLOCATABLE.contains(*r));
        let reg = match preferred {
            Some(reg) => reg,
            None => self.free_reg(ALLOCATABLE, exclude),
        };
        // Spilling for `reg` only appends slots, so `loc` is still valid.
        self.emit_load(reg, loc);
        self.place(occ, Location::Reg(reg));
        self.check();
        reg
    }

    /// Forces `var` into a register, materialising virtual locations.
    pub fn make_reg(&mut self, var: Var, exclude: RegSet) -> Reg {
        self.occupant_to_reg(Occupant::Value(var), None, exclude)
    }

    /// Materialises a constant or global into a register; returns `None`
    /// for values that already have a cell.
    pub fn devirtualize(&mut self, var: Var, exclude: RegSet) -> Option<Reg> {
        if self.loc(var).is_virtual() {
            Some(self.make_reg(var, exclude))
        } else {
            None
        }
    }

    /// Makes sure `var` is not a memory operand.
    pub fn make_non_mem(&mut self, var: Var, exclude: RegSet) -> Location<'a> {
        if let Location::Stack(_) = self.loc(var) {
            self.make_reg(var, exclude);
        }
        self.loc(var)
    }

    /// Leaves at most one of `a` and `b` on the stack by loading the one in
    /// the lower slot.
    pub fn make_both_non_mem(&mut self, a: Var, b: Var) {
        if let (Location::Stack(sa), Location::Stack(sb)) = (self.loc(a), self.loc(b)) {
            if sa != sb {
                let lower = if sa < sb { a } else { b };
                self.make_non_mem(lower, RegSet::EMPTY);
            }
        }
    }

    /// Moves the occupant of `reg` to a free register outside `exclude`, or
    /// to the stack.
    pub(super) fn relocate(&mut self, reg: Reg, exclude: RegSet) {
        let Some(occ) = self.regs[reg.index()] else {
            return;
        };
        let candidates = ALLOCATABLE.difference(exclude.union(RegSet::single(reg)));
        let free = self
            .recency
            .iter_view(candidates)
            .find(|r| self.regs[r.index()].is_none());
        match free {
            Some(dst) => {
                self.asm.mov_reg_reg(dst, reg);
                self.place(occ, Location::Reg(dst));
            }
            None => self.move_to_stack(reg),
        }
    }

    /// Exchanges the contents of two registers.
    pub(super) fn swap_regs(&mut self, a: Reg, b: Reg) {
        self.asm.xchg(a, b);
        let (occ_a, occ_b) = (self.regs[a.index()], self.regs[b.index()]);
        self.regs[a.index()] = occ_b;
        self.regs[b.index()] = occ_a;
        if let Some(occ) = occ_a {
            self.set_home(occ, Some(Location::Reg(b)));
        }
        if let Some(occ) = occ_b {
            self.set_home(occ, Some(Location::Reg(a)));
        }
        self.recency.touch(a);
        self.recency.touch(b);
    }

    /// Moves every value into its target register. Targets must be
    /// distinct; cycles are resolved with `xchg`.
    pub fn route(&mut self, moves: &[(Var, Reg)]) {
        let targets: RegSet = moves.iter().map(|&(_, reg)| reg).collect();
        let (virtuals, concrete): (Vec<_>, Vec<_>) = moves
            .iter()
            .copied()
            .partition(|&(var, _)| self.loc(var).is_virtual());

        let concrete: Vec<(Occupant, Reg)> = concrete
            .into_iter()
            .map(|(var, reg)| (Occupant::Value(var), reg))
            .collect();
        self.route_occupants(&concrete, targets);

        for (var, reg) in virtuals {
            self.relocate(reg, targets);
            let loc = self.loc(var);
            self.emit_load(reg, loc);
            self.place(Occupant::Value(var), Location::Reg(reg));
        }
        self.check();
    }

    /// Parallel move of concrete occupants into registers. Occupants of a
    /// target that are not themselves moving are relocated outside
    /// `protect` and the targets first.
    pub(super) fn route_occupants(&mut self, moves: &[(Occupant, Reg)], protect: RegSet) {
        let mut pending: Vec<(Occupant, Reg)> = moves
            .iter()
            .copied()
            .filter(|&(occ, reg)| self.home(occ) != Some(Location::Reg(reg)))
            .collect();

        let mut busy = protect;
        for &(occ, target) in &pending {
            busy.insert(target);
            if let Some(Location::Reg(src)) = self.home(occ) {
                busy.insert(src);
            }
        }
        for i in 0..pending.len() {
            let target = pending[i].1;
            if let Some(occ) = self.regs[target.index()] {
                if !pending.iter().any(|&(p, _)| p == occ) {
                    self.relocate(target, busy);
                }
            }
        }

        while !pending.is_empty() {
            if let Some(i) = pending
                .iter()
                .position(|&(_, target)| self.regs[target.index()].is_none())
            {
                let (occ, target) = pending.swap_remove(i);
                let Some(src) = self.home(occ) else {
                    panic!("{occ} has no location");
                };
                self.emit_load(target, src);
                self.place(occ, Location::Reg(target));
                continue;
            }

            // Every target holds an occupant that still has to move, so the
            // remaining moves form cycles through registers.
            let first_target = pending[0].1;
            let Some(blocker) = self.regs[first_target.index()] else {
                unreachable!("target {first_target} was checked to be occupied");
            };
            let Some(j) = pending.iter().position(|&(occ, _)| occ == blocker) else {
                panic!("{blocker} blocks {first_target} but is not being moved");
            };
            let blocker_target = pending[j].1;
            self.swap_regs(blocker_target, first_target);
            pending.retain(|&(occ, reg)| self.home(occ) != Some(Location::Reg(reg)));
        }
        self.check();
    }

    /// Moves everything out of caller-saved registers except `keep`,
    /// preferring free callee-saved registers over the stack.
    pub fn evict_caller_saved(&mut self, keep: RegSet) {
        for reg in CALLER_SAVED.difference(keep).iter() {
            let Some(occ) = self.regs[reg.index()] else {
                continue;
            };
            let free_callee_saved = self
                .recency
                .iter_view(CALLEE_SAVED)
                .find(|r| self.regs[r.index()].is_none());
            match free_callee_saved {
                Some(dst) => {
                    self.asm.mov_reg_reg(dst, reg);
                    self.place(occ, Location::Reg(dst));
                }
                None => self.move_to_stack(reg),
            }
        }
        self.check();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::x64::asm::AsmInst;

    fn ctx_with(params: &[Var]) -> Context<'static> {
        Context::new(params, true)
    }

    fn round_trips(ctx: &Context<'_>) {
        for var in ctx.mapped_values() {
            let loc = ctx.loc(var);
            if !loc.is_virtual() {
                assert_eq!(ctx.cell(loc), Some(Occupant::Value(var)));
            }
        }
    }

    #[test]
    fn test_entry_state() {
        let ctx = ctx_with(&[Var(0), Var(1)]);
        assert_eq!(ctx.location(Var(0)), Some(Location::Reg(Reg::Rdi)));
        assert_eq!(ctx.location(Var(1)), Some(Location::Reg(Reg::Rsi)));
        for reg in CALLEE_SAVED.iter() {
            assert_eq!(ctx.reg_occupant(reg), Some(Occupant::Saved(reg)));
        }
        assert!(ctx.stack_slots().is_empty());
        assert!(ctx.asm().is_empty());
    }

    #[test]
    fn test_free_reg_prefers_free_registers() {
        let mut ctx = ctx_with(&[Var(0)]);
        let reg = ctx.free_reg(ALLOCATABLE, RegSet::EMPTY);
        assert!(CALLER_SAVED.contains(reg));
        assert_ne!(reg, Reg::Rdi);
        assert!(ctx.asm().is_empty());
    }

    #[test]
    fn test_spill_fills_free_slot_before_pushing() {
        let mut ctx = ctx_with(&[Var(0), Var(1)]);
        ctx.move_to_stack(Reg::Rdi);
        ctx.move_to_stack(Reg::Rsi);
        assert_eq!(ctx.location(Var(0)), Some(Location::Stack(0)));
        assert_eq!(ctx.location(Var(1)), Some(Location::Stack(1)));

        let reg = ctx.make_reg(Var(0), RegSet::EMPTY);
        assert_eq!(ctx.stack_slots(), &[None, Some(Occupant::Value(Var(1)))]);
        ctx.move_to_stack(reg);
        assert_eq!(ctx.location(Var(0)), Some(Location::Stack(0)));

        let rendered: Vec<String> = ctx.asm().insts().iter().map(ToString::to_string).collect();
        assert_eq!(rendered[0], "push rdi");
        assert_eq!(rendered[1], "push rsi");
        assert_eq!(rendered[2], format!("mov {reg}, qword [rsp + 8]"));
        assert_eq!(rendered[3], format!("mov qword [rsp + 8], {reg}"));
        round_trips(&ctx);
    }

    #[test]
    fn test_compress_stack_releases_trailing_slots() {
        let mut ctx = ctx_with(&[Var(0), Var(1)]);
        ctx.move_to_stack(Reg::Rdi);
        ctx.move_to_stack(Reg::Rsi);
        ctx.unmap(Var(1));
        ctx.compress_stack();
        assert_eq!(ctx.stack_slots().len(), 1);
        assert_eq!(
            ctx.asm().insts().last().map(ToString::to_string).as_deref(),
            Some("add rsp, 8")
        );
    }

    #[test]
    fn test_eviction_picks_least_recently_used() {
        let mut ctx = ctx_with(&[]);
        let mut next = 0;
        // Fill every caller-saved register.
        while let Some(reg) = CALLER_SAVED
            .iter()
            .find(|r| ctx.reg_occupant(*r).is_none())
        {
            ctx.bind_reg(Var(next), reg);
            next += 1;
        }
        let oldest = ctx.recency.least_recent(CALLER_SAVED);
        let reg = ctx.free_reg(CALLER_SAVED, RegSet::EMPTY);
        assert_eq!(Some(reg), oldest);
        assert!(matches!(ctx.asm().insts()[0], AsmInst::Push(r) if r == reg));
        round_trips(&ctx);
    }

    #[test]
    fn test_make_reg_materialises_virtuals() {
        let mut ctx = ctx_with(&[]);
        ctx.declare_const(Var(0), 42);
        ctx.declare_global(Var(1), "unit");
        let a = ctx.make_reg(Var(0), RegSet::EMPTY);
        let b = ctx.devirtualize(Var(1), RegSet::EMPTY).unwrap();
        assert_ne!(a, b);
        assert_eq!(ctx.asm().insts()[0].to_string(), format!("mov {a}, 42"));
        assert_eq!(ctx.asm().insts()[1].to_string(), format!("lea {b}, [rel unit]"));
        assert_eq!(ctx.devirtualize(Var(1), RegSet::EMPTY), None);
    }

    #[test]
    fn test_make_non_mem_loads_only_stack_values() {
        let mut ctx = ctx_with(&[Var(0)]);
        ctx.declare_const(Var(1), 9);
        ctx.move_to_stack(Reg::Rdi);
        assert_eq!(ctx.location(Var(0)), Some(Location::Stack(0)));

        let loc = ctx.make_non_mem(Var(0), RegSet::single(Reg::Rdi));
        assert!(matches!(loc, Location::Reg(reg) if reg != Reg::Rdi));
        assert_eq!(ctx.make_non_mem(Var(1), RegSet::EMPTY), Location::Const(9));
        round_trips(&ctx);
    }

    #[test]
    fn test_make_both_non_mem_loads_lower_slot() {
        let mut ctx = ctx_with(&[Var(0), Var(1)]);
        ctx.move_to_stack(Reg::Rdi);
        ctx.move_to_stack(Reg::Rsi);
        ctx.make_both_non_mem(Var(1), Var(0));
        assert!(matches!(ctx.location(Var(0)), Some(Location::Reg(_))));
        assert_eq!(ctx.location(Var(1)), Some(Location::Stack(1)));
        round_trips(&ctx);
    }

    #[test]
    fn test_route_swaps_crossed_arguments() {
        let mut ctx = ctx_with(&[Var(0), Var(1)]);
        ctx.route(&[(Var(0), Reg::Rsi), (Var(1), Reg::Rdi)]);
        assert_eq!(ctx.reg_of(Var(0)), Some(Reg::Rsi));
        assert_eq!(ctx.reg_of(Var(1)), Some(Reg::Rdi));
        assert_eq!(ctx.asm().len(), 1);
        assert!(matches!(ctx.asm().insts()[0], AsmInst::Xchg(..)));
    }

    #[test]
    fn test_route_relocates_blocking_value() {
        let mut ctx = ctx_with(&[Var(0), Var(1)]);
        ctx.declare_const(Var(2), 7);
        ctx.route(&[(Var(1), Reg::Rdi), (Var(2), Reg::Rsi)]);
        assert_eq!(ctx.reg_of(Var(1)), Some(Reg::Rdi));
        assert_eq!(ctx.reg_of(Var(2)), Some(Reg::Rsi));
        let moved = ctx.reg_of(Var(0)).unwrap();
        assert!(moved != Reg::Rdi && moved != Reg::Rsi);
        round_trips(&ctx);
    }

    #[test]
    fn test_evict_caller_saved_uses_stack_when_callee_saved_busy() {
        let mut ctx = ctx_with(&[Var(0), Var(1)]);
        ctx.evict_caller_saved(RegSet::single(Reg::Rsi));
        assert_eq!(ctx.location(Var(0)), Some(Location::Stack(0)));
        assert_eq!(ctx.reg_of(Var(1)), Some(Reg::Rsi));

        let mut ctx = ctx_with(&[Var(0)]);
        ctx.move_to_stack(Reg::Rbx);
        ctx.evict_caller_saved(RegSet::EMPTY);
        assert_eq!(ctx.reg_of(Var(0)), Some(Reg::Rbx));
        round_trips(&ctx);
    }

    #[test]
    #[should_panic(expected = "holds something else")]
    fn test_consistency_violation_panics() {
        let mut ctx = ctx_with(&[Var(0)]);
        ctx.regs[Reg::Rdi.index()] = None;
        ctx.assert_consistency();
    }
}
