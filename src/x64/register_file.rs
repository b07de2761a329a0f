//! Registers, register sets and the recency order used for eviction.
//!
//! This is the physical half of the allocator: which registers exist, which
//! occupant a cell can hold, and in which order registers were last used.
//! The bookkeeping tying values to cells lives in [`Context`](super::Context).

use std::collections::VecDeque;
use std::fmt;

use crate::ir::Var;

/// x86-64 general purpose register, numbered by hardware encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

/// Number of general purpose registers.
pub const NUM_REGS: usize = 16;

impl Reg {
    pub const ALL: [Reg; NUM_REGS] = [
        Reg::Rax,
        Reg::Rcx,
        Reg::Rdx,
        Reg::Rbx,
        Reg::Rsp,
        Reg::Rbp,
        Reg::Rsi,
        Reg::Rdi,
        Reg::R8,
        Reg::R9,
        Reg::R10,
        Reg::R11,
        Reg::R12,
        Reg::R13,
        Reg::R14,
        Reg::R15,
    ];

    pub fn id(self) -> u8 {
        self as u8
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_id(id: u8) -> Option<Self> {
        Self::ALL.get(id as usize).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            Reg::Rax => "rax",
            Reg::Rcx => "rcx",
            Reg::Rdx => "rdx",
            Reg::Rbx => "rbx",
            Reg::Rsp => "rsp",
            Reg::Rbp => "rbp",
            Reg::Rsi => "rsi",
            Reg::Rdi => "rdi",
            Reg::R8 => "r8",
            Reg::R9 => "r9",
            Reg::R10 => "r10",
            Reg::R11 => "r11",
            Reg::R12 => "r12",
            Reg::R13 => "r13",
            Reg::R14 => "r14",
            Reg::R15 => "r15",
        }
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Bit set for efficiently tracking register sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RegSet(u16);

impl RegSet {
    pub const EMPTY: RegSet = RegSet(0);

    pub const fn of(regs: &[Reg]) -> Self {
        let mut bits = 0u16;
        let mut i = 0;
        while i < regs.len() {
            bits |= 1 << regs[i] as u8;
            i += 1;
        }
        RegSet(bits)
    }

    pub fn single(reg: Reg) -> Self {
        RegSet(1 << reg.id())
    }

    pub fn contains(self, reg: Reg) -> bool {
        self.0 & (1 << reg.id()) != 0
    }

    pub fn insert(&mut self, reg: Reg) {
        self.0 |= 1 << reg.id();
    }

    pub fn remove(&mut self, reg: Reg) {
        self.0 &= !(1 << reg.id());
    }

    pub fn union(self, other: RegSet) -> Self {
        RegSet(self.0 | other.0)
    }

    pub fn intersect(self, other: RegSet) -> Self {
        RegSet(self.0 & other.0)
    }

    pub fn difference(self, other: RegSet) -> Self {
        RegSet(self.0 & !other.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn len(self) -> u32 {
        self.0.count_ones()
    }

    /// Registers in ascending encoding order.
    pub fn iter(self) -> impl Iterator<Item = Reg> {
        Reg::ALL.into_iter().filter(move |r| self.contains(*r))
    }
}

impl FromIterator<Reg> for RegSet {
    fn from_iter<I: IntoIterator<Item = Reg>>(iter: I) -> Self {
        let mut set = RegSet::EMPTY;
        for reg in iter {
            set.insert(reg);
        }
        set
    }
}

/// Content of a register or stack cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Occupant {
    /// Entry-time content of the given callee-saved register.
    Saved(Reg),
    Value(Var),
}

impl fmt::Display for Occupant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Occupant::Saved(reg) => write!(f, "saved {reg}"),
            Occupant::Value(var) => write!(f, "{var}"),
        }
    }
}

/// Registers ordered from least to most recently used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recency {
    order: VecDeque<Reg>,
}

impl Recency {
    pub fn new(regs: RegSet) -> Self {
        Self {
            order: regs.iter().collect(),
        }
    }

    /// Marks `reg` as the most recently used register.
    pub fn touch(&mut self, reg: Reg) {
        if let Some(pos) = self.order.iter().position(|&r| r == reg) {
            self.order.remove(pos);
        }
        self.order.push_back(reg);
    }

    /// Registers of `view` from least to most recently used.
    pub fn iter_view(&self, view: RegSet) -> impl Iterator<Item = Reg> + '_ {
        self.order.iter().copied().filter(move |r| view.contains(*r))
    }

    pub fn least_recent(&self, view: RegSet) -> Option<Reg> {
        self.iter_view(view).next()
    }
}
