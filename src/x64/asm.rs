// This module provides the assembly buffer the allocator emits into. Instructions are kept
// as a typed AsmInst list rather than text so that branch arms can be compiled into
// separate buffers and spliced together, and so tests can inspect what was emitted. Asm
// offers one method per instruction shape the lowering needs (moves, two-operand ALU
// operations, the three-operand imul, neg/not, cmp, conditional and unconditional jumps,
// calls, tail jumps to a symbol, push/pop, xchg, lea of a rip-relative symbol, labels and
// ret). Display renders NASM syntax with qword memory operands and one instruction per
// line, labels flush left.

//! Typed x86-64 instruction buffer with NASM rendering.

use std::fmt;

use super::register_file::Reg;
use crate::ir::{Cond, UnaryOp};

/// Local jump target, unique within one function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(pub u32);

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ".L{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Reg(Reg),
    Imm(i64),
    /// `qword [base + disp]`
    Mem { base: Reg, disp: i32 },
}

impl Operand {
    pub fn is_mem(&self) -> bool {
        matches!(self, Operand::Mem { .. })
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Reg(reg) => write!(f, "{reg}"),
            Operand::Imm(value) => write!(f, "{value}"),
            Operand::Mem { base, disp: 0 } => write!(f, "qword [{base}]"),
            Operand::Mem { base, disp } if *disp < 0 => write!(f, "qword [{base} - {}]", -disp),
            Operand::Mem { base, disp } => write!(f, "qword [{base} + {disp}]"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Sub,
    And,
    Or,
    Xor,
}

impl AluOp {
    pub fn mnemonic(self) -> &'static str {
        match self {
            AluOp::Add => "add",
            AluOp::Sub => "sub",
            AluOp::And => "and",
            AluOp::Or => "or",
            AluOp::Xor => "xor",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AsmInst<'a> {
    Mov { dst: Operand, src: Operand },
    /// `lea dst, [rel symbol]`
    Lea { dst: Reg, symbol: &'a str },
    Alu { op: AluOp, dst: Operand, src: Operand },
    /// `imul dst, src` or `imul dst, src, imm`
    Imul { dst: Reg, src: Operand, imm: Option<i32> },
    Unary { op: UnaryOp, dst: Operand },
    Cmp { lhs: Operand, rhs: Operand },
    Jcc { cond: Cond, target: Label },
    Jmp(Label),
    /// Tail jump to an external symbol.
    JmpSym(&'a str),
    Call(&'a str),
    Push(Reg),
    Pop(Reg),
    Xchg(Reg, Reg),
    Label(Label),
    Ret,
}

impl fmt::Display for AsmInst<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AsmInst::Mov { dst, src } => write!(f, "mov {dst}, {src}"),
            AsmInst::Lea { dst, symbol } => write!(f, "lea {dst}, [rel {symbol}]"),
            AsmInst::Alu { op, dst, src } => write!(f, "{} {dst}, {src}", op.mnemonic()),
            AsmInst::Imul { dst, src, imm: None } => write!(f, "imul {dst}, {src}"),
            AsmInst::Imul {
                dst,
                src,
                imm: Some(imm),
            } => write!(f, "imul {dst}, {src}, {imm}"),
            AsmInst::Unary { op, dst } => write!(f, "{} {dst}", op.name()),
            AsmInst::Cmp { lhs, rhs } => write!(f, "cmp {lhs}, {rhs}"),
            AsmInst::Jcc { cond, target } => write!(f, "{} {target}", cond.mnemonic()),
            AsmInst::Jmp(target) => write!(f, "jmp {target}"),
            AsmInst::JmpSym(symbol) => write!(f, "jmp {symbol}"),
            AsmInst::Call(symbol) => write!(f, "call {symbol}"),
            AsmInst::Push(reg) => write!(f, "push {reg}"),
            AsmInst::Pop(reg) => write!(f, "pop {reg}"),
            AsmInst::Xchg(a, b) => write!(f, "xchg {a}, {b}"),
            AsmInst::Label(label) => write!(f, "{label}:"),
            AsmInst::Ret => write!(f, "ret"),
        }
    }
}

/// Instruction buffer for one function or one branch arm.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Asm<'a> {
    insts: Vec<AsmInst<'a>>,
}

impl<'a> Asm<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, inst: AsmInst<'a>) {
        log::trace!("emit {inst}");
        self.insts.push(inst);
    }

    /// Moves all instructions of `other` to the end of this buffer.
    pub fn append(&mut self, other: &mut Asm<'a>) {
        self.insts.append(&mut other.insts);
    }

    pub fn insts(&self) -> &[AsmInst<'a>] {
        &self.insts
    }

    pub fn len(&self) -> usize {
        self.insts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insts.is_empty()
    }

    pub fn mov(&mut self, dst: Operand, src: Operand) {
        if dst != src {
            self.push(AsmInst::Mov { dst, src });
        }
    }

    pub fn mov_reg_reg(&mut self, dst: Reg, src: Reg) {
        self.mov(Operand::Reg(dst), Operand::Reg(src));
    }

    pub fn mov_reg_imm(&mut self, dst: Reg, imm: i64) {
        self.push(AsmInst::Mov {
            dst: Operand::Reg(dst),
            src: Operand::Imm(imm),
        });
    }

    pub fn lea(&mut self, dst: Reg, symbol: &'a str) {
        self.push(AsmInst::Lea { dst, symbol });
    }

    pub fn alu(&mut self, op: AluOp, dst: Operand, src: Operand) {
        self.push(AsmInst::Alu { op, dst, src });
    }

    pub fn imul(&mut self, dst: Reg, src: Operand, imm: Option<i32>) {
        self.push(AsmInst::Imul { dst, src, imm });
    }

    pub fn unary(&mut self, op: UnaryOp, dst: Operand) {
        self.push(AsmInst::Unary { op, dst });
    }

    pub fn cmp(&mut self, lhs: Operand, rhs: Operand) {
        self.push(AsmInst::Cmp { lhs, rhs });
    }

    pub fn jcc(&mut self, cond: Cond, target: Label) {
        self.push(AsmInst::Jcc { cond, target });
    }

    pub fn jmp(&mut self, target: Label) {
        self.push(AsmInst::Jmp(target));
    }

    pub fn jmp_symbol(&mut self, symbol: &'a str) {
        self.push(AsmInst::JmpSym(symbol));
    }

    pub fn call(&mut self, symbol: &'a str) {
        self.push(AsmInst::Call(symbol));
    }

    pub fn push_reg(&mut self, reg: Reg) {
        self.push(AsmInst::Push(reg));
    }

    pub fn pop_reg(&mut self, reg: Reg) {
        self.push(AsmInst::Pop(reg));
    }

    pub fn xchg(&mut self, a: Reg, b: Reg) {
        self.push(AsmInst::Xchg(a, b));
    }

    pub fn label(&mut self, label: Label) {
        self.push(AsmInst::Label(label));
    }

    pub fn ret(&mut self) {
        self.push(AsmInst::Ret);
    }

    /// `add rsp, 8 * slots`
    pub fn release_stack(&mut self, slots: usize) {
        if slots > 0 {
            self.alu(AluOp::Add, Operand::Reg(Reg::Rsp), Operand::Imm(8 * slots as i64));
        }
    }

    /// `sub rsp, 8 * slots`
    pub fn reserve_stack(&mut self, slots: usize) {
        if slots > 0 {
            self.alu(AluOp::Sub, Operand::Reg(Reg::Rsp), Operand::Imm(8 * slots as i64));
        }
    }
}

impl fmt::Display for Asm<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for inst in &self.insts {
            match inst {
                AsmInst::Label(_) => writeln!(f, "{inst}")?,
                _ => writeln!(f, "    {inst}")?,
            }
        }
        Ok(())
    }
}
