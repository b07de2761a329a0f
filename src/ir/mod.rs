//! Machine-independent IR targeted by the AST lowering.
//!
//! The IR is scope structured rather than block structured: a function body is
//! a [`Scope`], and the only control flow is the conditional expression
//! ([`Rhs::Ternary`]) whose two arms are scopes of their own. Every produced
//! quantity is named by a [`Var`] assigned exactly once.
//!
//! ```text
//! fn pick(a, b) {
//!     cmp(a, b);
//!     r = if (jl) { return a; } else { return b; };
//!     return r;
//! }
//! ```

use std::fmt;

use bitflags::bitflags;

pub mod builder;
pub mod check;
pub mod parser;
pub mod printer;

pub use builder::FunctionBuilder;
pub use printer::Printer;

use crate::abi::StaticObject;

/// Identifier of one IR value.
///
/// Ids are dense per function so they can index side tables such as the
/// destroy-class table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Var(pub u32);

impl Var {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

bitflags! {
    /// Memory-management category of a value.
    ///
    /// A class is the set of categories the value may still belong to. The
    /// analysis only ever intersects it with narrower sets.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DestroyClass: u8 {
        /// Never a heap pointer.
        const UNBOXED = 1;
        /// Pointer to static data, never refcounted.
        const GLOBAL = 1 << 1;
        /// Refcounted heap pointer.
        const NON_TRIVIAL = 1 << 2;

        const TRIVIAL = Self::UNBOXED.bits() | Self::GLOBAL.bits();
        const BOXED = Self::GLOBAL.bits() | Self::NON_TRIVIAL.bits();
        const VALUE = Self::UNBOXED.bits() | Self::GLOBAL.bits() | Self::NON_TRIVIAL.bits();
        const NON_GLOBAL = Self::UNBOXED.bits() | Self::NON_TRIVIAL.bits();
    }
}

impl DestroyClass {
    /// Whether a value of this class may need a refcount operation.
    pub fn may_need_release(self) -> bool {
        self.intersects(Self::NON_TRIVIAL)
    }

    pub fn name(self) -> &'static str {
        match self.bits() {
            0 => "empty",
            b if b == Self::UNBOXED.bits() => "unboxed",
            b if b == Self::GLOBAL.bits() => "global",
            b if b == Self::NON_TRIVIAL.bits() => "non_trivial",
            b if b == Self::TRIVIAL.bits() => "trivial",
            b if b == Self::BOXED.bits() => "boxed",
            b if b == Self::NON_GLOBAL.bits() => "non_global",
            _ => "value",
        }
    }
}

/// Condition under which the taken arm of a ternary runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cond {
    Jz,
    Jnz,
    Jl,
    Jle,
    Jg,
    Jge,
}

impl Cond {
    pub fn mnemonic(self) -> &'static str {
        match self {
            Cond::Jz => "jz",
            Cond::Jnz => "jnz",
            Cond::Jl => "jl",
            Cond::Jle => "jle",
            Cond::Jg => "jg",
            Cond::Jge => "jge",
        }
    }

    pub fn from_mnemonic(s: &str) -> Option<Self> {
        match s {
            "jz" | "je" => Some(Cond::Jz),
            "jnz" | "jne" => Some(Cond::Jnz),
            "jl" => Some(Cond::Jl),
            "jle" => Some(Cond::Jle),
            "jg" => Some(Cond::Jg),
            "jge" => Some(Cond::Jge),
            _ => None,
        }
    }

    /// Condition that holds exactly when `self` does not.
    pub fn inverse(self) -> Self {
        match self {
            Cond::Jz => Cond::Jnz,
            Cond::Jnz => Cond::Jz,
            Cond::Jl => Cond::Jge,
            Cond::Jge => Cond::Jl,
            Cond::Jg => Cond::Jle,
            Cond::Jle => Cond::Jg,
        }
    }

    /// Condition to test after the two compared operands trade places.
    pub fn swapped(self) -> Self {
        match self {
            Cond::Jz | Cond::Jnz => self,
            Cond::Jl => Cond::Jg,
            Cond::Jg => Cond::Jl,
            Cond::Jle => Cond::Jge,
            Cond::Jge => Cond::Jle,
        }
    }

    /// Outcome of `cmp lhs, rhs` followed by this jump on machine words.
    pub fn evaluate(self, lhs: i64, rhs: i64) -> bool {
        match self {
            Cond::Jz => lhs == rhs,
            Cond::Jnz => lhs != rhs,
            Cond::Jl => lhs < rhs,
            Cond::Jle => lhs <= rhs,
            Cond::Jg => lhs > rhs,
            Cond::Jge => lhs >= rhs,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Not,
}

impl UnaryOp {
    pub fn name(self) -> &'static str {
        match self {
            UnaryOp::Neg => "neg",
            UnaryOp::Not => "not",
        }
    }

    pub fn fold(self, value: i64) -> i64 {
        match self {
            UnaryOp::Neg => value.wrapping_neg(),
            UnaryOp::Not => !value,
        }
    }
}

/// Raw machine-word arithmetic. Tagging is the lowering's business.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
}

impl BinaryOp {
    pub fn name(self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
            BinaryOp::Xor => "xor",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        match s {
            "add" => Some(BinaryOp::Add),
            "sub" => Some(BinaryOp::Sub),
            "mul" => Some(BinaryOp::Mul),
            "and" => Some(BinaryOp::And),
            "or" => Some(BinaryOp::Or),
            "xor" => Some(BinaryOp::Xor),
            _ => None,
        }
    }

    pub fn is_commutative(self) -> bool {
        !matches!(self, BinaryOp::Sub)
    }

    pub fn fold(self, lhs: i64, rhs: i64) -> i64 {
        match self {
            BinaryOp::Add => lhs.wrapping_add(rhs),
            BinaryOp::Sub => lhs.wrapping_sub(rhs),
            BinaryOp::Mul => lhs.wrapping_mul(rhs),
            BinaryOp::And => lhs & rhs,
            BinaryOp::Or => lhs | rhs,
            BinaryOp::Xor => lhs ^ rhs,
        }
    }
}

/// Right-hand side of an assignment.
#[derive(Debug, Clone, PartialEq)]
pub enum Rhs {
    Constant(i64),
    Global(String),
    Copy(Var),
    /// Read of word `offset` of the block `base` points to.
    Load { base: Var, offset: u32 },
    /// Fresh heap block of `words` 8-byte words.
    Alloc { words: u32 },
    Apply { func: Var, arg: Var },
    /// Consumes the comparison of the preceding [`Instruction::Compare`].
    Ternary {
        taken: Box<Scope>,
        not_taken: Box<Scope>,
    },
    Unary { op: UnaryOp, operand: Var },
    Binary { op: BinaryOp, lhs: Var, rhs: Var },
}

impl Rhs {
    /// Values read directly by this right-hand side, in operand order.
    ///
    /// The arms of a ternary are scopes of their own and are not included.
    pub fn operands(&self) -> impl Iterator<Item = Var> {
        let (a, b) = match *self {
            Rhs::Copy(v) => (Some(v), None),
            Rhs::Load { base, .. } => (Some(base), None),
            Rhs::Apply { func, arg } => (Some(func), Some(arg)),
            Rhs::Unary { operand, .. } => (Some(operand), None),
            Rhs::Binary { lhs, rhs, .. } => (Some(lhs), Some(rhs)),
            Rhs::Constant(_) | Rhs::Global(_) | Rhs::Alloc { .. } | Rhs::Ternary { .. } => {
                (None, None)
            }
        };
        a.into_iter().chain(b)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Rhs::Constant(_) => "constant",
            Rhs::Global(_) => "global",
            Rhs::Copy(_) => "copy",
            Rhs::Load { .. } => "load",
            Rhs::Alloc { .. } => "alloc",
            Rhs::Apply { .. } => "apply",
            Rhs::Ternary { .. } => "ternary",
            Rhs::Unary { .. } => "unary",
            Rhs::Binary { .. } => "binary",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    Assign { dst: Var, rhs: Rhs },
    /// Initialising store into a block fresh from [`Rhs::Alloc`]. Ownership
    /// of `src` moves into the block.
    WriteUninitializedMemory { base: Var, offset: u32, src: Var },
    Compare { lhs: Var, rhs: Var, cond: Cond },
}

impl Instruction {
    pub fn operands(&self) -> impl Iterator<Item = Var> + '_ {
        let (direct, rhs) = match self {
            Instruction::Assign { rhs, .. } => ([None, None], Some(rhs)),
            Instruction::WriteUninitializedMemory { base, src, .. } => {
                ([Some(*base), Some(*src)], None)
            }
            Instruction::Compare { lhs, rhs, .. } => ([Some(*lhs), Some(*rhs)], None),
        };
        direct
            .into_iter()
            .flatten()
            .chain(rhs.into_iter().flat_map(Rhs::operands))
    }

    pub fn dst(&self) -> Option<Var> {
        match self {
            Instruction::Assign { dst, .. } => Some(*dst),
            _ => None,
        }
    }
}

/// Ordered instruction list with its return value and release schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct Scope {
    pub instructions: Vec<Instruction>,
    pub ret: Var,
    /// `destroys[i]` lists the values whose ownership ends at instruction
    /// `i`: operands of `i` are consumed by it, anything else is released
    /// just before it. `destroys[len]` is released on the return edge.
    pub destroys: Vec<Vec<Var>>,
    /// Whether `ret` is owned by this scope and moves out, or is still live
    /// in an enclosing scope and has to be copied.
    pub moves_ret: bool,
}

impl Scope {
    pub fn new(instructions: Vec<Instruction>, ret: Var) -> Self {
        let slots = instructions.len() + 1;
        Self {
            instructions,
            ret,
            destroys: vec![Vec::new(); slots],
            moves_ret: true,
        }
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub(crate) fn reset_destroys(&mut self) {
        self.destroys = vec![Vec::new(); self.instructions.len() + 1];
        self.moves_ret = true;
    }
}

/// Unit of independent compilation.
#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub name: String,
    pub params: Vec<Var>,
    pub body: Scope,
    /// Destroy class of every value, indexed by [`Var::index`].
    pub classes: Vec<DestroyClass>,
    /// Source names, for printing.
    pub names: Vec<Option<String>>,
}

impl Function {
    pub fn var_count(&self) -> usize {
        self.classes.len()
    }

    pub fn class(&self, var: Var) -> DestroyClass {
        self.classes
            .get(var.index())
            .copied()
            .unwrap_or(DestroyClass::VALUE)
    }

    pub fn var_name(&self, var: Var) -> String {
        match self.names.get(var.index()) {
            Some(Some(name)) => name.clone(),
            _ => format!("v{}", var.0),
        }
    }
}

/// A compilation unit: functions plus the static objects they refer to.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Module {
    pub functions: Vec<Function>,
    pub statics: Vec<StaticObject>,
}

impl Module {
    pub fn parse(text: &str) -> crate::core::CompileResult<Self> {
        parser::parse_module(text)
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }
}
