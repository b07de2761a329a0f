// This module pins down the calling convention shared by compiled functions and the runtime
// entry points. It is the System V AMD64 convention restricted to what the language needs:
// every function and runtime routine takes at most two integer arguments in RDI and RSI and
// returns its result in RAX. RAX, RCX, RDX, RSI, RDI and R8-R11 are caller-saved; RBX, RBP
// and R12-R15 are callee-saved and hold their entry-time contents until the epilogue puts
// them back. RSP is never allocated. The stack must be 16-byte aligned at every call; on
// entry RSP is 8 mod 16 because of the return address, so with n 8-byte slots pushed the
// stack is aligned exactly when n is odd.

//! System V x86-64 calling convention as used by generated code.

use super::register_file::{Reg, RegSet};

pub const CALLER_SAVED: RegSet = RegSet::of(&[
    Reg::Rax,
    Reg::Rcx,
    Reg::Rdx,
    Reg::Rsi,
    Reg::Rdi,
    Reg::R8,
    Reg::R9,
    Reg::R10,
    Reg::R11,
]);

pub const CALLEE_SAVED: RegSet = RegSet::of(&[
    Reg::Rbx,
    Reg::Rbp,
    Reg::R12,
    Reg::R13,
    Reg::R14,
    Reg::R15,
]);

/// Every register the allocator may hand out.
pub const ALLOCATABLE: RegSet = RegSet::of(&[
    Reg::Rax,
    Reg::Rcx,
    Reg::Rdx,
    Reg::Rbx,
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
]);

/// Integer argument registers in order.
pub const ARG_REGS: [Reg; 2] = [Reg::Rdi, Reg::Rsi];

pub const RESULT_REG: Reg = Reg::Rax;

pub fn is_callee_saved(reg: Reg) -> bool {
    CALLEE_SAVED.contains(reg)
}

/// Whether `call` may be emitted directly with `slots` 8-byte slots on the
/// stack.
pub fn stack_aligned(slots: usize) -> bool {
    slots % 2 == 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_classes_partition_allocatable() {
        assert!(CALLER_SAVED.intersect(CALLEE_SAVED).is_empty());
        assert_eq!(CALLER_SAVED.union(CALLEE_SAVED), ALLOCATABLE);
        assert!(!ALLOCATABLE.contains(Reg::Rsp));
        assert!(ARG_REGS.iter().all(|r| CALLER_SAVED.contains(*r)));
        assert!(is_callee_saved(Reg::Rbp));
    }

    #[test]
    fn test_alignment_parity() {
        assert!(!stack_aligned(0));
        assert!(stack_aligned(1));
        assert!(!stack_aligned(2));
    }
}
