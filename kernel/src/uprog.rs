//! User programs: the instruction set and a small assembler.
//!
//! The cluster shares one read-only code image (the same binaries
//! installed on every node) and a trapframe's `eip` is an index into
//! it, so register state migrates between nodes without shipping code.
//! [`Asm`] builds an image out of straight-line pieces with forward
//! and backward jumps; tests use it the way the original system used
//! its user programs.

use alloc::sync::Arc;
use alloc::vec::Vec;

/// General-purpose register names, matching the syscall ABI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reg {
    Eax,
    Ebx,
    Ecx,
    Edx,
    Esi,
    Edi,
    Ebp,
    Esp,
}

/// One user instruction. Branch targets are absolute instruction
/// indices; `eip` arithmetic is in whole instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UInsn {
    /// Load immediate.
    Li(Reg, u32),
    Mov(Reg, Reg),
    Add(Reg, Reg),
    AddI(Reg, u32),
    Sub(Reg, Reg),
    AndI(Reg, u32),
    /// Unsigned divide; traps on a zero divisor.
    Div(Reg, Reg),
    /// Load word from the address in the second register.
    Ldw(Reg, Reg),
    /// Store word to the address in the second register.
    Stw(Reg, Reg),
    Ldb(Reg, Reg),
    Stb(Reg, Reg),
    /// Atomically exchange the register with the addressed word.
    Xchg(Reg, Reg),
    Jmp(u32),
    Beq(Reg, Reg, u32),
    Bne(Reg, Reg, u32),
    /// Spin-wait hint; a no-op.
    Pause,
    /// Enter the kernel; the command word is in eax.
    Syscall,
    /// Not a legal user instruction; traps.
    Halt,
}

/// The cluster-wide read-only instruction image.
pub struct CodeImage {
    insns: Vec<UInsn>,
}

impl CodeImage {
    #[inline]
    pub fn fetch(&self, eip: u32) -> Option<UInsn> {
        self.insns.get(eip as usize).copied()
    }

    pub fn len(&self) -> usize {
        self.insns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insns.is_empty()
    }
}

/// An unresolved forward branch, to be patched when its target is
/// reached.
#[derive(Debug)]
#[must_use = "unpatched forward branches jump nowhere"]
pub struct Fixup(usize);

/// Straight-line assembler over [`UInsn`].
pub struct Asm {
    insns: Vec<UInsn>,
}

impl Asm {
    pub fn new() -> Self {
        Asm { insns: Vec::new() }
    }

    /// Current position: the index of the next instruction emitted.
    pub fn here(&self) -> u32 {
        self.insns.len() as u32
    }

    fn emit(&mut self, i: UInsn) {
        self.insns.push(i);
    }

    pub fn li(&mut self, r: Reg, v: u32) {
        self.emit(UInsn::Li(r, v));
    }

    pub fn mov(&mut self, d: Reg, s: Reg) {
        self.emit(UInsn::Mov(d, s));
    }

    pub fn add(&mut self, d: Reg, s: Reg) {
        self.emit(UInsn::Add(d, s));
    }

    pub fn addi(&mut self, d: Reg, v: u32) {
        self.emit(UInsn::AddI(d, v));
    }

    pub fn sub(&mut self, d: Reg, s: Reg) {
        self.emit(UInsn::Sub(d, s));
    }

    pub fn andi(&mut self, d: Reg, v: u32) {
        self.emit(UInsn::AndI(d, v));
    }

    pub fn div(&mut self, d: Reg, s: Reg) {
        self.emit(UInsn::Div(d, s));
    }

    pub fn ldw(&mut self, r: Reg, addr: Reg) {
        self.emit(UInsn::Ldw(r, addr));
    }

    pub fn stw(&mut self, r: Reg, addr: Reg) {
        self.emit(UInsn::Stw(r, addr));
    }

    pub fn ldb(&mut self, r: Reg, addr: Reg) {
        self.emit(UInsn::Ldb(r, addr));
    }

    pub fn stb(&mut self, r: Reg, addr: Reg) {
        self.emit(UInsn::Stb(r, addr));
    }

    pub fn xchg(&mut self, r: Reg, addr: Reg) {
        self.emit(UInsn::Xchg(r, addr));
    }

    pub fn pause(&mut self) {
        self.emit(UInsn::Pause);
    }

    pub fn syscall(&mut self) {
        self.emit(UInsn::Syscall);
    }

    pub fn halt(&mut self) {
        self.emit(UInsn::Halt);
    }

    /// Backward (or known-target) jump.
    pub fn jmp_to(&mut self, target: u32) {
        self.emit(UInsn::Jmp(target));
    }

    pub fn beq_to(&mut self, a: Reg, b: Reg, target: u32) {
        self.emit(UInsn::Beq(a, b, target));
    }

    pub fn bne_to(&mut self, a: Reg, b: Reg, target: u32) {
        self.emit(UInsn::Bne(a, b, target));
    }

    /// Forward jump; patch with [`Asm::patch_here`].
    pub fn jmp_fwd(&mut self) -> Fixup {
        let at = self.insns.len();
        self.emit(UInsn::Jmp(u32::MAX));
        Fixup(at)
    }

    pub fn beq_fwd(&mut self, a: Reg, b: Reg) -> Fixup {
        let at = self.insns.len();
        self.emit(UInsn::Beq(a, b, u32::MAX));
        Fixup(at)
    }

    pub fn bne_fwd(&mut self, a: Reg, b: Reg) -> Fixup {
        let at = self.insns.len();
        self.emit(UInsn::Bne(a, b, u32::MAX));
        Fixup(at)
    }

    /// Point a forward branch at the current position.
    pub fn patch_here(&mut self, fx: Fixup) {
        let target = self.here();
        match &mut self.insns[fx.0] {
            UInsn::Jmp(t) | UInsn::Beq(_, _, t) | UInsn::Bne(_, _, t) => *t = target,
            other => panic!("patching a non-branch instruction {other:?}"),
        }
    }

    /// Load the command word and trap into the kernel.
    pub fn sys(&mut self, cmd: u32) {
        self.li(Reg::Eax, cmd);
        self.syscall();
    }

    /// `RET`: return to the parent.
    pub fn sys_ret(&mut self) {
        self.sys(crate::syscall::SYS_RET);
    }

    /// `CPUTS` of the NUL-terminated string at `buf`.
    pub fn sys_cputs(&mut self, buf: u32) {
        self.li(Reg::Ebx, buf);
        self.sys(crate::syscall::SYS_CPUTS);
    }

    pub fn build(self) -> Arc<CodeImage> {
        Arc::new(CodeImage { insns: self.insns })
    }
}

impl Default for Asm {
    fn default() -> Self {
        Self::new()
    }
}
