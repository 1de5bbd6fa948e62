//! The user-mode executor.
//!
//! Stands in for ring-3 execution: runs a process's instructions
//! against its page directory, honoring the hardware present /
//! writable / user bits on every access exactly as an MMU would. A
//! store into a copy-on-write or zero mapping raises the write fault
//! into [`address_space::pagefault`] and retries; anything the fault
//! handler disowns suspends the process with the trap recorded in the
//! trapframe, instruction pointer still on the faulting instruction.

use crate::memory::address_space;
use crate::memory::layout::{pdx, pgaddr, pgoff, ptx, Pa, Va};
use crate::memory::paging::{flags, PteFlags};
use crate::node::Node;
use crate::trap::{Trapframe, T_DIVIDE, T_GPFLT, T_PGFLT, T_SYSCALL};
use crate::uprog::{Reg, UInsn};

/// Why control came back from user mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UExit {
    /// A syscall instruction; `eip` already points past it.
    Syscall,
    /// An unhandled trap; `trapno`/`err` are filled in and `eip` still
    /// points at the faulting instruction.
    Trap,
    /// The instruction budget ran out.
    Quantum,
}

#[inline]
fn get(tf: &Trapframe, r: Reg) -> u32 {
    match r {
        Reg::Eax => tf.regs.eax,
        Reg::Ebx => tf.regs.ebx,
        Reg::Ecx => tf.regs.ecx,
        Reg::Edx => tf.regs.edx,
        Reg::Esi => tf.regs.esi,
        Reg::Edi => tf.regs.edi,
        Reg::Ebp => tf.regs.ebp,
        Reg::Esp => tf.regs.esp,
    }
}

#[inline]
fn set(tf: &mut Trapframe, r: Reg, v: u32) {
    match r {
        Reg::Eax => tf.regs.eax = v,
        Reg::Ebx => tf.regs.ebx = v,
        Reg::Ecx => tf.regs.ecx = v,
        Reg::Edx => tf.regs.edx = v,
        Reg::Esi => tf.regs.esi = v,
        Reg::Edi => tf.regs.edi = v,
        Reg::Ebp => tf.regs.ebp = v,
        Reg::Esp => tf.regs.esp = v,
    }
}

/// MMU check: translate `va` for a user access, returning the physical
/// byte address. Permission bits at both levels are ANDed, as the
/// hardware does.
fn resolve(node: &Node, pdir: Pa, va: Va, write: bool) -> Option<Pa> {
    let pde = node.mem.read_entry(pdir, pdx(va));
    let f = flags(pde);
    if !f.contains(PteFlags::P) || f.contains(PteFlags::PS) || !f.contains(PteFlags::U) {
        return None;
    }
    if write && !f.contains(PteFlags::W) {
        return None;
    }
    let pte = node.mem.read_entry(pgaddr(pde), ptx(va));
    let f = flags(pte);
    if !f.contains(PteFlags::P) || !f.contains(PteFlags::U) {
        return None;
    }
    if write && !f.contains(PteFlags::W) {
        return None;
    }
    Some(pgaddr(pte) + pgoff(va))
}

fn user_read(node: &Node, pdir: Pa, va: Va) -> Result<Pa, u32> {
    resolve(node, pdir, va, false).ok_or(T_PGFLT)
}

/// Resolve a store, letting the copy-on-write fault handler have one
/// shot at it, as the hardware fault path would.
fn user_write(node: &Node, pdir: Pa, va: Va) -> Result<Pa, u32> {
    if let Some(pa) = resolve(node, pdir, va, true) {
        return Ok(pa);
    }
    if address_space::pagefault(&node.mem, pdir, va) {
        if let Some(pa) = resolve(node, pdir, va, true) {
            return Ok(pa);
        }
    }
    Err(T_PGFLT)
}

fn aligned_w(va: Va) -> Result<(), u32> {
    if va % 4 != 0 {
        return Err(T_GPFLT);
    }
    Ok(())
}

fn execute(node: &Node, pdir: Pa, tf: &mut Trapframe, insn: UInsn, next: &mut u32) -> Result<(), u32> {
    match insn {
        UInsn::Li(r, v) => set(tf, r, v),
        UInsn::Mov(d, s) => {
            let v = get(tf, s);
            set(tf, d, v);
        }
        UInsn::Add(d, s) => {
            let v = get(tf, d).wrapping_add(get(tf, s));
            set(tf, d, v);
        }
        UInsn::AddI(d, v) => {
            let v = get(tf, d).wrapping_add(v);
            set(tf, d, v);
        }
        UInsn::Sub(d, s) => {
            let v = get(tf, d).wrapping_sub(get(tf, s));
            set(tf, d, v);
        }
        UInsn::AndI(d, v) => {
            let v = get(tf, d) & v;
            set(tf, d, v);
        }
        UInsn::Div(d, s) => {
            let div = get(tf, s);
            if div == 0 {
                return Err(T_DIVIDE);
            }
            let v = get(tf, d) / div;
            set(tf, d, v);
        }
        UInsn::Ldw(r, a) => {
            let va = get(tf, a);
            aligned_w(va)?;
            let pa = user_read(node, pdir, va)?;
            let v = node.mem.read_u32(pa);
            set(tf, r, v);
        }
        UInsn::Stw(r, a) => {
            let va = get(tf, a);
            aligned_w(va)?;
            let pa = user_write(node, pdir, va)?;
            node.mem.write_u32(pa, get(tf, r));
        }
        UInsn::Ldb(r, a) => {
            let va = get(tf, a);
            let pa = user_read(node, pdir, va)?;
            let v = node.mem.read_u8(pa) as u32;
            set(tf, r, v);
        }
        UInsn::Stb(r, a) => {
            let va = get(tf, a);
            let pa = user_write(node, pdir, va)?;
            node.mem.write_u8(pa, get(tf, r) as u8);
        }
        UInsn::Xchg(r, a) => {
            let va = get(tf, a);
            aligned_w(va)?;
            let pa = user_write(node, pdir, va)?;
            let old = node.mem.read_u32(pa);
            node.mem.write_u32(pa, get(tf, r));
            set(tf, r, old);
        }
        UInsn::Jmp(t) => *next = t,
        UInsn::Beq(a, b, t) => {
            if get(tf, a) == get(tf, b) {
                *next = t;
            }
        }
        UInsn::Bne(a, b, t) => {
            if get(tf, a) != get(tf, b) {
                *next = t;
            }
        }
        UInsn::Pause => {}
        UInsn::Syscall => {}
        UInsn::Halt => return Err(T_GPFLT),
    }
    Ok(())
}

/// Run at most `*budget` instructions of the process whose live
/// trapframe is `tf`.
pub fn run(node: &Node, pdir: Pa, tf: &mut Trapframe, budget: &mut u32) -> UExit {
    loop {
        if *budget == 0 {
            return UExit::Quantum;
        }
        *budget -= 1;

        let insn = match node.code.fetch(tf.eip) {
            Some(i) => i,
            None => {
                tf.trapno = T_GPFLT;
                tf.err = 0;
                return UExit::Trap;
            }
        };

        let mut next = tf.eip.wrapping_add(1);
        match execute(node, pdir, tf, insn, &mut next) {
            Ok(()) => {}
            Err(trapno) => {
                tf.trapno = trapno;
                tf.err = 0;
                return UExit::Trap;
            }
        }

        if matches!(insn, UInsn::Syscall) {
            tf.eip = next;
            tf.trapno = T_SYSCALL;
            tf.err = 0;
            return UExit::Syscall;
        }
        tf.eip = next;
    }
}
