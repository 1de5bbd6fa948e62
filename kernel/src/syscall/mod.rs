//! The rendezvous call interface: CPUTS, PUT, GET, RET.
//!
//! The command word in `eax` selects the call type, a memory
//! operation, and flags; `edx` carries `(node << 8) | child slot`,
//! `ebx` the register-struct pointer, `esi`/`edi` source and
//! destination addresses, `ecx` the byte count.
//!
//! Every user error (bad address, misaligned region, invalid flag
//! combination) is reflected to the caller's parent as a synthetic
//! processor trap, never silently dropped and never fatal to the
//! kernel. A call that names another node migrates there first and
//! re-executes on arrival.

pub mod usercopy;

use crate::memory::address_space::{copy, merge, remove, setperm, snapshot};
use crate::memory::layout::{pgoff, ptoff, Va, USER_HI, USER_LO};
use crate::memory::paging::{rr_node, PteFlags, MAX_NODES};
use crate::node::Node;
use crate::process::{Flow, ProcId, State};
use crate::trap::{Fault, ProcState, Trapframe, FL_IF, FL_USER, PROCSTATE_SIZE, T_GPFLT};

pub const SYS_TYPE_MASK: u32 = 0x3;
pub const SYS_CPUTS: u32 = 0;
pub const SYS_PUT: u32 = 1;
pub const SYS_GET: u32 = 2;
pub const SYS_RET: u32 = 3;

pub const SYS_MEMOP_MASK: u32 = 0xC;
pub const SYS_COPY: u32 = 0x4;
pub const SYS_ZERO: u32 = 0x8;
pub const SYS_MERGE: u32 = 0xC;

pub const SYS_REGS: u32 = 0x10;
pub const SYS_PERM: u32 = 0x20;
pub const SYS_READ: u32 = 0x40;
pub const SYS_WRITE: u32 = 0x80;
pub const SYS_RW: u32 = SYS_READ | SYS_WRITE;
pub const SYS_SNAP: u32 = 0x100;
pub const SYS_START: u32 = 0x200;

/// Console writes are bounded; longer strings truncate.
pub const CPUTS_MAX: usize = 256;

/// Nominal permission bits of a command word. Write implies read.
fn perm_flags(cmd: u32) -> PteFlags {
    if cmd & SYS_WRITE != 0 {
        PteFlags::SYS_RW
    } else if cmd & SYS_READ != 0 {
        PteFlags::SYS_READ
    } else {
        PteFlags::empty()
    }
}

/// A page-aligned region inside the user window, wrap-safe.
fn check_page_span(va: Va, size: u32) -> Result<(), Fault> {
    if pgoff(va) != 0 || pgoff(size) != 0 {
        return Err(Fault::GeneralProtection);
    }
    let end = va.checked_add(size).ok_or(Fault::GeneralProtection)?;
    if va < USER_LO || va > USER_HI || end > USER_HI {
        return Err(Fault::GeneralProtection);
    }
    Ok(())
}

/// COPY and MERGE work on whole page-table spans.
fn check_table_span(va: Va, size: u32) -> Result<(), Fault> {
    check_page_span(va, size)?;
    if ptoff(va) != 0 || ptoff(size) != 0 {
        return Err(Fault::GeneralProtection);
    }
    Ok(())
}

impl Node {
    /// Decode and run one system call for the current process. The
    /// trapframe is live; `eip` already points past the syscall
    /// instruction.
    pub(crate) fn syscall_dispatch(&self, cur: ProcId, tf: &mut Trapframe) -> Flow {
        let cmd = tf.regs.eax;
        match cmd & SYS_TYPE_MASK {
            SYS_CPUTS => self.do_cputs(cur, tf),
            SYS_PUT => self.do_put(cur, tf, cmd),
            SYS_GET => self.do_get(cur, tf, cmd),
            SYS_RET => self.proc_ret(cur, tf, 1),
            _ => unreachable!(),
        }
    }

    /// Abort the syscall, reflecting a synthetic trap to the parent.
    /// The entry-0 save leaves `eip` on the offending instruction.
    pub(crate) fn systrap(&self, cur: ProcId, tf: &mut Trapframe, trapno: u32) -> Flow {
        tf.trapno = trapno;
        tf.err = 0;
        self.proc_ret(cur, tf, 0)
    }

    fn reflect(&self, cur: ProcId, tf: &mut Trapframe, fault: Fault) -> Flow {
        self.systrap(cur, tf, fault.trapno())
    }

    fn do_cputs(&self, cur: ProcId, tf: &mut Trapframe) -> Flow {
        let pdir = self.procs.get(cur).pdir;
        let mut buf = [0u8; CPUTS_MAX];
        if let Err(f) = usercopy::copy_from_user(&self.mem, pdir, tf.regs.ebx, &mut buf) {
            return self.reflect(cur, tf, f);
        }
        let len = buf.iter().position(|&b| b == 0).unwrap_or(CPUTS_MAX);
        self.console_write(&buf[..len]);
        log::debug!(
            "node {}: cputs from proc {}: {:?}",
            self.id(),
            cur,
            core::str::from_utf8(&buf[..len]).unwrap_or("<non-utf8>")
        );
        Flow::Resume
    }

    /// Resolve the node half of a child index: zero targets the
    /// process's home.
    fn target_node(&self, cur: ProcId, cidx: u32) -> u8 {
        let node = ((cidx >> 8) & 0xff) as u8;
        if node == 0 {
            rr_node(self.procs.get(cur).home)
        } else {
            node
        }
    }

    fn do_put(&self, cur: ProcId, tf: &mut Trapframe, cmd: u32) -> Flow {
        let dstnode = self.target_node(cur, tf.regs.edx);
        if dstnode != self.id() {
            if dstnode < 1 || dstnode > MAX_NODES {
                return self.systrap(cur, tf, T_GPFLT);
            }
            // Not resumed here; the call re-executes on the target.
            return self.net_migrate(cur, tf, dstnode, 0);
        }

        let cslot = (tf.regs.edx & 0xff) as usize;
        let child = self.procs.get(cur).child[cslot];
        let child = if child == 0 {
            match self.proc_alloc(cur, cslot) {
                Some(c) => c,
                None => return self.reflect(cur, tf, Fault::PageFault(tf.regs.edi)),
            }
        } else {
            child
        };
        if self.procs.get(child).state != State::Stop {
            return self.proc_wait(cur, child, tf);
        }

        let pdir = self.procs.get(cur).pdir;
        let (child_pdir, child_rpdir) = {
            let c = self.procs.get(child);
            (c.pdir, c.rpdir)
        };

        if cmd & SYS_REGS != 0 {
            let mut buf = [0u8; PROCSTATE_SIZE];
            if let Err(f) = usercopy::copy_from_user(&self.mem, pdir, tf.regs.ebx, &mut buf) {
                return self.reflect(cur, tf, f);
            }
            let st = ProcState::decode(&buf);
            let mut c = self.procs.get(child);
            c.sv = st;
            c.sv.tf.eflags = (st.tf.eflags & FL_USER) | FL_IF;
        }

        let src = tf.regs.esi;
        let dst = tf.regs.edi;
        let size = tf.regs.ecx;

        match cmd & SYS_MEMOP_MASK {
            0 => {}
            SYS_COPY => {
                if let Err(f) = check_table_span(src, size).and(check_table_span(dst, size)) {
                    return self.reflect(cur, tf, f);
                }
                if size > 0 && !copy(&self.mem, pdir, src, child_pdir, dst, size) {
                    return self.reflect(cur, tf, Fault::PageFault(dst));
                }
            }
            SYS_ZERO => {
                if let Err(f) = check_page_span(dst, size) {
                    return self.reflect(cur, tf, f);
                }
                if size > 0 && !remove(&self.mem, child_pdir, dst, size) {
                    return self.reflect(cur, tf, Fault::PageFault(dst));
                }
            }
            _ => {
                // MERGE goes the other way; it has no meaning in PUT.
                return self.systrap(cur, tf, T_GPFLT);
            }
        }

        if cmd & SYS_PERM != 0 {
            if let Err(f) = check_page_span(dst, size) {
                return self.reflect(cur, tf, f);
            }
            if size > 0 && !setperm(&self.mem, child_pdir, dst, size, perm_flags(cmd)) {
                return self.reflect(cur, tf, Fault::PageFault(dst));
            }
        }

        if cmd & SYS_SNAP != 0 && !snapshot(&self.mem, child_pdir, child_rpdir) {
            return self.reflect(cur, tf, Fault::PageFault(USER_LO));
        }

        if cmd & SYS_START != 0 {
            self.proc_ready(child);
        }

        Flow::Resume
    }

    fn do_get(&self, cur: ProcId, tf: &mut Trapframe, cmd: u32) -> Flow {
        let dstnode = self.target_node(cur, tf.regs.edx);
        if dstnode != self.id() {
            if dstnode < 1 || dstnode > MAX_NODES {
                return self.systrap(cur, tf, T_GPFLT);
            }
            return self.net_migrate(cur, tf, dstnode, 0);
        }

        if cmd & SYS_SNAP != 0 {
            // Snapshots are taken through PUT only.
            return self.systrap(cur, tf, T_GPFLT);
        }

        let cslot = (tf.regs.edx & 0xff) as usize;
        let child = self.procs.get(cur).child[cslot];
        let child = if child == 0 {
            // A never-touched slot reads as an empty stopped child.
            match self.proc_alloc(cur, cslot) {
                Some(c) => c,
                None => return self.reflect(cur, tf, Fault::PageFault(tf.regs.edi)),
            }
        } else {
            child
        };
        if self.procs.get(child).state != State::Stop {
            return self.proc_wait(cur, child, tf);
        }

        let pdir = self.procs.get(cur).pdir;
        let (child_pdir, child_rpdir) = {
            let c = self.procs.get(child);
            (c.pdir, c.rpdir)
        };

        let src = tf.regs.esi;
        let dst = tf.regs.edi;
        let size = tf.regs.ecx;

        match cmd & SYS_MEMOP_MASK {
            0 => {}
            SYS_COPY => {
                if let Err(f) = check_table_span(src, size).and(check_table_span(dst, size)) {
                    return self.reflect(cur, tf, f);
                }
                if size > 0 && !copy(&self.mem, child_pdir, src, pdir, dst, size) {
                    return self.reflect(cur, tf, Fault::PageFault(dst));
                }
            }
            SYS_MERGE => {
                if let Err(f) = check_table_span(src, size).and(check_table_span(dst, size)) {
                    return self.reflect(cur, tf, f);
                }
                if size > 0 && !merge(&self.mem, child_rpdir, child_pdir, src, pdir, dst, size) {
                    return self.reflect(cur, tf, Fault::PageFault(dst));
                }
            }
            SYS_ZERO => {
                if let Err(f) = check_page_span(dst, size) {
                    return self.reflect(cur, tf, f);
                }
                if size > 0 && !remove(&self.mem, pdir, dst, size) {
                    return self.reflect(cur, tf, Fault::PageFault(dst));
                }
            }
            _ => unreachable!(),
        }

        if cmd & SYS_PERM != 0 {
            if let Err(f) = check_page_span(dst, size) {
                return self.reflect(cur, tf, f);
            }
            if size > 0 && !setperm(&self.mem, pdir, dst, size, perm_flags(cmd)) {
                return self.reflect(cur, tf, Fault::PageFault(dst));
            }
        }

        if cmd & SYS_REGS != 0 {
            let st = self.procs.get(child).sv;
            if let Err(f) = usercopy::copy_to_user(&self.mem, pdir, tf.regs.ebx, &st.encode()) {
                return self.reflect(cur, tf, f);
            }
        }

        Flow::Resume
    }
}
