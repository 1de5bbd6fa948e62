//! Trap reflection: user errors surface to the parent as synthetic
//! traps with the faulting instruction pointer preserved.

mod common;

use common::{init_logger, state_entering, SREGS, U};
use kernel::cluster::Cluster;
use kernel::memory::address_space::va2pa;
use kernel::memory::layout::{PTSIZE, USER_HI};
use kernel::process::State;
use kernel::syscall::*;
use kernel::trap::{T_DIVIDE, T_GPFLT, T_PGFLT, T_SYSCALL};
use kernel::uprog::{Asm, Reg};

/// Scenario: a child divides by zero; the parent reads the trapped
/// state, points the child at a recovery routine, and restarts it.
#[test]
fn divide_trap_reflects_and_recovers() {
    init_logger();
    let mut asm = Asm::new();

    let child_entry = asm.here();
    asm.li(Reg::Esi, 1);
    asm.li(Reg::Edi, 0);
    let div_ip = asm.here();
    asm.div(Reg::Esi, Reg::Edi);
    asm.halt(); // never reached

    let handler = asm.here();
    asm.sys_ret();

    let parent_entry = asm.here();
    asm.li(Reg::Edx, 0);
    asm.li(Reg::Ebx, SREGS);
    asm.sys(SYS_PUT | SYS_REGS | SYS_START);
    // Blocks until the child stops on the divide trap, then reads its
    // state into the staging page.
    asm.sys(SYS_GET | SYS_REGS);
    // Keep the trapped eip (word 8 of the image) as evidence in a
    // spare word, then patch it to the handler and restart the child.
    asm.li(Reg::Ebp, SREGS + 32);
    asm.ldw(Reg::Esi, Reg::Ebp);
    asm.li(Reg::Ebp, SREGS + 60);
    asm.stw(Reg::Esi, Reg::Ebp);
    asm.li(Reg::Ebp, SREGS + 32);
    asm.li(Reg::Esi, handler);
    asm.stw(Reg::Esi, Reg::Ebp);
    asm.sys(SYS_PUT | SYS_REGS | SYS_START);
    asm.sys(SYS_GET); // wait for the clean stop
    asm.sys_ret();

    let mut cluster = Cluster::new_single(asm.build());
    let node = cluster.node(1).clone();
    let root = node.spawn_root(parent_entry);
    node.map_image(root, SREGS, &state_entering(child_entry), true);

    cluster.run_until(|c| c.node(1).halted(), 100_000);

    // The state the parent read back mid-run shows the divide trap at
    // the faulting instruction.
    let pdir = node.pdir_of(root);
    let pa = va2pa(&node.mem, pdir, SREGS).expect("staging page unmapped");
    assert_eq!(node.mem.read_u32(pa + 40), T_DIVIDE); // trapno word
    assert_eq!(node.mem.read_u32(pa + 60), div_ip); // stashed trapped eip

    // After the restart through the handler, the child stopped via a
    // clean RET.
    let child = node.child_of(root, 0);
    assert_eq!(node.state_of(child), State::Stop);
    assert_eq!(node.saved_state(child).tf.trapno, T_SYSCALL);
}

/// Each child makes one malformed call; the parent collects the
/// resulting synthetic traps.
#[test]
fn bad_regions_reflect_general_protection() {
    init_logger();
    let mut asm = Asm::new();

    // Case 0: destination aligned to pages but not to table spans.
    let c0 = asm.here();
    asm.li(Reg::Esi, U);
    asm.li(Reg::Edi, U + 0x1000);
    asm.li(Reg::Ecx, PTSIZE);
    asm.li(Reg::Edx, 0);
    let c0_trap = asm.here() + 1; // the syscall instruction itself
    asm.sys(SYS_PUT | SYS_COPY);
    asm.halt();

    // Case 1: region crosses the top of the user window.
    let c1 = asm.here();
    asm.li(Reg::Esi, U);
    asm.li(Reg::Edi, USER_HI - PTSIZE);
    asm.li(Reg::Ecx, 2 * PTSIZE);
    asm.li(Reg::Edx, 0);
    let c1_trap = asm.here() + 1;
    asm.sys(SYS_PUT | SYS_COPY);
    asm.halt();

    // Case 2: destination + size wraps 32 bits.
    let c2 = asm.here();
    asm.li(Reg::Esi, U);
    asm.li(Reg::Edi, 0xFFC0_0000);
    asm.li(Reg::Ecx, PTSIZE);
    asm.li(Reg::Edx, 0);
    let c2_trap = asm.here() + 1;
    asm.sys(SYS_PUT | SYS_COPY);
    asm.halt();

    // Case 3: MERGE is not a PUT operation.
    let c3 = asm.here();
    asm.li(Reg::Esi, U);
    asm.li(Reg::Edi, U);
    asm.li(Reg::Ecx, PTSIZE);
    asm.li(Reg::Edx, 0);
    let c3_trap = asm.here() + 1;
    asm.sys(SYS_PUT | SYS_MERGE);
    asm.halt();

    // Case 4: console write from an address whose 256-byte window
    // hangs off the end of user space.
    let c4 = asm.here();
    let c4_trap = asm.here() + 2; // li ebx; li eax; syscall
    asm.sys_cputs(USER_HI - 64);
    asm.halt();

    let entries = [c0, c1, c2, c3, c4];
    let traps = [c0_trap, c1_trap, c2_trap, c3_trap, c4_trap];
    let expected = [T_GPFLT, T_GPFLT, T_GPFLT, T_GPFLT, T_PGFLT];

    // Parent: start each child from its own staged image, then wait
    // for it to stop on the reflected trap.
    let parent_entry = asm.here();
    for (c, _) in entries.iter().enumerate() {
        asm.li(Reg::Edx, c as u32);
        asm.li(Reg::Ebx, SREGS + (c as u32) * 64);
        asm.sys(SYS_PUT | SYS_REGS | SYS_START);
        asm.sys(SYS_GET);
    }
    asm.sys_ret();

    let mut cluster = Cluster::new_single(asm.build());
    let node = cluster.node(1).clone();
    let root = node.spawn_root(parent_entry);

    // Stage all five state images in one page, 64 bytes apart.
    let mut staging = [0u8; 5 * 64];
    for (c, &entry) in entries.iter().enumerate() {
        staging[c * 64..c * 64 + 48].copy_from_slice(&state_entering(entry));
    }
    node.map_image(root, SREGS, &staging, true);

    cluster.run_until(|c| c.node(1).halted(), 100_000);

    for (c, (&trap_ip, &trapno)) in traps.iter().zip(expected.iter()).enumerate() {
        let child = node.child_of(root, c);
        assert_ne!(child, 0);
        assert_eq!(node.state_of(child), State::Stop, "child {c}");
        let sv = node.saved_state(child).tf;
        assert_eq!(sv.trapno, trapno, "child {c} trap number");
        assert_eq!(sv.eip, trap_ip, "child {c} faulting ip");
    }
}
