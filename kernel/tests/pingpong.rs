//! Rendezvous ping-pong: children take turns flipping a word the
//! parent ferries between their address spaces with PUT/GET copies.

mod common;

use common::{init_logger, state_entering, SREGS, U};
use kernel::cluster::Cluster;
use kernel::memory::address_space::va2pa;
use kernel::memory::layout::PTSIZE;
use kernel::node::NodeConfig;
use kernel::process::State;
use kernel::syscall::*;
use kernel::uprog::{Asm, Reg};

/// Child for the two-player game: each visit flips the word between 0
/// and 1, then stops so the parent can ferry it onward. Ten visits.
fn two_player_child(asm: &mut Asm) -> u32 {
    let entry = asm.here();
    asm.li(Reg::Ecx, 10);
    let round = asm.here();
    asm.li(Reg::Ebp, U);
    asm.ldw(Reg::Esi, Reg::Ebp);
    asm.li(Reg::Edx, 1);
    asm.sub(Reg::Edx, Reg::Esi);
    asm.stw(Reg::Edx, Reg::Ebp);
    asm.sys_ret();
    asm.addi(Reg::Ecx, u32::MAX); // ecx -= 1
    asm.li(Reg::Edi, 0);
    asm.bne_to(Reg::Ecx, Reg::Edi, round);
    asm.sys_ret();
    entry
}

/// Four-player variant: the word counts round-robin mod 4.
fn four_player_child(asm: &mut Asm) -> u32 {
    let entry = asm.here();
    asm.li(Reg::Ecx, 10);
    let round = asm.here();
    asm.li(Reg::Ebp, U);
    asm.ldw(Reg::Esi, Reg::Ebp);
    asm.addi(Reg::Esi, 1);
    asm.andi(Reg::Esi, 3);
    asm.stw(Reg::Esi, Reg::Ebp);
    asm.sys_ret();
    asm.addi(Reg::Ecx, u32::MAX);
    asm.li(Reg::Edi, 0);
    asm.bne_to(Reg::Ecx, Reg::Edi, round);
    asm.sys_ret();
    entry
}

/// Parent: create `n` children from the staged register image, then
/// ferry the shared span child to child for ten rounds.
fn ferry_parent(asm: &mut Asm, n: u32) -> u32 {
    let entry = asm.here();
    for c in 0..n {
        asm.li(Reg::Edx, c);
        asm.li(Reg::Ebx, SREGS);
        asm.sys(SYS_PUT | SYS_REGS);
    }
    asm.li(Reg::Ebp, 10);
    let round = asm.here();
    for c in 0..n {
        asm.li(Reg::Edx, c);
        asm.li(Reg::Esi, U);
        asm.li(Reg::Edi, U);
        asm.li(Reg::Ecx, PTSIZE);
        asm.sys(SYS_PUT | SYS_COPY | SYS_START);
        asm.sys(SYS_GET | SYS_COPY);
    }
    asm.addi(Reg::Ebp, u32::MAX);
    asm.li(Reg::Eax, 0);
    asm.bne_to(Reg::Ebp, Reg::Eax, round);
    asm.sys_ret();
    entry
}

fn run_game(children: u32, child_builder: fn(&mut Asm) -> u32, config: NodeConfig) {
    init_logger();
    let mut asm = Asm::new();
    let child_entry = child_builder(&mut asm);
    let parent_entry = ferry_parent(&mut asm, children);
    let mut cluster = Cluster::new(1, config, asm.build());

    let node = cluster.node(1).clone();
    let root = node.spawn_root(parent_entry);
    node.map_image(root, U, &[0u8; 4096], true);
    node.map_image(root, SREGS, &state_entering(child_entry), true);

    cluster.run_until(|c| c.node(1).halted(), 200_000);

    // Every child ran to completion and stopped cleanly.
    for c in 0..children as usize {
        let child = node.child_of(root, c);
        assert_ne!(child, 0, "child {c} never created");
        assert_eq!(node.state_of(child), State::Stop);
    }

    // 10 rounds times `children` flips lands the word back on zero.
    let pdir = node.pdir_of(root);
    let pa = va2pa(&node.mem, pdir, U).expect("ferry page unmapped");
    assert_eq!(node.mem.read_u32(pa), 0);
}

#[test]
fn two_children_pingpong() {
    run_game(2, two_player_child, NodeConfig::default());
}

#[test]
fn four_children_round_robin_on_two_cpus() {
    init_logger();
    let config = NodeConfig {
        ncpus: 2,
        ..NodeConfig::default()
    };
    let mut asm = Asm::new();
    let child_entry = four_player_child(&mut asm);
    let parent_entry = ferry_parent(&mut asm, 4);
    let mut cluster = Cluster::new(1, config, asm.build());

    let node = cluster.node(1).clone();
    let root = node.spawn_root(parent_entry);
    node.map_image(root, U, &[0u8; 4096], true);
    node.map_image(root, SREGS, &state_entering(child_entry), true);

    cluster.run_until(|c| c.node(1).halted(), 200_000);

    for c in 0..4 {
        let child = node.child_of(root, c);
        assert_eq!(node.state_of(child), State::Stop);
    }
    let pdir = node.pdir_of(root);
    let pa = va2pa(&node.mem, pdir, U).expect("ferry page unmapped");
    assert_eq!(node.mem.read_u32(pa), 0);

    // Four children multiplexed onto two CPUs cannot complete without
    // real context switching.
    assert!(node.context_switches() >= 4);
}

#[test]
fn single_cpu_still_completes() {
    // The direct-wake path: the one CPU bounces between parent and
    // child on every rendezvous.
    let config = NodeConfig {
        ncpus: 1,
        ..NodeConfig::default()
    };
    run_game(2, two_player_child, config);
}
