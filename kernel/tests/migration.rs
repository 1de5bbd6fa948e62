//! Cross-node migration: a process bounces between two nodes, printing
//! from memory that follows it over the wire, and comes home to stop.

mod common;

use common::{init_logger, U};
use kernel::cluster::Cluster;
use kernel::node::NodeConfig;
use kernel::process::State;
use kernel::syscall::*;
use kernel::uprog::{Asm, Reg};

/// The `testmigr` program: hop to node 2, print, hop home, print,
/// twice over, then return to the parent.
fn build_testmigr(asm: &mut Asm) -> u32 {
    let entry = asm.here();
    for (node, msg_off) in [(2u32, 0u32), (1, 256), (2, 512), (1, 768)] {
        // A GET aimed at another node is a pure migration: child slot
        // 0 holds nothing and no flags are set.
        asm.li(Reg::Edx, node << 8);
        asm.li(Reg::Ebx, 0);
        asm.li(Reg::Esi, 0);
        asm.li(Reg::Edi, 0);
        asm.li(Reg::Ecx, 0);
        asm.sys(SYS_GET);
        asm.sys_cputs(U + msg_off);
    }
    asm.sys_ret();
    entry
}

fn strings_page() -> [u8; 1024] {
    let mut page = [0u8; 1024];
    page[0..4].copy_from_slice(b"2a\n\0");
    page[256..260].copy_from_slice(b"1a\n\0");
    page[512..516].copy_from_slice(b"2b\n\0");
    page[768..772].copy_from_slice(b"1b\n\0");
    page
}

fn check_migration_cycle(cluster: &mut Cluster, entry: u32, max_steps: u64) {
    let node1 = cluster.node(1).clone();
    let node2 = cluster.node(2).clone();

    let root = node1.spawn_root(entry);
    node1.map_image(root, U, &strings_page(), false);

    cluster.run_until(|c| c.node(1).halted(), max_steps);

    // All four prints happened, in order, on the right consoles.
    assert_eq!(node2.console_take(), "2a\n2b\n");
    assert_eq!(node1.console_take(), "1a\n1b\n");

    // The process ended back home, stopped; its guest incarnation on
    // node 2 stayed behind as an AWAY shell with cached pages.
    assert_eq!(node1.state_of(root), State::Stop);
    let guests: Vec<_> = (1..8u16)
        .filter(|&p| node2.state_of(p) == State::Away)
        .collect();
    assert_eq!(guests.len(), 1, "exactly one guest process on node 2");
    assert!(
        node2.mem.rr_tracked() > 0,
        "node 2 keeps pulled pages only as cached remote-reference copies"
    );
}

#[test]
fn migration_cycle_two_nodes() {
    init_logger();
    let mut asm = Asm::new();
    let entry = build_testmigr(&mut asm);
    let mut cluster = Cluster::new(2, NodeConfig::default(), asm.build());
    check_migration_cycle(&mut cluster, entry, 50_000);
}

/// The protocol survives losing frames: the periodic tick retransmits
/// migration requests and pull requests until acknowledged.
#[test]
fn migration_survives_frame_loss() {
    init_logger();
    let mut asm = Asm::new();
    let entry = build_testmigr(&mut asm);
    let mut cluster = Cluster::new(2, NodeConfig::default(), asm.build());

    // Deterministically lose the first frame of every four.
    let mut n = 0u32;
    cluster.hub().set_drop_hook(Box::new(move |_| {
        n += 1;
        n % 4 == 1
    }));

    check_migration_cycle(&mut cluster, entry, 2_000_000);
    assert!(cluster.hub().frames_dropped() > 0);
}
