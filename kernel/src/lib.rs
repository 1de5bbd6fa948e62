//! Pangaea: a distributed, deterministic-parallel kernel core.
//!
//! The core implements a hierarchical process model with synchronous
//! put/get/ret rendezvous, copy-on-write address spaces with
//! snapshot/three-way-merge reconciliation, and cross-node process
//! migration with demand page pull over an Ethernet-like transport.
//!
//! Boot, device drivers and the ELF loader are out of scope; in their
//! place the crate carries a precise model of the hardware contract:
//! per-node physical page arenas, two-level page tables honored on every
//! user memory access, and a deterministic user-mode executor. Nodes are
//! in-process [`node::Node`] values wired together by a
//! [`cluster::Cluster`] over an in-memory Ethernet hub, which is what
//! lets the whole protocol stack run under `cargo test`.

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

pub mod cluster;
pub mod memory;
pub mod net;
pub mod node;
pub mod process;
pub mod syscall;
pub mod trap;
pub mod umode;
pub mod uprog;

#[cfg(feature = "std")]
pub mod logger;

pub use cluster::Cluster;
pub use node::{Node, NodeConfig};
