//! Page-table entry flags and remote references.
//!
//! Both levels of the page table use the same 32-bit entry format: the
//! high 20 bits name a page frame, the low 12 carry flags. Hardware
//! flags (`P`/`W`/`U`) gate what the user-mode executor may do; the
//! nominal `SYS_READ`/`SYS_WRITE` bits record what the parent granted.
//! Clearing `W` underneath `SYS_WRITE` is what makes a mapping
//! copy-on-write: the first store faults, the fault handler copies.
//!
//! An entry with the `REMOTE` bit set is not a mapping at all but a
//! *remote reference*: `{node, page address, rw bits}` packed into the
//! same word, naming a page on the node that owns it.

use bitflags::bitflags;

use super::layout::{pgaddr, Pa};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u32 {
        /// Present.
        const P = 1 << 0;
        /// Hardware-writable.
        const W = 1 << 1;
        /// User-accessible.
        const U = 1 << 2;
        /// Accessed.
        const A = 1 << 5;
        /// Dirty.
        const D = 1 << 6;
        /// Large page (kernel identity entries only).
        const PS = 1 << 7;
        /// Global: kernel entry, never shipped or freed.
        const G = 1 << 8;
        /// Nominal read permission.
        const SYS_READ = 1 << 9;
        /// Nominal write permission. Implies `SYS_READ`.
        const SYS_WRITE = 1 << 10;
        /// The entry is a remote reference, not a local mapping.
        const REMOTE = 1 << 11;
    }
}

impl PteFlags {
    pub const SYS_RW: PteFlags = PteFlags::SYS_READ.union(PteFlags::SYS_WRITE);
}

/// A page table entry (or page directory entry) as a raw word.
pub type Pte = u32;

/// A remote reference packed into an entry word: node id in bits
/// 31..24, page address in bits 23..12, `SYS_RW` permission bits, and
/// `REMOTE` set. Node 0 with address 0 is a permission-only reference
/// that resolves to the zero sentinel.
pub type Rr = u32;

/// The zero-sentinel mapping: frame 1 of the arena, no flags. Reads
/// through a present zero mapping observe zeros; the frame itself is
/// never written.
pub const PTE_ZERO: Pte = super::ZERO_PAGE;

/// Nodes are numbered 1..=MAX_NODES; the share mask has one bit each.
pub const MAX_NODES: u8 = 8;

const RR_ADDR_MASK: u32 = 0x00FF_F000;

/// Construct a remote reference. `addr` must fit the 12-bit frame
/// number field, which bounds a node's arena at 16 MiB.
#[inline]
pub fn rr_cons(node: u8, addr: Pa, rw: PteFlags) -> Rr {
    debug_assert_eq!(addr & !RR_ADDR_MASK, 0, "page address out of RR range");
    ((node as u32) << 24)
        | (addr & RR_ADDR_MASK)
        | (rw & PteFlags::SYS_RW).bits()
        | PteFlags::REMOTE.bits()
}

#[inline]
pub fn rr_node(rr: Rr) -> u8 {
    (rr >> 24) as u8
}

#[inline]
pub fn rr_addr(rr: Rr) -> Pa {
    rr & RR_ADDR_MASK
}

/// Cache key for a remote reference: node and address, permission bits
/// ignored.
#[inline]
pub fn rr_key(rr: Rr) -> u32 {
    rr & !0xFFF
}

/// Flag bits of an entry word.
#[inline]
pub fn flags(e: Pte) -> PteFlags {
    PteFlags::from_bits_truncate(e)
}

/// True if the entry is exactly the empty zero-sentinel entry.
#[inline]
pub fn is_empty(e: Pte) -> bool {
    e == PTE_ZERO
}

/// True if the entry maps the zero sentinel (with whatever flags).
#[inline]
pub fn maps_zero(e: Pte) -> bool {
    pgaddr(e) == PTE_ZERO
}
