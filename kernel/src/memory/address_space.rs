//! Two-level page tables: walk, map, unmap, copy-on-write copy,
//! permissions, write-fault resolution, and snapshot/three-way merge.
//!
//! Page directories and page tables are ordinary frames of 1024 entry
//! words. Sharing works at both levels: `copy` shares whole page
//! tables between directories with the hardware-writable bit cleared
//! on both sides, and `walk(.., writing = true)` un-shares a table on
//! demand, pushing the write protection down one level. There is no
//! TLB in the model, so the invalidation points of a real MMU
//! disappear; everything else keeps real-hardware semantics.

use alloc::vec;
use alloc::vec::Vec;

use super::frame_metadata::FrameKind;
use super::layout::*;
use super::paging::{flags, PteFlags, Pte, PTE_ZERO};
use super::PhysMem;

/// A handle to one entry of a page table or directory: the frame that
/// holds the table plus the entry index. All access goes through the
/// arena, so holding a slot never borrows the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PteSlot {
    pub table: Pa,
    pub idx: usize,
}

impl PteSlot {
    #[inline]
    pub fn get(self, mem: &PhysMem) -> Pte {
        mem.read_entry(self.table, self.idx)
    }

    #[inline]
    pub fn set(self, mem: &PhysMem, e: Pte) {
        mem.write_entry(self.table, self.idx, e)
    }
}

/// Build the bootstrap page-directory template: kernel identity entries
/// (global, large-page) outside the user window, empty zero entries
/// inside it. Every new page directory starts as a copy of this.
pub fn make_boot_pdir() -> Vec<Pte> {
    let kernel = PteFlags::P | PteFlags::W | PteFlags::G | PteFlags::PS;
    let mut pdir = vec![PTE_ZERO; NPTENTRIES];
    for (i, e) in pdir.iter_mut().enumerate() {
        if i < pdx(USER_LO) || i >= pdx(USER_HI) {
            *e = ((i as u32) << 22) | kernel.bits();
        }
    }
    pdir
}

/// Allocate a page directory initialized from the bootstrap template.
/// The returned frame carries one reference (the owner's).
pub fn new_pdir(mem: &PhysMem, boot: &[Pte]) -> Option<Pa> {
    debug_assert_eq!(boot.len(), NPTENTRIES);
    let pdir = mem.alloc()?;
    mem.incref(pdir);
    for (i, &e) in boot.iter().enumerate() {
        mem.write_entry(pdir, i, e);
    }
    Some(pdir)
}

/// Page-directory destructor: unmap the whole user window. Runs from
/// `decref` when the directory's last reference goes away; the frame
/// itself is freed by the caller.
pub(super) fn free_pdir(mem: &PhysMem, pdir: Pa) {
    // A full-window remove only takes the whole-table path and cannot
    // fail for want of memory.
    let ok = remove(mem, pdir, USER_LO, USER_HI - USER_LO);
    debug_assert!(ok);
}

/// Page-table destructor: release every page the table maps.
pub(super) fn free_ptab(mem: &PhysMem, ptab: Pa) {
    for i in 0..NPTENTRIES {
        let e = mem.read_entry(ptab, i);
        if flags(e).contains(PteFlags::REMOTE) {
            continue;
        }
        let pa = pgaddr(e);
        if pa != PTE_ZERO && pa != 0 {
            mem.decref(pa, FrameKind::Plain);
        }
    }
}

/// Find the page-table entry for `va`, allocating a page table on
/// demand iff `writing`.
///
/// A present but non-writable directory entry means the page table
/// below it is (or was) shared: with `writing` set, a table whose
/// refcount is still above one is copied, and a table that has become
/// exclusive again has the writable bit cleared on each of its entries
/// instead, pushing the copy-on-write protection down to page level.
///
/// `va` outside the user window is a kernel bug.
pub fn walk(mem: &PhysMem, pdir: Pa, va: Va, writing: bool) -> Option<PteSlot> {
    assert!(
        (USER_LO..USER_HI).contains(&va),
        "page walk outside user window: {va:#x}"
    );
    let pdxi = pdx(va);
    let pde = mem.read_entry(pdir, pdxi);

    if flags(pde).contains(PteFlags::P) {
        let mut ptab = pgaddr(pde);
        if writing && !flags(pde).contains(PteFlags::W) {
            if mem.refcount(ptab) == 1 {
                // Exclusive again: propagate read-only down to the PTEs.
                for k in 0..NPTENTRIES {
                    let e = mem.read_entry(ptab, k);
                    mem.write_entry(ptab, k, e & !PteFlags::W.bits());
                }
            } else {
                let new = mem.alloc()?;
                mem.incref(new);
                for k in 0..NPTENTRIES {
                    let e = mem.read_entry(ptab, k);
                    mem.write_entry(new, k, e & !PteFlags::W.bits());
                    if !flags(e).contains(PteFlags::REMOTE) && pgaddr(e) != PTE_ZERO {
                        mem.incref(pgaddr(e));
                    }
                }
                mem.decref(ptab, FrameKind::PageTable);
                ptab = new;
            }
            let pde_flags = PteFlags::P | PteFlags::U | PteFlags::A | PteFlags::W;
            mem.write_entry(pdir, pdxi, ptab | pde_flags.bits());
        }
        return Some(PteSlot { table: ptab, idx: ptx(va) });
    }

    // A remote directory entry cannot be walked locally; the pull
    // machinery resolves those before a process runs.
    if flags(pde).contains(PteFlags::REMOTE) || !writing {
        return None;
    }

    let ptab = mem.alloc()?;
    mem.incref(ptab);
    for k in 0..NPTENTRIES {
        mem.write_entry(ptab, k, PTE_ZERO);
    }
    let pde_flags = PteFlags::P | PteFlags::U | PteFlags::A | PteFlags::W;
    mem.write_entry(pdir, pdxi, ptab | pde_flags.bits());
    Some(PteSlot { table: ptab, idx: ptx(va) })
}

/// Map `frame` at `va` with `perm | P`, replacing any prior mapping.
/// Re-inserting the same frame at the same address is refcount-neutral.
pub fn insert(mem: &PhysMem, pdir: Pa, frame: Pa, va: Va, perm: PteFlags) -> Option<PteSlot> {
    let slot = walk(mem, pdir, va, true)?;
    // Take the new reference before dropping the old one so replacing a
    // frame with itself cannot free it.
    mem.incref(frame);
    let old = slot.get(mem);
    if !flags(old).contains(PteFlags::REMOTE) && pgaddr(old) != PTE_ZERO {
        mem.decref(pgaddr(old), FrameKind::Plain);
    }
    slot.set(mem, frame | (perm | PteFlags::P).bits());
    Some(slot)
}

/// Unmap `[va, va + size)`, dropping references and clearing nominal
/// permissions. Spans that cover a whole page table drop the table
/// wholesale. Returns false only if un-sharing a partially covered
/// table fails for want of memory.
pub fn remove(mem: &PhysMem, pdir: Pa, va: Va, size: u32) -> bool {
    assert_eq!(pgoff(va), 0, "unaligned remove");
    assert_eq!(pgoff(size), 0, "unaligned remove size");
    assert!(va >= USER_LO && va < USER_HI);
    assert!(size <= USER_HI - va);

    let mut start = va;
    let end = va + size;
    while start < end {
        let pde = mem.read_entry(pdir, pdx(start));
        if pde == PTE_ZERO {
            start = ptaddr(start) + PTSIZE;
            continue;
        }
        if flags(pde).contains(PteFlags::REMOTE) {
            // A never-pulled remote table: nothing local to release.
            mem.write_entry(pdir, pdx(start), PTE_ZERO);
            start = ptaddr(start) + PTSIZE;
            continue;
        }

        if ptx(start) != 0 || start + PTSIZE > end {
            // Partial span: entry by entry until the table boundary.
            let slot = match walk(mem, pdir, start, true) {
                Some(s) => s,
                None => return false,
            };
            let table = slot.table;
            let mut idx = slot.idx;
            while start < end {
                let e = mem.read_entry(table, idx);
                if !flags(e).contains(PteFlags::REMOTE) && pgaddr(e) != PTE_ZERO {
                    mem.decref(pgaddr(e), FrameKind::Plain);
                }
                mem.write_entry(table, idx, PTE_ZERO);
                start += PAGE_SIZE as u32;
                idx += 1;
                if idx == NPTENTRIES {
                    break;
                }
            }
            continue;
        }

        // The span covers the whole table: drop it in one go.
        mem.decref(pgaddr(pde), FrameKind::PageTable);
        mem.write_entry(pdir, pdx(start), PTE_ZERO);
        start += PTSIZE;
    }
    true
}

/// Virtually copy `[sva, sva + size)` of `spdir` over `[dva, ..)` of
/// `dpdir` by sharing page tables copy-on-write: both sides lose the
/// hardware-writable bit on the shared directory entries. Endpoints
/// and size must be 4 MiB aligned. False on memory exhaustion.
pub fn copy(mem: &PhysMem, spdir: Pa, sva: Va, dpdir: Pa, dva: Va, size: u32) -> bool {
    assert_eq!(ptoff(sva), 0, "copy source not table-aligned");
    assert_eq!(ptoff(dva), 0, "copy destination not table-aligned");
    assert_eq!(ptoff(size), 0, "copy size not table-aligned");
    assert!(sva >= USER_LO && sva < USER_HI);
    assert!(dva >= USER_LO && dva < USER_HI);
    assert!(size <= USER_HI - sva);
    assert!(size <= USER_HI - dva);

    let mut sva = sva;
    let mut dva = dva;
    let end = sva + size;
    while sva < end {
        let s = mem.read_entry(spdir, pdx(sva));
        if s != PTE_ZERO && !flags(s).contains(PteFlags::REMOTE) {
            mem.incref(pgaddr(s));
        }
        let d = mem.read_entry(dpdir, pdx(dva));
        if d != PTE_ZERO && !remove(mem, dpdir, dva, PTSIZE) {
            return false;
        }
        let shared = s & !PteFlags::W.bits();
        mem.write_entry(dpdir, pdx(dva), shared);
        mem.write_entry(spdir, pdx(sva), shared);
        sva += PTSIZE;
        dva += PTSIZE;
    }
    true
}

/// Resolve a hardware write fault at `fva`. Returns true if the fault
/// was the copy-on-write machinery's doing and the mapping is now
/// privately writable; false means the fault is the user's to answer
/// for (or memory is exhausted, which the caller reflects the same
/// way).
pub fn pagefault(mem: &PhysMem, pdir: Pa, fva: Va) -> bool {
    if !(USER_LO..USER_HI).contains(&fva) {
        return false;
    }
    let slot = match walk(mem, pdir, fva, true) {
        Some(s) => s,
        None => return false,
    };
    let e = slot.get(mem);
    if !flags(e).contains(PteFlags::SYS_WRITE) || flags(e).contains(PteFlags::REMOTE) {
        return false;
    }

    // A frame that has been transmitted to another node is treated as
    // shared even when locally exclusive: remote cached copies resolve
    // to it by address, so it must not change underneath them.
    let old = pgaddr(e);
    let shared = mem.refcount(old) > 1 || mem.info(old).shared_mask() != 0;
    let new = if old == PTE_ZERO || shared {
        let pa = match mem.alloc() {
            Some(pa) => pa,
            None => {
                log::error!("pagefault: out of memory copying {:#x}", fva);
                return false;
            }
        };
        mem.copy_page(pa, old);
        mem.incref(pa);
        if old != PTE_ZERO {
            mem.decref(old, FrameKind::Plain);
        }
        pa
    } else {
        old
    };

    let f = PteFlags::SYS_READ
        | PteFlags::SYS_WRITE
        | PteFlags::P
        | PteFlags::U
        | PteFlags::W
        | PteFlags::A
        | PteFlags::D;
    slot.set(mem, new | f.bits());
    log::trace!("pagefault: resolved COW write at {:#x} -> {:#x}", fva, new);
    true
}

/// Set nominal permissions over `[va, va + size)`. Granting `SYS_READ`
/// where nothing is mapped maps the zero sentinel read-only;
/// `SYS_WRITE` implies `SYS_READ` and leaves the first write to the
/// fault handler. False on memory exhaustion.
pub fn setperm(mem: &PhysMem, pdir: Pa, va: Va, size: u32, perm: PteFlags) -> bool {
    assert_eq!(pgoff(va), 0, "unaligned setperm");
    assert_eq!(pgoff(size), 0, "unaligned setperm size");
    assert!(va >= USER_LO && va < USER_HI);
    assert!(size <= USER_HI - va);
    assert!(PteFlags::SYS_RW.contains(perm), "setperm: not a permission");

    let mut start = va;
    let end = va + size;
    while start < end {
        let pde = mem.read_entry(pdir, pdx(start));
        if pde == PTE_ZERO && !perm.contains(PteFlags::SYS_READ) {
            // Nothing mapped and nothing to revoke.
            start = ptaddr(start) + PTSIZE;
            continue;
        }
        let slot = match walk(mem, pdir, start, true) {
            Some(s) => s,
            None => return false,
        };
        let table = slot.table;
        let mut idx = slot.idx;
        while start < end {
            let mut e = mem.read_entry(table, idx);
            if perm.contains(PteFlags::SYS_WRITE) {
                e |= (PteFlags::SYS_RW | PteFlags::P | PteFlags::U | PteFlags::A | PteFlags::D)
                    .bits();
            } else if perm.contains(PteFlags::SYS_READ) {
                e &= !(PteFlags::SYS_WRITE | PteFlags::W).bits();
                e |= (PteFlags::SYS_READ | PteFlags::P | PteFlags::U).bits();
            } else {
                e &= !(PteFlags::SYS_RW | PteFlags::P | PteFlags::W).bits();
            }
            mem.write_entry(table, idx, e);
            start += PAGE_SIZE as u32;
            idx += 1;
            if idx == NPTENTRIES {
                break;
            }
        }
    }
    true
}

/// Snapshot the whole user window of `pdir` into `rpdir`, the reference
/// directory used as the common ancestor for [`merge`].
pub fn snapshot(mem: &PhysMem, pdir: Pa, rpdir: Pa) -> bool {
    copy(mem, pdir, USER_LO, rpdir, USER_LO, USER_HI - USER_LO)
}

/// Three-way merge: fold the changes `spdir` made since the `rpdir`
/// snapshot into `dpdir`. Unchanged spans are skipped; spans only the
/// source touched are shared copy-on-write; spans both sides touched
/// merge page by page, byte-granular on pages both sides wrote.
pub fn merge(
    mem: &PhysMem,
    rpdir: Pa,
    spdir: Pa,
    sva: Va,
    dpdir: Pa,
    dva: Va,
    size: u32,
) -> bool {
    assert_eq!(ptoff(sva), 0, "merge source not table-aligned");
    assert_eq!(ptoff(dva), 0, "merge destination not table-aligned");
    assert_eq!(ptoff(size), 0, "merge size not table-aligned");
    assert!(sva >= USER_LO && sva < USER_HI);
    assert!(dva >= USER_LO && dva < USER_HI);
    assert!(size <= USER_HI - sva);
    assert!(size <= USER_HI - dva);

    let mut sva = sva;
    let mut dva = dva;
    let end = sva + size;
    while sva < end {
        let s = mem.read_entry(spdir, pdx(sva));
        let r = mem.read_entry(rpdir, pdx(sva));
        if s == r {
            // Source never touched this span.
            sva += PTSIZE;
            dva += PTSIZE;
            continue;
        }
        let d = mem.read_entry(dpdir, pdx(dva));
        if d == r {
            // Only the source diverged: adopt its span copy-on-write.
            if !copy(mem, spdir, sva, dpdir, dva, PTSIZE) {
                return false;
            }
            sva += PTSIZE;
            dva += PTSIZE;
            continue;
        }

        // Both sides touched the span.
        let sslot = match walk(mem, spdir, sva, true) {
            Some(s) => s,
            None => return false,
        };
        let dslot = match walk(mem, dpdir, dva, true) {
            Some(s) => s,
            None => return false,
        };
        let rslot = match walk(mem, rpdir, sva, true) {
            Some(s) => s,
            None => return false,
        };
        for i in 0..NPTENTRIES {
            let se = mem.read_entry(sslot.table, i);
            let de = mem.read_entry(dslot.table, i);
            let re = mem.read_entry(rslot.table, i);
            let dva_page = dva + (i as u32) * PAGE_SIZE as u32;
            if se != re && de != re {
                let dst = PteSlot { table: dslot.table, idx: i };
                if !merge_page(mem, re, se, dst, dva_page) {
                    return false;
                }
            } else if de == re && se != re {
                // Only the source changed this page: share it.
                if !flags(de).contains(PteFlags::REMOTE) && pgaddr(de) != PTE_ZERO {
                    mem.decref(pgaddr(de), FrameKind::Plain);
                }
                if !flags(se).contains(PteFlags::REMOTE) && pgaddr(se) != PTE_ZERO {
                    mem.incref(pgaddr(se));
                }
                let shared = se & !PteFlags::W.bits();
                mem.write_entry(dslot.table, i, shared);
                mem.write_entry(sslot.table, i, shared);
            }
        }
        sva += PTSIZE;
        dva += PTSIZE;
    }
    true
}

/// Merge one page both sides modified since the snapshot. Byte-by-byte
/// last-writer-wins; a byte both sides changed differently is a
/// conflict that drops the whole destination page to the zero sentinel
/// with a diagnostic. False only on memory exhaustion.
fn merge_page(mem: &PhysMem, re: Pte, se: Pte, dslot: PteSlot, dva: Va) -> bool {
    let de = dslot.get(mem);
    let mut dpa = pgaddr(de);

    // A shared (or zero) destination page must be copied before the
    // byte loop writes into it.
    if dpa == PTE_ZERO || mem.refcount(dpa) > 1 {
        let pa = match mem.alloc() {
            Some(pa) => pa,
            None => return false,
        };
        mem.copy_page(pa, dpa);
        mem.incref(pa);
        if dpa != PTE_ZERO {
            mem.decref(dpa, FrameKind::Plain);
        }
        let f = PteFlags::SYS_RW | PteFlags::P | PteFlags::U | PteFlags::W;
        dslot.set(mem, pa | f.bits());
        dpa = pa;
    }

    let spa = pgaddr(se);
    let rpa = pgaddr(re);
    for i in 0..PAGE_SIZE as u32 {
        let sb = mem.read_u8(spa + i);
        let rb = mem.read_u8(rpa + i);
        let db = mem.read_u8(dpa + i);
        if sb != rb && db != rb {
            log::warn!("merge conflict at {:#x} offset {}: dropping page", dva, i);
            mem.decref(dpa, FrameKind::Plain);
            dslot.set(mem, PTE_ZERO);
            return true;
        }
        if db == rb {
            mem.write_u8(dpa + i, sb);
        }
    }
    true
}

/// Translate a user virtual address to the physical address of its
/// mapped page, if present.
pub fn va2pa(mem: &PhysMem, pdir: Pa, va: Va) -> Option<Pa> {
    let pde = mem.read_entry(pdir, pdx(va));
    if !flags(pde).contains(PteFlags::P) || flags(pde).contains(PteFlags::PS) {
        return None;
    }
    let pte = mem.read_entry(pgaddr(pde), ptx(va));
    if !flags(pte).contains(PteFlags::P) {
        return None;
    }
    Some(pgaddr(pte))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::ZERO_PAGE;

    fn setup(npages: usize) -> (PhysMem, Vec<Pte>) {
        (PhysMem::new(npages), make_boot_pdir())
    }

    const U: Va = USER_LO;

    #[test]
    fn insert_allocates_tables_and_counts_refs() {
        let (mem, boot) = setup(64);
        let pdir = new_pdir(&mem, &boot).unwrap();
        let p1 = mem.alloc().unwrap();
        let p2 = mem.alloc().unwrap();

        // No table yet: a read walk sees nothing.
        assert!(walk(&mem, pdir, U, false).is_none());

        assert!(insert(&mem, pdir, p1, U, PteFlags::U).is_some());
        assert_eq!(va2pa(&mem, pdir, U), Some(p1));
        assert_eq!(mem.refcount(p1), 1);

        assert!(insert(&mem, pdir, p2, U + PAGE_SIZE as u32, PteFlags::U).is_some());
        assert_eq!(va2pa(&mem, pdir, U + PAGE_SIZE as u32), Some(p2));
        assert_eq!(mem.refcount(p2), 1);

        // Walk returns the same slot the insert wrote.
        let slot = walk(&mem, pdir, U + PAGE_SIZE as u32, false).unwrap();
        assert_eq!(pgaddr(slot.get(&mem)), p2);
    }

    #[test]
    fn insert_fails_without_memory_for_table() {
        let (mem, boot) = setup(8);
        let pdir = new_pdir(&mem, &boot).unwrap();
        let p1 = mem.alloc().unwrap();
        let stolen = mem.steal_free_list();
        // No frame for the page table.
        assert!(insert(&mem, pdir, p1, U, PteFlags::U).is_none());
        mem.restore_free_list(stolen);
        assert!(insert(&mem, pdir, p1, U, PteFlags::U).is_some());
    }

    #[test]
    fn reinsert_same_frame_is_refcount_neutral() {
        let (mem, boot) = setup(64);
        let pdir = new_pdir(&mem, &boot).unwrap();
        let p = mem.alloc().unwrap();
        insert(&mem, pdir, p, U, PteFlags::U).unwrap();
        insert(&mem, pdir, p, U, PteFlags::U).unwrap();
        assert_eq!(mem.refcount(p), 1);
        assert_eq!(va2pa(&mem, pdir, U), Some(p));
    }

    #[test]
    fn insert_replaces_and_releases_prior_mapping() {
        let (mem, boot) = setup(64);
        let pdir = new_pdir(&mem, &boot).unwrap();
        let p1 = mem.alloc().unwrap();
        let p2 = mem.alloc().unwrap();
        insert(&mem, pdir, p1, U, PteFlags::U).unwrap();
        insert(&mem, pdir, p1, U + PAGE_SIZE as u32, PteFlags::U).unwrap();
        assert_eq!(mem.refcount(p1), 2);

        insert(&mem, pdir, p2, U, PteFlags::U).unwrap();
        assert_eq!(mem.refcount(p1), 1);
        assert_eq!(mem.refcount(p2), 1);
        assert_eq!(va2pa(&mem, pdir, U), Some(p2));
        assert_eq!(va2pa(&mem, pdir, U + PAGE_SIZE as u32), Some(p1));
    }

    #[test]
    fn remove_partial_and_whole_table_spans() {
        let (mem, boot) = setup(64);
        let pdir = new_pdir(&mem, &boot).unwrap();
        let p = mem.alloc().unwrap();
        let page = PAGE_SIZE as u32;

        insert(&mem, pdir, p, U, PteFlags::U).unwrap();
        insert(&mem, pdir, p, U + page, PteFlags::U).unwrap();
        insert(&mem, pdir, p, U + PTSIZE - page, PteFlags::U).unwrap();
        insert(&mem, pdir, p, U + PTSIZE, PteFlags::U).unwrap();
        assert_eq!(mem.refcount(p), 4);

        // Partial: drop the middle, keep the endpoints.
        assert!(remove(&mem, pdir, U + page, PTSIZE - 2 * page));
        assert_eq!(mem.refcount(p), 3);
        assert_eq!(va2pa(&mem, pdir, U), Some(p));
        assert_eq!(va2pa(&mem, pdir, U + page), None);
        assert_eq!(va2pa(&mem, pdir, U + PTSIZE - page), Some(p));

        // Whole window: every mapping and both tables go away.
        let live_before = mem.stats().live_frames;
        assert!(remove(&mem, pdir, U, USER_HI - USER_LO));
        assert_eq!(mem.refcount(p), 0);
        assert_eq!(mem.read_entry(pdir, pdx(U)), PTE_ZERO);
        // Two page tables and the data page were released.
        assert_eq!(mem.stats().live_frames, live_before - 3);
    }

    #[test]
    fn copy_then_fault_gives_private_page() {
        let (mem, boot) = setup(64);
        let spdir = new_pdir(&mem, &boot).unwrap();
        let dpdir = new_pdir(&mem, &boot).unwrap();
        let p = mem.alloc().unwrap();
        mem.zero_page(p);
        insert(&mem, spdir, p, U, PteFlags::U | PteFlags::W | PteFlags::SYS_RW).unwrap();
        mem.write_u8(p, 0xAA);

        assert!(copy(&mem, spdir, U, dpdir, U, PTSIZE));

        // Both sides share the same table, and both directory entries
        // lost the hardware-writable bit.
        let spde = mem.read_entry(spdir, pdx(U));
        let dpde = mem.read_entry(dpdir, pdx(U));
        assert_eq!(spde, dpde);
        assert!(!flags(spde).contains(PteFlags::W));
        assert_eq!(mem.refcount(pgaddr(spde)), 2);
        assert_eq!(va2pa(&mem, dpdir, U), Some(p));

        // Source writes: the write-walk un-shares the table and the
        // fault handler clones the page.
        assert!(pagefault(&mem, spdir, U));
        let new = va2pa(&mem, spdir, U).unwrap();
        assert_ne!(new, p);
        assert_eq!(mem.read_u8(new), 0xAA);
        mem.write_u8(new, 0xBB);

        // Destination still sees the original byte.
        assert_eq!(va2pa(&mem, dpdir, U), Some(p));
        assert_eq!(mem.read_u8(p), 0xAA);
        assert_eq!(mem.refcount(p), 1);
        assert_eq!(mem.refcount(new), 1);
    }

    #[test]
    fn fault_without_nominal_write_is_reflected() {
        let (mem, boot) = setup(64);
        let pdir = new_pdir(&mem, &boot).unwrap();
        assert!(setperm(&mem, pdir, U, PAGE_SIZE as u32, PteFlags::SYS_READ));
        assert!(!pagefault(&mem, pdir, U));
        // Out-of-window faults are never the kernel's.
        assert!(!pagefault(&mem, pdir, 0x1000));
    }

    #[test]
    fn setperm_read_maps_zero_sentinel() {
        let (mem, boot) = setup(64);
        let pdir = new_pdir(&mem, &boot).unwrap();
        assert!(setperm(&mem, pdir, U, PAGE_SIZE as u32, PteFlags::SYS_READ));
        let slot = walk(&mem, pdir, U, false).unwrap();
        let e = slot.get(&mem);
        assert_eq!(pgaddr(e), ZERO_PAGE);
        assert!(flags(e).contains(PteFlags::P));
        assert!(!flags(e).contains(PteFlags::W));

        // Granting write keeps the sentinel mapped; the first store
        // copies it.
        assert!(setperm(&mem, pdir, U, PAGE_SIZE as u32, PteFlags::SYS_RW));
        assert!(pagefault(&mem, pdir, U));
        let pa = va2pa(&mem, pdir, U).unwrap();
        assert_ne!(pa, ZERO_PAGE);
        assert_eq!(mem.read_u8(pa), 0);
    }

    #[test]
    fn setperm_none_revokes() {
        let (mem, boot) = setup(64);
        let pdir = new_pdir(&mem, &boot).unwrap();
        assert!(setperm(&mem, pdir, U, PAGE_SIZE as u32, PteFlags::SYS_RW));
        assert!(setperm(&mem, pdir, U, PAGE_SIZE as u32, PteFlags::empty()));
        let e = walk(&mem, pdir, U, false).unwrap().get(&mem);
        assert!(!flags(e).contains(PteFlags::P));
        assert!(!flags(e).intersects(PteFlags::SYS_RW));
    }

    #[test]
    fn snapshot_then_clean_merge_is_noop() {
        let (mem, boot) = setup(128);
        let child = new_pdir(&mem, &boot).unwrap();
        let rpdir = new_pdir(&mem, &boot).unwrap();
        let parent = new_pdir(&mem, &boot).unwrap();

        let p = mem.alloc().unwrap();
        mem.zero_page(p);
        insert(&mem, child, p, U, PteFlags::U | PteFlags::W | PteFlags::SYS_RW).unwrap();

        assert!(snapshot(&mem, child, rpdir));
        let before = mem.read_entry(parent, pdx(U));
        assert!(merge(&mem, rpdir, child, U, parent, U, PTSIZE));
        // Nothing changed on either side: the parent is untouched.
        assert_eq!(mem.read_entry(parent, pdx(U)), before);
    }

    #[test]
    fn merge_takes_source_changes() {
        let (mem, boot) = setup(128);
        let child = new_pdir(&mem, &boot).unwrap();
        let rpdir = new_pdir(&mem, &boot).unwrap();
        let parent = new_pdir(&mem, &boot).unwrap();

        // Parent and child both start from the same snapshot state.
        let p = mem.alloc().unwrap();
        mem.zero_page(p);
        insert(&mem, child, p, U, PteFlags::U | PteFlags::W | PteFlags::SYS_RW).unwrap();
        assert!(copy(&mem, child, U, parent, U, PTSIZE));
        assert!(snapshot(&mem, child, rpdir));

        // Child writes one byte at offset 200.
        assert!(pagefault(&mem, child, U));
        let cpa = va2pa(&mem, child, U).unwrap();
        mem.write_u8(cpa + 200, b'C');

        assert!(merge(&mem, rpdir, child, U, parent, U, PTSIZE));
        let ppa = va2pa(&mem, parent, U).unwrap();
        assert_eq!(mem.read_u8(ppa + 200), b'C');
    }

    #[test]
    fn merge_conflict_zeroes_page() {
        let (mem, boot) = setup(128);
        let child = new_pdir(&mem, &boot).unwrap();
        let rpdir = new_pdir(&mem, &boot).unwrap();
        let parent = new_pdir(&mem, &boot).unwrap();

        let p = mem.alloc().unwrap();
        mem.zero_page(p);
        insert(&mem, child, p, U, PteFlags::U | PteFlags::W | PteFlags::SYS_RW).unwrap();
        assert!(copy(&mem, child, U, parent, U, PTSIZE));
        assert!(snapshot(&mem, child, rpdir));

        // Both write the same byte differently.
        assert!(pagefault(&mem, child, U));
        let cpa = va2pa(&mem, child, U).unwrap();
        mem.write_u8(cpa + 100, b'C');
        assert!(pagefault(&mem, parent, U));
        let ppa = va2pa(&mem, parent, U).unwrap();
        mem.write_u8(ppa + 100, b'P');

        assert!(merge(&mem, rpdir, child, U, parent, U, PTSIZE));
        let e = walk(&mem, parent, U, false).unwrap().get(&mem);
        assert_eq!(e, PTE_ZERO);
    }

    #[test]
    fn freeing_pdir_releases_everything() {
        let (mem, boot) = setup(64);
        let before = mem.stats().live_frames;
        let pdir = new_pdir(&mem, &boot).unwrap();
        let p = mem.alloc().unwrap();
        insert(&mem, pdir, p, U, PteFlags::U).unwrap();
        insert(&mem, pdir, p, U + PTSIZE * 2, PteFlags::U).unwrap();
        mem.decref(pdir, FrameKind::PageDir);
        assert_eq!(mem.stats().live_frames, before);
    }
}
