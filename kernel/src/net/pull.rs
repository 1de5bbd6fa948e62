//! Demand page pull: PULLRQ/PULLRP.
//!
//! A pulling process sits on the pull list in PULL with a `need`
//! bitmap of outstanding thirds. The owner answers each needed part
//! with one PULLRP; page-directory and page-table slices are
//! translated entry by entry into remote references before they leave
//! the node. When all three parts of the current target have arrived
//! the puller sweeps its user window, resolving remote entries either
//! immediately (from the reference cache or its own frames) or by
//! recursing into another pull, until the whole address space is
//! local and the process can run.

use alloc::vec;

use crate::memory::address_space::PteSlot;
use crate::memory::frame_metadata::FrameKind;
use crate::memory::layout::{pdx, pgaddr, ptaddr, ptx, Pa, PAGE_SIZE, PTSIZE, USER_HI, USER_LO};
use crate::memory::paging::{flags, rr_addr, rr_cons, rr_node, PteFlags, Rr, MAX_NODES, PTE_ZERO};
use crate::node::Node;
use crate::process::{ProcId, State, PGLEV_PAGE, PGLEV_PDIR, PGLEV_PTAB};

use super::{part_len, read_u32, PULLPART};

impl Node {
    /// Suspend `pid` pulling `rr` into the local frame `target`.
    pub(crate) fn net_pull(&self, pid: ProcId, rr: Rr, target: Pa, level: u8) {
        let owner = rr_node(rr);
        assert!(owner >= 1 && owner <= MAX_NODES && owner != self.id());
        assert!(level <= PGLEV_PDIR);
        {
            let mut p = self.procs.get(pid);
            p.state = State::Pull;
            p.pullrr = rr;
            p.pull_level = level;
            p.pullpg = target;
            p.arrived = 0;
        }
        self.pulllist.lock().push_back(pid);
        log::trace!(
            "node {}: proc {} pulls {:#x} (level {}) into {:#x}",
            self.id(),
            pid,
            rr,
            level,
            target
        );
        self.net_txpullrq(pid);
    }

    /// Transmit (or retransmit) the pull request for a waiting
    /// process, asking only for the parts still missing.
    pub(crate) fn net_txpullrq(&self, pid: ProcId) {
        let (rr, level, arrived) = {
            let p = self.procs.get(pid);
            debug_assert_eq!(p.state, State::Pull);
            (p.pullrr, p.pull_level, p.arrived)
        };
        let mut pkt = self.eth_header(rr_node(rr), super::NET_PULLRQ);
        pkt.extend_from_slice(&rr.to_le_bytes());
        pkt.push(level);
        pkt.push(!arrived & 0b111);
        self.tx.send(&pkt);
    }

    /// Serve a pull request for one of our pages.
    pub(crate) fn net_rxpullrq(&self, srcnode: u8, body: &[u8]) {
        if body.len() < 6 {
            log::warn!("node {}: short pullrq", self.id());
            return;
        }
        let rr = read_u32(body, 0);
        let level = body[4];
        let need = body[5] & 0b111;

        if rr_node(rr) != self.id() {
            log::warn!("node {}: pull request came to the wrong node", self.id());
            return;
        }
        if level > PGLEV_PDIR {
            log::warn!("node {}: pull request with bad level {}", self.id(), level);
            return;
        }
        let pa = rr_addr(rr);
        if !self.mem.is_valid_frame(pa) {
            log::warn!("node {}: pull request for invalid page {:#x}", self.id(), pa);
            return;
        }
        if self.mem.refcount(pa) == 0 {
            log::warn!("node {}: pull request for free page {:#x}", self.id(), pa);
            return;
        }
        if self.mem.frame_home(pa) != 0 {
            log::warn!("node {}: pull request for unowned page {:#x}", self.id(), pa);
            return;
        }

        // The requester is about to hold references into this page.
        self.mem.rrshare(pa, srcnode);

        for part in 0..3u8 {
            if need & (1 << part) != 0 {
                self.net_txpullrp(srcnode, rr, level, part, pa);
            }
        }
    }

    /// Send one third of a page. Directory and table slices have every
    /// entry translated to a remote reference the requester can chase.
    fn net_txpullrp(&self, dstnode: u8, rr: Rr, level: u8, part: u8, pa: Pa) {
        let off = (PULLPART * part as usize) as u32;
        let len = part_len(part);
        let mut data = vec![0u8; len];
        self.mem.copy_out(pa + off, &mut data);

        if level > PGLEV_PAGE {
            for chunk in data.chunks_exact_mut(4) {
                let e = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                let out = self.entry_to_rr(e);
                chunk.copy_from_slice(&out.to_le_bytes());
            }
        }

        let mut pkt = self.eth_header(dstnode, super::NET_PULLRP);
        pkt.extend_from_slice(&rr.to_le_bytes());
        pkt.push(part);
        pkt.extend_from_slice(&data);
        self.tx.send(&pkt);
    }

    /// Translate one outgoing page-structure entry into a remote
    /// reference: kernel entries vanish, remote entries pass through,
    /// zero mappings become permission-only references, local pages
    /// are named by this node, and pages homed elsewhere are named by
    /// their home.
    fn entry_to_rr(&self, e: u32) -> Rr {
        let f = flags(e);
        if f.contains(PteFlags::G) {
            return 0;
        }
        if f.contains(PteFlags::REMOTE) {
            return e;
        }
        if pgaddr(e) == PTE_ZERO {
            return rr_cons(0, 0, f & PteFlags::SYS_RW);
        }
        let pa = pgaddr(e);
        let home = self.mem.frame_home(pa);
        if home == 0 {
            rr_cons(self.id(), pa, f & PteFlags::SYS_RW)
        } else {
            home | (f & PteFlags::SYS_RW).bits() | PteFlags::REMOTE.bits()
        }
    }

    /// Accept one third of the page some local process is pulling.
    pub(crate) fn net_rxpullrp(&self, _srcnode: u8, body: &[u8]) {
        if body.len() < 5 {
            log::warn!("node {}: short pullrp", self.id());
            return;
        }
        let rr = read_u32(body, 0);
        let part = body[4];
        if part > 2 {
            log::warn!("node {}: pullrp with invalid part {}", self.id(), part);
            return;
        }
        let data = &body[5..];

        let pid = {
            let list = self.pulllist.lock();
            match list.iter().copied().find(|&p| self.procs.get(p).pullrr == rr) {
                Some(p) => p,
                None => {
                    // Retransmission crossed with completion.
                    log::debug!("node {}: pullrp with no taker ({:#x})", self.id(), rr);
                    return;
                }
            }
        };

        let (arrived, target) = {
            let p = self.procs.get(pid);
            (p.arrived, p.pullpg)
        };
        if arrived & (1 << part) != 0 {
            log::debug!("node {}: part {} already arrived", self.id(), part);
            return;
        }
        if data.len() != part_len(part) {
            log::warn!(
                "node {}: part {} has wrong size {}",
                self.id(),
                part,
                data.len()
            );
            return;
        }

        self.mem
            .copy_in(target + (PULLPART * part as usize) as u32, data);
        let done = {
            let mut p = self.procs.get(pid);
            p.arrived |= 1 << part;
            p.arrived == 0b111
        };
        if !done {
            return;
        }

        // Page complete: off the pull list and onward.
        {
            let mut list = self.pulllist.lock();
            if let Some(i) = list.iter().position(|&p| p == pid) {
                list.remove(i);
            }
        }

        if self.procs.get(pid).pull_level == PGLEV_PDIR {
            // The user window came over the wire; the kernel half is
            // ours to restore.
            for i in 0..crate::memory::layout::NPTENTRIES {
                if i >= pdx(USER_LO) && i < pdx(USER_HI) {
                    continue;
                }
                self.mem.write_entry(target, i, self.boot_pdir[i]);
            }
        }

        self.pull_sweep(pid);
    }

    /// Walk the user window from `pullva`, resolving remote entries.
    /// Returns with the process back on the pull list if a new pull
    /// went out; otherwise the address space is complete and the
    /// process becomes runnable.
    fn pull_sweep(&self, pid: ProcId) {
        let pdir = self.procs.get(pid).pdir;
        loop {
            let pullva = self.procs.get(pid).pullva;
            if pullva >= USER_HI {
                break;
            }

            let pde_slot = PteSlot { table: pdir, idx: pdx(pullva) };
            if flags(pde_slot.get(&self.mem)).contains(PteFlags::REMOTE) {
                if !self.net_pullpte(pid, pde_slot, PGLEV_PTAB) {
                    return;
                }
            }
            let pde = pde_slot.get(&self.mem);
            debug_assert!(!flags(pde).contains(PteFlags::REMOTE));
            if pgaddr(pde) == PTE_ZERO {
                self.procs.get(pid).pullva = ptaddr(pullva) + PTSIZE;
                continue;
            }

            let pte_slot = PteSlot { table: pgaddr(pde), idx: ptx(pullva) };
            if flags(pte_slot.get(&self.mem)).contains(PteFlags::REMOTE) {
                if !self.net_pullpte(pid, pte_slot, PGLEV_PAGE) {
                    return;
                }
            }
            self.procs.get(pid).pullva = pullva + PAGE_SIZE as u32;
        }

        // The whole address space is local: release the directory the
        // process left behind and let it run.
        let old = {
            let mut p = self.procs.get(pid);
            core::mem::replace(&mut p.oldpdir, 0)
        };
        if old != 0 {
            self.mem.decref(old, FrameKind::PageDir);
        }
        log::debug!("node {}: proc {} pulled its address space", self.id(), pid);
        self.proc_ready(pid);
    }

    /// Resolve one remote entry. True if it resolved in place; false
    /// if a pull went out and the sweep must wait.
    fn net_pullpte(&self, pid: ProcId, slot: PteSlot, level: u8) -> bool {
        let rr = slot.get(&self.mem);
        debug_assert!(flags(rr).contains(PteFlags::REMOTE));
        let rw = flags(rr) & PteFlags::SYS_RW;
        let present = PteFlags::P | PteFlags::U;

        // Permission-only reference: the zero sentinel, readable iff
        // any nominal permission came along.
        if rr_addr(rr) == 0 {
            let hw = if rw.is_empty() { PteFlags::empty() } else { present };
            slot.set(&self.mem, PTE_ZERO | (rw | hw).bits());
            return true;
        }

        // One of our own frames coming home.
        if rr_node(rr) == self.id() {
            let pa = rr_addr(rr);
            self.mem.incref(pa);
            slot.set(&self.mem, pa | (rw | present).bits());
            return true;
        }

        // A page we already pulled once.
        if let Some(pa) = self.mem.rrlookup(rr) {
            self.mem.incref(pa);
            slot.set(&self.mem, pa | (rw | present).bits());
            return true;
        }

        // Allocate, install, and pull. There is no backing store to
        // spill to, so exhaustion here is fatal.
        let pa = match self.mem.alloc() {
            Some(pa) => pa,
            None => panic!("node {}: out of memory pulling a page", self.id()),
        };
        self.mem.zero_page(pa);
        self.mem.incref(pa);
        slot.set(&self.mem, pa | (rw | present).bits());
        self.mem.rrtrack(rr, pa);
        self.net_pull(pid, rr, pa, level);
        false
    }
}
