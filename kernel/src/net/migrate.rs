//! Process migration: MIGRQ/MIGRP.
//!
//! The sender packages a process's home reference, a fresh remote
//! reference to its page directory, and its saved registers; the
//! process sits on the migration list in MIGR until the destination
//! acknowledges. The receiver resolves the home reference to a local
//! process (its own process coming home, a known guest, or a fresh
//! AWAY slot), adopts the register state, and starts pulling the page
//! directory. Duplicate requests are acknowledged and dropped.

use crate::memory::address_space::new_pdir;
use crate::memory::layout::{PAGE_SHIFT, USER_LO};
use crate::memory::paging::{rr_addr, rr_cons, rr_key, rr_node, PteFlags, MAX_NODES};
use crate::node::Node;
use crate::process::{Flow, ProcId, State, PGLEV_PDIR};
use crate::trap::{Entry, ProcState, Trapframe, PROCSTATE_SIZE};

impl Node {
    /// Ship the current process to `dstnode` and fall into the
    /// scheduler. The caller does not resume the interrupted call
    /// here; entry kind 0 re-executes it on the destination.
    pub(crate) fn net_migrate(
        &self,
        pid: ProcId,
        tf: &Trapframe,
        dstnode: u8,
        entry: Entry,
    ) -> Flow {
        assert!(
            dstnode >= 1 && dstnode <= MAX_NODES && dstnode != self.id(),
            "migrating to bad node {dstnode}"
        );
        self.proc_save(pid, tf, entry);
        {
            let mut p = self.procs.get(pid);
            p.state = State::Migr;
            p.migrdest = dstnode;
            p.runcpu = None;
        }
        self.migrlist.lock().push_back(pid);
        log::debug!(
            "node {}: proc {} migrating to node {}",
            self.id(),
            pid,
            dstnode
        );
        self.net_txmigrq(pid);
        Flow::Idle
    }

    /// Transmit a migration request for a process on the migration
    /// list. Changes no state; called again by the timer until the
    /// acknowledgment arrives.
    pub(crate) fn net_txmigrq(&self, pid: ProcId) {
        let (dst, home, pdir, sv) = {
            let p = self.procs.get(pid);
            debug_assert_eq!(p.state, State::Migr);
            (p.migrdest, p.home, p.pdir, p.sv)
        };
        let mut pkt = self.eth_header(dst, super::NET_MIGRQ);
        pkt.extend_from_slice(&home.to_le_bytes());
        let pdir_rr = rr_cons(self.id(), pdir, PteFlags::empty());
        pkt.extend_from_slice(&pdir_rr.to_le_bytes());
        pkt.extend_from_slice(&sv.encode());
        self.tx.send(&pkt);
    }

    pub(crate) fn net_rxmigrq(&self, srcnode: u8, body: &[u8]) {
        if body.len() < 8 + PROCSTATE_SIZE {
            log::warn!("node {}: short migrq ({} bytes)", self.id(), body.len());
            return;
        }
        let home = super::read_u32(body, 0);
        let rrpdir = super::read_u32(body, 4);
        let mut sv_bytes = [0u8; PROCSTATE_SIZE];
        sv_bytes.copy_from_slice(&body[8..8 + PROCSTATE_SIZE]);
        let sv = ProcState::decode(&sv_bytes);

        // Resolve the home reference to a local process.
        let pid = if rr_node(home) == self.id() {
            // Our own process coming back.
            let slot = (rr_addr(home) >> PAGE_SHIFT) as ProcId;
            if !self.procs.is_valid(slot) {
                log::warn!("node {}: migrq names bad slot {}", self.id(), slot);
                return;
            }
            debug_assert_eq!(self.procs.get(slot).home, home);
            slot
        } else {
            let known = self.rr_procs.lock().get(&rr_key(home)).copied();
            match known {
                Some(p) => p,
                None => {
                    // First visit: allocate a guest slot.
                    let p = match self.proc_alloc(0, 0) {
                        Some(p) => p,
                        None => {
                            log::warn!("node {}: no room for migrated process", self.id());
                            return;
                        }
                    };
                    {
                        let mut pr = self.procs.get(p);
                        pr.state = State::Away;
                        pr.home = home;
                    }
                    self.rr_procs.lock().insert(rr_key(home), p);
                    log::debug!("node {}: new guest proc {} for {:#x}", self.id(), p, home);
                    p
                }
            }
        };

        // Crossing case: the process is coming back from the very node
        // we are still waiting on an ack from. The request is itself
        // proof of arrival, so retire our pending migration first.
        {
            let crossed = {
                let p = self.procs.get(pid);
                p.state == State::Migr && p.migrdest == srcnode
            };
            if crossed {
                let mut list = self.migrlist.lock();
                if let Some(i) = list.iter().position(|&p| p == pid) {
                    list.remove(i);
                }
                let mut p = self.procs.get(pid);
                p.migrdest = 0;
                p.state = State::Away;
                log::debug!(
                    "node {}: migrq from node {} implies ack for proc {}",
                    self.id(),
                    srcnode,
                    pid
                );
            }
        }

        // Anything not AWAY means we already have it: a duplicate of a
        // request we already served. Re-ack and drop.
        if self.procs.get(pid).state != State::Away {
            log::warn!(
                "node {}: duplicate migrq for proc {} ({:?})",
                self.id(),
                pid,
                self.procs.get(pid).state
            );
            self.net_txmigrp(srcnode, home);
            return;
        }

        {
            let mut p = self.procs.get(pid);
            p.sv = sv;
            p.rrpdir = rrpdir;
            p.pullva = USER_LO;
        }

        // Ack now so the sender stops retransmitting.
        self.net_txmigrp(srcnode, home);

        // Fresh page directory for the pull; the previous one stays
        // alive until the pull completes, since frames it references
        // are the authoritative copies local-node references resolve
        // to.
        let fresh = match new_pdir(&self.mem, &self.boot_pdir) {
            Some(pa) => pa,
            None => panic!("node {}: out of memory receiving migration", self.id()),
        };
        {
            let mut p = self.procs.get(pid);
            debug_assert_eq!(p.oldpdir, 0);
            p.oldpdir = p.pdir;
            p.pdir = fresh;
        }

        self.net_pull(pid, rrpdir, fresh, PGLEV_PDIR);
    }

    /// Acknowledge `home`'s migration to `dstnode`.
    pub(crate) fn net_txmigrp(&self, dstnode: u8, home: u32) {
        let mut pkt = self.eth_header(dstnode, super::NET_MIGRP);
        pkt.extend_from_slice(&home.to_le_bytes());
        self.tx.send(&pkt);
    }

    pub(crate) fn net_rxmigrp(&self, _srcnode: u8, body: &[u8]) {
        if body.len() < 4 {
            log::warn!("node {}: short migrp", self.id());
            return;
        }
        let home = super::read_u32(body, 0);

        let pid = {
            let mut list = self.migrlist.lock();
            match list.iter().position(|&p| self.procs.get(p).home == home) {
                Some(i) => list.remove(i).unwrap(),
                None => {
                    // A duplicate ack for a process already released.
                    log::debug!("node {}: migrp for unknown home {:#x}", self.id(), home);
                    return;
                }
            }
        };
        {
            let mut p = self.procs.get(pid);
            debug_assert_eq!(p.state, State::Migr);
            p.migrdest = 0;
            p.state = State::Away;
        }
        log::debug!("node {}: proc {} is away", self.id(), pid);
    }
}
